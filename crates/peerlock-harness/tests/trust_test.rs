//! Peer device status: first contact, verification, identity changes and
//! forged bundles.

use peerlock_client::{
    CurveId, EncryptOutput, EncryptionPolicy, EngineError, PeerDeviceStatus, ProvisioningError,
};
use peerlock_harness::{KEY_SERVER_URL, SimManager, World};

const ALICE: &str = "alice";
const BOB: &str = "bob";
const CAROL: &str = "carol";

async fn device(world: &World, device_id: &str) -> SimManager {
    let manager = world.manager();
    manager.create_user(device_id, KEY_SERVER_URL, CurveId::C25519, Some(10)).await.unwrap();
    manager
}

async fn send(from: &SimManager, from_id: &str, to_id: &str, text: &[u8]) -> EncryptOutput {
    from.encrypt(from_id, "trust", &[to_id.to_string()], text, EncryptionPolicy::default())
        .await
        .unwrap()
}

fn ratchet(output: &EncryptOutput) -> &[u8] {
    output.recipients[0].ratchet_message.as_deref().unwrap()
}

#[tokio::test]
async fn status_moves_from_unknown_to_trusted() {
    let world = World::new(10);
    let alice = device(&world, ALICE).await;
    let bob = device(&world, BOB).await;

    assert_eq!(alice.get_peer_device_status(ALICE, BOB).unwrap(), PeerDeviceStatus::Unknown);

    let first = send(&alice, ALICE, BOB, b"1").await;
    assert_eq!(first.recipients[0].status, PeerDeviceStatus::Unknown);
    assert_eq!(alice.get_peer_device_status(ALICE, BOB).unwrap(), PeerDeviceStatus::Untrusted);

    let second = send(&alice, ALICE, BOB, b"2").await;
    assert_eq!(second.recipients[0].status, PeerDeviceStatus::Untrusted);

    assert_eq!(bob.decrypt(BOB, "trust", ALICE, ratchet(&first), None).await.unwrap().status, PeerDeviceStatus::Unknown);
    assert_eq!(
        bob.decrypt(BOB, "trust", ALICE, ratchet(&second), None).await.unwrap().status,
        PeerDeviceStatus::Untrusted
    );

    let bob_key = bob.get_self_identity_key(BOB).unwrap();
    alice.set_peer_device_status(ALICE, BOB, &bob_key, PeerDeviceStatus::Trusted).await.unwrap();
    assert_eq!(send(&alice, ALICE, BOB, b"3").await.recipients[0].status, PeerDeviceStatus::Trusted);

    alice.set_peer_device_status(ALICE, BOB, &bob_key, PeerDeviceStatus::Untrusted).await.unwrap();
    assert_eq!(alice.get_peer_device_status(ALICE, BOB).unwrap(), PeerDeviceStatus::Untrusted);
}

#[tokio::test]
async fn verifying_an_unseen_peer_pins_its_key() {
    let world = World::new(11);
    let alice = device(&world, ALICE).await;
    let bob = device(&world, BOB).await;

    let bob_key = bob.get_self_identity_key(BOB).unwrap();
    alice.set_peer_device_status(ALICE, BOB, &bob_key, PeerDeviceStatus::Trusted).await.unwrap();

    let output = send(&alice, ALICE, BOB, b"pinned").await;
    assert_eq!(output.recipients[0].status, PeerDeviceStatus::Trusted);
}

#[tokio::test]
async fn verification_with_the_wrong_key_conflicts() {
    let world = World::new(12);
    let alice = device(&world, ALICE).await;
    let _bob = device(&world, BOB).await;
    send(&alice, ALICE, BOB, b"hello").await;

    let err = alice
        .set_peer_device_status(ALICE, BOB, &[0xEE; 32], PeerDeviceStatus::Trusted)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Conflict { .. }));
    assert_eq!(alice.get_peer_device_status(ALICE, BOB).unwrap(), PeerDeviceStatus::Untrusted);
}

#[tokio::test]
async fn unknown_is_not_a_settable_status() {
    let world = World::new(13);
    let alice = device(&world, ALICE).await;

    let err = alice
        .set_peer_device_status(ALICE, BOB, &[1; 32], PeerDeviceStatus::Unknown)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput { .. }));
}

#[tokio::test]
async fn identity_change_demotes_trusted_peer() {
    let world = World::new(14);
    let alice = device(&world, ALICE).await;
    let bob = device(&world, BOB).await;

    let hello = send(&alice, ALICE, BOB, b"hello").await;
    bob.decrypt(BOB, "trust", ALICE, ratchet(&hello), None).await.unwrap();
    let old_key = bob.get_self_identity_key(BOB).unwrap();
    alice.set_peer_device_status(ALICE, BOB, &old_key, PeerDeviceStatus::Trusted).await.unwrap();

    // Bob reinstalls: same device id, new identity.
    bob.delete_user(BOB).await.unwrap();
    bob.create_user(BOB, KEY_SERVER_URL, CurveId::C25519, Some(10)).await.unwrap();
    assert_ne!(bob.get_self_identity_key(BOB).unwrap(), old_key);

    let again = send(&bob, BOB, ALICE, b"it's me again").await;
    let received = alice.decrypt(ALICE, "trust", BOB, ratchet(&again), None).await.unwrap();

    assert_eq!(received.plaintext, b"it's me again");
    assert_eq!(received.status, PeerDeviceStatus::Untrusted);
    assert_eq!(alice.get_peer_device_status(ALICE, BOB).unwrap(), PeerDeviceStatus::Untrusted);

    // Alice's old session with Bob was discarded; her reply reaches the new Bob.
    let reply = send(&alice, ALICE, BOB, b"welcome back").await;
    let received = bob.decrypt(BOB, "trust", ALICE, ratchet(&reply), None).await.unwrap();
    assert_eq!(received.plaintext, b"welcome back");
}

#[tokio::test]
async fn forged_bundle_marks_peer_fail() {
    let world = World::new(15);
    let alice = device(&world, ALICE).await;
    let _bob = device(&world, BOB).await;

    world.transport.set_forge_bundles(true);
    let err = alice
        .encrypt(ALICE, "trust", &[BOB.to_string()], b"hi", EncryptionPolicy::default())
        .await
        .unwrap_err();
    world.transport.set_forge_bundles(false);

    assert_eq!(
        err,
        EngineError::Provisioning(ProvisioningError::InvalidSignature { device_id: BOB.into() })
    );
    assert_eq!(alice.get_peer_device_status(ALICE, BOB).unwrap(), PeerDeviceStatus::Fail);

    // Fail is sticky: a lone failed recipient makes the call invalid.
    let err = alice
        .encrypt(ALICE, "trust", &[BOB.to_string()], b"hi", EncryptionPolicy::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput { .. }));
}

#[tokio::test]
async fn failed_recipients_are_skipped() {
    let world = World::new(16);
    let alice = device(&world, ALICE).await;
    let bob = device(&world, BOB).await;
    let carol = device(&world, CAROL).await;

    let bob_key = bob.get_self_identity_key(BOB).unwrap();
    alice.set_peer_device_status(ALICE, BOB, &bob_key, PeerDeviceStatus::Fail).await.unwrap();

    let recipients = [BOB.to_string(), CAROL.to_string()];
    let output =
        alice.encrypt(ALICE, "trust", &recipients, b"only carol", EncryptionPolicy::default()).await.unwrap();

    assert_eq!(output.recipients[0].device_id, BOB);
    assert_eq!(output.recipients[0].status, PeerDeviceStatus::Fail);
    assert!(output.recipients[0].ratchet_message.is_none());

    let to_carol = output.recipients[1].ratchet_message.as_deref().unwrap();
    let received = carol
        .decrypt(CAROL, "trust", ALICE, to_carol, Some(output.cipher_message.as_slice()))
        .await
        .unwrap();
    assert_eq!(received.plaintext, b"only carol");
}

#[tokio::test]
async fn messages_from_failed_peers_are_refused() {
    let world = World::new(17);
    let alice = device(&world, ALICE).await;
    let bob = device(&world, BOB).await;

    let alice_key = alice.get_self_identity_key(ALICE).unwrap();
    bob.set_peer_device_status(BOB, ALICE, &alice_key, PeerDeviceStatus::Fail).await.unwrap();

    let output = send(&alice, ALICE, BOB, b"let me in").await;
    let err = bob.decrypt(BOB, "trust", ALICE, ratchet(&output), None).await.unwrap_err();
    assert!(matches!(err, EngineError::Decryption { .. }));

    // Clearing the mark lets the same message through.
    bob.set_peer_device_status(BOB, ALICE, &alice_key, PeerDeviceStatus::Untrusted).await.unwrap();
    let received = bob.decrypt(BOB, "trust", ALICE, ratchet(&output), None).await.unwrap();
    assert_eq!(received.plaintext, b"let me in");
}

#[tokio::test]
async fn deleting_a_peer_forgets_it() {
    let world = World::new(18);
    let alice = device(&world, ALICE).await;
    let bob = device(&world, BOB).await;

    let first = send(&alice, ALICE, BOB, b"first").await;
    bob.decrypt(BOB, "trust", ALICE, ratchet(&first), None).await.unwrap();

    alice.delete_peer_device(ALICE, BOB).await.unwrap();
    assert_eq!(alice.get_peer_device_status(ALICE, BOB).unwrap(), PeerDeviceStatus::Unknown);

    // A fresh session is bootstrapped and Bob accepts it alongside the old one.
    let second = send(&alice, ALICE, BOB, b"second").await;
    assert_eq!(second.recipients[0].status, PeerDeviceStatus::Unknown);
    let received = bob.decrypt(BOB, "trust", ALICE, ratchet(&second), None).await.unwrap();
    assert_eq!(received.plaintext, b"second");
}
