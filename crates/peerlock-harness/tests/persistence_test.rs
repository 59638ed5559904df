//! Durable state: redb survives restarts, and failed writes leave state as
//! it was.

use peerlock_client::{CurveId, EncryptionPolicy, EngineConfig, EngineError};
use peerlock_core::{ChaoticStorage, MemoryStorage, RedbStorage, Storage};
use peerlock_harness::{KEY_SERVER_URL, SimManager, World};

const ALICE: &str = "alice";
const BOB: &str = "bob";

/// Upper bound on retries of an operation under injected faults.
const MAX_ATTEMPTS: usize = 64;

async fn send<S: Storage>(from: &SimManager<S>, from_id: &str, to_id: &str, text: &[u8]) -> Vec<u8> {
    let output = from
        .encrypt(from_id, "persist", &[to_id.to_string()], text, EncryptionPolicy::default())
        .await
        .unwrap();
    output.recipients[0].ratchet_message.clone().unwrap()
}

#[tokio::test]
async fn redb_state_survives_restart() {
    let world = World::new(50);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice.redb");

    let bob = world.manager();
    bob.create_user(BOB, KEY_SERVER_URL, CurveId::C25519, Some(5)).await.unwrap();

    let (identity, hello) = {
        let alice = world.manager_with(RedbStorage::open(&path).unwrap(), EngineConfig::default());
        alice.create_user(ALICE, KEY_SERVER_URL, CurveId::C25519, Some(5)).await.unwrap();
        (alice.get_self_identity_key(ALICE).unwrap(), send(&alice, ALICE, BOB, b"hello").await)
    };

    let alice = world.manager_with(RedbStorage::open(&path).unwrap(), EngineConfig::default());
    assert!(alice.is_user(ALICE).unwrap());
    assert_eq!(alice.get_self_identity_key(ALICE).unwrap(), identity);
    assert_eq!(alice.get_server_url(ALICE).unwrap(), KEY_SERVER_URL);

    bob.decrypt(BOB, "persist", ALICE, &hello, None).await.unwrap();
    let reply = send(&bob, BOB, ALICE, b"hello again").await;
    let received = alice.decrypt(ALICE, "persist", BOB, &reply, None).await.unwrap();
    assert_eq!(received.plaintext, b"hello again");

    // The restored session is reused: no bundle is fetched.
    let requests = world.transport.request_count();
    let next = send(&alice, ALICE, BOB, b"still you").await;
    assert_eq!(world.transport.request_count(), requests);
    assert_eq!(bob.decrypt(BOB, "persist", ALICE, &next, None).await.unwrap().plaintext, b"still you");
}

#[tokio::test]
async fn redb_delete_removes_everything() {
    let world = World::new(51);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice.redb");

    let bob = world.manager();
    bob.create_user(BOB, KEY_SERVER_URL, CurveId::C25519, Some(5)).await.unwrap();

    {
        let alice = world.manager_with(RedbStorage::open(&path).unwrap(), EngineConfig::default());
        alice.create_user(ALICE, KEY_SERVER_URL, CurveId::C25519, Some(5)).await.unwrap();
        send(&alice, ALICE, BOB, b"bye").await;
        alice.delete_user(ALICE).await.unwrap();
    }

    let storage = RedbStorage::open(&path).unwrap();
    assert!(storage.load_user(ALICE).unwrap().is_none());
    assert!(storage.list_session_peers(ALICE).unwrap().is_empty());
    assert!(storage.load_peer(ALICE, BOB).unwrap().is_none());
}

/// Run `attempt` until it succeeds, checking that every failure is a storage
/// fault.
macro_rules! retry {
    ($attempt:expr) => {{
        let mut outcome = None;
        for _ in 0..MAX_ATTEMPTS {
            match $attempt.await {
                Ok(value) => {
                    outcome = Some(value);
                    break;
                },
                Err(EngineError::Storage(_)) => continue,
                Err(other) => panic!("unexpected failure under storage faults: {other}"),
            }
        }
        outcome.expect("operation never succeeded under storage faults")
    }};
}

async fn converse_under_faults<S: Storage>(world: &World, alice: &SimManager<S>) {
    let bob = world.manager();
    bob.create_user(BOB, KEY_SERVER_URL, CurveId::C25519, Some(40)).await.unwrap();
    retry!(alice.create_user(ALICE, KEY_SERVER_URL, CurveId::C25519, Some(10)));

    for round in 0..12u8 {
        let recipients = [BOB.to_string()];
        let output = retry!(alice.encrypt(
            ALICE,
            "chaos",
            &recipients,
            &[round],
            EncryptionPolicy::default()
        ));
        let ratchet = output.recipients[0].ratchet_message.clone().unwrap();
        let received = bob.decrypt(BOB, "chaos", ALICE, &ratchet, None).await.unwrap();
        assert_eq!(received.plaintext, vec![round]);

        if round % 3 == 0 {
            let reply = send(&bob, BOB, ALICE, &[round, round]).await;
            let received = retry!(alice.decrypt(ALICE, "chaos", BOB, &reply, None));
            assert_eq!(received.plaintext, vec![round, round]);
        }
    }
}

#[tokio::test]
async fn failed_commits_leave_state_untouched() {
    let world = World::new(52);
    let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.4, 7).writes_only();
    let alice = world.manager_with(storage.clone(), EngineConfig::default());

    converse_under_faults(&world, &alice).await;

    // The surviving state is coherent without the fault injector.
    let restarted = world.manager_with(storage.inner().clone(), EngineConfig::default());
    let text = send(&restarted, ALICE, BOB, b"after the storm").await;
    assert!(!text.is_empty());
}

#[tokio::test]
async fn failed_reads_abort_cleanly() {
    let world = World::new(53);
    let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.2, 11);
    let alice = world.manager_with(storage.clone(), EngineConfig::default());

    converse_under_faults(&world, &alice).await;
    assert!(storage.operation_count() > 0);
}
