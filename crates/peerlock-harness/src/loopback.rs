//! In-process key server transport with fault injection.

#![allow(clippy::disallowed_types, reason = "Routing table behind a simple lock")]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use peerlock_client::{KeyServerTransport, TransportError};
use peerlock_proto::ServerMessage;
use peerlock_server::KeyServer;

/// Faults applied to every request while set.
#[derive(Default)]
struct Faults {
    unreachable: AtomicBool,
    forge_bundles: AtomicBool,
}

/// Transport delivering requests straight to in-process [`KeyServer`]s.
///
/// Servers are mounted by URL. Requests to an unknown URL fail like an HTTP
/// 404. Clones share servers, faults and counters.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    servers: Arc<Mutex<HashMap<String, KeyServer>>>,
    faults: Arc<Faults>,
    requests: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    /// Transport with no servers mounted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `server` at `url`, replacing whatever was there.
    pub fn mount(&self, url: &str, server: KeyServer) {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner).insert(url.to_string(), server);
    }

    /// Server mounted at `url`.
    pub fn server(&self, url: &str) -> Option<KeyServer> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner).get(url).cloned()
    }

    /// Make every request fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Corrupt the signed prekey signature of every bundle served.
    pub fn set_forge_bundles(&self, forge: bool) {
        self.faults.forge_bundles.store(forge, Ordering::SeqCst);
    }

    /// Requests that reached a server.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn forge(response: Vec<u8>) -> Vec<u8> {
        let Ok((curve, ServerMessage::PeerBundles(mut found))) = ServerMessage::decode(&response)
        else {
            return response;
        };
        for bundle in &mut found.bundles {
            if let Some(byte) = bundle.signed_prekey.signature.first_mut() {
                *byte ^= 0x01;
            }
        }
        ServerMessage::PeerBundles(found).encode(curve).unwrap_or(response)
    }
}

impl KeyServerTransport for LoopbackTransport {
    async fn post(
        &self,
        url: &str,
        from_device: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        if self.faults.unreachable.load(Ordering::SeqCst) {
            tracing::debug!("dropping request from {} to {}", from_device, url);
            return Err(TransportError::Connection(format!("{url} unreachable")));
        }

        let server = self.server(url).ok_or(TransportError::Status(404))?;
        self.requests.fetch_add(1, Ordering::SeqCst);

        // Let other tasks interleave between request and response.
        tokio::task::yield_now().await;
        let response = server.handle(from_device, &body);

        if self.faults.forge_bundles.load(Ordering::SeqCst) {
            return Ok(Self::forge(response));
        }
        Ok(response)
    }
}
