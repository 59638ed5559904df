//! Key server transport.
//!
//! The engine only needs request/response exchanges with the key server, so
//! the transport is a single method. Production code plugs in an HTTPS
//! client; tests use an in-process loopback.

use std::future::Future;

use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Server could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Server answered outside the key server protocol (e.g. HTTP status).
    #[error("unexpected status {0}")]
    Status(u16),

    /// Request did not complete in time.
    #[error("request timed out")]
    Timeout,
}

/// Request/response channel to a key server.
///
/// Must be Clone (shared by every engine task) and Send + Sync. Bodies are
/// encoded key server messages; the transport never inspects them.
pub trait KeyServerTransport: Clone + Send + Sync + 'static {
    /// Send `body` to the key server at `url` on behalf of `from_device` and
    /// return the response body.
    fn post(
        &self,
        url: &str,
        from_device: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}
