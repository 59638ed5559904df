//! Peerlock key server.
//!
//! Reference implementation of the key-exchange server a peerlock engine
//! publishes to and fetches bundles from. Transport-agnostic: a deployment
//! wraps [`KeyServer::handle`] in HTTPS; tests call it in-process.
//!
//! # Components
//!
//! - [`BundleRegistry`]: per-device identity key, signed prekey and one-time
//!   prekey queue, with signature checks on upload and one-shot hand-out
//! - [`KeyServer`]: decodes requests, applies them to the registry, encodes
//!   responses
//! - [`RegistryError`]: refusal reasons, mapped to wire error codes

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod handler;
mod registry;

pub use error::RegistryError;
pub use handler::KeyServer;
pub use registry::{BundleRegistry, DEFAULT_MAX_ONE_TIME_PREKEYS, StoreResult};
