//! Peer device trust tracking.
//!
//! Pure transitions over `PeerDeviceRecord`. Callers load the record, apply
//! a transition, and write the result in the same batch as the session
//! change that caused it.
//!
//! ```text
//!   (no record) ──first exchange──▶ Untrusted ──verify──▶ Trusted
//!                                      ▲                     │
//!                                      └──identity changes───┘
//!
//!   any ──bad signature──▶ Fail ──identity changes / explicit set──▶ ...
//! ```

use crate::{error::EngineError, records::PeerDeviceRecord, types::PeerDeviceStatus};

/// Status a caller sees for a peer before an operation touches it.
#[must_use]
pub fn reported_status(record: Option<&PeerDeviceRecord>) -> PeerDeviceStatus {
    record.map_or(PeerDeviceStatus::Unknown, |r| r.status)
}

/// Outcome of seeing a peer's identity key during session bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Record to persist
    pub record: PeerDeviceRecord,
    /// Status to report for this operation
    pub reported: PeerDeviceStatus,
    /// The key differs from the stored one; existing sessions must go
    pub identity_changed: bool,
}

/// Apply an identity key seen in a fetched bundle or an inbound X3DH init.
///
/// A new peer becomes `Untrusted` and is reported `Unknown`. A changed key
/// re-provisions the peer: whatever the old status was, it is now
/// `Untrusted`.
#[must_use]
pub fn observe_identity(
    existing: Option<&PeerDeviceRecord>,
    device_id: &str,
    identity_key: &[u8; 32],
    now: u64,
) -> Observation {
    match existing {
        None => Observation {
            record: PeerDeviceRecord {
                device_id: device_id.to_string(),
                identity_key: *identity_key,
                status: PeerDeviceStatus::Untrusted,
                updated_at: now,
            },
            reported: PeerDeviceStatus::Unknown,
            identity_changed: false,
        },
        Some(record) if record.identity_key == *identity_key => Observation {
            record: record.clone(),
            reported: record.status,
            identity_changed: false,
        },
        Some(record) => {
            tracing::warn!(
                "identity key of {} changed, status {} reset to untrusted",
                device_id,
                record.status
            );
            Observation {
                record: PeerDeviceRecord {
                    device_id: record.device_id.clone(),
                    identity_key: *identity_key,
                    status: PeerDeviceStatus::Untrusted,
                    updated_at: now,
                },
                reported: PeerDeviceStatus::Untrusted,
                identity_changed: true,
            }
        },
    }
}

/// Explicit status change requested by the application.
///
/// # Errors
///
/// - `InvalidInput` when asked to set `Unknown`
/// - `Conflict` when `identity_key` differs from the stored key
pub fn set_status(
    existing: Option<&PeerDeviceRecord>,
    device_id: &str,
    identity_key: &[u8; 32],
    status: PeerDeviceStatus,
    now: u64,
) -> Result<PeerDeviceRecord, EngineError> {
    if status == PeerDeviceStatus::Unknown {
        return Err(EngineError::invalid_input("cannot set a peer device status to unknown"));
    }

    if let Some(record) = existing
        && record.identity_key != *identity_key
    {
        return Err(EngineError::Conflict {
            reason: format!("identity key for {device_id} does not match the stored one"),
        });
    }

    Ok(PeerDeviceRecord {
        device_id: device_id.to_string(),
        identity_key: *identity_key,
        status,
        updated_at: now,
    })
}

/// Mark a peer as failed after a cryptographic failure against it.
#[must_use]
pub fn mark_failed(
    existing: Option<&PeerDeviceRecord>,
    device_id: &str,
    identity_key: &[u8; 32],
    now: u64,
) -> PeerDeviceRecord {
    tracing::warn!("marking {} as failed", device_id);
    PeerDeviceRecord {
        device_id: device_id.to_string(),
        identity_key: existing.map_or(*identity_key, |r| r.identity_key),
        status: PeerDeviceStatus::Fail,
        updated_at: now,
    }
}
