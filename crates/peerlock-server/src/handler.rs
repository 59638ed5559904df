//! Request handler: one encoded request in, one encoded response out.
//!
//! The caller authenticates the requesting device (TLS client identity,
//! bearer token) and passes its device id; every request acts on behalf of
//! that device, except bundle fetches which read other devices.

use peerlock_proto::{
    CurveId, ErrorPayload, PeerBundles, PeerBundlesRequest, SelfOneTimePreKeys, ServerMessage,
    key_server::{MAX_BUNDLES_PER_REQUEST, MAX_ONE_TIME_PREKEYS_PER_UPLOAD},
};

use crate::{error::RegistryError, registry::BundleRegistry};

/// Transport-agnostic key server.
#[derive(Clone, Default)]
pub struct KeyServer {
    registry: BundleRegistry,
}

impl KeyServer {
    /// Key server over an existing registry.
    pub fn new(registry: BundleRegistry) -> Self {
        Self { registry }
    }

    /// Underlying registry.
    pub fn registry(&self) -> &BundleRegistry {
        &self.registry
    }

    /// Handle one encoded request from `from_device`.
    ///
    /// Always produces a response; failures are encoded as error payloads.
    pub fn handle(&self, from_device: &str, request: &[u8]) -> Vec<u8> {
        let (curve, response) = match ServerMessage::decode(request) {
            Ok((curve, message)) => {
                let response = self.process(from_device, message).unwrap_or_else(|err| {
                    tracing::debug!("request from {} refused: {}", from_device, err);
                    ServerMessage::Error(err.to_payload())
                });
                (curve, response)
            },
            Err(err) => {
                tracing::debug!("undecodable request from {}: {}", from_device, err);
                let payload = ErrorPayload::new(ErrorPayload::BAD_REQUEST, err.to_string());
                (CurveId::C25519, ServerMessage::Error(payload))
            },
        };

        response.encode(curve).unwrap_or_else(|err| {
            tracing::error!("cannot encode response for {}: {}", from_device, err);
            Vec::new()
        })
    }

    /// Apply one decoded request.
    pub fn process(
        &self,
        from_device: &str,
        message: ServerMessage,
    ) -> Result<ServerMessage, RegistryError> {
        match message {
            ServerMessage::RegisterUser(registration) => {
                check_upload_size(registration.one_time_prekeys.len())?;
                self.registry.register(
                    from_device,
                    &registration.identity_key,
                    registration.signed_prekey,
                    registration.one_time_prekeys,
                )?;
                tracing::info!("registered {}", from_device);
                Ok(ServerMessage::Ack)
            },
            ServerMessage::DeleteUser => {
                self.registry.remove(from_device)?;
                tracing::info!("unregistered {}", from_device);
                Ok(ServerMessage::Ack)
            },
            ServerMessage::PostSignedPreKey(signed_prekey) => {
                self.registry.replace_signed_prekey(from_device, signed_prekey)?;
                Ok(ServerMessage::Ack)
            },
            ServerMessage::PostOneTimePreKeys(keys) => {
                check_upload_size(keys.len())?;
                self.registry.add_one_time_prekeys(from_device, keys)?;
                Ok(ServerMessage::Ack)
            },
            ServerMessage::GetPeerBundles(PeerBundlesRequest { device_ids }) => {
                if device_ids.len() > MAX_BUNDLES_PER_REQUEST {
                    return Err(RegistryError::BadRequest(format!(
                        "{} bundles requested, at most {MAX_BUNDLES_PER_REQUEST}",
                        device_ids.len()
                    )));
                }
                let mut found = PeerBundles { bundles: Vec::new(), missing: Vec::new() };
                for device_id in device_ids {
                    match self.registry.take_bundle(&device_id) {
                        Some(bundle) => found.bundles.push(bundle),
                        None => found.missing.push(device_id),
                    }
                }
                Ok(ServerMessage::PeerBundles(found))
            },
            ServerMessage::GetSelfOneTimePreKeys => {
                let ids = self.registry.one_time_prekey_ids(from_device)?;
                Ok(ServerMessage::SelfOneTimePreKeys(SelfOneTimePreKeys { ids }))
            },
            ServerMessage::Ack
            | ServerMessage::PeerBundles(_)
            | ServerMessage::SelfOneTimePreKeys(_)
            | ServerMessage::Error(_) => {
                Err(RegistryError::BadRequest(format!("{:?} is not a request", message.opcode())))
            },
        }
    }
}

fn check_upload_size(count: usize) -> Result<(), RegistryError> {
    if count > MAX_ONE_TIME_PREKEYS_PER_UPLOAD {
        return Err(RegistryError::BadRequest(format!(
            "{count} one-time prekeys uploaded, at most {MAX_ONE_TIME_PREKEYS_PER_UPLOAD}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undecodable_request_gets_bad_request() {
        let server = KeyServer::default();
        let response = server.handle("alice", &[0xFF, 0x00]);

        let (_, message) = ServerMessage::decode(&response).unwrap();
        assert!(matches!(message, ServerMessage::Error(ErrorPayload { code: ErrorPayload::BAD_REQUEST, .. })));
    }

    #[test]
    fn responses_are_not_requests() {
        let server = KeyServer::default();
        let result = server.process("alice", ServerMessage::Ack);
        assert!(matches!(result, Err(RegistryError::BadRequest(_))));
    }

    #[test]
    fn unknown_device_cannot_delete() {
        let server = KeyServer::default();
        let request = ServerMessage::DeleteUser.encode(CurveId::C25519).unwrap();

        let (curve, message) = ServerMessage::decode(&server.handle("ghost", &request)).unwrap();
        assert_eq!(curve, CurveId::C25519);
        assert!(matches!(
            message,
            ServerMessage::Error(ErrorPayload { code: ErrorPayload::NOT_REGISTERED, .. })
        ));
    }

    #[test]
    fn unknown_peers_are_reported_missing() {
        let server = KeyServer::default();
        let request = ServerMessage::GetPeerBundles(PeerBundlesRequest {
            device_ids: vec!["bob".into(), "carol".into()],
        });

        let response = server.process("alice", request).unwrap();
        let ServerMessage::PeerBundles(found) = response else {
            unreachable!("bundle request answers with bundles");
        };
        assert!(found.bundles.is_empty());
        assert_eq!(found.missing, vec!["bob".to_string(), "carol".to_string()]);
    }
}
