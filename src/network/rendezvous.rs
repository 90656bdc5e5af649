//! Rendezvous client: asks the signaling server how to reach a peer

use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ServerEndpoint};
use crate::protocol::{
    ConnType, NatType, PunchHoleFailure, PunchHoleRequest, PunchHoleResponse, RelayResponse,
    RendezvousMessage,
};

use super::error::{LookupFailureReason, NetworkError};
use super::transport::{Inbound, SignalingChannel};

/// NAT type reported to the server; declared, never probed
pub const DECLARED_NAT_TYPE: NatType = NatType::Symmetric;

/// Route to the peer handed out by the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousOutcome {
    Direct {
        uri: String,
        peer_public_key: Option<Vec<u8>>,
    },
    Relay {
        uri: String,
        uuid: String,
        peer_public_key: Option<Vec<u8>>,
    },
}

impl RendezvousOutcome {
    pub fn uri(&self) -> &str {
        match self {
            RendezvousOutcome::Direct { uri, .. } | RendezvousOutcome::Relay { uri, .. } => uri,
        }
    }

    /// Rendezvous-signed peer key, if the server sent one
    pub fn peer_public_key(&self) -> Option<&[u8]> {
        match self {
            RendezvousOutcome::Direct { peer_public_key, .. }
            | RendezvousOutcome::Relay { peer_public_key, .. } => peer_public_key.as_deref(),
        }
    }

    pub fn is_relay(&self) -> bool {
        matches!(self, RendezvousOutcome::Relay { .. })
    }
}

pub struct RendezvousClient {
    endpoint: ServerEndpoint,
    licence_key: String,
}

impl RendezvousClient {
    pub fn new(endpoint: ServerEndpoint, licence_key: impl Into<String>) -> Self {
        Self {
            endpoint,
            licence_key: licence_key.into(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, NetworkError> {
        Ok(Self::new(config.endpoint()?, config.licence_key.clone()))
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    /// Open a signaling channel
    pub async fn open_signaling(&self) -> Result<SignalingChannel, NetworkError> {
        SignalingChannel::open(&self.endpoint.signaling_uri()?).await
    }

    /// Look up `id` and return the route to it
    ///
    /// Exactly one reply is read. The signaling channel is closed before
    /// returning, whatever the outcome. No retries.
    pub async fn resolve(
        &self,
        id: &str,
        conn_type: ConnType,
    ) -> Result<RendezvousOutcome, NetworkError> {
        let mut channel = self.open_signaling().await?;
        let result = self.resolve_on(&mut channel, id, conn_type).await;
        channel.close();
        result
    }

    /// Run the lookup on an already open signaling channel
    pub async fn resolve_on(
        &self,
        channel: &mut SignalingChannel,
        id: &str,
        conn_type: ConnType,
    ) -> Result<RendezvousOutcome, NetworkError> {
        info!("Resolving peer {} ({:?})", id, conn_type);
        channel.send(&RendezvousMessage::PunchHoleRequest(PunchHoleRequest {
            id: id.to_string(),
            licence_key: self.licence_key.clone(),
            conn_type,
            nat_type: DECLARED_NAT_TYPE,
        }))?;

        let reply = match channel.next().await? {
            Inbound::Message(reply) => reply,
            Inbound::Frame(_) => {
                return Err(NetworkError::ProtocolViolation(
                    "pixel frame on the signaling channel".into(),
                ))
            }
        };
        let outcome = interpret_reply(reply, &self.endpoint)?;
        info!(
            "Peer {} resolved: {} via {}",
            id,
            if outcome.is_relay() { "relay" } else { "direct" },
            outcome.uri()
        );
        Ok(outcome)
    }
}

/// Map a rendezvous reply to an outcome or a typed error
pub fn interpret_reply(
    reply: RendezvousMessage,
    endpoint: &ServerEndpoint,
) -> Result<RendezvousOutcome, NetworkError> {
    match reply {
        RendezvousMessage::PunchHoleResponse(response) => interpret_punch_hole(response, endpoint),
        RendezvousMessage::RelayResponse(response) => interpret_relay(response, endpoint),
        other => Err(NetworkError::ProtocolViolation(format!(
            "unexpected rendezvous reply: {:?}",
            other
        ))),
    }
}

fn interpret_punch_hole(
    response: PunchHoleResponse,
    endpoint: &ServerEndpoint,
) -> Result<RendezvousOutcome, NetworkError> {
    if let Some(failure) = response.failure {
        let reason = match failure {
            PunchHoleFailure::IdNotExist => LookupFailureReason::IdNotExist,
            PunchHoleFailure::Offline => LookupFailureReason::Offline,
            PunchHoleFailure::LicenseMismatch => LookupFailureReason::LicenseMismatch,
            PunchHoleFailure::LicenseOveruse => LookupFailureReason::LicenseOveruse,
        };
        warn!("Punch hole failed: {}", reason);
        return Err(NetworkError::LookupFailure(reason));
    }
    if !response.other_failure.is_empty() {
        warn!("Punch hole failed: {}", response.other_failure);
        return Err(NetworkError::LookupFailure(LookupFailureReason::Other(
            response.other_failure,
        )));
    }

    let addr = response.socket_addr.ok_or_else(|| {
        NetworkError::ProtocolViolation("punch hole response without a peer address".into())
    })?;
    debug!(
        "Punch hole succeeded: addr={}, nat={:?}, local={:?}",
        addr, response.nat_type, response.is_local
    );
    Ok(RendezvousOutcome::Direct {
        uri: endpoint.direct_uri(addr),
        peer_public_key: response.pk,
    })
}

fn interpret_relay(
    response: RelayResponse,
    endpoint: &ServerEndpoint,
) -> Result<RendezvousOutcome, NetworkError> {
    if !response.refuse_reason.is_empty() {
        warn!("Relay refused: {}", response.refuse_reason);
        return Err(NetworkError::LookupFailure(LookupFailureReason::Other(
            response.refuse_reason,
        )));
    }

    let uri = if response.relay_server.trim().is_empty() {
        endpoint.default_relay_uri()?
    } else {
        endpoint.relay_uri(&response.relay_server)?
    };
    debug!("Relay assigned: {} (uuid {})", uri, response.uuid);
    Ok(RendezvousOutcome::Relay {
        uri,
        uuid: response.uuid,
        peer_public_key: response.pk,
    })
}
