//! Agent gateway — control plane side of the stream protocol.
//!
//! Implements the `AgentGateway` gRPC service. Each accepted stream is
//! authenticated against the host's stored Ed25519 key, installed in the
//! session table, and handed to a dedicated reader task that validates
//! every inbound envelope (skew, signature, sequence) before translating
//! it into an [`AgentEvent`].

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use flotilla_state::{HealthState, Host, HostStatus, StateStore, epoch_ms};
use flotilla_wire::proto::{self, agent_payload::Body as PayloadBody, control_frame::Body};
use flotilla_wire::{check_skew, decode_payload, verify};

use crate::events::{AgentEvent, ConfigKind, ContainerReport};
use crate::manager::SessionManager;

/// Outbound frames buffered per session before sends start dropping.
const OUTBOUND_BUFFER: usize = 64;

/// gRPC implementation of the agent gateway.
pub struct AgentGatewayService {
    state: StateStore,
    sessions: SessionManager,
    events: mpsc::Sender<AgentEvent>,
    skew: Duration,
}

impl AgentGatewayService {
    /// Create a new gateway service. `skew` is clamped to the protocol
    /// maximum during verification.
    pub fn new(
        state: StateStore,
        sessions: SessionManager,
        events: mpsc::Sender<AgentEvent>,
        skew: Duration,
    ) -> Self {
        Self {
            state,
            sessions,
            events,
            skew,
        }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> proto::agent_gateway_server::AgentGatewayServer<Self> {
        proto::agent_gateway_server::AgentGatewayServer::new(self)
    }
}

#[tonic::async_trait]
impl proto::agent_gateway_server::AgentGateway for AgentGatewayService {
    type SessionStream = Pin<Box<dyn Stream<Item = Result<proto::ControlFrame, Status>> + Send>>;

    async fn session(
        &self,
        request: Request<Streaming<proto::AgentEnvelope>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await
            .map_err(|e| Status::invalid_argument(format!("stream error: {e}")))?
            .ok_or_else(|| Status::invalid_argument("stream closed before authentication"))?;

        let (host, status_update) =
            authenticate(&self.state, &first, self.skew, epoch_ms() as i64)?;

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let session_id = self
            .sessions
            .install(&host.id, status_update.is_proxy, epoch_ms(), tx);
        if let Err(e) = self
            .sessions
            .accept_inbound(&host.id, &session_id, first.sequence)
        {
            // Do not leave a dead entry behind for a stream we reject.
            self.sessions.remove_if_current(&host.id, &session_id);
            return Err(Status::invalid_argument(e.to_string()));
        }

        self.sessions.send(
            &host.id,
            Body::Connected(proto::Connected {
                session_id: session_id.clone(),
            }),
        );
        info!(host_id = %host.id, %session_id, "agent connected");

        // The first frame doubles as the initial inventory report.
        if let Err(e) = self
            .state
            .touch_host(&host.id, epoch_ms(), Some(status_update.is_proxy))
        {
            warn!(host_id = %host.id, error = %e, "failed to refresh host liveness");
        }
        let _ = self
            .events
            .send(status_update_event(&host.id, status_update))
            .await;

        // One dedicated reader task per connected agent.
        let reader = SessionReader {
            state: self.state.clone(),
            sessions: self.sessions.clone(),
            events: self.events.clone(),
            skew: self.skew,
            host_id: host.id.clone(),
            session_id,
        };
        tokio::spawn(async move { reader.run(inbound).await });

        let outbound = ReceiverStream::new(rx).map(Ok::<_, Status>);
        Ok(Response::new(Box::pin(outbound) as Self::SessionStream))
    }
}

/// Per-session inbound loop.
struct SessionReader {
    state: StateStore,
    sessions: SessionManager,
    events: mpsc::Sender<AgentEvent>,
    skew: Duration,
    host_id: String,
    session_id: String,
}

impl SessionReader {
    async fn run(self, mut inbound: Streaming<proto::AgentEnvelope>) {
        loop {
            match inbound.message().await {
                Ok(Some(envelope)) => {
                    if let Err(fault) = self.process(envelope).await {
                        warn!(
                            host_id = %self.host_id,
                            code = fault.code,
                            error = %fault.message,
                            "fatal protocol error, terminating session"
                        );
                        self.sessions.send(&self.host_id, Body::Error(fault));
                        break;
                    }
                }
                Ok(None) => {
                    debug!(host_id = %self.host_id, "agent stream closed");
                    break;
                }
                Err(e) => {
                    warn!(host_id = %self.host_id, error = %e, "agent stream error");
                    break;
                }
            }
        }

        // Dropping the entry closes the outbound channel; a session evicted
        // by a newer connection must leave the replacement untouched.
        if self.sessions.remove_if_current(&self.host_id, &self.session_id) {
            let _ = self
                .events
                .send(AgentEvent::Disconnected {
                    host_id: self.host_id.clone(),
                })
                .await;
        }
    }

    async fn process(&self, envelope: proto::AgentEnvelope) -> Result<(), proto::Error> {
        let host = self
            .state
            .get_host(&self.host_id)
            .ok()
            .flatten()
            .ok_or_else(|| fault(404, "host no longer registered"))?;

        check_skew(epoch_ms() as i64, envelope.timestamp_ms, self.skew)
            .map_err(|e| fault(400, &e.to_string()))?;
        verify(
            &host.signing_public_key,
            envelope.timestamp_ms,
            &envelope.payload,
            &envelope.signature,
        )
        .map_err(|e| fault(401, &e.to_string()))?;
        self.sessions
            .accept_inbound(&self.host_id, &self.session_id, envelope.sequence)
            .map_err(|e| fault(400, &e.to_string()))?;

        let payload = decode_payload(&envelope.payload)
            .map_err(|e| fault(400, &format!("undecodable payload: {e}")))?;

        // Any authenticated inbound message refreshes liveness.
        let is_proxy = match &payload.body {
            Some(PayloadBody::StatusUpdate(su)) => Some(su.is_proxy),
            _ => None,
        };
        if let Err(e) = self.state.touch_host(&self.host_id, epoch_ms(), is_proxy) {
            warn!(host_id = %self.host_id, error = %e, "failed to refresh host liveness");
        }

        if let Some(event) = envelope_to_event(&self.host_id, payload) {
            let _ = self.events.send(event).await;
        }
        Ok(())
    }
}

fn fault(code: u32, message: &str) -> proto::Error {
    proto::Error {
        code,
        message: message.to_string(),
        fatal: true,
    }
}

/// Authenticate the mandatory first frame of a stream.
///
/// Failure conditions follow the protocol contract: missing fields → 400,
/// unknown host → 404, host in `unknown` status → 403, skewed clock → 400,
/// bad signature → 401, wrong first payload → 400. All are fatal.
fn authenticate(
    state: &StateStore,
    envelope: &proto::AgentEnvelope,
    skew: Duration,
    now_ms: i64,
) -> Result<(Host, proto::StatusUpdate), Status> {
    if envelope.host_id.is_empty() || envelope.signature.is_empty() || envelope.timestamp_ms == 0 {
        return Err(Status::invalid_argument("missing authentication fields"));
    }

    let host = state
        .get_host(&envelope.host_id)
        .map_err(|e| Status::internal(e.to_string()))?
        .ok_or_else(|| Status::not_found(format!("unknown host {}", envelope.host_id)))?;
    if host.status == HostStatus::Unknown {
        return Err(Status::permission_denied("host is quarantined"));
    }

    check_skew(now_ms, envelope.timestamp_ms, skew)
        .map_err(|e| Status::invalid_argument(e.to_string()))?;
    verify(
        &host.signing_public_key,
        envelope.timestamp_ms,
        &envelope.payload,
        &envelope.signature,
    )
    .map_err(|e| Status::unauthenticated(e.to_string()))?;

    let payload = decode_payload(&envelope.payload)
        .map_err(|e| Status::invalid_argument(format!("undecodable payload: {e}")))?;
    match payload.body {
        Some(PayloadBody::StatusUpdate(update)) => Ok((host, update)),
        _ => Err(Status::invalid_argument(
            "first frame must be a status update",
        )),
    }
}

fn status_update_event(host_id: &str, update: proto::StatusUpdate) -> AgentEvent {
    AgentEvent::StatusUpdate {
        host_id: host_id.to_string(),
        is_proxy: update.is_proxy,
        containers: update
            .containers
            .into_iter()
            .map(|c| ContainerReport {
                deployment_id: c.deployment_id,
                container_id: c.container_id,
                ip_address: non_empty(c.ip_address),
                state: c.state,
                health: parse_health(&c.health),
            })
            .collect(),
    }
}

/// Translate a decoded payload into an engine event.
fn envelope_to_event(host_id: &str, payload: proto::AgentPayload) -> Option<AgentEvent> {
    match payload.body? {
        PayloadBody::StatusUpdate(update) => Some(status_update_event(host_id, update)),
        PayloadBody::WorkComplete(wc) => Some(AgentEvent::WorkComplete {
            host_id: host_id.to_string(),
            work_id: wc.work_id,
            success: wc.success,
            message: wc.message,
            container_id: non_empty(wc.container_id),
            ip_address: non_empty(wc.ip_address),
            checksum: non_empty(wc.checksum),
        }),
        PayloadBody::Heartbeat(_) => Some(AgentEvent::Heartbeat {
            host_id: host_id.to_string(),
        }),
        PayloadBody::ConfigAck(ack) => {
            let kind = match proto::ConfigKind::try_from(ack.kind) {
                Ok(proto::ConfigKind::Dns) => ConfigKind::Dns,
                Ok(proto::ConfigKind::Caddy) => ConfigKind::Caddy,
                _ => {
                    warn!(host_id, "config ack with unspecified kind ignored");
                    return None;
                }
            };
            Some(AgentEvent::ConfigAck {
                host_id: host_id.to_string(),
                kind,
                success: ack.success,
                message: ack.message,
            })
        }
    }
}

fn parse_health(health: &str) -> HealthState {
    match health {
        "starting" => HealthState::Starting,
        "healthy" => HealthState::Healthy,
        "unhealthy" => HealthState::Unhealthy,
        _ => HealthState::None,
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use flotilla_state::{Host, HostResources};
    use flotilla_wire::{encode_payload, sign};

    fn test_key() -> SigningKey {
        SigningKey::from_bytes(&[3u8; 32])
    }

    fn register_host(state: &StateStore, id: &str, status: HostStatus, key: &SigningKey) {
        state
            .put_host(&Host {
                id: id.to_string(),
                name: id.to_string(),
                wireguard_ip: "10.10.0.2".to_string(),
                signing_public_key: flotilla_wire::envelope::encode_public_key(
                    &key.verifying_key(),
                ),
                status,
                last_heartbeat: 0,
                resources: HostResources::default(),
                is_proxy: false,
            })
            .unwrap();
    }

    fn status_update_envelope(
        host_id: &str,
        key: &SigningKey,
        timestamp_ms: i64,
        sequence: u64,
    ) -> proto::AgentEnvelope {
        let payload = encode_payload(&proto::AgentPayload {
            body: Some(PayloadBody::StatusUpdate(proto::StatusUpdate {
                containers: vec![],
                is_proxy: false,
            })),
        });
        proto::AgentEnvelope {
            host_id: host_id.to_string(),
            timestamp_ms,
            sequence,
            signature: sign(key, timestamp_ms, &payload),
            payload,
        }
    }

    #[test]
    fn authenticate_accepts_signed_status_update() {
        let state = StateStore::open_in_memory().unwrap();
        let key = test_key();
        register_host(&state, "h1", HostStatus::Pending, &key);

        let envelope = status_update_envelope("h1", &key, 100_000, 1);
        let (host, _) =
            authenticate(&state, &envelope, Duration::from_secs(60), 100_500).unwrap();
        assert_eq!(host.id, "h1");
    }

    #[test]
    fn authenticate_rejects_unknown_host() {
        let state = StateStore::open_in_memory().unwrap();
        let envelope = status_update_envelope("ghost", &test_key(), 100_000, 1);
        let err = authenticate(&state, &envelope, Duration::from_secs(60), 100_000).unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[test]
    fn authenticate_rejects_quarantined_host() {
        let state = StateStore::open_in_memory().unwrap();
        let key = test_key();
        register_host(&state, "h1", HostStatus::Unknown, &key);

        let envelope = status_update_envelope("h1", &key, 100_000, 1);
        let err = authenticate(&state, &envelope, Duration::from_secs(60), 100_000).unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn authenticate_rejects_bad_signature() {
        let state = StateStore::open_in_memory().unwrap();
        let key = test_key();
        register_host(&state, "h1", HostStatus::Online, &key);

        let other = SigningKey::from_bytes(&[5u8; 32]);
        let envelope = status_update_envelope("h1", &other, 100_000, 1);
        let err = authenticate(&state, &envelope, Duration::from_secs(60), 100_000).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn authenticate_rejects_stale_timestamp() {
        let state = StateStore::open_in_memory().unwrap();
        let key = test_key();
        register_host(&state, "h1", HostStatus::Online, &key);

        let envelope = status_update_envelope("h1", &key, 100_000, 1);
        let err = authenticate(&state, &envelope, Duration::from_secs(60), 500_000).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn authenticate_rejects_missing_fields() {
        let state = StateStore::open_in_memory().unwrap();
        let envelope = proto::AgentEnvelope {
            host_id: String::new(),
            timestamp_ms: 0,
            sequence: 0,
            signature: vec![],
            payload: vec![],
        };
        let err = authenticate(&state, &envelope, Duration::from_secs(60), 1_000).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn authenticate_requires_status_update_first() {
        let state = StateStore::open_in_memory().unwrap();
        let key = test_key();
        register_host(&state, "h1", HostStatus::Online, &key);

        let payload = encode_payload(&proto::AgentPayload {
            body: Some(PayloadBody::Heartbeat(proto::Heartbeat {})),
        });
        let envelope = proto::AgentEnvelope {
            host_id: "h1".to_string(),
            timestamp_ms: 100_000,
            sequence: 1,
            signature: sign(&key, 100_000, &payload),
            payload,
        };
        let err = authenticate(&state, &envelope, Duration::from_secs(60), 100_000).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn work_complete_event_translation() {
        let payload = proto::AgentPayload {
            body: Some(PayloadBody::WorkComplete(proto::WorkComplete {
                work_id: "h1:1".into(),
                success: true,
                message: String::new(),
                container_id: "c1".into(),
                ip_address: String::new(),
                checksum: String::new(),
            })),
        };

        let event = envelope_to_event("h1", payload).unwrap();
        match event {
            AgentEvent::WorkComplete {
                work_id,
                success,
                container_id,
                ip_address,
                ..
            } => {
                assert_eq!(work_id, "h1:1");
                assert!(success);
                assert_eq!(container_id.as_deref(), Some("c1"));
                assert!(ip_address.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn health_strings_parse() {
        assert_eq!(parse_health("healthy"), HealthState::Healthy);
        assert_eq!(parse_health("unhealthy"), HealthState::Unhealthy);
        assert_eq!(parse_health("starting"), HealthState::Starting);
        assert_eq!(parse_health(""), HealthState::None);
        assert_eq!(parse_health("weird"), HealthState::None);
    }
}
