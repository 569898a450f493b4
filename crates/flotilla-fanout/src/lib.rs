//! flotilla-fanout — derived config propagation.
//!
//! After every state change that affects addressing, the control plane
//! recomputes the DNS and routing tables and pushes them to connected
//! agents. Pushes are acknowledgment-gated with a fallback timer: the
//! caller proceeds when every reached agent acked or when the timer fires,
//! whichever comes first. DNS pushes always happen before routing pushes
//! for the same trigger; that ordering is what keeps the proxy from
//! routing to names that do not resolve yet.
//!
//! # Components
//!
//! - **`tables`** — DNS / routing table derivation from the state store
//! - **`acks`** — per-kind ack collection with wait-or-timeout semantics

pub mod acks;
pub mod error;
pub mod tables;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use flotilla_session::{ConfigKind, SessionManager};
use flotilla_state::StateStore;
use flotilla_wire::proto::{self, control_frame::Body};

pub use acks::{AckRegistry, PushOutcome};
pub use error::{FanoutError, FanoutResult};
pub use tables::{INTERNAL_SUFFIX, compute_caddy_routes, compute_dns_records};

/// Default fallback timer for DNS acks.
pub const DEFAULT_DNS_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default fallback timer for routing acks.
pub const DEFAULT_CADDY_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Pushes derived config tables to agents and gates on their acks.
pub struct Fanout {
    state: StateStore,
    sessions: SessionManager,
    acks: AckRegistry,
    dns_timeout: Duration,
    caddy_timeout: Duration,
    /// Serializes pushes so overlapping triggers cannot interleave a
    /// routing table ahead of its DNS table.
    push_lock: Mutex<()>,
}

impl Fanout {
    pub fn new(state: StateStore, sessions: SessionManager) -> Arc<Self> {
        Arc::new(Self {
            state,
            sessions,
            acks: AckRegistry::new(),
            dns_timeout: DEFAULT_DNS_ACK_TIMEOUT,
            caddy_timeout: DEFAULT_CADDY_ACK_TIMEOUT,
            push_lock: Mutex::new(()),
        })
    }

    pub fn with_timeouts(
        state: StateStore,
        sessions: SessionManager,
        dns_timeout: Duration,
        caddy_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            sessions,
            acks: AckRegistry::new(),
            dns_timeout,
            caddy_timeout,
            push_lock: Mutex::new(()),
        })
    }

    /// Route an agent's config ack into the in-flight wait, if any.
    /// Unsolicited acks are logged and dropped.
    pub fn record_ack(&self, host_id: &str, kind: ConfigKind, success: bool, message: &str) {
        self.acks.record(kind, host_id, success, message);
    }

    /// Push the DNS table to every connected agent and wait for acks or
    /// the fallback timer.
    pub async fn push_dns(&self) -> FanoutResult<PushOutcome> {
        let _guard = self.push_lock.lock().await;
        let records = compute_dns_records(&self.state)?;
        let body = Body::DnsConfig(proto::DnsConfig { records });
        let targets = self.sessions.connected_hosts();
        Ok(self
            .push(ConfigKind::Dns, body, targets, false, self.dns_timeout)
            .await)
    }

    /// Push the routing table and wait for acks or the fallback timer.
    /// Targets proxy-tagged agents when any are connected, else everyone.
    pub async fn push_caddy(&self) -> FanoutResult<PushOutcome> {
        let _guard = self.push_lock.lock().await;
        let routes = compute_caddy_routes(&self.state)?;
        let body = Body::CaddyConfig(proto::CaddyConfig { routes });

        let proxies = self.sessions.proxy_hosts();
        let (targets, proxies_only) = if proxies.is_empty() {
            (self.sessions.connected_hosts(), false)
        } else {
            (proxies, true)
        };
        Ok(self
            .push(ConfigKind::Caddy, body, targets, proxies_only, self.caddy_timeout)
            .await)
    }

    /// Push DNS then routing, in order. Used for the re-fan-out after a
    /// rollout closes (completion, rollback, abort) and on host
    /// reconvergence; stage-gated rollout pushes call the two halves
    /// separately.
    pub async fn push_all(&self) -> FanoutResult<(PushOutcome, PushOutcome)> {
        let dns = self.push_dns().await?;
        let caddy = self.push_caddy().await?;
        Ok((dns, caddy))
    }

    async fn push(
        &self,
        kind: ConfigKind,
        body: Body,
        targets: Vec<String>,
        proxies_only: bool,
        timeout: Duration,
    ) -> PushOutcome {
        let expected: HashSet<String> = targets.into_iter().collect();
        if expected.is_empty() {
            debug!(?kind, "no connected agents; push skipped");
            return PushOutcome::Acked;
        }

        let rx = self.acks.begin_wait(kind, expected);
        let delivered = self.sessions.broadcast(&body, proxies_only);
        self.acks.restrict_to(kind, &delivered);
        info!(?kind, delivered = delivered.len(), "config pushed");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // Wait dropped out from under us; treat like the timer.
                self.acks.clear(kind);
                PushOutcome::TimedOut
            }
            Err(_) => {
                warn!(?kind, "config ack fallback timer fired");
                self.acks.clear(kind);
                PushOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_state::{Deployment, DeploymentStatus, HealthState, Service};
    use tokio::sync::mpsc;

    fn seed_service(state: &StateStore) {
        state
            .put_service(&Service {
                id: "svc".into(),
                name: "web".into(),
                image: "app:1".into(),
                stateful: false,
                replicas: 1,
                auto_place: true,
                locked_host_id: None,
                migration_status: None,
                migration_target_host_id: None,
                migration_backup_id: None,
                health_check: None,
                start_command: None,
                resource_limits: None,
                deployed_config_snapshot: None,
            })
            .unwrap();
        state
            .put_deployment(&Deployment {
                id: "d1".into(),
                service_id: "svc".into(),
                host_id: "h1".into(),
                container_id: Some("c1".into()),
                ip_address: Some("10.10.0.5".into()),
                status: DeploymentStatus::Running,
                health: HealthState::Healthy,
                rollout_id: None,
                previous_deployment_id: None,
                failed_at: None,
                created_at: 1_000,
                updated_at: 1_000,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn push_dns_resolves_on_ack() {
        let state = StateStore::open_in_memory().unwrap();
        seed_service(&state);
        let sessions = SessionManager::new();
        let (tx, mut rx) = mpsc::channel(8);
        sessions.install("h1", false, 1_000, tx);

        let fanout = Fanout::new(state, sessions);
        let ack_fanout = Arc::clone(&fanout);
        let acker = tokio::spawn(async move {
            // Simulate the agent acking once the frame arrives.
            let frame = rx.recv().await.unwrap();
            assert!(matches!(frame.body, Some(Body::DnsConfig(_))));
            ack_fanout.record_ack("h1", ConfigKind::Dns, true, "");
        });

        let outcome = fanout.push_dns().await.unwrap();
        assert_eq!(outcome, PushOutcome::Acked);
        acker.await.unwrap();
    }

    #[tokio::test]
    async fn push_dns_times_out_without_acks() {
        let state = StateStore::open_in_memory().unwrap();
        seed_service(&state);
        let sessions = SessionManager::new();
        let (tx, _rx) = mpsc::channel(8);
        sessions.install("h1", false, 1_000, tx);

        let fanout = Fanout::with_timeouts(
            state,
            sessions,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        let outcome = fanout.push_dns().await.unwrap();
        assert_eq!(outcome, PushOutcome::TimedOut);
    }

    #[tokio::test]
    async fn push_with_no_agents_is_acked() {
        let state = StateStore::open_in_memory().unwrap();
        let fanout = Fanout::new(state, SessionManager::new());
        assert_eq!(fanout.push_dns().await.unwrap(), PushOutcome::Acked);
        assert_eq!(fanout.push_caddy().await.unwrap(), PushOutcome::Acked);
    }

    #[tokio::test]
    async fn negative_ack_surfaces_rejection() {
        let state = StateStore::open_in_memory().unwrap();
        seed_service(&state);
        let sessions = SessionManager::new();
        let (tx, mut rx) = mpsc::channel(8);
        sessions.install("h1", false, 1_000, tx);

        let fanout = Fanout::new(state, sessions);
        let ack_fanout = Arc::clone(&fanout);
        tokio::spawn(async move {
            let _ = rx.recv().await;
            ack_fanout.record_ack("h1", ConfigKind::Dns, false, "resolv busted");
        });

        match fanout.push_dns().await.unwrap() {
            PushOutcome::Rejected { host_id, .. } => assert_eq!(host_id, "h1"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn caddy_targets_proxies_when_present() {
        let state = StateStore::open_in_memory().unwrap();
        seed_service(&state);
        let sessions = SessionManager::new();
        let (wtx, mut wrx) = mpsc::channel(8);
        sessions.install("worker", false, 1_000, wtx);
        let (ptx, mut prx) = mpsc::channel(8);
        sessions.install("edge", true, 1_000, ptx);

        let fanout = Fanout::with_timeouts(
            state,
            sessions,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        let _ = fanout.push_caddy().await.unwrap();

        assert!(prx.try_recv().is_ok(), "proxy host receives routing table");
        assert!(wrx.try_recv().is_err(), "worker host skipped");
    }
}
