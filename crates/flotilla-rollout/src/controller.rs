//! Rollout controller — drives the rollout state machine.
//!
//! A rollout converges a service from its deployed snapshot to its desired
//! state through fixed stages:
//!
//! ```text
//! queued → deploying → health_check → dns_updating → caddy_updating
//!        → stopping_old → completed
//! ```
//!
//! Transitions are performed here, never by the agent: agent messages and
//! the stuck sweep both land in these entry points, which the engine
//! serializes per service. Any failed stage enters the rollback path; DNS
//! config is always acknowledged (or time-waited) before routing config.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use flotilla_fanout::{Fanout, PushOutcome};
use flotilla_placement::SpreadPlacement;
use flotilla_queue::{PayloadPort, PayloadVolume, WorkPayload, WorkQueue};
use flotilla_state::{
    Deployment, DeploymentStatus, HealthState, Rollout, RolloutStage, RolloutStatus, Service,
    StateStore, WorkItem, desired_config, epoch_ms, new_id,
};

use crate::error::{RolloutError, RolloutResult};

/// Default wall-clock bound on a whole rollout.
pub const DEFAULT_ROLLOUT_TIMEOUT: Duration = Duration::from_secs(600);

/// Drives rollouts for every service. Entry points must be called under
/// the engine's per-service lock.
pub struct RolloutController {
    state: StateStore,
    queue: WorkQueue,
    fanout: Arc<Fanout>,
    rollout_timeout: Duration,
    registry_host: Option<String>,
}

impl RolloutController {
    pub fn new(state: StateStore, queue: WorkQueue, fanout: Arc<Fanout>) -> Self {
        Self {
            state,
            queue,
            fanout,
            rollout_timeout: DEFAULT_ROLLOUT_TIMEOUT,
            registry_host: None,
        }
    }

    /// Set the stuck-rollout bound.
    pub fn with_rollout_timeout(mut self, timeout: Duration) -> Self {
        self.rollout_timeout = timeout;
        self
    }

    /// Set the registry host handed to agents in deploy payloads.
    pub fn with_registry_host(mut self, registry_host: Option<String>) -> Self {
        self.registry_host = registry_host;
        self
    }

    // ── Trigger ────────────────────────────────────────────────────

    /// Start a rollout for a service with the given placements.
    ///
    /// Creates the rollout and its pending deployments atomically, then
    /// enqueues one deploy item per deployment (plus a manifest item per
    /// host for stateful services) and moves to `deploying`.
    pub async fn begin(
        &self,
        service_id: &str,
        placements: &[SpreadPlacement],
    ) -> RolloutResult<Rollout> {
        let service = self.require_service(service_id)?;
        let ports = self.state.list_ports(service_id)?;
        let volumes = self.state.list_volumes(service_id)?;
        let existing = self.state.list_deployments(service_id)?;
        let now = epoch_ms();

        let mut rollout = Rollout {
            id: new_id(),
            service_id: service_id.to_string(),
            status: RolloutStatus::InProgress,
            current_stage: RolloutStage::Queued,
            created_at: now,
            completed_at: None,
            dns_updated_by_timeout: false,
        };

        let mut deployments = Vec::new();
        for placement in placements {
            let previous = existing
                .iter()
                .find(|d| d.host_id == placement.host_id && d.status == DeploymentStatus::Running)
                .map(|d| d.id.clone());
            for _ in 0..placement.count {
                deployments.push(Deployment {
                    id: new_id(),
                    service_id: service_id.to_string(),
                    host_id: placement.host_id.clone(),
                    container_id: None,
                    ip_address: None,
                    status: DeploymentStatus::Pending,
                    health: HealthState::None,
                    rollout_id: Some(rollout.id.clone()),
                    previous_deployment_id: previous.clone(),
                    failed_at: None,
                    created_at: now,
                    updated_at: now,
                });
            }
        }

        self.state.create_rollout(&rollout, &deployments)?;

        if service.stateful {
            // Stateful hosts get the declarative manifest ahead of the deploy.
            let replicas = self.state.list_replicas(service_id)?;
            let manifest = desired_config(&service, &replicas, &ports, &volumes);
            for placement in placements {
                self.queue.enqueue(
                    &placement.host_id,
                    &WorkPayload::CreateManifest {
                        service_id: service_id.to_string(),
                        manifest: manifest.clone(),
                    },
                )?;
            }
        }

        for deployment in &deployments {
            self.queue.enqueue(
                &deployment.host_id,
                &self.deploy_payload(&service, deployment, &ports, &volumes),
            )?;
        }

        rollout = self
            .state
            .update_rollout(&rollout.id, |r| r.current_stage = RolloutStage::Deploying)?;
        info!(
            rollout_id = %rollout.id,
            service_id,
            deployments = deployments.len(),
            "rollout started"
        );
        Ok(rollout)
    }

    // ── Agent-driven transitions ───────────────────────────────────

    /// A deploy work item finished on the agent.
    pub async fn handle_deploy_result(
        &self,
        item: &WorkItem,
        success: bool,
        message: &str,
        container_id: Option<String>,
        ip_address: Option<String>,
    ) -> RolloutResult<()> {
        let Some(deployment_id) = &item.deployment_id else {
            return Ok(());
        };
        // Deleted by an abort in the meantime; nothing to drive.
        let Some(deployment) = self.state.get_deployment(deployment_id)? else {
            return Ok(());
        };
        let Some(rollout_id) = deployment.rollout_id.clone() else {
            return Ok(());
        };
        let Some(rollout) = self.state.get_rollout(&rollout_id)? else {
            return Ok(());
        };
        if rollout.status != RolloutStatus::InProgress {
            return Ok(());
        }

        if !success {
            warn!(%rollout_id, deployment_id, message, "deploy failed on agent");
            self.state.update_deployment(deployment_id, |d| {
                d.status = DeploymentStatus::Failed;
                d.failed_at = Some("deploy".to_string());
            })?;
            return self
                .rollback(&rollout, "deploy", RolloutStage::Deploying, false)
                .await;
        }

        self.state.update_deployment(deployment_id, |d| {
            d.status = DeploymentStatus::Starting;
            d.container_id = container_id.clone();
            d.ip_address = ip_address.clone();
            if d.health == HealthState::None {
                d.health = HealthState::Starting;
            }
        })?;

        // All containers created: the rollout is now gating on health.
        if rollout.current_stage == RolloutStage::Deploying {
            let pending = self
                .rollout_deployments(&rollout_id)?
                .iter()
                .any(|d| matches!(d.status, DeploymentStatus::Pending | DeploymentStatus::Pulling));
            if !pending {
                self.state.update_rollout(&rollout_id, |r| {
                    r.current_stage = RolloutStage::HealthCheck;
                })?;
                debug!(%rollout_id, "all containers started, gating on health");
            }
        }

        self.evaluate_health(&deployment.service_id).await
    }

    /// Re-evaluate the health gate after agent health reports.
    ///
    /// The engine records reported health onto deployment rows before
    /// calling this. When every new deployment is healthy the rollout
    /// proceeds through DNS and routing propagation; an unhealthy or
    /// failed deployment rolls it back.
    pub async fn evaluate_health(&self, service_id: &str) -> RolloutResult<()> {
        let Some(rollout) = self.state.find_in_progress_rollout(service_id)? else {
            return Ok(());
        };
        if !matches!(
            rollout.current_stage,
            RolloutStage::Deploying | RolloutStage::HealthCheck
        ) {
            return Ok(());
        }

        let deployments = self.rollout_deployments(&rollout.id)?;
        if deployments.is_empty() {
            return Ok(());
        }

        if let Some(bad) = deployments.iter().find(|d| {
            d.status == DeploymentStatus::Failed || d.health == HealthState::Unhealthy
        }) {
            warn!(
                rollout_id = %rollout.id,
                deployment_id = %bad.id,
                "health gate failed"
            );
            if bad.status != DeploymentStatus::Failed {
                self.state.update_deployment(&bad.id, |d| {
                    d.status = DeploymentStatus::Failed;
                    d.failed_at = Some("health_check".to_string());
                })?;
            }
            return self
                .rollback(&rollout, "health_check", RolloutStage::HealthCheck, false)
                .await;
        }

        // Agents report health; the controller owns the status flip.
        for d in &deployments {
            if d.status == DeploymentStatus::Starting && d.health == HealthState::Healthy {
                self.state
                    .update_deployment(&d.id, |d| d.status = DeploymentStatus::Healthy)?;
            }
        }

        let all_healthy = self
            .rollout_deployments(&rollout.id)?
            .iter()
            .all(|d| d.status == DeploymentStatus::Healthy);
        if all_healthy {
            self.propagate_config(&rollout).await?;
        }
        Ok(())
    }

    /// A stop item draining an old deployment finished.
    pub async fn handle_stop_result(
        &self,
        rollout_id: &str,
        item: &WorkItem,
        success: bool,
    ) -> RolloutResult<()> {
        if let Some(deployment_id) = &item.deployment_id {
            if self.state.get_deployment(deployment_id)?.is_some() {
                self.state.update_deployment(deployment_id, |d| {
                    if success {
                        d.status = DeploymentStatus::Stopped;
                    } else {
                        d.status = DeploymentStatus::Failed;
                        d.failed_at = Some("stopping_old".to_string());
                    }
                })?;
            }
        }
        self.maybe_finish(rollout_id).await
    }

    // ── Stage progression ──────────────────────────────────────────

    /// Walk the config stages: DNS fan-out (ack-gated), then routing
    /// fan-out (ack-gated), then drain the old deployments.
    async fn propagate_config(&self, rollout: &Rollout) -> RolloutResult<()> {
        // DNS before routing, always.
        self.state.advance_rollout(
            &rollout.id,
            RolloutStage::DnsUpdating,
            DeploymentStatus::Healthy,
            DeploymentStatus::DnsUpdating,
        )?;
        match self.fanout.push_dns().await? {
            PushOutcome::Rejected { host_id, message } => {
                warn!(rollout_id = %rollout.id, host_id, message, "dns config rejected");
                return self
                    .rollback(rollout, "dns_updating", RolloutStage::DnsUpdating, false)
                    .await;
            }
            PushOutcome::TimedOut => {
                self.state
                    .update_rollout(&rollout.id, |r| r.dns_updated_by_timeout = true)?;
            }
            PushOutcome::Acked => {}
        }

        self.state.advance_rollout(
            &rollout.id,
            RolloutStage::CaddyUpdating,
            DeploymentStatus::DnsUpdating,
            DeploymentStatus::CaddyUpdating,
        )?;
        match self.fanout.push_caddy().await? {
            PushOutcome::Rejected { host_id, message } => {
                warn!(rollout_id = %rollout.id, host_id, message, "routing config rejected");
                return self
                    .rollback(rollout, "caddy_updating", RolloutStage::CaddyUpdating, false)
                    .await;
            }
            PushOutcome::TimedOut | PushOutcome::Acked => {}
        }

        self.enter_stopping_old(rollout).await
    }

    /// Drain every old deployment of the service, then finish.
    async fn enter_stopping_old(&self, rollout: &Rollout) -> RolloutResult<()> {
        self.state.advance_rollout(
            &rollout.id,
            RolloutStage::StoppingOld,
            DeploymentStatus::CaddyUpdating,
            DeploymentStatus::StoppingOld,
        )?;

        let old: Vec<Deployment> = self
            .state
            .list_deployments(&rollout.service_id)?
            .into_iter()
            .filter(|d| {
                d.rollout_id.as_deref() != Some(rollout.id.as_str())
                    && d.status == DeploymentStatus::Running
            })
            .collect();

        for deployment in &old {
            self.state
                .update_deployment(&deployment.id, |d| d.status = DeploymentStatus::Stopping)?;
            self.queue.enqueue(
                &deployment.host_id,
                &WorkPayload::Stop {
                    deployment_id: deployment.id.clone(),
                    service_id: rollout.service_id.clone(),
                    container_id: deployment.container_id.clone(),
                    rollout_id: Some(rollout.id.clone()),
                },
            )?;
        }
        debug!(rollout_id = %rollout.id, draining = old.len(), "stopping old deployments");

        self.maybe_finish(&rollout.id).await
    }

    /// Complete the rollout once every old deployment reached a terminal
    /// status: promote the new deployments, bind the stateful lock host,
    /// delete the old rows, snapshot the config, and re-fan-out so stale
    /// entries are flushed.
    async fn maybe_finish(&self, rollout_id: &str) -> RolloutResult<()> {
        let Some(rollout) = self.state.get_rollout(rollout_id)? else {
            return Ok(());
        };
        if rollout.status != RolloutStatus::InProgress
            || rollout.current_stage != RolloutStage::StoppingOld
        {
            return Ok(());
        }

        let old_done = self
            .state
            .list_deployments(&rollout.service_id)?
            .into_iter()
            .filter(|d| d.rollout_id.as_deref() != Some(rollout_id))
            .all(|d| {
                matches!(
                    d.status,
                    DeploymentStatus::Stopped
                        | DeploymentStatus::Failed
                        | DeploymentStatus::RolledBack
                )
            });
        if !old_done {
            return Ok(());
        }

        let service = self.require_service(&rollout.service_id)?;
        let snapshot = desired_config(
            &service,
            &self.state.list_replicas(&service.id)?,
            &self.state.list_ports(&service.id)?,
            &self.state.list_volumes(&service.id)?,
        );
        self.state.complete_rollout(rollout_id, epoch_ms(), snapshot)?;

        // Old rows are gone; re-derive and flush stale entries everywhere.
        self.fanout.push_all().await?;
        Ok(())
    }

    // ── Failure paths ──────────────────────────────────────────────

    /// Enter the rollback path from a failed stage.
    pub async fn rollback(
        &self,
        rollout: &Rollout,
        failed_tag: &str,
        stage: RolloutStage,
        operator_initiated: bool,
    ) -> RolloutResult<()> {
        let rolled_back =
            self.state
                .rollback_rollout(&rollout.id, failed_tag, stage, epoch_ms(), operator_initiated)?;

        for deployment in &rolled_back {
            self.queue.enqueue(
                &deployment.host_id,
                &WorkPayload::Stop {
                    deployment_id: deployment.id.clone(),
                    service_id: deployment.service_id.clone(),
                    container_id: deployment.container_id.clone(),
                    rollout_id: None,
                },
            )?;
        }

        // Old endpoints remain authoritative.
        self.fanout.push_all().await?;
        Ok(())
    }

    /// Operator abort. Idempotent: a service with no in-progress rollout
    /// is left untouched.
    pub async fn abort(&self, service_id: &str) -> RolloutResult<bool> {
        let Some(rollout) = self.state.find_in_progress_rollout(service_id)? else {
            return Ok(false);
        };

        let outcome = self.state.abort_rollout(&rollout.id, epoch_ms())?;
        self.queue.purge_pending_for_service(service_id)?;

        // Containers the agent may have started for deleted deployments get
        // collected best-effort; everything still tracked survives.
        for host_id in &outcome.hosts {
            let keep: Vec<String> = self
                .state
                .deployments_for_host(host_id)?
                .into_iter()
                .filter_map(|d| d.container_id)
                .collect();
            self.queue.enqueue(
                host_id,
                &WorkPayload::ForceCleanup {
                    keep_container_ids: keep,
                },
            )?;
        }

        self.fanout.push_all().await?;
        info!(rollout_id = %rollout.id, service_id, "rollout aborted by operator");
        Ok(true)
    }

    /// Fail the rollout if it exceeded the wall-clock bound. Returns true
    /// when the rollout was failed.
    pub async fn fail_if_stuck(&self, rollout_id: &str) -> RolloutResult<bool> {
        let Some(rollout) = self.state.get_rollout(rollout_id)? else {
            return Ok(false);
        };
        if rollout.status != RolloutStatus::InProgress {
            return Ok(false);
        }
        if epoch_ms().saturating_sub(rollout.created_at) <= self.rollout_timeout.as_millis() as u64
        {
            return Ok(false);
        }

        let stage_tag = rollout.current_stage.tag();
        warn!(%rollout_id, stage = %stage_tag, "rollout stuck past timeout");
        self.rollback(
            &rollout,
            &format!("stuck_{stage_tag}"),
            RolloutStage::Stuck(stage_tag),
            false,
        )
        .await?;
        Ok(true)
    }

    /// A deploy item was permanently failed by the stuck-work sweep; its
    /// deployment is already tagged. Drive the owning rollout into
    /// rollback.
    pub async fn handle_stuck_deploy(&self, item: &WorkItem) -> RolloutResult<()> {
        let Some(deployment_id) = &item.deployment_id else {
            return Ok(());
        };
        let Some(deployment) = self.state.get_deployment(deployment_id)? else {
            return Ok(());
        };
        let Some(rollout_id) = &deployment.rollout_id else {
            return Ok(());
        };
        let Some(rollout) = self.state.get_rollout(rollout_id)? else {
            return Ok(());
        };
        if rollout.status == RolloutStatus::InProgress {
            self.rollback(&rollout, "stuck_timeout", RolloutStage::Deploying, false)
                .await?;
        }
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn require_service(&self, service_id: &str) -> RolloutResult<Service> {
        self.state
            .get_service(service_id)?
            .ok_or_else(|| RolloutError::ServiceNotFound(service_id.to_string()))
    }

    fn rollout_deployments(&self, rollout_id: &str) -> RolloutResult<Vec<Deployment>> {
        Ok(self
            .state
            .list_all_deployments()?
            .into_iter()
            .filter(|d| d.rollout_id.as_deref() == Some(rollout_id))
            .collect())
    }

    fn deploy_payload(
        &self,
        service: &Service,
        deployment: &Deployment,
        ports: &[flotilla_state::ServicePort],
        volumes: &[flotilla_state::ServiceVolume],
    ) -> WorkPayload {
        WorkPayload::Deploy {
            deployment_id: deployment.id.clone(),
            service_id: service.id.clone(),
            image: service.image.clone(),
            start_command: service.start_command.clone(),
            health_check: service.health_check.clone(),
            ports: ports
                .iter()
                .map(|p| PayloadPort {
                    port: p.port,
                    is_public: p.is_public,
                    external_port: p.external_port,
                })
                .collect(),
            volumes: volumes
                .iter()
                .map(|v| PayloadVolume {
                    name: v.name.clone(),
                    container_path: v.container_path.clone(),
                })
                .collect(),
            resource_limits: service.resource_limits.clone(),
            registry_host: self.registry_host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_session::SessionManager;
    use flotilla_state::{Host, HostResources, HostStatus, WorkStatus, WorkType};

    struct Fixture {
        state: StateStore,
        queue: WorkQueue,
        controller: RolloutController,
    }

    fn fixture() -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let queue = WorkQueue::new(state.clone());
        // No connected agents: config pushes resolve immediately.
        let fanout = Fanout::new(state.clone(), SessionManager::new());
        let controller = RolloutController::new(state.clone(), queue.clone(), fanout);
        Fixture {
            state,
            queue,
            controller,
        }
    }

    fn seed_host(state: &StateStore, id: &str) {
        state
            .put_host(&Host {
                id: id.to_string(),
                name: id.to_string(),
                wireguard_ip: format!("10.10.0.{}", id.len()),
                signing_public_key: "ab".repeat(32),
                status: HostStatus::Online,
                last_heartbeat: epoch_ms(),
                resources: HostResources::default(),
                is_proxy: false,
            })
            .unwrap();
    }

    fn seed_service(state: &StateStore, id: &str, stateful: bool) {
        state
            .put_service(&Service {
                id: id.to_string(),
                name: id.to_string(),
                image: "registry.example/app:2".into(),
                stateful,
                replicas: 2,
                auto_place: !stateful,
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
    }

    fn placements(spec: &[(&str, u32)]) -> Vec<SpreadPlacement> {
        spec.iter()
            .map(|(h, c)| SpreadPlacement {
                host_id: h.to_string(),
                count: *c,
            })
            .collect()
    }

    fn deploy_items(state: &StateStore, host: &str) -> Vec<WorkItem> {
        state
            .list_work_for_host(host)
            .unwrap()
            .into_iter()
            .filter(|w| w.work_type == WorkType::Deploy)
            .collect()
    }

    async fn report_deploy_ok(fx: &Fixture, host: &str, ip: &str) {
        let item = deploy_items(&fx.state, host).pop().unwrap();
        fx.controller
            .handle_deploy_result(&item, true, "", Some(format!("c-{host}")), Some(ip.into()))
            .await
            .unwrap();
    }

    async fn report_all_healthy(fx: &Fixture, service: &str) {
        for d in fx.state.list_deployments(service).unwrap() {
            if d.status == DeploymentStatus::Starting {
                fx.state
                    .update_deployment(&d.id, |d| d.health = HealthState::Healthy)
                    .unwrap();
            }
        }
        fx.controller.evaluate_health(service).await.unwrap();
    }

    #[tokio::test]
    async fn happy_path_stateless_deploy() {
        let fx = fixture();
        seed_host(&fx.state, "a");
        seed_host(&fx.state, "b");
        seed_service(&fx.state, "x", false);

        let rollout = fx
            .controller
            .begin("x", &placements(&[("a", 1), ("b", 1)]))
            .await
            .unwrap();
        assert_eq!(rollout.current_stage, RolloutStage::Deploying);
        assert_eq!(fx.state.list_deployments("x").unwrap().len(), 2);
        assert_eq!(deploy_items(&fx.state, "a").len(), 1);
        assert_eq!(deploy_items(&fx.state, "b").len(), 1);

        report_deploy_ok(&fx, "a", "10.10.0.5").await;
        report_deploy_ok(&fx, "b", "10.10.0.6").await;
        assert_eq!(
            fx.state.get_rollout(&rollout.id).unwrap().unwrap().current_stage,
            RolloutStage::HealthCheck
        );

        report_all_healthy(&fx, "x").await;

        let rollout = fx.state.get_rollout(&rollout.id).unwrap().unwrap();
        assert_eq!(rollout.status, RolloutStatus::Completed);
        assert_eq!(rollout.current_stage, RolloutStage::Completed);
        assert!(rollout.completed_at.is_some());

        let deployments = fx.state.list_deployments("x").unwrap();
        assert_eq!(deployments.len(), 2);
        assert!(deployments.iter().all(|d| d.status == DeploymentStatus::Running));

        let service = fx.state.get_service("x").unwrap().unwrap();
        assert!(service.deployed_config_snapshot.is_some());
    }

    #[tokio::test]
    async fn deploy_failure_rolls_back_everything() {
        let fx = fixture();
        seed_host(&fx.state, "a");
        seed_host(&fx.state, "b");
        seed_service(&fx.state, "x", false);

        let rollout = fx
            .controller
            .begin("x", &placements(&[("a", 1), ("b", 1)]))
            .await
            .unwrap();

        report_deploy_ok(&fx, "a", "10.10.0.5").await;

        let item = deploy_items(&fx.state, "b").pop().unwrap();
        fx.controller
            .handle_deploy_result(&item, false, "image pull failed", None, None)
            .await
            .unwrap();

        let rollout = fx.state.get_rollout(&rollout.id).unwrap().unwrap();
        assert_eq!(rollout.status, RolloutStatus::RolledBack);

        let deployments = fx.state.list_deployments("x").unwrap();
        assert_eq!(deployments.len(), 2);
        for d in &deployments {
            assert_eq!(d.status, DeploymentStatus::RolledBack);
            assert_eq!(d.failed_at.as_deref(), Some("deploy"));
        }

        // Both new deployments get a stop item.
        let stops: usize = ["a", "b"]
            .iter()
            .map(|h| {
                fx.state
                    .list_work_for_host(h)
                    .unwrap()
                    .iter()
                    .filter(|w| w.work_type == WorkType::Stop)
                    .count()
            })
            .sum();
        assert_eq!(stops, 2);
    }

    #[tokio::test]
    async fn unhealthy_deployment_rolls_back() {
        let fx = fixture();
        seed_host(&fx.state, "a");
        seed_service(&fx.state, "x", false);

        let rollout = fx.controller.begin("x", &placements(&[("a", 2)])).await.unwrap();

        for item in deploy_items(&fx.state, "a") {
            fx.controller
                .handle_deploy_result(&item, true, "", Some("c".into()), Some("10.0.0.1".into()))
                .await
                .unwrap();
        }

        let victim = fx.state.list_deployments("x").unwrap().remove(0);
        fx.state
            .update_deployment(&victim.id, |d| d.health = HealthState::Unhealthy)
            .unwrap();
        fx.controller.evaluate_health("x").await.unwrap();

        let rollout = fx.state.get_rollout(&rollout.id).unwrap().unwrap();
        assert_eq!(rollout.status, RolloutStatus::RolledBack);
        assert_eq!(rollout.current_stage, RolloutStage::HealthCheck);
    }

    #[tokio::test]
    async fn old_deployments_drain_before_completion() {
        let fx = fixture();
        seed_host(&fx.state, "a");
        seed_service(&fx.state, "x", false);

        // A previous generation is serving.
        let old = Deployment {
            id: "old-1".into(),
            service_id: "x".into(),
            host_id: "a".into(),
            container_id: Some("c-old".into()),
            ip_address: Some("10.10.0.4".into()),
            status: DeploymentStatus::Running,
            health: HealthState::Healthy,
            rollout_id: None,
            previous_deployment_id: None,
            failed_at: None,
            created_at: 1,
            updated_at: 1,
        };
        fx.state.put_deployment(&old).unwrap();

        let rollout = fx.controller.begin("x", &placements(&[("a", 1)])).await.unwrap();
        report_deploy_ok(&fx, "a", "10.10.0.5").await;
        report_all_healthy(&fx, "x").await;

        // Not complete yet: the old deployment is still draining.
        let mid = fx.state.get_rollout(&rollout.id).unwrap().unwrap();
        assert_eq!(mid.current_stage, RolloutStage::StoppingOld);
        assert_eq!(
            fx.state.get_deployment("old-1").unwrap().unwrap().status,
            DeploymentStatus::Stopping
        );

        // New deployment carries the lineage pointer.
        let new = fx
            .state
            .list_deployments("x")
            .unwrap()
            .into_iter()
            .find(|d| d.rollout_id.is_some())
            .unwrap();
        assert_eq!(new.previous_deployment_id.as_deref(), Some("old-1"));

        let stop = fx
            .state
            .list_work_for_host("a")
            .unwrap()
            .into_iter()
            .find(|w| w.work_type == WorkType::Stop)
            .unwrap();
        fx.controller
            .handle_stop_result(&rollout.id, &stop, true)
            .await
            .unwrap();

        let done = fx.state.get_rollout(&rollout.id).unwrap().unwrap();
        assert_eq!(done.status, RolloutStatus::Completed);
        // Old row swept on completion.
        assert!(fx.state.get_deployment("old-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn stateful_rollout_locks_host_and_writes_manifest() {
        let fx = fixture();
        seed_host(&fx.state, "a");
        seed_service(&fx.state, "y", true);

        fx.controller.begin("y", &placements(&[("a", 1)])).await.unwrap();
        let manifests: Vec<WorkItem> = fx
            .state
            .list_work_for_host("a")
            .unwrap()
            .into_iter()
            .filter(|w| w.work_type == WorkType::CreateManifest)
            .collect();
        assert_eq!(manifests.len(), 1);

        report_deploy_ok(&fx, "a", "10.10.0.5").await;
        report_all_healthy(&fx, "y").await;

        let service = fx.state.get_service("y").unwrap().unwrap();
        assert_eq!(service.locked_host_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let fx = fixture();
        seed_host(&fx.state, "a");
        seed_service(&fx.state, "x", false);

        let rollout = fx.controller.begin("x", &placements(&[("a", 1)])).await.unwrap();

        assert!(fx.controller.abort("x").await.unwrap());
        let aborted = fx.state.get_rollout(&rollout.id).unwrap().unwrap();
        assert_eq!(aborted.status, RolloutStatus::Failed);
        assert_eq!(aborted.current_stage, RolloutStage::Aborted);
        // The rollout's deployments are gone, pending work purged.
        assert!(fx.state.list_deployments("x").unwrap().is_empty());
        assert!(deploy_items(&fx.state, "a").is_empty());
        // Cleanup issued for the touched host.
        assert!(fx
            .state
            .list_work_for_host("a")
            .unwrap()
            .iter()
            .any(|w| w.work_type == WorkType::ForceCleanup));

        // Second abort: nothing in progress, no state change.
        assert!(!fx.controller.abort("x").await.unwrap());
    }

    #[tokio::test]
    async fn stuck_rollout_enters_failure_path() {
        let fx = fixture();
        seed_host(&fx.state, "a");
        seed_service(&fx.state, "x", false);

        let rollout = fx.controller.begin("x", &placements(&[("a", 1)])).await.unwrap();
        // Age the rollout past the bound.
        fx.state
            .update_rollout(&rollout.id, |r| r.created_at = 1_000)
            .unwrap();

        assert!(fx.controller.fail_if_stuck(&rollout.id).await.unwrap());
        let stuck = fx.state.get_rollout(&rollout.id).unwrap().unwrap();
        assert_eq!(stuck.status, RolloutStatus::RolledBack);
        assert_eq!(
            stuck.current_stage,
            RolloutStage::Stuck("deploying".to_string())
        );

        let d = fx.state.list_deployments("x").unwrap().remove(0);
        assert_eq!(d.status, DeploymentStatus::RolledBack);
        assert_eq!(d.failed_at.as_deref(), Some("stuck_deploying"));

        // Closed rollouts are not failed twice.
        assert!(!fx.controller.fail_if_stuck(&rollout.id).await.unwrap());
    }

    #[tokio::test]
    async fn late_deploy_result_after_abort_is_ignored() {
        let fx = fixture();
        seed_host(&fx.state, "a");
        seed_service(&fx.state, "x", false);

        fx.controller.begin("x", &placements(&[("a", 1)])).await.unwrap();
        let item = deploy_items(&fx.state, "a").pop().unwrap();
        fx.controller.abort("x").await.unwrap();

        // The agent may still answer the claimed item; nothing to drive.
        fx.controller
            .handle_deploy_result(&item, true, "", Some("c".into()), None)
            .await
            .unwrap();
        assert!(fx.state.list_deployments("x").unwrap().is_empty());
    }

    #[tokio::test]
    async fn queue_status_untouched_by_controller() {
        // The engine owns queue completion; the controller only drives state.
        let fx = fixture();
        seed_host(&fx.state, "a");
        seed_service(&fx.state, "x", false);

        fx.controller.begin("x", &placements(&[("a", 1)])).await.unwrap();
        let item = deploy_items(&fx.state, "a").pop().unwrap();
        assert_eq!(item.status, WorkStatus::Pending);
        fx.controller
            .handle_deploy_result(&item, true, "", Some("c".into()), None)
            .await
            .unwrap();
        assert_eq!(
            fx.queue.get(&item.id).unwrap().unwrap().status,
            WorkStatus::Pending
        );
    }
}
