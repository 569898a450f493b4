//! The orchestration engine.
//!
//! Composes the session layer, work queue, rollout and migration
//! controllers, placement, and config fan-out behind one trigger API, and
//! runs the background loops: the agent event loop, the dispatcher tick,
//! and the stale-host sweep. Everything that touches one service's state
//! goes through that service's keyed lock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use flotilla_fanout::Fanout;
use flotilla_migration::{MigrationController, MigrationOutcome};
use flotilla_placement::{SpreadPlacement, spread};
use flotilla_queue::{WireguardPeer, WorkPayload, WorkQueue};
use flotilla_rollout::RolloutController;
use flotilla_session::{AgentEvent, ContainerReport, SessionManager};
use flotilla_state::{
    Deployment, DeploymentStatus, Host, HostStatus, MigrationStatus, Rollout, Service, StateStore,
    WorkItem, WorkStatus, WorkType, new_id,
};
use flotilla_wire::proto::{self, control_frame::Body};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::gate::{BuildGate, NoBuilds};
use crate::locks::ServiceLocks;

/// Dispatcher tick period.
const DISPATCH_TICK: Duration = Duration::from_secs(1);

/// Stale-host sweep period.
const STALE_SWEEP_TICK: Duration = Duration::from_secs(30);

/// What a deploy trigger kicked off.
#[derive(Debug)]
pub enum DeployOutcome {
    RolloutStarted(Rollout),
    /// The stateful service's desired host differs from its lock; a
    /// migration was started instead.
    MigrationStarted { target_host_id: String },
}

/// The control plane's orchestration core.
pub struct Engine {
    state: StateStore,
    queue: WorkQueue,
    sessions: SessionManager,
    fanout: Arc<Fanout>,
    rollouts: RolloutController,
    migrations: MigrationController,
    locks: ServiceLocks,
    build_gate: Arc<dyn BuildGate>,
    config: EngineConfig,
    /// Hosts already reconverged this connection (cleared on disconnect).
    synced_hosts: StdMutex<HashSet<String>>,
}

impl Engine {
    /// Assemble the engine and its subsystems from one config.
    pub fn new(state: StateStore, sessions: SessionManager, config: EngineConfig) -> Arc<Self> {
        Self::with_build_gate(state, sessions, config, Arc::new(NoBuilds))
    }

    /// Assemble the engine with an externally provided build gate.
    pub fn with_build_gate(
        state: StateStore,
        sessions: SessionManager,
        config: EngineConfig,
        build_gate: Arc<dyn BuildGate>,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(state.clone())
            .with_work_timeout(config.work_timeout)
            .with_max_attempts(config.max_attempts);
        let fanout = Fanout::with_timeouts(
            state.clone(),
            sessions.clone(),
            config.dns_ack_timeout,
            config.caddy_ack_timeout,
        );
        let rollouts = RolloutController::new(state.clone(), queue.clone(), Arc::clone(&fanout))
            .with_rollout_timeout(config.rollout_timeout)
            .with_registry_host(config.registry_host.clone());
        let migrations = MigrationController::new(
            state.clone(),
            queue.clone(),
            config.backup_storage_path.clone(),
        );

        Arc::new(Self {
            state,
            queue,
            sessions,
            fanout,
            rollouts,
            migrations,
            locks: ServiceLocks::new(),
            build_gate,
            config,
            synced_hosts: StdMutex::new(HashSet::new()),
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    // ── Triggers (called by the external API layer) ────────────────

    /// Register a new host with its signing key. The session layer brings
    /// it online on first authenticated connect.
    pub fn register_host(
        &self,
        name: &str,
        wireguard_ip: &str,
        signing_public_key: &str,
        resources: flotilla_state::HostResources,
    ) -> EngineResult<Host> {
        let host = Host {
            id: new_id(),
            name: name.to_string(),
            wireguard_ip: wireguard_ip.to_string(),
            signing_public_key: signing_public_key.to_string(),
            status: HostStatus::Pending,
            last_heartbeat: 0,
            resources,
            is_proxy: false,
        };
        self.state.put_host(&host)?;
        info!(host_id = %host.id, name, "host registered");
        Ok(host)
    }

    /// Converge a service to its desired state.
    ///
    /// Starts a rollout, or a migration when a stateful service's desired
    /// host differs from its lock. Rejections are explicit and leave state
    /// untouched.
    pub async fn deploy_service(&self, service_id: &str) -> EngineResult<DeployOutcome> {
        let _guard = self.locks.lock(service_id).await;
        self.deploy_service_locked(service_id).await
    }

    async fn deploy_service_locked(&self, service_id: &str) -> EngineResult<DeployOutcome> {
        let service = self.require_service(service_id)?;

        if service.stateful {
            let target = self.stateful_target(&service)?;
            if let Some(locked) = &service.locked_host_id {
                if *locked != target {
                    self.migrations.start(service_id, &target)?;
                    return Ok(DeployOutcome::MigrationStarted {
                        target_host_id: target,
                    });
                }
            }
        }

        if service.migration_status.is_some() {
            return Err(EngineError::MigrationInProgress(service_id.to_string()));
        }
        if self.state.find_in_progress_rollout(service_id)?.is_some() {
            return Err(EngineError::DeploymentInProgress);
        }
        if self.build_gate.has_active_build(service_id) {
            return Err(EngineError::DeploymentInProgress);
        }
        let busy = self
            .state
            .list_deployments(service_id)?
            .iter()
            .any(|d| d.status.blocks_rollout());
        if busy {
            return Err(EngineError::DeploymentInProgress);
        }

        let placements = self.desired_placements(&service)?;
        let rollout = self.rollouts.begin(service_id, &placements).await?;
        Ok(DeployOutcome::RolloutStarted(rollout))
    }

    /// Cancel a service's in-progress rollout. Idempotent.
    pub async fn abort_rollout(&self, service_id: &str) -> EngineResult<bool> {
        let _guard = self.locks.lock(service_id).await;
        Ok(self.rollouts.abort(service_id).await?)
    }

    /// Move a stateful service to another host.
    pub async fn start_migration(&self, service_id: &str, target_host_id: &str) -> EngineResult<()> {
        let _guard = self.locks.lock(service_id).await;
        Ok(self.migrations.start(service_id, target_host_id)?)
    }

    /// Cancel an in-flight migration. Idempotent.
    pub async fn cancel_migration(&self, service_id: &str) -> EngineResult<bool> {
        let _guard = self.locks.lock(service_id).await;
        Ok(self.migrations.cancel(service_id)?)
    }

    /// Restart every running container of a service in place.
    pub async fn restart_service(&self, service_id: &str) -> EngineResult<u32> {
        let _guard = self.locks.lock(service_id).await;
        self.require_service(service_id)?;
        let mut restarted = 0;
        for deployment in self.state.list_deployments(service_id)? {
            if deployment.status == DeploymentStatus::Running {
                self.queue.enqueue(
                    &deployment.host_id,
                    &WorkPayload::Restart {
                        deployment_id: deployment.id.clone(),
                        service_id: service_id.to_string(),
                        container_id: deployment.container_id.clone(),
                    },
                )?;
                restarted += 1;
            }
        }
        Ok(restarted)
    }

    /// Remove a service: stop its containers, clean up its volumes, drop
    /// every owned row, and flush the derived tables.
    pub async fn remove_service(&self, service_id: &str) -> EngineResult<bool> {
        let _guard = self.locks.lock(service_id).await;
        let Some(_service) = self.state.get_service(service_id)? else {
            return Ok(false);
        };

        let volumes: Vec<String> = self
            .state
            .list_volumes(service_id)?
            .into_iter()
            .map(|v| v.name)
            .collect();

        let mut volume_hosts: Vec<String> = Vec::new();
        for deployment in self.state.list_deployments(service_id)? {
            if deployment.status.is_addressable() || deployment.status.blocks_rollout() {
                self.queue.enqueue(
                    &deployment.host_id,
                    &WorkPayload::Stop {
                        deployment_id: deployment.id.clone(),
                        service_id: service_id.to_string(),
                        container_id: deployment.container_id.clone(),
                        rollout_id: None,
                    },
                )?;
            }
            if !volumes.is_empty() && !volume_hosts.contains(&deployment.host_id) {
                volume_hosts.push(deployment.host_id.clone());
            }
        }
        for host_id in volume_hosts {
            self.queue.enqueue(
                &host_id,
                &WorkPayload::CleanupVolumes {
                    service_id: service_id.to_string(),
                    keep: vec![],
                },
            )?;
        }

        self.state.delete_service(service_id)?;
        self.fanout.push_all().await?;
        Ok(true)
    }

    // ── Event loop ─────────────────────────────────────────────────

    /// Consume agent events until shutdown.
    ///
    /// Config acks are routed straight into the fan-out's ack registry so
    /// they can resolve a push the worker itself is awaiting; everything
    /// else is handled in arrival order by a single worker.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<AgentEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (work_tx, mut work_rx) = mpsc::channel::<AgentEvent>(256);

        let worker = {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(event) = work_rx.recv().await {
                    if let Err(e) = engine.handle_event(event).await {
                        error!(error = %e, "event handling failed");
                    }
                }
            })
        };

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(AgentEvent::ConfigAck { host_id, kind, success, message }) => {
                            self.fanout.record_ack(&host_id, kind, success, &message);
                        }
                        Some(event) => {
                            if work_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        drop(work_tx);
        let _ = worker.await;
        info!("event loop stopped");
    }

    /// Handle one non-ack agent event.
    pub async fn handle_event(&self, event: AgentEvent) -> EngineResult<()> {
        match event {
            AgentEvent::StatusUpdate {
                host_id,
                containers,
                ..
            } => self.handle_status_update(&host_id, containers).await,
            AgentEvent::WorkComplete {
                host_id,
                work_id,
                success,
                message,
                container_id,
                ip_address,
                checksum,
            } => {
                self.handle_work_complete(
                    &host_id,
                    &work_id,
                    success,
                    &message,
                    container_id,
                    ip_address,
                    checksum,
                )
                .await
            }
            AgentEvent::ConfigAck {
                host_id,
                kind,
                success,
                message,
            } => {
                // Normally short-circuited by the demux loop.
                self.fanout.record_ack(&host_id, kind, success, &message);
                Ok(())
            }
            AgentEvent::Heartbeat { .. } => Ok(()),
            AgentEvent::Disconnected { host_id } => {
                self.synced_hosts.lock().expect("synced hosts").remove(&host_id);
                Ok(())
            }
        }
    }

    async fn handle_status_update(
        &self,
        host_id: &str,
        containers: Vec<ContainerReport>,
    ) -> EngineResult<()> {
        self.sync_host_once(host_id)?;

        let mut affected_services = Vec::new();
        let mut unknown_containers = Vec::new();

        for report in containers {
            let deployment = if report.deployment_id.is_empty() {
                None
            } else {
                self.state.get_deployment(&report.deployment_id)?
            };
            match deployment {
                Some(d) if d.host_id == host_id => {
                    self.state.update_deployment(&d.id, |d| {
                        if !report.container_id.is_empty() {
                            d.container_id = Some(report.container_id.clone());
                        }
                        if let Some(ip) = &report.ip_address {
                            d.ip_address = Some(ip.clone());
                        }
                        d.health = report.health;
                    })?;
                    if !affected_services.contains(&d.service_id) {
                        affected_services.push(d.service_id.clone());
                    }
                }
                _ => {
                    if report.state == "running" && !report.container_id.is_empty() {
                        unknown_containers.push(report.container_id.clone());
                    }
                }
            }
        }

        if !unknown_containers.is_empty() {
            self.reconcile_unknown_containers(host_id, &unknown_containers)?;
        }

        for service_id in affected_services {
            let _guard = self.locks.lock(&service_id).await;
            self.rollouts.evaluate_health(&service_id).await?;
        }
        Ok(())
    }

    async fn handle_work_complete(
        &self,
        host_id: &str,
        work_id: &str,
        success: bool,
        message: &str,
        container_id: Option<String>,
        ip_address: Option<String>,
        checksum: Option<String>,
    ) -> EngineResult<()> {
        let Some(item) = self.queue.get(work_id)? else {
            warn!(host_id, work_id, "result for unknown work item");
            return Ok(());
        };
        if item.host_id != host_id {
            warn!(host_id, work_id, "result from wrong host ignored");
            return Ok(());
        }
        if item.status != WorkStatus::Processing {
            debug!(work_id, "late result for non-processing item");
            return Ok(());
        }

        match item.work_type {
            WorkType::Deploy => {
                // A definitive agent verdict: no retry, the rollout decides.
                if success {
                    self.queue.complete(work_id)?;
                } else {
                    self.queue.fail(work_id)?;
                }
                if let Some(service_id) = item.service_id.clone() {
                    let _guard = self.locks.lock(&service_id).await;
                    self.rollouts
                        .handle_deploy_result(&item, success, message, container_id, ip_address)
                        .await?;
                }
            }
            WorkType::Stop => {
                if success {
                    self.queue.complete(work_id)?;
                } else {
                    self.queue.fail(work_id)?;
                }
                self.route_stop_result(&item, success).await?;
            }
            WorkType::BackupVolume => {
                if success {
                    self.queue.complete(work_id)?;
                } else {
                    self.queue.fail(work_id)?;
                }
                if let (Some(service_id), WorkPayload::BackupVolume { backup_id, .. }) =
                    (item.service_id.clone(), WorkPayload::decode(&item.payload)?)
                {
                    let _guard = self.locks.lock(&service_id).await;
                    self.migrations
                        .on_backup_result(&backup_id, success, checksum)?;
                }
            }
            WorkType::RestoreVolume => {
                if success {
                    self.queue.complete(work_id)?;
                } else {
                    self.queue.fail(work_id)?;
                }
                if let (Some(service_id), WorkPayload::RestoreVolume { backup_id, .. }) =
                    (item.service_id.clone(), WorkPayload::decode(&item.payload)?)
                {
                    let _guard = self.locks.lock(&service_id).await;
                    let outcome = self.migrations.on_restore_result(&backup_id, success)?;
                    if let MigrationOutcome::ReadyToStart { service_id } = outcome {
                        // Still under the service lock: start on the target.
                        let service = self.require_service(&service_id)?;
                        let placements = self.desired_placements(&service)?;
                        self.rollouts.begin(&service_id, &placements).await?;
                    }
                }
            }
            _ => {
                // Generic imperative work: bounded retries on failure.
                if success {
                    self.queue.complete(work_id)?;
                } else {
                    self.queue.fail_with_retry(work_id)?;
                }
            }
        }
        Ok(())
    }

    async fn route_stop_result(&self, item: &WorkItem, success: bool) -> EngineResult<()> {
        let payload = WorkPayload::decode(&item.payload)?;
        let WorkPayload::Stop {
            deployment_id,
            rollout_id,
            ..
        } = payload
        else {
            return Ok(());
        };

        // A stop draining an old deployment for a rollout.
        if let Some(rollout_id) = rollout_id {
            if let Some(rollout) = self.state.get_rollout(&rollout_id)? {
                let _guard = self.locks.lock(&rollout.service_id).await;
                self.rollouts
                    .handle_stop_result(&rollout_id, item, success)
                    .await?;
            }
            return Ok(());
        }

        // A stop issued by a migration's stopping stage.
        let service_id = match self.state.get_deployment(&deployment_id)? {
            Some(d) => Some(d.service_id),
            None => item.service_id.clone(),
        };
        if let Some(service_id) = service_id {
            let _guard = self.locks.lock(&service_id).await;
            if let Some(service) = self.state.get_service(&service_id)? {
                if service.migration_status == Some(MigrationStatus::Stopping) && success {
                    self.migrations.on_source_stopped(&service_id)?;
                    return Ok(());
                }
            }
            // A plain stop (service removal, rollback cleanup).
            if success {
                if self.state.get_deployment(&deployment_id)?.is_some() {
                    self.state.update_deployment(&deployment_id, |d| {
                        if d.status == DeploymentStatus::Stopping {
                            d.status = DeploymentStatus::Stopped;
                        }
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Queue reconvergence work for a host once per connection: overlay
    /// peers, then the derived DNS and routing tables.
    fn sync_host_once(&self, host_id: &str) -> EngineResult<()> {
        {
            let mut synced = self.synced_hosts.lock().expect("synced hosts");
            if !synced.insert(host_id.to_string()) {
                return Ok(());
            }
        }

        let peers: Vec<WireguardPeer> = self
            .state
            .list_hosts()?
            .into_iter()
            .filter(|h| h.id != host_id)
            .map(|h| WireguardPeer {
                host_id: h.id,
                wireguard_ip: h.wireguard_ip,
            })
            .collect();
        self.queue
            .enqueue(host_id, &WorkPayload::UpdateWireguard { peers })?;
        self.queue.enqueue(host_id, &WorkPayload::SyncDns {})?;
        self.queue.enqueue(host_id, &WorkPayload::SyncCaddy {})?;
        debug!(host_id, "reconvergence work queued");
        Ok(())
    }

    /// Agents may report containers the control plane no longer tracks
    /// (aborted rollouts, crashed cleanups). Collect them best-effort.
    fn reconcile_unknown_containers(
        &self,
        host_id: &str,
        unknown: &[String],
    ) -> EngineResult<()> {
        let already_queued = self
            .state
            .list_work_for_host(host_id)?
            .iter()
            .any(|w| {
                w.work_type == WorkType::ForceCleanup
                    && matches!(w.status, WorkStatus::Pending | WorkStatus::Processing)
            });
        if already_queued {
            return Ok(());
        }

        let keep: Vec<String> = self
            .state
            .deployments_for_host(host_id)?
            .into_iter()
            .filter_map(|d| d.container_id)
            .collect();
        warn!(host_id, unknown = unknown.len(), "unknown containers; cleanup queued");
        self.queue.enqueue(
            host_id,
            &WorkPayload::ForceCleanup {
                keep_container_ids: keep,
            },
        )?;
        Ok(())
    }

    // ── Dispatcher ─────────────────────────────────────────────────

    /// Run the dispatcher tick loop until shutdown.
    pub async fn run_dispatcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(DISPATCH_TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.dispatch_tick().await {
                        error!(error = %e, "dispatch tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("dispatcher stopped");
    }

    /// One dispatcher tick: reclaim stuck work, sweep stuck rollouts, then
    /// push one item to every idle connected host.
    pub async fn dispatch_tick(&self) -> EngineResult<()> {
        // 1. Stuck work items; exhausted deploys drive their rollout into
        //    rollback.
        for item in self.queue.reclaim_stuck()? {
            if item.work_type == WorkType::Deploy {
                if let Some(service_id) = item.service_id.clone() {
                    let _guard = self.locks.lock(&service_id).await;
                    self.rollouts.handle_stuck_deploy(&item).await?;
                }
            }
        }

        // 2. Stuck rollouts.
        for rollout in self.state.list_in_progress_rollouts()? {
            let _guard = self.locks.lock(&rollout.service_id).await;
            self.rollouts.fail_if_stuck(&rollout.id).await?;
        }

        // 3. One item per idle connected host.
        for host_id in self.sessions.connected_hosts() {
            if self.queue.processing(&host_id)?.is_some() {
                continue;
            }
            let Some(item) = self.queue.claim_next(&host_id)? else {
                continue;
            };
            let frame = Body::Work(proto::Work {
                id: item.id.clone(),
                work_type: item.work_type.as_str().to_string(),
                payload: item.payload.clone(),
            });
            match self.sessions.send(&host_id, frame) {
                flotilla_session::SendOutcome::Sent => {
                    debug!(host_id = %host_id, work_id = %item.id, "work dispatched");
                }
                flotilla_session::SendOutcome::Dropped => {
                    // Session raced away; another tick retries.
                    self.queue.revert_to_pending(&item.id)?;
                }
            }
        }
        Ok(())
    }

    // ── Stale hosts & recovery ─────────────────────────────────────

    /// Run the stale-host sweep loop until shutdown.
    pub async fn run_stale_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(STALE_SWEEP_TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.stale_sweep().await {
                        error!(error = %e, "stale-host sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("stale-host sweeper stopped");
    }

    /// Mark hosts offline past the heartbeat threshold and reschedule the
    /// auto-placed stateless services that lived on them.
    pub async fn stale_sweep(&self) -> EngineResult<()> {
        let flipped = self.state.mark_stale_hosts(
            flotilla_state::epoch_ms(),
            self.config.stale_threshold.as_millis() as u64,
        )?;
        if flipped.is_empty() {
            return Ok(());
        }
        for host in &flipped {
            warn!(host_id = %host.id, "host went stale; recovering its services");
        }
        self.recover_from_offline_hosts().await
    }

    /// Reschedule every auto-placed stateless service with deployments on
    /// offline hosts. Stateful services wait for an operator migration.
    pub async fn recover_from_offline_hosts(&self) -> EngineResult<()> {
        let offline: HashSet<String> = self
            .state
            .list_hosts()?
            .into_iter()
            .filter(|h| h.status == HostStatus::Offline)
            .map(|h| h.id)
            .collect();
        if offline.is_empty() {
            return Ok(());
        }

        for service in self.state.list_services()? {
            if !service.auto_place || service.stateful {
                continue;
            }
            let needs_recovery = self
                .state
                .list_deployments(&service.id)?
                .iter()
                .any(|d| offline.contains(&d.host_id) && d.status.is_addressable());
            if !needs_recovery {
                continue;
            }

            info!(service_id = %service.id, "rescheduling off offline hosts");
            match self.deploy_service(&service.id).await {
                Ok(_) => {}
                Err(EngineError::DeploymentInProgress) => {
                    debug!(service_id = %service.id, "recovery deferred; rollout in progress");
                }
                Err(e) => warn!(service_id = %service.id, error = %e, "recovery failed"),
            }
        }
        Ok(())
    }

    // ── Placement ──────────────────────────────────────────────────

    /// Desired placements for a service: its explicit rows, or a spread
    /// over online hosts when auto-placed (the rows are rewritten so the
    /// decision is inspectable).
    fn desired_placements(&self, service: &Service) -> EngineResult<Vec<SpreadPlacement>> {
        if service.auto_place {
            let online: Vec<String> = self
                .state
                .list_hosts()?
                .into_iter()
                .filter(|h| h.status == HostStatus::Online)
                .map(|h| h.id)
                .collect();
            let placements = spread(service.replicas, &online, &HashSet::new())
                .map_err(|_| EngineError::NoHealthyHosts)?;
            let rows: Vec<(String, u32)> = placements
                .iter()
                .map(|p| (p.host_id.clone(), p.count))
                .collect();
            self.state.replace_replicas(&service.id, &rows)?;
            return Ok(placements);
        }

        let rows = self.state.list_replicas(&service.id)?;
        let placements: Vec<SpreadPlacement> = rows
            .into_iter()
            .filter(|r| r.count > 0)
            .map(|r| SpreadPlacement {
                host_id: r.host_id,
                count: r.count,
            })
            .collect();
        if service.stateful {
            let total: u32 = placements.iter().map(|p| p.count).sum();
            if total != 1 || placements.len() != 1 {
                return Err(EngineError::InvalidStatefulPlacement(service.id.clone()));
            }
        }
        Ok(placements)
    }

    /// The single desired host of a stateful service.
    fn stateful_target(&self, service: &Service) -> EngineResult<String> {
        let rows = self.state.list_replicas(&service.id)?;
        let active: Vec<_> = rows.into_iter().filter(|r| r.count > 0).collect();
        if active.len() != 1 || active[0].count != 1 {
            return Err(EngineError::InvalidStatefulPlacement(service.id.clone()));
        }
        Ok(active[0].host_id.clone())
    }

    fn require_service(&self, service_id: &str) -> EngineResult<Service> {
        self.state
            .get_service(service_id)?
            .ok_or_else(|| EngineError::ServiceNotFound(service_id.to_string()))
    }

    /// Deployments the control plane still tracks for a host (used by the
    /// tests and the external status API).
    pub fn tracked_deployments(&self, host_id: &str) -> EngineResult<Vec<Deployment>> {
        Ok(self.state.deployments_for_host(host_id)?)
    }
}
