//! StateStore — redb-backed desired-state persistence.
//!
//! Typed CRUD over the entities in `types`, plus the compound operations
//! the controllers rely on. The contract exposed to the rest of the core:
//! every mutation that touches more than one row runs in a single write
//! transaction. Cross-entity invariants (single in-progress rollout,
//! unique domains, stateful placement) are checked inside those
//! transactions. Supports on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

/// Result of completing a rollout; callers re-fan-out from this.
#[derive(Debug)]
pub struct CompletedRollout {
    pub service: Service,
    pub promoted: Vec<Deployment>,
    pub removed: Vec<Deployment>,
}

/// Result of aborting a rollout.
#[derive(Debug)]
pub struct AbortedRollout {
    /// Hosts that had deployments for this rollout (force_cleanup targets).
    pub hosts: Vec<HostId>,
    pub deleted: Vec<Deployment>,
    /// Old deployments reverted from `stopping` back to `running`.
    pub reverted: Vec<DeploymentId>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(REPLICAS).map_err(map_err!(Table))?;
        txn.open_table(PORTS).map_err(map_err!(Table))?;
        txn.open_table(VOLUMES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
        txn.open_table(BACKUPS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert or update a host.
    pub fn put_host(&self, host: &Host) -> StateResult<()> {
        self.put_row(HOSTS, &host.id, host)
    }

    /// Get a host by ID.
    pub fn get_host(&self, host_id: &str) -> StateResult<Option<Host>> {
        self.get_row(HOSTS, host_id)
    }

    /// List all hosts.
    pub fn list_hosts(&self) -> StateResult<Vec<Host>> {
        self.scan(HOSTS, None)
    }

    /// Delete a host by ID. Returns true if it existed.
    pub fn delete_host(&self, host_id: &str) -> StateResult<bool> {
        self.delete_row(HOSTS, host_id)
    }

    /// Refresh a host's liveness after an inbound agent message.
    ///
    /// Any inbound message counts as a heartbeat; a pending or offline host
    /// comes online here.
    pub fn touch_host(&self, host_id: &str, now_ms: u64, is_proxy: Option<bool>) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let mut host: Host = get_in(&table, host_id)?
                .ok_or_else(|| StateError::NotFound(format!("host {host_id}")))?;
            host.last_heartbeat = now_ms;
            if matches!(host.status, HostStatus::Pending | HostStatus::Offline) {
                info!(%host_id, "host came online");
                host.status = HostStatus::Online;
            }
            if let Some(proxy) = is_proxy {
                host.is_proxy = proxy;
            }
            put_in(&mut table, host_id, &host)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Transition every online host whose heartbeat is older than the
    /// threshold to offline. Returns the hosts that flipped.
    pub fn mark_stale_hosts(&self, now_ms: u64, threshold_ms: u64) -> StateResult<Vec<Host>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut flipped = Vec::new();
        {
            let mut table = txn.open_table(HOSTS).map_err(map_err!(Table))?;
            let hosts: Vec<Host> = scan_in(&table, None)?;
            for mut host in hosts {
                if host.status == HostStatus::Online
                    && now_ms.saturating_sub(host.last_heartbeat) > threshold_ms
                {
                    host.status = HostStatus::Offline;
                    put_in(&mut table, &host.id.clone(), &host)?;
                    warn!(host_id = %host.id, "host marked offline (stale heartbeat)");
                    flipped.push(host);
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(flipped)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service.
    pub fn put_service(&self, service: &Service) -> StateResult<()> {
        self.put_row(SERVICES, &service.id, service)
    }

    /// Get a service by ID.
    pub fn get_service(&self, service_id: &str) -> StateResult<Option<Service>> {
        self.get_row(SERVICES, service_id)
    }

    /// List all services.
    pub fn list_services(&self) -> StateResult<Vec<Service>> {
        self.scan(SERVICES, None)
    }

    /// Read-modify-write a service in one transaction.
    pub fn update_service<F>(&self, service_id: &str, f: F) -> StateResult<Service>
    where
        F: FnOnce(&mut Service),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let mut service: Service = get_in(&table, service_id)?
                .ok_or_else(|| StateError::NotFound(format!("service {service_id}")))?;
            f(&mut service);
            put_in(&mut table, service_id, &service)?;
            updated = service;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Destroy a service and everything it owns: replicas, ports, volumes,
    /// and deployments, in one transaction. Returns true if it existed.
    pub fn delete_service(&self, service_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut services = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            existed = services.remove(service_id).map_err(map_err!(Write))?.is_some();

            let prefix = format!("{service_id}:");
            for def in [REPLICAS, PORTS, VOLUMES] {
                let mut table = txn.open_table(def).map_err(map_err!(Table))?;
                let keys = keys_with_prefix(&table, &prefix)?;
                for key in &keys {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                }
            }

            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let owned: Vec<Deployment> = scan_in(&deployments, None)?;
            for d in owned.iter().filter(|d| d.service_id == service_id) {
                deployments.remove(d.id.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if existed {
            info!(%service_id, "service deleted (cascade)");
        }
        Ok(existed)
    }

    // ── Replicas ───────────────────────────────────────────────────

    /// Insert or update an explicit placement row.
    pub fn upsert_replica(&self, replica: &ServiceReplica) -> StateResult<()> {
        self.put_row(REPLICAS, &replica.table_key(), replica)
    }

    /// List the placement rows for a service.
    pub fn list_replicas(&self, service_id: &str) -> StateResult<Vec<ServiceReplica>> {
        self.scan(REPLICAS, Some(&format!("{service_id}:")))
    }

    /// Replace every placement row for a service in one transaction.
    pub fn replace_replicas(
        &self,
        service_id: &str,
        placements: &[(HostId, u32)],
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REPLICAS).map_err(map_err!(Table))?;
            let prefix = format!("{service_id}:");
            let stale = keys_with_prefix(&table, &prefix)?;
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            for (host_id, count) in placements {
                let row = ServiceReplica {
                    service_id: service_id.to_string(),
                    host_id: host_id.clone(),
                    count: *count,
                };
                put_in(&mut table, &row.table_key(), &row)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%service_id, placements = placements.len(), "replicas replaced");
        Ok(())
    }

    // ── Ports ──────────────────────────────────────────────────────

    /// Insert or update a port declaration.
    ///
    /// Enforces global domain uniqueness and, for public tcp/udp ports,
    /// external-port uniqueness, inside the transaction.
    pub fn upsert_port(&self, port: &ServicePort) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PORTS).map_err(map_err!(Table))?;
            let all: Vec<ServicePort> = scan_in(&table, None)?;
            for other in all.iter().filter(|p| p.service_id != port.service_id || p.port != port.port) {
                if let (Some(a), Some(b)) = (&port.domain, &other.domain) {
                    if a == b {
                        return Err(StateError::DomainTaken {
                            domain: a.clone(),
                            service_id: other.service_id.clone(),
                        });
                    }
                }
                if port.is_public
                    && other.is_public
                    && port.protocol != PortProtocol::Http
                    && other.protocol != PortProtocol::Http
                {
                    if let (Some(a), Some(b)) = (port.external_port, other.external_port) {
                        if a == b {
                            return Err(StateError::ExternalPortTaken {
                                port: a,
                                service_id: other.service_id.clone(),
                            });
                        }
                    }
                }
            }
            put_in(&mut table, &port.table_key(), port)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List a service's port declarations.
    pub fn list_ports(&self, service_id: &str) -> StateResult<Vec<ServicePort>> {
        self.scan(PORTS, Some(&format!("{service_id}:")))
    }

    /// List every port declaration across services.
    pub fn list_all_ports(&self) -> StateResult<Vec<ServicePort>> {
        self.scan(PORTS, None)
    }

    // ── Volumes ────────────────────────────────────────────────────

    /// Insert or update a volume declaration.
    ///
    /// A service with any volume is stateful and cannot auto-place; the
    /// service row is adjusted in the same transaction.
    pub fn upsert_volume(&self, volume: &ServiceVolume) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut volumes = txn.open_table(VOLUMES).map_err(map_err!(Table))?;
            put_in(&mut volumes, &volume.table_key(), volume)?;

            let mut services = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let mut service: Service = get_in(&services, &volume.service_id)?
                .ok_or_else(|| StateError::NotFound(format!("service {}", volume.service_id)))?;
            if !service.stateful || service.auto_place {
                service.stateful = true;
                service.auto_place = false;
                put_in(&mut services, &volume.service_id.clone(), &service)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List a service's volume declarations.
    pub fn list_volumes(&self, service_id: &str) -> StateResult<Vec<ServiceVolume>> {
        self.scan(VOLUMES, Some(&format!("{service_id}:")))
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put_row(DEPLOYMENTS, &deployment.id, deployment)
    }

    /// Get a deployment by ID.
    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        self.get_row(DEPLOYMENTS, id)
    }

    /// List deployments belonging to a service.
    pub fn list_deployments(&self, service_id: &str) -> StateResult<Vec<Deployment>> {
        let all: Vec<Deployment> = self.scan(DEPLOYMENTS, None)?;
        Ok(all.into_iter().filter(|d| d.service_id == service_id).collect())
    }

    /// List deployments placed on a host.
    pub fn deployments_for_host(&self, host_id: &str) -> StateResult<Vec<Deployment>> {
        let all: Vec<Deployment> = self.scan(DEPLOYMENTS, None)?;
        Ok(all.into_iter().filter(|d| d.host_id == host_id).collect())
    }

    /// List every deployment.
    pub fn list_all_deployments(&self) -> StateResult<Vec<Deployment>> {
        self.scan(DEPLOYMENTS, None)
    }

    /// Read-modify-write a deployment in one transaction.
    pub fn update_deployment<F>(&self, id: &str, f: F) -> StateResult<Deployment>
    where
        F: FnOnce(&mut Deployment),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut deployment: Deployment = get_in(&table, id)?
                .ok_or_else(|| StateError::NotFound(format!("deployment {id}")))?;
            f(&mut deployment);
            deployment.updated_at = epoch_ms();
            put_in(&mut table, id, &deployment)?;
            updated = deployment;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Delete a deployment. Returns true if it existed.
    pub fn delete_deployment(&self, id: &str) -> StateResult<bool> {
        self.delete_row(DEPLOYMENTS, id)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Get a rollout by ID.
    pub fn get_rollout(&self, id: &str) -> StateResult<Option<Rollout>> {
        self.get_row(ROLLOUTS, id)
    }

    /// Find the in-progress rollout for a service, if any.
    pub fn find_in_progress_rollout(&self, service_id: &str) -> StateResult<Option<Rollout>> {
        let all: Vec<Rollout> = self.scan(ROLLOUTS, None)?;
        Ok(all
            .into_iter()
            .find(|r| r.service_id == service_id && r.status == RolloutStatus::InProgress))
    }

    /// List every in-progress rollout.
    pub fn list_in_progress_rollouts(&self) -> StateResult<Vec<Rollout>> {
        let all: Vec<Rollout> = self.scan(ROLLOUTS, None)?;
        Ok(all
            .into_iter()
            .filter(|r| r.status == RolloutStatus::InProgress)
            .collect())
    }

    /// Read-modify-write a rollout in one transaction.
    pub fn update_rollout<F>(&self, id: &str, f: F) -> StateResult<Rollout>
    where
        F: FnOnce(&mut Rollout),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_in(&table, id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout {id}")))?;
            f(&mut rollout);
            put_in(&mut table, id, &rollout)?;
            updated = rollout;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Create a rollout together with its new deployments, atomically.
    ///
    /// Rejects if the service already has an in-progress rollout or an
    /// in-flight migration.
    pub fn create_rollout(&self, rollout: &Rollout, deployments: &[Deployment]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let existing: Vec<Rollout> = scan_in(&rollouts, None)?;
            if existing
                .iter()
                .any(|r| r.service_id == rollout.service_id && r.status == RolloutStatus::InProgress)
            {
                return Err(StateError::RolloutInProgress(rollout.service_id.clone()));
            }

            let services = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let service: Service = get_in(&services, &rollout.service_id)?
                .ok_or_else(|| StateError::NotFound(format!("service {}", rollout.service_id)))?;
            if service.migration_status.is_some() {
                return Err(StateError::MigrationInProgress(rollout.service_id.clone()));
            }

            put_in(&mut rollouts, &rollout.id, rollout)?;

            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            for d in deployments {
                put_in(&mut table, &d.id, d)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            rollout_id = %rollout.id,
            service_id = %rollout.service_id,
            deployments = deployments.len(),
            "rollout created"
        );
        Ok(())
    }

    /// Move a rollout to the given stage and every one of its deployments
    /// currently in `from` to `to`, in one transaction.
    pub fn advance_rollout(
        &self,
        rollout_id: &str,
        stage: RolloutStage,
        from: DeploymentStatus,
        to: DeploymentStatus,
    ) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut advanced = Vec::new();
        {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_in(&rollouts, rollout_id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;
            rollout.current_stage = stage;
            put_in(&mut rollouts, rollout_id, &rollout)?;

            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let all: Vec<Deployment> = scan_in(&deployments, None)?;
            let now = epoch_ms();
            for mut d in all {
                if d.rollout_id.as_deref() == Some(rollout_id) && d.status == from {
                    d.status = to;
                    d.updated_at = now;
                    put_in(&mut deployments, &d.id.clone(), &d)?;
                    advanced.push(d);
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(advanced)
    }

    /// Finish a rollout: promote its deployments to running, mark the
    /// rollout completed, bind the stateful lock host, delete the old
    /// deployment rows, and serialize the deployed-config snapshot. One
    /// transaction.
    pub fn complete_rollout(
        &self,
        rollout_id: &str,
        now_ms: u64,
        snapshot: serde_json::Value,
    ) -> StateResult<CompletedRollout> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_in(&rollouts, rollout_id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;
            rollout.status = RolloutStatus::Completed;
            rollout.current_stage = RolloutStage::Completed;
            rollout.completed_at = Some(now_ms);
            put_in(&mut rollouts, rollout_id, &rollout)?;

            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let all: Vec<Deployment> = scan_in(&deployments, None)?;
            let mut promoted = Vec::new();
            let mut removed = Vec::new();
            for mut d in all {
                if d.service_id != rollout.service_id {
                    continue;
                }
                if d.rollout_id.as_deref() == Some(rollout_id) {
                    d.status = DeploymentStatus::Running;
                    d.updated_at = now_ms;
                    put_in(&mut deployments, &d.id.clone(), &d)?;
                    promoted.push(d);
                } else {
                    deployments.remove(d.id.as_str()).map_err(map_err!(Write))?;
                    removed.push(d);
                }
            }

            let mut services = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let mut service: Service = get_in(&services, &rollout.service_id)?
                .ok_or_else(|| StateError::NotFound(format!("service {}", rollout.service_id)))?;
            if service.stateful && service.locked_host_id.is_none() {
                if let Some(d) = promoted.first() {
                    service.locked_host_id = Some(d.host_id.clone());
                }
            }
            service.deployed_config_snapshot = Some(snapshot);
            put_in(&mut services, &rollout.service_id.clone(), &service)?;

            outcome = CompletedRollout {
                service,
                promoted,
                removed,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%rollout_id, "rollout completed");
        Ok(outcome)
    }

    /// Roll back a rollout: its deployments not yet running/stopped become
    /// `rolled_back` tagged with `failed_tag`; the rollout itself is closed
    /// at `stage`. Returns the deployments that were rolled back (the caller
    /// enqueues their stop items).
    pub fn rollback_rollout(
        &self,
        rollout_id: &str,
        failed_tag: &str,
        stage: RolloutStage,
        now_ms: u64,
        operator_initiated: bool,
    ) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut rolled_back = Vec::new();
        {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_in(&rollouts, rollout_id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;
            rollout.status = if operator_initiated {
                RolloutStatus::Failed
            } else {
                RolloutStatus::RolledBack
            };
            rollout.current_stage = stage;
            rollout.completed_at = Some(now_ms);
            put_in(&mut rollouts, rollout_id, &rollout)?;

            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let all: Vec<Deployment> = scan_in(&deployments, None)?;
            for mut d in all {
                if d.rollout_id.as_deref() == Some(rollout_id)
                    && !matches!(d.status, DeploymentStatus::Running | DeploymentStatus::Stopped)
                {
                    d.status = DeploymentStatus::RolledBack;
                    d.failed_at = Some(failed_tag.to_string());
                    d.updated_at = now_ms;
                    put_in(&mut deployments, &d.id.clone(), &d)?;
                    rolled_back.push(d);
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        warn!(%rollout_id, failed = failed_tag, "rollout rolled back");
        Ok(rolled_back)
    }

    /// Abort a rollout: mark it failed/aborted, revert draining old
    /// deployments to running, delete the rollout's own deployments. One
    /// transaction. Idempotent at the caller level (a closed rollout is
    /// never passed in twice).
    pub fn abort_rollout(&self, rollout_id: &str, now_ms: u64) -> StateResult<AbortedRollout> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut outcome = AbortedRollout {
            hosts: Vec::new(),
            deleted: Vec::new(),
            reverted: Vec::new(),
        };
        {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let mut rollout: Rollout = get_in(&rollouts, rollout_id)?
                .ok_or_else(|| StateError::NotFound(format!("rollout {rollout_id}")))?;
            rollout.status = RolloutStatus::Failed;
            rollout.current_stage = RolloutStage::Aborted;
            rollout.completed_at = Some(now_ms);
            put_in(&mut rollouts, rollout_id, &rollout)?;

            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let all: Vec<Deployment> = scan_in(&deployments, None)?;
            for mut d in all {
                if d.service_id != rollout.service_id {
                    continue;
                }
                if d.rollout_id.as_deref() == Some(rollout_id) {
                    if !outcome.hosts.contains(&d.host_id) {
                        outcome.hosts.push(d.host_id.clone());
                    }
                    deployments.remove(d.id.as_str()).map_err(map_err!(Write))?;
                    outcome.deleted.push(d);
                } else if d.status == DeploymentStatus::Stopping {
                    d.status = DeploymentStatus::Running;
                    d.updated_at = now_ms;
                    put_in(&mut deployments, &d.id.clone(), &d)?;
                    outcome.reverted.push(d.id);
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(%rollout_id, "rollout aborted");
        Ok(outcome)
    }

    // ── Work items ─────────────────────────────────────────────────

    /// Append a work item to a host's queue. Assigns the FIFO sequence in
    /// the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_work(
        &self,
        host_id: &str,
        work_type: WorkType,
        payload: Vec<u8>,
        service_id: Option<ServiceId>,
        deployment_id: Option<DeploymentId>,
        now_ms: u64,
    ) -> StateResult<WorkItem> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let item;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let seq: u64 = get_in(&meta, "work_seq")?.unwrap_or(0) + 1;
            put_in(&mut meta, "work_seq", &seq)?;

            item = WorkItem {
                id: WorkItem::key_for(host_id, seq),
                host_id: host_id.to_string(),
                seq,
                work_type,
                payload,
                status: WorkStatus::Pending,
                attempts: 0,
                service_id,
                deployment_id,
                created_at: now_ms,
                started_at: None,
            };
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
            put_in(&mut table, &item.id, &item)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %item.id, work_type = work_type.as_str(), "work enqueued");
        Ok(item)
    }

    /// Get a work item by ID.
    pub fn get_work(&self, id: &str) -> StateResult<Option<WorkItem>> {
        self.get_row(WORK_ITEMS, id)
    }

    /// List all work items for a host, FIFO order.
    pub fn list_work_for_host(&self, host_id: &str) -> StateResult<Vec<WorkItem>> {
        self.scan(WORK_ITEMS, Some(&format!("{host_id}:")))
    }

    /// The item currently `processing` on a host, if any.
    pub fn processing_work(&self, host_id: &str) -> StateResult<Option<WorkItem>> {
        Ok(self
            .list_work_for_host(host_id)?
            .into_iter()
            .find(|w| w.status == WorkStatus::Processing))
    }

    /// Claim the oldest pending item for a host: pending → processing with
    /// `started_at` set. Returns `None` when the queue is empty; errors with
    /// `HostBusy` when another item is already processing. One transaction.
    pub fn claim_next_work(&self, host_id: &str, now_ms: u64) -> StateResult<Option<WorkItem>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed;
        {
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
            let items: Vec<WorkItem> = scan_in(&table, Some(&format!("{host_id}:")))?;
            if items.iter().any(|w| w.status == WorkStatus::Processing) {
                return Err(StateError::HostBusy(host_id.to_string()));
            }
            // Key order is enqueue order; the first pending item is oldest.
            claimed = match items.into_iter().find(|w| w.status == WorkStatus::Pending) {
                Some(mut item) => {
                    item.status = WorkStatus::Processing;
                    item.started_at = Some(now_ms);
                    put_in(&mut table, &item.id.clone(), &item)?;
                    Some(item)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claimed)
    }

    /// Transition a work item to a terminal status.
    pub fn set_work_status(&self, id: &str, status: WorkStatus) -> StateResult<WorkItem> {
        self.update_work(id, |w| w.status = status)
    }

    /// Put a claimed item back at the front of the queue (send dropped).
    pub fn revert_work_to_pending(&self, id: &str) -> StateResult<WorkItem> {
        self.update_work(id, |w| {
            w.status = WorkStatus::Pending;
            w.started_at = None;
        })
    }

    /// Agent reported failure: requeue while attempts remain, else fail.
    pub fn retry_or_fail_work(&self, id: &str, max_attempts: u32) -> StateResult<WorkItem> {
        self.update_work(id, |w| {
            w.attempts += 1;
            if w.attempts < max_attempts {
                w.status = WorkStatus::Pending;
                w.started_at = None;
            } else {
                w.status = WorkStatus::Failed;
            }
        })
    }

    /// Sweep items stuck in `processing` past the timeout. Items with
    /// attempts remaining go back to pending; exhausted items fail
    /// permanently, and an exhausted `deploy` also fails its deployment
    /// (`failed_at = "stuck_timeout"`) in the same transaction. Returns the
    /// permanently failed items.
    pub fn reclaim_stuck_work(
        &self,
        now_ms: u64,
        timeout_ms: u64,
        max_attempts: u32,
    ) -> StateResult<Vec<WorkItem>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut failed = Vec::new();
        {
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
            let items: Vec<WorkItem> = scan_in(&table, None)?;
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            for mut item in items {
                let Some(started) = item.started_at else { continue };
                if item.status != WorkStatus::Processing
                    || now_ms.saturating_sub(started) <= timeout_ms
                {
                    continue;
                }
                item.attempts += 1;
                if item.attempts < max_attempts {
                    item.status = WorkStatus::Pending;
                    item.started_at = None;
                    warn!(id = %item.id, attempts = item.attempts, "stuck work requeued");
                } else {
                    item.status = WorkStatus::Failed;
                    warn!(id = %item.id, "stuck work failed permanently");
                    if item.work_type == WorkType::Deploy {
                        if let Some(dep_id) = &item.deployment_id {
                            if let Some(mut d) = get_in::<Deployment>(&deployments, dep_id)? {
                                d.status = DeploymentStatus::Failed;
                                d.failed_at = Some("stuck_timeout".to_string());
                                d.updated_at = now_ms;
                                put_in(&mut deployments, dep_id, &d)?;
                            }
                        }
                    }
                    failed.push(item.clone());
                }
                put_in(&mut table, &item.id.clone(), &item)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(failed)
    }

    /// Delete every pending work item tagged with the given service (used
    /// by rollout abort). Returns the number removed.
    pub fn delete_pending_work_for_service(&self, service_id: &str) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
            let items: Vec<WorkItem> = scan_in(&table, None)?;
            for item in items {
                if item.status == WorkStatus::Pending
                    && item.service_id.as_deref() == Some(service_id)
                {
                    table.remove(item.id.as_str()).map_err(map_err!(Write))?;
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    fn update_work<F>(&self, id: &str, f: F) -> StateResult<WorkItem>
    where
        F: FnOnce(&mut WorkItem),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(WORK_ITEMS).map_err(map_err!(Table))?;
            let mut item: WorkItem = get_in(&table, id)?
                .ok_or_else(|| StateError::NotFound(format!("work item {id}")))?;
            f(&mut item);
            put_in(&mut table, id, &item)?;
            updated = item;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Volume backups ─────────────────────────────────────────────

    /// Insert or update a volume backup row.
    pub fn put_backup(&self, backup: &VolumeBackup) -> StateResult<()> {
        self.put_row(BACKUPS, &backup.id, backup)
    }

    /// Get a backup by ID.
    pub fn get_backup(&self, id: &str) -> StateResult<Option<VolumeBackup>> {
        self.get_row(BACKUPS, id)
    }

    /// Read-modify-write a backup in one transaction.
    pub fn update_backup<F>(&self, id: &str, f: F) -> StateResult<VolumeBackup>
    where
        F: FnOnce(&mut VolumeBackup),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(BACKUPS).map_err(map_err!(Table))?;
            let mut backup: VolumeBackup = get_in(&table, id)?
                .ok_or_else(|| StateError::NotFound(format!("backup {id}")))?;
            f(&mut backup);
            put_in(&mut table, id, &backup)?;
            updated = backup;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// List a service's migration backups.
    pub fn list_migration_backups(&self, service_id: &str) -> StateResult<Vec<VolumeBackup>> {
        let all: Vec<VolumeBackup> = self.scan(BACKUPS, None)?;
        Ok(all
            .into_iter()
            .filter(|b| b.service_id == service_id && b.is_migration_backup)
            .collect())
    }

    // ── Generic row helpers ────────────────────────────────────────

    fn put_row<T: Serialize>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            put_in(&mut table, key, value)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_row<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        get_in(&table, key)
    }

    fn delete_row(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn scan<T: DeserializeOwned>(
        &self,
        def: redb::TableDefinition<&'static str, &'static [u8]>,
        prefix: Option<&str>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan_in(&table, prefix)
    }
}

// ── Table-level helpers (usable inside open transactions) ──────────

fn put_in<T: Serialize>(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn get_in<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn scan_in<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: Option<&str>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if let Some(p) = prefix {
            if !key.value().starts_with(p) {
                continue;
            }
        }
        let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(item);
    }
    Ok(results)
}

fn keys_with_prefix(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let k = key.value().to_string();
        if k.starts_with(prefix) {
            keys.push(k);
        }
    }
    Ok(keys)
}
