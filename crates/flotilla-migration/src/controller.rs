//! Migration controller — moves a stateful service between hosts.
//!
//! The machine is persisted in `Service.MigrationStatus`:
//!
//! ```text
//! null → stopping → backing_up → restoring → starting → null
//! ```
//!
//! Stop the running container, snapshot every volume to backup storage,
//! restore the snapshots on the target, then rebind the service and hand
//! control back to a normal rollout. A failed backup or restore parks the
//! machine in `failed` with the original placement intact. Cancel zeroes
//! the migration fields; results from in-flight items are ignored once the
//! status no longer matches.

use tracing::{info, warn};

use flotilla_queue::{WorkPayload, WorkQueue};
use flotilla_state::{
    BackupStatus, DeploymentStatus, MigrationStatus, Service, StateStore, VolumeBackup, epoch_ms,
    new_id,
};

use crate::error::{MigrationError, MigrationResult};

/// What the engine should do after a migration callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The machine advanced (or ignored a stale result); nothing to do.
    Progressed,
    /// Restores are acknowledged: the service is rebound to the target and
    /// a normal rollout should start it there.
    ReadyToStart { service_id: String },
}

/// Drives stateful-service migrations. Entry points must be called under
/// the engine's per-service lock.
pub struct MigrationController {
    state: StateStore,
    queue: WorkQueue,
    /// Base path in backup storage; migrations are refused without one.
    backup_storage: Option<String>,
}

impl MigrationController {
    pub fn new(state: StateStore, queue: WorkQueue, backup_storage: Option<String>) -> Self {
        Self {
            state,
            queue,
            backup_storage,
        }
    }

    // ── Trigger ────────────────────────────────────────────────────

    /// Start migrating a service to `target_host_id`.
    pub fn start(&self, service_id: &str, target_host_id: &str) -> MigrationResult<()> {
        let service = self.require_service(service_id)?;

        if !service.stateful {
            return Err(MigrationError::NotStateful(service_id.to_string()));
        }
        if service.migration_status.is_some() {
            return Err(MigrationError::AlreadyMigrating(service_id.to_string()));
        }
        if self.state.find_in_progress_rollout(service_id)?.is_some() {
            return Err(MigrationError::RolloutInProgress(service_id.to_string()));
        }
        if self.state.list_volumes(service_id)?.is_empty() {
            return Err(MigrationError::NoVolumes(service_id.to_string()));
        }
        if self.backup_storage.is_none() {
            return Err(MigrationError::BackupStorageNotConfigured);
        }

        let running: Vec<_> = self
            .state
            .list_deployments(service_id)?
            .into_iter()
            .filter(|d| d.status == DeploymentStatus::Running)
            .collect();
        let Some(source) = running.first().map(|d| d.host_id.clone()) else {
            return Err(MigrationError::NoRunningDeployment(service_id.to_string()));
        };
        if source == target_host_id {
            return Err(MigrationError::SameHost(service_id.to_string()));
        }

        self.state.update_service(service_id, |s| {
            s.migration_status = Some(MigrationStatus::Stopping);
            s.migration_target_host_id = Some(target_host_id.to_string());
        })?;

        for deployment in &running {
            self.state
                .update_deployment(&deployment.id, |d| d.status = DeploymentStatus::Stopping)?;
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

        info!(service_id, target_host_id, %source, "migration started");
        Ok(())
    }

    // ── Agent-driven transitions ───────────────────────────────────

    /// The source container stopped; snapshot every volume.
    pub fn on_source_stopped(&self, service_id: &str) -> MigrationResult<MigrationOutcome> {
        let service = self.require_service(service_id)?;
        if service.migration_status != Some(MigrationStatus::Stopping) {
            return Ok(MigrationOutcome::Progressed);
        }

        let mut source = None;
        for deployment in self.state.list_deployments(service_id)? {
            if matches!(
                deployment.status,
                DeploymentStatus::Stopping | DeploymentStatus::Running
            ) {
                source = Some(deployment.host_id.clone());
                self.state
                    .update_deployment(&deployment.id, |d| d.status = DeploymentStatus::Stopped)?;
            } else if deployment.status == DeploymentStatus::Stopped {
                source.get_or_insert(deployment.host_id.clone());
            }
        }
        let Some(source) = source else {
            return Ok(MigrationOutcome::Progressed);
        };
        let storage = self
            .backup_storage
            .clone()
            .ok_or(MigrationError::BackupStorageNotConfigured)?;

        let mut first_backup_id = None;
        for volume in self.state.list_volumes(service_id)? {
            let backup = VolumeBackup {
                id: new_id(),
                service_id: service_id.to_string(),
                volume_name: volume.name.clone(),
                host_id: source.clone(),
                storage_path: format!("{storage}/{service_id}/{}/{}.tar", volume.name, new_id()),
                checksum: None,
                status: BackupStatus::Pending,
                is_migration_backup: true,
                restored: false,
                created_at: epoch_ms(),
            };
            first_backup_id.get_or_insert(backup.id.clone());
            self.state.put_backup(&backup)?;
            self.queue.enqueue(
                &source,
                &WorkPayload::BackupVolume {
                    backup_id: backup.id.clone(),
                    service_id: service_id.to_string(),
                    volume_name: volume.name,
                    container_path: volume.container_path,
                    storage_path: backup.storage_path.clone(),
                },
            )?;
        }

        self.state.update_service(service_id, |s| {
            s.migration_status = Some(MigrationStatus::BackingUp);
            s.migration_backup_id = first_backup_id.clone();
        })?;
        info!(service_id, "source stopped, backing up volumes");
        Ok(MigrationOutcome::Progressed)
    }

    /// A backup item finished. When every migration backup completed, the
    /// machine moves to `restoring` and replaces the placement with the
    /// target host.
    pub fn on_backup_result(
        &self,
        backup_id: &str,
        success: bool,
        checksum: Option<String>,
    ) -> MigrationResult<MigrationOutcome> {
        let Some(backup) = self.state.get_backup(backup_id)? else {
            return Ok(MigrationOutcome::Progressed);
        };
        let service = self.require_service(&backup.service_id)?;
        if service.migration_status != Some(MigrationStatus::BackingUp) {
            // Cancelled or failed in the meantime; the result is ignored.
            return Ok(MigrationOutcome::Progressed);
        }

        self.state.update_backup(backup_id, |b| {
            b.status = if success {
                BackupStatus::Completed
            } else {
                BackupStatus::Failed
            };
            b.checksum = checksum.clone();
        })?;

        if !success {
            warn!(service_id = %service.id, backup_id, "backup failed; migration parked");
            self.state.update_service(&service.id, |s| {
                s.migration_status = Some(MigrationStatus::Failed);
            })?;
            return Ok(MigrationOutcome::Progressed);
        }

        let backups = self.state.list_migration_backups(&service.id)?;
        if backups.iter().any(|b| b.status != BackupStatus::Completed) {
            return Ok(MigrationOutcome::Progressed);
        }

        let Some(target) = service.migration_target_host_id.clone() else {
            return Ok(MigrationOutcome::Progressed);
        };
        for backup in &backups {
            self.queue.enqueue(
                &target,
                &WorkPayload::RestoreVolume {
                    backup_id: backup.id.clone(),
                    service_id: service.id.clone(),
                    volume_name: backup.volume_name.clone(),
                    container_path: self.container_path(&service.id, &backup.volume_name)?,
                    storage_path: backup.storage_path.clone(),
                    expected_checksum: backup.checksum.clone(),
                },
            )?;
        }
        self.state.replace_replicas(&service.id, &[(target, 1)])?;
        self.state.update_service(&service.id, |s| {
            s.migration_status = Some(MigrationStatus::Restoring);
        })?;
        info!(service_id = %service.id, "backups complete, restoring on target");
        Ok(MigrationOutcome::Progressed)
    }

    /// A restore item finished on the target. When every backup is
    /// restored, the service is rebound and a normal rollout takes over.
    pub fn on_restore_result(
        &self,
        backup_id: &str,
        success: bool,
    ) -> MigrationResult<MigrationOutcome> {
        let Some(backup) = self.state.get_backup(backup_id)? else {
            return Ok(MigrationOutcome::Progressed);
        };
        let service = self.require_service(&backup.service_id)?;
        if service.migration_status != Some(MigrationStatus::Restoring) {
            return Ok(MigrationOutcome::Progressed);
        }

        if !success {
            warn!(service_id = %service.id, backup_id, "restore failed; migration parked");
            self.state.update_service(&service.id, |s| {
                s.migration_status = Some(MigrationStatus::Failed);
            })?;
            return Ok(MigrationOutcome::Progressed);
        }

        self.state.update_backup(backup_id, |b| b.restored = true)?;

        let backups = self.state.list_migration_backups(&service.id)?;
        if backups.iter().any(|b| !b.restored) {
            return Ok(MigrationOutcome::Progressed);
        }

        // Every restore acknowledged: bind the target and hand over to a
        // rollout.
        self.state.update_service(&service.id, |s| {
            s.migration_status = Some(MigrationStatus::Starting);
        })?;
        let target = service.migration_target_host_id.clone();
        self.state.update_service(&service.id, |s| {
            s.locked_host_id = target.clone();
            s.migration_status = None;
            s.migration_target_host_id = None;
            s.migration_backup_id = None;
        })?;
        info!(service_id = %service.id, "restores complete, starting on target");
        Ok(MigrationOutcome::ReadyToStart {
            service_id: service.id,
        })
    }

    // ── Operator ───────────────────────────────────────────────────

    /// Cancel an in-flight migration. Idempotent; in-flight backup or
    /// restore items may still complete but their results are ignored
    /// because the status no longer matches.
    pub fn cancel(&self, service_id: &str) -> MigrationResult<bool> {
        let service = self.require_service(service_id)?;
        if service.migration_status.is_none()
            && service.migration_target_host_id.is_none()
            && service.migration_backup_id.is_none()
        {
            return Ok(false);
        }

        self.state.update_service(service_id, |s| {
            s.migration_status = None;
            s.migration_target_host_id = None;
            s.migration_backup_id = None;
        })?;
        info!(service_id, "migration cancelled");
        Ok(true)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn require_service(&self, service_id: &str) -> MigrationResult<Service> {
        self.state
            .get_service(service_id)?
            .ok_or_else(|| MigrationError::ServiceNotFound(service_id.to_string()))
    }

    fn container_path(&self, service_id: &str, volume_name: &str) -> MigrationResult<String> {
        Ok(self
            .state
            .list_volumes(service_id)?
            .into_iter()
            .find(|v| v.name == volume_name)
            .map(|v| v.container_path)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_state::{
        Deployment, HealthState, ServiceVolume, WorkItem, WorkType,
    };

    struct Fixture {
        state: StateStore,
        controller: MigrationController,
    }

    fn fixture() -> Fixture {
        let state = StateStore::open_in_memory().unwrap();
        let queue = WorkQueue::new(state.clone());
        let controller =
            MigrationController::new(state.clone(), queue, Some("s3://backups".to_string()));
        Fixture { state, controller }
    }

    fn seed_stateful_service(state: &StateStore, id: &str, host: &str) {
        state
            .put_service(&Service {
                id: id.to_string(),
                name: id.to_string(),
                image: "registry.example/db:1".into(),
                stateful: true,
                replicas: 1,
                auto_place: false,
                locked_host_id: Some(host.to_string()),
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
            .upsert_volume(&ServiceVolume {
                service_id: id.to_string(),
                name: "data".into(),
                container_path: "/var/lib/data".into(),
            })
            .unwrap();
        state
            .put_deployment(&Deployment {
                id: format!("{id}-d1"),
                service_id: id.to_string(),
                host_id: host.to_string(),
                container_id: Some("c1".into()),
                ip_address: Some("10.10.0.3".into()),
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

    fn items(state: &StateStore, host: &str, work_type: WorkType) -> Vec<WorkItem> {
        state
            .list_work_for_host(host)
            .unwrap()
            .into_iter()
            .filter(|w| w.work_type == work_type)
            .collect()
    }

    fn migration_status(state: &StateStore, id: &str) -> Option<MigrationStatus> {
        state.get_service(id).unwrap().unwrap().migration_status
    }

    #[test]
    fn full_migration_sequence() {
        let fx = fixture();
        seed_stateful_service(&fx.state, "y", "a");

        // stopping
        fx.controller.start("y", "b").unwrap();
        assert_eq!(migration_status(&fx.state, "y"), Some(MigrationStatus::Stopping));
        assert_eq!(items(&fx.state, "a", WorkType::Stop).len(), 1);

        // backing_up
        fx.controller.on_source_stopped("y").unwrap();
        assert_eq!(migration_status(&fx.state, "y"), Some(MigrationStatus::BackingUp));
        let backups = fx.state.list_migration_backups("y").unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(items(&fx.state, "a", WorkType::BackupVolume).len(), 1);
        assert_eq!(
            fx.state.get_deployment("y-d1").unwrap().unwrap().status,
            DeploymentStatus::Stopped
        );

        // restoring
        let outcome = fx
            .controller
            .on_backup_result(&backups[0].id, true, Some("sha256:feed".into()))
            .unwrap();
        assert_eq!(outcome, MigrationOutcome::Progressed);
        assert_eq!(migration_status(&fx.state, "y"), Some(MigrationStatus::Restoring));
        let restores = items(&fx.state, "b", WorkType::RestoreVolume);
        assert_eq!(restores.len(), 1);
        // Placement rewritten to the target.
        let replicas = fx.state.list_replicas("y").unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].host_id, "b");
        assert_eq!(replicas[0].count, 1);

        // starting → null, rebound to target
        let outcome = fx
            .controller
            .on_restore_result(&backups[0].id, true)
            .unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::ReadyToStart {
                service_id: "y".to_string()
            }
        );
        let service = fx.state.get_service("y").unwrap().unwrap();
        assert_eq!(service.locked_host_id.as_deref(), Some("b"));
        assert!(service.migration_status.is_none());
        assert!(service.migration_target_host_id.is_none());
        assert!(service.migration_backup_id.is_none());
    }

    #[test]
    fn restore_waits_for_every_volume() {
        let fx = fixture();
        seed_stateful_service(&fx.state, "y", "a");
        fx.state
            .upsert_volume(&ServiceVolume {
                service_id: "y".into(),
                name: "wal".into(),
                container_path: "/var/lib/wal".into(),
            })
            .unwrap();

        fx.controller.start("y", "b").unwrap();
        fx.controller.on_source_stopped("y").unwrap();
        let backups = fx.state.list_migration_backups("y").unwrap();
        assert_eq!(backups.len(), 2);

        fx.controller.on_backup_result(&backups[0].id, true, None).unwrap();
        // One backup still running: stay in backing_up.
        assert_eq!(migration_status(&fx.state, "y"), Some(MigrationStatus::BackingUp));
        fx.controller.on_backup_result(&backups[1].id, true, None).unwrap();
        assert_eq!(migration_status(&fx.state, "y"), Some(MigrationStatus::Restoring));

        // Restores gate the same way.
        let outcome = fx.controller.on_restore_result(&backups[0].id, true).unwrap();
        assert_eq!(outcome, MigrationOutcome::Progressed);
        assert_eq!(migration_status(&fx.state, "y"), Some(MigrationStatus::Restoring));

        let outcome = fx.controller.on_restore_result(&backups[1].id, true).unwrap();
        assert!(matches!(outcome, MigrationOutcome::ReadyToStart { .. }));
    }

    #[test]
    fn failed_backup_parks_migration_and_keeps_placement() {
        let fx = fixture();
        seed_stateful_service(&fx.state, "y", "a");
        fx.state.replace_replicas("y", &[("a".to_string(), 1)]).unwrap();

        fx.controller.start("y", "b").unwrap();
        fx.controller.on_source_stopped("y").unwrap();
        let backups = fx.state.list_migration_backups("y").unwrap();

        fx.controller
            .on_backup_result(&backups[0].id, false, None)
            .unwrap();
        assert_eq!(migration_status(&fx.state, "y"), Some(MigrationStatus::Failed));

        // Original placement untouched.
        let replicas = fx.state.list_replicas("y").unwrap();
        assert_eq!(replicas[0].host_id, "a");
        // Lock unchanged.
        let service = fx.state.get_service("y").unwrap().unwrap();
        assert_eq!(service.locked_host_id.as_deref(), Some("a"));
    }

    #[test]
    fn cancel_is_idempotent_and_voids_late_results() {
        let fx = fixture();
        seed_stateful_service(&fx.state, "y", "a");

        fx.controller.start("y", "b").unwrap();
        fx.controller.on_source_stopped("y").unwrap();
        let backups = fx.state.list_migration_backups("y").unwrap();

        assert!(fx.controller.cancel("y").unwrap());
        assert!(migration_status(&fx.state, "y").is_none());
        // Second cancel: no-op.
        assert!(!fx.controller.cancel("y").unwrap());

        // The in-flight backup completes, but the result is ignored.
        fx.controller
            .on_backup_result(&backups[0].id, true, None)
            .unwrap();
        assert!(migration_status(&fx.state, "y").is_none());
        assert!(items(&fx.state, "b", WorkType::RestoreVolume).is_empty());
    }

    #[test]
    fn preconditions_are_enforced() {
        let fx = fixture();
        seed_stateful_service(&fx.state, "y", "a");

        assert!(matches!(
            fx.controller.start("ghost", "b"),
            Err(MigrationError::ServiceNotFound(_))
        ));
        assert!(matches!(
            fx.controller.start("y", "a"),
            Err(MigrationError::SameHost(_))
        ));

        // Stateless service.
        fx.state
            .put_service(&Service {
                id: "web".into(),
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
        assert!(matches!(
            fx.controller.start("web", "b"),
            Err(MigrationError::NotStateful(_))
        ));

        // Second start while migrating.
        fx.controller.start("y", "b").unwrap();
        assert!(matches!(
            fx.controller.start("y", "b"),
            Err(MigrationError::AlreadyMigrating(_))
        ));
    }

    #[test]
    fn start_requires_backup_storage() {
        let state = StateStore::open_in_memory().unwrap();
        let queue = WorkQueue::new(state.clone());
        let controller = MigrationController::new(state.clone(), queue, None);
        seed_stateful_service(&state, "y", "a");

        assert!(matches!(
            controller.start("y", "b"),
            Err(MigrationError::BackupStorageNotConfigured)
        ));
    }

    #[test]
    fn stop_result_outside_migration_is_ignored() {
        let fx = fixture();
        seed_stateful_service(&fx.state, "y", "a");

        let outcome = fx.controller.on_source_stopped("y").unwrap();
        assert_eq!(outcome, MigrationOutcome::Progressed);
        assert!(migration_status(&fx.state, "y").is_none());
        assert!(fx.state.list_migration_backups("y").unwrap().is_empty());
    }
}
