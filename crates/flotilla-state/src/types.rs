//! Domain types for the Flotilla desired-state store.
//!
//! These types represent the persisted state of hosts, services, placements,
//! deployments, rollouts, work items, and volume backups. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a host (opaque string).
pub type HostId = String;

/// Unique identifier for a service.
pub type ServiceId = String;

/// Unique identifier for a deployment.
pub type DeploymentId = String;

/// Unique identifier for a rollout.
pub type RolloutId = String;

/// Unique identifier for a work item (`{host_id}:{seq:020}`).
pub type WorkItemId = String;

/// Unique identifier for a volume backup.
pub type BackupId = String;

// ── Host ──────────────────────────────────────────────────────────

/// A remote machine running an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub name: String,
    /// Address on the overlay network.
    pub wireguard_ip: String,
    /// Hex-encoded Ed25519 public key used to verify agent envelopes.
    pub signing_public_key: String,
    pub status: HostStatus,
    /// Unix timestamp (ms) of the last inbound message from the agent.
    pub last_heartbeat: u64,
    pub resources: HostResources,
    /// Whether this host runs the edge proxy and receives routing tables.
    pub is_proxy: bool,
}

/// Lifecycle status of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    /// Registered, never connected.
    Pending,
    Online,
    Offline,
    Unknown,
}

/// Advertised machine resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostResources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

// ── Service ───────────────────────────────────────────────────────

/// A user-declared unit of desired state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ServiceId,
    /// Hostname label; agents resolve `{name}.internal`.
    pub name: String,
    pub image: String,
    pub stateful: bool,
    /// Desired replica count, used when `auto_place` is set.
    pub replicas: u32,
    pub auto_place: bool,
    /// Set once a stateful service is bound to a host.
    pub locked_host_id: Option<HostId>,
    pub migration_status: Option<MigrationStatus>,
    pub migration_target_host_id: Option<HostId>,
    pub migration_backup_id: Option<BackupId>,
    pub health_check: Option<HealthCheck>,
    pub start_command: Option<String>,
    pub resource_limits: Option<ResourceLimits>,
    /// Serialized desired-state view captured at the end of the last
    /// successful rollout; consumed by the external diff engine.
    pub deployed_config_snapshot: Option<serde_json::Value>,
}

/// Stage of an in-flight stateful migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Stopping,
    BackingUp,
    Restoring,
    Starting,
    Failed,
}

/// Container health probe parameters, executed by the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub cmd: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
    pub start_period_secs: u64,
}

/// Per-container resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    pub cpu_millis: Option<u32>,
    pub memory_mb: Option<u64>,
}

// ── Placement declarations ────────────────────────────────────────

/// Explicit placement row, used when `auto_place` is false.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceReplica {
    pub service_id: ServiceId,
    pub host_id: HostId,
    pub count: u32,
}

/// A declared port on a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServicePort {
    pub service_id: ServiceId,
    pub port: u16,
    pub is_public: bool,
    /// Public hostname; globally unique across services.
    pub domain: Option<String>,
    pub protocol: PortProtocol,
    pub external_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortProtocol {
    Http,
    Tcp,
    Udp,
}

/// A declared volume. A service with any volume is stateful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceVolume {
    pub service_id: ServiceId,
    pub name: String,
    pub container_path: String,
}

// ── Deployment ────────────────────────────────────────────────────

/// One container instance of a service on a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub service_id: ServiceId,
    pub host_id: HostId,
    /// Assigned by the agent once the container exists.
    pub container_id: Option<String>,
    /// Container address reported by the agent; feeds the DNS table.
    pub ip_address: Option<String>,
    pub status: DeploymentStatus,
    pub health: HealthState,
    pub rollout_id: Option<RolloutId>,
    pub previous_deployment_id: Option<DeploymentId>,
    /// Stage tag recorded when the deployment failed or was rolled back.
    pub failed_at: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Pulling,
    Starting,
    Healthy,
    DnsUpdating,
    CaddyUpdating,
    StoppingOld,
    Running,
    Stopping,
    Stopped,
    Failed,
    RolledBack,
    Unknown,
}

impl DeploymentStatus {
    /// Whether this deployment should appear in derived DNS/routing tables.
    pub fn is_addressable(self) -> bool {
        matches!(
            self,
            Self::DnsUpdating | Self::CaddyUpdating | Self::StoppingOld | Self::Running
        )
    }

    /// Statuses that block a new rollout trigger for the same service.
    pub fn blocks_rollout(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Pulling | Self::Starting | Self::Healthy | Self::Stopping
        )
    }
}

/// Health as reported by the agent's probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    None,
    Starting,
    Healthy,
    Unhealthy,
}

// ── Rollout ───────────────────────────────────────────────────────

/// One attempt to converge a service to its desired state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub service_id: ServiceId,
    pub status: RolloutStatus,
    pub current_stage: RolloutStage,
    pub created_at: u64,
    pub completed_at: Option<u64>,
    /// Set when the DNS fan-out advanced on the fallback timer rather than
    /// a full set of agent acks.
    pub dns_updated_by_timeout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

/// Stage of the rollout state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStage {
    Queued,
    Deploying,
    HealthCheck,
    DnsUpdating,
    CaddyUpdating,
    StoppingOld,
    Completed,
    Aborted,
    /// The stuck-rollout sweep fired while the rollout sat in the named stage.
    Stuck(String),
}

impl RolloutStage {
    /// Short tag used in `Deployment.failed_at` and stuck-stage labels.
    pub fn tag(&self) -> String {
        match self {
            Self::Queued => "queued".into(),
            Self::Deploying => "deploying".into(),
            Self::HealthCheck => "health_check".into(),
            Self::DnsUpdating => "dns_updating".into(),
            Self::CaddyUpdating => "caddy_updating".into(),
            Self::StoppingOld => "stopping_old".into(),
            Self::Completed => "completed".into(),
            Self::Aborted => "aborted".into(),
            Self::Stuck(stage) => format!("stuck_{stage}"),
        }
    }
}

// ── Work items ────────────────────────────────────────────────────

/// An imperative command queued for a specific host.
///
/// `payload` is opaque to the queue; producers and consumers agree on the
/// encoding (see `flotilla-queue`). `service_id`/`deployment_id` are
/// metadata columns so the queue can act on failures without decoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub host_id: HostId,
    /// Monotone enqueue counter; embedded in the table key.
    pub seq: u64,
    pub work_type: WorkType,
    pub payload: Vec<u8>,
    pub status: WorkStatus,
    pub attempts: u32,
    pub service_id: Option<ServiceId>,
    pub deployment_id: Option<DeploymentId>,
    pub created_at: u64,
    pub started_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    Deploy,
    Stop,
    Restart,
    BackupVolume,
    RestoreVolume,
    CleanupVolumes,
    CreateManifest,
    ForceCleanup,
    UpdateWireguard,
    SyncCaddy,
    SyncDns,
}

impl WorkType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::BackupVolume => "backup_volume",
            Self::RestoreVolume => "restore_volume",
            Self::CleanupVolumes => "cleanup_volumes",
            Self::CreateManifest => "create_manifest",
            Self::ForceCleanup => "force_cleanup",
            Self::UpdateWireguard => "update_wireguard",
            Self::SyncCaddy => "sync_caddy",
            Self::SyncDns => "sync_dns",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

// ── Volume backups ────────────────────────────────────────────────

/// A snapshot of one service volume, stored off-host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeBackup {
    pub id: BackupId,
    pub service_id: ServiceId,
    pub volume_name: String,
    /// Host the backup was taken on.
    pub host_id: HostId,
    pub storage_path: String,
    pub checksum: Option<String>,
    pub status: BackupStatus,
    pub is_migration_backup: bool,
    /// Set once the restore of this backup was acknowledged on the target.
    pub restored: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

// ── Keys & helpers ────────────────────────────────────────────────

impl ServiceReplica {
    /// Composite key for the replicas table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.service_id, self.host_id)
    }
}

impl ServicePort {
    /// Composite key for the ports table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.service_id, self.port)
    }
}

impl ServiceVolume {
    /// Composite key for the volumes table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.service_id, self.name)
    }
}

impl WorkItem {
    /// Build the FIFO table key (doubles as the item ID).
    pub fn key_for(host_id: &str, seq: u64) -> String {
        format!("{host_id}:{seq:020}")
    }
}

/// Generate a fresh opaque entity ID.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current Unix time in milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_item_keys_sort_in_enqueue_order() {
        let a = WorkItem::key_for("host-1", 1);
        let b = WorkItem::key_for("host-1", 2);
        let c = WorkItem::key_for("host-1", 10);
        assert!(a < b);
        assert!(b < c, "zero-padded seq must sort numerically");
    }

    #[test]
    fn stuck_stage_tag() {
        let stage = RolloutStage::Stuck("dns_updating".to_string());
        assert_eq!(stage.tag(), "stuck_dns_updating");
        assert_eq!(RolloutStage::HealthCheck.tag(), "health_check");
    }

    #[test]
    fn addressable_statuses() {
        assert!(DeploymentStatus::Running.is_addressable());
        assert!(DeploymentStatus::DnsUpdating.is_addressable());
        assert!(!DeploymentStatus::Pending.is_addressable());
        assert!(!DeploymentStatus::Stopped.is_addressable());
    }
}
