//! Typed work payloads.
//!
//! The queue stores payloads as opaque bytes; producers encode a tagged
//! `WorkPayload` variant and the agent decodes the same shape on its side.
//! One variant per imperative work type.

use serde::{Deserialize, Serialize};

use flotilla_state::{
    BackupId, DeploymentId, HealthCheck, HostId, ResourceLimits, RolloutId, ServiceId, WorkType,
};

use crate::error::{QueueError, QueueResult};

/// The command carried by a work item, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkPayload {
    Deploy {
        deployment_id: DeploymentId,
        service_id: ServiceId,
        image: String,
        start_command: Option<String>,
        health_check: Option<HealthCheck>,
        ports: Vec<PayloadPort>,
        volumes: Vec<PayloadVolume>,
        resource_limits: Option<ResourceLimits>,
        /// Base hostname prepended to relative image references.
        registry_host: Option<String>,
    },
    Stop {
        deployment_id: DeploymentId,
        service_id: ServiceId,
        container_id: Option<String>,
        /// Present when the stop drains an old deployment for a rollout.
        rollout_id: Option<RolloutId>,
    },
    Restart {
        deployment_id: DeploymentId,
        service_id: ServiceId,
        container_id: Option<String>,
    },
    BackupVolume {
        backup_id: BackupId,
        service_id: ServiceId,
        volume_name: String,
        container_path: String,
        storage_path: String,
    },
    RestoreVolume {
        backup_id: BackupId,
        service_id: ServiceId,
        volume_name: String,
        container_path: String,
        storage_path: String,
        expected_checksum: Option<String>,
    },
    CleanupVolumes {
        service_id: ServiceId,
        /// Volume names that must survive the cleanup.
        keep: Vec<String>,
    },
    CreateManifest {
        service_id: ServiceId,
        manifest: serde_json::Value,
    },
    ForceCleanup {
        /// Containers the control plane still knows about; everything else
        /// on the host is fair game.
        keep_container_ids: Vec<String>,
    },
    UpdateWireguard {
        peers: Vec<WireguardPeer>,
    },
    SyncCaddy {},
    SyncDns {},
}

/// Port mapping handed to the agent on deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadPort {
    pub port: u16,
    pub is_public: bool,
    pub external_port: Option<u16>,
}

/// Volume mount handed to the agent on deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadVolume {
    pub name: String,
    pub container_path: String,
}

/// Overlay peer entry for wireguard sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireguardPeer {
    pub host_id: HostId,
    pub wireguard_ip: String,
}

impl WorkPayload {
    /// The work type this payload encodes.
    pub fn work_type(&self) -> WorkType {
        match self {
            Self::Deploy { .. } => WorkType::Deploy,
            Self::Stop { .. } => WorkType::Stop,
            Self::Restart { .. } => WorkType::Restart,
            Self::BackupVolume { .. } => WorkType::BackupVolume,
            Self::RestoreVolume { .. } => WorkType::RestoreVolume,
            Self::CleanupVolumes { .. } => WorkType::CleanupVolumes,
            Self::CreateManifest { .. } => WorkType::CreateManifest,
            Self::ForceCleanup { .. } => WorkType::ForceCleanup,
            Self::UpdateWireguard { .. } => WorkType::UpdateWireguard,
            Self::SyncCaddy {} => WorkType::SyncCaddy,
            Self::SyncDns {} => WorkType::SyncDns,
        }
    }

    /// The service this payload concerns, if any (queue metadata).
    pub fn service_id(&self) -> Option<&str> {
        match self {
            Self::Deploy { service_id, .. }
            | Self::Stop { service_id, .. }
            | Self::Restart { service_id, .. }
            | Self::BackupVolume { service_id, .. }
            | Self::RestoreVolume { service_id, .. }
            | Self::CleanupVolumes { service_id, .. }
            | Self::CreateManifest { service_id, .. } => Some(service_id),
            _ => None,
        }
    }

    /// The deployment this payload concerns, if any (queue metadata).
    pub fn deployment_id(&self) -> Option<&str> {
        match self {
            Self::Deploy { deployment_id, .. }
            | Self::Stop { deployment_id, .. }
            | Self::Restart { deployment_id, .. } => Some(deployment_id),
            _ => None,
        }
    }

    /// Encode to the opaque bytes the queue stores.
    pub fn encode(&self) -> QueueResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::Payload(e.to_string()))
    }

    /// Decode from queue bytes.
    pub fn decode(bytes: &[u8]) -> QueueResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Payload(e.to_string()))
    }
}
