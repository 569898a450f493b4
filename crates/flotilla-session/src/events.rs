//! Agent events — decoded inbound traffic handed to the engine.
//!
//! Session readers translate authenticated envelopes into these events and
//! push them onto a channel; the engine's event loop consumes them.

use flotilla_state::HealthState;

/// Which derived config table an ack refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Dns,
    Caddy,
}

/// One container as reported by an agent's status update.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerReport {
    /// Empty when the agent doesn't recognize the container.
    pub deployment_id: String,
    pub container_id: String,
    pub ip_address: Option<String>,
    /// Runtime state string as reported ("running", "exited", ...).
    pub state: String,
    pub health: HealthState,
}

/// A decoded, authenticated inbound agent message.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    StatusUpdate {
        host_id: String,
        containers: Vec<ContainerReport>,
        is_proxy: bool,
    },
    WorkComplete {
        host_id: String,
        work_id: String,
        success: bool,
        message: String,
        container_id: Option<String>,
        ip_address: Option<String>,
        checksum: Option<String>,
    },
    ConfigAck {
        host_id: String,
        kind: ConfigKind,
        success: bool,
        message: String,
    },
    Heartbeat {
        host_id: String,
    },
    Disconnected {
        host_id: String,
    },
}

impl AgentEvent {
    /// The host this event originated from.
    pub fn host_id(&self) -> &str {
        match self {
            Self::StatusUpdate { host_id, .. }
            | Self::WorkComplete { host_id, .. }
            | Self::ConfigAck { host_id, .. }
            | Self::Heartbeat { host_id }
            | Self::Disconnected { host_id } => host_id,
        }
    }
}
