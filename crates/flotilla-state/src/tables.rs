//! redb table definitions for the desired-state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Child rows use composite keys (`{service_id}:{suffix}`) so prefix
//! scans return the owned set. Work items are keyed `{host_id}:{seq:020}`,
//! which makes redb key order the per-host FIFO order.

use redb::TableDefinition;

/// Hosts keyed by `{host_id}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");

/// Services keyed by `{service_id}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Explicit placements keyed by `{service_id}:{host_id}`.
pub const REPLICAS: TableDefinition<&str, &[u8]> = TableDefinition::new("replicas");

/// Port declarations keyed by `{service_id}:{port}`.
pub const PORTS: TableDefinition<&str, &[u8]> = TableDefinition::new("ports");

/// Volume declarations keyed by `{service_id}:{volume_name}`.
pub const VOLUMES: TableDefinition<&str, &[u8]> = TableDefinition::new("volumes");

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Rollouts keyed by `{rollout_id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Work items keyed by `{host_id}:{seq:020}` (arrival order per host).
pub const WORK_ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("work_items");

/// Volume backups keyed by `{backup_id}`.
pub const BACKUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("backups");

/// Internal counters (work item sequence), keyed by counter name.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
