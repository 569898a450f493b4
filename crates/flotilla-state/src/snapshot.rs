//! Deployed-config snapshot derivation.
//!
//! The snapshot is the JSON view of a service's desired state, serialized
//! onto the service row as the last step of a successful rollout. The
//! external diff engine compares it against newly submitted config; the
//! core only produces it.

use serde_json::json;

use crate::types::{Service, ServicePort, ServiceReplica, ServiceVolume};

/// Build the desired-state snapshot for a service.
///
/// Output is deterministic for a given desired state, so snapshots are
/// comparable across rollouts.
pub fn desired_config(
    service: &Service,
    replicas: &[ServiceReplica],
    ports: &[ServicePort],
    volumes: &[ServiceVolume],
) -> serde_json::Value {
    let mut placements: Vec<_> = replicas
        .iter()
        .map(|r| json!({ "host_id": r.host_id, "count": r.count }))
        .collect();
    // Deterministic ordering regardless of table iteration.
    placements.sort_by(|a, b| a["host_id"].as_str().cmp(&b["host_id"].as_str()));

    json!({
        "service_id": service.id,
        "name": service.name,
        "image": service.image,
        "stateful": service.stateful,
        "replicas": service.replicas,
        "auto_place": service.auto_place,
        "start_command": service.start_command,
        "health_check": service.health_check,
        "resource_limits": service.resource_limits,
        "placements": placements,
        "ports": ports.iter().map(|p| json!({
            "port": p.port,
            "is_public": p.is_public,
            "domain": p.domain,
            "protocol": p.protocol,
            "external_port": p.external_port,
        })).collect::<Vec<_>>(),
        "volumes": volumes.iter().map(|v| json!({
            "name": v.name,
            "container_path": v.container_path,
        })).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortProtocol;

    fn service() -> Service {
        Service {
            id: "svc".into(),
            name: "web".into(),
            image: "registry.example/web:2".into(),
            stateful: false,
            replicas: 2,
            auto_place: true,
            locked_host_id: None,
            migration_status: None,
            migration_target_host_id: None,
            migration_backup_id: None,
            health_check: None,
            start_command: None,
            resource_limits: None,
            deployed_config_snapshot: None,
        }
    }

    #[test]
    fn snapshot_contains_placements_and_ports() {
        let replicas = vec![
            ServiceReplica { service_id: "svc".into(), host_id: "h2".into(), count: 1 },
            ServiceReplica { service_id: "svc".into(), host_id: "h1".into(), count: 1 },
        ];
        let ports = vec![ServicePort {
            service_id: "svc".into(),
            port: 8080,
            is_public: true,
            domain: Some("web.example.com".into()),
            protocol: PortProtocol::Http,
            external_port: None,
        }];

        let snapshot = desired_config(&service(), &replicas, &ports, &[]);
        assert_eq!(snapshot["image"], "registry.example/web:2");
        // Placements sorted by host id.
        assert_eq!(snapshot["placements"][0]["host_id"], "h1");
        assert_eq!(snapshot["ports"][0]["domain"], "web.example.com");
        assert!(snapshot["volumes"].as_array().unwrap().is_empty());
    }

    #[test]
    fn snapshot_is_deterministic() {
        let a = desired_config(&service(), &[], &[], &[]);
        let b = desired_config(&service(), &[], &[], &[]);
        assert_eq!(a, b);
    }
}
