//! Derived config tables.
//!
//! Rebuilds the DNS and routing views from the state store. Tables are
//! complete snapshots: an entry absent from a push is an entry removed on
//! the agent, which is how stale records get flushed after a rollout.

use std::collections::HashMap;

use flotilla_state::{Deployment, PortProtocol, StateStore};
use flotilla_wire::proto;

use crate::error::FanoutResult;

/// Suffix agents resolve from the pushed DNS table.
pub const INTERNAL_SUFFIX: &str = ".internal";

/// Build the DNS table: one record per service with at least one
/// addressable deployment, `{name}.internal → [container IPs]`.
pub fn compute_dns_records(state: &StateStore) -> FanoutResult<Vec<proto::DnsRecord>> {
    let deployments = state.list_all_deployments()?;
    let mut records = Vec::new();

    for service in state.list_services()? {
        let ips = addressable_ips(&deployments, &service.id);
        if ips.is_empty() {
            continue;
        }
        records.push(proto::DnsRecord {
            name: format!("{}{INTERNAL_SUFFIX}", service.name),
            ips,
        });
    }

    records.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(records)
}

/// Build the routing table: one route per public domain port, plus
/// internal routes for the `.internal` names of http ports.
pub fn compute_caddy_routes(state: &StateStore) -> FanoutResult<Vec<proto::CaddyRoute>> {
    let deployments = state.list_all_deployments()?;
    let services: HashMap<String, String> = state
        .list_services()?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect();

    let mut routes = Vec::new();
    for port in state.list_all_ports()? {
        let Some(service_name) = services.get(&port.service_id) else {
            continue;
        };
        let upstreams: Vec<String> = addressable_ips(&deployments, &port.service_id)
            .into_iter()
            .map(|ip| format!("{ip}:{}", port.port))
            .collect();
        if upstreams.is_empty() {
            continue;
        }

        if port.is_public {
            if let Some(domain) = &port.domain {
                routes.push(proto::CaddyRoute {
                    id: format!("{}-{}", port.service_id, port.port),
                    domain: domain.clone(),
                    upstreams: upstreams.clone(),
                    internal: false,
                });
            }
        }
        if port.protocol == PortProtocol::Http {
            routes.push(proto::CaddyRoute {
                id: format!("{}-{}-internal", port.service_id, port.port),
                domain: format!("{service_name}{INTERNAL_SUFFIX}"),
                upstreams,
                internal: true,
            });
        }
    }

    routes.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(routes)
}

fn addressable_ips(deployments: &[Deployment], service_id: &str) -> Vec<String> {
    let mut ips: Vec<String> = deployments
        .iter()
        .filter(|d| d.service_id == service_id && d.status.is_addressable())
        .filter_map(|d| d.ip_address.clone())
        .collect();
    ips.sort();
    ips.dedup();
    ips
}
