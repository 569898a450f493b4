//! Spread placement — balanced, deterministic replica distribution.
//!
//! Given a desired total and the eligible hosts, every host receives
//! ⌊N/|H|⌋ replicas and the remainder goes to the first hosts in HostID
//! order. The same inputs always produce the same plan.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{PlacementError, PlacementResult};

/// One host's share of a spread plan.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpreadPlacement {
    pub host_id: String,
    pub count: u32,
}

/// Compute a spread plan for `total` replicas over the eligible hosts.
///
/// `exclude` removes hosts from consideration (offline hosts during
/// recovery, operator exclusions). Hosts with a zero share are omitted
/// from the result.
pub fn spread(
    total: u32,
    hosts: &[String],
    exclude: &HashSet<String>,
) -> PlacementResult<Vec<SpreadPlacement>> {
    let mut eligible: Vec<&String> = hosts.iter().filter(|h| !exclude.contains(*h)).collect();
    if eligible.is_empty() {
        return Err(PlacementError::NoEligibleHosts);
    }
    eligible.sort();
    eligible.dedup();

    let n = eligible.len() as u32;
    let base = total / n;
    let remainder = (total % n) as usize;

    let placements: Vec<SpreadPlacement> = eligible
        .iter()
        .enumerate()
        .map(|(i, host)| SpreadPlacement {
            host_id: (*host).clone(),
            count: base + u32::from(i < remainder),
        })
        .filter(|p| p.count > 0)
        .collect();

    debug!(total, hosts = n, placements = placements.len(), "spread computed");
    Ok(placements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn counts(placements: &[SpreadPlacement]) -> Vec<u32> {
        placements.iter().map(|p| p.count).collect()
    }

    #[test]
    fn even_split() {
        let plan = spread(4, &hosts(&["a", "b"]), &HashSet::new()).unwrap();
        assert_eq!(counts(&plan), vec![2, 2]);
    }

    #[test]
    fn remainder_goes_to_first_hosts_by_id() {
        let plan = spread(5, &hosts(&["c", "a", "b"]), &HashSet::new()).unwrap();
        // Sorted: a, b, c — a and b take the extra replica.
        assert_eq!(plan[0].host_id, "a");
        assert_eq!(counts(&plan), vec![2, 2, 1]);
    }

    #[test]
    fn sum_equals_total_and_balanced() {
        for total in 1..=20u32 {
            for host_count in 1..=5usize {
                let ids: Vec<String> = (0..host_count).map(|i| format!("h{i}")).collect();
                let plan = spread(total, &ids, &HashSet::new()).unwrap();

                let sum: u32 = plan.iter().map(|p| p.count).sum();
                assert_eq!(sum, total);

                let max = plan.iter().map(|p| p.count).max().unwrap();
                let min = plan.iter().map(|p| p.count).min().unwrap_or(max);
                assert!(max - min <= 1, "unbalanced: total={total} hosts={host_count}");
            }
        }
    }

    #[test]
    fn exclusions_remove_hosts() {
        let exclude: HashSet<String> = ["b".to_string()].into();
        let plan = spread(3, &hosts(&["a", "b", "c"]), &exclude).unwrap();
        assert!(plan.iter().all(|p| p.host_id != "b"));
        assert_eq!(plan.iter().map(|p| p.count).sum::<u32>(), 3);
    }

    #[test]
    fn fewer_replicas_than_hosts_omits_zero_shares() {
        let plan = spread(2, &hosts(&["a", "b", "c"]), &HashSet::new()).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(counts(&plan), vec![1, 1]);
    }

    #[test]
    fn no_eligible_hosts_is_an_error() {
        let err = spread(1, &hosts(&[]), &HashSet::new()).unwrap_err();
        assert!(matches!(err, PlacementError::NoEligibleHosts));

        let exclude: HashSet<String> = ["a".to_string()].into();
        assert!(spread(1, &hosts(&["a"]), &exclude).is_err());
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let a = spread(7, &hosts(&["x", "y", "z"]), &HashSet::new()).unwrap();
        let b = spread(7, &hosts(&["z", "y", "x"]), &HashSet::new()).unwrap();
        assert_eq!(a, b);
    }
}
