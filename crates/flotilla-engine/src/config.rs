//! Engine configuration.
//!
//! Tunables come from the environment with the documented defaults; the
//! daemon reads them once at startup. Unparseable values fall back to the
//! default with a warning rather than failing the boot.

use std::time::Duration;

use tracing::warn;

/// Runtime tunables for the orchestration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base hostname prepended to relative image references.
    pub registry_host: Option<String>,
    /// Host goes offline after this long without an inbound message.
    pub stale_threshold: Duration,
    /// Work item processing bound before the stuck sweep intervenes.
    pub work_timeout: Duration,
    /// Bounded work retries before permanent failure.
    pub max_attempts: u32,
    /// Wall-clock bound on a whole rollout.
    pub rollout_timeout: Duration,
    /// Fallback timer on DNS config acks.
    pub dns_ack_timeout: Duration,
    /// Fallback timer on routing config acks.
    pub caddy_ack_timeout: Duration,
    /// Allowed agent clock skew (clamped to the protocol maximum).
    pub clock_skew: Duration,
    /// Base path in backup storage; migrations are refused without one.
    pub backup_storage_path: Option<String>,
    /// Passed through verbatim to the external build system.
    pub build_timeout_minutes: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            registry_host: None,
            stale_threshold: Duration::from_millis(120_000),
            work_timeout: Duration::from_secs(5 * 60),
            max_attempts: 3,
            rollout_timeout: Duration::from_secs(10 * 60),
            dns_ack_timeout: Duration::from_millis(1_000),
            caddy_ack_timeout: Duration::from_millis(1_000),
            clock_skew: Duration::from_secs(60),
            backup_storage_path: None,
            build_timeout_minutes: None,
        }
    }
}

impl EngineConfig {
    /// Read the recognized environment keys over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            registry_host: std::env::var("REGISTRY_HOST").ok().filter(|s| !s.is_empty()),
            stale_threshold: Duration::from_millis(env_parse(
                "STALE_THRESHOLD_MS",
                defaults.stale_threshold.as_millis() as u64,
            )),
            work_timeout: Duration::from_secs(
                env_parse("WORK_TIMEOUT_MINUTES", defaults.work_timeout.as_secs() / 60) * 60,
            ),
            max_attempts: env_parse("MAX_ATTEMPTS", defaults.max_attempts),
            rollout_timeout: Duration::from_secs(
                env_parse(
                    "ROLLOUT_TIMEOUT_MINUTES",
                    defaults.rollout_timeout.as_secs() / 60,
                ) * 60,
            ),
            dns_ack_timeout: Duration::from_millis(env_parse(
                "DNS_ACK_TIMEOUT_MS",
                defaults.dns_ack_timeout.as_millis() as u64,
            )),
            caddy_ack_timeout: Duration::from_millis(env_parse(
                "CADDY_ACK_TIMEOUT_MS",
                defaults.caddy_ack_timeout.as_millis() as u64,
            )),
            clock_skew: defaults.clock_skew,
            backup_storage_path: std::env::var("BACKUP_STORAGE_PATH")
                .ok()
                .filter(|s| !s.is_empty()),
            build_timeout_minutes: std::env::var("BUILD_TIMEOUT_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable env value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.stale_threshold, Duration::from_secs(120));
        assert_eq!(config.work_timeout, Duration::from_secs(300));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.rollout_timeout, Duration::from_secs(600));
        assert_eq!(config.dns_ack_timeout, Duration::from_secs(1));
        assert_eq!(config.caddy_ack_timeout, Duration::from_secs(1));
        assert_eq!(config.clock_skew, Duration::from_secs(60));
    }
}
