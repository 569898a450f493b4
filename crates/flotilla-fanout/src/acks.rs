//! Ack collection for config pushes.
//!
//! A push registers the set of hosts it expects acks from and gets a
//! oneshot that resolves when every expected host acked, or immediately on
//! the first negative ack. The fallback timer lives with the caller; on
//! expiry the wait is cleared and late acks are merely logged.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use flotilla_session::ConfigKind;

/// Terminal result of one config push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Every expected agent acknowledged in time.
    Acked,
    /// The fallback timer fired first; the push proceeds regardless.
    TimedOut,
    /// An agent reported it could not apply the config.
    Rejected { host_id: String, message: String },
}

struct WaitState {
    expected: HashSet<String>,
    done: oneshot::Sender<PushOutcome>,
}

/// Registry of at most one in-flight wait per config kind.
#[derive(Default)]
pub struct AckRegistry {
    dns: Mutex<Option<WaitState>>,
    caddy: Mutex<Option<WaitState>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: ConfigKind) -> &Mutex<Option<WaitState>> {
        match kind {
            ConfigKind::Dns => &self.dns,
            ConfigKind::Caddy => &self.caddy,
        }
    }

    /// Begin a wait for acks from `expected`. Resolves immediately when the
    /// expected set is empty. Replaces any stale wait of the same kind.
    pub fn begin_wait(
        &self,
        kind: ConfigKind,
        expected: HashSet<String>,
    ) -> oneshot::Receiver<PushOutcome> {
        let (tx, rx) = oneshot::channel();
        if expected.is_empty() {
            let _ = tx.send(PushOutcome::Acked);
            return rx;
        }
        let mut slot = self.slot(kind).lock().expect("ack lock");
        *slot = Some(WaitState { expected, done: tx });
        rx
    }

    /// Shrink an in-flight wait to the hosts a push actually reached.
    /// Completes the wait if nothing is left to wait for.
    pub fn restrict_to(&self, kind: ConfigKind, delivered: &[String]) {
        let mut slot = self.slot(kind).lock().expect("ack lock");
        if let Some(state) = slot.as_mut() {
            state.expected.retain(|h| delivered.contains(h));
            if state.expected.is_empty() {
                if let Some(state) = slot.take() {
                    let _ = state.done.send(PushOutcome::Acked);
                }
            }
        }
    }

    /// Record an agent's ack. Unsolicited acks (no wait in flight, or a
    /// host that was never expected) are logged and dropped.
    pub fn record(&self, kind: ConfigKind, host_id: &str, success: bool, message: &str) {
        let mut slot = self.slot(kind).lock().expect("ack lock");
        let Some(state) = slot.as_mut() else {
            debug!(host_id, ?kind, "unsolicited config ack ignored");
            return;
        };

        if !success {
            if let Some(state) = slot.take() {
                warn!(host_id, ?kind, message, "config rejected by agent");
                let _ = state.done.send(PushOutcome::Rejected {
                    host_id: host_id.to_string(),
                    message: message.to_string(),
                });
            }
            return;
        }

        if !state.expected.remove(host_id) {
            debug!(host_id, ?kind, "ack from unexpected host ignored");
            return;
        }
        if state.expected.is_empty() {
            if let Some(state) = slot.take() {
                let _ = state.done.send(PushOutcome::Acked);
            }
        }
    }

    /// Abandon the in-flight wait (fallback timer fired).
    pub fn clear(&self, kind: ConfigKind) {
        let mut slot = self.slot(kind).lock().expect("ack lock");
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(hosts: &[&str]) -> HashSet<String> {
        hosts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_acks_resolve_wait() {
        let registry = AckRegistry::new();
        let mut rx = registry.begin_wait(ConfigKind::Dns, expected(&["a", "b"]));

        registry.record(ConfigKind::Dns, "a", true, "");
        assert!(rx.try_recv().is_err());

        registry.record(ConfigKind::Dns, "b", true, "");
        assert_eq!(rx.try_recv().unwrap(), PushOutcome::Acked);
    }

    #[test]
    fn negative_ack_resolves_immediately() {
        let registry = AckRegistry::new();
        let mut rx = registry.begin_wait(ConfigKind::Caddy, expected(&["a", "b"]));

        registry.record(ConfigKind::Caddy, "b", false, "route conflict");
        match rx.try_recv().unwrap() {
            PushOutcome::Rejected { host_id, message } => {
                assert_eq!(host_id, "b");
                assert_eq!(message, "route conflict");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn empty_expectation_resolves_instantly() {
        let registry = AckRegistry::new();
        let mut rx = registry.begin_wait(ConfigKind::Dns, HashSet::new());
        assert_eq!(rx.try_recv().unwrap(), PushOutcome::Acked);
    }

    #[test]
    fn restrict_to_delivered_hosts() {
        let registry = AckRegistry::new();
        let mut rx = registry.begin_wait(ConfigKind::Dns, expected(&["a", "b", "c"]));

        // Only "a" actually received the frame.
        registry.restrict_to(ConfigKind::Dns, &["a".to_string()]);
        registry.record(ConfigKind::Dns, "a", true, "");
        assert_eq!(rx.try_recv().unwrap(), PushOutcome::Acked);
    }

    #[test]
    fn dns_and_caddy_waits_are_independent() {
        let registry = AckRegistry::new();
        let mut dns_rx = registry.begin_wait(ConfigKind::Dns, expected(&["a"]));
        let mut caddy_rx = registry.begin_wait(ConfigKind::Caddy, expected(&["a"]));

        registry.record(ConfigKind::Dns, "a", true, "");
        assert_eq!(dns_rx.try_recv().unwrap(), PushOutcome::Acked);
        assert!(caddy_rx.try_recv().is_err());
    }

    #[test]
    fn late_acks_after_clear_are_ignored() {
        let registry = AckRegistry::new();
        let mut rx = registry.begin_wait(ConfigKind::Dns, expected(&["a"]));
        registry.clear(ConfigKind::Dns);

        registry.record(ConfigKind::Dns, "a", true, "");
        assert!(rx.try_recv().is_err());
    }
}
