//! In-memory session table.
//!
//! One entry per connected host, never persisted. The table owns the
//! outbound send primitive (per-session sequence stamping, best-effort
//! delivery) and the inbound replay defense (strictly increasing agent
//! sequences). A second connection from the same host evicts the first;
//! eviction plus installation is one atomic table operation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use flotilla_wire::proto::{self, control_frame::Body};

use crate::error::{SessionError, SessionResult};

/// Result of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No active session, or the session's channel is gone/full.
    Dropped,
}

/// Snapshot of one session for observers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub host_id: String,
    pub session_id: String,
    pub connected_at: u64,
    pub is_proxy: bool,
    pub last_agent_seq: u64,
}

struct SessionEntry {
    session_id: String,
    connected_at: u64,
    is_proxy: bool,
    last_agent_seq: u64,
    outgoing_seq: u64,
    tx: mpsc::Sender<proto::ControlFrame>,
}

/// Thread-safe registry of active agent sessions.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session for a host, evicting any existing one.
    ///
    /// The evicted session receives a fatal error frame and its channel is
    /// dropped, which ends its outbound stream. Returns the new session ID.
    pub fn install(
        &self,
        host_id: &str,
        is_proxy: bool,
        now_ms: u64,
        tx: mpsc::Sender<proto::ControlFrame>,
    ) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write().expect("session lock");

        if let Some(old) = sessions.remove(host_id) {
            warn!(%host_id, old_session = %old.session_id, "evicting duplicate session");
            let frame = proto::ControlFrame {
                sequence: old.outgoing_seq + 1,
                body: Some(Body::Error(proto::Error {
                    code: 409,
                    message: "superseded by a newer session".to_string(),
                    fatal: true,
                })),
            };
            // Best effort; the channel drop is what ends the old stream.
            let _ = old.tx.try_send(frame);
        }

        sessions.insert(
            host_id.to_string(),
            SessionEntry {
                session_id: session_id.clone(),
                connected_at: now_ms,
                is_proxy,
                last_agent_seq: 0,
                outgoing_seq: 0,
                tx,
            },
        );
        info!(%host_id, %session_id, "session installed");
        session_id
    }

    /// Remove a session, but only if it is still the current one for the
    /// host (an evicted reader must not tear down its replacement).
    pub fn remove_if_current(&self, host_id: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().expect("session lock");
        match sessions.get(host_id) {
            Some(entry) if entry.session_id == session_id => {
                sessions.remove(host_id);
                debug!(%host_id, %session_id, "session removed");
                true
            }
            _ => false,
        }
    }

    /// Validate and record an inbound sequence number.
    ///
    /// Rejects replays (sequence ≤ last accepted) and messages arriving on
    /// a superseded session.
    pub fn accept_inbound(
        &self,
        host_id: &str,
        session_id: &str,
        sequence: u64,
    ) -> SessionResult<()> {
        let mut sessions = self.sessions.write().expect("session lock");
        let entry = sessions
            .get_mut(host_id)
            .ok_or_else(|| SessionError::NotConnected(host_id.to_string()))?;
        if entry.session_id != session_id {
            return Err(SessionError::Superseded(session_id.to_string()));
        }
        if sequence <= entry.last_agent_seq {
            return Err(SessionError::ReplayedSequence {
                got: sequence,
                last: entry.last_agent_seq,
            });
        }
        entry.last_agent_seq = sequence;
        Ok(())
    }

    /// Send a control frame body to a host. Stamps the per-session
    /// outbound sequence. Drops (rather than blocks) when the host has no
    /// session or its channel is saturated.
    pub fn send(&self, host_id: &str, body: Body) -> SendOutcome {
        let mut sessions = self.sessions.write().expect("session lock");
        let Some(entry) = sessions.get_mut(host_id) else {
            return SendOutcome::Dropped;
        };
        entry.outgoing_seq += 1;
        let frame = proto::ControlFrame {
            sequence: entry.outgoing_seq,
            body: Some(body),
        };
        match entry.tx.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(_) => {
                // Roll the stamp back so sequences stay gapless on the wire.
                entry.outgoing_seq -= 1;
                SendOutcome::Dropped
            }
        }
    }

    /// Send a frame body to every connected host (optionally proxies only).
    /// Returns the hosts the frame was actually handed to.
    pub fn broadcast(&self, body: &Body, proxies_only: bool) -> Vec<String> {
        let mut sessions = self.sessions.write().expect("session lock");
        let mut delivered = Vec::new();
        for (host_id, entry) in sessions.iter_mut() {
            if proxies_only && !entry.is_proxy {
                continue;
            }
            entry.outgoing_seq += 1;
            let frame = proto::ControlFrame {
                sequence: entry.outgoing_seq,
                body: Some(body.clone()),
            };
            match entry.tx.try_send(frame) {
                Ok(()) => delivered.push(host_id.clone()),
                Err(_) => {
                    entry.outgoing_seq -= 1;
                    warn!(%host_id, "broadcast frame dropped");
                }
            }
        }
        delivered
    }

    /// Hosts with an active session.
    pub fn connected_hosts(&self) -> Vec<String> {
        let sessions = self.sessions.read().expect("session lock");
        let mut hosts: Vec<String> = sessions.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Proxy-tagged hosts with an active session.
    pub fn proxy_hosts(&self) -> Vec<String> {
        let sessions = self.sessions.read().expect("session lock");
        let mut hosts: Vec<String> = sessions
            .iter()
            .filter(|(_, e)| e.is_proxy)
            .map(|(h, _)| h.clone())
            .collect();
        hosts.sort();
        hosts
    }

    pub fn is_connected(&self, host_id: &str) -> bool {
        self.sessions.read().expect("session lock").contains_key(host_id)
    }

    /// Snapshot a session for observers.
    pub fn session_info(&self, host_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().expect("session lock");
        sessions.get(host_id).map(|e| SessionInfo {
            host_id: host_id.to_string(),
            session_id: e.session_id.clone(),
            connected_at: e.connected_at,
            is_proxy: e.is_proxy,
            last_agent_seq: e.last_agent_seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::Sender<proto::ControlFrame>,
        mpsc::Receiver<proto::ControlFrame>,
    ) {
        mpsc::channel(8)
    }

    fn work_body(id: &str) -> Body {
        Body::Work(proto::Work {
            id: id.to_string(),
            work_type: "deploy".to_string(),
            payload: vec![],
        })
    }

    #[test]
    fn install_and_send() {
        let mgr = SessionManager::new();
        let (tx, mut rx) = channel();
        mgr.install("h1", false, 1_000, tx);

        assert_eq!(mgr.send("h1", work_body("w1")), SendOutcome::Sent);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.sequence, 1);

        assert_eq!(mgr.send("h1", work_body("w2")), SendOutcome::Sent);
        assert_eq!(rx.try_recv().unwrap().sequence, 2);
    }

    #[test]
    fn send_to_unknown_host_drops() {
        let mgr = SessionManager::new();
        assert_eq!(mgr.send("ghost", work_body("w1")), SendOutcome::Dropped);
    }

    #[test]
    fn duplicate_connection_evicts_old() {
        let mgr = SessionManager::new();
        let (tx1, mut rx1) = channel();
        let first = mgr.install("h1", false, 1_000, tx1);

        let (tx2, mut rx2) = channel();
        let second = mgr.install("h1", false, 2_000, tx2);
        assert_ne!(first, second);

        // Old stream got a fatal error frame.
        let frame = rx1.try_recv().unwrap();
        match frame.body {
            Some(Body::Error(e)) => assert!(e.fatal),
            other => panic!("expected error frame, got {other:?}"),
        }

        // Sends now reach only the new session.
        mgr.send("h1", work_body("w1"));
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn new_session_sequence_restarts() {
        let mgr = SessionManager::new();
        let (tx1, _rx1) = channel();
        let first = mgr.install("h1", false, 1_000, tx1);
        for seq in 1..=10 {
            mgr.accept_inbound("h1", &first, seq).unwrap();
        }

        let (tx2, _rx2) = channel();
        let second = mgr.install("h1", false, 2_000, tx2);

        // The replacement session accepts seq 1 again.
        mgr.accept_inbound("h1", &second, 1).unwrap();
        // The evicted session is rejected outright.
        assert!(matches!(
            mgr.accept_inbound("h1", &first, 11),
            Err(SessionError::Superseded(_))
        ));
    }

    #[test]
    fn replayed_sequence_rejected() {
        let mgr = SessionManager::new();
        let (tx, _rx) = channel();
        let session = mgr.install("h1", false, 1_000, tx);

        mgr.accept_inbound("h1", &session, 5).unwrap();
        assert!(matches!(
            mgr.accept_inbound("h1", &session, 5),
            Err(SessionError::ReplayedSequence { got: 5, last: 5 })
        ));
        assert!(mgr.accept_inbound("h1", &session, 3).is_err());
        mgr.accept_inbound("h1", &session, 6).unwrap();
    }

    #[test]
    fn remove_if_current_ignores_stale_session() {
        let mgr = SessionManager::new();
        let (tx1, _rx1) = channel();
        let first = mgr.install("h1", false, 1_000, tx1);
        let (tx2, _rx2) = channel();
        let _second = mgr.install("h1", false, 2_000, tx2);

        // The evicted reader must not tear down the replacement.
        assert!(!mgr.remove_if_current("h1", &first));
        assert!(mgr.is_connected("h1"));
    }

    #[test]
    fn broadcast_targets_proxies_when_asked() {
        let mgr = SessionManager::new();
        let (tx1, mut rx1) = channel();
        mgr.install("worker", false, 1_000, tx1);
        let (tx2, mut rx2) = channel();
        mgr.install("edge", true, 1_000, tx2);

        let delivered = mgr.broadcast(&work_body("w"), true);
        assert_eq!(delivered, vec!["edge".to_string()]);
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());

        let delivered = mgr.broadcast(&work_body("w"), false);
        assert_eq!(delivered.len(), 2);
    }

    #[test]
    fn dropped_send_does_not_burn_sequence() {
        let mgr = SessionManager::new();
        let (tx, mut rx) = mpsc::channel(1);
        mgr.install("h1", false, 1_000, tx);

        assert_eq!(mgr.send("h1", work_body("w1")), SendOutcome::Sent);
        // Channel full: drop without stamping.
        assert_eq!(mgr.send("h1", work_body("w2")), SendOutcome::Dropped);

        rx.try_recv().unwrap();
        assert_eq!(mgr.send("h1", work_body("w3")), SendOutcome::Sent);
        assert_eq!(rx.try_recv().unwrap().sequence, 2);
    }
}
