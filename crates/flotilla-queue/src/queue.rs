//! Per-host FIFO work queue.
//!
//! Thin policy layer over the store's transactional queue primitives:
//! typed enqueue, claim-next, completion, agent-reported retry, and the
//! stuck-item sweep. At most one item per host is `processing` at a time;
//! the claim transaction enforces it.

use std::time::Duration;

use tracing::{debug, warn};

use flotilla_state::{StateStore, WorkItem, WorkStatus, epoch_ms};

use crate::error::QueueResult;
use crate::payload::WorkPayload;

/// Default per-item execution timeout.
pub const DEFAULT_WORK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default bounded attempts before an item fails permanently.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Handle to the per-host work queues.
#[derive(Clone)]
pub struct WorkQueue {
    state: StateStore,
    work_timeout: Duration,
    max_attempts: u32,
}

impl WorkQueue {
    /// Create a queue with default timeout and attempt bounds.
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            work_timeout: DEFAULT_WORK_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the stuck-item timeout.
    pub fn with_work_timeout(mut self, timeout: Duration) -> Self {
        self.work_timeout = timeout;
        self
    }

    /// Set the attempt bound.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Append a typed payload to a host's queue.
    pub fn enqueue(&self, host_id: &str, payload: &WorkPayload) -> QueueResult<WorkItem> {
        let item = self.state.enqueue_work(
            host_id,
            payload.work_type(),
            payload.encode()?,
            payload.service_id().map(str::to_string),
            payload.deployment_id().map(str::to_string),
            epoch_ms(),
        )?;
        debug!(id = %item.id, host_id, "enqueued");
        Ok(item)
    }

    /// Claim the oldest pending item for a host, if the host is idle.
    ///
    /// Returns `None` both when the queue is empty and when an item is
    /// already in flight for this host.
    pub fn claim_next(&self, host_id: &str) -> QueueResult<Option<WorkItem>> {
        match self.state.claim_next_work(host_id, epoch_ms()) {
            Ok(item) => Ok(item),
            Err(flotilla_state::StateError::HostBusy(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The item currently in flight for a host.
    pub fn processing(&self, host_id: &str) -> QueueResult<Option<WorkItem>> {
        Ok(self.state.processing_work(host_id)?)
    }

    /// Get an item by ID.
    pub fn get(&self, id: &str) -> QueueResult<Option<WorkItem>> {
        Ok(self.state.get_work(id)?)
    }

    /// Transition processing → completed.
    pub fn complete(&self, id: &str) -> QueueResult<WorkItem> {
        Ok(self.state.set_work_status(id, WorkStatus::Completed)?)
    }

    /// Transition processing → failed permanently (no retry).
    pub fn fail(&self, id: &str) -> QueueResult<WorkItem> {
        Ok(self.state.set_work_status(id, WorkStatus::Failed)?)
    }

    /// Agent reported failure: requeue while attempts remain, else fail.
    /// Returns the updated item; `status == Failed` means exhausted.
    pub fn fail_with_retry(&self, id: &str) -> QueueResult<WorkItem> {
        let item = self.state.retry_or_fail_work(id, self.max_attempts)?;
        if item.status == WorkStatus::Failed {
            warn!(id = %item.id, attempts = item.attempts, "work failed permanently");
        }
        Ok(item)
    }

    /// Put a claimed item back at the head of the queue (send dropped).
    pub fn revert_to_pending(&self, id: &str) -> QueueResult<WorkItem> {
        Ok(self.state.revert_work_to_pending(id)?)
    }

    /// Sweep items stuck in `processing` past the timeout. Returns the
    /// items that failed permanently this sweep (their deployments are
    /// already tagged by the store).
    pub fn reclaim_stuck(&self) -> QueueResult<Vec<WorkItem>> {
        Ok(self.state.reclaim_stuck_work(
            epoch_ms(),
            self.work_timeout.as_millis() as u64,
            self.max_attempts,
        )?)
    }

    /// Drop every pending item tagged with a service (rollout abort).
    pub fn purge_pending_for_service(&self, service_id: &str) -> QueueResult<u32> {
        Ok(self.state.delete_pending_work_for_service(service_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_state::WorkType;

    fn test_queue() -> WorkQueue {
        WorkQueue::new(StateStore::open_in_memory().unwrap())
    }

    fn stop_payload(deployment: &str) -> WorkPayload {
        WorkPayload::Stop {
            deployment_id: deployment.into(),
            service_id: "svc".into(),
            container_id: None,
            rollout_id: None,
        }
    }

    #[test]
    fn enqueue_claim_complete() {
        let queue = test_queue();
        let item = queue.enqueue("h1", &stop_payload("d1")).unwrap();
        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.work_type, WorkType::Stop);
        assert_eq!(item.deployment_id.as_deref(), Some("d1"));

        let claimed = queue.claim_next("h1").unwrap().unwrap();
        assert_eq!(claimed.id, item.id);
        assert_eq!(claimed.status, WorkStatus::Processing);

        let done = queue.complete(&claimed.id).unwrap();
        assert_eq!(done.status, WorkStatus::Completed);
    }

    #[test]
    fn claim_returns_none_while_in_flight() {
        let queue = test_queue();
        queue.enqueue("h1", &stop_payload("d1")).unwrap();
        queue.enqueue("h1", &stop_payload("d2")).unwrap();

        assert!(queue.claim_next("h1").unwrap().is_some());
        // Second claim is a no-op until the first completes.
        assert!(queue.claim_next("h1").unwrap().is_none());

        let in_flight = queue.processing("h1").unwrap().unwrap();
        queue.complete(&in_flight.id).unwrap();
        assert!(queue.claim_next("h1").unwrap().is_some());
    }

    #[test]
    fn fifo_across_payload_kinds() {
        let queue = test_queue();
        queue.enqueue("h1", &stop_payload("first")).unwrap();
        queue.enqueue("h1", &WorkPayload::SyncDns {}).unwrap();
        queue.enqueue("h1", &stop_payload("third")).unwrap();

        let claimed = queue.claim_next("h1").unwrap().unwrap();
        let payload = WorkPayload::decode(&claimed.payload).unwrap();
        assert_eq!(payload, stop_payload("first"));
    }

    #[test]
    fn fail_with_retry_requeues_until_exhausted() {
        let queue = test_queue().with_max_attempts(2);
        let item = queue.enqueue("h1", &WorkPayload::SyncCaddy {}).unwrap();

        queue.claim_next("h1").unwrap().unwrap();
        let after = queue.fail_with_retry(&item.id).unwrap();
        assert_eq!(after.status, WorkStatus::Pending);

        queue.claim_next("h1").unwrap().unwrap();
        let after = queue.fail_with_retry(&item.id).unwrap();
        assert_eq!(after.status, WorkStatus::Failed);
    }

    #[test]
    fn revert_makes_item_claimable_again() {
        let queue = test_queue();
        let item = queue.enqueue("h1", &stop_payload("d1")).unwrap();
        queue.claim_next("h1").unwrap().unwrap();

        let reverted = queue.revert_to_pending(&item.id).unwrap();
        assert_eq!(reverted.status, WorkStatus::Pending);
        assert!(reverted.started_at.is_none());

        assert!(queue.claim_next("h1").unwrap().is_some());
    }

    #[test]
    fn purge_pending_for_service() {
        let queue = test_queue();
        queue
            .enqueue(
                "h1",
                &WorkPayload::CleanupVolumes {
                    service_id: "svc".into(),
                    keep: vec![],
                },
            )
            .unwrap();
        queue.enqueue("h1", &WorkPayload::SyncDns {}).unwrap();

        assert_eq!(queue.purge_pending_for_service("svc").unwrap(), 1);
    }
}
