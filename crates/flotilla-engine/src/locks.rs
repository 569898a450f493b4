//! Per-service serialization.
//!
//! `Service.ID` is the logical lock key: rollout triggering, migration
//! triggering, and fan-out driven by one service's state changes must not
//! interleave for that service. Locks are created on first use and kept
//! for the process lifetime (the key space is the service set, which is
//! small).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes, one per service.
#[derive(Clone, Default)]
pub struct ServiceLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ServiceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a service, waiting if another task holds it.
    pub async fn lock(&self, service_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("service lock table");
            Arc::clone(
                map.entry(service_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}
