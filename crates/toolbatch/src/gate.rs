//! Admission control and the per-batch deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::BatchError;

/// Bounds the number of batches executing at once.
#[derive(Debug)]
pub struct ConcurrencyGate {
    slots: Arc<Semaphore>,
    total: usize,
    deadline: Duration,
}

/// Slot usage for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub available_slots: usize,
    pub total_slots: usize,
    pub active_requests: usize,
}

/// An admission ticket. The slot is returned when the guard is dropped, on
/// every exit path.
#[derive(Debug)]
pub struct SlotGuard {
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    /// Return the slot now.
    pub fn release(self) {}
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize, deadline: Duration) -> Self {
        let total = max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(total)),
            total,
            deadline,
        }
    }

    /// Wait for a free slot. Fails only once the gate is closed.
    pub async fn admit(&self) -> Result<SlotGuard, BatchError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BatchError::Unavailable("admission gate is closed".into()))?;
        Ok(SlotGuard { _permit: permit })
    }

    /// Run `work` under the deadline. Exceeding it yields a single
    /// [`BatchError::Timeout`]; the work itself is dropped, not stopped.
    pub async fn run<F, T>(&self, work: F) -> Result<T, BatchError>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.deadline, work)
            .await
            .map_err(|_| BatchError::Timeout(self.deadline))
    }

    /// Refuse all future admissions. Batches already admitted finish.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn stats(&self) -> GateStats {
        let available = self.slots.available_permits();
        GateStats {
            available_slots: available,
            total_slots: self.total,
            active_requests: self.total.saturating_sub(available),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let gate = ConcurrencyGate::new(2, Duration::from_secs(1));
        let a = gate.admit().await.unwrap();
        let _b = gate.admit().await.unwrap();
        assert_eq!(gate.stats().available_slots, 0);
        assert_eq!(gate.stats().active_requests, 2);
        a.release();
        assert_eq!(gate.stats().available_slots, 1);
    }

    #[tokio::test]
    async fn admit_waits_for_a_free_slot() {
        let gate = Arc::new(ConcurrencyGate::new(1, Duration::from_secs(1)));
        let held = gate.admit().await.unwrap();
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.admit().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_a_single_timeout() {
        let gate = ConcurrencyGate::new(1, Duration::from_millis(100));
        let _slot = gate.admit().await.unwrap();
        let err = gate
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(gate.run(async { 7 }).await.is_ok());
    }

    #[tokio::test]
    async fn closed_gate_is_unavailable() {
        let gate = ConcurrencyGate::new(1, Duration::from_secs(1));
        gate.close();
        let err = gate.admit().await.unwrap_err();
        assert!(matches!(err, BatchError::Unavailable(_)));
    }
}
