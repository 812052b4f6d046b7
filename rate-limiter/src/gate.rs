//! Concurrency gate in front of the backend.
//!
//! A fixed number of slots guards the backend. Requests queue for a slot on a
//! FIFO-fair semaphore. Waiting never blocks the accept loop or the stats
//! endpoint.
//!
//! A slot is held by a [`GatePermit`] and released when the permit is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("timed out after {0:?} waiting for a slot")]
    Timeout(Duration),

    #[error("queue full ({limit} waiting)")]
    QueueFull { limit: usize },

    #[error("gate closed")]
    Closed,
}

/// Bounded counting gate with an optional bound on waiters.
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    /// 0 = unbounded.
    max_queue: usize,
    waiting: AtomicUsize,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize, max_queue: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            max_queue,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Requests waiting for a slot.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wake every waiter with [`AdmissionError::Closed`] and refuse new ones.
    /// Permits already handed out stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Acquire one slot, waiting at most `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<GatePermit, AdmissionError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => return Ok(GatePermit::new(permit, Duration::ZERO)),
            Err(TryAcquireError::Closed) => return Err(AdmissionError::Closed),
            Err(TryAcquireError::NoPermits) => {}
        }

        let _queued = self.enter_queue()?;
        let start = Instant::now();
        tracing::debug!(queued = self.queued(), "waiting for a gate slot");

        match tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(GatePermit::new(permit, start.elapsed())),
            Ok(Err(_closed)) => Err(AdmissionError::Closed),
            Err(_elapsed) => Err(AdmissionError::Timeout(timeout)),
        }
    }

    fn enter_queue(&self) -> Result<QueueSlot<'_>, AdmissionError> {
        let max_queue = self.max_queue;
        self.waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max_queue == 0 || n < max_queue).then_some(n + 1)
            })
            .map_err(|_| AdmissionError::QueueFull { limit: max_queue })?;
        Ok(QueueSlot {
            waiting: &self.waiting,
        })
    }
}

/// Keeps the waiter count honest when a queued request is cancelled.
struct QueueSlot<'a> {
    waiting: &'a AtomicUsize,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One held slot. Released on drop.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    waited: Duration,
}

impl GatePermit {
    fn new(permit: OwnedSemaphorePermit, waited: Duration) -> Self {
        Self {
            _permit: permit,
            waited,
        }
    }

    /// Time spent queued before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }
}
