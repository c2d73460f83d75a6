//! Bounds the number of concurrent pulls issued by one consumer.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A counting gate shared by every shard worker of a consumer.
///
/// Cloning yields another handle to the same slots.
#[derive(Debug, Clone)]
pub struct FetchThrottle {
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl FetchThrottle {
    /// Create a throttle allowing `capacity` concurrent pulls.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, since no pull could ever proceed.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "fetch throttle capacity must be non-zero");
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    ///
    /// The slot is returned when the permit is dropped or [released](FetchPermit::release).
    pub async fn acquire(&self) -> FetchPermit {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            // the semaphore is owned by this throttle and never closed
            .expect("fetch throttle semaphore closed");
        FetchPermit { _permit: permit }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots not currently held.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

/// One in-flight pull.
#[derive(Debug)]
pub struct FetchPermit {
    _permit: OwnedSemaphorePermit,
}

impl FetchPermit {
    /// Return the slot.
    pub fn release(self) {}
}
