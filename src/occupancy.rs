use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-local count of busy dispatch slots.
///
/// Not persisted; used for admission decisions and observability only. The
/// returned guard releases the slot on drop so a panicking dispatch cannot
/// leak occupancy.
#[derive(Clone)]
pub struct OccupancyTracker {
    busy: Arc<AtomicUsize>,
    pool_size: usize,
}

impl OccupancyTracker {
    pub fn new(pool_size: usize) -> Self {
        Self {
            busy: Arc::new(AtomicUsize::new(0)),
            pool_size,
        }
    }

    pub fn acquire(&self) -> OccupancyGuard {
        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        crate::telemetry::set_worker_pool_occupancy(busy);
        OccupancyGuard {
            busy: Arc::clone(&self.busy),
        }
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Busy slots as a fraction of the pool, for logs.
    pub fn utilization(&self) -> f64 {
        if self.pool_size == 0 {
            return 0.0;
        }
        self.busy() as f64 / self.pool_size as f64
    }
}

pub struct OccupancyGuard {
    busy: Arc<AtomicUsize>,
}

impl Drop for OccupancyGuard {
    fn drop(&mut self) {
        let busy = self.busy.fetch_sub(1, Ordering::SeqCst) - 1;
        crate::telemetry::set_worker_pool_occupancy(busy);
    }
}
