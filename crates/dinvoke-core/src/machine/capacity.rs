use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::MetricsHandle;

/// Executor accounting for one machine. `busy` never exceeds `total`.
pub(crate) struct Capacity {
    machine: String,
    total: u32,
    busy: AtomicU32,
    metrics: MetricsHandle,
}

impl Capacity {
    pub(crate) fn new(machine: impl Into<String>, total: u32, metrics: MetricsHandle) -> Arc<Self> {
        let capacity = Arc::new(Self {
            machine: machine.into(),
            total,
            busy: AtomicU32::new(0),
            metrics,
        });
        capacity.report(0);
        capacity
    }

    #[inline]
    pub(crate) fn total(&self) -> u32 {
        self.total
    }

    #[inline]
    pub(crate) fn busy(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn metrics(&self) -> &MetricsHandle {
        &self.metrics
    }

    #[inline]
    pub(crate) fn machine(&self) -> &str {
        &self.machine
    }

    /// Atomically claim `weight` slots, or return how many were available.
    pub(crate) fn reserve(self: &Arc<Self>, weight: u32) -> Result<Reservation, u32> {
        let total = self.total;
        let prev = self
            .busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |busy| {
                let free = total.saturating_sub(busy);
                (weight <= free).then_some(busy + weight)
            })
            .map_err(|busy| total.saturating_sub(busy))?;

        self.report(prev + weight);
        Ok(Reservation {
            capacity: Arc::clone(self),
            weight,
            armed: true,
        })
    }

    pub(crate) fn release(&self, weight: u32) {
        let prev = self
            .busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |busy| {
                Some(busy.saturating_sub(weight))
            })
            .unwrap_or_else(|busy| busy);
        self.report(prev.saturating_sub(weight));
    }

    fn report(&self, busy: u32) {
        self.metrics.capacity_changed(&self.machine, busy, self.total);
    }
}

/// Claimed slots; released on drop unless handed off with [`Reservation::detach`].
pub(crate) struct Reservation {
    capacity: Arc<Capacity>,
    weight: u32,
    armed: bool,
}

impl Reservation {
    /// Stop releasing on drop; the caller becomes responsible for calling [`Capacity::release`].
    pub(crate) fn detach(mut self) -> (Arc<Capacity>, u32) {
        self.armed = false;
        (Arc::clone(&self.capacity), self.weight)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.capacity.release(self.weight);
        }
    }
}
