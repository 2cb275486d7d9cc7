use std::{sync::Arc, time::Instant};

use tracing::{debug, trace};

use crate::{config::SizingFlags, resize::ResizeDecision, resource};

/// Decides whether and by how much the heap should change. Evaluation is total:
/// when nothing should happen the zero decision is returned.
pub trait HeapSizingPolicy: Send + Sync {
    fn evaluate_heap_resize(&self) -> ResizeDecision;
}

/// Capacity figures of a heap at one point in time, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapUsage {
    pub region_size: usize,
    pub committed_bytes: usize,
    pub used_bytes: usize,
    pub reserved_bytes: usize,
    pub min_bytes: usize,
    /// Shrink already requested but not yet carried out by the heap
    pub pending_shrink_bytes: usize,
}

impl HeapUsage {
    pub fn committed_regions(&self) -> usize {
        if self.region_size == 0 {
            return 0;
        }
        self.committed_bytes / self.region_size
    }
}

/// Read side of a heap, as far as sizing decisions are concerned.
pub trait HeapState: Send + Sync {
    fn usage(&self) -> HeapUsage;
    /// Calls `f` with the index of every free committed region that has not been
    /// touched since `idle_since`.
    fn for_each_idle_region(&self, idle_since: Instant, f: &mut dyn FnMut(usize));
}

/// Grows the heap when committed memory is nearly full and gives back regions that
/// stayed idle for longer than the uncommit delay.
pub struct TimeBasedSizingPolicy<S: HeapState + ?Sized> {
    heap: Arc<S>,
    flags: Arc<SizingFlags>,
}

impl<S: HeapState + ?Sized> TimeBasedSizingPolicy<S> {
    pub fn new(heap: Arc<S>, flags: Arc<SizingFlags>) -> Self {
        Self { heap, flags }
    }

    /// Returns true if committed memory should grow.
    pub fn should_grow(&self, usage: &HeapUsage) -> bool {
        if usage.committed_bytes == 0 {
            return usage.reserved_bytes > 0;
        }
        let occupancy = usage.used_bytes as f64 / usage.committed_bytes as f64;
        occupancy >= self.flags.growth_threshold()
    }

    fn grow_amount(&self, usage: &HeapUsage) -> usize {
        let target = (usage.committed_bytes.max(usage.region_size) as f64
            * self.flags.growth_factor())
        .ceil() as usize;
        let target = target.min(usage.reserved_bytes);
        let amount = target.saturating_sub(usage.committed_bytes);
        round_up(amount, usage.region_size).min(usage.reserved_bytes - usage.committed_bytes)
    }

    fn shrink_amount(&self, usage: &HeapUsage) -> usize {
        let idle_since = match Instant::now().checked_sub(self.flags.uncommit_delay()) {
            Some(instant) => instant,
            // the clock has not been running long enough for anything to be idle
            None => return 0,
        };

        let found = resource::with_mark(|rm| {
            let candidates = rm.allocate_slice::<u32>(usage.committed_regions());
            let mut found = 0;
            self.heap.for_each_idle_region(idle_since, &mut |index| {
                if found < candidates.len() {
                    candidates[found] = index as u32;
                    found += 1;
                }
            });
            trace!(target: "gc::sizing", "Uncommit candidates found: {:?}", &candidates[..found]);
            found
        });
        debug!(target: "gc::sizing", "Uncommit candidates: {} regions", found);

        // regions already promised to a pending shrink are idle too, do not count them twice
        let pending = usage.pending_shrink_bytes / usage.region_size;
        let available = found.saturating_sub(pending);
        if available < self.flags.min_regions_to_uncommit() {
            if pending > 0 {
                debug!(target: "gc::sizing", "{} regions already pending uncommit", pending);
            }
            return 0;
        }

        let shrinkable = usage
            .committed_bytes
            .saturating_sub(usage.min_bytes)
            .saturating_sub(usage.pending_shrink_bytes);
        (available * usage.region_size).min(shrinkable - shrinkable % usage.region_size)
    }
}

impl<S: HeapState + ?Sized> HeapSizingPolicy for TimeBasedSizingPolicy<S> {
    fn evaluate_heap_resize(&self) -> ResizeDecision {
        let usage = self.heap.usage();
        if usage.region_size == 0 {
            return ResizeDecision::NONE;
        }

        if self.should_grow(&usage) {
            let amount = self.grow_amount(&usage);
            if amount > 0 {
                return ResizeDecision::grow(amount);
            }
        }

        ResizeDecision::shrink(self.shrink_amount(&usage))
    }
}

fn round_up(x: usize, y: usize) -> usize {
    if y == 0 {
        return x;
    }
    ((x + y - 1) / y) * y
}
