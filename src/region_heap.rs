use std::{
    io,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    globals::*,
    mmap::Mmap,
    operation::{ExpandError, HeapExpander, HeapShrinker},
    policy::{HeapState, HeapUsage},
    workers::WorkerSet,
};

#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    #[error("region size {0} must be a power of two and a multiple of the page size")]
    RegionSize(usize),
    #[error("heap sizes must satisfy min <= initial <= max (min {min}, initial {initial}, max {max})")]
    Sizes {
        min: usize,
        initial: usize,
        max: usize,
    },
    #[error("failed to reserve {size} bytes for the heap")]
    Reserve {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to commit the initial heap")]
    Commit(#[from] ExpandError),
}

/// Options for heap constructor. Sizes are rounded up to whole regions.
#[derive(Debug, Clone)]
pub struct RegionHeapOptions {
    pub region_size: usize,
    /// Committed capacity right after construction
    pub initial_size: usize,
    /// Shrinking never goes below this
    pub min_size: usize,
    /// Reserved address space, growing never goes above this
    pub max_size: usize,
}

impl Default for RegionHeapOptions {
    fn default() -> Self {
        Self {
            region_size: DEFAULT_REGION_SIZE,
            initial_size: 16 * M,
            min_size: 8 * M,
            max_size: 256 * M,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Uncommitted,
    /// Claimed by an expansion that is committing and pretouching it
    Committing,
    Free,
    InUse,
}

struct Region {
    state: RegionState,
    last_active: Instant,
}

/// Heap made of fixed-size regions carved out of one reservation. Regions are
/// committed on expansion and uncommitted, longest idle first, when a pending
/// shrink is serviced at a safe point.
pub struct RegionHeap {
    mmap: Mmap,
    region_size: usize,
    min_regions: usize,
    regions: Mutex<Vec<Region>>,
    pending_shrink: AtomicUsize,
}

impl RegionHeap {
    pub fn new(options: RegionHeapOptions) -> Result<Self, HeapError> {
        let region_size = options.region_size;
        if !region_size.is_power_of_two() || region_size % PAGE_SIZE != 0 {
            return Err(HeapError::RegionSize(region_size));
        }
        let to_regions = |size: usize| (size + region_size - 1) / region_size;
        let (min, initial, max) = (
            to_regions(options.min_size),
            to_regions(options.initial_size),
            to_regions(options.max_size),
        );
        if max == 0 || min > initial || initial > max {
            return Err(HeapError::Sizes {
                min: options.min_size,
                initial: options.initial_size,
                max: options.max_size,
            });
        }

        let mmap = Mmap::new(max * region_size).map_err(|source| HeapError::Reserve {
            size: max * region_size,
            source,
        })?;
        let now = Instant::now();
        let regions = (0..max)
            .map(|_| Region {
                state: RegionState::Uncommitted,
                last_active: now,
            })
            .collect();
        let heap = Self {
            mmap,
            region_size,
            min_regions: min,
            regions: Mutex::new(regions),
            pending_shrink: AtomicUsize::new(0),
        };
        if let Some(initial) = NonZeroUsize::new(initial * region_size) {
            heap.commit(initial, &WorkerSet::new("heap-init", 1))?;
        }
        Ok(heap)
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn region_state(&self, index: usize) -> Option<RegionState> {
        self.regions.lock().get(index).map(|region| region.state)
    }

    pub fn region_start(&self, index: usize) -> *mut u8 {
        assert!(index * self.region_size < self.mmap.size());
        unsafe { self.mmap.start().add(index * self.region_size) }
    }

    pub fn pending_shrink(&self) -> usize {
        self.pending_shrink.load(Ordering::Acquire)
    }

    /// Hands a free committed region to the mutator. Returns `None` when every
    /// committed region is in use.
    pub fn allocate_region(&self) -> Option<usize> {
        let mut regions = self.regions.lock();
        let (index, region) = regions
            .iter_mut()
            .enumerate()
            .find(|(_, region)| region.state == RegionState::Free)?;
        region.state = RegionState::InUse;
        region.last_active = Instant::now();
        trace!(target: "gc::sizing", region = index, "Region state transition: Free -> InUse");
        Some(index)
    }

    /// Returns a region to the free pool. Returns `false` when the region was not in use.
    pub fn free_region(&self, index: usize) -> bool {
        let mut regions = self.regions.lock();
        match regions.get_mut(index) {
            Some(region) if region.state == RegionState::InUse => {
                region.state = RegionState::Free;
                region.last_active = Instant::now();
                trace!(target: "gc::sizing", region = index, "Region state transition: InUse -> Free");
                true
            }
            _ => false,
        }
    }

    /// Services a pending shrink request. Must be called at a safe point, that is
    /// when no mutator is in the middle of using a free region. Returns the number of
    /// bytes released.
    pub fn safepoint(&self) -> usize {
        let pending = self.pending_shrink.swap(0, Ordering::AcqRel);
        let wanted = pending / self.region_size;
        if wanted == 0 {
            return 0;
        }

        let mut regions = self.regions.lock();
        let committed = regions
            .iter()
            .filter(|region| matches!(region.state, RegionState::Free | RegionState::InUse))
            .count();
        let allowed = wanted.min(committed.saturating_sub(self.min_regions));

        let mut candidates = regions
            .iter()
            .enumerate()
            .filter(|(_, region)| region.state == RegionState::Free)
            .map(|(index, region)| (region.last_active, index))
            .collect::<Vec<_>>();
        candidates.sort_unstable();

        let mut released = 0;
        for (_, index) in candidates.into_iter().take(allowed) {
            match self
                .mmap
                .decommit(index * self.region_size, self.region_size)
            {
                Ok(()) => {
                    regions[index].state = RegionState::Uncommitted;
                    released += self.region_size;
                    trace!(target: "gc::sizing", region = index, "Region state transition: Free -> Uncommitted");
                }
                Err(error) => {
                    warn!(target: "gc::sizing", region = index, %error, "Failed to uncommit region");
                }
            }
        }

        if released > 0 {
            info!(
                target: "gc::sizing",
                "Memory released: {} bytes ({} of {} requested)",
                released,
                released / self.region_size,
                wanted
            );
        } else {
            debug!(target: "gc::sizing", "Shrink request of {} bytes dropped, nothing to uncommit", pending);
        }
        released
    }

    /// Commits enough uncommitted regions to cover `bytes`. The regions are claimed
    /// under the lock but committed and pretouched without it, so mutators keep
    /// allocating from the regions that are already there.
    fn commit(&self, bytes: NonZeroUsize, workers: &WorkerSet) -> Result<usize, ExpandError> {
        let claimed = self.claim_uncommitted(bytes)?;
        let result = self.commit_claimed(&claimed, workers);

        let mut regions = self.regions.lock();
        let (state, transition) = match result {
            Ok(()) => (RegionState::Free, "Committing -> Free"),
            Err(_) => (RegionState::Uncommitted, "Committing -> Uncommitted"),
        };
        let now = Instant::now();
        for &index in &claimed {
            regions[index] = Region {
                state,
                last_active: now,
            };
            trace!(target: "gc::sizing", region = index, "Region state transition: {}", transition);
        }
        result.map(|()| claimed.len() * self.region_size)
    }

    fn claim_uncommitted(&self, bytes: NonZeroUsize) -> Result<Vec<usize>, ExpandError> {
        let wanted = (bytes.get() + self.region_size - 1) / self.region_size;
        let mut regions = self.regions.lock();
        let uncommitted = regions
            .iter()
            .enumerate()
            .filter(|(_, region)| region.state == RegionState::Uncommitted)
            .map(|(index, _)| index)
            .take(wanted)
            .collect::<Vec<_>>();
        if uncommitted.len() < wanted {
            return Err(ExpandError::ExceedsReservation {
                requested: bytes.get(),
                available: uncommitted.len() * self.region_size,
            });
        }
        for &index in &uncommitted {
            regions[index].state = RegionState::Committing;
        }
        Ok(uncommitted)
    }

    fn commit_claimed(&self, claimed: &[usize], workers: &WorkerSet) -> Result<(), ExpandError> {
        for &index in claimed {
            self.mmap.commit(index * self.region_size, self.region_size)?;
        }
        workers.run_task(claimed.len(), |id, n| {
            for &index in claimed.iter().skip(id).step_by(n) {
                self.mmap
                    .pretouch(index * self.region_size, self.region_size, PAGE_SIZE);
            }
        });
        Ok(())
    }
}

impl HeapExpander for RegionHeap {
    fn expand(&self, bytes: NonZeroUsize, workers: &WorkerSet) -> Result<usize, ExpandError> {
        let committed = self.commit(bytes, workers)?;
        info!(
            target: "gc::sizing",
            "Heap expanded by {} bytes using {} workers",
            committed,
            workers.total_workers()
        );
        Ok(committed)
    }
}

impl HeapShrinker for RegionHeap {
    fn request_shrink(&self, bytes: NonZeroUsize) {
        let pending = self.pending_shrink.fetch_add(bytes.get(), Ordering::AcqRel) + bytes.get();
        debug!(target: "gc::sizing", "Heap shrink of {} bytes requested, {} pending", bytes, pending);
    }
}

impl HeapState for RegionHeap {
    fn usage(&self) -> HeapUsage {
        let regions = self.regions.lock();
        let mut usage = HeapUsage {
            region_size: self.region_size,
            reserved_bytes: regions.len() * self.region_size,
            min_bytes: self.min_regions * self.region_size,
            committed_bytes: 0,
            used_bytes: 0,
            pending_shrink_bytes: self.pending_shrink(),
        };
        for region in regions.iter() {
            match region.state {
                RegionState::Uncommitted | RegionState::Committing => {}
                RegionState::Free => usage.committed_bytes += self.region_size,
                RegionState::InUse => {
                    usage.committed_bytes += self.region_size;
                    usage.used_bytes += self.region_size;
                }
            }
        }
        usage
    }

    fn for_each_idle_region(&self, idle_since: Instant, f: &mut dyn FnMut(usize)) {
        let regions = self.regions.lock();
        for (index, region) in regions.iter().enumerate() {
            if region.state == RegionState::Free && region.last_active <= idle_since {
                f(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn heap(initial: usize, min: usize, max: usize) -> RegionHeap {
        RegionHeap::new(RegionHeapOptions {
            region_size: M,
            initial_size: initial * M,
            min_size: min * M,
            max_size: max * M,
        })
        .unwrap()
    }

    fn nz(bytes: usize) -> NonZeroUsize {
        NonZeroUsize::new(bytes).unwrap()
    }

    #[test]
    fn commits_initial_regions() {
        let heap = heap(4, 2, 16);
        let usage = heap.usage();
        assert_eq!(usage.committed_bytes, 4 * M);
        assert_eq!(usage.used_bytes, 0);
        assert_eq!(usage.reserved_bytes, 16 * M);
        assert_eq!(usage.min_bytes, 2 * M);
        assert_eq!(heap.region_state(3), Some(RegionState::Free));
        assert_eq!(heap.region_state(4), Some(RegionState::Uncommitted));
    }

    #[test]
    fn rejects_bad_options() {
        let bad_region = RegionHeap::new(RegionHeapOptions {
            region_size: 3000,
            ..Default::default()
        });
        assert!(matches!(bad_region, Err(HeapError::RegionSize(3000))));

        let bad_sizes = RegionHeap::new(RegionHeapOptions {
            region_size: M,
            initial_size: 4 * M,
            min_size: 8 * M,
            max_size: 16 * M,
        });
        assert!(matches!(bad_sizes, Err(HeapError::Sizes { .. })));
    }

    #[test]
    fn expand_rounds_up_to_regions() {
        let heap = heap(2, 1, 8);
        let workers = WorkerSet::new("expand", 4);
        assert_eq!(heap.expand(nz(M + 1), &workers).unwrap(), 2 * M);
        assert_eq!(heap.usage().committed_bytes, 4 * M);
    }

    #[test]
    fn expand_fails_past_the_reservation() {
        let heap = heap(6, 1, 8);
        let err = heap
            .expand(nz(4 * M), &WorkerSet::new("expand", 2))
            .unwrap_err();
        match err {
            ExpandError::ExceedsReservation {
                requested,
                available,
            } => {
                assert_eq!(requested, 4 * M);
                assert_eq!(available, 2 * M);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(heap.usage().committed_bytes, 6 * M);
    }

    #[test]
    fn shrink_is_deferred_to_safepoint() {
        let heap = heap(8, 2, 8);
        heap.request_shrink(nz(2 * M));
        heap.request_shrink(nz(M));
        assert_eq!(heap.pending_shrink(), 3 * M);
        assert_eq!(heap.usage().committed_bytes, 8 * M);
        assert_eq!(heap.usage().pending_shrink_bytes, 3 * M);

        assert_eq!(heap.safepoint(), 3 * M);
        assert_eq!(heap.pending_shrink(), 0);
        assert_eq!(heap.usage().committed_bytes, 5 * M);
        assert_eq!(heap.safepoint(), 0);
    }

    #[test]
    fn shrink_keeps_minimum_and_used_regions() {
        let heap = heap(4, 2, 8);
        let a = heap.allocate_region().unwrap();
        let b = heap.allocate_region().unwrap();
        let c = heap.allocate_region().unwrap();
        assert_eq!(heap.usage().used_bytes, 3 * M);

        heap.request_shrink(nz(4 * M));
        // only the single free region may go, and the minimum is 2 regions anyway
        assert_eq!(heap.safepoint(), M);
        assert_eq!(heap.region_state(a), Some(RegionState::InUse));
        assert_eq!(heap.region_state(b), Some(RegionState::InUse));
        assert_eq!(heap.region_state(c), Some(RegionState::InUse));
        assert!(heap.allocate_region().is_none());
    }

    #[test]
    fn longest_idle_regions_are_uncommitted_first() {
        let heap = heap(4, 1, 4);
        let regions = (0..4)
            .map(|_| heap.allocate_region().unwrap())
            .collect::<Vec<_>>();
        for &index in regions.iter().rev() {
            assert!(heap.free_region(index));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!heap.free_region(regions[0]));

        heap.request_shrink(nz(M));
        assert_eq!(heap.safepoint(), M);
        // region 3 was freed first
        assert_eq!(heap.region_state(3), Some(RegionState::Uncommitted));
        assert_eq!(heap.region_state(0), Some(RegionState::Free));
    }

    #[test]
    fn reports_idle_regions() {
        let heap = heap(4, 1, 8);
        let index = heap.allocate_region().unwrap();
        let cutoff = Instant::now();

        let mut idle = Vec::new();
        heap.for_each_idle_region(cutoff, &mut |index| idle.push(index));
        assert_eq!(idle, vec![1, 2, 3]);

        std::thread::sleep(Duration::from_millis(2));
        heap.free_region(index);
        idle.clear();
        heap.for_each_idle_region(cutoff, &mut |index| idle.push(index));
        assert_eq!(idle, vec![1, 2, 3]);

        idle.clear();
        heap.for_each_idle_region(Instant::now(), &mut |index| idle.push(index));
        assert_eq!(idle, vec![0, 1, 2, 3]);
    }

    #[test]
    fn expanded_memory_is_usable() {
        let heap = heap(1, 1, 4);
        heap.expand(nz(2 * M), &WorkerSet::new("expand", 2))
            .unwrap();
        let mut used = Vec::new();
        while let Some(index) = heap.allocate_region() {
            unsafe {
                heap.region_start(index).write_bytes(0xAB, M);
            }
            used.push(index);
        }
        assert_eq!(used.len(), 3);
    }

    #[test]
    fn allocation_proceeds_while_regions_commit() {
        let heap = RegionHeap::new(RegionHeapOptions {
            region_size: M,
            initial_size: 4 * M,
            min_size: M,
            max_size: 260 * M,
        })
        .unwrap();
        let workers = WorkerSet::new("expand", 1);

        let allocated = crossbeam_utils::thread::scope(|scope| {
            let expansion = scope.spawn(|_| heap.expand(nz(256 * M), &workers));

            let mut allocated = Vec::new();
            loop {
                match heap.region_state(4) {
                    Some(RegionState::Committing) => {
                        // the region lock is free while the expansion pretouches
                        allocated.push(heap.allocate_region());
                        let usage = heap.usage();
                        assert!(usage.committed_bytes <= 4 * M);
                        assert_eq!(usage.used_bytes, M);
                        break;
                    }
                    Some(RegionState::Free) => break,
                    _ => std::thread::yield_now(),
                }
            }
            assert_eq!(expansion.join().unwrap().unwrap(), 256 * M);
            allocated
        })
        .unwrap();

        assert_eq!(allocated, vec![Some(0)]);
        assert_eq!(heap.region_state(4), Some(RegionState::Free));
        assert_eq!(heap.usage().committed_bytes, 260 * M);
        assert_eq!(heap.region_state(0), Some(RegionState::InUse));
    }

    #[test]
    fn claimed_regions_are_not_committed_twice() {
        let heap = heap(2, 1, 8);
        let workers = WorkerSet::new("expand", 2);
        crossbeam_utils::thread::scope(|scope| {
            let first = scope.spawn(|_| heap.expand(nz(3 * M), &workers));
            let second = scope.spawn(|_| heap.expand(nz(3 * M), &workers));
            assert_eq!(first.join().unwrap().unwrap(), 3 * M);
            assert_eq!(second.join().unwrap().unwrap(), 3 * M);
        })
        .unwrap();
        assert_eq!(heap.usage().committed_bytes, 8 * M);
        assert!(heap.expand(nz(M), &workers).is_err());
    }
}
