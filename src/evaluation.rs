use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use tracing::{debug, error, warn};

use crate::{
    config::SizingFlags,
    operation::{HeapExpander, HeapShrinker},
    policy::HeapSizingPolicy,
    resize::ResizeDirection,
    resource,
    statistics::SizingStatistics,
    task_scheduler::ServiceTask,
    workers::WorkerSet,
};

pub const HEAP_EVALUATION_TASK_NAME: &str = "Periodic Heap Evaluation Task";

/// Recurring task that asks the sizing policy what to do with the heap and applies
/// the answer through the heap's capabilities.
///
/// The task always re-arms itself with the interval configured at the end of the
/// cycle. When time-based sizing is disabled the cycle is skipped but the task stays
/// registered, so enabling it later takes effect without restarting anything.
pub struct HeapEvaluationTask {
    policy: Arc<dyn HeapSizingPolicy>,
    expander: Arc<dyn HeapExpander>,
    shrinker: Arc<dyn HeapShrinker>,
    workers: Arc<WorkerSet>,
    flags: Arc<SizingFlags>,
    stats: Arc<SizingStatistics>,
}

impl HeapEvaluationTask {
    pub fn new(
        policy: Arc<dyn HeapSizingPolicy>,
        expander: Arc<dyn HeapExpander>,
        shrinker: Arc<dyn HeapShrinker>,
        workers: Arc<WorkerSet>,
        flags: Arc<SizingFlags>,
    ) -> Self {
        Self {
            policy,
            expander,
            shrinker,
            workers,
            flags,
            stats: Arc::new(SizingStatistics::new()),
        }
    }

    /// Task resizing `heap` through both of its capabilities.
    pub fn for_heap<H>(
        heap: Arc<H>,
        policy: Arc<dyn HeapSizingPolicy>,
        workers: Arc<WorkerSet>,
        flags: Arc<SizingFlags>,
    ) -> Self
    where
        H: HeapExpander + HeapShrinker + 'static,
    {
        Self::new(policy, heap.clone(), heap, workers, flags)
    }

    pub fn statistics(&self) -> Arc<SizingStatistics> {
        self.stats.clone()
    }

    fn evaluate(&self) {
        resource::with_mark(|_rm| {
            self.stats.record_evaluation();
            debug!(target: "gc::sizing", "Time-based evaluation triggered");

            let decision = self.policy.evaluate_heap_resize();
            match decision.action() {
                None => {
                    debug!(target: "gc::sizing", "No heap resize needed");
                    self.stats.record_noop();
                }
                Some((amount, ResizeDirection::Grow)) => {
                    debug!(target: "gc::sizing", "Expanding heap by {} bytes", amount);
                    match self.expander.expand(amount, &self.workers) {
                        Ok(committed) => self.stats.record_expansion(committed),
                        Err(error) => {
                            warn!(target: "gc::sizing", %error, "Heap expansion by {} bytes failed", amount);
                            self.stats.record_expansion_failure();
                        }
                    }
                }
                Some((amount, ResizeDirection::Shrink)) => {
                    debug!(target: "gc::sizing", "Shrinking heap by {} bytes", amount);
                    self.shrinker.request_shrink(amount);
                    self.stats.record_shrink_request(amount.get());
                }
            }
        })
    }
}

impl ServiceTask for HeapEvaluationTask {
    fn name(&self) -> &str {
        HEAP_EVALUATION_TASK_NAME
    }

    fn execute(&mut self) -> Option<Duration> {
        debug!(target: "gc::sizing", "Starting heap evaluation");

        if self.flags.is_enabled() {
            // a failing cycle must not cost the task its registration
            if panic::catch_unwind(AssertUnwindSafe(|| self.evaluate())).is_err() {
                error!(target: "gc::sizing", "Heap evaluation panicked, retrying next interval");
            }
        } else {
            debug!(target: "gc::sizing", "Time-based heap sizing disabled, skipping evaluation");
            self.stats.record_skipped();
        }

        Some(self.flags.evaluation_interval())
    }
}
