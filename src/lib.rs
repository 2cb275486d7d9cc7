//! Time-based heap sizing for comet heaps.
//!
//! A [`HeapEvaluationTask`](evaluation::HeapEvaluationTask) runs on a service thread,
//! asks a [`HeapSizingPolicy`](policy::HeapSizingPolicy) how the heap should change
//! and forwards the answer to the heap through the capabilities in [`operation`].

use std::sync::Arc;

use tracing::info;

pub mod config;
pub mod evaluation;
pub mod globals;
pub mod mmap;
pub mod operation;
pub mod policy;
pub mod region_heap;
pub mod resize;
pub mod resource;
pub mod statistics;
pub mod task_scheduler;
pub mod workers;


pub use config::{ConfigError, SizingConfig, SizingFlags};
pub use evaluation::HeapEvaluationTask;
pub use resize::{ResizeDecision, ResizeDirection};

use crate::{
    policy::TimeBasedSizingPolicy,
    region_heap::RegionHeap,
    statistics::SizingStatistics,
    task_scheduler::{ServiceError, TaskScheduler},
    workers::WorkerSet,
};

pub const SERVICE_THREAD_NAME: &str = "comet-service";

#[derive(Debug, thiserror::Error)]
pub enum SizingError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Periodic heap evaluation wired to a [`RegionHeap`] and running on its own service
/// thread. Dropping it stops the thread.
pub struct TimeBasedHeapSizing {
    scheduler: TaskScheduler,
    flags: Arc<SizingFlags>,
    stats: Arc<SizingStatistics>,
}

impl TimeBasedHeapSizing {
    /// Registers the evaluation task whether or not time-based sizing is enabled, so it
    /// can be switched on later through [`TimeBasedHeapSizing::flags`].
    pub fn start(
        heap: Arc<RegionHeap>,
        workers: Arc<WorkerSet>,
        config: &SizingConfig,
    ) -> Result<Self, SizingError> {
        let flags = Arc::new(SizingFlags::new(config)?);
        let policy = Arc::new(TimeBasedSizingPolicy::new(heap.clone(), flags.clone()));
        let task = HeapEvaluationTask::for_heap(heap, policy, workers, flags.clone());
        let stats = task.statistics();

        let scheduler = TaskScheduler::start(SERVICE_THREAD_NAME)?;
        scheduler.register_task(task, flags.evaluation_interval())?;
        info!(
            target: "gc::sizing",
            "Periodic heap evaluation registered (enabled: {}, interval: {:?})",
            flags.is_enabled(),
            flags.evaluation_interval()
        );

        Ok(Self {
            scheduler,
            flags,
            stats,
        })
    }

    pub fn flags(&self) -> &Arc<SizingFlags> {
        &self.flags
    }

    pub fn statistics(&self) -> &Arc<SizingStatistics> {
        &self.stats
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn shutdown(mut self) {
        self.scheduler.shutdown();
    }
}
