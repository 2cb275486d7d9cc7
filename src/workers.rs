use std::thread;

/// Named gang of worker threads used for parallel heap work such as pre-touching
/// freshly committed regions.
pub struct WorkerSet {
    name: String,
    total_workers: usize,
}

impl WorkerSet {
    pub fn new(name: impl Into<String>, total_workers: usize) -> Self {
        Self {
            name: name.into(),
            total_workers: total_workers.max(1),
        }
    }

    pub fn with_available_parallelism(name: impl Into<String>) -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(name, workers)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_workers(&self) -> usize {
        self.total_workers
    }

    /// Runs `task(worker_id, num_workers)` on `num_workers` threads (clamped to the
    /// gang size) and waits for all of them. A worker that cannot be spawned is run on
    /// the calling thread instead. Panics of a worker are propagated to the caller.
    pub fn run_task<F>(&self, num_workers: usize, task: F)
    where
        F: Fn(usize, usize) + Sync,
    {
        let num_workers = num_workers.clamp(1, self.total_workers);
        if num_workers == 1 {
            task(0, 1);
            return;
        }

        let task = &task;
        let result = crossbeam_utils::thread::scope(|scope| {
            for id in 0..num_workers {
                let spawned = scope
                    .builder()
                    .name(format!("{}#{}", self.name, id))
                    .spawn(move |_| task(id, num_workers));
                if spawned.is_err() {
                    tracing::warn!(target: "gc::sizing", "failed to spawn worker {}#{}, running inline", self.name, id);
                    task(id, num_workers);
                }
            }
        });

        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }
}
