//! Recurring background work on a dedicated service thread.
//!
//! A [`ServiceTask`] runs one cycle per [`ServiceTask::execute`] call and tells the
//! scheduler when it wants to run again. The scheduler keeps registered tasks in a
//! timer heap keyed by their next due time.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{self, AtomicBool},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

pub trait ServiceTask: Send {
    fn name(&self) -> &str;
    /// Runs one cycle. `Some(delay)` re-arms the task to run again after `delay`,
    /// `None` unregisters it.
    fn execute(&mut self) -> Option<Duration>;
}

struct Entry {
    due: Instant,
    seq: u64,
    task: Box<dyn ServiceTask>,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

/// Registered tasks ordered by due time. Ties run in registration order.
#[derive(Default)]
pub struct TaskQueue {
    entries: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register(&mut self, task: Box<dyn ServiceTask>, due: Instant) {
        debug!(target: "gc::sizing", "Registering task {}", task.name());
        self.seq += 1;
        self.entries.push(Reverse(Entry {
            due,
            seq: self.seq,
            task,
        }));
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.entries.peek().map(|Reverse(entry)| entry.due)
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut entries = self.entries.iter().map(|Reverse(e)| e).collect::<Vec<_>>();
        entries.sort();
        entries.iter().map(|e| e.task.name().to_owned()).collect()
    }

    /// Runs every task due at `now`. Re-armed tasks are due again relative to `now`.
    /// Returns the number of tasks that ran.
    pub fn run_due(&mut self, now: Instant) -> usize {
        let due = self.take_due(now);
        let ran = due.len();
        let rearmed = run_entries(due, now);
        self.reinsert(rearmed);
        ran
    }

    fn take_due(&mut self, now: Instant) -> Vec<Entry> {
        let mut due = Vec::new();
        while matches!(self.next_due(), Some(at) if at <= now) {
            if let Some(Reverse(entry)) = self.entries.pop() {
                due.push(entry);
            }
        }
        due
    }

    fn reinsert(&mut self, entries: Vec<Entry>) {
        self.entries.extend(entries.into_iter().map(Reverse));
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

fn run_entries(entries: Vec<Entry>, now: Instant) -> Vec<Entry> {
    entries
        .into_iter()
        .filter_map(|entry| run_entry(entry, now))
        .collect()
}

fn run_entry(mut entry: Entry, now: Instant) -> Option<Entry> {
    trace!(target: "gc::sizing", "Running task {}", entry.task.name());
    match panic::catch_unwind(AssertUnwindSafe(|| entry.task.execute())) {
        Ok(Some(delay)) => {
            entry.due = now + delay;
            Some(entry)
        }
        Ok(None) => {
            debug!(target: "gc::sizing", "Task {} unregistered itself", entry.task.name());
            None
        }
        Err(_) => {
            error!(target: "gc::sizing", "Task {} panicked and was unregistered", entry.task.name());
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to spawn service thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("service thread {0} is shut down")]
    Stopped(String),
}

struct Shared {
    queue: Mutex<TaskQueue>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// Runs registered tasks one at a time on its own thread.
pub struct TaskScheduler {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl TaskScheduler {
    pub fn start(name: impl Into<String>) -> Result<Self, ServiceError> {
        let name = name.into();
        let shared = Arc::new(Shared {
            queue: Mutex::new(TaskQueue::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || service_loop(&thread_shared))
            .map_err(|source| ServiceError::Spawn {
                name: name.clone(),
                source,
            })?;
        info!(target: "gc::sizing", "Started service thread {}", name);
        Ok(Self {
            name,
            shared,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules the first run of `task` after `delay`.
    pub fn register_task(
        &self,
        task: impl ServiceTask + 'static,
        delay: Duration,
    ) -> Result<(), ServiceError> {
        let mut queue = self.shared.queue.lock();
        if self.shared.shutdown.load(atomic::Ordering::Acquire) {
            return Err(ServiceError::Stopped(self.name.clone()));
        }
        queue.register(Box::new(task), Instant::now() + delay);
        self.shared.wakeup.notify_all();
        Ok(())
    }

    /// Tasks currently waiting for their next run. A task being executed right now
    /// is not counted.
    pub fn registered_tasks(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stops the thread and drops every registered task. Waits for a running task
    /// to finish its cycle.
    pub fn shutdown(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };
        {
            let _queue = self.shared.queue.lock();
            self.shared
                .shutdown
                .store(true, atomic::Ordering::Release);
            self.shared.wakeup.notify_all();
        }
        if handle.join().is_err() {
            error!(target: "gc::sizing", "Service thread {} panicked", self.name);
        }
        info!(target: "gc::sizing", "Stopped service thread {}", self.name);
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn service_loop(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if shared.shutdown.load(atomic::Ordering::Acquire) {
            break;
        }
        let now = Instant::now();
        match queue.next_due() {
            None => shared.wakeup.wait(&mut queue),
            Some(due) if due > now => {
                shared.wakeup.wait_until(&mut queue, due);
            }
            Some(_) => {
                let due = queue.take_due(now);
                let rearmed = MutexGuard::unlocked(&mut queue, || run_entries(due, now));
                queue.reinsert(rearmed);
            }
        }
    }
    if !queue.is_empty() {
        debug!(target: "gc::sizing", "Dropping {} registered tasks", queue.len());
        queue.clear();
    }
}
