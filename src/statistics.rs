use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters of the periodic heap evaluation. Updated by the evaluation task, read by
/// anyone holding a handle.
#[derive(Default)]
pub struct SizingStatistics {
    evaluations: AtomicUsize,
    skipped_evaluations: AtomicUsize,
    noop_evaluations: AtomicUsize,
    expansions: AtomicUsize,
    expansion_failures: AtomicUsize,
    bytes_expanded: AtomicUsize,
    shrink_requests: AtomicUsize,
    bytes_shrink_requested: AtomicUsize,
}

impl SizingStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped_evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_noop(&self) {
        self.noop_evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expansion(&self, bytes: usize) {
        self.expansions.fetch_add(1, Ordering::Relaxed);
        self.bytes_expanded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_expansion_failure(&self) {
        self.expansion_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_shrink_request(&self, bytes: usize) {
        self.shrink_requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_shrink_requested
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn skipped_evaluations(&self) -> usize {
        self.skipped_evaluations.load(Ordering::Relaxed)
    }

    pub fn noop_evaluations(&self) -> usize {
        self.noop_evaluations.load(Ordering::Relaxed)
    }

    pub fn expansions(&self) -> usize {
        self.expansions.load(Ordering::Relaxed)
    }

    pub fn expansion_failures(&self) -> usize {
        self.expansion_failures.load(Ordering::Relaxed)
    }

    pub fn bytes_expanded(&self) -> usize {
        self.bytes_expanded.load(Ordering::Relaxed)
    }

    pub fn shrink_requests(&self) -> usize {
        self.shrink_requests.load(Ordering::Relaxed)
    }

    pub fn bytes_shrink_requested(&self) -> usize {
        self.bytes_shrink_requested.load(Ordering::Relaxed)
    }
}

/// Byte count scaled to the largest binary unit that keeps it at or above one.
fn human_bytes(bytes: usize) -> String {
    const UNITS: [&str; 3] = ["K", "M", "G"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut scaled = bytes as f64 / 1024.0;
    let mut unit = 0;
    while scaled >= 1024.0 && unit + 1 < UNITS.len() {
        scaled /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", scaled, UNITS[unit])
}

impl std::fmt::Display for SizingStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap sizing statistics:")?;
        writeln!(
            f,
            "  Evaluations: {} ({} skipped, {} without action)",
            self.evaluations(),
            self.skipped_evaluations(),
            self.noop_evaluations()
        )?;
        writeln!(
            f,
            "  Expansions: {} ({} failed), {} committed",
            self.expansions(),
            self.expansion_failures(),
            human_bytes(self.bytes_expanded())
        )?;
        writeln!(
            f,
            "  Shrink requests: {}, {} requested",
            self.shrink_requests(),
            human_bytes(self.bytes_shrink_requested())
        )
    }
}
