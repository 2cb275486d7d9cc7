pub const K: usize = 1024;
pub const M: usize = K * K;

/// Smallest unit the heap commits or uncommits.
pub const DEFAULT_REGION_SIZE: usize = M;
/// Region sizes must be a multiple of this so regions can be advised independently.
pub const PAGE_SIZE: usize = 4 * K;

pub const DEFAULT_EVALUATION_INTERVAL_MILLIS: u64 = 60_000;
pub const MIN_EVALUATION_INTERVAL_MILLIS: u64 = 1;
pub const DEFAULT_UNCOMMIT_DELAY_MILLIS: u64 = 300_000;
pub const MIN_UNCOMMIT_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_MIN_REGIONS_TO_UNCOMMIT: usize = 10;
pub const DEFAULT_GROWTH_THRESHOLD: f64 = 0.9;
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;

/// Size of a resource area chunk in machine words.
pub const RESOURCE_CHUNK_WORDS: usize = 4 * K;
