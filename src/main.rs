use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use comet_sizing::{
    globals::M,
    region_heap::{RegionHeap, RegionHeapOptions},
    workers::WorkerSet,
    SizingConfig, TimeBasedHeapSizing,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gc::sizing=debug")),
        )
        .init();

    let heap = Arc::new(RegionHeap::new(RegionHeapOptions {
        region_size: M,
        initial_size: 8 * M,
        min_size: 4 * M,
        max_size: 128 * M,
    })?);
    let workers = Arc::new(WorkerSet::with_available_parallelism("comet-worker"));
    let sizing = TimeBasedHeapSizing::start(
        heap.clone(),
        workers,
        &SizingConfig {
            use_time_based_heap_sizing: true,
            evaluation_interval_millis: 250,
            uncommit_delay_millis: 1_000,
            min_regions_to_uncommit: 2,
            ..Default::default()
        },
    )?;

    println!("Starting high allocation phase");
    let mut live = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        match heap.allocate_region() {
            Some(region) => live.push(region),
            None => thread::sleep(Duration::from_millis(50)),
        }
        heap.safepoint();
    }
    println!("High allocation phase completed with {} regions", live.len());

    println!("Starting idle phase");
    for region in live.drain(..) {
        heap.free_region(region);
    }
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut released = 0;
    while Instant::now() < deadline {
        released += heap.safepoint();
        thread::sleep(Duration::from_millis(50));
    }
    println!("Memory released: {} bytes", released);

    print!("{}", sizing.statistics());
    sizing.shutdown();
    Ok(())
}
