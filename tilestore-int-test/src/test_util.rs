use rand::Rng;
use std::backtrace::Backtrace;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tilestore_memory::pmr::Allocator;
use tilestore_memory::{MemoryTracker, MemoryTrackerManager};
use tilestore_rtree::fragment::{encode_tile_min_max, encode_tile_offsets};
use tilestore_rtree::{
    ndrange_in, Datatype, Dimension, Domain, InMemoryTileSource, NDRange, RTree, RTreeResult,
    Range, Serializer,
};

/// Runs a test with retry logic and error handling.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> RTreeResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> RTreeResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> RTreeResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error: Option<String> = None;

    for attempt in 1..=MAX_RETRIES {
        let start_time = Instant::now();

        let result = std::panic::catch_unwind(|| {
            let backtrace = Backtrace::capture();
            match before() {
                Ok(ctx) => match test(ctx.clone()) {
                    Ok(_) => after(ctx)
                        .map_err(|e| (format!("After run failed: {:?}", e), backtrace.to_string())),
                    Err(e) => {
                        let _ = after(ctx);
                        Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                    }
                },
                Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
            }
        });

        let elapsed = start_time.elapsed();
        let error = match result {
            Ok(Ok(_)) => return,
            Ok(Err((e, bt))) => {
                if !bt.is_empty() && !bt.contains("disabled") {
                    eprintln!("\nBacktrace:\n{}", bt);
                }
                e
            }
            Err(panic_err) => {
                if let Some(s) = panic_err.downcast_ref::<&str>() {
                    format!("Panic: {}", s)
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    format!("Panic: {}", s)
                } else {
                    "Panic: unknown payload".to_string()
                }
            }
        };

        if attempt < MAX_RETRIES {
            eprintln!(
                "\n========== Test Attempt {}/{} Failed (took {:?}) ==========",
                attempt, MAX_RETRIES, elapsed
            );
            eprintln!("Error: {}", error);
            thread::sleep(Duration::from_millis(100 * attempt as u64));
        }
        last_error = Some(error);
    }

    panic!(
        "Test failed after {} attempts. Last error: {}",
        MAX_RETRIES,
        last_error.unwrap_or_default()
    );
}

/// A tracker manager plus the two-dimensional domain most tests query.
#[derive(Clone)]
pub struct TestContext {
    manager: Arc<MemoryTrackerManager>,
    domain: Arc<Domain>,
}

impl TestContext {
    pub fn manager(&self) -> Arc<MemoryTrackerManager> {
        Arc::clone(&self.manager)
    }

    pub fn tracker(&self) -> Arc<MemoryTracker> {
        self.manager.create_tracker()
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }
}

/// `rows: int64 [1, 10000]`, `cols: float64 [0, 100]`.
pub fn create_test_context() -> RTreeResult<TestContext> {
    let domain = Domain::new(vec![
        Dimension::new("rows", Datatype::Int64).with_domain(1i64, 10_000i64)?,
        Dimension::new("cols", Datatype::Float64).with_domain(0.0f64, 100.0f64)?,
    ]);
    Ok(TestContext {
        manager: Arc::new(MemoryTrackerManager::new()),
        domain: Arc::new(domain),
    })
}

pub fn cleanup(ctx: TestContext) -> RTreeResult<()> {
    // Every tracker handed out by the test must have been dropped clean.
    if ctx.manager.tracker_count() != 0 {
        log::warn!("{} trackers still alive after test", ctx.manager.tracker_count());
    }
    Ok(())
}

pub fn mbr(rows: (i64, i64), cols: (f64, f64)) -> NDRange {
    let alloc = Allocator::default();
    ndrange_in(
        [
            Range::from_values_in(rows.0, rows.1, alloc.clone()).expect("row range"),
            Range::from_values_in(cols.0, cols.1, alloc.clone()).expect("col range"),
        ],
        alloc,
    )
    .expect("mbr")
}

/// `count` random MBRs inside the test domain.
pub fn random_mbrs(count: usize) -> Vec<NDRange> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| {
            let row = rng.random_range(1..=9_900i64);
            let col = rng.random_range(0.0..90.0f64);
            mbr(
                (row, row + rng.random_range(0..100i64)),
                (col, col + rng.random_range(0.0..10.0f64)),
            )
        })
        .collect()
}

/// Serialized R-tree over `leaves`, as a fragment would store it.
pub fn rtree_tile(domain: &Domain, fanout: u32, leaves: &[NDRange]) -> RTreeResult<Vec<u8>> {
    let manager = MemoryTrackerManager::new();
    let mut tree = RTree::new(Some(domain), fanout, manager.create_tracker());
    tree.set_leaves(leaves)?;
    tree.build_tree()?;
    let mut serializer = Serializer::new();
    tree.serialize(&mut serializer)?;
    Ok(serializer.into_inner())
}

/// A version 12 fragment with one int64 attribute whose tiles are `leaves`.
pub fn fragment_source(domain: &Domain, leaves: &[NDRange]) -> RTreeResult<InMemoryTileSource> {
    let offsets: Vec<u64> = (0..leaves.len() as u64).map(|i| i * 4096).collect();
    let mins: Vec<u8> = (0..leaves.len() as i64)
        .flat_map(|i| (i * 10).to_le_bytes())
        .collect();
    let maxs: Vec<u8> = (0..leaves.len() as i64)
        .flat_map(|i| (i * 10 + 9).to_le_bytes())
        .collect();

    Ok(InMemoryTileSource::new(12)
        .with_rtree(rtree_tile(domain, 10, leaves)?)
        .with_tile_offsets(0, encode_tile_offsets(&offsets))
        .with_tile_min(0, encode_tile_min_max(&mins, &[]))
        .with_tile_max(0, encode_tile_min_max(&maxs, &[])))
}
