use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tilestore_int_test::test_util::{
    cleanup, create_test_context, fragment_source, random_mbrs, run_test,
};
use tilestore_memory::{MemoryTrackerReporter, MemoryTrackerReporterConfig};
use tilestore_rtree::{FragmentMetadata, OndemandFragmentMetadata};

fn read_reports(path: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[test]
fn test_reporter_sees_fragment_memory() {
    run_test(
        create_test_context,
        |ctx| {
            let dir = tempfile::tempdir()?;
            let path = dir.path().join("memory.jsonl");

            let tracker = ctx.tracker();
            let leaves = random_mbrs(40);
            let metadata = OndemandFragmentMetadata::new(
                ctx.domain(),
                Arc::clone(&tracker),
                Arc::new(fragment_source(ctx.domain(), &leaves)?),
                1,
            );
            metadata.load_rtree()?;
            metadata.load_tile_offsets(0)?;

            let mut params = HashMap::new();
            params.insert(
                "sm.memory.tracker.reporter.filename".to_string(),
                path.to_string_lossy().to_string(),
            );
            params.insert(
                "sm.memory.tracker.reporter.wait_time_ms".to_string(),
                "10".to_string(),
            );
            let config = MemoryTrackerReporterConfig::from_params(&params)?;
            let reporter = MemoryTrackerReporter::new(ctx.manager(), config);
            reporter.start()?;

            awaitility::at_most(Duration::from_secs(10)).until(|| !read_reports(&path).is_empty());
            reporter.stop();

            let reports = read_reports(&path);
            let trackers = reports[0]["memory"].as_array().cloned().unwrap_or_default();
            let entry = trackers
                .iter()
                .find(|t| t["tracker_id"] == tracker.get_id().to_string())
                .cloned()
                .unwrap_or_default();
            assert!(entry["counters"]["RTree"].as_u64().unwrap_or(0) > 0);
            assert!(entry["counters"]["TileOffsets"].as_u64().unwrap_or(0) > 0);
            assert_eq!(
                entry["total_memory"].as_u64(),
                Some(tracker.get_counts().0)
            );
            Ok(())
        },
        cleanup,
    )
}
