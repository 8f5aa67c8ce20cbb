use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tilestore_int_test::test_util::{
    cleanup, create_test_context, fragment_source, random_mbrs, rtree_tile, run_test,
};
use tilestore_memory::MemoryType;
use tilestore_rtree::{FragmentMetadata, OndemandFragmentMetadata, RTree};

#[test]
fn test_legacy_budget_refuses_rtree_load() {
    run_test(
        create_test_context,
        |ctx| {
            let leaves = random_mbrs(100);
            let tile_size = rtree_tile(ctx.domain(), 10, &leaves)?.len() as u64;
            let source = Arc::new(fragment_source(ctx.domain(), &leaves)?);
            let tracker = ctx.tracker();
            assert!(tracker.set_budget(tile_size - 1));

            let metadata =
                OndemandFragmentMetadata::new(ctx.domain(), Arc::clone(&tracker), source, 1);
            let err = match metadata.load_rtree() {
                Err(err) => err,
                Ok(_) => panic!("R-tree load should exceed the budget"),
            };
            assert!(err.is_budget_exceeded());
            assert!(err.to_string().contains(&format!(
                "Needed {} but only had {} from budget {}",
                tile_size,
                tile_size - 1,
                tile_size - 1
            )));
            assert!(!metadata.loaded_metadata().rtree);

            // Raising the budget lets the same metadata load.
            assert!(tracker.set_budget(tile_size));
            metadata.load_rtree()?;
            assert_eq!(tracker.get_memory_available(), 0);
            assert!(!tracker.set_budget(tile_size - 1));
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_allocation_budget_fires_callback() {
    run_test(
        create_test_context,
        |ctx| {
            let refusals = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&refusals);
            let tracker = ctx.manager().create_tracker_with_budget(
                256,
                Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );

            let mut tree = RTree::new(Some(ctx.domain()), 10, Arc::clone(&tracker));
            let err = match tree.set_leaves(&random_mbrs(100)) {
                Err(err) => err,
                Ok(_) => panic!("leaves should exceed the allocation budget"),
            };
            assert!(err.is_budget_exceeded());
            assert!(refusals.load(Ordering::SeqCst) >= 1);
            assert_eq!(tree.height(), 0);

            tracker.refresh_memory_budget(u64::MAX);
            tree.set_leaves(&random_mbrs(100))?;
            tree.build_tree()?;
            assert_eq!(tree.height(), 3);
            assert!(tracker.get_counts().1[&MemoryType::RTree] > 256);
            Ok(())
        },
        cleanup,
    )
}

#[test]
fn test_trackers_are_independent() {
    run_test(
        create_test_context,
        |ctx| {
            let leaves = random_mbrs(20);
            let first = ctx.tracker();
            let second = ctx.tracker();
            let a = OndemandFragmentMetadata::new(
                ctx.domain(),
                Arc::clone(&first),
                Arc::new(fragment_source(ctx.domain(), &leaves)?),
                1,
            );
            let b = OndemandFragmentMetadata::new(
                ctx.domain(),
                Arc::clone(&second),
                Arc::new(fragment_source(ctx.domain(), &leaves)?),
                1,
            );

            a.load_rtree()?;
            assert!(first.get_memory_usage() > 0);
            assert_eq!(second.get_memory_usage(), 0);
            assert_eq!(second.get_counts().0, 0);

            b.load_tile_offsets(0)?;
            assert!(second.get_counts().1[&MemoryType::TileOffsets] > 0);
            assert_eq!(ctx.manager().tracker_count(), 2);
            Ok(())
        },
        cleanup,
    )
}
