//! Property-based tests for the pure parts of the engine: message
//! truncation, retry backoff and the batch cursor's coverage guarantees.

use proptest::prelude::*;
use replication_registry::backoff::{
    retry_delay, MISSING_ON_PRIMARY_RETRY_CAP, RETRY_CAP,
};
use replication_registry::registry::{failure_message, truncate_message};
use replication_registry::{Batcher, MemoryCursorCache, MemoryIdTable, MAX_FAILURE_MESSAGE_LEN};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

proptest! {
    #[test]
    fn truncated_messages_never_exceed_the_limit(message in ".{0,600}") {
        let truncated = truncate_message(&message);
        prop_assert!(truncated.chars().count() <= MAX_FAILURE_MESSAGE_LEN);
        if message.chars().count() > MAX_FAILURE_MESSAGE_LEN {
            prop_assert!(truncated.ends_with("..."));
        } else {
            prop_assert_eq!(&truncated, &message);
        }
    }

    #[test]
    fn composed_failure_messages_never_exceed_the_limit(
        message in ".{0,400}",
        error in proptest::option::of(".{0,400}"),
    ) {
        let composed = failure_message(&message, error.as_deref());
        prop_assert!(composed.chars().count() <= MAX_FAILURE_MESSAGE_LEN);
    }

    #[test]
    fn retry_delay_respects_the_caps(retry_count in -10i32..200_000) {
        let delay = retry_delay(retry_count, RETRY_CAP);
        prop_assert!(delay >= Duration::from_secs(15));
        prop_assert!(delay <= RETRY_CAP);

        let delay = retry_delay(retry_count, MISSING_ON_PRIMARY_RETRY_CAP);
        prop_assert!(delay <= MISSING_ON_PRIMARY_RETRY_CAP);
    }

    #[test]
    fn batcher_covers_every_id_exactly_once(
        source_ids in proptest::collection::btree_set(0i64..500, 0..60),
        dest_ids in proptest::collection::btree_set(0i64..500, 0..60),
        batch_size in 1u32..20,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let all_ids: BTreeSet<i64> =
                source_ids.union(&dest_ids).copied().collect();

            let batcher = Batcher::new(
                "prop",
                Arc::new(MemoryIdTable::from_ids(source_ids.clone()).await),
                Arc::new(MemoryIdTable::from_ids(dest_ids.clone()).await),
                Arc::new(MemoryCursorCache::new()),
            );

            let mut covered = Vec::new();
            let mut prev_end = i64::MIN;
            while let Some(range) = batcher.next_range(batch_size).await.unwrap() {
                // Ranges advance strictly, so no id is handed out twice
                prop_assert!(*range.start() > prev_end);
                prop_assert!(range.start() <= range.end());
                prev_end = *range.end();
                covered.extend(all_ids.iter().copied().filter(|id| range.contains(id)));
            }

            let expected: Vec<i64> = all_ids.iter().copied().collect();
            prop_assert_eq!(covered, expected);
            Ok(())
        })?;
    }

    #[test]
    fn batcher_ranges_are_bounded_while_more_ids_remain(
        ids in proptest::collection::btree_set(0i64..1_000, 2..80),
        batch_size in 1u32..20,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let batcher = Batcher::new(
                "prop-bounded",
                Arc::new(MemoryIdTable::from_ids(ids.clone()).await),
                Arc::new(MemoryIdTable::new()),
                Arc::new(MemoryCursorCache::new()),
            );

            let sorted: Vec<i64> = ids.iter().copied().collect();
            while let Some(range) = batcher.next_range(batch_size).await.unwrap() {
                let contained = sorted
                    .iter()
                    .filter(|id| range.contains(id))
                    .count();
                // A range may cover fewer ids near the tail, never more than
                // the requested batch on both sides combined
                prop_assert!(contained <= 2 * batch_size as usize);
            }
            Ok(())
        })?;
    }
}
