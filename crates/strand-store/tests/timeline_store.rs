//! Timeline store behaviour against a real data directory

use std::path::Path;

use strand_core::{
    AppendRequest, BlockState, DurabilityMode, MessageCursor, MessageQuery, StoreConfig,
    StrandError, TimelineKey,
};
use strand_store::{codec::BlockHeader, TimelineStore};

fn config(dir: &Path, max_size: u64) -> StoreConfig {
    StoreConfig {
        store_id: "store-a".into(),
        data_dir: dir.to_path_buf(),
        timeline_max_size: max_size,
        ..StoreConfig::default()
    }
}

fn send(store: &TimelineStore, conv: &str, text: &str) -> u64 {
    store
        .add_message(AppendRequest::new(
            TimelineKey::conversation(conv),
            "alice",
            text.as_bytes().to_vec(),
        ))
        .unwrap()
        .message
        .seq_id
}

mod blocks {
    use super::*;

    #[test]
    fn test_five_messages_fill_two_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
        for i in 0..5 {
            send(&store, "c1", &format!("m{i}"));
        }

        let info = store.get_timeline(&TimelineKey::conversation("c1")).unwrap();
        assert_eq!(info.blocks.len(), 2);
        assert_eq!(info.blocks[0].size, 3);
        assert_eq!(info.blocks[0].state, BlockState::Full);
        assert_eq!(info.blocks[1].size, 2);
        assert_eq!(info.current_block, Some(info.blocks[1].block_id));

        let messages = store
            .get_conv_messages("c1", 10, MessageCursor::Latest)
            .unwrap();
        let bodies: Vec<_> = messages
            .iter()
            .map(|m| String::from_utf8(m.data.clone()).unwrap())
            .collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn test_get_block_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
        for i in 0..4 {
            send(&store, "c1", &format!("m{i}"));
        }
        let info = store.get_timeline(&TimelineKey::conversation("c1")).unwrap();
        let snapshot = store.get_block(&info.blocks[0].block_id).unwrap();
        assert_eq!(snapshot.timeline_key, TimelineKey::conversation("c1"));
        assert_eq!(snapshot.messages.len(), 3);
        assert_eq!(snapshot.info.state, BlockState::Full);

        let missing = strand_core::BlockId::new();
        assert!(matches!(
            store.get_block(&missing),
            Err(StrandError::NotFound { .. })
        ));
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
        let key = TimelineKey::inbox("bob");
        let first = store.get_or_create_timeline(&key).unwrap();
        let second = store.get_or_create_timeline(&key).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.blocks.len(), 1);
        assert_eq!(store.stats().block_count, 1);
    }

    #[test]
    fn test_missing_timeline_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
        let key = TimelineKey::conversation("nobody");
        assert!(matches!(
            store.get_messages(&key, MessageQuery::latest(10)),
            Err(StrandError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_timeline(&key),
            Err(StrandError::NotFound { .. })
        ));
    }
}

mod recovery {
    use super::*;

    #[test]
    fn test_reload_reconstructs_timelines() {
        let dir = tempfile::tempdir().unwrap();
        let (before, stats_before) = {
            let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
            for i in 0..7 {
                store
                    .add_message(
                        AppendRequest::new(TimelineKey::conversation("c1"), "alice", vec![i])
                            .with_fanout(vec![TimelineKey::inbox("bob")]),
                    )
                    .unwrap();
            }
            (
                store.get_timeline(&TimelineKey::conversation("c1")).unwrap(),
                store.stats(),
            )
        };

        let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
        let after = store.get_timeline(&TimelineKey::conversation("c1")).unwrap();
        assert_eq!(after, before);
        assert_eq!(
            after
                .blocks
                .iter()
                .filter(|b| b.state == BlockState::Open)
                .count(),
            1
        );
        let stats = store.stats();
        assert_eq!(stats.last_seq_id, stats_before.last_seq_id);
        assert_eq!(stats.current_capacity, stats_before.current_capacity);
        assert_eq!(stats.timeline_count, 2);

        // Sequence numbers keep increasing after a restart
        assert_eq!(send(&store, "c1", "late"), stats_before.last_seq_id + 1);
    }

    #[test]
    fn test_deleted_high_water_mark_is_not_reissued() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
            assert_eq!(send(&store, "c1", "one"), 1);
            assert_eq!(send(&store, "c2", "two"), 2);
            store.delete_timeline(&TimelineKey::conversation("c2")).unwrap();
        }

        let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
        assert_eq!(store.stats().last_seq_id, 2);
        assert_eq!(send(&store, "c1", "three"), 3);
    }

    #[test]
    fn test_delete_racing_create_leaves_consistent_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let key = TimelineKey::conversation("hot");
        let meta = dir.path().join("conv_hot.meta");
        {
            let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
            std::thread::scope(|s| {
                s.spawn(|| {
                    for _ in 0..200 {
                        let _ = store.create_timeline(&key);
                        let _ = store.delete_timeline(&key);
                    }
                });
                s.spawn(|| {
                    for _ in 0..200 {
                        let _ = store.create_timeline(&key);
                    }
                });
            });
            assert_eq!(store.contains(&key), meta.exists());
            store.create_timeline(&key).unwrap();
            assert!(meta.exists());
        }

        let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
        assert!(store.get_timeline(&key).is_ok());
    }

    #[test]
    fn test_seal_only_keeps_sealed_blocks_and_flushed_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 3);
        cfg.durability = DurabilityMode::SealOnly;
        {
            let store = TimelineStore::open(cfg.clone()).unwrap();
            for i in 0..2 {
                send(&store, "c2", &format!("m{i}"));
            }
            store.flush().unwrap();
            // Seals the first c1 block; the fourth message stays in memory
            for i in 0..4 {
                send(&store, "c1", &format!("m{i}"));
            }
            send(&store, "c2", "unflushed");
        }

        let store = TimelineStore::open(cfg).unwrap();
        let c1 = store
            .get_messages(&TimelineKey::conversation("c1"), MessageQuery::latest(10))
            .unwrap();
        assert_eq!(c1.len(), 3);
        let c2 = store
            .get_messages(&TimelineKey::conversation("c2"), MessageQuery::latest(10))
            .unwrap();
        assert_eq!(c2.len(), 2);
    }

    #[test]
    fn test_corrupted_sealed_block_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let block_file = {
            let store = TimelineStore::open(config(dir.path(), 2)).unwrap();
            for i in 0..3 {
                send(&store, "c1", &format!("m{i}"));
            }
            let info = store.get_timeline(&TimelineKey::conversation("c1")).unwrap();
            store.block_file(&info.blocks[0].block_id)
        };
        let mut bytes = std::fs::read(&block_file).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&block_file, bytes).unwrap();

        assert!(matches!(
            TimelineStore::open(config(dir.path(), 2)),
            Err(StrandError::Corruption { .. })
        ));
    }
}

mod fanout {
    use super::*;

    #[test]
    fn test_fanout_shares_one_sequence_number() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
        let receipt = store
            .add_message(
                AppendRequest::new(TimelineKey::conversation("c1"), "alice", b"hi".to_vec())
                    .with_fanout(vec![TimelineKey::inbox("bob"), TimelineKey::inbox("carol")]),
            )
            .unwrap();
        assert_eq!(receipt.placements.len(), 3);
        for key in [TimelineKey::inbox("bob"), TimelineKey::inbox("carol")] {
            let inbox = store.get_messages(&key, MessageQuery::latest(10)).unwrap();
            assert_eq!(inbox, vec![receipt.message.clone()]);
        }
        assert_eq!(store.stats().current_capacity, 3);
    }

    #[test]
    fn test_partial_fanout_is_reported_and_replayable() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimelineStore::open(config(dir.path(), 10)).unwrap();
        let bob = TimelineKey::inbox("bob");
        let bob_block = store.get_or_create_timeline(&bob).unwrap().blocks[0].block_id;
        let bob_file = store.block_file(&bob_block);
        std::fs::remove_file(&bob_file).unwrap();

        let request = AppendRequest::new(TimelineKey::conversation("c1"), "alice", b"hi".to_vec())
            .with_fanout(vec![bob.clone(), TimelineKey::inbox("carol")]);
        match store.add_message(request) {
            Err(StrandError::PartialFailure {
                applied, failed, ..
            }) => {
                assert_eq!(applied, vec!["conv:c1".to_string(), "inbox:carol".to_string()]);
                assert_eq!(failed.len(), 1);
                assert!(failed[0].starts_with("inbox:bob"));
            }
            other => panic!("expected partial failure, got {other:?}"),
        }
        assert_eq!(store.stats().current_capacity, 2);

        let header = BlockHeader {
            offset: 0,
            created_at: 0,
        };
        std::fs::write(&bob_file, header.encode()).unwrap();
        let message = store
            .get_messages(&TimelineKey::conversation("c1"), MessageQuery::latest(1))
            .unwrap()
            .remove(0);
        let keys = vec![
            TimelineKey::conversation("c1"),
            bob.clone(),
            TimelineKey::inbox("carol"),
        ];
        let replayed = store.replay_fanout(&message, &keys).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].timeline_key, bob);
        assert!(store.replay_fanout(&message, &keys).unwrap().is_empty());
        assert_eq!(store.stats().current_capacity, 3);
    }

    #[test]
    fn test_concurrent_fanout_keeps_every_timeline_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = TimelineStore::open(config(dir.path(), 4)).unwrap();
        let shared = TimelineKey::inbox("bob");

        std::thread::scope(|s| {
            for writer in 0..4 {
                let store = &store;
                let shared = shared.clone();
                s.spawn(move || {
                    let conv = TimelineKey::conversation(format!("c{writer}"));
                    for i in 0..25 {
                        let request = AppendRequest::new(conv.clone(), "alice", vec![i])
                            .with_fanout(vec![shared.clone()]);
                        store.add_message(request).unwrap();
                    }
                });
            }
        });

        let inbox = store.get_messages(&shared, MessageQuery::latest(1000)).unwrap();
        assert_eq!(inbox.len(), 100);
        assert!(inbox.windows(2).all(|w| w[0].seq_id < w[1].seq_id));
        for writer in 0..4 {
            let conv = TimelineKey::conversation(format!("c{writer}"));
            let messages = store.get_messages(&conv, MessageQuery::latest(1000)).unwrap();
            assert_eq!(messages.len(), 25);
            assert!(messages.windows(2).all(|w| w[0].seq_id < w[1].seq_id));
        }
        assert_eq!(store.stats().last_seq_id, 100);
    }

    #[test]
    fn test_capacity_is_checked_before_any_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 10);
        cfg.max_capacity = 3;
        let store = TimelineStore::open(cfg).unwrap();
        let request = AppendRequest::new(TimelineKey::conversation("c1"), "alice", vec![1])
            .with_fanout(vec![TimelineKey::inbox("bob"), TimelineKey::inbox("carol")]);
        store.add_message(request.clone()).unwrap();

        assert!(matches!(
            store.add_message(request),
            Err(StrandError::CapacityExceeded { used: 3, max: 3, .. })
        ));
        let c1 = store
            .get_messages(&TimelineKey::conversation("c1"), MessageQuery::latest(10))
            .unwrap();
        assert_eq!(c1.len(), 1);

        store.delete_timeline(&TimelineKey::inbox("bob")).unwrap();
        assert_eq!(store.stats().current_capacity, 2);
        send(&store, "c1", "fits again");
    }
}

mod migration_import {
    use super::*;

    #[test]
    fn test_import_keeps_sequence_numbers() {
        let source_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let source = TimelineStore::open(config(source_dir.path(), 3)).unwrap();
        let mut target_cfg = config(target_dir.path(), 3);
        target_cfg.store_id = "store-b".into();
        let target = TimelineStore::open(target_cfg).unwrap();

        for i in 0..5 {
            send(&source, "c1", &format!("m{i}"));
        }
        let key = TimelineKey::conversation("c1");
        let messages = source.get_messages(&key, MessageQuery::after(0, 100)).unwrap();

        let info = target.import_messages(&key, messages[..3].to_vec()).unwrap();
        assert_eq!(info.last_seq_id, messages[2].seq_id);
        // A retried batch overlapping the first is skipped, not duplicated
        let info = target.import_messages(&key, messages.clone()).unwrap();
        assert_eq!(info.message_count, 5);
        assert_eq!(
            target.get_messages(&key, MessageQuery::after(0, 100)).unwrap(),
            messages
        );

        let next = send(&target, "c1", "after migration");
        assert!(next > messages[4].seq_id);
    }
}

mod checkpoints {
    use super::*;

    #[test]
    fn test_checkpoint_regression_rejected() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
            store.update_checkpoint("bob", 7).unwrap();
            store.update_checkpoint("bob", 7).unwrap();
            assert!(matches!(
                store.update_checkpoint("bob", 3),
                Err(StrandError::Invalid { .. })
            ));
        }
        let store = TimelineStore::open(config(dir.path(), 3)).unwrap();
        assert_eq!(store.get_checkpoint("bob"), 7);
        assert_eq!(store.get_checkpoint("carol"), 0);
    }
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_pages_are_strictly_increasing(
            max_size in 1u64..6,
            plan in proptest::collection::vec(any::<bool>(), 1..40),
            page in 1usize..9,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let store = TimelineStore::open(config(dir.path(), max_size)).unwrap();
            let mut sent = Vec::new();
            for to_c1 in &plan {
                let seq = send(&store, if *to_c1 { "c1" } else { "c2" }, "x");
                if *to_c1 {
                    sent.push(seq);
                }
            }
            prop_assume!(!sent.is_empty());

            let key = TimelineKey::conversation("c1");
            let mut read = Vec::new();
            let mut cursor = 0;
            loop {
                let batch = store.get_messages(&key, MessageQuery::after(cursor, page)).unwrap();
                if batch.is_empty() {
                    break;
                }
                cursor = batch[batch.len() - 1].seq_id;
                read.extend(batch.into_iter().map(|m| m.seq_id));
            }
            prop_assert!(read.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(read, sent);
        }

        #[test]
        fn test_before_and_after_pages_recombine(
            count in 1usize..40,
            pivot in any::<prop::sample::Index>(),
            before in 0usize..12,
            after in 0usize..12,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let store = TimelineStore::open(config(dir.path(), 4)).unwrap();
            for i in 0..count {
                send(&store, "c1", &i.to_string());
            }
            let key = TimelineKey::conversation("c1");
            let all = store.get_messages(&key, MessageQuery::after(0, usize::MAX)).unwrap();
            let at = pivot.index(all.len());
            let s = all[at].seq_id;

            let older = store.get_messages(&key, MessageQuery::before(s, before)).unwrap();
            let newer = store.get_messages(&key, MessageQuery::after(s, after)).unwrap();
            let start = at.saturating_sub(before);
            let end = (at + 1 + after).min(all.len());

            let mut combined = older;
            combined.push(all[at].clone());
            combined.extend(newer);
            prop_assert_eq!(&combined[..], &all[start..end]);
        }
    }
}
