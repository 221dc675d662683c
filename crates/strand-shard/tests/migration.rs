//! Timeline migration between on-disk stores, including cancellation at
//! either side of the index repoint

use std::sync::Arc;
use std::time::Duration;

use strand_core::{MessageQuery, StrandConfig, StrandError, TimelineKey, TimelineService};
use strand_placement::StoreInfo;
use strand_shard::{MigrationStatus, ShardManager};
use strand_testkit::{conv_text, temp_store, GatedService, ServiceCall, TempStore};

fn manager() -> ShardManager {
    let mut config = StrandConfig::default();
    config.rebalance.enabled = false;
    config.migration.copy_batch_size = 2;
    ShardManager::new(config).unwrap()
}

fn join(manager: &ShardManager, store: &TempStore, service: Arc<dyn TimelineService>) {
    manager
        .register_store(StoreInfo::new(store.id(), ""), service)
        .unwrap();
}

/// `c1` pinned to `store` with `count` messages written through the manager
async fn seeded(manager: &ShardManager, store: &TempStore, count: usize) -> TimelineKey {
    let key = TimelineKey::conversation("c1");
    store.store.create_timeline(&key).unwrap();
    manager.index().register_timeline(&key, &store.id()).unwrap();
    for i in 0..count {
        manager
            .add_message_with_transaction(conv_text("c1", "alice", &format!("m{i}")))
            .await
            .unwrap();
    }
    key
}

#[tokio::test]
async fn test_migration_keeps_sequence_numbers() {
    let (s1, s2) = (temp_store("s1", 2), temp_store("s2", 2));
    let manager = manager();
    join(&manager, &s1, s1.as_service());
    join(&manager, &s2, s2.as_service());

    // Push s1's counter ahead so copied ids differ from a fresh store's
    s1.store
        .add_message(conv_text("warmup", "alice", "x"))
        .unwrap();
    let key = seeded(&manager, &s1, 5).await;
    let before = s1.store.get_messages(&key, MessageQuery::latest(10)).unwrap();

    let task = manager
        .migrate_timeline_with_transaction(&key, &s2.id())
        .await
        .unwrap();
    let done = manager.migrations().wait_for(task.id).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!((done.total, done.copied), (5, 5));
    assert!((done.progress - 1.0).abs() < f64::EPSILON);
    assert!(done.cleanup_error.is_none());

    let after = s2.store.get_messages(&key, MessageQuery::latest(10)).unwrap();
    assert_eq!(after, before);
    assert!(!s1.store.contains(&key));

    let location = manager.index().get_location(&key).unwrap();
    assert_eq!(location.store_id, s2.id());
    assert_eq!(location.by_store.keys().cloned().collect::<Vec<_>>(), vec![s2.id()]);
    assert_eq!(location.entries.len(), 3);
    assert!(!manager.locks().is_locked(&key.lock_key()));

    // New writes land on the target after the imported history
    let receipt = manager
        .add_message_with_transaction(conv_text("c1", "alice", "after"))
        .await
        .unwrap();
    assert!(receipt.message.seq_id > before.last().unwrap().seq_id);
    assert_eq!(s2.store.get_timeline(&key).unwrap().message_count, 6);
}

#[tokio::test]
async fn test_cancel_before_repoint_keeps_source() {
    let (s1, s2) = (temp_store("s1", 10), temp_store("s2", 10));
    let gated = Arc::new(GatedService::new(s2.as_service()));
    let gate = gated.gate(ServiceCall::ImportMessages);
    let manager = manager();
    join(&manager, &s1, s1.as_service());
    join(&manager, &s2, gated.clone());
    let key = seeded(&manager, &s1, 3).await;

    let task = manager
        .migrate_timeline_with_transaction(&key, &s2.id())
        .await
        .unwrap();
    gate.reached().await;

    // The timeline is locked for the whole move
    assert!(matches!(
        manager
            .add_message_with_transaction(conv_text("c1", "alice", "blocked"))
            .await,
        Err(StrandError::AlreadyLocked { .. })
    ));
    assert!(matches!(
        manager.migrations().start_migration(&key, &s2.id()),
        Err(StrandError::AlreadyExists { .. })
    ));
    assert_eq!(
        manager.migrations().active_for(&key).map(|t| t.id),
        Some(task.id)
    );

    assert!(manager.migrations().cancel_migration(task.id).unwrap());
    gate.release();
    let done = manager.migrations().wait_for(task.id).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Cancelled);
    assert!(done.error.is_some());

    assert_eq!(manager.index().store_of(&key), Some(s1.id()));
    assert!(!s2.store.contains(&key));
    assert_eq!(s1.store.get_timeline(&key).unwrap().message_count, 3);
    assert!(!manager.locks().is_locked(&key.lock_key()));
    assert!(manager.migrations().active_for(&key).is_none());
}

#[tokio::test]
async fn test_cancel_after_repoint_is_refused() {
    let (s1, s2) = (temp_store("s1", 10), temp_store("s2", 10));
    let gated = Arc::new(GatedService::new(s1.as_service()));
    let gate = gated.gate(ServiceCall::DeleteTimeline);
    let manager = manager();
    join(&manager, &s1, gated.clone());
    join(&manager, &s2, s2.as_service());
    let key = seeded(&manager, &s1, 3).await;

    let task = manager
        .migrate_timeline_with_transaction(&key, &s2.id())
        .await
        .unwrap();
    gate.reached().await;

    assert_eq!(manager.index().store_of(&key), Some(s2.id()));
    assert!(!manager.migrations().cancel_migration(task.id).unwrap());
    gate.release();

    let done = manager.migrations().wait_for(task.id).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(s2.store.get_timeline(&key).unwrap().message_count, 3);
    assert!(!s1.store.contains(&key));
    assert!(!manager.migrations().cancel_migration(task.id).unwrap());
}

#[tokio::test]
async fn test_failed_copy_cleans_up_target() {
    let (s1, s2) = (temp_store("s1", 10), temp_store("s2", 10));
    let faulty = Arc::new(strand_testkit::FaultyService::new(s2.as_service()));
    faulty.fail(ServiceCall::ImportMessages, 1, StrandError::storage("disk full"));
    let manager = manager();
    join(&manager, &s1, s1.as_service());
    join(&manager, &s2, faulty.clone());
    let key = seeded(&manager, &s1, 3).await;

    let task = manager
        .migrate_timeline_with_transaction(&key, &s2.id())
        .await
        .unwrap();
    let done = manager.migrations().wait_for(task.id).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Failed);
    assert!(done.error.as_deref().unwrap_or_default().contains("disk full"));
    assert_eq!(manager.index().store_of(&key), Some(s1.id()));
    assert!(!s2.store.contains(&key));

    // The fault was one-shot, so a retry succeeds
    let retry = manager
        .migrate_timeline_with_transaction(&key, &s2.id())
        .await
        .unwrap();
    let done = manager.migrations().wait_for(retry.id).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(manager.migrations().list_migrations().len(), 2);
}

#[tokio::test]
async fn test_finished_migrations_are_purged_after_retention() {
    let (s1, s2) = (temp_store("s1", 10), temp_store("s2", 10));
    let gated = Arc::new(GatedService::new(s2.as_service()));
    let gate = gated.gate(ServiceCall::ImportMessages);
    let manager = manager();
    join(&manager, &s1, s1.as_service());
    join(&manager, &s2, gated.clone());
    let key = seeded(&manager, &s1, 3).await;

    let task = manager
        .migrate_timeline_with_transaction(&key, &s2.id())
        .await
        .unwrap();
    gate.reached().await;

    // A running migration is never purged
    assert_eq!(manager.migrations().purge_finished(Duration::ZERO), 0);
    gate.release();
    let done = manager.migrations().wait_for(task.id).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Completed);

    assert_eq!(
        manager.migrations().purge_finished(Duration::from_secs(3600)),
        0
    );
    assert_eq!(manager.migrations().purge_finished(Duration::ZERO), 1);
    assert!(matches!(
        manager.migrations().get_migration(task.id),
        Err(StrandError::NotFound { .. })
    ));
    assert!(manager.migrations().list_migrations().is_empty());
}
