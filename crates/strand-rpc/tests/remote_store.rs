//! `RemoteStore` against a live `RpcServer` on a loopback port

use std::sync::Arc;

use strand_core::{
    HealthStatus, MessageQuery, RpcConfig, StrandConfig, StrandError, TimelineKey,
    TimelineService,
};
use strand_placement::StoreInfo;
use strand_rpc::{RemoteStore, RpcMethod, RpcRequest, RpcResponse, RpcServer};
use strand_shard::{MigrationStatus, ShardManager};
use strand_testkit::{bodies, conv_text, conv_text_to, message, temp_store, TempStore};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Served {
    url: String,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<strand_core::Result<()>>,
}

impl Served {
    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn serve(store: &TempStore) -> Served {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    let server = RpcServer::new(store.as_service());
    let task = tokio::spawn(server.serve(listener, async move {
        let _ = stopped.await;
    }));
    Served {
        url,
        stop: Some(stop),
        task,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_calls_match_local_store() {
    let store = temp_store("s1", 2);
    let served = serve(&store).await;
    let remote = RemoteStore::connect(&served.url, &RpcConfig::default())
        .await
        .unwrap();
    assert_eq!(remote.store_id(), &store.id());

    let key = TimelineKey::conversation("c1");
    remote.create_timeline(&key).await.unwrap();
    for text in ["a", "b", "c"] {
        remote.add_message(conv_text("c1", "alice", text)).await.unwrap();
    }
    let receipt = remote
        .add_message(conv_text_to("c1", "alice", "d", &["bob"]))
        .await
        .unwrap();
    assert_eq!(receipt.placements.len(), 2);

    let latest = remote.get_messages(&key, MessageQuery::latest(2)).await.unwrap();
    assert_eq!(bodies(&latest), vec!["c", "d"]);
    let older = remote
        .get_messages(&key, MessageQuery::before(latest[0].seq_id, 10))
        .await
        .unwrap();
    assert_eq!(bodies(&older), vec!["a", "b"]);

    let info = remote.get_timeline(&key).await.unwrap();
    assert_eq!(info.message_count, 4);
    let block = remote.get_block(&info.blocks[0].block_id).await.unwrap();
    assert_eq!(bodies(&block.messages), vec!["a", "b"]);

    let stats = remote.stats().await.unwrap();
    assert_eq!(stats, store.store.stats());
    assert_eq!(remote.health().await.unwrap().status, HealthStatus::Healthy);
    assert_eq!(remote.ping().await.unwrap().store_id, store.id());

    remote.delete_timeline(&key).await.unwrap();
    assert!(!store.store.contains(&key));
    served.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_errors_keep_their_variant() {
    let store = temp_store("s1", 10);
    let served = serve(&store).await;
    let remote = RemoteStore::new(store.id(), &served.url, &RpcConfig::default()).unwrap();

    let missing = TimelineKey::inbox("nobody");
    assert!(matches!(
        remote.get_timeline(&missing).await,
        Err(StrandError::NotFound { .. })
    ));
    let bad = TimelineKey::conversation("../escape");
    assert!(matches!(
        remote.create_timeline(&bad).await,
        Err(StrandError::Invalid { .. })
    ));
    served.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_migrate_method_keeps_sequence_numbers() {
    let store = temp_store("s1", 10);
    let served = serve(&store).await;
    let remote = RemoteStore::new(store.id(), &served.url, &RpcConfig::default()).unwrap();

    let key = TimelineKey::conversation("moved");
    let batch = vec![message(&key, 40, "x"), message(&key, 41, "y")];
    let info = remote.import_messages(&key, batch.clone()).await.unwrap();
    assert_eq!(info.last_seq_id, 41);
    assert_eq!(
        store.store.get_messages(&key, MessageQuery::latest(10)).unwrap(),
        batch
    );

    // A fresh append continues after the imported history
    let next = remote.add_message(conv_text("other", "alice", "z")).await.unwrap();
    assert!(next.message.seq_id > 41);
    served.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_store_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let config = RpcConfig {
        request_timeout_ms: 2_000,
        ..RpcConfig::default()
    };
    let remote = RemoteStore::new("gone".into(), url, &config).unwrap();
    let err = remote.stats().await.unwrap_err();
    assert!(err.is_retryable(), "unexpected error {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_envelope_is_rejected() {
    let store = temp_store("s1", 10);
    let served = serve(&store).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/rpc", served.url))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let envelope: RpcResponse = response.json().await.unwrap();
    assert!(!envelope.success);

    let mut request = RpcRequest::new(RpcMethod::GetStoreStats, &(), 0).unwrap();
    request.params = serde_json::json!({"ignored": true});
    let response: RpcResponse = client
        .post(format!("{}/rpc", served.url))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.request_id, request.request_id);
    served.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shard_manager_migrates_to_remote_store() {
    let (local, far) = (temp_store("local", 10), temp_store("far", 10));
    let served = serve(&far).await;
    let remote = Arc::new(RemoteStore::connect(&served.url, &RpcConfig::default()).await.unwrap());

    let mut config = StrandConfig::default();
    config.rebalance.enabled = false;
    let manager = ShardManager::new(config).unwrap();
    manager
        .register_store(StoreInfo::new(local.id(), ""), local.as_service())
        .unwrap();
    manager
        .register_store(StoreInfo::new(far.id(), served.url.clone()), remote)
        .unwrap();

    let key = TimelineKey::conversation("c1");
    local.store.create_timeline(&key).unwrap();
    manager.index().register_timeline(&key, &local.id()).unwrap();
    for text in ["one", "two"] {
        manager
            .add_message_with_transaction(conv_text("c1", "alice", text))
            .await
            .unwrap();
    }

    let task = manager
        .migrate_timeline_with_transaction(&key, &far.id())
        .await
        .unwrap();
    let done = manager.migrations().wait_for(task.id).await.unwrap();
    assert_eq!(done.status, MigrationStatus::Completed);
    assert_eq!(manager.index().store_of(&key), Some(far.id()));

    manager
        .add_message_with_transaction(conv_text("c1", "alice", "three"))
        .await
        .unwrap();
    let read = manager
        .get_messages_with_lock(&key, MessageQuery::latest(10))
        .await
        .unwrap();
    assert_eq!(bodies(&read), vec!["one", "two", "three"]);
    assert!(!local.store.contains(&key));

    manager.shutdown().await;
    served.stop().await;
}
