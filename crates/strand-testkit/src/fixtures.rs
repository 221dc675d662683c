//! Temporary stores and message builders

use std::path::Path;
use std::sync::Arc;

use strand_core::{
    AppendRequest, Message, SeqId, StoreConfig, StoreId, TimelineKey, TimelineService,
};
use strand_store::{LocalStore, TimelineStore};
use tempfile::TempDir;

/// A store living in a temporary directory that is removed on drop
pub struct TempStore {
    pub dir: TempDir,
    pub store: Arc<TimelineStore>,
    pub service: Arc<LocalStore>,
}

impl TempStore {
    pub fn id(&self) -> StoreId {
        self.store.store_id().clone()
    }

    /// The store as the coordination layer sees it
    pub fn as_service(&self) -> Arc<dyn TimelineService> {
        self.service.clone()
    }

    /// Close and reopen the store from disk
    pub fn reopen(&mut self) {
        let config = self.store.config().clone();
        let store = Arc::new(TimelineStore::open(config).unwrap());
        self.service = Arc::new(LocalStore::new(store.clone()));
        self.store = store;
    }
}

/// Store config rooted at `dir`
pub fn store_config(dir: &Path, store_id: &str, timeline_max_size: u64) -> StoreConfig {
    StoreConfig {
        store_id: store_id.to_string(),
        data_dir: dir.to_path_buf(),
        timeline_max_size,
        ..StoreConfig::default()
    }
}

/// Fresh store with `timeline_max_size` messages per block
pub fn temp_store(store_id: &str, timeline_max_size: u64) -> TempStore {
    temp_store_with(store_id, |config| config.timeline_max_size = timeline_max_size)
}

/// Fresh store with a hand-tuned config
pub fn temp_store_with(store_id: &str, tune: impl FnOnce(&mut StoreConfig)) -> TempStore {
    let dir = tempfile::tempdir().unwrap();
    let mut config = store_config(dir.path(), store_id, 1000);
    tune(&mut config);
    let store = Arc::new(TimelineStore::open(config).unwrap());
    let service = Arc::new(LocalStore::new(store.clone()));
    TempStore {
        dir,
        store,
        service,
    }
}

/// Text append to a conversation
pub fn conv_text(conv: &str, sender: &str, text: &str) -> AppendRequest {
    AppendRequest::new(
        TimelineKey::conversation(conv),
        sender,
        text.as_bytes().to_vec(),
    )
}

/// Text append to a conversation, copied to each recipient's inbox
pub fn conv_text_to(conv: &str, sender: &str, text: &str, recipients: &[&str]) -> AppendRequest {
    conv_text(conv, sender, text)
        .with_fanout(recipients.iter().map(|r| TimelineKey::inbox(*r)).collect())
}

/// Stored message with a fixed sequence number
pub fn message(key: &TimelineKey, seq_id: SeqId, text: &str) -> Message {
    Message {
        seq_id,
        timeline_key: key.clone(),
        sender_id: "tester".to_string(),
        create_time: 1_700_000_000_000 + seq_id,
        data: text.as_bytes().to_vec(),
    }
}

/// Payloads as UTF-8 strings, in order
pub fn bodies(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|m| String::from_utf8_lossy(&m.data).into_owned())
        .collect()
}
