//! One timeline: an ordered chain of blocks with at most one open block

use strand_core::{
    BlockId, BlockPlacement, Message, MessageCursor, MessageQuery, Result, SeqId, StoreId,
    StrandError, TimelineInfo, TimelineKey,
};

use crate::block::{Block, BlockStorage};
use crate::files;
use crate::meta::TimelineMeta;

#[derive(Debug)]
pub(crate) struct Timeline {
    key: TimelineKey,
    blocks: Vec<Block>,
    /// Index of the open block in `blocks`
    current: Option<usize>,
    last_seq_id: SeqId,
    deleted: bool,
}

impl Timeline {
    /// New timeline with one open block
    pub fn create(key: TimelineKey, storage: &BlockStorage, offset: u64, now_ms: u64) -> Result<Self> {
        let block = Block::allocate(storage, offset, now_ms)?;
        let timeline = Self {
            key,
            blocks: vec![block],
            current: Some(0),
            last_seq_id: 0,
            deleted: false,
        };
        timeline.save_meta(storage)?;
        Ok(timeline)
    }

    /// Rehydrate from metadata and block files
    pub fn load(meta: &TimelineMeta, storage: &BlockStorage, now_ms: u64) -> Result<Self> {
        let last = meta.block_ids.len().saturating_sub(1);
        let mut blocks = Vec::with_capacity(meta.block_ids.len());
        for (i, block_id) in meta.block_ids.iter().enumerate() {
            blocks.push(Block::load(storage, *block_id, i == last, now_ms)?);
        }

        let mut last_seq_id = meta.last_seq_id;
        let mut previous = 0;
        for message in blocks.iter().flat_map(|b| b.messages.iter()) {
            if message.seq_id <= previous {
                return Err(StrandError::corruption(format!(
                    "timeline {} is out of order at seq {}",
                    meta.key(),
                    message.seq_id
                )));
            }
            previous = message.seq_id;
            last_seq_id = last_seq_id.max(message.seq_id);
        }

        let current = blocks.last().filter(|b| b.is_open()).map(|_| blocks.len() - 1);
        Ok(Self {
            key: meta.key(),
            blocks,
            current,
            last_seq_id,
            deleted: false,
        })
    }

    pub fn key(&self) -> &TimelineKey {
        &self.key
    }

    pub fn last_seq_id(&self) -> SeqId {
        self.last_seq_id
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn message_count(&self) -> u64 {
        self.blocks.iter().map(|b| b.info.size).sum()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().map(Block::id)
    }

    pub fn block(&self, block_id: &BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id() == *block_id)
    }

    pub fn ensure_live(&self) -> Result<()> {
        if self.deleted {
            return Err(StrandError::not_found(format!("timeline {}", self.key)));
        }
        Ok(())
    }

    /// Append a message whose sequence number is above the high-water mark.
    ///
    /// Allocates a block at `offset` when there is no open block.
    pub fn append(
        &mut self,
        storage: &BlockStorage,
        message: Message,
        offset: u64,
        now_ms: u64,
    ) -> Result<BlockPlacement> {
        self.ensure_live()?;
        if message.seq_id <= self.last_seq_id {
            return Err(StrandError::invalid(format!(
                "seq {} is not above {} on timeline {}",
                message.seq_id, self.last_seq_id, self.key
            )));
        }

        let mut new_block = false;
        let index = match self.current {
            Some(index) => index,
            None => {
                self.blocks.push(Block::allocate(storage, offset, now_ms)?);
                let index = self.blocks.len() - 1;
                self.current = Some(index);
                new_block = true;
                self.save_meta(storage)?;
                index
            }
        };

        let seq_id = message.seq_id;
        let sealed = self.blocks[index].append(storage, message)?;
        self.last_seq_id = seq_id;
        if sealed {
            self.current = None;
            self.save_meta(storage)?;
        }

        Ok(BlockPlacement {
            timeline_key: self.key.clone(),
            block: self.blocks[index].info.clone(),
            new_block,
        })
    }

    /// Paginated read, always ascending by sequence number
    pub fn messages(&self, query: MessageQuery) -> Vec<Message> {
        let all = self.blocks.iter().flat_map(|b| b.messages.iter());
        let limit = query.limit;
        match query.cursor {
            MessageCursor::After(seq) => all.filter(|m| m.seq_id > seq).take(limit).cloned().collect(),
            MessageCursor::Before(seq) => {
                let mut page: Vec<Message> = self
                    .blocks
                    .iter()
                    .rev()
                    .flat_map(|b| b.messages.iter().rev())
                    .filter(|m| m.seq_id < seq)
                    .take(limit)
                    .cloned()
                    .collect();
                page.reverse();
                page
            }
            MessageCursor::Latest => {
                let total = self.message_count() as usize;
                all.skip(total.saturating_sub(limit)).cloned().collect()
            }
        }
    }

    pub fn info(&self, store_id: &StoreId) -> TimelineInfo {
        TimelineInfo {
            key: self.key.clone(),
            store_id: store_id.clone(),
            last_seq_id: self.last_seq_id,
            message_count: self.message_count(),
            blocks: self.blocks.iter().map(|b| b.info.clone()).collect(),
            current_block: self.current.map(|i| self.blocks[i].id()),
        }
    }

    /// Persist the open block and metadata
    pub fn persist(&self, storage: &BlockStorage) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        if let Some(index) = self.current {
            self.blocks[index].persist(storage)?;
        }
        self.save_meta(storage)
    }

    /// Delete every file of the timeline; returns the number of messages freed
    pub fn remove(&mut self, storage: &BlockStorage) -> Result<u64> {
        self.ensure_live()?;
        self.deleted = true;
        files::remove_if_exists(&TimelineMeta::path(&storage.dir, &self.key))?;
        for block in &self.blocks {
            block.remove_file(storage)?;
        }
        Ok(self.message_count())
    }

    fn save_meta(&self, storage: &BlockStorage) -> Result<()> {
        TimelineMeta {
            id: self.key.id.clone(),
            kind: self.key.kind,
            last_seq_id: self.last_seq_id,
            block_ids: self.block_ids().collect(),
        }
        .save(&storage.dir)
    }
}
