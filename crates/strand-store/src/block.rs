//! Timeline blocks
//!
//! A block is an ordered, size-bounded batch of messages backed by one file
//! under `<data_dir>/blocks/`. Blocks are appended to while `Open` and become
//! immutable once `Full`; sealing fsyncs the file before the next block of
//! the timeline is allocated.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use strand_core::{
    BlockId, BlockInfo, BlockSnapshot, BlockState, DurabilityMode, Message, Result, StoreId,
    StrandError, TimelineKey,
};

use crate::codec::{self, BlockHeader, HEADER_LEN};
use crate::files;

/// Directory holding block files, relative to the store's data dir
pub(crate) const BLOCK_DIR: &str = "blocks";

/// Where and how block files are written
#[derive(Debug, Clone)]
pub(crate) struct BlockStorage {
    pub dir: PathBuf,
    pub store_id: StoreId,
    pub mode: DurabilityMode,
    pub max_size: u64,
}

impl BlockStorage {
    pub fn path(&self, block_id: &BlockId) -> PathBuf {
        block_path(&self.dir, block_id)
    }
}

pub(crate) fn block_path(dir: &Path, block_id: &BlockId) -> PathBuf {
    dir.join(BLOCK_DIR).join(format!("{block_id}.blk"))
}

#[derive(Debug)]
pub(crate) struct Block {
    pub info: BlockInfo,
    pub messages: Vec<Message>,
}

impl Block {
    /// Allocate a new open block at `offset`
    pub fn allocate(storage: &BlockStorage, offset: u64, now_ms: u64) -> Result<Self> {
        let info = BlockInfo {
            block_id: BlockId::new(),
            store_id: storage.store_id.clone(),
            offset,
            size: 0,
            state: BlockState::Open,
            created_at: now_ms,
        };
        let block = Self {
            info,
            messages: Vec::new(),
        };
        if storage.mode == DurabilityMode::WriteThrough {
            block.create_file(storage)?;
        }
        Ok(block)
    }

    /// Write an empty block file holding only the header
    fn create_file(&self, storage: &BlockStorage) -> Result<()> {
        let header = BlockHeader {
            offset: self.info.offset,
            created_at: self.info.created_at,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(storage.path(&self.id()))?;
        file.write_all(&header.encode())?;
        Ok(())
    }

    /// Rebuild a block from its file.
    ///
    /// Only the last block of a timeline may be open; a torn trailing record
    /// there is cut off, anywhere else it is corruption.
    pub fn load(storage: &BlockStorage, block_id: BlockId, is_last: bool, now_ms: u64) -> Result<Self> {
        let path = storage.path(&block_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && is_last => {
                // Open blocks are not on disk until flushed in seal-only mode
                tracing::warn!(
                    block = %block_id,
                    "open block file missing, starting it empty"
                );
                let block = Self {
                    info: BlockInfo {
                        block_id,
                        store_id: storage.store_id.clone(),
                        offset: 0,
                        size: 0,
                        state: BlockState::Open,
                        created_at: now_ms,
                    },
                    messages: Vec::new(),
                };
                // Write-through appends extend the file in place
                if storage.mode == DurabilityMode::WriteThrough {
                    block.create_file(storage)?;
                }
                return Ok(block);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrandError::corruption(format!(
                    "sealed block {block_id} is missing"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let header = BlockHeader::decode(&bytes)?;
        let decoded = codec::decode_records(&bytes[HEADER_LEN..])?;
        if decoded.torn {
            if !is_last {
                return Err(StrandError::corruption(format!(
                    "sealed block {block_id} ends in a partial record"
                )));
            }
            let keep = (HEADER_LEN + decoded.valid_len) as u64;
            tracing::warn!(
                block = %block_id,
                discarded = bytes.len() as u64 - keep,
                "discarding torn record at end of open block"
            );
            OpenOptions::new().write(true).open(&path)?.set_len(keep)?;
        }

        let size = decoded.messages.len() as u64;
        let state = if !is_last || size >= storage.max_size {
            BlockState::Full
        } else {
            BlockState::Open
        };
        Ok(Self {
            info: BlockInfo {
                block_id,
                store_id: storage.store_id.clone(),
                offset: header.offset,
                size,
                state,
                created_at: header.created_at,
            },
            messages: decoded.messages,
        })
    }

    pub fn id(&self) -> BlockId {
        self.info.block_id
    }

    pub fn is_open(&self) -> bool {
        self.info.state == BlockState::Open
    }

    /// Append one message, sealing the block when it reaches the size limit.
    /// Returns true when this append sealed the block.
    pub fn append(&mut self, storage: &BlockStorage, message: Message) -> Result<bool> {
        if !self.is_open() {
            return Err(StrandError::internal(format!(
                "append to sealed block {}",
                self.id()
            )));
        }
        if storage.mode == DurabilityMode::WriteThrough {
            let record = codec::encode_record(&message)?;
            files::append(&storage.path(&self.id()), &record)?;
        }
        self.messages.push(message);
        self.info.size += 1;

        if self.info.size >= storage.max_size {
            self.seal(storage)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark the block full and make its file durable
    fn seal(&mut self, storage: &BlockStorage) -> Result<()> {
        self.persist(storage)?;
        self.info.state = BlockState::Full;
        tracing::info!(
            store = %storage.store_id,
            block = %self.id(),
            size = self.info.size,
            "block sealed"
        );
        Ok(())
    }

    /// Make the current contents durable without sealing
    pub fn persist(&self, storage: &BlockStorage) -> Result<()> {
        let path = storage.path(&self.id());
        match storage.mode {
            DurabilityMode::WriteThrough => files::sync(&path),
            DurabilityMode::SealOnly => files::write_atomic(&path, &self.encode()?),
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let header = BlockHeader {
            offset: self.info.offset,
            created_at: self.info.created_at,
        };
        let mut out = header.encode().to_vec();
        for message in &self.messages {
            out.extend_from_slice(&codec::encode_record(message)?);
        }
        Ok(out)
    }

    pub fn remove_file(&self, storage: &BlockStorage) -> Result<()> {
        files::remove_if_exists(&storage.path(&self.id()))?;
        Ok(())
    }

    pub fn snapshot(&self, timeline_key: &TimelineKey) -> BlockSnapshot {
        BlockSnapshot {
            timeline_key: timeline_key.clone(),
            info: self.info.clone(),
            messages: self.messages.clone(),
        }
    }
}
