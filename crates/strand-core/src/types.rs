//! Core identifiers and records shared by every Strand layer
//!
//! Timelines, blocks, messages and the read/write request shapes used both by
//! the local store and by the cross-store wire protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{Result, StrandError};

/// Per-store monotonically increasing message sequence number
pub type SeqId = u64;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a capacity-bounded shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(String);

impl StoreId {
    /// Create a store identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Kind of timeline: a conversation stream or a user's inbox feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimelineType {
    /// One conversation's message stream
    #[serde(rename = "conv")]
    Conversation,
    /// One user's inbox feed
    #[serde(rename = "inbox")]
    Inbox,
}

impl TimelineType {
    /// Short name used in keys and file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conv",
            Self::Inbox => "inbox",
        }
    }
}

impl FromStr for TimelineType {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conv" => Ok(Self::Conversation),
            "inbox" => Ok(Self::Inbox),
            other => Err(StrandError::invalid(format!("unknown timeline type '{other}'"))),
        }
    }
}

impl fmt::Display for TimelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key addressing one timeline, rendered as `conv:<id>` or `inbox:<id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimelineKey {
    /// Timeline kind
    pub kind: TimelineType,
    /// Conversation or user identifier
    pub id: String,
}

impl TimelineKey {
    /// Create a key of the given kind
    pub fn new(kind: TimelineType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Key of a conversation timeline
    pub fn conversation(id: impl Into<String>) -> Self {
        Self::new(TimelineType::Conversation, id)
    }

    /// Key of a user's inbox timeline
    pub fn inbox(user_id: impl Into<String>) -> Self {
        Self::new(TimelineType::Inbox, user_id)
    }

    /// Check that the id is usable as a file name component
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(StrandError::invalid("timeline id must not be empty"));
        }
        let ok = self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
        if !ok || self.id.starts_with('.') {
            return Err(StrandError::invalid(format!(
                "timeline id '{}' contains unsupported characters",
                self.id
            )));
        }
        Ok(())
    }

    /// Logical lock key guarding this timeline
    pub fn lock_key(&self) -> String {
        format!("timeline:{self}")
    }

    /// File stem of the timeline metadata file (`<type>_<id>`)
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.kind.as_str(), self.id)
    }
}

impl fmt::Display for TimelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for TimelineKey {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| StrandError::invalid(format!("timeline key '{s}' lacks a type prefix")))?;
        let key = Self::new(kind.parse()?, id);
        key.validate()?;
        Ok(key)
    }
}

/// Identifier of a timeline block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub Uuid);

impl BlockId {
    /// Allocate a fresh block identifier
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for BlockId {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StrandError::invalid(format!("bad block id '{s}': {e}")))
    }
}

// =============================================================================
// Records
// =============================================================================

/// Immutable message record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Sequence number assigned by the owning store
    pub seq_id: SeqId,
    /// Timeline the message was originally sent to
    pub timeline_key: TimelineKey,
    /// Sender identifier
    pub sender_id: String,
    /// Creation time, Unix milliseconds
    pub create_time: u64,
    /// Opaque payload
    pub data: Vec<u8>,
}

/// Block lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    /// Accepting appends
    Open,
    /// Reached the size limit, flushed and immutable
    Full,
}

/// Location and size metadata of one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    /// Block identifier
    pub block_id: BlockId,
    /// Store that owns the block
    pub store_id: StoreId,
    /// Store capacity offset at which the block was allocated
    pub offset: u64,
    /// Number of messages in the block
    pub size: u64,
    /// Lifecycle state
    pub state: BlockState,
    /// Allocation time, Unix milliseconds
    pub created_at: u64,
}

/// Summary of a timeline as hosted by one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineInfo {
    /// Timeline key
    pub key: TimelineKey,
    /// Hosting store
    pub store_id: StoreId,
    /// Highest sequence number appended
    pub last_seq_id: SeqId,
    /// Total messages across all blocks
    pub message_count: u64,
    /// Blocks in order
    pub blocks: Vec<BlockInfo>,
    /// The open block, if any
    pub current_block: Option<BlockId>,
}

/// A block's metadata and contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSnapshot {
    /// Owning timeline
    pub timeline_key: TimelineKey,
    /// Block metadata
    pub info: BlockInfo,
    /// Messages in sequence order
    pub messages: Vec<Message>,
}

// =============================================================================
// Requests
// =============================================================================

/// Pagination cursor for message reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "seq")]
pub enum MessageCursor {
    /// The most recent messages
    Latest,
    /// Messages strictly older than the sequence number
    Before(SeqId),
    /// Messages strictly newer than the sequence number
    After(SeqId),
}

impl MessageCursor {
    /// Build a cursor from optional before/after bounds
    pub fn from_bounds(before: Option<SeqId>, after: Option<SeqId>) -> Result<Self> {
        match (before, after) {
            (None, None) => Ok(Self::Latest),
            (Some(seq), None) => Ok(Self::Before(seq)),
            (None, Some(seq)) => Ok(Self::After(seq)),
            (Some(_), Some(_)) => Err(StrandError::invalid(
                "only one of before and after may be given",
            )),
        }
    }
}

/// A paginated message read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageQuery {
    /// Maximum messages to return
    pub limit: usize,
    /// Pagination cursor
    pub cursor: MessageCursor,
}

impl MessageQuery {
    /// The `limit` most recent messages
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            cursor: MessageCursor::Latest,
        }
    }

    /// Up to `limit` messages strictly older than `seq`
    pub fn before(seq: SeqId, limit: usize) -> Self {
        Self {
            limit,
            cursor: MessageCursor::Before(seq),
        }
    }

    /// Up to `limit` messages strictly newer than `seq`
    pub fn after(seq: SeqId, limit: usize) -> Self {
        Self {
            limit,
            cursor: MessageCursor::After(seq),
        }
    }
}

/// Append a message to a timeline and fan it out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendRequest {
    /// Primary timeline
    pub timeline_key: TimelineKey,
    /// Sender identifier
    pub sender_id: String,
    /// Opaque payload
    pub data: Vec<u8>,
    /// Additional timelines receiving a copy (e.g. recipients' inboxes)
    #[serde(default)]
    pub fanout: Vec<TimelineKey>,
}

impl AppendRequest {
    /// Append without fan-out
    pub fn new(timeline_key: TimelineKey, sender_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            timeline_key,
            sender_id: sender_id.into(),
            data,
            fanout: Vec::new(),
        }
    }

    /// Add fan-out targets
    pub fn with_fanout(mut self, fanout: Vec<TimelineKey>) -> Self {
        self.fanout = fanout;
        self
    }

    /// Primary key followed by fan-out keys, duplicates removed
    pub fn targets(&self) -> Vec<TimelineKey> {
        let mut out = vec![self.timeline_key.clone()];
        for key in &self.fanout {
            if !out.contains(key) {
                out.push(key.clone());
            }
        }
        out
    }
}

/// Where one copy of an appended message landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPlacement {
    /// Timeline that received the copy
    pub timeline_key: TimelineKey,
    /// Block state after the append
    pub block: BlockInfo,
    /// The block was allocated by this append
    pub new_block: bool,
}

/// Result of a successful append
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendReceipt {
    /// The stored message
    pub message: Message,
    /// One placement per timeline written
    pub placements: Vec<BlockPlacement>,
}

// =============================================================================
// Store introspection
// =============================================================================

/// Capacity and content counters of one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Store identifier
    pub store_id: StoreId,
    /// Hosted timelines
    pub timeline_count: u64,
    /// Blocks across all timelines
    pub block_count: u64,
    /// Messages across all timelines
    pub message_count: u64,
    /// Message slots in use
    pub current_capacity: u64,
    /// Message slot limit
    pub max_capacity: u64,
    /// Timeline count the store is sized for
    pub max_timelines: u64,
    /// Highest sequence number issued
    pub last_seq_id: SeqId,
}

impl StoreStats {
    /// Fraction of message slots in use
    pub fn capacity_ratio(&self) -> f64 {
        ratio(self.current_capacity, self.max_capacity)
    }

    /// Fraction of the timeline budget in use
    pub fn timeline_ratio(&self) -> f64 {
        ratio(self.timeline_count, self.max_timelines)
    }
}

fn ratio(used: u64, max: u64) -> f64 {
    if max == 0 {
        1.0
    } else {
        used as f64 / max as f64
    }
}

/// Health levels reported by a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally
    Healthy,
    /// Serving, but close to a limit
    Degraded,
    /// Not serving
    Unhealthy,
}

/// Health check result of one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Store identifier
    pub store_id: StoreId,
    /// Health level
    pub status: HealthStatus,
    /// Diagnostic text
    pub message: String,
    /// Time of the check, Unix milliseconds
    pub checked_at: u64,
}
