//! Binary block file format
//!
//! A block file is a fixed header followed by length-prefixed records:
//!
//! ```text
//! header : "STRB" | version u8 | offset u64 LE | created_at u64 LE
//! record : len u32 LE | checksum u32 LE | bincode(Message)
//! ```
//!
//! The checksum is the first four bytes of the BLAKE3 hash of the payload.

use strand_core::{Message, Result, StrandError};

/// Magic bytes opening every block file
pub const BLOCK_MAGIC: [u8; 4] = *b"STRB";

/// Current block format version
pub const FORMAT_VERSION: u8 = 1;

/// Size of the block header in bytes
pub const HEADER_LEN: usize = 4 + 1 + 8 + 8;

/// Size of a record prefix in bytes
pub const RECORD_PREFIX_LEN: usize = 8;

/// Records larger than this are treated as corruption rather than a torn tail
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Block metadata stored in the file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Store capacity offset at allocation
    pub offset: u64,
    /// Allocation time, Unix milliseconds
    pub created_at: u64,
}

impl BlockHeader {
    /// Encode the header
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&BLOCK_MAGIC);
        out[4] = FORMAT_VERSION;
        out[5..13].copy_from_slice(&self.offset.to_le_bytes());
        out[13..21].copy_from_slice(&self.created_at.to_le_bytes());
        out
    }

    /// Decode a header from the start of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(StrandError::corruption(format!(
                "block header truncated: {} of {HEADER_LEN} bytes",
                buf.len()
            )));
        }
        if buf[..4] != BLOCK_MAGIC {
            return Err(StrandError::corruption("bad block magic"));
        }
        if buf[4] != FORMAT_VERSION {
            return Err(StrandError::corruption(format!(
                "unsupported block format version {}",
                buf[4]
            )));
        }
        Ok(Self {
            offset: u64::from_le_bytes(read8(&buf[5..13])),
            created_at: u64::from_le_bytes(read8(&buf[13..21])),
        })
    }
}

/// Checksum stored in a record prefix
pub fn checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Encode one message as a framed record
pub fn encode_record(message: &Message) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(StrandError::invalid(format!(
            "message of {} bytes exceeds the record limit",
            payload.len()
        )));
    }
    let mut out = Vec::with_capacity(RECORD_PREFIX_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Records decoded from a block body
#[derive(Debug, Default)]
pub struct DecodedRecords {
    /// Messages in file order
    pub messages: Vec<Message>,
    /// Bytes of the body covered by complete records
    pub valid_len: usize,
    /// The body ended in an incomplete record
    pub torn: bool,
}

/// Decode every record in a block body (the bytes after the header).
///
/// An incomplete trailing record is reported through `torn` instead of
/// failing; the caller decides whether that is tolerable.
pub fn decode_records(body: &[u8]) -> Result<DecodedRecords> {
    let mut decoded = DecodedRecords::default();
    let mut pos = 0;
    while pos < body.len() {
        let rest = &body[pos..];
        if rest.len() < RECORD_PREFIX_LEN {
            decoded.torn = true;
            break;
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let expected = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        if len > MAX_RECORD_LEN {
            return Err(StrandError::corruption(format!(
                "record at byte {pos} claims {len} bytes"
            )));
        }
        if rest.len() - RECORD_PREFIX_LEN < len {
            decoded.torn = true;
            break;
        }
        let payload = &rest[RECORD_PREFIX_LEN..RECORD_PREFIX_LEN + len];
        if checksum(payload) != expected {
            return Err(StrandError::corruption(format!(
                "checksum mismatch in record at byte {pos}"
            )));
        }
        let message: Message = bincode::deserialize(payload).map_err(|e| {
            StrandError::corruption(format!("undecodable record at byte {pos}: {e}"))
        })?;
        decoded.messages.push(message);
        pos += RECORD_PREFIX_LEN + len;
        decoded.valid_len = pos;
    }
    Ok(decoded)
}

fn read8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}
