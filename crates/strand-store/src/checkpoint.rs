//! Per-user read checkpoints persisted in `checkpoints.json`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use strand_core::{Result, SeqId, StrandError};

use crate::files;

pub(crate) const CHECKPOINT_FILE: &str = "checkpoints.json";

#[derive(Debug)]
pub(crate) struct Checkpoints {
    path: PathBuf,
    marks: BTreeMap<String, SeqId>,
}

impl Checkpoints {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(CHECKPOINT_FILE);
        let marks = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StrandError::corruption(format!("unreadable {CHECKPOINT_FILE}: {e}"))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, marks })
    }

    pub fn get(&self, user_id: &str) -> SeqId {
        self.marks.get(user_id).copied().unwrap_or(0)
    }

    /// Move a user's checkpoint forward; equal values are a no-op
    pub fn update(&mut self, user_id: &str, seq_id: SeqId) -> Result<bool> {
        let current = self.get(user_id);
        if seq_id < current {
            return Err(StrandError::invalid(format!(
                "checkpoint for {user_id} cannot move back from {current} to {seq_id}"
            )));
        }
        if seq_id == current {
            return Ok(false);
        }
        let mut next = self.marks.clone();
        next.insert(user_id.to_string(), seq_id);
        files::write_atomic(&self.path, &serde_json::to_vec(&next)?)?;
        self.marks = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoints_only_move_forward() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoints = Checkpoints::open(dir.path()).unwrap();
        assert_eq!(checkpoints.get("bob"), 0);
        assert!(checkpoints.update("bob", 5).unwrap());
        assert!(!checkpoints.update("bob", 5).unwrap());
        assert!(matches!(
            checkpoints.update("bob", 4),
            Err(StrandError::Invalid { .. })
        ));

        let reopened = Checkpoints::open(dir.path()).unwrap();
        assert_eq!(reopened.get("bob"), 5);
    }
}
