//! Metadata files: one per timeline (`<type>_<id>.meta`) and one for the
//! store as a whole (`store.json`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use strand_core::{BlockId, Result, SeqId, StrandError, TimelineKey, TimelineType};

use crate::files;

/// Extension of timeline metadata files
pub(crate) const META_EXTENSION: &str = "meta";

/// Store-wide metadata file
pub(crate) const STORE_META_FILE: &str = "store.json";

/// JSON body of a timeline metadata file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TimelineMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TimelineType,
    pub last_seq_id: SeqId,
    pub block_ids: Vec<BlockId>,
}

impl TimelineMeta {
    pub fn key(&self) -> TimelineKey {
        TimelineKey::new(self.kind, self.id.clone())
    }

    pub fn path(dir: &Path, key: &TimelineKey) -> PathBuf {
        dir.join(format!("{}.{META_EXTENSION}", key.file_stem()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let meta: Self = serde_json::from_slice(&bytes).map_err(|e| {
            StrandError::corruption(format!("unreadable metadata {}: {e}", path.display()))
        })?;
        meta.key().validate()?;
        Ok(meta)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        files::write_atomic(&Self::path(dir, &self.key()), &json)
    }
}

/// JSON body of `store.json`
///
/// Holds the highest sequence number the store has issued. Timeline metadata
/// alone cannot restore it once the timeline holding that number is deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoreMeta {
    pub last_seq_id: SeqId,
}

impl StoreMeta {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(STORE_META_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                StrandError::corruption(format!("unreadable {STORE_META_FILE}: {e}"))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        files::write_atomic(&dir.join(STORE_META_FILE), &serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let meta = TimelineMeta {
            id: "bob".into(),
            kind: TimelineType::Inbox,
            last_seq_id: 12,
            block_ids: vec![BlockId::new()],
        };
        meta.save(dir.path()).unwrap();

        let path = dir.path().join("inbox_bob.meta");
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["type"], "inbox");
        assert_eq!(json["lastSeqId"], 12);
        assert_eq!(json["blockIds"].as_array().unwrap().len(), 1);
        assert_eq!(TimelineMeta::load(&path).unwrap(), meta);
    }

    #[test]
    fn test_store_meta_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(StoreMeta::load(dir.path()).unwrap().last_seq_id, 0);
        StoreMeta { last_seq_id: 41 }.save(dir.path()).unwrap();
        assert_eq!(StoreMeta::load(dir.path()).unwrap().last_seq_id, 41);

        std::fs::write(dir.path().join(STORE_META_FILE), b"{").unwrap();
        assert!(matches!(
            StoreMeta::load(dir.path()),
            Err(StrandError::Corruption { .. })
        ));
    }
}
