//! File helpers shared by block, metadata and checkpoint persistence

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use strand_core::Result;

/// Write `data` to `path` through a synced temporary file and a rename
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Append `data` to an existing file
pub(crate) fn append(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(data)?;
    Ok(())
}

/// Flush an existing file's contents to stable storage
pub(crate) fn sync(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

/// Remove a file, treating absence as success
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
