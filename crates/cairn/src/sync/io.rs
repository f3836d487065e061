//! Byte-level file access used by the sync engine.

use crate::error::Result;
use async_trait::async_trait;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Read and atomically replace whole files.
#[async_trait]
pub trait FileIo: Send + Sync {
    /// Read a file. A missing file is `Ok(None)`.
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Replace a file so readers see either the old or the new contents.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()>;
}

/// [`FileIo`] over the local filesystem via `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

/// `ISSUES.md` -> `ISSUES.md.tmp`, next to the target so the rename stays on
/// one filesystem.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| OsString::from("cairn"), OsString::from);
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl FileIo for LocalFs {
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let temp = temp_path(path);
        let written = async {
            let file = File::create(&temp).await?;
            let mut writer = BufWriter::new(file);
            writer.write_all(bytes).await?;
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
            tokio::fs::rename(&temp, path).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&temp).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %temp.display(), error = %cleanup, "Failed to remove temp file");
                }
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_reads_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(LocalFs.read(&dir.path().join("absent.md")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("ISSUES.md");

        LocalFs.write_atomic(&path, b"first").await.unwrap();
        LocalFs.write_atomic(&path, b"second").await.unwrap();

        assert_eq!(LocalFs.read(&path).await.unwrap().unwrap(), b"second");
        assert!(!temp_path(&path).exists());
        assert_eq!(temp_path(&path).file_name().unwrap(), "ISSUES.md.tmp");
    }
}
