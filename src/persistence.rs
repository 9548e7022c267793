//! Durable storage for signer material.
//!
//! The registry owns what gets stored; this module only knows how to put
//! opaque blobs on disk and get them back. Layout under the storage root:
//!
//! ```text
//! <root>/current/<keep>/<file>     committed material
//! <root>/snapshot/<keep>/<file>    tentative material, kept for recovery
//! <root>/archive/<keep>[.N]        retired keeps, kept for operator audit
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One stored blob, as enumerated by [`PersistenceHandle::read_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDescriptor {
    pub directory: String,
    pub name: String,
    pub content: Vec<u8>,
}

#[async_trait]
pub trait PersistenceHandle: Send + Sync {
    /// Durable write: the data has hit stable storage when this returns.
    async fn save(&self, directory: &str, name: &str, data: &[u8]) -> Result<(), PersistenceError>;

    /// Best-effort tentative write, never enumerated by `read_all`.
    async fn snapshot(
        &self,
        directory: &str,
        name: &str,
        data: &[u8],
    ) -> Result<(), PersistenceError>;

    /// Moves a directory out of the committed set, retaining its contents
    /// under the archive prefix. A no-op for directories that do not exist.
    async fn archive(&self, directory: &str) -> Result<(), PersistenceError>;

    /// Enumerates every committed blob.
    async fn read_all(
        &self,
    ) -> Result<BoxStream<'static, Result<DataDescriptor, PersistenceError>>, PersistenceError>;
}

/// Filesystem-backed [`PersistenceHandle`].
pub struct DiskHandle {
    current: PathBuf,
    snapshot: PathBuf,
    archive: PathBuf,
}

impl DiskHandle {
    pub fn new(base: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let base = base.as_ref();
        let handle = Self {
            current: base.join("current"),
            snapshot: base.join("snapshot"),
            archive: base.join("archive"),
        };
        std::fs::create_dir_all(&handle.current)?;
        std::fs::create_dir_all(&handle.snapshot)?;
        std::fs::create_dir_all(&handle.archive)?;
        Ok(handle)
    }

    // Write to a temp file, then rename, so a crash never leaves a torn file
    // at the final path.
    async fn write_file(
        root: &Path,
        directory: &str,
        name: &str,
        data: &[u8],
        durable: bool,
    ) -> Result<(), PersistenceError> {
        let dir = root.join(directory);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(name);
        let tmp_path = dir.join(format!("{name}.tmp"));

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        if durable {
            file.sync_all().await?;
        }
        drop(file);

        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceHandle for DiskHandle {
    async fn save(&self, directory: &str, name: &str, data: &[u8]) -> Result<(), PersistenceError> {
        Self::write_file(&self.current, directory, name, data, true).await
    }

    async fn snapshot(
        &self,
        directory: &str,
        name: &str,
        data: &[u8],
    ) -> Result<(), PersistenceError> {
        Self::write_file(&self.snapshot, directory, name, data, false).await
    }

    async fn archive(&self, directory: &str) -> Result<(), PersistenceError> {
        let source = self.current.join(directory);
        if !tokio::fs::try_exists(&source).await? {
            return Ok(());
        }

        let mut destination = self.archive.join(directory);
        let mut suffix = 0u32;
        while tokio::fs::try_exists(&destination).await? {
            suffix += 1;
            destination = self.archive.join(format!("{directory}.{suffix}"));
        }

        tokio::fs::rename(&source, &destination).await?;
        Ok(())
    }

    async fn read_all(
        &self,
    ) -> Result<BoxStream<'static, Result<DataDescriptor, PersistenceError>>, PersistenceError>
    {
        let mut entries = Vec::new();

        let mut directories = tokio::fs::read_dir(&self.current).await?;
        while let Some(dir_entry) = directories.next_entry().await? {
            if !dir_entry.file_type().await?.is_dir() {
                continue;
            }
            let directory = dir_entry.file_name().to_string_lossy().into_owned();

            let mut files = tokio::fs::read_dir(dir_entry.path()).await?;
            while let Some(file_entry) = files.next_entry().await? {
                if !file_entry.file_type().await?.is_file() {
                    continue;
                }
                let name = file_entry.file_name().to_string_lossy().into_owned();
                entries.push(match tokio::fs::read(file_entry.path()).await {
                    Ok(content) => Ok(DataDescriptor {
                        directory: directory.clone(),
                        name,
                        content,
                    }),
                    Err(err) => Err(PersistenceError::Io(err)),
                });
            }
        }

        Ok(stream::iter(entries).boxed())
    }
}
