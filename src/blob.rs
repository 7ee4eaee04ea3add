//! Filesystem namespace holding the original uploaded files.
//!
//! Keys are relative paths of the form `uploads/<sha256>.<ext>`, so two
//! uploads of the same bytes share one file.

use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{AppError, AppResult};

pub const UPLOAD_DIR: &str = "uploads";

#[derive(Debug, Clone)]
pub struct BlobArea {
    root: PathBuf,
}

impl BlobArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure_dirs(&self) -> AppResult<()> {
        fs::create_dir_all(self.root.join(UPLOAD_DIR)).await?;
        Ok(())
    }

    /// Deterministic key for a content hash and lower-case extension.
    pub fn key_for(hash_hex: &str, ext: &str) -> String {
        format!("{}/{}.{}", UPLOAD_DIR, hash_hex, ext)
    }

    fn path_for(&self, key: &str) -> AppResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(AppError::Storage(format!("invalid blob key: {}", key)));
        }
        Ok(self.root.join(relative))
    }

    /// Write `data` under `key`. Returns `false` when the blob already existed,
    /// in which case nothing is written.
    pub async fn put_if_absent(&self, key: &str, data: &[u8]) -> AppResult<bool> {
        let path = self.path_for(key)?;
        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(true)
    }

    pub async fn size(&self, key: &str) -> AppResult<u64> {
        let path = self.path_for(key)?;
        let meta = fs::metadata(&path).await.map_err(|e| missing(key, e))?;
        Ok(meta.len())
    }

    pub async fn read(&self, key: &str) -> AppResult<Bytes> {
        let path = self.path_for(key)?;
        let data = fs::read(&path).await.map_err(|e| missing(key, e))?;
        Ok(Bytes::from(data))
    }

    /// Read the inclusive byte range `start..=end`.
    pub async fn read_range(&self, key: &str, start: u64, end: u64) -> AppResult<Bytes> {
        if end < start {
            return Err(AppError::Internal(format!(
                "inverted blob range {}-{}",
                start, end
            )));
        }
        let len = usize::try_from(end - start + 1)
            .map_err(|_| AppError::Internal("blob range exceeds address space".into()))?;

        let path = self.path_for(key)?;
        let mut file = fs::File::open(&path).await.map_err(|e| missing(key, e))?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;

        Ok(Bytes::from(buf))
    }

    /// Remove a blob; a missing file is not an error.
    pub async fn delete(&self, key: &str) -> AppResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn missing(key: &str, err: std::io::Error) -> AppError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AppError::Storage(format!("blob {} is missing", key))
    } else {
        AppError::Io(err)
    }
}
