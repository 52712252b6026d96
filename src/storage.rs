use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Append-only text store backing the survey log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Size of the stored log in bytes; 0 when it does not exist yet.
    async fn len(&self) -> Result<u64>;

    /// Create (or truncate) the log with the given contents.
    async fn create(&self, contents: &str) -> Result<()>;

    async fn append(&self, contents: &str) -> Result<()>;

    async fn read_all(&self) -> Result<String>;
}

/// Log kept in a single file on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    path: PathBuf,
}

impl FileLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn len(&self) -> Result<u64> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {:?}", self.path)),
        }
    }

    async fn create(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create log directory {:?}", parent))?;
        }
        fs::write(&self.path, contents)
            .await
            .with_context(|| format!("Failed to create log {:?}", self.path))?;
        info!("Created log {:?}", self.path);
        Ok(())
    }

    async fn append(&self, contents: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open log {:?}", self.path))?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        debug!("Appended {} bytes to {:?}", contents.len(), self.path);
        Ok(())
    }

    async fn read_all(&self) -> Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read log {:?}", self.path)),
        }
    }
}
