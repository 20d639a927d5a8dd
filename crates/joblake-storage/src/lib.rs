//! HTTP page fetching and the filesystem-rooted object store.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::Url;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "joblake-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.bigdata-navi.com".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-attempt GET client. A relative path resolves against the base
/// origin; a failed page is not re-fetched here, pacing between pages is
/// the crawler's concern.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    base: Url,
}

impl PageFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("parsing base url {}", config.base_url))?;
        Ok(Self { client, base })
    }

    pub fn resolve(&self, path_or_url: &str) -> Result<Url, FetchError> {
        if path_or_url.starts_with("http") {
            Url::parse(path_or_url).map_err(|e| FetchError::InvalidUrl(format!("{path_or_url}: {e}")))
        } else {
            self.base
                .join(path_or_url)
                .map_err(|e| FetchError::InvalidUrl(format!("{path_or_url}: {e}")))
        }
    }

    pub async fn fetch_text(&self, path_or_url: &str) -> Result<String, FetchError> {
        let url = self.resolve(path_or_url)?;
        info!(%url, "sending GET request");
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text().await?)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store io at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object key {0} escapes the store root")]
    InvalidKey(String),
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Filesystem-rooted object store. Keys are slash-separated paths relative
/// to the root, e.g. `raw/jobs/partition_date=20241227/jobs.csv`.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|seg| seg == "..") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    /// Write bytes under `key` via a temp file and atomic rename; an
    /// existing object at the same key is replaced.
    pub async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        let parent = match path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Err(StoreError::InvalidKey(key.to_string())),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| io_err(&parent, e))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| io_err(&temp_path, e))?;
        file.flush().await.map_err(|e| io_err(&temp_path, e))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(&path, err))
            }
        }
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(key)?;
        fs::read(&path).await.map_err(|e| io_err(&path, e))
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.object_path(key)?;
        fs::try_exists(&path).await.map_err(|e| io_err(&path, e))
    }

    /// Object size in bytes, or `None` if the key is absent.
    pub async fn byte_size(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    /// All object keys under a directory-like prefix, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.object_path(prefix.trim_end_matches('/'))?;
        if !fs::try_exists(&dir).await.map_err(|e| io_err(&dir, e))? {
            return Ok(Vec::new());
        }

        let mut pending = vec![dir];
        let mut keys = Vec::new();
        while let Some(current) = pending.pop() {
            let mut entries = fs::read_dir(&current)
                .await
                .map_err(|e| io_err(&current, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&current, e))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| io_err(&path, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Delete one object; absence is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    /// Delete every object under a prefix, returning the removed count.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let keys = self.list(prefix).await?;
        let mut removed = 0;
        for key in keys {
            self.delete(&key).await?;
            removed += 1;
        }
        Ok(removed)
    }
}
