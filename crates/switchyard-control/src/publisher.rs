//! Atomic replacement of the live dynamic configuration file.
//!
//! The proxy watches the directory and reloads on change, so the live file must
//! only ever hold a complete document: content is written to a temp file in the
//! same directory, fsynced, then renamed over the live path.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::renderer::checksum;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("E2401: live config path {0} has no parent directory")]
    NoParent(PathBuf),

    #[error("E2402: failed to stage config in {dir}: {source}")]
    Stage { dir: PathBuf, source: io::Error },

    #[error("E2403: failed to swap config into {path}: {source}")]
    Swap { path: PathBuf, source: io::Error },

    #[error("E2404: failed to read live config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("E2405: failed to remove live config {path}: {source}")]
    Withdraw { path: PathBuf, source: io::Error },

    #[error("E2406: publish task failed: {0}")]
    Task(String),
}

/// Outcome of a successful swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub path: PathBuf,
    pub checksum: String,
    pub bytes: usize,
    pub published_at: DateTime<Utc>,
}

/// Writes documents to the live config path, all or nothing.
#[derive(Debug, Clone)]
pub struct AtomicPublisher {
    path: PathBuf,
}

impl AtomicPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the live file with `content`.
    pub async fn publish(&self, content: &str) -> Result<PublishResult, PublishError> {
        let path = self.path.clone();
        let content = content.to_string();
        tokio::task::spawn_blocking(move || {
            let staged = stage(&path, content.as_bytes())?;
            commit(staged, &path)?;
            Ok(PublishResult {
                checksum: checksum(&content),
                bytes: content.len(),
                path,
                published_at: Utc::now(),
            })
        })
        .await
        .map_err(|e| PublishError::Task(e.to_string()))?
    }

    /// Content of the live file, `None` if nothing is published.
    pub async fn current(&self) -> Result<Option<String>, PublishError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PublishError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Remove the live file. Returns whether there was one.
    pub async fn withdraw(&self) -> Result<bool, PublishError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                sync_parent(&self.path);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(PublishError::Withdraw {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Write `content` to a durable temp file next to `path`.
///
/// The temp file is deleted when the returned handle is dropped uncommitted.
fn stage(path: &Path, content: &[u8]) -> Result<NamedTempFile, PublishError> {
    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if !dir.is_dir() {
        return Err(PublishError::NoParent(path.to_path_buf()));
    }
    let stage_err = |source| PublishError::Stage {
        dir: dir.to_path_buf(),
        source,
    };

    // Dot-prefixed with a non-config suffix so the proxy's watcher ignores it.
    let mut tmp = tempfile::Builder::new()
        .prefix(".switchyard-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(stage_err)?;
    tmp.write_all(content).map_err(stage_err)?;
    tmp.as_file().sync_all().map_err(stage_err)?;
    Ok(tmp)
}

fn commit(staged: NamedTempFile, path: &Path) -> Result<(), PublishError> {
    staged.persist(path).map_err(|e| PublishError::Swap {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    sync_parent(path);
    Ok(())
}

/// Best-effort fsync of the containing directory so the rename is durable.
fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            tracing::debug!(dir = %dir.display(), error = %e, "directory fsync skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn publish_replaces_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = AtomicPublisher::new(dir.path().join("switchyard.yml"));

        assert_eq!(publisher.current().await.unwrap(), None);
        let first = publisher.publish("http: {}\n").await.unwrap();
        assert_eq!(first.bytes, 9);
        assert_eq!(first.checksum, checksum("http: {}\n"));

        publisher.publish("tcp: {}\n").await.unwrap();
        assert_eq!(publisher.current().await.unwrap().as_deref(), Some("tcp: {}\n"));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn interrupted_stage_leaves_live_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("switchyard.yml");
        let publisher = AtomicPublisher::new(&live);
        publisher.publish("original\n").await.unwrap();

        // A partially written document that never gets committed.
        let staged = stage(&live, b"http:\n  routers:\n    half").unwrap();
        assert_eq!(leftovers(dir.path()).len(), 1);
        drop(staged);

        assert_eq!(std::fs::read_to_string(&live).unwrap(), "original\n");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn failed_swap_cleans_up_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the live path makes the rename fail.
        let live = dir.path().join("switchyard.yml");
        std::fs::create_dir(&live).unwrap();
        std::fs::write(live.join("keep"), "x").unwrap();

        let err = AtomicPublisher::new(&live)
            .publish("http: {}\n")
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Swap { .. }));
        assert!(live.join("keep").exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = AtomicPublisher::new(dir.path().join("nope").join("switchyard.yml"));
        let err = publisher.publish("x").await.unwrap_err();
        assert!(matches!(err, PublishError::NoParent(_)));
    }

    #[tokio::test]
    async fn withdraw_removes_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = AtomicPublisher::new(dir.path().join("switchyard.yml"));
        assert!(!publisher.withdraw().await.unwrap());
        publisher.publish("x").await.unwrap();
        assert!(publisher.withdraw().await.unwrap());
        assert_eq!(publisher.current().await.unwrap(), None);
    }
}
