//! Local trailing window of chat history for the terminal client.
//!
//! Only the most recent records are written. When the write fails, most
//! commonly because the encoded window exceeds the byte quota, a smaller
//! window is tried once before giving up. A failed save never ends the
//! session.

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::warn;

use crate::record::MessageRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryWindow {
    pub primary: usize,
    pub fallback: usize,
    pub quota_bytes: usize,
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self {
            primary: 50,
            fallback: 25,
            quota_bytes: 512 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history needs {size} bytes but the quota is {quota}")]
    QuotaExceeded { size: usize, quota: usize },
    #[error("failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("history file error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { records: usize },
    Reduced { records: usize },
    Failed,
}

pub struct HistoryStore {
    path: PathBuf,
    window: HistoryWindow,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, window: HistoryWindow) -> Self {
        Self {
            path: path.into(),
            window,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored window. A missing or unreadable file yields nothing.
    pub async fn load(&self) -> Vec<MessageRecord> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to read history");
                return Vec::new();
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(records) => records,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring corrupt history");
                Vec::new()
            }
        }
    }

    pub async fn save(&self, records: &[MessageRecord]) -> SaveOutcome {
        let primary = trailing(records, self.window.primary);
        let err = match self.write(primary).await {
            Ok(()) => {
                return SaveOutcome::Saved {
                    records: primary.len(),
                };
            }
            Err(err) => err,
        };
        warn!(error = %err, "failed to save history, retrying with a smaller window");

        let fallback = trailing(records, self.window.fallback);
        match self.write(fallback).await {
            Ok(()) => SaveOutcome::Reduced {
                records: fallback.len(),
            },
            Err(err) => {
                warn!(error = %err, "failed to save reduced history");
                SaveOutcome::Failed
            }
        }
    }

    async fn write(&self, records: &[MessageRecord]) -> Result<(), HistoryError> {
        let encoded = serde_json::to_vec(records)?;
        if encoded.len() > self.window.quota_bytes {
            return Err(HistoryError::QuotaExceeded {
                size: encoded.len(),
                quota: self.window.quota_bytes,
            });
        }
        tokio::fs::write(&self.path, encoded).await?;
        Ok(())
    }
}

pub fn trailing(records: &[MessageRecord], window: usize) -> &[MessageRecord] {
    &records[records.len().saturating_sub(window)..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Submission;

    fn records(count: usize, body: &str) -> Vec<MessageRecord> {
        (0..count)
            .map(|n| MessageRecord::stamp(Submission::text("alice", format!("{body}{n}"))))
            .collect()
    }

    #[test]
    fn trailing_keeps_the_newest() {
        let all = records(5, "m");
        assert_eq!(trailing(&all, 2), &all[3..]);
        assert_eq!(trailing(&all, 10), &all[..]);
        assert!(trailing(&all, 0).is_empty());
    }

    #[tokio::test]
    async fn saves_primary_window_and_loads_it_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.json"), HistoryWindow::default());
        let all = records(60, "m");

        assert_eq!(store.save(&all).await, SaveOutcome::Saved { records: 50 });
        assert_eq!(store.load().await, all[10..].to_vec());
    }

    #[tokio::test]
    async fn falls_back_to_smaller_window_over_quota() {
        let dir = tempfile::tempdir().expect("tempdir");
        let all = records(8, &"x".repeat(200));
        let one_record = serde_json::to_vec(&all[..1]).expect("encode").len();
        let window = HistoryWindow {
            primary: 8,
            fallback: 2,
            quota_bytes: one_record * 3,
        };
        let store = HistoryStore::new(dir.path().join("history.json"), window);

        assert_eq!(store.save(&all).await, SaveOutcome::Reduced { records: 2 });
        assert_eq!(store.load().await, all[6..].to_vec());
    }

    #[tokio::test]
    async fn failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::new(
            dir.path().join("missing-dir").join("history.json"),
            HistoryWindow::default(),
        );

        assert_eq!(store.save(&records(3, "m")).await, SaveOutcome::Failed);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        tokio::fs::write(&path, b"{not json").await.expect("write");

        let store = HistoryStore::new(path, HistoryWindow::default());
        assert!(store.load().await.is_empty());
    }
}
