//! Durable opportunity store + HTTP fetch utilities for govbiz.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use govbiz_core::{DocumentRef, OpportunityRecord};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

mod http;

pub use http::{
    classify_reqwest_error, classify_status, retry_with_backoff, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition, SimpleTokenBucket,
    TokenBucketConfig,
};

pub const CRATE_NAME: &str = "govbiz-storage";

pub const STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store file {path} is not a valid opportunity store: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store file {path} has unsupported schema version {found}")]
    UnsupportedSchema { path: PathBuf, found: u32 },
    #[error("serializing store: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub first_collected_at: DateTime<Utc>,
    pub record: OpportunityRecord,
}

#[derive(Debug, Deserialize)]
struct StoreFile {
    schema_version: u32,
    entries: Vec<StoredEntry>,
}

#[derive(Serialize)]
struct StoreSnapshot<'a> {
    schema_version: u32,
    entries: Vec<&'a StoredEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    pub total: usize,
    pub category_breakdown: BTreeMap<String, usize>,
    pub earliest_collected: Option<DateTime<Utc>>,
    pub latest_collected: Option<DateTime<Utc>>,
}

/// Single-writer, insertion-ordered opportunity store backed by one JSON file.
///
/// Every mutation writes a snapshot that already contains the change (temp
/// file, fsync, rename) and only then applies it in memory. A failed or
/// cancelled flush leaves memory untouched, so memory never runs ahead of disk.
#[derive(Debug)]
pub struct OpportunityStore {
    path: PathBuf,
    entries: IndexMap<String, StoredEntry>,
}

impl OpportunityStore {
    /// Loads the store at `path`; a missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "store file absent; starting empty");
                return Ok(Self {
                    path,
                    entries: IndexMap::new(),
                });
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let file: StoreFile = serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        if file.schema_version != STORE_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                path,
                found: file.schema_version,
            });
        }

        let mut entries = IndexMap::with_capacity(file.entries.len());
        for entry in file.entries {
            entries
                .entry(entry.record.notice_id.clone())
                .or_insert(entry);
        }
        info!(path = %path.display(), records = entries.len(), "opened opportunity store");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, notice_id: &str) -> bool {
        self.entries.contains_key(notice_id)
    }

    pub fn get(&self, notice_id: &str) -> Option<&OpportunityRecord> {
        self.entries.get(notice_id).map(|e| &e.record)
    }

    pub fn first_collected_at(&self, notice_id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(notice_id).map(|e| e.first_collected_at)
    }

    /// Persists `record` if its identifier is new. Returns `false` without
    /// touching anything when the identifier is already stored.
    pub async fn insert_if_absent(&mut self, record: OpportunityRecord) -> Result<bool, StoreError> {
        self.insert_if_absent_at(record, Utc::now()).await
    }

    pub async fn insert_if_absent_at(
        &mut self,
        record: OpportunityRecord,
        collected_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if self.entries.contains_key(&record.notice_id) {
            return Ok(false);
        }

        let entry = StoredEntry {
            first_collected_at: collected_at,
            record,
        };
        self.write_snapshot(self.entries.values().chain(std::iter::once(&entry)))
            .await?;
        self.entries.insert(entry.record.notice_id.clone(), entry);
        Ok(true)
    }

    /// Fills the recovered description and/or documents when they are absent.
    ///
    /// Returns `false` when the identifier is unknown or nothing was absent,
    /// which makes repeated enrichment with the same data a no-op.
    pub async fn enrich(
        &mut self,
        notice_id: &str,
        description: Option<&str>,
        documents: Option<&[DocumentRef]>,
    ) -> Result<bool, StoreError> {
        let Some(current) = self.entries.get(notice_id) else {
            return Ok(false);
        };
        let mut updated = current.clone();
        let record = &mut updated.record;

        let mut changed = false;
        if let Some(text) = description.map(str::trim).filter(|t| !t.is_empty()) {
            if record.description.inline_text().is_none() && record.recovered_description.is_none() {
                record.recovered_description = Some(text.to_string());
                changed = true;
            }
        }
        if let Some(docs) = documents.filter(|d| !d.is_empty()) {
            if record.documents.as_ref().map_or(true, |d| d.is_empty()) {
                record.documents = Some(docs.to_vec());
                changed = true;
            }
        }

        if !changed {
            return Ok(false);
        }

        let snapshot = self.entries.values().map(|entry| {
            if entry.record.notice_id == notice_id {
                &updated
            } else {
                entry
            }
        });
        self.write_snapshot(snapshot).await?;
        self.entries.insert(notice_id.to_string(), updated);
        Ok(true)
    }

    pub fn all(&self) -> impl Iterator<Item = &OpportunityRecord> + Clone + '_ {
        self.entries.values().map(|e| &e.record)
    }

    pub fn entries(&self) -> impl Iterator<Item = &StoredEntry> + Clone + '_ {
        self.entries.values()
    }

    /// Records whose posted timestamp lies in `[from, to]`.
    pub fn by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = &OpportunityRecord> + Clone + '_ {
        self.all()
            .filter(move |r| r.posted_at.is_some_and(|p| from <= p && p <= to))
    }

    /// Records first collected within `[from, to]`.
    pub fn by_collected_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = &OpportunityRecord> + Clone + '_ {
        self.entries
            .values()
            .filter(move |e| from <= e.first_collected_at && e.first_collected_at <= to)
            .map(|e| &e.record)
    }

    pub fn by_category<'a>(
        &'a self,
        code: &'a str,
    ) -> impl Iterator<Item = &'a OpportunityRecord> + Clone + 'a {
        self.all().filter(move |r| r.matches_category(code))
    }

    pub fn summary(&self) -> StoreSummary {
        let mut category_breakdown: BTreeMap<String, usize> = BTreeMap::new();
        for record in self.all() {
            for code in &record.category_codes {
                *category_breakdown.entry(code.clone()).or_default() += 1;
            }
        }
        let collected = self.entries.values().map(|e| e.first_collected_at);
        StoreSummary {
            total: self.entries.len(),
            category_breakdown,
            earliest_collected: collected.clone().min(),
            latest_collected: collected.max(),
        }
    }

    /// Writes `entries` as the complete store file.
    async fn write_snapshot<'a>(
        &self,
        entries: impl Iterator<Item = &'a StoredEntry>,
    ) -> Result<(), StoreError> {
        let snapshot = StoreSnapshot {
            schema_version: STORE_SCHEMA_VERSION,
            entries: entries.collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomically(&self.path, &bytes).await
    }
}

/// Temp file in the target directory, fsync, then rename over the target.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source: std::io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(io_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let write_result: std::io::Result<()> = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(source) = write_result {
        if let Err(cleanup) = fs::remove_file(&temp_path).await {
            debug!(temp = %temp_path.display(), error = %cleanup, "temp store file left behind");
        }
        return Err(io_err(source));
    }
    Ok(())
}
