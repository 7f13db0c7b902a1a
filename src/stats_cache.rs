//! Fingerprinted statistics cache.
//!
//! Each entry is a gzip-compressed, self-describing JSON document stored under its fingerprint.
//! Entries are written once and superseded, never modified. A lookup only returns an entry that
//! passes structural validation; anything unreadable is reported as corrupt and treated as a
//! miss so the caller recomputes and overwrites it.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::cache_root::{is_temporary, write_atomic, CacheRoot};
use crate::compression::{self, Compression};
use crate::error::{log_error, EnsembleError};
use crate::fingerprint::{Fingerprint, FORMAT_VERSION};
use crate::metrics;
use crate::models::{ReachId, RunMetadata, StatsResult};
use crate::statistics::QUANTILE_METHOD;
use crate::types::Timestamp;

const ENTRY_SUFFIX: &str = ".json.gz";

/// Temporary files older than this are assumed abandoned by a crashed writer.
const ABANDONED_TEMP_AGE: Duration = Duration::from_secs(3600);

/// A persisted statistics result and the metadata needed to validate it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CacheEntry {
    pub format_version: u32,
    pub quantile_method: String,
    pub fingerprint: Fingerprint,
    pub created_at: Timestamp,
    /// Number of members that contributed to the result
    pub member_count: usize,
    /// Configured quantiles, in configured order
    pub quantiles: Vec<f64>,
    pub metadata: RunMetadata,
    pub payload: StatsResult,
}

impl CacheEntry {
    /// Return a new CacheEntry for a freshly computed result.
    pub fn new(fingerprint: Fingerprint, metadata: RunMetadata, payload: StatsResult) -> Self {
        CacheEntry {
            format_version: FORMAT_VERSION,
            quantile_method: QUANTILE_METHOD.to_string(),
            fingerprint,
            created_at: Timestamp::now(),
            member_count: metadata.members.len(),
            quantiles: payload.quantiles.clone(),
            metadata,
            payload,
        }
    }

    /// Check that the entry is complete and matches what the caller expects.
    pub fn validate(&self, expected: &Expected<'_>) -> Result<(), String> {
        if self.format_version != FORMAT_VERSION {
            return Err(format!("format version {}", self.format_version));
        }
        if self.quantile_method != QUANTILE_METHOD {
            return Err(format!("quantile method {}", self.quantile_method));
        }
        if &self.fingerprint != expected.fingerprint {
            return Err(format!("entry is for fingerprint {}", self.fingerprint));
        }
        if self.quantiles != expected.quantiles || self.payload.quantiles != expected.quantiles {
            return Err("quantile set differs from the configured one".to_string());
        }
        if self.member_count != self.metadata.members.len() {
            return Err("member count disagrees with metadata".to_string());
        }
        if let Some(reaches) = expected.reaches {
            if !self.payload.reaches.keys().eq(reaches.iter()) {
                return Err("reach set differs from the requested one".to_string());
            }
        }
        let steps = self.payload.time_grid.len();
        for (reach, stats) in &self.payload.reaches {
            let complete = stats.present.len() == steps
                && stats.mean.len() == steps
                && stats.median.len() == steps
                && stats.std.len() == steps
                && stats.quantiles.len() == expected.quantiles.len()
                && stats.quantiles.iter().all(|column| column.len() == steps);
            if !complete {
                return Err(format!("statistics of reach {} are incomplete", reach));
            }
        }
        Ok(())
    }
}

/// What a lookup expects of an entry.
#[derive(Clone, Copy, Debug)]
pub struct Expected<'a> {
    pub fingerprint: &'a Fingerprint,
    pub quantiles: &'a [f64],
    /// Requested reaches, sorted, if a reach subset was configured
    pub reaches: Option<&'a [ReachId]>,
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum CacheLookup {
    Hit(Box<CacheEntry>),
    Miss,
    /// An entry exists but cannot be used.
    Corrupt(EnsembleError),
}

/// A cache entry on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryInfo {
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// Result of pruning the cache.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub removed: Vec<Fingerprint>,
    pub remaining: usize,
    pub remaining_bytes: u64,
}

/// Statistics cache within a cache root.
#[derive(Clone, Copy, Debug)]
pub struct StatsCache<'a> {
    root: &'a CacheRoot,
}

impl<'a> StatsCache<'a> {
    pub fn new(root: &'a CacheRoot) -> Self {
        StatsCache { root }
    }

    /// Path of the entry for a fingerprint.
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .stats_dir()
            .join(format!("{}{}", fingerprint, ENTRY_SUFFIX))
    }

    /// Look up the entry for a fingerprint.
    #[tracing::instrument(level = "DEBUG", skip_all, fields(fingerprint = %expected.fingerprint))]
    pub fn lookup(&self, expected: &Expected<'_>) -> CacheLookup {
        let path = self.entry_path(expected.fingerprint);
        let corrupt = |reason: String| EnsembleError::CacheCorruption {
            fingerprint: expected.fingerprint.to_string(),
            reason,
        };
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                metrics::record_cache_lookup("miss");
                event!(Level::DEBUG, "Cache miss");
                return CacheLookup::Miss;
            }
            Err(err) => return self.corrupt(corrupt(err.to_string())),
        };
        let entry = compression::decompress(Compression::Gzip, &data)
            .map_err(|err| corrupt(err.to_string()))
            .and_then(|json| {
                serde_json::from_slice::<CacheEntry>(&json).map_err(|err| corrupt(err.to_string()))
            })
            .and_then(|entry| entry.validate(expected).map(|_| entry).map_err(corrupt));
        match entry {
            Ok(entry) => {
                metrics::record_cache_lookup("hit");
                event!(Level::INFO, "Cache hit for {}", expected.fingerprint);
                CacheLookup::Hit(Box::new(entry))
            }
            Err(err) => self.corrupt(err),
        }
    }

    fn corrupt(&self, err: EnsembleError) -> CacheLookup {
        metrics::record_cache_lookup("corrupt");
        log_error(&err, true);
        CacheLookup::Corrupt(err)
    }

    /// Persist an entry under its fingerprint, replacing any previous entry atomically.
    #[tracing::instrument(level = "DEBUG", skip_all, fields(fingerprint = %entry.fingerprint))]
    pub fn store(&self, entry: &CacheEntry) -> Result<PathBuf, EnsembleError> {
        let path = self.entry_path(&entry.fingerprint);
        let result = serde_json::to_vec(entry)
            .map_err(std::io::Error::from)
            .and_then(|json| compression::compress(Compression::Gzip, &json))
            .and_then(|data| write_atomic(&path, &data));
        metrics::record_cache_write(result.is_ok());
        match result {
            Ok(()) => {
                event!(Level::INFO, "Stored cache entry {}", path.display());
                Ok(path)
            }
            Err(source) => Err(EnsembleError::CacheWrite {
                fingerprint: entry.fingerprint.to_string(),
                source,
            }),
        }
    }

    /// Remove the entry for a fingerprint. Returns whether an entry existed.
    pub fn evict(&self, fingerprint: &Fingerprint) -> Result<bool, EnsembleError> {
        let path = self.entry_path(fingerprint);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(EnsembleError::CacheIo { path, source }),
        }
    }

    /// List the entries on disk, oldest first.
    pub fn entries(&self) -> Result<Vec<EntryInfo>, EnsembleError> {
        let dir = self.root.stats_dir();
        let io_error = |source| EnsembleError::CacheIo {
            path: dir.clone(),
            source,
        };
        let mut entries = Vec::new();
        for dir_entry in std::fs::read_dir(&dir).map_err(io_error)? {
            let dir_entry = dir_entry.map_err(io_error)?;
            let path = dir_entry.path();
            let Some(fingerprint) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(ENTRY_SUFFIX))
                .filter(|name| !name.starts_with('.'))
                .map(|name| Fingerprint::from(name.to_string()))
            else {
                continue;
            };
            // Entries may disappear under a concurrent prune.
            let Ok(metadata) = dir_entry.metadata() else {
                continue;
            };
            entries.push(EntryInfo {
                fingerprint,
                path,
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        entries.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        Ok(entries)
    }

    /// Remove entries older than `max_age`, then the oldest entries until the remainder fits
    /// within `size_limit` bytes. Abandoned temporary files are removed too.
    pub fn prune(
        &self,
        max_age: Option<Duration>,
        size_limit: Option<u64>,
        now: SystemTime,
    ) -> Result<PruneReport, EnsembleError> {
        self.remove_abandoned_temporaries(now)?;
        let age = |entry: &EntryInfo| now.duration_since(entry.modified).unwrap_or_default();
        let (expired, mut kept): (Vec<EntryInfo>, Vec<EntryInfo>) = self
            .entries()?
            .into_iter()
            .partition(|entry| max_age.is_some_and(|max_age| age(entry) > max_age));
        let mut removed = expired;
        if let Some(size_limit) = size_limit {
            let mut total: u64 = kept.iter().map(|entry| entry.size).sum();
            let mut excess = 0;
            while total > size_limit && excess < kept.len() {
                total -= kept[excess].size;
                excess += 1;
            }
            removed.extend(kept.drain(..excess));
        }
        let mut report = PruneReport::default();
        for entry in removed {
            if self.evict(&entry.fingerprint)? {
                report.removed.push(entry.fingerprint);
            }
        }
        report.remaining = kept.len();
        report.remaining_bytes = kept.iter().map(|entry| entry.size).sum();
        event!(
            Level::INFO,
            "Pruned {} cache entries, {} remain ({} bytes)",
            report.removed.len(),
            report.remaining,
            report.remaining_bytes
        );
        Ok(report)
    }

    fn remove_abandoned_temporaries(&self, now: SystemTime) -> Result<(), EnsembleError> {
        let dir = self.root.stats_dir();
        let entries = std::fs::read_dir(&dir).map_err(|source| EnsembleError::CacheIo {
            path: dir.clone(),
            source,
        })?;
        for path in entries.flatten().map(|entry| entry.path()) {
            let abandoned = is_temporary(&path)
                && std::fs::metadata(&path)
                    .and_then(|metadata| metadata.modified())
                    .is_ok_and(|modified| {
                        now.duration_since(modified).unwrap_or_default() > ABANDONED_TEMP_AGE
                    });
            if abandoned {
                // Another process may have removed it already.
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }
}
