//! Per-gage observation cache.
//!
//! One JSON record per gage under `<root>/observations/`, named by the MD5 of the gage id so
//! arbitrary ids map onto safe file names.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::cache_root::{write_atomic, CacheRoot};
use crate::error::EnsembleError;
use crate::models::GageId;
use crate::observations::{ObservationSeries, ObservationWindow};
use crate::types::Timestamp;

/// A cached observation series with the facts that govern its reuse.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ObservationRecord {
    pub source_id: GageId,
    pub fetched_at: Timestamp,
    pub ttl_seconds: u64,
    /// Window requested when the series was fetched
    pub window: ObservationWindow,
    pub times: Vec<Timestamp>,
    pub values: Vec<f64>,
}

impl ObservationRecord {
    pub fn new(
        series: ObservationSeries,
        window: ObservationWindow,
        fetched_at: Timestamp,
        ttl_seconds: u64,
    ) -> Self {
        ObservationRecord {
            source_id: series.gage,
            fetched_at,
            ttl_seconds,
            window,
            times: series.times,
            values: series.values,
        }
    }

    /// Whether the record may be served at `now` for `window` without refetching.
    pub fn is_fresh(&self, now: Timestamp, window: &ObservationWindow) -> bool {
        let age = now.seconds().saturating_sub(self.fetched_at.seconds());
        let ttl = i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX);
        age < ttl && self.window.covers(window)
    }

    pub fn series(&self) -> ObservationSeries {
        ObservationSeries {
            gage: self.source_id.clone(),
            times: self.times.clone(),
            values: self.values.clone(),
        }
    }
}

/// Observation records of a cache root.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationCache {
    dir: PathBuf,
}

impl ObservationCache {
    pub fn new(root: &CacheRoot) -> Self {
        ObservationCache {
            dir: root.observations_dir(),
        }
    }

    /// Path of the record for a gage.
    pub fn record_path(&self, gage: &GageId) -> PathBuf {
        self.dir
            .join(format!("{:x}.json", md5::compute(gage.as_str().as_bytes())))
    }

    /// Load the record of a gage, if a usable one exists.
    ///
    /// An unreadable record is logged and ignored; the next successful fetch replaces it.
    pub fn load(&self, gage: &GageId) -> Option<ObservationRecord> {
        let path = self.record_path(gage);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                event!(Level::WARN, "Cannot read {}: {}", path.display(), err);
                return None;
            }
        };
        let record = match serde_json::from_slice::<ObservationRecord>(&data) {
            Ok(record) => record,
            Err(err) => {
                event!(
                    Level::WARN,
                    "Ignoring corrupt observation record {}: {}",
                    path.display(),
                    err
                );
                return None;
            }
        };
        if &record.source_id != gage || record.times.len() != record.values.len() {
            event!(
                Level::WARN,
                "Ignoring observation record {} that does not match gage {}",
                path.display(),
                gage
            );
            return None;
        }
        Some(record)
    }

    /// Persist a record, replacing any previous record of the gage.
    pub fn store(&self, record: &ObservationRecord) -> Result<PathBuf, EnsembleError> {
        let path = self.record_path(&record.source_id);
        let data = serde_json::to_vec(record)?;
        write_atomic(&path, &data).map_err(|source| EnsembleError::CacheIo {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
