//! Evaluation configuration.
//!
//! [EvalConfig] is the closed set of options consumed by the pipeline. It is built either from
//! command line arguments or from a JSON document, and is validated before use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use url::Url;
use validator::{Validate, ValidationError};

use crate::error::EnsembleError;
use crate::fingerprint::SignatureMode;
use crate::models::{GageId, MemberIndex, ReachId, TimeWindow};
use crate::types::Missing;

/// Default quantiles, matching the usual 90% uncertainty band.
pub const DEFAULT_QUANTILES: [f64; 2] = [0.05, 0.95];

/// Default member file name pattern.
pub const DEFAULT_PATTERN: &str = "member_*.json*";

/// Which files make up the ensemble.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSelection {
    /// An explicit list of member files.
    Files(Vec<PathBuf>),
    /// Files in `dir` whose names match a wildcard `pattern` (`*` and `?`).
    Pattern { dir: PathBuf, pattern: String },
}

impl InputSelection {
    /// Return a pattern selection using the default member file pattern.
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        InputSelection::Pattern {
            dir: dir.into(),
            pattern: DEFAULT_PATTERN.to_string(),
        }
    }
}

impl std::fmt::Display for InputSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputSelection::Files(files) => write!(f, "{} listed files", files.len()),
            InputSelection::Pattern { dir, pattern } => {
                write!(f, "{}", dir.join(pattern).display())
            }
        }
    }
}

/// Options that determine the statistics.
///
/// Everything here except `batch_size`, `memory_limit` and `use_rayon` affects the result and
/// therefore the fingerprint.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(default, deny_unknown_fields)]
#[validate(schema(function = "validate_stats_config"))]
pub struct StatsConfig {
    /// Quantile probabilities, each strictly between 0 and 1
    #[validate(custom = "validate_quantiles")]
    pub quantiles: Vec<f64>,
    /// Ordinal indices of the members to use; all members if unset
    pub members: Option<Vec<MemberIndex>>,
    /// Reaches to summarise; every reach found if unset
    pub reaches: Option<Vec<ReachId>>,
    /// Inclusive time window applied to the canonical grid
    pub time_window: TimeWindow,
    /// Missing data descriptor for member files that do not declare one
    pub missing: Option<Missing>,
    /// Number of reaches per batch
    #[validate(range(min = 1, message = "batch size must be greater than 0"))]
    pub batch_size: Option<usize>,
    /// Memory budget in bytes used to derive the batch size
    #[validate(range(min = 1, message = "memory limit must be greater than 0"))]
    pub memory_limit: Option<usize>,
    /// Whether to use Rayon for the statistics
    pub use_rayon: bool,
    /// How input files are identified in the fingerprint
    pub signature: SignatureMode,
}

impl Default for StatsConfig {
    fn default() -> Self {
        StatsConfig {
            quantiles: DEFAULT_QUANTILES.to_vec(),
            members: None,
            reaches: None,
            time_window: TimeWindow::default(),
            missing: None,
            batch_size: None,
            memory_limit: None,
            use_rayon: false,
            signature: SignatureMode::default(),
        }
    }
}

impl StatsConfig {
    /// Member subset in canonical form: sorted, without duplicates.
    pub fn member_subset(&self) -> Option<Vec<MemberIndex>> {
        self.members.as_ref().map(|members| {
            let mut members = members.clone();
            members.sort_unstable();
            members.dedup();
            members
        })
    }

    /// Reach subset in canonical form: sorted, without duplicates.
    pub fn reach_subset(&self) -> Option<Vec<ReachId>> {
        self.reaches.as_ref().map(|reaches| {
            let mut reaches = reaches.clone();
            reaches.sort();
            reaches.dedup();
            reaches
        })
    }
}

/// Validate a quantile list
fn validate_quantiles(quantiles: &[f64]) -> Result<(), ValidationError> {
    if let Some(q) = quantiles.iter().find(|q| !(**q > 0.0 && **q < 1.0)) {
        let mut error = ValidationError::new("quantiles must lie strictly between 0 and 1");
        error.add_param("quantile".into(), q);
        return Err(error);
    }
    for (i, q) in quantiles.iter().enumerate() {
        if quantiles[..i].contains(q) {
            let mut error = ValidationError::new("quantiles must not be repeated");
            error.add_param("quantile".into(), q);
            return Err(error);
        }
    }
    Ok(())
}

/// Validate the statistics options as a whole
fn validate_stats_config(config: &StatsConfig) -> Result<(), ValidationError> {
    if let Some(missing) = &config.missing {
        missing.validate()?;
    }
    if let (Some(start), Some(end)) = (config.time_window.start, config.time_window.end) {
        if start > end {
            let mut error = ValidationError::new("time window start must not be after its end");
            error.add_param("start".into(), &start.seconds());
            error.add_param("end".into(), &end.seconds());
            return Err(error);
        }
    }
    Ok(())
}

/// Options for the statistics cache.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Whether results are cached at all
    pub enabled: bool,
    /// Root directory of the cache
    pub root: PathBuf,
    /// Entries older than this many seconds are pruned
    pub max_age_seconds: Option<u64>,
    /// Total size of cached statistics in bytes above which the oldest entries are pruned
    pub size_limit: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            root: PathBuf::from(".ensemblist-cache"),
            max_age_seconds: None,
            size_limit: None,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_seconds.map(Duration::from_secs)
    }
}

/// Validation metric
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Metric {
    /// Kling-Gupta efficiency
    Kge,
    /// Nash-Sutcliffe efficiency
    Nse,
    /// Root mean square error
    Rmse,
}

/// Options for observation retrieval and validation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(default, deny_unknown_fields)]
#[validate(schema(function = "validate_observation_config"))]
pub struct ObservationConfig {
    /// Gage observing each reach
    pub gages: BTreeMap<ReachId, GageId>,
    /// Observation service endpoint; the USGS instantaneous values service if unset
    pub service_url: Option<Url>,
    /// Seconds for which a fetched series is served from cache
    pub ttl_seconds: u64,
    /// Deadline for a single fetch attempt, in milliseconds
    #[validate(range(min = 1, message = "timeout must be greater than 0"))]
    pub timeout_ms: u64,
    /// Maximum number of fetch attempts per gage
    #[validate(range(min = 1, message = "at least one attempt is required"))]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds; doubled on each retry
    pub initial_backoff_ms: u64,
    /// Upper bound on the retry delay, in milliseconds
    pub max_backoff_ms: u64,
    /// Number of gages fetched concurrently
    #[validate(range(min = 1, message = "at least one connection is required"))]
    pub max_connections: usize,
    /// Margin added to both ends of the model time span when requesting observations, in seconds
    #[validate(range(min = 0, message = "padding must not be negative"))]
    pub padding_seconds: i64,
    /// Convert discharge from cubic feet to cubic metres per second
    pub to_cms: bool,
    /// Metrics computed against the ensemble mean
    pub metrics: Vec<Metric>,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        ObservationConfig {
            gages: BTreeMap::new(),
            service_url: None,
            ttl_seconds: 6 * 3600,
            timeout_ms: 30_000,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            max_connections: 4,
            padding_seconds: 86_400,
            to_cms: true,
            metrics: vec![Metric::Kge, Metric::Nse, Metric::Rmse],
        }
    }
}

impl ObservationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Validate the observation options as a whole
fn validate_observation_config(config: &ObservationConfig) -> Result<(), ValidationError> {
    if config.initial_backoff_ms > config.max_backoff_ms {
        let mut error = ValidationError::new("initial backoff must not exceed the maximum backoff");
        error.add_param("initial_backoff_ms".into(), &config.initial_backoff_ms);
        error.add_param("max_backoff_ms".into(), &config.max_backoff_ms);
        return Err(error);
    }
    Ok(())
}

/// Complete configuration of an evaluation run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EvalConfig {
    /// Ensemble member files
    pub inputs: InputSelection,
    #[serde(default)]
    #[validate]
    pub stats: StatsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    #[validate]
    pub observations: ObservationConfig,
}

impl EvalConfig {
    /// Return a new EvalConfig with default options.
    pub fn new(inputs: InputSelection) -> Self {
        EvalConfig {
            inputs,
            stats: StatsConfig::default(),
            cache: CacheConfig::default(),
            observations: ObservationConfig::default(),
        }
    }

    /// Read and validate a JSON configuration file.
    ///
    /// A leading `~` in the cache root and input paths is expanded.
    pub fn from_json_file(path: &Path) -> Result<Self, EnsembleError> {
        let data = std::fs::read(path).map_err(|source| EnsembleError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: EvalConfig = serde_json::from_slice(&data)?;
        config.cache.root = expand_path(&config.cache.root);
        config.inputs = match config.inputs {
            InputSelection::Files(files) => {
                InputSelection::Files(files.iter().map(|file| expand_path(file)).collect())
            }
            InputSelection::Pattern { dir, pattern } => InputSelection::Pattern {
                dir: expand_path(&dir),
                pattern,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

/// Expand a leading `~` in a path, leaving it unchanged if expansion fails.
pub fn expand_path(path: &Path) -> PathBuf {
    path.to_str()
        .and_then(|text| expanduser::expanduser(text).ok())
        .unwrap_or_else(|| path.to_path_buf())
}
