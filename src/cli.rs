//! Command Line Interface (CLI) arguments.

use std::path::PathBuf;

use byte_unit::Byte;
use clap::Parser;
use url::Url;

use crate::config::{expand_path, EvalConfig, InputSelection, Metric, DEFAULT_PATTERN};
use crate::error::EnsembleError;
use crate::fingerprint::SignatureMode;
use crate::models::{GageId, MemberIndex, ReachId, TimeWindow};
use crate::types::{Missing, Timestamp};

/// Ensemble streamflow statistics with result caching and observation validation
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct CommandLineArgs {
    /// JSON configuration file. When given, the options below are ignored.
    #[arg(long, env = "ENSEMBLIST_CONFIG")]
    pub config: Option<PathBuf>,
    /// Directory containing the ensemble member files
    #[arg(long, default_value = ".", env = "ENSEMBLIST_INPUT_DIR")]
    pub input_dir: String,
    /// Wildcard pattern selecting member files within the input directory
    #[arg(long, default_value = DEFAULT_PATTERN, env = "ENSEMBLIST_PATTERN")]
    pub pattern: String,
    /// Explicit member files, used instead of the input directory
    #[arg(long, num_args = 1.., conflicts_with = "pattern")]
    pub files: Vec<String>,
    /// Quantile probabilities
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "0.05,0.95",
        env = "ENSEMBLIST_QUANTILES"
    )]
    pub quantiles: Vec<f64>,
    /// Ordinal indices of the members to use
    #[arg(long, value_delimiter = ',')]
    pub members: Option<Vec<MemberIndex>>,
    /// Reaches to summarise
    #[arg(long, value_delimiter = ',')]
    pub reaches: Option<Vec<String>>,
    /// First time step to include (RFC 3339)
    #[arg(long, value_parser = Timestamp::parse_rfc3339)]
    pub start: Option<Timestamp>,
    /// Last time step to include (RFC 3339)
    #[arg(long, value_parser = Timestamp::parse_rfc3339)]
    pub end: Option<Timestamp>,
    /// Values marking missing data in files that do not declare any
    #[arg(
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        conflicts_with_all = ["valid_min", "valid_max"]
    )]
    pub missing_value: Option<Vec<f64>>,
    /// Values below this are missing data
    #[arg(long)]
    pub valid_min: Option<f64>,
    /// Values above this are missing data
    #[arg(long)]
    pub valid_max: Option<f64>,
    /// Number of reaches summarised per batch
    #[arg(long, env = "ENSEMBLIST_BATCH_SIZE")]
    pub batch_size: Option<usize>,
    /// Memory budget for a batch, e.g. 512MiB
    #[arg(long, value_parser = parse_bytes, env = "ENSEMBLIST_MEMORY_LIMIT")]
    pub memory_limit: Option<u64>,
    /// Whether to use Rayon for execution of CPU-bound tasks.
    #[arg(long, default_value_t = false, env = "ENSEMBLIST_USE_RAYON")]
    pub use_rayon: bool,
    /// Identify input files by content hash rather than size and modification time
    #[arg(long, default_value_t = false, env = "ENSEMBLIST_CONTENT_SIGNATURE")]
    pub content_signature: bool,
    /// Root directory of the result cache
    #[arg(long, default_value = ".ensemblist-cache", env = "ENSEMBLIST_CACHE_DIR")]
    pub cache_dir: String,
    /// Disable the result cache
    #[arg(long, default_value_t = false, env = "ENSEMBLIST_NO_CACHE")]
    pub no_cache: bool,
    /// Maximum age of cache entries in seconds
    #[arg(long, env = "ENSEMBLIST_CACHE_MAX_AGE")]
    pub cache_max_age: Option<u64>,
    /// Total size of the cache, e.g. 10GB, above which the oldest entries are pruned
    #[arg(long, value_parser = parse_bytes, env = "ENSEMBLIST_CACHE_SIZE_LIMIT")]
    pub cache_size_limit: Option<u64>,
    /// Gage observing a reach, as REACH=GAGE
    #[arg(long = "gage", value_parser = parse_gage)]
    pub gages: Vec<(ReachId, GageId)>,
    /// Observation service endpoint
    #[arg(long, env = "ENSEMBLIST_OBSERVATION_URL")]
    pub observation_url: Option<Url>,
    /// Seconds for which fetched observations are reused
    #[arg(long, default_value_t = 21_600, env = "ENSEMBLIST_OBSERVATION_TTL")]
    pub observation_ttl: u64,
    /// Deadline for one observation request in milliseconds
    #[arg(long, default_value_t = 30_000, env = "ENSEMBLIST_OBSERVATION_TIMEOUT_MS")]
    pub observation_timeout_ms: u64,
    /// Maximum number of attempts per gage
    #[arg(long, default_value_t = 3, env = "ENSEMBLIST_OBSERVATION_ATTEMPTS")]
    pub observation_attempts: u32,
    /// Keep observed discharge in cubic feet per second
    #[arg(long, default_value_t = false)]
    pub no_cms: bool,
    /// Validation metrics
    #[arg(long, value_delimiter = ',', default_value = "kge,nse,rmse")]
    pub metrics: Vec<String>,
    /// Prune the cache and exit
    #[arg(long, default_value_t = false)]
    pub prune: bool,
    /// Print the effective configuration as JSON and exit
    #[arg(long, default_value_t = false)]
    pub print_config: bool,
    /// Print Prometheus metrics after the run
    #[arg(long, default_value_t = false)]
    pub print_metrics: bool,
}

impl CommandLineArgs {
    /// Build the evaluation configuration, reading the configuration file if one was given.
    pub fn to_config(&self) -> Result<EvalConfig, EnsembleError> {
        if let Some(path) = &self.config {
            return EvalConfig::from_json_file(&expand_path(path));
        }
        let inputs = if self.files.is_empty() {
            InputSelection::Pattern {
                dir: expand_path(self.input_dir.as_ref()),
                pattern: self.pattern.clone(),
            }
        } else {
            InputSelection::Files(
                self.files
                    .iter()
                    .map(|file| expand_path(file.as_ref()))
                    .collect(),
            )
        };
        let mut config = EvalConfig::new(inputs);

        let stats = &mut config.stats;
        stats.quantiles = self.quantiles.clone();
        stats.members = self.members.clone();
        stats.reaches = self
            .reaches
            .as_ref()
            .map(|reaches| reaches.iter().map(|r| ReachId::from(r.as_str())).collect());
        stats.time_window = TimeWindow::new(self.start, self.end);
        stats.missing = self.missing();
        stats.batch_size = self.batch_size;
        stats.memory_limit = self.memory_limit.map(usize::try_from).transpose()?;
        stats.use_rayon = self.use_rayon;
        if self.content_signature {
            stats.signature = SignatureMode::Content;
        }

        let cache = &mut config.cache;
        cache.enabled = !self.no_cache;
        cache.root = expand_path(self.cache_dir.as_ref());
        cache.max_age_seconds = self.cache_max_age;
        cache.size_limit = self.cache_size_limit;

        let observations = &mut config.observations;
        observations.gages = self.gages.iter().cloned().collect();
        observations.service_url = self.observation_url.clone();
        observations.ttl_seconds = self.observation_ttl;
        observations.timeout_ms = self.observation_timeout_ms;
        observations.max_attempts = self.observation_attempts;
        observations.to_cms = !self.no_cms;
        observations.metrics = self
            .metrics
            .iter()
            .map(|metric| serde_json::from_value::<Metric>(metric.as_str().into()))
            .collect::<Result<_, _>>()?;

        validator::Validate::validate(&config)?;
        Ok(config)
    }

    fn missing(&self) -> Option<Missing> {
        match (&self.missing_value, self.valid_min, self.valid_max) {
            (Some(values), _, _) if values.len() == 1 => Some(Missing::MissingValue(values[0])),
            (Some(values), _, _) => Some(Missing::MissingValues(values.clone())),
            (None, Some(min), Some(max)) => Some(Missing::ValidRange(min, max)),
            (None, Some(min), None) => Some(Missing::ValidMin(min)),
            (None, None, Some(max)) => Some(Missing::ValidMax(max)),
            (None, None, None) => None,
        }
    }
}

/// Parse a human readable size such as `512MiB`.
fn parse_bytes(text: &str) -> Result<u64, String> {
    Byte::parse_str(text, /* ignore case */ true)
        .map(|bytes| bytes.as_u64())
        .map_err(|err| err.to_string())
}

/// Parse a `REACH=GAGE` mapping.
fn parse_gage(text: &str) -> Result<(ReachId, GageId), String> {
    match text.split_once('=') {
        Some((reach, gage)) if !reach.is_empty() && !gage.is_empty() => {
            Ok((ReachId::from(reach), GageId::from(gage)))
        }
        _ => Err(format!("expected REACH=GAGE, got '{}'", text)),
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CommandLineArgs {
        let mut argv = vec!["ensemblist", "--input-dir", "/data/run"];
        argv.extend_from_slice(extra);
        CommandLineArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let config = args(&[]).to_config().unwrap();
        assert_eq!(
            InputSelection::Pattern {
                dir: PathBuf::from("/data/run"),
                pattern: DEFAULT_PATTERN.to_string()
            },
            config.inputs
        );
        assert_eq!(vec![0.05, 0.95], config.stats.quantiles);
        assert!(config.cache.enabled);
        assert_eq!(None, config.stats.missing);
        assert_eq!(3, config.observations.metrics.len());
    }

    #[test]
    fn all_options() {
        let config = args(&[
            "--quantiles",
            "0.1,0.5,0.9",
            "--members",
            "2,0",
            "--reaches",
            "R1,R2",
            "--start",
            "2023-01-01T00:00:00Z",
            "--valid-min",
            "0",
            "--memory-limit",
            "1KiB",
            "--cache-size-limit",
            "1MB",
            "--no-cache",
            "--gage",
            "R1=05568500",
            "--metrics",
            "nse",
            "--content-signature",
        ])
        .to_config()
        .unwrap();
        assert_eq!(vec![0.1, 0.5, 0.9], config.stats.quantiles);
        assert_eq!(Some(vec![2, 0]), config.stats.members);
        assert_eq!(
            Some(Timestamp::parse_rfc3339("2023-01-01T00:00:00Z").unwrap()),
            config.stats.time_window.start
        );
        assert_eq!(Some(Missing::ValidMin(0.0)), config.stats.missing);
        assert_eq!(Some(1024), config.stats.memory_limit);
        assert_eq!(Some(1_000_000), config.cache.size_limit);
        assert!(!config.cache.enabled);
        assert_eq!(SignatureMode::Content, config.stats.signature);
        assert_eq!(
            Some(&GageId::from("05568500")),
            config.observations.gages.get(&ReachId::from("R1"))
        );
        assert_eq!(vec![Metric::Nse], config.observations.metrics);
    }

    #[test]
    fn explicit_files() {
        let config = CommandLineArgs::try_parse_from(["ensemblist", "--files", "a.json", "b.json"])
            .unwrap()
            .to_config()
            .unwrap();
        assert_eq!(
            InputSelection::Files(vec![PathBuf::from("a.json"), PathBuf::from("b.json")]),
            config.inputs
        );
    }

    #[test]
    fn invalid_quantiles_rejected() {
        let err = args(&["--quantiles", "0.5,1.5"]).to_config().unwrap_err();
        assert!(matches!(err, EnsembleError::ConfigValidation(_)));
    }

    #[test]
    fn invalid_arguments() {
        assert!(CommandLineArgs::try_parse_from(["ensemblist", "--gage", "R1"]).is_err());
        assert!(CommandLineArgs::try_parse_from(["ensemblist", "--memory-limit", "lots"]).is_err());
        assert!(CommandLineArgs::try_parse_from(["ensemblist", "--start", "yesterday"]).is_err());
    }

    #[test]
    fn missing_values() {
        let config = args(&["--missing-value", "-9999,-8888"]).to_config().unwrap();
        assert_eq!(
            Some(Missing::MissingValues(vec![-9999.0, -8888.0])),
            config.stats.missing
        );
        let config = args(&["--valid-min", "0", "--valid-max", "1e6"])
            .to_config()
            .unwrap();
        assert_eq!(Some(Missing::ValidRange(0.0, 1e6)), config.stats.missing);
    }
}
