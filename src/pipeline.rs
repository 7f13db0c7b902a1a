//! Evaluation pipeline.
//!
//! A run resolves the inputs, derives the fingerprint and serves the statistics from the cache
//! when a valid entry exists. Otherwise the ensemble is scanned and summarised off the async
//! runtime and the result is persisted. Observations are fetched per gage concurrently and
//! scored against the ensemble mean. Cache problems never fail a run; they are logged and the
//! run continues uncached.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use strum_macros::Display;
use tokio::task::JoinSet;
use tracing::{event, Level};
use validator::Validate;

use crate::cache_root::CacheRoot;
use crate::config::EvalConfig;
use crate::engine::{LogProgress, ProgressSink, StatsEngine};
use crate::error::{log_error, EnsembleError};
use crate::fingerprint::{fingerprint_identities, identify, FileIdentity, Fingerprint};
use crate::loader::{enumerate_inputs, scan, LoaderOptions};
use crate::models::{GageId, ReachId, ReachStats, RunMetadata, SkippedMember, StatsResult};
use crate::observation_cache::ObservationCache;
use crate::observations::{ObservationFetcher, ObservationSource, ObservedSeries, SeriesStatus};
use crate::resource_manager::ResourceManager;
use crate::stats_cache::{CacheEntry, CacheLookup, Expected, StatsCache};
use crate::types::Timestamp;
use crate::usgs::UsgsSource;
use crate::validation::{score, ReachValidation};

/// Where the statistics of an evaluation came from.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResultSource {
    Cache,
    Computed,
}

/// Outcome of a pipeline run.
///
/// Consumers get read-only access to statistics by reach and observations by gage.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    fingerprint: Fingerprint,
    source: ResultSource,
    stats: StatsResult,
    metadata: RunMetadata,
    cache_write_error: Option<String>,
    observations: BTreeMap<GageId, ObservedSeries>,
    validation: Vec<ReachValidation>,
}

impl Evaluation {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn source(&self) -> ResultSource {
        self.source
    }

    pub fn stats(&self) -> &StatsResult {
        &self.stats
    }

    /// Statistics of one reach.
    pub fn reach(&self, reach: &ReachId) -> Option<&ReachStats> {
        self.stats.reach(reach)
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Why the result could not be persisted, if it could not.
    pub fn cache_write_error(&self) -> Option<&str> {
        self.cache_write_error.as_deref()
    }

    /// Aligned observations of one gage.
    pub fn observation(&self, gage: &GageId) -> Option<&ObservedSeries> {
        self.observations.get(gage)
    }

    pub fn observations(&self) -> impl Iterator<Item = &ObservedSeries> + '_ {
        self.observations.values()
    }

    pub fn validation(&self) -> &[ReachValidation] {
        &self.validation
    }

    /// A compact, serialisable report of the run.
    pub fn summary(&self) -> EvaluationSummary<'_> {
        EvaluationSummary {
            fingerprint: &self.fingerprint,
            source: self.source,
            quantiles: &self.stats.quantiles,
            time_steps: self.stats.time_grid.len(),
            reaches: self.stats.reaches.len(),
            members: self.metadata.members.len(),
            nominal_members: self.metadata.nominal_members,
            skipped_members: &self.metadata.skipped_members,
            absent_reaches: &self.metadata.absent_reaches,
            partial_reaches: &self.metadata.partial_reaches,
            empty_cells: self.metadata.empty_cells,
            cache_write_error: self.cache_write_error.as_deref(),
            observations: self
                .observations
                .values()
                .map(|observed| {
                    (
                        &observed.gage,
                        ObservationSummary {
                            status: observed.status,
                            fetched_at: observed.fetched_at,
                            present: observed.aligned.iter().flatten().count(),
                            failure: observed.failure.as_deref(),
                        },
                    )
                })
                .collect(),
            validation: &self.validation,
        }
    }
}

/// Serialisable report of an [Evaluation].
#[derive(Debug, Serialize)]
pub struct EvaluationSummary<'a> {
    pub fingerprint: &'a Fingerprint,
    pub source: ResultSource,
    pub quantiles: &'a [f64],
    pub time_steps: usize,
    pub reaches: usize,
    pub members: usize,
    pub nominal_members: usize,
    pub skipped_members: &'a [SkippedMember],
    pub absent_reaches: &'a [ReachId],
    pub partial_reaches: &'a [ReachId],
    pub empty_cells: usize,
    pub cache_write_error: Option<&'a str>,
    pub observations: BTreeMap<&'a GageId, ObservationSummary<'a>>,
    pub validation: &'a [ReachValidation],
}

#[derive(Debug, Serialize)]
pub struct ObservationSummary<'a> {
    pub status: SeriesStatus,
    pub fetched_at: Option<Timestamp>,
    /// Model time steps with an observed value
    pub present: usize,
    pub failure: Option<&'a str>,
}

/// Runs evaluations for one configuration.
pub struct Pipeline<S> {
    config: EvalConfig,
    source: Arc<S>,
    resource_manager: Arc<ResourceManager>,
    progress: Arc<dyn ProgressSink>,
}

impl Pipeline<UsgsSource> {
    /// Return a new Pipeline that fetches observations from USGS.
    pub fn new(config: EvalConfig) -> Self {
        let source = UsgsSource::new(
            config.observations.service_url.as_ref(),
            config.observations.to_cms,
        );
        Pipeline::with_source(config, source)
    }
}

impl<S: ObservationSource + 'static> Pipeline<S> {
    /// Return a new Pipeline using an arbitrary observation source.
    pub fn with_source(config: EvalConfig, source: S) -> Self {
        let resource_manager = ResourceManager::new(
            Some(config.observations.max_connections),
            config.stats.memory_limit,
        );
        Pipeline {
            config,
            source: Arc::new(source),
            resource_manager: Arc::new(resource_manager),
            progress: Arc::new(LogProgress),
        }
    }

    /// Report batch progress to `progress` instead of the log.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Share a resource manager with other pipelines in the process.
    pub fn with_resource_manager(mut self, resource_manager: Arc<ResourceManager>) -> Self {
        self.resource_manager = resource_manager;
        self
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run an evaluation.
    #[tracing::instrument(level = "DEBUG", skip_all, fields(inputs = %self.config.inputs))]
    pub async fn run(&self) -> Result<Evaluation, EnsembleError> {
        let config = &self.config;
        config.validate()?;
        let inputs = enumerate_inputs(&config.inputs)?;
        let identities = identify(&inputs, config.stats.signature)?;
        let fingerprint = fingerprint_identities(&identities, &config.stats)?;
        event!(
            Level::INFO,
            "Evaluating {} member files, fingerprint {}",
            inputs.len(),
            fingerprint
        );

        let cache_root = if config.cache.enabled {
            match CacheRoot::open(&config.cache.root) {
                Ok(root) => Some(root),
                Err(err) => {
                    log_error(&err, true);
                    None
                }
            }
        } else {
            None
        };

        let reaches = config.stats.reach_subset();
        let expected = Expected {
            fingerprint: &fingerprint,
            quantiles: &config.stats.quantiles,
            reaches: reaches.as_deref(),
        };
        let hit = cache_root
            .as_ref()
            .and_then(|root| match StatsCache::new(root).lookup(&expected) {
                CacheLookup::Hit(entry) => Some(entry),
                CacheLookup::Miss | CacheLookup::Corrupt(_) => None,
            });

        let (source, stats, metadata, cache_write_error) = match hit {
            Some(entry) => (ResultSource::Cache, entry.payload, entry.metadata, None),
            None => {
                let (stats, metadata) = self.compute(inputs, identities).await?;
                let entry = CacheEntry::new(fingerprint.clone(), metadata, stats);
                let cache_write_error = cache_root.as_ref().and_then(|root| {
                    let err = StatsCache::new(root).store(&entry).err()?;
                    log_error(&err, true);
                    Some(err.to_string())
                });
                if let Some(root) = &cache_root {
                    self.prune(root);
                }
                (
                    ResultSource::Computed,
                    entry.payload,
                    entry.metadata,
                    cache_write_error,
                )
            }
        };

        let observations = self
            .observe(cache_root.as_ref(), &stats.time_grid)
            .await;
        let validation = self.score_reaches(&stats, &observations);

        Ok(Evaluation {
            fingerprint,
            source,
            stats,
            metadata,
            cache_write_error,
            observations,
            validation,
        })
    }

    /// Scan and summarise the ensemble on worker threads.
    ///
    /// The scan fails if an input no longer matches the identity it was fingerprinted with.
    async fn compute(
        &self,
        inputs: Vec<std::path::PathBuf>,
        identities: Vec<FileIdentity>,
    ) -> Result<(StatsResult, RunMetadata), EnsembleError> {
        let stats = &self.config.stats;
        let options = LoaderOptions {
            identities: Some(identities),
            ..LoaderOptions::from(stats)
        };
        let index = off_runtime(stats.use_rayon, move || scan(&inputs, &options)).await?;

        let bytes_per_reach = index.bytes_per_reach();
        let batch_size = self
            .resource_manager
            .batch_size(stats.batch_size, bytes_per_reach, index.reaches().len())?;
        // Held until the statistics are complete.
        let _memory_permit = self
            .resource_manager
            .memory(ResourceManager::batch_bytes(batch_size, bytes_per_reach))
            .await?;
        let engine = StatsEngine::new(&stats.quantiles, batch_size, stats.use_rayon)?;
        event!(
            Level::INFO,
            "Summarising {} reaches of {} members in batches of {}",
            index.reaches().len(),
            index.members().len(),
            batch_size
        );
        let progress = Arc::clone(&self.progress);
        off_runtime(stats.use_rayon, move || engine.run(&index, progress.as_ref())).await
    }

    /// Remove expired and excess cache entries. Failures are logged only.
    fn prune(&self, root: &CacheRoot) {
        let cache = &self.config.cache;
        if cache.max_age().is_none() && cache.size_limit.is_none() {
            return;
        }
        if let Err(err) =
            StatsCache::new(root).prune(cache.max_age(), cache.size_limit, SystemTime::now())
        {
            log_error(&err, true);
        }
    }

    /// Fetch the observations of every configured gage concurrently.
    async fn observe(
        &self,
        cache_root: Option<&CacheRoot>,
        grid: &[Timestamp],
    ) -> BTreeMap<GageId, ObservedSeries> {
        let gages: BTreeSet<GageId> = self.config.observations.gages.values().cloned().collect();
        let mut observations = BTreeMap::new();
        if gages.is_empty() {
            return observations;
        }
        let fetcher = Arc::new(ObservationFetcher::new(
            Arc::clone(&self.source),
            cache_root.map(ObservationCache::new),
            &self.config.observations,
        ));
        let grid: Arc<[Timestamp]> = grid.into();
        let now = Timestamp::now();
        let mut tasks = JoinSet::new();
        for gage in gages {
            let fetcher = Arc::clone(&fetcher);
            let grid = Arc::clone(&grid);
            let resource_manager = Arc::clone(&self.resource_manager);
            tasks.spawn(async move {
                // Without a permit the fetch proceeds unthrottled.
                let _connection_permit = match resource_manager.connection().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        log_error(&err, true);
                        None
                    }
                };
                fetcher.observe(&gage, &grid, now).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(observed) => {
                    observations.insert(observed.gage.clone(), observed);
                }
                Err(err) => event!(Level::ERROR, "Observation task failed: {}", err),
            }
        }
        observations
    }

    /// Score the ensemble mean of every gaged reach against its observations.
    fn score_reaches(
        &self,
        stats: &StatsResult,
        observations: &BTreeMap<GageId, ObservedSeries>,
    ) -> Vec<ReachValidation> {
        let metrics = &self.config.observations.metrics;
        self.config
            .observations
            .gages
            .iter()
            .map(|(reach, gage)| {
                let scores = stats
                    .reach(reach)
                    .zip(observations.get(gage))
                    .and_then(|(simulated, observed)| {
                        score(&simulated.mean, &observed.aligned, metrics)
                    });
                if scores.is_none() {
                    event!(
                        Level::WARN,
                        "No overlapping data to validate reach {} against gage {}",
                        reach,
                        gage
                    );
                }
                ReachValidation {
                    reach: reach.clone(),
                    gage: gage.clone(),
                    scores,
                }
            })
            .collect()
    }
}

/// Run blocking work on the Rayon pool or the blocking thread pool.
async fn off_runtime<T, F>(use_rayon: bool, work: F) -> Result<T, EnsembleError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EnsembleError> + Send + 'static,
{
    if use_rayon {
        tokio_rayon::spawn(work).await
    } else {
        tokio::task::spawn_blocking(work).await?
    }
}
