//! Observation fetching with retry, caching and stale fallback.
//!
//! [ObservationFetcher::observe] never fails: a gage is served from a fresh cache copy, from the
//! observation service, from an expired cache copy flagged as stale, or reported absent. A
//! failure for one gage therefore never affects statistics or other gages.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{event, Level};

use crate::alignment::align;
use crate::config::ObservationConfig;
use crate::error::{log_error, EnsembleError};
use crate::metrics;
use crate::models::GageId;
use crate::observation_cache::{ObservationCache, ObservationRecord};
use crate::types::Timestamp;

/// Inclusive time span requested from an observation service.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ObservationWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl ObservationWindow {
    /// The span of a model time grid, widened by `padding_seconds` at both ends.
    ///
    /// Returns `None` for an empty grid.
    pub fn around(grid: &[Timestamp], padding_seconds: i64) -> Option<Self> {
        let (first, last) = (grid.first()?, grid.last()?);
        Some(ObservationWindow {
            start: first.offset(-padding_seconds),
            end: last.offset(padding_seconds),
        })
    }

    /// Whether this window contains all of `other`.
    pub fn covers(&self, other: &ObservationWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Observed values of one gage, ascending in time.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ObservationSeries {
    pub gage: GageId,
    pub times: Vec<Timestamp>,
    pub values: Vec<f64>,
}

impl ObservationSeries {
    /// Sort by time, keeping the first value of repeated times and dropping non-finite values.
    fn normalise(self) -> Result<Self, EnsembleError> {
        if self.times.len() != self.values.len() {
            return Err(EnsembleError::ObservationFormat {
                gage: self.gage,
                reason: format!(
                    "{} timestamps for {} values",
                    self.times.len(),
                    self.values.len()
                ),
            });
        }
        let mut points: Vec<(Timestamp, f64)> = self
            .times
            .into_iter()
            .zip(self.values)
            .filter(|(_, value)| value.is_finite())
            .collect();
        points.sort_by_key(|(time, _)| *time);
        points.dedup_by_key(|(time, _)| *time);
        let (times, values) = points.into_iter().unzip();
        Ok(ObservationSeries {
            gage: self.gage,
            times,
            values,
        })
    }
}

/// Capability of retrieving an observation series from an external service.
pub trait ObservationSource: Send + Sync {
    fn fetch(
        &self,
        gage: &GageId,
        window: &ObservationWindow,
    ) -> impl Future<Output = Result<ObservationSeries, EnsembleError>> + Send;
}

impl<S: ObservationSource> ObservationSource for Arc<S> {
    fn fetch(
        &self,
        gage: &GageId,
        window: &ObservationWindow,
    ) -> impl Future<Output = Result<ObservationSeries, EnsembleError>> + Send {
        (**self).fetch(gage, window)
    }
}

/// Where an observation series came from.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SeriesStatus {
    /// Fetched from the service during this run
    Fetched,
    /// Served from a cache copy within its TTL
    Cached,
    /// Fetching failed; served from an expired cache copy
    Stale,
    /// Fetching failed and nothing was cached
    Absent,
}

/// An observation series aligned to the model time grid.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObservedSeries {
    pub gage: GageId,
    pub status: SeriesStatus,
    /// When the values were retrieved from the service
    pub fetched_at: Option<Timestamp>,
    /// One value per model time step; `None` where there is no observation
    pub aligned: Vec<Option<f64>>,
    #[serde(skip)]
    pub series: Option<ObservationSeries>,
    /// Why the final fetch failed, if it did
    pub failure: Option<String>,
}

impl ObservedSeries {
    pub fn is_stale(&self) -> bool {
        self.status == SeriesStatus::Stale
    }

    pub fn is_absent(&self) -> bool {
        self.status == SeriesStatus::Absent
    }
}

/// Retry policy for fetch attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): doubled each time, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&ObservationConfig> for RetryPolicy {
    fn from(config: &ObservationConfig) -> Self {
        RetryPolicy {
            timeout: config.timeout(),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }
}

/// Retrieves observation series through a source, a cache and a retry policy.
#[derive(Debug)]
pub struct ObservationFetcher<S> {
    source: S,
    cache: Option<ObservationCache>,
    retry: RetryPolicy,
    ttl_seconds: u64,
    padding_seconds: i64,
}

impl<S: ObservationSource> ObservationFetcher<S> {
    /// Return a new ObservationFetcher.
    ///
    /// # Arguments
    ///
    /// * `source`: Observation service
    /// * `cache`: Local observation cache, if caching is enabled
    /// * `config`: Observation options
    pub fn new(source: S, cache: Option<ObservationCache>, config: &ObservationConfig) -> Self {
        ObservationFetcher {
            source,
            cache,
            retry: config.into(),
            ttl_seconds: config.ttl_seconds,
            padding_seconds: config.padding_seconds,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Return the observations of `gage` aligned to `grid`, as seen at time `now`.
    #[tracing::instrument(level = "DEBUG", skip_all, fields(gage = %gage))]
    pub async fn observe(&self, gage: &GageId, grid: &[Timestamp], now: Timestamp) -> ObservedSeries {
        let observed = self.observe_inner(gage, grid, now).await;
        metrics::record_observation(&observed.status.to_string());
        observed
    }

    async fn observe_inner(&self, gage: &GageId, grid: &[Timestamp], now: Timestamp) -> ObservedSeries {
        let Some(window) = ObservationWindow::around(grid, self.padding_seconds) else {
            return absent(gage, grid, Some("model time grid is empty".to_string()));
        };
        let cached = self.cache.as_ref().and_then(|cache| cache.load(gage));
        if let Some(record) = &cached {
            if record.is_fresh(now, &window) {
                event!(Level::DEBUG, "Serving observations of gage {} from cache", gage);
                return served(record, SeriesStatus::Cached, grid, None);
            }
        }

        match self.fetch_with_retry(gage, &window).await {
            Ok(series) => {
                let record = ObservationRecord::new(series, window, now, self.ttl_seconds);
                if let Some(cache) = &self.cache {
                    // The series is still usable without a cache copy.
                    if let Err(err) = cache.store(&record) {
                        log_error(&err, true);
                    }
                }
                served(&record, SeriesStatus::Fetched, grid, None)
            }
            Err(err) => {
                log_error(&err, true);
                match cached {
                    Some(record) => {
                        event!(
                            Level::WARN,
                            "Serving stale observations of gage {} fetched at {}",
                            gage,
                            record.fetched_at
                        );
                        served(&record, SeriesStatus::Stale, grid, Some(err.to_string()))
                    }
                    None => {
                        event!(Level::WARN, "No observations available for gage {}", gage);
                        absent(gage, grid, Some(err.to_string()))
                    }
                }
            }
        }
    }

    /// Fetch with a deadline per attempt, retrying transient failures with exponential backoff.
    async fn fetch_with_retry(
        &self,
        gage: &GageId,
        window: &ObservationWindow,
    ) -> Result<ObservationSeries, EnsembleError> {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.retry.timeout, self.source.fetch(gage, window)).await {
                Ok(result) => result.and_then(ObservationSeries::normalise),
                Err(_) => Err(EnsembleError::ObservationTimeout {
                    gage: gage.clone(),
                    timeout: self.retry.timeout,
                }),
            };
            let err = match result {
                Ok(series) => {
                    metrics::record_fetch_attempt("ok");
                    event!(
                        Level::DEBUG,
                        "Fetched {} observations of gage {} on attempt {}",
                        series.values.len(),
                        gage,
                        attempt
                    );
                    return Ok(series);
                }
                Err(err) => err,
            };
            metrics::record_fetch_attempt(match &err {
                EnsembleError::ObservationTimeout { .. } => "timeout",
                _ if err.is_transient() => "transient",
                _ => "error",
            });
            if !err.is_transient() || attempt >= self.retry.max_attempts {
                return Err(err);
            }
            let delay = self.retry.backoff(attempt);
            event!(
                Level::WARN,
                "Attempt {} of {} for gage {} failed ({}); retrying in {:?}",
                attempt,
                self.retry.max_attempts,
                gage,
                err,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn served(
    record: &ObservationRecord,
    status: SeriesStatus,
    grid: &[Timestamp],
    failure: Option<String>,
) -> ObservedSeries {
    let series = record.series();
    ObservedSeries {
        gage: record.source_id.clone(),
        status,
        fetched_at: Some(record.fetched_at),
        aligned: align(&series, grid),
        series: Some(series),
        failure,
    }
}

fn absent(gage: &GageId, grid: &[Timestamp], failure: Option<String>) -> ObservedSeries {
    ObservedSeries {
        gage: gage.clone(),
        status: SeriesStatus::Absent,
        fetched_at: None,
        aligned: vec![None; grid.len()],
        series: None,
        failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_root::CacheRoot;
    use crate::test_utils::{Scripted, ScriptedSource};

    const HOUR: i64 = 3600;

    fn grid() -> Vec<Timestamp> {
        [0, HOUR, 2 * HOUR].map(Timestamp::from_seconds).to_vec()
    }

    fn config() -> ObservationConfig {
        ObservationConfig {
            timeout_ms: 50,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            padding_seconds: 0,
            ..ObservationConfig::default()
        }
    }

    fn hourly(values: [f64; 3]) -> Scripted {
        Scripted::Series(vec![(0, values[0]), (HOUR, values[1]), (2 * HOUR, values[2])])
    }

    fn fetcher(
        replies: Vec<Scripted>,
        cache: Option<&CacheRoot>,
    ) -> ObservationFetcher<ScriptedSource> {
        ObservationFetcher::new(
            ScriptedSource::new(replies),
            cache.map(ObservationCache::new),
            &config(),
        )
    }

    #[test]
    fn window_around_grid() {
        let window = ObservationWindow::around(&grid(), 60).unwrap();
        assert_eq!(Timestamp::from_seconds(-60), window.start);
        assert_eq!(Timestamp::from_seconds(2 * HOUR + 60), window.end);
        assert!(window.covers(&ObservationWindow::around(&grid(), 0).unwrap()));
        assert!(!ObservationWindow::around(&grid(), 0).unwrap().covers(&window));
        assert_eq!(None, ObservationWindow::around(&[], 60));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            timeout: Duration::from_secs(1),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        let delays: Vec<u128> = (1..=4).map(|n| policy.backoff(n).as_millis()).collect();
        assert_eq!(vec![100, 200, 350, 350], delays);
    }

    #[test]
    fn normalise_sorts_and_drops_non_finite() {
        let series = ObservationSeries {
            gage: GageId::from("01"),
            times: [20, 10, 10, 30].map(Timestamp::from_seconds).to_vec(),
            values: vec![2.0, 1.0, 9.0, f64::NAN],
        };
        let series = series.normalise().unwrap();
        assert_eq!(
            [10, 20].map(Timestamp::from_seconds).to_vec(),
            series.times
        );
        assert_eq!(vec![1.0, 2.0], series.values);

        let ragged = ObservationSeries {
            gage: GageId::from("01"),
            times: vec![Timestamp::from_seconds(0)],
            values: vec![],
        };
        assert!(matches!(
            ragged.normalise(),
            Err(EnsembleError::ObservationFormat { .. })
        ));
    }

    #[tokio::test]
    async fn fetch_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let root = CacheRoot::open(dir.path()).unwrap();
        let gage = GageId::from("01646500");
        let now = Timestamp::from_seconds(10 * HOUR);

        let fetcher = fetcher(vec![hourly([1.0, 2.0, 3.0])], Some(&root));
        let observed = fetcher.observe(&gage, &grid(), now).await;
        assert_eq!(SeriesStatus::Fetched, observed.status);
        assert_eq!(vec![Some(1.0), Some(2.0), Some(3.0)], observed.aligned);
        assert_eq!(Some(now), observed.fetched_at);

        // Within the TTL the cache copy is served without calling the source.
        let cached = fetcher.observe(&gage, &grid(), now.offset(60)).await;
        assert_eq!(SeriesStatus::Cached, cached.status);
        assert_eq!(observed.aligned, cached.aligned);
        assert_eq!(1, fetcher.source().calls());
    }

    #[tokio::test]
    async fn expired_cache_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let root = CacheRoot::open(dir.path()).unwrap();
        let gage = GageId::from("01646500");
        let now = Timestamp::from_seconds(10 * HOUR);
        let fetcher = fetcher(
            vec![hourly([1.0, 2.0, 3.0]), hourly([4.0, 5.0, 6.0])],
            Some(&root),
        );
        fetcher.observe(&gage, &grid(), now).await;
        let later = now.offset(config().ttl_seconds as i64 + 1);
        let observed = fetcher.observe(&gage, &grid(), later).await;
        assert_eq!(SeriesStatus::Fetched, observed.status);
        assert_eq!(vec![Some(4.0), Some(5.0), Some(6.0)], observed.aligned);
        assert_eq!(2, fetcher.source().calls());
    }

    #[tokio::test]
    async fn cache_not_covering_window_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let root = CacheRoot::open(dir.path()).unwrap();
        let gage = GageId::from("01646500");
        let now = Timestamp::from_seconds(10 * HOUR);
        let fetcher = fetcher(
            vec![hourly([1.0, 2.0, 3.0]), hourly([1.0, 2.0, 3.0])],
            Some(&root),
        );
        fetcher.observe(&gage, &grid()[..2], now).await;
        let observed = fetcher.observe(&gage, &grid(), now).await;
        assert_eq!(SeriesStatus::Fetched, observed.status);
        assert_eq!(2, fetcher.source().calls());
    }

    #[tokio::test]
    async fn timeouts_fall_back_to_stale_cache() {
        let dir = tempfile::tempdir().unwrap();
        let root = CacheRoot::open(dir.path()).unwrap();
        let gage = GageId::from("01646500");
        let now = Timestamp::from_seconds(10 * HOUR);
        let fetcher = fetcher(
            vec![
                hourly([1.0, 2.0, 3.0]),
                Scripted::Hang,
                Scripted::Hang,
                Scripted::Hang,
            ],
            Some(&root),
        );
        fetcher.observe(&gage, &grid(), now).await;
        let later = now.offset(config().ttl_seconds as i64 + 1);
        let observed = fetcher.observe(&gage, &grid(), later).await;
        assert!(observed.is_stale());
        assert_eq!(vec![Some(1.0), Some(2.0), Some(3.0)], observed.aligned);
        assert_eq!(Some(now), observed.fetched_at);
        assert!(observed.failure.unwrap().contains("timed out"));
        assert_eq!(4, fetcher.source().calls());
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let gage = GageId::from("01646500");
        let fetcher = fetcher(
            vec![Scripted::Status(503), hourly([1.0, 2.0, 3.0])],
            None,
        );
        let observed = fetcher
            .observe(&gage, &grid(), Timestamp::from_seconds(0))
            .await;
        assert_eq!(SeriesStatus::Fetched, observed.status);
        assert_eq!(2, fetcher.source().calls());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let gage = GageId::from("01646500");
        let fetcher = fetcher(vec![Scripted::Status(404)], None);
        let observed = fetcher
            .observe(&gage, &grid(), Timestamp::from_seconds(0))
            .await;
        assert!(observed.is_absent());
        assert_eq!(vec![None; 3], observed.aligned);
        assert_eq!(1, fetcher.source().calls());
    }

    #[tokio::test]
    async fn exhausted_without_cache_is_absent() {
        let gage = GageId::from("01646500");
        let fetcher = fetcher(
            vec![Scripted::Status(500), Scripted::Status(502), Scripted::Status(503)],
            None,
        );
        let observed = fetcher
            .observe(&gage, &grid(), Timestamp::from_seconds(0))
            .await;
        assert!(observed.is_absent());
        assert_eq!(3, fetcher.source().calls());
        assert!(observed.failure.unwrap().contains("503"));
    }
}
