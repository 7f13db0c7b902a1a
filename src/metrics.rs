use lazy_static::lazy_static;
use prometheus::{self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Statistics cache lookups by outcome
    pub static ref CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("stats_cache_lookups", "The number of statistics cache lookups"),
        &["outcome"]
    ).unwrap();
    // Statistics cache writes by outcome
    pub static ref CACHE_WRITES: IntCounterVec = IntCounterVec::new(
        Opts::new("stats_cache_writes", "The number of statistics cache writes"),
        &["outcome"]
    ).unwrap();
    // Observation fetch attempts by outcome
    pub static ref FETCH_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("observation_fetch_attempts", "The number of observation fetch attempts"),
        &["outcome"]
    ).unwrap();
    // Observation series served, by status
    pub static ref OBSERVATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("observation_series", "The number of observation series served"),
        &["status"]
    ).unwrap();
    // Batch histogram by processing time
    pub static ref BATCH_TIME_COLLECTOR: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("batch_time", "The time taken to load and summarise each batch of reaches"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(), // Change buckets here if desired
        },
        &[],
    ).unwrap();
}

pub fn register_metrics() {
    REGISTRY.register(Box::new(CACHE_LOOKUPS.clone())).unwrap();
    REGISTRY.register(Box::new(CACHE_WRITES.clone())).unwrap();
    REGISTRY.register(Box::new(FETCH_ATTEMPTS.clone())).unwrap();
    REGISTRY.register(Box::new(OBSERVATIONS.clone())).unwrap();
    REGISTRY
        .register(Box::new(BATCH_TIME_COLLECTOR.clone()))
        .unwrap();
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    encoder.encode(&REGISTRY.gather(), &mut buffer).unwrap();

    String::from_utf8(buffer).unwrap()
}

/// Increment the cache lookup counter, labelled by outcome (`hit`, `miss` or `corrupt`)
pub fn record_cache_lookup(outcome: &str) {
    CACHE_LOOKUPS.with_label_values(&[outcome]).inc();
}

/// Increment the cache write counter, labelled by outcome (`ok` or `error`)
pub fn record_cache_write(ok: bool) {
    CACHE_WRITES
        .with_label_values(&[if ok { "ok" } else { "error" }])
        .inc();
}

/// Increment the fetch attempt counter, labelled by outcome
pub fn record_fetch_attempt(outcome: &str) {
    FETCH_ATTEMPTS.with_label_values(&[outcome]).inc();
}

/// Increment the observation counter, labelled by status
pub fn record_observation(status: &str) {
    OBSERVATIONS.with_label_values(&[status]).inc();
}

/// Record the processing time of one batch
pub fn record_batch_time(latency: std::time::Duration) {
    BATCH_TIME_COLLECTOR
        .with_label_values(&[])
        .observe(latency.as_secs_f64());
}
