//! This crate computes summary statistics of streamflow ensembles and validates them against
//! gage observations. Ensemble output is one file per member, each holding a time series per
//! stream reach. For every reach and time step the crate summarises the ensemble dimension
//! (present member count, mean, median, standard deviation and configured quantiles) under a
//! bounded memory budget.
//!
//! Results are cached under a fingerprint of the input files and every statistic-affecting
//! option, so repeated invocations with unchanged inputs skip recomputation. A cache entry is
//! never served for a different fingerprint, and an unreadable entry is recomputed.
//!
//! Observations are fetched from an external service (the USGS NWIS instantaneous values
//! service by default) with per-attempt timeouts and exponential backoff, cached per gage with a
//! TTL, and served stale when the service is unreachable.
//!
//! The crate is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime, drives observation fetching.
//! * [Rayon](rayon) optionally summarises the reaches of a batch in parallel.
//! * [Serde](serde) performs (de)serialisation of member files, cache entries and configuration.
//! * [reqwest] talks to the observation service.
//! * [ndarray] provides [NumPy](https://numpy.org)-like n-dimensional arrays used in numerical
//!   computation.

pub mod alignment;
pub mod cache_root;
pub mod cli;
pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod loader;
pub mod member_format;
pub mod metrics;
pub mod models;
pub mod observation_cache;
pub mod observations;
pub mod pipeline;
pub mod resource_manager;
pub mod statistics;
pub mod stats_cache;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod types;
pub mod usgs;
pub mod validation;
