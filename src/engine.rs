//! Statistics engine.
//!
//! The engine walks the reaches of an [EnsembleIndex] in canonical order, a batch at a time:
//! each batch is loaded, summarised and dropped before the next one is loaded, so peak memory
//! depends on the batch size rather than the number of reaches. Reaches are independent, so a
//! batch may be summarised in parallel with Rayon; results are keyed by reach and merged after
//! the batch, which keeps them identical to a sequential run.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{event, Level};

use crate::error::EnsembleError;
use crate::loader::EnsembleIndex;
use crate::metrics;
use crate::models::{EnsembleRecord, ReachId, ReachStats, RunMetadata, StatsResult};
use crate::statistics::summarise_reach;

/// Checkpoint reported after each batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchProgress {
    /// 1-based batch number
    pub batch: usize,
    pub batches: usize,
    pub reaches_done: usize,
    pub reaches_total: usize,
    pub elapsed: Duration,
}

/// Receiver of per-batch progress checkpoints.
pub trait ProgressSink: Send + Sync {
    fn batch_done(&self, progress: &BatchProgress);
}

/// Reports progress through tracing.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn batch_done(&self, progress: &BatchProgress) {
        event!(
            Level::INFO,
            "Batch {}/{}: {}/{} reaches summarised in {:.1?}",
            progress.batch,
            progress.batches,
            progress.reaches_done,
            progress.reaches_total,
            progress.elapsed
        );
    }
}

/// Computes ensemble statistics for a fixed quantile set.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsEngine {
    quantiles: Vec<f64>,
    batch_size: usize,
    use_rayon: bool,
}

impl StatsEngine {
    /// Return a new StatsEngine.
    ///
    /// # Arguments
    ///
    /// * `quantiles`: Quantile probabilities, each strictly between 0 and 1
    /// * `batch_size`: Number of reaches per batch
    /// * `use_rayon`: Whether to summarise the reaches of a batch in parallel
    pub fn new(quantiles: &[f64], batch_size: usize, use_rayon: bool) -> Result<Self, EnsembleError> {
        if let Some(q) = quantiles.iter().find(|q| !(**q > 0.0 && **q < 1.0)) {
            return Err(EnsembleError::InvalidQuantile(*q));
        }
        Ok(StatsEngine {
            quantiles: quantiles.to_vec(),
            batch_size: batch_size.max(1),
            use_rayon,
        })
    }

    pub fn quantiles(&self) -> &[f64] {
        &self.quantiles
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Summarise every reach of an in-memory record.
    ///
    /// Returns the statistics and the number of cells without present samples.
    pub fn summarise(&self, record: &EnsembleRecord) -> Result<(StatsResult, usize), EnsembleError> {
        let mut result = StatsResult::new(record.time_grid.clone(), self.quantiles.clone());
        let empty = self.summarise_into(record, &mut result)?;
        Ok((result, empty.iter().map(|(_, cells)| cells).sum()))
    }

    /// Summarise the reaches of `record` into `result`, returning the empty cell count of every
    /// reach that has any.
    fn summarise_into(
        &self,
        record: &EnsembleRecord,
        result: &mut StatsResult,
    ) -> Result<Vec<(ReachId, usize)>, EnsembleError> {
        let summarised: Vec<(ReachId, ReachStats, usize)> = if self.use_rayon {
            record
                .reaches
                .par_iter()
                .map(|(reach, ensemble)| {
                    summarise_reach(ensemble, &self.quantiles)
                        .map(|(stats, empty)| (reach.clone(), stats, empty))
                })
                .collect::<Result<_, _>>()?
        } else {
            record
                .reaches
                .iter()
                .map(|(reach, ensemble)| {
                    summarise_reach(ensemble, &self.quantiles)
                        .map(|(stats, empty)| (reach.clone(), stats, empty))
                })
                .collect::<Result<_, _>>()?
        };
        let mut empty = Vec::new();
        for (reach, stats, cells) in summarised {
            if cells > 0 {
                empty.push((reach.clone(), cells));
            }
            result.reaches.insert(reach, stats);
        }
        Ok(empty)
    }

    /// Load and summarise every reach of a scanned ensemble, batch by batch.
    #[tracing::instrument(level = "DEBUG", skip_all, fields(batch_size = self.batch_size))]
    pub fn run(
        &self,
        index: &EnsembleIndex,
        progress: &dyn ProgressSink,
    ) -> Result<(StatsResult, RunMetadata), EnsembleError> {
        let reaches: Vec<ReachId> = index.reaches().cloned().collect();
        let batches = reaches.len().div_ceil(self.batch_size);
        let mut result = StatsResult::new(index.time_grid().to_vec(), self.quantiles.clone());
        let mut empty: Vec<(ReachId, usize)> = Vec::new();
        let mut reaches_done = 0;
        let start = Instant::now();
        for (i, batch) in reaches.chunks(self.batch_size).enumerate() {
            let batch_start = Instant::now();
            let record = index.load_batch(batch)?;
            empty.extend(self.summarise_into(&record, &mut result)?);
            drop(record);
            metrics::record_batch_time(batch_start.elapsed());
            reaches_done += batch.len();
            progress.batch_done(&BatchProgress {
                batch: i + 1,
                batches,
                reaches_done,
                reaches_total: reaches.len(),
                elapsed: start.elapsed(),
            });
        }

        let mut metadata = index.metadata();
        metadata.empty_cells = empty.iter().map(|(_, cells)| cells).sum();
        if metadata.empty_cells > 0 {
            let examples: Vec<&str> = empty.iter().take(5).map(|(r, _)| r.as_str()).collect();
            event!(
                Level::WARN,
                "{} cells across {} reaches have no present member (e.g. {}); their statistics are empty",
                metadata.empty_cells,
                empty.len(),
                examples.join(", ")
            );
        }
        Ok((result, metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{scan, LoaderOptions};
    use crate::models::ReachEnsemble;
    use crate::test_utils;
    use crate::types::Timestamp;

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use ndarray::Array2;

    #[derive(Default)]
    struct RecordingProgress(Mutex<Vec<BatchProgress>>);

    impl ProgressSink for RecordingProgress {
        fn batch_done(&self, progress: &BatchProgress) {
            self.0.lock().unwrap().push(progress.clone());
        }
    }

    fn many_reaches(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        (0..4)
            .map(|member| {
                let reaches: Vec<(String, Vec<f64>)> = (0..25)
                    .map(|reach| {
                        let values = (0..3)
                            .map(|t| (member * 100 + reach * 3 + t) as f64 * 0.1)
                            .collect();
                        (format!("R{:02}", reach), values)
                    })
                    .collect();
                let reaches: Vec<(&str, Vec<f64>)> = reaches
                    .iter()
                    .map(|(reach, values)| (reach.as_str(), values.clone()))
                    .collect();
                test_utils::write_member(dir, member, &[0, 3600, 7200], &reaches)
            })
            .collect()
    }

    #[test]
    fn invalid_quantile() {
        assert!(matches!(
            StatsEngine::new(&[0.5, 1.0], 1, false).unwrap_err(),
            EnsembleError::InvalidQuantile(q) if q == 1.0
        ));
        assert!(StatsEngine::new(&[0.0], 1, false).is_err());
    }

    #[test]
    fn ten_member_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = test_utils::ten_member_ensemble(dir.path());
        let index = scan(&inputs, &LoaderOptions::default()).unwrap();
        let engine = StatsEngine::new(&[0.05, 0.5, 0.95], 16, false).unwrap();
        let (result, metadata) = engine.run(&index, &LogProgress).unwrap();
        let record = result.record(&ReachId::from("R1"), 0).unwrap();
        assert_eq!(10, record.present);
        assert_eq!(Some(5.5), record.mean);
        assert_eq!(Some(5.5), record.median);
        let q: Vec<f64> = record.quantiles.iter().map(|(q, _)| *q).collect();
        assert_eq!(vec![0.05, 0.5, 0.95], q);
        assert!((record.quantiles[0].1.unwrap() - 1.45).abs() < 1e-9);
        assert!((record.quantiles[2].1.unwrap() - 9.55).abs() < 1e-9);
        assert_eq!(0, metadata.empty_cells);
    }

    #[test]
    fn batches_report_progress() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = many_reaches(dir.path());
        let index = scan(&inputs, &LoaderOptions::default()).unwrap();
        let engine = StatsEngine::new(&[0.25], 10, false).unwrap();
        let progress = RecordingProgress::default();
        let (result, _) = engine.run(&index, &progress).unwrap();
        assert_eq!(25, result.reaches.len());
        let progress = progress.0.into_inner().unwrap();
        assert_eq!(3, progress.len());
        assert_eq!(
            vec![10, 20, 25],
            progress.iter().map(|p| p.reaches_done).collect::<Vec<_>>()
        );
        assert!(progress.iter().all(|p| p.batches == 3));
    }

    #[test]
    fn batching_and_rayon_do_not_change_results() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = many_reaches(dir.path());
        let index = scan(&inputs, &LoaderOptions::default()).unwrap();
        let quantiles = [0.05, 0.5, 0.95];
        let (reference, _) = StatsEngine::new(&quantiles, 1000, false)
            .unwrap()
            .run(&index, &LogProgress)
            .unwrap();
        for (batch_size, use_rayon) in [(1, false), (7, true), (25, true)] {
            let (result, _) = StatsEngine::new(&quantiles, batch_size, use_rayon)
                .unwrap()
                .run(&index, &LogProgress)
                .unwrap();
            assert_eq!(reference, result);
        }
    }

    #[test]
    fn absent_reach_has_sentinel_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = test_utils::ten_member_ensemble(dir.path());
        let options = LoaderOptions {
            reaches: Some(vec![ReachId::from("R1"), ReachId::from("R404")]),
            ..LoaderOptions::default()
        };
        let index = scan(&inputs, &options).unwrap();
        let engine = StatsEngine::new(&[0.05, 0.95], 16, false).unwrap();
        let (result, metadata) = engine.run(&index, &LogProgress).unwrap();
        assert_eq!(1, metadata.empty_cells);
        assert_eq!(vec![ReachId::from("R404")], metadata.absent_reaches);
        let record = result.record(&ReachId::from("R404"), 0).unwrap();
        assert_eq!(0, record.present);
        assert_eq!(None, record.mean);
        assert_eq!(vec![(0.05, None), (0.95, None)], record.quantiles);
    }

    #[test]
    fn summarise_in_memory_record() {
        let mut reaches = BTreeMap::new();
        reaches.insert(
            ReachId::from("R1"),
            ReachEnsemble {
                members: vec![0],
                values: Array2::from_elem((2, 1), 3.0),
                partial: false,
            },
        );
        reaches.insert(ReachId::from("R2"), ReachEnsemble::absent(2));
        let record = EnsembleRecord {
            time_grid: vec![Timestamp::from_seconds(0), Timestamp::from_seconds(1)],
            members: vec![0],
            reaches,
        };
        let engine = StatsEngine::new(&[0.1, 0.9], 4, true).unwrap();
        let (result, empty_cells) = engine.summarise(&record).unwrap();
        assert_eq!(2, empty_cells);
        let r1 = result.reach(&ReachId::from("R1")).unwrap();
        assert_eq!(vec![Some(0.0), Some(0.0)], r1.std);
        assert_eq!(vec![vec![Some(3.0); 2], vec![Some(3.0); 2]], r1.quantiles);
    }
}
