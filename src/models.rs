//! Data types and associated functions and methods

use std::collections::BTreeMap;
use std::path::PathBuf;

use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::types::Timestamp;

/// Ordinal position of a member file within the sorted input selection.
pub type MemberIndex = usize;

/// Stable identifier of a stream reach.
///
/// Reach ids may be integral (NHDPlus COMIDs) or textual (`wb-1234`); both are kept as strings.
/// Canonical order is lexicographic.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ReachId(String);

impl ReachId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ReachId {
    fn from(id: &str) -> Self {
        ReachId(id.to_string())
    }
}

impl From<String> for ReachId {
    fn from(id: String) -> Self {
        ReachId(id)
    }
}

impl From<u64> for ReachId {
    fn from(id: u64) -> Self {
        ReachId(id.to_string())
    }
}

impl std::fmt::Display for ReachId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an observation gage, e.g. a USGS site number such as `05568500`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct GageId(String);

impl GageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GageId {
    fn from(id: &str) -> Self {
        GageId(id.to_string())
    }
}

impl From<String> for GageId {
    fn from(id: String) -> Self {
        GageId(id)
    }
}

impl std::fmt::Display for GageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive time window. Open ends are unbounded.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TimeWindow {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl TimeWindow {
    /// Return a new TimeWindow object.
    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> Self {
        TimeWindow { start, end }
    }

    /// Whether the window contains the timestamp.
    pub fn contains(&self, t: Timestamp) -> bool {
        self.start.map_or(true, |start| t >= start) && self.end.map_or(true, |end| t <= end)
    }
}

/// One member's time series for one reach, borrowed from an [EnsembleRecord].
pub struct ReachSeries<'a> {
    pub reach: &'a ReachId,
    pub member: MemberIndex,
    pub time_grid: &'a [Timestamp],
    /// Samples on the time grid; absent samples are NaN.
    pub values: ArrayView1<'a, f64>,
}

impl<'a> ReachSeries<'a> {
    /// Iterate over (timestamp, value) pairs, skipping absent samples.
    pub fn samples(&self) -> impl Iterator<Item = (Timestamp, f64)> + '_ {
        self.time_grid
            .iter()
            .copied()
            .zip(self.values.iter().copied())
            .filter(|(_, value)| !value.is_nan())
    }
}

/// All member series for one reach.
#[derive(Clone, Debug, PartialEq)]
pub struct ReachEnsemble {
    /// Members carrying this reach, ascending. One column of `values` per member.
    pub members: Vec<MemberIndex>,
    /// Samples with shape (time, member). Absent samples are NaN.
    pub values: Array2<f64>,
    /// Whether some present member of the run lacks this reach.
    pub partial: bool,
}

impl ReachEnsemble {
    /// Return an ensemble for a reach that no member carries.
    pub fn absent(time_steps: usize) -> Self {
        ReachEnsemble {
            members: vec![],
            values: Array2::zeros((time_steps, 0)),
            partial: true,
        }
    }
}

/// The ensemble for (a batch of) one evaluation run.
#[derive(Clone, Debug, PartialEq)]
pub struct EnsembleRecord {
    /// Canonical time grid shared by every member.
    pub time_grid: Vec<Timestamp>,
    /// Members that survived loading, ascending.
    pub members: Vec<MemberIndex>,
    /// Per-reach member series, in canonical reach order.
    pub reaches: BTreeMap<ReachId, ReachEnsemble>,
}

impl EnsembleRecord {
    /// Borrow one member's series for a reach, if that member carries it.
    pub fn series(&self, reach: &ReachId, member: MemberIndex) -> Option<ReachSeries<'_>> {
        let (reach, ensemble) = self.reaches.get_key_value(reach)?;
        let column = ensemble.members.iter().position(|m| *m == member)?;
        Some(ReachSeries {
            reach,
            member,
            time_grid: &self.time_grid,
            values: ensemble.values.index_axis(Axis(1), column),
        })
    }
}

/// Why a member was left out of a run.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The file could not be read or parsed
    Parse,
    /// The file's time grid differs from the canonical grid
    Mismatch,
}

/// A member excluded from a run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SkippedMember {
    pub member: MemberIndex,
    pub path: PathBuf,
    pub reason: SkipReason,
    pub detail: String,
}

/// Run-level metadata aggregated from recoverable failures.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RunMetadata {
    /// Number of members selected for the run.
    pub nominal_members: usize,
    /// Members that contributed data, ascending.
    pub members: Vec<MemberIndex>,
    pub skipped_members: Vec<SkippedMember>,
    /// Requested reaches that no member carries.
    pub absent_reaches: Vec<ReachId>,
    /// Reaches carried by only some of the present members.
    pub partial_reaches: Vec<ReachId>,
    /// Number of (reach, time) cells without any present sample.
    pub empty_cells: usize,
}

impl RunMetadata {
    /// Member indices that were skipped, ascending.
    pub fn skipped_indices(&self) -> Vec<MemberIndex> {
        let mut indices: Vec<MemberIndex> =
            self.skipped_members.iter().map(|s| s.member).collect();
        indices.sort_unstable();
        indices
    }

    /// Whether the run used less than the full ensemble.
    pub fn degraded(&self) -> bool {
        !self.skipped_members.is_empty()
            || !self.absent_reaches.is_empty()
            || !self.partial_reaches.is_empty()
    }
}

/// Summary statistics for one reach, one column per statistic over the time grid.
///
/// A cell with no present member holds `present == 0` and `None` for every statistic. That is
/// the "no data" sentinel; statistics are never zero-filled or omitted.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ReachStats {
    pub present: Vec<u32>,
    pub mean: Vec<Option<f64>>,
    pub median: Vec<Option<f64>>,
    pub std: Vec<Option<f64>>,
    /// One column per configured quantile, in configured order.
    pub quantiles: Vec<Vec<Option<f64>>>,
}

impl ReachStats {
    /// Return a ReachStats with room for `time_steps` cells and `quantiles` quantile columns.
    pub fn with_capacity(time_steps: usize, quantiles: usize) -> Self {
        ReachStats {
            present: Vec::with_capacity(time_steps),
            mean: Vec::with_capacity(time_steps),
            median: Vec::with_capacity(time_steps),
            std: Vec::with_capacity(time_steps),
            quantiles: (0..quantiles)
                .map(|_| Vec::with_capacity(time_steps))
                .collect(),
        }
    }

    /// Number of time steps covered.
    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}

/// The statistics of one cell, as a fixed record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsRecord {
    pub time: Timestamp,
    pub present: u32,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std: Option<f64>,
    /// (probability, value) for every configured quantile.
    pub quantiles: Vec<(f64, Option<f64>)>,
}

/// Output of the statistics engine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StatsResult {
    pub time_grid: Vec<Timestamp>,
    /// Configured quantile probabilities, in configured order.
    pub quantiles: Vec<f64>,
    pub reaches: BTreeMap<ReachId, ReachStats>,
}

impl StatsResult {
    /// Return an empty result for the given grid and quantile set.
    pub fn new(time_grid: Vec<Timestamp>, quantiles: Vec<f64>) -> Self {
        StatsResult {
            time_grid,
            quantiles,
            reaches: BTreeMap::new(),
        }
    }

    /// Statistics of one reach.
    pub fn reach(&self, reach: &ReachId) -> Option<&ReachStats> {
        self.reaches.get(reach)
    }

    /// The fixed record for a reach at time index `t`.
    pub fn record(&self, reach: &ReachId, t: usize) -> Option<StatsRecord> {
        let stats = self.reaches.get(reach)?;
        let time = *self.time_grid.get(t)?;
        Some(StatsRecord {
            time,
            present: *stats.present.get(t)?,
            mean: *stats.mean.get(t)?,
            median: *stats.median.get(t)?,
            std: *stats.std.get(t)?,
            quantiles: self
                .quantiles
                .iter()
                .zip(stats.quantiles.iter())
                .map(|(q, column)| (*q, column.get(t).copied().flatten()))
                .collect(),
        })
    }

    /// Column of a quantile for a reach, looked up by probability.
    pub fn quantile_series(&self, reach: &ReachId, q: f64) -> Option<&[Option<f64>]> {
        let index = self.quantiles.iter().position(|p| *p == q)?;
        self.reaches
            .get(reach)
            .and_then(|stats| stats.quantiles.get(index))
            .map(|column| column.as_slice())
    }
}

/// Conventional label of a quantile, e.g. `p05` for 0.05.
pub fn quantile_label(q: f64) -> String {
    format!("p{:02}", (q * 100.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use serde_test::{assert_tokens, Token};

    fn record() -> EnsembleRecord {
        let mut reaches = BTreeMap::new();
        reaches.insert(
            ReachId::from("R1"),
            ReachEnsemble {
                members: vec![0, 2],
                values: array![[1.0, 2.0], [f64::NAN, 4.0]],
                partial: false,
            },
        );
        EnsembleRecord {
            time_grid: vec![Timestamp::from_seconds(0), Timestamp::from_seconds(3600)],
            members: vec![0, 2],
            reaches,
        }
    }

    #[test]
    fn test_reach_id_tokens() {
        assert_tokens(&ReachId::from(1001_u64), &[Token::Str("1001")]);
    }

    #[test]
    fn test_time_window_contains() {
        let window = TimeWindow::new(Some(Timestamp::from_seconds(10)), None);
        assert!(!window.contains(Timestamp::from_seconds(9)));
        assert!(window.contains(Timestamp::from_seconds(10)));
        assert!(window.contains(Timestamp::from_seconds(i64::MAX)));
        assert!(TimeWindow::default().contains(Timestamp::from_seconds(-1)));
    }

    #[test]
    fn test_series_samples_skip_absent() {
        let record = record();
        let series = record.series(&ReachId::from("R1"), 0).unwrap();
        let samples: Vec<(Timestamp, f64)> = series.samples().collect();
        assert_eq!(vec![(Timestamp::from_seconds(0), 1.0)], samples);
        let series = record.series(&ReachId::from("R1"), 2).unwrap();
        assert_eq!(2, series.samples().count());
    }

    #[test]
    fn test_series_unknown_member() {
        assert!(record().series(&ReachId::from("R1"), 1).is_none());
        assert!(record().series(&ReachId::from("R2"), 0).is_none());
    }

    #[test]
    fn test_skipped_indices_sorted() {
        let skipped = |member| SkippedMember {
            member,
            path: PathBuf::from("x"),
            reason: SkipReason::Parse,
            detail: String::new(),
        };
        let metadata = RunMetadata {
            skipped_members: vec![skipped(7), skipped(3)],
            ..Default::default()
        };
        assert_eq!(vec![3, 7], metadata.skipped_indices());
        assert!(metadata.degraded());
        assert!(!RunMetadata::default().degraded());
    }

    #[test]
    fn test_quantile_label() {
        assert_eq!("p05", quantile_label(0.05));
        assert_eq!("p50", quantile_label(0.5));
        assert_eq!("p95", quantile_label(0.95));
    }

    #[test]
    fn test_record_lookup() {
        let mut result = StatsResult::new(vec![Timestamp::from_seconds(0)], vec![0.05, 0.95]);
        result.reaches.insert(
            ReachId::from("R1"),
            ReachStats {
                present: vec![0],
                mean: vec![None],
                median: vec![None],
                std: vec![None],
                quantiles: vec![vec![None], vec![None]],
            },
        );
        let record = result.record(&ReachId::from("R1"), 0).unwrap();
        assert_eq!(0, record.present);
        assert_eq!(vec![(0.05, None), (0.95, None)], record.quantiles);
        assert!(result.record(&ReachId::from("R1"), 1).is_none());
        assert_eq!(
            Some(&[None][..]),
            result.quantile_series(&ReachId::from("R1"), 0.95)
        );
    }
}
