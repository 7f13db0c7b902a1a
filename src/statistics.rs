//! Cross-member statistics kernels.
//!
//! Each (reach, time) cell is summarised independently from the samples of its present members.
//!
//! * Mean and standard deviation come from one pass of shifted sums, accumulated in ascending
//!   member order. The standard deviation is the population one (divisor `n`), so a single
//!   sample has a deviation of exactly zero.
//! * Median and quantiles use selection rather than a full sort, and interpolate linearly
//!   between order statistics: for probability `q` over `n` sorted samples `x`, with
//!   `h = q * (n - 1)`, the quantile is `x[floor(h)] + (h - floor(h)) * (x[floor(h) + 1] - x[floor(h)])`.
//!   This is the "linear" method of NumPy and R's type 7.
//!
//! A cell without present samples yields no statistics at all (`None`), never zero. A statistic
//! that overflows to a non-finite value is also `None`, so it reads back unchanged from the
//! cache, where non-finite numbers cannot be stored.

use ndarray::Axis;

use crate::error::EnsembleError;
use crate::models::{ReachEnsemble, ReachStats};

/// Name of the quantile method. Part of every fingerprint.
pub const QUANTILE_METHOD: &str = "linear";

/// Statistics of one cell.
#[derive(Clone, Debug, PartialEq)]
pub struct CellStats {
    pub present: u32,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std: Option<f64>,
    pub quantiles: Vec<Option<f64>>,
}

impl CellStats {
    /// Statistics of a cell without present samples.
    pub fn empty(quantiles: usize) -> Self {
        CellStats {
            present: 0,
            mean: None,
            median: None,
            std: None,
            quantiles: vec![None; quantiles],
        }
    }
}

/// Running first and second moments.
///
/// Samples are shifted by the first sample to keep the sum of squares well conditioned.
#[derive(Clone, Copy, Debug, Default)]
pub struct Moments {
    count: u32,
    shift: f64,
    sum: f64,
    sum_sq: f64,
}

impl Moments {
    pub fn push(&mut self, x: f64) {
        if self.count == 0 {
            self.shift = x;
        }
        let d = x - self.shift;
        self.sum += d;
        self.sum_sq += d * d;
        self.count += 1;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        finite(self.shift + self.sum / f64::from(self.count))
    }

    /// Population standard deviation.
    pub fn std(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let n = f64::from(self.count);
        let variance = (self.sum_sq - self.sum * self.sum / n) / n;
        // Rounding can leave a tiny negative variance.
        finite(variance).map(|variance| variance.max(0.0).sqrt())
    }
}

fn finite(x: f64) -> Option<f64> {
    x.is_finite().then_some(x)
}

/// Linearly interpolated quantile of `samples`, reordering them in place.
///
/// `samples` must be non-empty and free of NaN, and `q` must lie in `[0, 1]`.
pub fn quantile_linear(samples: &mut [f64], q: f64) -> f64 {
    let h = q * (samples.len() - 1) as f64;
    let lo = h.floor() as usize;
    let frac = h - lo as f64;
    let (_, lo_value, above) = samples.select_nth_unstable_by(lo, f64::total_cmp);
    let lo_value = *lo_value;
    if frac == 0.0 || above.is_empty() {
        return lo_value;
    }
    // The next order statistic is the smallest element above the selected one.
    let hi_value = above.iter().copied().fold(f64::INFINITY, f64::min);
    lo_value + frac * (hi_value - lo_value)
}

/// Summarise the present samples of one cell.
///
/// `samples` holds the present samples in ascending member order; it is reordered.
pub fn summarise_cell(samples: &mut [f64], quantiles: &[f64]) -> Result<CellStats, EnsembleError> {
    if samples.is_empty() {
        return Ok(CellStats::empty(quantiles.len()));
    }
    let mut moments = Moments::default();
    for x in samples.iter() {
        moments.push(*x);
    }
    Ok(CellStats {
        present: u32::try_from(samples.len())?,
        mean: moments.mean(),
        std: moments.std(),
        median: finite(quantile_linear(samples, 0.5)),
        quantiles: quantiles
            .iter()
            .map(|q| finite(quantile_linear(samples, *q)))
            .collect(),
    })
}

/// Summarise every time step of one reach.
///
/// Returns the statistics and the number of cells without present samples.
pub fn summarise_reach(
    ensemble: &ReachEnsemble,
    quantiles: &[f64],
) -> Result<(ReachStats, usize), EnsembleError> {
    let steps = ensemble.values.len_of(Axis(0));
    let mut stats = ReachStats::with_capacity(steps, quantiles.len());
    let mut samples = Vec::with_capacity(ensemble.values.len_of(Axis(1)));
    let mut empty_cells = 0;
    for row in ensemble.values.axis_iter(Axis(0)) {
        samples.clear();
        samples.extend(row.iter().copied().filter(|x| !x.is_nan()));
        let cell = summarise_cell(&mut samples, quantiles)?;
        if cell.present == 0 {
            empty_cells += 1;
        }
        stats.present.push(cell.present);
        stats.mean.push(cell.mean);
        stats.median.push(cell.median);
        stats.std.push(cell.std);
        for (column, value) in stats.quantiles.iter_mut().zip(cell.quantiles) {
            column.push(value);
        }
    }
    Ok((stats, empty_cells))
}
