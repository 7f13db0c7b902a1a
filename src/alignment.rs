//! Alignment of observation series onto a model time grid.
//!
//! Values are interpolated linearly in time between the two nearest observations. Grid points
//! before the first or after the last observation get no value; there is no extrapolation.

use crate::observations::ObservationSeries;
use crate::types::Timestamp;

/// Interpolate `series` at each point of `grid`.
///
/// `series` must be ascending in time without repeated timestamps.
pub fn align(series: &ObservationSeries, grid: &[Timestamp]) -> Vec<Option<f64>> {
    grid.iter()
        .map(|t| interpolate(&series.times, &series.values, *t))
        .collect()
}

fn interpolate(times: &[Timestamp], values: &[f64], t: Timestamp) -> Option<f64> {
    // Index of the first observation at or after `t`.
    let i = times.partition_point(|time| *time < t);
    let (t1, v1) = (*times.get(i)?, *values.get(i)?);
    if t1 == t {
        return Some(v1);
    }
    let (t0, v0) = (*times.get(i.checked_sub(1)?)?, *values.get(i - 1)?);
    let fraction = (t.seconds() - t0.seconds()) as f64 / (t1.seconds() - t0.seconds()) as f64;
    Some(v0 + fraction * (v1 - v0))
}
