//! Deterministic skill scores of a simulated series against observations.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::config::Metric;
use crate::models::{GageId, ReachId};

/// Skill scores over the time steps where both series have a value.
///
/// A score is `None` when it was not requested or is undefined for the data, such as KGE
/// against a constant series.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Scores {
    /// Number of paired time steps
    pub pairs: usize,
    pub kge: Option<f64>,
    /// Nash-Sutcliffe efficiency; negative infinity when the observations have no variance
    pub nse: Option<f64>,
    pub rmse: Option<f64>,
}

/// Scores of the ensemble mean of one reach against its gage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReachValidation {
    pub reach: ReachId,
    pub gage: GageId,
    /// `None` when no time step has both a simulated and an observed value
    pub scores: Option<Scores>,
}

/// Compute the requested metrics of `simulated` against `observed`.
///
/// Both slices are indexed by model time step. Returns `None` if they share no present step.
pub fn score(simulated: &[Option<f64>], observed: &[Option<f64>], metrics: &[Metric]) -> Option<Scores> {
    let (s, o): (Vec<f64>, Vec<f64>) = simulated
        .iter()
        .zip(observed)
        .filter_map(|pair| match pair {
            (Some(s), Some(o)) if s.is_finite() && o.is_finite() => Some((*s, *o)),
            _ => None,
        })
        .unzip();
    if s.is_empty() {
        return None;
    }
    let (s, o) = (Array1::from(s), Array1::from(o));
    let mut scores = Scores {
        pairs: s.len(),
        ..Scores::default()
    };
    for metric in metrics {
        match metric {
            Metric::Kge => scores.kge = kge(&s, &o),
            Metric::Nse => scores.nse = Some(nse(&s, &o)),
            Metric::Rmse => scores.rmse = Some(rmse(&s, &o)),
        }
    }
    Some(scores)
}

fn rmse(s: &Array1<f64>, o: &Array1<f64>) -> f64 {
    (s - o).mapv(|d| d * d).mean().unwrap_or(f64::NAN).sqrt()
}

fn nse(s: &Array1<f64>, o: &Array1<f64>) -> f64 {
    let mean_o = o.mean().unwrap_or(f64::NAN);
    let sse = (s - o).mapv(|d| d * d).sum();
    let variance = o.mapv(|v| (v - mean_o).powi(2)).sum();
    if variance == 0.0 {
        return f64::NEG_INFINITY;
    }
    1.0 - sse / variance
}

/// Kling-Gupta efficiency with population standard deviations.
fn kge(s: &Array1<f64>, o: &Array1<f64>) -> Option<f64> {
    let (mean_s, mean_o) = (s.mean()?, o.mean()?);
    let (std_s, std_o) = (s.std(0.0), o.std(0.0));
    if std_s == 0.0 || std_o == 0.0 || mean_o == 0.0 {
        return None;
    }
    let covariance = ((s - mean_s) * (o - mean_o)).mean()?;
    let r = covariance / (std_s * std_o);
    let alpha = std_s / std_o;
    let beta = mean_s / mean_o;
    Some(1.0 - ((r - 1.0).powi(2) + (alpha - 1.0).powi(2) + (beta - 1.0).powi(2)).sqrt())
}
