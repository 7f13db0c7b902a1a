use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::{EvalConfig, InputSelection};
use crate::error::EnsembleError;
use crate::member_format::MemberFile;
use crate::models::{GageId, MemberIndex, ReachId};
use crate::observations::{ObservationSeries, ObservationSource, ObservationWindow};
use crate::types::Timestamp;

/// Write an uncompressed member file named after its member index.
pub(crate) fn write_member(
    dir: &Path,
    member: MemberIndex,
    grid: &[i64],
    reaches: &[(&str, Vec<f64>)],
) -> PathBuf {
    let path = dir.join(format!("member_{:02}.json", member));
    MemberFile {
        member_id: Some(member as i64),
        variable: Some("streamflow".to_string()),
        time: grid.iter().copied().map(Timestamp::from_seconds).collect(),
        missing: None,
        reaches: reaches
            .iter()
            .map(|(reach, values)| {
                (
                    ReachId::from(*reach),
                    values.iter().copied().map(Some).collect(),
                )
            })
            .collect::<BTreeMap<_, _>>(),
    }
    .write(&path)
    .unwrap();
    path
}

/// Ten members with a single time step; member `i` holds `i + 1` for reach `R1`.
pub(crate) fn ten_member_ensemble(dir: &Path) -> Vec<PathBuf> {
    (0..10)
        .map(|member| write_member(dir, member, &[0], &[("R1", vec![(member + 1) as f64])]))
        .collect()
}

/// Configuration over the member files in `inputs`, caching under `cache`.
pub(crate) fn test_config(inputs: &Path, cache: &Path) -> EvalConfig {
    let mut config = EvalConfig::new(InputSelection::directory(inputs));
    config.cache.root = cache.to_path_buf();
    config.observations.timeout_ms = 50;
    config.observations.initial_backoff_ms = 1;
    config.observations.max_backoff_ms = 4;
    config
}

/// One scripted reply of a [ScriptedSource].
#[derive(Clone, Debug)]
pub(crate) enum Scripted {
    /// Answer with these (seconds, value) points.
    Series(Vec<(i64, f64)>),
    /// Fail with this HTTP status.
    Status(u16),
    /// Never answer.
    Hang,
}

/// Observation source replaying scripted replies, counting calls.
#[derive(Debug, Default)]
pub(crate) struct ScriptedSource {
    replies: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub(crate) fn new(replies: Vec<Scripted>) -> Self {
        ScriptedSource {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ObservationSource for ScriptedSource {
    fn fetch(
        &self,
        gage: &GageId,
        _window: &ObservationWindow,
    ) -> impl Future<Output = Result<ObservationSeries, EnsembleError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        let gage = gage.clone();
        async move {
            match reply {
                Some(Scripted::Series(points)) => Ok(ObservationSeries {
                    gage,
                    times: points
                        .iter()
                        .map(|(t, _)| Timestamp::from_seconds(*t))
                        .collect(),
                    values: points.iter().map(|(_, v)| *v).collect(),
                }),
                Some(Scripted::Status(status)) => {
                    Err(EnsembleError::ObservationStatus { gage, status })
                }
                Some(Scripted::Hang) => std::future::pending().await,
                None => Err(EnsembleError::ObservationStatus { gage, status: 500 }),
            }
        }
    }
}
