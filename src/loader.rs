//! Ensemble loader.
//!
//! Loading happens in two phases. [scan] reads every selected member once, keeping only its
//! time grid, missing data descriptor and the set of reaches it carries, and establishes the
//! canonical time grid. [EnsembleIndex::load_batch] then materialises the values of a batch of
//! reaches from every valid member. Peak memory is therefore one parsed member file plus one
//! batch, regardless of the number of reaches.
//!
//! Members that cannot be parsed, or whose time grid differs from the canonical one, are
//! skipped and recorded. The canonical grid is the grid of the first member that parses.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::PathBuf;

use ndarray::Array2;
use regex::Regex;
use tracing::{event, Level};

use crate::config::{InputSelection, StatsConfig};
use crate::error::{log_error, EnsembleError};
use crate::fingerprint::{FileIdentity, FileSignature, SignatureMode};
use crate::member_format::{read_member, ReachFilter, ReachValues};
use crate::models::{
    EnsembleRecord, MemberIndex, ReachEnsemble, ReachId, RunMetadata, SkipReason, SkippedMember,
    TimeWindow,
};
use crate::types::missing::to_sample;
use crate::types::{Missing, Timestamp};

/// Options controlling which part of the ensemble is loaded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoaderOptions {
    /// Ordinal indices of members to load, sorted; all if unset
    pub members: Option<Vec<MemberIndex>>,
    /// Reaches to load, sorted; every reach found if unset
    pub reaches: Option<Vec<ReachId>>,
    pub time_window: TimeWindow,
    /// Missing data descriptor for members that do not declare one
    pub missing: Option<Missing>,
    /// Identities the run was fingerprinted with, in input order. A member file that no longer
    /// matches its identity fails the scan.
    pub identities: Option<Vec<FileIdentity>>,
}

impl From<&StatsConfig> for LoaderOptions {
    fn from(stats: &StatsConfig) -> Self {
        LoaderOptions {
            members: stats.member_subset(),
            reaches: stats.reach_subset(),
            time_window: stats.time_window,
            missing: stats.missing.clone(),
            identities: None,
        }
    }
}

/// Resolve an input selection to a sorted list of member files.
///
/// The position of a file in the returned list is its member index.
pub fn enumerate_inputs(selection: &InputSelection) -> Result<Vec<PathBuf>, EnsembleError> {
    let mut files = match selection {
        InputSelection::Files(files) => files.clone(),
        InputSelection::Pattern { dir, pattern } => {
            let matcher = wildcard_regex(pattern)?;
            let enumeration_error = |source| EnsembleError::InputEnumeration {
                path: dir.clone(),
                source,
            };
            let mut files = Vec::new();
            for entry in std::fs::read_dir(dir).map_err(enumeration_error)? {
                let entry = entry.map_err(enumeration_error)?;
                let matches = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| matcher.is_match(name));
                if matches && !entry.path().is_dir() {
                    files.push(entry.path());
                }
            }
            files
        }
    };
    files.sort();
    files.dedup();
    if files.is_empty() {
        return Err(EnsembleError::NoInputFiles {
            selection: selection.to_string(),
        });
    }
    Ok(files)
}

/// Translate a wildcard file name pattern into an anchored regular expression.
fn wildcard_regex(pattern: &str) -> Result<Regex, EnsembleError> {
    let mut expression = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            c => expression.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    expression.push('$');
    Regex::new(&expression).map_err(|source| EnsembleError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// A member that passed the scan.
#[derive(Clone, Debug, PartialEq)]
struct ScannedMember {
    member: MemberIndex,
    path: PathBuf,
    label: Option<String>,
    missing: Option<Missing>,
    signature: FileSignature,
}

/// Result of scanning an ensemble: the valid members, the canonical grid and the reaches.
#[derive(Clone, Debug, PartialEq)]
pub struct EnsembleIndex {
    nominal_members: usize,
    members: Vec<ScannedMember>,
    /// Full canonical grid, as stored in the member files
    canonical_grid: Vec<Timestamp>,
    /// Steps of the canonical grid within the time window
    window: Range<usize>,
    /// Reaches to summarise, in canonical order, with the number of members carrying each
    reaches: BTreeMap<ReachId, usize>,
    skipped: Vec<SkippedMember>,
}

/// Scan the selected members of an ensemble.
///
/// # Arguments
///
/// * `inputs`: Member files in member order
/// * `options`: Member, reach and time selection
#[tracing::instrument(level = "DEBUG", skip_all, fields(files = inputs.len()))]
pub fn scan(inputs: &[PathBuf], options: &LoaderOptions) -> Result<EnsembleIndex, EnsembleError> {
    let selected: Vec<(MemberIndex, &PathBuf)> = match &options.members {
        Some(members) => {
            for member in members.iter().filter(|member| **member >= inputs.len()) {
                event!(
                    Level::WARN,
                    "Member {} selected but only {} member files exist",
                    member,
                    inputs.len()
                );
            }
            members
                .iter()
                .filter_map(|member| inputs.get(*member).map(|path| (*member, path)))
                .collect()
        }
        None => inputs.iter().enumerate().collect(),
    };

    let mut canonical_grid: Option<Vec<Timestamp>> = None;
    let mut members = Vec::new();
    let mut skipped = Vec::new();
    let mut carried: BTreeMap<ReachId, usize> = BTreeMap::new();
    for (member, path) in selected.iter().copied() {
        let skip = |reason, error: EnsembleError| {
            log_error(&error, true);
            SkippedMember {
                member,
                path: path.clone(),
                reason,
                detail: error.to_string(),
            }
        };
        if let Some(identity) = options
            .identities
            .as_ref()
            .and_then(|identities| identities.get(member))
        {
            let current = match &identity.signature {
                FileSignature::Content { .. } => FileSignature::of(path, SignatureMode::Content)?,
                _ => FileSignature::of(path, SignatureMode::Metadata)?,
            };
            if current != identity.signature {
                return Err(EnsembleError::InputChanged {
                    member,
                    path: path.clone(),
                });
            }
        }
        let signature = match FileSignature::of(path, SignatureMode::Metadata) {
            Ok(signature) => signature,
            Err(err) => {
                skipped.push(skip(SkipReason::Parse, err));
                continue;
            }
        };
        let parsed = match read_member(path, ReachFilter::Lengths) {
            Ok(parsed) => parsed,
            Err(reason) => {
                let error = EnsembleError::MemberParse {
                    member,
                    path: path.clone(),
                    reason,
                };
                skipped.push(skip(SkipReason::Parse, error));
                continue;
            }
        };
        let mismatch = canonical_grid
            .as_ref()
            .and_then(|grid| grid_difference(grid, &parsed.time));
        if let Some(reason) = mismatch {
            let error = EnsembleError::MemberMismatch { member, reason };
            skipped.push(skip(SkipReason::Mismatch, error));
            continue;
        }
        if canonical_grid.is_none() {
            canonical_grid = Some(parsed.time);
        }
        for reach in parsed.reaches.into_keys() {
            *carried.entry(reach).or_default() += 1;
        }
        members.push(ScannedMember {
            member,
            path: path.clone(),
            label: parsed.label,
            missing: parsed.missing.or_else(|| options.missing.clone()),
            signature,
        });
    }

    let canonical_grid = match canonical_grid {
        Some(grid) if !members.is_empty() => grid,
        _ => {
            return Err(EnsembleError::NoValidMembers {
                skipped: skipped.len(),
            })
        }
    };

    let first = canonical_grid
        .iter()
        .position(|t| options.time_window.contains(*t));
    let last = canonical_grid
        .iter()
        .rposition(|t| options.time_window.contains(*t));
    let window = match (first, last) {
        (Some(first), Some(last)) => first..last + 1,
        _ => return Err(EnsembleError::EmptyTimeWindow),
    };

    let reaches = match &options.reaches {
        Some(requested) => requested
            .iter()
            .map(|reach| (reach.clone(), carried.get(reach).copied().unwrap_or(0)))
            .collect(),
        None => carried,
    };

    event!(
        Level::INFO,
        "Scanned {} of {} members: {} reaches, {} time steps",
        members.len(),
        selected.len(),
        reaches.len(),
        window.len()
    );
    Ok(EnsembleIndex {
        nominal_members: selected.len(),
        members,
        canonical_grid,
        window,
        reaches,
        skipped,
    })
}

/// Describe how a member's grid differs from the canonical grid, if it does.
fn grid_difference(canonical: &[Timestamp], grid: &[Timestamp]) -> Option<String> {
    if canonical.len() != grid.len() {
        return Some(format!(
            "{} time steps instead of {}",
            grid.len(),
            canonical.len()
        ));
    }
    canonical
        .iter()
        .zip(grid)
        .position(|(a, b)| a != b)
        .map(|i| format!("time step {} is {} instead of {}", i, grid[i], canonical[i]))
}

impl EnsembleIndex {
    /// Canonical time grid restricted to the time window.
    pub fn time_grid(&self) -> &[Timestamp] {
        &self.canonical_grid[self.window.clone()]
    }

    /// Indices of the valid members, ascending.
    pub fn members(&self) -> Vec<MemberIndex> {
        self.members.iter().map(|m| m.member).collect()
    }

    /// Embedded label of a valid member.
    pub fn label(&self, member: MemberIndex) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.member == member)
            .and_then(|m| m.label.as_deref())
    }

    /// Reaches to summarise, in canonical order.
    pub fn reaches(&self) -> impl ExactSizeIterator<Item = &ReachId> + '_ {
        self.reaches.keys()
    }

    pub fn skipped(&self) -> &[SkippedMember] {
        &self.skipped
    }

    /// Run metadata known after the scan. Empty cells are counted by the engine.
    pub fn metadata(&self) -> RunMetadata {
        let valid = self.members.len();
        RunMetadata {
            nominal_members: self.nominal_members,
            members: self.members(),
            skipped_members: self.skipped.clone(),
            absent_reaches: self
                .reaches
                .iter()
                .filter(|(_, count)| **count == 0)
                .map(|(reach, _)| reach.clone())
                .collect(),
            partial_reaches: self
                .reaches
                .iter()
                .filter(|(_, count)| **count > 0 && **count < valid)
                .map(|(reach, _)| reach.clone())
                .collect(),
            empty_cells: 0,
        }
    }

    /// Bytes needed to hold one reach of the ensemble in memory.
    pub fn bytes_per_reach(&self) -> usize {
        self.members.len() * self.window.len() * std::mem::size_of::<f64>()
    }

    /// Load the values of a batch of reaches from every valid member.
    ///
    /// Reaches that no member carries, or that are not part of the index, are returned with no
    /// members. Fails with [EnsembleError::InputChanged] if a member file was modified since the
    /// scan.
    #[tracing::instrument(level = "DEBUG", skip_all, fields(reaches = reaches.len()))]
    pub fn load_batch(&self, reaches: &[ReachId]) -> Result<EnsembleRecord, EnsembleError> {
        let wanted: BTreeSet<ReachId> = reaches
            .iter()
            .filter(|reach| self.reaches.get(*reach).is_some_and(|count| *count > 0))
            .cloned()
            .collect();
        let steps = self.window.len();
        // Per reach: the members carrying it and their samples, one member after another.
        let mut columns: BTreeMap<&ReachId, (Vec<MemberIndex>, Vec<f64>)> = BTreeMap::new();
        if !wanted.is_empty() {
            for member in &self.members {
                let changed = || EnsembleError::InputChanged {
                    member: member.member,
                    path: member.path.clone(),
                };
                if FileSignature::of(&member.path, SignatureMode::Metadata)? != member.signature {
                    return Err(changed());
                }
                let parsed =
                    read_member(&member.path, ReachFilter::Only(&wanted)).map_err(|_| changed())?;
                if parsed.time != self.canonical_grid {
                    return Err(changed());
                }
                for (reach, values) in parsed.reaches {
                    let Some(reach) = wanted.get(&reach) else {
                        continue;
                    };
                    let ReachValues::Values(values) = values else {
                        continue;
                    };
                    let (members, samples) = columns.entry(reach).or_default();
                    members.push(member.member);
                    samples.extend(
                        values[self.window.clone()]
                            .iter()
                            .map(|value| to_sample(*value, member.missing.as_ref())),
                    );
                }
            }
        }

        let valid = self.members.len();
        let mut record = EnsembleRecord {
            time_grid: self.time_grid().to_vec(),
            members: self.members(),
            reaches: BTreeMap::new(),
        };
        for reach in reaches {
            let ensemble = match columns.remove(reach) {
                Some((members, samples)) => {
                    let partial = members.len() < valid;
                    // Samples are laid out member by member; transpose to (time, member).
                    let values = Array2::from_shape_vec((members.len(), steps), samples)?
                        .reversed_axes();
                    ReachEnsemble {
                        members,
                        values,
                        partial,
                    }
                }
                None => ReachEnsemble::absent(steps),
            };
            record.reaches.insert(reach.clone(), ensemble);
        }
        Ok(record)
    }

    /// Load every reach of the index at once.
    pub fn load(&self) -> Result<EnsembleRecord, EnsembleError> {
        let reaches: Vec<ReachId> = self.reaches.keys().cloned().collect();
        self.load_batch(&reaches)
    }
}

/// Enumerate, scan and load a whole ensemble.
pub fn load_ensemble(
    selection: &InputSelection,
    options: &LoaderOptions,
) -> Result<(EnsembleRecord, RunMetadata), EnsembleError> {
    let inputs = enumerate_inputs(selection)?;
    let index = scan(&inputs, options)?;
    Ok((index.load()?, index.metadata()))
}
