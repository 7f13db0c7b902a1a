//! Fingerprints of statistics runs.
//!
//! A fingerprint is a SHA-256 digest over everything that affects the statistics of a run: the
//! identity and modification signature of every input file, the quantile set, the member and
//! reach subsets, the time window, the default missing data descriptor, and the version of the
//! cache format and quantile method. Two runs with equal fingerprints produce equal results.
//!
//! Batch size, memory budget and the Rayon switch do not change results and are excluded.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::StatsConfig;
use crate::error::EnsembleError;
use crate::models::{MemberIndex, ReachId, TimeWindow};
use crate::statistics::QUANTILE_METHOD;
use crate::types::Missing;

/// Version of the cache entry format. Bumping it invalidates every cached entry.
pub const FORMAT_VERSION: u32 = 1;

/// How input files are identified.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// File size and modification time
    #[default]
    Metadata,
    /// File size and SHA-256 of the contents
    Content,
}

/// Modification signature of one input file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileSignature {
    Metadata { size: u64, modified_ns: i128 },
    Content { size: u64, sha256: String },
    /// The file does not exist.
    Absent,
}

impl FileSignature {
    /// Compute the signature of a file.
    ///
    /// A file that does not exist has the [FileSignature::Absent] signature. Any other I/O
    /// failure leaves the signature undetermined and is returned as an error.
    pub fn of(path: &Path, mode: SignatureMode) -> Result<Self, EnsembleError> {
        let enumeration_error = |source| EnsembleError::InputEnumeration {
            path: path.to_path_buf(),
            source,
        };
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(FileSignature::Absent),
            Err(err) => return Err(enumeration_error(err)),
        };
        match mode {
            SignatureMode::Metadata => {
                let modified = metadata.modified().map_err(enumeration_error)?;
                let modified_ns = match modified.duration_since(UNIX_EPOCH) {
                    Ok(since) => since.as_nanos() as i128,
                    Err(before) => -(before.duration().as_nanos() as i128),
                };
                Ok(FileSignature::Metadata {
                    size: metadata.len(),
                    modified_ns,
                })
            }
            SignatureMode::Content => {
                let mut file = std::fs::File::open(path).map_err(enumeration_error)?;
                let mut hasher = Sha256::new();
                let size = std::io::copy(&mut file, &mut hasher).map_err(enumeration_error)?;
                Ok(FileSignature::Content {
                    size,
                    sha256: hex::encode(hasher.finalize()),
                })
            }
        }
    }
}

/// Identity of one input file.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub signature: FileSignature,
}

impl FileIdentity {
    /// Identify a file, canonicalising its path where possible.
    pub fn of(path: &Path, mode: SignatureMode) -> Result<Self, EnsembleError> {
        Ok(FileIdentity {
            path: std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
            signature: FileSignature::of(path, mode)?,
        })
    }
}

/// Opaque, stable key of a statistics run.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(id: String) -> Self {
        Fingerprint(id)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything hashed into a fingerprint, in canonical form.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    format_version: u32,
    quantile_method: &'static str,
    files: &'a [FileIdentity],
    quantiles: &'a [f64],
    members: Option<Vec<MemberIndex>>,
    reaches: Option<Vec<ReachId>>,
    time_window: &'a TimeWindow,
    missing: Option<&'a Missing>,
}

/// Identify every input file, in member order.
#[tracing::instrument(level = "DEBUG", skip_all, fields(files = inputs.len()))]
pub fn identify(inputs: &[PathBuf], mode: SignatureMode) -> Result<Vec<FileIdentity>, EnsembleError> {
    inputs
        .iter()
        .map(|path| FileIdentity::of(path, mode))
        .collect()
}

/// Derive the fingerprint of a run over identified input files, which must be in member order.
///
/// The identities must be kept and handed to the loader, so that a file modified after
/// identification fails the scan instead of being summarised under this fingerprint.
pub fn fingerprint_identities(
    files: &[FileIdentity],
    stats: &StatsConfig,
) -> Result<Fingerprint, EnsembleError> {
    let input = FingerprintInput {
        format_version: FORMAT_VERSION,
        quantile_method: QUANTILE_METHOD,
        files,
        quantiles: &stats.quantiles,
        members: stats.member_subset(),
        reaches: stats.reach_subset(),
        time_window: &stats.time_window,
        missing: stats.missing.as_ref(),
    };
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&input)?);
    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

/// Derive the fingerprint of a run over `inputs`, which must be in member order.
pub fn fingerprint(inputs: &[PathBuf], stats: &StatsConfig) -> Result<Fingerprint, EnsembleError> {
    fingerprint_identities(&identify(inputs, stats.signature)?, stats)
}
