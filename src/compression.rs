//! (De)compression support.

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::error::EnsembleError;

/// Compression algorithm
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Gzip
    Gzip,
}

impl Compression {
    /// Infer the compression of a file from its extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") => Some(Compression::Gzip),
            _ => None,
        }
    }
}

/// Decompresses some bytes and returns the uncompressed data.
///
/// # Arguments
///
/// * `compression`: Compression algorithm
/// * `data`: Compressed data
pub fn decompress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, EnsembleError> {
    match compression {
        Compression::Gzip => decompress_flate2_gzip(data),
    }
}

/// Compresses some bytes and returns the compressed data.
///
/// # Arguments
///
/// * `compression`: Compression algorithm
/// * `data`: Uncompressed data
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    match compression {
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(5));
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

fn decompress_flate2_gzip(data: &[u8]) -> Result<Vec<u8>, EnsembleError> {
    let mut decoder = GzDecoder::<&[u8]>::new(data);
    // Compressed streamflow compresses well; start from a generous guess.
    let mut buf = Vec::with_capacity(data.len() * 4);
    decoder
        .read_to_end(&mut buf)
        .map_err(EnsembleError::Decompression)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzEncoder;

    fn compress_gzip() -> Vec<u8> {
        // Adapated from flate2 documentation.
        let mut result = Vec::<u8>::new();
        let input = b"hello world";
        let mut deflater = GzEncoder::new(&input[..], flate2::Compression::fast());
        deflater.read_to_end(&mut result).unwrap();
        result
    }

    #[test]
    fn test_decompress_gzip() {
        let compressed = compress_gzip();
        let result = decompress(Compression::Gzip, &compressed).unwrap();
        assert_eq!(result, b"hello world");
    }

    #[test]
    fn test_compress_then_decompress() {
        let compressed = compress(Compression::Gzip, b"{\"a\": 1}").unwrap();
        assert_ne!(&compressed[..], b"{\"a\": 1}");
        assert_eq!(
            b"{\"a\": 1}".to_vec(),
            decompress(Compression::Gzip, &compressed).unwrap()
        );
    }

    #[test]
    fn test_decompress_invalid_gzip() {
        let invalid = b"invalid format";
        let err = decompress(Compression::Gzip, invalid).unwrap_err();
        assert!(matches!(err, EnsembleError::Decompression(_)));
        assert_eq!(err.to_string(), "failed to decompress data");
    }

    #[test]
    fn test_from_path() {
        assert_eq!(
            Some(Compression::Gzip),
            Compression::from_path(Path::new("member_1.json.gz"))
        );
        assert_eq!(None, Compression::from_path(Path::new("member_1.json")));
    }
}
