//! Payload compression.
//!
//! Compressed payloads carry a one-byte header so a reader can tell them
//! apart from raw ones even without the entry flag.

use std::io::{Read, Write};
use std::time::Duration;

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;
use tokio::task;
use tokio::time::timeout;

const MARK_RAW: u8 = 0x00;
const MARK_GZIP: u8 = 0x01;

/// Worker budget for one compress or decompress call.
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("gzip stream error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload has unknown compression marker {0:#04x}")]
    UnknownMarker(u8),
    #[error("payload is empty")]
    Empty,
    #[error("compression worker timed out after {0:?}")]
    Timeout(Duration),
    #[error("compression worker failed: {0}")]
    Worker(String),
}

/// Gzip `input` behind the compressed marker.
pub fn compress(input: &[u8]) -> Result<Bytes, CompressionError> {
    let mut out = Vec::with_capacity(input.len() / 2 + 16);
    out.push(MARK_GZIP);
    let mut encoder = GzEncoder::new(out, Compression::default());
    encoder.write_all(input)?;
    Ok(Bytes::from(encoder.finish()?))
}

/// Inverse of [`compress`]. Raw-marked payloads are returned unchanged.
pub fn decompress(input: &[u8]) -> Result<Bytes, CompressionError> {
    let (&marker, body) = input.split_first().ok_or(CompressionError::Empty)?;
    match marker {
        MARK_GZIP => {
            let mut out = Vec::with_capacity(body.len() * 2);
            GzDecoder::new(body).read_to_end(&mut out)?;
            Ok(Bytes::from(out))
        }
        MARK_RAW => Ok(Bytes::copy_from_slice(body)),
        other => Err(CompressionError::UnknownMarker(other)),
    }
}

/// Compress on a blocking worker, bounded by [`WORKER_TIMEOUT`].
///
/// Returns `None` when compressing would not make the payload smaller.
pub async fn compress_in_worker(input: Bytes) -> Result<Option<Bytes>, CompressionError> {
    let original = input.len();
    let compressed = run_in_worker(move || compress(&input)).await?;
    Ok((compressed.len() < original).then_some(compressed))
}

pub async fn decompress_in_worker(input: Bytes) -> Result<Bytes, CompressionError> {
    run_in_worker(move || decompress(&input)).await
}

async fn run_in_worker<F>(job: F) -> Result<Bytes, CompressionError>
where
    F: FnOnce() -> Result<Bytes, CompressionError> + Send + 'static,
{
    match timeout(WORKER_TIMEOUT, task::spawn_blocking(job)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(CompressionError::Worker(join.to_string())),
        Err(_) => Err(CompressionError::Timeout(WORKER_TIMEOUT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_then_decompress_restores_input() {
        let input = "clan roster ".repeat(200);
        let packed = compress(input.as_bytes()).expect("compress");
        assert_eq!(packed[0], MARK_GZIP);
        assert!(packed.len() < input.len());
        assert_eq!(decompress(&packed).expect("decompress"), input.as_bytes());
    }

    #[test]
    fn empty_input_roundtrips() {
        let packed = compress(b"").expect("compress");
        assert!(decompress(&packed).expect("decompress").is_empty());
    }

    #[test]
    fn raw_marker_passes_through() {
        assert_eq!(decompress(&[MARK_RAW, b'h', b'i']).expect("raw"), &b"hi"[..]);
    }

    #[test]
    fn unknown_marker_is_rejected() {
        let err = decompress(&[0x7f, 1, 2]).expect_err("marker");
        assert!(matches!(err, CompressionError::UnknownMarker(0x7f)));
        assert!(matches!(decompress(&[]), Err(CompressionError::Empty)));
    }

    #[tokio::test]
    async fn worker_skips_incompressible_payloads() {
        assert!(
            compress_in_worker(Bytes::from_static(b"ab"))
                .await
                .expect("worker")
                .is_none()
        );
        let big = Bytes::from("a".repeat(4096));
        let packed = compress_in_worker(big.clone())
            .await
            .expect("worker")
            .expect("smaller");
        assert_eq!(decompress_in_worker(packed).await.expect("worker"), big);
    }
}
