//! Stream integrity tracking
//!
//! Every inter-stage byte stream is forwarded by a pump that updates a
//! running SHA-256 and byte count as it copies. The hash sees each byte
//! exactly once, the bytes reach the downstream stage unaltered, and the
//! digest is independent of the chunk boundaries the pipe happened to
//! deliver.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Accumulated checksum of one monitored stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDigest {
    /// Identifier of the pipe the stream flowed through
    pub pipe_id: String,
    pub bytes: u64,
    pub sha256: String,
}

/// A checksum mismatch or frame-count divergence found after the pipeline
/// completed. Reported alongside the result; the output exists, the warning
/// flags it as suspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityWarning {
    ChecksumMismatch {
        pipe_id: String,
        expected: String,
        actual: String,
    },
    FrameCountMismatch {
        expected: u64,
        reported: u64,
    },
}

impl std::fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityWarning::ChecksumMismatch {
                pipe_id,
                expected,
                actual,
            } => write!(
                f,
                "stream '{pipe_id}' checksum mismatch: expected {expected}, got {actual}"
            ),
            IntegrityWarning::FrameCountMismatch { expected, reported } => write!(
                f,
                "encoder reported {reported} frames, expected {expected} from source metadata"
            ),
        }
    }
}

const PUMP_BUF_SIZE: usize = 64 * 1024;

/// Forward all bytes from `reader` to `writer`, hashing as they pass.
///
/// Backpressure is the pipe's own: a full downstream buffer blocks the write,
/// which blocks the read, which blocks the upstream producer. Returns the
/// digest at upstream EOF after closing the write side so the downstream
/// stage sees EOF too.
pub async fn pump<R, W>(mut reader: R, mut writer: W, pipe_id: &str) -> std::io::Result<StreamDigest>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; PUMP_BUF_SIZE];
    let mut bytes = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        bytes += n as u64;
    }

    writer.shutdown().await?;

    Ok(StreamDigest {
        pipe_id: pipe_id.to_string(),
        bytes,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Compare accumulated digests against expected values. Streams without an
/// expectation are not warned about.
pub fn verify(digests: &[StreamDigest], expected: &[(String, String)]) -> Vec<IntegrityWarning> {
    let mut warnings = Vec::new();
    for (pipe_id, expected_hash) in expected {
        if let Some(digest) = digests.iter().find(|d| &d.pipe_id == pipe_id) {
            if &digest.sha256 != expected_hash {
                warnings.push(IntegrityWarning::ChecksumMismatch {
                    pipe_id: pipe_id.clone(),
                    expected: expected_hash.clone(),
                    actual: digest.sha256.clone(),
                });
            }
        }
    }
    warnings
}
