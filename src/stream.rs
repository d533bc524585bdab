//! Chunked read / compress / checksum pipeline for one file.
//!
//! `FileStream` yields the byte sequence that actually goes to the object
//! store. Sources that are already in a compressed container are passed
//! through unchanged while a digest runs over the chunks. Everything else
//! is read twice: one pass computes the digest over the raw bytes, a
//! second independent pass produces the zstd stream that is uploaded.
//! The checksum therefore always authenticates the original content, not
//! the transmitted bytes.

use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::warn;

/// Segment size for raw reads, shared by both read passes.
pub const SEGMENT_SIZE: usize = 64 * 1024;

const COMPRESSION_LEVEL: i32 = 3;

enum Mode {
    /// Source already compressed: hash and yield chunks unchanged.
    Passthrough { hasher: Sha256 },
    /// Source needs compression: the raw digest was computed up front,
    /// chunks are run through zstd on the way out.
    Compress {
        encoder: zstd::stream::write::Encoder<'static, Vec<u8>>,
        digest: String,
    },
}

/// A lazy, finite, non-restartable chunk sequence over one source file.
pub struct FileStream {
    path: PathBuf,
    file: File,
    mode: Option<Mode>,
    checksum: Option<String>,
    bytes_out: u64,
    done: bool,
    read_failed: bool,
}

/// Digest a whole file in `SEGMENT_SIZE` chunks, hex-encoded.
pub async fn digest_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; SEGMENT_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

impl FileStream {
    /// Opens the source and prepares the right pipeline for it. For
    /// not-yet-compressed sources this runs the full digest pass first.
    pub async fn open(path: &Path, already_compressed: bool) -> std::io::Result<Self> {
        let mode = if already_compressed {
            Mode::Passthrough {
                hasher: Sha256::new(),
            }
        } else {
            let digest = digest_file(path).await?;
            Mode::Compress {
                encoder: zstd::stream::write::Encoder::new(Vec::new(), COMPRESSION_LEVEL)?,
                digest,
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            file: File::open(path).await?,
            mode: Some(mode),
            checksum: None,
            bytes_out: 0,
            done: false,
            read_failed: false,
        })
    }

    /// Next outgoing chunk, or `None` once the sequence has ended.
    ///
    /// A read failure is logged and ends the sequence early; check
    /// `completed()` to tell a clean end from a truncated one.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        let mut buf = vec![0u8; SEGMENT_SIZE];
        loop {
            if self.done {
                return None;
            }

            let n = match self.file.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(file = %self.path.display(), %err, "read failed mid-stream");
                    self.fail_early();
                    return None;
                }
            };

            if n == 0 {
                return self.finish();
            }

            match self.mode.as_mut() {
                Some(Mode::Passthrough { hasher }) => {
                    hasher.update(&buf[..n]);
                    self.bytes_out += n as u64;
                    return Some(Bytes::copy_from_slice(&buf[..n]));
                }
                Some(Mode::Compress { encoder, .. }) => {
                    if let Err(err) = encoder.write_all(&buf[..n]) {
                        warn!(file = %self.path.display(), %err, "compression failed mid-stream");
                        self.fail_early();
                        return None;
                    }
                    let out = std::mem::take(encoder.get_mut());
                    if out.is_empty() {
                        // Encoder is still buffering; keep reading.
                        continue;
                    }
                    self.bytes_out += out.len() as u64;
                    return Some(Bytes::from(out));
                }
                None => return None,
            }
        }
    }

    fn finish(&mut self) -> Option<Bytes> {
        self.done = true;
        match self.mode.take() {
            Some(Mode::Passthrough { hasher }) => {
                self.checksum = Some(format!("{:x}", hasher.finalize()));
                None
            }
            Some(Mode::Compress { encoder, digest }) => {
                self.checksum = Some(digest);
                match encoder.finish() {
                    Ok(tail) if tail.is_empty() => None,
                    Ok(tail) => {
                        self.bytes_out += tail.len() as u64;
                        Some(Bytes::from(tail))
                    }
                    Err(err) => {
                        warn!(file = %self.path.display(), %err, "compression tail failed");
                        self.read_failed = true;
                        None
                    }
                }
            }
            None => None,
        }
    }

    fn fail_early(&mut self) {
        self.done = true;
        self.read_failed = true;
        // The digest still reflects whatever was read before the failure.
        self.checksum = match self.mode.take() {
            Some(Mode::Passthrough { hasher }) => Some(format!("{:x}", hasher.finalize())),
            Some(Mode::Compress { digest, .. }) => Some(digest),
            None => None,
        };
    }

    /// Hex digest of the raw content. Only available once the sequence
    /// has been exhausted.
    pub fn final_digest(&self) -> Option<&str> {
        if self.done {
            self.checksum.as_deref()
        } else {
            None
        }
    }

    /// Bytes handed out so far; after a clean end this is the processed
    /// size of the artifact.
    pub fn bytes_streamed(&self) -> u64 {
        self.bytes_out
    }

    /// True once the sequence ended without a mid-stream failure.
    pub fn completed(&self) -> bool {
        self.done && !self.read_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    async fn drain(stream: &mut FileStream) -> Vec<u8> {
        let mut all = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            all.extend_from_slice(&chunk);
        }
        all
    }

    fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    #[tokio::test]
    async fn passthrough_digest_matches_whole_file_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.gz");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &content).unwrap();

        let mut stream = FileStream::open(&path, true).await.unwrap();
        assert!(stream.final_digest().is_none());

        let out = drain(&mut stream).await;
        assert_eq!(out, content);
        assert!(stream.completed());
        assert_eq!(stream.bytes_streamed(), content.len() as u64);
        assert_eq!(stream.final_digest().unwrap(), sha256_hex(&content));
    }

    #[tokio::test]
    async fn compressing_stream_hashes_raw_bytes_not_transmitted_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.txt");
        let content = b"hello hello hello hello hello".repeat(4000);
        fs::write(&path, &content).unwrap();

        let mut stream = FileStream::open(&path, false).await.unwrap();
        let out = drain(&mut stream).await;

        assert!(stream.completed());
        assert_ne!(out, content);
        assert!(out.len() < content.len());
        // The uploaded bytes decode back to the original.
        assert_eq!(zstd::decode_all(&out[..]).unwrap(), content);
        // The digest is over the original, not the zstd stream.
        assert_eq!(stream.final_digest().unwrap(), sha256_hex(&content));
        assert_eq!(stream.bytes_streamed(), out.len() as u64);
    }

    #[tokio::test]
    async fn ten_byte_scenario_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"0123456789").unwrap();

        let mut stream = FileStream::open(&path, false).await.unwrap();
        let _ = drain(&mut stream).await;
        assert_eq!(stream.final_digest().unwrap(), sha256_hex(b"0123456789"));
    }

    #[tokio::test]
    async fn empty_file_compresses_to_a_valid_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        fs::write(&path, b"").unwrap();

        let mut stream = FileStream::open(&path, false).await.unwrap();
        let out = drain(&mut stream).await;
        assert!(stream.completed());
        assert_eq!(zstd::decode_all(&out[..]).unwrap(), b"");
        assert_eq!(stream.final_digest().unwrap(), sha256_hex(b""));
    }
}
