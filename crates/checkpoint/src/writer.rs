//! Snapshot file writer and reader
//!
//! A snapshot file is a fixed header followed by the encoded tree:
//!
//! ```text
//! magic "TCKP" | version u32 | step u64 | created_at_ms i64 | payload_len u64 | crc32 u32 | payload
//! ```
//!
//! All integers are little-endian. Files are written to a hidden temp file in
//! the same directory, synced, and renamed into place.

use bytes::Bytes;
use checkpoint_core::{Error, Result, SnapshotMetadata, Step};
use chrono::{DateTime, TimeZone, Utc};
use crc32fast::Hasher;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Magic bytes for snapshot files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"TCKP";

/// Snapshot format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Encoded header length in bytes
pub const HEADER_LEN: usize = 4 + 4 + 8 + 8 + 8 + 4;

/// Snapshot file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u32,
    pub step: Step,
    pub created_at_ms: i64,
    pub payload_len: u64,
    pub checksum: u32,
}

impl SnapshotHeader {
    fn for_payload(step: Step, payload: &[u8]) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            step,
            created_at_ms: Utc::now().timestamp_millis(),
            payload_len: payload.len() as u64,
            checksum: checksum(payload),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&CHECKPOINT_MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.step.to_le_bytes());
        buf.extend_from_slice(&self.created_at_ms.to_le_bytes());
        buf.extend_from_slice(&self.payload_len.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8], path: &Path) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(corrupted(
                path,
                format!("file is {} bytes, header needs {}", buf.len(), HEADER_LEN),
            ));
        }
        if buf[0..4] != CHECKPOINT_MAGIC {
            return Err(corrupted(path, "invalid magic".to_string()));
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };

        let version = u32_at(4);
        if version != CHECKPOINT_VERSION {
            return Err(corrupted(
                path,
                format!("unsupported format version {}", version),
            ));
        }

        Ok(Self {
            version,
            step: u64_at(8),
            created_at_ms: u64_at(16) as i64,
            payload_len: u64_at(24),
            checksum: u32_at(32),
        })
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.created_at_ms)
            .single()
            .unwrap_or_default()
    }

    pub fn metadata(&self, path: PathBuf) -> SnapshotMetadata {
        SnapshotMetadata {
            step: self.step,
            path,
            created_at: self.created_at(),
            payload_bytes: self.payload_len,
            checksum: self.checksum,
        }
    }
}

/// Atomically write a snapshot file at `path`
#[instrument(skip(path, payload), fields(path = %path.display(), bytes = payload.len()))]
pub async fn write_snapshot(path: &Path, step: Step, payload: &[u8]) -> Result<SnapshotMetadata> {
    let start = std::time::Instant::now();
    let header = SnapshotHeader::for_payload(step, payload);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(path);
    let result = write_file(&temp_path, &header.encode(), payload).await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    let size = HEADER_LEN as u64 + payload.len() as u64;
    let elapsed = start.elapsed();
    info!(
        step,
        size_bytes = size,
        elapsed_ms = elapsed.as_millis(),
        throughput_mbps = (size as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(1e-9),
        "Snapshot written"
    );

    Ok(header.metadata(path.to_path_buf()))
}

async fn write_file(temp_path: &Path, header: &[u8], payload: &[u8]) -> Result<()> {
    let mut file = File::create(temp_path).await?;
    file.write_all(header).await?;
    file.write_all(payload).await?;
    file.sync_all().await?;
    Ok(())
}

/// Read and verify a snapshot, returning its header and payload
#[instrument(skip(path), fields(path = %path.display()))]
pub async fn read_snapshot(path: &Path) -> Result<(SnapshotHeader, Bytes)> {
    let raw = tokio::fs::read(path).await?;
    let (header, payload) = decode_snapshot(&raw, path)?;
    debug!(step = header.step, bytes = payload.len(), "Snapshot read");
    Ok((header, Bytes::copy_from_slice(payload)))
}

/// Read only the header of a snapshot
pub async fn read_header(path: &Path) -> Result<SnapshotHeader> {
    use tokio::io::AsyncReadExt;

    let mut file = File::open(path).await?;
    let mut buf = Vec::with_capacity(HEADER_LEN);
    (&mut file).take(HEADER_LEN as u64).read_to_end(&mut buf).await?;
    SnapshotHeader::decode(&buf, path)
}

/// Split a raw snapshot into header and payload, checking length and CRC
pub fn decode_snapshot<'a>(raw: &'a [u8], path: &Path) -> Result<(SnapshotHeader, &'a [u8])> {
    let header = SnapshotHeader::decode(raw, path)?;
    let payload = &raw[HEADER_LEN..];
    if payload.len() as u64 != header.payload_len {
        return Err(corrupted(
            path,
            format!(
                "payload is {} bytes, header says {}",
                payload.len(),
                header.payload_len
            ),
        ));
    }
    let actual = checksum(payload);
    if actual != header.checksum {
        return Err(corrupted(
            path,
            format!(
                "CRC mismatch: expected {:08x}, got {:08x}",
                header.checksum, actual
            ),
        ));
    }
    Ok((header, payload))
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
}

fn corrupted(path: &Path, reason: String) -> Error {
    Error::CheckpointCorrupted {
        path: path.display().to_string(),
        reason,
    }
}
