//! Cheap metadata fingerprints for change detection.
//!
//! A file is considered changed when the hash of its stat tuple changes.
//! Content is never read, so an edit that preserves size and mtime (at the
//! filesystem's mtime resolution) goes unnoticed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::Metadata;

/// Portable snapshot of the stat fields the fingerprint covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileStat {
    pub is_file: bool,
    pub is_dir: bool,
    pub is_block_device: bool,
    pub is_char_device: bool,
    pub is_fifo: bool,
    pub is_socket: bool,
    /// Permission and type bits (`st_mode`)
    pub mode: u32,
    pub size: u64,
    /// Modification time, milliseconds since Unix epoch
    pub modified_millis: i64,
}

impl FileStat {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        let modified_millis = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);

        #[cfg(unix)]
        let (is_block_device, is_char_device, is_fifo, is_socket, mode) = {
            use std::os::unix::fs::{FileTypeExt, MetadataExt};
            (
                file_type.is_block_device(),
                file_type.is_char_device(),
                file_type.is_fifo(),
                file_type.is_socket(),
                metadata.mode(),
            )
        };

        #[cfg(not(unix))]
        let (is_block_device, is_char_device, is_fifo, is_socket, mode) = {
            let mode = if metadata.permissions().readonly() { 0o444 } else { 0o666 };
            (false, false, false, false, mode)
        };

        Self {
            is_file: file_type.is_file(),
            is_dir: file_type.is_dir(),
            is_block_device,
            is_char_device,
            is_fifo,
            is_socket,
            mode,
            size: metadata.len(),
            modified_millis,
        }
    }

    /// Stat of a plain regular file with mode 0644.
    pub fn regular_file(size: u64, modified_millis: i64) -> Self {
        Self {
            is_file: true,
            is_dir: false,
            is_block_device: false,
            is_char_device: false,
            is_fifo: false,
            is_socket: false,
            mode: 0o100644,
            size,
            modified_millis,
        }
    }

    /// Stat of a directory with mode 0755.
    pub fn directory(modified_millis: i64) -> Self {
        Self {
            is_file: false,
            is_dir: true,
            mode: 0o040755,
            size: 0,
            ..Self::regular_file(0, modified_millis)
        }
    }
}

/// 32-byte blake3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Rebuild from stored bytes; `None` if the length is wrong.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Hash the ordered tuple (type flags, mode, size, mtime).
pub fn metadata_fingerprint(stat: &FileStat) -> Fingerprint {
    let flags = [
        stat.is_file,
        stat.is_dir,
        stat.is_block_device,
        stat.is_char_device,
        stat.is_fifo,
        stat.is_socket,
    ]
    .map(u8::from);

    let mut hasher = blake3::Hasher::new();
    hasher.update(&flags);
    hasher.update(&stat.mode.to_le_bytes());
    hasher.update(&stat.size.to_le_bytes());
    hasher.update(&stat.modified_millis.to_le_bytes());
    Fingerprint(*hasher.finalize().as_bytes())
}

/// Pre-filter hash of a subpath. Equal hashes do not imply equal subpaths.
pub fn subpath_fingerprint(subpath: &str) -> Fingerprint {
    Fingerprint(*blake3::hash(subpath.as_bytes()).as_bytes())
}
