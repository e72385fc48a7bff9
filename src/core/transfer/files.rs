//! File descriptors and outbound transfer lists.
//!
//! A [`FileDescriptor`] identifies one file of a transfer by its path
//! relative to the session base directory, together with its size and last
//! modification time. Path validity is enforced both when building a list
//! from picker input and when decoding descriptors from the wire, so no
//! descriptor can ever escape the base directory.

use anyhow::{anyhow, bail, Result};
use bytes::{BufMut, BytesMut};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{error, warn};

use super::wire;

// ── File status ──────────────────────────────────────────────────────────────

/// Lifecycle of a single file within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Scheduled for transfer, not yet touched.
    Scheduled,
    /// Data is currently flowing.
    InTransfer,
    /// Committed on both sides.
    Transferred,
    /// Refused before any data was transferred.
    Rejected,
    /// Failed or rolled back.
    Failed,
}

// ── File descriptor ──────────────────────────────────────────────────────────

/// One file scheduled for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Path relative to the session base directory, in normalized form.
    pub relative_path: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time, milliseconds since the Unix epoch.
    pub last_modified_ms: u64,
    /// Current transfer status.
    pub status: FileStatus,
}

impl FileDescriptor {
    /// Build a descriptor, validating the relative path.
    pub fn new(relative_path: String, size: u64, last_modified_ms: u64) -> Result<Self> {
        if !is_valid_relative_path(&relative_path) {
            bail!("invalid relative path: {:?}", relative_path);
        }
        Ok(Self {
            relative_path,
            size,
            last_modified_ms,
            status: FileStatus::Scheduled,
        })
    }

    /// The final path component (never empty for a valid descriptor).
    pub fn name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }

    /// The directory part of the relative path (empty for top-level files).
    pub fn parent(&self) -> &str {
        match self.relative_path.rfind('/') {
            Some(idx) => &self.relative_path[..idx],
            None => "",
        }
    }

    /// Append the wire representation to a frame buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        wire::put_string(buf, &self.relative_path);
        buf.put_u64_le(self.size);
        buf.put_u64_le(self.last_modified_ms);
    }

    /// Decode a descriptor from the wire, enforcing path validity.
    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let relative_path = wire::read_string(reader).await?;
        let size = reader.read_u64_le().await?;
        let last_modified_ms = reader.read_u64_le().await?;
        Self::new(relative_path, size, last_modified_ms)
    }
}

/// Validate a relative path received from the picker or from the wire.
///
/// Accepted paths are relative, already in normalized form (no `.` or `..`
/// components, no empty components, no trailing separator) and end in a
/// non-empty file name.
pub fn is_valid_relative_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    if !Path::new(path).is_relative() {
        return false;
    }
    path.split('/').all(|c| !c.is_empty() && c != "." && c != "..")
}

/// Convert a filesystem modification time to wire milliseconds.
pub fn mtime_millis(mtime: SystemTime) -> u64 {
    mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Transfer list ────────────────────────────────────────────────────────────

/// The outbound intent: a base directory plus an ordered list of files.
#[derive(Debug, Clone, Default)]
pub struct TransferList {
    /// Absolute directory the relative paths are resolved against.
    pub base_path: PathBuf,
    /// Files in transfer order.
    pub files: Vec<FileDescriptor>,
    /// Sum of all file sizes.
    pub total_bytes: u64,
}

impl TransferList {
    /// Build a transfer list from a set of absolute paths, all required to
    /// live in the same parent directory. Directories are walked
    /// recursively; symbolic links are skipped with a warning.
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut list = TransferList::default();
        if paths.is_empty() {
            return Ok(list);
        }

        let mut items = Vec::new();
        for path in paths {
            let Some(name) = path.file_name() else {
                warn!(event = "transfer_list_invalid_path", path = %path.display(), "Skipped invalid path");
                continue;
            };
            if !path.is_absolute() {
                warn!(event = "transfer_list_invalid_path", path = %path.display(), "Skipped non-absolute path");
                continue;
            }
            let parent = path
                .parent()
                .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;

            if list.base_path.as_os_str().is_empty() {
                list.base_path = parent.to_path_buf();
            } else if list.base_path != parent {
                bail!("files or directories with different base paths detected");
            }
            items.push(name.to_os_string());
        }

        for item in items {
            let absolute = list.base_path.join(&item);
            list.add_entry(&absolute)?;
        }
        Ok(list)
    }

    pub fn total_files(&self) -> u32 {
        self.files.len() as u32
    }

    /// Recursively add a file or directory to the list.
    fn add_entry(&mut self, absolute: &Path) -> Result<()> {
        let metadata = match std::fs::symlink_metadata(absolute) {
            Ok(m) => m,
            Err(e) => {
                error!(
                    event = "transfer_list_unreadable",
                    path = %absolute.display(),
                    error = %e,
                    "File or directory does not exist or is not readable"
                );
                return Ok(());
            }
        };

        if metadata.file_type().is_symlink() {
            warn!(
                event = "transfer_list_symlink_skipped",
                path = %absolute.display(),
                "Symbolic link detected but not supported"
            );
            return Ok(());
        }

        if metadata.is_file() {
            let relative = absolute
                .strip_prefix(&self.base_path)
                .map_err(|_| anyhow!("entry escapes base path: {}", absolute.display()))?;
            let relative = relative
                .to_str()
                .ok_or_else(|| anyhow!("non UTF-8 path: {}", absolute.display()))?
                .replace('\\', "/");

            let mtime = metadata.modified().map(mtime_millis).unwrap_or(0);
            match FileDescriptor::new(relative, metadata.len(), mtime) {
                Ok(descriptor) => {
                    self.total_bytes += descriptor.size;
                    self.files.push(descriptor);
                }
                Err(e) => {
                    error!(
                        event = "transfer_list_invalid_file",
                        path = %absolute.display(),
                        error = %e,
                        "Skipped invalid file"
                    );
                }
            }
            return Ok(());
        }

        if metadata.is_dir() {
            let mut children: Vec<PathBuf> = std::fs::read_dir(absolute)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .collect();
            children.sort();
            for child in children {
                self.add_entry(&child)?;
            }
        }
        Ok(())
    }
}
