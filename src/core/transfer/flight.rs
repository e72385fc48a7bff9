//! Transactional access to the file currently in transfer.
//!
//! The reader flavor streams a source file in chunks and commits only if the
//! file was read completely and did not change underneath the transfer. The
//! writer flavor writes to a temporary sibling and renames it into place on
//! commit, so an aborted transfer never leaves a partial file at the
//! destination name. The exclusive creation of the temp file also guarantees
//! at most one concurrent write per destination path.

use crate::core::config::MAX_CHUNK_SIZE;
use crate::core::transfer::files::{mtime_millis, FileDescriptor};
use anyhow::{anyhow, bail, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, warn};

/// Check whether the source file still matches the advertised descriptor.
async fn source_unchanged(absolute: &Path, descriptor: &FileDescriptor) -> bool {
    match tokio::fs::metadata(absolute).await {
        Ok(meta) => {
            meta.is_file()
                && meta.len() == descriptor.size
                && meta.modified().map(mtime_millis).unwrap_or(0) == descriptor.last_modified_ms
        }
        Err(_) => false,
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// The sender-side file in flight.
#[derive(Debug)]
pub struct FileReader {
    descriptor: FileDescriptor,
    absolute_path: PathBuf,
    file: Option<File>,
    remaining_bytes: u64,
    transfer_started: bool,
    committed: bool,
    rolled_back: bool,
}

impl FileReader {
    /// Open the source file, verifying it still matches the descriptor.
    pub async fn open(base_path: &Path, descriptor: &FileDescriptor) -> Result<Self> {
        let absolute_path = base_path.join(&descriptor.relative_path);

        if !source_unchanged(&absolute_path, descriptor).await {
            bail!(
                "source file changed or unreadable: {}",
                absolute_path.display()
            );
        }

        let file = File::open(&absolute_path).await.map_err(|e| {
            error!(
                event = "file_open_failure",
                path = %absolute_path.display(),
                error = %e,
                "Failed opening file for reading"
            );
            anyhow!("failed opening {}: {}", absolute_path.display(), e)
        })?;

        Ok(Self {
            descriptor: descriptor.clone(),
            absolute_path,
            file: Some(file),
            remaining_bytes: descriptor.size,
            transfer_started: false,
            committed: false,
            rolled_back: false,
        })
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.remaining_bytes
    }

    pub fn transfer_started(&self) -> bool {
        self.transfer_started
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    /// Read the next chunk (up to `MAX_CHUNK_SIZE` bytes) from the file.
    pub async fn next_chunk(&mut self) -> Result<Vec<u8>> {
        self.transfer_started = true;

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("file not open"))?;
        if self.remaining_bytes == 0 {
            bail!("file already read completely");
        }

        let to_read = self.remaining_bytes.min(MAX_CHUNK_SIZE as u64) as usize;
        let mut buffer = vec![0u8; to_read];
        file.read_exact(&mut buffer).await.map_err(|e| {
            error!(
                event = "file_short_read",
                path = %self.absolute_path.display(),
                error = %e,
                "Short read from source file"
            );
            anyhow!("short read: {}", e)
        })?;

        self.remaining_bytes -= to_read as u64;
        Ok(buffer)
    }

    /// Verify the transfer can be committed: whole file read and the source
    /// unchanged since the descriptor was built.
    pub async fn commit(&mut self) -> bool {
        self.transfer_started = true;

        if self.committed {
            return true;
        }
        if self.rolled_back
            || self.remaining_bytes != 0
            || !source_unchanged(&self.absolute_path, &self.descriptor).await
        {
            self.rollback();
            return false;
        }

        self.file = None;
        self.committed = true;
        true
    }

    /// Abandon the transfer and close the file.
    pub fn rollback(&mut self) {
        if self.committed {
            return;
        }
        self.file = None;
        self.rolled_back = true;
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// The receiver-side file in flight: writes to `<dest>.part`, renamed into
/// place on commit.
#[derive(Debug)]
pub struct FileWriter {
    absolute_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    existed_before: bool,
    remaining_bytes: u64,
    transfer_started: bool,
    committed: bool,
    rolled_back: bool,
}

impl FileWriter {
    /// Create the destination directory and open the temporary file.
    pub async fn open(base_path: &Path, descriptor: &FileDescriptor) -> Result<Self> {
        let absolute_path = base_path.join(&descriptor.relative_path);
        let parent = absolute_path
            .parent()
            .ok_or_else(|| anyhow!("destination has no parent directory"))?;

        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            error!(
                event = "dest_dir_failure",
                path = %parent.display(),
                error = %e,
                "Failed creating destination directory"
            );
            anyhow!("failed creating {}: {}", parent.display(), e)
        })?;

        let existed_before = tokio::fs::try_exists(&absolute_path).await.unwrap_or(false);

        let mut name = absolute_path
            .file_name()
            .ok_or_else(|| anyhow!("destination has no file name"))?
            .to_os_string();
        name.push(".part");
        let temp_path = absolute_path.with_file_name(name);

        // create_new enforces at most one concurrent write per destination.
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|e| {
                error!(
                    event = "file_open_failure",
                    path = %temp_path.display(),
                    error = %e,
                    "Failed opening temporary file for writing"
                );
                anyhow!("failed opening {}: {}", temp_path.display(), e)
            })?;

        Ok(Self {
            absolute_path,
            temp_path,
            file: Some(file),
            existed_before,
            remaining_bytes: descriptor.size,
            transfer_started: false,
            committed: false,
            rolled_back: false,
        })
    }

    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    /// Whether a file already existed at the destination name when the
    /// writer was opened.
    pub fn exists(&self) -> bool {
        self.existed_before
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.remaining_bytes
    }

    pub fn rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// Write the next chunk of data to the temporary file.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.transfer_started = true;

        if self.rolled_back {
            bail!("writer already rolled back");
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("file not open"))?;
        if self.remaining_bytes < chunk.len() as u64 {
            bail!("more data received than advertised");
        }

        file.write_all(chunk).await.map_err(|e| {
            error!(
                event = "file_short_write",
                path = %self.temp_path.display(),
                error = %e,
                "Short write to temporary file"
            );
            anyhow!("short write: {}", e)
        })?;

        self.remaining_bytes -= chunk.len() as u64;
        Ok(())
    }

    /// Flush the temporary file and atomically rename it into place.
    pub async fn commit(&mut self) -> bool {
        self.transfer_started = true;

        if self.committed {
            return true;
        }
        if self.rolled_back || self.remaining_bytes != 0 {
            self.rollback().await;
            return false;
        }

        let Some(mut file) = self.file.take() else {
            self.rollback().await;
            return false;
        };
        if file.flush().await.is_err() || file.sync_all().await.is_err() {
            self.rollback().await;
            return false;
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&self.temp_path, &self.absolute_path).await {
            warn!(
                event = "file_commit_failure",
                from = %self.temp_path.display(),
                to = %self.absolute_path.display(),
                error = %e,
                "Failed renaming temporary file into place"
            );
            self.rollback().await;
            return false;
        }

        self.committed = true;
        true
    }

    /// Discard the written data and remove the temporary file.
    pub async fn rollback(&mut self) {
        if self.committed || self.rolled_back {
            return;
        }
        self.file = None;
        let _ = tokio::fs::remove_file(&self.temp_path).await;
        self.rolled_back = true;
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        // A writer dropped without commit leaves no partial file behind.
        if !self.committed && !self.rolled_back {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transfer::files::FileStatus;

    fn descriptor_for(path: &Path, relative: &str) -> FileDescriptor {
        let meta = std::fs::metadata(path).unwrap();
        FileDescriptor {
            relative_path: relative.to_string(),
            size: meta.len(),
            last_modified_ms: meta.modified().map(mtime_millis).unwrap_or(0),
            status: FileStatus::Scheduled,
        }
    }

    #[tokio::test]
    async fn test_reader_streams_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; (MAX_CHUNK_SIZE + 100) as usize];
        std::fs::write(dir.path().join("a.bin"), &data).unwrap();
        let descriptor = descriptor_for(&dir.path().join("a.bin"), "a.bin");

        let mut reader = FileReader::open(dir.path(), &descriptor).await.unwrap();
        let first = reader.next_chunk().await.unwrap();
        assert_eq!(first.len(), MAX_CHUNK_SIZE as usize);
        let second = reader.next_chunk().await.unwrap();
        assert_eq!(second.len(), 100);
        assert_eq!(reader.remaining_bytes(), 0);
        assert!(reader.commit().await);
    }

    #[tokio::test]
    async fn test_reader_commit_fails_if_source_changed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![1u8; 100]).unwrap();
        let descriptor = descriptor_for(&dir.path().join("a.bin"), "a.bin");

        let mut reader = FileReader::open(dir.path(), &descriptor).await.unwrap();
        while reader.remaining_bytes() > 0 {
            reader.next_chunk().await.unwrap();
        }

        // Tamper with the source after the data was read.
        std::fs::write(dir.path().join("a.bin"), vec![1u8; 150]).unwrap();
        assert!(!reader.commit().await);
    }

    #[tokio::test]
    async fn test_reader_open_fails_on_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"12345").unwrap();
        let mut descriptor = descriptor_for(&dir.path().join("a.bin"), "a.bin");
        descriptor.size += 1;

        assert!(FileReader::open(dir.path(), &descriptor).await.is_err());
    }

    #[tokio::test]
    async fn test_writer_commits_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("sub/out.bin".to_string(), 5, 0).unwrap();

        let mut writer = FileWriter::open(dir.path(), &descriptor).await.unwrap();
        assert!(!writer.exists());
        writer.write_chunk(b"12345").await.unwrap();

        let dest = dir.path().join("sub/out.bin");
        assert!(!dest.exists(), "destination must not exist before commit");
        assert!(writer.commit().await);
        assert_eq!(std::fs::read(&dest).unwrap(), b"12345");
    }

    #[tokio::test]
    async fn test_writer_rollback_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("out.bin".to_string(), 10, 0).unwrap();

        let mut writer = FileWriter::open(dir.path(), &descriptor).await.unwrap();
        writer.write_chunk(b"12345").await.unwrap();
        writer.rollback().await;

        assert!(!dir.path().join("out.bin").exists());
        assert!(!dir.path().join("out.bin.part").exists());
    }

    #[tokio::test]
    async fn test_writer_commit_fails_on_missing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("out.bin".to_string(), 10, 0).unwrap();

        let mut writer = FileWriter::open(dir.path(), &descriptor).await.unwrap();
        writer.write_chunk(b"12345").await.unwrap();
        assert!(!writer.commit().await);
        assert!(!dir.path().join("out.bin").exists());
    }

    #[tokio::test]
    async fn test_writer_zero_byte_file() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("empty".to_string(), 0, 0).unwrap();

        let mut writer = FileWriter::open(dir.path(), &descriptor).await.unwrap();
        assert!(writer.commit().await);
        assert_eq!(std::fs::metadata(dir.path().join("empty")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_writer_detects_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"old").unwrap();
        let descriptor = FileDescriptor::new("a.txt".to_string(), 3, 0).unwrap();

        let writer = FileWriter::open(dir.path(), &descriptor).await.unwrap();
        assert!(writer.exists());
        // Existing content untouched while the writer is open.
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_second_concurrent_writer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("a.txt".to_string(), 3, 0).unwrap();

        let _first = FileWriter::open(dir.path(), &descriptor).await.unwrap();
        assert!(FileWriter::open(dir.path(), &descriptor).await.is_err());
    }

    #[tokio::test]
    async fn test_writer_rejects_excess_data() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = FileDescriptor::new("a.txt".to_string(), 3, 0).unwrap();

        let mut writer = FileWriter::open(dir.path(), &descriptor).await.unwrap();
        assert!(writer.write_chunk(b"too much data").await.is_err());
    }
}
