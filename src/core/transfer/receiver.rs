//! The receiving side of the transfer protocol.
//!
//! A receiver session is born from an accepted TCP connection. It answers
//! the HELLO handshake, collects the advertised file list, resolves the
//! sharing decision through the orchestrator (which applies the reception
//! policy or asks the user) and then receives each file into a transactional
//! writer. Name conflicts at the destination are resolved per file through
//! the duplicate-file decision channel.

use crate::core::config::MAX_CHUNK_SIZE;
use crate::core::events::{
    DuplicateFile, DuplicateFileAction, DuplicateFileDecisionSink, SessionEvent, SessionState,
    SharingDecision, SharingDecisionSink, SharingRequest,
};
use crate::core::transfer::files::{FileDescriptor, FileStatus};
use crate::core::transfer::flight::FileWriter;
use crate::core::transfer::session::{SessionCore, SessionHandle, SessionShell};
use crate::core::transfer::wire::{self, Command};
use anyhow::{bail, Result};
use bytes::BufMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

/// Start a session for an accepted inbound connection.
pub fn spawn_receiver(
    stream: TcpStream,
    local_uuid: Uuid,
    sharing_sink: SharingDecisionSink,
    duplicate_sink: DuplicateFileDecisionSink,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> SessionHandle {
    let (shell, handle) = SessionShell::new(Uuid::nil(), events);

    tokio::spawn(async move {
        shell.progress().start_elapsed();
        shell.set_state(SessionState::Connecting);

        let core = SessionCore::attach(shell, stream, local_uuid);
        let mut session = ReceiverSession {
            core,
            sharing_sink,
            duplicate_sink,
            default_duplicate_action: None,
        };
        if let Err(e) = session.run().await {
            session.core.abort(&e.to_string()).await;
        }
    });

    handle
}

struct ReceiverSession {
    core: SessionCore,
    sharing_sink: SharingDecisionSink,
    duplicate_sink: DuplicateFileDecisionSink,
    /// Once the user picks "apply to all", conflicts resolve silently.
    default_duplicate_action: Option<DuplicateFileAction>,
}

impl ReceiverSession {
    async fn run(&mut self) -> Result<()> {
        self.handshake().await?;
        let message = self.receive_file_list().await?;

        if !self.resolve_sharing_request(message).await? {
            // Rejected: the books are closed and the connection winds down.
            return self.core.close_connection().await;
        }

        while self.core.move_to_next_file() {
            self.receive_current_file().await?;
        }
        self.core.close_connection().await
    }

    // ── Connection phase ─────────────────────────────────────────────────

    async fn handshake(&mut self) -> Result<()> {
        match self.core.next_command().await? {
            Command::Hello => {}
            other => bail!("unexpected {:?} command received during the handshake", other),
        }
        let peer_uuid = wire::read_uuid(&mut self.core.reader).await?;
        // A nil UUID is a deliberately anonymous (offline) initiator.
        self.core.set_peer_uuid(peer_uuid);

        let mut reply = bytes::BytesMut::with_capacity(17);
        reply.put_u8(Command::Hello as u8);
        wire::put_uuid(&mut reply, &self.core.local_uuid);
        self.core.send_frame(&reply).await?;

        match self.core.next_command().await? {
            Command::Ack => {}
            other => bail!("unexpected {:?} command received during the handshake", other),
        }

        self.core.set_base_state(SessionState::Connected);
        info!(event = "session_connected", session = self.core.id, peer = %peer_uuid, "Connected to peer");
        self.core.emit(SessionEvent::Connected);
        Ok(())
    }

    /// Read the SHARE header, the ITEM list and the terminating SHARE,
    /// validating counts and sizes.
    async fn receive_file_list(&mut self) -> Result<String> {
        match self.core.next_command().await? {
            Command::Share => {}
            other => bail!("unexpected {:?} command received before the sharing request", other),
        }

        let total_files = self.core.reader.read_u32_le().await?;
        let total_bytes = self.core.reader.read_u64_le().await?;
        let message = wire::read_message(&mut self.core.reader).await?;

        if total_files >= i32::MAX as u32 {
            bail!("too many files requested for transfer");
        }
        self.core.progress.set_totals(total_files, total_bytes);

        while (self.core.files.len() as u32) < total_files {
            match self.core.next_command().await? {
                Command::Item => {
                    let descriptor = FileDescriptor::decode(&mut self.core.reader).await?;
                    self.core.files.push(descriptor);
                }
                other => bail!("unexpected {:?} command received in the file list", other),
            }
        }

        match self.core.next_command().await? {
            Command::Share => {}
            other => bail!("unexpected {:?} command received at the end of the file list", other),
        }

        let advertised: u64 = self.core.files.iter().map(|f| f.size).sum();
        if advertised != total_bytes {
            bail!("file list does not match the advertised total size");
        }

        info!(
            event = "share_received",
            session = self.core.id,
            files = total_files,
            total_bytes,
            "Sharing request received"
        );
        Ok(message)
    }

    /// Route the sharing request through the orchestrator and act on the
    /// decision. Returns whether the transfer was accepted.
    async fn resolve_sharing_request(&mut self, message: String) -> Result<bool> {
        let info = self.core.progress.snapshot();
        let request = SharingRequest {
            peer_uuid: self.core.peer_uuid(),
            peer_name: String::new(),
            total_files: info.total_files,
            total_bytes: info.total_bytes,
            files: self.core.files.clone(),
            message,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let decision = if self.sharing_sink.send((request, reply_tx)).await.is_ok() {
            self.core.await_decision(reply_rx).await?
        } else {
            None
        };

        // A dropped decision channel rejects.
        let decision = decision.unwrap_or(SharingDecision::Reject {
            message: String::new(),
        });

        match decision {
            SharingDecision::Accept { path, message } => {
                tokio::fs::create_dir_all(&path).await.map_err(|e| {
                    anyhow::anyhow!("invalid base path {}: {}", path.display(), e)
                })?;
                if tokio::fs::read_dir(&path).await.is_err() {
                    bail!("base path {} is not readable", path.display());
                }
                self.core.base_path = path;

                self.core
                    .send_command_with_message(Command::Accept, &message)
                    .await?;
                info!(event = "share_accepted", session = self.core.id, base = %self.core.base_path.display(), "Sharing request accepted");
                self.core.progress.start_transfer();
                self.core.set_base_state(SessionState::InTransfer);
                Ok(true)
            }
            SharingDecision::Reject { message } => {
                self.core
                    .send_command_with_message(Command::Reject, &message)
                    .await?;
                info!(event = "share_rejected", session = self.core.id, "Sharing request rejected");
                self.core.progress.skip_remaining();
                Ok(false)
            }
        }
    }

    // ── Transfer phase ───────────────────────────────────────────────────

    async fn receive_current_file(&mut self) -> Result<()> {
        match self.core.next_command().await? {
            Command::Start => {
                if let Some(writer) = self.start_file().await? {
                    self.receive_chunks(writer).await?;
                }
                Ok(())
            }
            Command::Skip => {
                let descriptor = self
                    .core
                    .current_file()
                    .expect("SKIP without a current file")
                    .clone();
                info!(
                    event = "file_skipped",
                    session = self.core.id,
                    file = %descriptor.relative_path,
                    "File transfer skipped by the sender"
                );
                // Confirm the skip with a REJECT.
                self.core.send_command(Command::Reject).await?;
                self.core.mark_current(FileStatus::Failed);
                self.core.progress.add_skipped(1, descriptor.size);
                Ok(())
            }
            other => bail!("unexpected {:?} command received between files", other),
        }
    }

    /// Open the destination writer, resolving name conflicts. Returns the
    /// writer when the file transfer was accepted.
    async fn start_file(&mut self) -> Result<Option<FileWriter>> {
        let descriptor = self
            .core
            .current_file()
            .expect("START without a current file")
            .clone();

        let writer = match FileWriter::open(&self.core.base_path, &descriptor).await {
            Ok(writer) => writer,
            Err(e) => {
                warn!(
                    event = "file_rejected",
                    session = self.core.id,
                    file = %descriptor.relative_path,
                    error = %e,
                    "File transfer rejected"
                );
                self.reject_file(descriptor.size).await?;
                return Ok(None);
            }
        };

        if !writer.exists() {
            self.accept_file(&descriptor).await?;
            return Ok(Some(writer));
        }

        info!(
            event = "duplicate_file",
            session = self.core.id,
            file = %descriptor.relative_path,
            "Detected a file with the same name"
        );

        let action = match self.default_duplicate_action {
            Some(action) => action,
            None => {
                let conflict = DuplicateFile {
                    peer_uuid: self.core.peer_uuid(),
                    relative_path: descriptor.relative_path.clone(),
                    existing_path: writer.absolute_path().to_path_buf(),
                    incoming_size: descriptor.size,
                    incoming_last_modified_ms: descriptor.last_modified_ms,
                };

                let (reply_tx, reply_rx) = oneshot::channel();
                let decision = if self.duplicate_sink.send((conflict, reply_tx)).await.is_ok() {
                    self.core.await_decision(reply_rx).await?
                } else {
                    None
                };

                match decision {
                    Some(decision) => {
                        if decision.apply_to_all {
                            self.default_duplicate_action = Some(decision.action);
                        }
                        decision.action
                    }
                    // A dropped decision channel keeps the existing file.
                    None => DuplicateFileAction::Keep,
                }
            }
        };

        self.perform_duplicate_action(action, writer, descriptor).await
    }

    async fn perform_duplicate_action(
        &mut self,
        action: DuplicateFileAction,
        mut writer: FileWriter,
        descriptor: FileDescriptor,
    ) -> Result<Option<FileWriter>> {
        match action {
            DuplicateFileAction::Replace => {
                self.accept_file(&descriptor).await?;
                Ok(Some(writer))
            }
            DuplicateFileAction::Keep => {
                writer.rollback().await;
                self.reject_file(descriptor.size).await?;
                Ok(None)
            }
            DuplicateFileAction::KeepBoth => {
                writer.rollback().await;

                let mut counter: u8 = 1;
                loop {
                    let renamed = FileDescriptor {
                        relative_path: suffixed_path(&descriptor.relative_path, counter),
                        ..descriptor.clone()
                    };

                    let mut candidate = match FileWriter::open(&self.core.base_path, &renamed).await
                    {
                        Ok(candidate) => candidate,
                        Err(_) => break,
                    };
                    if !candidate.exists() {
                        self.core.replace_current(renamed.clone());
                        self.core
                            .progress
                            .set_file_in_transfer(Some(renamed.relative_path.clone()));
                        self.accept_file(&renamed).await?;
                        return Ok(Some(candidate));
                    }

                    candidate.rollback().await;
                    counter = match counter.checked_add(1) {
                        Some(counter) => counter,
                        None => break,
                    };
                }

                warn!(
                    event = "rename_failure",
                    session = self.core.id,
                    file = %descriptor.relative_path,
                    "Failed renaming the duplicated file"
                );
                self.reject_file(descriptor.size).await?;
                Ok(None)
            }
        }
    }

    async fn accept_file(&mut self, descriptor: &FileDescriptor) -> Result<()> {
        info!(
            event = "file_accepted",
            session = self.core.id,
            file = %descriptor.relative_path,
            "File transfer accepted"
        );
        self.core.send_command(Command::Accept).await?;
        self.core.mark_current(FileStatus::InTransfer);
        Ok(())
    }

    async fn reject_file(&mut self, size: u64) -> Result<()> {
        self.core.send_command(Command::Reject).await?;
        self.core.mark_current(FileStatus::Rejected);
        self.core.progress.add_skipped(1, size);
        Ok(())
    }

    /// The chunk loop of one accepted file: CHUNK writes until the sender's
    /// COMMIT or ROLLBK resolves the file.
    async fn receive_chunks(&mut self, mut writer: FileWriter) -> Result<()> {
        loop {
            match self.core.next_command().await? {
                Command::Chunk => {
                    let length = self.core.reader.read_u32_le().await?;
                    if length > MAX_CHUNK_SIZE {
                        bail!("oversized file chunk detected ({} bytes)", length);
                    }
                    let mut chunk = vec![0u8; length as usize];
                    self.core.reader.read_exact(&mut chunk).await?;

                    // After a local write failure the remaining chunks are
                    // drained quietly; the STOP already asked the sender to
                    // roll back.
                    if writer.rolled_back() {
                        continue;
                    }

                    match writer.write_chunk(&chunk).await {
                        Ok(()) => {
                            self.core.progress.add_transferred_bytes(length as u64);
                        }
                        Err(e) => {
                            warn!(
                                event = "file_write_failure",
                                session = self.core.id,
                                error = %e,
                                "Write failed, asking the sender to stop"
                            );
                            writer.rollback().await;
                            self.core.send_command(Command::Stop).await?;
                        }
                    }
                }
                Command::Commit => {
                    let remaining = writer.remaining_bytes();
                    if writer.commit().await {
                        info!(
                            event = "file_committed",
                            session = self.core.id,
                            file = %writer.absolute_path().display(),
                            "File transfer committed"
                        );
                        self.core.send_command(Command::Commit).await?;
                        self.core.mark_current(FileStatus::Transferred);
                        self.core.progress.add_transferred_file();
                    } else {
                        info!(
                            event = "file_rolled_back",
                            session = self.core.id,
                            file = %writer.absolute_path().display(),
                            "File transfer rolled back"
                        );
                        self.core.send_command(Command::Rollback).await?;
                        self.core.mark_current(FileStatus::Failed);
                        self.core.progress.add_skipped(1, remaining);
                    }
                    return Ok(());
                }
                Command::Rollback => {
                    let remaining = writer.remaining_bytes();
                    writer.rollback().await;
                    info!(
                        event = "file_rolled_back",
                        session = self.core.id,
                        file = %writer.absolute_path().display(),
                        "File transfer rolled back"
                    );
                    self.core.send_command(Command::Rollback).await?;
                    self.core.mark_current(FileStatus::Failed);
                    self.core.progress.add_skipped(1, remaining);
                    return Ok(());
                }
                other => bail!("unexpected {:?} command received during the transfer", other),
            }
        }
    }
}

/// Insert `_N` between the basename and its extension. The stem is the part
/// before the first dot, so composite extensions survive; a dotfile has an
/// empty stem and keeps its leading dot.
fn suffixed_path(relative: &str, counter: u8) -> String {
    let (parent, name) = match relative.rfind('/') {
        Some(idx) => (&relative[..=idx], &relative[idx + 1..]),
        None => ("", relative),
    };

    let renamed = match name.find('.') {
        Some(0) => format!(".{}_{}", &name[1..], counter),
        Some(idx) => format!("{}_{}.{}", &name[..idx], counter, &name[idx + 1..]),
        None => format!("{}_{}", name, counter),
    };
    format!("{}{}", parent, renamed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixed_path_plain() {
        assert_eq!(suffixed_path("a.txt", 1), "a_1.txt");
        assert_eq!(suffixed_path("a.txt", 7), "a_7.txt");
    }

    #[test]
    fn test_suffixed_path_composite_extension() {
        assert_eq!(suffixed_path("archive.tar.gz", 2), "archive_2.tar.gz");
    }

    #[test]
    fn test_suffixed_path_no_extension() {
        assert_eq!(suffixed_path("README", 1), "README_1");
    }

    #[test]
    fn test_suffixed_path_dotfile() {
        assert_eq!(suffixed_path(".bashrc", 1), ".bashrc_1");
    }

    #[test]
    fn test_suffixed_path_nested() {
        assert_eq!(suffixed_path("dir/sub/a.txt", 3), "dir/sub/a_3.txt");
    }
}
