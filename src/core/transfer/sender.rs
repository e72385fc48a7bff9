//! The sending side of the transfer protocol.
//!
//! A sender session connects to the peer's advertised port, performs the
//! HELLO/ACK handshake, advertises the file list and then streams each file,
//! honoring skips, rejections, rollbacks and the peer's STOP requests. Flow
//! control comes from awaiting the socket writes themselves: the kernel
//! send buffer (capped by the peer's receive window) pushes back.

use crate::core::events::{SessionEvent, SessionState};
use crate::core::transfer::files::{FileStatus, TransferList};
use crate::core::transfer::flight::FileReader;
use crate::core::transfer::session::{SessionCore, SessionHandle, SessionShell};
use crate::core::transfer::wire::{self, Command};
use anyhow::{bail, Result};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddrV4;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// How a streamed file ended.
enum FileOutcome {
    Committed,
    RolledBack { remaining: u64 },
}

/// Start an outgoing session towards `peer_addr`. The returned handle is
/// usable immediately; connection establishment happens in the session task.
pub fn spawn_sender(
    local_uuid: Uuid,
    peer_uuid: Uuid,
    peer_addr: SocketAddrV4,
    list: TransferList,
    message: String,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> SessionHandle {
    let (shell, handle) = SessionShell::new(peer_uuid, events);

    tokio::spawn(async move {
        run_session(shell, local_uuid, peer_uuid, peer_addr, list, message).await;
    });

    handle
}

async fn run_session(
    mut shell: SessionShell,
    local_uuid: Uuid,
    peer_uuid: Uuid,
    peer_addr: SocketAddrV4,
    list: TransferList,
    message: String,
) {
    info!(
        event = "session_connecting",
        session = shell.id,
        peer = %peer_uuid,
        address = %peer_addr,
        files = list.total_files(),
        total_bytes = list.total_bytes,
        "Connecting to peer"
    );
    shell.progress().set_totals(list.total_files(), list.total_bytes);
    shell.progress().start_elapsed();
    shell.set_state(SessionState::Connecting);

    let connected = tokio::select! {
        result = TcpStream::connect(peer_addr) => {
            result.map_err(|e| format!("connection failed: {}", e))
        }
        _ = shell.terminated() => Err("session terminated by the user".to_string()),
    };
    let stream = match connected {
        Ok(stream) => stream,
        Err(reason) => {
            shell.fail(&reason);
            return;
        }
    };

    let mut core = SessionCore::attach(shell, stream, local_uuid);
    core.files = list.files;
    core.base_path = list.base_path;

    let mut session = SenderSession {
        core,
        expected_peer: peer_uuid,
        message: wire::clamp_message(&message),
    };
    if let Err(e) = session.run().await {
        session.core.abort(&e.to_string()).await;
    }
}

struct SenderSession {
    core: SessionCore,
    expected_peer: Uuid,
    message: String,
}

impl SenderSession {
    async fn run(&mut self) -> Result<()> {
        self.handshake().await?;
        self.advertise_files().await?;

        // Await the peer's verdict on the sharing request.
        match self.core.next_command().await? {
            Command::Accept => {
                let message = wire::read_message(&mut self.core.reader).await?;
                info!(event = "share_accepted", session = self.core.id, "Sharing request accepted");
                self.core.progress.start_transfer();
                self.core.set_base_state(SessionState::InTransfer);
                self.core.emit(SessionEvent::PeerAccepted(message));
            }
            Command::Reject => {
                let message = wire::read_message(&mut self.core.reader).await?;
                info!(event = "share_rejected", session = self.core.id, "Sharing request rejected");
                self.core.progress.skip_remaining();
                self.core.set_base_state(SessionState::TransferCompleted);
                self.core.emit(SessionEvent::PeerRejected(message));
                return self.core.close_connection().await;
            }
            other => bail!("unexpected {:?} command received after the sharing request", other),
        }

        // Stream the files in order.
        while self.core.move_to_next_file() {
            self.transfer_current_file().await?;
        }
        self.core.close_connection().await
    }

    // ── Connection phase ─────────────────────────────────────────────────

    async fn handshake(&mut self) -> Result<()> {
        let mut hello = BytesMut::with_capacity(17);
        hello.put_u8(Command::Hello as u8);
        wire::put_uuid(&mut hello, &self.core.local_uuid);
        self.core.send_frame(&hello).await?;

        match self.core.next_command().await? {
            Command::Hello => {}
            other => bail!("unexpected {:?} command received during the handshake", other),
        }
        let replied = wire::read_uuid(&mut self.core.reader).await?;
        if replied != self.expected_peer {
            bail!("unexpected peer UUID received");
        }

        self.core.send_command(Command::Ack).await?;
        self.core.set_base_state(SessionState::Connected);
        info!(event = "session_connected", session = self.core.id, peer = %replied, "Connected to peer");
        self.core.emit(SessionEvent::Connected);
        Ok(())
    }

    /// Advertise the full file list: SHARE header, one ITEM per file, SHARE
    /// terminator.
    async fn advertise_files(&mut self) -> Result<()> {
        let info = self.core.progress.snapshot();

        let mut frame = BytesMut::new();
        frame.put_u8(Command::Share as u8);
        frame.put_u32_le(info.total_files);
        frame.put_u64_le(info.total_bytes);
        wire::put_string(&mut frame, &self.message);

        for file in &self.core.files {
            frame.put_u8(Command::Item as u8);
            file.encode(&mut frame);
        }
        frame.put_u8(Command::Share as u8);

        self.core.send_frame(&frame).await?;
        info!(event = "share_sent", session = self.core.id, files = info.total_files, "Sharing request sent");
        Ok(())
    }

    // ── Transfer phase ───────────────────────────────────────────────────

    async fn transfer_current_file(&mut self) -> Result<()> {
        let descriptor = self
            .core
            .current_file()
            .expect("transfer_current_file without a current file")
            .clone();

        // Open and re-verify the source; on failure the file is skipped.
        let reader = match FileReader::open(&self.core.base_path, &descriptor).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(
                    event = "file_skipped",
                    session = self.core.id,
                    file = %descriptor.relative_path,
                    error = %e,
                    "File transfer skipped"
                );
                self.core.send_command(Command::Skip).await?;
                // The receiver confirms the skip with a REJECT.
                match self.core.next_command().await? {
                    Command::Reject => {}
                    other => bail!("unexpected {:?} command received after SKIP", other),
                }
                self.core.mark_current(FileStatus::Failed);
                self.core.progress.add_skipped(1, descriptor.size);
                return Ok(());
            }
        };

        self.core.send_command(Command::Start).await?;
        info!(
            event = "file_started",
            session = self.core.id,
            file = %descriptor.relative_path,
            size = descriptor.size,
            "File transfer started"
        );

        match self.core.next_command().await? {
            Command::Accept => {
                self.core.mark_current(FileStatus::InTransfer);
                match self.stream_file(reader).await? {
                    FileOutcome::Committed => {
                        info!(
                            event = "file_committed",
                            session = self.core.id,
                            file = %descriptor.relative_path,
                            "File transfer committed"
                        );
                        self.core.mark_current(FileStatus::Transferred);
                        self.core.progress.add_transferred_file();
                    }
                    FileOutcome::RolledBack { remaining } => {
                        info!(
                            event = "file_rolled_back",
                            session = self.core.id,
                            file = %descriptor.relative_path,
                            "File transfer rolled back"
                        );
                        self.core.mark_current(FileStatus::Failed);
                        self.core.progress.add_skipped(1, remaining);
                    }
                }
            }
            Command::Reject => {
                info!(
                    event = "file_rejected",
                    session = self.core.id,
                    file = %descriptor.relative_path,
                    "File transfer rejected"
                );
                self.core.mark_current(FileStatus::Rejected);
                self.core.progress.add_skipped(1, descriptor.size);
            }
            other => bail!("unexpected {:?} command received after START", other),
        }
        Ok(())
    }

    /// Stream the chunks of one accepted file and drive the commit or
    /// rollback exchange. Returns how the file ended.
    async fn stream_file(&mut self, mut reader: FileReader) -> Result<FileOutcome> {
        loop {
            // Commands may arrive while data flows: STOP from a failing
            // receiver, PAUSE toggles, ABORT.
            while let Some(command) = self.core.try_next_command().await? {
                match command {
                    Command::Stop => {
                        if !reader.committed() {
                            reader.rollback();
                            self.core.send_command(Command::Rollback).await?;
                            return self.await_rollback_ack(&reader).await;
                        }
                    }
                    Command::Pause => self.core.toggle_peer_pause(),
                    other => bail!("unexpected {:?} command received during the transfer", other),
                }
            }

            if self.core.paused() {
                self.core.wait_while_paused().await?;
                continue;
            }

            // All bytes on the wire: try to commit on our side first.
            if reader.remaining_bytes() == 0 {
                return if reader.commit().await {
                    self.core.send_command(Command::Commit).await?;
                    self.await_commit_reply(&mut reader).await
                } else {
                    self.core.send_command(Command::Rollback).await?;
                    self.await_rollback_ack(&reader).await
                };
            }

            match reader.next_chunk().await {
                Ok(chunk) => {
                    let mut frame = BytesMut::with_capacity(5 + chunk.len());
                    frame.put_u8(Command::Chunk as u8);
                    frame.put_u32_le(chunk.len() as u32);
                    frame.put_slice(&chunk);
                    self.core.send_frame(&frame).await?;
                    self.core.progress.add_transferred_bytes(chunk.len() as u64);
                }
                Err(_) => {
                    reader.rollback();
                    self.core.send_command(Command::Rollback).await?;
                    return self.await_rollback_ack(&reader).await;
                }
            }
        }
    }

    /// After our COMMIT: the receiver answers COMMIT (done) or ROLLBK (its
    /// own commit failed).
    async fn await_commit_reply(&mut self, reader: &mut FileReader) -> Result<FileOutcome> {
        loop {
            match self.core.next_command().await? {
                Command::Commit => return Ok(FileOutcome::Committed),
                Command::Rollback => {
                    let remaining = reader.remaining_bytes();
                    reader.rollback();
                    return Ok(FileOutcome::RolledBack { remaining });
                }
                // A STOP that crossed our COMMIT on the wire is harmless.
                Command::Stop => {}
                other => bail!("unexpected {:?} command received after COMMIT", other),
            }
        }
    }

    /// After our ROLLBK: the receiver acknowledges with its own ROLLBK.
    async fn await_rollback_ack(&mut self, reader: &FileReader) -> Result<FileOutcome> {
        loop {
            match self.core.next_command().await? {
                Command::Rollback => {
                    return Ok(FileOutcome::RolledBack {
                        remaining: reader.remaining_bytes(),
                    })
                }
                // The receiver may have sent STOP before seeing our ROLLBK.
                Command::Stop => {}
                other => bail!("unexpected {:?} command received after ROLLBK", other),
            }
        }
    }
}
