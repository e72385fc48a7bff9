//! Transfer-session plumbing shared by the sending and receiving side.
//!
//! Each session is owned by exactly one task for the lifetime of its socket:
//! the task sequentially drives the protocol state machine, and the outside
//! world interacts with it only through posted messages (a control channel
//! in, typed events out) plus the polled progress snapshot.
//!
//! Pause is modeled as an effective-state overlay: the base state never
//! holds a paused value, and a bit per cause (user, peer) decides whether
//! the observable state reads as paused. A user pause stops consuming from
//! the socket so kernel buffers exert back-pressure on the peer; a peer
//! pause only stops sending.

use crate::core::config::{MAX_BUFFER_SIZE, MAX_MSG_LEN};
use crate::core::events::{SessionEvent, SessionState};
use crate::core::transfer::files::{FileDescriptor, FileStatus};
use crate::core::transfer::progress::SharedProgress;
use crate::core::transfer::wire::{self, Command};
use anyhow::{anyhow, bail, Result};
use bytes::BufMut;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

static SESSION_COUNTER: AtomicU32 = AtomicU32::new(0);

// ── Control and handle ───────────────────────────────────────────────────────

/// Requests posted into a session task from outside.
#[derive(Debug, Clone, Copy)]
pub enum SessionControl {
    /// Enter or exit the user-requested pause mode.
    SetPaused(bool),
    /// Abort the session.
    Terminate,
}

/// External handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: u32,
    control: mpsc::UnboundedSender<SessionControl>,
    state: watch::Receiver<SessionState>,
    progress: SharedProgress,
    peer_uuid: Arc<Mutex<Uuid>>,
}

impl SessionHandle {
    /// The current effective state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A receiver to await state changes on.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// The peer UUID, nil while still unknown.
    pub fn peer_uuid(&self) -> Uuid {
        *self.peer_uuid.lock().expect("peer uuid mutex poisoned")
    }

    /// Snapshot of the transfer statistics.
    pub fn transfer_info(&self) -> crate::core::transfer::progress::TransferInfo {
        self.progress.snapshot()
    }

    /// Request entering or exiting pause mode.
    pub fn set_paused(&self, paused: bool) {
        let _ = self.control.send(SessionControl::SetPaused(paused));
    }

    /// Post an abort to the owning task. Idempotent.
    pub fn terminate(&self) {
        let _ = self.control.send(SessionControl::Terminate);
    }
}

// ── Session core ─────────────────────────────────────────────────────────────

/// The state shared by both protocol sides, owned by the session task.
pub(super) struct SessionCore {
    pub id: u32,
    pub local_uuid: Uuid,
    peer_uuid: Arc<Mutex<Uuid>>,

    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,

    base_state: SessionState,
    paused_by_user: bool,
    paused_by_peer: bool,
    /// While a decision is pending the user cannot toggle pause.
    user_toggle_inhibited: bool,

    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    control_rx: mpsc::UnboundedReceiver<SessionControl>,

    pub progress: SharedProgress,
    pub files: Vec<FileDescriptor>,
    pub base_path: PathBuf,
    current_file: Option<usize>,
}

/// The externally visible half of a session before its socket exists. The
/// sending side creates the shell first so the caller holds a handle while
/// the TCP connect is still in flight.
pub(super) struct SessionShell {
    pub id: u32,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    control_rx: mpsc::UnboundedReceiver<SessionControl>,
    progress: SharedProgress,
    peer_uuid: Arc<Mutex<Uuid>>,
}

impl SessionShell {
    pub fn new(
        peer_uuid: Uuid,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let (state_tx, state_rx) = watch::channel(SessionState::New);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let progress = SharedProgress::new();
        let shared_peer = Arc::new(Mutex::new(peer_uuid));

        let shell = Self {
            id,
            state_tx,
            events,
            control_rx,
            progress: progress.clone(),
            peer_uuid: Arc::clone(&shared_peer),
        };
        let handle = SessionHandle {
            id,
            control: control_tx,
            state: state_rx,
            progress,
            peer_uuid: shared_peer,
        };

        info!(event = "session_created", session = id, "Transfer session created");
        (shell, handle)
    }

    pub fn progress(&self) -> &SharedProgress {
        &self.progress
    }

    /// Publish a state before the socket exists (Connecting).
    pub fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
        let _ = self.events.send(SessionEvent::StatusChanged(state));
    }

    /// Wait for a termination request; pause toggles are meaningless before
    /// the connection exists and are ignored.
    pub async fn terminated(&mut self) {
        loop {
            match self.control_rx.recv().await {
                Some(SessionControl::Terminate) | None => return,
                Some(SessionControl::SetPaused(_)) => {}
            }
        }
    }

    /// Fail the session before a socket ever existed.
    pub fn fail(self, reason: &str) {
        error!(event = "session_aborted", session = self.id, reason = %reason, "Connection aborted");
        self.progress.skip_remaining();
        self.progress.finish();
        self.state_tx.send_replace(SessionState::Aborted);
        let _ = self.events.send(SessionEvent::StatusChanged(SessionState::Aborted));
        let _ = self.events.send(SessionEvent::Aborted);
    }
}

impl SessionCore {
    /// Wrap an established TCP connection. Sets keep-alive and caps the
    /// receive buffer so slow consumption exerts flow control on the peer.
    pub fn attach(shell: SessionShell, stream: TcpStream, local_uuid: Uuid) -> Self {
        let sock = socket2::SockRef::from(&stream);
        if let Err(e) = sock.set_keepalive(true) {
            warn!(event = "keepalive_failure", error = %e, "Failed enabling TCP keep-alive");
        }
        if let Err(e) = sock.set_recv_buffer_size(MAX_BUFFER_SIZE as usize) {
            warn!(event = "rcvbuf_failure", error = %e, "Failed capping the receive buffer");
        }

        let (read_half, write_half) = stream.into_split();
        let base_state = *shell.state_tx.borrow();

        Self {
            id: shell.id,
            local_uuid,
            peer_uuid: shell.peer_uuid,
            reader: BufReader::new(read_half),
            writer: write_half,
            base_state,
            paused_by_user: false,
            paused_by_peer: false,
            user_toggle_inhibited: false,
            state_tx: shell.state_tx,
            events: shell.events,
            control_rx: shell.control_rx,
            progress: shell.progress,
            files: Vec::new(),
            base_path: PathBuf::new(),
            current_file: None,
        }
    }

    pub fn peer_uuid(&self) -> Uuid {
        *self.peer_uuid.lock().expect("peer uuid mutex poisoned")
    }

    pub fn set_peer_uuid(&self, uuid: Uuid) {
        *self.peer_uuid.lock().expect("peer uuid mutex poisoned") = uuid;
    }

    // ── State management ─────────────────────────────────────────────────

    fn effective_state(&self) -> SessionState {
        if self.base_state.is_terminal() {
            return self.base_state;
        }
        if self.paused_by_user {
            SessionState::PausedByUser
        } else if self.paused_by_peer {
            SessionState::PausedByPeer
        } else {
            self.base_state
        }
    }

    fn publish_state(&self) {
        let state = self.effective_state();
        self.state_tx.send_replace(state);
        let _ = self.events.send(SessionEvent::StatusChanged(state));
    }

    /// Move the base state machine; emits `status_changed` after the state
    /// write is visible.
    pub fn set_base_state(&mut self, state: SessionState) {
        self.base_state = state;
        self.publish_state();
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn paused(&self) -> bool {
        self.paused_by_user || self.paused_by_peer
    }

    // ── Pause handling ───────────────────────────────────────────────────

    /// User-requested pause toggle: notifies the peer and stops consuming
    /// from the socket until the pause is lifted.
    async fn set_user_pause(&mut self, enter: bool) {
        if self.user_toggle_inhibited || self.paused_by_user == enter {
            return;
        }
        if !self.pausable() {
            return;
        }

        // Notify the peer; failures surface later on the data path.
        let _ = self.writer.write_u8(Command::Pause as u8).await;
        let _ = self.writer.flush().await;

        let was_paused = self.paused();
        self.paused_by_user = enter;
        self.sync_pause_timers(was_paused);
        self.publish_state();
    }

    /// Peer-sent PAUSE command: toggles the peer cause; only sending stops.
    pub fn toggle_peer_pause(&mut self) {
        if !self.pausable() {
            return;
        }
        let was_paused = self.paused();
        self.paused_by_peer = !self.paused_by_peer;
        self.sync_pause_timers(was_paused);
        self.publish_state();
    }

    /// Internal pause used while a user decision is pending: no PAUSE is
    /// sent, but no further data is read and the pause UI is inhibited.
    fn enter_decision_pause(&mut self) {
        let was_paused = self.paused();
        self.paused_by_user = true;
        self.user_toggle_inhibited = true;
        self.sync_pause_timers(was_paused);
        self.publish_state();
    }

    fn exit_decision_pause(&mut self) {
        self.user_toggle_inhibited = false;
        let was_paused = self.paused();
        self.paused_by_user = false;
        self.sync_pause_timers(was_paused);
        self.publish_state();
    }

    fn pausable(&self) -> bool {
        !matches!(
            self.base_state,
            SessionState::New | SessionState::Closing | SessionState::Closed | SessionState::Aborted
        )
    }

    fn sync_pause_timers(&self, was_paused: bool) {
        match (was_paused, self.paused()) {
            (false, true) => self.progress.pause(),
            (true, false) => self
                .progress
                .resume(self.base_state == SessionState::InTransfer),
            _ => {}
        }
    }

    /// The peer closed its end while the user held the session paused:
    /// treat it as unpause-then-close. The pause is lifted without sending
    /// PAUSE (nobody is listening), so the buffered bytes get drained and
    /// the close is processed through the normal paths.
    fn lift_pause_for_peer_close(&mut self) {
        info!(
            event = "peer_closed_while_paused",
            session = self.id,
            "Peer closed during user pause, resuming to drain the connection"
        );
        let was_paused = self.paused();
        self.paused_by_user = false;
        self.user_toggle_inhibited = false;
        self.sync_pause_timers(was_paused);
        self.publish_state();
    }

    // ── Control channel ──────────────────────────────────────────────────

    /// Apply one control message; `Terminate` (or a dropped handle) aborts.
    async fn handle_control(&mut self, control: Option<SessionControl>) -> Result<()> {
        match control {
            Some(SessionControl::SetPaused(paused)) => {
                self.set_user_pause(paused).await;
                Ok(())
            }
            Some(SessionControl::Terminate) | None => {
                bail!("session terminated by the user")
            }
        }
    }

    // ── Reading commands ─────────────────────────────────────────────────

    /// Wait for the next protocol command, transparently handling pause
    /// toggles, peer aborts and control messages. While the user holds the
    /// session paused the socket is not read, but a peer that closes its
    /// end is still detected and handled as unpause-then-close.
    pub async fn next_command(&mut self) -> Result<Command> {
        loop {
            if self.paused_by_user {
                tokio::select! {
                    control = self.control_rx.recv() => {
                        self.handle_control(control).await?;
                    }
                    _ = peer_closed(&mut self.reader) => {
                        self.lift_pause_for_peer_close();
                    }
                }
                continue;
            }

            tokio::select! {
                control = self.control_rx.recv() => {
                    self.handle_control(control).await?;
                }
                command = wire::read_command(&mut self.reader) => {
                    match command? {
                        Command::Pause => self.toggle_peer_pause(),
                        Command::Abort => bail!("ABORT requested by the peer"),
                        command => return Ok(command),
                    }
                }
            }
        }
    }

    /// Probe for an already-buffered command without blocking; used between
    /// chunk writes so a STOP or PAUSE from the peer is noticed promptly.
    pub async fn try_next_command(&mut self) -> Result<Option<Command>> {
        // Drain any pending control messages first.
        loop {
            match self.control_rx.try_recv() {
                Ok(control) => self.handle_control(Some(control)).await?,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.handle_control(None).await?;
                }
            }
        }

        match tokio::time::timeout(Duration::ZERO, wire::read_command(&mut self.reader)).await {
            Ok(command) => match command? {
                Command::Abort => bail!("ABORT requested by the peer"),
                command => Ok(Some(command)),
            },
            Err(_) => Ok(None),
        }
    }

    /// Block until every pause cause is lifted, processing control messages
    /// and peer PAUSE commands in the meantime.
    pub async fn wait_while_paused(&mut self) -> Result<()> {
        while self.paused() {
            if self.paused_by_user {
                tokio::select! {
                    control = self.control_rx.recv() => {
                        self.handle_control(control).await?;
                    }
                    _ = peer_closed(&mut self.reader) => {
                        self.lift_pause_for_peer_close();
                    }
                }
                continue;
            }

            // Paused by the peer: keep listening, only PAUSE may lift it.
            tokio::select! {
                control = self.control_rx.recv() => {
                    self.handle_control(control).await?;
                }
                command = wire::read_command(&mut self.reader) => {
                    match command? {
                        Command::Pause => self.toggle_peer_pause(),
                        Command::Abort => bail!("ABORT requested by the peer"),
                        other => bail!("unexpected {:?} command received while paused", other),
                    }
                }
            }
        }
        Ok(())
    }

    // ── Decision requests ────────────────────────────────────────────────

    /// Park the session while an external decision is resolved. Returns
    /// `None` if the decision sink was dropped without answering.
    pub async fn await_decision<T>(
        &mut self,
        reply: tokio::sync::oneshot::Receiver<T>,
    ) -> Result<Option<T>> {
        self.enter_decision_pause();

        let mut reply = reply;
        let decision = loop {
            tokio::select! {
                decision = &mut reply => break decision.ok(),
                control = self.control_rx.recv() => {
                    // The pause UI is inhibited; only termination goes
                    // through.
                    if matches!(control, Some(SessionControl::Terminate) | None) {
                        self.exit_decision_pause();
                        return Err(anyhow!("session terminated by the user"));
                    }
                }
            }
        };

        self.exit_decision_pause();
        Ok(decision)
    }

    // ── Writing ──────────────────────────────────────────────────────────

    /// Send a bare command byte.
    pub async fn send_command(&mut self, command: Command) -> Result<()> {
        self.writer.write_u8(command as u8).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a prebuilt frame.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        wire::write_frame(&mut self.writer, frame).await
    }

    /// Send a command followed by a clamped textual message.
    pub async fn send_command_with_message(
        &mut self,
        command: Command,
        message: &str,
    ) -> Result<()> {
        let clamped: String = message.chars().take(MAX_MSG_LEN).collect();
        let mut frame = bytes::BytesMut::with_capacity(5 + clamped.len());
        frame.put_u8(command as u8);
        wire::put_string(&mut frame, &clamped);
        self.send_frame(&frame).await
    }

    // ── File bookkeeping ─────────────────────────────────────────────────

    /// The descriptor currently in transfer.
    pub fn current_file(&self) -> Option<&FileDescriptor> {
        self.current_file.and_then(|idx| self.files.get(idx))
    }

    pub fn mark_current(&mut self, status: FileStatus) {
        if let Some(idx) = self.current_file {
            if let Some(file) = self.files.get_mut(idx) {
                file.status = status;
            }
        }
    }

    /// Replace the current descriptor (KeepBoth renames it).
    pub fn replace_current(&mut self, descriptor: FileDescriptor) {
        if let Some(idx) = self.current_file {
            if let Some(file) = self.files.get_mut(idx) {
                *file = descriptor;
            }
        }
    }

    /// Advance the file cursor. When every file has been processed, the
    /// session transitions to TransferCompleted and `false` is returned.
    pub fn move_to_next_file(&mut self) -> bool {
        let next = match self.current_file {
            None => 0,
            Some(idx) => idx + 1,
        };

        if next >= self.files.len() {
            self.current_file = None;
            self.progress.set_file_in_transfer(None);
            self.progress.finish();
            self.set_base_state(SessionState::TransferCompleted);
            info!(event = "transfer_completed", session = self.id, "Transfer completed");
            self.emit(SessionEvent::TransferCompleted);
            return false;
        }

        self.current_file = Some(next);
        self.progress
            .set_file_in_transfer(Some(self.files[next].relative_path.clone()));
        true
    }

    // ── Termination ──────────────────────────────────────────────────────

    /// Initiate the closing handshake: send CLOSE, await the peer's CLOSE
    /// (or its half-close) and settle in Closed.
    pub async fn close_connection(&mut self) -> Result<()> {
        if matches!(
            self.base_state,
            SessionState::Closing | SessionState::Closed | SessionState::Aborted
        ) {
            return Ok(());
        }

        self.set_base_state(SessionState::Closing);
        self.send_command(Command::Close).await?;

        loop {
            match wire::read_command(&mut self.reader).await {
                Ok(Command::Close) => break,
                Ok(Command::Pause) => continue,
                Ok(other) => bail!("unexpected {:?} command received while closing", other),
                // The peer may simply close its end after sending CLOSE.
                Err(_) => break,
            }
        }

        let _ = self.writer.shutdown().await;
        self.finish_closed();
        Ok(())
    }

    fn finish_closed(&mut self) {
        self.progress.finish();
        self.set_base_state(SessionState::Closed);
        info!(event = "session_closed", session = self.id, "Connection closed");
        self.emit(SessionEvent::Closed);
    }

    /// Abort the session: pre-empts any pending logic, best-effort notifies
    /// the peer and resets the socket. Idempotent.
    pub async fn abort(&mut self, reason: &str) {
        if matches!(
            self.base_state,
            SessionState::Closed | SessionState::Aborted
        ) {
            return;
        }

        error!(event = "session_aborted", session = self.id, reason = %reason, "Connection aborted");

        // The state flips first so no pending logic can run afterwards.
        self.base_state = SessionState::Aborted;

        self.mark_current(FileStatus::Failed);
        self.progress.set_file_in_transfer(None);
        self.progress.skip_remaining();
        self.progress.finish();

        // Best-effort ABORT notification (bounded, the peer may have
        // stopped reading), then reset the socket.
        let _ = tokio::time::timeout(Duration::from_millis(250), async {
            let _ = self.writer.write_u8(Command::Abort as u8).await;
            let _ = self.writer.flush().await;
        })
        .await;
        let sock = socket2::SockRef::from(self.writer.as_ref());
        let _ = sock.set_linger(Some(Duration::ZERO));

        self.publish_state();
        self.emit(SessionEvent::Aborted);
    }
}

/// Resolve only once the peer end is closed or reset, without consuming any
/// data. Used while a user pause keeps the socket unread, so a vanished
/// peer still unblocks the session. Data pending in the kernel hides a
/// graceful close behind it; it is re-checked at a slow cadence and stays
/// untouched until the pause is lifted.
async fn peer_closed(reader: &mut BufReader<OwnedReadHalf>) {
    let mut probe = [0u8; 1];
    loop {
        match reader.get_mut().peek(&mut probe).await {
            Ok(0) | Err(_) => return,
            Ok(_) => tokio::time::sleep(Duration::from_millis(200)).await,
        }
    }
}
