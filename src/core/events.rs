//! Typed events and decision channels.
//!
//! The core never calls into the UI layer directly: every observable fact is
//! a dedicated typed message on a channel, and every question the core needs
//! answered travels as a request paired with a one-shot reply sender. A
//! dropped reply sender resolves to the documented default (reject the
//! sharing request, keep the existing file).

use crate::core::network_entries::NetworkEntry;
use crate::core::transfer::files::FileDescriptor;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

// ── Core events ──────────────────────────────────────────────────────────────

/// Events emitted by the core for the UI layer.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    PeerAdded(Uuid),
    PeerUpdated(Uuid),
    PeerExpired(Uuid),
    /// A peer advertises the same first and last name as the local user.
    DuplicateNameDetected(Uuid),
    /// The picker sidecar handed over a list of absolute paths.
    PathsReceived(Vec<PathBuf>),
    /// The network entry in use changed; `None` means forced offline.
    NetworkEntryChanged(Option<NetworkEntry>),
    /// The discovery protocol hit its consecutive send-error threshold.
    DiscoveryError,
}

// ── Session events ───────────────────────────────────────────────────────────

/// Effective state of a transfer session, as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    InTransfer,
    TransferCompleted,
    Closing,
    Closed,
    Aborted,
    PausedByUser,
    PausedByPeer,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted)
    }
}

/// Events emitted by one transfer session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged(SessionState),
    Connected,
    TransferCompleted,
    Closed,
    Aborted,
    /// The peer accepted the sharing request, with an optional message.
    PeerAccepted(String),
    /// The peer rejected the sharing request, with an optional message.
    PeerRejected(String),
}

// ── Sharing decisions ────────────────────────────────────────────────────────

/// An inbound sharing request awaiting a decision.
#[derive(Debug, Clone)]
pub struct SharingRequest {
    pub peer_uuid: Uuid,
    pub peer_name: String,
    pub total_files: u32,
    pub total_bytes: u64,
    pub files: Vec<FileDescriptor>,
    pub message: String,
}

/// The answer to a sharing request.
#[derive(Debug, Clone)]
pub enum SharingDecision {
    Accept {
        /// Absolute base path the received files are realized under.
        path: PathBuf,
        message: String,
    },
    Reject {
        message: String,
    },
}

/// Channel the core sends sharing requests into; the receiving side (UI)
/// answers through the paired one-shot. Dropping the reply sender rejects.
pub type SharingDecisionSink = mpsc::Sender<(SharingRequest, oneshot::Sender<SharingDecision>)>;

// ── Duplicate-file decisions ─────────────────────────────────────────────────

/// A destination-name conflict awaiting a decision.
#[derive(Debug, Clone)]
pub struct DuplicateFile {
    pub peer_uuid: Uuid,
    /// Relative path of the incoming file.
    pub relative_path: String,
    /// Absolute path of the file already on disk.
    pub existing_path: PathBuf,
    pub incoming_size: u64,
    pub incoming_last_modified_ms: u64,
}

/// What to do with a duplicated file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateFileAction {
    /// Overwrite the existing file.
    Replace,
    /// Keep the existing file and reject the incoming one.
    Keep,
    /// Keep both, storing the incoming file under a suffixed name.
    KeepBoth,
}

/// The answer to a duplicate-file conflict.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateFileDecision {
    pub action: DuplicateFileAction,
    /// Apply the same action to every further conflict of this session.
    pub apply_to_all: bool,
}

/// Channel the core sends duplicate-file conflicts into. Dropping the reply
/// sender keeps the existing file.
pub type DuplicateFileDecisionSink =
    mpsc::Sender<(DuplicateFile, oneshot::Sender<DuplicateFileDecision>)>;
