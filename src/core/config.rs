//! Centralized configuration constants.
//!
//! All tunable parameters live here so they can be reviewed and adjusted in a
//! single place. Wire-format constants (magic bytes, command codes, field
//! sizes) stay in their respective codec modules.

use std::net::Ipv4Addr;
use std::time::Duration;

// ── Discovery ────────────────────────────────────────────────────────────────

/// Multicast group joined by every instance on the LAN.
pub const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 101, 10);

/// UDP port of the discovery protocol.
pub const DISCOVERY_PORT: u16 = 10101;

/// Interval between two beacon transmissions while Online.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(5);

/// Multicast TTL: discovery never leaves the local broadcast domain.
pub const BEACON_TTL: u32 = 1;

/// Consecutive beacon send failures tolerated before going Offline.
pub const BEACON_ERROR_THRESHOLD: u32 = 3;

// ── Peer registry ────────────────────────────────────────────────────────────

/// Interval between two aging ticks over the peer list.
pub const AGING_INTERVAL: Duration = Duration::from_secs(5);

/// Number of aging ticks without a beacon after which a peer expires.
pub const AGE_MAX: u8 = 4;

// ── Network entries ──────────────────────────────────────────────────────────

/// Interval between two scans of the local interface list.
pub const ENTRIES_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

// ── Icon transfer ────────────────────────────────────────────────────────────

/// Maximum size of an avatar image on the wire and on disk.
pub const ICON_MAX_SIZE_BYTES: u32 = 16 * 1024;

/// Expected avatar dimensions in pixels.
pub const ICON_SIZE_PX: u32 = 128;

/// Abort an icon request taking longer than this.
pub const ICON_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before the first icon fetch retry; doubled after each failure.
pub const ICON_INITIAL_RETRY: Duration = Duration::from_secs(15);

/// Retry delay cap (the upstream backoff is unbounded, a clamp keeps it sane).
pub const ICON_MAX_RETRY: Duration = Duration::from_secs(16 * 60);

// ── File transfer ────────────────────────────────────────────────────────────

/// Maximum payload of a single CHUNK command.
pub const MAX_CHUNK_SIZE: u32 = 8192;

/// Socket read-buffer cap used to exert flow control on the peer.
pub const MAX_BUFFER_SIZE: u64 = MAX_CHUNK_SIZE as u64 * 8;

/// Maximum length in characters of the textual messages attached to
/// sharing requests and responses.
pub const MAX_MSG_LEN: usize = 500;

// ── Picker ingress ───────────────────────────────────────────────────────────

/// Name of the local socket the picker sidecar connects to.
pub const PICKER_SOCKET_NAME: &str = "SYFPickerProtocol";

/// Per-connection timeout for the picker ingress.
pub const PICKER_TIMEOUT: Duration = Duration::from_secs(5);
