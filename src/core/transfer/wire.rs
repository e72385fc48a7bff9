//! Binary framing for the file-transfer protocol.
//!
//! The protocol runs on top of TCP and is based on one-byte commands, each
//! optionally followed by a payload. All integers are little endian. Strings
//! travel as a 4-byte length followed by UTF-8 bytes; textual messages are
//! clamped to [`MAX_MSG_LEN`](crate::core::config::MAX_MSG_LEN) characters on
//! either end.

use crate::core::config::MAX_MSG_LEN;
use anyhow::{anyhow, bail, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Upper bound accepted for any length-prefixed string on the wire. Protects
/// against allocation bombs from malicious length fields.
const MAX_STRING_BYTES: u32 = 64 * 1024;

// ── Commands ─────────────────────────────────────────────────────────────────

/// The one-byte commands of the transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Aborts the connection.
    Abort = 0x00,
    /// Closes the connection.
    Close = 0x01,
    /// Starts the connection phase.
    Hello = 0x02,
    /// Completes the connection phase.
    Ack = 0x03,

    /// Starts and terminates the sharing request.
    Share = 0x10,
    /// Announces a new item of the file list.
    Item = 0x11,
    /// Starts a file transfer.
    Start = 0x12,
    /// Skips a file transfer.
    Skip = 0x13,
    /// Announces a new chunk of data.
    Chunk = 0x14,

    /// Accepts a transfer (session or file).
    Accept = 0x20,
    /// Rejects a transfer (session or file).
    Reject = 0x21,
    /// Commits a file transfer.
    Commit = 0x22,
    /// Rolls back a file transfer.
    Rollback = 0x23,
    /// Requests the peer to stop a file transfer.
    Stop = 0x24,

    /// Enters or exits pause mode.
    Pause = 0x30,
}

impl TryFrom<u8> for Command {
    type Error = anyhow::Error;

    fn try_from(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x00 => Command::Abort,
            0x01 => Command::Close,
            0x02 => Command::Hello,
            0x03 => Command::Ack,
            0x10 => Command::Share,
            0x11 => Command::Item,
            0x12 => Command::Start,
            0x13 => Command::Skip,
            0x14 => Command::Chunk,
            0x20 => Command::Accept,
            0x21 => Command::Reject,
            0x22 => Command::Commit,
            0x23 => Command::Rollback,
            0x24 => Command::Stop,
            0x30 => Command::Pause,
            other => bail!("unrecognized command byte 0x{:02x}", other),
        })
    }
}

// ── Write side ───────────────────────────────────────────────────────────────

/// Append a length-prefixed UTF-8 string to a frame buffer.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Append a raw UUID (RFC 4122 byte order) to a frame buffer.
pub fn put_uuid(buf: &mut BytesMut, uuid: &Uuid) {
    buf.put_slice(uuid.as_bytes());
}

/// Write a whole frame to the socket.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

// ── Read side ────────────────────────────────────────────────────────────────

/// Read the next command byte from the socket.
pub async fn read_command<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Command> {
    let byte = reader.read_u8().await?;
    Command::try_from(byte)
}

/// Read a length-prefixed UTF-8 string.
pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u32_le().await?;
    if len > MAX_STRING_BYTES {
        bail!("oversized string on the wire ({} bytes)", len);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| anyhow!("malformed UTF-8 string on the wire"))
}

/// Read a length-prefixed message, clamped to [`MAX_MSG_LEN`] characters.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    Ok(clamp_message(&read_string(reader).await?))
}

/// Read a raw UUID (RFC 4122 byte order).
pub async fn read_uuid<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Uuid> {
    let mut buf = [0u8; 16];
    reader.read_exact(&mut buf).await?;
    Ok(Uuid::from_bytes(buf))
}

/// Clamp a textual message to [`MAX_MSG_LEN`] characters.
pub fn clamp_message(message: &str) -> String {
    message.chars().take(MAX_MSG_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello wörld");

        let mut reader = &buf[..];
        assert_eq!(read_string(&mut reader).await.unwrap(), "hello wörld");
    }

    #[tokio::test]
    async fn test_uuid_round_trip() {
        let uuid = Uuid::new_v4();
        let mut buf = BytesMut::new();
        put_uuid(&mut buf, &uuid);

        let mut reader = &buf[..];
        assert_eq!(read_uuid(&mut reader).await.unwrap(), uuid);
    }

    #[tokio::test]
    async fn test_oversized_string_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(MAX_STRING_BYTES + 1);

        let mut reader = &buf[..];
        assert!(read_string(&mut reader).await.is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Command::try_from(0x15).is_err());
        assert!(Command::try_from(0xff).is_err());
        assert_eq!(Command::try_from(0x30).unwrap(), Command::Pause);
    }

    #[test]
    fn test_clamp_message() {
        let long: String = "x".repeat(600);
        assert_eq!(clamp_message(&long).chars().count(), MAX_MSG_LEN);
        assert_eq!(clamp_message("short"), "short");
    }
}
