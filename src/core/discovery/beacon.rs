//! The discovery beacon wire format.
//!
//! Each instance periodically multicasts a self-describing datagram:
//!
//! ```text
//! | 'S' 'Y' 'F' 'D' | version | flags | UUID (16 bytes) |
//! | first name: u32 byte length + UTF-16LE data (≤ 16 chars) |
//! | last name:  u32 byte length + UTF-16LE data (≤ 16 chars) |
//! | IPv4 (u32) | data port (u16) | icon port (u16) |
//! | icon SHA-1 hash (20 bytes, only when the icon flag is set) |
//! ```
//!
//! All integers are little endian. Datagrams outside the `MIN_SIZE..=MAX_SIZE`
//! range, with a wrong magic or version, or with reserved flag bits set are
//! rejected.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Magic string opening every beacon.
pub const MAGIC: [u8; 4] = *b"SYFD";

/// Current beacon format version.
pub const VERSION: u8 = 1;

/// Maximum length of the first and last name, counted in UTF-16 code units
/// (the unit the wire encoding is made of, so an astral character costs
/// two).
pub const NAME_MAX_CHARS: usize = 16;

/// Length of the icon SHA-1 hash.
pub const HASH_LEN: usize = 20;

/// Flag bit: the advertising user is about to quit.
const FLAG_QUIT: u8 = 0x01;
/// Flag bit: the advertising user has an icon set.
const FLAG_ICON: u8 = 0x02;
/// Any other flag bit is reserved and must be zero.
const FLAG_RESERVED: u8 = !(FLAG_QUIT | FLAG_ICON);

/// Minimum size of a well-formed beacon (empty names, no icon hash).
pub const MIN_SIZE: usize = 4 + 1 + 1 + 16 + 4 + 4 + 4 + 2 + 2;
/// Maximum size of a well-formed beacon (full names and icon hash).
pub const MAX_SIZE: usize = MIN_SIZE + 2 * NAME_MAX_CHARS * 2 + HASH_LEN;

/// A discovery datagram in structured form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub uuid: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub ipv4: Ipv4Addr,
    pub ft_port: u16,
    pub it_port: u16,
    /// SHA-1 hash of the advertised icon, when one is set.
    pub icon_hash: Option<[u8; HASH_LEN]>,
    /// The advertising user is going offline.
    pub quit: bool,
}

impl Beacon {
    /// Validity rules shared by the encode and decode paths.
    fn valid(&self) -> bool {
        !self.uuid.is_nil()
            && self.first_name.encode_utf16().count() <= NAME_MAX_CHARS
            && self.last_name.encode_utf16().count() <= NAME_MAX_CHARS
            && !self.ipv4.is_unspecified()
            && self.ft_port != 0
            && match self.icon_hash {
                Some(_) => self.it_port != 0,
                None => self.it_port == 0,
            }
    }

    /// Encode the beacon to wire bytes. Fails on an invalid beacon.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if !self.valid() {
            bail!("refusing to encode an invalid beacon");
        }

        let mut flags = 0u8;
        if self.quit {
            flags |= FLAG_QUIT;
        }
        if self.icon_hash.is_some() {
            flags |= FLAG_ICON;
        }

        let mut buf = BytesMut::with_capacity(MAX_SIZE);
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(flags);
        buf.put_slice(self.uuid.as_bytes());
        put_utf16(&mut buf, &self.first_name);
        put_utf16(&mut buf, &self.last_name);
        buf.put_u32_le(u32::from(self.ipv4));
        buf.put_u16_le(self.ft_port);
        buf.put_u16_le(self.it_port);
        if let Some(hash) = &self.icon_hash {
            buf.put_slice(hash);
        }
        Ok(buf.to_vec())
    }

    /// Return a copy of this beacon with the quit flag set.
    pub fn quitting(&self) -> Beacon {
        Beacon {
            quit: true,
            ..self.clone()
        }
    }

    /// Decode a beacon from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Beacon> {
        if data.len() < MIN_SIZE || data.len() > MAX_SIZE {
            bail!("wrong sized datagram ({} bytes)", data.len());
        }

        let mut buf = data;
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        let version = buf.get_u8();
        let flags = buf.get_u8();

        if magic != MAGIC || version != VERSION || flags & FLAG_RESERVED != 0 {
            bail!("invalid beacon header");
        }

        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let uuid = Uuid::from_bytes(uuid_bytes);

        let first_name = get_utf16(&mut buf)?;
        let last_name = get_utf16(&mut buf)?;

        if buf.remaining() < 4 + 2 + 2 {
            bail!("truncated beacon (addresses)");
        }
        let ipv4 = Ipv4Addr::from(buf.get_u32_le());
        let ft_port = buf.get_u16_le();
        let it_port = buf.get_u16_le();

        let icon_hash = if flags & FLAG_ICON != 0 {
            if buf.remaining() != HASH_LEN {
                bail!("truncated beacon (icon hash)");
            }
            let mut hash = [0u8; HASH_LEN];
            buf.copy_to_slice(&mut hash);
            Some(hash)
        } else {
            if buf.has_remaining() {
                bail!("trailing bytes after beacon");
            }
            None
        };

        let beacon = Beacon {
            uuid,
            first_name,
            last_name,
            ipv4,
            ft_port,
            it_port,
            icon_hash,
            quit: flags & FLAG_QUIT != 0,
        };
        if !beacon.valid() {
            bail!("invalid beacon field values");
        }
        Ok(beacon)
    }
}

/// Append a length-prefixed UTF-16LE string.
fn put_utf16(buf: &mut BytesMut, value: &str) {
    let units: Vec<u16> = value.encode_utf16().collect();
    buf.put_u32_le((units.len() * 2) as u32);
    for unit in units {
        buf.put_u16_le(unit);
    }
}

/// Read a length-prefixed UTF-16LE string, bounded to `NAME_MAX_CHARS`.
fn get_utf16(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 4 {
        bail!("truncated beacon (string length)");
    }
    let byte_len = buf.get_u32_le() as usize;
    if byte_len % 2 != 0 || byte_len > NAME_MAX_CHARS * 2 {
        bail!("invalid beacon string length {}", byte_len);
    }
    if buf.remaining() < byte_len {
        bail!("truncated beacon (string data)");
    }

    let units: Vec<u16> = (0..byte_len / 2).map(|_| buf.get_u16_le()).collect();
    String::from_utf16(&units).map_err(|_| anyhow::anyhow!("malformed UTF-16 in beacon"))
}
