//! BNCS frame layout and field-level read/write helpers.
//!
//! Every frame is:
//!
//! ```text
//! ┌────────┬──────┬──────────────────┬─────────┐
//! │ 0xFF   │ id   │ length (u16 LE)  │ payload │
//! └────────┴──────┴──────────────────┴─────────┘
//! ```
//!
//! `length` counts the four header bytes. Integers are little-endian,
//! strings are NUL-terminated, and four-character codes travel as a
//! reversed dword (`"IX86"` is sent as `68XI`).

use bytes::{Buf, BufMut};

use crate::buffer::PooledBuffer;
use crate::error::{BncsError, Result};
use crate::product::{code_dword, dword_code};

/// First byte of every frame.
pub const FRAME_MARKER: u8 = 0xFF;

/// Size of the frame header.
pub const HEADER_LEN: usize = 4;

/// Sent once, unframed, right after the TCP connection opens.
pub const PROTOCOL_SELECTOR: u8 = 0x01;

/// Packet ids.
pub mod sid {
    pub const NULL: u8 = 0x00;
    pub const ENTERCHAT: u8 = 0x0A;
    pub const GETCHANNELLIST: u8 = 0x0B;
    pub const JOINCHANNEL: u8 = 0x0C;
    pub const CHATCOMMAND: u8 = 0x0E;
    pub const CHATEVENT: u8 = 0x0F;
    pub const CHECKAD: u8 = 0x15;
    pub const MESSAGEBOX: u8 = 0x19;
    pub const PING: u8 = 0x25;
    pub const LOGONRESPONSE2: u8 = 0x3A;
    pub const CREATEACCOUNT2: u8 = 0x3D;
    pub const NEWS_INFO: u8 = 0x46;
    pub const AUTH_INFO: u8 = 0x50;
    pub const AUTH_CHECK: u8 = 0x51;
    pub const AUTH_ACCOUNTCREATE: u8 = 0x52;
    pub const AUTH_ACCOUNTLOGON: u8 = 0x53;
    pub const AUTH_ACCOUNTLOGONPROOF: u8 = 0x54;
    pub const SETEMAIL: u8 = 0x59;
    pub const WARDEN: u8 = 0x5E;
    pub const FRIENDSLIST: u8 = 0x65;
    pub const FRIENDSUPDATE: u8 = 0x66;
    pub const FRIENDSADD: u8 = 0x67;
    pub const FRIENDSREMOVE: u8 = 0x68;
    pub const CLANMEMBERLIST: u8 = 0x7D;
    pub const CLANMEMBERREMOVED: u8 = 0x7E;
    pub const CLANMEMBERSTATUSCHANGE: u8 = 0x7F;
}

/// Builds one outgoing frame.
#[derive(Debug)]
pub struct PacketWriter {
    buf: PooledBuffer,
}

impl PacketWriter {
    /// Start a frame with the given id in `buf` (cleared first).
    pub fn new(id: u8, mut buf: PooledBuffer) -> Self {
        buf.clear();
        buf.put_u8(FRAME_MARKER);
        buf.put_u8(id);
        buf.put_u16_le(0);
        Self { buf }
    }

    /// Start a frame in a buffer that belongs to no pool.
    pub fn standalone(id: u8) -> Self {
        Self::new(id, PooledBuffer::detached(64))
    }

    /// The frame's packet id.
    pub fn id(&self) -> u8 {
        self.buf.get(1).copied().unwrap_or_default()
    }

    /// Bytes written after the header so far.
    pub fn payload(&self) -> &[u8] {
        self.buf.get(HEADER_LEN..).unwrap_or_default()
    }

    pub fn insert_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn insert_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    pub fn insert_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn insert_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    pub fn insert_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    /// Insert a four-character code as its wire dword.
    pub fn insert_dword_code(&mut self, code: &str) -> &mut Self {
        self.insert_u32(code_dword(code))
    }

    /// Insert a NUL-terminated string.
    pub fn insert_cstring(&mut self, text: &str) -> &mut Self {
        self.buf.put_slice(text.as_bytes());
        self.buf.put_u8(0);
        self
    }

    pub fn insert_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Patch the length field and hand back the finished frame.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::FrameTooLarge`] if the frame does not fit the
    /// 16-bit length field.
    pub fn finish(mut self) -> Result<PooledBuffer> {
        let len = self.buf.len();
        let wire_len = u16::try_from(len).map_err(|_| BncsError::FrameTooLarge(len))?;
        if let Some(slot) = self.buf.get_mut(2..HEADER_LEN) {
            slot.copy_from_slice(&wire_len.to_le_bytes());
        }
        Ok(self.buf)
    }
}

/// Reads fields from one incoming frame's payload.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    id: u8,
    data: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(id: u8, data: &'a [u8]) -> Self {
        Self { id, data }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    fn need(&self, count: usize) -> Result<()> {
        if self.data.remaining() < count {
            return Err(BncsError::MalformedPacket {
                id: self.id,
                reason: "truncated field",
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.data.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.data.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.data.get_u64_le())
    }

    /// Read a four-character code stored as a wire dword.
    pub fn read_dword_code(&mut self) -> Result<String> {
        self.read_u32().map(dword_code)
    }

    /// Read a NUL-terminated string. Invalid UTF-8 is replaced, not rejected.
    pub fn read_cstring(&mut self) -> Result<String> {
        let Some(end) = self.data.iter().position(|b| *b == 0) else {
            return Err(BncsError::MalformedPacket {
                id: self.id,
                reason: "unterminated string",
            });
        };
        let (text, rest) = self.data.split_at(end);
        self.data = rest.get(1..).unwrap_or_default();
        Ok(String::from_utf8_lossy(text).into_owned())
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        self.need(count)?;
        let (head, rest) = self.data.split_at(count);
        self.data = rest;
        Ok(head)
    }

    /// Everything not yet read.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
}

/// The fixed layout of a `SID_CHATEVENT` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEventPacket {
    pub event_id: u32,
    pub flags: u32,
    pub ping: u32,
    pub ip: u32,
    pub account_number: u32,
    pub registration_authority: u32,
    pub username: String,
    pub text: String,
}

impl ChatEventPacket {
    /// Parse a chat event payload.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::MalformedPacket`] if the payload is truncated.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = PacketReader::new(sid::CHATEVENT, payload);
        Ok(Self {
            event_id: reader.read_u32()?,
            flags: reader.read_u32()?,
            ping: reader.read_u32()?,
            ip: reader.read_u32()?,
            account_number: reader.read_u32()?,
            registration_authority: reader.read_u32()?,
            username: reader.read_cstring()?,
            text: reader.read_cstring()?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn finish_patches_length_including_header() {
        let mut writer = PacketWriter::standalone(sid::PING);
        writer.insert_u32(0xDEAD_BEEF);
        let frame = writer.finish().unwrap();
        assert_eq!(&frame[..], &[0xFF, 0x25, 0x08, 0x00, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn dword_codes_are_reversed_on_the_wire() {
        let mut writer = PacketWriter::standalone(sid::AUTH_INFO);
        writer.insert_dword_code("IX86");
        assert_eq!(writer.payload(), b"68XI");
        let mut reader = PacketReader::new(sid::AUTH_INFO, b"68XI");
        assert_eq!(reader.read_dword_code().unwrap(), "IX86");
    }

    #[test]
    fn reader_rejects_truncated_fields() {
        let mut reader = PacketReader::new(0x25, &[1, 2, 3]);
        assert!(matches!(
            reader.read_u32(),
            Err(BncsError::MalformedPacket { id: 0x25, .. })
        ));
        assert_eq!(reader.remaining(), 3);
    }

    #[test]
    fn cstrings_split_on_nul() {
        let mut reader = PacketReader::new(0x0A, b"alpha\0beta\0");
        assert_eq!(reader.read_cstring().unwrap(), "alpha");
        assert_eq!(reader.read_cstring().unwrap(), "beta");
        assert_eq!(reader.remaining(), 0);
        assert!(reader.read_cstring().is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut writer = PacketWriter::standalone(sid::CHATCOMMAND);
        writer.insert_bytes(&vec![b'a'; 70_000]);
        assert!(matches!(writer.finish(), Err(BncsError::FrameTooLarge(_))));
    }

    #[test]
    fn chat_event_parses_fixed_layout() {
        let mut writer = PacketWriter::standalone(sid::CHATEVENT);
        writer
            .insert_u32(0x05)
            .insert_u32(0x02)
            .insert_u32(120)
            .insert_u32(0)
            .insert_u32(0)
            .insert_u32(0)
            .insert_cstring("Arthas")
            .insert_cstring("hello there");
        let event = ChatEventPacket::parse(writer.payload()).unwrap();
        assert_eq!(event.event_id, 5);
        assert_eq!(event.ping, 120);
        assert_eq!(event.username, "Arthas");
        assert_eq!(event.text, "hello there");
    }
}
