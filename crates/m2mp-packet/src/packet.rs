use std::fmt;

use crate::error::{PacketError, Result};

/// Header: message ID (4) + last flag and fragment number (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload bytes carried by one packet.
pub const DATA_SIZE: usize = 500;

/// Maximum total packet length on the wire.
pub const MAXIMUM_SIZE: usize = HEADER_SIZE + DATA_SIZE;

/// Minimum total packet length on the wire (header only).
pub const MIN_SIZE: usize = HEADER_SIZE;

/// Largest fragment number representable in the 31-bit field.
pub const MAX_FRAGMENT_NUMBER: u32 = 0x7FFF_FFFF;

const MESSAGE_ID_OFFSET: usize = 0;
const FRAGMENT_OFFSET: usize = 4;
const LAST_PACKET_FLAG: u32 = 0x8000_0000;

/// One M2MP datagram: an 8-byte header followed by 0-500 payload bytes.
///
/// Wire format:
/// ```text
/// ┌────────────────┬───┬─────────────────────┬──────────────────┐
/// │ Message ID     │ L │ Fragment number     │ Payload          │
/// │ (4B BE)        │1b │ (31 bits, BE)       │ (0-500 bytes)    │
/// └────────────────┴───┴─────────────────────┴──────────────────┘
/// ```
///
/// A packet carries a position and a limit cursor over its backing buffer.
/// The write path is [`clear`](Self::clear), then [`put`](Self::put) /
/// [`put_slice`](Self::put_slice), then [`flip`](Self::flip). The read path is
/// [`rewind`](Self::rewind), then [`get`](Self::get) /
/// [`get_slice`](Self::get_slice) / [`skip`](Self::skip). A received datagram
/// is copied straight into [`buffer_mut`](Self::buffer_mut) and sealed with
/// [`set_limit`](Self::set_limit).
///
/// Packets are not shared between threads; ownership moves explicitly
/// through the pool and the channel queues.
pub struct Packet {
    buf: Box<[u8; MAXIMUM_SIZE]>,
    limit: usize,
    position: usize,
}

impl Packet {
    /// Create a packet with a zeroed header and an empty payload.
    pub fn new() -> Self {
        Self {
            buf: Box::new([0u8; MAXIMUM_SIZE]),
            limit: HEADER_SIZE,
            position: HEADER_SIZE,
        }
    }

    /// Returns true if `len` is a legal total packet length (8..=508).
    pub fn is_valid_length(len: usize) -> bool {
        (MIN_SIZE..=MAXIMUM_SIZE).contains(&len)
    }

    /// Overwrite this packet with the valid bytes and cursors of `other`.
    pub fn copy_from(&mut self, other: &Packet) {
        self.buf[..other.limit].copy_from_slice(&other.buf[..other.limit]);
        self.limit = other.limit;
        self.position = other.position;
    }

    /// The raw 8 header bytes.
    pub fn header(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&self.buf[..HEADER_SIZE]);
        header
    }

    /// Returns true if both packets carry identical header bytes.
    pub fn header_equals(&self, other: &Packet) -> bool {
        self.buf[..HEADER_SIZE] == other.buf[..HEADER_SIZE]
    }

    pub fn message_id(&self) -> u32 {
        self.read_u32(MESSAGE_ID_OFFSET)
    }

    pub fn is_last_packet(&self) -> bool {
        self.read_u32(FRAGMENT_OFFSET) & LAST_PACKET_FLAG != 0
    }

    pub fn fragment_number(&self) -> u32 {
        self.read_u32(FRAGMENT_OFFSET) & MAX_FRAGMENT_NUMBER
    }

    /// The combined last-packet flag and fragment number word.
    pub fn last_packet_and_fragment_number(&self) -> u32 {
        self.read_u32(FRAGMENT_OFFSET)
    }

    pub fn set_message_id(&mut self, message_id: u32) {
        self.write_u32(MESSAGE_ID_OFFSET, message_id);
    }

    /// Store the last-packet flag and the low 31 bits of `fragment_number`.
    pub fn set_last_packet_and_fragment_number(&mut self, is_last: bool, fragment_number: u32) {
        let word = if is_last {
            LAST_PACKET_FLAG | fragment_number
        } else {
            MAX_FRAGMENT_NUMBER & fragment_number
        };
        self.write_u32(FRAGMENT_OFFSET, word);
    }

    /// Move the position back to the first payload byte.
    pub fn rewind(&mut self) {
        self.position = HEADER_SIZE;
    }

    /// Read one payload byte.
    pub fn get(&mut self) -> Result<u8> {
        self.check(1)?;
        let b = self.buf[self.position];
        self.position += 1;
        Ok(b)
    }

    /// Fill `dst` with the next payload bytes.
    pub fn get_slice(&mut self, dst: &mut [u8]) -> Result<()> {
        self.check(dst.len())?;
        dst.copy_from_slice(&self.buf[self.position..self.position + dst.len()]);
        self.position += dst.len();
        Ok(())
    }

    /// Advance the position by `len` bytes without reading them.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.check(len)?;
        self.position += len;
        Ok(())
    }

    /// Prepare to write a fresh payload of up to [`DATA_SIZE`] bytes.
    pub fn clear(&mut self) {
        self.limit = MAXIMUM_SIZE;
        self.position = HEADER_SIZE;
    }

    /// Append one payload byte.
    pub fn put(&mut self, b: u8) -> Result<()> {
        self.check(1)?;
        self.buf[self.position] = b;
        self.position += 1;
        Ok(())
    }

    /// Append payload bytes.
    pub fn put_slice(&mut self, src: &[u8]) -> Result<()> {
        self.check(src.len())?;
        self.buf[self.position..self.position + src.len()].copy_from_slice(src);
        self.position += src.len();
        Ok(())
    }

    /// Seal the written payload: the limit becomes the current position and
    /// the position returns to the first payload byte.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = HEADER_SIZE;
    }

    /// The whole backing buffer, for filling directly from a datagram.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Declare that the first `len` buffer bytes hold a received packet.
    ///
    /// Both cursors are set to `len`; call [`rewind`](Self::rewind) before
    /// reading the payload.
    pub fn set_limit(&mut self, len: usize) -> Result<()> {
        if !Self::is_valid_length(len) {
            return Err(PacketError::InvalidLength(len));
        }
        self.limit = len;
        self.position = len;
        Ok(())
    }

    /// Total valid length (header plus payload).
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Bytes left between the position and the limit.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.position)
    }

    /// Payload length of a sealed packet.
    pub fn payload_len(&self) -> usize {
        self.limit.saturating_sub(HEADER_SIZE)
    }

    /// The valid wire bytes (header plus payload).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.limit]
    }

    /// The sealed payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..self.limit.max(HEADER_SIZE)]
    }

    /// Reset to the state of a freshly constructed packet. Header bytes are
    /// left as they are.
    pub fn reset(&mut self) {
        self.limit = HEADER_SIZE;
        self.position = HEADER_SIZE;
    }

    fn check(&self, len: usize) -> Result<()> {
        if self.position + len > self.limit {
            return Err(PacketError::OutOfBounds {
                position: self.position,
                len,
                limit: self.limit,
            });
        }
        Ok(())
    }

    fn read_u32(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }

    fn write_u32(&mut self, off: usize, value: u32) {
        self.buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("message_id", &format_args!("{:#010x}", self.message_id()))
            .field("last", &self.is_last_packet())
            .field("fragment", &self.fragment_number())
            .field("payload_len", &self.payload_len())
            .field("position", &self.position)
            .finish()
    }
}

/// Lowercase hex rendering used in packet and filter diagnostics.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
