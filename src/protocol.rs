//! Wire format of a log stream.
//!
//! Every packet starts with a 5-byte header followed by the body:
//!
//! ```text
//! [body_len: u32 LE | type: u8] [body ...]
//! ```
//!
//! PING and BYE packets have an empty body. A MESSAGE body is a 17-byte
//! fixed prefix followed by the raw UTF-8 text:
//!
//! ```text
//! [timestamp: u64 LE | index: u32 LE | category: u32 LE | level: u8] [text ...]
//! ```
//!
//! The text carries no terminator and no escaping; its length is
//! `body_len - 17`.

use std::fmt;
use std::str::FromStr;

use crate::message::Message;

/// Size of the packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 5;
/// Offset of the body length inside the header.
pub const PACKET_SIZE_OFFSET: usize = 0;
/// Offset of the packet type inside the header.
pub const PACKET_TYPE_OFFSET: usize = 4;

/// Size of the fixed part of a MESSAGE body.
pub const MESSAGE_PREFIX_SIZE: usize = 17;
pub const MESSAGE_TIMESTAMP_OFFSET: usize = PACKET_HEADER_SIZE;
pub const MESSAGE_INDEX_OFFSET: usize = PACKET_HEADER_SIZE + 8;
pub const MESSAGE_CATEGORY_OFFSET: usize = PACKET_HEADER_SIZE + 12;
pub const MESSAGE_LEVEL_OFFSET: usize = PACKET_HEADER_SIZE + 16;

/// Largest fixed part of any known packet (header + MESSAGE prefix).
pub const PACKET_MAX_FIXED_PART: usize = PACKET_HEADER_SIZE + MESSAGE_PREFIX_SIZE;

/// Packet types understood by this version of the protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Ping = 0,
    Message = 1,
    Bye = 2,
}

impl PacketType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PacketType::Ping),
            1 => Some(PacketType::Message),
            2 => Some(PacketType::Bye),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Log severity.
///
/// Lower value means higher priority. `Undefined` is not a real severity:
/// as a threshold it means "no threshold", as a category level it means
/// "use the default".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    #[default]
    Undefined = 0,
    Always = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
    Verbose = 8,
}

impl Level {
    /// All levels, in wire order.
    pub const ALL: [Level; 9] = [
        Level::Undefined,
        Level::Always,
        Level::Critical,
        Level::Error,
        Level::Warning,
        Level::Notice,
        Level::Info,
        Level::Debug,
        Level::Verbose,
    ];

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns `None` for values outside of `0..=8`.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Level::Undefined),
            1 => Some(Level::Always),
            2 => Some(Level::Critical),
            3 => Some(Level::Error),
            4 => Some(Level::Warning),
            5 => Some(Level::Notice),
            6 => Some(Level::Info),
            7 => Some(Level::Debug),
            8 => Some(Level::Verbose),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Undefined => "undefined",
            Level::Always => "always",
            Level::Critical => "critical",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Notice => "notice",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Verbose => "verbose",
        }
    }

    #[inline]
    pub const fn is_defined(self) -> bool {
        !matches!(self, Level::Undefined)
    }

    /// True if a message at this level is at least as severe as `threshold`.
    #[inline]
    pub fn passes(self, threshold: Level) -> bool {
        self <= threshold
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLevelError(String);

impl fmt::Display for ParseLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown log level '{}'", self.0)
    }
}

impl std::error::Error for ParseLevelError {}

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Accepts level names in any case, or the numeric wire value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(value) = trimmed.parse::<u8>() {
            return Level::from_u8(value).ok_or_else(|| ParseLevelError(s.to_string()));
        }
        Level::ALL
            .iter()
            .copied()
            .find(|level| level.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ParseLevelError(s.to_string()))
    }
}

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub body_len: u32,
    pub packet_type: u8,
}

impl Header {
    pub fn decode(bytes: &[u8; PACKET_HEADER_SIZE]) -> Self {
        Self {
            body_len: get_u32(bytes, PACKET_SIZE_OFFSET),
            packet_type: bytes[PACKET_TYPE_OFFSET],
        }
    }

    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_u8(self.packet_type)
    }

    /// Total size of the packet, header included.
    pub fn packet_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.body_len as usize
    }

    /// Number of bytes (header included) that are buffered before the
    /// variable part of the packet.
    ///
    /// Unknown types get the largest known fixed part so that a future
    /// packet with a longer prefix is still read in one piece; the value is
    /// clamped to the packet size so a short unknown packet never swallows
    /// bytes of the next one.
    pub fn fixed_part(&self) -> usize {
        let fixed = match self.kind() {
            Some(PacketType::Ping) | Some(PacketType::Bye) => PACKET_HEADER_SIZE,
            Some(PacketType::Message) => PACKET_MAX_FIXED_PART,
            None => PACKET_MAX_FIXED_PART,
        };
        fixed.min(self.packet_size())
    }
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Writes a packet header into the first 5 bytes of `buf`.
pub fn encode_header(buf: &mut [u8], body_len: u32, packet_type: PacketType) {
    put_u32(buf, PACKET_SIZE_OFFSET, body_len);
    buf[PACKET_TYPE_OFFSET] = packet_type.as_u8();
}

/// Encodes a body-less packet (PING or BYE).
pub fn encode_control(packet_type: PacketType) -> [u8; PACKET_HEADER_SIZE] {
    let mut buf = [0u8; PACKET_HEADER_SIZE];
    encode_header(&mut buf, 0, packet_type);
    buf
}

/// Encodes the header and the fixed prefix of a MESSAGE packet.
///
/// The text is not copied; the caller writes `message.text()` right after
/// the returned bytes.
pub fn encode_message_head(message: &Message) -> [u8; PACKET_MAX_FIXED_PART] {
    let mut buf = [0u8; PACKET_MAX_FIXED_PART];
    let body_len = (MESSAGE_PREFIX_SIZE + message.text().len()) as u32;
    encode_header(&mut buf, body_len, PacketType::Message);
    put_u64(&mut buf, MESSAGE_TIMESTAMP_OFFSET, message.timestamp() as u64);
    put_u32(&mut buf, MESSAGE_INDEX_OFFSET, message.index());
    put_u32(&mut buf, MESSAGE_CATEGORY_OFFSET, message.category());
    buf[MESSAGE_LEVEL_OFFSET] = message.level().as_u8();
    buf
}

/// Encodes a complete MESSAGE packet into a new buffer.
pub fn encode_message(message: &Message) -> Vec<u8> {
    let head = encode_message_head(message);
    let mut frame = Vec::with_capacity(head.len() + message.text().len());
    frame.extend_from_slice(&head);
    frame.extend_from_slice(message.text().as_bytes());
    frame
}

/// Builds a message from the 22-byte fixed part of a MESSAGE packet and its
/// text bytes.
///
/// Unknown level values decode as [`Level::Undefined`]; invalid UTF-8 is
/// replaced rather than rejected.
pub fn decode_message_head(fixed: &[u8], text: Vec<u8>) -> Message {
    let level = fixed[MESSAGE_LEVEL_OFFSET];
    let text = match String::from_utf8(text) {
        Ok(text) => text,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    };
    Message::new(
        get_u64(fixed, MESSAGE_TIMESTAMP_OFFSET) as i64,
        get_u32(fixed, MESSAGE_INDEX_OFFSET),
        get_u32(fixed, MESSAGE_CATEGORY_OFFSET),
        Level::from_u8(level).unwrap_or(Level::Undefined),
        text,
    )
}

/// A packet decoded by [`FrameReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping,
    Message(Message),
    Bye,
    /// A packet of a type this version does not know. Its body was skipped.
    Unknown(u8),
}

/// Sequential decoder over a captured byte stream.
///
/// This is the offline counterpart of [`Receiver`](crate::receiver::Receiver):
/// it needs the whole stream in memory and stops at the first incomplete
/// packet.
///
/// # Examples
///
/// ```
/// use logstream::{Level, Message};
/// use logstream::protocol::{encode_message, FrameReader, Packet};
///
/// let msg = Message::new(1, 0, 0, Level::Info, "hello".to_string());
/// let data = encode_message(&msg);
/// let mut reader = FrameReader::new(&data);
/// assert_eq!(reader.read_packet(), Some(Packet::Message(msg)));
/// assert_eq!(reader.read_packet(), None);
/// ```
pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.pos + len <= self.data.len() {
            let slice = &self.data[self.pos..self.pos + len];
            self.pos += len;
            Some(slice)
        } else {
            None
        }
    }

    /// Decodes the next packet, or returns `None` if the remaining bytes
    /// don't hold a complete one. A truncated packet is not consumed.
    pub fn read_packet(&mut self) -> Option<Packet> {
        let start = self.pos;
        let packet = self.read_packet_inner();
        if packet.is_none() {
            self.pos = start;
        }
        packet
    }

    fn read_packet_inner(&mut self) -> Option<Packet> {
        let mut head = [0u8; PACKET_HEADER_SIZE];
        head.copy_from_slice(self.read_bytes(PACKET_HEADER_SIZE)?);
        let header = Header::decode(&head);
        let body = self.read_bytes(header.body_len as usize)?;
        match header.kind() {
            Some(PacketType::Ping) => Some(Packet::Ping),
            Some(PacketType::Bye) => Some(Packet::Bye),
            Some(PacketType::Message) if body.len() >= MESSAGE_PREFIX_SIZE => {
                let mut fixed = [0u8; PACKET_MAX_FIXED_PART];
                fixed[..PACKET_HEADER_SIZE].copy_from_slice(&head);
                fixed[PACKET_HEADER_SIZE..].copy_from_slice(&body[..MESSAGE_PREFIX_SIZE]);
                let text = body[MESSAGE_PREFIX_SIZE..].to_vec();
                Some(Packet::Message(decode_message_head(&fixed, text)))
            }
            _ => Some(Packet::Unknown(header.packet_type)),
        }
    }
}

impl Iterator for FrameReader<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        self.read_packet()
    }
}
