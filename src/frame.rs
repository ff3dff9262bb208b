//! HTTP/2 frame encoding and decoding (RFC 7540 Section 6, plus the
//! ALTSVC frame from RFC 7838).
//!
//! Pure byte-level codec: framing I/O and dispatch live in the
//! endpoint module.

use crate::error::{Error, ErrorCode, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Client connection preface (RFC 7540 Section 3.5)
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Stream ID 0 addresses the connection itself
pub const CONNECTION_STREAM_ID: u32 = 0;

/// HTTP/2 frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// DATA (0x0)
    Data = 0x0,
    /// HEADERS (0x1)
    Headers = 0x1,
    /// PRIORITY (0x2)
    Priority = 0x2,
    /// RST_STREAM (0x3)
    RstStream = 0x3,
    /// SETTINGS (0x4)
    Settings = 0x4,
    /// PUSH_PROMISE (0x5)
    PushPromise = 0x5,
    /// PING (0x6)
    Ping = 0x6,
    /// GOAWAY (0x7)
    Goaway = 0x7,
    /// WINDOW_UPDATE (0x8)
    WindowUpdate = 0x8,
    /// CONTINUATION (0x9)
    Continuation = 0x9,
    /// ALTSVC (0xa, RFC 7838)
    AltSvc = 0xa,
}

impl FrameType {
    /// Convert to the wire byte
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse the wire byte; unknown types return None and are skipped
    /// by the reader per RFC 7540 Section 4.1.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            0xa => Some(FrameType::AltSvc),
            _ => None,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
            FrameType::AltSvc => "ALTSVC",
        };
        write!(f, "{}", name)
    }
}

/// Frame flag byte with named accessors
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// END_STREAM (0x1) on DATA and HEADERS
    pub const END_STREAM: u8 = 0x1;
    /// ACK (0x1) on SETTINGS and PING
    pub const ACK: u8 = 0x1;
    /// END_HEADERS (0x4)
    pub const END_HEADERS: u8 = 0x4;
    /// PADDED (0x8)
    pub const PADDED: u8 = 0x8;
    /// PRIORITY (0x20) on HEADERS
    pub const PRIORITY: u8 = 0x20;

    /// No flags set
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    /// Wrap a raw flag byte
    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    /// Raw flag byte
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Set a flag bit
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    /// Test a flag bit
    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    /// END_STREAM set?
    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    /// ACK set?
    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    /// END_HEADERS set?
    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    /// PADDED set?
    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    /// PRIORITY set?
    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// Encode a 9-byte frame header
pub fn encode_header(
    kind: FrameType,
    flags: FrameFlags,
    stream_id: u32,
    length: usize,
) -> [u8; FRAME_HEADER_SIZE] {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[0] = ((length >> 16) & 0xff) as u8;
    header[1] = ((length >> 8) & 0xff) as u8;
    header[2] = (length & 0xff) as u8;
    header[3] = kind.as_u8();
    header[4] = flags.as_u8();
    let stream_id = stream_id & 0x7fff_ffff;
    header[5..9].copy_from_slice(&stream_id.to_be_bytes());
    header
}

/// Decode a 9-byte frame header into (type byte, flags, stream id,
/// payload length). The reserved bit of the stream id is masked off.
pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> (u8, FrameFlags, u32, usize) {
    let length =
        ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
    let kind = bytes[3];
    let flags = FrameFlags::from_u8(bytes[4]);
    let stream_id =
        u32::from_be_bytes([bytes[5] & 0x7f, bytes[6], bytes[7], bytes[8]]);
    (kind, flags, stream_id, length)
}

fn frame(kind: FrameType, flags: FrameFlags, stream_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_slice(&encode_header(kind, flags, stream_id, payload.len()));
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a DATA frame
pub fn data_frame(stream_id: u32, chunk: &[u8], end_stream: bool) -> Bytes {
    let mut flags = FrameFlags::empty();
    if end_stream {
        flags.set(FrameFlags::END_STREAM);
    }
    frame(FrameType::Data, flags, stream_id, chunk)
}

/// Encode a HEADERS frame carrying a header block fragment
pub fn headers_frame(
    stream_id: u32,
    fragment: &[u8],
    end_stream: bool,
    end_headers: bool,
) -> Bytes {
    let mut flags = FrameFlags::empty();
    if end_stream {
        flags.set(FrameFlags::END_STREAM);
    }
    if end_headers {
        flags.set(FrameFlags::END_HEADERS);
    }
    frame(FrameType::Headers, flags, stream_id, fragment)
}

/// Encode a CONTINUATION frame
pub fn continuation_frame(stream_id: u32, fragment: &[u8], end_headers: bool) -> Bytes {
    let mut flags = FrameFlags::empty();
    if end_headers {
        flags.set(FrameFlags::END_HEADERS);
    }
    frame(FrameType::Continuation, flags, stream_id, fragment)
}

/// Encode a PUSH_PROMISE frame
pub fn push_promise_frame(
    stream_id: u32,
    promised_id: u32,
    fragment: &[u8],
    end_headers: bool,
) -> Bytes {
    let mut flags = FrameFlags::empty();
    if end_headers {
        flags.set(FrameFlags::END_HEADERS);
    }
    let mut payload = Vec::with_capacity(4 + fragment.len());
    payload.extend_from_slice(&(promised_id & 0x7fff_ffff).to_be_bytes());
    payload.extend_from_slice(fragment);
    frame(FrameType::PushPromise, flags, stream_id, &payload)
}

/// Encode a SETTINGS frame
pub fn settings_frame(payload: &[u8]) -> Bytes {
    frame(
        FrameType::Settings,
        FrameFlags::empty(),
        CONNECTION_STREAM_ID,
        payload,
    )
}

/// Encode a SETTINGS ACK
pub fn settings_ack() -> Bytes {
    frame(
        FrameType::Settings,
        FrameFlags::from_u8(FrameFlags::ACK),
        CONNECTION_STREAM_ID,
        &[],
    )
}

/// Encode a PING ACK echoing the opaque data
pub fn ping_ack(data: &[u8; 8]) -> Bytes {
    frame(
        FrameType::Ping,
        FrameFlags::from_u8(FrameFlags::ACK),
        CONNECTION_STREAM_ID,
        data,
    )
}

/// Encode a RST_STREAM frame
pub fn rst_frame(stream_id: u32, code: ErrorCode) -> Bytes {
    frame(
        FrameType::RstStream,
        FrameFlags::empty(),
        stream_id,
        &code.as_u32().to_be_bytes(),
    )
}

/// Encode a GOAWAY frame
pub fn goaway_frame(last_stream_id: u32, code: ErrorCode) -> Bytes {
    let mut payload = [0u8; 8];
    payload[0..4].copy_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
    payload[4..8].copy_from_slice(&code.as_u32().to_be_bytes());
    frame(
        FrameType::Goaway,
        FrameFlags::empty(),
        CONNECTION_STREAM_ID,
        &payload,
    )
}

/// Encode a WINDOW_UPDATE frame
pub fn window_update_frame(stream_id: u32, increment: u32) -> Bytes {
    frame(
        FrameType::WindowUpdate,
        FrameFlags::empty(),
        stream_id,
        &(increment & 0x7fff_ffff).to_be_bytes(),
    )
}

/// Encode a PRIORITY frame
pub fn priority_frame(stream_id: u32, dependency: u32, exclusive: bool, weight: u8) -> Bytes {
    let mut dep = dependency & 0x7fff_ffff;
    if exclusive {
        dep |= 0x8000_0000;
    }
    let mut payload = [0u8; 5];
    payload[0..4].copy_from_slice(&dep.to_be_bytes());
    payload[4] = weight;
    frame(FrameType::Priority, FrameFlags::empty(), stream_id, &payload)
}

/// Encode an ALTSVC frame (RFC 7838 Section 4)
pub fn altsvc_frame(stream_id: u32, origin: &str, field_value: &str) -> Bytes {
    let mut payload = Vec::with_capacity(2 + origin.len() + field_value.len());
    payload.extend_from_slice(&(origin.len() as u16).to_be_bytes());
    payload.extend_from_slice(origin.as_bytes());
    payload.extend_from_slice(field_value.as_bytes());
    frame(FrameType::AltSvc, FrameFlags::empty(), stream_id, &payload)
}

/// Strip padding from a DATA payload
pub fn data_payload(payload: Bytes, flags: FrameFlags) -> Result<Bytes> {
    strip_padding(payload, flags)
}

/// Strip padding and any priority section from a HEADERS payload,
/// leaving the header block fragment.
pub fn headers_fragment(payload: Bytes, flags: FrameFlags) -> Result<Bytes> {
    let mut fragment = strip_padding(payload, flags)?;
    if flags.is_priority() {
        if fragment.len() < 5 {
            return Err(short_frame("HEADERS"));
        }
        fragment = fragment.slice(5..);
    }
    Ok(fragment)
}

/// Split a PUSH_PROMISE payload into (promised stream id, fragment)
pub fn push_promise_parts(payload: Bytes, flags: FrameFlags) -> Result<(u32, Bytes)> {
    let rest = strip_padding(payload, flags)?;
    if rest.len() < 4 {
        return Err(short_frame("PUSH_PROMISE"));
    }
    let promised =
        u32::from_be_bytes([rest[0] & 0x7f, rest[1], rest[2], rest[3]]);
    Ok((promised, rest.slice(4..)))
}

/// Parse a RST_STREAM payload
pub fn rst_code(payload: &[u8]) -> Result<ErrorCode> {
    if payload.len() != 4 {
        return Err(short_frame("RST_STREAM"));
    }
    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Ok(ErrorCode::from_u32(code).unwrap_or(ErrorCode::InternalError))
}

/// Parse a WINDOW_UPDATE payload
pub fn window_increment(payload: &[u8]) -> Result<u32> {
    if payload.len() != 4 {
        return Err(short_frame("WINDOW_UPDATE"));
    }
    Ok(u32::from_be_bytes([
        payload[0] & 0x7f,
        payload[1],
        payload[2],
        payload[3],
    ]))
}

/// Parse a GOAWAY payload into (last stream id, error code)
pub fn goaway_parts(payload: &[u8]) -> Result<(u32, ErrorCode)> {
    if payload.len() < 8 {
        return Err(short_frame("GOAWAY"));
    }
    let last = u32::from_be_bytes([payload[0] & 0x7f, payload[1], payload[2], payload[3]]);
    let code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Ok((last, ErrorCode::from_u32(code).unwrap_or(ErrorCode::InternalError)))
}

fn strip_padding(payload: Bytes, flags: FrameFlags) -> Result<Bytes> {
    if !flags.is_padded() {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(short_frame("padded"));
    }
    let pad = payload[0] as usize;
    if 1 + pad > payload.len() {
        return Err(Error::Protocol("padding exceeds frame length".to_string()));
    }
    Ok(payload.slice(1..payload.len() - pad))
}

fn short_frame(kind: &str) -> Error {
    Error::Protocol(format!("truncated {} frame", kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = encode_header(FrameType::Headers, FrameFlags::from_u8(0x5), 42, 1234);
        let (kind, flags, stream_id, length) = decode_header(&header);
        assert_eq!(FrameType::from_u8(kind), Some(FrameType::Headers));
        assert!(flags.is_end_stream());
        assert!(flags.is_end_headers());
        assert_eq!(stream_id, 42);
        assert_eq!(length, 1234);
    }

    #[test]
    fn test_reserved_bit_masked() {
        let mut header = encode_header(FrameType::Data, FrameFlags::empty(), 1, 0);
        header[5] |= 0x80;
        let (_, _, stream_id, _) = decode_header(&header);
        assert_eq!(stream_id, 1);
    }

    #[test]
    fn test_data_frame_encoding() {
        let encoded = data_frame(3, b"hello", true);
        assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 5);
        assert_eq!(encoded[3], FrameType::Data.as_u8());
        assert_eq!(encoded[4], FrameFlags::END_STREAM);
        assert_eq!(&encoded[FRAME_HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_push_promise_parts() {
        let encoded = push_promise_frame(1, 2, b"frag", true);
        let payload = Bytes::copy_from_slice(&encoded[FRAME_HEADER_SIZE..]);
        let (promised, fragment) =
            push_promise_parts(payload, FrameFlags::empty()).unwrap();
        assert_eq!(promised, 2);
        assert_eq!(&fragment[..], b"frag");
    }

    #[test]
    fn test_padding_stripped() {
        // 1-byte pad length prefix, 3 data bytes, 2 pad bytes
        let payload = Bytes::copy_from_slice(&[2, b'a', b'b', b'c', 0, 0]);
        let flags = FrameFlags::from_u8(FrameFlags::PADDED);
        assert_eq!(&data_payload(payload, flags).unwrap()[..], b"abc");
    }

    #[test]
    fn test_padding_overflow_rejected() {
        let payload = Bytes::copy_from_slice(&[9, b'a']);
        let flags = FrameFlags::from_u8(FrameFlags::PADDED);
        assert!(data_payload(payload, flags).is_err());
    }

    #[test]
    fn test_altsvc_frame_layout() {
        let encoded = altsvc_frame(0, "example.com", "h2=\":443\"; ma=60");
        let origin_len = u16::from_be_bytes([
            encoded[FRAME_HEADER_SIZE],
            encoded[FRAME_HEADER_SIZE + 1],
        ]) as usize;
        assert_eq!(origin_len, "example.com".len());
    }

    #[test]
    fn test_window_increment() {
        let encoded = window_update_frame(0, 65_535);
        assert_eq!(
            window_increment(&encoded[FRAME_HEADER_SIZE..]).unwrap(),
            65_535
        );
    }
}
