//! WebSocket frame codec (RFC 6455 section 5).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key, if MASK set  |          Payload Data         |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! Decoding never consumes a partial frame: when the buffer holds less than
//! a whole frame the decoder returns `Ok(None)` and leaves the bytes in place
//! for the next read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use wsgate_core::errors::FrameError;

/// Close status: normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close status: endpoint going away (used for idle eviction).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close status: protocol error.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Largest payload a control frame may carry.
const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text data.
    Text,
    /// Binary data.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
    /// Opcode reserved by RFC 6455 (0x3-0x7, 0xB-0xF).
    Reserved(u8),
}

impl OpCode {
    /// Map the low nibble of the first header byte.
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Wire value.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(value) => value & 0x0F,
        }
    }

    /// Control frames have the high opcode bit set.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }

    /// Text or binary.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

/// A single decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// A final frame with the given opcode.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, payload)
    }

    /// Binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    /// Ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    /// Pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Close frame with an optional status code.
    pub fn close(code: Option<u16>) -> Self {
        let payload = match code {
            Some(code) => Bytes::copy_from_slice(&code.to_be_bytes()),
            None => Bytes::new(),
        };
        Self::new(OpCode::Close, payload)
    }

    /// Status code carried by a close frame, if any.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Which side of the connection the codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Decodes masked frames, encodes unmasked ones.
    Server,
    /// Decodes unmasked frames, encodes masked ones.
    Client,
}

/// Stateless RFC 6455 frame codec.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_payload: usize,
}

impl FrameCodec {
    /// Default maximum payload size (16 MB).
    pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

    /// Server-role codec.
    pub fn server() -> Self {
        Self {
            role: Role::Server,
            max_payload: Self::DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Client-role codec.
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            max_payload: Self::DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Set the maximum accepted payload size.
    #[must_use]
    pub fn max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    /// Role of this codec.
    pub fn role(&self) -> Role {
        self.role
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];
        let fin = first & 0x80 != 0;
        if first & 0x70 != 0 {
            return Err(FrameError::ReservedBitsSet);
        }
        let opcode = OpCode::from_u8(first);
        let masked = second & 0x80 != 0;

        match self.role {
            Role::Server if !masked => return Err(FrameError::UnmaskedClientFrame),
            Role::Client if masked => return Err(FrameError::MaskedServerFrame),
            _ => {}
        }

        let short_len = second & 0x7F;
        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if usize::from(short_len) > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlFrameTooLarge(usize::from(short_len)));
            }
        }

        let (declared, mut offset) = match short_len {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (u64::from(n), 2),
        };

        let len = match usize::try_from(declared) {
            Ok(n) if n <= self.max_payload => n,
            _ => {
                return Err(FrameError::PayloadTooLarge {
                    size: declared,
                    max: self.max_payload,
                });
            }
        };

        let mask = if masked {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let key = [src[offset], src[offset + 1], src[offset + 2], src[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        let total = offset + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(offset);
        let mut payload = src.split_to(len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload.len();
        let mask_bit = if self.role == Role::Client { 0x80 } else { 0 };

        dst.reserve(14 + len);
        let fin_bit = if frame.fin { 0x80 } else { 0 };
        dst.put_u8(fin_bit | frame.opcode.as_u8());

        if len < 126 {
            #[allow(clippy::cast_possible_truncation)]
            dst.put_u8(mask_bit | len as u8);
        } else if let Ok(medium) = u16::try_from(len) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(medium);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        if self.role == Role::Client {
            let key: [u8; 4] = rand::random();
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.put_slice(&frame.payload);
        }
        Ok(())
    }
}

/// Encode a server frame into a standalone buffer.
pub fn encode_server_frame(frame: Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame.payload.len() + 10);
    // Server encoding only appends to a growable buffer and cannot fail.
    let _ = FrameCodec::server().encode(frame, &mut buf);
    buf.freeze()
}

/// XOR `buf` with the 4-byte masking key.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn client_bytes(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::client().encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn decode_masked_text() {
        // RFC 6455 section 5.7: masked "Hello"
        let mut buf = BytesMut::from(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        let frame = FrameCodec::server().decode(&mut buf).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_unmasked_server_text() {
        let bytes = encode_server_frame(Frame::text("Hello"));
        assert_eq!(&bytes[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn partial_frame_is_left_buffered() {
        let full = client_bytes(Frame::binary(vec![7u8; 300]));
        let mut codec = FrameCodec::server();
        for cut in [1, 3, 7, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut partial).unwrap().is_none());
            assert_eq!(partial.len(), cut);
        }
        let mut whole = full.clone();
        let frame = codec.decode(&mut whole).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = client_bytes(Frame::text("a"));
        buf.extend_from_slice(&client_bytes(Frame::ping("p")));
        let mut codec = FrameCodec::server();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opcode, OpCode::Text);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().opcode, OpCode::Ping);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn sixty_four_bit_length() {
        let payload = vec![1u8; 70_000];
        let mut buf = client_bytes(Frame::binary(payload.clone()));
        assert_eq!(buf[1] & 0x7F, 127);
        let frame = FrameCodec::server().decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn server_rejects_unmasked() {
        let mut buf = BytesMut::from(&encode_server_frame(Frame::text("x"))[..]);
        assert_matches!(
            FrameCodec::server().decode(&mut buf),
            Err(FrameError::UnmaskedClientFrame)
        );
    }

    #[test]
    fn client_rejects_masked() {
        let mut buf = client_bytes(Frame::text("x"));
        assert_matches!(
            FrameCodec::client().decode(&mut buf),
            Err(FrameError::MaskedServerFrame)
        );
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut buf = client_bytes(Frame::text("x"));
        buf[0] |= 0x40;
        assert_matches!(
            FrameCodec::server().decode(&mut buf),
            Err(FrameError::ReservedBitsSet)
        );
    }

    #[test]
    fn oversize_payload_rejected() {
        let mut buf = client_bytes(Frame::binary(vec![0u8; 200]));
        assert_matches!(
            FrameCodec::server().max_payload(100).decode(&mut buf),
            Err(FrameError::PayloadTooLarge { size: 200, max: 100 })
        );
    }

    #[test]
    fn fragmented_ping_rejected() {
        let mut frame = Frame::ping("x");
        frame.fin = false;
        let mut buf = client_bytes(frame);
        assert_matches!(
            FrameCodec::server().decode(&mut buf),
            Err(FrameError::FragmentedControlFrame)
        );
    }

    #[test]
    fn reserved_opcode_decodes() {
        let mut buf = client_bytes(Frame::new(OpCode::Reserved(0x3), "x"));
        let frame = FrameCodec::server().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Reserved(0x3));
        assert!(!frame.opcode.is_control());
    }

    #[test]
    fn close_code_roundtrips_through_payload() {
        let frame = Frame::close(Some(CLOSE_GOING_AWAY));
        assert_eq!(frame.close_code(), Some(1001));
        assert_eq!(Frame::close(None).close_code(), None);
        assert_eq!(Frame::text("ab").close_code(), None);
    }

    #[test]
    fn opcode_classification() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Reserved(0xB).is_control());
        assert!(OpCode::Text.is_data());
        assert!(!OpCode::Continuation.is_data());
    }
}
