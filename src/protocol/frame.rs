// src/protocol/frame.rs

//! WebSocket base framing (RFC 6455, section 5.2).
//!
//! Outgoing frames are never masked. Incoming masked frames are accepted and
//! unmasked. Fragmented data frames are reassembled before being yielded.

use crate::error::MailboxError;
use crate::options::DEFAULT_MAX_FRAME_SIZE;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

bitflags! {
  /// Bits of the first header octet, opcode excluded.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct HeaderBits: u8 {
    const FIN = 0b1000_0000;
    const RSV1 = 0b0100_0000;
    const RSV2 = 0b0010_0000;
    const RSV3 = 0b0001_0000;
  }
}

const OPCODE_MASK: u8 = 0b0000_1111;
const MASK_BIT: u8 = 0b1000_0000;
const LEN_MASK: u8 = 0b0111_1111;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;
/// Largest payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
  Continuation = 0x0,
  Text = 0x1,
  Binary = 0x2,
  Close = 0x8,
  Ping = 0x9,
  Pong = 0xA,
}

impl OpCode {
  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      0x0 => Some(OpCode::Continuation),
      0x1 => Some(OpCode::Text),
      0x2 => Some(OpCode::Binary),
      0x8 => Some(OpCode::Close),
      0x9 => Some(OpCode::Ping),
      0xA => Some(OpCode::Pong),
      _ => None,
    }
  }

  pub fn is_control(self) -> bool {
    (self as u8) & 0x8 != 0
  }
}

/// One complete frame. Data frames come out of the decoder already reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  pub fin: bool,
  pub opcode: OpCode,
  pub payload: Bytes,
}

impl Frame {
  pub fn binary(payload: impl Into<Bytes>) -> Self {
    Self {
      fin: true,
      opcode: OpCode::Binary,
      payload: payload.into(),
    }
  }

  pub fn control(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
    Self {
      fin: true,
      opcode,
      payload: payload.into(),
    }
  }
}

#[derive(Debug, Default, Clone, Copy)]
enum DecodingState {
  #[default]
  ReadHeader,
  ReadBody(FrameHeader),
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
  fin: bool,
  opcode: OpCode,
  mask: Option<[u8; 4]>,
  size: usize,
}

/// Stateful frame codec. One per connection.
#[derive(Debug)]
pub struct FrameCodec {
  max_payload: usize,
  decoding_state: DecodingState,
  /// Opcode and collected payload of a fragmented data message.
  fragments: Option<(OpCode, BytesMut)>,
}

impl Default for FrameCodec {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_FRAME_SIZE)
  }
}

impl FrameCodec {
  pub fn new(max_payload: usize) -> Self {
    Self {
      max_payload,
      decoding_state: DecodingState::default(),
      fragments: None,
    }
  }

  /// Frames `payload` as a single unmasked frame.
  pub fn encode_payload(&mut self, payload: &[u8], opcode: OpCode) -> Result<Bytes, MailboxError> {
    let mut dst = BytesMut::with_capacity(payload.len() + 10);
    let frame = Frame {
      fin: true,
      opcode,
      payload: Bytes::copy_from_slice(payload),
    };
    self.encode(frame, &mut dst)?;
    Ok(dst.freeze())
  }

  /// Parses a header from the front of `src` without consuming it.
  /// Returns the header and its length in bytes.
  fn parse_header(&self, src: &[u8]) -> Result<Option<(FrameHeader, usize)>, MailboxError> {
    if src.len() < 2 {
      return Ok(None);
    }
    let first = src[0];
    let second = src[1];

    let bits = HeaderBits::from_bits_truncate(first);
    if bits.intersects(HeaderBits::RSV1 | HeaderBits::RSV2 | HeaderBits::RSV3) {
      return Err(MailboxError::Protocol("reserved bits set in frame header".into()));
    }
    let opcode = OpCode::from_u8(first & OPCODE_MASK)
      .ok_or_else(|| MailboxError::Protocol(format!("unknown frame opcode {:#x}", first & OPCODE_MASK)))?;
    let fin = bits.contains(HeaderBits::FIN);
    let masked = second & MASK_BIT != 0;

    let (size, mut header_len) = match second & LEN_MASK {
      LEN_16 => {
        if src.len() < 4 {
          return Ok(None);
        }
        let mut len_bytes = &src[2..4];
        (len_bytes.get_u16() as u64, 4)
      }
      LEN_64 => {
        if src.len() < 10 {
          return Ok(None);
        }
        let mut len_bytes = &src[2..10];
        (len_bytes.get_u64(), 10)
      }
      n => (n as u64, 2),
    };

    if opcode.is_control() {
      if !fin {
        return Err(MailboxError::Protocol("fragmented control frame".into()));
      }
      if size > MAX_CONTROL_PAYLOAD as u64 {
        return Err(MailboxError::Protocol(format!("control frame payload of {} bytes", size)));
      }
    }
    if size > self.max_payload as u64 {
      return Err(MailboxError::Protocol(format!(
        "frame payload of {} bytes exceeds limit of {}",
        size, self.max_payload
      )));
    }

    let mask = if masked {
      if src.len() < header_len + 4 {
        return Ok(None);
      }
      let mut key = [0u8; 4];
      key.copy_from_slice(&src[header_len..header_len + 4]);
      header_len += 4;
      Some(key)
    } else {
      None
    };

    Ok(Some((
      FrameHeader {
        fin,
        opcode,
        mask,
        size: size as usize,
      },
      header_len,
    )))
  }

  /// Applies fragmentation rules to a fully read frame. Returns a frame when a
  /// message is complete.
  fn assemble(&mut self, header: FrameHeader, payload: BytesMut) -> Result<Option<Frame>, MailboxError> {
    if header.opcode.is_control() {
      return Ok(Some(Frame::control(header.opcode, payload.freeze())));
    }

    match (header.opcode, self.fragments.take()) {
      (OpCode::Continuation, None) => Err(MailboxError::Protocol("continuation frame without a started message".into())),
      (OpCode::Continuation, Some((opcode, mut collected))) => {
        if collected.len() + payload.len() > self.max_payload {
          return Err(MailboxError::Protocol(format!(
            "fragmented message exceeds limit of {} bytes",
            self.max_payload
          )));
        }
        collected.put(payload);
        if header.fin {
          Ok(Some(Frame {
            fin: true,
            opcode,
            payload: collected.freeze(),
          }))
        } else {
          self.fragments = Some((opcode, collected));
          Ok(None)
        }
      }
      (_, Some(_)) => Err(MailboxError::Protocol("new data frame inside a fragmented message".into())),
      (opcode, None) => {
        if header.fin {
          Ok(Some(Frame {
            fin: true,
            opcode,
            payload: payload.freeze(),
          }))
        } else {
          self.fragments = Some((opcode, payload));
          Ok(None)
        }
      }
    }
  }
}

impl Encoder<Frame> for FrameCodec {
  type Error = MailboxError;

  fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
    let size = item.payload.len();
    if item.opcode.is_control() && size > MAX_CONTROL_PAYLOAD {
      return Err(MailboxError::Protocol(format!("control frame payload of {} bytes", size)));
    }
    if size > self.max_payload {
      return Err(MailboxError::Protocol(format!(
        "frame payload of {} bytes exceeds limit of {}",
        size, self.max_payload
      )));
    }

    let mut first = item.opcode as u8;
    if item.fin {
      first |= HeaderBits::FIN.bits();
    }

    if size <= MAX_CONTROL_PAYLOAD {
      dst.reserve(2 + size);
      dst.put_u8(first);
      dst.put_u8(size as u8);
    } else if size <= u16::MAX as usize {
      dst.reserve(4 + size);
      dst.put_u8(first);
      dst.put_u8(LEN_16);
      dst.put_u16(size as u16);
    } else {
      dst.reserve(10 + size);
      dst.put_u8(first);
      dst.put_u8(LEN_64);
      dst.put_u64(size as u64);
    }
    dst.put_slice(&item.payload);
    Ok(())
  }
}

impl Decoder for FrameCodec {
  type Item = Frame;
  type Error = MailboxError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    loop {
      match self.decoding_state {
        DecodingState::ReadHeader => {
          let Some((header, header_len)) = self.parse_header(src)? else {
            return Ok(None);
          };
          src.advance(header_len);
          self.decoding_state = DecodingState::ReadBody(header);
        }

        DecodingState::ReadBody(header) => {
          if src.len() < header.size {
            src.reserve(header.size - src.len());
            return Ok(None);
          }
          let mut payload = src.split_to(header.size);
          if let Some(key) = header.mask {
            for (i, byte) in payload.iter_mut().enumerate() {
              *byte ^= key[i % 4];
            }
          }
          self.decoding_state = DecodingState::ReadHeader;
          tracing::trace!(opcode = ?header.opcode, size = header.size, fin = header.fin, "Decoded frame");
          if let Some(frame) = self.assemble(header, payload)? {
            return Ok(Some(frame));
          }
          // Fragment stored; keep decoding.
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn encode(frame: Frame) -> BytesMut {
    let mut codec = FrameCodec::default();
    let mut dst = BytesMut::new();
    codec.encode(frame, &mut dst).unwrap();
    dst
  }

  #[test]
  fn length_encodings_round_trip_at_boundaries() {
    for (size, header_len) in [
      (0usize, 2usize),
      (125, 2),
      (126, 4),
      (65535, 4),
      (65536, 10),
      (70000, 10),
    ] {
      let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
      let mut buf = encode(Frame::binary(payload.clone()));
      assert_eq!(buf.len(), header_len + size, "header length for payload of {}", size);
      assert_eq!(buf[0], 0x82, "FIN + binary, unmasked");
      assert_eq!(buf[1] & MASK_BIT, 0);

      let mut codec = FrameCodec::default();
      let frame = codec.decode(&mut buf).unwrap().unwrap();
      assert_eq!(frame.opcode, OpCode::Binary);
      assert_eq!(&frame.payload[..], &payload[..]);
      assert!(buf.is_empty());
    }
  }

  #[test]
  fn partial_input_is_buffered_until_complete() {
    let wire = encode(Frame::binary(vec![7u8; 300]));
    let mut codec = FrameCodec::default();
    let mut src = BytesMut::new();
    let mut decoded = None;
    for byte in wire.iter() {
      src.put_u8(*byte);
      if let Some(frame) = codec.decode(&mut src).unwrap() {
        decoded = Some(frame);
      }
    }
    assert_eq!(decoded.unwrap().payload.len(), 300);
  }

  #[test]
  fn two_frames_in_one_buffer() {
    let mut buf = encode(Frame::binary(&b"one"[..]));
    buf.extend_from_slice(&encode(Frame::binary(&b"two"[..])));
    let mut codec = FrameCodec::default();
    assert_eq!(&codec.decode(&mut buf).unwrap().unwrap().payload[..], b"one");
    assert_eq!(&codec.decode(&mut buf).unwrap().unwrap().payload[..], b"two");
    assert!(codec.decode(&mut buf).unwrap().is_none());
  }

  #[test]
  fn masked_frames_are_unmasked() {
    let key = [0x37, 0xfa, 0x21, 0x3d];
    let plain = b"Hello";
    let mut buf = BytesMut::new();
    buf.put_u8(0x81);
    buf.put_u8(MASK_BIT | plain.len() as u8);
    buf.put_slice(&key);
    for (i, b) in plain.iter().enumerate() {
      buf.put_u8(b ^ key[i % 4]);
    }
    let frame = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
    assert_eq!(frame.opcode, OpCode::Text);
    assert_eq!(&frame.payload[..], plain);
  }

  #[test]
  fn fragments_are_reassembled_around_control_frames() {
    let mut buf = encode(Frame {
      fin: false,
      opcode: OpCode::Binary,
      payload: Bytes::from_static(b"ab"),
    });
    buf.extend_from_slice(&encode(Frame::control(OpCode::Ping, &b"p"[..])));
    buf.extend_from_slice(&encode(Frame {
      fin: true,
      opcode: OpCode::Continuation,
      payload: Bytes::from_static(b"cd"),
    }));

    let mut codec = FrameCodec::default();
    let ping = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(ping.opcode, OpCode::Ping);
    let data = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(data.opcode, OpCode::Binary);
    assert_eq!(&data.payload[..], b"abcd");
  }

  #[test]
  fn header_violations_are_protocol_errors() {
    let mut codec = FrameCodec::default();
    // RSV1 set
    let mut buf = BytesMut::from(&[0xC2u8, 0x00][..]);
    assert!(matches!(codec.decode(&mut buf), Err(MailboxError::Protocol(_))));

    // fragmented ping
    let mut buf = BytesMut::from(&[0x09u8, 0x00][..]);
    assert!(matches!(FrameCodec::default().decode(&mut buf), Err(MailboxError::Protocol(_))));

    // continuation with nothing to continue
    let mut buf = BytesMut::from(&[0x80u8, 0x00][..]);
    assert!(matches!(FrameCodec::default().decode(&mut buf), Err(MailboxError::Protocol(_))));

    // payload over the configured limit, detected from the header alone
    let mut small = FrameCodec::new(16);
    let mut buf = BytesMut::from(&[0x82u8, 17][..]);
    assert!(matches!(small.decode(&mut buf), Err(MailboxError::Protocol(_))));
  }

  #[test]
  fn oversized_control_frames_are_not_encoded() {
    let mut codec = FrameCodec::default();
    let mut dst = BytesMut::new();
    let err = codec
      .encode(Frame::control(OpCode::Pong, vec![0u8; 126]), &mut dst)
      .unwrap_err();
    assert!(matches!(err, MailboxError::Protocol(_)));
    assert!(dst.is_empty());
  }
}
