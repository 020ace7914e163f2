//! Modbus ASCII framing
//!
//! Frame: `:` + hex(`[address][function code][payload][LRC]`) + CR LF.
//! Hex digits are accepted in either case and emitted in upper case. A `:`
//! inside a frame restarts reception at that character.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use super::lrc;
use crate::constants::{MAX_ASCII_FRAME, MAX_PDU_SIZE};
use crate::error::FrameError;
use crate::pdu::Pdu;
use crate::types::{Address, Adu};

const FRAME_START: u8 = b':';
const CR: u8 = b'\r';
const LF: u8 = b'\n';
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Modbus ASCII codec
#[derive(Debug, Default)]
pub struct AsciiCodec {
    /// A `:` has been seen and the frame is not yet terminated
    in_frame: bool,
    dropped: u64,
}

impl AsciiCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the characters between `:` and CR LF
    pub fn decode_frame(body: &[u8]) -> Result<Adu, FrameError> {
        if body.len() % 2 != 0 {
            return Err(FrameError::OddHexLength(body.len()));
        }

        let bytes = body
            .chunks_exact(2)
            .map(|pair| Ok((hex_value(pair[0])? << 4) | hex_value(pair[1])?))
            .collect::<Result<Vec<u8>, FrameError>>()?;

        // address + function code + LRC
        if bytes.len() < 3 {
            return Err(FrameError::TooShort(bytes.len()));
        }

        let (data, checksum) = bytes.split_at(bytes.len() - 1);
        let expected = lrc(data);
        if checksum[0] != expected {
            return Err(FrameError::Lrc {
                expected,
                actual: checksum[0],
            });
        }

        let pdu = Pdu::from_slice(&data[1..])?;
        Ok(Adu::serial(Address(data[0]), pdu))
    }

    pub fn reset(&mut self) {
        self.in_frame = false;
    }

    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    /// Frames dropped since the last call
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    fn drop_frame(&mut self, err: FrameError) {
        warn!("ASCII frame dropped: {}", err);
        self.dropped += 1;
    }
}

fn hex_value(c: u8) -> Result<u8, FrameError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(FrameError::InvalidHex(c)),
    }
}

impl Decoder for AsciiCodec {
    type Item = Adu;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Adu>, FrameError> {
        loop {
            // Resynchronise on the start character
            let Some(start) = src.iter().position(|&b| b == FRAME_START) else {
                src.clear();
                self.in_frame = false;
                return Ok(None);
            };
            if start > 0 {
                if self.in_frame {
                    self.drop_frame(FrameError::Interrupted);
                }
                src.advance(start);
            }
            self.in_frame = true;

            // src[0] is the ':' of the frame in progress
            let body = &src[1..];
            if let Some(restart) = body.iter().position(|&b| b == FRAME_START) {
                if !body[..restart].contains(&LF) {
                    self.drop_frame(FrameError::Interrupted);
                    src.advance(1 + restart);
                    continue;
                }
            }

            let Some(lf) = body.iter().position(|&b| b == LF) else {
                if src.len() > MAX_ASCII_FRAME {
                    self.drop_frame(FrameError::TooLong(src.len()));
                    src.clear();
                    self.in_frame = false;
                }
                return Ok(None);
            };

            let frame = src.split_to(1 + lf + 1);
            self.in_frame = false;

            let inner = &frame[1..frame.len() - 1];
            let result = match inner.split_last() {
                Some((&CR, hex)) => Self::decode_frame(hex),
                _ => Err(FrameError::TooShort(inner.len())),
            };

            match result {
                Ok(adu) => {
                    debug!(
                        "ASCII frame: slave={}, fc=0x{:02X}, {} bytes",
                        adu.address(),
                        adu.pdu.function_code(),
                        adu.pdu.len()
                    );
                    return Ok(Some(adu));
                },
                Err(e) => self.drop_frame(e),
            }
        }
    }
}

impl Encoder<Adu> for AsciiCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Adu, dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.pdu.len() > MAX_PDU_SIZE {
            return Err(FrameError::TooLong(item.pdu.len()));
        }

        let mut raw = BytesMut::with_capacity(1 + item.pdu.len() + 1);
        raw.put_u8(item.address().value());
        item.pdu.write_to(&mut raw);
        let checksum = lrc(&raw);
        raw.put_u8(checksum);

        dst.reserve(1 + raw.len() * 2 + 2);
        dst.put_u8(FRAME_START);
        for &b in raw.iter() {
            dst.put_u8(HEX_DIGITS[usize::from(b >> 4)]);
            dst.put_u8(HEX_DIGITS[usize::from(b & 0x0F)]);
        }
        dst.put_slice(&[CR, LF]);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    // Read holding registers, slave 0x11, start 0x006B, count 3: LRC 0x7E
    const REQUEST: &[u8] = b":1103006B00037E\r\n";

    #[test]
    fn test_decode_frame() {
        let mut codec = AsciiCodec::new();
        let mut src = BytesMut::from(REQUEST);
        let adu = codec.decode(&mut src).unwrap().unwrap();

        assert_eq!(adu.address(), Address(0x11));
        assert_eq!(adu.pdu.function_code(), 0x03);
        assert_eq!(adu.pdu.payload(), &[0x00, 0x6B, 0x00, 0x03]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        let upper = AsciiCodec::decode_frame(b"1103006B00037E").unwrap();
        let lower = AsciiCodec::decode_frame(b"1103006b00037e").unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn test_decode_bad_lrc_dropped() {
        let mut codec = AsciiCodec::new();
        let mut src = BytesMut::from(&b":1103006B00037F\r\n"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(codec.take_dropped(), 1);
        assert_eq!(
            AsciiCodec::decode_frame(b"1103006B00037F"),
            Err(FrameError::Lrc {
                expected: 0x7E,
                actual: 0x7F
            })
        );
    }

    #[test]
    fn test_decode_invalid_hex() {
        assert_eq!(
            AsciiCodec::decode_frame(b"11G3006B00037E"),
            Err(FrameError::InvalidHex(b'G'))
        );
    }

    #[test]
    fn test_decode_odd_length() {
        assert_eq!(
            AsciiCodec::decode_frame(b"1103006B00037"),
            Err(FrameError::OddHexLength(13))
        );
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = AsciiCodec::new();
        let mut src = BytesMut::from(&REQUEST[..8]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(codec.in_frame());

        src.extend_from_slice(&REQUEST[8..]);
        assert!(codec.decode(&mut src).unwrap().is_some());
        assert!(!codec.in_frame());
    }

    #[test]
    fn test_garbage_before_start_skipped() {
        let mut codec = AsciiCodec::new();
        let mut src = BytesMut::from(&b"xx\r\n"[..]);
        src.extend_from_slice(REQUEST);
        assert!(codec.decode(&mut src).unwrap().is_some());
        assert_eq!(codec.take_dropped(), 0);
    }

    #[test]
    fn test_colon_restarts_frame() {
        let mut codec = AsciiCodec::new();
        let mut src = BytesMut::from(&b":1103"[..]);
        src.extend_from_slice(REQUEST);
        let adu = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(adu.pdu.payload(), &[0x00, 0x6B, 0x00, 0x03]);
        assert_eq!(codec.take_dropped(), 1);
    }

    #[test]
    fn test_missing_cr_dropped() {
        let mut codec = AsciiCodec::new();
        let mut src = BytesMut::from(&b":1103006B00037E\n"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert_eq!(codec.take_dropped(), 1);
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = AsciiCodec::new();
        let mut src = BytesMut::from(REQUEST);
        src.extend_from_slice(REQUEST);
        assert!(codec.decode(&mut src).unwrap().is_some());
        assert!(codec.decode(&mut src).unwrap().is_some());
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_encode_upper_case() {
        let mut codec = AsciiCodec::new();
        let mut dst = BytesMut::new();
        let adu = Adu::serial(Address(0x11), Pdu::new(0x03, vec![0x00, 0x6B, 0x00, 0x03]));
        codec.encode(adu, &mut dst).unwrap();
        assert_eq!(dst.as_ref(), REQUEST);
    }
}
