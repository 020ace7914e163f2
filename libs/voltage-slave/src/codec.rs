//! Frame codecs for the three Modbus transports
//!
//! Each codec implements [`tokio_util::codec::Decoder`] / [`Encoder`] over
//! [`Adu`]. Per-frame failures (CRC, LRC, bad hex) are logged and counted
//! inside the codec and never end the stream; only errors that leave the
//! stream position unknown ([`FrameError::corrupts_stream`]) are returned.

pub mod ascii;
pub mod rtu;
pub mod tcp;

use bytes::BytesMut;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};

pub use ascii::AsciiCodec;
pub use rtu::{CharTiming, RtuCodec, RtuFramer};
pub use tcp::TcpCodec;

use crate::error::FrameError;
use crate::types::Adu;

/// Calculate Modbus CRC16 (polynomial 0xA001 reflected, initial value 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Calculate Modbus LRC: two's complement of the byte sum modulo 256
pub fn lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Codec of a serial line, selected once at startup
#[derive(Debug)]
pub enum SerialCodec {
    Rtu(RtuCodec),
    Ascii(AsciiCodec),
}

impl SerialCodec {
    /// Frames dropped since the last call
    pub fn take_dropped(&mut self) -> u64 {
        match self {
            SerialCodec::Rtu(codec) => codec.take_dropped(),
            SerialCodec::Ascii(codec) => codec.take_dropped(),
        }
    }

    /// Silence deadline of a frame in progress (RTU only)
    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            SerialCodec::Rtu(codec) => codec.next_deadline(),
            SerialCodec::Ascii(_) => None,
        }
    }

    /// Complete a frame whose silence interval has elapsed (RTU only)
    pub fn poll_silence(&mut self, now: Instant) -> Option<Adu> {
        match self {
            SerialCodec::Rtu(codec) => codec.poll_silence(now),
            SerialCodec::Ascii(_) => None,
        }
    }

    /// Discard any partial frame held by the codec
    pub fn reset(&mut self) {
        match self {
            SerialCodec::Rtu(codec) => codec.reset(),
            SerialCodec::Ascii(codec) => codec.reset(),
        }
    }

    /// Whether a frame is partially received
    pub fn in_frame(&self) -> bool {
        match self {
            SerialCodec::Rtu(codec) => codec.in_frame(),
            SerialCodec::Ascii(codec) => codec.in_frame(),
        }
    }
}

impl Decoder for SerialCodec {
    type Item = Adu;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Adu>, FrameError> {
        match self {
            SerialCodec::Rtu(codec) => codec.decode(src),
            SerialCodec::Ascii(codec) => codec.decode(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Adu>, FrameError> {
        match self {
            SerialCodec::Rtu(codec) => codec.decode_eof(src),
            SerialCodec::Ascii(codec) => codec.decode_eof(src),
        }
    }
}

impl Encoder<Adu> for SerialCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Adu, dst: &mut BytesMut) -> Result<(), FrameError> {
        match self {
            SerialCodec::Rtu(codec) => codec.encode(item, dst),
            SerialCodec::Ascii(codec) => codec.encode(item, dst),
        }
    }
}
