//! Modbus RTU framing
//!
//! RTU has no delimiters and no length field. Frame boundaries come from line
//! silence, measured in character times:
//! - 3.5 character times without a byte ends the frame in progress
//! - a gap of 1.5 up to 3.5 character times inside a frame invalidates it, the
//!   byte after the gap starts a new frame
//!
//! [`RtuFramer`] is the pure timing state machine; [`RtuCodec`] feeds it from a
//! byte stream and validates the CRC of every completed frame.

use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use super::crc16;
use crate::constants::{MAX_PDU_SIZE, MAX_RTU_FRAME, MIN_RTU_FRAME};
use crate::error::FrameError;
use crate::pdu::Pdu;
use crate::types::{Address, Adu};

/// Bits per RTU character: start + 8 data + parity (or second stop) + stop
const BITS_PER_CHAR: u64 = 11;

/// Above this baud rate the protocol fixes the inter-character timers
const FIXED_TIMING_BAUD: u32 = 19200;

/// Character timing of a serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharTiming {
    /// Time to transmit one character
    pub char_time: Duration,
    /// Maximum gap between two characters of one frame
    pub t15: Duration,
    /// Minimum silence between two frames
    pub t35: Duration,
}

impl CharTiming {
    pub fn for_baud(baud_rate: u32) -> Self {
        let baud = u64::from(baud_rate.max(1));
        let char_time = Duration::from_nanos(BITS_PER_CHAR * 1_000_000_000 / baud);

        if baud_rate > FIXED_TIMING_BAUD {
            Self {
                char_time,
                t15: Duration::from_micros(750),
                t35: Duration::from_micros(1750),
            }
        } else {
            Self {
                char_time,
                t15: char_time * 3 / 2,
                t35: char_time * 7 / 2,
            }
        }
    }

    /// Time the line is busy sending `bytes` characters
    pub fn transmit_time(&self, bytes: usize) -> Duration {
        self.char_time * bytes as u32
    }
}

/// Silence-based frame boundary detection
#[derive(Debug)]
pub struct RtuFramer {
    timing: CharTiming,
    buf: BytesMut,
    /// Arrival time of the last byte of the frame in progress
    last_byte: Option<Instant>,
    /// Bytes received for the current frame, including those beyond the buffer limit
    received: usize,
}

impl RtuFramer {
    pub fn new(timing: CharTiming) -> Self {
        Self {
            timing,
            buf: BytesMut::with_capacity(MAX_RTU_FRAME),
            last_byte: None,
            received: 0,
        }
    }

    pub fn timing(&self) -> CharTiming {
        self.timing
    }

    /// Feed bytes that arrived together at `now`
    ///
    /// The chunk is taken as sent back-to-back, its last byte ending at `now`,
    /// so the line silence before it excludes its own transmit time. Returns
    /// the previous frame if that silence ended it, or
    /// [`FrameError::Interrupted`] if it invalidated it.
    pub fn push(&mut self, data: &[u8], now: Instant) -> Option<Result<BytesMut, FrameError>> {
        if data.is_empty() {
            return None;
        }

        let mut event = None;
        if let Some(last) = self.last_byte {
            let gap = now
                .saturating_duration_since(last)
                .saturating_sub(self.timing.transmit_time(data.len()));
            if gap >= self.timing.t35 {
                event = self.finish();
            } else if gap >= self.timing.t15 {
                debug!("RTU frame interrupted after {} bytes, gap {:?}", self.received, gap);
                self.reset();
                event = Some(Err(FrameError::Interrupted));
            }
        }

        let room = MAX_RTU_FRAME.saturating_sub(self.buf.len());
        self.buf.put_slice(&data[..data.len().min(room)]);
        self.received += data.len();
        self.last_byte = Some(now);

        event
    }

    /// Complete the frame in progress if 3.5 character times have passed
    pub fn poll_silence(&mut self, now: Instant) -> Option<Result<BytesMut, FrameError>> {
        let deadline = self.next_deadline()?;
        if now >= deadline {
            self.finish()
        } else {
            None
        }
    }

    /// When the frame in progress will be complete if no more bytes arrive
    pub fn next_deadline(&self) -> Option<Instant> {
        self.last_byte.map(|last| last + self.timing.t35)
    }

    /// Whether a frame is partially received
    pub fn in_frame(&self) -> bool {
        self.last_byte.is_some()
    }

    /// Drop the frame in progress
    pub fn reset(&mut self) {
        self.buf.clear();
        self.last_byte = None;
        self.received = 0;
    }

    /// Hand out the buffered frame and start over
    pub fn finish(&mut self) -> Option<Result<BytesMut, FrameError>> {
        self.last_byte?;
        let received = self.received;
        let frame = self.buf.split();
        self.reset();

        if received > MAX_RTU_FRAME {
            Some(Err(FrameError::TooLong(received)))
        } else {
            Some(Ok(frame))
        }
    }
}

/// Modbus RTU codec: `[address][function code][payload][CRC16 little-endian]`
#[derive(Debug)]
pub struct RtuCodec {
    framer: RtuFramer,
    dropped: u64,
}

impl RtuCodec {
    pub fn new(baud_rate: u32) -> Self {
        Self::with_timing(CharTiming::for_baud(baud_rate))
    }

    pub fn with_timing(timing: CharTiming) -> Self {
        Self {
            framer: RtuFramer::new(timing),
            dropped: 0,
        }
    }

    pub fn timing(&self) -> CharTiming {
        self.framer.timing()
    }

    /// Validate one complete RTU frame
    pub fn decode_frame(frame: &[u8]) -> Result<Adu, FrameError> {
        if frame.len() < MIN_RTU_FRAME {
            return Err(FrameError::TooShort(frame.len()));
        }
        if frame.len() > MAX_RTU_FRAME {
            return Err(FrameError::TooLong(frame.len()));
        }

        let crc_pos = frame.len() - 2;
        let actual = u16::from_le_bytes([frame[crc_pos], frame[crc_pos + 1]]);
        let expected = crc16(&frame[..crc_pos]);
        if actual != expected {
            return Err(FrameError::Crc { expected, actual });
        }

        let pdu = Pdu::from_slice(&frame[1..crc_pos])?;
        Ok(Adu::serial(Address(frame[0]), pdu))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.framer.next_deadline()
    }

    pub fn poll_silence(&mut self, now: Instant) -> Option<Adu> {
        let event = self.framer.poll_silence(now)?;
        self.accept(event)
    }

    pub fn reset(&mut self) {
        self.framer.reset();
    }

    pub fn in_frame(&self) -> bool {
        self.framer.in_frame()
    }

    /// Frames dropped since the last call
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    fn accept(&mut self, event: Result<BytesMut, FrameError>) -> Option<Adu> {
        match event.and_then(|frame| Self::decode_frame(&frame)) {
            Ok(adu) => {
                debug!(
                    "RTU frame: slave={}, fc=0x{:02X}, {} bytes",
                    adu.address(),
                    adu.pdu.function_code(),
                    adu.pdu.len()
                );
                Some(adu)
            },
            Err(e) => {
                warn!("RTU frame dropped: {}", e);
                self.dropped += 1;
                None
            },
        }
    }
}

impl Decoder for RtuCodec {
    type Item = Adu;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Adu>, FrameError> {
        if src.is_empty() {
            return Ok(None);
        }
        let data = src.split();
        match self.framer.push(&data, Instant::now()) {
            Some(event) => Ok(self.accept(event)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Adu>, FrameError> {
        if let Some(adu) = self.decode(src)? {
            return Ok(Some(adu));
        }
        match self.framer.finish() {
            Some(event) => Ok(self.accept(event)),
            None => Ok(None),
        }
    }
}

impl Encoder<Adu> for RtuCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Adu, dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.pdu.len() > MAX_PDU_SIZE {
            return Err(FrameError::TooLong(item.pdu.len()));
        }

        let start = dst.len();
        dst.reserve(1 + item.pdu.len() + 2);
        dst.put_u8(item.address().value());
        item.pdu.write_to(dst);
        let crc = crc16(&dst[start..]);
        dst.put_u16_le(crc);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut data = body.to_vec();
        data.extend_from_slice(&crc16(body).to_le_bytes());
        data
    }

    // ========================================================================
    // Timing
    // ========================================================================

    #[test]
    fn test_char_timing_9600() {
        let timing = CharTiming::for_baud(9600);
        // 11 bits at 9600 baud = 1145.8 us
        assert_eq!(timing.char_time, Duration::from_nanos(1_145_833));
        assert_eq!(timing.t15, timing.char_time * 3 / 2);
        assert_eq!(timing.t35, timing.char_time * 7 / 2);
    }

    #[test]
    fn test_char_timing_fixed_above_19200() {
        let timing = CharTiming::for_baud(115_200);
        assert_eq!(timing.t15, Duration::from_micros(750));
        assert_eq!(timing.t35, Duration::from_micros(1750));
    }

    #[test]
    fn test_transmit_time() {
        let timing = CharTiming::for_baud(9600);
        assert_eq!(timing.transmit_time(8), timing.char_time * 8);
    }

    // ========================================================================
    // Framer
    // ========================================================================

    #[test]
    fn test_silence_completes_frame() {
        let timing = CharTiming::for_baud(9600);
        let mut framer = RtuFramer::new(timing);
        let t0 = Instant::now();

        assert!(framer.push(&[0x01, 0x03], t0).is_none());
        assert!(framer.push(&[0x00, 0x00], t0 + timing.char_time).is_none());
        assert_eq!(framer.next_deadline(), Some(t0 + timing.char_time + timing.t35));

        // Not yet silent long enough
        assert!(framer
            .poll_silence(t0 + timing.char_time + timing.t15)
            .is_none());

        let done = framer
            .poll_silence(t0 + timing.char_time + timing.t35)
            .unwrap()
            .unwrap();
        assert_eq!(done.as_ref(), &[0x01, 0x03, 0x00, 0x00]);
        assert!(!framer.in_frame());
        assert!(framer.next_deadline().is_none());
    }

    #[test]
    fn test_intra_frame_gap_invalidates() {
        let timing = CharTiming::for_baud(9600);
        let mut framer = RtuFramer::new(timing);
        let t0 = Instant::now();

        framer.push(&[0x01, 0x03, 0x00], t0);
        let late = t0 + timing.char_time + timing.t15;
        let event = framer.push(&[0x11], late);
        assert_eq!(event, Some(Err(FrameError::Interrupted)));

        // The byte after the gap starts a new frame
        let done = framer.poll_silence(late + timing.t35).unwrap().unwrap();
        assert_eq!(done.as_ref(), &[0x11]);
    }

    #[test]
    fn test_late_byte_completes_previous_frame() {
        let timing = CharTiming::for_baud(19200);
        let mut framer = RtuFramer::new(timing);
        let t0 = Instant::now();

        framer.push(&[0x01, 0x07], t0);
        let previous = framer
            .push(&[0x02], t0 + timing.char_time + timing.t35)
            .unwrap()
            .unwrap();
        assert_eq!(previous.as_ref(), &[0x01, 0x07]);
        assert!(framer.in_frame());
    }

    #[test]
    fn test_chunked_reads_keep_frame_whole() {
        let timing = CharTiming::for_baud(9600);
        let mut framer = RtuFramer::new(timing);
        let t0 = Instant::now();

        // Continuous transmission delivered in two reads
        assert!(framer.push(&[0x01, 0x03, 0x00, 0x00], t0).is_none());
        let t1 = t0 + timing.transmit_time(4);
        assert!(framer.push(&[0x00, 0x01, 0x84, 0x0A], t1).is_none());

        let done = framer.poll_silence(t1 + timing.t35).unwrap().unwrap();
        assert_eq!(done.as_ref(), &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_two_byte_read_not_a_gap() {
        let timing = CharTiming::for_baud(9600);
        let mut framer = RtuFramer::new(timing);
        let t0 = Instant::now();

        framer.push(&[0x01, 0x03], t0);
        assert!(framer.push(&[0x00, 0x00], t0 + timing.transmit_time(2)).is_none());
        assert!(framer.in_frame());
    }

    #[test]
    fn test_oversized_frame_reported() {
        let timing = CharTiming::for_baud(9600);
        let mut framer = RtuFramer::new(timing);
        let t0 = Instant::now();

        framer.push(&[0u8; MAX_RTU_FRAME + 10], t0);
        let event = framer.poll_silence(t0 + timing.t35).unwrap();
        assert_eq!(event, Err(FrameError::TooLong(MAX_RTU_FRAME + 10)));
    }

    // ========================================================================
    // Frame validation
    // ========================================================================

    #[test]
    fn test_decode_valid_frame() {
        let data = frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&data[6..], &[0x84, 0x0A]);

        let adu = RtuCodec::decode_frame(&data).unwrap();
        assert_eq!(adu.address(), Address(1));
        assert_eq!(adu.pdu.function_code(), 0x03);
        assert_eq!(adu.pdu.payload(), &[0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_decode_corrupted_crc() {
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0xFF, 0xFF];
        assert_eq!(
            RtuCodec::decode_frame(&data),
            Err(FrameError::Crc {
                expected: 0x0A84,
                actual: 0xFFFF
            })
        );
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            RtuCodec::decode_frame(&[0x01, 0x03, 0x00]),
            Err(FrameError::TooShort(3))
        );
    }

    #[test]
    fn test_encode_appends_crc() {
        let mut codec = RtuCodec::new(9600);
        let mut dst = BytesMut::new();
        let adu = Adu::serial(Address(1), Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01]));
        codec.encode(adu, &mut dst).unwrap();
        assert_eq!(dst.as_ref(), &frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01])[..]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_decoder_drops_bad_crc() {
        let mut codec = RtuCodec::new(9600);
        let mut src = BytesMut::from(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00][..]);

        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());

        tokio::time::advance(codec.timing().t35).await;
        assert!(codec.poll_silence(Instant::now()).is_none());
        assert_eq!(codec.take_dropped(), 1);
        assert_eq!(codec.take_dropped(), 0);
        assert!(logs_contain("RTU frame dropped: CRC"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decoder_emits_on_silence() {
        let mut codec = RtuCodec::new(9600);
        let mut src = BytesMut::from(&frame(&[0x05, 0x07])[..]);

        assert!(codec.decode(&mut src).unwrap().is_none());
        tokio::time::advance(codec.timing().t35).await;

        let adu = codec.poll_silence(Instant::now()).unwrap();
        assert_eq!(adu.address(), Address(5));
        assert_eq!(adu.pdu.function_code(), 0x07);
    }
}
