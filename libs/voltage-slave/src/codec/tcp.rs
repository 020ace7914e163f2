//! Modbus TCP framing (MBAP header)
//!
//! `[transaction id:2][protocol id:2 = 0][length:2][unit id:1][function code:1][payload]`,
//! where length counts the unit id and the PDU. The decoder buffers until the
//! declared length is available; a bad protocol id or length leaves the stream
//! position unknown and is returned as an error so the session closes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::constants::{MAX_MBAP_LENGTH, MAX_PDU_SIZE, MBAP_HEADER_LEN, MIN_MBAP_LENGTH};
use crate::error::FrameError;
use crate::pdu::Pdu;
use crate::types::{Address, Adu, FrameHeader, TransactionContext};

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Length field
    pub length: u16,
    /// Unit identifier (slave ID)
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse the 7 header bytes
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(FrameError::TooShort(data.len()));
        }

        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };

        if header.protocol_id != 0 {
            return Err(FrameError::InvalidProtocolId(header.protocol_id));
        }
        let length = usize::from(header.length);
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(FrameError::InvalidLength(header.length));
        }

        Ok(header)
    }

    /// Total frame size: 6 header bytes before the length-counted part
    pub fn frame_len(&self) -> usize {
        MBAP_HEADER_LEN - 1 + usize::from(self.length)
    }
}

/// Modbus TCP codec
#[derive(Debug, Default)]
pub struct TcpCodec;

impl TcpCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for TcpCodec {
    type Item = Adu;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Adu>, FrameError> {
        if src.len() < MBAP_HEADER_LEN {
            src.reserve(MBAP_HEADER_LEN - src.len());
            return Ok(None);
        }

        let header = MbapHeader::parse(&src[..MBAP_HEADER_LEN])?;
        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(frame_len);
        let pdu = Pdu::from_slice(&frame[MBAP_HEADER_LEN..])?;
        debug!(
            "TCP frame: tid={}, unit={}, fc=0x{:02X}, {} bytes",
            header.transaction_id,
            header.unit_id,
            pdu.function_code(),
            pdu.len()
        );

        Ok(Some(Adu::tcp(
            TransactionContext {
                transaction_id: header.transaction_id,
                unit_id: Address(header.unit_id),
            },
            pdu,
        )))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Adu>, FrameError> {
        match self.decode(src)? {
            Some(adu) => Ok(Some(adu)),
            None => {
                // Partial frame of a closed connection is discarded
                if !src.is_empty() {
                    debug!("Discarding {} bytes of incomplete TCP frame", src.len());
                    src.advance(src.len());
                }
                Ok(None)
            },
        }
    }
}

impl Encoder<Adu> for TcpCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Adu, dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.pdu.len() > MAX_PDU_SIZE {
            return Err(FrameError::TooLong(item.pdu.len()));
        }

        let ctx = match item.header {
            FrameHeader::Tcp(ctx) => ctx,
            FrameHeader::Serial { address } => TransactionContext {
                transaction_id: 0,
                unit_id: address,
            },
        };

        dst.reserve(MBAP_HEADER_LEN + item.pdu.len());
        dst.put_u16(ctx.transaction_id);
        dst.put_u16(0);
        dst.put_u16((1 + item.pdu.len()) as u16);
        dst.put_u8(ctx.unit_id.value());
        item.pdu.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const REQUEST: &[u8] = &[
        0x00, 0x01, // Transaction ID
        0x00, 0x00, // Protocol ID
        0x00, 0x06, // Length
        0x01, // Unit ID
        0x03, 0x00, 0x00, 0x00, 0x05, // PDU
    ];

    #[test]
    fn test_decode_complete_frame() {
        let mut codec = TcpCodec::new();
        let mut src = BytesMut::from(REQUEST);
        let adu = codec.decode(&mut src).unwrap().unwrap();

        assert_eq!(
            adu.header,
            FrameHeader::Tcp(TransactionContext {
                transaction_id: 1,
                unit_id: Address(1)
            })
        );
        assert_eq!(adu.pdu.function_code(), 0x03);
        assert_eq!(adu.pdu.payload(), &[0x00, 0x00, 0x00, 0x05]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_decode_buffers_partial_reads() {
        let mut codec = TcpCodec::new();
        let mut src = BytesMut::new();

        for chunk in REQUEST.chunks(5) {
            assert!(src.is_empty() || codec.decode(&mut src).unwrap().is_none());
            src.extend_from_slice(chunk);
        }
        assert!(codec.decode(&mut src).unwrap().is_some());
    }

    #[test]
    fn test_decode_pipelined_frames() {
        let mut codec = TcpCodec::new();
        let mut src = BytesMut::from(REQUEST);
        let mut second = REQUEST.to_vec();
        second[1] = 0x02;
        src.extend_from_slice(&second);

        let first = codec.decode(&mut src).unwrap().unwrap();
        let next = codec.decode(&mut src).unwrap().unwrap();
        assert!(matches!(first.header, FrameHeader::Tcp(ctx) if ctx.transaction_id == 1));
        assert!(matches!(next.header, FrameHeader::Tcp(ctx) if ctx.transaction_id == 2));
    }

    #[test]
    fn test_invalid_protocol_id() {
        let mut codec = TcpCodec::new();
        let mut data = REQUEST.to_vec();
        data[3] = 0x01;
        let err = codec.decode(&mut BytesMut::from(&data[..])).unwrap_err();
        assert_eq!(err, FrameError::InvalidProtocolId(1));
        assert!(err.corrupts_stream());
    }

    #[test]
    fn test_invalid_length() {
        let mut codec = TcpCodec::new();
        let mut data = REQUEST.to_vec();
        data[4] = 0x01; // 0x0106 > 254
        assert_eq!(
            codec.decode(&mut BytesMut::from(&data[..])).unwrap_err(),
            FrameError::InvalidLength(0x0106)
        );

        data[4] = 0x00;
        data[5] = 0x01;
        assert_eq!(
            codec.decode(&mut BytesMut::from(&data[..])).unwrap_err(),
            FrameError::InvalidLength(1)
        );
    }

    #[test]
    fn test_encode_echoes_transaction() {
        let mut codec = TcpCodec::new();
        let mut dst = BytesMut::new();
        let ctx = TransactionContext {
            transaction_id: 0xBEEF,
            unit_id: Address(9),
        };
        codec
            .encode(Adu::tcp(ctx, Pdu::new(0x83, vec![0x02])), &mut dst)
            .unwrap();
        assert_eq!(
            dst.as_ref(),
            &[0xBE, 0xEF, 0x00, 0x00, 0x00, 0x03, 0x09, 0x83, 0x02]
        );
    }

    #[test]
    fn test_eof_discards_partial() {
        let mut codec = TcpCodec::new();
        let mut src = BytesMut::from(&REQUEST[..9]);
        assert!(codec.decode_eof(&mut src).unwrap().is_none());
        assert!(src.is_empty());
    }
}
