//! Modbus PDU data structure
//!
//! A PDU is a function code plus its payload. Request and response PDUs are
//! distinct immutable values; the payload is a cheaply clonable [`Bytes`].

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::constants::{self, EXCEPTION_FLAG, MAX_PDU_SIZE};
use crate::error::FrameError;

/// Modbus exception codes sent back to the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
}

impl ExceptionCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::SlaveDeviceFailure => "Slave Device Failure",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.code())
    }
}

/// Protocol data unit: function code + payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    function_code: u8,
    payload: Bytes,
}

impl Pdu {
    /// Create a PDU from its parts
    pub fn new(function_code: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            function_code,
            payload: payload.into(),
        }
    }

    /// Parse a PDU from raw bytes (function code first)
    pub fn from_slice(data: &[u8]) -> Result<Self, FrameError> {
        let (&function_code, payload) = data.split_first().ok_or(FrameError::TooShort(0))?;
        if data.len() > MAX_PDU_SIZE {
            return Err(FrameError::TooLong(data.len()));
        }
        Ok(Self {
            function_code,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Build an exception response for `function_code`
    pub fn exception(function_code: u8, code: ExceptionCode) -> Self {
        Self {
            function_code: function_code | EXCEPTION_FLAG,
            payload: Bytes::copy_from_slice(&[code.code()]),
        }
    }

    #[inline]
    pub fn function_code(&self) -> u8 {
        self.function_code
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encoded length: function code + payload
    #[inline]
    pub fn len(&self) -> usize {
        1 + self.payload.len()
    }

    /// A PDU always carries a function code
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Exception code carried by an exception response
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.payload.first().copied()
        } else {
            None
        }
    }

    /// Append function code and payload to `dst`
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.len());
        dst.put_u8(self.function_code);
        dst.put_slice(&self.payload);
    }

    /// Function code and payload as one contiguous buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Human-readable function code description
    pub fn function_code_description(fc: u8) -> &'static str {
        match fc & !EXCEPTION_FLAG {
            constants::FC_READ_COILS => "Read Coils",
            constants::FC_READ_DISCRETE_INPUTS => "Read Discrete Inputs",
            constants::FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
            constants::FC_READ_INPUT_REGISTERS => "Read Input Registers",
            constants::FC_WRITE_SINGLE_COIL => "Write Single Coil",
            constants::FC_WRITE_SINGLE_REGISTER => "Write Single Register",
            constants::FC_READ_EXCEPTION_STATUS => "Read Exception Status",
            constants::FC_DIAGNOSTICS => "Diagnostics",
            constants::FC_WRITE_MULTIPLE_COILS => "Write Multiple Coils",
            constants::FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
            constants::FC_REPORT_SLAVE_ID => "Report Slave ID",
            constants::FC_READ_FILE_RECORD => "Read File Record",
            constants::FC_WRITE_FILE_RECORD => "Write File Record",
            constants::FC_MASK_WRITE_REGISTER => "Mask Write Register",
            constants::FC_READ_WRITE_REGISTERS => "Read/Write Multiple Registers",
            constants::FC_ENCAPSULATED_INTERFACE => "Encapsulated Interface Transport",
            _ => "Unknown Function",
        }
    }
}

/// Response PDU builder - fluent API
pub struct PduBuilder {
    function_code: u8,
    payload: BytesMut,
}

impl PduBuilder {
    #[inline]
    pub fn new(function_code: u8) -> Self {
        Self {
            function_code,
            payload: BytesMut::with_capacity(MAX_PDU_SIZE - 1),
        }
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.put_u8(b);
        self
    }

    /// Add u16 in big-endian
    #[inline]
    pub fn word(mut self, value: u16) -> Self {
        self.payload.put_u16(value);
        self
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> Self {
        self.payload.put_slice(data);
        self
    }

    /// Add registers in big-endian
    pub fn registers(mut self, values: &[u16]) -> Self {
        for &value in values {
            self.payload.put_u16(value);
        }
        self
    }

    /// Current payload length (function code excluded)
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn build(self) -> Pdu {
        Pdu {
            function_code: self.function_code,
            payload: self.payload.freeze(),
        }
    }
}

/// Pack bits LSB-first into bytes, the Modbus coil layout
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, _) in bits.iter().enumerate().filter(|(_, &on)| on) {
        bytes[i / 8] |= 1 << (i % 8);
    }
    bytes
}

/// Unpack `count` LSB-first bits; `bytes` must hold at least `ceil(count / 8)` bytes
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

/// Decode big-endian registers
pub fn unpack_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_pdu_from_slice() {
        let pdu = Pdu::from_slice(&[0x03, 0x00, 0x01, 0x00, 0x02]).unwrap();
        assert_eq!(pdu.function_code(), 0x03);
        assert_eq!(pdu.payload(), &[0x00, 0x01, 0x00, 0x02]);
        assert_eq!(pdu.len(), 5);
        assert!(!pdu.is_exception());
    }

    #[test]
    fn test_pdu_from_empty_slice() {
        assert_eq!(Pdu::from_slice(&[]), Err(FrameError::TooShort(0)));
    }

    #[test]
    fn test_pdu_too_large() {
        let data = vec![0x10; MAX_PDU_SIZE + 1];
        assert_eq!(
            Pdu::from_slice(&data),
            Err(FrameError::TooLong(MAX_PDU_SIZE + 1))
        );
    }

    #[test]
    fn test_exception_pdu() {
        let pdu = Pdu::exception(99, ExceptionCode::IllegalFunction);
        assert_eq!(pdu.function_code(), 99 | 0x80);
        assert_eq!(pdu.to_bytes().as_ref(), &[0xE3, 0x01]);
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x01));
    }

    #[test]
    fn test_builder() {
        let pdu = PduBuilder::new(0x03).byte(4).registers(&[0x1234, 0xABCD]).build();
        assert_eq!(pdu.to_bytes().as_ref(), &[0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn test_function_code_description() {
        assert_eq!(Pdu::function_code_description(0x03), "Read Holding Registers");
        assert_eq!(Pdu::function_code_description(0x83), "Read Holding Registers");
        assert_eq!(Pdu::function_code_description(0x63), "Unknown Function");
    }

    // ========================================================================
    // Bit packing
    // ========================================================================

    #[test]
    fn test_pack_bits_lsb_first() {
        let bits = [true, false, true, true, false, false, true, true, true, false];
        assert_eq!(pack_bits(&bits), vec![0xCD, 0x01]);
    }

    #[test]
    fn test_unpack_bits_ignores_padding() {
        let bits = unpack_bits(&[0xCD, 0xFF], 10);
        assert_eq!(
            bits,
            vec![true, false, true, true, false, false, true, true, true, true]
        );
    }

    #[test]
    fn test_unpack_registers() {
        assert_eq!(unpack_registers(&[0x00, 0x0A, 0x01, 0x02]), vec![10, 0x0102]);
    }
}
