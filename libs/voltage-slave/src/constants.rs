//! Modbus protocol constants for the slave side
//!
//! Frame limits follow the Modbus application protocol:
//! - Maximum PDU size: 253 bytes (RS485 ADU limit of 256 bytes minus address and CRC)
//! - Quantity limits are the largest values whose request/response still fits a PDU

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU (Protocol Data Unit) size
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU) = 254
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Minimum MBAP length field value (Unit ID + function code)
pub const MIN_MBAP_LENGTH: usize = 2;

/// Maximum RTU ADU: address + PDU + CRC
pub const MAX_RTU_FRAME: usize = 1 + MAX_PDU_SIZE + 2;

/// Minimum RTU ADU: address + function code + CRC
pub const MIN_RTU_FRAME: usize = 4;

/// Maximum ASCII frame in characters: ':' + 2 hex chars per byte + CR LF
pub const MAX_ASCII_FRAME: usize = 1 + (1 + MAX_PDU_SIZE + 1) * 2 + 2;

// ============================================================================
// Data Table Capacities
// ============================================================================

/// Number of single-bit references a data table holds (coils / discrete inputs)
pub const BIT_CAPACITY: usize = 2000;

/// Number of 16-bit registers a data table holds (holding / input registers)
pub const REGISTER_CAPACITY: usize = 0x10000;

// ============================================================================
// Quantity Limits
// ============================================================================

/// FC01/FC02: 1 + 1 + ceil(N / 8) <= 253 gives 2008, the protocol fixes 2000
pub const MAX_READ_BITS: u16 = 2000;

/// FC03/FC04: 1 + 1 + 2N <= 253
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC15: 1 + 2 + 2 + 1 + ceil(N / 8) <= 253, the protocol fixes 0x7B0
pub const MAX_WRITE_BITS: u16 = 1968;

/// FC16: 1 + 2 + 2 + 1 + 2N <= 253
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// FC23 write part: 1 + 2 + 2 + 2 + 2 + 1 + 2N <= 253
pub const MAX_RW_WRITE_REGISTERS: u16 = 121;

/// Reference type for file record access, the only value the protocol defines
pub const FILE_RECORD_REF_TYPE: u8 = 6;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_READ_EXCEPTION_STATUS: u8 = 0x07;
pub const FC_DIAGNOSTICS: u8 = 0x08;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FC_REPORT_SLAVE_ID: u8 = 0x11;
pub const FC_READ_FILE_RECORD: u8 = 0x14;
pub const FC_WRITE_FILE_RECORD: u8 = 0x15;
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;
pub const FC_READ_WRITE_REGISTERS: u8 = 0x17;
pub const FC_ENCAPSULATED_INTERFACE: u8 = 0x2B;

/// MEI type for Read Device Identification inside FC43
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// Diagnostics sub-function 0x0000: Return Query Data
pub const DIAG_RETURN_QUERY_DATA: u16 = 0x0000;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// FC05 payload value for ON
pub const COIL_ON: u16 = 0xFF00;

/// FC05 payload value for OFF
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Addressing
// ============================================================================

/// Broadcast address on every transport
pub const BROADCAST_ADDRESS: u8 = 0;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;
