//! Function code dispatch
//!
//! Interprets a request PDU against Modbus function code semantics, executes
//! it on the addressed data table(s) and builds the response or exception.
//! Order of checks per request:
//! 1. function code supported, else ILLEGAL_FUNCTION
//! 2. payload length and quantities, else ILLEGAL_DATA_VALUE
//! 3. table operation, a [`TableError`](crate::error::TableError) maps to its exception
//!
//! Broadcast requests run every write against every registered table and
//! never produce a response.

use tracing::debug;

use crate::constants::*;
use crate::pdu::{pack_bits, unpack_bits, unpack_registers, ExceptionCode, Pdu, PduBuilder};
use crate::registry::DataTableRegistry;
use crate::table::DataTable;
use crate::types::Address;

/// Device identification conformity: basic, regular and extended, stream and individual access
const CONFORMITY_LEVEL: u8 = 0x83;

/// Read device id codes
const READ_DEVICE_ID_BASIC: u8 = 1;
const READ_DEVICE_ID_REGULAR: u8 = 2;
const READ_DEVICE_ID_EXTENDED: u8 = 3;
const READ_DEVICE_ID_INDIVIDUAL: u8 = 4;

/// FC43/14 response bytes before the object list: fc, MEI, code, conformity, more, next, count
const DEVICE_ID_HEADER_LEN: usize = 7;

/// Largest object value that fits a response
const MAX_DEVICE_ID_VALUE: usize = MAX_PDU_SIZE - DEVICE_ID_HEADER_LEN - 2;

/// FC20/21 sub-request header: ref type, file, record, length
const FILE_SUB_REQUEST_LEN: usize = 7;

/// Stateless request dispatcher
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestDispatcher;

impl RequestDispatcher {
    /// Handle a request addressed to `address`
    ///
    /// Returns `None` when no response must be sent: broadcast requests and
    /// requests for an address without a registered table.
    pub fn handle(address: Address, request: &Pdu, registry: &DataTableRegistry) -> Option<Pdu> {
        let fc = request.function_code();

        if address.is_broadcast() {
            if !is_write(fc) {
                debug!("Ignoring broadcast of non-write fc=0x{:02X}", fc);
                return None;
            }
            for table in registry.targets(address) {
                if let Err(code) = Self::execute(request, &mut *table.lock()) {
                    debug!("Broadcast fc=0x{:02X} failed: {}", fc, code);
                }
            }
            return None;
        }

        let Some(table) = registry.get(address) else {
            debug!("No data table for slave {}, request ignored", address);
            return None;
        };

        let response = {
            let mut table = table.lock();
            Self::execute(request, &mut *table)
        };
        match response {
            Ok(pdu) => Some(pdu),
            Err(code) => {
                debug!(
                    "Slave {}: {} -> exception {}",
                    address,
                    Pdu::function_code_description(fc),
                    code
                );
                Some(Pdu::exception(fc, code))
            },
        }
    }

    /// Execute one request on one table
    pub fn execute(request: &Pdu, table: &mut dyn DataTable) -> Result<Pdu, ExceptionCode> {
        let fc = request.function_code();
        let p = request.payload();

        match fc {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => Self::read_bits(fc, p, table),
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
                Self::read_registers(fc, p, table)
            },
            FC_WRITE_SINGLE_COIL => Self::write_single_coil(request, table),
            FC_WRITE_SINGLE_REGISTER => Self::write_single_register(request, table),
            FC_READ_EXCEPTION_STATUS => {
                expect_len(p, 0)?;
                Ok(PduBuilder::new(fc).byte(table.read_exception_status()).build())
            },
            FC_DIAGNOSTICS => Self::diagnostics(request),
            FC_WRITE_MULTIPLE_COILS => Self::write_multiple_coils(fc, p, table),
            FC_WRITE_MULTIPLE_REGISTERS => Self::write_multiple_registers(fc, p, table),
            FC_REPORT_SLAVE_ID => Self::report_slave_id(fc, p, table),
            FC_READ_FILE_RECORD => Self::read_file_record(fc, p, table),
            FC_WRITE_FILE_RECORD => Self::write_file_record(request, table),
            FC_MASK_WRITE_REGISTER => Self::mask_write_register(request, table),
            FC_READ_WRITE_REGISTERS => Self::read_write_registers(fc, p, table),
            FC_ENCAPSULATED_INTERFACE => Self::encapsulated_interface(fc, p, table),
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }

    // ========================================================================
    // Bit and register access
    // ========================================================================

    fn read_bits(fc: u8, p: &[u8], table: &mut dyn DataTable) -> Result<Pdu, ExceptionCode> {
        expect_len(p, 4)?;
        let count = word(p, 2);
        check_quantity(count, MAX_READ_BITS)?;

        let start_ref = start_ref(word(p, 0));
        let bits = if fc == FC_READ_COILS {
            table.read_coils(start_ref, count)?
        } else {
            table.read_discrete_inputs(start_ref, count)?
        };

        let packed = pack_bits(&bits);
        Ok(PduBuilder::new(fc).byte(packed.len() as u8).data(&packed).build())
    }

    fn read_registers(fc: u8, p: &[u8], table: &mut dyn DataTable) -> Result<Pdu, ExceptionCode> {
        expect_len(p, 4)?;
        let count = word(p, 2);
        check_quantity(count, MAX_READ_REGISTERS)?;

        let start_ref = start_ref(word(p, 0));
        let registers = if fc == FC_READ_HOLDING_REGISTERS {
            table.read_holding_registers(start_ref, count)?
        } else {
            table.read_input_registers(start_ref, count)?
        };

        Ok(PduBuilder::new(fc)
            .byte((registers.len() * 2) as u8)
            .registers(&registers)
            .build())
    }

    fn write_single_coil(request: &Pdu, table: &mut dyn DataTable) -> Result<Pdu, ExceptionCode> {
        let p = request.payload();
        expect_len(p, 4)?;
        let value = match word(p, 2) {
            COIL_ON => true,
            COIL_OFF => false,
            _ => return Err(ExceptionCode::IllegalDataValue),
        };

        table.write_coils(start_ref(word(p, 0)), &[value])?;
        Ok(request.clone())
    }

    fn write_single_register(
        request: &Pdu,
        table: &mut dyn DataTable,
    ) -> Result<Pdu, ExceptionCode> {
        let p = request.payload();
        expect_len(p, 4)?;

        table.write_holding_registers(start_ref(word(p, 0)), &[word(p, 2)])?;
        Ok(request.clone())
    }

    fn write_multiple_coils(
        fc: u8,
        p: &[u8],
        table: &mut dyn DataTable,
    ) -> Result<Pdu, ExceptionCode> {
        let (start, count, data) = write_header(p)?;
        check_quantity(count, MAX_WRITE_BITS)?;
        if data.len() != usize::from(count).div_ceil(8) {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let bits = unpack_bits(data, usize::from(count));
        table.write_coils(start_ref(start), &bits)?;
        Ok(PduBuilder::new(fc).word(start).word(count).build())
    }

    fn write_multiple_registers(
        fc: u8,
        p: &[u8],
        table: &mut dyn DataTable,
    ) -> Result<Pdu, ExceptionCode> {
        let (start, count, data) = write_header(p)?;
        check_quantity(count, MAX_WRITE_REGISTERS)?;
        if data.len() != usize::from(count) * 2 {
            return Err(ExceptionCode::IllegalDataValue);
        }

        table.write_holding_registers(start_ref(start), &unpack_registers(data))?;
        Ok(PduBuilder::new(fc).word(start).word(count).build())
    }

    fn mask_write_register(
        request: &Pdu,
        table: &mut dyn DataTable,
    ) -> Result<Pdu, ExceptionCode> {
        let p = request.payload();
        expect_len(p, 6)?;
        let start_ref = start_ref(word(p, 0));
        let and_mask = word(p, 2);
        let or_mask = word(p, 4);

        let current = table
            .read_holding_registers(start_ref, 1)?
            .first()
            .copied()
            .ok_or(ExceptionCode::SlaveDeviceFailure)?;
        let value = (current & and_mask) | (or_mask & !and_mask);
        table.write_holding_registers(start_ref, &[value])?;
        Ok(request.clone())
    }

    fn read_write_registers(
        fc: u8,
        p: &[u8],
        table: &mut dyn DataTable,
    ) -> Result<Pdu, ExceptionCode> {
        if p.len() < 9 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let read_count = word(p, 2);
        let write_count = word(p, 6);
        let byte_count = usize::from(p[8]);
        check_quantity(read_count, MAX_READ_REGISTERS)?;
        check_quantity(write_count, MAX_RW_WRITE_REGISTERS)?;
        if byte_count != usize::from(write_count) * 2 || p.len() != 9 + byte_count {
            return Err(ExceptionCode::IllegalDataValue);
        }

        // Both spans are range-checked before the write, which precedes the read
        let read_ref = start_ref(word(p, 0));
        table.read_holding_registers(read_ref, read_count)?;
        table.write_holding_registers(start_ref(word(p, 4)), &unpack_registers(&p[9..]))?;
        let registers = table.read_holding_registers(read_ref, read_count)?;

        Ok(PduBuilder::new(fc)
            .byte((registers.len() * 2) as u8)
            .registers(&registers)
            .build())
    }

    // ========================================================================
    // Diagnostics and identification
    // ========================================================================

    fn diagnostics(request: &Pdu) -> Result<Pdu, ExceptionCode> {
        let p = request.payload();
        if p.len() < 2 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        match word(p, 0) {
            DIAG_RETURN_QUERY_DATA => Ok(request.clone()),
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }

    fn report_slave_id(fc: u8, p: &[u8], table: &mut dyn DataTable) -> Result<Pdu, ExceptionCode> {
        expect_len(p, 0)?;
        let mut id = table.slave_id();
        // fc + byte count + run indicator
        id.truncate(MAX_PDU_SIZE - 3);
        let run = if table.run_indicator() { 0xFF } else { 0x00 };

        Ok(PduBuilder::new(fc)
            .byte((id.len() + 1) as u8)
            .data(&id)
            .byte(run)
            .build())
    }

    /// FC43 / MEI 14, Read Device Identification
    ///
    /// Only the standard request `[MEI][readDevIdCode][objectId]` is accepted;
    /// the short `[MEI][objectId]` form is answered with ILLEGAL_DATA_VALUE.
    fn encapsulated_interface(
        fc: u8,
        p: &[u8],
        table: &mut dyn DataTable,
    ) -> Result<Pdu, ExceptionCode> {
        match p.first() {
            Some(&MEI_READ_DEVICE_ID) => {},
            Some(_) => return Err(ExceptionCode::IllegalFunction),
            None => return Err(ExceptionCode::IllegalDataValue),
        }
        expect_len(p, 3)?;
        let code = p[1];
        let object_id = p[2];

        let last = match code {
            READ_DEVICE_ID_BASIC => 0x02,
            READ_DEVICE_ID_REGULAR => 0x06,
            READ_DEVICE_ID_EXTENDED => 0xFF,
            READ_DEVICE_ID_INDIVIDUAL => {
                return Ok(Self::device_id_individual(fc, object_id, table));
            },
            _ => return Err(ExceptionCode::IllegalDataValue),
        };

        // A start id outside the category restarts at the first object
        let first = if object_id > last { 0 } else { object_id };

        let mut objects = Vec::new();
        let mut size = DEVICE_ID_HEADER_LEN;
        let mut next = None;
        for id in first..=last {
            let Some(mut value) = table.device_id_object(id) else {
                continue;
            };
            value.truncate(MAX_DEVICE_ID_VALUE);
            if size + 2 + value.len() > MAX_PDU_SIZE {
                next = Some(id);
                break;
            }
            size += 2 + value.len();
            objects.push((id, value));
        }

        let mut builder = PduBuilder::new(fc)
            .byte(MEI_READ_DEVICE_ID)
            .byte(code)
            .byte(CONFORMITY_LEVEL)
            .byte(if next.is_some() { 0xFF } else { 0x00 })
            .byte(next.unwrap_or(0))
            .byte(objects.len() as u8);
        for (id, value) in &objects {
            builder = builder.byte(*id).byte(value.len() as u8).data(value);
        }
        Ok(builder.build())
    }

    /// Unknown objects are answered with an empty value
    fn device_id_individual(fc: u8, object_id: u8, table: &mut dyn DataTable) -> Pdu {
        let mut value = table.device_id_object(object_id).unwrap_or_default();
        value.truncate(MAX_DEVICE_ID_VALUE);

        PduBuilder::new(fc)
            .byte(MEI_READ_DEVICE_ID)
            .byte(READ_DEVICE_ID_INDIVIDUAL)
            .byte(CONFORMITY_LEVEL)
            .byte(0x00)
            .byte(0x00)
            .byte(1)
            .byte(object_id)
            .byte(value.len() as u8)
            .data(&value)
            .build()
    }

    // ========================================================================
    // File records
    // ========================================================================

    fn read_file_record(fc: u8, p: &[u8], table: &mut dyn DataTable) -> Result<Pdu, ExceptionCode> {
        let Some((&byte_count, subs)) = p.split_first() else {
            return Err(ExceptionCode::IllegalDataValue);
        };
        let byte_count = usize::from(byte_count);
        if !(0x07..=0xF5).contains(&byte_count)
            || byte_count % FILE_SUB_REQUEST_LEN != 0
            || subs.len() != byte_count
        {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let mut requests = Vec::with_capacity(byte_count / FILE_SUB_REQUEST_LEN);
        let mut response_len = 0usize;
        for sub in subs.chunks_exact(FILE_SUB_REQUEST_LEN) {
            let (file_no, record_no, count) = file_sub_request(sub, table)?;
            if count == 0 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            response_len += 2 + usize::from(count) * 2;
            requests.push((file_no, record_no, count));
        }
        // fc + response data length
        if 2 + response_len > MAX_PDU_SIZE {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let mut builder = PduBuilder::new(fc).byte(response_len as u8);
        for (file_no, record_no, count) in requests {
            let records = table.read_file_record(file_no, record_no, count)?;
            builder = builder
                .byte((1 + records.len() * 2) as u8)
                .byte(FILE_RECORD_REF_TYPE)
                .registers(&records);
        }
        Ok(builder.build())
    }

    fn write_file_record(request: &Pdu, table: &mut dyn DataTable) -> Result<Pdu, ExceptionCode> {
        let p = request.payload();
        let Some((&byte_count, mut rest)) = p.split_first() else {
            return Err(ExceptionCode::IllegalDataValue);
        };
        let byte_count = usize::from(byte_count);
        if !(0x09..=0xFB).contains(&byte_count) || rest.len() != byte_count {
            return Err(ExceptionCode::IllegalDataValue);
        }

        // Validate every sub-request before the first write
        let mut writes = Vec::new();
        while !rest.is_empty() {
            if rest.len() < FILE_SUB_REQUEST_LEN {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let (file_no, record_no, count) = file_sub_request(rest, table)?;
            let data_len = usize::from(count) * 2;
            let end = FILE_SUB_REQUEST_LEN + data_len;
            if count == 0 || rest.len() < end {
                return Err(ExceptionCode::IllegalDataValue);
            }
            writes.push((
                file_no,
                record_no,
                count,
                unpack_registers(&rest[FILE_SUB_REQUEST_LEN..end]),
            ));
            rest = &rest[end..];
        }
        // Range check every span without touching storage
        for &(file_no, record_no, count, _) in &writes {
            table.read_file_record(file_no, record_no, count)?;
        }

        for (file_no, record_no, _, values) in writes {
            table.write_file_record(file_no, record_no, &values)?;
        }
        Ok(request.clone())
    }
}

/// Function codes that modify a table; the only ones executed on broadcast
fn is_write(fc: u8) -> bool {
    matches!(
        fc,
        FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS
            | FC_WRITE_FILE_RECORD
            | FC_MASK_WRITE_REGISTER
            | FC_READ_WRITE_REGISTERS
    )
}

/// Big-endian word at `at`; callers check the payload length first
#[inline]
fn word(p: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([p[at], p[at + 1]])
}

/// Wire addresses are 0-based, table references 1-based
#[inline]
fn start_ref(address: u16) -> u32 {
    u32::from(address) + 1
}

fn expect_len(p: &[u8], len: usize) -> Result<(), ExceptionCode> {
    if p.len() == len {
        Ok(())
    } else {
        Err(ExceptionCode::IllegalDataValue)
    }
}

fn check_quantity(count: u16, max: u16) -> Result<(), ExceptionCode> {
    if (1..=max).contains(&count) {
        Ok(())
    } else {
        Err(ExceptionCode::IllegalDataValue)
    }
}

/// `start(2) count(2) byteCount(1) data`, byte count matching the data length
fn write_header(p: &[u8]) -> Result<(u16, u16, &[u8]), ExceptionCode> {
    if p.len() < 5 || p.len() != 5 + usize::from(p[4]) {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((word(p, 0), word(p, 2), &p[5..]))
}

/// Reference type and file number are checked before any range check
fn file_sub_request(sub: &[u8], table: &dyn DataTable) -> Result<(u16, u16, u16), ExceptionCode> {
    let file_no = word(sub, 1);
    if sub[0] != FILE_RECORD_REF_TYPE || !table.has_file(file_no) {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((file_no, word(sub, 3), word(sub, 5)))
}
