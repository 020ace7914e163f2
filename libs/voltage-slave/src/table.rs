//! Data table contract
//!
//! A [`DataTable`] is the storage behind one slave address. Reference numbers
//! are 1-based (`start_ref = wire address + 1`); implementations convert them
//! to 0-based indices with [`span`] and must never touch storage outside the
//! declared capacity. A failed validation leaves storage unchanged.

pub mod memory;

use std::ops::Range;

pub use memory::{CustomObject, DeviceIdentity, MemoryTable, StorageLayout};

use crate::error::TableError;

/// Storage interface the dispatcher calls into
///
/// Every method is invoked with the table's lock held, so implementations
/// need no internal synchronisation.
pub trait DataTable: Send {
    /// FC01
    fn read_coils(&mut self, start_ref: u32, count: u16) -> Result<Vec<bool>, TableError>;

    /// FC02
    fn read_discrete_inputs(&mut self, start_ref: u32, count: u16)
        -> Result<Vec<bool>, TableError>;

    /// FC05 / FC15
    fn write_coils(&mut self, start_ref: u32, values: &[bool]) -> Result<(), TableError>;

    /// FC03
    fn read_holding_registers(&mut self, start_ref: u32, count: u16)
        -> Result<Vec<u16>, TableError>;

    /// FC04
    fn read_input_registers(&mut self, start_ref: u32, count: u16)
        -> Result<Vec<u16>, TableError>;

    /// FC06 / FC16 / FC22 / FC23
    fn write_holding_registers(&mut self, start_ref: u32, values: &[u16])
        -> Result<(), TableError>;

    /// Whether `file_no` is served by FC20 / FC21
    fn has_file(&self, _file_no: u16) -> bool {
        false
    }

    /// FC20 sub-request; `record_no` is the 0-based record number from the wire
    fn read_file_record(
        &mut self,
        file_no: u16,
        _record_no: u16,
        _count: u16,
    ) -> Result<Vec<u16>, TableError> {
        Err(TableError::UnknownFile(file_no))
    }

    /// FC21 sub-request
    fn write_file_record(
        &mut self,
        file_no: u16,
        _record_no: u16,
        _values: &[u16],
    ) -> Result<(), TableError> {
        Err(TableError::UnknownFile(file_no))
    }

    /// FC07 status byte
    fn read_exception_status(&mut self) -> u8 {
        0
    }

    /// FC17 identification bytes
    fn slave_id(&self) -> Vec<u8> {
        Vec::new()
    }

    /// FC17 run indicator
    fn run_indicator(&self) -> bool {
        true
    }

    /// FC43/14 object value, `None` if the object does not exist
    fn device_id_object(&self, _object_id: u8) -> Option<Vec<u8>> {
        None
    }
}

/// Convert a 1-based reference span into a 0-based index range
///
/// Fails unless `1 <= start_ref` and `start_ref - 1 + count <= capacity`.
pub fn span(start_ref: u32, count: usize, capacity: usize) -> Result<Range<usize>, TableError> {
    let start = (start_ref as usize)
        .checked_sub(1)
        .ok_or(TableError::OutOfRange)?;
    let end = start.checked_add(count).ok_or(TableError::OutOfRange)?;
    if end > capacity {
        return Err(TableError::OutOfRange);
    }
    Ok(start..end)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_span_converts_to_zero_based() {
        assert_eq!(span(1, 5, 2000).unwrap(), 0..5);
        assert_eq!(span(1996, 5, 2000).unwrap(), 1995..2000);
    }

    #[test]
    fn test_span_rejects_overflow() {
        assert_eq!(span(1997, 5, 2000), Err(TableError::OutOfRange));
        assert_eq!(span(0x10000, 2, 0x10000), Err(TableError::OutOfRange));
        assert_eq!(span(u32::MAX, usize::MAX, 0x10000), Err(TableError::OutOfRange));
    }

    #[test]
    fn test_span_rejects_ref_zero() {
        assert_eq!(span(0, 1, 2000), Err(TableError::OutOfRange));
    }

    #[test]
    fn test_span_last_register() {
        assert_eq!(span(0x10000, 1, 0x10000).unwrap(), 0xFFFF..0x10000);
    }
}
