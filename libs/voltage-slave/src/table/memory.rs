//! In-memory data table used by the diagnostic slave
//!
//! 2000 bits and 65536 registers, zero-initialised. With the `Shared` layout
//! coils and discrete inputs are one array, as are holding and input
//! registers; `Split` keeps four distinct address spaces.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{span, DataTable};
use crate::constants::{BIT_CAPACITY, REGISTER_CAPACITY};
use crate::error::TableError;
use crate::types::Address;

/// FC07 status returned by the diagnostic table
const EXCEPTION_STATUS: u8 = 0x55;

/// File numbers served by FC20/21: 3 maps to input, 4 to holding registers
const INPUT_FILE: u16 = 3;
const HOLDING_FILE: u16 = 4;

/// How the four Modbus reference types map onto storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLayout {
    /// Coils/discrete inputs share one array, holding/input registers another
    #[default]
    Shared,
    /// Every reference type has its own array
    Split,
}

/// Vendor-specific identification object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomObject {
    /// 0x80..=0xFF, lower ids are ignored
    pub id: u8,
    pub value: String,
}

/// Device identification objects served by FC43/14 and FC17
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub vendor_name: String,
    pub product_code: String,
    pub revision: String,
    pub vendor_url: String,
    pub product_name: String,
    pub model_name: String,
    pub application_name: String,
    pub custom: Vec<CustomObject>,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            vendor_name: "VoltageEMS".to_string(),
            product_code: "VEMS-SLAVE".to_string(),
            revision: env!("CARGO_PKG_VERSION").to_string(),
            vendor_url: "https://github.com/VoltageEMS".to_string(),
            product_name: "VoltageEMS Modbus Slave".to_string(),
            model_name: "voltage-slave".to_string(),
            application_name: "diagslave".to_string(),
            custom: vec![CustomObject {
                id: 0x80,
                value: "Custom data 123".to_string(),
            }],
        }
    }
}

impl DeviceIdentity {
    /// Object value by id; optional objects with an empty value do not exist
    pub fn object(&self, object_id: u8) -> Option<&str> {
        let value = match object_id {
            0 => return Some(self.vendor_name.as_str()),
            1 => return Some(self.product_code.as_str()),
            2 => return Some(self.revision.as_str()),
            3 => &self.vendor_url,
            4 => &self.product_name,
            5 => &self.model_name,
            6 => &self.application_name,
            0x80..=0xFF => {
                return self
                    .custom
                    .iter()
                    .find(|object| object.id == object_id)
                    .map(|object| object.value.as_str())
            },
            _ => return None,
        };
        (!value.is_empty()).then_some(value.as_str())
    }
}

/// Zero-initialised in-memory table
#[derive(Debug)]
pub struct MemoryTable {
    slave: Address,
    layout: StorageLayout,
    coils: Vec<bool>,
    holding: Vec<u16>,
    /// Empty with [`StorageLayout::Shared`]
    discrete_inputs: Vec<bool>,
    /// Empty with [`StorageLayout::Shared`]
    input: Vec<u16>,
    identity: Arc<DeviceIdentity>,
}

impl MemoryTable {
    pub fn new(slave: Address) -> Self {
        Self::with_layout(slave, StorageLayout::Shared)
    }

    pub fn with_layout(slave: Address, layout: StorageLayout) -> Self {
        let (discrete_inputs, input) = match layout {
            StorageLayout::Shared => (Vec::new(), Vec::new()),
            StorageLayout::Split => (vec![false; BIT_CAPACITY], vec![0; REGISTER_CAPACITY]),
        };
        Self {
            slave,
            layout,
            coils: vec![false; BIT_CAPACITY],
            holding: vec![0; REGISTER_CAPACITY],
            discrete_inputs,
            input,
            identity: Arc::new(DeviceIdentity::default()),
        }
    }

    /// Identification shared by all tables of one server
    pub fn identity(mut self, identity: Arc<DeviceIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn slave(&self) -> Address {
        self.slave
    }

    pub fn layout(&self) -> StorageLayout {
        self.layout
    }

    pub fn coils(&self) -> &[bool] {
        &self.coils
    }

    pub fn holding_registers(&self) -> &[u16] {
        &self.holding
    }

    /// Update discrete inputs from the host side (FC02 has no write counterpart)
    pub fn set_discrete_inputs(&mut self, start_ref: u32, values: &[bool]) -> Result<(), TableError> {
        let range = span(start_ref, values.len(), BIT_CAPACITY)?;
        self.input_bits_mut()[range].copy_from_slice(values);
        Ok(())
    }

    /// Update input registers from the host side (FC04 has no write counterpart)
    pub fn set_input_registers(&mut self, start_ref: u32, values: &[u16]) -> Result<(), TableError> {
        let range = span(start_ref, values.len(), REGISTER_CAPACITY)?;
        self.input_registers_mut()[range].copy_from_slice(values);
        Ok(())
    }

    fn input_bits(&self) -> &[bool] {
        match self.layout {
            StorageLayout::Shared => &self.coils,
            StorageLayout::Split => &self.discrete_inputs,
        }
    }

    fn input_bits_mut(&mut self) -> &mut [bool] {
        match self.layout {
            StorageLayout::Shared => &mut self.coils,
            StorageLayout::Split => &mut self.discrete_inputs,
        }
    }

    fn input_registers(&self) -> &[u16] {
        match self.layout {
            StorageLayout::Shared => &self.holding,
            StorageLayout::Split => &self.input,
        }
    }

    fn input_registers_mut(&mut self) -> &mut [u16] {
        match self.layout {
            StorageLayout::Shared => &mut self.holding,
            StorageLayout::Split => &mut self.input,
        }
    }

    fn file(&mut self, file_no: u16) -> Result<&mut [u16], TableError> {
        match file_no {
            INPUT_FILE => Ok(self.input_registers_mut()),
            HOLDING_FILE => Ok(&mut self.holding),
            other => Err(TableError::UnknownFile(other)),
        }
    }
}

impl DataTable for MemoryTable {
    fn read_coils(&mut self, start_ref: u32, count: u16) -> Result<Vec<bool>, TableError> {
        debug!("Slave {:3}: readCoils from {}, {} references", self.slave, start_ref, count);
        let range = span(start_ref, usize::from(count), BIT_CAPACITY)?;
        Ok(self.coils[range].to_vec())
    }

    fn read_discrete_inputs(&mut self, start_ref: u32, count: u16) -> Result<Vec<bool>, TableError> {
        debug!(
            "Slave {:3}: readInputDiscretes from {}, {} references",
            self.slave, start_ref, count
        );
        let range = span(start_ref, usize::from(count), BIT_CAPACITY)?;
        Ok(self.input_bits()[range].to_vec())
    }

    fn write_coils(&mut self, start_ref: u32, values: &[bool]) -> Result<(), TableError> {
        debug!(
            "Slave {:3}: writeCoils from {}, {} references",
            self.slave,
            start_ref,
            values.len()
        );
        let range = span(start_ref, values.len(), BIT_CAPACITY)?;
        self.coils[range].copy_from_slice(values);
        Ok(())
    }

    fn read_holding_registers(&mut self, start_ref: u32, count: u16) -> Result<Vec<u16>, TableError> {
        debug!(
            "Slave {:3}: readHoldingRegisters from {}, {} references",
            self.slave, start_ref, count
        );
        let range = span(start_ref, usize::from(count), REGISTER_CAPACITY)?;
        Ok(self.holding[range].to_vec())
    }

    fn read_input_registers(&mut self, start_ref: u32, count: u16) -> Result<Vec<u16>, TableError> {
        debug!(
            "Slave {:3}: readInputRegisters from {}, {} references",
            self.slave, start_ref, count
        );
        let range = span(start_ref, usize::from(count), REGISTER_CAPACITY)?;
        Ok(self.input_registers()[range].to_vec())
    }

    fn write_holding_registers(&mut self, start_ref: u32, values: &[u16]) -> Result<(), TableError> {
        debug!(
            "Slave {:3}: writeHoldingRegisters from {}, {} references",
            self.slave,
            start_ref,
            values.len()
        );
        let range = span(start_ref, values.len(), REGISTER_CAPACITY)?;
        self.holding[range].copy_from_slice(values);
        Ok(())
    }

    fn has_file(&self, file_no: u16) -> bool {
        matches!(file_no, INPUT_FILE | HOLDING_FILE)
    }

    fn read_file_record(
        &mut self,
        file_no: u16,
        record_no: u16,
        count: u16,
    ) -> Result<Vec<u16>, TableError> {
        debug!(
            "Slave {:3}: readFileRecord file {} from {}, {} references",
            self.slave, file_no, record_no, count
        );
        // Record numbers are 0-based, shift into 1-based references
        let range = span(u32::from(record_no) + 1, usize::from(count), REGISTER_CAPACITY)?;
        Ok(self.file(file_no)?[range].to_vec())
    }

    fn write_file_record(
        &mut self,
        file_no: u16,
        record_no: u16,
        values: &[u16],
    ) -> Result<(), TableError> {
        debug!(
            "Slave {:3}: writeFileRecord file {} from {}, {} references",
            self.slave,
            file_no,
            record_no,
            values.len()
        );
        let range = span(u32::from(record_no) + 1, values.len(), REGISTER_CAPACITY)?;
        self.file(file_no)?[range].copy_from_slice(values);
        Ok(())
    }

    fn read_exception_status(&mut self) -> u8 {
        debug!("Slave {:3}: readExceptionStatus", self.slave);
        EXCEPTION_STATUS
    }

    fn slave_id(&self) -> Vec<u8> {
        self.identity.product_name.as_bytes().to_vec()
    }

    fn run_indicator(&self) -> bool {
        debug!("Slave {:3}: reportSlaveId", self.slave);
        true
    }

    fn device_id_object(&self, object_id: u8) -> Option<Vec<u8>> {
        let value = self.identity.object(object_id)?;
        debug!("Slave {:3}: getDeviceIdObject {}", self.slave, object_id);
        Some(value.as_bytes().to_vec())
    }
}
