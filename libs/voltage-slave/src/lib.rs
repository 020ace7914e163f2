//! Voltage Modbus Slave Engine
//!
//! Server side of Modbus for VoltageEMS: answers masters over RTU, ASCII or
//! TCP from per-address data tables.
//!
//! # Architecture
//!
//! - **Codecs**: RTU (CRC16, silence framing), ASCII (LRC, `:`/CRLF) and TCP
//!   (MBAP) as `tokio_util` decoders/encoders over [`Adu`]
//! - **Data tables**: the [`DataTable`] storage contract and the in-memory
//!   [`MemoryTable`], registered per address in a [`DataTableRegistry`]
//! - **Dispatcher**: function code semantics, exceptions and broadcast handling
//! - **Server**: [`SlaveServer`] runs one step per `server_loop()` call so the
//!   host keeps control of the outer loop
//!
//! # Features
//!
//! - `serial` - open real serial devices through `tokio-serial` (default)

pub mod codec;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod pdu;
pub mod registry;
pub mod server;
pub mod table;
pub mod types;

// Re-export core types
pub use dispatcher::RequestDispatcher;
pub use error::{FrameError, Result, SlaveError, TableError};
pub use pdu::{ExceptionCode, Pdu, PduBuilder};
pub use registry::{DataTableRegistry, SharedTable};
pub use table::{CustomObject, DataTable, DeviceIdentity, MemoryTable, StorageLayout};
pub use types::{Address, Adu, FrameHeader, TransactionContext, Transport};

// Re-export server types for convenience
pub use server::{
    AddressValidator, LoopStatus, Parity, SerialConfig, SerialLink, ServerConfig, SlaveServer,
    StatsSnapshot, TcpConfig,
};
