//! Server configuration
//!
//! Built once by the host (file, environment, command line) and handed to
//! [`SlaveServer::new`](super::SlaveServer::new). `validate()` is called at
//! startup; any out-of-range value is an `IllegalArgument` error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::DEFAULT_TCP_PORT;
use crate::error::{Result, SlaveError};
use crate::table::{DeviceIdentity, StorageLayout};
use crate::types::{Address, Transport};

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    #[default]
    Even,
    Odd,
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Parity::None),
            "even" => Ok(Parity::Even),
            "odd" => Ok(Parity::Odd),
            other => Err(format!("unknown parity '{other}'")),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
        };
        f.write_str(name)
    }
}

/// TCP listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub bind_host: String,
    pub port: u16,
    pub max_connections: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_TCP_PORT,
            max_connections: 100,
        }
    }
}

impl TcpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: 19200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::Even,
        }
    }
}

/// Complete slave server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub protocol: Transport,
    /// Serve a single slave address; `None` serves every address
    pub address: Option<u8>,
    /// Master activity timeout
    pub master_timeout_ms: u64,
    /// TCP connection idle timeout
    pub connection_timeout_ms: u64,
    pub tcp: TcpConfig,
    pub serial: SerialConfig,
    /// RS-485 transmit enable: extra hold time after a response
    pub rs485_delay_ms: Option<u64>,
    /// Storage layout of the in-memory tables
    pub layout: StorageLayout,
    pub identity: DeviceIdentity,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: Transport::Tcp,
            address: None,
            master_timeout_ms: 3_000,
            connection_timeout_ms: 60_000,
            tcp: TcpConfig::default(),
            serial: SerialConfig::default(),
            rs485_delay_ms: None,
            layout: StorageLayout::Shared,
            identity: DeviceIdentity::default(),
        }
    }
}

impl ServerConfig {
    /// Check every value against its permitted range
    pub fn validate(&self) -> Result<()> {
        check_master_timeout(self.master_timeout_ms)?;
        check_range(
            "connection timeout (ms)",
            self.connection_timeout_ms,
            10_000,
            3_600_000,
        )?;
        if let Some(delay) = self.rs485_delay_ms {
            check_range("RS-485 delay (ms)", delay, 1, 1_000)?;
        }

        match self.protocol {
            Transport::Tcp => {
                if self.tcp.max_connections == 0 {
                    return Err(SlaveError::illegal_argument(
                        "max_connections must be at least 1",
                    ));
                }
            },
            Transport::Rtu | Transport::Ascii => {
                if self.address == Some(0) {
                    return Err(SlaveError::illegal_argument(
                        "slave address 0 is broadcast on a serial line",
                    ));
                }
                self.validate_serial()?;
            },
        }
        Ok(())
    }

    fn validate_serial(&self) -> Result<()> {
        let serial = &self.serial;
        if serial.device.is_empty() {
            return Err(SlaveError::illegal_argument("serial device not specified"));
        }
        if serial.baud_rate == 0 {
            return Err(SlaveError::illegal_argument("baud rate must be positive"));
        }
        if !matches!(serial.data_bits, 7 | 8) {
            return Err(SlaveError::illegal_argument(format!(
                "invalid data bits {}, expected 7 or 8",
                serial.data_bits
            )));
        }
        if self.protocol == Transport::Rtu && serial.data_bits != 8 {
            return Err(SlaveError::illegal_argument("RTU requires 8 data bits"));
        }
        if !matches!(serial.stop_bits, 1 | 2) {
            return Err(SlaveError::illegal_argument(format!(
                "invalid stop bits {}, expected 1 or 2",
                serial.stop_bits
            )));
        }
        Ok(())
    }

    pub fn master_timeout(&self) -> Duration {
        Duration::from_millis(self.master_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn rs485_delay(&self) -> Option<Duration> {
        self.rs485_delay_ms.map(Duration::from_millis)
    }

    /// Addresses that get a data table: the configured one, or 1..=254 on a
    /// serial line and 0..=254 on TCP
    pub fn served_addresses(&self) -> Vec<Address> {
        match (self.address, self.protocol) {
            (Some(addr), _) => vec![Address(addr)],
            (None, Transport::Tcp) => (0..=254).map(Address).collect(),
            (None, _) => (1..=254).map(Address).collect(),
        }
    }
}

pub(crate) fn check_master_timeout(millis: u64) -> Result<()> {
    check_range("master timeout (ms)", millis, 1_000, 100_000)
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SlaveError::illegal_argument(format!(
            "{name} {value} out of range {min}..={max}"
        )))
    }
}
