//! Command-line arguments

use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

use voltage_slave::{Parity, Transport};

/// `-p` carries the TCP port or, on a serial line, the parity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOrParity {
    Port(u16),
    Parity(Parity),
}

impl FromStr for PortOrParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(parity) = s.parse::<Parity>() {
            return Ok(PortOrParity::Parity(parity));
        }
        s.parse::<u16>()
            .map(PortOrParity::Port)
            .map_err(|_| format!("'{s}' is neither a TCP port nor none, even or odd"))
    }
}

/// Non-negative, possibly fractional, number of seconds
fn parse_seconds(s: &str) -> Result<f64, String> {
    let secs: f64 = s.parse().map_err(|_| format!("'{s}' is not a number of seconds"))?;
    if secs.is_finite() && secs >= 0.0 {
        Ok(secs)
    } else {
        Err(format!("'{s}' is not a valid timeout"))
    }
}

/// Command-line arguments for diagslave
#[derive(Parser, Debug, Clone)]
#[command(
    name = "diagslave",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus slave simulator - RTU, ASCII and TCP",
    long_about = None
)]
pub struct Args {
    /// Serial port (e.g. /dev/ttyUSB0); serves Modbus TCP when omitted
    pub serial_port: Option<String>,

    /// Protocol: rtu, ascii or tcp
    #[arg(short = 'm', long = "mode")]
    pub protocol: Option<Transport>,

    /// Serve only this slave address (default: all)
    #[arg(short = 'a', long)]
    pub address: Option<u8>,

    /// Master activity timeout in seconds (1.0 - 100)
    #[arg(short = 'o', long = "timeout", value_parser = parse_seconds)]
    pub master_timeout: Option<f64>,

    /// TCP connection idle timeout in seconds (10 - 3600)
    #[arg(short = 'c', long = "connection-timeout", value_parser = parse_seconds)]
    pub connection_timeout: Option<f64>,

    /// TCP port, or serial parity: none, even, odd
    #[arg(short = 'p', long = "port", value_name = "PORT|PARITY")]
    pub port: Option<PortOrParity>,

    /// Serial baud rate
    #[arg(short = 'b', long = "baud")]
    pub baud_rate: Option<u32>,

    /// Serial data bits: 7 or 8
    #[arg(short = 'd', long)]
    pub data_bits: Option<u8>,

    /// Serial stop bits: 1 or 2
    #[arg(short = 's', long)]
    pub stop_bits: Option<u8>,

    /// RS-485 mode: hold transmit enable this many ms after a response
    #[arg(short = '4', long = "rs485", value_name = "MS")]
    pub rs485_delay: Option<u64>,

    /// Configuration file (yaml, toml or json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}
