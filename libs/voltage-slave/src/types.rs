//! Core types shared by codecs, dispatcher and server

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::BROADCAST_ADDRESS;
use crate::pdu::Pdu;

/// Modbus slave / unit address (0-255)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u8);

impl Address {
    pub const BROADCAST: Address = Address(BROADCAST_ADDRESS);

    #[inline]
    pub fn value(self) -> u8 {
        self.0
    }

    /// Address 0 on every transport; never answered
    #[inline]
    pub fn is_broadcast(self) -> bool {
        self.0 == BROADCAST_ADDRESS
    }
}

impl From<u8> for Address {
    fn from(value: u8) -> Self {
        Address(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// MBAP fields threaded unchanged from request to response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionContext {
    pub transaction_id: u16,
    pub unit_id: Address,
}

/// Transport-specific framing information of an ADU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// RTU / ASCII: slave address byte
    Serial { address: Address },
    /// TCP: MBAP header
    Tcp(TransactionContext),
}

impl FrameHeader {
    pub fn address(&self) -> Address {
        match self {
            FrameHeader::Serial { address } => *address,
            FrameHeader::Tcp(ctx) => ctx.unit_id,
        }
    }
}

/// Application data unit: framing header + PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    pub header: FrameHeader,
    pub pdu: Pdu,
}

impl Adu {
    pub fn serial(address: Address, pdu: Pdu) -> Self {
        Self {
            header: FrameHeader::Serial { address },
            pdu,
        }
    }

    pub fn tcp(ctx: TransactionContext, pdu: Pdu) -> Self {
        Self {
            header: FrameHeader::Tcp(ctx),
            pdu,
        }
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.header.address()
    }

    /// Response ADU carrying the same framing header
    pub fn reply(&self, pdu: Pdu) -> Self {
        Self {
            header: self.header,
            pdu,
        }
    }
}

/// Modbus transport selected at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Rtu,
    Ascii,
    #[default]
    Tcp,
}

impl Transport {
    pub fn is_serial(self) -> bool {
        !matches!(self, Transport::Tcp)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Transport::Rtu => "RTU",
            Transport::Ascii => "ASCII",
            Transport::Tcp => "TCP",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rtu" => Ok(Transport::Rtu),
            "ascii" => Ok(Transport::Ascii),
            "tcp" => Ok(Transport::Tcp),
            other => Err(format!("unknown protocol '{other}', expected rtu, ascii or tcp")),
        }
    }
}
