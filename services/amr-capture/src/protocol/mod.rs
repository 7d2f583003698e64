//! ERT meter protocol profiles
//!
//! A profile pairs a decoder configuration (preamble, packet length, chip rate)
//! with a parser that validates the packet checksum and extracts the meter fields.
//! The profile is resolved once at startup; the receiver only ever sees the
//! `PacketParser` trait and the `MeterMessage` fields it filters on.

mod crc;
mod idm;
mod scm;

pub use crc::Crc16;
pub use idm::{Idm, IdmParser};
pub use scm::{Scm, ScmParser};

#[cfg(test)]
pub(crate) use idm::tests::idm_packet;
#[cfg(test)]
pub(crate) use scm::tests::scm_packet;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::PacketConfig;

/// Chip rate shared by all ERT profiles (chips per second)
pub const DATA_RATE: usize = 32_768;

/// Reasons a candidate packet is not a valid message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid packet length: {0} bytes")]
    InvalidLength(usize),
    #[error("checksum failed: residue 0x{0:04X}")]
    Checksum(u16),
    #[error("unexpected packet type: 0x{0:02X}")]
    PacketType(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid message type: {0:?} (expected scm or idm)")]
pub struct UnknownProtocol(pub String);

/// Fields every parsed message exposes to the filter and the log sink
pub trait MeterMessage {
    fn meter_id(&self) -> u32;
    fn meter_type(&self) -> u8;
    /// Short tag used in log entries, e.g. "SCM"
    fn kind(&self) -> &'static str;
    /// Field values for CSV output
    fn record(&self) -> Vec<String>;
}

/// Turns one candidate packet into a message or a rejection
pub trait PacketParser {
    type Message: MeterMessage + fmt::Display + Serialize;

    fn parse(&self, packet: &[u8]) -> Result<Self::Message, ParseError>;

    /// Human-readable description of the integrity check
    fn checksum_description(&self) -> String;
}

/// Supported meter protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Scm,
    Idm,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Scm => "SCM",
            Protocol::Idm => "IDM",
        }
    }

    /// Decoder configuration for this profile
    pub fn packet_config(&self, symbol_length: usize) -> PacketConfig {
        match self {
            Protocol::Scm => scm::packet_config(symbol_length),
            Protocol::Idm => idm::packet_config(symbol_length),
        }
    }

    pub fn parser(&self) -> ProtocolParser {
        match self {
            Protocol::Scm => ProtocolParser::Scm(ScmParser::new()),
            Protocol::Idm => ProtocolParser::Idm(IdmParser::new()),
        }
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scm" => Ok(Protocol::Scm),
            "idm" => Ok(Protocol::Idm),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parser selected by protocol tag
#[derive(Debug, Clone)]
pub enum ProtocolParser {
    Scm(ScmParser),
    Idm(IdmParser),
}

impl PacketParser for ProtocolParser {
    type Message = Message;

    fn parse(&self, packet: &[u8]) -> Result<Message, ParseError> {
        match self {
            ProtocolParser::Scm(p) => p.parse(packet).map(Message::Scm),
            ProtocolParser::Idm(p) => p.parse(packet).map(Message::Idm),
        }
    }

    fn checksum_description(&self) -> String {
        match self {
            ProtocolParser::Scm(p) => p.checksum_description(),
            ProtocolParser::Idm(p) => p.checksum_description(),
        }
    }
}

/// Message from any supported protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Scm(Scm),
    Idm(Idm),
}

impl MeterMessage for Message {
    fn meter_id(&self) -> u32 {
        match self {
            Message::Scm(m) => m.meter_id(),
            Message::Idm(m) => m.meter_id(),
        }
    }

    fn meter_type(&self) -> u8 {
        match self {
            Message::Scm(m) => m.meter_type(),
            Message::Idm(m) => m.meter_type(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Message::Scm(m) => m.kind(),
            Message::Idm(m) => m.kind(),
        }
    }

    fn record(&self) -> Vec<String> {
        match self {
            Message::Scm(m) => m.record(),
            Message::Idm(m) => m.record(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Scm(m) => m.fmt(f),
            Message::Idm(m) => m.fmt(f),
        }
    }
}

/// Read `len` bits starting at bit `start` (MSB first) as an integer
pub(crate) fn bits(data: &[u8], start: usize, len: usize) -> u64 {
    (start..start + len).fold(0u64, |acc, i| {
        (acc << 1) | ((data[i / 8] >> (7 - i % 8)) & 1) as u64
    })
}

/// Test helper: write `len` bits of `value` at bit `start` (MSB first)
#[cfg(test)]
pub(crate) fn put_bits(data: &mut [u8], start: usize, len: usize, value: u64) {
    for k in 0..len {
        let i = start + k;
        let bit = ((value >> (len - 1 - k)) & 1) as u8;
        data[i / 8] &= !(1 << (7 - i % 8));
        data[i / 8] |= bit << (7 - i % 8);
    }
}
