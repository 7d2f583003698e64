//! Interval Data Message (IDM)
//!
//! 92-byte packet carrying the meter serial number, the last consumption count
//! and 47 nine-bit differential consumption intervals. Bytes 4..92 are covered
//! by an inverted CCITT CRC.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{bits, Crc16, MeterMessage, PacketParser, ParseError, DATA_RATE};
use crate::decode::PacketConfig;

pub const PREAMBLE: &str = "01010101010101010001011010100011";
const PACKET_BYTES: usize = 92;
const PACKET_TYPE_ID: u8 = 0x1C;
const INTERVALS: usize = 47;
const INTERVAL_BITS: usize = 9;
const INTERVAL_START_BIT: usize = 264;

pub(super) fn packet_config(symbol_length: usize) -> PacketConfig {
    PacketConfig::new("IDM", DATA_RATE, symbol_length, PACKET_BYTES * 8, PREAMBLE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Idm {
    #[serde(rename = "PacketTypeID")]
    pub packet_type_id: u8,
    pub packet_length: u8,
    pub hamming_code: u8,
    pub application_version: u8,
    #[serde(rename = "ERTType")]
    pub ert_type: u8,
    #[serde(rename = "ERTSerialNumber")]
    pub ert_serial_number: u32,
    pub consumption_interval_count: u8,
    pub module_programming_state: u8,
    pub tamper_counters: Vec<u8>,
    pub asynchronous_counters: u16,
    pub power_outage_flags: Vec<u8>,
    pub last_consumption_count: u32,
    pub differential_consumption_intervals: Vec<u16>,
    pub transmit_time_offset: u16,
    #[serde(rename = "SerialNumberCRC")]
    pub serial_number_crc: u16,
    #[serde(rename = "PacketCRC")]
    pub packet_crc: u16,
}

impl MeterMessage for Idm {
    fn meter_id(&self) -> u32 {
        self.ert_serial_number
    }

    fn meter_type(&self) -> u8 {
        self.ert_type
    }

    fn kind(&self) -> &'static str {
        "IDM"
    }

    fn record(&self) -> Vec<String> {
        let mut record = vec![
            format!("0x{:02X}", self.packet_type_id),
            self.packet_length.to_string(),
            self.ert_type.to_string(),
            self.ert_serial_number.to_string(),
            self.consumption_interval_count.to_string(),
            format!("0x{:02X}", self.module_programming_state),
            self.last_consumption_count.to_string(),
        ];
        record.extend(
            self.differential_consumption_intervals
                .iter()
                .map(|v| v.to_string()),
        );
        record.push(self.transmit_time_offset.to_string());
        record.push(format!("0x{:04X}", self.packet_crc));
        record
    }
}

impl fmt::Display for Idm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{PacketTypeID:0x{:02X} PacketLength:{} ApplicationVersion:{} ERTType:{:2} \
             ERTSerialNumber:{:10} ConsumptionIntervalCount:{} ModuleProgrammingState:0x{:02X} \
             TamperCounters:{} AsynchronousCounters:0x{:04X} PowerOutageFlags:{} \
             LastConsumptionCount:{} DifferentialConsumptionIntervals:{:?} \
             TransmitTimeOffset:{} SerialNumberCRC:0x{:04X} PacketCRC:0x{:04X}}}",
            self.packet_type_id,
            self.packet_length,
            self.application_version,
            self.ert_type,
            self.ert_serial_number,
            self.consumption_interval_count,
            self.module_programming_state,
            hex::encode_upper(&self.tamper_counters),
            self.asynchronous_counters,
            hex::encode_upper(&self.power_outage_flags),
            self.last_consumption_count,
            self.differential_consumption_intervals,
            self.transmit_time_offset,
            self.serial_number_crc,
            self.packet_crc,
        )
    }
}

#[derive(Debug, Clone)]
pub struct IdmParser {
    crc: Crc16,
}

impl IdmParser {
    pub fn new() -> Self {
        Self {
            crc: Crc16::new("CCITT", 0xFFFF, 0x1021, 0x1D0F),
        }
    }
}

impl Default for IdmParser {
    fn default() -> Self {
        Self::new()
    }
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

impl PacketParser for IdmParser {
    type Message = Idm;

    fn parse(&self, p: &[u8]) -> Result<Idm, ParseError> {
        if p.len() != PACKET_BYTES {
            return Err(ParseError::InvalidLength(p.len()));
        }

        let residue = self.crc.checksum(&p[4..]);
        if residue != self.crc.residue() {
            return Err(ParseError::Checksum(residue));
        }

        if p[4] != PACKET_TYPE_ID {
            return Err(ParseError::PacketType(p[4]));
        }

        let differential_consumption_intervals = (0..INTERVALS)
            .map(|i| bits(p, INTERVAL_START_BIT + i * INTERVAL_BITS, INTERVAL_BITS) as u16)
            .collect();

        Ok(Idm {
            packet_type_id: p[4],
            packet_length: p[5],
            hamming_code: p[6],
            application_version: p[7],
            ert_type: p[8] & 0x0F,
            ert_serial_number: be_u32(&p[9..13]),
            consumption_interval_count: p[13],
            module_programming_state: p[14],
            tamper_counters: p[15..21].to_vec(),
            asynchronous_counters: be_u16(&p[21..23]),
            power_outage_flags: p[23..29].to_vec(),
            last_consumption_count: be_u32(&p[29..33]),
            differential_consumption_intervals,
            transmit_time_offset: be_u16(&p[86..88]),
            serial_number_crc: be_u16(&p[88..90]),
            packet_crc: be_u16(&p[90..92]),
        })
    }

    fn checksum_description(&self) -> String {
        self.crc.to_string()
    }
}
