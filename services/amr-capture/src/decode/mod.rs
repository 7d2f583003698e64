//! Block decoder: IQ samples in, candidate packets out
//!
//! ERT meters transmit Manchester-coded on-off keying at 32768 chips/s. The
//! decoder keeps a sliding window of `packet_length + block_size` samples so a
//! packet straddling two reads is still seen whole:
//!
//! 1. Shift the window left by one block and append the new samples
//! 2. Convert IQ to magnitude (lookup table)
//! 3. Matched filter over one chip: first half minus second half of each bit
//! 4. Hard decision per sample
//! 5. Search the oldest `block_size` offsets for the preamble and slice the packet
//!
//! Candidates are not validated here; the parser owns the integrity check.

mod demod;

pub use demod::MagnitudeTable;

use std::collections::HashSet;

use tracing::{info, trace};

/// Stage that turns one sample block into zero or more candidate packets
pub trait BlockDecoder {
    /// Bytes the transport must deliver per read
    fn block_size2(&self) -> usize;

    /// Decode one block. Candidates are returned in the order found.
    fn decode(&mut self, block: &[u8]) -> Vec<Vec<u8>>;

    /// Raw IQ bytes of the current window (what gets persisted on a match)
    fn iq(&self) -> &[u8];
}

/// Decoder sizes derived from a protocol profile.
///
/// Lengths without a suffix are in samples; `block_size2` is in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketConfig {
    pub protocol: &'static str,
    /// Chips per second
    pub data_rate: usize,
    /// Samples per chip
    pub symbol_length: usize,
    /// Samples per bit
    pub symbol_length2: usize,
    pub sample_rate: usize,
    pub preamble_symbols: usize,
    pub packet_symbols: usize,
    pub preamble_length: usize,
    pub packet_length: usize,
    pub block_size: usize,
    pub block_size2: usize,
    pub buffer_length: usize,
    pub preamble: &'static str,
}

impl PacketConfig {
    pub fn new(
        protocol: &'static str,
        data_rate: usize,
        symbol_length: usize,
        packet_symbols: usize,
        preamble: &'static str,
    ) -> Self {
        let symbol_length2 = symbol_length << 1;
        let preamble_symbols = preamble.len();
        let preamble_length = preamble_symbols * symbol_length2;
        let packet_length = packet_symbols * symbol_length2;
        let block_size = preamble_length.next_power_of_two();

        Self {
            protocol,
            data_rate,
            symbol_length,
            symbol_length2,
            sample_rate: data_rate * symbol_length,
            preamble_symbols,
            packet_symbols,
            preamble_length,
            packet_length,
            block_size,
            block_size2: block_size << 1,
            buffer_length: packet_length + block_size,
            preamble,
        }
    }

    /// Log the derived configuration
    pub fn log(&self) {
        info!("Protocol: {}", self.protocol);
        info!("  SampleRate: {}", self.sample_rate);
        info!("  DataRate: {}", self.data_rate);
        info!("  SymbolLength: {}", self.symbol_length);
        info!("  PreambleSymbols: {}", self.preamble_symbols);
        info!("  PreambleLength: {}", self.preamble_length);
        info!("  PacketSymbols: {}", self.packet_symbols);
        info!("  PacketLength: {}", self.packet_length);
        info!("  BlockSize: {}", self.block_size);
        info!("  BufferLength: {}", self.buffer_length);
        info!("  Preamble: {}", self.preamble);
    }
}

/// Preamble-searching decoder for one protocol profile
pub struct Decoder {
    cfg: PacketConfig,
    mag_table: MagnitudeTable,
    /// Raw IQ window, `buffer_length` samples
    iq: Vec<u8>,
    /// Magnitude window, `buffer_length` samples
    signal: Vec<f32>,
    /// Prefix sums of `signal` for the matched filter
    csum: Vec<f64>,
    /// Hard decisions, one per filter offset
    quantized: Vec<bool>,
    preamble: Vec<bool>,
    /// Packets emitted by the previous call; a preamble found right at the
    /// block boundary matches in two consecutive windows
    recent: HashSet<Vec<u8>>,
}

impl Decoder {
    pub fn new(cfg: PacketConfig, fast_mag: bool) -> Self {
        let preamble = cfg.preamble.bytes().map(|b| b == b'1').collect();

        Self {
            mag_table: MagnitudeTable::new(fast_mag),
            iq: vec![0u8; cfg.buffer_length << 1],
            signal: vec![0f32; cfg.buffer_length],
            csum: vec![0f64; cfg.buffer_length + 1],
            quantized: vec![false; cfg.buffer_length - cfg.symbol_length2 + 1],
            preamble,
            recent: HashSet::new(),
            cfg,
        }
    }

    pub fn config(&self) -> &PacketConfig {
        &self.cfg
    }

    pub fn fast_mag(&self) -> bool {
        self.mag_table.is_fast()
    }

    fn filter(&mut self) {
        for (i, s) in self.signal.iter().enumerate() {
            self.csum[i + 1] = self.csum[i] + *s as f64;
        }

        let n = self.cfg.symbol_length;
        for (i, q) in self.quantized.iter_mut().enumerate() {
            let first = self.csum[i + n] - self.csum[i];
            let second = self.csum[i + 2 * n] - self.csum[i + n];
            *q = first > second;
        }
    }

    fn preamble_at(&self, offset: usize) -> bool {
        let step = self.cfg.symbol_length2;
        self.preamble
            .iter()
            .enumerate()
            .all(|(k, &bit)| self.quantized[offset + k * step] == bit)
    }

    fn slice(&self, offset: usize) -> Vec<u8> {
        let step = self.cfg.symbol_length2;
        let mut bytes = vec![0u8; (self.cfg.packet_symbols + 7) / 8];

        for k in 0..self.cfg.packet_symbols {
            if self.quantized[offset + k * step] {
                bytes[k / 8] |= 1 << (7 - (k % 8));
            }
        }

        bytes
    }
}

impl BlockDecoder for Decoder {
    fn block_size2(&self) -> usize {
        self.cfg.block_size2
    }

    fn decode(&mut self, block: &[u8]) -> Vec<Vec<u8>> {
        debug_assert_eq!(block.len(), self.cfg.block_size2);

        // Slide the IQ and magnitude windows by one block
        let bs2 = self.cfg.block_size2;
        let iq_len = self.iq.len();
        self.iq.copy_within(bs2.., 0);
        self.iq[iq_len - bs2..].copy_from_slice(block);

        let bs = self.cfg.block_size;
        let sig_len = self.signal.len();
        self.signal.copy_within(bs.., 0);
        self.mag_table
            .compute_magnitudes(block, &mut self.signal[sig_len - bs..]);

        self.filter();

        let mut seen = HashSet::new();
        let mut packets = Vec::new();
        for offset in 0..bs {
            if !self.preamble_at(offset) {
                continue;
            }

            let packet = self.slice(offset);
            if self.recent.contains(&packet) || !seen.insert(packet.clone()) {
                continue;
            }

            trace!("Candidate at offset {}: {}", offset, hex::encode(&packet));
            packets.push(packet);
        }

        self.recent = seen;
        packets
    }

    fn iq(&self) -> &[u8] {
        &self.iq
    }
}
