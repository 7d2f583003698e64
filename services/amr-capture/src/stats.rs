//! Receiver counters

use std::fmt;

/// Per-run counters, owned by the capture loop
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiverStats {
    pub blocks: u64,
    pub candidates: u64,
    pub rejected: u64,
    pub filtered: u64,
    pub accepted: u64,
    pub capture_writes: u64,
    pub capture_bytes: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_block(&mut self) {
        self.blocks += 1;
    }

    pub fn record_candidate(&mut self) {
        self.candidates += 1;
    }

    pub fn record_rejected(&mut self) {
        self.rejected += 1;
    }

    pub fn record_filtered(&mut self) {
        self.filtered += 1;
    }

    pub fn record_accepted(&mut self) {
        self.accepted += 1;
    }

    pub fn record_capture(&mut self, bytes: usize) {
        self.capture_writes += 1;
        self.capture_bytes += bytes as u64;
    }
}

impl fmt::Display for ReceiverStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "blocks={} candidates={} rejected={} filtered={} accepted={} captured={} blocks/{} bytes",
            self.blocks,
            self.candidates,
            self.rejected,
            self.filtered,
            self.accepted,
            self.capture_writes,
            self.capture_bytes
        )
    }
}
