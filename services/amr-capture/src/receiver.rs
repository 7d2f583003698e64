//! Capture loop
//!
//! One thread reads a block, decodes it, parses and filters each candidate, and
//! writes accepted messages out. Interrupt and deadline arrive on channels and
//! are only looked at between blocks, so a block is always processed whole.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use crossbeam_channel::{self as channel, after, bounded, never, select};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::decode::BlockDecoder;
use crate::filter::MeterFilter;
use crate::output::{LogEntry, LogWriter, OutputError, SampleFile};
use crate::protocol::{MeterMessage, PacketParser};
use crate::sdr::{Transport, TransportError};
use crate::stats::ReceiverStats;

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Output(#[from] OutputError),
}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Interrupted,
    /// Time limit reached, with the wall-clock time actually elapsed
    TimeLimit(Duration),
    SingleShot,
    EndOfStream,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Interrupted => f.write_str("interrupted"),
            ExitReason::TimeLimit(elapsed) => write!(f, "time limit reached after {:?}", elapsed),
            ExitReason::SingleShot => f.write_str("single message received"),
            ExitReason::EndOfStream => f.write_str("end of sample stream"),
        }
    }
}

impl ExitReason {
    /// An interrupt ends the run without a summary at the default level
    pub fn is_silent(&self) -> bool {
        matches!(self, ExitReason::Interrupted)
    }

    /// Line printed on exit whatever the log level
    pub fn report(&self) -> Option<String> {
        match self {
            ExitReason::TimeLimit(elapsed) => Some(format!("Time limit reached: {:?}", elapsed)),
            _ => None,
        }
    }
}

/// Interrupt and deadline channels polled at the top of each iteration
pub struct ExitSignals {
    interrupt: channel::Receiver<()>,
    deadline: channel::Receiver<Instant>,
    started: Instant,
}

impl ExitSignals {
    /// Start the deadline timer now. No limit means the deadline never fires.
    pub fn new(interrupt: channel::Receiver<()>, limit: Option<Duration>) -> Self {
        let deadline = match limit {
            Some(d) => after(d),
            None => never(),
        };

        Self {
            interrupt,
            deadline,
            started: Instant::now(),
        }
    }

    /// Route Ctrl-C into the interrupt channel
    pub fn install(limit: Option<Duration>) -> anyhow::Result<Self> {
        let (tx, rx) = bounded(1);
        ctrlc::set_handler(move || {
            // A pending interrupt is enough; extra presses are dropped
            let _ = tx.try_send(());
        })
        .context("failed to install interrupt handler")?;

        Ok(Self::new(rx, limit))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Non-blocking check of both signals
    pub fn poll(&self) -> Option<ExitReason> {
        select! {
            recv(self.interrupt) -> msg => match msg {
                Ok(()) => Some(ExitReason::Interrupted),
                // Handler gone; only the deadline can still fire
                Err(_) => self.deadline.try_recv().ok().map(|_| ExitReason::TimeLimit(self.elapsed())),
            },
            recv(self.deadline) -> _ => Some(ExitReason::TimeLimit(self.elapsed())),
            default => None,
        }
    }
}

/// Capture loop over a transport, a decoder and a parser
pub struct Receiver<T, D, P> {
    transport: T,
    decoder: D,
    parser: P,
    filter: MeterFilter,
    log: LogWriter,
    samples: Option<SampleFile>,
    single: bool,
    /// Reused for every read, sized once from the decoder
    block: Vec<u8>,
    stats: ReceiverStats,
}

impl<T, D, P> Receiver<T, D, P>
where
    T: Transport,
    D: BlockDecoder,
    P: PacketParser,
{
    pub fn new(transport: T, decoder: D, parser: P, filter: MeterFilter, log: LogWriter) -> Self {
        let block = vec![0u8; decoder.block_size2()];

        Self {
            transport,
            decoder,
            parser,
            filter,
            log,
            samples: None,
            single: false,
            block,
            stats: ReceiverStats::new(),
        }
    }

    /// Append matching blocks to a capture file
    pub fn with_samples(mut self, samples: Option<SampleFile>) -> Self {
        self.samples = samples;
        self
    }

    /// Stop after the first block with an accepted message
    pub fn single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    #[cfg(test)]
    fn transport(&self) -> &T {
        &self.transport
    }

    /// Run until an exit signal, single-shot match, end of stream or a fatal
    /// error. Read and output errors are never retried.
    pub fn run(&mut self, signals: &ExitSignals) -> Result<ExitReason, ReceiverError> {
        loop {
            if let Some(reason) = signals.poll() {
                return Ok(reason);
            }

            match self.transport.read_block(&mut self.block) {
                Ok(()) => {}
                Err(TransportError::EndOfStream) => return Ok(ExitReason::EndOfStream),
                Err(e) => return Err(e.into()),
            }
            self.stats.record_block();

            let accepted = self.process_block()?;
            if self.single && accepted > 0 {
                return Ok(ExitReason::SingleShot);
            }
        }
    }

    /// Decode, parse, filter and write out the current block. Returns the
    /// number of accepted messages.
    fn process_block(&mut self) -> Result<usize, ReceiverError> {
        let candidates = self.decoder.decode(&self.block);
        if candidates.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let offset = self.samples.as_ref().map_or(0, SampleFile::offset);
        let length = self.decoder.iq().len() as u64;
        let mut accepted = 0;

        for packet in candidates {
            self.stats.record_candidate();

            let msg = match self.parser.parse(&packet) {
                Ok(msg) => msg,
                Err(e) => {
                    self.stats.record_rejected();
                    debug!("Rejected {}: {}", hex::encode(&packet), e);
                    continue;
                }
            };

            if !self.filter.accept(&msg) {
                self.stats.record_filtered();
                trace!("Filtered meter {} type {}", msg.meter_id(), msg.meter_type());
                continue;
            }

            self.log.write(&LogEntry::new(now, offset, length, msg))?;
            self.stats.record_accepted();
            accepted += 1;
        }

        if accepted > 0 {
            if let Some(samples) = self.samples.as_mut() {
                let iq = self.decoder.iq();
                samples.append(iq)?;
                self.stats.record_capture(iq.len());
            }
        }

        Ok(accepted)
    }

    /// Log the exit summary
    pub fn log_summary(&self, reason: ExitReason) {
        if reason.is_silent() {
            debug!("Receiver stopped: {}", reason);
            debug!("Stats: {}", self.stats);
        } else {
            info!("Receiver stopped: {}", reason);
            info!("Stats: {}", self.stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::SharedBuffer;
    use crate::output::LogFormat;
    use crate::protocol::ParseError;
    use serde::Serialize;
    use std::collections::VecDeque;
    use std::io;
    use std::thread;

    const BLOCK: usize = 4;
    const IQ: usize = 16;

    /// Block layout understood by `ScriptDecoder`: [valid, invalid, id, type]
    fn block(valid: u8, invalid: u8, id: u8, ert_type: u8) -> Vec<u8> {
        vec![valid, invalid, id, ert_type]
    }

    fn quiet() -> Vec<u8> {
        block(0, 0, 0, 0)
    }

    struct ScriptTransport {
        blocks: VecDeque<Vec<u8>>,
        /// Returned once the script runs out; `None` repeats quiet blocks forever
        end: Option<fn() -> TransportError>,
        delay: Duration,
        reads: usize,
    }

    impl ScriptTransport {
        fn new(blocks: Vec<Vec<u8>>) -> Self {
            Self {
                blocks: blocks.into(),
                end: Some(|| TransportError::EndOfStream),
                delay: Duration::ZERO,
                reads: 0,
            }
        }

        fn failing(blocks: Vec<Vec<u8>>) -> Self {
            Self {
                end: Some(|| {
                    TransportError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
                }),
                ..Self::new(blocks)
            }
        }

        fn endless(delay: Duration) -> Self {
            Self {
                end: None,
                delay,
                ..Self::new(Vec::new())
            }
        }
    }

    impl Transport for ScriptTransport {
        fn read_block(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
            thread::sleep(self.delay);
            let next = match (self.blocks.pop_front(), self.end) {
                (Some(b), _) => b,
                (None, Some(end)) => return Err(end()),
                (None, None) => quiet(),
            };
            self.reads += 1;
            buf.copy_from_slice(&next);
            Ok(())
        }
    }

    /// Emits `valid` good and `invalid` bad candidates per block, and keeps an
    /// IQ window filled with the block number
    struct ScriptDecoder {
        iq: Vec<u8>,
        blocks: u8,
    }

    impl ScriptDecoder {
        fn new() -> Self {
            Self {
                iq: vec![0; IQ],
                blocks: 0,
            }
        }
    }

    impl BlockDecoder for ScriptDecoder {
        fn block_size2(&self) -> usize {
            BLOCK
        }

        fn decode(&mut self, block: &[u8]) -> Vec<Vec<u8>> {
            self.blocks += 1;
            self.iq.fill(self.blocks);

            let (valid, invalid, id, ert_type) = (block[0], block[1], block[2], block[3]);
            let good = (0..valid).map(|k| vec![1, id.wrapping_add(k), ert_type]);
            let bad = (0..invalid).map(|_| vec![0, 0, 0]);
            bad.chain(good).collect()
        }

        fn iq(&self) -> &[u8] {
            &self.iq
        }
    }

    #[derive(Debug, Serialize)]
    struct TestMessage {
        id: u32,
        ert_type: u8,
    }

    impl MeterMessage for TestMessage {
        fn meter_id(&self) -> u32 {
            self.id
        }
        fn meter_type(&self) -> u8 {
            self.ert_type
        }
        fn kind(&self) -> &'static str {
            "TEST"
        }
        fn record(&self) -> Vec<String> {
            vec![self.id.to_string(), self.ert_type.to_string()]
        }
    }

    impl fmt::Display for TestMessage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{{ID:{} Type:{}}}", self.id, self.ert_type)
        }
    }

    struct TestParser;

    impl PacketParser for TestParser {
        type Message = TestMessage;

        fn parse(&self, packet: &[u8]) -> Result<TestMessage, ParseError> {
            if packet[0] == 0 {
                return Err(ParseError::Checksum(0xBEEF));
            }
            Ok(TestMessage {
                id: packet[1] as u32,
                ert_type: packet[2],
            })
        }

        fn checksum_description(&self) -> String {
            "first byte set".to_string()
        }
    }

    struct Harness {
        log: SharedBuffer,
        samples: SharedBuffer,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: SharedBuffer::default(),
                samples: SharedBuffer::default(),
            }
        }

        fn receiver(
            &self,
            transport: ScriptTransport,
            filter: MeterFilter,
        ) -> Receiver<ScriptTransport, ScriptDecoder, TestParser> {
            let log = LogWriter::new(LogFormat::Json, Box::new(self.log.clone()), true);
            let samples = SampleFile::new(Box::new(self.samples.clone()));
            Receiver::new(transport, ScriptDecoder::new(), TestParser, filter, log)
                .with_samples(Some(samples))
        }

        fn entries(&self) -> Vec<LogEntry<serde_json::Value>> {
            self.log
                .text()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    fn no_signals() -> (channel::Sender<()>, ExitSignals) {
        let (tx, rx) = bounded(1);
        (tx, ExitSignals::new(rx, None))
    }

    #[test]
    fn test_one_capture_write_per_block() {
        let h = Harness::new();
        let transport = ScriptTransport::new(vec![block(3, 1, 10, 7)]);
        let mut rx = h.receiver(transport, MeterFilter::default());
        let (_tx, signals) = no_signals();

        assert_eq!(rx.run(&signals).unwrap(), ExitReason::EndOfStream);

        let entries = h.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.offset == 0 && e.length == IQ as u64));
        assert_eq!(h.samples.contents(), vec![1u8; IQ]);
        assert_eq!(rx.stats().capture_writes, 1);
        assert_eq!(rx.stats().accepted, 3);
        assert_eq!(rx.stats().rejected, 1);
    }

    #[test]
    fn test_offsets_track_capture_length() {
        let h = Harness::new();
        let transport = ScriptTransport::new(vec![
            block(1, 0, 1, 1),
            quiet(),
            block(2, 0, 2, 1),
            block(0, 2, 0, 0),
            block(1, 0, 3, 1),
        ]);
        let mut rx = h.receiver(transport, MeterFilter::default());
        let (_tx, signals) = no_signals();
        rx.run(&signals).unwrap();

        let offsets: Vec<u64> = h.entries().iter().map(|e| e.offset).collect();
        let iq = IQ as u64;
        assert_eq!(offsets, vec![0, iq, iq, 2 * iq]);
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));

        // Blocks 1, 3 and 5 matched; IQ windows are tagged by block number
        let captured = h.samples.contents();
        assert_eq!(captured.len(), 3 * IQ);
        assert!(captured[..IQ].iter().all(|&b| b == 1));
        assert!(captured[IQ..2 * IQ].iter().all(|&b| b == 3));
        assert!(captured[2 * IQ..].iter().all(|&b| b == 5));
    }

    #[test]
    fn test_single_shot_stops_after_matching_block() {
        let h = Harness::new();
        let transport = ScriptTransport::new(vec![
            quiet(),
            block(0, 1, 0, 0),
            block(2, 0, 40, 9),
            block(1, 0, 50, 9),
        ]);
        let mut rx = h.receiver(transport, MeterFilter::default()).single(true);
        let (_tx, signals) = no_signals();

        assert_eq!(rx.run(&signals).unwrap(), ExitReason::SingleShot);
        assert_eq!(rx.transport().reads, 3);
        assert_eq!(rx.stats().blocks, 3);

        // The whole matching block is written out, once
        let entries = h.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message["id"], 40);
        assert_eq!(entries[1].message["id"], 41);
        assert_eq!(h.samples.contents().len(), IQ);
    }

    #[test]
    fn test_single_shot_ignores_filtered_messages() {
        let h = Harness::new();
        let transport = ScriptTransport::new(vec![block(1, 0, 5, 2), block(1, 0, 6, 3)]);
        let filter = MeterFilter::new([], [3]);
        let mut rx = h.receiver(transport, filter).single(true);
        let (_tx, signals) = no_signals();

        assert_eq!(rx.run(&signals).unwrap(), ExitReason::SingleShot);
        assert_eq!(rx.transport().reads, 2);
        assert_eq!(rx.stats().filtered, 1);
        assert_eq!(h.entries().len(), 1);
    }

    #[test]
    fn test_rejected_block_has_no_output() {
        let h = Harness::new();
        let transport = ScriptTransport::new(vec![block(0, 3, 0, 0), block(1, 0, 8, 8)]);
        let mut rx = h.receiver(transport, MeterFilter::default());
        let (_tx, signals) = no_signals();

        assert_eq!(rx.run(&signals).unwrap(), ExitReason::EndOfStream);
        assert_eq!(rx.stats().rejected, 3);
        assert_eq!(rx.stats().blocks, 2);

        // Only the second block shows up anywhere
        let entries = h.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, 0);
        assert!(h.samples.contents().iter().all(|&b| b == 2));
    }

    #[test]
    fn test_filter_applied_before_output() {
        let h = Harness::new();
        let transport = ScriptTransport::new(vec![block(3, 0, 100, 4)]);
        let filter = MeterFilter::new([101], [4]);
        let mut rx = h.receiver(transport, filter);
        let (_tx, signals) = no_signals();
        rx.run(&signals).unwrap();

        let entries = h.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message["id"], 101);
        assert_eq!(entries[0].kind, "TEST");
        assert_eq!(rx.stats().filtered, 2);
    }

    #[test]
    fn test_read_error_is_fatal() {
        let h = Harness::new();
        let transport = ScriptTransport::failing(vec![block(1, 0, 1, 1)]);
        let mut rx = h.receiver(transport, MeterFilter::default());
        let (_tx, signals) = no_signals();

        let err = rx.run(&signals).unwrap_err();
        assert!(matches!(err, ReceiverError::Transport(TransportError::Io(_))));
        // Output from before the failure stays
        assert_eq!(h.entries().len(), 1);
    }

    #[test]
    fn test_interrupt_before_first_read() {
        let h = Harness::new();
        let mut rx = h.receiver(ScriptTransport::endless(Duration::ZERO), MeterFilter::default());
        let (tx, signals) = no_signals();
        tx.send(()).unwrap();

        assert_eq!(rx.run(&signals).unwrap(), ExitReason::Interrupted);
        assert_eq!(rx.transport().reads, 0);
    }

    #[test]
    fn test_interrupt_while_running() {
        let h = Harness::new();
        let mut rx = h.receiver(
            ScriptTransport::endless(Duration::from_millis(2)),
            MeterFilter::default(),
        );
        let (tx, signals) = no_signals();

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            tx.send(()).unwrap();
            tx
        });

        assert_eq!(rx.run(&signals).unwrap(), ExitReason::Interrupted);
        assert!(rx.transport().reads > 0);
        drop(sender.join().unwrap());
    }

    #[test]
    fn test_deadline_respected() {
        let limit = Duration::from_millis(60);
        let delay = Duration::from_millis(5);
        let h = Harness::new();
        let mut rx = h.receiver(ScriptTransport::endless(delay), MeterFilter::default());
        let (_tx, rx_signal) = bounded(1);
        let start = Instant::now();
        let signals = ExitSignals::new(rx_signal, Some(limit));

        let reason = rx.run(&signals).unwrap();
        let elapsed = start.elapsed();

        match reason {
            ExitReason::TimeLimit(reported) => assert!(reported >= limit),
            other => panic!("unexpected exit: {other:?}"),
        }
        assert!(elapsed >= limit);
        // One block past the deadline, with slack for a loaded machine
        assert!(elapsed < limit + delay + Duration::from_millis(500));
    }

    #[test]
    fn test_disconnected_interrupt_is_not_an_exit() {
        let h = Harness::new();
        let transport = ScriptTransport::new(vec![block(1, 0, 1, 1), quiet()]);
        let mut rx = h.receiver(transport, MeterFilter::default());
        let (tx, signals) = no_signals();
        drop(tx);

        assert_eq!(rx.run(&signals).unwrap(), ExitReason::EndOfStream);
        assert_eq!(rx.transport().reads, 2);
    }

    #[test]
    fn test_only_time_limit_reports() {
        let report = ExitReason::TimeLimit(Duration::from_millis(1500)).report();
        assert_eq!(report.as_deref(), Some("Time limit reached: 1.5s"));
        assert_eq!(ExitReason::Interrupted.report(), None);
        assert_eq!(ExitReason::SingleShot.report(), None);
        assert_eq!(ExitReason::EndOfStream.report(), None);
    }

    #[test]
    fn test_interrupt_is_silent() {
        assert!(ExitReason::Interrupted.is_silent());
        assert!(!ExitReason::TimeLimit(Duration::ZERO).is_silent());
        assert!(!ExitReason::SingleShot.is_silent());
        assert!(!ExitReason::EndOfStream.is_silent());
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(ExitReason::Interrupted.to_string(), "interrupted");
        assert_eq!(
            ExitReason::TimeLimit(Duration::from_secs(5)).to_string(),
            "time limit reached after 5s"
        );
    }
}
