//! AMR Capture - ERT utility meter receiver
//!
//! Reads IQ samples from an rtl_tcp server (or a replayed capture file),
//! decodes SCM or IDM packets, filters them by meter ID and type, and logs
//! accepted messages. Blocks containing accepted messages can be saved raw
//! for later replay.

mod config;
mod decode;
mod filter;
mod output;
mod protocol;
mod receiver;
mod sdr;
mod stats;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{Config, Source};
use decode::Decoder;
use filter::MeterFilter;
use output::{LogWriter, SampleFile};
use protocol::PacketParser;
use receiver::{ExitReason, ExitSignals, Receiver};
use sdr::{apply_defaults, FileSource, RtlTcp, Transport};

fn main() -> Result<()> {
    let config = Config::load()?;

    // Diagnostics go to stderr; stdout is the default log sink
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));
    FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("===========================================");
    info!("   AMR Capture - ERT meter receiver");
    info!("===========================================");

    let decoder = Decoder::new(
        config.protocol.packet_config(config.symbol_length),
        config.fast_mag,
    );
    let parser = config.protocol.parser();
    let filter = MeterFilter::new(
        config.filter_ids.iter().copied(),
        config.filter_types.iter().copied(),
    );
    let sample_rate = config.sample_rate();

    decoder.config().log();
    info!("CRC: {}", parser.checksum_description());
    info!("Fast magnitude: {}", decoder.fast_mag());
    info!("Configuration:");
    info!("  Source: {:?}", config.source);
    info!("  Format: {:?}", config.format);
    info!("  Log file: {}", config.log_file.display());
    match &config.sample_file {
        Some(path) => info!("  Sample file: {}", path.display()),
        None => info!("  Sample file: disabled"),
    }
    if filter.is_empty() {
        info!("  Filter: none");
    } else {
        info!("  Meter IDs: {:?}", filter.ids());
        info!("  Meter types: {:?}", filter.types());
    }
    if let Some(limit) = config.time_limit {
        info!("  Time limit: {:?}", limit);
    }

    let log = LogWriter::create(config.format, &config.log_file, config.sample_file.is_some())
        .with_context(|| format!("failed to open log file {}", config.log_file.display()))?;

    let samples = match &config.sample_file {
        Some(path) => Some(
            SampleFile::create(path)
                .with_context(|| format!("failed to create sample file {}", path.display()))?,
        ),
        None => None,
    };

    let transport: Box<dyn Transport> = match &config.source {
        Source::RtlTcp(addr) => {
            let mut sdr = RtlTcp::connect(addr.as_str())
                .with_context(|| format!("failed to connect to rtl_tcp at {}", addr))?;
            let dongle = sdr.info();
            info!("Tuner: {}", dongle.tuner);
            info!("GainCount: {}", dongle.gain_count);

            sdr.apply(&config.tuner)
                .context("failed to send tuner settings")?;
            apply_defaults(&mut sdr, &config.tuner, sample_rate)
                .context("failed to send default tuner settings")?;
            Box::new(sdr)
        }
        Source::Replay(path) => Box::new(
            FileSource::open(path)
                .with_context(|| format!("failed to open replay file {}", path.display()))?,
        ),
    };

    let signals = ExitSignals::install(config.time_limit)?;

    let mut receiver = Receiver::new(transport, decoder, parser, filter, log)
        .with_samples(samples)
        .single(config.single);

    info!("Receiving {} messages...", config.protocol);
    let reason = receiver.run(&signals).context("receiver failed")?;
    receiver.log_summary(reason);

    // Reported even when quiet; stdout may be the log sink
    if let Some(report) = reason.report() {
        eprintln!("{}", report);
    }
    if reason == ExitReason::EndOfStream && matches!(config.source, Source::RtlTcp(_)) {
        bail!("rtl_tcp server closed the connection");
    }

    if !reason.is_silent() {
        info!("Shutdown complete");
    }
    Ok(())
}
