//! Configuration from command line flags and environment variables

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;

use crate::output::{LogFormat, UnknownFormat};
use crate::protocol::{Protocol, UnknownProtocol, DATA_RATE};
use crate::sdr::TunerSettings;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error(transparent)]
    Protocol(#[from] UnknownProtocol),
    #[error(transparent)]
    Format(#[from] UnknownFormat),
    #[error("invalid meter id in filter: {0:?}")]
    InvalidId(String),
    #[error("invalid meter type in filter: {0:?}")]
    InvalidType(String),
    #[error("invalid duration: {0:?} (examples: 90, 90s, 5m, 1h30m)")]
    InvalidDuration(String),
    #[error("symbol length must be between 1 and {max}, got {0}", max = MAX_SYMBOL_LENGTH)]
    SymbolLength(usize),
    #[error("invalid tuner gain: {0} dB")]
    TunerGain(f64),
}

/// Largest symbol length whose sample rate still fits the tuner's u32
pub const MAX_SYMBOL_LENGTH: usize = u32::MAX as usize / DATA_RATE;

/// Receive ERT utility meter broadcasts from an rtl_tcp server
#[derive(Parser, Debug, Clone)]
#[command(name = "amr-capture", version)]
pub struct Args {
    /// rtl_tcp server address
    #[arg(long, env = "RTLAMR_SERVER", default_value = "127.0.0.1:1234")]
    pub server: String,

    /// Replay a raw IQ file instead of connecting to rtl_tcp
    #[arg(long, env = "RTLAMR_REPLAY")]
    pub replay: Option<PathBuf>,

    /// Message type to receive: scm or idm
    #[arg(long, env = "RTLAMR_MSGTYPE", default_value = "scm")]
    pub msgtype: String,

    /// Samples per chip; sets the sample rate to 32768 * symbollength
    #[arg(long, env = "RTLAMR_SYMBOLLENGTH", default_value_t = 72)]
    pub symbollength: usize,

    /// Use the faster, less accurate magnitude approximation
    #[arg(long, env = "RTLAMR_FASTMAG")]
    pub fastmag: bool,

    /// Comma-separated meter IDs to log; empty logs all
    #[arg(long, env = "RTLAMR_FILTERID", default_value = "")]
    pub filterid: String,

    /// Comma-separated meter types to log; empty logs all
    #[arg(long, env = "RTLAMR_FILTERTYPE", default_value = "")]
    pub filtertype: String,

    /// Log format: plain, json, csv or xml
    #[arg(long, env = "RTLAMR_FORMAT", default_value = "plain")]
    pub format: String,

    /// Log destination
    #[arg(long, env = "RTLAMR_LOGFILE", default_value = "/dev/stdout")]
    pub logfile: PathBuf,

    /// Raw sample capture file; /dev/null disables capture
    #[arg(long, env = "RTLAMR_SAMPLEFILE", default_value = "/dev/null")]
    pub samplefile: PathBuf,

    /// Exit after the first accepted message
    #[arg(long, env = "RTLAMR_SINGLE")]
    pub single: bool,

    /// Time limit, e.g. 90, 90s, 5m, 1h30m; 0 runs until interrupted
    #[arg(long, env = "RTLAMR_DURATION", default_value = "0")]
    pub duration: String,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Center frequency in Hz
    #[arg(long)]
    pub centerfreq: Option<u32>,

    /// Sample rate in Hz, overrides the decoder's rate
    #[arg(long)]
    pub samplerate: Option<u32>,

    /// Frequency correction in ppm
    #[arg(long, allow_negative_numbers = true)]
    pub freqcorrection: Option<i32>,

    /// Manual tuner gain mode
    #[arg(long)]
    pub tunergainmode: Option<bool>,

    /// Tuner gain in dB
    #[arg(long)]
    pub tunergain: Option<f64>,

    /// Tuner gain by index into the dongle's gain table
    #[arg(long)]
    pub gainbyindex: Option<u32>,

    /// RTL2832U automatic gain control
    #[arg(long)]
    pub agcmode: Option<bool>,

    /// Direct sampling: 0 off, 1 I branch, 2 Q branch
    #[arg(long)]
    pub directsampling: Option<u32>,

    /// Offset tuning (E4000 only)
    #[arg(long)]
    pub offsettuning: Option<bool>,
}

/// Where samples come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    RtlTcp(String),
    Replay(PathBuf),
}

/// Application configuration, built once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub source: Source,

    pub protocol: Protocol,

    /// Samples per chip
    pub symbol_length: usize,

    pub fast_mag: bool,

    pub filter_ids: Vec<u32>,

    pub filter_types: Vec<u8>,

    pub format: LogFormat,

    pub log_file: PathBuf,

    /// `None` when capture is disabled
    pub sample_file: Option<PathBuf>,

    pub single: bool,

    /// `None` runs until interrupted
    pub time_limit: Option<Duration>,

    /// Default tracing level when RUST_LOG is not set
    pub log_level: LevelFilter,

    pub tuner: TunerSettings,
}

impl Config {
    /// Parse and validate flags from the process command line
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if !(1..=MAX_SYMBOL_LENGTH).contains(&args.symbollength) {
            return Err(ConfigError::SymbolLength(args.symbollength));
        }

        let gain = match args.tunergain {
            Some(db) if !(0.0..=100.0).contains(&db) => return Err(ConfigError::TunerGain(db)),
            Some(db) => Some((db * 10.0).round() as u32),
            None => None,
        };

        let source = match args.replay {
            Some(path) => Source::Replay(path),
            None => Source::RtlTcp(args.server),
        };

        let sample_file = if args.samplefile == Path::new("/dev/null") {
            None
        } else {
            Some(args.samplefile)
        };

        Ok(Self {
            source,
            protocol: args.msgtype.parse()?,
            symbol_length: args.symbollength,
            fast_mag: args.fastmag,
            filter_ids: parse_list(&args.filterid).map_err(ConfigError::InvalidId)?,
            filter_types: parse_list(&args.filtertype).map_err(ConfigError::InvalidType)?,
            format: args.format.parse()?,
            log_file: args.logfile,
            sample_file,
            single: args.single,
            time_limit: parse_duration(&args.duration)?,
            log_level: convert_filter(args.verbose.log_level_filter()),
            tuner: TunerSettings {
                center_freq: args.centerfreq,
                sample_rate: args.samplerate,
                freq_correction: args.freqcorrection,
                gain_mode: args.tunergainmode,
                gain,
                gain_by_index: args.gainbyindex,
                agc_mode: args.agcmode,
                direct_sampling: args.directsampling,
                offset_tuning: args.offsettuning,
            },
        })
    }

    /// Sample rate the decoder expects, in Hz
    pub fn sample_rate(&self) -> u32 {
        // Bounded by MAX_SYMBOL_LENGTH
        (DATA_RATE * self.symbol_length) as u32
    }
}

/// Match verbosity filter with tracing subscriber log levels
fn convert_filter(filter: log::LevelFilter) -> LevelFilter {
    match filter {
        log::LevelFilter::Off => LevelFilter::OFF,
        log::LevelFilter::Error => LevelFilter::ERROR,
        log::LevelFilter::Warn => LevelFilter::WARN,
        log::LevelFilter::Info => LevelFilter::INFO,
        log::LevelFilter::Debug => LevelFilter::DEBUG,
        log::LevelFilter::Trace => LevelFilter::TRACE,
    }
}

/// Comma-separated integers; empty input is an empty list. The offending item
/// is returned on error.
fn parse_list<T: std::str::FromStr>(s: &str) -> Result<Vec<T>, String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.parse().map_err(|_| item.to_string()))
        .collect()
}

/// Parse a time limit. Bare numbers are seconds; anything else goes through
/// humantime (`90s`, `5m`, `1h30m`, `500ms`). Zero means no limit.
pub fn parse_duration(s: &str) -> Result<Option<Duration>, ConfigError> {
    let s = s.trim();
    let total = match s.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => humantime::parse_duration(s)
            .map_err(|_| ConfigError::InvalidDuration(s.to_string()))?,
    };

    Ok((!total.is_zero()).then_some(total))
}
