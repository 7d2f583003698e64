//! Log sink and raw sample capture
//!
//! Every accepted message becomes one `LogEntry` written to the log sink in the
//! configured format. The blocks that produced those messages can also be
//! appended to a capture file; an entry's `offset` points at where its block
//! lands in that file.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::MeterMessage;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to write log entry: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode JSON log entry: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode CSV log entry: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to encode XML log entry: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("failed to write raw samples: {0}")]
    Samples(#[source] io::Error),
}

/// Log sink encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
    Csv,
    Xml,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid log format: {0:?} (expected plain, json, csv or xml)")]
pub struct UnknownFormat(pub String);

impl FromStr for LogFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            "csv" => Ok(LogFormat::Csv),
            "xml" => Ok(LogFormat::Xml),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

/// One accepted message plus capture metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry<M> {
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
    /// Capture file position of the block this message came from
    #[serde(rename = "Offset")]
    pub offset: u64,
    /// Byte length of the block's raw IQ
    #[serde(rename = "Length")]
    pub length: u64,
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Message")]
    pub message: M,
}

impl<M: MeterMessage> LogEntry<M> {
    pub fn new(time: DateTime<Utc>, offset: u64, length: u64, message: M) -> Self {
        Self {
            time,
            offset,
            length,
            kind: message.kind().to_string(),
            message,
        }
    }
}

impl<M> LogEntry<M> {
    fn timestamp(&self) -> String {
        self.time.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl<M: fmt::Display> LogEntry<M> {
    /// Plain text without offset and length, for runs without a capture file
    pub fn display_without_offset(&self) -> String {
        format!("{{Time:{} {}:{}}}", self.timestamp(), self.kind, self.message)
    }
}

impl<M: fmt::Display> fmt::Display for LogEntry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{Time:{} Offset:{} Length:{} {}:{}}}",
            self.timestamp(),
            self.offset,
            self.length,
            self.kind,
            self.message
        )
    }
}

enum Sink {
    Plain(Box<dyn Write + Send>),
    Json(Box<dyn Write + Send>),
    Csv(csv::Writer<Box<dyn Write + Send>>),
    Xml(Box<dyn Write + Send>),
}

/// Root element of each XML record
const XML_ROOT: &str = "LogMessage";

/// Writes log entries in the format chosen at startup
pub struct LogWriter {
    sink: Sink,
    /// Plain output includes offset/length only when samples are being captured
    with_offset: bool,
}

impl LogWriter {
    pub fn new(format: LogFormat, writer: Box<dyn Write + Send>, with_offset: bool) -> Self {
        let sink = match format {
            LogFormat::Plain => Sink::Plain(writer),
            LogFormat::Json => Sink::Json(writer),
            LogFormat::Csv => Sink::Csv(
                csv::WriterBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .from_writer(writer),
            ),
            LogFormat::Xml => Sink::Xml(writer),
        };

        Self { sink, with_offset }
    }

    /// Open the log destination. `/dev/stdout` (or `-`) writes to stdout.
    pub fn create(
        format: LogFormat,
        path: &Path,
        with_offset: bool,
    ) -> io::Result<Self> {
        let writer: Box<dyn Write + Send> = if path == Path::new("/dev/stdout") || path == Path::new("-") {
            Box::new(io::stdout())
        } else {
            Box::new(File::create(path)?)
        };
        Ok(Self::new(format, writer, with_offset))
    }

    pub fn write<M>(&mut self, entry: &LogEntry<M>) -> Result<(), OutputError>
    where
        M: MeterMessage + fmt::Display + Serialize,
    {
        match &mut self.sink {
            Sink::Plain(w) => {
                if self.with_offset {
                    writeln!(w, "{}", entry)?;
                } else {
                    writeln!(w, "{}", entry.display_without_offset())?;
                }
                w.flush()?;
            }
            Sink::Json(w) => {
                serde_json::to_writer(&mut *w, entry)?;
                // serde_json leaves records unterminated
                w.write_all(b"\n")?;
                w.flush()?;
            }
            Sink::Csv(w) => {
                let mut record = vec![
                    entry.timestamp(),
                    entry.offset.to_string(),
                    entry.length.to_string(),
                    entry.kind.clone(),
                ];
                record.extend(entry.message.record());
                w.write_record(&record)?;
                w.flush()?;
            }
            Sink::Xml(w) => {
                let xml = quick_xml::se::to_string_with_root(XML_ROOT, entry)?;
                // Records are unterminated, same as JSON
                w.write_all(xml.as_bytes())?;
                w.write_all(b"\n")?;
                w.flush()?;
            }
        }
        Ok(())
    }
}

/// Append-only raw IQ capture
pub struct SampleFile {
    writer: Box<dyn Write + Send>,
    offset: u64,
}

impl SampleFile {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            offset: 0,
        }
    }

    /// Create (truncate) the capture file
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(Box::new(File::create(path)?)))
    }

    /// Position the next block will be written at
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn append(&mut self, iq: &[u8]) -> Result<(), OutputError> {
        self.writer.write_all(iq).map_err(OutputError::Samples)?;
        self.writer.flush().map_err(OutputError::Samples)?;
        self.offset += iq.len() as u64;
        Ok(())
    }
}
