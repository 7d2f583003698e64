//! Replay of a raw IQ capture
//!
//! Sample files written by the receiver (or by `rtl_sdr`) are plain 8-bit
//! unsigned IQ, so a replay is just sequential block reads until EOF. Tuning
//! commands have nothing to act on and are accepted silently.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::info;

use super::{read_full, Transport, TransportError};

pub struct FileSource<R = BufReader<File>> {
    reader: R,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self, TransportError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        info!("Replaying {} ({} bytes)", path.display(), len);
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> FileSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read> Transport for FileSource<R> {
    fn read_block(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        read_full(&mut self.reader, buf)
    }
}
