//! Sample sources
//!
//! The receiver pulls fixed-size blocks of 8-bit unsigned IQ from a `Transport`:
//! 1. `RtlTcp`: live samples from an rtl_tcp server
//! 2. `FileSource`: replay of a raw capture file

mod file;
mod rtltcp;

pub use file::FileSource;
pub use rtltcp::{RtlTcp, TunerSettings};

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("sample stream ended")]
    EndOfStream,
    #[error("invalid rtl_tcp header magic: {0:?}")]
    BadMagic([u8; 4]),
}

/// Blocking source of IQ sample blocks plus the tuner controls the receiver
/// applies at startup.
pub trait Transport {
    /// Fill `buf` completely. Partial blocks are never returned.
    fn read_block(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    fn set_center_freq(&mut self, _hz: u32) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_sample_rate(&mut self, _hz: u32) -> Result<(), TransportError> {
        Ok(())
    }

    /// `manual = false` selects automatic gain
    fn set_gain_mode(&mut self, _manual: bool) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_block(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_block(buf)
    }

    fn set_center_freq(&mut self, hz: u32) -> Result<(), TransportError> {
        (**self).set_center_freq(hz)
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<(), TransportError> {
        (**self).set_sample_rate(hz)
    }

    fn set_gain_mode(&mut self, manual: bool) -> Result<(), TransportError> {
        (**self).set_gain_mode(manual)
    }
}

/// Map a short read at a block boundary to `EndOfStream`
pub(crate) fn read_full<R: io::Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransportError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::EndOfStream),
        Err(e) => Err(TransportError::Io(e)),
    }
}

/// Center frequency used when none is given
pub const DEFAULT_CENTER_FREQ: u32 = 920_299_072;

/// Tune settings the user left alone: center frequency, the decoder's sample
/// rate and automatic gain. Overridden settings are not touched.
pub fn apply_defaults<T: Transport + ?Sized>(
    transport: &mut T,
    overrides: &TunerSettings,
    sample_rate: u32,
) -> Result<(), TransportError> {
    if overrides.center_freq.is_none() {
        transport.set_center_freq(DEFAULT_CENTER_FREQ)?;
    }
    if overrides.sample_rate.is_none() {
        transport.set_sample_rate(sample_rate)?;
    }
    if !overrides.overrides_gain() {
        transport.set_gain_mode(false)?;
    }
    Ok(())
}
