//! rtl_tcp client
//!
//! On connect the server sends a 12-byte header: `RTL0`, tuner type and gain
//! count, both u32 big-endian. After that the socket carries interleaved 8-bit
//! IQ samples one way and 5-byte commands (opcode + u32 BE parameter) the other.

use std::fmt;
use std::io::{BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use tracing::debug;

use super::{read_full, Transport, TransportError};

const MAGIC: [u8; 4] = *b"RTL0";

const CMD_CENTER_FREQ: u8 = 0x01;
const CMD_SAMPLE_RATE: u8 = 0x02;
const CMD_GAIN_MODE: u8 = 0x03;
const CMD_GAIN: u8 = 0x04;
const CMD_FREQ_CORRECTION: u8 = 0x05;
const CMD_AGC_MODE: u8 = 0x08;
const CMD_DIRECT_SAMPLING: u8 = 0x09;
const CMD_OFFSET_TUNING: u8 = 0x0a;
const CMD_GAIN_BY_INDEX: u8 = 0x0d;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerType {
    Unknown,
    E4000,
    Fc0012,
    Fc0013,
    Fc2580,
    R820T,
    R828D,
    Other(u32),
}

impl From<u32> for TunerType {
    fn from(v: u32) -> Self {
        match v {
            0 => TunerType::Unknown,
            1 => TunerType::E4000,
            2 => TunerType::Fc0012,
            3 => TunerType::Fc0013,
            4 => TunerType::Fc2580,
            5 => TunerType::R820T,
            6 => TunerType::R828D,
            n => TunerType::Other(n),
        }
    }
}

impl fmt::Display for TunerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunerType::Unknown => f.write_str("UNKNOWN"),
            TunerType::E4000 => f.write_str("E4000"),
            TunerType::Fc0012 => f.write_str("FC0012"),
            TunerType::Fc0013 => f.write_str("FC0013"),
            TunerType::Fc2580 => f.write_str("FC2580"),
            TunerType::R820T => f.write_str("R820T"),
            TunerType::R828D => f.write_str("R828D"),
            TunerType::Other(n) => write!(f, "tuner #{}", n),
        }
    }
}

/// Dongle description from the connect header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DongleInfo {
    pub tuner: TunerType,
    pub gain_count: u32,
}

impl DongleInfo {
    fn from_header(header: &[u8; 12]) -> Result<Self, TransportError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&header[..4]);
        if magic != MAGIC {
            return Err(TransportError::BadMagic(magic));
        }

        let tuner = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let gain_count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        Ok(Self {
            tuner: tuner.into(),
            gain_count,
        })
    }
}

/// User tuning overrides. `None` leaves the server's setting alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunerSettings {
    pub center_freq: Option<u32>,
    pub sample_rate: Option<u32>,
    pub freq_correction: Option<i32>,
    /// `true` selects manual gain
    pub gain_mode: Option<bool>,
    /// Tenths of a dB
    pub gain: Option<u32>,
    pub gain_by_index: Option<u32>,
    pub agc_mode: Option<bool>,
    /// 0 off, 1 I branch, 2 Q branch
    pub direct_sampling: Option<u32>,
    pub offset_tuning: Option<bool>,
}

impl TunerSettings {
    /// Any override that touches gain suppresses the automatic gain default
    pub fn overrides_gain(&self) -> bool {
        self.gain_mode.is_some()
            || self.gain.is_some()
            || self.gain_by_index.is_some()
            || self.agc_mode.is_some()
    }
}

pub struct RtlTcp {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    info: DongleInfo,
}

impl RtlTcp {
    pub fn connect<A: ToSocketAddrs + fmt::Debug>(addr: A) -> Result<Self, TransportError> {
        debug!("Connecting to rtl_tcp at {:?}", addr);
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        let mut reader = BufReader::with_capacity(1 << 16, stream);

        let mut header = [0u8; 12];
        read_full(&mut reader, &mut header)?;
        let info = DongleInfo::from_header(&header)?;

        Ok(Self {
            reader,
            writer,
            info,
        })
    }

    pub fn info(&self) -> DongleInfo {
        self.info
    }

    fn execute(&mut self, cmd: u8, param: u32) -> Result<(), TransportError> {
        let mut buf = [0u8; 5];
        buf[0] = cmd;
        buf[1..].copy_from_slice(&param.to_be_bytes());
        self.writer.write_all(&buf)?;
        debug!("rtl_tcp command 0x{:02x} param {}", cmd, param);
        Ok(())
    }

    pub fn set_freq_correction(&mut self, ppm: i32) -> Result<(), TransportError> {
        self.execute(CMD_FREQ_CORRECTION, ppm as u32)
    }

    pub fn set_gain(&mut self, tenths_db: u32) -> Result<(), TransportError> {
        self.execute(CMD_GAIN, tenths_db)
    }

    pub fn set_gain_by_index(&mut self, index: u32) -> Result<(), TransportError> {
        self.execute(CMD_GAIN_BY_INDEX, index)
    }

    pub fn set_agc_mode(&mut self, on: bool) -> Result<(), TransportError> {
        self.execute(CMD_AGC_MODE, on as u32)
    }

    pub fn set_direct_sampling(&mut self, mode: u32) -> Result<(), TransportError> {
        self.execute(CMD_DIRECT_SAMPLING, mode)
    }

    pub fn set_offset_tuning(&mut self, on: bool) -> Result<(), TransportError> {
        self.execute(CMD_OFFSET_TUNING, on as u32)
    }

    /// Send every override that is set
    pub fn apply(&mut self, settings: &TunerSettings) -> Result<(), TransportError> {
        if let Some(hz) = settings.center_freq {
            self.set_center_freq(hz)?;
        }
        if let Some(hz) = settings.sample_rate {
            self.set_sample_rate(hz)?;
        }
        if let Some(ppm) = settings.freq_correction {
            self.set_freq_correction(ppm)?;
        }
        if let Some(manual) = settings.gain_mode {
            self.set_gain_mode(manual)?;
        }
        if let Some(gain) = settings.gain {
            self.set_gain(gain)?;
        }
        if let Some(index) = settings.gain_by_index {
            self.set_gain_by_index(index)?;
        }
        if let Some(on) = settings.agc_mode {
            self.set_agc_mode(on)?;
        }
        if let Some(mode) = settings.direct_sampling {
            self.set_direct_sampling(mode)?;
        }
        if let Some(on) = settings.offset_tuning {
            self.set_offset_tuning(on)?;
        }
        Ok(())
    }
}

impl Transport for RtlTcp {
    fn read_block(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        read_full(&mut self.reader, buf)
    }

    fn set_center_freq(&mut self, hz: u32) -> Result<(), TransportError> {
        self.execute(CMD_CENTER_FREQ, hz)
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<(), TransportError> {
        self.execute(CMD_SAMPLE_RATE, hz)
    }

    fn set_gain_mode(&mut self, manual: bool) -> Result<(), TransportError> {
        self.execute(CMD_GAIN_MODE, manual as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn header(tuner: u32, gains: u32) -> Vec<u8> {
        let mut h = MAGIC.to_vec();
        h.extend_from_slice(&tuner.to_be_bytes());
        h.extend_from_slice(&gains.to_be_bytes());
        h
    }

    /// Serve `header` + `samples`, then return every command byte received
    fn serve(header: Vec<u8>, samples: Vec<u8>) -> (String, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(&header).unwrap();
            conn.write_all(&samples).unwrap();
            conn.shutdown(std::net::Shutdown::Write).unwrap();

            let mut commands = Vec::new();
            conn.read_to_end(&mut commands).unwrap();
            commands
        });

        (addr, handle)
    }

    #[test]
    fn test_dongle_info_from_header() {
        let h: [u8; 12] = header(5, 29).try_into().unwrap();
        let info = DongleInfo::from_header(&h).unwrap();
        assert_eq!(info.tuner, TunerType::R820T);
        assert_eq!(info.gain_count, 29);
        assert_eq!(info.tuner.to_string(), "R820T");
    }

    #[test]
    fn test_bad_magic() {
        let mut h: [u8; 12] = header(1, 14).try_into().unwrap();
        h[..4].copy_from_slice(b"HTTP");
        assert!(matches!(
            DongleInfo::from_header(&h),
            Err(TransportError::BadMagic(m)) if &m == b"HTTP"
        ));
    }

    #[test]
    fn test_read_blocks_then_end_of_stream() {
        let samples: Vec<u8> = (0..64u8).collect();
        let (addr, server) = serve(header(1, 14), samples);

        let mut sdr = RtlTcp::connect(addr.as_str()).unwrap();
        assert_eq!(sdr.info().tuner, TunerType::E4000);

        let mut block = [0u8; 32];
        sdr.read_block(&mut block).unwrap();
        assert_eq!(block[0], 0);
        assert_eq!(block[31], 31);
        sdr.read_block(&mut block).unwrap();
        assert_eq!(block[0], 32);
        assert!(matches!(sdr.read_block(&mut block), Err(TransportError::EndOfStream)));

        drop(sdr);
        assert!(server.join().unwrap().is_empty());
    }

    #[test]
    fn test_commands_on_the_wire() {
        let (addr, server) = serve(header(5, 29), Vec::new());

        let mut sdr = RtlTcp::connect(addr.as_str()).unwrap();
        sdr.set_center_freq(920_299_072).unwrap();
        sdr.apply(&TunerSettings {
            freq_correction: Some(-3),
            gain: Some(496),
            ..Default::default()
        })
        .unwrap();
        drop(sdr);

        let commands = server.join().unwrap();
        assert_eq!(commands.len(), 15);
        assert_eq!(commands[0], CMD_CENTER_FREQ);
        assert_eq!(&commands[1..5], &920_299_072u32.to_be_bytes());
        assert_eq!(commands[5], CMD_FREQ_CORRECTION);
        assert_eq!(&commands[6..10], &(-3i32).to_be_bytes());
        assert_eq!(commands[10], CMD_GAIN);
        assert_eq!(&commands[11..15], &496u32.to_be_bytes());
    }

    #[test]
    fn test_overrides_gain() {
        assert!(!TunerSettings::default().overrides_gain());
        let s = TunerSettings {
            agc_mode: Some(true),
            ..Default::default()
        };
        assert!(s.overrides_gain());
        let s = TunerSettings {
            center_freq: Some(1),
            ..Default::default()
        };
        assert!(!s.overrides_gain());
    }
}
