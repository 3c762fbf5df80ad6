//! FPGA firmware handling: image selection, deobfuscation, bitbang
//! transcription and the upload state machine.

use crate::register::{Field, Frame, ReadRegister, SigmaBus, WriteRegister};
use crate::sigma::SigmaError;
use crate::transport::{BitMode, SigmaTransport, BITBANG_BAUDRATE};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Largest firmware image accepted from a [`FirmwareSource`].
pub const MAX_FIRMWARE_SIZE: usize = 256 * 1024;

const KEYSTREAM_SEED: u32 = 0x3f6d_f2ab;

/// Forces the FPGA out of any loaded configuration.
const SUICIDE: [u8; 8] = [0x84, 0x84, 0x88, 0x84, 0x88, 0x84, 0x88, 0x84];
/// Pulse on D1 to start configuration.
const INIT_PULSE: [u8; 10] = [0x01, 0x03, 0x03, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01];
/// D6/INIT_B, asserted once the FPGA accepts a bitstream.
const INIT_B: u8 = 1 << 5;

const LA_MODE_REPLY: [u8; 3] = [0xa6, 0x55, 0xaa];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Firmware {
    /// 50 MHz with 8 bit fractional divider.
    Sigma50,
    Sigma100,
    Sigma200,
    /// Synchronous clock from pin.
    Sigma50Sync,
    /// Frequency counter.
    Phasor,
}

impl Firmware {
    pub const ALL: [Firmware; 5] = [
        Firmware::Sigma50,
        Firmware::Sigma100,
        Firmware::Sigma200,
        Firmware::Sigma50Sync,
        Firmware::Phasor,
    ];

    pub fn index(&self) -> usize {
        match self {
            Firmware::Sigma50 => 0,
            Firmware::Sigma100 => 1,
            Firmware::Sigma200 => 2,
            Firmware::Sigma50Sync => 3,
            Firmware::Phasor => 4,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Firmware::Sigma50 => "asix-sigma-50.fw",
            Firmware::Sigma100 => "asix-sigma-100.fw",
            Firmware::Sigma200 => "asix-sigma-200.fw",
            Firmware::Sigma50Sync => "asix-sigma-50sync.fw",
            Firmware::Phasor => "asix-sigma-phasor.fw",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FirmwareError {
    #[error("Firmware '{name}' could not be read: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Firmware '{name}' is {size} bytes, limit is {limit}")]
    TooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("Firmware '{name}' is empty")]
    Empty { name: String },

    #[error("Failed to allocate {size} byte bitbang stream")]
    Allocation { size: usize },
}

/// Where firmware images come from.
pub trait FirmwareSource {
    fn load(&self, name: &str) -> Result<Vec<u8>, FirmwareError>;
}

/// Loads firmware images from a directory.
#[derive(Debug, Clone)]
pub struct FirmwareDir {
    root: PathBuf,
}

impl FirmwareDir {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl FirmwareSource for FirmwareDir {
    fn load(&self, name: &str) -> Result<Vec<u8>, FirmwareError> {
        let path = self.root.join(name);
        log::debug!("Loading firmware from {}", path.display());
        let io_err = |source| FirmwareError::Io {
            name: name.to_string(),
            source,
        };

        let size = std::fs::metadata(&path).map_err(io_err)?.len() as usize;
        if size > MAX_FIRMWARE_SIZE {
            return Err(FirmwareError::TooLarge {
                name: name.to_string(),
                size,
                limit: MAX_FIRMWARE_SIZE,
            });
        }
        std::fs::read(&path).map_err(io_err)
    }
}

/// The byte keystream the vendor XORs over firmware images.
#[derive(Debug, Clone)]
pub struct Keystream {
    imm: u32,
}

impl Keystream {
    pub fn new() -> Self {
        Self {
            imm: KEYSTREAM_SEED,
        }
    }
}

impl Default for Keystream {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Keystream {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        self.imm = (self.imm.wrapping_add(0x0a85_3753) % 177)
            .wrapping_add(self.imm.wrapping_mul(0x0803_4052));
        Some((self.imm & 0xff) as u8)
    }
}

/// XOR `image` with the keystream in place. Applying it twice restores the
/// original bytes.
pub fn deobfuscate(image: &mut [u8]) {
    for (byte, key) in image.iter_mut().zip(Keystream::new()) {
        *byte ^= key;
    }
}

/// Transcribe a deobfuscated image into bitbang pin toggles.
///
/// Each bit, MSB first, becomes a clock-high byte followed by a clock-low
/// byte with the data bit on D6.
pub fn to_bitbang(image: &[u8]) -> Result<Vec<u8>, FirmwareError> {
    let size = image.len() * 16;
    let mut stream = Vec::new();
    stream
        .try_reserve_exact(size)
        .map_err(|_| FirmwareError::Allocation { size })?;

    for &byte in image {
        for bit in (0..8).rev() {
            let v = if byte & (1 << bit) != 0 { 0x40 } else { 0x00 };
            stream.push(v | 0x01);
            stream.push(v);
        }
    }
    Ok(stream)
}

/// Bounded polling: up to `max_attempts` checks, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Run `check` until it reports `true`, sleeping between attempts.
    pub fn run<F>(&self, mut check: F) -> Result<(), SigmaError>
    where
        F: FnMut() -> Result<bool, SigmaError>,
    {
        for _ in 0..self.max_attempts {
            if check()? {
                return Ok(());
            }
            thread::sleep(self.interval);
        }
        Err(SigmaError::Timeout {
            attempts: self.max_attempts,
            interval: self.interval,
        })
    }
}

impl Default for RetryPolicy {
    /// 10 000 attempts, 10 ms apart.
    fn default() -> Self {
        Self::new(10 * 1000, Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Idle,
    BitbangSuicide,
    BitbangPulse,
    WaitInitAck,
    StreamFirmware,
    ResetToLaMode,
    LaModeVerified,
}

/// Drives one firmware upload over a [`SigmaBus`].
///
/// The loader walks the FPGA through its configuration sequence and stops at
/// the first failure, leaving [`FirmwareLoader::state`] at the step that
/// failed. A failed upload must be restarted from scratch.
pub struct FirmwareLoader<'a, T> {
    bus: &'a mut SigmaBus<T>,
    policy: RetryPolicy,
    state: LoaderState,
}

impl<'a, T: SigmaTransport> FirmwareLoader<'a, T> {
    pub fn new(bus: &'a mut SigmaBus<T>, policy: RetryPolicy) -> Self {
        Self {
            bus,
            policy,
            state: LoaderState::Idle,
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    #[tracing::instrument(skip(self, source))]
    pub fn upload(&mut self, firmware: Firmware, source: &dyn FirmwareSource) -> Result<(), SigmaError> {
        let name = firmware.file_name();

        {
            let transport = self.bus.transport_mut();
            transport.set_bitmode(0xdf, BitMode::Bitbang)?;
            transport.set_baudrate(BITBANG_BAUDRATE)?;
        }

        self.init_bitbang()?;

        let mut image = source.load(name).map_err(|e| {
            log::error!("An error occurred while reading the firmware: {}", name);
            e
        })?;
        if image.is_empty() {
            return Err(FirmwareError::Empty {
                name: name.to_string(),
            }
            .into());
        }
        deobfuscate(&mut image);
        let stream = to_bitbang(&image)?;

        self.state = LoaderState::StreamFirmware;
        log::info!("Uploading firmware file '{}'.", name);
        self.bus.write_raw(&stream)?;

        self.state = LoaderState::ResetToLaMode;
        {
            let transport = self.bus.transport_mut();
            transport.set_bitmode(0x00, BitMode::Reset)?;
            transport.purge_buffers()?;
        }
        self.discard_garbage()?;
        self.init_la_mode()?;

        self.state = LoaderState::LaModeVerified;
        log::info!("Firmware uploaded.");
        Ok(())
    }

    fn init_bitbang(&mut self) -> Result<(), SigmaError> {
        self.state = LoaderState::BitbangSuicide;
        for _ in 0..4 {
            self.bus.write_raw(&SUICIDE)?;
        }

        self.state = LoaderState::BitbangPulse;
        self.bus.write_raw(&INIT_PULSE)?;
        self.bus.transport_mut().purge_buffers()?;

        self.state = LoaderState::WaitInitAck;
        let bus = &mut *self.bus;
        self.policy.run(|| {
            let mut pins = [0u8; 1];
            let n = bus.read_raw(&mut pins)?;
            Ok(n == 1 && pins[0] & INIT_B != 0)
        })
    }

    fn discard_garbage(&mut self) -> Result<(), SigmaError> {
        let mut pins = [0u8; 1];
        let mut discarded = 0usize;
        while self.bus.read_raw(&mut pins)? == 1 {
            discarded += 1;
        }
        if discarded > 0 {
            log::debug!("Discarded {} stale bytes after upload", discarded);
        }
        Ok(())
    }

    fn init_la_mode(&mut self) -> Result<(), SigmaError> {
        let mut frame = Frame::with_limit(13);
        frame
            .push(Field::AddrLow(ReadRegister::Id as u8))?
            .push(Field::AddrHigh(0))?
            .push(Field::ReadAddr)?
            .push(Field::AddrLow(WriteRegister::Test as u8))?
            .push(Field::DataLow(0x5))?
            .push(Field::DataHighWrite(0x5))?
            .push(Field::ReadAddr)?
            .push(Field::DataLow(0xa))?
            .push(Field::DataHighWrite(0xa))?
            .push(Field::ReadAddr)?
            .push(Field::AddrLow(WriteRegister::Mode as u8))?
            .push(Field::DataLow(0x0))?
            .push(Field::DataHighWrite(0x8))?;
        self.bus.write_raw(frame.as_bytes())?;

        let mut reply = [0u8; 3];
        let n = self.bus.read_raw(&mut reply)?;
        if n != reply.len() || reply != LA_MODE_REPLY {
            log::error!("Configuration failed. Invalid reply received.");
            return Err(SigmaError::Protocol {
                expected: format!("{:02x?}", LA_MODE_REPLY),
                actual: format!("{:02x?}", &reply[..n]),
            });
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StaticFirmware;
    use super::*;
    use crate::transport::mock::MockTransport;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::ZERO)
    }

    #[test]
    fn test_firmware_names() {
        assert_eq!(Firmware::Sigma50.file_name(), "asix-sigma-50.fw");
        assert_eq!(Firmware::Phasor.file_name(), "asix-sigma-phasor.fw");
        for (i, fw) in Firmware::ALL.iter().enumerate() {
            assert_eq!(fw.index(), i);
        }
    }

    #[test]
    fn test_keystream_first_bytes() {
        let mut imm: u64 = 0x3f6d_f2ab;
        let mut expected = Vec::new();
        for _ in 0..4 {
            imm = ((imm + 0x0a85_3753) % (1 << 32) % 177 + imm * 0x0803_4052) % (1 << 32);
            expected.push((imm & 0xff) as u8);
        }
        let got: Vec<u8> = Keystream::new().take(4).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_deobfuscate_is_self_inverse() {
        let original: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut image = original.clone();
        deobfuscate(&mut image);
        assert_ne!(image, original);
        deobfuscate(&mut image);
        assert_eq!(image, original);
    }

    #[test]
    fn test_bitbang_transcription() {
        let stream = to_bitbang(&[0xa0]).unwrap();
        assert_eq!(stream.len(), 16);
        assert_eq!(
            stream,
            vec![
                0x41, 0x40, 0x01, 0x00, 0x41, 0x40, 0x01, 0x00, //
                0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00,
            ]
        );
    }

    #[test]
    fn test_retry_policy_times_out() {
        let mut calls = 0;
        let result = fast_policy().run(|| {
            calls += 1;
            Ok(false)
        });
        assert!(matches!(result, Err(SigmaError::Timeout { attempts: 5, .. })));
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_retry_policy_succeeds_early() {
        let mut calls = 0;
        fast_policy()
            .run(|| {
                calls += 1;
                Ok(calls == 3)
            })
            .unwrap();
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_upload_sequence() {
        let mut t = MockTransport::new();
        t.reply(&[0x00]).reply(&[0x20]); // INIT_B on second poll
        t.reply(&[0xff]).reply(&[]); // one garbage byte
        t.reply(&LA_MODE_REPLY);
        let mut bus = SigmaBus::new(t);

        let mut loader = FirmwareLoader::new(&mut bus, fast_policy());
        loader
            .upload(Firmware::Sigma50, &StaticFirmware(vec![0x12, 0x34]))
            .unwrap();
        assert_eq!(loader.state(), LoaderState::LaModeVerified);

        let t = bus.transport();
        assert_eq!(t.baudrate, Some(BITBANG_BAUDRATE));
        assert_eq!(
            t.bitmodes,
            vec![(0xdf, BitMode::Bitbang), (0x00, BitMode::Reset)]
        );
        for w in &t.writes[..4] {
            assert_eq!(w.as_slice(), &SUICIDE);
        }
        assert_eq!(t.writes[4].as_slice(), &INIT_PULSE);

        let mut image = vec![0x12, 0x34];
        deobfuscate(&mut image);
        assert_eq!(t.writes[5], to_bitbang(&image).unwrap());
        assert_eq!(
            t.writes[6],
            vec![0x00, 0x10, 0x40, 0x0f, 0x25, 0x35, 0x40, 0x2a, 0x3a, 0x40, 0x03, 0x20, 0x38]
        );
    }

    #[test]
    fn test_upload_times_out_without_init_ack() {
        let mut bus = SigmaBus::new(MockTransport::new());
        let mut loader = FirmwareLoader::new(&mut bus, fast_policy());
        let err = loader
            .upload(Firmware::Sigma100, &StaticFirmware(vec![0x00]))
            .unwrap_err();
        assert!(matches!(err, SigmaError::Timeout { .. }));
        assert_eq!(loader.state(), LoaderState::WaitInitAck);
    }

    #[test]
    fn test_upload_rejects_bad_la_reply() {
        let mut t = MockTransport::new();
        t.reply(&[0x20]).reply(&[]).reply(&[0xa6, 0x55, 0x00]);
        let mut bus = SigmaBus::new(t);
        let mut loader = FirmwareLoader::new(&mut bus, fast_policy());
        let err = loader
            .upload(Firmware::Sigma200, &StaticFirmware(vec![0x00]))
            .unwrap_err();
        assert!(matches!(err, SigmaError::Protocol { .. }));
        assert_eq!(loader.state(), LoaderState::ResetToLaMode);
    }

    #[test]
    fn test_upload_rejects_empty_image() {
        let mut t = MockTransport::new();
        t.reply(&[0x20]);
        let mut bus = SigmaBus::new(t);
        let mut loader = FirmwareLoader::new(&mut bus, fast_policy());
        let err = loader
            .upload(Firmware::Sigma50, &StaticFirmware(Vec::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            SigmaError::Firmware(FirmwareError::Empty { .. })
        ));
    }

    #[test]
    fn test_firmware_dir_missing_file() {
        let dir = FirmwareDir::new("/nonexistent/sigma/firmware");
        assert!(matches!(
            dir.load("asix-sigma-50.fw"),
            Err(FirmwareError::Io { .. })
        ));
    }
}
