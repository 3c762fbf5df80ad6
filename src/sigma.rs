use crate::decoder::{CaptureDecoder, DecodeState, EVENTS_PER_LINE};
use crate::feed::{DataFeed, Packet};
use crate::firmware::{Firmware, FirmwareError, FirmwareLoader, FirmwareSource, RetryPolicy};
use crate::lut::TriggerLut;
use crate::register::{FrameError, ReadRegister, SigmaBus, WriteRegister, LINE_SIZE};
use crate::samplerate::{is_fast, RateProfile, DEFAULT_SAMPLERATE};
use crate::transport::{SigmaTransport, TransportError};
use crate::trigger::{ChannelTrigger, SigmaTrigger, TriggerConfigError};
use std::time::{Duration, Instant};

/// DRAM lines fetched per transport round trip, a device limit.
pub const LINES_PER_READ: usize = 32;
/// Last DRAM line. Once the write position reaches it the ring is full.
pub const LAST_DRAM_LINE: u32 = 32767;

const LEDSEL0: u8 = 6;
const LEDSEL1: u8 = 7;

const MODE_START: u8 = 0x0d;
const MODE_STOP: u8 = 0x11;
const MODE_SDRAM_READ: u8 = 0x02;
/// READ_MODE status bit: the hardware trigger fired.
const MODE_TRIGGERED: u8 = 0x20;

#[derive(Debug, thiserror::Error)]
pub enum SigmaError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Frame(#[from] FrameError),

    #[error("Firmware error: {0}")]
    Firmware(#[from] FirmwareError),

    #[error("Unsupported trigger configuration: {0}")]
    Trigger(#[from] TriggerConfigError),

    #[error("Protocol error: expected {expected}, got {actual}")]
    Protocol { expected: String, actual: String },

    #[error("Timeout after {attempts} attempts {interval:?} apart")]
    Timeout { attempts: u32, interval: Duration },

    #[error("Unsupported samplerate {0} Hz")]
    UnsupportedSamplerate(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Not possible while {0:?}")]
    InvalidState(AcquisitionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No firmware loaded yet.
    Uninitialized,
    Idle,
    Capture,
    Download,
}

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Nothing running, the host can drop its poll source.
    Idle,
    Capturing,
    /// Capture downloaded and the stream ended.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureLimit {
    /// Run until DRAM is full.
    None,
    Duration(Duration),
    Samples(u64),
}

impl CaptureLimit {
    /// Wall clock limit at `samplerate`.
    pub fn as_duration(&self, samplerate: u64) -> Option<Duration> {
        match *self {
            CaptureLimit::None => None,
            CaptureLimit::Duration(d) => Some(d),
            CaptureLimit::Samples(n) if samplerate > 0 => {
                Some(Duration::from_millis(n.saturating_mul(1000) / samplerate))
            }
            CaptureLimit::Samples(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub samplerate: u64,
    pub limit: CaptureLimit,
    /// Share of the capture, in percent, kept after the trigger.
    pub capture_ratio: u8,
    pub enabled_channels: u16,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            samplerate: DEFAULT_SAMPLERATE,
            limit: CaptureLimit::None,
            capture_ratio: 50,
            enabled_channels: 0xffff,
        }
    }
}

impl AcquisitionConfig {
    pub fn new(samplerate: u64) -> Self {
        Self {
            samplerate,
            ..Default::default()
        }
    }

    pub fn with_duration_limit(mut self, limit: Duration) -> Self {
        self.limit = CaptureLimit::Duration(limit);
        self
    }

    pub fn with_sample_limit(mut self, samples: u64) -> Self {
        self.limit = CaptureLimit::Samples(samples);
        self
    }

    pub fn with_capture_ratio(mut self, percent: u8) -> Self {
        self.capture_ratio = percent;
        self
    }

    pub fn with_enabled_channels(mut self, mask: u16) -> Self {
        self.enabled_channels = mask;
        self
    }

    fn post_trigger(&self) -> u8 {
        (u32::from(self.capture_ratio) * 255 / 100) as u8
    }
}

/// Trigger in/out pin configuration, TRIGGER_OPTION register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerInOut {
    pub trgout_resistor_enable: bool,
    pub trgout_resistor_pullup: bool,
    pub trgout_bytrigger: bool,
    pub trgout_byevent: bool,
    pub trgout_bytriggerin: bool,
    pub trgout_long: bool,
    pub trgout_pin: bool,
    pub trgin_negate: bool,
    pub trgout_enable: bool,
    pub trgin_enable: bool,
}

impl TriggerInOut {
    pub fn to_bytes(&self) -> [u8; 2] {
        let bit = |set: bool, n: u8| if set { 1u8 << n } else { 0 };
        [
            bit(self.trgout_resistor_enable, 0)
                | bit(self.trgout_resistor_pullup, 1)
                | bit(self.trgout_bytrigger, 3)
                | bit(self.trgout_byevent, 4)
                | bit(self.trgout_bytriggerin, 5),
            // resistor bits are mirrored in the second byte
            bit(self.trgout_resistor_enable, 0)
                | bit(self.trgout_resistor_pullup, 1)
                | bit(self.trgout_long, 3)
                | bit(self.trgout_pin, 4)
                | bit(self.trgin_negate, 5)
                | bit(self.trgout_enable, 6)
                | bit(self.trgin_enable, 7),
        ]
    }
}

/// What a host needs from an acquisition device.
///
/// The host calls [`AcquisitionDriver::poll`] periodically from a single
/// thread while an acquisition runs and never re-enters it.
pub trait AcquisitionDriver {
    fn configure(&mut self, config: &AcquisitionConfig) -> Result<(), SigmaError>;

    fn start(&mut self, triggers: &[ChannelTrigger]) -> Result<(), SigmaError>;

    fn poll(&mut self, feed: &mut dyn DataFeed) -> Result<PollStatus, SigmaError>;

    fn stop(&mut self);
}

/// An ASIX SIGMA and everything known about its current session.
pub struct SigmaDevice<T> {
    bus: SigmaBus<T>,
    firmware_source: Box<dyn FirmwareSource>,
    retry: RetryPolicy,
    firmware: Option<Firmware>,
    profile: Option<RateProfile>,
    config: AcquisitionConfig,
    trigger: SigmaTrigger,
    use_triggers: bool,
    state: AcquisitionState,
    started: Option<Instant>,
    dram: Vec<u8>,
    decode_state: DecodeState,
}

impl<T: SigmaTransport> SigmaDevice<T> {
    /// Wrap an opened transport. No I/O happens until a samplerate is set.
    pub fn new(transport: T, firmware_source: Box<dyn FirmwareSource>) -> Self {
        Self {
            bus: SigmaBus::new(transport),
            firmware_source,
            retry: RetryPolicy::default(),
            firmware: None,
            profile: None,
            config: AcquisitionConfig::default(),
            trigger: SigmaTrigger::default(),
            use_triggers: false,
            state: AcquisitionState::Uninitialized,
            started: None,
            dram: vec![0u8; LINES_PER_READ * LINE_SIZE],
            decode_state: DecodeState::default(),
        }
    }

    /// Replace the FPGA acknowledge polling policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn current_firmware(&self) -> Option<Firmware> {
        self.firmware
    }

    pub fn samplerate(&self) -> Option<u64> {
        self.profile.map(|p| p.samplerate)
    }

    pub fn num_channels(&self) -> Option<usize> {
        self.profile.map(|p| p.num_channels)
    }

    pub fn period_ps(&self) -> Option<u64> {
        self.profile.map(|p| p.period_ps())
    }

    pub fn samples_per_event(&self) -> Option<usize> {
        self.profile.map(|p| p.samples_per_event())
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn trigger(&self) -> &SigmaTrigger {
        &self.trigger
    }

    /// Decoder state at the end of the last download.
    pub fn decode_state(&self) -> DecodeState {
        self.decode_state
    }

    pub fn transport(&self) -> &T {
        self.bus.transport()
    }

    pub fn into_transport(self) -> T {
        self.bus.into_transport()
    }

    /// Load the firmware for `samplerate` and adopt its channel layout.
    pub fn set_samplerate(&mut self, samplerate: u64) -> Result<(), SigmaError> {
        self.ensure_stopped()?;
        let profile =
            RateProfile::for_samplerate(samplerate).ok_or(SigmaError::UnsupportedSamplerate(samplerate))?;

        log::debug!(
            "Samplerate {} Hz needs firmware {:?} with {} channels",
            samplerate,
            profile.firmware,
            profile.num_channels
        );
        self.decode_state = DecodeState::default();
        let mut loader = FirmwareLoader::new(&mut self.bus, self.retry);
        if let Err(e) = loader.upload(profile.firmware, self.firmware_source.as_ref()) {
            log::error!("Firmware upload failed in state {:?}: {}", loader.state(), e);
            self.firmware = None;
            self.profile = None;
            self.state = AcquisitionState::Uninitialized;
            return Err(e);
        }

        self.firmware = Some(profile.firmware);
        self.profile = Some(profile);
        self.config.samplerate = samplerate;
        self.state = AcquisitionState::Idle;
        Ok(())
    }

    fn ensure_stopped(&self) -> Result<(), SigmaError> {
        match self.state {
            AcquisitionState::Capture | AcquisitionState::Download => {
                Err(SigmaError::InvalidState(self.state))
            }
            _ => Ok(()),
        }
    }

    #[tracing::instrument(skip_all)]
    fn start_capture(&mut self, triggers: &[ChannelTrigger]) -> Result<(), SigmaError> {
        self.ensure_stopped()?;

        let samplerate = self.profile.map_or(DEFAULT_SAMPLERATE, |p| p.samplerate);
        let trigger = SigmaTrigger::from_matches(triggers, self.config.enabled_channels, samplerate)?;
        let lut = if is_fast(samplerate) {
            None
        } else {
            Some(TriggerLut::build_basic(&trigger)?)
        };

        if self.profile.is_none() {
            log::info!("No samplerate set, defaulting to {} Hz", DEFAULT_SAMPLERATE);
            self.set_samplerate(DEFAULT_SAMPLERATE)?;
        }
        let profile = self.profile.ok_or(SigmaError::InvalidState(self.state))?;

        self.trigger = trigger;
        self.use_triggers = trigger.is_set();

        // Enter trigger programming mode.
        self.bus.set_register(WriteRegister::TriggerSelect1, 0x20)?;

        let triggerselect = match lut {
            None => {
                self.bus.set_register(WriteRegister::TriggerSelect1, 0x81)?;
                let edges = trigger.risingmask | trigger.fallingmask;
                let pin = (0..8u8).find(|&p| edges & (1 << p) != 0).unwrap_or(0);
                let mut select = (1 << LEDSEL1) | pin;
                if trigger.fallingmask != 0 {
                    select |= 1 << 3;
                }
                select
            }
            Some(lut) => {
                lut.upload(&mut self.bus)?;
                (1 << LEDSEL1) | (1 << LEDSEL0)
            }
        };

        let inout = TriggerInOut {
            trgout_bytrigger: true,
            trgout_enable: true,
            ..Default::default()
        };
        self.bus
            .write_register(WriteRegister::TriggerOption, &inout.to_bytes())?;

        // Back to normal mode.
        self.bus
            .set_register(WriteRegister::TriggerSelect1, triggerselect)?;

        let disabled = !self.config.enabled_channels;
        self.bus
            .write_register(WriteRegister::ClockSelect, &profile.clock_select(disabled))?;
        self.bus
            .set_register(WriteRegister::PostTrigger, self.config.post_trigger())?;

        self.started = Some(Instant::now());
        self.bus.set_register(WriteRegister::Mode, MODE_START)?;

        log::info!(
            "Acquisition started at {} Hz, trigger {}",
            profile.samplerate,
            if self.use_triggers { "armed" } else { "off" }
        );
        self.state = AcquisitionState::Capture;
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        let Some(limit) = self.config.limit.as_duration(self.config.samplerate) else {
            return false;
        };
        self.started.is_some_and(|t| t.elapsed() >= limit)
    }

    fn capture_mode(&mut self, feed: &mut dyn DataFeed) -> Result<PollStatus, SigmaError> {
        if self.limit_reached() {
            log::debug!("Capture time limit reached");
            return self.download_capture(feed);
        }

        match self.bus.read_pos() {
            Ok(pos) if pos.stop_line() == LAST_DRAM_LINE => {
                log::debug!("DRAM full");
                self.download_capture(feed)
            }
            Ok(_) => Ok(PollStatus::Capturing),
            Err(e) => {
                log::warn!("Reading capture position failed, retrying next poll: {}", e);
                Ok(PollStatus::Capturing)
            }
        }
    }

    /// Halt sampling, fetch the capture from DRAM and stream it to `feed`.
    ///
    /// The acquisition is stopped afterwards, also on failure. `feed` always
    /// gets a closing [`Packet::End`], after whatever samples were decoded
    /// before an error.
    #[tracing::instrument(skip_all)]
    pub fn download_capture(&mut self, feed: &mut dyn DataFeed) -> Result<PollStatus, SigmaError> {
        let result = self.download(feed);
        if let Err(e) = &result {
            log::error!("Download failed: {}", e);
        }
        feed.send(Packet::End);
        self.stop_capture();
        result.map(|()| PollStatus::Finished)
    }

    fn download(&mut self, feed: &mut dyn DataFeed) -> Result<(), SigmaError> {
        log::info!("Downloading sample data.");
        self.state = AcquisitionState::Download;

        self.bus.set_register(WriteRegister::Mode, MODE_STOP)?;
        self.bus.set_register(WriteRegister::Mode, MODE_SDRAM_READ)?;

        let pos = self.bus.read_pos()?;
        let modestatus = self.bus.get_register(ReadRegister::Mode)?;
        if modestatus.is_short() {
            log::warn!("Mode status unreadable, assuming the trigger did not fire");
        }
        if pos.stop_line() > LAST_DRAM_LINE {
            return Err(SigmaError::Protocol {
                expected: format!("stop line at most {}", LAST_DRAM_LINE),
                actual: format!("stop position {:#08x}", pos.stop),
            });
        }
        let mut trigger_at = (modestatus.value() & MODE_TRIGGERED != 0)
            .then(|| (pos.trigger_line(), pos.trigger_event()));
        if trigger_at.is_some_and(|(line, _)| line > LAST_DRAM_LINE) {
            log::warn!("Trigger position {:#08x} outside DRAM, dropping trigger", pos.trigger);
            trigger_at = None;
        }

        let lines_total = pos.stop_line() as usize + 1;
        let samplerate = self.config.samplerate;
        let mut decoder = CaptureDecoder::new(self.trigger, self.use_triggers, samplerate);
        log::debug!(
            "Fetching {} DRAM lines, trigger {:?}",
            lines_total,
            trigger_at
        );

        let mut lines_done = 0usize;
        while lines_done < lines_total {
            let lines_curr = LINES_PER_READ.min(lines_total - lines_done);
            let start_line = u16::try_from(lines_done).map_err(|_| SigmaError::Protocol {
                expected: format!("DRAM line at most {}", LAST_DRAM_LINE),
                actual: format!("line {}", lines_done),
            })?;
            let received = self
                .bus
                .read_dram(start_line, lines_curr, &mut self.dram)?;
            if received < lines_curr * LINE_SIZE {
                log::warn!(
                    "Short DRAM read at line {}: {} of {} bytes",
                    lines_done,
                    received,
                    lines_curr * LINE_SIZE
                );
            }

            if lines_done == 0 {
                decoder.seed(&self.dram[..received]);
            }

            for i in 0..lines_curr {
                let line_no = lines_done + i;
                let events = if line_no + 1 == lines_total {
                    pos.stop_event() as usize
                } else {
                    EVENTS_PER_LINE
                };
                let trigger_event = trigger_at
                    .filter(|&(line, _)| line as usize == line_no)
                    .map(|(_, event)| event);

                let start = i * LINE_SIZE;
                let end = (start + LINE_SIZE).min(received);
                let line = if start < end { &self.dram[start..end] } else { &[][..] };
                decoder.decode_line(line, events, trigger_event, feed);
            }

            lines_done += lines_curr;
        }

        self.decode_state = decoder.state();
        Ok(())
    }

    fn stop_capture(&mut self) {
        if self.state != AcquisitionState::Uninitialized {
            self.state = AcquisitionState::Idle;
        }
        self.started = None;
    }
}

impl<T: SigmaTransport> AcquisitionDriver for SigmaDevice<T> {
    fn configure(&mut self, config: &AcquisitionConfig) -> Result<(), SigmaError> {
        self.ensure_stopped()?;
        if config.capture_ratio > 100 {
            return Err(SigmaError::InvalidConfig("capture ratio must be 0..=100"));
        }
        if RateProfile::for_samplerate(config.samplerate).is_none() {
            return Err(SigmaError::UnsupportedSamplerate(config.samplerate));
        }
        if self.samplerate() != Some(config.samplerate) {
            self.set_samplerate(config.samplerate)?;
        }
        self.config = *config;
        Ok(())
    }

    fn start(&mut self, triggers: &[ChannelTrigger]) -> Result<(), SigmaError> {
        self.start_capture(triggers)
    }

    fn poll(&mut self, feed: &mut dyn DataFeed) -> Result<PollStatus, SigmaError> {
        match self.state {
            AcquisitionState::Capture => self.capture_mode(feed),
            AcquisitionState::Download => Ok(PollStatus::Capturing),
            AcquisitionState::Idle | AcquisitionState::Uninitialized => Ok(PollStatus::Idle),
        }
    }

    fn stop(&mut self) {
        self.stop_capture();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::testing::{dram_line, ramp};
    use crate::feed::testing::{PacketLog, Recorded};
    use crate::firmware::testing::StaticFirmware;
    use crate::samplerate::MHZ;
    use crate::transport::mock::MockTransport;
    use crate::trigger::TriggerMatch;

    fn script_upload(t: &mut MockTransport) {
        t.reply(&[0x20]).reply(&[]).reply(&[0xa6, 0x55, 0xaa]);
    }

    fn device() -> SigmaDevice<MockTransport> {
        SigmaDevice::new(MockTransport::new(), Box::new(StaticFirmware(vec![0x5a; 4])))
            .with_retry_policy(RetryPolicy::new(3, Duration::ZERO))
    }

    fn configured(config: AcquisitionConfig) -> SigmaDevice<MockTransport> {
        let mut dev = device();
        script_upload(dev.bus.transport_mut());
        dev.configure(&config).unwrap();
        dev
    }

    /// Raw position bytes for adjusted trigger and stop positions.
    fn positions(trigger: u32, stop: u32) -> Vec<u8> {
        let t = (trigger + 1).to_le_bytes();
        let s = (stop + 1).to_le_bytes();
        vec![t[0], t[1], t[2], s[0], s[1], s[2]]
    }

    fn set_register_frame(reg: WriteRegister, value: u8) -> Vec<u8> {
        vec![reg as u8, 0x10, 0x20 | (value & 0xf), 0x30 | (value >> 4)]
    }

    #[test]
    fn test_samplerate_selects_firmware() {
        let mut dev = device();
        for (rate, index, channels) in [(50 * MHZ, 0, 16), (100 * MHZ, 1, 8), (200 * MHZ, 2, 4)] {
            script_upload(dev.bus.transport_mut());
            dev.set_samplerate(rate).unwrap();
            assert_eq!(dev.current_firmware().unwrap().index(), index);
            assert_eq!(dev.num_channels(), Some(channels));
            assert_eq!(dev.state(), AcquisitionState::Idle);
        }
        assert_eq!(dev.period_ps(), Some(5000));
        assert_eq!(dev.samples_per_event(), Some(4));
    }

    #[test]
    fn test_unsupported_samplerate_does_no_io() {
        let mut dev = device();
        let err = dev.set_samplerate(3 * MHZ).unwrap_err();
        assert!(matches!(err, SigmaError::UnsupportedSamplerate(3_000_000)));
        assert!(dev.transport().writes.is_empty());
    }

    #[test]
    fn test_failed_upload_leaves_device_uninitialized() {
        let mut dev = device();
        let err = dev.set_samplerate(MHZ).unwrap_err();
        assert!(matches!(err, SigmaError::Timeout { attempts: 3, .. }));
        assert_eq!(dev.state(), AcquisitionState::Uninitialized);
        assert_eq!(dev.current_firmware(), None);
    }

    #[test]
    fn test_configure_validates() {
        let mut dev = device();
        let err = dev
            .configure(&AcquisitionConfig::new(MHZ).with_capture_ratio(101))
            .unwrap_err();
        assert!(matches!(err, SigmaError::InvalidConfig(_)));
        assert!(dev.transport().writes.is_empty());
    }

    #[test]
    fn test_invalid_trigger_rejected_before_io() {
        let mut dev = configured(AcquisitionConfig::new(50 * MHZ));
        let writes = dev.transport().writes.len();
        let triggers = [
            ChannelTrigger::new(0, TriggerMatch::Rising),
            ChannelTrigger::new(1, TriggerMatch::Rising),
            ChannelTrigger::new(2, TriggerMatch::Falling),
        ];
        let err = dev.start(&triggers).unwrap_err();
        assert!(matches!(
            err,
            SigmaError::Trigger(TriggerConfigError::TooManyEdges(3))
        ));
        assert_eq!(dev.transport().writes.len(), writes);
        assert_eq!(dev.state(), AcquisitionState::Idle);
    }

    #[test]
    fn test_start_programs_basic_trigger() {
        let mut dev = configured(AcquisitionConfig::new(MHZ).with_capture_ratio(100));
        let before = dev.transport().writes.len();
        dev.start(&[ChannelTrigger::new(4, TriggerMatch::One)]).unwrap();
        assert_eq!(dev.state(), AcquisitionState::Capture);
        assert!(dev.trigger().is_set());

        let writes = &dev.transport().writes[before..];
        assert_eq!(writes[0], set_register_frame(WriteRegister::TriggerSelect1, 0x20));
        // 16 LUT words with their select, then the parameter block
        assert_eq!(writes.len(), 1 + 33 + 5);
        assert_eq!(
            writes[34],
            vec![0x06, 0x10, 0x28, 0x30, 0x20, 0x34]
        );
        assert_eq!(writes[35], set_register_frame(WriteRegister::TriggerSelect1, 0xc0));
        // async 0, fraction 49, no channels disabled
        assert_eq!(
            writes[36],
            vec![0x00, 0x10, 0x20, 0x30, 0x21, 0x33, 0x20, 0x30, 0x20, 0x30]
        );
        assert_eq!(writes[37], set_register_frame(WriteRegister::PostTrigger, 255));
        assert_eq!(writes[38], set_register_frame(WriteRegister::Mode, 0x0d));
    }

    #[test]
    fn test_start_fast_pin_trigger() {
        let mut dev = configured(AcquisitionConfig::new(100 * MHZ));
        let before = dev.transport().writes.len();
        dev.start(&[ChannelTrigger::new(3, TriggerMatch::Falling)]).unwrap();

        let writes = &dev.transport().writes[before..];
        assert_eq!(writes[1], set_register_frame(WriteRegister::TriggerSelect1, 0x81));
        assert_eq!(writes[3], set_register_frame(WriteRegister::TriggerSelect1, 0x8b));
        assert_eq!(writes[4], set_register_frame(WriteRegister::ClockSelect, 0x00));
    }

    #[test]
    fn test_start_without_samplerate_uses_default() {
        let mut dev = device();
        script_upload(dev.bus.transport_mut());
        dev.start(&[]).unwrap();
        assert_eq!(dev.samplerate(), Some(DEFAULT_SAMPLERATE));
        assert_eq!(dev.current_firmware(), Some(Firmware::Sigma50));
        assert_eq!(dev.state(), AcquisitionState::Capture);
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut dev = configured(AcquisitionConfig::new(MHZ));
        dev.start(&[]).unwrap();
        assert!(matches!(
            dev.start(&[]),
            Err(SigmaError::InvalidState(AcquisitionState::Capture))
        ));
    }

    #[test]
    fn test_poll_idle() {
        let mut dev = device();
        let mut log = PacketLog::default();
        assert_eq!(dev.poll(&mut log).unwrap(), PollStatus::Idle);
        assert!(log.packets.is_empty());
    }

    #[test]
    fn test_poll_keeps_capturing_on_position_failure() {
        let mut dev = configured(AcquisitionConfig::new(MHZ));
        dev.start(&[]).unwrap();
        let mut log = PacketLog::default();
        assert_eq!(dev.poll(&mut log).unwrap(), PollStatus::Capturing);
        assert_eq!(dev.state(), AcquisitionState::Capture);
        assert!(log.packets.is_empty());
    }

    #[test]
    fn test_poll_downloads_after_time_limit() {
        let mut dev = configured(AcquisitionConfig::new(MHZ).with_duration_limit(Duration::ZERO));
        dev.start(&[]).unwrap();

        let line = dram_line(&[(0, ramp(0)), (7, ramp(7)), (14, ramp(14))]);
        let t = dev.bus.transport_mut();
        t.reply(&positions(0, 21)).reply(&[0x00]).reply(&line);

        let mut log = PacketLog::default();
        assert_eq!(dev.poll(&mut log).unwrap(), PollStatus::Finished);
        assert_eq!(dev.state(), AcquisitionState::Idle);
        assert_eq!(log.samples(), (0..21).collect::<Vec<u16>>());
        assert_eq!(log.packets.last(), Some(&Recorded::End));
        assert!(!log.packets.contains(&Recorded::Trigger));
        assert_eq!(dev.decode_state(), DecodeState { lastts: 14, lastsample: 20 });

        let writes = &dev.transport().writes;
        assert!(writes.contains(&set_register_frame(WriteRegister::Mode, 0x11)));
        assert!(writes.contains(&set_register_frame(WriteRegister::Mode, 0x02)));
    }

    #[test]
    fn test_download_with_hardware_trigger() {
        let mut dev = configured(AcquisitionConfig::new(50 * MHZ).with_duration_limit(Duration::ZERO));
        dev.start(&[ChannelTrigger::new(8, TriggerMatch::Rising)]).unwrap();

        let line = dram_line(&[(0, [0, 0, 0, 0x100, 0x100, 0x100, 0x100]), (7, [0x100; 7])]);
        let t = dev.bus.transport_mut();
        t.reply(&positions(6, 14)).reply(&[0x20]).reply(&line);

        let mut log = PacketLog::default();
        dev.poll(&mut log).unwrap();
        assert_eq!(
            log.packets,
            vec![
                Recorded::Logic(vec![0, 0, 0]),
                Recorded::Trigger,
                Recorded::Logic(vec![0x100; 4]),
                Recorded::Logic(vec![0x100; 7]),
                Recorded::End,
            ]
        );
    }

    #[test]
    fn test_dram_full_triggers_download() {
        let mut dev = configured(AcquisitionConfig::new(MHZ));
        dev.start(&[]).unwrap();

        let full = (LAST_DRAM_LINE << 9) | 5;
        let line = dram_line(&[(0, ramp(0))]);
        let t = dev.bus.transport_mut();
        t.reply(&positions(0, full));
        t.reply(&positions(0, 7)).reply(&[0x00]).reply(&line);

        let mut log = PacketLog::default();
        assert_eq!(dev.poll(&mut log).unwrap(), PollStatus::Finished);
        assert_eq!(log.samples(), ramp(0).to_vec());
    }

    #[test]
    fn test_download_in_batches() {
        let mut dev = configured(AcquisitionConfig::new(MHZ).with_duration_limit(Duration::ZERO));
        dev.start(&[]).unwrap();
        let before = dev.transport().writes.len();

        let stop = (40 << 9) | 10;
        let t = dev.bus.transport_mut();
        t.reply(&positions(0, stop)).reply(&[0x00]);
        t.reply(&vec![0u8; 32 * LINE_SIZE]);
        t.reply(&vec![0u8; 9 * LINE_SIZE]);

        let mut log = PacketLog::default();
        dev.poll(&mut log).unwrap();
        assert_eq!(log.samples().len(), 40 * EVENTS_PER_LINE + 10);

        let memrow: Vec<&Vec<u8>> = dev.transport().writes[before..]
            .iter()
            .filter(|w| w.len() == 6 && w[0] == WriteRegister::MemRow as u8)
            .collect();
        assert_eq!(memrow.len(), 2);
        assert_eq!(memrow[0], &vec![0x04, 0x10, 0x20, 0x30, 0x20, 0x30]);
        assert_eq!(memrow[1], &vec![0x04, 0x10, 0x20, 0x30, 0x20, 0x32]);
    }

    #[test]
    fn test_garbage_stop_position_rejected() {
        let mut dev = configured(AcquisitionConfig::new(MHZ).with_duration_limit(Duration::ZERO));
        dev.start(&[]).unwrap();
        let before = dev.transport().writes.len();

        // A zeroed position wraps to a stop line far beyond DRAM.
        let t = dev.bus.transport_mut();
        t.reply(&[0u8; 6]).reply(&[0x00]);

        let mut log = PacketLog::default();
        let err = dev.poll(&mut log).unwrap_err();
        assert!(matches!(err, SigmaError::Protocol { .. }));
        assert_eq!(dev.state(), AcquisitionState::Idle);
        assert_eq!(log.packets, vec![Recorded::End]);

        let memrow = dev.transport().writes[before..]
            .iter()
            .filter(|w| w.len() == 6 && w[0] == WriteRegister::MemRow as u8)
            .count();
        assert_eq!(memrow, 0);
    }

    #[test]
    fn test_trigger_outside_dram_is_dropped() {
        let mut dev = configured(AcquisitionConfig::new(MHZ).with_duration_limit(Duration::ZERO));
        dev.start(&[ChannelTrigger::new(0, TriggerMatch::One)]).unwrap();

        let line = dram_line(&[(0, [1; 7])]);
        let t = dev.bus.transport_mut();
        // trigger raw 0 wraps past the last DRAM line, stop is line 0 event 7
        t.reply(&[0, 0, 0, 8, 0, 0]).reply(&[0x20]).reply(&line);

        let mut log = PacketLog::default();
        assert_eq!(dev.poll(&mut log).unwrap(), PollStatus::Finished);
        assert_eq!(
            log.packets,
            vec![Recorded::Logic(vec![1; 7]), Recorded::End]
        );
    }

    #[test]
    fn test_samplerate_change_resets_decode_state() {
        let mut dev = configured(AcquisitionConfig::new(MHZ).with_duration_limit(Duration::ZERO));
        dev.start(&[]).unwrap();
        let line = dram_line(&[(0, ramp(0)), (7, ramp(7))]);
        let t = dev.bus.transport_mut();
        t.reply(&positions(0, 14)).reply(&[0x00]).reply(&line);
        dev.poll(&mut PacketLog::default()).unwrap();
        assert_eq!(dev.decode_state(), DecodeState { lastts: 7, lastsample: 13 });

        script_upload(dev.bus.transport_mut());
        dev.set_samplerate(50 * MHZ).unwrap();
        assert_eq!(dev.decode_state(), DecodeState::default());
    }

    #[test]
    fn test_sample_limit_converts_to_duration() {
        assert_eq!(
            CaptureLimit::Samples(1_000_000).as_duration(MHZ),
            Some(Duration::from_secs(1))
        );
        assert_eq!(CaptureLimit::None.as_duration(MHZ), None);
    }

    #[test]
    fn test_trigger_inout_bytes() {
        let inout = TriggerInOut {
            trgout_bytrigger: true,
            trgout_enable: true,
            ..Default::default()
        };
        assert_eq!(inout.to_bytes(), [0x08, 0x40]);
    }
}
