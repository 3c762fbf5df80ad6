use crate::samplerate::{is_fast, MHZ};

/// Number of logic channels on a SIGMA.
pub const NUM_CHANNELS: usize = 16;

/// Maximum number of simultaneous edge triggers the basic LUT can express.
pub const MAX_EDGE_TRIGGERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMatch {
    /// Channel is high.
    One,
    /// Channel is low.
    Zero,
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTrigger {
    pub channel: usize,
    pub matching: TriggerMatch,
}

impl ChannelTrigger {
    pub fn new(channel: usize, matching: TriggerMatch) -> Self {
        Self { channel, matching }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerConfigError {
    #[error("Channel {0} out of range, must be between 0 and 15")]
    ChannelOutOfRange(usize),

    #[error("Only a single pin trigger is supported in 100 and 200MHz mode")]
    TooManyFastTriggers,

    #[error("Only rising/falling trigger is supported in 100 and 200MHz mode")]
    UnsupportedFastMatch(TriggerMatch),

    #[error("At most 2 rising/falling triggers are supported, got {0}")]
    TooManyEdges(usize),
}

/// Channel-level trigger condition as the SIGMA understands it.
///
/// Bit `n` of each mask refers to channel `n`. Below 100 MHz a sample
/// triggers when `sample & simplemask == simplevalue` and every rising and
/// falling channel has just made that transition. At 100 and 200 MHz only a
/// single rising or falling pin is possible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigmaTrigger {
    pub simplevalue: u16,
    pub simplemask: u16,
    pub risingmask: u16,
    pub fallingmask: u16,
}

impl SigmaTrigger {
    pub fn start_capturing_when() -> TriggerBuilder {
        TriggerBuilder::new()
    }

    /// Whether any condition is set at all.
    pub fn is_set(&self) -> bool {
        self.simplemask != 0 || self.risingmask != 0 || self.fallingmask != 0
    }

    pub fn edge_count(&self) -> usize {
        (self.risingmask | self.fallingmask).count_ones() as usize
    }

    /// Translate per-channel matches into masks for the given samplerate.
    ///
    /// Matches on channels missing from `enabled` are ignored.
    pub fn from_matches(
        matches: &[ChannelTrigger],
        enabled: u16,
        samplerate: u64,
    ) -> Result<Self, TriggerConfigError> {
        let mut trigger = Self::default();
        let mut trigger_set = 0usize;

        for m in matches {
            if m.channel >= NUM_CHANNELS {
                return Err(TriggerConfigError::ChannelOutOfRange(m.channel));
            }
            let channelbit = 1u16 << m.channel;
            if enabled & channelbit == 0 {
                log::debug!("Ignoring trigger on disabled channel {}", m.channel);
                continue;
            }

            if is_fast(samplerate) {
                if trigger_set > 0 {
                    return Err(TriggerConfigError::TooManyFastTriggers);
                }
                match m.matching {
                    TriggerMatch::Falling => trigger.fallingmask |= channelbit,
                    TriggerMatch::Rising => trigger.risingmask |= channelbit,
                    other => return Err(TriggerConfigError::UnsupportedFastMatch(other)),
                }
                trigger_set += 1;
            } else {
                match m.matching {
                    TriggerMatch::One => {
                        trigger.simplevalue |= channelbit;
                        trigger.simplemask |= channelbit;
                    }
                    TriggerMatch::Zero => {
                        trigger.simplevalue &= !channelbit;
                        trigger.simplemask |= channelbit;
                    }
                    TriggerMatch::Falling => {
                        trigger.fallingmask |= channelbit;
                        trigger_set += 1;
                    }
                    TriggerMatch::Rising => {
                        trigger.risingmask |= channelbit;
                        trigger_set += 1;
                    }
                }
                if trigger_set > MAX_EDGE_TRIGGERS {
                    return Err(TriggerConfigError::TooManyEdges(trigger_set));
                }
            }
        }

        log::debug!(
            "Trigger at {} MHz: value {:#06x} mask {:#06x} rising {:#06x} falling {:#06x}",
            samplerate / MHZ,
            trigger.simplevalue,
            trigger.simplemask,
            trigger.risingmask,
            trigger.fallingmask
        );
        Ok(trigger)
    }

    /// Whether `sample`, following `previous`, satisfies every condition.
    pub fn matches(&self, previous: u16, sample: u16) -> bool {
        if sample & self.simplemask != self.simplevalue {
            return false;
        }
        if previous & self.risingmask != 0 || sample & self.risingmask != self.risingmask {
            return false;
        }
        if previous & self.fallingmask != self.fallingmask || sample & self.fallingmask != 0 {
            return false;
        }
        true
    }
}

/// Collects per-channel matches before validating them for a samplerate.
#[derive(Debug, Default)]
pub struct TriggerBuilder {
    matches: Vec<ChannelTrigger>,
}

impl TriggerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(mut self, channel: usize, matching: TriggerMatch) -> Self {
        self.matches.push(ChannelTrigger::new(channel, matching));
        self
    }

    pub fn high(self, channel: usize) -> Self {
        self.channel(channel, TriggerMatch::One)
    }

    pub fn low(self, channel: usize) -> Self {
        self.channel(channel, TriggerMatch::Zero)
    }

    pub fn rises(self, channel: usize) -> Self {
        self.channel(channel, TriggerMatch::Rising)
    }

    pub fn falls(self, channel: usize) -> Self {
        self.channel(channel, TriggerMatch::Falling)
    }

    pub fn matches(&self) -> &[ChannelTrigger] {
        &self.matches
    }

    /// Validate for `samplerate` with all channels enabled.
    pub fn build(self, samplerate: u64) -> Result<SigmaTrigger, TriggerConfigError> {
        SigmaTrigger::from_matches(&self.matches, 0xffff, samplerate)
    }
}
