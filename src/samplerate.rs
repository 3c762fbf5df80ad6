//! Supported samplerates and what each one implies for firmware, channel
//! count and clock programming.

use crate::firmware::Firmware;

pub const KHZ: u64 = 1000;
pub const MHZ: u64 = 1000 * KHZ;

/// Samplerates the driver offers. Below 50 MHz the divider is `50 MHz / rate`.
pub const SAMPLERATES: [u64; 10] = [
    200 * KHZ, // div=250
    250 * KHZ, // div=200
    500 * KHZ, // div=100
    MHZ,       // div=50
    5 * MHZ,   // div=10
    10 * MHZ,  // div=5
    25 * MHZ,  // div=2
    50 * MHZ,  // div=1
    100 * MHZ,
    200 * MHZ,
];

/// Samplerate used when an acquisition starts without one configured.
pub const DEFAULT_SAMPLERATE: u64 = 200 * KHZ;

/// 100 and 200 MHz need dedicated firmware and only support a single pin trigger.
pub fn is_fast(samplerate: u64) -> bool {
    samplerate >= 100 * MHZ
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateProfile {
    pub samplerate: u64,
    pub firmware: Firmware,
    pub num_channels: usize,
}

impl RateProfile {
    /// Look up the profile for one of [`SAMPLERATES`].
    pub fn for_samplerate(samplerate: u64) -> Option<Self> {
        if !SAMPLERATES.contains(&samplerate) {
            return None;
        }
        let (firmware, num_channels) = match samplerate {
            r if r <= 50 * MHZ => (Firmware::Sigma50, 16),
            r if r == 100 * MHZ => (Firmware::Sigma100, 8),
            _ => (Firmware::Sigma200, 4),
        };
        Some(Self {
            samplerate,
            firmware,
            num_channels,
        })
    }

    /// Sample period in picoseconds.
    pub fn period_ps(&self) -> u64 {
        1_000_000_000_000 / self.samplerate
    }

    /// Samples of each channel packed into one 16 bit event.
    pub fn samples_per_event(&self) -> usize {
        16 / self.num_channels
    }

    /// Bytes for the CLOCK_SELECT register.
    pub fn clock_select(&self, disabled_channels: u16) -> Vec<u8> {
        match self.firmware {
            Firmware::Sigma200 => vec![0xf0],
            Firmware::Sigma100 => vec![0x00],
            _ => {
                let fraction = (50 * MHZ / self.samplerate - 1) as u8;
                let [lo, hi] = disabled_channels.to_le_bytes();
                // async, fraction, disabled channel mask
                vec![0x00, fraction, lo, hi]
            }
        }
    }
}
