//! # ASIX SIGMA RS
//!
//! A Rust driver for the ASIX SIGMA and SIGMA2 USB logic analyzers.
//!
//! The SIGMA is an FPGA behind an FTDI USB bridge. Before it can sample, a
//! samplerate-specific FPGA bitstream has to be bitbanged into it. After that
//! the host talks to it through a nibble-wide register protocol, programs a
//! trigger lookup table, lets it sample into on-board DRAM and finally
//! downloads and decodes the compressed DRAM contents.
//!
//! ## Features
//!
//! - **Register protocol**: Frame encoding for register reads, writes and DRAM block transfers
//! - **Firmware upload**: De-obfuscation and bitbang upload of the vendor FPGA images
//! - **Trigger compilation**: Channel-level trigger conditions compiled into the FPGA LUT
//! - **Capture decoding**: DRAM cluster decoding with timestamp gap filling and trigger placement
//! - **DataFrame output**: Uses `polars` to tabulate captures per channel
//!
//! USB access itself is left to the host: anything implementing
//! [`SigmaTransport`] over an opened FTDI handle can drive a device.
//!
//! ## Examples
//!
//! ### Trigger Configuration
//!
//! ```rust
//! use asix_sigma_rs::samplerate::MHZ;
//! use asix_sigma_rs::SigmaTrigger;
//!
//! let trigger = SigmaTrigger::start_capturing_when()
//!     .high(0)
//!     .low(1)
//!     .rises(4)
//!     .build(50 * MHZ)?;
//!
//! assert_eq!(trigger.simplemask, 0b11);
//! assert_eq!(trigger.risingmask, 1 << 4);
//! # Ok::<(), asix_sigma_rs::TriggerConfigError>(())
//! ```
//!
//! ### Trigger LUT
//!
//! ```rust
//! use asix_sigma_rs::samplerate::MHZ;
//! use asix_sigma_rs::{SigmaTrigger, TriggerLut};
//!
//! let trigger = SigmaTrigger::start_capturing_when().falls(2).build(MHZ)?;
//! let lut = TriggerLut::build_basic(&trigger)?;
//! for word in lut.register_words() {
//!     println!("{:02x?}", word);
//! }
//! # Ok::<(), asix_sigma_rs::TriggerConfigError>(())
//! ```
//!
//! ### Acquisition
//!
//! ```rust,no_run
//! use asix_sigma_rs::samplerate::MHZ;
//! use asix_sigma_rs::{
//!     AcquisitionConfig, AcquisitionDriver, ChannelTrigger, FirmwareDir, LogicCapture,
//!     PollStatus, SigmaDevice, SigmaTransport, TriggerMatch,
//! };
//! use std::time::Duration;
//!
//! # fn open_ftdi() -> Box<dyn SigmaTransport> { unimplemented!() }
//! let transport = open_ftdi();
//! let mut device = SigmaDevice::new(transport, Box::new(FirmwareDir::new("/usr/share/sigrok-firmware")));
//!
//! let config = AcquisitionConfig::new(50 * MHZ)
//!     .with_duration_limit(Duration::from_millis(100))
//!     .with_capture_ratio(20);
//! device.configure(&config)?;
//! device.start(&[ChannelTrigger::new(0, TriggerMatch::Rising)])?;
//!
//! let mut capture = LogicCapture::new();
//! while device.poll(&mut capture)? == PollStatus::Capturing {
//!     std::thread::sleep(Duration::from_millis(10));
//! }
//!
//! let df = capture.to_dataframe(50 * MHZ, 16)?;
//! println!("Captured {} samples", df.height());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod capture;
pub mod decoder;
pub mod feed;
pub mod firmware;
pub mod lut;
pub mod register;
pub mod samplerate;
pub mod sigma;
pub mod transport;
pub mod trigger;

// Re-export the main types for convenience
pub use trigger::{ChannelTrigger, SigmaTrigger, TriggerBuilder, TriggerConfigError, TriggerMatch};

pub use lut::{TriggerFunc, TriggerLut, TriggerOp};

pub use transport::{BitMode, SigmaTransport, TransportError};

pub use register::{CapturePositions, ReadRegister, RegisterValue, SigmaBus, WriteRegister};

pub use firmware::{Firmware, FirmwareDir, FirmwareError, FirmwareSource, RetryPolicy};

pub use feed::{DataFeed, Packet};

pub use capture::LogicCapture;

pub use decoder::CaptureDecoder;

pub use sigma::{
    AcquisitionConfig, AcquisitionDriver, AcquisitionState, CaptureLimit, PollStatus, SigmaDevice,
    SigmaError,
};
