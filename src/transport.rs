//! Byte-stream transport towards the SIGMA's USB-to-parallel bridge.
//!
//! The driver never talks to USB directly. Device discovery hands over a
//! pre-opened handle implementing [`SigmaTransport`], and everything above
//! this layer is expressed as blocking reads and writes of raw bytes.

/// USB vendor id of the ASIX SIGMA.
pub const USB_VENDOR: u16 = 0xa600;
/// USB product id of the ASIX SIGMA.
pub const USB_PRODUCT: u16 = 0xa000;
/// USB description string the bridge reports.
pub const USB_DESCRIPTION: &str = "ASIX SIGMA";

/// Baudrate used while bitbanging the FPGA configuration.
pub const BITBANG_BAUDRATE: u32 = 750 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitMode {
    /// Back to the bridge's normal FIFO mode.
    Reset,
    /// Asynchronous bitbang, every byte drives the pins selected by the mask.
    Bitbang,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    #[error("Transport does not support {0}")]
    Unsupported(&'static str),
}

/// Synchronous byte stream to a SIGMA.
///
/// Reads return as soon as the bridge has nothing more to deliver, so a read
/// may legitimately return fewer bytes than requested (including zero).
pub trait SigmaTransport {
    /// Write `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Read up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn set_bitmode(&mut self, pin_mask: u8, mode: BitMode) -> Result<(), TransportError>;

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError>;

    /// Drop anything buffered in either direction.
    fn purge_buffers(&mut self) -> Result<(), TransportError>;

    /// Write the whole buffer or fail.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let written = self.write(buf)?;
        if written != buf.len() {
            log::error!("Write did not complete: {} of {} bytes", written, buf.len());
            return Err(TransportError::ShortWrite {
                expected: buf.len(),
                written,
            });
        }
        Ok(())
    }
}

impl<T: SigmaTransport + ?Sized> SigmaTransport for Box<T> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        (**self).write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn set_bitmode(&mut self, pin_mask: u8, mode: BitMode) -> Result<(), TransportError> {
        (**self).set_bitmode(pin_mask, mode)
    }

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError> {
        (**self).set_baudrate(baudrate)
    }

    fn purge_buffers(&mut self) -> Result<(), TransportError> {
        (**self).purge_buffers()
    }
}
