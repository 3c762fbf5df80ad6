//! The SIGMA's nibble-wide register protocol.
//!
//! Every byte on the wire carries an opcode in the high nibble and four bits
//! of payload in the low nibble. A register access selects an address with
//! two frames (low and high nibble) and then either writes data bytes as
//! low/high nibble pairs or issues read requests.

use crate::sigma::SigmaError;
use crate::transport::SigmaTransport;

pub const REG_ADDR_LOW: u8 = 0x00;
pub const REG_ADDR_HIGH: u8 = 0x10;
pub const REG_DATA_LOW: u8 = 0x20;
pub const REG_DATA_HIGH_WRITE: u8 = 0x30;
pub const REG_READ_ADDR: u8 = 0x40;
pub const REG_DRAM_WAIT_ACK: u8 = 0x50;
/// Bit 4 of the DRAM block opcodes selects the cache bank.
pub const REG_DRAM_BLOCK: u8 = 0x60;
pub const REG_DRAM_BLOCK_BEGIN: u8 = 0x80;
pub const REG_DRAM_BLOCK_DATA: u8 = 0xa0;

/// Auto-increment the register address after a read.
pub const NEXT_REG: u8 = 1;

/// Largest register write frame, address included.
pub const REGISTER_FRAME_LIMIT: usize = 80;
/// Largest DRAM command frame.
pub const DRAM_FRAME_LIMIT: usize = 4096;

/// Bytes per DRAM line.
pub const LINE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteRegister {
    ClockSelect = 0,
    TriggerSelect0 = 1,
    TriggerSelect1 = 2,
    Mode = 3,
    MemRow = 4,
    PostTrigger = 5,
    TriggerOption = 6,
    PinView = 7,
    Test = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadRegister {
    Id = 0,
    TriggerPosLow = 1,
    TriggerPosHigh = 2,
    TriggerPosUp = 3,
    StopPosLow = 4,
    StopPosHigh = 5,
    StopPosUp = 6,
    Mode = 7,
    PinChangeLow = 8,
    PinChangeHigh = 9,
    BlockLastTsLow = 10,
    BlockLastTsHigh = 11,
    PinView = 12,
    Test = 15,
}

/// One byte of a register frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    AddrLow(u8),
    AddrHigh(u8),
    DataLow(u8),
    DataHighWrite(u8),
    ReadAddr,
    /// Read and advance to the next register.
    ReadAddrNext,
    DramWaitAck,
    DramBlock(u8),
    DramBlockBegin(u8),
    DramBlockData(u8),
}

impl Field {
    pub fn encode(self) -> u8 {
        match self {
            Self::AddrLow(nibble) => REG_ADDR_LOW | (nibble & 0xf),
            Self::AddrHigh(nibble) => REG_ADDR_HIGH | (nibble & 0xf),
            Self::DataLow(nibble) => REG_DATA_LOW | (nibble & 0xf),
            Self::DataHighWrite(nibble) => REG_DATA_HIGH_WRITE | (nibble & 0xf),
            Self::ReadAddr => REG_READ_ADDR,
            Self::ReadAddrNext => REG_READ_ADDR | NEXT_REG,
            Self::DramWaitAck => REG_DRAM_WAIT_ACK,
            Self::DramBlock(bank) => REG_DRAM_BLOCK | ((bank & 1) << 4),
            Self::DramBlockBegin(bank) => REG_DRAM_BLOCK_BEGIN | ((bank & 1) << 4),
            Self::DramBlockData(bank) => REG_DRAM_BLOCK_DATA | ((bank & 1) << 4),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Register frame overflow: {limit} byte limit exceeded")]
pub struct FrameError {
    pub limit: usize,
}

/// Ordered sequence of [`Field`]s with a hard size limit.
#[derive(Debug, Clone)]
pub struct Frame {
    bytes: Vec<u8>,
    limit: usize,
}

impl Frame {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Empty the frame and apply a new limit, keeping the allocation.
    pub fn reset(&mut self, limit: usize) {
        self.bytes.clear();
        self.limit = limit;
    }

    pub fn push(&mut self, field: Field) -> Result<&mut Self, FrameError> {
        if self.bytes.len() >= self.limit {
            return Err(FrameError { limit: self.limit });
        }
        self.bytes.push(field.encode());
        Ok(self)
    }

    /// Address-select pair for `reg`.
    pub fn select(&mut self, reg: u8) -> Result<&mut Self, FrameError> {
        self.push(Field::AddrLow(reg & 0xf))?;
        self.push(Field::AddrHigh(reg >> 4))
    }

    /// Data-write pair for one byte.
    pub fn data(&mut self, byte: u8) -> Result<&mut Self, FrameError> {
        self.push(Field::DataLow(byte & 0xf))?;
        self.push(Field::DataHighWrite(byte >> 4))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Result of a single-byte register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    Value(u8),
    /// The device answered with the wrong number of bytes.
    ShortRead,
}

impl RegisterValue {
    /// The register value, zero for a short read.
    pub fn value(self) -> u8 {
        match self {
            Self::Value(value) => value,
            Self::ShortRead => 0,
        }
    }

    pub fn is_short(self) -> bool {
        matches!(self, Self::ShortRead)
    }
}

/// Trigger and stop positions in DRAM, as event addresses.
///
/// Bits 9 and up select the DRAM line, the low 9 bits the event in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePositions {
    pub trigger: u32,
    pub stop: u32,
}

impl CapturePositions {
    pub fn from_raw(raw: [u8; 6]) -> Self {
        let trigger = u32::from_le_bytes([raw[0], raw[1], raw[2], 0]);
        let stop = u32::from_le_bytes([raw[3], raw[4], raw[5], 0]);
        Self {
            trigger: Self::adjust(trigger),
            stop: Self::adjust(stop),
        }
    }

    // The device reports one past the position, and a line boundary lands
    // 64 events too far.
    fn adjust(pos: u32) -> u32 {
        let pos = pos.wrapping_sub(1);
        if pos & 0x1ff == 0x1ff {
            pos.wrapping_sub(64)
        } else {
            pos
        }
    }

    pub fn stop_line(&self) -> u32 {
        self.stop >> 9
    }

    pub fn stop_event(&self) -> u32 {
        self.stop & 0x1ff
    }

    pub fn trigger_line(&self) -> u32 {
        self.trigger >> 9
    }

    pub fn trigger_event(&self) -> u32 {
        self.trigger & 0x1ff
    }
}

/// Register-level access to a SIGMA over a byte transport.
///
/// Owns the transport and a scratch frame reused for every command.
#[derive(Debug)]
pub struct SigmaBus<T> {
    transport: T,
    frame: Frame,
}

impl<T: SigmaTransport> SigmaBus<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            frame: Frame::with_limit(REGISTER_FRAME_LIMIT),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Write raw bytes, bypassing the register framing.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SigmaError> {
        self.transport.write_all(bytes)?;
        Ok(())
    }

    /// Single transport read, returning the number of bytes received.
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, SigmaError> {
        let n = self.transport.read(buf).map_err(|e| {
            log::error!("Transport read failed: {}", e);
            e
        })?;
        Ok(n)
    }

    pub fn write_register(&mut self, reg: WriteRegister, data: &[u8]) -> Result<(), SigmaError> {
        self.frame.reset(REGISTER_FRAME_LIMIT);
        self.frame.select(reg as u8)?;
        for &byte in data {
            self.frame.data(byte).map_err(|e| {
                log::error!(
                    "Attempted to write {} bytes to register {:?}, frame is too small",
                    data.len() * 2 + 2,
                    reg
                );
                e
            })?;
        }
        self.transport.write_all(self.frame.as_bytes())?;
        Ok(())
    }

    pub fn set_register(&mut self, reg: WriteRegister, value: u8) -> Result<(), SigmaError> {
        self.write_register(reg, &[value])
    }

    /// Select `reg`, request a read and read back up to `buf.len()` bytes.
    pub fn read_register(&mut self, reg: ReadRegister, buf: &mut [u8]) -> Result<usize, SigmaError> {
        self.frame.reset(3);
        self.frame.select(reg as u8)?.push(Field::ReadAddr)?;
        self.transport.write_all(self.frame.as_bytes())?;
        self.read_raw(buf)
    }

    /// Read a single register. A short answer is logged and reported as
    /// [`RegisterValue::ShortRead`].
    pub fn get_register(&mut self, reg: ReadRegister) -> Result<RegisterValue, SigmaError> {
        let mut value = [0u8; 1];
        let n = self.read_register(reg, &mut value)?;
        if n != 1 {
            log::warn!("Register {:?}: 1 byte expected, got {}", reg, n);
            return Ok(RegisterValue::ShortRead);
        }
        Ok(RegisterValue::Value(value[0]))
    }

    /// Read the trigger and stop positions with one auto-incrementing burst.
    pub fn read_pos(&mut self) -> Result<CapturePositions, SigmaError> {
        self.frame.reset(7);
        self.frame
            .push(Field::AddrLow(ReadRegister::TriggerPosLow as u8))?;
        for _ in 0..6 {
            self.frame.push(Field::ReadAddrNext)?;
        }
        self.transport.write_all(self.frame.as_bytes())?;

        let mut raw = [0u8; 6];
        let n = self.read_raw(&mut raw)?;
        if n != raw.len() {
            return Err(SigmaError::Protocol {
                expected: format!("{} position bytes", raw.len()),
                actual: format!("{} bytes", n),
            });
        }
        Ok(CapturePositions::from_raw(raw))
    }

    /// Fetch `lines` DRAM lines starting at `start_line` into `out`.
    ///
    /// Lines are copied to the cache in alternating banks so that the next
    /// line is prefetched while the current one is streamed out. Returns the
    /// number of bytes received, which is short if the device stalls.
    pub fn read_dram(
        &mut self,
        start_line: u16,
        lines: usize,
        out: &mut [u8],
    ) -> Result<usize, SigmaError> {
        self.write_register(WriteRegister::MemRow, &start_line.to_be_bytes())?;

        self.frame.reset(DRAM_FRAME_LIMIT);
        self.frame.push(Field::DramBlock(0))?.push(Field::DramWaitAck)?;
        for i in 0..lines {
            let last = i + 1 == lines;
            if !last {
                self.frame.push(Field::DramBlock(((i + 1) % 2) as u8))?;
            }
            self.frame.push(Field::DramBlockData((i % 2) as u8))?;
            if !last {
                self.frame.push(Field::DramWaitAck)?;
            }
        }
        self.transport.write_all(self.frame.as_bytes())?;

        let want = (lines * LINE_SIZE).min(out.len());
        let mut got = 0;
        while got < want {
            let n = self.read_raw(&mut out[got..want])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        Ok(got)
    }
}
