//! Trigger look-up tables.
//!
//! The SIGMA evaluates triggers through a set of 16-entry truth tables. The
//! channels are split into four quads, each quad's four input bits index a
//! table (`m0d`, `m1d`, `m2d`), and the per-quad results are combined by the
//! glue tables `m3`/`m3s` and `m4`. This module compiles a [`SigmaTrigger`]
//! into those tables and uploads them.

use crate::register::{SigmaBus, WriteRegister};
use crate::sigma::SigmaError;
use crate::transport::SigmaTransport;
use crate::trigger::{SigmaTrigger, TriggerConfigError, MAX_EDGE_TRIGGERS, NUM_CHANNELS};

/// `m4` constant for simple (event) triggers.
const M4_SIMPLE: u16 = 0xa000;

/// Trigger result selector for "event" triggers.
const SELRES_EVENT: u8 = 3;

/// Transition condition on one channel. The truth table is indexed as
/// `[previous][current]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOp {
    Level,
    Not,
    Rise,
    Fall,
    RiseFall,
    NotRise,
    NotFall,
    NotRiseFall,
}

impl TriggerOp {
    pub const ALL: [TriggerOp; 8] = [
        TriggerOp::Level,
        TriggerOp::Not,
        TriggerOp::Rise,
        TriggerOp::Fall,
        TriggerOp::RiseFall,
        TriggerOp::NotRise,
        TriggerOp::NotFall,
        TriggerOp::NotRiseFall,
    ];

    pub fn truth_table(self) -> [[bool; 2]; 2] {
        let mut x = [[false; 2]; 2];
        match self {
            TriggerOp::Level => {
                x[0][1] = true;
                x[1][1] = true;
            }
            TriggerOp::Not => {
                x[0][0] = true;
                x[1][0] = true;
            }
            TriggerOp::Rise => x[0][1] = true,
            TriggerOp::Fall => x[1][0] = true,
            TriggerOp::RiseFall => {
                x[0][1] = true;
                x[1][0] = true;
            }
            TriggerOp::NotRise => {
                x[1][1] = true;
                x[0][0] = true;
                x[1][0] = true;
            }
            TriggerOp::NotFall => {
                x[1][1] = true;
                x[0][0] = true;
                x[0][1] = true;
            }
            TriggerOp::NotRiseFall => {
                x[1][1] = true;
                x[0][0] = true;
            }
        }
        x
    }
}

/// Boolean combinator used to fold a condition into a glue mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerFunc {
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Nxor,
}

impl TriggerFunc {
    fn apply(self, a: bool, b: bool) -> bool {
        match self {
            TriggerFunc::And => a & b,
            TriggerFunc::Nand => !(a & b),
            TriggerFunc::Or => a | b,
            TriggerFunc::Nor => !(a | b),
            TriggerFunc::Xor => a ^ b,
            TriggerFunc::Nxor => !(a ^ b),
        }
    }
}

/// Parameter block, sent as a single six byte register write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LutParams {
    pub selc: u8,
    pub selpresc: u8,
    pub selinc: u8,
    pub selres: u8,
    pub sela: u8,
    pub selb: u8,
    pub cmpb: u16,
    pub cmpa: u16,
}

impl LutParams {
    pub fn to_bytes(&self) -> [u8; 6] {
        let [cmpb_lo, cmpb_hi] = self.cmpb.to_le_bytes();
        let [cmpa_lo, cmpa_hi] = self.cmpa.to_le_bytes();
        [
            (self.selc & 0x3) | ((self.selpresc & 0x3f) << 2),
            (self.selinc & 0x3)
                | ((self.selres & 0x3) << 2)
                | ((self.sela & 0x3) << 4)
                | ((self.selb & 0x3) << 6),
            cmpb_lo,
            cmpb_hi,
            cmpa_lo,
            cmpa_hi,
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerLut {
    pub m0d: [u16; 4],
    pub m1d: [u16; 4],
    pub m2d: [u16; 4],
    pub m3: u16,
    pub m3s: u16,
    pub m4: u16,
    pub params: LutParams,
}

/// Per-quad tables matching `value` on the channels in `mask`.
///
/// Bit `j` of quad `i` is set when input pattern `j` agrees with `value` on
/// every masked channel of that quad.
pub fn build_lut_entry(value: u16, mask: u16) -> [u16; 4] {
    let mut entry = [0xffff_u16; 4];
    for (quad, slot) in entry.iter_mut().enumerate() {
        for pattern in 0..16 {
            for k in 0..4 {
                let bit = 1u16 << (quad * 4 + k);
                let expected = value & bit != 0;
                let seen = pattern & (1 << k) != 0;
                if mask & bit != 0 && expected != seen {
                    *slot &= !(1 << pattern);
                }
            }
        }
    }
    entry
}

/// Fold `op` on edge slot `index` (0 or 1) into the glue `mask` using `func`.
///
/// Glue bit `i` sees the previous/current state of slot `index` as bits
/// `2 * index + 1` and `2 * index` of `i`. With `negate` the condition's
/// truth table is point-reflected before folding.
pub fn add_trigger_function(op: TriggerOp, func: TriggerFunc, index: usize, negate: bool, mask: &mut u16) {
    let mut x = op.truth_table();
    if negate {
        let t = x;
        for (i, row) in x.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = t[1 - i][1 - j];
            }
        }
    }

    for i in 0..16 {
        let a = (i >> (2 * index)) & 1;
        let b = (i >> (2 * index + 1)) & 1;

        let aset = (*mask >> i) & 1 != 0;
        let bset = x[b][a];

        if func.apply(aset, bset) {
            *mask |= 1 << i;
        } else {
            *mask &= !(1 << i);
        }
    }
}

impl TriggerLut {
    /// Build the LUTs for the basic trigger used at 50 MHz and below: a full
    /// value/mask match plus up to two single channel transitions, ORed.
    pub fn build_basic(trigger: &SigmaTrigger) -> Result<Self, TriggerConfigError> {
        let edges = trigger.risingmask | trigger.fallingmask;
        let edge_count = edges.count_ones() as usize;
        if edge_count > MAX_EDGE_TRIGGERS {
            return Err(TriggerConfigError::TooManyEdges(edge_count));
        }

        let mut lut = TriggerLut {
            m4: M4_SIMPLE,
            m2d: build_lut_entry(trigger.simplevalue, trigger.simplemask),
            ..Default::default()
        };

        let mut masks = [0u16; MAX_EDGE_TRIGGERS];
        let slots = (0..NUM_CHANNELS)
            .map(|ch| 1u16 << ch)
            .filter(|bit| edges & bit != 0);
        for (slot, bit) in masks.iter_mut().zip(slots) {
            *slot = bit;
        }

        lut.m0d = build_lut_entry(masks[0], masks[0]);
        lut.m1d = build_lut_entry(masks[1], masks[1]);

        if masks[0] != 0 || masks[1] != 0 {
            for (index, &slot) in masks.iter().enumerate() {
                if slot & trigger.risingmask != 0 {
                    add_trigger_function(TriggerOp::Rise, TriggerFunc::Or, index, false, &mut lut.m3);
                }
                if slot & trigger.fallingmask != 0 {
                    add_trigger_function(TriggerOp::Fall, TriggerFunc::Or, index, false, &mut lut.m3);
                }
            }
        } else {
            lut.m3 = 0xffff;
        }

        lut.params.selres = SELRES_EVENT;
        Ok(lut)
    }

    /// The tables transposed into one register pair per LUT bit.
    pub fn register_words(&self) -> [[u8; 2]; 16] {
        let mut words = [[0u8; 2]; 16];
        for (i, word) in words.iter_mut().enumerate() {
            let set = |table: u16| table & (1 << i) != 0;
            let mut lo = 0u8;
            let mut hi = 0u8;

            for q in 0..4 {
                if set(self.m2d[q]) {
                    lo |= 1 << q;
                }
                if set(self.m0d[q]) {
                    hi |= 1 << q;
                }
                if set(self.m1d[q]) {
                    hi |= 1 << (q + 4);
                }
            }
            if set(self.m3) {
                lo |= 0x10;
            }
            if set(self.m3s) {
                lo |= 0x20;
            }
            if set(self.m4) {
                lo |= 0x40;
            }
            *word = [lo, hi];
        }
        words
    }

    /// Program the tables and parameter block into the device.
    pub fn upload<T: SigmaTransport>(&self, bus: &mut SigmaBus<T>) -> Result<(), SigmaError> {
        for (i, word) in self.register_words().iter().enumerate() {
            bus.write_register(WriteRegister::TriggerSelect0, word)?;
            bus.set_register(WriteRegister::TriggerSelect1, 0x30 | i as u8)?;
        }
        bus.write_register(WriteRegister::TriggerSelect0, &self.params.to_bytes())?;
        log::debug!("Trigger LUT uploaded");
        Ok(())
    }
}
