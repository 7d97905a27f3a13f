//! RFLAGS with deferred arithmetic-flag evaluation.
//!
//! ALU instructions record the result and a per-bit carry (or borrow) vector
//! instead of computing OSZAPC eagerly. Individual flags are derived on demand
//! and the full architectural word is only assembled at the state-sync
//! boundary or when an instruction reads the whole register.

pub const RFLAGS_CF: u64 = 1 << 0;
pub const RFLAGS_RESERVED1: u64 = 1 << 1;
pub const RFLAGS_PF: u64 = 1 << 2;
pub const RFLAGS_AF: u64 = 1 << 4;
pub const RFLAGS_ZF: u64 = 1 << 6;
pub const RFLAGS_SF: u64 = 1 << 7;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;
pub const RFLAGS_OF: u64 = 1 << 11;
pub const RFLAGS_IOPL_MASK: u64 = 3 << 12;
pub const RFLAGS_NT: u64 = 1 << 14;
pub const RFLAGS_RF: u64 = 1 << 16;
pub const RFLAGS_VM: u64 = 1 << 17;

/// The six flags covered by lazy evaluation.
pub const RFLAGS_OSZAPC: u64 =
    RFLAGS_OF | RFLAGS_SF | RFLAGS_ZF | RFLAGS_AF | RFLAGS_PF | RFLAGS_CF;

#[inline]
pub(crate) fn width_mask(width: u8) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[inline]
fn bit(v: u64, n: u8) -> bool {
    (v >> n) & 1 != 0
}

/// Carry-out (or borrow-out) of every bit position of the last ALU operation.
///
/// CF is the carry out of the top bit, OF is the top carry XOR the carry into
/// the top bit (the carry out of the bit below it), AF is the carry out of bit 3.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AluCarryInfo {
    pub carries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyFlags {
    pub result: u64,
    /// Operand width in bits: 8, 16, 32 or 64.
    pub width: u8,
    pub aux: AluCarryInfo,
}

impl LazyFlags {
    fn new(result: u64, width: u8, carries: u64) -> Self {
        let mask = width_mask(width);
        Self {
            result: result & mask,
            width,
            aux: AluCarryInfo {
                carries: carries & mask,
            },
        }
    }

    /// `result = a + b (+ carry-in)`.
    pub fn add(a: u64, b: u64, result: u64, width: u8) -> Self {
        Self::new(result, width, (a & b) | ((a | b) & !result))
    }

    /// `result = a - b (- borrow-in)`.
    pub fn sub(a: u64, b: u64, result: u64, width: u8) -> Self {
        Self::new(result, width, (!a & b) | (!(a ^ b) & result))
    }

    /// AND/OR/XOR/TEST: CF, OF and AF clear.
    pub fn logic(result: u64, width: u8) -> Self {
        Self::new(result, width, 0)
    }

    /// Flags with explicitly chosen CF/OF/AF; SF, ZF and PF still follow
    /// `result`. Used by shifts and by INC/DEC to carry CF over.
    pub fn from_parts(result: u64, width: u8, cf: bool, of: bool, af: bool) -> Self {
        let top = width - 1;
        let carries = (u64::from(cf) << top)
            | (u64::from(cf ^ of) << (top - 1))
            | (u64::from(af) << 3);
        Self::new(result, width, carries)
    }

    /// INC: like ADD of 1, but CF keeps its previous value.
    pub fn inc(a: u64, result: u64, width: u8, old_cf: bool) -> Self {
        let add = Self::add(a, 1, result, width);
        Self::from_parts(result, width, old_cf, add.of(), add.af())
    }

    /// DEC: like SUB of 1, but CF keeps its previous value.
    pub fn dec(a: u64, result: u64, width: u8, old_cf: bool) -> Self {
        let sub = Self::sub(a, 1, result, width);
        Self::from_parts(result, width, old_cf, sub.of(), sub.af())
    }

    #[inline]
    pub fn cf(&self) -> bool {
        bit(self.aux.carries, self.width - 1)
    }

    #[inline]
    pub fn of(&self) -> bool {
        bit(self.aux.carries, self.width - 1) ^ bit(self.aux.carries, self.width - 2)
    }

    #[inline]
    pub fn af(&self) -> bool {
        bit(self.aux.carries, 3)
    }

    #[inline]
    pub fn zf(&self) -> bool {
        self.result == 0
    }

    #[inline]
    pub fn sf(&self) -> bool {
        bit(self.result, self.width - 1)
    }

    #[inline]
    pub fn pf(&self) -> bool {
        (self.result as u8).count_ones() % 2 == 0
    }

    /// OSZAPC as an RFLAGS fragment.
    pub fn materialize(&self) -> u64 {
        let mut flags = 0;
        for (set, mask) in [
            (self.cf(), RFLAGS_CF),
            (self.pf(), RFLAGS_PF),
            (self.af(), RFLAGS_AF),
            (self.zf(), RFLAGS_ZF),
            (self.sf(), RFLAGS_SF),
            (self.of(), RFLAGS_OF),
        ] {
            if set {
                flags |= mask;
            }
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rflags {
    raw: u64,
    lazy: Option<LazyFlags>,
}

impl Default for Rflags {
    fn default() -> Self {
        Self {
            raw: RFLAGS_RESERVED1,
            lazy: None,
        }
    }
}

macro_rules! lazy_flag {
    ($name:ident, $mask:expr) => {
        #[inline]
        pub fn $name(&self) -> bool {
            match &self.lazy {
                Some(lazy) => lazy.$name(),
                None => self.raw & $mask != 0,
            }
        }
    };
}

impl Rflags {
    pub fn from_raw(val: u64) -> Self {
        let mut flags = Self::default();
        flags.set_raw(val);
        flags
    }

    pub fn set_raw(&mut self, val: u64) {
        self.raw = val | RFLAGS_RESERVED1;
        self.lazy = None;
    }

    pub fn set_lazy(&mut self, lazy: LazyFlags) {
        self.lazy = Some(lazy);
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy.is_some()
    }

    /// The architectural value, evaluating any pending lazy flags.
    pub fn get(&self) -> u64 {
        let raw = match &self.lazy {
            Some(lazy) => (self.raw & !RFLAGS_OSZAPC) | lazy.materialize(),
            None => self.raw,
        };
        raw | RFLAGS_RESERVED1
    }

    /// Fold the lazy flags into the raw word and return it.
    pub fn materialize(&mut self) -> u64 {
        let val = self.get();
        self.set_raw(val);
        val
    }

    lazy_flag!(cf, RFLAGS_CF);
    lazy_flag!(pf, RFLAGS_PF);
    lazy_flag!(af, RFLAGS_AF);
    lazy_flag!(zf, RFLAGS_ZF);
    lazy_flag!(sf, RFLAGS_SF);
    lazy_flag!(of, RFLAGS_OF);

    #[inline]
    pub fn df(&self) -> bool {
        self.raw & RFLAGS_DF != 0
    }

    #[inline]
    pub fn if_flag(&self) -> bool {
        self.raw & RFLAGS_IF != 0
    }

    #[inline]
    pub fn vm(&self) -> bool {
        self.raw & RFLAGS_VM != 0
    }

    /// Set or clear the bits in `mask`.
    pub fn set(&mut self, mask: u64, on: bool) {
        let mut val = if mask & RFLAGS_OSZAPC != 0 {
            self.materialize()
        } else {
            self.raw
        };
        if on {
            val |= mask;
        } else {
            val &= !mask;
        }
        self.raw = val | RFLAGS_RESERVED1;
    }

    /// Replace CF and OF, leaving SF/ZF/AF/PF as they are.
    pub fn set_cf_of(&mut self, cf: bool, of: bool) {
        self.set(RFLAGS_CF, cf);
        self.set(RFLAGS_OF, of);
    }

    /// Evaluate a Jcc/SETcc/CMOVcc condition code (low nibble of the opcode).
    pub fn condition(&self, cc: u8) -> bool {
        let holds = match (cc >> 1) & 7 {
            0 => self.of(),
            1 => self.cf(),
            2 => self.zf(),
            3 => self.cf() || self.zf(),
            4 => self.sf(),
            5 => self.pf(),
            6 => self.sf() != self.of(),
            _ => self.zf() || self.sf() != self.of(),
        };
        holds ^ (cc & 1 != 0)
    }
}
