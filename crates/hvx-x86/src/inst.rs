use core::fmt;

use bitflags::bitflags;

use crate::Command;

/// Execution mode the bytes are decoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Real,
    Virtual8086,
    /// `cs_db` is the D/B bit of the current CS descriptor.
    Protected { cs_db: bool },
    Long64,
}

impl CpuMode {
    /// Default operand/address size in bytes before any override prefix.
    pub fn default_size(self) -> u8 {
        match self {
            CpuMode::Real | CpuMode::Virtual8086 => 2,
            CpuMode::Protected { cs_db } => {
                if cs_db {
                    4
                } else {
                    2
                }
            }
            CpuMode::Long64 => 4,
        }
    }

    #[inline]
    pub fn is_long(self) -> bool {
        matches!(self, CpuMode::Long64)
    }
}

/// Segment registers in ModRM.reg encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    pub fn from_index(index: u8) -> Option<SegReg> {
        Self::ALL.get(usize::from(index)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            SegReg::Es => "es",
            SegReg::Cs => "cs",
            SegReg::Ss => "ss",
            SegReg::Ds => "ds",
            SegReg::Fs => "fs",
            SegReg::Gs => "gs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepPrefix {
    /// F3: REP / REPE.
    Rep,
    /// F2: REPNE.
    Repne,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RexPrefix {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: Option<RepPrefix>,
    pub segment: Option<SegReg>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub rex: Option<RexPrefix>,
}

impl Prefixes {
    #[inline]
    pub fn rex_w(&self) -> bool {
        self.rex.is_some_and(|r| r.w)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModRm {
    pub mode: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRm {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            mode: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
        }
    }

    #[inline]
    pub fn is_register(&self) -> bool {
        self.mode == 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// General-purpose register 0..=15; width comes from the operand size.
    Gpr(u8),
    /// AH, CH, DH, BH (0..=3) when no REX prefix is present.
    HighByte(u8),
    Segment(SegReg),
    Control(u8),
    Debug(u8),
}

/// A ModRM/SIB memory reference. The segment already reflects any override
/// prefix and the SS default for BP/SP-based addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryOperand {
    pub segment: SegReg,
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub displacement: i64,
    /// Displacement is relative to the next instruction's RIP.
    pub rip_relative: bool,
}

impl MemoryOperand {
    /// Effective address (segment base excluded), truncated to `address_size`.
    pub fn effective_address(
        &self,
        reg: impl Fn(u8) -> u64,
        next_rip: u64,
        address_size: u8,
    ) -> u64 {
        let mut ea = self.displacement as u64;
        if self.rip_relative {
            ea = ea.wrapping_add(next_rip);
        }
        if let Some(base) = self.base {
            ea = ea.wrapping_add(reg(base));
        }
        if let Some(index) = self.index {
            ea = ea.wrapping_add(reg(index).wrapping_mul(u64::from(self.scale)));
        }
        match address_size {
            2 => ea & 0xffff,
            4 => ea & 0xffff_ffff,
            _ => ea,
        }
    }
}

/// A direct `moffs` address (A0-A3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryOffset {
    pub segment: SegReg,
    pub offset: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    #[default]
    None,
    /// Already sign- or zero-extended to 64 bits as the encoding requires.
    Immediate(u64),
    Register(Register),
    Memory(MemoryOperand),
    Offset(MemoryOffset),
    FpuRegister(u8),
    FpuMemory(MemoryOperand),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub kind: OperandKind,
    /// Width in bytes.
    pub size: u8,
}

impl Operand {
    pub const NONE: Operand = Operand {
        kind: OperandKind::None,
        size: 0,
    };

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self.kind, OperandKind::None)
    }

    #[inline]
    pub fn is_memory(&self) -> bool {
        matches!(
            self.kind,
            OperandKind::Memory(_) | OperandKind::Offset(_) | OperandKind::FpuMemory(_)
        )
    }

    pub fn immediate(&self) -> Option<u64> {
        match self.kind {
            OperandKind::Immediate(v) => Some(v),
            _ => None,
        }
    }
}

bitflags! {
    /// RFLAGS bits an instruction writes, in architectural bit positions.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlagsMask: u32 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;

        const OSZAP = Self::OF.bits()
            | Self::SF.bits()
            | Self::ZF.bits()
            | Self::AF.bits()
            | Self::PF.bits();
        const OSZAPC = Self::OSZAP.bits() | Self::CF.bits();
        const OC = Self::OF.bits() | Self::CF.bits();
        /// SF ZF AF PF CF as written by SAHF.
        const LAHF = Self::SF.bits()
            | Self::ZF.bits()
            | Self::AF.bits()
            | Self::PF.bits()
            | Self::CF.bits();
    }
}

/// x87 decode details.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FpuInfo {
    /// Pops the register stack after the operation.
    pub pop: bool,
    /// Operands are reversed (FSUBR/FDIVR and the DC/DE register forms).
    pub reverse: bool,
    /// Secondary selector: FLD constant index, FCMOV condition, or 0.
    pub sub: u8,
}

/// One fully decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedInstruction {
    pub opcode: [u8; 4],
    pub opcode_len: u8,
    pub cmd: Command,
    pub operands: [Operand; 4],
    /// Operand size in bytes (1, 2, 4 or 8).
    pub operand_size: u8,
    /// Address size in bytes (2, 4 or 8).
    pub address_size: u8,
    pub prefixes: Prefixes,
    pub modrm: Option<ModRm>,
    pub sib: Option<u8>,
    pub displacement: i64,
    /// Bytes consumed from the stream, prefixes included.
    pub len: u8,
    pub flags: FlagsMask,
    pub fpu: FpuInfo,
}

impl DecodedInstruction {
    /// The last opcode byte (the one selecting the instruction in its map).
    #[inline]
    pub fn op(&self) -> u8 {
        self.opcode[usize::from(self.opcode_len.max(1)) - 1]
    }

    #[inline]
    pub fn is_two_byte(&self) -> bool {
        self.opcode_len >= 2 && self.opcode[0] == 0x0f
    }

    pub fn operand_count(&self) -> usize {
        self.operands.iter().take_while(|o| !o.is_none()).count()
    }

    /// Condition code for Jcc/SETcc/CMOVcc/FCMOVcc-style opcodes.
    #[inline]
    pub fn condition(&self) -> u8 {
        self.op() & 0x0f
    }
}

fn gpr_name(index: u8, size: u8) -> &'static str {
    const Q: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    const D: [&str; 16] = [
        "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d",
        "r12d", "r13d", "r14d", "r15d",
    ];
    const W: [&str; 16] = [
        "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w",
        "r13w", "r14w", "r15w",
    ];
    const B: [&str; 16] = [
        "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
        "r13b", "r14b", "r15b",
    ];
    let i = usize::from(index & 15);
    match size {
        8 => Q[i],
        4 => D[i],
        2 => W[i],
        _ => B[i],
    }
}

fn write_mem(f: &mut fmt::Formatter<'_>, m: &MemoryOperand, address_size: u8) -> fmt::Result {
    write!(f, "{}:[", m.segment.name())?;
    let mut first = true;
    if m.rip_relative {
        f.write_str("rip")?;
        first = false;
    }
    if let Some(base) = m.base {
        f.write_str(gpr_name(base, address_size))?;
        first = false;
    }
    if let Some(index) = m.index {
        if !first {
            f.write_str("+")?;
        }
        write!(f, "{}*{}", gpr_name(index, address_size), m.scale)?;
        first = false;
    }
    if first {
        write!(f, "{:#x}", m.displacement)?;
    } else if m.displacement < 0 {
        write!(f, "-{:#x}", m.displacement.unsigned_abs())?;
    } else if m.displacement > 0 {
        write!(f, "+{:#x}", m.displacement)?;
    }
    f.write_str("]")
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefixes.lock {
            f.write_str("lock ")?;
        }
        match self.prefixes.rep {
            Some(RepPrefix::Rep) => f.write_str("rep ")?,
            Some(RepPrefix::Repne) => f.write_str("repne ")?,
            None => {}
        }
        f.write_str(self.cmd.name())?;
        for (i, op) in self.operands.iter().take_while(|o| !o.is_none()).enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            match op.kind {
                OperandKind::None => {}
                OperandKind::Immediate(v) => write!(f, "{v:#x}")?,
                OperandKind::Register(Register::Gpr(r)) => f.write_str(gpr_name(r, op.size))?,
                OperandKind::Register(Register::HighByte(r)) => {
                    f.write_str(["ah", "ch", "dh", "bh"][usize::from(r & 3)])?
                }
                OperandKind::Register(Register::Segment(s)) => f.write_str(s.name())?,
                OperandKind::Register(Register::Control(n)) => write!(f, "cr{n}")?,
                OperandKind::Register(Register::Debug(n)) => write!(f, "dr{n}")?,
                OperandKind::Memory(m) | OperandKind::FpuMemory(m) => {
                    write_mem(f, &m, self.address_size)?
                }
                OperandKind::Offset(o) => write!(f, "{}:[{:#x}]", o.segment.name(), o.offset)?,
                OperandKind::FpuRegister(i) => write!(f, "st({i})")?,
            }
        }
        Ok(())
    }
}
