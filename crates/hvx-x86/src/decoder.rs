use thiserror::Error;

use crate::inst::{
    CpuMode, DecodedInstruction, FlagsMask, FpuInfo, MemoryOffset, MemoryOperand, ModRm, Operand,
    OperandKind, Prefixes, Register, RepPrefix, RexPrefix, SegReg,
};
use crate::tables::{self, Attr, Form, Group, OpcodeEntry, ONE_BYTE, TWO_BYTE};
use crate::x87::{self, X87Form};
use crate::Command;

/// Maximum x86 instruction length (architectural limit).
pub const MAX_INST_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The byte stream ended before the instruction was complete.
    #[error("instruction bytes ended after {consumed} bytes")]
    UnexpectedEof { consumed: usize },
    /// The encoding runs past the 15-byte limit.
    #[error("instruction exceeds the 15-byte length limit")]
    TooLong,
    /// No table entry for this opcode/ModRM/prefix combination.
    #[error("undefined opcode {:02x?}", shown(.opcode, .len))]
    DecodeFailed { opcode: [u8; 4], len: u8 },
}

fn shown<'a>(opcode: &'a [u8; 4], len: &u8) -> &'a [u8] {
    &opcode[..usize::from(*len).min(4)]
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn next(&mut self) -> Result<u8, DecodeError> {
        if self.pos >= MAX_INST_LEN {
            return Err(DecodeError::TooLong);
        }
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof {
            consumed: self.pos,
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    /// Little-endian read of `n` bytes, sign-extended to 64 bits.
    fn signed(&mut self, n: u8) -> Result<i64, DecodeError> {
        let raw = self.unsigned(n)?;
        let shift = 64 - u32::from(n) * 8;
        Ok(((raw << shift) as i64) >> shift)
    }

    fn unsigned(&mut self, n: u8) -> Result<u64, DecodeError> {
        let mut v = 0u64;
        for i in 0..n {
            v |= u64::from(self.next()?) << (u32::from(i) * 8);
        }
        Ok(v)
    }
}

/// Decode one instruction from the start of `bytes`.
///
/// `bytes` is whatever the caller could fetch at RIP (normally up to
/// [`MAX_INST_LEN`] bytes); running out of bytes before the instruction is
/// complete yields [`DecodeError::UnexpectedEof`].
pub fn decode(bytes: &[u8], mode: CpuMode) -> Result<DecodedInstruction, DecodeError> {
    let mut cur = Cursor { bytes, pos: 0 };
    let mut prefixes = scan_prefixes(&mut cur, mode)?;
    let address_size = effective_address_size(mode, &prefixes);
    let default_operand_size = effective_operand_size(mode, &prefixes);

    let mut opcode = [0u8; 4];
    let mut opcode_len = 1u8;
    opcode[0] = cur.next()?;
    let entry: &OpcodeEntry = if opcode[0] == 0x0f {
        opcode[1] = cur.next()?;
        opcode_len = 2;
        &TWO_BYTE[usize::from(opcode[1])]
    } else {
        &ONE_BYTE[usize::from(opcode[0])]
    };

    if entry.group == Group::X87 {
        return decode_x87(
            &mut cur,
            mode,
            prefixes,
            opcode,
            address_size,
            default_operand_size,
        );
    }

    let failed = DecodeError::DecodeFailed { opcode, len: opcode_len };
    if entry.cmd == Command::Invalid || (mode.is_long() && entry.attrs.contains(Attr::NO_LONG)) {
        return Err(failed);
    }

    let mut cmd = entry.cmd;
    let mut flags = entry.flags;
    let mut forms = entry.forms;
    let mut attrs = entry.attrs;

    let modrm = if entry.modrm {
        Some(ModRm::from_byte(cur.next()?))
    } else {
        None
    };

    if let Some(m) = modrm.filter(|_| entry.group != Group::None) {
        let (group_cmd, group_flags) =
            tables::group_command(entry.group, m.reg, m.is_register(), m.rm).ok_or(failed)?;
        cmd = group_cmd;
        flags = group_flags;
        match (entry.group, cmd) {
            (Group::Unary, Command::Test) => {
                forms[1] = if entry.size == 1 { Form::Imm8 } else { Form::Imm };
            }
            (Group::Ff, Command::CallNearIndirect | Command::JmpNearIndirect | Command::Push) => {
                attrs |= Attr::DEFAULT64;
            }
            (Group::Ff, Command::CallFarIndirect | Command::JmpFarIndirect)
            | (Group::Lidt, Command::Sgdt | Command::Sidt | Command::Lgdt | Command::Lidt)
            | (Group::Lidt, Command::Invlpg)
            | (Group::Ae, Command::Fxsave | Command::Fxrstor | Command::Clflush) => {
                forms[0] = Form::Mem;
            }
            (Group::Lidt, Command::Smsw | Command::Lmsw) => {
                forms[0] = Form::RmWord;
            }
            (Group::Lidt, Command::Rdtscp)
            | (Group::Ae, Command::Lfence | Command::Mfence | Command::Sfence) => {
                // The ModRM byte is part of the opcode.
                opcode[usize::from(opcode_len)] = (m.mode << 6) | (m.reg << 3) | m.rm;
                opcode_len += 1;
                forms = [Form::Empty; 3];
            }
            _ => {}
        }
    }

    match (opcode_len, opcode[0], opcode[1]) {
        // 90 with REX.B is XCHG r8, rAX; F3 90 is PAUSE.
        (1, 0x90, _) if prefixes.rex.is_some_and(|r| r.b) => {
            cmd = Command::Xchg;
            forms = [Form::OpReg, Form::Acc, Form::Empty];
        }
        (2, 0x0f, 0xb8) => {
            if prefixes.rep != Some(RepPrefix::Rep) {
                return Err(failed);
            }
            prefixes.rep = None;
        }
        _ => {}
    }

    let operand_size = if entry.size != 0 {
        entry.size
    } else if attrs.contains(Attr::CONTROL) {
        if mode.is_long() {
            8
        } else {
            4
        }
    } else if mode.is_long() && attrs.contains(Attr::DEFAULT64) {
        if prefixes.operand_size_override && !prefixes.rex_w() {
            2
        } else {
            8
        }
    } else if attrs.contains(Attr::MAX32) {
        default_operand_size.min(4)
    } else {
        default_operand_size
    };

    let mut sib = None;
    let mut displacement = 0i64;
    let mut memory = None;
    if let Some(m) = modrm {
        if !m.is_register() && !attrs.contains(Attr::CONTROL) {
            let mem = decode_memory(&mut cur, m, mode, &prefixes, address_size, &mut sib)?;
            displacement = mem.displacement;
            memory = Some(mem);
        }
    }

    let ctx = OperandContext {
        mode,
        prefixes: &prefixes,
        modrm,
        memory,
        operand_size,
        address_size,
        op: opcode[usize::from(opcode_len) - 1],
        failed,
    };

    let mut operands = [Operand::NONE; 4];
    let mut slot = 0;
    for form in forms {
        if form == Form::Empty {
            break;
        }
        if form == Form::FarPtr {
            let offset_size = operand_size.min(4);
            let offset = cur.unsigned(offset_size)?;
            let selector = cur.unsigned(2)?;
            operands[slot] = imm(offset, offset_size);
            operands[slot + 1] = imm(selector, 2);
            slot += 2;
            continue;
        }
        operands[slot] = ctx.operand(form, &mut cur)?;
        slot += 1;
    }

    if cmd == Command::MovToSeg
        && matches!(
            operands[0].kind,
            OperandKind::Register(Register::Segment(SegReg::Cs))
        )
    {
        return Err(failed);
    }

    Ok(DecodedInstruction {
        opcode,
        opcode_len,
        cmd,
        operands,
        operand_size,
        address_size,
        prefixes,
        modrm,
        sib,
        displacement,
        len: cur.pos as u8,
        flags,
        fpu: FpuInfo::default(),
    })
}

fn scan_prefixes(cur: &mut Cursor<'_>, mode: CpuMode) -> Result<Prefixes, DecodeError> {
    let mut prefixes = Prefixes::default();

    while let Some(b) = cur.peek() {
        if mode.is_long() && (0x40..=0x4f).contains(&b) {
            prefixes.rex = Some(RexPrefix {
                w: b & 0b1000 != 0,
                r: b & 0b0100 != 0,
                x: b & 0b0010 != 0,
                b: b & 0b0001 != 0,
            });
            cur.next()?;
            continue;
        }

        let seg = match b {
            0x26 => Some(SegReg::Es),
            0x2e => Some(SegReg::Cs),
            0x36 => Some(SegReg::Ss),
            0x3e => Some(SegReg::Ds),
            0x64 => Some(SegReg::Fs),
            0x65 => Some(SegReg::Gs),
            _ => None,
        };
        match (b, seg) {
            (_, Some(seg)) => {
                // Only FS/GS overrides mean anything in long mode; the
                // others are accepted and ignored.
                if !mode.is_long() || matches!(seg, SegReg::Fs | SegReg::Gs) {
                    prefixes.segment = Some(seg);
                }
            }
            (0xf0, _) => prefixes.lock = true,
            (0xf2, _) => prefixes.rep = Some(RepPrefix::Repne),
            (0xf3, _) => prefixes.rep = Some(RepPrefix::Rep),
            (0x66, _) => prefixes.operand_size_override = true,
            (0x67, _) => prefixes.address_size_override = true,
            _ => break,
        }
        // A REX prefix only counts when it immediately precedes the opcode.
        prefixes.rex = None;
        cur.next()?;
    }

    Ok(prefixes)
}

fn effective_operand_size(mode: CpuMode, prefixes: &Prefixes) -> u8 {
    match mode {
        CpuMode::Long64 if prefixes.rex_w() => 8,
        _ => toggle(mode.default_size(), prefixes.operand_size_override),
    }
}

fn effective_address_size(mode: CpuMode, prefixes: &Prefixes) -> u8 {
    match mode {
        CpuMode::Long64 => {
            if prefixes.address_size_override {
                4
            } else {
                8
            }
        }
        _ => toggle(mode.default_size(), prefixes.address_size_override),
    }
}

#[inline]
fn toggle(size: u8, flip: bool) -> u8 {
    match (size, flip) {
        (2, true) => 4,
        (4, true) => 2,
        (s, _) => s,
    }
}

fn default_segment(prefixes: &Prefixes, stack_based: bool) -> SegReg {
    prefixes.segment.unwrap_or(if stack_based {
        SegReg::Ss
    } else {
        SegReg::Ds
    })
}

fn decode_memory(
    cur: &mut Cursor<'_>,
    m: ModRm,
    mode: CpuMode,
    prefixes: &Prefixes,
    address_size: u8,
    sib_out: &mut Option<u8>,
) -> Result<MemoryOperand, DecodeError> {
    if address_size == 2 {
        return decode_memory16(cur, m, prefixes);
    }

    let rex = prefixes.rex.unwrap_or_default();
    let mut base = Some(m.rm | (u8::from(rex.b) << 3));
    let mut index = None;
    let mut scale = 1;
    let mut rip_relative = false;
    let mut disp_size = match m.mode {
        1 => 1,
        2 => 4,
        _ => 0,
    };

    if m.rm == 4 {
        let sib = cur.next()?;
        *sib_out = Some(sib);
        scale = 1 << (sib >> 6);
        let idx = ((sib >> 3) & 7) | (u8::from(rex.x) << 3);
        if idx != 4 {
            index = Some(idx);
        }
        if sib & 7 == 5 && m.mode == 0 {
            base = None;
            disp_size = 4;
        } else {
            base = Some((sib & 7) | (u8::from(rex.b) << 3));
        }
    } else if m.rm == 5 && m.mode == 0 {
        base = None;
        disp_size = 4;
        rip_relative = mode.is_long();
    }

    let displacement = if disp_size == 0 {
        0
    } else {
        cur.signed(disp_size)?
    };

    Ok(MemoryOperand {
        segment: default_segment(prefixes, matches!(base, Some(4) | Some(5))),
        base,
        index,
        scale,
        displacement,
        rip_relative,
    })
}

fn decode_memory16(
    cur: &mut Cursor<'_>,
    m: ModRm,
    prefixes: &Prefixes,
) -> Result<MemoryOperand, DecodeError> {
    const BX: u8 = 3;
    const BP: u8 = 5;
    const SI: u8 = 6;
    const DI: u8 = 7;

    if m.mode == 0 && m.rm == 6 {
        return Ok(MemoryOperand {
            segment: default_segment(prefixes, false),
            base: None,
            index: None,
            scale: 1,
            displacement: cur.signed(2)?,
            rip_relative: false,
        });
    }

    let (base, index) = match m.rm {
        0 => (BX, Some(SI)),
        1 => (BX, Some(DI)),
        2 => (BP, Some(SI)),
        3 => (BP, Some(DI)),
        4 => (SI, None),
        5 => (DI, None),
        6 => (BP, None),
        _ => (BX, None),
    };
    let displacement = match m.mode {
        1 => cur.signed(1)?,
        2 => cur.signed(2)?,
        _ => 0,
    };

    Ok(MemoryOperand {
        segment: default_segment(prefixes, base == BP),
        base: Some(base),
        index,
        scale: 1,
        displacement,
        rip_relative: false,
    })
}

#[inline]
fn imm(value: u64, size: u8) -> Operand {
    Operand {
        kind: OperandKind::Immediate(value),
        size,
    }
}

#[inline]
fn reg(register: Register, size: u8) -> Operand {
    Operand {
        kind: OperandKind::Register(register),
        size,
    }
}

struct OperandContext<'p> {
    mode: CpuMode,
    prefixes: &'p Prefixes,
    modrm: Option<ModRm>,
    memory: Option<MemoryOperand>,
    operand_size: u8,
    address_size: u8,
    op: u8,
    failed: DecodeError,
}

impl OperandContext<'_> {
    fn gpr(&self, index: u8, size: u8) -> Register {
        // Without REX, byte registers 4..=7 are AH CH DH BH.
        if size == 1 && self.prefixes.rex.is_none() && (4..8).contains(&index) {
            Register::HighByte(index - 4)
        } else {
            Register::Gpr(index)
        }
    }

    fn modrm(&self) -> Result<ModRm, DecodeError> {
        self.modrm.ok_or(self.failed)
    }

    fn rm(&self, size: u8) -> Result<Operand, DecodeError> {
        let m = self.modrm()?;
        match self.memory {
            Some(mem) => Ok(Operand {
                kind: OperandKind::Memory(mem),
                size,
            }),
            None => {
                let index = m.rm | (u8::from(self.prefixes.rex.is_some_and(|r| r.b)) << 3);
                Ok(reg(self.gpr(index, size), size))
            }
        }
    }

    fn operand(&self, form: Form, cur: &mut Cursor<'_>) -> Result<Operand, DecodeError> {
        let size = self.operand_size;
        let rex = self.prefixes.rex.unwrap_or_default();
        let op = match form {
            Form::Empty | Form::FarPtr => Operand::NONE,
            Form::Reg => {
                let index = self.modrm()?.reg | (u8::from(rex.r) << 3);
                reg(self.gpr(index, size), size)
            }
            Form::Rm => self.rm(size)?,
            Form::RmByte => self.rm(1)?,
            Form::RmWord => self.rm(2)?,
            Form::Mem => match self.memory {
                Some(mem) => Operand {
                    kind: OperandKind::Memory(mem),
                    size,
                },
                None => return Err(self.failed),
            },
            Form::Acc => reg(Register::Gpr(0), size),
            Form::Cl => reg(Register::Gpr(1), 1),
            Form::Dx => reg(Register::Gpr(2), 2),
            Form::Sreg => {
                let seg = SegReg::from_index(self.modrm()?.reg).ok_or(self.failed)?;
                reg(Register::Segment(seg), 2)
            }
            Form::Seg(seg) => reg(Register::Segment(seg), 2),
            Form::Cr => {
                let n = self.modrm()?.reg | (u8::from(rex.r) << 3);
                if !matches!(n, 0 | 2 | 3 | 4 | 8) {
                    return Err(self.failed);
                }
                reg(Register::Control(n), size)
            }
            Form::Dr => reg(Register::Debug(self.modrm()?.reg), size),
            Form::Imm8 => imm(cur.unsigned(1)?, 1),
            Form::Imm8s => imm(cur.signed(1)? as u64, size),
            Form::Imm16 => imm(cur.unsigned(2)?, 2),
            Form::Imm => imm(cur.signed(size.min(4))? as u64, size),
            Form::ImmFull => imm(cur.unsigned(size)?, size),
            Form::Const(v) => imm(u64::from(v), 1),
            Form::Moffs => Operand {
                kind: OperandKind::Offset(MemoryOffset {
                    segment: default_segment(self.prefixes, false),
                    offset: cur.unsigned(self.address_size)?,
                }),
                size,
            },
            Form::OpReg => {
                let index = (self.op & 7) | (u8::from(rex.b) << 3);
                reg(self.gpr(index, size), size)
            }
            Form::Rel8 => imm(cur.signed(1)? as u64, size),
            Form::Rel => {
                let width = if size == 2 && !self.mode.is_long() { 2 } else { 4 };
                imm(cur.signed(width)? as u64, size)
            }
        };
        Ok(op)
    }
}

fn decode_x87(
    cur: &mut Cursor<'_>,
    mode: CpuMode,
    prefixes: Prefixes,
    opcode: [u8; 4],
    address_size: u8,
    operand_size: u8,
) -> Result<DecodedInstruction, DecodeError> {
    let byte = cur.next()?;
    let m = ModRm::from_byte(byte);
    let failed = DecodeError::DecodeFailed {
        opcode: [opcode[0], byte, 0, 0],
        len: 2,
    };

    let found = x87::lookup(opcode[0], m.is_register(), m.reg, m.rm).ok_or(failed)?;

    let mut sib = None;
    let mut displacement = 0;
    let mut operands = [Operand::NONE; 4];
    match found.form {
        X87Form::Implied => {}
        X87Form::Mem => {
            if m.is_register() {
                return Err(failed);
            }
            let mem = decode_memory(cur, m, mode, &prefixes, address_size, &mut sib)?;
            displacement = mem.displacement;
            operands[0] = Operand {
                kind: OperandKind::FpuMemory(mem),
                size: found.size,
            };
        }
        X87Form::St0Sti | X87Form::StiSt0 | X87Form::Sti => {
            let st = |i: u8| Operand {
                kind: OperandKind::FpuRegister(i),
                size: found.size,
            };
            match found.form {
                X87Form::St0Sti => {
                    operands[0] = st(0);
                    operands[1] = st(m.rm);
                }
                X87Form::StiSt0 => {
                    operands[0] = st(m.rm);
                    operands[1] = st(0);
                }
                _ => operands[0] = st(m.rm),
            }
        }
        X87Form::Ax => operands[0] = reg(Register::Gpr(0), 2),
    }

    Ok(DecodedInstruction {
        opcode,
        opcode_len: 1,
        cmd: found.cmd,
        operands,
        operand_size,
        address_size,
        prefixes,
        modrm: Some(m),
        sib,
        displacement,
        len: cur.pos as u8,
        flags: FlagsMask::empty(),
        fpu: found.fpu,
    })
}
