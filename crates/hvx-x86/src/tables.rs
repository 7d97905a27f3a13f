//! One-byte and `0F`-escape opcode maps.
//!
//! Both maps are const-evaluated; an entry describes the command, the operand
//! encodings that follow the opcode, and (for group opcodes) which ModRM.reg
//! sub-table selects the final command.

use crate::inst::{FlagsMask, SegReg};
use crate::Command;

/// How one operand is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Form {
    Empty,
    /// ModRM.reg as a general register.
    Reg,
    /// ModRM.rm: register or memory.
    Rm,
    /// ModRM.rm read as a byte regardless of operand size (MOVZX/MOVSX source).
    RmByte,
    /// ModRM.rm read as a word regardless of operand size.
    RmWord,
    /// ModRM.rm, memory only.
    Mem,
    /// AL/AX/EAX/RAX.
    Acc,
    Cl,
    Dx,
    /// ModRM.reg as a segment register.
    Sreg,
    /// Implied segment register.
    Seg(SegReg),
    /// ModRM.reg as CRn / DRn.
    Cr,
    Dr,
    /// Byte immediate, zero-extended, byte-sized operand.
    Imm8,
    /// Byte immediate sign-extended to the operand size.
    Imm8s,
    Imm16,
    /// Operand-size immediate, at most 4 bytes, sign-extended to 64 bits.
    Imm,
    /// Operand-size immediate including a full imm64 under REX.W (B8-BF).
    ImmFull,
    Const(u8),
    /// Address-size `moffs`.
    Moffs,
    /// Register in the opcode's low three bits, extended by REX.B.
    OpReg,
    Rel8,
    /// rel16/rel32.
    Rel,
    /// ptr16:16 / ptr16:32; expands to offset and selector operands.
    FarPtr,
}

impl Form {
    const fn needs_modrm(self) -> bool {
        matches!(
            self,
            Form::Reg
                | Form::Rm
                | Form::RmByte
                | Form::RmWord
                | Form::Mem
                | Form::Sreg
                | Form::Cr
                | Form::Dr
        )
    }
}

/// ModRM.reg sub-tables for group opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Group {
    None,
    /// 80-83.
    Arith,
    /// C0/C1/D0-D3.
    Rotate,
    /// F6/F7.
    Unary,
    /// FE.
    IncDec,
    /// FF.
    Ff,
    /// 8F /0.
    Pop,
    /// C6/C7 /0.
    MovImm,
    /// 0F 00.
    Sldt,
    /// 0F 01.
    Lidt,
    /// 0F BA.
    Bt,
    /// 0F AE.
    Ae,
    /// 0F C7.
    Cmpxchg8b,
    /// D8-DF.
    X87,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Attr: u8 {
        /// Defaults to 64-bit operand size in long mode.
        const DEFAULT64 = 1 << 0;
        /// Undefined in 64-bit mode.
        const NO_LONG = 1 << 1;
        /// MOV CR/DR: ModRM.rm is always a register; 32 or 64 bits by mode.
        const CONTROL = 1 << 2;
        /// Port I/O caps the operand at 32 bits.
        const MAX32 = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OpcodeEntry {
    pub cmd: Command,
    /// Fixed operand size in bytes; 0 means the effective operand size.
    pub size: u8,
    pub modrm: bool,
    pub forms: [Form; 3],
    pub group: Group,
    pub flags: FlagsMask,
    pub attrs: Attr,
}

impl OpcodeEntry {
    pub const INVALID: OpcodeEntry = OpcodeEntry {
        cmd: Command::Invalid,
        size: 0,
        modrm: false,
        forms: [Form::Empty; 3],
        group: Group::None,
        flags: FlagsMask::empty(),
        attrs: Attr::empty(),
    };

    const fn grp(self, group: Group) -> Self {
        Self {
            group,
            modrm: true,
            ..self
        }
    }

    const fn attr(self, attrs: Attr) -> Self {
        Self {
            attrs: self.attrs.union(attrs),
            ..self
        }
    }
}

const fn e(cmd: Command, size: u8, forms: [Form; 3], flags: FlagsMask) -> OpcodeEntry {
    let modrm = forms[0].needs_modrm() || forms[1].needs_modrm() || forms[2].needs_modrm();
    OpcodeEntry {
        cmd,
        size,
        modrm,
        forms,
        group: Group::None,
        flags,
        attrs: Attr::empty(),
    }
}

const fn bare(cmd: Command) -> OpcodeEntry {
    e(cmd, 0, [Form::Empty; 3], FlagsMask::empty())
}

const NONE: FlagsMask = FlagsMask::empty();
const ALL: FlagsMask = FlagsMask::OSZAPC;
const D64: Attr = Attr::DEFAULT64;
const NL: Attr = Attr::NO_LONG;

pub(crate) static ONE_BYTE: [OpcodeEntry; 256] = build_one_byte();
pub(crate) static TWO_BYTE: [OpcodeEntry; 256] = build_two_byte();

const fn build_one_byte() -> [OpcodeEntry; 256] {
    use Command as C;
    use Form::*;

    let mut t = [OpcodeEntry::INVALID; 256];

    let alu = [C::Add, C::Or, C::Adc, C::Sbb, C::And, C::Sub, C::Xor, C::Cmp];
    let mut i = 0;
    while i < 8 {
        let base = i * 8;
        let cmd = alu[i];
        t[base] = e(cmd, 1, [Rm, Reg, Empty], ALL);
        t[base + 1] = e(cmd, 0, [Rm, Reg, Empty], ALL);
        t[base + 2] = e(cmd, 1, [Reg, Rm, Empty], ALL);
        t[base + 3] = e(cmd, 0, [Reg, Rm, Empty], ALL);
        t[base + 4] = e(cmd, 1, [Acc, Imm8, Empty], ALL);
        t[base + 5] = e(cmd, 0, [Acc, Imm, Empty], ALL);
        i += 1;
    }

    t[0x06] = e(C::PushSeg, 0, [Seg(SegReg::Es), Empty, Empty], NONE).attr(NL);
    t[0x07] = e(C::PopSeg, 0, [Seg(SegReg::Es), Empty, Empty], NONE).attr(NL);
    t[0x0e] = e(C::PushSeg, 0, [Seg(SegReg::Cs), Empty, Empty], NONE).attr(NL);
    t[0x16] = e(C::PushSeg, 0, [Seg(SegReg::Ss), Empty, Empty], NONE).attr(NL);
    t[0x17] = e(C::PopSeg, 0, [Seg(SegReg::Ss), Empty, Empty], NONE).attr(NL);
    t[0x1e] = e(C::PushSeg, 0, [Seg(SegReg::Ds), Empty, Empty], NONE).attr(NL);
    t[0x1f] = e(C::PopSeg, 0, [Seg(SegReg::Ds), Empty, Empty], NONE).attr(NL);
    t[0x2f] = e(C::Das, 1, [Empty; 3], ALL).attr(NL);
    t[0x3f] = e(C::Aas, 1, [Empty; 3], ALL).attr(NL);

    let mut r = 0;
    while r < 8 {
        t[0x40 + r] = e(C::Inc, 0, [OpReg, Empty, Empty], FlagsMask::OSZAP).attr(NL);
        t[0x48 + r] = e(C::Dec, 0, [OpReg, Empty, Empty], FlagsMask::OSZAP).attr(NL);
        t[0x50 + r] = e(C::Push, 0, [OpReg, Empty, Empty], NONE).attr(D64);
        t[0x58 + r] = e(C::Pop, 0, [OpReg, Empty, Empty], NONE).attr(D64);
        t[0x90 + r] = e(C::Xchg, 0, [OpReg, Acc, Empty], NONE);
        t[0xb0 + r] = e(C::Mov, 1, [OpReg, Imm8, Empty], NONE);
        t[0xb8 + r] = e(C::Mov, 0, [OpReg, ImmFull, Empty], NONE);
        r += 1;
    }
    // 90 without REX.B; the decoder upgrades it to XCHG r8, rAX.
    t[0x90] = bare(C::Nop);

    t[0x60] = bare(C::Pusha).attr(NL);
    t[0x61] = bare(C::Popa).attr(NL);
    t[0x68] = e(C::Push, 0, [Imm, Empty, Empty], NONE).attr(D64);
    t[0x69] = e(C::Imul3, 0, [Reg, Rm, Imm], ALL);
    t[0x6a] = e(C::Push, 0, [Imm8s, Empty, Empty], NONE).attr(D64);
    t[0x6b] = e(C::Imul3, 0, [Reg, Rm, Imm8s], ALL);
    t[0x6c] = e(C::Ins, 1, [Empty; 3], NONE);
    t[0x6d] = e(C::Ins, 0, [Empty; 3], NONE).attr(Attr::MAX32);
    t[0x6e] = e(C::Outs, 1, [Empty; 3], NONE);
    t[0x6f] = e(C::Outs, 0, [Empty; 3], NONE).attr(Attr::MAX32);

    let mut cc = 0;
    while cc < 16 {
        t[0x70 + cc] = e(C::Jcc, 0, [Rel8, Empty, Empty], NONE).attr(D64);
        cc += 1;
    }

    t[0x80] = e(C::Add, 1, [Rm, Imm8, Empty], ALL).grp(Group::Arith);
    t[0x81] = e(C::Add, 0, [Rm, Imm, Empty], ALL).grp(Group::Arith);
    t[0x82] = e(C::Add, 1, [Rm, Imm8, Empty], ALL).grp(Group::Arith).attr(NL);
    t[0x83] = e(C::Add, 0, [Rm, Imm8s, Empty], ALL).grp(Group::Arith);
    t[0x84] = e(C::Test, 1, [Rm, Reg, Empty], ALL);
    t[0x85] = e(C::Test, 0, [Rm, Reg, Empty], ALL);
    t[0x86] = e(C::Xchg, 1, [Rm, Reg, Empty], NONE);
    t[0x87] = e(C::Xchg, 0, [Rm, Reg, Empty], NONE);
    t[0x88] = e(C::Mov, 1, [Rm, Reg, Empty], NONE);
    t[0x89] = e(C::Mov, 0, [Rm, Reg, Empty], NONE);
    t[0x8a] = e(C::Mov, 1, [Reg, Rm, Empty], NONE);
    t[0x8b] = e(C::Mov, 0, [Reg, Rm, Empty], NONE);
    t[0x8c] = e(C::MovFromSeg, 0, [Rm, Sreg, Empty], NONE);
    t[0x8d] = e(C::Lea, 0, [Reg, Mem, Empty], NONE);
    t[0x8e] = e(C::MovToSeg, 2, [Sreg, Rm, Empty], NONE);
    t[0x8f] = e(C::Pop, 0, [Rm, Empty, Empty], NONE).grp(Group::Pop).attr(D64);

    t[0x98] = bare(C::Cbw);
    t[0x99] = bare(C::Cwd);
    t[0x9a] = e(C::CallFar, 0, [FarPtr, Empty, Empty], NONE).attr(NL);
    // FWAIT with no unmasked x87 exception pending.
    t[0x9b] = bare(C::Nop);
    t[0x9c] = bare(C::Pushf).attr(D64);
    t[0x9d] = e(C::Popf, 0, [Empty; 3], FlagsMask::all()).attr(D64);
    t[0x9e] = e(C::Sahf, 0, [Empty; 3], FlagsMask::LAHF);
    t[0x9f] = bare(C::Lahf);

    t[0xa0] = e(C::Mov, 1, [Acc, Moffs, Empty], NONE);
    t[0xa1] = e(C::Mov, 0, [Acc, Moffs, Empty], NONE);
    t[0xa2] = e(C::Mov, 1, [Moffs, Acc, Empty], NONE);
    t[0xa3] = e(C::Mov, 0, [Moffs, Acc, Empty], NONE);
    t[0xa4] = e(C::Movs, 1, [Empty; 3], NONE);
    t[0xa5] = e(C::Movs, 0, [Empty; 3], NONE);
    t[0xa6] = e(C::Cmps, 1, [Empty; 3], ALL);
    t[0xa7] = e(C::Cmps, 0, [Empty; 3], ALL);
    t[0xa8] = e(C::Test, 1, [Acc, Imm8, Empty], ALL);
    t[0xa9] = e(C::Test, 0, [Acc, Imm, Empty], ALL);
    t[0xaa] = e(C::Stos, 1, [Empty; 3], NONE);
    t[0xab] = e(C::Stos, 0, [Empty; 3], NONE);
    t[0xac] = e(C::Lods, 1, [Empty; 3], NONE);
    t[0xad] = e(C::Lods, 0, [Empty; 3], NONE);
    t[0xae] = e(C::Scas, 1, [Empty; 3], ALL);
    t[0xaf] = e(C::Scas, 0, [Empty; 3], ALL);

    t[0xc0] = e(C::Rol, 1, [Rm, Imm8, Empty], ALL).grp(Group::Rotate);
    t[0xc1] = e(C::Rol, 0, [Rm, Imm8, Empty], ALL).grp(Group::Rotate);
    t[0xc2] = e(C::RetNear, 0, [Imm16, Empty, Empty], NONE).attr(D64);
    t[0xc3] = bare(C::RetNear).attr(D64);
    t[0xc4] = e(C::Les, 0, [Reg, Mem, Empty], NONE).attr(NL);
    t[0xc5] = e(C::Lds, 0, [Reg, Mem, Empty], NONE).attr(NL);
    t[0xc6] = e(C::Mov, 1, [Rm, Imm8, Empty], NONE).grp(Group::MovImm);
    t[0xc7] = e(C::Mov, 0, [Rm, Imm, Empty], NONE).grp(Group::MovImm);
    t[0xc8] = e(C::Enter, 0, [Imm16, Imm8, Empty], NONE).attr(D64);
    t[0xc9] = bare(C::Leave).attr(D64);
    t[0xca] = e(C::RetFar, 0, [Imm16, Empty, Empty], NONE);
    t[0xcb] = bare(C::RetFar);
    t[0xcc] = e(C::Int, 0, [Const(3), Empty, Empty], NONE);
    t[0xcd] = e(C::Int, 0, [Imm8, Empty, Empty], NONE);
    t[0xcf] = e(C::Iret, 0, [Empty; 3], FlagsMask::all());

    t[0xd0] = e(C::Rol, 1, [Rm, Const(1), Empty], ALL).grp(Group::Rotate);
    t[0xd1] = e(C::Rol, 0, [Rm, Const(1), Empty], ALL).grp(Group::Rotate);
    t[0xd2] = e(C::Rol, 1, [Rm, Cl, Empty], ALL).grp(Group::Rotate);
    t[0xd3] = e(C::Rol, 0, [Rm, Cl, Empty], ALL).grp(Group::Rotate);
    t[0xd4] = e(C::Aam, 1, [Imm8, Empty, Empty], ALL).attr(NL);
    t[0xd5] = e(C::Aad, 1, [Imm8, Empty, Empty], ALL).attr(NL);
    t[0xd7] = e(C::Xlat, 1, [Empty; 3], NONE);

    let mut x = 0xd8;
    while x <= 0xdf {
        t[x] = bare(C::Invalid).grp(Group::X87);
        x += 1;
    }

    t[0xe0] = e(C::Loop, 0, [Rel8, Empty, Empty], NONE).attr(D64);
    t[0xe1] = e(C::Loop, 0, [Rel8, Empty, Empty], NONE).attr(D64);
    t[0xe2] = e(C::Loop, 0, [Rel8, Empty, Empty], NONE).attr(D64);
    t[0xe3] = e(C::Jcxz, 0, [Rel8, Empty, Empty], NONE).attr(D64);
    t[0xe4] = e(C::In, 1, [Acc, Imm8, Empty], NONE);
    t[0xe5] = e(C::In, 0, [Acc, Imm8, Empty], NONE).attr(Attr::MAX32);
    t[0xe6] = e(C::Out, 1, [Imm8, Acc, Empty], NONE);
    t[0xe7] = e(C::Out, 0, [Imm8, Acc, Empty], NONE).attr(Attr::MAX32);
    t[0xe8] = e(C::CallNear, 0, [Rel, Empty, Empty], NONE).attr(D64);
    t[0xe9] = e(C::JmpNear, 0, [Rel, Empty, Empty], NONE).attr(D64);
    t[0xea] = e(C::JmpFar, 0, [FarPtr, Empty, Empty], NONE).attr(NL);
    t[0xeb] = e(C::JmpNear, 0, [Rel8, Empty, Empty], NONE).attr(D64);
    t[0xec] = e(C::In, 1, [Acc, Dx, Empty], NONE);
    t[0xed] = e(C::In, 0, [Acc, Dx, Empty], NONE).attr(Attr::MAX32);
    t[0xee] = e(C::Out, 1, [Dx, Acc, Empty], NONE);
    t[0xef] = e(C::Out, 0, [Dx, Acc, Empty], NONE).attr(Attr::MAX32);

    t[0xf4] = bare(C::Hlt);
    t[0xf5] = e(C::Cmc, 0, [Empty; 3], FlagsMask::CF);
    t[0xf6] = e(C::Test, 1, [Rm, Empty, Empty], ALL).grp(Group::Unary);
    t[0xf7] = e(C::Test, 0, [Rm, Empty, Empty], ALL).grp(Group::Unary);
    t[0xf8] = e(C::Clc, 0, [Empty; 3], FlagsMask::CF);
    t[0xf9] = e(C::Stc, 0, [Empty; 3], FlagsMask::CF);
    t[0xfa] = e(C::Cli, 0, [Empty; 3], FlagsMask::IF);
    t[0xfb] = e(C::Sti, 0, [Empty; 3], FlagsMask::IF);
    t[0xfc] = e(C::Cld, 0, [Empty; 3], FlagsMask::DF);
    t[0xfd] = e(C::Std, 0, [Empty; 3], FlagsMask::DF);
    t[0xfe] = e(C::Inc, 1, [Rm, Empty, Empty], FlagsMask::OSZAP).grp(Group::IncDec);
    t[0xff] = e(C::Inc, 0, [Rm, Empty, Empty], FlagsMask::OSZAP).grp(Group::Ff);

    t
}

const fn build_two_byte() -> [OpcodeEntry; 256] {
    use Command as C;
    use Form::*;

    let mut t = [OpcodeEntry::INVALID; 256];

    t[0x00] = e(C::Sldt, 2, [Rm, Empty, Empty], NONE).grp(Group::Sldt);
    t[0x01] = e(C::Sgdt, 0, [Rm, Empty, Empty], NONE).grp(Group::Lidt);
    t[0x06] = bare(C::Clts);
    t[0x09] = bare(C::Wbinvd);
    t[0x0d] = e(C::Prefetch, 1, [Mem, Empty, Empty], NONE);
    t[0x18] = e(C::Prefetch, 1, [Mem, Empty, Empty], NONE);
    let mut n = 0x19;
    while n <= 0x1f {
        t[n] = e(C::Nop, 0, [Rm, Empty, Empty], NONE);
        n += 1;
    }

    let ctl = Attr::CONTROL;
    t[0x20] = e(C::MovFromCr, 0, [Rm, Cr, Empty], NONE).attr(ctl);
    t[0x21] = e(C::MovFromDr, 0, [Rm, Dr, Empty], NONE).attr(ctl);
    t[0x22] = e(C::MovToCr, 0, [Cr, Rm, Empty], NONE).attr(ctl);
    t[0x23] = e(C::MovToDr, 0, [Dr, Rm, Empty], NONE).attr(ctl);

    t[0x30] = bare(C::Wrmsr);
    t[0x31] = bare(C::Rdtsc);
    t[0x32] = bare(C::Rdmsr);

    let mut cc = 0;
    while cc < 16 {
        t[0x40 + cc] = e(C::Cmov, 0, [Reg, Rm, Empty], NONE);
        t[0x80 + cc] = e(C::Jcc, 0, [Rel, Empty, Empty], NONE).attr(D64);
        t[0x90 + cc] = e(C::Setcc, 1, [Rm, Empty, Empty], NONE);
        cc += 1;
    }

    t[0x77] = bare(C::Emms);

    t[0xa0] = e(C::PushSeg, 0, [Seg(SegReg::Fs), Empty, Empty], NONE).attr(D64);
    t[0xa1] = e(C::PopSeg, 0, [Seg(SegReg::Fs), Empty, Empty], NONE).attr(D64);
    t[0xa2] = bare(C::Cpuid);
    t[0xa3] = e(C::Bt, 0, [Rm, Reg, Empty], FlagsMask::CF);
    t[0xa4] = e(C::Shld, 0, [Rm, Reg, Imm8], ALL);
    t[0xa5] = e(C::Shld, 0, [Rm, Reg, Cl], ALL);
    t[0xa8] = e(C::PushSeg, 0, [Seg(SegReg::Gs), Empty, Empty], NONE).attr(D64);
    t[0xa9] = e(C::PopSeg, 0, [Seg(SegReg::Gs), Empty, Empty], NONE).attr(D64);
    t[0xab] = e(C::Bts, 0, [Rm, Reg, Empty], FlagsMask::CF);
    t[0xac] = e(C::Shrd, 0, [Rm, Reg, Imm8], ALL);
    t[0xad] = e(C::Shrd, 0, [Rm, Reg, Cl], ALL);
    t[0xae] = e(C::Fxsave, 0, [Rm, Empty, Empty], NONE).grp(Group::Ae);
    t[0xaf] = e(C::Imul2, 0, [Reg, Rm, Empty], ALL);

    t[0xb0] = e(C::Cmpxchg, 1, [Rm, Reg, Empty], ALL);
    t[0xb1] = e(C::Cmpxchg, 0, [Rm, Reg, Empty], ALL);
    t[0xb2] = e(C::Lss, 0, [Reg, Mem, Empty], NONE);
    t[0xb3] = e(C::Btr, 0, [Rm, Reg, Empty], FlagsMask::CF);
    t[0xb4] = e(C::Lfs, 0, [Reg, Mem, Empty], NONE);
    t[0xb5] = e(C::Lgs, 0, [Reg, Mem, Empty], NONE);
    t[0xb6] = e(C::Movzx, 0, [Reg, RmByte, Empty], NONE);
    t[0xb7] = e(C::Movzx, 0, [Reg, RmWord, Empty], NONE);
    t[0xb8] = e(C::Popcnt, 0, [Reg, Rm, Empty], ALL);
    t[0xba] = e(C::Bt, 0, [Rm, Imm8, Empty], FlagsMask::CF).grp(Group::Bt);
    t[0xbb] = e(C::Btc, 0, [Rm, Reg, Empty], FlagsMask::CF);
    t[0xbc] = e(C::Bsf, 0, [Reg, Rm, Empty], ALL);
    t[0xbd] = e(C::Bsr, 0, [Reg, Rm, Empty], ALL);
    t[0xbe] = e(C::Movsx, 0, [Reg, RmByte, Empty], NONE);
    t[0xbf] = e(C::Movsx, 0, [Reg, RmWord, Empty], NONE);

    t[0xc0] = e(C::Xadd, 1, [Rm, Reg, Empty], ALL);
    t[0xc1] = e(C::Xadd, 0, [Rm, Reg, Empty], ALL);
    t[0xc7] = e(C::Cmpxchg8b, 0, [Mem, Empty, Empty], FlagsMask::ZF).grp(Group::Cmpxchg8b);

    let mut r = 0;
    while r < 8 {
        t[0xc8 + r] = e(C::Bswap, 0, [OpReg, Empty, Empty], NONE);
        r += 1;
    }

    t
}

/// Final command and flags for a group opcode, or `None` if the ModRM.reg
/// (and for some groups mod/rm) combination is undefined.
pub(crate) fn group_command(
    group: Group,
    reg: u8,
    mod3: bool,
    rm: u8,
) -> Option<(Command, FlagsMask)> {
    use Command as C;

    let oc = FlagsMask::OC;
    let entry = match group {
        Group::None | Group::X87 => return None,
        Group::Arith => {
            let cmds = [C::Add, C::Or, C::Adc, C::Sbb, C::And, C::Sub, C::Xor, C::Cmp];
            (cmds[usize::from(reg)], ALL)
        }
        Group::Rotate => match reg {
            0 => (C::Rol, oc),
            1 => (C::Ror, oc),
            2 => (C::Rcl, oc),
            3 => (C::Rcr, oc),
            4 => (C::Shl, ALL),
            5 => (C::Shr, ALL),
            6 => (C::Sal, ALL),
            _ => (C::Sar, ALL),
        },
        Group::Unary => match reg {
            0 | 1 => (C::Test, ALL),
            2 => (C::Not, NONE),
            3 => (C::Neg, ALL),
            4 => (C::Mul, ALL),
            5 => (C::Imul1, ALL),
            6 => (C::Div, ALL),
            _ => (C::Idiv, ALL),
        },
        Group::IncDec => match reg {
            0 => (C::Inc, FlagsMask::OSZAP),
            1 => (C::Dec, FlagsMask::OSZAP),
            _ => return None,
        },
        Group::Ff => match reg {
            0 => (C::Inc, FlagsMask::OSZAP),
            1 => (C::Dec, FlagsMask::OSZAP),
            2 => (C::CallNearIndirect, NONE),
            3 if !mod3 => (C::CallFarIndirect, NONE),
            4 => (C::JmpNearIndirect, NONE),
            5 if !mod3 => (C::JmpFarIndirect, NONE),
            6 => (C::Push, NONE),
            _ => return None,
        },
        Group::Pop => match reg {
            0 => (C::Pop, NONE),
            _ => return None,
        },
        Group::MovImm => match reg {
            0 => (C::Mov, NONE),
            _ => return None,
        },
        Group::Sldt => match reg {
            0 => (C::Sldt, NONE),
            1 => (C::Str, NONE),
            2 => (C::Lldt, NONE),
            3 => (C::Ltr, NONE),
            4 => (C::Verr, FlagsMask::ZF),
            5 => (C::Verw, FlagsMask::ZF),
            _ => return None,
        },
        Group::Lidt => match (reg, mod3, rm) {
            (0, false, _) => (C::Sgdt, NONE),
            (1, false, _) => (C::Sidt, NONE),
            (2, false, _) => (C::Lgdt, NONE),
            (3, false, _) => (C::Lidt, NONE),
            (4, _, _) => (C::Smsw, NONE),
            (6, _, _) => (C::Lmsw, NONE),
            (7, false, _) => (C::Invlpg, NONE),
            (7, true, 1) => (C::Rdtscp, NONE),
            _ => return None,
        },
        Group::Bt => match reg {
            4 => (C::Bt, FlagsMask::CF),
            5 => (C::Bts, FlagsMask::CF),
            6 => (C::Btr, FlagsMask::CF),
            7 => (C::Btc, FlagsMask::CF),
            _ => return None,
        },
        Group::Ae => match (reg, mod3) {
            (0, false) => (C::Fxsave, NONE),
            (1, false) => (C::Fxrstor, NONE),
            (7, false) => (C::Clflush, NONE),
            (5, true) => (C::Lfence, NONE),
            (6, true) => (C::Mfence, NONE),
            (7, true) => (C::Sfence, NONE),
            _ => return None,
        },
        Group::Cmpxchg8b => match (reg, mod3) {
            (1, false) => (C::Cmpxchg8b, FlagsMask::ZF),
            _ => return None,
        },
    };
    Some(entry)
}
