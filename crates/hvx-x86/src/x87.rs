//! D8-DF escape: indexed by `(opcode - 0xd8) << 4 | (mod == 3) << 3 | reg`.

use crate::inst::FpuInfo;
use crate::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum X87Form {
    Implied,
    /// Memory operand of `size` bytes.
    Mem,
    /// ST(0), ST(i).
    St0Sti,
    /// ST(i), ST(0).
    StiSt0,
    /// ST(i) alone.
    Sti,
    /// AX (FNSTSW AX).
    Ax,
}

/// Register forms that select on ModRM.rm as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RmSelect {
    None,
    /// D9 /4: FCHS FABS - - FTST FXAM.
    D9Sign,
    /// D9 /5: FLD1 .. FLDZ.
    D9Const,
    /// D9 /7: FRNDINT at rm 4.
    D9Round,
    /// D9 /2: FNOP at rm 0.
    D9Nop,
    /// DA /5 and DE /3: the double-pop compares at rm 1.
    DoublePop,
    /// DB /4: FNINIT, FNSETPM.
    DbControl,
    /// DF /4: FNSTSW AX at rm 0.
    DfStatus,
}

#[derive(Debug, Clone, Copy)]
struct X87Entry {
    cmd: Command,
    size: u8,
    form: X87Form,
    pop: bool,
    reverse: bool,
    sub: u8,
    select: RmSelect,
}

impl X87Entry {
    const INVALID: X87Entry = x(Command::Invalid, 0, X87Form::Implied);

    const fn pop(self) -> Self {
        Self { pop: true, ..self }
    }

    const fn rev(self) -> Self {
        Self {
            reverse: true,
            ..self
        }
    }

    const fn sub(self, sub: u8) -> Self {
        Self { sub, ..self }
    }

    const fn select(self, select: RmSelect) -> Self {
        Self { select, ..self }
    }
}

const fn x(cmd: Command, size: u8, form: X87Form) -> X87Entry {
    X87Entry {
        cmd,
        size,
        form,
        pop: false,
        reverse: false,
        sub: 0,
        select: RmSelect::None,
    }
}

static X87: [X87Entry; 128] = build();

const fn idx(op: u8, mod3: bool, reg: u8) -> usize {
    (((op - 0xd8) as usize) << 4) | ((mod3 as usize) << 3) | reg as usize
}

/// Fills the eight arithmetic slots of a memory or register row.
const fn arith_row(
    mut t: [X87Entry; 128],
    op: u8,
    mod3: bool,
    size: u8,
    form: X87Form,
    pop: bool,
) -> [X87Entry; 128] {
    use Command as C;
    // ADD MUL COM COMP SUB SUBR DIV DIVR.
    let cmds = [
        C::Fadd,
        C::Fmul,
        C::Fucom,
        C::Fucom,
        C::Fsub,
        C::Fsub,
        C::Fdiv,
        C::Fdiv,
    ];
    let mut reg = 0;
    while reg < 8 {
        let mut entry = x(cmds[reg as usize], size, form);
        if pop || reg == 3 {
            entry = entry.pop();
        }
        if reg == 5 || reg == 7 {
            entry = entry.rev();
        }
        t[idx(op, mod3, reg)] = entry;
        reg += 1;
    }
    t
}

const fn build() -> [X87Entry; 128] {
    use Command as C;
    use X87Form::*;

    let mut t = [X87Entry::INVALID; 128];

    // D8: float32 memory / ST(0), ST(i).
    t = arith_row(t, 0xd8, false, 4, Mem, false);
    t = arith_row(t, 0xd8, true, 10, St0Sti, false);

    // D9.
    t[idx(0xd9, false, 0)] = x(C::Fld, 4, Mem);
    t[idx(0xd9, false, 2)] = x(C::Fst, 4, Mem);
    t[idx(0xd9, false, 3)] = x(C::Fst, 4, Mem).pop();
    t[idx(0xd9, false, 5)] = x(C::Fldcw, 2, Mem);
    t[idx(0xd9, false, 7)] = x(C::Fnstcw, 2, Mem);
    t[idx(0xd9, true, 0)] = x(C::Fld, 10, Sti);
    t[idx(0xd9, true, 1)] = x(C::Fxch, 10, Sti);
    t[idx(0xd9, true, 2)] = x(C::Nop, 0, Implied).select(RmSelect::D9Nop);
    t[idx(0xd9, true, 4)] = x(C::Fchs, 10, Implied).select(RmSelect::D9Sign);
    t[idx(0xd9, true, 5)] = x(C::FldConst, 10, Implied).select(RmSelect::D9Const);
    t[idx(0xd9, true, 7)] = x(C::Frndint, 10, Implied).select(RmSelect::D9Round);

    // DA: int32 memory / FCMOVB..FCMOVU.
    t = arith_row(t, 0xda, false, 4, Mem, false);
    let mut cc = 0;
    while cc < 4 {
        t[idx(0xda, true, cc)] = x(C::Fcmov, 10, St0Sti).sub(cc);
        t[idx(0xdb, true, cc)] = x(C::Fcmov, 10, St0Sti).sub(cc + 4);
        cc += 1;
    }
    t[idx(0xda, true, 5)] = x(C::Fucom, 10, Implied).select(RmSelect::DoublePop);

    // DB.
    t[idx(0xdb, false, 0)] = x(C::Fld, 4, Mem);
    t[idx(0xdb, false, 2)] = x(C::Fst, 4, Mem);
    t[idx(0xdb, false, 3)] = x(C::Fst, 4, Mem).pop();
    t[idx(0xdb, false, 5)] = x(C::Fld, 10, Mem);
    t[idx(0xdb, false, 7)] = x(C::Fst, 10, Mem).pop();
    t[idx(0xdb, true, 4)] = x(C::Fninit, 0, Implied).select(RmSelect::DbControl);
    t[idx(0xdb, true, 5)] = x(C::Fucomi, 10, St0Sti);
    t[idx(0xdb, true, 6)] = x(C::Fucomi, 10, St0Sti);

    // DC: float64 memory / ST(i), ST(0) with SUB/SUBR and DIV/DIVR swapped.
    t = arith_row(t, 0xdc, false, 8, Mem, false);
    t = arith_row(t, 0xdc, true, 10, StiSt0, false);
    t[idx(0xdc, true, 4)] = t[idx(0xdc, true, 4)].rev();
    t[idx(0xdc, true, 5)] = x(C::Fsub, 10, StiSt0);
    t[idx(0xdc, true, 6)] = t[idx(0xdc, true, 6)].rev();
    t[idx(0xdc, true, 7)] = x(C::Fdiv, 10, StiSt0);

    // DD.
    t[idx(0xdd, false, 0)] = x(C::Fld, 8, Mem);
    t[idx(0xdd, false, 2)] = x(C::Fst, 8, Mem);
    t[idx(0xdd, false, 3)] = x(C::Fst, 8, Mem).pop();
    t[idx(0xdd, false, 4)] = x(C::Frstor, 108, Mem);
    t[idx(0xdd, false, 6)] = x(C::Fsave, 108, Mem);
    t[idx(0xdd, false, 7)] = x(C::Fnstsw, 2, Mem);
    t[idx(0xdd, true, 2)] = x(C::Fst, 10, Sti);
    t[idx(0xdd, true, 3)] = x(C::Fst, 10, Sti).pop();
    t[idx(0xdd, true, 4)] = x(C::Fucom, 10, St0Sti);
    t[idx(0xdd, true, 5)] = x(C::Fucom, 10, St0Sti).pop();

    // DE: int16 memory / popping ST(i), ST(0) forms.
    t = arith_row(t, 0xde, false, 2, Mem, false);
    t = arith_row(t, 0xde, true, 10, StiSt0, true);
    t[idx(0xde, true, 2)] = X87Entry::INVALID;
    t[idx(0xde, true, 3)] = x(C::Fucom, 10, Implied).select(RmSelect::DoublePop);
    t[idx(0xde, true, 4)] = t[idx(0xde, true, 4)].rev();
    t[idx(0xde, true, 5)] = x(C::Fsub, 10, StiSt0).pop();
    t[idx(0xde, true, 6)] = t[idx(0xde, true, 6)].rev();
    t[idx(0xde, true, 7)] = x(C::Fdiv, 10, StiSt0).pop();

    // DF.
    t[idx(0xdf, false, 0)] = x(C::Fld, 2, Mem);
    t[idx(0xdf, false, 2)] = x(C::Fst, 2, Mem);
    t[idx(0xdf, false, 3)] = x(C::Fst, 2, Mem).pop();
    t[idx(0xdf, false, 5)] = x(C::Fld, 8, Mem);
    t[idx(0xdf, false, 7)] = x(C::Fst, 8, Mem).pop();
    t[idx(0xdf, true, 4)] = x(C::Fnstsw, 2, Ax).select(RmSelect::DfStatus);
    t[idx(0xdf, true, 5)] = x(C::Fucomi, 10, St0Sti).pop();
    t[idx(0xdf, true, 6)] = x(C::Fucomi, 10, St0Sti).pop();

    t
}

/// Result of the x87 lookup: command, operand width, operand shape, details.
pub(crate) struct X87Decode {
    pub cmd: Command,
    pub size: u8,
    pub form: X87Form,
    pub fpu: FpuInfo,
}

pub(crate) fn lookup(op: u8, mod3: bool, reg: u8, rm: u8) -> Option<X87Decode> {
    let entry = X87[idx(op, mod3, reg)];
    let mut cmd = entry.cmd;
    let mut pop = entry.pop;
    let mut sub = entry.sub;

    match entry.select {
        RmSelect::None => {}
        RmSelect::D9Sign => {
            cmd = match rm {
                0 => Command::Fchs,
                1 => Command::Fabs,
                5 => Command::Fxam,
                _ => return None,
            };
        }
        RmSelect::D9Const => {
            if rm == 7 {
                return None;
            }
            sub = rm;
        }
        RmSelect::D9Round | RmSelect::D9Nop | RmSelect::DfStatus => {
            let want = match entry.select {
                RmSelect::D9Round => 4,
                _ => 0,
            };
            if rm != want {
                return None;
            }
        }
        RmSelect::DoublePop => {
            if rm != 1 {
                return None;
            }
            pop = true;
            sub = 2;
        }
        RmSelect::DbControl => {
            cmd = match rm {
                3 => Command::Fninit,
                4 => Command::Fnsetpm,
                _ => return None,
            };
        }
    }

    if cmd == Command::Invalid {
        return None;
    }
    Some(X87Decode {
        cmd,
        size: entry.size,
        form: entry.form,
        fpu: FpuInfo {
            pop,
            reverse: entry.reverse,
            sub,
        },
    })
}
