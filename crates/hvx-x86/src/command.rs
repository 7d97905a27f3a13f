macro_rules! commands {
    ($($variant:ident => $name:literal,)*) => {
        /// Operation selected by the opcode tables.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Command {
            $($variant,)*
        }

        impl Command {
            /// Lower-case mnemonic used in logs and `Display`.
            pub fn name(self) -> &'static str {
                match self {
                    $(Command::$variant => $name,)*
                }
            }
        }
    };
}

commands! {
    Invalid => "(bad)",
    Push => "push",
    PushSeg => "push",
    Pop => "pop",
    PopSeg => "pop",
    Mov => "mov",
    Movsx => "movsx",
    Movzx => "movzx",
    CallNear => "call",
    CallNearIndirect => "call",
    CallFarIndirect => "call far",
    CallFar => "call far",
    RetNear => "ret",
    RetFar => "retf",
    Add => "add",
    Or => "or",
    Adc => "adc",
    Sbb => "sbb",
    And => "and",
    Sub => "sub",
    Xor => "xor",
    Cmp => "cmp",
    Inc => "inc",
    Dec => "dec",
    Test => "test",
    Not => "not",
    Neg => "neg",
    JmpNear => "jmp",
    JmpNearIndirect => "jmp",
    JmpFar => "jmp far",
    JmpFarIndirect => "jmp far",
    Lea => "lea",
    Jcc => "jcc",
    Jcxz => "jcxz",
    Setcc => "setcc",
    MovToSeg => "mov",
    MovFromSeg => "mov",
    Cli => "cli",
    Sti => "sti",
    Cld => "cld",
    Std => "std",
    Stc => "stc",
    Clc => "clc",
    Out => "out",
    In => "in",
    Ins => "ins",
    Outs => "outs",
    Lidt => "lidt",
    Sidt => "sidt",
    Lgdt => "lgdt",
    Sgdt => "sgdt",
    Smsw => "smsw",
    Lmsw => "lmsw",
    Rdtscp => "rdtscp",
    Invlpg => "invlpg",
    MovToCr => "mov",
    MovFromCr => "mov",
    MovToDr => "mov",
    MovFromDr => "mov",
    Pushf => "pushf",
    Popf => "popf",
    Cpuid => "cpuid",
    Rol => "rol",
    Ror => "ror",
    Rcl => "rcl",
    Rcr => "rcr",
    Shl => "shl",
    Sal => "sal",
    Shr => "shr",
    Shrd => "shrd",
    Shld => "shld",
    Sar => "sar",
    Div => "div",
    Idiv => "idiv",
    Mul => "mul",
    Imul3 => "imul",
    Imul2 => "imul",
    Imul1 => "imul",
    Movs => "movs",
    Cmps => "cmps",
    Scas => "scas",
    Lods => "lods",
    Stos => "stos",
    Bswap => "bswap",
    Xchg => "xchg",
    Rdtsc => "rdtsc",
    Rdmsr => "rdmsr",
    Wrmsr => "wrmsr",
    Enter => "enter",
    Leave => "leave",
    Bt => "bt",
    Bts => "bts",
    Btc => "btc",
    Btr => "btr",
    Bsf => "bsf",
    Bsr => "bsr",
    Iret => "iret",
    Int => "int",
    Popa => "popa",
    Pusha => "pusha",
    Cwd => "cwd",
    Cbw => "cbw",
    Das => "das",
    Aad => "aad",
    Aam => "aam",
    Aas => "aas",
    Loop => "loop",
    Sldt => "sldt",
    Str => "str",
    Lldt => "lldt",
    Ltr => "ltr",
    Verr => "verr",
    Verw => "verw",
    Sahf => "sahf",
    Lahf => "lahf",
    Wbinvd => "wbinvd",
    Lds => "lds",
    Lss => "lss",
    Les => "les",
    Lgs => "lgs",
    Lfs => "lfs",
    Cmc => "cmc",
    Xlat => "xlat",
    Nop => "nop",
    Cmov => "cmov",
    Clts => "clts",
    Xadd => "xadd",
    Hlt => "hlt",
    Cmpxchg8b => "cmpxchg8b",
    Cmpxchg => "cmpxchg",
    Popcnt => "popcnt",
    Fninit => "fninit",
    Fld => "fld",
    FldConst => "fldconst",
    Fnstcw => "fnstcw",
    Fnstsw => "fnstsw",
    Fnsetpm => "fnsetpm",
    Fsave => "fsave",
    Frstor => "frstor",
    Fxsave => "fxsave",
    Fxrstor => "fxrstor",
    Fdiv => "fdiv",
    Fmul => "fmul",
    Fsub => "fsub",
    Fadd => "fadd",
    Emms => "emms",
    Mfence => "mfence",
    Sfence => "sfence",
    Lfence => "lfence",
    Prefetch => "prefetch",
    Fst => "fst",
    Fabs => "fabs",
    Fucom => "fucom",
    Fucomi => "fucomi",
    Fldcw => "fldcw",
    Fxch => "fxch",
    Fchs => "fchs",
    Fcmov => "fcmov",
    Frndint => "frndint",
    Fxam => "fxam",
    Clflush => "clflush",
}

impl Command {
    /// Commands that honour REP/REPNE.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            Command::Movs
                | Command::Cmps
                | Command::Scas
                | Command::Lods
                | Command::Stos
                | Command::Ins
                | Command::Outs
        )
    }

    pub fn is_x87(self) -> bool {
        matches!(
            self,
            Command::Fninit
                | Command::Fld
                | Command::FldConst
                | Command::Fnstcw
                | Command::Fnstsw
                | Command::Fnsetpm
                | Command::Fsave
                | Command::Frstor
                | Command::Fdiv
                | Command::Fmul
                | Command::Fsub
                | Command::Fadd
                | Command::Fst
                | Command::Fabs
                | Command::Fucom
                | Command::Fucomi
                | Command::Fldcw
                | Command::Fxch
                | Command::Fchs
                | Command::Fcmov
                | Command::Frndint
                | Command::Fxam
        )
    }
}
