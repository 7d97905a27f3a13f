//! Virtual Machine Control Structure field encodings and the bit layouts of
//! the fields the exit loop interprets.

use bitflags::bitflags;
use hvx_x86::SegReg;

/// VMCS fields, numbered by their architectural encoding.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum VmcsField {
    GUEST_ES_SELECTOR = 0x0000_0800,
    GUEST_CS_SELECTOR = 0x0000_0802,
    GUEST_SS_SELECTOR = 0x0000_0804,
    GUEST_DS_SELECTOR = 0x0000_0806,
    GUEST_FS_SELECTOR = 0x0000_0808,
    GUEST_GS_SELECTOR = 0x0000_080a,
    GUEST_LDTR_SELECTOR = 0x0000_080c,
    GUEST_TR_SELECTOR = 0x0000_080e,

    TSC_OFFSET = 0x0000_2010,
    GUEST_PHYSICAL_ADDRESS = 0x0000_2400,
    GUEST_IA32_EFER = 0x0000_2806,
    GUEST_PDPTE0 = 0x0000_280a,
    GUEST_PDPTE1 = 0x0000_280c,
    GUEST_PDPTE2 = 0x0000_280e,
    GUEST_PDPTE3 = 0x0000_2810,

    PIN_BASED_VM_EXEC_CONTROL = 0x0000_4000,
    CPU_BASED_VM_EXEC_CONTROL = 0x0000_4002,
    EXCEPTION_BITMAP = 0x0000_4004,
    VM_EXIT_CONTROLS = 0x0000_400c,
    VM_ENTRY_CONTROLS = 0x0000_4012,
    VM_ENTRY_INTR_INFO = 0x0000_4016,
    VM_ENTRY_EXCEPTION_ERROR_CODE = 0x0000_4018,
    VM_ENTRY_INSTRUCTION_LEN = 0x0000_401a,
    TPR_THRESHOLD = 0x0000_401c,
    SECONDARY_VM_EXEC_CONTROL = 0x0000_401e,
    VM_INSTRUCTION_ERROR = 0x0000_4400,
    VM_EXIT_REASON = 0x0000_4402,
    VM_EXIT_INTR_INFO = 0x0000_4404,
    VM_EXIT_INTR_ERROR_CODE = 0x0000_4406,
    IDT_VECTORING_INFO = 0x0000_4408,
    IDT_VECTORING_ERROR_CODE = 0x0000_440a,
    VM_EXIT_INSTRUCTION_LEN = 0x0000_440c,
    VMX_INSTRUCTION_INFO = 0x0000_440e,
    GUEST_ES_LIMIT = 0x0000_4800,
    GUEST_CS_LIMIT = 0x0000_4802,
    GUEST_SS_LIMIT = 0x0000_4804,
    GUEST_DS_LIMIT = 0x0000_4806,
    GUEST_FS_LIMIT = 0x0000_4808,
    GUEST_GS_LIMIT = 0x0000_480a,
    GUEST_LDTR_LIMIT = 0x0000_480c,
    GUEST_TR_LIMIT = 0x0000_480e,
    GUEST_GDTR_LIMIT = 0x0000_4810,
    GUEST_IDTR_LIMIT = 0x0000_4812,
    GUEST_ES_AR = 0x0000_4814,
    GUEST_CS_AR = 0x0000_4816,
    GUEST_SS_AR = 0x0000_4818,
    GUEST_DS_AR = 0x0000_481a,
    GUEST_FS_AR = 0x0000_481c,
    GUEST_GS_AR = 0x0000_481e,
    GUEST_LDTR_AR = 0x0000_4820,
    GUEST_TR_AR = 0x0000_4822,
    GUEST_INTERRUPTIBILITY = 0x0000_4824,
    GUEST_ACTIVITY_STATE = 0x0000_4826,

    CR0_GUEST_HOST_MASK = 0x0000_6000,
    CR4_GUEST_HOST_MASK = 0x0000_6002,
    CR0_READ_SHADOW = 0x0000_6004,
    CR4_READ_SHADOW = 0x0000_6006,
    EXIT_QUALIFICATION = 0x0000_6400,
    GUEST_LINEAR_ADDRESS = 0x0000_640a,
    GUEST_CR0 = 0x0000_6800,
    GUEST_CR3 = 0x0000_6802,
    GUEST_CR4 = 0x0000_6804,
    GUEST_ES_BASE = 0x0000_6806,
    GUEST_CS_BASE = 0x0000_6808,
    GUEST_SS_BASE = 0x0000_680a,
    GUEST_DS_BASE = 0x0000_680c,
    GUEST_FS_BASE = 0x0000_680e,
    GUEST_GS_BASE = 0x0000_6810,
    GUEST_LDTR_BASE = 0x0000_6812,
    GUEST_TR_BASE = 0x0000_6814,
    GUEST_GDTR_BASE = 0x0000_6816,
    GUEST_IDTR_BASE = 0x0000_6818,
}

impl VmcsField {
    pub const GUEST_PDPTE: [VmcsField; 4] = [
        VmcsField::GUEST_PDPTE0,
        VmcsField::GUEST_PDPTE1,
        VmcsField::GUEST_PDPTE2,
        VmcsField::GUEST_PDPTE3,
    ];

    #[inline]
    pub fn encoding(self) -> u32 {
        self as u32
    }
}

/// The four VMCS fields that describe one segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFields {
    pub selector: VmcsField,
    pub base: VmcsField,
    pub limit: VmcsField,
    pub access_rights: VmcsField,
}

macro_rules! segment_fields {
    ($sel:ident, $base:ident, $limit:ident, $ar:ident) => {
        SegmentFields {
            selector: VmcsField::$sel,
            base: VmcsField::$base,
            limit: VmcsField::$limit,
            access_rights: VmcsField::$ar,
        }
    };
}

pub const LDTR_FIELDS: SegmentFields = segment_fields!(
    GUEST_LDTR_SELECTOR,
    GUEST_LDTR_BASE,
    GUEST_LDTR_LIMIT,
    GUEST_LDTR_AR
);
pub const TR_FIELDS: SegmentFields =
    segment_fields!(GUEST_TR_SELECTOR, GUEST_TR_BASE, GUEST_TR_LIMIT, GUEST_TR_AR);

pub fn segment_fields(seg: SegReg) -> SegmentFields {
    match seg {
        SegReg::Es => segment_fields!(GUEST_ES_SELECTOR, GUEST_ES_BASE, GUEST_ES_LIMIT, GUEST_ES_AR),
        SegReg::Cs => segment_fields!(GUEST_CS_SELECTOR, GUEST_CS_BASE, GUEST_CS_LIMIT, GUEST_CS_AR),
        SegReg::Ss => segment_fields!(GUEST_SS_SELECTOR, GUEST_SS_BASE, GUEST_SS_LIMIT, GUEST_SS_AR),
        SegReg::Ds => segment_fields!(GUEST_DS_SELECTOR, GUEST_DS_BASE, GUEST_DS_LIMIT, GUEST_DS_AR),
        SegReg::Fs => segment_fields!(GUEST_FS_SELECTOR, GUEST_FS_BASE, GUEST_FS_LIMIT, GUEST_FS_AR),
        SegReg::Gs => segment_fields!(GUEST_GS_SELECTOR, GUEST_GS_BASE, GUEST_GS_LIMIT, GUEST_GS_AR),
    }
}

/// Basic VM-exit reasons (low 16 bits of `VM_EXIT_REASON`).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum ExitReason {
    EXCEPTION_NMI = 0,
    EXTERNAL_INTERRUPT = 1,
    TRIPLE_FAULT = 2,
    INIT = 3,
    SIPI = 4,
    IO_SMI = 5,
    OTHER_SMI = 6,
    INTERRUPT_WINDOW = 7,
    NMI_WINDOW = 8,
    TASK_SWITCH = 9,
    CPUID = 10,
    GETSEC = 11,
    HLT = 12,
    INVD = 13,
    INVLPG = 14,
    RDPMC = 15,
    RDTSC = 16,
    RSM = 17,
    VMCALL = 18,
    VMCLEAR = 19,
    VMLAUNCH = 20,
    VMPTRLD = 21,
    VMPTRST = 22,
    VMREAD = 23,
    VMRESUME = 24,
    VMWRITE = 25,
    VMOFF = 26,
    VMON = 27,
    CONTROL_REGISTER_ACCESS = 28,
    MOV_DR = 29,
    IO_INSTRUCTION = 30,
    MSR_READ = 31,
    MSR_WRITE = 32,
    INVALID_GUEST_STATE = 33,
    MSR_LOAD_FAIL = 34,
    MWAIT_INSTRUCTION = 36,
    MONITOR_TRAP_FLAG = 37,
    MONITOR_INSTRUCTION = 39,
    PAUSE_INSTRUCTION = 40,
    MCE_DURING_VMENTRY = 41,
    TPR_BELOW_THRESHOLD = 43,
    APIC_ACCESS = 44,
    VIRTUALIZED_EOI = 45,
    GDTR_IDTR = 46,
    LDTR_TR = 47,
    EPT_VIOLATION = 48,
    EPT_MISCONFIG = 49,
    INVEPT = 50,
    RDTSCP = 51,
    PREEMPTION_TIMER = 52,
    INVVPID = 53,
    WBINVD = 54,
    XSETBV = 55,
    APIC_WRITE = 56,
    RDRAND = 57,
    INVPCID = 58,
    VMFUNC = 59,
    ENCLS = 60,
    RDSEED = 61,
    PML_FULL = 62,
    XSAVES = 63,
    XRSTORS = 64,
}

impl TryFrom<u32> for ExitReason {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        use ExitReason::*;
        const TABLE: [Option<ExitReason>; 65] = {
            let mut t = [None; 65];
            let all = [
                EXCEPTION_NMI, EXTERNAL_INTERRUPT, TRIPLE_FAULT, INIT, SIPI, IO_SMI, OTHER_SMI,
                INTERRUPT_WINDOW, NMI_WINDOW, TASK_SWITCH, CPUID, GETSEC, HLT, INVD, INVLPG,
                RDPMC, RDTSC, RSM, VMCALL, VMCLEAR, VMLAUNCH, VMPTRLD, VMPTRST, VMREAD, VMRESUME,
                VMWRITE, VMOFF, VMON, CONTROL_REGISTER_ACCESS, MOV_DR, IO_INSTRUCTION, MSR_READ,
                MSR_WRITE, INVALID_GUEST_STATE, MSR_LOAD_FAIL, MWAIT_INSTRUCTION,
                MONITOR_TRAP_FLAG, MONITOR_INSTRUCTION, PAUSE_INSTRUCTION, MCE_DURING_VMENTRY,
                TPR_BELOW_THRESHOLD, APIC_ACCESS, VIRTUALIZED_EOI, GDTR_IDTR, LDTR_TR,
                EPT_VIOLATION, EPT_MISCONFIG, INVEPT, RDTSCP, PREEMPTION_TIMER, INVVPID, WBINVD,
                XSETBV, APIC_WRITE, RDRAND, INVPCID, VMFUNC, ENCLS, RDSEED, PML_FULL, XSAVES,
                XRSTORS,
            ];
            let mut i = 0;
            while i < all.len() {
                t[all[i] as usize] = Some(all[i]);
                i += 1;
            }
            t
        };
        TABLE
            .get(raw as usize)
            .copied()
            .flatten()
            .ok_or(raw)
    }
}

/// `VM_EXIT_REASON` bit 31: the exit happened during VM entry.
pub const EXIT_REASON_ENTRY_FAILURE: u32 = 1 << 31;

bitflags! {
    /// Primary processor-based VM-execution controls the exit loop toggles.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CpuBasedControls: u32 {
        /// VM exit as soon as RFLAGS.IF=1 and there is no interrupt shadow.
        const INTR_WINDOW_EXITING = 1 << 2;
        const USE_TSC_OFFSETTING = 1 << 3;
        const HLT_EXITING = 1 << 7;
        const CR3_LOAD_EXITING = 1 << 15;
        const CR3_STORE_EXITING = 1 << 16;
        const CR8_LOAD_EXITING = 1 << 19;
        const CR8_STORE_EXITING = 1 << 20;
        const TPR_SHADOW = 1 << 21;
        /// VM exit as soon as NMIs are unblocked.
        const NMI_WINDOW_EXITING = 1 << 22;
        const UNCOND_IO_EXITING = 1 << 24;
        const USE_MSR_BITMAPS = 1 << 28;
        const SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct VmEntryControls: u32 {
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        /// The guest is in IA-32e mode after entry; mirrors EFER.LMA.
        const IA32E_MODE_GUEST = 1 << 9;
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags! {
    /// EPT-violation exit qualification.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct EptViolation: u64 {
        const DATA_READ = 1 << 0;
        const DATA_WRITE = 1 << 1;
        const INST_FETCH = 1 << 2;
        const GPA_READABLE = 1 << 3;
        const GPA_WRITEABLE = 1 << 4;
        const GPA_EXECUTABLE = 1 << 5;
        /// `GUEST_LINEAR_ADDRESS` is valid.
        const GLA_VALID = 1 << 7;
        /// The access was to the translation of a linear address, not to a
        /// paging structure.
        const XLAT_VALID = 1 << 8;
        /// The faulting access was part of an IRET that unblocked NMIs.
        const NMI_UNBLOCKING = 1 << 12;
    }
}

// Interruption-information format shared by VM_ENTRY_INTR_INFO,
// VM_EXIT_INTR_INFO and IDT_VECTORING_INFO.
pub const INTR_INFO_VECTOR_MASK: u32 = 0xff;
pub const INTR_INFO_TYPE_SHIFT: u32 = 8;
pub const INTR_INFO_TYPE_MASK: u32 = 7 << INTR_INFO_TYPE_SHIFT;
pub const INTR_INFO_ERROR_CODE_VALID: u32 = 1 << 11;
pub const INTR_INFO_VALID: u32 = 1 << 31;

// Segment access-rights format.
pub const AR_TYPE_MASK: u32 = 0xf;
pub const AR_TYPE_BUSY_64_TSS: u32 = 0xb;
pub const AR_UNUSABLE: u32 = 1 << 16;

/// CR0 bits the guest cannot change without an exit.
pub const CR0_HOST_OWNED: u64 = hvx_mmu::CR0_PG
    | hvx_cpu::state::CR0_CD
    | hvx_cpu::state::CR0_NW
    | hvx_cpu::state::CR0_NE
    | hvx_cpu::state::CR0_ET;

/// CR4 bits the guest cannot change without an exit.
pub const CR4_HOST_OWNED: u64 = hvx_cpu::state::CR4_VMXE;
