//! What the hardware reports on a VM exit, and decoders for the
//! reason-specific exit qualifications.

use crate::handle::{HvError, HvReg, VcpuHandle};
use crate::vmcs::{ExitReason, VmcsField, EXIT_REASON_ENTRY_FAILURE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub raw_reason: u32,
    pub qualification: u64,
    pub instruction_len: u32,
    pub idt_vectoring: u32,
    pub guest_physical: u64,
    pub rip: u64,
}

impl ExitInfo {
    pub fn read<H: VcpuHandle>(handle: &H) -> Result<Self, HvError> {
        Ok(Self {
            raw_reason: handle.read_vmcs(VmcsField::VM_EXIT_REASON)? as u32,
            qualification: handle.read_vmcs(VmcsField::EXIT_QUALIFICATION)?,
            instruction_len: handle.read_vmcs(VmcsField::VM_EXIT_INSTRUCTION_LEN)? as u32,
            idt_vectoring: handle.read_vmcs(VmcsField::IDT_VECTORING_INFO)? as u32,
            guest_physical: handle.read_vmcs(VmcsField::GUEST_PHYSICAL_ADDRESS)?,
            rip: handle.read_reg(HvReg::Rip)?,
        })
    }

    pub fn reason(&self) -> Option<ExitReason> {
        ExitReason::try_from(self.basic_reason()).ok()
    }

    pub fn basic_reason(&self) -> u32 {
        self.raw_reason & 0xffff
    }

    pub fn entry_failed(&self) -> bool {
        self.raw_reason & EXIT_REASON_ENTRY_FAILURE != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// Control-register access qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrAccess {
    pub cr: u8,
    pub access: CrAccessType,
    /// General-purpose register operand of MOV CR.
    pub gpr: u8,
    /// Source operand of LMSW.
    pub lmsw_source: u16,
}

impl From<u64> for CrAccess {
    fn from(qualification: u64) -> Self {
        let access = match (qualification >> 4) & 3 {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        };
        Self {
            cr: (qualification & 0xf) as u8,
            access,
            gpr: ((qualification >> 8) & 0xf) as u8,
            lmsw_source: (qualification >> 16) as u16,
        }
    }
}

/// I/O instruction qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccess {
    pub size: u8,
    pub input: bool,
    pub string: bool,
    pub rep: bool,
    pub port: u16,
}

impl From<u64> for IoAccess {
    fn from(qualification: u64) -> Self {
        Self {
            size: (qualification & 7) as u8 + 1,
            input: qualification & (1 << 3) != 0,
            string: qualification & (1 << 4) != 0,
            rep: qualification & (1 << 5) != 0,
            port: (qualification >> 16) as u16,
        }
    }
}
