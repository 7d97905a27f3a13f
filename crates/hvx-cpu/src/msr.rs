//! Model-specific registers the hardware does not virtualize natively.

use tracing::{debug, trace};

use crate::platform::Platform;
use crate::state::{EmulatedCpuState, Gpr};
use hvx_x86::SegReg;

pub const IA32_TSC: u32 = 0x10;
pub const IA32_APIC_BASE: u32 = 0x1b;
pub const IA32_UCODE_REV: u32 = 0x17;
pub const IA32_SYSENTER_CS: u32 = 0x174;
pub const IA32_SYSENTER_ESP: u32 = 0x175;
pub const IA32_SYSENTER_EIP: u32 = 0x176;
pub const IA32_MISC_ENABLE: u32 = 0x1a0;
pub const IA32_MTRR_PHYSBASE0: u32 = 0x200;
pub const IA32_MTRR_PHYSMASK7: u32 = 0x20f;
pub const IA32_MTRR_FIX64K_00000: u32 = 0x250;
pub const IA32_MTRR_FIX16K_80000: u32 = 0x258;
pub const IA32_MTRR_FIX16K_A0000: u32 = 0x259;
pub const IA32_MTRR_FIX4K_C0000: u32 = 0x268;
pub const IA32_MTRR_FIX4K_F8000: u32 = 0x26f;
pub const IA32_MTRR_DEF_TYPE: u32 = 0x2ff;
pub const IA32_EFER: u32 = 0xc000_0080;
pub const IA32_STAR: u32 = 0xc000_0081;
pub const IA32_LSTAR: u32 = 0xc000_0082;
pub const IA32_CSTAR: u32 = 0xc000_0083;
pub const IA32_FMASK: u32 = 0xc000_0084;
pub const IA32_FS_BASE: u32 = 0xc000_0100;
pub const IA32_GS_BASE: u32 = 0xc000_0101;
pub const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;

/// Value reported for IA32_UCODE_REV.
pub const UCODE_REVISION: u64 = 0x1_0000_0000;

/// Number of fixed-range MTRRs: one 64K, two 16K and eight 4K registers.
pub const MTRR_FIXED_COUNT: usize = 11;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MtrrPair {
    pub base: u64,
    pub mask: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Mtrrs {
    pub var: [MtrrPair; 8],
    pub fixed: [u64; MTRR_FIXED_COUNT],
    pub def_type: u64,
}

/// MSRs kept in software. EFER and the FS/GS bases live in the CPU state
/// proper because the VMCS has dedicated fields for them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MsrStore {
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub misc_enable: u64,
    pub mtrr: Mtrrs,
}

impl Mtrrs {
    fn fixed_index(msr: u32) -> Option<usize> {
        match msr {
            IA32_MTRR_FIX64K_00000 => Some(0),
            IA32_MTRR_FIX16K_80000 | IA32_MTRR_FIX16K_A0000 => {
                Some((msr - IA32_MTRR_FIX16K_80000) as usize + 1)
            }
            IA32_MTRR_FIX4K_C0000..=IA32_MTRR_FIX4K_F8000 => {
                Some((msr - IA32_MTRR_FIX4K_C0000) as usize + 3)
            }
            _ => None,
        }
    }

    fn get(&self, msr: u32) -> Option<u64> {
        if (IA32_MTRR_PHYSBASE0..=IA32_MTRR_PHYSMASK7).contains(&msr) {
            let off = msr - IA32_MTRR_PHYSBASE0;
            let pair = &self.var[(off / 2) as usize];
            return Some(if off % 2 == 0 { pair.base } else { pair.mask });
        }
        if msr == IA32_MTRR_DEF_TYPE {
            return Some(self.def_type);
        }
        Self::fixed_index(msr).map(|i| self.fixed[i])
    }

    fn set(&mut self, msr: u32, value: u64) -> bool {
        if (IA32_MTRR_PHYSBASE0..=IA32_MTRR_PHYSMASK7).contains(&msr) {
            let off = msr - IA32_MTRR_PHYSBASE0;
            let pair = &mut self.var[(off / 2) as usize];
            if off % 2 == 0 {
                pair.base = value;
            } else {
                pair.mask = value;
            }
            return true;
        }
        if msr == IA32_MTRR_DEF_TYPE {
            self.def_type = value;
            return true;
        }
        match Self::fixed_index(msr) {
            Some(i) => {
                self.fixed[i] = value;
                true
            }
            None => false,
        }
    }
}

/// Read `msr`. Unknown MSRs read as zero.
pub fn read_msr<P: Platform>(cpu: &EmulatedCpuState, platform: &mut P, msr: u32) -> u64 {
    let msrs = &cpu.msrs;
    match msr {
        IA32_TSC => platform.host_tsc().wrapping_add(cpu.tsc_offset),
        IA32_APIC_BASE => platform.apic_base(),
        IA32_UCODE_REV => UCODE_REVISION,
        IA32_EFER => cpu.efer,
        IA32_FS_BASE => cpu.segment(SegReg::Fs).base,
        IA32_GS_BASE => cpu.segment(SegReg::Gs).base,
        IA32_KERNEL_GS_BASE => msrs.kernel_gs_base,
        IA32_STAR => msrs.star,
        IA32_LSTAR => msrs.lstar,
        IA32_CSTAR => msrs.cstar,
        IA32_FMASK => msrs.fmask,
        IA32_SYSENTER_CS => msrs.sysenter_cs,
        IA32_SYSENTER_ESP => msrs.sysenter_esp,
        IA32_SYSENTER_EIP => msrs.sysenter_eip,
        IA32_MISC_ENABLE => msrs.misc_enable,
        _ => msrs.mtrr.get(msr).unwrap_or_else(|| {
            debug!(msr, "rdmsr of unknown msr");
            0
        }),
    }
}

/// Write `msr`. TSC writes and unknown MSRs are dropped.
pub fn write_msr<P: Platform>(cpu: &mut EmulatedCpuState, platform: &mut P, msr: u32, value: u64) {
    match msr {
        IA32_TSC => {}
        IA32_APIC_BASE => platform.set_apic_base(value),
        IA32_EFER => {
            cpu.efer = value;
            if value & hvx_mmu::EFER_NXE != 0 {
                cpu.flush_tlb = true;
            }
        }
        IA32_FS_BASE => cpu.segment_mut(SegReg::Fs).base = value,
        IA32_GS_BASE => cpu.segment_mut(SegReg::Gs).base = value,
        IA32_KERNEL_GS_BASE => cpu.msrs.kernel_gs_base = value,
        IA32_STAR => cpu.msrs.star = value,
        IA32_LSTAR => cpu.msrs.lstar = value,
        IA32_CSTAR => cpu.msrs.cstar = value,
        IA32_FMASK => cpu.msrs.fmask = value,
        IA32_SYSENTER_CS => cpu.msrs.sysenter_cs = value,
        IA32_SYSENTER_ESP => cpu.msrs.sysenter_esp = value,
        IA32_SYSENTER_EIP => cpu.msrs.sysenter_eip = value,
        IA32_MISC_ENABLE => cpu.msrs.misc_enable = value,
        _ => {
            if !cpu.msrs.mtrr.set(msr, value) {
                debug!(msr, value, "wrmsr of unknown msr dropped");
            }
        }
    }
    cpu.dirty = true;
}

/// RDMSR: ECX selects the MSR, the value lands in EDX:EAX.
pub fn simulate_rdmsr<P: Platform>(cpu: &mut EmulatedCpuState, platform: &mut P) {
    let msr = cpu.gpr(Gpr::Rcx) as u32;
    let value = read_msr(cpu, platform, msr);
    trace!(msr, value, "rdmsr");
    cpu.set_gpr(Gpr::Rax, value & 0xffff_ffff);
    cpu.set_gpr(Gpr::Rdx, value >> 32);
}

/// WRMSR: EDX:EAX written to the MSR in ECX.
pub fn simulate_wrmsr<P: Platform>(cpu: &mut EmulatedCpuState, platform: &mut P) {
    let msr = cpu.gpr(Gpr::Rcx) as u32;
    let value = (cpu.gpr(Gpr::Rdx) << 32) | (cpu.gpr(Gpr::Rax) & 0xffff_ffff);
    trace!(msr, value, "wrmsr");
    write_msr(cpu, platform, msr, value);
}
