//! Guest-visible CPUID.
//!
//! Host values pass through a per-register allow mask so the guest never sees
//! a feature the hardware cannot virtualize (VMX, MONITOR/MWAIT, perfmon) and
//! always sees the hypervisor bit. OSXSAVE follows the guest's CR4 and the
//! initial APIC ID is this vCPU's.

use hvx_cpu::state::CR4_OSXSAVE;

/// A CPUID result tuple (EAX, EBX, ECX, EDX).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidResult {
    pub const ZERO: Self = Self {
        eax: 0,
        ebx: 0,
        ecx: 0,
        edx: 0,
    };
}

pub mod bits {
    pub const LEAF1_EDX_FPU: u32 = 1 << 0;
    pub const LEAF1_EDX_VME: u32 = 1 << 1;
    pub const LEAF1_EDX_DE: u32 = 1 << 2;
    pub const LEAF1_EDX_PSE: u32 = 1 << 3;
    pub const LEAF1_EDX_TSC: u32 = 1 << 4;
    pub const LEAF1_EDX_MSR: u32 = 1 << 5;
    pub const LEAF1_EDX_PAE: u32 = 1 << 6;
    pub const LEAF1_EDX_MCE: u32 = 1 << 7;
    pub const LEAF1_EDX_CX8: u32 = 1 << 8;
    pub const LEAF1_EDX_APIC: u32 = 1 << 9;
    pub const LEAF1_EDX_SEP: u32 = 1 << 11;
    pub const LEAF1_EDX_MTRR: u32 = 1 << 12;
    pub const LEAF1_EDX_PGE: u32 = 1 << 13;
    pub const LEAF1_EDX_MCA: u32 = 1 << 14;
    pub const LEAF1_EDX_CMOV: u32 = 1 << 15;
    pub const LEAF1_EDX_PAT: u32 = 1 << 16;
    pub const LEAF1_EDX_PSE36: u32 = 1 << 17;
    pub const LEAF1_EDX_CLFSH: u32 = 1 << 19;
    pub const LEAF1_EDX_MMX: u32 = 1 << 23;
    pub const LEAF1_EDX_FXSR: u32 = 1 << 24;
    pub const LEAF1_EDX_SSE: u32 = 1 << 25;
    pub const LEAF1_EDX_SSE2: u32 = 1 << 26;
    pub const LEAF1_EDX_HTT: u32 = 1 << 28;

    pub const LEAF1_ECX_SSE3: u32 = 1 << 0;
    pub const LEAF1_ECX_PCLMULQDQ: u32 = 1 << 1;
    pub const LEAF1_ECX_MONITOR: u32 = 1 << 3;
    pub const LEAF1_ECX_VMX: u32 = 1 << 5;
    pub const LEAF1_ECX_SSSE3: u32 = 1 << 9;
    pub const LEAF1_ECX_FMA: u32 = 1 << 12;
    pub const LEAF1_ECX_CX16: u32 = 1 << 13;
    pub const LEAF1_ECX_PDCM: u32 = 1 << 15;
    pub const LEAF1_ECX_SSE41: u32 = 1 << 19;
    pub const LEAF1_ECX_SSE42: u32 = 1 << 20;
    pub const LEAF1_ECX_X2APIC: u32 = 1 << 21;
    pub const LEAF1_ECX_MOVBE: u32 = 1 << 22;
    pub const LEAF1_ECX_POPCNT: u32 = 1 << 23;
    pub const LEAF1_ECX_AES: u32 = 1 << 25;
    pub const LEAF1_ECX_XSAVE: u32 = 1 << 26;
    pub const LEAF1_ECX_OSXSAVE: u32 = 1 << 27;
    pub const LEAF1_ECX_AVX: u32 = 1 << 28;
    pub const LEAF1_ECX_F16C: u32 = 1 << 29;
    pub const LEAF1_ECX_RDRAND: u32 = 1 << 30;
    pub const LEAF1_ECX_HYPERVISOR: u32 = 1 << 31;

    pub const LEAF7_EBX_FSGSBASE: u32 = 1 << 0;
    pub const LEAF7_EBX_BMI1: u32 = 1 << 3;
    pub const LEAF7_EBX_AVX2: u32 = 1 << 5;
    pub const LEAF7_EBX_SMEP: u32 = 1 << 7;
    pub const LEAF7_EBX_BMI2: u32 = 1 << 8;
    pub const LEAF7_EBX_ERMS: u32 = 1 << 9;
    pub const LEAF7_EBX_RDSEED: u32 = 1 << 18;
    pub const LEAF7_EBX_ADX: u32 = 1 << 19;
    pub const LEAF7_EBX_SMAP: u32 = 1 << 20;
    pub const LEAF7_EBX_CLFLUSHOPT: u32 = 1 << 23;

    pub const EXT1_EDX_SYSCALL: u32 = 1 << 11;
    pub const EXT1_EDX_NX: u32 = 1 << 20;
    pub const EXT1_EDX_PDPE1GB: u32 = 1 << 26;
    pub const EXT1_EDX_RDTSCP: u32 = 1 << 27;
    pub const EXT1_EDX_LM: u32 = 1 << 29;

    pub const EXT1_ECX_LAHF_LM: u32 = 1 << 0;
    pub const EXT1_ECX_ABM: u32 = 1 << 5;
    pub const EXT1_ECX_PREFETCHW: u32 = 1 << 8;

    pub const XCR0_X87: u64 = 1 << 0;
    pub const XCR0_SSE: u64 = 1 << 1;
    pub const XCR0_AVX: u64 = 1 << 2;
}

use bits::*;

pub const LEAF_HYPERVISOR: u32 = 0x4000_0000;

/// Which host features the guest may see, and the identity this vCPU reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuidConfig {
    pub max_basic_leaf: u32,
    pub leaf1_ecx: u32,
    pub leaf1_edx: u32,
    pub leaf7_ebx: u32,
    pub ext1_ecx: u32,
    pub ext1_edx: u32,
    pub apic_id: u8,
    pub logical_processors: u8,
    /// Returned in EBX/ECX/EDX of leaf 0x4000_0000.
    pub hypervisor_vendor: [u8; 12],
}

impl Default for CpuidConfig {
    fn default() -> Self {
        Self {
            max_basic_leaf: 0xd,
            leaf1_ecx: LEAF1_ECX_SSE3
                | LEAF1_ECX_PCLMULQDQ
                | LEAF1_ECX_SSSE3
                | LEAF1_ECX_FMA
                | LEAF1_ECX_CX16
                | LEAF1_ECX_SSE41
                | LEAF1_ECX_SSE42
                | LEAF1_ECX_MOVBE
                | LEAF1_ECX_POPCNT
                | LEAF1_ECX_AES
                | LEAF1_ECX_XSAVE
                | LEAF1_ECX_AVX
                | LEAF1_ECX_F16C
                | LEAF1_ECX_RDRAND,
            leaf1_edx: LEAF1_EDX_FPU
                | LEAF1_EDX_VME
                | LEAF1_EDX_DE
                | LEAF1_EDX_PSE
                | LEAF1_EDX_TSC
                | LEAF1_EDX_MSR
                | LEAF1_EDX_PAE
                | LEAF1_EDX_MCE
                | LEAF1_EDX_CX8
                | LEAF1_EDX_APIC
                | LEAF1_EDX_SEP
                | LEAF1_EDX_MTRR
                | LEAF1_EDX_PGE
                | LEAF1_EDX_MCA
                | LEAF1_EDX_CMOV
                | LEAF1_EDX_PAT
                | LEAF1_EDX_PSE36
                | LEAF1_EDX_CLFSH
                | LEAF1_EDX_MMX
                | LEAF1_EDX_FXSR
                | LEAF1_EDX_SSE
                | LEAF1_EDX_SSE2,
            leaf7_ebx: LEAF7_EBX_FSGSBASE
                | LEAF7_EBX_BMI1
                | LEAF7_EBX_AVX2
                | LEAF7_EBX_SMEP
                | LEAF7_EBX_BMI2
                | LEAF7_EBX_ERMS
                | LEAF7_EBX_RDSEED
                | LEAF7_EBX_ADX
                | LEAF7_EBX_SMAP
                | LEAF7_EBX_CLFLUSHOPT,
            ext1_ecx: EXT1_ECX_LAHF_LM | EXT1_ECX_ABM | EXT1_ECX_PREFETCHW,
            ext1_edx: EXT1_EDX_SYSCALL
                | EXT1_EDX_NX
                | EXT1_EDX_PDPE1GB
                | EXT1_EDX_RDTSCP
                | EXT1_EDX_LM,
            apic_id: 0,
            logical_processors: 1,
            hypervisor_vendor: *b"hvxhvxhvxhvx",
        }
    }
}

/// Guest state CPUID output depends on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidContext {
    pub cr4: u64,
    pub xcr0: u64,
}

/// Size of the XSAVE area covering the components enabled in `xcr0`.
fn xsave_size(xcr0: u64) -> u32 {
    // Legacy region plus header; AVX state is 256 bytes at offset 576.
    if xcr0 & XCR0_AVX != 0 {
        832
    } else {
        576
    }
}

impl CpuidConfig {
    /// Filter a raw host result for `leaf`/`subleaf`.
    pub fn filter(
        &self,
        leaf: u32,
        subleaf: u32,
        host: CpuidResult,
        ctx: CpuidContext,
    ) -> CpuidResult {
        let mut out = host;
        match leaf {
            0 => out.eax = host.eax.min(self.max_basic_leaf),
            1 => {
                out.ebx = (host.ebx & 0x0000_ffff)
                    | (u32::from(self.logical_processors) << 16)
                    | (u32::from(self.apic_id) << 24);
                out.ecx = (host.ecx & self.leaf1_ecx) | LEAF1_ECX_HYPERVISOR;
                if ctx.cr4 & CR4_OSXSAVE != 0 && out.ecx & LEAF1_ECX_XSAVE != 0 {
                    out.ecx |= LEAF1_ECX_OSXSAVE;
                }
                out.edx = host.edx & self.leaf1_edx;
                if self.logical_processors > 1 {
                    out.edx |= LEAF1_EDX_HTT;
                }
            }
            // MONITOR/MWAIT, thermal/power and architectural perfmon.
            5 | 6 | 0xa => out = CpuidResult::ZERO,
            7 => {
                out = if subleaf == 0 {
                    CpuidResult {
                        eax: 0,
                        ebx: host.ebx & self.leaf7_ebx,
                        ecx: 0,
                        edx: 0,
                    }
                } else {
                    CpuidResult::ZERO
                };
            }
            0xb => out.edx = u32::from(self.apic_id),
            0xd => match subleaf {
                0 => {
                    let supported = XCR0_X87 | XCR0_SSE | (u64::from(host.eax) & XCR0_AVX);
                    out.eax = supported as u32;
                    out.ebx = xsave_size(ctx.xcr0);
                    out.ecx = xsave_size(supported);
                    out.edx = 0;
                }
                1 => out = CpuidResult::ZERO,
                2 if self.leaf1_ecx & LEAF1_ECX_AVX != 0 => {}
                _ => out = CpuidResult::ZERO,
            },
            LEAF_HYPERVISOR => {
                let v = &self.hypervisor_vendor;
                out = CpuidResult {
                    eax: LEAF_HYPERVISOR,
                    ebx: u32::from_le_bytes([v[0], v[1], v[2], v[3]]),
                    ecx: u32::from_le_bytes([v[4], v[5], v[6], v[7]]),
                    edx: u32::from_le_bytes([v[8], v[9], v[10], v[11]]),
                };
            }
            0x4000_0001..=0x4fff_ffff => out = CpuidResult::ZERO,
            0x8000_0001 => {
                out.ecx = host.ecx & self.ext1_ecx;
                out.edx = host.edx & self.ext1_edx;
            }
            _ => {}
        }
        out
    }
}
