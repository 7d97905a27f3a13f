//! The hardware vCPU as the exit loop sees it.

use thiserror::Error;

use crate::cpuid::CpuidResult;
use crate::vmcs::VmcsField;

/// Registers the hardware exposes outside the VMCS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HvReg {
    Rip,
    Rflags,
    /// General-purpose register by encoding index (0 = RAX .. 15 = R15).
    Gpr(u8),
    Cr2,
    /// Task-priority register, in APIC TPR format (priority class in bits 4-7).
    Tpr,
    Xcr0,
    Dr(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HvError {
    #[error("hypervisor call failed with status {0:#x}")]
    Failed(u32),
    #[error("hypervisor resource busy")]
    Busy,
    #[error("bad argument to hypervisor call")]
    BadArgument,
    #[error("hypervisor out of resources")]
    NoResources,
    #[error("operation not supported by the hypervisor")]
    Unsupported,
}

/// One hardware vCPU. Every method is called from the vCPU's own thread except
/// [`VcpuHandle::interrupt`].
pub trait VcpuHandle {
    fn read_reg(&self, reg: HvReg) -> Result<u64, HvError>;
    fn write_reg(&mut self, reg: HvReg, value: u64) -> Result<(), HvError>;

    fn read_vmcs(&self, field: VmcsField) -> Result<u64, HvError>;
    fn write_vmcs(&mut self, field: VmcsField, value: u64) -> Result<(), HvError>;

    /// MSRs the hardware context-switches itself.
    fn read_msr(&self, msr: u32) -> Result<u64, HvError>;
    fn write_msr(&mut self, msr: u32, value: u64) -> Result<(), HvError>;
    fn enable_native_msr(&mut self, msr: u32, enable: bool) -> Result<(), HvError>;

    /// Copy the opaque extended-state image out of or into the hardware.
    fn read_xsave(&self, buf: &mut [u8]) -> Result<(), HvError>;
    fn write_xsave(&mut self, buf: &[u8]) -> Result<(), HvError>;

    /// Run the guest until the hardware reports a VM exit or `deadline`
    /// (host absolute time) passes.
    fn run_until_exit(&mut self, deadline: u64) -> Result<(), HvError>;

    fn invalidate_tlb(&mut self) -> Result<(), HvError>;

    /// Force a VM exit on a running vCPU. Safe to call from any thread.
    fn interrupt(&self) -> Result<(), HvError>;

    /// Raw host CPUID, before any filtering.
    fn host_cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
}

/// Deadline meaning "until the next exit".
pub const RUN_FOREVER: u64 = u64::MAX;
