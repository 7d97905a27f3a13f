//! Software fallback core for a hardware-virtualized x86 vCPU.
//!
//! The hardware runs the guest; whatever it hands back on a VM exit is
//! finished here. The pieces, bottom up:
//! - [`mmu`]: guest page-table walker and linear-address copies
//! - [`x86`]: table-driven instruction decoder
//! - [`cpu`]: register file, lazy RFLAGS, MSRs and the instruction emulator
//! - [`vcpu`]: VMCS state sync, event injection, the exit dispatcher and
//!   32-bit hardware task switches

pub use hvx_cpu as cpu;
pub use hvx_mmu as mmu;
pub use hvx_vcpu as vcpu;
pub use hvx_x86 as x86;

pub use hvx_vcpu::{Vcpu, VcpuConfig, VcpuError, VcpuExit, VcpuHandle};
