//! Hardware-assisted vCPU driver.
//!
//! [`Vcpu::exec`] runs the guest on a [`VcpuHandle`] and services each VM
//! exit: simple exits are resolved against the hardware registers directly,
//! everything else goes through the software core in `hvx-cpu` with the
//! architectural state synchronized around it.

#![forbid(unsafe_code)]

pub mod cpuid;
pub mod events;
pub mod exit;
pub mod handle;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod sync;
pub mod task_switch;
mod vcpu;
pub mod vmcs;

pub use cpuid::{CpuidConfig, CpuidContext, CpuidResult};
pub use exit::{CrAccess, CrAccessType, ExitInfo, IoAccess};
pub use handle::{HvError, HvReg, VcpuHandle, RUN_FOREVER};
pub use task_switch::{task_switch, TaskSwitchError, TaskSwitchReason, TssImage};
pub use vcpu::{Vcpu, VcpuConfig, VcpuError, VcpuExit};
pub use vmcs::{ExitReason, VmcsField};
