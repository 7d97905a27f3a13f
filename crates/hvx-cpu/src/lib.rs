//! Software CPU core for instructions that leave hardware execution.
//!
//! The core owns the architectural register file ([`EmulatedCpuState`]),
//! lazily evaluated RFLAGS, the MSRs the hardware does not virtualize, and an
//! instruction emulator that reaches guest memory through the page walker in
//! `hvx-mmu` and devices through the [`Platform`] traits.

#![forbid(unsafe_code)]

pub mod descriptors;
pub mod exception;
pub mod flags;
pub mod interp;
pub mod msr;
pub mod platform;
pub mod state;

pub use descriptors::{DescriptorTableReg, SegmentDescriptor};
pub use exception::{Escalation, EventType, Exception, FaultClass, PendingEvent};
pub use flags::{LazyFlags, Rflags};
pub use interp::{emulate_one, execute, fetch, EmulationError, Executed};
pub use platform::{Apic, IoDirection, Platform, PortIo};
pub use state::{ControlRegs, EmulatedCpuState, Gpr, Interruptibility, SegmentCache};

#[cfg(test)]
mod tests;
