//! Collaborators the core reaches through traits: guest memory, port I/O and
//! the local APIC/PIC.

use hvx_mmu::GuestPhysMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

pub trait PortIo {
    /// Transfer `count` items of `size` bytes through `port`. `data` holds
    /// `size * count` bytes; inputs are written into it, outputs read from it.
    fn handle_io(
        &mut self,
        port: u16,
        data: &mut [u8],
        direction: IoDirection,
        size: u8,
        count: u32,
    );
}

pub trait Apic {
    fn apic_base(&self) -> u64;
    fn set_apic_base(&mut self, value: u64);
    fn tpr(&self) -> u8;
    fn set_tpr(&mut self, value: u8);
    /// Highest-priority deliverable interrupt, without acknowledging it.
    fn highest_pending_irq(&self) -> Option<u8>;
    /// Acknowledge and return the next interrupt vector from the APIC or PIC.
    fn poll_irq(&mut self) -> Option<u8>;
}

/// Everything guarded by the big lock that one vCPU needs while handling an
/// exit.
pub trait Platform: GuestPhysMemory + PortIo + Apic {
    fn host_tsc(&mut self) -> u64;

    /// Whether `gpa` is backed by a device rather than RAM or ROM.
    fn is_mmio(&self, gpa: u64) -> bool;

    fn nmi_pending(&self) -> bool {
        false
    }

    /// Consume the pending NMI once it has been injected.
    fn take_nmi(&mut self) {}

    fn request_reset(&mut self);

    fn request_shutdown(&mut self);
}
