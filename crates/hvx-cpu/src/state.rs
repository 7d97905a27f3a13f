use bitflags::bitflags;
use hvx_mmu::{PagingRegs, CR0_PG, EFER_LMA};
use hvx_x86::{CpuMode, Register, SegReg};
use tracing::{debug, warn};

use crate::descriptors::DescriptorTableReg;
use crate::exception::{Escalation, EventType, FaultClass, PendingEvent};
use crate::flags::Rflags;
use crate::msr::MsrStore;
use crate::Exception;

pub const CR0_PE: u64 = 1 << 0;
pub const CR0_MP: u64 = 1 << 1;
pub const CR0_EM: u64 = 1 << 2;
pub const CR0_TS: u64 = 1 << 3;
pub const CR0_ET: u64 = 1 << 4;
pub const CR0_NE: u64 = 1 << 5;
pub const CR0_NW: u64 = 1 << 29;
pub const CR0_CD: u64 = 1 << 30;

pub const CR4_VMXE: u64 = 1 << 13;
pub const CR4_OSXSAVE: u64 = 1 << 18;

/// Size of the opaque extended-state buffer exchanged with the hardware.
pub const XSAVE_AREA_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Hidden part of a segment register plus its selector.
///
/// `access` is descriptor byte 5 (type, S, DPL, P) and `flags` the AVL/L/DB/G
/// nibble, the same split the VMX access-rights field uses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access: u8,
    pub flags: u8,
    pub unusable: bool,
}

impl SegmentCache {
    pub fn unusable() -> Self {
        Self {
            unusable: true,
            ..Self::default()
        }
    }

    /// Real-mode segment: base = selector << 4, 64K limit.
    pub fn real_mode(selector: u16, access: u8) -> Self {
        Self {
            selector,
            base: u64::from(selector) << 4,
            limit: 0xffff,
            access,
            flags: 0,
            unusable: false,
        }
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access & 0x80 != 0
    }

    #[inline]
    pub fn long(&self) -> bool {
        self.flags & 0x2 != 0
    }

    #[inline]
    pub fn db(&self) -> bool {
        self.flags & 0x4 != 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
}

bitflags! {
    /// Guest interruptibility state, in VMCS bit positions.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Interruptibility: u32 {
        const STI = 1 << 0;
        const MOV_SS = 1 << 1;
        const SMI = 1 << 2;
        const NMI = 1 << 3;
    }
}

impl Interruptibility {
    pub const SHADOW: Self = Self::STI.union(Self::MOV_SS);
}

/// Architectural state of one vCPU as seen by the emulator.
#[derive(Debug, Clone)]
pub struct EmulatedCpuState {
    gprs: [u64; 16],
    pub rip: u64,
    pub rflags: Rflags,

    segments: [SegmentCache; 6],
    pub ldtr: SegmentCache,
    pub tr: SegmentCache,
    pub gdtr: DescriptorTableReg,
    pub idtr: DescriptorTableReg,

    pub control: ControlRegs,
    pub efer: u64,
    pub dr: [u64; 8],
    pub xcr0: u64,
    pub xsave: Vec<u8>,
    /// PAE page-directory-pointer entries the hardware uses when CR0.PG=1,
    /// CR4.PAE=1 outside long mode.
    pub pdptes: [u64; 4],
    pub msrs: MsrStore,
    pub tsc_offset: u64,

    /// The one event waiting for VM entry.
    pub injected: Option<PendingEvent>,
    /// An interrupt or NMI displaced from the slot by a fault raised during
    /// its delivery. It goes back in once the slot drains.
    pub deferred: Option<PendingEvent>,
    pub interruptibility: Interruptibility,
    pub halted: bool,
    /// A fault hit #DF delivery; the VM lifecycle must reset or shut down.
    pub triple_fault: bool,
    /// Emulated state is newer than the hardware copy.
    pub dirty: bool,
    /// The guest TLB must be flushed before the next entry.
    pub flush_tlb: bool,
}

impl Default for EmulatedCpuState {
    fn default() -> Self {
        let data = SegmentCache::real_mode(0, 0x93);
        let mut segments = [data; 6];
        segments[SegReg::Cs as usize] = SegmentCache::real_mode(0, 0x9b);
        Self {
            gprs: [0; 16],
            rip: 0,
            rflags: Rflags::default(),
            segments,
            ldtr: SegmentCache {
                access: 0x82,
                limit: 0xffff,
                ..SegmentCache::default()
            },
            tr: SegmentCache {
                access: 0x8b,
                limit: 0xffff,
                ..SegmentCache::default()
            },
            gdtr: DescriptorTableReg::default(),
            idtr: DescriptorTableReg {
                base: 0,
                limit: 0x3ff,
            },
            control: ControlRegs {
                cr0: CR0_ET,
                ..ControlRegs::default()
            },
            efer: 0,
            dr: [0, 0, 0, 0, 0, 0, 0xffff_0ff0, 0x400],
            xcr0: 1,
            xsave: vec![0; XSAVE_AREA_SIZE],
            pdptes: [0; 4],
            msrs: MsrStore::default(),
            tsc_offset: 0,
            injected: None,
            deferred: None,
            interruptibility: Interruptibility::empty(),
            halted: false,
            triple_fault: false,
            dirty: false,
            flush_tlb: false,
        }
    }
}

impl EmulatedCpuState {
    #[inline]
    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.gprs[reg as usize]
    }

    #[inline]
    pub fn set_gpr(&mut self, reg: Gpr, val: u64) {
        self.gprs[reg as usize] = val;
    }

    /// Register `index` (0..=15) read at `size` bytes.
    pub fn read_gpr(&self, index: u8, size: u8) -> u64 {
        let val = self.gprs[usize::from(index & 15)];
        match size {
            1 => val & 0xff,
            2 => val & 0xffff,
            4 => val & 0xffff_ffff,
            _ => val,
        }
    }

    /// Write register `index` at `size` bytes: 32-bit writes zero-extend,
    /// 8- and 16-bit writes merge into the old value.
    pub fn write_gpr(&mut self, index: u8, size: u8, val: u64) {
        let slot = &mut self.gprs[usize::from(index & 15)];
        *slot = match size {
            1 => (*slot & !0xff) | (val & 0xff),
            2 => (*slot & !0xffff) | (val & 0xffff),
            4 => val & 0xffff_ffff,
            _ => val,
        };
    }

    /// AH, CH, DH or BH.
    pub fn read_high_byte(&self, index: u8) -> u64 {
        (self.gprs[usize::from(index & 3)] >> 8) & 0xff
    }

    pub fn write_high_byte(&mut self, index: u8, val: u64) {
        let slot = &mut self.gprs[usize::from(index & 3)];
        *slot = (*slot & !0xff00) | ((val & 0xff) << 8);
    }

    pub fn gprs(&self) -> &[u64; 16] {
        &self.gprs
    }

    pub fn gprs_mut(&mut self) -> &mut [u64; 16] {
        &mut self.gprs
    }

    #[inline]
    pub fn segment(&self, seg: SegReg) -> &SegmentCache {
        &self.segments[seg as usize]
    }

    #[inline]
    pub fn segment_mut(&mut self, seg: SegReg) -> &mut SegmentCache {
        &mut self.segments[seg as usize]
    }

    pub fn set_segment(&mut self, seg: SegReg, cache: SegmentCache) {
        self.segments[seg as usize] = cache;
    }

    /// Read a decoded register operand at `size` bytes.
    pub fn read_register(&self, reg: Register, size: u8) -> u64 {
        match reg {
            Register::Gpr(i) => self.read_gpr(i, size),
            Register::HighByte(i) => self.read_high_byte(i),
            Register::Segment(seg) => u64::from(self.segment(seg).selector),
            Register::Control(n) => match n {
                0 => self.control.cr0,
                2 => self.control.cr2,
                3 => self.control.cr3,
                4 => self.control.cr4,
                8 => self.control.cr8,
                _ => 0,
            },
            Register::Debug(n) => self.dr[usize::from(n & 7)],
        }
    }

    /// Write a general-purpose register operand. Other register classes have
    /// dedicated load paths.
    pub fn write_register(&mut self, reg: Register, size: u8, val: u64) -> Result<(), Exception> {
        match reg {
            Register::Gpr(i) => self.write_gpr(i, size, val),
            Register::HighByte(i) => self.write_high_byte(i, val),
            _ => return Err(Exception::InvalidOpcode),
        }
        Ok(())
    }

    pub fn protected_mode(&self) -> bool {
        self.control.cr0 & CR0_PE != 0
    }

    pub fn paging_enabled(&self) -> bool {
        self.control.cr0 & CR0_PG != 0
    }

    pub fn long_mode_active(&self) -> bool {
        self.efer & EFER_LMA != 0
    }

    /// Decoder mode implied by CR0.PE, RFLAGS.VM, EFER.LMA and the CS cache.
    pub fn mode(&self) -> CpuMode {
        if !self.protected_mode() {
            CpuMode::Real
        } else if self.rflags.vm() {
            CpuMode::Virtual8086
        } else if self.long_mode_active() && self.segment(SegReg::Cs).long() {
            CpuMode::Long64
        } else {
            CpuMode::Protected {
                cs_db: self.segment(SegReg::Cs).db(),
            }
        }
    }

    /// Current privilege level. VMX defines it as SS.DPL.
    pub fn cpl(&self) -> u8 {
        match self.mode() {
            CpuMode::Real => 0,
            CpuMode::Virtual8086 => 3,
            _ => self.segment(SegReg::Ss).dpl(),
        }
    }

    pub fn paging_regs(&self) -> PagingRegs {
        PagingRegs {
            cr0: self.control.cr0,
            cr3: self.control.cr3,
            cr4: self.control.cr4,
            efer: self.efer,
        }
    }

    /// Segment base + offset. ES/CS/SS/DS bases are ignored in 64-bit mode;
    /// outside it the sum wraps at 4GB.
    pub fn linear_address(&self, seg: SegReg, offset: u64) -> u64 {
        if self.mode().is_long() {
            match seg {
                SegReg::Fs | SegReg::Gs => offset.wrapping_add(self.segment(seg).base),
                _ => offset,
            }
        } else {
            offset.wrapping_add(self.segment(seg).base) & 0xffff_ffff
        }
    }

    /// Stack pointer width: 8 in 64-bit mode, else from SS.B.
    pub fn stack_size(&self) -> u8 {
        match self.mode() {
            CpuMode::Long64 => 8,
            CpuMode::Protected { .. } if self.segment(SegReg::Ss).db() => 4,
            _ => 2,
        }
    }

    /// Queue `exception` for injection on the next VM entry.
    ///
    /// A #PF also loads CR2. If the slot still holds an event, the two
    /// combine the way the processor combines a fault raised while
    /// delivering an earlier event:
    /// - hardware exceptions follow the benign/contributory/page-fault
    ///   table, escalating to #DF or to a triple fault;
    /// - an external interrupt or NMI moves to [`Self::deferred`];
    /// - a software interrupt or exception is dropped, since RIP still
    ///   points at the instruction that raises it again.
    pub fn raise(&mut self, exception: Exception) {
        if let Exception::PageFault { addr, .. } = exception {
            self.control.cr2 = addr;
        }
        self.dirty = true;
        let mut next = PendingEvent::exception(exception);
        match self.injected.take() {
            None => {}
            Some(prev) => match prev.kind {
                EventType::HardwareException => {
                    let second = FaultClass::of_vector(exception.vector());
                    match Escalation::of(FaultClass::of_vector(prev.vector), second) {
                        Escalation::Serial => {}
                        Escalation::DoubleFault => {
                            debug!(first = prev.vector, "escalating to #DF");
                            next = PendingEvent::exception(Exception::DoubleFault);
                        }
                        Escalation::TripleFault => {
                            warn!(second = exception.vector(), "fault while delivering #DF");
                            self.triple_fault = true;
                            return;
                        }
                    }
                }
                EventType::ExternalInterrupt | EventType::Nmi => {
                    debug!(vector = prev.vector, kind = ?prev.kind, "deferring event");
                    self.deferred = Some(prev);
                }
                EventType::SoftwareInterrupt
                | EventType::PrivilegedSoftwareException
                | EventType::SoftwareException => {}
            },
        }
        self.injected = Some(next);
    }
}
