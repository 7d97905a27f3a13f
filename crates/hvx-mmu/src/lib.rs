//! x86/x86-64 guest page-table walker.
//!
//! The hardware owns the real TLB; this walker only runs while an exiting
//! instruction is being emulated, so every translation walks the guest tables
//! from CR3 and every level is one guest-physical read. Supported modes:
//! - No paging (identity mapping)
//! - 32-bit paging (4KB / 4MB pages, PSE-36 high address bits)
//! - PAE paging (4KB / 2MB pages)
//! - 4-level long mode paging (4KB / 2MB / 1GB pages) with canonical checks

mod linear;

pub use linear::{read_linear, write_linear};

use bitflags::bitflags;
use thiserror::Error;
use tracing::trace;

/// Guest-physical address space as seen by the walker and the emulator.
///
/// Reads and writes may land in RAM, ROM, or MMIO device dispatch; callers must
/// not assume the bytes are host-addressable.
pub trait GuestPhysMemory {
    fn read_phys(&mut self, gpa: u64, dst: &mut [u8]);
    fn write_phys(&mut self, gpa: u64, src: &[u8]);

    #[inline]
    fn read_u16(&mut self, gpa: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read_phys(gpa, &mut buf);
        u16::from_le_bytes(buf)
    }

    #[inline]
    fn read_u32(&mut self, gpa: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_phys(gpa, &mut buf);
        u32::from_le_bytes(buf)
    }

    #[inline]
    fn read_u64(&mut self, gpa: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_phys(gpa, &mut buf);
        u64::from_le_bytes(buf)
    }

    #[inline]
    fn write_u32(&mut self, gpa: u64, value: u32) {
        self.write_phys(gpa, &value.to_le_bytes());
    }

    #[inline]
    fn write_u64(&mut self, gpa: u64, value: u64) {
        self.write_phys(gpa, &value.to_le_bytes());
    }
}

impl<T: GuestPhysMemory + ?Sized> GuestPhysMemory for &mut T {
    #[inline]
    fn read_phys(&mut self, gpa: u64, dst: &mut [u8]) {
        <T as GuestPhysMemory>::read_phys(&mut **self, gpa, dst)
    }

    #[inline]
    fn write_phys(&mut self, gpa: u64, src: &[u8]) {
        <T as GuestPhysMemory>::write_phys(&mut **self, gpa, src)
    }
}

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    pub fn is_execute(self) -> bool {
        matches!(self, AccessType::Execute)
    }
}

bitflags! {
    /// #PF error code as pushed by the processor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFaultErrorCode: u32 {
        /// Protection violation on a present translation (clear: not present).
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED = 1 << 3;
        /// Instruction fetch.
        const FETCH = 1 << 4;
    }
}

pub const MMU_PAGE_PT: u32 = PageFaultErrorCode::PRESENT.bits();
pub const MMU_PAGE_WT: u32 = PageFaultErrorCode::WRITE.bits();
pub const MMU_PAGE_US: u32 = PageFaultErrorCode::USER.bits();
pub const MMU_PAGE_RSVD: u32 = PageFaultErrorCode::RESERVED.bits();
pub const MMU_PAGE_NX: u32 = PageFaultErrorCode::FETCH.bits();

/// A translation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateFault {
    /// #PF; `addr` is the value for CR2.
    #[error("page fault at {addr:#x} ({error_code:?})")]
    PageFault {
        addr: u64,
        error_code: PageFaultErrorCode,
    },
    /// Non-canonical linear address in long mode (raises #GP(0)).
    #[error("non-canonical linear address {0:#x}")]
    NonCanonical(u64),
}

impl TranslateFault {
    fn page_fault(addr: u64, error_code: PageFaultErrorCode) -> Self {
        Self::PageFault { addr, error_code }
    }
}

/// The control-register state that selects and parameterises the walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PagingRegs {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    Disabled,
    Legacy32,
    Pae,
    Long4,
}

impl PagingRegs {
    pub fn mode(&self) -> PagingMode {
        if self.cr0 & CR0_PG == 0 {
            PagingMode::Disabled
        } else if self.efer & (EFER_LMA | EFER_LME) != 0 && self.cr4 & CR4_PAE != 0 {
            PagingMode::Long4
        } else if self.cr4 & CR4_PAE != 0 {
            PagingMode::Pae
        } else {
            PagingMode::Legacy32
        }
    }

    #[inline]
    fn wp(&self) -> bool {
        self.cr0 & CR0_WP != 0
    }

    #[inline]
    fn pse(&self) -> bool {
        self.cr4 & CR4_PSE != 0
    }

    #[inline]
    fn nxe(&self) -> bool {
        self.efer & EFER_NXE != 0
    }
}

/// Snapshot of one completed walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWalk {
    /// Entry read at each level, indexed by `level - 1` (so `pte[0]` is the
    /// 4KB PTE). Levels the walk never reached stay zero.
    pub pte: [u64; 5],
    /// Number of levels of the active paging mode.
    pub levels: u8,
    /// Level at which the walk terminated (1 for 4KB pages).
    pub leaf_level: u8,
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
    pub gpa: u64,
    pub page_size: u64,
}

impl PageWalk {
    fn identity(gva: u64) -> Self {
        Self {
            pte: [0; 5],
            levels: 0,
            leaf_level: 0,
            writable: true,
            user: true,
            executable: true,
            gpa: gva,
            page_size: PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WalkParams {
    levels: u8,
    entry_bytes: u64,
    index_bits: u32,
}

impl WalkParams {
    fn for_mode(mode: PagingMode) -> Self {
        match mode {
            PagingMode::Legacy32 => Self {
                levels: 2,
                entry_bytes: 4,
                index_bits: 10,
            },
            PagingMode::Pae => Self {
                levels: 3,
                entry_bytes: 8,
                index_bits: 9,
            },
            PagingMode::Disabled | PagingMode::Long4 => Self {
                levels: 4,
                entry_bytes: 8,
                index_bits: 9,
            },
        }
    }

    #[inline]
    fn index(&self, gva: u64, level: u8) -> u64 {
        let shift = self.index_bits * u32::from(level - 1) + 12;
        (gva >> shift) & ((1u64 << self.index_bits) - 1)
    }
}

/// Translate `gva` and return the full walk.
///
/// `cpl` is the current privilege level; only CPL 3 counts as a user access.
pub fn walk(
    bus: &mut impl GuestPhysMemory,
    regs: &PagingRegs,
    gva: u64,
    access: AccessType,
    cpl: u8,
) -> Result<PageWalk, TranslateFault> {
    let mode = regs.mode();
    let gva = match mode {
        PagingMode::Disabled => return Ok(PageWalk::identity(gva & 0xffff_ffff)),
        PagingMode::Legacy32 | PagingMode::Pae => gva & 0xffff_ffff,
        PagingMode::Long4 => {
            if !is_canonical_48(gva) {
                return Err(TranslateFault::NonCanonical(gva));
            }
            gva
        }
    };

    let is_user = cpl == 3;
    let params = WalkParams::for_mode(mode);
    let nxe = regs.nxe();

    let mut walk = PageWalk {
        pte: [0; 5],
        levels: params.levels,
        leaf_level: 0,
        writable: true,
        user: true,
        executable: true,
        gpa: 0,
        page_size: PAGE_SIZE,
    };

    let mut table = match mode {
        PagingMode::Legacy32 => regs.cr3 & 0xffff_f000,
        PagingMode::Pae => regs.cr3 & 0xffff_ffe0,
        _ => regs.cr3 & PHYS_ADDR_MASK,
    };

    let not_present = fault_code(false, access, is_user, false);
    let reserved = fault_code(true, access, is_user, true);

    let mut level = params.levels;
    loop {
        let entry_addr = table + params.index(gva, level) * params.entry_bytes;
        let mut entry = if params.entry_bytes == 4 {
            u64::from(bus.read_u32(entry_addr))
        } else {
            bus.read_u64(entry_addr)
        };
        walk.pte[usize::from(level - 1)] = entry;

        if entry & PTE_P == 0 {
            trace!(gva, level, "page walk hit non-present entry");
            return Err(TranslateFault::page_fault(gva, not_present));
        }

        let kind = EntryKind::classify(mode, level);
        let large = entry & PTE_PS != 0 && kind.large_page_allowed(regs);
        if has_reserved_bits(regs, kind, entry, large) {
            return Err(TranslateFault::page_fault(gva, reserved));
        }

        // PAE PDPTEs carry neither U/S, R/W nor an accessed bit.
        if kind != EntryKind::PdptePae {
            walk.user &= entry & PTE_US != 0;
            walk.writable &= entry & PTE_RW != 0;
            if entry & PTE_A == 0 {
                entry |= PTE_A;
                write_entry(bus, entry_addr, entry, params.entry_bytes);
            }
        }
        if nxe && entry & PTE_NX != 0 {
            walk.executable = false;
        }

        if large || level == 1 {
            walk.leaf_level = level;
            check_perms(regs, &walk, gva, access, is_user)?;

            if access.is_write() && entry & PTE_D == 0 {
                entry |= PTE_D;
                write_entry(bus, entry_addr, entry, params.entry_bytes);
            }
            walk.pte[usize::from(level - 1)] = entry;

            let (base, size) = leaf_frame(mode, level, entry);
            walk.page_size = size;
            walk.gpa = base | (gva & (size - 1));
            return Ok(walk);
        }

        table = match mode {
            PagingMode::Legacy32 => entry & 0xffff_f000,
            _ => entry & PHYS_ADDR_MASK,
        };
        level -= 1;
    }
}

/// Translate `gva` to a guest-physical address.
pub fn translate(
    bus: &mut impl GuestPhysMemory,
    regs: &PagingRegs,
    gva: u64,
    access: AccessType,
    cpl: u8,
) -> Result<u64, TranslateFault> {
    walk(bus, regs, gva, access, cpl).map(|w| w.gpa)
}

fn check_perms(
    regs: &PagingRegs,
    walk: &PageWalk,
    gva: u64,
    access: AccessType,
    is_user: bool,
) -> Result<(), TranslateFault> {
    let denied = (is_user && !walk.user)
        || (access.is_write() && !walk.writable && (is_user || regs.wp()))
        || (access.is_execute() && !walk.executable);
    if denied {
        trace!(gva, ?access, is_user, "page walk permission fault");
        return Err(TranslateFault::page_fault(
            gva,
            fault_code(true, access, is_user, false),
        ));
    }
    Ok(())
}

fn write_entry(bus: &mut impl GuestPhysMemory, addr: u64, entry: u64, bytes: u64) {
    if bytes == 4 {
        bus.write_u32(addr, entry as u32);
    } else {
        bus.write_u64(addr, entry);
    }
}

fn leaf_frame(mode: PagingMode, level: u8, entry: u64) -> (u64, u64) {
    match (mode, level) {
        (PagingMode::Legacy32, 2) => (
            ((entry & 0x001f_e000) << 19) | (entry & 0xffc0_0000),
            PAGE_SIZE_4M,
        ),
        (PagingMode::Legacy32, _) => (entry & 0xffff_f000, PAGE_SIZE),
        (_, 3) => (entry & PHYS_ADDR_MASK & !(PAGE_SIZE_1G - 1), PAGE_SIZE_1G),
        (_, 2) => (entry & PHYS_ADDR_MASK & !(PAGE_SIZE_2M - 1), PAGE_SIZE_2M),
        _ => (entry & PHYS_ADDR_MASK, PAGE_SIZE),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Legacy32Pde,
    Legacy32Pte,
    PdptePae,
    Pml4e,
    Pdpte,
    Pde,
    Pte,
}

impl EntryKind {
    fn classify(mode: PagingMode, level: u8) -> Self {
        match (mode, level) {
            (PagingMode::Legacy32, 2) => Self::Legacy32Pde,
            (PagingMode::Legacy32, _) => Self::Legacy32Pte,
            (PagingMode::Pae, 3) => Self::PdptePae,
            (_, 4) => Self::Pml4e,
            (_, 3) => Self::Pdpte,
            (_, 2) => Self::Pde,
            _ => Self::Pte,
        }
    }

    fn large_page_allowed(self, regs: &PagingRegs) -> bool {
        match self {
            // 32-bit paging ignores PS unless CR4.PSE is set.
            Self::Legacy32Pde => regs.pse(),
            Self::Pdpte | Self::Pde => true,
            _ => false,
        }
    }
}

fn has_reserved_bits(regs: &PagingRegs, kind: EntryKind, entry: u64, large: bool) -> bool {
    match kind {
        EntryKind::Legacy32Pte => false,
        EntryKind::Legacy32Pde => large && entry & LEGACY32_4MB_RESERVED_MASK != 0,
        EntryKind::PdptePae => {
            // Bits 1,2,5..=8 are reserved and NX only exists with EFER.NXE.
            let mut allowed = PTE_P | (1 << 3) | (1 << 4) | (0x7 << 9) | PHYS_ADDR_MASK;
            if regs.nxe() {
                allowed |= PTE_NX;
            }
            entry & !allowed != 0
        }
        _ => {
            if !regs.nxe() && entry & PTE_NX != 0 {
                return true;
            }
            if kind == EntryKind::Pml4e && entry & PTE_PS != 0 {
                return true;
            }
            if large {
                // Frame bits below the page size, other than PAT (bit 12), must be clear.
                let size = if kind == EntryKind::Pdpte {
                    PAGE_SIZE_1G
                } else {
                    PAGE_SIZE_2M
                };
                return entry & PHYS_ADDR_MASK & (size - 1) & !(1 << 12) != 0;
            }
            false
        }
    }
}

#[inline]
fn fault_code(present: bool, access: AccessType, is_user: bool, rsvd: bool) -> PageFaultErrorCode {
    let mut code = PageFaultErrorCode::empty();
    code.set(PageFaultErrorCode::PRESENT, present);
    code.set(PageFaultErrorCode::WRITE, access.is_write());
    code.set(PageFaultErrorCode::USER, is_user);
    code.set(PageFaultErrorCode::RESERVED, rsvd);
    code.set(PageFaultErrorCode::FETCH, access.is_execute());
    code
}

#[inline]
pub fn is_canonical_48(vaddr: u64) -> bool {
    // Bits 47..=63 are either all clear or all set.
    (((vaddr >> 47).wrapping_add(1)) & 0x1fffe) == 0
}

pub const PAGE_SIZE: u64 = 0x1000;
const PAGE_SIZE_2M: u64 = 0x20_0000;
const PAGE_SIZE_4M: u64 = 0x40_0000;
const PAGE_SIZE_1G: u64 = 0x4000_0000;

pub const CR0_WP: u64 = 1 << 16;
pub const CR0_PG: u64 = 1 << 31;

pub const CR4_PSE: u64 = 1 << 4;
pub const CR4_PAE: u64 = 1 << 5;

pub const EFER_LME: u64 = 1 << 8;
pub const EFER_LMA: u64 = 1 << 10;
pub const EFER_NXE: u64 = 1 << 11;

pub const PTE_P: u64 = 1 << 0;
pub const PTE_RW: u64 = 1 << 1;
pub const PTE_US: u64 = 1 << 2;
pub const PTE_A: u64 = 1 << 5;
pub const PTE_D: u64 = 1 << 6;
pub const PTE_PS: u64 = 1 << 7;
pub const PTE_NX: u64 = 1 << 63;

const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

// Bit 21 of a 4MB PDE; bits 13..=20 carry PSE-36 address bits.
const LEGACY32_4MB_RESERVED_MASK: u64 = 0x0020_0000;

#[cfg(test)]
mod tests;
