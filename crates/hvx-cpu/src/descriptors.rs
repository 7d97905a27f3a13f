//! GDT/LDT descriptor access.

use hvx_mmu::{read_linear, write_linear, AccessType, GuestPhysMemory};

use crate::state::{EmulatedCpuState, SegmentCache};
use crate::Exception;

/// GDTR/IDTR contents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTableReg {
    pub base: u64,
    pub limit: u16,
}

pub const SEG_TYPE_TSS16_AVAILABLE: u8 = 0x1;
pub const SEG_TYPE_LDT: u8 = 0x2;
pub const SEG_TYPE_TSS16_BUSY: u8 = 0x3;
pub const SEG_TYPE_TSS32_AVAILABLE: u8 = 0x9;
pub const SEG_TYPE_TSS32_BUSY: u8 = 0xb;

/// Type bit that distinguishes a busy TSS from an available one.
const TSS_BUSY_BIT: u64 = 1 << 41;

/// An 8-byte legacy segment or system descriptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    raw: u64,
}

impl SegmentDescriptor {
    pub const fn from_raw(raw: u64) -> Self {
        Self { raw }
    }

    pub const fn raw(&self) -> u64 {
        self.raw
    }

    pub fn base(&self) -> u32 {
        (((self.raw >> 16) & 0x00ff_ffff) | (((self.raw >> 56) & 0xff) << 24)) as u32
    }

    /// Raw 20-bit limit field, before granularity scaling.
    pub fn raw_limit(&self) -> u32 {
        ((self.raw & 0xffff) | ((self.raw >> 32) & 0xf_0000)) as u32
    }

    /// Byte-granular limit.
    pub fn limit(&self) -> u32 {
        let limit = self.raw_limit();
        if self.granularity() {
            (limit << 12) | 0xfff
        } else {
            limit
        }
    }

    /// Type, S, DPL and P: descriptor byte 5.
    pub fn access(&self) -> u8 {
        (self.raw >> 40) as u8
    }

    /// AVL, L, D/B and G in the low nibble.
    pub fn flags(&self) -> u8 {
        ((self.raw >> 52) & 0xf) as u8
    }

    pub fn seg_type(&self) -> u8 {
        self.access() & 0xf
    }

    pub fn is_system(&self) -> bool {
        self.access() & 0x10 == 0
    }

    pub fn dpl(&self) -> u8 {
        (self.access() >> 5) & 3
    }

    pub fn is_present(&self) -> bool {
        self.access() & 0x80 != 0
    }

    pub fn granularity(&self) -> bool {
        self.flags() & 0x8 != 0
    }

    pub fn is_tss32(&self) -> bool {
        self.is_system()
            && matches!(
                self.seg_type(),
                SEG_TYPE_TSS32_AVAILABLE | SEG_TYPE_TSS32_BUSY
            )
    }

    pub fn is_tss16(&self) -> bool {
        self.is_system()
            && matches!(
                self.seg_type(),
                SEG_TYPE_TSS16_AVAILABLE | SEG_TYPE_TSS16_BUSY
            )
    }

    pub fn is_busy(&self) -> bool {
        self.raw & TSS_BUSY_BIT != 0
    }

    pub fn set_busy(&mut self, busy: bool) {
        if busy {
            self.raw |= TSS_BUSY_BIT;
        } else {
            self.raw &= !TSS_BUSY_BIT;
        }
    }

    pub fn to_cache(&self, selector: u16) -> SegmentCache {
        SegmentCache {
            selector,
            base: u64::from(self.base()),
            limit: self.limit(),
            access: self.access(),
            flags: self.flags(),
            unusable: false,
        }
    }
}

/// Linear address of the descriptor `selector` names, checked against the
/// GDT or LDT limit.
pub fn descriptor_address(cpu: &EmulatedCpuState, selector: u16) -> Result<u64, Exception> {
    let index = u64::from(selector & !7);
    let (base, limit) = if selector & 4 != 0 {
        if cpu.ldtr.unusable {
            return Err(Exception::GeneralProtection(u32::from(selector & !3)));
        }
        (cpu.ldtr.base, u64::from(cpu.ldtr.limit))
    } else {
        (cpu.gdtr.base, u64::from(cpu.gdtr.limit))
    };
    if index + 7 > limit {
        return Err(Exception::GeneralProtection(u32::from(selector & !3)));
    }
    Ok(base.wrapping_add(index))
}

/// Read a descriptor with supervisor privileges.
pub fn read_descriptor(
    cpu: &EmulatedCpuState,
    mem: &mut impl GuestPhysMemory,
    selector: u16,
) -> Result<SegmentDescriptor, Exception> {
    let addr = descriptor_address(cpu, selector)?;
    let mut bytes = [0u8; 8];
    read_linear(mem, &cpu.paging_regs(), addr, &mut bytes, AccessType::Read, 0)?;
    Ok(SegmentDescriptor::from_raw(u64::from_le_bytes(bytes)))
}

pub fn write_descriptor(
    cpu: &EmulatedCpuState,
    mem: &mut impl GuestPhysMemory,
    selector: u16,
    desc: SegmentDescriptor,
) -> Result<(), Exception> {
    let addr = descriptor_address(cpu, selector)?;
    write_linear(mem, &cpu.paging_regs(), addr, &desc.raw().to_le_bytes(), 0)?;
    Ok(())
}
