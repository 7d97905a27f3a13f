use crate::{translate, AccessType, GuestPhysMemory, PagingRegs, TranslateFault, PAGE_SIZE};

/// Read `dst.len()` bytes of guest-linear memory, splitting at 4KB boundaries.
///
/// Every page is translated before any byte is copied, so a fault on the
/// second page leaves `dst` untouched.
pub fn read_linear(
    bus: &mut impl GuestPhysMemory,
    regs: &PagingRegs,
    gva: u64,
    dst: &mut [u8],
    access: AccessType,
    cpl: u8,
) -> Result<(), TranslateFault> {
    let mut done = 0;
    for (gpa, len) in translate_chunks(bus, regs, gva, dst.len(), access, cpl)? {
        bus.read_phys(gpa, &mut dst[done..done + len]);
        done += len;
    }
    Ok(())
}

/// Write `src` to guest-linear memory. All pages are translated first;
/// nothing is written if any of them faults.
pub fn write_linear(
    bus: &mut impl GuestPhysMemory,
    regs: &PagingRegs,
    gva: u64,
    src: &[u8],
    cpl: u8,
) -> Result<(), TranslateFault> {
    let mut done = 0;
    for (gpa, len) in translate_chunks(bus, regs, gva, src.len(), AccessType::Write, cpl)? {
        bus.write_phys(gpa, &src[done..done + len]);
        done += len;
    }
    Ok(())
}

fn translate_chunks(
    bus: &mut impl GuestPhysMemory,
    regs: &PagingRegs,
    gva: u64,
    len: usize,
    access: AccessType,
    cpl: u8,
) -> Result<Vec<(u64, usize)>, TranslateFault> {
    let mut chunks = Vec::with_capacity(2);
    let mut addr = gva;
    let mut remaining = len;
    while remaining > 0 {
        let in_page = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
        let take = remaining.min(in_page);
        chunks.push((translate(bus, regs, addr, access, cpl)?, take));
        addr = addr.wrapping_add(take as u64);
        remaining -= take;
    }
    Ok(chunks)
}
