use super::*;

use proptest::prelude::*;

struct TestMemory {
    data: Vec<u8>,
    reads: usize,
}

impl TestMemory {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            reads: 0,
        }
    }

    fn put32(&mut self, gpa: u64, value: u32) {
        let off = gpa as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put64(&mut self, gpa: u64, value: u64) {
        let off = gpa as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn get32(&self, gpa: u64) -> u32 {
        let off = gpa as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    fn get64(&self, gpa: u64) -> u64 {
        let off = gpa as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }
}

impl GuestPhysMemory for TestMemory {
    fn read_phys(&mut self, gpa: u64, dst: &mut [u8]) {
        self.reads += 1;
        let off = gpa as usize;
        dst.copy_from_slice(&self.data[off..off + dst.len()]);
    }

    fn write_phys(&mut self, gpa: u64, src: &[u8]) {
        let off = gpa as usize;
        self.data[off..off + src.len()].copy_from_slice(src);
    }
}

fn legacy_regs(cr3: u64) -> PagingRegs {
    PagingRegs {
        cr0: CR0_PG,
        cr3,
        cr4: 0,
        efer: 0,
    }
}

fn long_regs(cr3: u64) -> PagingRegs {
    PagingRegs {
        cr0: CR0_PG,
        cr3,
        cr4: CR4_PAE,
        efer: EFER_LME | EFER_LMA | EFER_NXE,
    }
}

/// Builds PML4 @0x1000, PDPT @0x2000, PD @0x3000, PT @0x4000 mapping
/// `gva` (which must sit in the first 2MB) to `frame`.
fn map_long_4k(mem: &mut TestMemory, gva: u64, frame: u64, leaf_flags: u64) {
    let rw_us = PTE_P | PTE_RW | PTE_US;
    mem.put64(0x1000, 0x2000 | rw_us);
    mem.put64(0x2000, 0x3000 | rw_us);
    mem.put64(0x3000, 0x4000 | rw_us);
    mem.put64(0x4000 + ((gva >> 12) & 0x1ff) * 8, frame | leaf_flags);
}

fn pf_code(fault: TranslateFault) -> u32 {
    match fault {
        TranslateFault::PageFault { error_code, .. } => error_code.bits(),
        other => panic!("expected #PF, got {other:?}"),
    }
}

#[test]
fn guest_memory_is_implemented_for_mut_refs() {
    fn first_byte<M: GuestPhysMemory>(mut mem: M) -> u8 {
        let mut b = [0u8; 1];
        mem.read_phys(0, &mut b);
        b[0]
    }

    let mut mem = TestMemory::new(0x10);
    mem.data[0] = 0xaa;
    assert_eq!(first_byte(&mut mem), 0xaa);
    assert_eq!(mem.reads, 1);
}

#[test]
fn no_paging_is_identity_and_touches_no_memory() {
    let mut mem = TestMemory::new(0x10);
    let regs = PagingRegs::default();
    let walk = walk(&mut mem, &regs, 0x1_2345_6789, AccessType::Write, 0).unwrap();
    assert_eq!(walk.gpa, 0x2345_6789);
    assert_eq!(walk.levels, 0);
    assert_eq!(mem.reads, 0);
}

#[test]
fn legacy32_4kb_sets_accessed_then_dirty() {
    let mut mem = TestMemory::new(0x10000);
    mem.put32(0x1000 + 4, 0x2000 | (PTE_P | PTE_RW | PTE_US) as u32);
    mem.put32(0x2000 + 3 * 4, 0x7000 | (PTE_P | PTE_RW | PTE_US) as u32);
    let regs = legacy_regs(0x1000);

    let gva = 0x0040_3abc;
    assert_eq!(
        translate(&mut mem, &regs, gva, AccessType::Read, 3),
        Ok(0x7abc)
    );
    let pde = u64::from(mem.get32(0x1004));
    let pte = u64::from(mem.get32(0x200c));
    assert_ne!(pde & PTE_A, 0);
    assert_ne!(pte & PTE_A, 0);
    assert_eq!(pte & PTE_D, 0);

    let walk = walk(&mut mem, &regs, gva, AccessType::Write, 3).unwrap();
    assert_eq!(walk.leaf_level, 1);
    assert_ne!(walk.pte[0] & PTE_D, 0);
    assert_ne!(u64::from(mem.get32(0x200c)) & PTE_D, 0);
    // Dirty is a leaf-only bit.
    assert_eq!(u64::from(mem.get32(0x1004)) & PTE_D, 0);
}

#[test]
fn legacy32_4mb_page_reassembles_pse36_bits() {
    let mut mem = TestMemory::new(0x4000);
    // PDE index 2, frame bits 31:22 = 0x0c0, bits 39:32 = 0x05 (PDE bits 20:13).
    let pde = 0x3000_0000u32 | (0x05 << 13) | (PTE_P | PTE_RW | PTE_PS) as u32;
    mem.put32(0x1000 + 2 * 4, pde);
    let mut regs = legacy_regs(0x1000);
    regs.cr4 = CR4_PSE;

    let walk = walk(&mut mem, &regs, 0x0081_2345, AccessType::Read, 0).unwrap();
    assert_eq!(walk.page_size, 0x40_0000);
    assert_eq!(walk.gpa, 0x05_3001_2345);
}

#[test]
fn legacy32_ignores_ps_without_pse() {
    let mut mem = TestMemory::new(0x10000);
    mem.put32(0x1000, 0x2000 | (PTE_P | PTE_RW | PTE_PS) as u32);
    mem.put32(0x2000 + 5 * 4, 0x9000 | PTE_P as u32);
    let regs = legacy_regs(0x1000);
    assert_eq!(
        translate(&mut mem, &regs, 0x5010, AccessType::Read, 0),
        Ok(0x9010)
    );
}

#[test]
fn pae_2mb_page() {
    let mut mem = TestMemory::new(0x10000);
    mem.put64(0x1000, 0x2000 | PTE_P);
    mem.put64(0x2000 + 8, 0x0060_0000 | PTE_P | PTE_RW | PTE_PS);
    let regs = PagingRegs {
        cr0: CR0_PG,
        cr3: 0x1000,
        cr4: CR4_PAE,
        efer: 0,
    };

    let walk = walk(&mut mem, &regs, 0x0023_4567, AccessType::Write, 0).unwrap();
    assert_eq!(walk.levels, 3);
    assert_eq!(walk.leaf_level, 2);
    assert_eq!(walk.gpa, 0x0063_4567);
    // PDPTEs have no accessed bit in PAE mode.
    assert_eq!(mem.get64(0x1000), 0x2000 | PTE_P);
}

#[test]
fn pae_pdpte_reserved_bits_fault_with_rsvd() {
    let mut mem = TestMemory::new(0x10000);
    mem.put64(0x1000, 0x2000 | PTE_P | PTE_RW);
    let regs = PagingRegs {
        cr0: CR0_PG,
        cr3: 0x1000,
        cr4: CR4_PAE,
        efer: 0,
    };
    let err = translate(&mut mem, &regs, 0x1000, AccessType::Read, 0).unwrap_err();
    assert_eq!(pf_code(err), MMU_PAGE_PT | MMU_PAGE_RSVD);
}

#[test]
fn long4_4kb_walk_records_every_level() {
    let mut mem = TestMemory::new(0x10000);
    map_long_4k(&mut mem, 0x5000, 0x8000, PTE_P | PTE_RW);
    let regs = long_regs(0x1000);

    let walk = walk(&mut mem, &regs, 0x5123, AccessType::Read, 0).unwrap();
    assert_eq!(walk.gpa, 0x8123);
    assert_eq!(walk.levels, 4);
    assert_eq!(walk.pte[3] & !PTE_A, 0x2000 | PTE_P | PTE_RW | PTE_US);
    assert_eq!(walk.pte[0] & !PTE_A, 0x8000 | PTE_P | PTE_RW);
    assert_eq!(walk.pte[4], 0);
    assert!(walk.writable);
    assert!(!walk.user);
}

#[test]
fn long4_1gb_and_2mb_pages() {
    let mut mem = TestMemory::new(0x10000);
    mem.put64(0x1000, 0x2000 | PTE_P | PTE_RW);
    // PDPTE 1: 1GB page at 4GB.
    mem.put64(0x2000 + 8, 0x1_0000_0000 | PTE_P | PTE_RW | PTE_PS);
    // PDPTE 0 -> PD, PDE 3: 2MB page at 0x0080_0000.
    mem.put64(0x2000, 0x3000 | PTE_P | PTE_RW);
    mem.put64(0x3000 + 3 * 8, 0x0080_0000 | PTE_P | PTE_PS);
    let regs = long_regs(0x1000);

    assert_eq!(
        translate(&mut mem, &regs, 0x4123_4567, AccessType::Read, 0),
        Ok(0x1_0123_4567)
    );
    assert_eq!(
        translate(&mut mem, &regs, 0x0071_0000, AccessType::Read, 0),
        Ok(0x0091_0000)
    );
}

#[test]
fn long4_misaligned_large_page_is_reserved() {
    let mut mem = TestMemory::new(0x10000);
    mem.put64(0x1000, 0x2000 | PTE_P | PTE_RW);
    mem.put64(0x2000, 0x3000 | PTE_P | PTE_RW);
    mem.put64(0x3000, 0x0010_0000 | PTE_P | PTE_PS);
    let regs = long_regs(0x1000);
    let err = translate(&mut mem, &regs, 0x10, AccessType::Read, 0).unwrap_err();
    assert_eq!(pf_code(err), MMU_PAGE_PT | MMU_PAGE_RSVD);
}

#[test]
fn long4_rejects_non_canonical() {
    let mut mem = TestMemory::new(0x10);
    let regs = long_regs(0x1000);
    assert_eq!(
        translate(&mut mem, &regs, 0x0000_8000_0000_0000, AccessType::Read, 0),
        Err(TranslateFault::NonCanonical(0x0000_8000_0000_0000))
    );
    assert_eq!(mem.reads, 0);
}

#[test]
fn not_present_fault_clears_present_bit() {
    let mut mem = TestMemory::new(0x10000);
    map_long_4k(&mut mem, 0x5000, 0x8000, 0);
    let regs = long_regs(0x1000);
    assert_eq!(
        translate(&mut mem, &regs, 0x5000, AccessType::Write, 3),
        Err(TranslateFault::PageFault {
            addr: 0x5000,
            error_code: PageFaultErrorCode::WRITE | PageFaultErrorCode::USER,
        })
    );
}

#[test]
fn write_to_read_only_page_reports_present_and_write() {
    let mut mem = TestMemory::new(0x10000);
    map_long_4k(&mut mem, 0x5000, 0x8000, PTE_P | PTE_US);
    let mut regs = long_regs(0x1000);

    // Supervisor writes ignore R/W while CR0.WP is clear.
    assert_eq!(
        translate(&mut mem, &regs, 0x5000, AccessType::Write, 0),
        Ok(0x8000)
    );

    regs.cr0 |= CR0_WP;
    let err = translate(&mut mem, &regs, 0x5008, AccessType::Write, 0).unwrap_err();
    assert_eq!(err, TranslateFault::PageFault {
        addr: 0x5008,
        error_code: PageFaultErrorCode::PRESENT | PageFaultErrorCode::WRITE,
    });
    assert_eq!(pf_code(err), MMU_PAGE_PT | MMU_PAGE_WT);

    regs.cr0 &= !CR0_WP;
    let err = translate(&mut mem, &regs, 0x5008, AccessType::Write, 3).unwrap_err();
    assert_eq!(pf_code(err), MMU_PAGE_PT | MMU_PAGE_WT | MMU_PAGE_US);
}

#[test]
fn user_access_to_supervisor_page_faults() {
    let mut mem = TestMemory::new(0x10000);
    map_long_4k(&mut mem, 0x5000, 0x8000, PTE_P | PTE_RW);
    let regs = long_regs(0x1000);
    let err = translate(&mut mem, &regs, 0x5000, AccessType::Read, 3).unwrap_err();
    assert_eq!(pf_code(err), MMU_PAGE_PT | MMU_PAGE_US);
}

#[test]
fn nx_blocks_fetch_only() {
    let mut mem = TestMemory::new(0x10000);
    map_long_4k(&mut mem, 0x5000, 0x8000, PTE_P | PTE_RW | PTE_NX);
    let mut regs = long_regs(0x1000);

    assert!(translate(&mut mem, &regs, 0x5000, AccessType::Read, 0).is_ok());
    let err = translate(&mut mem, &regs, 0x5000, AccessType::Execute, 0).unwrap_err();
    assert_eq!(pf_code(err), MMU_PAGE_PT | MMU_PAGE_NX);

    // Without EFER.NXE the bit is reserved.
    regs.efer &= !EFER_NXE;
    let err = translate(&mut mem, &regs, 0x5000, AccessType::Read, 0).unwrap_err();
    assert_eq!(pf_code(err), MMU_PAGE_PT | MMU_PAGE_RSVD);
}

#[test]
fn linear_access_splits_at_page_boundary() {
    let mut mem = TestMemory::new(0x20000);
    map_long_4k(&mut mem, 0x5000, 0x9000, PTE_P | PTE_RW);
    map_long_4k(&mut mem, 0x6000, 0xc000, PTE_P | PTE_RW);
    let regs = long_regs(0x1000);

    write_linear(&mut mem, &regs, 0x5ffe, &[1, 2, 3, 4], 0).unwrap();
    assert_eq!(&mem.data[0x9ffe..0xa000], &[1, 2]);
    assert_eq!(&mem.data[0xc000..0xc002], &[3, 4]);

    let mut buf = [0u8; 4];
    read_linear(&mut mem, &regs, 0x5ffe, &mut buf, AccessType::Read, 0).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);
}

#[test]
fn page_crossing_write_is_all_or_nothing() {
    let mut mem = TestMemory::new(0x20000);
    map_long_4k(&mut mem, 0x5000, 0x9000, PTE_P | PTE_RW);
    let regs = long_regs(0x1000);

    let err = write_linear(&mut mem, &regs, 0x5ffe, &[0xaa; 4], 0).unwrap_err();
    assert_eq!(
        err,
        TranslateFault::PageFault {
            addr: 0x6000,
            error_code: PageFaultErrorCode::WRITE,
        }
    );
    assert_eq!(&mem.data[0x9ffe..0xa000], &[0, 0]);
}

proptest! {
    #[test]
    fn long4_4kb_offsets_are_preserved(page in 0u64..0x200, offset in 0u64..0x1000) {
        let mut mem = TestMemory::new(0x1000 * 8);
        let gva = page << 12 | offset;
        map_long_4k(&mut mem, gva, 0x7000, PTE_P | PTE_RW);
        let regs = long_regs(0x1000);
        prop_assert_eq!(translate(&mut mem, &regs, gva, AccessType::Read, 0), Ok(0x7000 | offset));
    }

    #[test]
    fn canonical_check_matches_sign_extension(addr in any::<u64>()) {
        let sign_extended = ((addr << 16) as i64 >> 16) as u64;
        prop_assert_eq!(is_canonical_48(addr), sign_extended == addr);
    }
}
