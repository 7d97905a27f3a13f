use std::sync::{Arc, Mutex};

use hvx::cpu::descriptors::SegmentDescriptor;
use hvx::cpu::state::{CR0_ET, CR0_PE};
use hvx::cpu::{emulate_one, EmulatedCpuState, Exception, Executed, Gpr, Rflags, SegmentCache};
use hvx::mmu::{
    translate, AccessType, GuestPhysMemory, PagingRegs, TranslateFault, CR0_PG, CR0_WP,
    MMU_PAGE_PT, MMU_PAGE_WT, PTE_P, PTE_RW,
};
use hvx::vcpu::cpuid::bits::{LEAF1_ECX_HYPERVISOR, LEAF1_ECX_SSE3, LEAF1_ECX_VMX, LEAF1_EDX_FPU};
use hvx::vcpu::mock::{MockExit, MockHandle, MockPlatform};
use hvx::vcpu::{task_switch, CpuidResult, ExitReason, HvReg, TaskSwitchReason, TssImage};
use hvx::x86::{decode, Command, CpuMode, MemoryOperand, OperandKind, Register, SegReg};
use hvx::{Vcpu, VcpuConfig, VcpuExit};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn flat32(cpu: &mut EmulatedCpuState) {
    cpu.control.cr0 |= CR0_PE;
    let flat = |selector: u16, access: u8| SegmentCache {
        selector,
        base: 0,
        limit: 0xffff_ffff,
        access,
        flags: 0xc,
        unusable: false,
    };
    cpu.set_segment(SegReg::Cs, flat(0x08, 0x9b));
    for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
        cpu.set_segment(seg, flat(0x10, 0x93));
    }
}

#[test]
fn decode_and_run_mov_from_frame() {
    init_tracing();
    let bytes = [0x8b, 0x45, 0xfc];
    let inst = decode(&bytes, CpuMode::Protected { cs_db: true }).unwrap();
    assert_eq!(inst.cmd, Command::Mov);
    assert_eq!(inst.len, 3);
    assert_eq!(inst.operands[0].kind, OperandKind::Register(Register::Gpr(0)));
    let OperandKind::Memory(src) = inst.operands[1].kind else {
        panic!("expected memory source, got {:?}", inst.operands[1].kind);
    };
    assert_eq!(
        src,
        MemoryOperand {
            segment: SegReg::Ss,
            base: Some(5),
            index: None,
            scale: 1,
            displacement: -4,
            rip_relative: false,
        }
    );

    let mut platform = MockPlatform::new(0x10000);
    platform.load(0x1000, &bytes);
    platform.write_u32(0x7ffc, 0xcafe_f00d);
    let mut cpu = EmulatedCpuState::default();
    flat32(&mut cpu);
    cpu.rip = 0x1000;
    cpu.set_gpr(Gpr::Rbp, 0x8000);

    assert_eq!(emulate_one(&mut cpu, &mut platform).unwrap(), Executed::Retired);
    assert_eq!(cpu.gpr(Gpr::Rax), 0xcafe_f00d);
    assert_eq!(cpu.rip, 0x1003);
}

#[test]
fn add_al_ff_sets_carry_and_zero() {
    let mut platform = MockPlatform::new(0x10000);
    platform.load(0x1000, &[0x04, 0xff]);
    let mut cpu = EmulatedCpuState::default();
    cpu.rip = 0x1000;
    cpu.set_gpr(Gpr::Rax, 1);

    assert_eq!(emulate_one(&mut cpu, &mut platform).unwrap(), Executed::Retired);
    assert_eq!(cpu.gpr(Gpr::Rax) & 0xff, 0);
    let flags = cpu.rflags.materialize();
    assert_eq!(flags & 1, 1, "CF");
    assert_ne!(flags & (1 << 6), 0, "ZF");
    assert_eq!(flags & (1 << 11), 0, "OF");
    assert_eq!(flags & (1 << 7), 0, "SF");
}

fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    u64::from(limit & 0xffff)
        | (u64::from(base & 0xff_ffff) << 16)
        | (u64::from(access) << 40)
        | (u64::from((limit >> 16) & 0xf) << 48)
        | (u64::from(flags & 0xf) << 52)
        | (u64::from(base >> 24) << 56)
}

#[test]
fn task_switch_call_between_tss32() {
    init_tracing();
    const S1: u16 = 0x18;
    const S2: u16 = 0x20;
    let mut mem = MockPlatform::new(0x10000);
    let gdt = [
        0,
        descriptor(0, 0xfffff, 0x9b, 0xc),
        descriptor(0, 0xfffff, 0x93, 0xc),
        descriptor(0x2000, 0x67, 0x8b, 0),
        descriptor(0x3000, 0x67, 0x89, 0),
    ];
    for (i, &d) in gdt.iter().enumerate() {
        mem.write_u64(0x500 + 8 * i as u64, d);
    }
    let image = TssImage {
        eip: 0x9000,
        eflags: 0x202,
        eax: 1,
        ecx: 2,
        edx: 3,
        ebx: 4,
        esp: 0x8800,
        ebp: 0x8900,
        esi: 6,
        edi: 7,
        cs: 0x08,
        ss: 0x10,
        ds: 0x10,
        es: 0x10,
        ..TssImage::default()
    };
    mem.load(0x3000, bytemuck::bytes_of(&image));

    let mut cpu = EmulatedCpuState::default();
    flat32(&mut cpu);
    cpu.gdtr.base = 0x500;
    cpu.gdtr.limit = 0x27;
    cpu.tr = SegmentDescriptor::from_raw(gdt[3]).to_cache(S1);
    cpu.rip = 0x4444;
    cpu.set_gpr(Gpr::Rsp, 0x6ff0);

    task_switch(&mut cpu, &mut mem, S2, TaskSwitchReason::Call, None).unwrap();

    assert_eq!(mem.read_u32(0x2000 + 0x20), 0x4444);
    assert_eq!(mem.read_u32(0x2000 + 0x38), 0x6ff0);
    assert!(SegmentDescriptor::from_raw(mem.read_u64(0x500 + u64::from(S2))).is_busy());

    assert_eq!(cpu.rip, 0x9000);
    let regs = [Gpr::Rax, Gpr::Rcx, Gpr::Rdx, Gpr::Rbx, Gpr::Rsp, Gpr::Rbp, Gpr::Rsi, Gpr::Rdi];
    let expected = [1, 2, 3, 4, 0x8800, 0x8900, 6, 7];
    for (reg, want) in regs.into_iter().zip(expected) {
        assert_eq!(cpu.gpr(reg), want, "{reg:?}");
    }
    assert!(cpu.rflags.if_flag());
    assert_eq!(cpu.tr.selector, S2);
}

#[test]
fn write_to_read_only_page_faults() {
    let mut mem = MockPlatform::new(0x10000);
    // Page directory at 0x1000, one page table at 0x2000.
    mem.write_u32(0x1000, 0x2000 | (PTE_P | PTE_RW) as u32);
    mem.write_u32(0x2000 + 3 * 4, 0x3000 | PTE_P as u32);
    mem.write_u32(0x2000 + 5 * 4, 0x5000 | PTE_P as u32);
    let regs = PagingRegs {
        cr0: CR0_PE | CR0_PG | CR0_WP | CR0_ET,
        cr3: 0x1000,
        cr4: 0,
        efer: 0,
    };

    assert_eq!(translate(&mut mem, &regs, 0x5010, AccessType::Read, 0), Ok(0x5010));
    let err = translate(&mut mem, &regs, 0x5010, AccessType::Write, 0).unwrap_err();
    let TranslateFault::PageFault { addr, error_code } = err else {
        panic!("expected #PF, got {err:?}");
    };
    assert_eq!(addr, 0x5010);
    assert_eq!(error_code.bits(), MMU_PAGE_PT | MMU_PAGE_WT);

    // The same access from the emulator queues #PF and leaves RIP alone.
    mem.load(0x3000, &[0x88, 0x03]);
    let mut cpu = EmulatedCpuState::default();
    flat32(&mut cpu);
    cpu.control.cr0 = regs.cr0;
    cpu.control.cr3 = regs.cr3;
    cpu.rip = 0x3000;
    cpu.set_gpr(Gpr::Rbx, 0x5010);

    let executed = emulate_one(&mut cpu, &mut mem).unwrap();
    let Executed::Faulted(Exception::PageFault { addr, code }) = executed else {
        panic!("expected page fault, got {executed:?}");
    };
    assert_eq!(addr, 0x5010);
    assert_ne!(code & MMU_PAGE_WT, 0);
    assert_eq!(cpu.control.cr2, 0x5010);
    assert_eq!(cpu.rip, 0x3000);
    assert_eq!(cpu.injected.map(|e| e.vector), Some(14));
}

#[test]
fn cpuid_exit_filters_and_skips_the_decoder() {
    init_tracing();
    let mut handle = MockHandle::script([
        MockExit::new(ExitReason::CPUID, 2)
            .reg(HvReg::Gpr(0), 1)
            .reg(HvReg::Rip, 0x7c00),
        MockExit::new(ExitReason::EXTERNAL_INTERRUPT, 0),
    ]);
    handle.cpuid.insert(
        (1, 0),
        CpuidResult {
            eax: 0x000a_0655,
            ebx: 0,
            ecx: LEAF1_ECX_SSE3 | LEAF1_ECX_VMX,
            edx: LEAF1_EDX_FPU,
        },
    );
    let platform = Arc::new(Mutex::new(MockPlatform::new(0x10000)));
    let mut vcpu = Vcpu::new(handle, Arc::clone(&platform), VcpuConfig::default()).unwrap();
    vcpu.cpu_mut().rflags = Rflags::from_raw(0x2);

    assert_eq!(vcpu.exec().unwrap(), VcpuExit::Interrupted);

    let handle = vcpu.handle();
    assert_eq!(handle.reg(HvReg::Gpr(0)), 0x000a_0655);
    assert_eq!(handle.reg(HvReg::Gpr(1)), u64::from(LEAF1_ECX_SSE3 | LEAF1_ECX_HYPERVISOR));
    assert_eq!(handle.reg(HvReg::Gpr(2)), u64::from(LEAF1_EDX_FPU));
    assert_eq!(handle.reg(HvReg::Rip), 0x7c02);
    assert_eq!(platform.lock().unwrap().phys_reads, 0);
}
