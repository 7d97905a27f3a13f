use super::*;

use std::collections::VecDeque;

use hvx_mmu::{GuestPhysMemory, CR0_PG, CR4_PSE, PTE_P, PTE_PS, PTE_RW, PTE_US};
use hvx_x86::{decode, Command, CpuMode, SegReg};

use crate::flags::{RFLAGS_DF, RFLAGS_IF};
use crate::state::CR0_PE;

const CODE: u64 = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct IoRecord {
    port: u16,
    direction: IoDirection,
    data: Vec<u8>,
}

struct TestPlatform {
    mem: Vec<u8>,
    io: Vec<IoRecord>,
    input: VecDeque<u8>,
    apic_base: u64,
    tpr: u8,
    tsc: u64,
    /// Guest-physical address of every read and write.
    touched: Vec<u64>,
}

impl TestPlatform {
    fn new() -> Self {
        Self {
            mem: vec![0; 0x10_0000],
            io: Vec::new(),
            input: VecDeque::new(),
            apic_base: 0xfee0_0900,
            tpr: 0,
            tsc: 1000,
            touched: Vec::new(),
        }
    }

    fn load(&mut self, addr: u64, bytes: &[u8]) {
        let off = addr as usize;
        self.mem[off..off + bytes.len()].copy_from_slice(bytes);
    }

    fn bytes(&self, addr: u64, len: usize) -> &[u8] {
        &self.mem[addr as usize..addr as usize + len]
    }

    /// Accesses outside the instruction fetch window at `CODE`.
    fn data_accesses(&self) -> Vec<u64> {
        let fetch = CODE..CODE + MAX_FETCH;
        self.touched.iter().copied().filter(|gpa| !fetch.contains(gpa)).collect()
    }
}

const MAX_FETCH: u64 = 15;

impl GuestPhysMemory for TestPlatform {
    fn read_phys(&mut self, gpa: u64, dst: &mut [u8]) {
        self.touched.push(gpa);
        let off = gpa as usize;
        dst.copy_from_slice(&self.mem[off..off + dst.len()]);
    }

    fn write_phys(&mut self, gpa: u64, src: &[u8]) {
        self.touched.push(gpa);
        let off = gpa as usize;
        self.mem[off..off + src.len()].copy_from_slice(src);
    }
}

impl PortIo for TestPlatform {
    fn handle_io(&mut self, port: u16, data: &mut [u8], direction: IoDirection, _size: u8, _count: u32) {
        if direction == IoDirection::In {
            for b in data.iter_mut() {
                *b = self.input.pop_front().unwrap_or(0xff);
            }
        }
        self.io.push(IoRecord {
            port,
            direction,
            data: data.to_vec(),
        });
    }
}

impl Apic for TestPlatform {
    fn apic_base(&self) -> u64 {
        self.apic_base
    }

    fn set_apic_base(&mut self, value: u64) {
        self.apic_base = value;
    }

    fn tpr(&self) -> u8 {
        self.tpr
    }

    fn set_tpr(&mut self, value: u8) {
        self.tpr = value;
    }

    fn highest_pending_irq(&self) -> Option<u8> {
        None
    }

    fn poll_irq(&mut self) -> Option<u8> {
        None
    }
}

impl Platform for TestPlatform {
    fn host_tsc(&mut self) -> u64 {
        self.tsc
    }

    fn is_mmio(&self, _gpa: u64) -> bool {
        false
    }

    fn request_reset(&mut self) {}

    fn request_shutdown(&mut self) {}
}

fn real_mode_cpu() -> EmulatedCpuState {
    let mut cpu = EmulatedCpuState::default();
    cpu.rip = CODE;
    cpu
}

/// Flat 32-bit protected mode with the given privilege level.
fn flat32_cpu(cpl: u8) -> EmulatedCpuState {
    let mut cpu = real_mode_cpu();
    cpu.control.cr0 |= CR0_PE;
    let dpl = cpl << 5;
    let flat = |access: u8| SegmentCache {
        selector: 0,
        base: 0,
        limit: 0xffff_ffff,
        access,
        flags: 0xc,
        unusable: false,
    };
    cpu.set_segment(SegReg::Cs, flat(0x9b | dpl));
    for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
        cpu.set_segment(seg, flat(0x93 | dpl));
    }
    cpu
}

fn run(cpu: &mut EmulatedCpuState, platform: &mut TestPlatform, code: &[u8]) -> Executed {
    let at = cpu.linear_address(SegReg::Cs, cpu.rip);
    platform.load(at, code);
    emulate_one(cpu, platform).unwrap()
}

#[test]
fn add_al_imm8_wraps_to_zero() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rax, 1);

    assert_eq!(run(&mut cpu, &mut platform, &[0x04, 0xff]), Executed::Retired);

    assert_eq!(cpu.gpr(Gpr::Rax), 0);
    assert_eq!(cpu.rip, CODE + 2);
    assert!(cpu.rflags.is_lazy());
    assert!(cpu.rflags.cf());
    assert!(cpu.rflags.zf());
    assert!(!cpu.rflags.of());
    assert!(!cpu.rflags.sf());
    assert!(cpu.dirty);
}

#[test]
fn sub_sets_borrow_and_sign() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rbx, 0x0001);
    // sub bx, 2
    run(&mut cpu, &mut platform, &[0x83, 0xeb, 0x02]);
    assert_eq!(cpu.gpr(Gpr::Rbx), 0xffff);
    assert!(cpu.rflags.cf());
    assert!(cpu.rflags.sf());
    assert!(!cpu.rflags.zf());
}

#[test]
fn inc_preserves_carry() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.rflags.set(flags::RFLAGS_CF, true);
    cpu.set_gpr(Gpr::Rcx, 0x7fff);
    // inc cx
    run(&mut cpu, &mut platform, &[0x41]);
    assert_eq!(cpu.gpr(Gpr::Rcx), 0x8000);
    assert!(cpu.rflags.cf());
    assert!(cpu.rflags.of());
}

#[test]
fn mov_to_memory_uses_segment_base() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_segment(SegReg::Ds, SegmentCache::real_mode(0x200, 0x93));
    cpu.set_gpr(Gpr::Rax, 0xbeef);
    // mov [0x10], ax
    run(&mut cpu, &mut platform, &[0xa3, 0x10, 0x00]);
    assert_eq!(platform.bytes(0x2010, 2), &[0xef, 0xbe]);
}

#[test]
fn rep_string_ops_with_zero_count_touch_nothing() {
    let cases: &[(&str, &[u8], u64)] = &[
        ("rep stosb", &[0xf3, 0xaa], 0xdead_0000),
        ("rep movsb", &[0xf3, 0xa4], 0xdead_0000),
        ("rep lodsb", &[0xf3, 0xac], 0xdead_0000),
        ("repe scasb", &[0xf3, 0xae], 0xdead_0000),
        ("repe cmpsb", &[0xf3, 0xa6], 0xdead_0000),
        ("repne scasb", &[0xf2, 0xae], 0xdead_0000),
        ("rep stosd", &[0x66, 0xf3, 0xab], 0x1_0000_0000),
        // 32-bit addressing counts with ECX.
        ("rep movsw a32", &[0x67, 0xf3, 0xa5], 0xffff_ffff_0000_0000),
        ("repe cmpsd a32", &[0x66, 0x67, 0xf3, 0xa7], 0x8000_0000_0000_0000),
    ];
    for &(name, code, rcx) in cases {
        let mut cpu = real_mode_cpu();
        let mut platform = TestPlatform::new();
        platform.load(0x3000, b"source");
        cpu.set_gpr(Gpr::Rax, 0x1234_5678);
        cpu.set_gpr(Gpr::Rsi, 0x3000);
        cpu.set_gpr(Gpr::Rdi, 0x4000);
        cpu.set_gpr(Gpr::Rcx, rcx);
        cpu.rflags = Rflags::from_raw(0x893);
        let before = cpu.gprs().to_owned();

        assert_eq!(run(&mut cpu, &mut platform, code), Executed::Retired, "{name}");

        assert_eq!(cpu.gprs(), &before, "{name}");
        assert_eq!(cpu.rflags.get(), 0x893, "{name}");
        assert_eq!(platform.data_accesses(), Vec::<u64>::new(), "{name}");
        assert_eq!(cpu.rip, CODE + code.len() as u64, "{name}");
    }
}

#[test]
fn rep_stosd_fills_and_counts_down() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rax, 0xdead_beef);
    cpu.set_gpr(Gpr::Rdi, 0x2000);
    cpu.set_gpr(Gpr::Rcx, 4);
    // rep stosd (operand-size override in real mode)
    run(&mut cpu, &mut platform, &[0x66, 0xf3, 0xab]);
    for i in 0..4 {
        assert_eq!(platform.bytes(0x2000 + i * 4, 4), &[0xef, 0xbe, 0xad, 0xde]);
    }
    assert_eq!(cpu.gpr(Gpr::Rcx), 0);
    assert_eq!(cpu.gpr(Gpr::Rdi), 0x2010);
}

#[test]
fn rep_movsb_backwards_with_df() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    platform.load(0x3000, b"abc");
    cpu.rflags.set(RFLAGS_DF, true);
    cpu.set_gpr(Gpr::Rsi, 0x3002);
    cpu.set_gpr(Gpr::Rdi, 0x4002);
    cpu.set_gpr(Gpr::Rcx, 3);
    run(&mut cpu, &mut platform, &[0xf3, 0xa4]);
    assert_eq!(platform.bytes(0x4000, 3), b"abc");
    assert_eq!(cpu.gpr(Gpr::Rsi), 0x2fff);
    assert_eq!(cpu.gpr(Gpr::Rdi), 0x3fff);
}

#[test]
fn repe_cmpsb_stops_at_first_mismatch() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    platform.load(0x3000, b"abcx");
    platform.load(0x3100, b"abcd");
    cpu.set_gpr(Gpr::Rsi, 0x3000);
    cpu.set_gpr(Gpr::Rdi, 0x3100);
    cpu.set_gpr(Gpr::Rcx, 10);

    run(&mut cpu, &mut platform, &[0xf3, 0xa6]);

    assert!(!cpu.rflags.zf());
    assert_eq!(cpu.gpr(Gpr::Rcx), 6);
    assert_eq!(cpu.gpr(Gpr::Rsi), 0x3004);
    assert_eq!(cpu.gpr(Gpr::Rdi), 0x3104);
}

#[test]
fn repne_scasb_finds_terminator() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    platform.load(0x3000, b"hello\0");
    cpu.set_gpr(Gpr::Rdi, 0x3000);
    cpu.set_gpr(Gpr::Rcx, 0xffff);

    run(&mut cpu, &mut platform, &[0xf2, 0xae]);

    assert!(cpu.rflags.zf());
    assert_eq!(cpu.gpr(Gpr::Rdi), 0x3006);
    assert_eq!(cpu.gpr(Gpr::Rcx), 0xffff - 6);
}

#[test]
fn in_al_merges_into_rax() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    platform.input.push_back(0xaa);
    cpu.set_gpr(Gpr::Rax, 0x1122_3344_5566_7788);

    run(&mut cpu, &mut platform, &[0xe4, 0x60]);

    assert_eq!(cpu.gpr(Gpr::Rax), 0x1122_3344_5566_77aa);
    assert_eq!(
        platform.io,
        vec![IoRecord {
            port: 0x60,
            direction: IoDirection::In,
            data: vec![0xaa],
        }]
    );
}

#[test]
fn in_eax_zero_extends() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    platform.input.extend([1, 2, 3, 4]);
    cpu.set_gpr(Gpr::Rax, u64::MAX);
    cpu.set_gpr(Gpr::Rdx, 0xcfc);
    // in eax, dx
    run(&mut cpu, &mut platform, &[0x66, 0xed]);
    assert_eq!(cpu.gpr(Gpr::Rax), 0x0403_0201);
}

#[test]
fn out_dx_ax_sends_little_endian_word() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rax, 0x1234);
    cpu.set_gpr(Gpr::Rdx, 0x3f8);
    run(&mut cpu, &mut platform, &[0xef]);
    assert_eq!(platform.io[0].port, 0x3f8);
    assert_eq!(platform.io[0].direction, IoDirection::Out);
    assert_eq!(platform.io[0].data, vec![0x34, 0x12]);
}

#[test]
fn rep_insb_writes_each_port_read() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    platform.input.extend([7, 8, 9]);
    cpu.set_gpr(Gpr::Rdx, 0x1f0);
    cpu.set_gpr(Gpr::Rdi, 0x5000);
    cpu.set_gpr(Gpr::Rcx, 3);
    run(&mut cpu, &mut platform, &[0xf3, 0x6c]);
    assert_eq!(platform.bytes(0x5000, 3), &[7, 8, 9]);
    assert_eq!(platform.io.len(), 3);
    assert_eq!(cpu.gpr(Gpr::Rcx), 0);
}

#[test]
fn wrmsr_then_rdmsr_round_trips_mtrr() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rcx, u64::from(msr::IA32_MTRR_PHYSBASE0 + 3));
    cpu.set_gpr(Gpr::Rdx, 0xf);
    cpu.set_gpr(Gpr::Rax, 0xff00_0800);
    run(&mut cpu, &mut platform, &[0x0f, 0x30]);
    assert_eq!(cpu.msrs.mtrr.var[1].mask, 0xf_ff00_0800);

    cpu.set_gpr(Gpr::Rax, 0);
    cpu.set_gpr(Gpr::Rdx, 0);
    run(&mut cpu, &mut platform, &[0x0f, 0x32]);
    assert_eq!(cpu.gpr(Gpr::Rax), 0xff00_0800);
    assert_eq!(cpu.gpr(Gpr::Rdx), 0xf);
}

#[test]
fn rdmsr_of_unknown_msr_reads_zero() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rcx, 0x1234);
    cpu.set_gpr(Gpr::Rax, 5);
    run(&mut cpu, &mut platform, &[0x0f, 0x32]);
    assert_eq!(cpu.gpr(Gpr::Rax), 0);
    assert_eq!(cpu.gpr(Gpr::Rdx), 0);
}

#[test]
fn rdmsr_tsc_applies_offset() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.tsc_offset = 0x1_0000_0000;
    cpu.set_gpr(Gpr::Rcx, u64::from(msr::IA32_TSC));
    run(&mut cpu, &mut platform, &[0x0f, 0x32]);
    assert_eq!(cpu.gpr(Gpr::Rax), 1000);
    assert_eq!(cpu.gpr(Gpr::Rdx), 1);
}

#[test]
fn wrmsr_efer_nxe_requests_tlb_flush() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rcx, u64::from(msr::IA32_EFER));
    cpu.set_gpr(Gpr::Rax, hvx_mmu::EFER_NXE);
    run(&mut cpu, &mut platform, &[0x0f, 0x30]);
    assert_eq!(cpu.efer, hvx_mmu::EFER_NXE);
    assert!(cpu.flush_tlb);
}

#[test]
fn wrmsr_at_cpl3_raises_gp() {
    let mut cpu = flat32_cpu(3);
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rcx, u64::from(msr::IA32_LSTAR));

    let done = run(&mut cpu, &mut platform, &[0x0f, 0x30]);

    assert_eq!(done, Executed::Faulted(Exception::gp0()));
    assert_eq!(cpu.rip, CODE);
    let event = cpu.injected.unwrap();
    assert_eq!(event.kind, EventType::HardwareException);
    assert_eq!(event.vector, 13);
    assert_eq!(event.error_code, Some(0));
}

#[test]
fn shifts_by_cl() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rax, 0x81);
    cpu.set_gpr(Gpr::Rcx, 1);
    // shl al, cl
    run(&mut cpu, &mut platform, &[0xd2, 0xe0]);
    assert_eq!(cpu.gpr(Gpr::Rax), 0x02);
    assert!(cpu.rflags.cf());
    assert!(cpu.rflags.of());

    cpu.set_gpr(Gpr::Rax, 0x80);
    cpu.set_gpr(Gpr::Rcx, 3);
    // sar al, cl
    run(&mut cpu, &mut platform, &[0xd2, 0xf8]);
    assert_eq!(cpu.gpr(Gpr::Rax), 0xf0);
    assert!(!cpu.rflags.cf());
}

#[test]
fn shift_by_zero_keeps_flags() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.rflags.set(flags::RFLAGS_ZF | flags::RFLAGS_CF, true);
    cpu.set_gpr(Gpr::Rax, 0x55);
    cpu.set_gpr(Gpr::Rcx, 0x20);
    // shr al, cl (count masks to zero)
    run(&mut cpu, &mut platform, &[0xd2, 0xe8]);
    assert_eq!(cpu.gpr(Gpr::Rax), 0x55);
    assert!(cpu.rflags.zf());
    assert!(cpu.rflags.cf());
}

#[test]
fn rcl_rotates_through_carry() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.rflags.set(flags::RFLAGS_CF, true);
    cpu.set_gpr(Gpr::Rax, 0x80);
    // rcl al, 1
    run(&mut cpu, &mut platform, &[0xd0, 0xd0]);
    assert_eq!(cpu.gpr(Gpr::Rax), 0x01);
    assert!(cpu.rflags.cf());
}

#[test]
fn bts_with_negative_register_offset_reaches_below_operand() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rax, 0xffff);
    // bts [0x2004], ax
    run(&mut cpu, &mut platform, &[0x0f, 0xab, 0x06, 0x04, 0x20]);
    assert_eq!(platform.bytes(0x2002, 2), &[0x00, 0x80]);
    assert!(!cpu.rflags.cf());
}

#[test]
fn xadd_and_cmpxchg_on_memory() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    platform.load(0x2000, &[5, 0]);
    cpu.set_gpr(Gpr::Rbx, 3);
    // xadd [0x2000], bx
    run(&mut cpu, &mut platform, &[0x0f, 0xc1, 0x1e, 0x00, 0x20]);
    assert_eq!(platform.bytes(0x2000, 2), &[8, 0]);
    assert_eq!(cpu.gpr(Gpr::Rbx), 5);

    cpu.set_gpr(Gpr::Rax, 8);
    cpu.set_gpr(Gpr::Rcx, 0x42);
    // cmpxchg [0x2000], cx
    run(&mut cpu, &mut platform, &[0x0f, 0xb1, 0x0e, 0x00, 0x20]);
    assert!(cpu.rflags.zf());
    assert_eq!(platform.bytes(0x2000, 2), &[0x42, 0]);

    // a second attempt sees the new value and loads it into AX
    run(&mut cpu, &mut platform, &[0x0f, 0xb1, 0x0e, 0x00, 0x20]);
    assert!(!cpu.rflags.zf());
    assert_eq!(cpu.gpr(Gpr::Rax), 0x42);
}

#[test]
fn cmov_32_zero_extends_when_not_taken() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rax, 0xffff_ffff_0000_0001);
    cpu.set_gpr(Gpr::Rcx, 7);
    // cmove eax, ecx with ZF clear
    let inst = decode(&[0x0f, 0x44, 0xc1], CpuMode::Long64).unwrap();
    assert_eq!(execute(&mut cpu, &mut platform, &inst).unwrap(), Executed::Retired);
    assert_eq!(cpu.gpr(Gpr::Rax), 1);
}

#[test]
fn jcc_and_call_ret() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rsp, 0x8000);
    // call +0x10
    run(&mut cpu, &mut platform, &[0xe8, 0x10, 0x00]);
    assert_eq!(cpu.rip, CODE + 3 + 0x10);
    assert_eq!(cpu.gpr(Gpr::Rsp), 0x7ffe);
    assert_eq!(platform.bytes(0x7ffe, 2), &[0x03, 0x10]);

    run(&mut cpu, &mut platform, &[0xc3]);
    assert_eq!(cpu.rip, CODE + 3);
    assert_eq!(cpu.gpr(Gpr::Rsp), 0x8000);

    // jz -2 with ZF clear falls through
    run(&mut cpu, &mut platform, &[0x74, 0xfe]);
    assert_eq!(cpu.rip, CODE + 5);
}

#[test]
fn loop_decrements_cx() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rcx, 2);
    run(&mut cpu, &mut platform, &[0xe2, 0xfe]);
    assert_eq!(cpu.gpr(Gpr::Rcx), 1);
    assert_eq!(cpu.rip, CODE);
    run(&mut cpu, &mut platform, &[0xe2, 0xfe]);
    assert_eq!(cpu.gpr(Gpr::Rcx), 0);
    assert_eq!(cpu.rip, CODE + 2);
}

#[test]
fn cpuid_is_reported_to_the_caller() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    assert_eq!(run(&mut cpu, &mut platform, &[0x0f, 0xa2]), Executed::Cpuid);
    assert_eq!(cpu.rip, CODE + 2);
}

#[test]
fn mov_to_cr0_is_reported_unapplied() {
    let mut cpu = flat32_cpu(0);
    let mut platform = TestPlatform::new();
    cpu.set_gpr(Gpr::Rax, 0x8000_0011);
    let cr0 = cpu.control.cr0;
    let done = run(&mut cpu, &mut platform, &[0x0f, 0x22, 0xc0]);
    assert_eq!(
        done,
        Executed::ControlRegisterWrite {
            cr: 0,
            value: 0x8000_0011
        }
    );
    assert_eq!(cpu.control.cr0, cr0);
}

#[test]
fn mov_from_cr2_reads_fault_address() {
    let mut cpu = flat32_cpu(0);
    let mut platform = TestPlatform::new();
    cpu.control.cr2 = 0xdead_0000;
    // mov ebx, cr2
    run(&mut cpu, &mut platform, &[0x0f, 0x20, 0xd3]);
    assert_eq!(cpu.gpr(Gpr::Rbx), 0xdead_0000);
}

#[test]
fn hlt_halts() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    assert_eq!(run(&mut cpu, &mut platform, &[0xf4]), Executed::Halted);
    assert!(cpu.halted);
    assert_eq!(cpu.rip, CODE + 1);
}

#[test]
fn sti_opens_interrupt_shadow() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    run(&mut cpu, &mut platform, &[0xfb]);
    assert!(cpu.rflags.if_flag());
    assert!(cpu.interruptibility.contains(Interruptibility::STI));

    // the shadow covers exactly one more instruction
    run(&mut cpu, &mut platform, &[0x90]);
    assert!(cpu.interruptibility.is_empty());
    assert_eq!(cpu.rflags.get() & RFLAGS_IF, RFLAGS_IF);
}

#[test]
fn int3_is_injected_as_software_exception() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    run(&mut cpu, &mut platform, &[0xcc]);
    let event = cpu.injected.unwrap();
    assert_eq!(event.kind, EventType::SoftwareException);
    assert_eq!(event.vector, 3);
    assert_eq!(event.instruction_len, 1);
    assert_eq!(cpu.rip, CODE);
}

#[test]
fn unimplemented_instruction_is_skipped() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    // aad
    let done = run(&mut cpu, &mut platform, &[0xd5, 0x0a]);
    assert_eq!(done, Executed::Unimplemented(Command::Aad));
    assert_eq!(cpu.rip, CODE + 2);
}

#[test]
fn undecodable_bytes_are_an_error() {
    let mut cpu = real_mode_cpu();
    let mut platform = TestPlatform::new();
    // addps, which the decoder does not cover
    platform.load(CODE, &[0x0f, 0x58, 0xc1]);
    let err = emulate_one(&mut cpu, &mut platform).unwrap_err();
    assert!(matches!(err, EmulationError::Decode { rip: CODE, .. }));
}

#[test]
fn page_fault_loads_cr2_and_keeps_rip() {
    let mut cpu = flat32_cpu(0);
    let mut platform = TestPlatform::new();
    let pd = 0x5000u64;
    // 4MB identity page for the first directory slot only.
    platform.load(pd, &((PTE_P | PTE_RW | PTE_US | PTE_PS) as u32).to_le_bytes());
    cpu.control.cr0 |= CR0_PG;
    cpu.control.cr3 = pd;
    cpu.control.cr4 |= CR4_PSE;

    // mov eax, [0x401000]
    let done = run(&mut cpu, &mut platform, &[0xa1, 0x00, 0x10, 0x40, 0x00]);

    let Executed::Faulted(Exception::PageFault { addr, code }) = done else {
        panic!("expected #PF, got {done:?}");
    };
    assert_eq!(addr, 0x40_1000);
    assert_eq!(code & 1, 0);
    assert_eq!(cpu.control.cr2, 0x40_1000);
    assert_eq!(cpu.rip, CODE);
    assert_eq!(cpu.injected.map(|e| e.vector), Some(14));
}

fn raise_after(first: PendingEvent, second: Exception) -> EmulatedCpuState {
    let mut cpu = real_mode_cpu();
    cpu.injected = Some(first);
    cpu.raise(second);
    cpu
}

fn page_fault(addr: u64) -> Exception {
    Exception::PageFault { addr, code: 2 }
}

#[test]
fn contributory_after_contributory_is_double_fault() {
    let cpu = raise_after(
        PendingEvent::exception(Exception::GeneralProtection(0x10)),
        Exception::gp0(),
    );
    let event = cpu.injected.unwrap();
    assert_eq!(event.vector, 8);
    assert_eq!(event.error_code, Some(0));

    let cpu = raise_after(
        PendingEvent::exception(Exception::DivideError),
        Exception::SegmentNotPresent(0x28),
    );
    assert_eq!(cpu.injected.map(|e| e.vector), Some(8));
}

#[test]
fn page_fault_during_page_fault_or_contributory_delivery() {
    let cpu = raise_after(PendingEvent::exception(page_fault(0x1000)), page_fault(0x2000));
    assert_eq!(cpu.injected.map(|e| e.vector), Some(8));
    assert_eq!(cpu.control.cr2, 0x2000);

    let cpu = raise_after(PendingEvent::exception(page_fault(0x1000)), Exception::gp0());
    assert_eq!(cpu.injected.map(|e| e.vector), Some(8));

    // Contributory first, then #PF: the page fault is delivered on its own.
    let cpu = raise_after(
        PendingEvent::exception(Exception::StackFault(0)),
        page_fault(0x3000),
    );
    let event = cpu.injected.unwrap();
    assert_eq!(event.vector, 14);
    assert_eq!(event.error_code, Some(2));
    assert_eq!(cpu.control.cr2, 0x3000);
}

#[test]
fn benign_first_event_delivers_the_second() {
    let cpu = raise_after(
        PendingEvent::exception(Exception::InvalidOpcode),
        Exception::GeneralProtection(0x8),
    );
    let event = cpu.injected.unwrap();
    assert_eq!(event.vector, 13);
    assert_eq!(event.error_code, Some(0x8));

    let cpu = raise_after(
        PendingEvent::exception(Exception::GeneralProtection(0)),
        Exception::DeviceNotAvailable,
    );
    assert_eq!(cpu.injected.map(|e| e.vector), Some(7));

    // INT3 in delivery is re-raised by re-executing it.
    let cpu = raise_after(PendingEvent::exception(Exception::Breakpoint), Exception::gp0());
    assert_eq!(cpu.injected.map(|e| e.vector), Some(13));
    assert_eq!(cpu.deferred, None);

    let cpu = raise_after(PendingEvent::software_interrupt(0x80, 2), page_fault(0x4000));
    assert_eq!(cpu.injected.map(|e| e.vector), Some(14));
    assert_eq!(cpu.deferred, None);
}

#[test]
fn fault_while_delivering_double_fault_is_triple_fault() {
    let cpu = raise_after(PendingEvent::exception(Exception::DoubleFault), Exception::gp0());
    assert!(cpu.triple_fault);
    assert_eq!(cpu.injected, None);

    let cpu = raise_after(PendingEvent::exception(Exception::DoubleFault), page_fault(0x5000));
    assert!(cpu.triple_fault);

    let cpu = raise_after(
        PendingEvent::exception(Exception::DoubleFault),
        Exception::InvalidOpcode,
    );
    assert!(!cpu.triple_fault);
    assert_eq!(cpu.injected.map(|e| e.vector), Some(6));
}

#[test]
fn interrupt_in_delivery_is_deferred_behind_the_fault() {
    let cpu = raise_after(PendingEvent::external(0x20), Exception::gp0());
    assert_eq!(cpu.injected.map(|e| e.vector), Some(13));
    assert_eq!(cpu.deferred, Some(PendingEvent::external(0x20)));
    assert!(!cpu.triple_fault);

    let cpu = raise_after(PendingEvent::nmi(), page_fault(0x6000));
    assert_eq!(cpu.injected.map(|e| e.vector), Some(14));
    assert_eq!(cpu.deferred, Some(PendingEvent::nmi()));
}

#[test]
fn escalation_table() {
    use FaultClass::*;
    assert_eq!(FaultClass::of_vector(0), Contributory);
    assert_eq!(FaultClass::of_vector(1), Benign);
    assert_eq!(FaultClass::of_vector(2), Benign);
    assert_eq!(FaultClass::of_vector(8), DoubleFault);
    assert_eq!(FaultClass::of_vector(14), PageFault);
    assert_eq!(FaultClass::of_vector(16), Benign);

    for second in [Benign, Contributory, PageFault] {
        assert_eq!(Escalation::of(Benign, second), Escalation::Serial);
    }
    assert_eq!(Escalation::of(Contributory, Benign), Escalation::Serial);
    assert_eq!(Escalation::of(Contributory, Contributory), Escalation::DoubleFault);
    assert_eq!(Escalation::of(Contributory, PageFault), Escalation::Serial);
    assert_eq!(Escalation::of(PageFault, Benign), Escalation::Serial);
    assert_eq!(Escalation::of(PageFault, Contributory), Escalation::DoubleFault);
    assert_eq!(Escalation::of(PageFault, PageFault), Escalation::DoubleFault);
    assert_eq!(Escalation::of(DoubleFault, Benign), Escalation::Serial);
    assert_eq!(Escalation::of(DoubleFault, Contributory), Escalation::TripleFault);
    assert_eq!(Escalation::of(DoubleFault, PageFault), Escalation::TripleFault);
}

#[test]
fn descriptor_lookup_checks_gdt_limit() {
    let mut cpu = flat32_cpu(0);
    let mut platform = TestPlatform::new();
    cpu.gdtr = DescriptorTableReg {
        base: 0x6000,
        limit: 0x17,
    };
    platform.load(0x6010, &0x00cf_9a00_0000_ffffu64.to_le_bytes());

    let desc = descriptors::read_descriptor(&cpu, &mut platform, 0x10).unwrap();
    assert!(desc.is_present());
    assert_eq!(desc.limit(), 0xffff_ffff);
    assert_eq!(desc.dpl(), 0);

    assert_eq!(
        descriptors::read_descriptor(&cpu, &mut platform, 0x18).unwrap_err(),
        Exception::GeneralProtection(0x18)
    );
}

#[test]
fn mode_follows_cr0_and_cs() {
    let cpu = real_mode_cpu();
    assert_eq!(cpu.mode(), CpuMode::Real);
    assert_eq!(cpu.cpl(), 0);

    let cpu = flat32_cpu(3);
    assert_eq!(cpu.mode(), CpuMode::Protected { cs_db: true });
    assert_eq!(cpu.cpl(), 3);
    assert_eq!(cpu.stack_size(), 4);
}

#[test]
fn write_gpr_zero_extends_only_32_bit() {
    let mut cpu = real_mode_cpu();
    cpu.set_gpr(Gpr::Rdx, u64::MAX);
    cpu.write_gpr(Gpr::Rdx as u8, 2, 0x1234);
    assert_eq!(cpu.gpr(Gpr::Rdx), 0xffff_ffff_ffff_1234);
    cpu.write_gpr(Gpr::Rdx as u8, 4, 0x1234);
    assert_eq!(cpu.gpr(Gpr::Rdx), 0x1234);
    cpu.write_high_byte(2, 0xab);
    assert_eq!(cpu.gpr(Gpr::Rdx), 0xab34);
}
