//! A scripted in-memory [`VcpuHandle`] and [`Platform`] for tests.

use std::collections::{HashMap, VecDeque};
use std::ops::Range;

use hvx_cpu::{Apic, IoDirection, Platform, PortIo};
use hvx_mmu::GuestPhysMemory;

use crate::cpuid::CpuidResult;
use crate::handle::{HvError, HvReg, VcpuHandle};
use crate::vmcs::{ExitReason, VmcsField, INTR_INFO_VALID};

/// One scripted VM exit and the guest register changes that led to it.
#[derive(Debug, Clone, Default)]
pub struct MockExit {
    pub reason: u32,
    pub qualification: u64,
    pub instruction_len: u32,
    pub idt_vectoring: u32,
    pub guest_physical: u64,
    pub regs: Vec<(HvReg, u64)>,
    pub vmcs: Vec<(VmcsField, u64)>,
}

impl MockExit {
    pub fn new(reason: ExitReason, instruction_len: u32) -> Self {
        Self {
            reason: reason as u32,
            instruction_len,
            ..Self::default()
        }
    }

    pub fn qualification(mut self, qualification: u64) -> Self {
        self.qualification = qualification;
        self
    }

    pub fn reg(mut self, reg: HvReg, value: u64) -> Self {
        self.regs.push((reg, value));
        self
    }
}

#[derive(Debug, Default)]
pub struct MockHandle {
    pub vmcs: HashMap<VmcsField, u64>,
    pub regs: HashMap<HvReg, u64>,
    pub msrs: HashMap<u32, u64>,
    pub native_msrs: Vec<u32>,
    pub xsave: Vec<u8>,
    pub cpuid: HashMap<(u32, u32), CpuidResult>,
    pub exits: VecDeque<MockExit>,
    /// VM_ENTRY_INTR_INFO at each entry that injected something.
    pub injections: Vec<u32>,
    pub tlb_flushes: usize,
    pub runs: usize,
}

impl MockHandle {
    pub fn script(exits: impl IntoIterator<Item = MockExit>) -> Self {
        Self {
            exits: exits.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn vmcs(&self, field: VmcsField) -> u64 {
        self.vmcs.get(&field).copied().unwrap_or(0)
    }

    pub fn reg(&self, reg: HvReg) -> u64 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }
}

impl VcpuHandle for MockHandle {
    fn read_reg(&self, reg: HvReg) -> Result<u64, HvError> {
        Ok(self.reg(reg))
    }

    fn write_reg(&mut self, reg: HvReg, value: u64) -> Result<(), HvError> {
        self.regs.insert(reg, value);
        Ok(())
    }

    fn read_vmcs(&self, field: VmcsField) -> Result<u64, HvError> {
        Ok(self.vmcs(field))
    }

    fn write_vmcs(&mut self, field: VmcsField, value: u64) -> Result<(), HvError> {
        self.vmcs.insert(field, value);
        Ok(())
    }

    fn read_msr(&self, msr: u32) -> Result<u64, HvError> {
        Ok(self.msrs.get(&msr).copied().unwrap_or(0))
    }

    fn write_msr(&mut self, msr: u32, value: u64) -> Result<(), HvError> {
        self.msrs.insert(msr, value);
        Ok(())
    }

    fn enable_native_msr(&mut self, msr: u32, enable: bool) -> Result<(), HvError> {
        self.native_msrs.retain(|&m| m != msr);
        if enable {
            self.native_msrs.push(msr);
        }
        Ok(())
    }

    fn read_xsave(&self, buf: &mut [u8]) -> Result<(), HvError> {
        buf.fill(0);
        let n = buf.len().min(self.xsave.len());
        buf[..n].copy_from_slice(&self.xsave[..n]);
        Ok(())
    }

    fn write_xsave(&mut self, buf: &[u8]) -> Result<(), HvError> {
        self.xsave = buf.to_vec();
        Ok(())
    }

    fn run_until_exit(&mut self, _deadline: u64) -> Result<(), HvError> {
        self.runs += 1;
        let entry = self.vmcs(VmcsField::VM_ENTRY_INTR_INFO) as u32;
        if entry & INTR_INFO_VALID != 0 {
            self.injections.push(entry);
            self.vmcs.insert(VmcsField::VM_ENTRY_INTR_INFO, 0);
        }
        let exit = self.exits.pop_front().ok_or(HvError::Busy)?;
        for (reg, value) in exit.regs {
            self.regs.insert(reg, value);
        }
        for (field, value) in exit.vmcs {
            self.vmcs.insert(field, value);
        }
        self.vmcs.insert(VmcsField::VM_EXIT_REASON, u64::from(exit.reason));
        self.vmcs.insert(VmcsField::EXIT_QUALIFICATION, exit.qualification);
        self.vmcs.insert(
            VmcsField::VM_EXIT_INSTRUCTION_LEN,
            u64::from(exit.instruction_len),
        );
        self.vmcs.insert(VmcsField::IDT_VECTORING_INFO, u64::from(exit.idt_vectoring));
        self.vmcs.insert(VmcsField::GUEST_PHYSICAL_ADDRESS, exit.guest_physical);
        Ok(())
    }

    fn invalidate_tlb(&mut self) -> Result<(), HvError> {
        self.tlb_flushes += 1;
        Ok(())
    }

    fn interrupt(&self) -> Result<(), HvError> {
        Ok(())
    }

    fn host_cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.cpuid
            .get(&(leaf, subleaf))
            .or_else(|| self.cpuid.get(&(leaf, 0)))
            .copied()
            .unwrap_or(CpuidResult::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRecord {
    pub port: u16,
    pub direction: IoDirection,
    pub data: Vec<u8>,
}

/// Flat guest RAM with scripted devices and interrupt sources.
#[derive(Debug)]
pub struct MockPlatform {
    pub mem: Vec<u8>,
    pub mmio: Vec<Range<u64>>,
    pub io: Vec<IoRecord>,
    pub io_input: VecDeque<u8>,
    pub phys_reads: usize,
    pub apic_base: u64,
    pub tpr: u8,
    pub irqs: VecDeque<u8>,
    pub nmi: bool,
    pub tsc: u64,
    pub reset_requested: bool,
    pub shutdown_requested: bool,
}

impl MockPlatform {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            mmio: Vec::new(),
            io: Vec::new(),
            io_input: VecDeque::new(),
            phys_reads: 0,
            apic_base: 0xfee0_0900,
            tpr: 0,
            irqs: VecDeque::new(),
            nmi: false,
            tsc: 0,
            reset_requested: false,
            shutdown_requested: false,
        }
    }

    pub fn load(&mut self, gpa: u64, bytes: &[u8]) {
        let start = gpa as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl GuestPhysMemory for MockPlatform {
    fn read_phys(&mut self, gpa: u64, dst: &mut [u8]) {
        self.phys_reads += 1;
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.mem.get(gpa as usize + i).copied().unwrap_or(0xff);
        }
    }

    fn write_phys(&mut self, gpa: u64, src: &[u8]) {
        for (i, &byte) in src.iter().enumerate() {
            if let Some(slot) = self.mem.get_mut(gpa as usize + i) {
                *slot = byte;
            }
        }
    }
}

impl PortIo for MockPlatform {
    fn handle_io(
        &mut self,
        port: u16,
        data: &mut [u8],
        direction: IoDirection,
        _size: u8,
        _count: u32,
    ) {
        if direction == IoDirection::In {
            for byte in data.iter_mut() {
                *byte = self.io_input.pop_front().unwrap_or(0xff);
            }
        }
        self.io.push(IoRecord {
            port,
            direction,
            data: data.to_vec(),
        });
    }
}

impl Apic for MockPlatform {
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
        self.irqs.front().copied()
    }

    fn poll_irq(&mut self) -> Option<u8> {
        self.irqs.pop_front()
    }
}

impl Platform for MockPlatform {
    fn host_tsc(&mut self) -> u64 {
        self.tsc
    }

    fn is_mmio(&self, gpa: u64) -> bool {
        self.mmio.iter().any(|range| range.contains(&gpa))
    }

    fn nmi_pending(&self) -> bool {
        self.nmi
    }

    fn take_nmi(&mut self) {
        self.nmi = false;
    }

    fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }
}
