//! The per-vCPU exit loop.

use std::sync::{Arc, Mutex};

use hvx_cpu::state::{CR0_PE, CR0_TS};
use hvx_cpu::{
    emulate_one, EmulatedCpuState, EmulationError, EventType, Exception, Executed, Gpr,
    Interruptibility, IoDirection, PendingEvent, Platform, Rflags,
};
use hvx_mmu::write_linear;
use hvx_x86::SegReg;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::cpuid::{CpuidConfig, CpuidContext};
use crate::events;
use crate::exit::{CrAccess, CrAccessType, ExitInfo, IoAccess};
use crate::handle::{HvError, HvReg, VcpuHandle, RUN_FOREVER};
use crate::sync;
use crate::task_switch::{task_switch, TaskSwitchError, TaskSwitchReason};
use crate::vmcs::{
    EptViolation, ExitReason, INTR_INFO_TYPE_MASK, INTR_INFO_TYPE_SHIFT, INTR_INFO_VALID,
    INTR_INFO_VECTOR_MASK,
};

/// Why [`Vcpu::exec`] handed control back to the VM lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    /// HLT with nothing to deliver. Call `exec` again once an interrupt is
    /// pending.
    Halted,
    /// The vCPU was kicked or something changed that the lifecycle must look at.
    Interrupted,
    ResetRequested,
    ShutdownRequested,
}

#[derive(Debug, Error)]
pub enum VcpuError {
    #[error(transparent)]
    Hv(#[from] HvError),
    #[error(transparent)]
    Decode(#[from] EmulationError),
    #[error("unsupported VM exit {reason} at rip {rip:#x}")]
    UnsupportedExit { reason: u32, rip: u64 },
    #[error("VM entry failed (exit reason {reason:#x})")]
    EntryFailed { reason: u32 },
    #[error("EPT violation at {gpa:#x} (qualification {qualification:#x})")]
    EptViolation { gpa: u64, qualification: u64 },
    #[error("state sync inconsistency: {0}")]
    StateSyncInconsistency(String),
    #[error(transparent)]
    TaskSwitch(#[from] TaskSwitchError),
    #[error("platform lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuConfig {
    pub cpuid: CpuidConfig,
    /// Passed to [`VcpuHandle::run_until_exit`].
    pub deadline: u64,
    /// Treat a triple fault as a power-off instead of a reset.
    pub shutdown_on_triple_fault: bool,
}

impl Default for VcpuConfig {
    fn default() -> Self {
        Self {
            cpuid: CpuidConfig::default(),
            deadline: RUN_FOREVER,
            shutdown_on_triple_fault: false,
        }
    }
}

pub struct Vcpu<H, P> {
    handle: H,
    platform: Arc<Mutex<P>>,
    cpu: EmulatedCpuState,
    config: VcpuConfig,
}

type Handled = Result<Option<VcpuExit>, VcpuError>;

impl<H: VcpuHandle, P: Platform> Vcpu<H, P> {
    /// Wrap `handle`. The emulated state starts at reset and is pushed on the
    /// first [`Vcpu::exec`].
    pub fn new(
        mut handle: H,
        platform: Arc<Mutex<P>>,
        config: VcpuConfig,
    ) -> Result<Self, VcpuError> {
        for msr in sync::NATIVE_MSRS {
            handle.enable_native_msr(msr, true)?;
        }
        let mut cpu = EmulatedCpuState::default();
        cpu.dirty = true;
        Ok(Self {
            handle,
            platform,
            cpu,
            config,
        })
    }

    pub fn cpu(&self) -> &EmulatedCpuState {
        &self.cpu
    }

    /// Mutable access to the emulated state. It is pushed to the hardware
    /// before the next entry.
    pub fn cpu_mut(&mut self) -> &mut EmulatedCpuState {
        self.cpu.dirty = true;
        &mut self.cpu
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    pub fn config(&self) -> &VcpuConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<Mutex<P>> {
        &self.platform
    }

    /// Force a running [`Vcpu::exec`] out of the guest.
    pub fn kick(&self) -> Result<(), HvError> {
        self.handle.interrupt()
    }

    fn wakeup_pending(&self, platform: &P) -> bool {
        self.cpu.injected.is_some()
            || self.cpu.deferred.is_some()
            || platform.nmi_pending()
            || (self.cpu.rflags.if_flag() && platform.highest_pending_irq().is_some())
    }

    /// Run the guest until an exit needs the VM lifecycle.
    ///
    /// The platform lock is held for everything except the hardware run.
    pub fn exec(&mut self) -> Result<VcpuExit, VcpuError> {
        let shared = Arc::clone(&self.platform);
        let mut platform = shared.lock().map_err(|_| VcpuError::LockPoisoned)?;

        if self.cpu.halted {
            if !self.wakeup_pending(&platform) {
                return Ok(VcpuExit::Halted);
            }
            self.cpu.halted = false;
        }

        loop {
            if self.cpu.dirty {
                sync::push(&mut self.handle, &mut *platform, &mut self.cpu)?;
            }
            events::inject(&mut self.handle, &mut *platform, &mut self.cpu)?;

            drop(platform);
            let ran = self.handle.run_until_exit(self.config.deadline);
            platform = shared.lock().map_err(|_| VcpuError::LockPoisoned)?;
            ran?;

            let exit = ExitInfo::read(&self.handle)?;
            events::store_events(
                &self.handle,
                &mut self.cpu,
                exit.idt_vectoring,
                exit.instruction_len,
            )?;
            self.cpu.rflags = Rflags::from_raw(self.handle.read_reg(HvReg::Rflags)?);
            trace!(
                rip = exit.rip,
                exit_reason = exit.raw_reason,
                qualification = exit.qualification,
                "vm exit"
            );

            let mut outcome = self.dispatch(&mut *platform, &exit)?;
            if std::mem::take(&mut self.cpu.triple_fault) {
                outcome = Some(self.triple_fault(&mut *platform, exit.rip));
            }
            if let Some(outcome) = outcome {
                // Hand back a current snapshot so edits through `cpu_mut` start
                // from what the guest last ran with.
                if !self.cpu.dirty {
                    sync::pull(&self.handle, &mut self.cpu)?;
                }
                return Ok(outcome);
            }
        }
    }

    fn dispatch(&mut self, platform: &mut P, exit: &ExitInfo) -> Handled {
        if exit.entry_failed() {
            error!(exit_reason = exit.raw_reason, rip = exit.rip, "vm entry failed");
            return Err(VcpuError::EntryFailed {
                reason: exit.raw_reason,
            });
        }
        let Some(reason) = exit.reason() else {
            error!(exit_reason = exit.raw_reason, rip = exit.rip, "unknown vm exit");
            return Err(VcpuError::UnsupportedExit {
                reason: exit.basic_reason(),
                rip: exit.rip,
            });
        };

        match reason {
            ExitReason::HLT => {
                self.advance(exit)?;
                if self.wakeup_pending(platform) {
                    return Ok(None);
                }
                self.cpu.halted = true;
                Ok(Some(VcpuExit::Halted))
            }
            ExitReason::MWAIT_INSTRUCTION | ExitReason::MONITOR_INSTRUCTION => {
                self.advance(exit)?;
                Ok(Some(VcpuExit::Interrupted))
            }
            ExitReason::EPT_VIOLATION => self.ept_violation(platform, exit),
            ExitReason::IO_INSTRUCTION => self.io(platform, exit),
            ExitReason::CPUID => {
                self.cpuid_fast(exit)?;
                Ok(None)
            }
            ExitReason::XSETBV => {
                let index = self.handle.read_reg(HvReg::Gpr(Gpr::Rcx as u8))? as u32;
                if index == 0 {
                    let lo = self.handle.read_reg(HvReg::Gpr(Gpr::Rax as u8))? & 0xffff_ffff;
                    let hi = self.handle.read_reg(HvReg::Gpr(Gpr::Rdx as u8))? & 0xffff_ffff;
                    // x87 state cannot be disabled.
                    self.handle.write_reg(HvReg::Xcr0, (hi << 32) | lo | 1)?;
                } else {
                    debug!(index, "xsetbv to unknown xcr ignored");
                }
                self.advance(exit)?;
                Ok(None)
            }
            ExitReason::INTERRUPT_WINDOW => {
                events::set_interrupt_window_exiting(&mut self.handle, false)?;
                Ok(None)
            }
            ExitReason::NMI_WINDOW => {
                events::set_nmi_window_exiting(&mut self.handle, false)?;
                Ok(None)
            }
            ExitReason::EXTERNAL_INTERRUPT => Ok(Some(VcpuExit::Interrupted)),
            ExitReason::MSR_READ | ExitReason::MSR_WRITE => {
                sync::pull(&self.handle, &mut self.cpu)?;
                if reason == ExitReason::MSR_READ {
                    hvx_cpu::msr::simulate_rdmsr(&mut self.cpu, platform);
                } else {
                    hvx_cpu::msr::simulate_wrmsr(&mut self.cpu, platform);
                }
                self.retire(exit);
                Ok(None)
            }
            ExitReason::CONTROL_REGISTER_ACCESS => self.control_register(platform, exit),
            ExitReason::APIC_ACCESS => self.emulate(platform),
            ExitReason::TPR_BELOW_THRESHOLD => Ok(None),
            ExitReason::TASK_SWITCH => self.task_switch(platform, exit),
            ExitReason::TRIPLE_FAULT => Ok(Some(self.triple_fault(platform, exit.rip))),
            ExitReason::RDPMC => {
                self.handle.write_reg(HvReg::Gpr(Gpr::Rax as u8), 0)?;
                self.handle.write_reg(HvReg::Gpr(Gpr::Rdx as u8), 0)?;
                self.advance(exit)?;
                Ok(None)
            }
            ExitReason::VMCALL => {
                self.cpu.injected = Some(PendingEvent::exception(Exception::gp0()));
                Ok(None)
            }
            _ => {
                error!(exit_reason = exit.raw_reason, rip = exit.rip, "unhandled vm exit");
                Err(VcpuError::UnsupportedExit {
                    reason: exit.basic_reason(),
                    rip: exit.rip,
                })
            }
        }
    }

    fn triple_fault(&mut self, platform: &mut P, rip: u64) -> VcpuExit {
        warn!(rip, "triple fault");
        if self.config.shutdown_on_triple_fault {
            platform.request_shutdown();
            VcpuExit::ShutdownRequested
        } else {
            platform.request_reset();
            VcpuExit::ResetRequested
        }
    }

    /// Step the hardware RIP past the exiting instruction.
    fn advance(&mut self, exit: &ExitInfo) -> Result<(), HvError> {
        sync::advance_rip(&mut self.handle, exit.rip, u64::from(exit.instruction_len))
    }

    /// Step the emulated RIP past the exiting instruction; the state is pushed
    /// before the next entry.
    fn retire(&mut self, exit: &ExitInfo) {
        self.cpu.rip = self.cpu.rip.wrapping_add(u64::from(exit.instruction_len));
        self.cpu.interruptibility.remove(Interruptibility::SHADOW);
        self.cpu.dirty = true;
    }

    fn cpuid_fast(&mut self, exit: &ExitInfo) -> Result<(), HvError> {
        let leaf = self.handle.read_reg(HvReg::Gpr(Gpr::Rax as u8))? as u32;
        let subleaf = self.handle.read_reg(HvReg::Gpr(Gpr::Rcx as u8))? as u32;
        let ctx = CpuidContext {
            cr4: sync::read_cr4(&self.handle)?,
            xcr0: self.handle.read_reg(HvReg::Xcr0)?,
        };
        let out = self
            .config
            .cpuid
            .filter(leaf, subleaf, self.handle.host_cpuid(leaf, subleaf), ctx);
        trace!(leaf, subleaf, ?out, "cpuid");
        self.handle.write_reg(HvReg::Gpr(Gpr::Rax as u8), u64::from(out.eax))?;
        self.handle.write_reg(HvReg::Gpr(Gpr::Rbx as u8), u64::from(out.ebx))?;
        self.handle.write_reg(HvReg::Gpr(Gpr::Rcx as u8), u64::from(out.ecx))?;
        self.handle.write_reg(HvReg::Gpr(Gpr::Rdx as u8), u64::from(out.edx))?;
        self.advance(exit)
    }

    /// Fill EAX-EDX for a CPUID the emulator retired.
    fn cpuid_emulated(&mut self) {
        let leaf = self.cpu.gpr(Gpr::Rax) as u32;
        let subleaf = self.cpu.gpr(Gpr::Rcx) as u32;
        let ctx = CpuidContext {
            cr4: self.cpu.control.cr4,
            xcr0: self.cpu.xcr0,
        };
        let out = self
            .config
            .cpuid
            .filter(leaf, subleaf, self.handle.host_cpuid(leaf, subleaf), ctx);
        self.cpu.set_gpr(Gpr::Rax, u64::from(out.eax));
        self.cpu.set_gpr(Gpr::Rbx, u64::from(out.ebx));
        self.cpu.set_gpr(Gpr::Rcx, u64::from(out.ecx));
        self.cpu.set_gpr(Gpr::Rdx, u64::from(out.edx));
    }

    /// Decode and execute the instruction at the guest RIP in software.
    fn emulate(&mut self, platform: &mut P) -> Handled {
        sync::pull(&self.handle, &mut self.cpu)?;
        let executed = emulate_one(&mut self.cpu, platform).map_err(|err| {
            error!(rip = self.cpu.rip, %err, "instruction emulation failed");
            err
        })?;
        self.cpu.dirty = true;
        match executed {
            Executed::Cpuid => self.cpuid_emulated(),
            Executed::ControlRegisterWrite { cr, value } => self.load_cr(cr, value)?,
            Executed::Halted => {
                if !self.wakeup_pending(platform) {
                    self.cpu.halted = true;
                    return Ok(Some(VcpuExit::Halted));
                }
                self.cpu.halted = false;
            }
            Executed::Retired | Executed::Faulted(_) | Executed::Unimplemented(_) => {}
        }
        Ok(None)
    }

    /// Load CR0, CR3 or CR4 into the emulated state. The masked setters run
    /// when it is pushed.
    fn load_cr(&mut self, cr: u8, value: u64) -> Result<(), VcpuError> {
        match cr {
            0 => self.cpu.control.cr0 = value,
            3 => {
                self.cpu.control.cr3 = value;
                self.cpu.flush_tlb = true;
            }
            4 => self.cpu.control.cr4 = value,
            _ => {
                return Err(VcpuError::StateSyncInconsistency(format!(
                    "mov to CR{cr}"
                )))
            }
        }
        self.cpu.dirty = true;
        Ok(())
    }

    fn control_register(&mut self, platform: &mut P, exit: &ExitInfo) -> Handled {
        let access = CrAccess::from(exit.qualification);
        sync::pull(&self.handle, &mut self.cpu)?;
        let size = if self.cpu.mode().is_long() { 8 } else { 4 };
        trace!(cr = access.cr, ?access, "control register access");

        let mut outcome = None;
        match access.access {
            CrAccessType::MovToCr => {
                let value = self.cpu.read_gpr(access.gpr, size);
                if access.cr == 8 {
                    self.cpu.control.cr8 = value & 0xf;
                    platform.set_tpr(((value & 0xf) << 4) as u8);
                    // Re-evaluate pending interrupts against the new priority.
                    outcome = Some(VcpuExit::Interrupted);
                } else {
                    self.load_cr(access.cr, value)?;
                }
            }
            CrAccessType::MovFromCr => {
                let value = match access.cr {
                    0 => self.cpu.control.cr0,
                    3 => self.cpu.control.cr3,
                    4 => self.cpu.control.cr4,
                    8 => u64::from(platform.tpr() >> 4),
                    cr => {
                        return Err(VcpuError::StateSyncInconsistency(format!(
                            "mov from CR{cr}"
                        )))
                    }
                };
                self.cpu.write_gpr(access.gpr, size, value);
            }
            CrAccessType::Clts => self.cpu.control.cr0 &= !CR0_TS,
            CrAccessType::Lmsw => {
                // LMSW loads MP, EM and TS and can set PE but never clear it.
                let cr0 = self.cpu.control.cr0;
                let source = u64::from(access.lmsw_source) & 0xf;
                self.cpu.control.cr0 = (cr0 & !0xf) | source | (cr0 & CR0_PE);
            }
        }
        self.retire(exit);
        Ok(outcome)
    }

    fn io(&mut self, platform: &mut P, exit: &ExitInfo) -> Handled {
        let io = IoAccess::from(exit.qualification);
        if io.string {
            return self.emulate(platform);
        }
        let size = usize::from(io.size.min(4));
        let rax_reg = HvReg::Gpr(Gpr::Rax as u8);
        if io.input {
            let mut data = [0u8; 4];
            platform.handle_io(io.port, &mut data[..size], IoDirection::In, io.size, 1);
            let val = u64::from(u32::from_le_bytes(data));
            let rax = self.handle.read_reg(rax_reg)?;
            let rax = match size {
                1 => (rax & !0xff) | val,
                2 => (rax & !0xffff) | val,
                _ => val,
            };
            self.handle.write_reg(rax_reg, rax)?;
        } else {
            let mut data = (self.handle.read_reg(rax_reg)? as u32).to_le_bytes();
            platform.handle_io(io.port, &mut data[..size], IoDirection::Out, io.size, 1);
        }
        trace!(port = io.port, size, input = io.input, "port i/o");
        self.advance(exit)?;
        Ok(None)
    }

    fn ept_violation(&mut self, platform: &mut P, exit: &ExitInfo) -> Handled {
        let qual = EptViolation::from_bits_retain(exit.qualification);
        let gpa = exit.guest_physical;

        let vectoring = exit.idt_vectoring & INTR_INFO_VALID != 0;
        if !vectoring && qual.contains(EptViolation::NMI_UNBLOCKING) {
            events::set_nmi_blocking(&mut self.handle, &mut self.cpu, true)?;
        }

        if is_emulation_fault(qual) && platform.is_mmio(gpa) {
            trace!(gpa, qualification = exit.qualification, "mmio access");
            return self.emulate(platform);
        }
        error!(gpa, qualification = exit.qualification, rip = exit.rip, "unhandled ept violation");
        Err(VcpuError::EptViolation {
            gpa,
            qualification: exit.qualification,
        })
    }

    fn task_switch(&mut self, platform: &mut P, exit: &ExitInfo) -> Handled {
        let selector = (exit.qualification & 0xffff) as u16;
        let reason = TaskSwitchReason::from_qualification(exit.qualification);
        let vectoring = exit.idt_vectoring;
        let vector = (vectoring & INTR_INFO_VECTOR_MASK) as u8;
        let kind =
            EventType::from_bits(((vectoring & INTR_INFO_TYPE_MASK) >> INTR_INFO_TYPE_SHIFT) as u8);
        let delivering = vectoring & INTR_INFO_VALID != 0
            && matches!(
                kind,
                Some(EventType::HardwareException | EventType::ExternalInterrupt | EventType::Nmi)
            );

        sync::pull(&self.handle, &mut self.cpu)?;
        if !delivering {
            self.cpu.rip = self.cpu.rip.wrapping_add(u64::from(exit.instruction_len));
        }
        // The switch itself delivers the event that went through the task gate.
        let delivered = if reason == TaskSwitchReason::IdtGate {
            self.cpu.injected.take()
        } else {
            None
        };
        let gate = (reason == TaskSwitchReason::IdtGate && vectoring & INTR_INFO_VALID != 0)
            .then_some(vector);

        match task_switch(&mut self.cpu, platform, selector, reason, gate) {
            Ok(()) => {}
            Err(TaskSwitchError::Fault(fault)) => {
                debug!(%fault, selector, "fault during task switch");
                sync::pull(&self.handle, &mut self.cpu)?;
                self.cpu.raise(fault);
                return Ok(None);
            }
            Err(err) => {
                error!(%err, selector, rip = exit.rip, "task switch failed");
                return Err(err.into());
            }
        }

        if let Some(code) = delivered.and_then(|event| event.error_code) {
            self.push_error_code(platform, code);
        }
        Ok(None)
    }

    /// Push an exception error code onto the incoming task's stack.
    fn push_error_code(&mut self, platform: &mut P, code: u32) {
        let size = self.cpu.stack_size();
        let esp = self.cpu.read_gpr(Gpr::Rsp as u8, size).wrapping_sub(4);
        let addr = self.cpu.linear_address(SegReg::Ss, esp);
        let regs = self.cpu.paging_regs();
        match write_linear(platform, &regs, addr, &code.to_le_bytes(), 0) {
            Ok(()) => self.cpu.write_gpr(Gpr::Rsp as u8, size, esp),
            Err(fault) => self.cpu.raise(fault.into()),
        }
    }
}

/// A data access through a guest linear address to guest-physical space that
/// is not backed by ordinary memory.
fn is_emulation_fault(qual: EptViolation) -> bool {
    !qual.contains(EptViolation::INST_FETCH)
        && qual.intersects(EptViolation::DATA_READ | EptViolation::DATA_WRITE)
        && qual.contains(EptViolation::GLA_VALID | EptViolation::XLAT_VALID)
}
