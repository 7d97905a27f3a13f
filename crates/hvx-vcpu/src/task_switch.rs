//! Hardware task switch through a 32-bit TSS.

use bytemuck::{Pod, Zeroable};
use hvx_cpu::descriptors::{read_descriptor, write_descriptor};
use hvx_cpu::flags::RFLAGS_NT;
use hvx_cpu::state::CR0_TS;
use hvx_cpu::{EmulatedCpuState, Exception, Rflags, SegmentCache, SegmentDescriptor};
use hvx_mmu::{read_linear, write_linear, AccessType, GuestPhysMemory};
use hvx_x86::SegReg;
use thiserror::Error;
use tracing::{debug, warn};

/// 32-bit task-state segment, byte for byte as the processor lays it out.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TssImage {
    pub prev_tss: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldt: u32,
    pub trap: u16,
    pub iomap_base: u16,
}

pub const TSS32_SIZE: usize = 104;
pub const TSS32_EIP_OFFSET: usize = 0x20;
pub const TSS32_LDT_OFFSET: usize = 0x60;

const TSS32_MIN_LIMIT: u32 = 0x67;
const TSS16_MIN_LIMIT: u32 = 0x2b;

/// Why the processor switched tasks; bits 31:30 of the exit qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitchReason {
    Call = 0,
    Iret = 1,
    Jmp = 2,
    IdtGate = 3,
}

impl TaskSwitchReason {
    pub fn from_qualification(qualification: u64) -> Self {
        match (qualification >> 30) & 3 {
            0 => TaskSwitchReason::Call,
            1 => TaskSwitchReason::Iret,
            2 => TaskSwitchReason::Jmp,
            _ => TaskSwitchReason::IdtGate,
        }
    }

    /// The new task links back to the old one.
    fn nests(self) -> bool {
        matches!(self, TaskSwitchReason::Call | TaskSwitchReason::IdtGate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskSwitchError {
    #[error("selector {selector:#x} does not name a usable TSS")]
    InvalidTss { selector: u16 },
    #[error("16-bit TSS at selector {selector:#x} is not supported")]
    Tss16Unsupported { selector: u16 },
    #[error("fault while accessing task state: {0}")]
    Fault(#[from] Exception),
}

fn read_tss(
    cpu: &EmulatedCpuState,
    mem: &mut impl GuestPhysMemory,
    base: u64,
) -> Result<TssImage, Exception> {
    let mut image = TssImage::zeroed();
    read_linear(
        mem,
        &cpu.paging_regs(),
        base,
        bytemuck::bytes_of_mut(&mut image),
        AccessType::Read,
        0,
    )?;
    Ok(image)
}

fn save_state(cpu: &mut EmulatedCpuState, image: &mut TssImage) {
    let gprs = *cpu.gprs();
    image.cr3 = cpu.control.cr3 as u32;
    image.eip = cpu.rip as u32;
    image.eflags = cpu.rflags.materialize() as u32;
    image.eax = gprs[0] as u32;
    image.ecx = gprs[1] as u32;
    image.edx = gprs[2] as u32;
    image.ebx = gprs[3] as u32;
    image.esp = gprs[4] as u32;
    image.ebp = gprs[5] as u32;
    image.esi = gprs[6] as u32;
    image.edi = gprs[7] as u32;
    image.es = u32::from(cpu.segment(SegReg::Es).selector);
    image.cs = u32::from(cpu.segment(SegReg::Cs).selector);
    image.ss = u32::from(cpu.segment(SegReg::Ss).selector);
    image.ds = u32::from(cpu.segment(SegReg::Ds).selector);
    image.fs = u32::from(cpu.segment(SegReg::Fs).selector);
    image.gs = u32::from(cpu.segment(SegReg::Gs).selector);
}

fn load_segment(
    cpu: &EmulatedCpuState,
    mem: &mut impl GuestPhysMemory,
    selector: u16,
) -> Result<SegmentCache, Exception> {
    if cpu.rflags.vm() {
        return Ok(SegmentCache::real_mode(selector, 0xf3));
    }
    if selector & !3 == 0 {
        return Ok(SegmentCache {
            selector,
            ..SegmentCache::unusable()
        });
    }
    Ok(read_descriptor(cpu, mem, selector)?.to_cache(selector))
}

fn load_state(
    cpu: &mut EmulatedCpuState,
    mem: &mut impl GuestPhysMemory,
    image: &TssImage,
) -> Result<(), Exception> {
    cpu.control.cr3 = u64::from(image.cr3);
    cpu.rip = u64::from(image.eip);
    cpu.rflags = Rflags::from_raw(u64::from(image.eflags));
    let regs = [
        image.eax, image.ecx, image.edx, image.ebx, image.esp, image.ebp, image.esi, image.edi,
    ];
    for (i, val) in regs.into_iter().enumerate() {
        cpu.write_gpr(i as u8, 4, u64::from(val));
    }

    // The LDT goes first: the segment selectors below may point into it.
    let ldt = image.ldt as u16;
    cpu.ldtr = if ldt & !3 == 0 || cpu.rflags.vm() {
        SegmentCache {
            selector: ldt,
            ..SegmentCache::unusable()
        }
    } else {
        if ldt & 4 != 0 {
            return Err(Exception::InvalidTss(ldt & !3));
        }
        read_descriptor(cpu, mem, ldt)?.to_cache(ldt)
    };

    let selectors = [
        (SegReg::Es, image.es),
        (SegReg::Cs, image.cs),
        (SegReg::Ss, image.ss),
        (SegReg::Ds, image.ds),
        (SegReg::Fs, image.fs),
        (SegReg::Gs, image.gs),
    ];
    for (seg, selector) in selectors {
        let cache = load_segment(cpu, mem, selector as u16)?;
        cpu.set_segment(seg, cache);
    }
    Ok(())
}

/// Switch from the task in TR to the one `selector` names.
///
/// `gate_vector` is the IDT vector when the switch happens while delivering an
/// event through a task gate. On success the emulated state holds the incoming
/// task and must be pushed to the hardware.
pub fn task_switch(
    cpu: &mut EmulatedCpuState,
    mem: &mut impl GuestPhysMemory,
    selector: u16,
    reason: TaskSwitchReason,
    gate_vector: Option<u8>,
) -> Result<(), TaskSwitchError> {
    let old_selector = cpu.tr.selector;
    let old_base = cpu.tr.base;

    let mut next = read_descriptor(cpu, mem, selector)?;
    let mut current = read_descriptor(cpu, mem, old_selector)?;

    if let (TaskSwitchReason::IdtGate, Some(vector)) = (reason, gate_vector) {
        let mut raw = [0u8; 8];
        read_linear(
            mem,
            &cpu.paging_regs(),
            cpu.idtr.base.wrapping_add(u64::from(vector) * 8),
            &mut raw,
            AccessType::Read,
            0,
        )
        .map_err(Exception::from)?;
        let dpl = SegmentDescriptor::from_raw(u64::from_le_bytes(raw)).dpl();
        let cs_rpl = (cpu.segment(SegReg::Cs).selector & 3) as u8;
        if (selector & 3) as u8 > dpl || cs_rpl > dpl {
            warn!(vector, dpl, selector, "task gate privilege check failed");
        }
    }

    let limit = next.limit();
    if !next.is_present()
        || !(next.is_tss32() || next.is_tss16())
        || (next.is_tss32() && limit < TSS32_MIN_LIMIT)
        || limit < TSS16_MIN_LIMIT
    {
        return Err(TaskSwitchError::InvalidTss { selector });
    }
    if next.is_tss16() {
        return Err(TaskSwitchError::Tss16Unsupported { selector });
    }

    debug!(from = old_selector, to = selector, ?reason, "task switch");

    if matches!(reason, TaskSwitchReason::Iret | TaskSwitchReason::Jmp) {
        current.set_busy(false);
        write_descriptor(cpu, mem, old_selector, current)?;
    }
    if reason == TaskSwitchReason::Iret {
        cpu.rflags.set(RFLAGS_NT, false);
    }
    if reason != TaskSwitchReason::Iret {
        next.set_busy(true);
        write_descriptor(cpu, mem, selector, next)?;
    }

    // Only the dynamic fields of the outgoing TSS are written back.
    let mut outgoing = read_tss(cpu, mem, old_base)?;
    save_state(cpu, &mut outgoing);
    let regs = cpu.paging_regs();
    write_linear(
        mem,
        &regs,
        old_base.wrapping_add(TSS32_EIP_OFFSET as u64),
        &bytemuck::bytes_of(&outgoing)[TSS32_EIP_OFFSET..TSS32_LDT_OFFSET],
        0,
    )
    .map_err(Exception::from)?;

    let new_base = u64::from(next.base());
    let mut incoming = read_tss(cpu, mem, new_base)?;
    if reason.nests() {
        incoming.prev_tss = u32::from(old_selector);
        write_linear(mem, &regs, new_base, &incoming.prev_tss.to_le_bytes(), 0)
            .map_err(Exception::from)?;
    }

    load_state(cpu, mem, &incoming)?;
    if reason.nests() {
        cpu.rflags.set(RFLAGS_NT, true);
    }

    cpu.control.cr0 |= CR0_TS;
    next.set_busy(true);
    cpu.tr = next.to_cache(selector);
    cpu.flush_tlb = true;
    cpu.dirty = true;
    Ok(())
}
