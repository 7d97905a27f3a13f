//! Event bookkeeping across VM exits and the injection decision before entry.

use hvx_cpu::{EmulatedCpuState, EventType, Interruptibility, PendingEvent, Platform};
use tracing::{debug, trace, warn};

use crate::handle::{HvError, VcpuHandle};
use crate::vmcs::{
    CpuBasedControls, VmcsField, INTR_INFO_ERROR_CODE_VALID, INTR_INFO_TYPE_MASK,
    INTR_INFO_TYPE_SHIFT, INTR_INFO_VALID, INTR_INFO_VECTOR_MASK,
};

/// Decode an interruption-information word into an event. The error code is
/// supplied by the caller when bit 11 is set.
pub fn decode_interruption_info(
    info: u32,
    error_code: impl FnOnce() -> Result<u32, HvError>,
    instruction_len: u32,
) -> Result<Option<PendingEvent>, HvError> {
    if info & INTR_INFO_VALID == 0 {
        return Ok(None);
    }
    let bits = ((info & INTR_INFO_TYPE_MASK) >> INTR_INFO_TYPE_SHIFT) as u8;
    let Some(kind) = EventType::from_bits(bits) else {
        warn!(info, "dropping event with reserved interruption type");
        return Ok(None);
    };
    let error_code = if info & INTR_INFO_ERROR_CODE_VALID != 0 {
        Some(error_code()?)
    } else {
        None
    };
    Ok(Some(PendingEvent {
        kind,
        vector: (info & INTR_INFO_VECTOR_MASK) as u8,
        error_code,
        instruction_len: if kind.carries_instruction_length() {
            instruction_len
        } else {
            0
        },
    }))
}

/// The interruption-information word that injects `event`.
pub fn interruption_info(event: &PendingEvent) -> u32 {
    let mut info =
        INTR_INFO_VALID
            | (u32::from(event.kind as u8) << INTR_INFO_TYPE_SHIFT)
            | u32::from(event.vector);
    if event.error_code.is_some() {
        info |= INTR_INFO_ERROR_CODE_VALID;
    }
    info
}

/// Rebuild the injection slot and interruptibility after an exit.
///
/// An event whose delivery the exit interrupted is reported through the
/// IDT-vectoring field and goes back into the slot so the next entry retries
/// it.
pub fn store_events<H: VcpuHandle>(
    handle: &H,
    cpu: &mut EmulatedCpuState,
    idt_vectoring: u32,
    instruction_len: u32,
) -> Result<(), HvError> {
    cpu.injected = decode_interruption_info(
        idt_vectoring,
        || Ok(handle.read_vmcs(VmcsField::IDT_VECTORING_ERROR_CODE)? as u32),
        instruction_len,
    )?;
    if let Some(event) = &cpu.injected {
        trace!(vector = event.vector, kind = ?event.kind, "event delivery interrupted by exit");
    }
    cpu.interruptibility = Interruptibility::from_bits_retain(
        handle.read_vmcs(VmcsField::GUEST_INTERRUPTIBILITY)? as u32,
    );
    Ok(())
}

fn update_controls<H: VcpuHandle>(
    handle: &mut H,
    bits: CpuBasedControls,
    on: bool,
) -> Result<(), HvError> {
    let raw = handle.read_vmcs(VmcsField::CPU_BASED_VM_EXEC_CONTROL)? as u32;
    let mut controls = CpuBasedControls::from_bits_retain(raw);
    controls.set(bits, on);
    if controls.bits() != raw {
        handle.write_vmcs(
            VmcsField::CPU_BASED_VM_EXEC_CONTROL,
            u64::from(controls.bits()),
        )?;
    }
    Ok(())
}

pub fn set_interrupt_window_exiting<H: VcpuHandle>(
    handle: &mut H,
    on: bool,
) -> Result<(), HvError> {
    update_controls(handle, CpuBasedControls::INTR_WINDOW_EXITING, on)
}

pub fn set_nmi_window_exiting<H: VcpuHandle>(handle: &mut H, on: bool) -> Result<(), HvError> {
    update_controls(handle, CpuBasedControls::NMI_WINDOW_EXITING, on)
}

/// Set or clear blocking-by-NMI in the guest interruptibility state.
pub fn set_nmi_blocking<H: VcpuHandle>(
    handle: &mut H,
    cpu: &mut EmulatedCpuState,
    blocked: bool,
) -> Result<(), HvError> {
    cpu.interruptibility.set(Interruptibility::NMI, blocked);
    handle.write_vmcs(
        VmcsField::GUEST_INTERRUPTIBILITY,
        u64::from(cpu.interruptibility.bits()),
    )
}

fn write_entry_event<H: VcpuHandle>(
    handle: &mut H,
    cpu: &mut EmulatedCpuState,
    event: &PendingEvent,
) -> Result<(), HvError> {
    debug!(vector = event.vector, kind = ?event.kind, "injecting event");
    if event.kind == EventType::Nmi {
        set_nmi_blocking(handle, cpu, false)?;
    }
    if let Some(code) = event.error_code {
        handle.write_vmcs(VmcsField::VM_ENTRY_EXCEPTION_ERROR_CODE, u64::from(code))?;
    }
    if event.kind.carries_instruction_length() {
        handle.write_vmcs(
            VmcsField::VM_ENTRY_INSTRUCTION_LEN,
            u64::from(event.instruction_len),
        )?;
    }
    handle.write_vmcs(VmcsField::VM_ENTRY_INTR_INFO, u64::from(interruption_info(event)))
}

/// Pick what the next VM entry delivers.
///
/// Priority: the event already in the slot, then a deferred interrupt or
/// NMI, then a pending NMI, then the highest maskable interrupt. Anything
/// that cannot go in now requests the matching window exit instead.
pub fn inject<H: VcpuHandle, P: Platform>(
    handle: &mut H,
    platform: &mut P,
    cpu: &mut EmulatedCpuState,
) -> Result<(), HvError> {
    let mut injected = false;

    if let Some(event) = cpu.injected.take() {
        write_entry_event(handle, cpu, &event)?;
        injected = true;
    }

    if let Some(event) = cpu.deferred {
        let nmi = event.kind == EventType::Nmi;
        let open = if nmi {
            !cpu.interruptibility.contains(Interruptibility::NMI)
        } else {
            cpu.rflags.if_flag() && !cpu.interruptibility.intersects(Interruptibility::SHADOW)
        };
        if !injected && open {
            cpu.deferred = None;
            write_entry_event(handle, cpu, &event)?;
            injected = true;
        } else if nmi {
            set_nmi_window_exiting(handle, true)?;
        } else {
            set_interrupt_window_exiting(handle, true)?;
        }
    }

    if platform.nmi_pending() {
        if !injected && !cpu.interruptibility.contains(Interruptibility::NMI) {
            platform.take_nmi();
            debug!("injecting nmi");
            let info = interruption_info(&PendingEvent::nmi());
            handle.write_vmcs(VmcsField::VM_ENTRY_INTR_INFO, u64::from(info))?;
            injected = true;
        } else {
            set_nmi_window_exiting(handle, true)?;
        }
    }

    if !injected
        && !cpu.interruptibility.intersects(Interruptibility::SHADOW)
        && cpu.rflags.if_flag()
        && platform.highest_pending_irq().is_some()
    {
        if let Some(vector) = platform.poll_irq() {
            trace!(vector, "injecting external interrupt");
            let info = interruption_info(&PendingEvent::external(vector));
            handle.write_vmcs(VmcsField::VM_ENTRY_INTR_INFO, u64::from(info))?;
        }
    }

    if platform.highest_pending_irq().is_some() {
        set_interrupt_window_exiting(handle, true)?;
    }
    Ok(())
}
