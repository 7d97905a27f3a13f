//! Copying architectural state between [`EmulatedCpuState`] and the hardware.
//!
//! `pull` followed by `push` with no guest execution in between leaves every
//! synchronized field unchanged. CR0 and CR4 always go through [`set_cr0`] and
//! [`set_cr4`] so the guest/host masks and read shadows stay consistent.

use hvx_cpu::msr::{
    IA32_CSTAR, IA32_FMASK, IA32_KERNEL_GS_BASE, IA32_LSTAR, IA32_STAR, IA32_SYSENTER_CS,
    IA32_SYSENTER_EIP, IA32_SYSENTER_ESP,
};
use hvx_cpu::state::{CR0_ET, CR0_NE};
use hvx_cpu::{DescriptorTableReg, EmulatedCpuState, Interruptibility, Rflags, SegmentCache};
use hvx_mmu::{GuestPhysMemory, CR0_PG, CR4_PAE, EFER_LMA, EFER_LME};
use hvx_x86::SegReg;
use tracing::trace;

use crate::handle::{HvError, HvReg, VcpuHandle};
use crate::vmcs::{
    segment_fields, SegmentFields, VmEntryControls, VmcsField, AR_TYPE_BUSY_64_TSS, AR_TYPE_MASK,
    AR_UNUSABLE, CR0_HOST_OWNED, CR4_HOST_OWNED, LDTR_FIELDS, TR_FIELDS,
};

const SEGMENTS: [SegReg; 6] = [
    SegReg::Es,
    SegReg::Cs,
    SegReg::Ss,
    SegReg::Ds,
    SegReg::Fs,
    SegReg::Gs,
];

/// MSRs the hardware switches on entry and exit.
pub const NATIVE_MSRS: [u32; 8] = [
    IA32_STAR,
    IA32_LSTAR,
    IA32_CSTAR,
    IA32_FMASK,
    IA32_KERNEL_GS_BASE,
    IA32_SYSENTER_CS,
    IA32_SYSENTER_ESP,
    IA32_SYSENTER_EIP,
];

/// Pack a segment cache into the VMX access-rights format.
///
/// Outside real mode a null selector in a data or code segment register is
/// unusable. TR is exempt: it is usable after reset with a null selector.
/// An unusable segment encodes as the unusable bit alone.
pub fn access_rights(seg: &SegmentCache, real_mode: bool, is_tr: bool) -> u32 {
    let null_unusable = seg.selector == 0 && !real_mode && !is_tr;
    if seg.unusable || null_unusable {
        return AR_UNUSABLE;
    }
    u32::from(seg.access) | (u32::from(seg.flags & 0xf) << 12)
}

fn segment_from_vmx(selector: u64, base: u64, limit: u64, ar: u64) -> SegmentCache {
    let ar = ar as u32;
    SegmentCache {
        selector: selector as u16,
        base,
        limit: limit as u32,
        access: ar as u8,
        flags: ((ar >> 12) & 0xf) as u8,
        unusable: ar & AR_UNUSABLE != 0,
    }
}

fn write_segment<H: VcpuHandle>(
    handle: &mut H,
    fields: SegmentFields,
    seg: &SegmentCache,
    ar: u32,
) -> Result<(), HvError> {
    handle.write_vmcs(fields.selector, u64::from(seg.selector))?;
    handle.write_vmcs(fields.base, seg.base)?;
    handle.write_vmcs(fields.limit, u64::from(seg.limit))?;
    handle.write_vmcs(fields.access_rights, u64::from(ar))
}

fn read_segment<H: VcpuHandle>(handle: &H, fields: SegmentFields) -> Result<SegmentCache, HvError> {
    Ok(segment_from_vmx(
        handle.read_vmcs(fields.selector)?,
        handle.read_vmcs(fields.base)?,
        handle.read_vmcs(fields.limit)?,
        handle.read_vmcs(fields.access_rights)?,
    ))
}

fn masked_read<H: VcpuHandle>(
    handle: &H,
    guest: VmcsField,
    mask: VmcsField,
    shadow: VmcsField,
) -> Result<u64, HvError> {
    let mask = handle.read_vmcs(mask)?;
    Ok((handle.read_vmcs(shadow)? & mask) | (handle.read_vmcs(guest)? & !mask))
}

/// CR0 as the guest sees it.
pub fn read_cr0<H: VcpuHandle>(handle: &H) -> Result<u64, HvError> {
    masked_read(
        handle,
        VmcsField::GUEST_CR0,
        VmcsField::CR0_GUEST_HOST_MASK,
        VmcsField::CR0_READ_SHADOW,
    )
}

/// CR4 as the guest sees it.
pub fn read_cr4<H: VcpuHandle>(handle: &H) -> Result<u64, HvError> {
    masked_read(
        handle,
        VmcsField::GUEST_CR4,
        VmcsField::CR4_GUEST_HOST_MASK,
        VmcsField::CR4_READ_SHADOW,
    )
}

/// Load guest CR0.
///
/// PG, CD, NW, NE and ET are host-owned: the guest reads them from the shadow
/// while the hardware runs with NE and ET forced on. Turning paging on or off
/// with EFER.LME set enters or leaves IA-32e mode. Returns the resulting EFER.
pub fn set_cr0<H: VcpuHandle>(
    handle: &mut H,
    mem: &mut impl GuestPhysMemory,
    cr0: u64,
) -> Result<u64, HvError> {
    let mut efer = handle.read_vmcs(VmcsField::GUEST_IA32_EFER)?;
    let changed = handle.read_vmcs(VmcsField::GUEST_CR0)? ^ cr0;

    if cr0 & CR0_PG != 0
        && handle.read_vmcs(VmcsField::GUEST_CR4)? & CR4_PAE != 0
        && efer & EFER_LME == 0
    {
        let pdpt = handle.read_vmcs(VmcsField::GUEST_CR3)? & !0x1f;
        for (i, field) in VmcsField::GUEST_PDPTE.into_iter().enumerate() {
            handle.write_vmcs(field, mem.read_u64(pdpt + 8 * i as u64))?;
        }
    }

    handle.write_vmcs(VmcsField::CR0_GUEST_HOST_MASK, CR0_HOST_OWNED)?;
    handle.write_vmcs(VmcsField::CR0_READ_SHADOW, cr0)?;

    let mut entry =
        VmEntryControls::from_bits_retain(handle.read_vmcs(VmcsField::VM_ENTRY_CONTROLS)? as u32);
    if efer & EFER_LME != 0 {
        if changed & CR0_PG != 0 {
            if cr0 & CR0_PG != 0 {
                trace!(cr0, "entering long mode");
                efer |= EFER_LMA;
                entry.insert(VmEntryControls::IA32E_MODE_GUEST);
                let ar = handle.read_vmcs(VmcsField::GUEST_TR_AR)? as u32;
                if ar & AR_TYPE_MASK != AR_TYPE_BUSY_64_TSS {
                    handle.write_vmcs(
                        VmcsField::GUEST_TR_AR,
                        u64::from((ar & !AR_TYPE_MASK) | AR_TYPE_BUSY_64_TSS),
                    )?;
                }
            } else {
                trace!(cr0, "leaving long mode");
                efer &= !EFER_LMA;
                entry.remove(VmEntryControls::IA32E_MODE_GUEST);
            }
            handle.write_vmcs(VmcsField::GUEST_IA32_EFER, efer)?;
        }
    } else {
        entry.remove(VmEntryControls::IA32E_MODE_GUEST);
    }
    handle.write_vmcs(VmcsField::VM_ENTRY_CONTROLS, u64::from(entry.bits()))?;

    let guest = cr0 & !(CR0_HOST_OWNED & !CR0_PG);
    handle.write_vmcs(VmcsField::GUEST_CR0, guest | CR0_NE | CR0_ET)?;
    handle.invalidate_tlb()?;
    Ok(efer)
}

/// Load guest CR4. VMXE stays set underneath and hidden from the guest.
pub fn set_cr4<H: VcpuHandle>(handle: &mut H, cr4: u64) -> Result<(), HvError> {
    handle.write_vmcs(VmcsField::GUEST_CR4, cr4 | CR4_HOST_OWNED)?;
    handle.write_vmcs(VmcsField::CR4_READ_SHADOW, cr4)?;
    handle.write_vmcs(VmcsField::CR4_GUEST_HOST_MASK, CR4_HOST_OWNED)?;
    handle.invalidate_tlb()
}

/// GPRs, RIP and RFLAGS into the hardware.
pub fn push_regs<H: VcpuHandle>(handle: &mut H, cpu: &mut EmulatedCpuState) -> Result<(), HvError> {
    for (i, &val) in cpu.gprs().iter().enumerate() {
        handle.write_reg(HvReg::Gpr(i as u8), val)?;
    }
    handle.write_reg(HvReg::Rip, cpu.rip)?;
    handle.write_reg(HvReg::Rflags, cpu.rflags.materialize())
}

/// GPRs, RIP and RFLAGS from the hardware.
pub fn pull_regs<H: VcpuHandle>(handle: &H, cpu: &mut EmulatedCpuState) -> Result<(), HvError> {
    for i in 0..16u8 {
        cpu.gprs_mut()[usize::from(i)] = handle.read_reg(HvReg::Gpr(i))?;
    }
    cpu.rip = handle.read_reg(HvReg::Rip)?;
    cpu.rflags = Rflags::from_raw(handle.read_reg(HvReg::Rflags)?);
    Ok(())
}

/// Write the whole emulated state into the hardware and clear `dirty`.
pub fn push<H: VcpuHandle>(
    handle: &mut H,
    mem: &mut impl GuestPhysMemory,
    cpu: &mut EmulatedCpuState,
) -> Result<(), HvError> {
    push_regs(handle, cpu)?;

    let real_mode = !cpu.protected_mode();
    for seg in SEGMENTS {
        let cache = *cpu.segment(seg);
        let ar = access_rights(&cache, real_mode, false);
        write_segment(handle, segment_fields(seg), &cache, ar)?;
    }
    write_segment(handle, LDTR_FIELDS, &cpu.ldtr, access_rights(&cpu.ldtr, real_mode, false))?;
    write_segment(handle, TR_FIELDS, &cpu.tr, access_rights(&cpu.tr, real_mode, true))?;

    handle.write_vmcs(VmcsField::GUEST_GDTR_BASE, cpu.gdtr.base)?;
    handle.write_vmcs(VmcsField::GUEST_GDTR_LIMIT, u64::from(cpu.gdtr.limit))?;
    handle.write_vmcs(VmcsField::GUEST_IDTR_BASE, cpu.idtr.base)?;
    handle.write_vmcs(VmcsField::GUEST_IDTR_LIMIT, u64::from(cpu.idtr.limit))?;

    handle.write_reg(HvReg::Cr2, cpu.control.cr2)?;
    handle.write_vmcs(VmcsField::GUEST_CR3, cpu.control.cr3)?;
    handle.write_reg(HvReg::Tpr, (cpu.control.cr8 & 0xf) << 4)?;
    handle.write_vmcs(VmcsField::GUEST_IA32_EFER, cpu.efer)?;
    for (field, &pdpte) in VmcsField::GUEST_PDPTE.into_iter().zip(cpu.pdptes.iter()) {
        handle.write_vmcs(field, pdpte)?;
    }
    set_cr4(handle, cpu.control.cr4)?;
    cpu.efer = set_cr0(handle, mem, cpu.control.cr0)?;
    if cpu.long_mode_active() {
        cpu.tr = read_segment(handle, TR_FIELDS)?;
    }

    handle.write_reg(HvReg::Xcr0, cpu.xcr0)?;
    handle.write_xsave(&cpu.xsave)?;
    for (i, &dr) in cpu.dr.iter().enumerate() {
        handle.write_reg(HvReg::Dr(i as u8), dr)?;
    }

    let msrs = &cpu.msrs;
    let values = [
        msrs.star,
        msrs.lstar,
        msrs.cstar,
        msrs.fmask,
        msrs.kernel_gs_base,
        msrs.sysenter_cs,
        msrs.sysenter_esp,
        msrs.sysenter_eip,
    ];
    for (msr, value) in NATIVE_MSRS.into_iter().zip(values) {
        handle.write_msr(msr, value)?;
    }

    handle.write_vmcs(VmcsField::TSC_OFFSET, cpu.tsc_offset)?;
    handle.write_vmcs(
        VmcsField::GUEST_INTERRUPTIBILITY,
        u64::from(cpu.interruptibility.bits()),
    )?;

    if cpu.flush_tlb {
        handle.invalidate_tlb()?;
        cpu.flush_tlb = false;
    }
    cpu.dirty = false;
    Ok(())
}

/// Refresh the whole emulated state from the hardware.
pub fn pull<H: VcpuHandle>(handle: &H, cpu: &mut EmulatedCpuState) -> Result<(), HvError> {
    pull_regs(handle, cpu)?;

    for seg in SEGMENTS {
        cpu.set_segment(seg, read_segment(handle, segment_fields(seg))?);
    }
    cpu.ldtr = read_segment(handle, LDTR_FIELDS)?;
    cpu.tr = read_segment(handle, TR_FIELDS)?;

    cpu.gdtr = DescriptorTableReg {
        base: handle.read_vmcs(VmcsField::GUEST_GDTR_BASE)?,
        limit: handle.read_vmcs(VmcsField::GUEST_GDTR_LIMIT)? as u16,
    };
    cpu.idtr = DescriptorTableReg {
        base: handle.read_vmcs(VmcsField::GUEST_IDTR_BASE)?,
        limit: handle.read_vmcs(VmcsField::GUEST_IDTR_LIMIT)? as u16,
    };

    cpu.control.cr0 = read_cr0(handle)?;
    cpu.control.cr2 = handle.read_reg(HvReg::Cr2)?;
    cpu.control.cr3 = handle.read_vmcs(VmcsField::GUEST_CR3)?;
    cpu.control.cr4 = read_cr4(handle)?;
    cpu.control.cr8 = handle.read_reg(HvReg::Tpr)? >> 4;
    cpu.efer = handle.read_vmcs(VmcsField::GUEST_IA32_EFER)?;
    for (slot, field) in cpu.pdptes.iter_mut().zip(VmcsField::GUEST_PDPTE) {
        *slot = handle.read_vmcs(field)?;
    }

    cpu.xcr0 = handle.read_reg(HvReg::Xcr0)?;
    handle.read_xsave(&mut cpu.xsave)?;
    for (i, dr) in cpu.dr.iter_mut().enumerate() {
        *dr = handle.read_reg(HvReg::Dr(i as u8))?;
    }

    let mut values = [0u64; NATIVE_MSRS.len()];
    for (value, msr) in values.iter_mut().zip(NATIVE_MSRS) {
        *value = handle.read_msr(msr)?;
    }
    let [star, lstar, cstar, fmask, kernel_gs_base, sysenter_cs, sysenter_esp, sysenter_eip] =
        values;
    let msrs = &mut cpu.msrs;
    msrs.star = star;
    msrs.lstar = lstar;
    msrs.cstar = cstar;
    msrs.fmask = fmask;
    msrs.kernel_gs_base = kernel_gs_base;
    msrs.sysenter_cs = sysenter_cs;
    msrs.sysenter_esp = sysenter_esp;
    msrs.sysenter_eip = sysenter_eip;

    cpu.tsc_offset = handle.read_vmcs(VmcsField::TSC_OFFSET)?;
    cpu.interruptibility = Interruptibility::from_bits_retain(
        handle.read_vmcs(VmcsField::GUEST_INTERRUPTIBILITY)? as u32,
    );
    cpu.dirty = false;
    Ok(())
}

/// Move RIP past an instruction the exit handler retired, dropping any
/// STI/MOV SS shadow it was under.
pub fn advance_rip<H: VcpuHandle>(handle: &mut H, rip: u64, len: u64) -> Result<(), HvError> {
    handle.write_reg(HvReg::Rip, rip.wrapping_add(len))?;
    let state = handle.read_vmcs(VmcsField::GUEST_INTERRUPTIBILITY)?;
    let cleared = state & !u64::from(Interruptibility::SHADOW.bits());
    if cleared != state {
        handle.write_vmcs(VmcsField::GUEST_INTERRUPTIBILITY, cleared)?;
    }
    Ok(())
}
