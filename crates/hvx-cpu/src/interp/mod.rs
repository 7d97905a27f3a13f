//! Instruction emulation for exits the hardware could not retire itself.
//!
//! Operands are resolved into a [`Loc`] first and then read or written through
//! one entry point each, so the same handler serves register and memory forms.
//! Every guest memory access goes through the page walker.

mod alu;
mod string;

use hvx_mmu::{read_linear, translate, write_linear, AccessType, TranslateFault, PAGE_SIZE};
use hvx_x86::{
    decode, Command, CpuMode, DecodeError, DecodedInstruction, MemoryOperand, OperandKind,
    Register, SegReg, MAX_INST_LEN,
};
use thiserror::Error;
use tracing::{trace, warn};

use crate::exception::PendingEvent;
use crate::flags::{
    width_mask, LazyFlags, RFLAGS_CF, RFLAGS_DF, RFLAGS_IF, RFLAGS_IOPL_MASK, RFLAGS_RESERVED1,
};
use crate::msr::{simulate_rdmsr, simulate_wrmsr};
use crate::platform::{IoDirection, Platform};
use crate::state::{EmulatedCpuState, Gpr, Interruptibility};
use crate::Exception;

pub(crate) use alu::{binary, shift, ShiftFlags};

/// What [`execute`] did with an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executed {
    Retired,
    /// HLT retired; the vCPU should stop until an interrupt arrives.
    Halted,
    /// CPUID retired without results; the caller fills EAX-EDX.
    Cpuid,
    /// MOV to CR0/CR3/CR4 retired; `value` still has to go through the
    /// masked control-register setters.
    ControlRegisterWrite { cr: u8, value: u64 },
    /// The instruction faulted. The exception is queued and RIP is unchanged.
    Faulted(Exception),
    /// Decoded but not emulated. RIP was advanced past it.
    Unimplemented(Command),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmulationError {
    #[error("cannot decode instruction at rip {rip:#x} (bytes {bytes:02x?}): {source}")]
    Decode {
        rip: u64,
        bytes: Vec<u8>,
        #[source]
        source: DecodeError,
    },
    #[error("unsupported operand form in `{0}`")]
    BadOperands(DecodedInstruction),
}

enum Stop {
    Fault(Exception),
    Error(EmulationError),
}

impl From<Exception> for Stop {
    fn from(exception: Exception) -> Self {
        Stop::Fault(exception)
    }
}

impl From<TranslateFault> for Stop {
    fn from(fault: TranslateFault) -> Self {
        Stop::Fault(fault.into())
    }
}

impl From<EmulationError> for Stop {
    fn from(err: EmulationError) -> Self {
        Stop::Error(err)
    }
}

type Flow<T> = Result<T, Stop>;

/// A resolved operand.
#[derive(Debug, Clone, Copy)]
enum Loc {
    Reg(Register),
    /// Linear address.
    Mem(u64),
    Imm(u64),
}

/// Fetch, decode and execute the instruction at CS:RIP.
pub fn emulate_one<P: Platform>(
    cpu: &mut EmulatedCpuState,
    platform: &mut P,
) -> Result<Executed, EmulationError> {
    let mut bytes = [0u8; MAX_INST_LEN];
    let (len, fetch_fault) = fetch(cpu, platform, &mut bytes);
    match (decode(&bytes[..len], cpu.mode()), fetch_fault) {
        (Ok(inst), _) => execute(cpu, platform, &inst),
        (Err(DecodeError::UnexpectedEof { .. }), Some(fault)) => {
            cpu.raise(fault);
            Ok(Executed::Faulted(fault))
        }
        (Err(source), _) => Err(EmulationError::Decode {
            rip: cpu.rip,
            bytes: bytes[..len].to_vec(),
            source,
        }),
    }
}

/// Copy up to 15 instruction bytes from CS:RIP. Stops at the first page that
/// does not translate and returns that fault alongside the bytes read.
pub fn fetch<P: Platform>(
    cpu: &EmulatedCpuState,
    platform: &mut P,
    buf: &mut [u8; MAX_INST_LEN],
) -> (usize, Option<Exception>) {
    let regs = cpu.paging_regs();
    let cpl = cpu.cpl();
    let mut lin = cpu.linear_address(SegReg::Cs, cpu.rip);
    let mut done = 0;
    while done < MAX_INST_LEN {
        let in_page = (PAGE_SIZE - (lin & (PAGE_SIZE - 1))) as usize;
        let take = in_page.min(MAX_INST_LEN - done);
        if let Err(fault) = read_linear(
            platform,
            &regs,
            lin,
            &mut buf[done..done + take],
            AccessType::Execute,
            cpl,
        ) {
            return (done, Some(fault.into()));
        }
        done += take;
        lin = lin.wrapping_add(take as u64);
    }
    (done, None)
}

/// Execute one decoded instruction against `cpu` and `platform`.
///
/// RIP advances by `inst.len` unless the instruction transfers control or
/// faults. Faults with architectural meaning are queued for injection and
/// reported as [`Executed::Faulted`]; only states the core cannot express are
/// returned as errors.
pub fn execute<P: Platform>(
    cpu: &mut EmulatedCpuState,
    platform: &mut P,
    inst: &DecodedInstruction,
) -> Result<Executed, EmulationError> {
    let mode = cpu.mode();
    let next_rip = cpu.rip.wrapping_add(u64::from(inst.len)) & ip_mask(mode);
    trace!(rip = cpu.rip, %inst, "emulate");

    let mut exec = Exec {
        cpu,
        platform,
        inst,
        mode,
        next_rip,
        branch: None,
    };
    let shadow = exec.cpu.interruptibility & Interruptibility::SHADOW;
    exec.cpu.interruptibility.remove(Interruptibility::SHADOW);

    match exec.run() {
        Ok(done) => {
            let target = exec.branch.unwrap_or(next_rip);
            let cpu = exec.cpu;
            cpu.rip = target;
            cpu.dirty = true;
            if let Executed::Unimplemented(cmd) = done {
                warn!(rip = cpu.rip, ?cmd, %inst, "instruction not emulated; skipped");
            }
            Ok(done)
        }
        Err(Stop::Fault(exception)) => {
            let cpu = exec.cpu;
            cpu.interruptibility |= shadow;
            trace!(rip = cpu.rip, %exception, "emulated instruction faulted");
            cpu.raise(exception);
            Ok(Executed::Faulted(exception))
        }
        Err(Stop::Error(err)) => {
            exec.cpu.interruptibility |= shadow;
            Err(err)
        }
    }
}

fn ip_mask(mode: CpuMode) -> u64 {
    match mode {
        CpuMode::Long64 => u64::MAX,
        _ => width_mask(mode.default_size() * 8),
    }
}

struct Exec<'a, P> {
    cpu: &'a mut EmulatedCpuState,
    platform: &'a mut P,
    inst: &'a DecodedInstruction,
    mode: CpuMode,
    next_rip: u64,
    branch: Option<u64>,
}

impl<P: Platform> Exec<'_, P> {
    fn bad_operands(&self) -> Stop {
        EmulationError::BadOperands(*self.inst).into()
    }

    fn effective_address(&self, m: &MemoryOperand) -> u64 {
        let cpu = &*self.cpu;
        m.effective_address(
            |r| cpu.read_gpr(r, 8),
            self.next_rip,
            self.inst.address_size,
        )
    }

    fn locate(&self, index: usize) -> Flow<Loc> {
        let op = self.inst.operands[index];
        Ok(match op.kind {
            OperandKind::Register(reg) => Loc::Reg(reg),
            OperandKind::Immediate(v) => Loc::Imm(v),
            OperandKind::Memory(m) => {
                Loc::Mem(self.cpu.linear_address(m.segment, self.effective_address(&m)))
            }
            OperandKind::Offset(o) => {
                let offset = o.offset & width_mask(self.inst.address_size * 8);
                Loc::Mem(self.cpu.linear_address(o.segment, offset))
            }
            _ => return Err(self.bad_operands()),
        })
    }

    fn size(&self, index: usize) -> u8 {
        self.inst.operands[index].size
    }

    fn read_mem(&mut self, lin: u64, size: u8) -> Flow<u64> {
        let mut buf = [0u8; 8];
        read_linear(
            self.platform,
            &self.cpu.paging_regs(),
            lin,
            &mut buf[..usize::from(size)],
            AccessType::Read,
            self.cpu.cpl(),
        )?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_mem(&mut self, lin: u64, size: u8, val: u64) -> Flow<()> {
        let bytes = val.to_le_bytes();
        write_linear(
            self.platform,
            &self.cpu.paging_regs(),
            lin,
            &bytes[..usize::from(size)],
            self.cpu.cpl(),
        )?;
        Ok(())
    }

    /// Fault now if `size` bytes at `lin` could not be written.
    fn probe_write(&mut self, lin: u64, size: u8) -> Flow<()> {
        let regs = self.cpu.paging_regs();
        let cpl = self.cpu.cpl();
        let last = lin.wrapping_add(u64::from(size) - 1);
        translate(self.platform, &regs, lin, AccessType::Write, cpl)?;
        translate(self.platform, &regs, last, AccessType::Write, cpl)?;
        Ok(())
    }

    fn read(&mut self, loc: Loc, size: u8) -> Flow<u64> {
        match loc {
            Loc::Reg(reg) => Ok(self.cpu.read_register(reg, size)),
            Loc::Mem(lin) => self.read_mem(lin, size),
            Loc::Imm(v) => Ok(v & width_mask(size * 8)),
        }
    }

    fn write(&mut self, loc: Loc, size: u8, val: u64) -> Flow<()> {
        match loc {
            Loc::Reg(reg) => Ok(self.cpu.write_register(reg, size, val)?),
            Loc::Mem(lin) => self.write_mem(lin, size, val),
            Loc::Imm(_) => Err(self.bad_operands()),
        }
    }

    fn read_op(&mut self, index: usize) -> Flow<u64> {
        let loc = self.locate(index)?;
        self.read(loc, self.size(index))
    }

    fn write_op(&mut self, index: usize, val: u64) -> Flow<()> {
        let loc = self.locate(index)?;
        self.write(loc, self.size(index), val)
    }

    fn require_cpl0(&self) -> Flow<()> {
        if self.cpu.cpl() != 0 {
            return Err(Exception::gp0().into());
        }
        Ok(())
    }

    fn jump(&mut self, target: u64, size: u8) {
        self.branch = Some(if self.mode.is_long() && size == 8 {
            target
        } else {
            target & width_mask(size * 8)
        });
    }

    fn jump_relative(&mut self) -> Flow<()> {
        let disp = self.inst.operands[0]
            .immediate()
            .ok_or_else(|| self.bad_operands())?;
        self.jump(self.next_rip.wrapping_add(disp), self.inst.operand_size);
        Ok(())
    }

    fn push(&mut self, val: u64, size: u8) -> Flow<()> {
        let ss = self.cpu.stack_size();
        let sp = self
            .cpu
            .read_gpr(Gpr::Rsp as u8, ss)
            .wrapping_sub(u64::from(size))
            & width_mask(ss * 8);
        let lin = self.cpu.linear_address(SegReg::Ss, sp);
        self.write_mem(lin, size, val)?;
        self.cpu.write_gpr(Gpr::Rsp as u8, ss, sp);
        Ok(())
    }

    fn pop(&mut self, size: u8) -> Flow<u64> {
        let ss = self.cpu.stack_size();
        let sp = self.cpu.read_gpr(Gpr::Rsp as u8, ss);
        let lin = self.cpu.linear_address(SegReg::Ss, sp);
        let val = self.read_mem(lin, size)?;
        let sp = sp.wrapping_add(u64::from(size)) & width_mask(ss * 8);
        self.cpu.write_gpr(Gpr::Rsp as u8, ss, sp);
        Ok(val)
    }

    fn control_index(&self, index: usize) -> Flow<u8> {
        match self.inst.operands[index].kind {
            OperandKind::Register(Register::Control(n)) => match n {
                0 | 2 | 3 | 4 | 8 => Ok(n),
                _ => Err(Exception::InvalidOpcode.into()),
            },
            OperandKind::Register(Register::Debug(n)) => Ok(n),
            _ => Err(self.bad_operands()),
        }
    }

    fn run(&mut self) -> Flow<Executed> {
        let inst = self.inst;
        let cmd = inst.cmd;
        match cmd {
            Command::Mov | Command::Movzx => {
                let v = self.read_op(1)?;
                self.write_op(0, v)?;
            }
            Command::Movsx => {
                let v = alu::sign_extend(self.read_op(1)?, self.size(1));
                self.write_op(0, v)?;
            }
            Command::Lea => {
                let OperandKind::Memory(m) = inst.operands[1].kind else {
                    return Err(self.bad_operands());
                };
                let ea = self.effective_address(&m);
                self.write_op(0, ea)?;
            }
            Command::Add
            | Command::Or
            | Command::Adc
            | Command::Sbb
            | Command::And
            | Command::Sub
            | Command::Xor
            | Command::Cmp
            | Command::Test => {
                let size = self.size(0);
                let dst = self.locate(0)?;
                let a = self.read(dst, size)?;
                let b = self.read_op(1)?;
                let (r, lazy) = binary(cmd, a, b, self.cpu.rflags.cf(), size);
                if !matches!(cmd, Command::Cmp | Command::Test) {
                    self.write(dst, size, r)?;
                }
                self.cpu.rflags.set_lazy(lazy);
            }
            Command::Inc | Command::Dec => {
                let size = self.size(0);
                let width = size * 8;
                let dst = self.locate(0)?;
                let a = self.read(dst, size)?;
                let old_cf = self.cpu.rflags.cf();
                let (r, lazy) = if cmd == Command::Inc {
                    let r = a.wrapping_add(1) & width_mask(width);
                    (r, LazyFlags::inc(a, r, width, old_cf))
                } else {
                    let r = a.wrapping_sub(1) & width_mask(width);
                    (r, LazyFlags::dec(a, r, width, old_cf))
                };
                self.write(dst, size, r)?;
                self.cpu.rflags.set_lazy(lazy);
            }
            Command::Neg => {
                let size = self.size(0);
                let dst = self.locate(0)?;
                let a = self.read(dst, size)?;
                let (r, lazy) = binary(Command::Sub, 0, a, false, size);
                self.write(dst, size, r)?;
                self.cpu.rflags.set_lazy(lazy);
            }
            Command::Not => {
                let size = self.size(0);
                let dst = self.locate(0)?;
                let a = self.read(dst, size)?;
                self.write(dst, size, !a)?;
            }
            Command::Xchg => {
                let size = self.size(0);
                let (x, y) = (self.locate(0)?, self.locate(1)?);
                let (a, b) = (self.read(x, size)?, self.read(y, size)?);
                self.write(x, size, b)?;
                self.write(y, size, a)?;
            }
            Command::Xadd => {
                let size = self.size(0);
                let (dst, src) = (self.locate(0)?, self.locate(1)?);
                let (a, b) = (self.read(dst, size)?, self.read(src, size)?);
                let (sum, lazy) = binary(Command::Add, a, b, false, size);
                self.write(src, size, a)?;
                self.write(dst, size, sum)?;
                self.cpu.rflags.set_lazy(lazy);
            }
            Command::Cmpxchg => {
                let size = self.size(0);
                let dst = self.locate(0)?;
                let current = self.read(dst, size)?;
                let replacement = self.read_op(1)?;
                let acc = self.cpu.read_gpr(0, size);
                let (_, lazy) = binary(Command::Cmp, acc, current, false, size);
                if acc == current {
                    self.write(dst, size, replacement)?;
                } else {
                    self.write(dst, size, current)?;
                    self.cpu.write_gpr(0, size, current);
                }
                self.cpu.rflags.set_lazy(lazy);
            }
            Command::Bt | Command::Bts | Command::Btr | Command::Btc => self.bit_test()?,
            Command::Rol
            | Command::Ror
            | Command::Rcl
            | Command::Rcr
            | Command::Shl
            | Command::Sal
            | Command::Shr
            | Command::Sar => {
                let size = self.size(0);
                let dst = self.locate(0)?;
                let v = self.read(dst, size)?;
                let count = self.read_op(1)?;
                match shift(cmd, v, count, size, self.cpu.rflags.cf()) {
                    None => {}
                    Some((r, ShiftFlags::Full(lazy))) => {
                        self.write(dst, size, r)?;
                        self.cpu.rflags.set_lazy(lazy);
                    }
                    Some((r, ShiftFlags::CarryOverflow { cf, of })) => {
                        self.write(dst, size, r)?;
                        self.cpu.rflags.set_cf_of(cf, of);
                    }
                }
            }
            Command::Bswap => {
                let v = alu::bswap(self.read_op(0)?, self.size(0));
                self.write_op(0, v)?;
            }
            Command::Cbw => {
                let size = inst.operand_size;
                let v = alu::sign_extend(self.cpu.read_gpr(0, size / 2), size / 2);
                self.cpu.write_gpr(0, size, v);
            }
            Command::Cwd => {
                let size = inst.operand_size;
                let negative = (self.cpu.read_gpr(0, size) >> (size * 8 - 1)) & 1 != 0;
                self.cpu
                    .write_gpr(Gpr::Rdx as u8, size, if negative { u64::MAX } else { 0 });
            }
            Command::Setcc => {
                let v = u64::from(self.cpu.rflags.condition(inst.condition()));
                self.write_op(0, v)?;
            }
            Command::Cmov => {
                let v = self.read_op(1)?;
                if self.cpu.rflags.condition(inst.condition()) {
                    self.write_op(0, v)?;
                } else if self.size(0) == 4 {
                    // The destination is zero-extended even when not moved.
                    let old = self.read_op(0)?;
                    self.write_op(0, old)?;
                }
            }
            Command::Jcc => {
                if self.cpu.rflags.condition(inst.condition()) {
                    self.jump_relative()?;
                }
            }
            Command::Jcxz => {
                if self.cpu.read_gpr(Gpr::Rcx as u8, inst.address_size) == 0 {
                    self.jump_relative()?;
                }
            }
            Command::Loop => {
                let asz = inst.address_size;
                let count = self.cpu.read_gpr(Gpr::Rcx as u8, asz).wrapping_sub(1)
                    & width_mask(asz * 8);
                self.cpu.write_gpr(Gpr::Rcx as u8, asz, count);
                let zf = self.cpu.rflags.zf();
                let taken = count != 0
                    && match inst.op() {
                        0xe0 => !zf,
                        0xe1 => zf,
                        _ => true,
                    };
                if taken {
                    self.jump_relative()?;
                }
            }
            Command::JmpNear => self.jump_relative()?,
            Command::JmpNearIndirect => {
                let target = self.read_op(0)?;
                self.jump(target, self.size(0));
            }
            Command::CallNear => {
                let size = inst.operand_size;
                self.push(self.next_rip, size)?;
                self.jump_relative()?;
            }
            Command::CallNearIndirect => {
                let size = self.size(0);
                let target = self.read_op(0)?;
                self.push(self.next_rip, size)?;
                self.jump(target, size);
            }
            Command::RetNear => {
                let size = inst.operand_size;
                let target = self.pop(size)?;
                if let Some(extra) = inst.operands[0].immediate() {
                    let ss = self.cpu.stack_size();
                    let sp = self.cpu.read_gpr(Gpr::Rsp as u8, ss).wrapping_add(extra);
                    self.cpu.write_gpr(Gpr::Rsp as u8, ss, sp & width_mask(ss * 8));
                }
                self.jump(target, size);
            }
            Command::Push | Command::PushSeg => {
                let v = self.read_op(0)?;
                self.push(v, inst.operand_size)?;
            }
            Command::Pop => {
                let v = self.pop(inst.operand_size)?;
                self.write_op(0, v)?;
            }
            Command::In => {
                let size = self.size(0);
                let port = self.read_op(1)? as u16;
                let mut data = [0u8; 8];
                self.platform
                    .handle_io(port, &mut data[..usize::from(size)], IoDirection::In, size, 1);
                self.write_op(0, u64::from_le_bytes(data))?;
            }
            Command::Out => {
                let size = self.size(1);
                let port = self.read_op(0)? as u16;
                let mut data = self.read_op(1)?.to_le_bytes();
                self.platform
                    .handle_io(port, &mut data[..usize::from(size)], IoDirection::Out, size, 1);
            }
            Command::Movs
            | Command::Cmps
            | Command::Stos
            | Command::Lods
            | Command::Scas
            | Command::Ins
            | Command::Outs => self.string_op()?,
            Command::Clc => self.cpu.rflags.set(RFLAGS_CF, false),
            Command::Stc => self.cpu.rflags.set(RFLAGS_CF, true),
            Command::Cmc => {
                let cf = self.cpu.rflags.cf();
                self.cpu.rflags.set(RFLAGS_CF, !cf);
            }
            Command::Cld => self.cpu.rflags.set(RFLAGS_DF, false),
            Command::Std => self.cpu.rflags.set(RFLAGS_DF, true),
            Command::Cli | Command::Sti => {
                let iopl = ((self.cpu.rflags.get() & RFLAGS_IOPL_MASK) >> 12) as u8;
                if self.cpu.protected_mode() && self.cpu.cpl() > iopl {
                    return Err(Exception::gp0().into());
                }
                if cmd == Command::Sti {
                    if !self.cpu.rflags.if_flag() {
                        self.cpu.interruptibility |= Interruptibility::STI;
                    }
                    self.cpu.rflags.set(RFLAGS_IF, true);
                } else {
                    self.cpu.rflags.set(RFLAGS_IF, false);
                }
            }
            Command::Lahf => {
                let flags = self.cpu.rflags.get() & 0xd5 | RFLAGS_RESERVED1;
                self.cpu.write_high_byte(0, flags);
            }
            Command::Sahf => {
                let ah = self.cpu.read_high_byte(0);
                let flags = self.cpu.rflags.get();
                self.cpu.rflags.set_raw((flags & !0xd5) | (ah & 0xd5));
            }
            Command::Rdmsr => {
                self.require_cpl0()?;
                simulate_rdmsr(self.cpu, self.platform);
            }
            Command::Wrmsr => {
                self.require_cpl0()?;
                simulate_wrmsr(self.cpu, self.platform);
            }
            Command::Rdtsc => {
                let tsc = self.platform.host_tsc().wrapping_add(self.cpu.tsc_offset);
                self.cpu.set_gpr(Gpr::Rax, tsc & 0xffff_ffff);
                self.cpu.set_gpr(Gpr::Rdx, tsc >> 32);
            }
            Command::Cpuid => return Ok(Executed::Cpuid),
            Command::Hlt => {
                self.require_cpl0()?;
                self.cpu.halted = true;
                return Ok(Executed::Halted);
            }
            Command::Int => {
                let vector = inst.operands[0]
                    .immediate()
                    .ok_or_else(|| self.bad_operands())? as u8;
                let event = if inst.op() == 0xcc {
                    PendingEvent {
                        instruction_len: u32::from(inst.len),
                        ..PendingEvent::exception(Exception::Breakpoint)
                    }
                } else {
                    PendingEvent::software_interrupt(vector, u32::from(inst.len))
                };
                self.cpu.injected = Some(event);
                // Delivery resumes after the instruction using instruction_len.
                self.branch = Some(self.cpu.rip);
            }
            Command::MovFromCr => {
                self.require_cpl0()?;
                let value = match self.control_index(1)? {
                    8 => u64::from(self.platform.tpr() >> 4),
                    n => self.cpu.read_register(Register::Control(n), 8),
                };
                self.write_op(0, value)?;
            }
            Command::MovToCr => {
                self.require_cpl0()?;
                let cr = self.control_index(0)?;
                let value = self.read_op(1)?;
                match cr {
                    2 => self.cpu.control.cr2 = value,
                    8 => {
                        if value > 0xf {
                            return Err(Exception::gp0().into());
                        }
                        self.cpu.control.cr8 = value;
                        self.platform.set_tpr((value as u8) << 4);
                    }
                    _ => return Ok(Executed::ControlRegisterWrite { cr, value }),
                }
            }
            Command::MovFromDr => {
                self.require_cpl0()?;
                let n = self.control_index(1)?;
                let value = self.cpu.dr[usize::from(dr_alias(n))];
                self.write_op(0, value)?;
            }
            Command::MovToDr => {
                self.require_cpl0()?;
                let n = self.control_index(0)?;
                let value = self.read_op(1)?;
                self.cpu.dr[usize::from(dr_alias(n))] = value;
            }
            Command::Nop
            | Command::Prefetch
            | Command::Lfence
            | Command::Sfence
            | Command::Mfence => {}
            other => return Ok(Executed::Unimplemented(other)),
        }
        Ok(Executed::Retired)
    }

    /// BT/BTS/BTR/BTC. A register bit offset into memory selects a byte
    /// displacement first, so the bit string extends beyond the operand.
    fn bit_test(&mut self) -> Flow<()> {
        let cmd = self.inst.cmd;
        let size = self.size(0);
        let width = u64::from(size) * 8;
        let offset = self.read_op(1)?;
        let mut dst = self.locate(0)?;
        let from_register = matches!(self.inst.operands[1].kind, OperandKind::Register(_));
        if let (Loc::Mem(lin), true) = (dst, from_register) {
            let signed = alu::sign_extend(offset, size) as i64;
            let displacement = (signed >> width.trailing_zeros()) * i64::from(size);
            let mut addr = lin.wrapping_add(displacement as u64);
            if !self.mode.is_long() {
                addr &= 0xffff_ffff;
            }
            dst = Loc::Mem(addr);
        }
        let bit = offset & (width - 1);
        let value = self.read(dst, size)?;
        let cf = (value >> bit) & 1 != 0;
        let updated = match cmd {
            Command::Bts => Some(value | (1 << bit)),
            Command::Btr => Some(value & !(1 << bit)),
            Command::Btc => Some(value ^ (1 << bit)),
            _ => None,
        };
        if let Some(v) = updated {
            self.write(dst, size, v)?;
        }
        self.cpu.rflags.set(RFLAGS_CF, cf);
        Ok(())
    }
}

/// DR4/DR5 alias DR6/DR7.
fn dr_alias(n: u8) -> u8 {
    match n {
        4 => 6,
        5 => 7,
        n => n & 7,
    }
}
