use hvx_x86::{Command, RepPrefix, SegReg};

use super::{alu, Exec, Flow};
use crate::flags::width_mask;
use crate::platform::{IoDirection, Platform};
use crate::state::Gpr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RepMode {
    None,
    Rep,
    Repe,
    Repne,
}

fn effective_rep_mode(cmd: Command, rep: Option<RepPrefix>) -> RepMode {
    let compares = matches!(cmd, Command::Cmps | Command::Scas);
    match rep {
        None => RepMode::None,
        Some(RepPrefix::Rep) if compares => RepMode::Repe,
        Some(RepPrefix::Repne) if compares => RepMode::Repne,
        Some(_) => RepMode::Rep,
    }
}

impl<P: Platform> Exec<'_, P> {
    /// MOVS/CMPS/STOS/LODS/SCAS/INS/OUTS with optional REP.
    ///
    /// The count register is tested before each element, so a zero count
    /// touches neither memory nor registers. A fault leaves the count and
    /// index registers describing the element that faulted.
    pub(super) fn string_op(&mut self) -> Flow<()> {
        let inst = self.inst;
        let size = match inst.cmd {
            Command::Ins | Command::Outs => inst.operand_size.min(4),
            _ => inst.operand_size,
        };
        let asz = inst.address_size;
        match effective_rep_mode(inst.cmd, inst.prefixes.rep) {
            RepMode::None => self.string_element(size),
            mode => loop {
                let count = self.cpu.read_gpr(Gpr::Rcx as u8, asz);
                if count == 0 {
                    return Ok(());
                }
                self.string_element(size)?;
                self.cpu
                    .write_gpr(Gpr::Rcx as u8, asz, count.wrapping_sub(1) & width_mask(asz * 8));
                match mode {
                    RepMode::Repe if !self.cpu.rflags.zf() => return Ok(()),
                    RepMode::Repne if self.cpu.rflags.zf() => return Ok(()),
                    _ => {}
                }
            },
        }
    }

    fn string_element(&mut self, size: u8) -> Flow<()> {
        let cmd = self.inst.cmd;
        let src_seg = self.inst.prefixes.segment.unwrap_or(SegReg::Ds);
        let asz = self.inst.address_size;
        let si = self.cpu.read_gpr(Gpr::Rsi as u8, asz);
        let di = self.cpu.read_gpr(Gpr::Rdi as u8, asz);
        let src = self.cpu.linear_address(src_seg, si);
        let dst = self.cpu.linear_address(SegReg::Es, di);

        match cmd {
            Command::Movs => {
                let v = self.read_mem(src, size)?;
                self.write_mem(dst, size, v)?;
                self.advance(Gpr::Rsi, size);
                self.advance(Gpr::Rdi, size);
            }
            Command::Cmps => {
                let a = self.read_mem(src, size)?;
                let b = self.read_mem(dst, size)?;
                let (_, lazy) = alu::binary(Command::Cmp, a, b, false, size);
                self.cpu.rflags.set_lazy(lazy);
                self.advance(Gpr::Rsi, size);
                self.advance(Gpr::Rdi, size);
            }
            Command::Stos => {
                let v = self.cpu.read_gpr(Gpr::Rax as u8, size);
                self.write_mem(dst, size, v)?;
                self.advance(Gpr::Rdi, size);
            }
            Command::Lods => {
                let v = self.read_mem(src, size)?;
                self.cpu.write_gpr(Gpr::Rax as u8, size, v);
                self.advance(Gpr::Rsi, size);
            }
            Command::Scas => {
                let acc = self.cpu.read_gpr(Gpr::Rax as u8, size);
                let b = self.read_mem(dst, size)?;
                let (_, lazy) = alu::binary(Command::Cmp, acc, b, false, size);
                self.cpu.rflags.set_lazy(lazy);
                self.advance(Gpr::Rdi, size);
            }
            Command::Ins => {
                // The port read has side effects; translate the target first.
                self.probe_write(dst, size)?;
                let port = self.cpu.read_gpr(Gpr::Rdx as u8, 2) as u16;
                let mut data = [0u8; 8];
                self.platform
                    .handle_io(port, &mut data[..usize::from(size)], IoDirection::In, size, 1);
                self.write_mem(dst, size, u64::from_le_bytes(data))?;
                self.advance(Gpr::Rdi, size);
            }
            Command::Outs => {
                let port = self.cpu.read_gpr(Gpr::Rdx as u8, 2) as u16;
                let mut data = self.read_mem(src, size)?.to_le_bytes();
                self.platform
                    .handle_io(port, &mut data[..usize::from(size)], IoDirection::Out, size, 1);
                self.advance(Gpr::Rsi, size);
            }
            _ => return Err(self.bad_operands()),
        }
        Ok(())
    }

    /// Step rSI or rDI by one element in the direction DF selects.
    fn advance(&mut self, reg: Gpr, size: u8) {
        let asz = self.inst.address_size;
        let v = self.cpu.read_gpr(reg as u8, asz);
        let v = if self.cpu.rflags.df() {
            v.wrapping_sub(u64::from(size))
        } else {
            v.wrapping_add(u64::from(size))
        };
        self.cpu.write_gpr(reg as u8, asz, v & width_mask(asz * 8));
    }
}
