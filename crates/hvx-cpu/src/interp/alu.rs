//! Pure integer semantics. Values are passed zero-extended from `size` bytes
//! and returned truncated to it.

use hvx_x86::Command;

use crate::flags::{width_mask, LazyFlags};

#[inline]
fn msb(v: u64, width: u8) -> bool {
    (v >> (width - 1)) & 1 != 0
}

/// Two-operand ALU group (ADD..CMP, TEST). Returns the result and its flags;
/// `carry_in` is consumed by ADC/SBB only.
pub(crate) fn binary(cmd: Command, a: u64, b: u64, carry_in: bool, size: u8) -> (u64, LazyFlags) {
    let width = size * 8;
    let mask = width_mask(width);
    let (a, b) = (a & mask, b & mask);
    let c = u64::from(carry_in);
    match cmd {
        Command::Add => {
            let r = a.wrapping_add(b) & mask;
            (r, LazyFlags::add(a, b, r, width))
        }
        Command::Adc => {
            let r = a.wrapping_add(b).wrapping_add(c) & mask;
            (r, LazyFlags::add(a, b, r, width))
        }
        Command::Sub | Command::Cmp => {
            let r = a.wrapping_sub(b) & mask;
            (r, LazyFlags::sub(a, b, r, width))
        }
        Command::Sbb => {
            let r = a.wrapping_sub(b).wrapping_sub(c) & mask;
            (r, LazyFlags::sub(a, b, r, width))
        }
        Command::Or => {
            let r = a | b;
            (r, LazyFlags::logic(r, width))
        }
        Command::Xor => {
            let r = a ^ b;
            (r, LazyFlags::logic(r, width))
        }
        // AND and TEST
        _ => {
            let r = a & b;
            (r, LazyFlags::logic(r, width))
        }
    }
}

/// How a shift or rotate changes RFLAGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftFlags {
    /// SF/ZF/PF from the result plus explicit CF/OF (shifts).
    Full(LazyFlags),
    /// Only CF and OF change (rotates).
    CarryOverflow { cf: bool, of: bool },
}

/// Shift or rotate `value` by `count`. `None` when the masked count is zero,
/// in which case neither the operand nor the flags change.
pub(crate) fn shift(
    cmd: Command,
    value: u64,
    count: u64,
    size: u8,
    carry_in: bool,
) -> Option<(u64, ShiftFlags)> {
    let width = size * 8;
    let mask = width_mask(width);
    let v = value & mask;
    let count = (count & if size == 8 { 0x3f } else { 0x1f }) as u32;
    if count == 0 {
        return None;
    }
    let w = u32::from(width);

    let full = |r: u64, cf: bool, of: bool| {
        Some((r, ShiftFlags::Full(LazyFlags::from_parts(r, width, cf, of, false))))
    };

    match cmd {
        Command::Shl | Command::Sal => {
            let r = if count < w { (v << count) & mask } else { 0 };
            let cf = count <= w && (v >> (w - count)) & 1 != 0;
            full(r, cf, msb(r, width) ^ cf)
        }
        Command::Shr => {
            let r = if count < w { v >> count } else { 0 };
            let cf = count <= w && (v >> (count - 1)) & 1 != 0;
            full(r, cf, msb(v, width))
        }
        Command::Sar => {
            let shift = (64 - w) as u32;
            let signed = ((v << shift) as i64) >> shift;
            let r = (signed >> count.min(63)) as u64 & mask;
            let cf = (signed >> (count - 1).min(63)) & 1 != 0;
            full(r, cf, false)
        }
        Command::Rol => {
            let n = count % w;
            let r = if n == 0 {
                v
            } else {
                ((v << n) | (v >> (w - n))) & mask
            };
            let cf = r & 1 != 0;
            Some((r, ShiftFlags::CarryOverflow { cf, of: msb(r, width) ^ cf }))
        }
        Command::Ror => {
            let n = count % w;
            let r = if n == 0 {
                v
            } else {
                ((v >> n) | (v << (w - n))) & mask
            };
            let cf = msb(r, width);
            Some((r, ShiftFlags::CarryOverflow { cf, of: cf ^ msb(r, width - 1) }))
        }
        Command::Rcl | Command::Rcr => {
            // 8- and 16-bit RCL/RCR rotate through w+1 bits.
            let n = match size {
                1 => count % 9,
                2 => count % 17,
                _ => count,
            };
            let mut r = v;
            let mut cf = carry_in;
            for _ in 0..n {
                if cmd == Command::Rcl {
                    let out = msb(r, width);
                    r = ((r << 1) | u64::from(cf)) & mask;
                    cf = out;
                } else {
                    let out = r & 1 != 0;
                    r = (r >> 1) | (u64::from(cf) << (width - 1));
                    cf = out;
                }
            }
            let of = if cmd == Command::Rcl {
                msb(r, width) ^ cf
            } else {
                msb(r, width) ^ msb(r, width - 1)
            };
            Some((r, ShiftFlags::CarryOverflow { cf, of }))
        }
        _ => None,
    }
}

/// BSWAP. The 16-bit form is undefined and clears the register.
pub(crate) fn bswap(value: u64, size: u8) -> u64 {
    match size {
        8 => value.swap_bytes(),
        4 => u64::from((value as u32).swap_bytes()),
        _ => 0,
    }
}

/// Sign-extend the low `from` bytes of `value`.
pub(crate) fn sign_extend(value: u64, from: u8) -> u64 {
    match from {
        1 => value as u8 as i8 as i64 as u64,
        2 => value as u16 as i16 as i64 as u64,
        4 => value as u32 as i32 as i64 as u64,
        _ => value,
    }
}
