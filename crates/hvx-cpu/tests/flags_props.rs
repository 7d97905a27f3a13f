#![cfg(not(target_arch = "wasm32"))]

use hvx_cpu::flags::{
    LazyFlags, RFLAGS_AF, RFLAGS_CF, RFLAGS_OF, RFLAGS_PF, RFLAGS_SF, RFLAGS_ZF,
};
use proptest::prelude::*;

const WIDTHS: [u8; 4] = [8, 16, 32, 64];

fn mask(width: u8) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1 << width) - 1
    }
}

/// 0, 1, max, max-1, and the values around the sign bit.
fn boundaries(width: u8) -> [u64; 7] {
    let sign = 1u64 << (width - 1);
    let max = mask(width);
    [0, 1, max, max - 1, sign, sign - 1, sign + 1]
}

/// Straightforward OSZAPC computation for comparison. `carry` is the ADC
/// carry-in or SBB borrow-in.
fn eager(a: u64, b: u64, carry: bool, width: u8, subtract: bool) -> (u64, u64) {
    let m = mask(width);
    let sign = 1u64 << (width - 1);
    let (a, b) = (a & m, b & m);
    let c = u64::from(carry);
    let (r, cf) = if subtract {
        (
            a.wrapping_sub(b).wrapping_sub(c) & m,
            u128::from(a) < u128::from(b) + u128::from(c),
        )
    } else {
        let wide = u128::from(a) + u128::from(b) + u128::from(c);
        ((wide as u64) & m, wide > u128::from(m))
    };
    let of = if subtract {
        (a ^ b) & (a ^ r) & sign != 0
    } else {
        !(a ^ b) & (a ^ r) & sign != 0
    };
    let mut flags = 0;
    if cf {
        flags |= RFLAGS_CF;
    }
    if (r as u8).count_ones() % 2 == 0 {
        flags |= RFLAGS_PF;
    }
    if (a ^ b ^ r) & 0x10 != 0 {
        flags |= RFLAGS_AF;
    }
    if r == 0 {
        flags |= RFLAGS_ZF;
    }
    if r & sign != 0 {
        flags |= RFLAGS_SF;
    }
    if of {
        flags |= RFLAGS_OF;
    }
    (r, flags)
}

fn lazy(a: u64, b: u64, r: u64, width: u8, subtract: bool) -> LazyFlags {
    let (a, b) = (a & mask(width), b & mask(width));
    if subtract {
        LazyFlags::sub(a, b, r, width)
    } else {
        LazyFlags::add(a, b, r, width)
    }
}

#[test]
fn boundary_operands_agree_at_every_width() {
    for width in WIDTHS {
        for a in boundaries(width) {
            for b in boundaries(width) {
                for carry in [false, true] {
                    for subtract in [false, true] {
                        let (r, expected) = eager(a, b, carry, width, subtract);
                        let flags = lazy(a, b, r, width, subtract);
                        assert_eq!(
                            flags.materialize(),
                            expected,
                            "width {width} a {a:#x} b {b:#x} carry {carry} sub {subtract}"
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn carry_in_crosses_the_top_bit() {
    // 0xff + 0 + 1 carries out with a zero result.
    let (r, expected) = eager(0xff, 0, true, 8, false);
    assert_eq!(r, 0);
    assert_eq!(expected & (RFLAGS_CF | RFLAGS_ZF), RFLAGS_CF | RFLAGS_ZF);
    assert_eq!(LazyFlags::add(0xff, 0, r, 8).materialize(), expected);

    // 0 - 0 - 1 borrows.
    let (r, expected) = eager(0, 0, true, 16, true);
    assert_eq!(r, 0xffff);
    assert_ne!(expected & RFLAGS_CF, 0);
    assert_eq!(LazyFlags::sub(0, 0, r, 16).materialize(), expected);

    // 0x7fffffff + 0 + 1 overflows into the sign bit.
    let (r, expected) = eager(0x7fff_ffff, 0, true, 32, false);
    assert_eq!(expected & (RFLAGS_OF | RFLAGS_SF | RFLAGS_CF), RFLAGS_OF | RFLAGS_SF);
    assert_eq!(LazyFlags::add(0x7fff_ffff, 0, r, 32).materialize(), expected);
}

fn width() -> impl Strategy<Value = u8> {
    prop_oneof![Just(8u8), Just(16u8), Just(32u8), Just(64u8)]
}

/// Mostly random operands, with a fair share of boundary values.
fn operand() -> impl Strategy<Value = u64> {
    prop_oneof![
        3 => any::<u64>(),
        1 => (0usize..7, width()).prop_map(|(i, width)| boundaries(width)[i]),
    ]
}

proptest! {
    #[test]
    fn lazy_add_matches_eager(a in operand(), b in operand(), width in width()) {
        let (r, expected) = eager(a, b, false, width, false);
        prop_assert_eq!(lazy(a, b, r, width, false).materialize(), expected);
    }

    #[test]
    fn lazy_sub_matches_eager(a in operand(), b in operand(), width in width()) {
        let (r, expected) = eager(a, b, false, width, true);
        prop_assert_eq!(lazy(a, b, r, width, true).materialize(), expected);
    }

    #[test]
    fn adc_and_sbb_with_carry_in_match_eager(
        a in operand(),
        b in operand(),
        width in width(),
        subtract in any::<bool>(),
    ) {
        let (r, expected) = eager(a, b, true, width, subtract);
        prop_assert_eq!(lazy(a, b, r, width, subtract).materialize(), expected);
    }

    #[test]
    fn individual_flags_agree_with_materialized_word(
        a in operand(),
        b in operand(),
        width in width(),
    ) {
        let (r, _) = eager(a, b, false, width, true);
        let flags = lazy(a, b, r, width, true);
        let word = flags.materialize();
        prop_assert_eq!(flags.cf(), word & RFLAGS_CF != 0);
        prop_assert_eq!(flags.pf(), word & RFLAGS_PF != 0);
        prop_assert_eq!(flags.af(), word & RFLAGS_AF != 0);
        prop_assert_eq!(flags.zf(), word & RFLAGS_ZF != 0);
        prop_assert_eq!(flags.sf(), word & RFLAGS_SF != 0);
        prop_assert_eq!(flags.of(), word & RFLAGS_OF != 0);
    }

    #[test]
    fn logic_clears_carry_and_overflow(r in operand(), width in width()) {
        let flags = LazyFlags::logic(r & mask(width), width);
        prop_assert!(!flags.cf());
        prop_assert!(!flags.of());
        prop_assert_eq!(flags.zf(), r & mask(width) == 0);
    }
}
