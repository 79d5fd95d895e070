//! Constant evaluation of ALU operations.
//!
//! Constants are stored as raw bits in `u64`, truncated to the value's bit size. Booleans are
//! 1-bit values where `1` is true.

use half::f16;

use crate::ir::AluOp;

pub fn mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

pub fn sign_extend(value: u64, bits: u8) -> i64 {
    if bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits as u32;
    ((value << shift) as i64) >> shift
}

pub fn read_float(value: u64, bits: u8) -> f64 {
    match bits {
        16 => f16::from_bits(value as u16).to_f64(),
        32 => f32::from_bits(value as u32) as f64,
        64 => f64::from_bits(value),
        _ => unreachable!("no {bits}-bit float type"),
    }
}

pub fn write_float(value: f64, bits: u8) -> u64 {
    match bits {
        16 => f16::from_f64(value).to_bits() as u64,
        32 => (value as f32).to_bits() as u64,
        64 => value.to_bits(),
        _ => unreachable!("no {bits}-bit float type"),
    }
}

fn b(v: bool) -> u64 {
    v as u64
}

/// Folds one destination component.
///
/// `srcs` holds the component of every source that feeds this destination component,
/// `src_bits` the bit size of the first source and `dest_bits` the bit size of the result.
pub fn fold_component(op: AluOp, srcs: &[u64], src_bits: u8, dest_bits: u8) -> u64 {
    let m = mask(src_bits);
    let a = srcs[0] & m;
    let arg = |i: usize| srcs[i] & m;
    let shift_mask = (src_bits.max(8) as u64) - 1;
    let fa = || read_float(a, src_bits);
    let fb = || read_float(arg(1), src_bits);

    let result = match op {
        AluOp::Mov | AluOp::Vec => a,
        AluOp::Iadd => a.wrapping_add(arg(1)),
        AluOp::Isub => a.wrapping_sub(arg(1)),
        AluOp::Imul => a.wrapping_mul(arg(1)),
        AluOp::Ineg => 0u64.wrapping_sub(a),
        AluOp::Iand => a & arg(1),
        AluOp::Ior => a | arg(1),
        AluOp::Ixor => a ^ arg(1),
        AluOp::Inot => !a,
        AluOp::Ishl => a << (srcs[1] & shift_mask),
        AluOp::Ushr => a >> (srcs[1] & shift_mask),
        AluOp::Ishr => (sign_extend(a, src_bits) >> (srcs[1] & shift_mask)) as u64,
        AluOp::Umin => a.min(arg(1)),
        AluOp::Umax => a.max(arg(1)),
        AluOp::Imin => sign_extend(a, src_bits).min(sign_extend(arg(1), src_bits)) as u64,
        AluOp::Imax => sign_extend(a, src_bits).max(sign_extend(arg(1), src_bits)) as u64,
        AluOp::Udiv => a.checked_div(arg(1)).unwrap_or(0),
        AluOp::Umod => a.checked_rem(arg(1)).unwrap_or(0),
        AluOp::Ubfe | AluOp::Ibfe => {
            let offset = (srcs[1] & 31) as u32;
            let bits = (srcs[2] & 31) as u32;
            if bits == 0 {
                0
            } else if offset + bits < 32 {
                let field = (a >> offset) & mask(bits as u8);
                if op == AluOp::Ibfe {
                    sign_extend(field, bits as u8) as u64
                } else {
                    field
                }
            } else if op == AluOp::Ibfe {
                (sign_extend(a, 32) >> offset) as u64
            } else {
                a >> offset
            }
        }
        AluOp::Bcsel => {
            if srcs[0] & 1 != 0 {
                srcs[1]
            } else {
                srcs[2]
            }
        }
        AluOp::Ieq => b(a == arg(1)),
        AluOp::Ine => b(a != arg(1)),
        AluOp::Ult => b(a < arg(1)),
        AluOp::Uge => b(a >= arg(1)),
        AluOp::Ilt => b(sign_extend(a, src_bits) < sign_extend(arg(1), src_bits)),
        AluOp::Ige => b(sign_extend(a, src_bits) >= sign_extend(arg(1), src_bits)),
        AluOp::Feq => b(fa() == fb()),
        AluOp::Fneu => b(fa() != fb()),
        AluOp::Flt => b(fa() < fb()),
        AluOp::Fge => b(fa() >= fb()),
        AluOp::Fgeu => b(!(fa() < fb())),
        AluOp::Fadd => write_float(fa() + fb(), src_bits),
        AluOp::Fmul => write_float(fa() * fb(), src_bits),
        AluOp::Fneg => write_float(-fa(), src_bits),
        AluOp::Fmin => write_float(fa().min(fb()), src_bits),
        AluOp::Fmax => write_float(fa().max(fb()), src_bits),
        AluOp::Fsat => {
            let x = fa();
            let clamped = if x.is_nan() { 0.0 } else { x.clamp(0.0, 1.0) };
            write_float(clamped, src_bits)
        }
        AluOp::Fdot4 => {
            let sum = (0..4)
                .map(|c| read_float(srcs[c] & m, src_bits) * read_float(srcs[4 + c] & m, src_bits))
                .sum::<f64>();
            write_float(sum, src_bits)
        }
        AluOp::B2i32 => b(a != 0),
        AluOp::U2u(_) => a,
        AluOp::I2i(_) => sign_extend(a, src_bits) as u64,
        AluOp::F2f(bits) => write_float(fa(), bits),
        AluOp::Pack32_2x16Split => (a & 0xffff) | ((srcs[1] & 0xffff) << 16),
        AluOp::Unpack32_2x16SplitX => a & 0xffff,
        AluOp::Unpack32_2x16SplitY => (a >> 16) & 0xffff,
        AluOp::BitCount => a.count_ones() as u64,
        AluOp::AlignbyteAmd => {
            let wide = ((a & 0xffff_ffff) << 32) | (srcs[1] & 0xffff_ffff);
            wide >> ((srcs[2] & 3) * 8)
        }
    };
    result & mask(dest_bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ubfe_matches_hardware_semantics() {
        assert_eq!(fold_component(AluOp::Ubfe, &[0x1234_5678, 16, 7], 32, 32), 0x34);
        assert_eq!(fold_component(AluOp::Ubfe, &[0xdead_beef, 8, 0], 32, 32), 0);
        assert_eq!(fold_component(AluOp::Ubfe, &[0xdead_beef, 24, 8], 32, 32), 0xde);
    }

    #[test]
    fn unordered_compare_is_true_for_nan() {
        let nan = f32::NAN.to_bits() as u64;
        let zero = 0f32.to_bits() as u64;
        assert_eq!(fold_component(AluOp::Fgeu, &[zero, nan], 32, 1), 1);
        assert_eq!(fold_component(AluOp::Fge, &[zero, nan], 32, 1), 0);
    }

    #[test]
    fn shifts_wrap_the_shift_amount() {
        assert_eq!(fold_component(AluOp::Ushr, &[0x8000_0000, 32], 32, 32), 0x8000_0000);
        assert_eq!(fold_component(AluOp::Ishl, &[1, 33], 32, 32), 2);
    }

    #[test]
    fn half_floats_round_trip() {
        let one = write_float(1.0, 16);
        assert_eq!(one, 0x3c00);
        assert_eq!(read_float(one, 16), 1.0);
    }
}
