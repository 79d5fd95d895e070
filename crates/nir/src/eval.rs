//! Evaluation of SSA values under assumed intrinsic results.
//!
//! The builder only folds instructions whose sources are all constants. Address arithmetic
//! usually starts at system values, so checking it needs their values supplied from outside.

use crate::fold::fold_component;
use crate::ir::{AluOp, Def, InstrKind, IntrinsicInstr, Shader};

/// Per-component value of `def`, or `None` when it depends on an undef, a phi, or an intrinsic
/// `intrinsic` can't answer.
pub fn eval(shader: &Shader, def: Def, intrinsic: &dyn Fn(&IntrinsicInstr) -> Option<Vec<u64>>) -> Option<Vec<u64>> {
    match &shader.instr(shader.parent_instr(def)).kind {
        InstrKind::LoadConst { values, .. } => Some(values.clone()),
        InstrKind::Intrinsic(intr) => intrinsic(intr),
        InstrKind::Alu(alu) => {
            let consts = alu
                .srcs
                .iter()
                .map(|s| eval(shader, s.def, intrinsic))
                .collect::<Option<Vec<_>>>()?;
            let src_bits = shader.bit_size(alu.srcs[0].def);
            let bits = shader.bit_size(alu.def);
            let pick = |k: usize, c: usize| consts[k][alu.srcs[k].swizzle[c] as usize];
            match alu.op {
                AluOp::Vec => Some((0..alu.srcs.len()).map(|k| pick(k, 0)).collect()),
                AluOp::Fdot4 => {
                    let vals: Vec<u64> = (0..2).flat_map(|k| (0..4).map(move |c| pick(k, c))).collect();
                    Some(vec![fold_component(alu.op, &vals, src_bits, bits)])
                }
                op => Some(
                    (0..shader.num_components(alu.def) as usize)
                        .map(|c| {
                            let vals: Vec<u64> = (0..alu.srcs.len()).map(|k| pick(k, c)).collect();
                            fold_component(op, &vals, src_bits, bits)
                        })
                        .collect(),
                ),
            }
        }
        InstrKind::Undef(_) | InstrKind::Phi(_) | InstrKind::Jump(_) => None,
    }
}

/// Scalar [`eval`].
pub fn eval_u32(shader: &Shader, def: Def, intrinsic: &dyn Fn(&IntrinsicInstr) -> Option<Vec<u64>>) -> Option<u32> {
    eval(shader, def, intrinsic).map(|v| v[0] as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::intrinsics::Intrinsic;
    use crate::types::Stage;

    #[test]
    fn system_values_feed_the_arithmetic() {
        let mut shader = Shader::new(Stage::TessCtrl, "eval");
        let mut b = Builder::at_end(&mut shader);
        let id = b.load_sysval(Intrinsic::LoadTessRelPatchIdAmd);
        let scaled = b.imul_imm(id, 48);
        let off = b.iadd_imm(scaled, 16);
        let v = b.vec2(off, id);
        let y = b.channel(v, 1);

        let sysvals = |intr: &IntrinsicInstr| match intr.op {
            Intrinsic::LoadTessRelPatchIdAmd => Some(vec![3]),
            _ => None,
        };
        assert_eq!(eval_u32(&shader, off, &sysvals), Some(160));
        assert_eq!(eval_u32(&shader, y, &sysvals), Some(3));
        assert_eq!(eval_u32(&shader, off, &|_| None), None);
    }
}
