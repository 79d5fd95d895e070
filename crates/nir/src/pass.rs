//! Instruction walking helpers shared by lowering passes.

use crate::builder::{Builder, Cursor};
use crate::ir::{Def, InstrId, Shader};

/// Calls `f` for every intrinsic that is live when the walk starts, in program order.
///
/// The builder's cursor is placed before the visited instruction. Instructions created by `f`
/// are not visited. Returns whether any call reported progress.
pub fn intrinsics_pass(shader: &mut Shader, mut f: impl FnMut(&mut Builder, InstrId) -> bool) -> bool {
    let worklist: Vec<InstrId> = shader
        .instrs_in_order()
        .into_iter()
        .filter(|&id| shader.intrinsic(id).is_some())
        .collect();
    let mut progress = false;
    for id in worklist {
        if shader.instr(id).is_removed() {
            continue;
        }
        let mut b = Builder::new(shader, Cursor::Before(id));
        progress |= f(&mut b, id);
    }
    progress
}

/// Result of lowering one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lowered {
    /// Nothing changed.
    Unchanged,
    /// The callback rewrote things itself.
    Progress,
    /// Replace all uses of the instruction's def with this value and remove it.
    Replace(Def),
    /// Remove the instruction, which must not have a used def.
    Remove,
}

/// Runs `lower` on every intrinsic accepted by `filter`.
pub fn lower_instructions(
    shader: &mut Shader,
    mut filter: impl FnMut(&Shader, InstrId) -> bool,
    mut lower: impl FnMut(&mut Builder, InstrId) -> Lowered,
) -> bool {
    intrinsics_pass(shader, |b, id| {
        if !filter(b.shader, id) {
            return false;
        }
        match lower(b, id) {
            Lowered::Unchanged => false,
            Lowered::Progress => true,
            Lowered::Replace(def) => {
                if let Some(old) = b.shader.instr(id).def() {
                    b.rewrite_uses(old, def);
                }
                b.remove(id);
                true
            }
            Lowered::Remove => {
                if let Some(old) = b.shader.instr(id).def() {
                    assert!(!b.shader.has_uses(old), "removed instruction still has uses");
                }
                b.remove(id);
                true
            }
        }
    })
}
