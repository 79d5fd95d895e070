//! Control-flow summary of a tessellation control shader.
//!
//! Answers which per-patch outputs every invocation defines, which ones only invocation 0
//! touches, and what the tess level stores can prove about the tessellator's behaviour.

use tracing::debug;

use crate::fold;
use crate::intrinsics::Intrinsic;
use crate::ir::{AluOp, CfNode, Def, IntrinsicInstr, MemoryModes, Scope, Shader};
use crate::types::{Stage, TessPrimitiveMode, TessSpacing};
use crate::varying;

/// Tess levels are tracked as bit 0 = outer, bit 1 = inner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcsInfo {
    /// Patch outputs (relative to `PATCH0`) written by every invocation on every path.
    pub patch_outputs_defined_by_all_invoc: u32,
    pub tess_levels_defined_by_all_invoc: u8,
    pub all_invocations_define_tess_levels: bool,

    pub patch_outputs_only_written_by_invoc0: u32,
    pub tess_levels_only_written_by_invoc0: u8,
    pub patch_outputs_only_read_by_invoc0: u32,
    pub tess_levels_only_read_by_invoc0: u8,

    /// Every patch is discarded: some outer level is always `<= 0` or NaN.
    pub all_tess_levels_are_effectively_zero: bool,
    /// Every patch tessellates as if all levels were 1.
    pub all_tess_levels_are_effectively_one: bool,
    /// An output barrier executes unconditionally.
    pub always_executes_barrier: bool,
    /// Some outer level store may discard a patch.
    pub can_discard_patches: bool,
}

/// 32 patch outputs and the two tess level slots, 8 channels each. Channels 4..8 are the
/// upper halves of 16-bit stores.
const NUM_OUTPUTS: usize = 34;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChanMask([u64; (NUM_OUTPUTS * 8).div_ceil(64)]);

impl ChanMask {
    fn set(&mut self, bit: usize) {
        self.0[bit / 64] |= 1 << (bit % 64);
    }

    fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    fn and(&self, other: &Self) -> Self {
        Self(std::array::from_fn(|i| self.0[i] & other.0[i]))
    }

    fn or(&self, other: &Self) -> Self {
        Self(std::array::from_fn(|i| self.0[i] | other.0[i]))
    }

    fn and_not(&self, other: &Self) -> Self {
        Self(std::array::from_fn(|i| self.0[i] & !other.0[i]))
    }

    fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NUM_OUTPUTS * 8).filter(|&b| self.0[b / 64] & (1 << (b % 64)) != 0)
    }
}

fn is_tcs_output_barrier(intr: &IntrinsicInstr) -> bool {
    intr.op == Intrinsic::Barrier
        && intr.idx.memory_modes.contains(MemoryModes::SHADER_OUT)
        && intr.idx.memory_scope >= Scope::Workgroup
        && intr.idx.execution_scope >= Scope::Workgroup
}

/// Index into the 34-output space, for per-patch locations.
fn patch_output_index(location: u32) -> Option<usize> {
    if varying::is_patch(location) {
        Some((location - varying::PATCH0) as usize)
    } else if varying::is_tess_level(location) {
        Some(32 + (location - varying::TESS_LEVEL_OUTER) as usize)
    } else {
        None
    }
}

/// Clears outputs of `result` that are only written conditionally in the segment.
fn accum_defined_by_all(outer: &ChanMask, cond: &ChanMask, result: &mut u64) {
    for bit in cond.and_not(outer).iter_set() {
        *result &= !(1u64 << (bit / 8));
    }
}

fn scan_defined_by_all(
    shader: &Shader,
    list: &[CfNode],
    outer: &mut ChanMask,
    cond: &mut ChanMask,
    result: &mut u64,
    nested: bool,
) {
    for node in list {
        match *node {
            CfNode::Block(block) => {
                for &id in &shader.block(block).instrs {
                    let Some(intr) = shader.intrinsic(id) else { continue };

                    if is_tcs_output_barrier(intr) {
                        // Barriers in control flow can't be reasoned about.
                        if nested {
                            *result = 0;
                            return;
                        }
                        // Each barrier-separated segment must write the same channels on all
                        // paths.
                        if !outer.is_empty() || !cond.is_empty() {
                            accum_defined_by_all(outer, cond, result);
                            *outer = ChanMask::default();
                            *cond = ChanMask::default();
                        }
                        continue;
                    }

                    if intr.op != Intrinsic::StoreOutput {
                        continue;
                    }
                    let Some(index) = patch_output_index(intr.idx.io.location) else {
                        continue;
                    };
                    let shift = intr.idx.component as u32 + if intr.idx.io.high_16bits { 4 } else { 0 };
                    let mask = intr.idx.write_mask << shift;
                    for i in (0..8).filter(|i| mask & (1 << i) != 0) {
                        outer.set(index * 8 + i);
                    }
                }
            }
            CfNode::If(nif) => {
                let node = shader.if_node(nif);
                let mut then_masks = ChanMask::default();
                let mut else_masks = ChanMask::default();
                scan_defined_by_all(shader, &node.then_list, &mut then_masks, cond, result, true);
                scan_defined_by_all(shader, &node.else_list, &mut else_masks, cond, result, true);

                if !then_masks.is_empty() || !else_masks.is_empty() {
                    // Channels written on both sides count as written by the outer block.
                    *outer = outer.or(&then_masks.and(&else_masks));
                    *cond = cond.or(&then_masks.or(&else_masks));
                }
            }
            CfNode::Loop(lp) => {
                let mut cond_copy = *cond;
                scan_defined_by_all(
                    shader,
                    &shader.loop_node(lp).body,
                    &mut cond_copy,
                    cond,
                    result,
                    true,
                );
                *cond = cond.or(&cond_copy);
            }
        }
        if *result == 0 {
            return;
        }
    }
}

#[derive(Default)]
struct Analysis {
    patch_outputs_defined_by_all_invoc: u32,
    tess_levels_defined_by_all_invoc: u8,
    all_invocations_define_tess_levels: bool,
}

fn tess_levels_written(shader: &Shader) -> u8 {
    let written = shader.info.outputs_written;
    (written & varying::bit(varying::TESS_LEVEL_OUTER) != 0) as u8
        | ((written & varying::bit(varying::TESS_LEVEL_INNER) != 0) as u8) << 1
}

fn analyze_patch_outputs(shader: &Shader) -> Analysis {
    let tess_levels_written = tess_levels_written(shader);
    if shader.info.tess.tcs_vertices_out == 1 {
        return Analysis {
            patch_outputs_defined_by_all_invoc: shader.info.patch_outputs_written,
            tess_levels_defined_by_all_invoc: tess_levels_written,
            all_invocations_define_tess_levels: true,
        };
    }

    let mut main_masks = ChanMask::default();
    let mut cond_masks = ChanMask::default();
    let mut result = (1u64 << NUM_OUTPUTS) - 1;
    scan_defined_by_all(shader, shader.body(), &mut main_masks, &mut cond_masks, &mut result, false);
    if !main_masks.is_empty() || !cond_masks.is_empty() {
        accum_defined_by_all(&main_masks, &cond_masks, &mut result);
    }

    let tess_levels = ((result >> 32) as u8) & tess_levels_written;
    Analysis {
        patch_outputs_defined_by_all_invoc: result as u32 & shader.info.patch_outputs_written,
        tess_levels_defined_by_all_invoc: tess_levels,
        all_invocations_define_tess_levels: tess_levels == tess_levels_written,
    }
}

/// Whether `cond` is `invocation_id == 0`.
fn is_invoc0_condition(shader: &Shader, cond: Def, op: AluOp) -> bool {
    let Some(alu) = shader.instr(shader.parent_instr(cond)).as_alu() else {
        return false;
    };
    if alu.op != op || alu.srcs.len() != 2 {
        return false;
    }
    let is_invocation_id = |d: Def| {
        shader
            .def_intrinsic(d)
            .is_some_and(|intr| intr.op == Intrinsic::LoadInvocationId)
    };
    let is_zero = |d: Def| shader.const_component(d, 0) == Some(0);
    let (a, b) = (alu.srcs[0].def, alu.srcs[1].def);
    (is_invocation_id(a) && is_zero(b)) || (is_zero(a) && is_invocation_id(b))
}

#[derive(Default)]
struct Invoc0Masks {
    patch_written: u32,
    patch_written_elsewhere: u32,
    patch_read: u32,
    patch_read_elsewhere: u32,
    tess_written: u8,
    tess_written_elsewhere: u8,
    tess_read: u8,
    tess_read_elsewhere: u8,
}

fn scan_invoc0(shader: &Shader, list: &[CfNode], in_invoc0: bool, masks: &mut Invoc0Masks) {
    for node in list {
        match *node {
            CfNode::Block(block) => {
                for &id in &shader.block(block).instrs {
                    let Some(intr) = shader.intrinsic(id) else { continue };
                    let is_store = intr.op == Intrinsic::StoreOutput;
                    if !is_store && intr.op != Intrinsic::LoadOutput {
                        continue;
                    }
                    let loc = intr.idx.io.location;
                    if varying::is_patch(loc) {
                        let slots = intr.idx.io.num_slots.max(1) as u32;
                        let bits = (((1u64 << slots) - 1) << (loc - varying::PATCH0)) as u32;
                        match (is_store, in_invoc0) {
                            (true, true) => masks.patch_written |= bits,
                            (true, false) => masks.patch_written_elsewhere |= bits,
                            (false, true) => masks.patch_read |= bits,
                            (false, false) => masks.patch_read_elsewhere |= bits,
                        }
                    } else if varying::is_tess_level(loc) {
                        let bit = 1u8 << (loc - varying::TESS_LEVEL_OUTER);
                        match (is_store, in_invoc0) {
                            (true, true) => masks.tess_written |= bit,
                            (true, false) => masks.tess_written_elsewhere |= bit,
                            (false, true) => masks.tess_read |= bit,
                            (false, false) => masks.tess_read_elsewhere |= bit,
                        }
                    }
                }
            }
            CfNode::If(nif) => {
                let node = shader.if_node(nif);
                let then_invoc0 = in_invoc0 || is_invoc0_condition(shader, node.condition, AluOp::Ieq);
                let else_invoc0 = in_invoc0 || is_invoc0_condition(shader, node.condition, AluOp::Ine);
                scan_invoc0(shader, &node.then_list, then_invoc0, masks);
                scan_invoc0(shader, &node.else_list, else_invoc0, masks);
            }
            CfNode::Loop(lp) => scan_invoc0(shader, &shader.loop_node(lp).body, in_invoc0, masks),
        }
    }
}

/// Follows `mov`/`vec` chains to the scalar that feeds component `c` of `def`.
fn resolve_scalar(shader: &Shader, mut def: Def, mut c: u8) -> (Def, u8) {
    loop {
        let Some(alu) = shader.instr(shader.parent_instr(def)).as_alu() else {
            return (def, c);
        };
        match alu.op {
            AluOp::Mov => {
                let src = alu.srcs[0];
                c = src.swizzle[c as usize];
                def = src.def;
            }
            AluOp::Vec => {
                let src = alu.srcs[c as usize];
                c = src.swizzle[0];
                def = src.def;
            }
            _ => return (def, c),
        }
    }
}

fn bit_range(start: u32, count: u32) -> u32 {
    ((1u32 << count) - 1) << start
}

/// Gathers [`TcsInfo`]. `prim` and `spacing` may be unspecified.
pub fn gather_tcs_info(shader: &Shader, prim: TessPrimitiveMode, spacing: TessSpacing) -> TcsInfo {
    assert_eq!(shader.stage(), Stage::TessCtrl, "TCS info requires a tessellation control shader");

    let analysis = analyze_patch_outputs(shader);
    let mut info = TcsInfo {
        patch_outputs_defined_by_all_invoc: analysis.patch_outputs_defined_by_all_invoc,
        tess_levels_defined_by_all_invoc: analysis.tess_levels_defined_by_all_invoc,
        all_invocations_define_tess_levels: analysis.all_invocations_define_tess_levels,
        ..TcsInfo::default()
    };

    if shader.info.tess.tcs_vertices_out == 1 {
        info.patch_outputs_only_written_by_invoc0 = shader.info.patch_outputs_written;
        info.tess_levels_only_written_by_invoc0 = tess_levels_written(shader);
        info.patch_outputs_only_read_by_invoc0 = shader.info.patch_outputs_read;
        info.tess_levels_only_read_by_invoc0 = (shader.info.outputs_read >> varying::TESS_LEVEL_OUTER) as u8 & 0x3;
    } else {
        let mut masks = Invoc0Masks::default();
        scan_invoc0(shader, shader.body(), false, &mut masks);
        info.patch_outputs_only_written_by_invoc0 = masks.patch_written & !masks.patch_written_elsewhere;
        info.tess_levels_only_written_by_invoc0 = masks.tess_written & !masks.tess_written_elsewhere;
        info.patch_outputs_only_read_by_invoc0 = masks.patch_read & !masks.patch_read_elsewhere;
        info.tess_levels_only_read_by_invoc0 = masks.tess_read & !masks.tess_read_elsewhere;
    }

    let mut le_zero = 0u32;
    let mut le_one = 0u32;
    let mut le_two = 0u32;
    let mut other = 0u32;

    for block in shader.blocks_in_order() {
        for &id in &shader.block(block).instrs {
            let Some(intr) = shader.intrinsic(id) else { continue };

            if is_tcs_output_barrier(intr) {
                if shader.is_top_level_block(block) {
                    info.always_executes_barrier = true;
                }
                continue;
            }

            if intr.op != Intrinsic::StoreOutput || !varying::is_tess_level(intr.idx.io.location) {
                continue;
            }

            let base_shift = if intr.idx.io.location == varying::TESS_LEVEL_INNER { 4 } else { 0 }
                + intr.idx.component as u32;
            let value = intr.srcs[0];
            for i in (0..8u32).filter(|i| intr.idx.write_mask & (1 << i) != 0) {
                let bit = 1u32 << (base_shift + i);
                let (def, c) = resolve_scalar(shader, value, i as u8);
                match shader.const_component(def, c as usize) {
                    Some(raw) => {
                        let f = fold::read_float(raw, shader.bit_size(def));
                        if f <= 0.0 || f.is_nan() {
                            le_zero |= bit;
                        } else if f <= 1.0 {
                            le_one |= bit;
                        } else if f <= 2.0 {
                            le_two |= bit;
                        } else {
                            other |= bit;
                        }
                    }
                    // Range analysis could do better here.
                    None => other |= bit,
                }
            }
        }
    }

    let min_prim = if prim == TessPrimitiveMode::Unspecified {
        TessPrimitiveMode::Isolines
    } else {
        prim
    };
    let (min_outer, _) = min_prim.tess_level_components();
    let (max_outer, max_inner) = prim.tess_level_components();
    let min_outer_mask = bit_range(0, min_outer);
    let max_outer_mask = bit_range(0, max_outer);
    let max_inner_mask = bit_range(4, max_inner);

    // One outer level <= 0 or NaN discards the patch; inner levels don't matter.
    info.all_tess_levels_are_effectively_zero =
        le_zero & !le_one & !le_two & !other & min_outer_mask != 0;

    let any = le_zero | le_one | le_two | other;
    let outer_gt_zero_le_one = (le_one & !le_zero & !le_two & !other & max_outer_mask) == (any & max_outer_mask);
    let inner_le_one = ((le_zero | le_one) & !le_two & !other & max_inner_mask) == (any & max_inner_mask);

    info.all_tess_levels_are_effectively_one = match spacing {
        TessSpacing::Equal | TessSpacing::FractionalOdd | TessSpacing::Unspecified => {
            // Levels in (0, 1] are clamped to 1.
            outer_gt_zero_le_one && inner_le_one
        }
        TessSpacing::FractionalEven => {
            // Everything clamps to 2 except outer[0] of isolines, which clamps to 1.
            let isolines = (le_one & !le_zero & !le_two & !other & 0x1) == (any & 0x1)
                && ((le_one | le_two) & !le_zero & !other & 0x2) == (any & 0x2);
            let triquads = ((le_one | le_two) & !le_zero & !other & max_outer_mask) == (any & max_outer_mask)
                && ((le_zero | le_one | le_two) & !other & max_inner_mask) == (any & max_inner_mask);
            match prim {
                TessPrimitiveMode::Unspecified => isolines && triquads,
                TessPrimitiveMode::Isolines => isolines,
                _ => triquads,
            }
        }
    };

    assert!(
        !(info.all_tess_levels_are_effectively_zero && info.all_tess_levels_are_effectively_one),
        "tess levels can't be effectively zero and one at once"
    );

    info.can_discard_patches = le_zero & min_outer_mask != 0;

    debug!(
        patch_all = info.patch_outputs_defined_by_all_invoc,
        tess_all = info.tess_levels_defined_by_all_invoc,
        zero = info.all_tess_levels_are_effectively_zero,
        one = info.all_tess_levels_are_effectively_one,
        barrier = info.always_executes_barrier,
        discards = info.can_discard_patches,
        "gathered TCS info"
    );
    info
}
