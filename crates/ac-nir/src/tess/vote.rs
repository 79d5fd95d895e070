//! Tess factor group vote.
//!
//! GFX11+ can skip the tess factor ring when every patch of a workgroup is discarded (some outer
//! level is `<= 0` or NaN) or tessellates as if every level were 1. The HS tells the hardware
//! with an `HS_TESSFACTOR` message. Older chips use the vote only to skip output stores of
//! discarded patches.
//!
//! When the levels are not known at compile time, each wave votes on its patches and the waves
//! AND their 2-bit votes together in the LDS dword at offset 0:
//!
//! ```text
//! shader start:  lane 0 of wave 0 stores 0b11
//! barrier
//! invocation 0 of each patch: per-lane tf0/tf1, vote_all per wave, atomic AND by one lane
//! barrier
//! one lane loads the result, read_invocation broadcasts it
//! ```

use nir::{
    AtomicOp, Builder, Def, Intrinsic, MemoryModes, MemorySemantics, Scope, TessPrimitiveMode,
    TessSpacing,
};
use tracing::debug;

use super::hs_outputs::{HsOutputState, TessLevels};
use crate::gfx::GfxLevel;
use crate::hw::SENDMSG_HS_TESSFACTOR;

/// Outcome of the vote, as a 32-bit value uniform across the workgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VoteResult {
    /// Store the outputs and the tess factors.
    Normal = 0,
    /// Every patch is discarded: skip the output stores, and the tess factor stores on GFX11+.
    AllTfZero = 1,
    /// Store the outputs; GFX11+ skips the tess factor stores.
    AllTfOne = 2,
}

impl VoteResult {
    pub const fn value(self) -> u64 {
        self as u64
    }
}

/// Largest level the tessellator treats like 1 for a patch it doesn't discard.
///
/// Fractional-even spacing clamps levels to 2, except the first outer level of isolines, which
/// it clamps to 1.
pub fn effectively_one_limit(spacing: TessSpacing, prim: TessPrimitiveMode, outer_index: Option<u32>) -> f64 {
    match spacing {
        TessSpacing::FractionalEven if !(prim == TessPrimitiveMode::Isolines && outer_index == Some(0)) => 2.0,
        _ => 1.0,
    }
}

fn send_hs_tessfactor(b: &mut Builder, m0: Def) {
    b.intrinsic(Intrinsic::SendmsgAmd)
        .src(m0)
        .base(SENDMSG_HS_TESSFACTOR as i32)
        .emit();
}

fn inverse_ballot(b: &mut Builder, mask: u64, wave_size: u32) -> Def {
    let mask = b.imm(&[mask], wave_size as u8);
    b.intrinsic(Intrinsic::InverseBallot).src(mask).sysval()
}

fn shared_barrier(b: &mut Builder) {
    b.barrier(
        Scope::Workgroup,
        Scope::Workgroup,
        MemorySemantics::ACQ_REL,
        MemoryModes::SHARED,
    );
}

/// `(discarded, effectively one)` of this lane's patch, assuming the domain is `prim`.
fn lane_votes(b: &mut Builder, prim: TessPrimitiveMode, outer: Def, inner: Option<Def>) -> (Def, Def) {
    let spacing = b.shader.info.tess.spacing;
    let (outer_comps, inner_comps) = prim.tess_level_components();
    let outer_comps = outer_comps.min(b.num_components(outer) as u32);
    let inner_comps = inner.map_or(0, |inner| inner_comps.min(b.num_components(inner) as u32));

    let mut effectively_0 = b.imm_false();
    for i in 0..outer_comps {
        // fgeu is true for NaN.
        let zero = b.imm_float(0.0);
        let level = b.channel(outer, i as u8);
        let le0 = b.fgeu(zero, level);
        effectively_0 = b.ior(effectively_0, le0);
    }

    let mut effectively_1 = b.imm_true();
    for i in 0..outer_comps {
        let level = b.channel(outer, i as u8);
        let le1 = b.fle_imm(level, effectively_one_limit(spacing, prim, Some(i)));
        effectively_1 = b.iand(effectively_1, le1);
    }
    if let Some(inner) = inner {
        for i in 0..inner_comps {
            let level = b.channel(inner, i as u8);
            let le1 = b.fle_imm(level, effectively_one_limit(spacing, prim, None));
            effectively_1 = b.iand(effectively_1, le1);
        }
    }
    (effectively_0, effectively_1)
}

/// Emits the vote and returns its [`VoteResult`] as a uniform 32-bit value.
///
/// Loads the tess levels into `levels` when it votes at runtime; the finale reuses them.
/// Also sends the `HS_TESSFACTOR` message on GFX11+.
pub(super) fn hs_tess_level_group_vote(
    b: &mut Builder,
    st: &HsOutputState<'_>,
    levels: &mut TessLevels,
    prim_mode: Def,
) -> Def {
    let info = &st.tcs_info;

    if info.all_tess_levels_are_effectively_zero || info.all_tess_levels_are_effectively_one {
        let all_zero = info.all_tess_levels_are_effectively_zero;
        if st.gfx_level >= GfxLevel::Gfx11 {
            let subgroup_id = b.load_sysval(Intrinsic::LoadSubgroupId);
            let is_subgroup0 = b.ieq_imm(subgroup_id, 0);
            let if_subgroup0 = b.push_if(is_subgroup0);
            // m0[0]: 0 = all factors 0, 1 = all factors 1.
            let m0 = b.imm_u32(if all_zero { 0 } else { 1 });
            send_hs_tessfactor(b, m0);
            b.pop_if(if_subgroup0);
        }
        let result = if all_zero { VoteResult::AllTfZero } else { VoteResult::AllTfOne };
        debug!(?result, "tess levels known at compile time, no group vote");
        return b.imm_u32(result as u32);
    }

    // Before GFX11 the vote only skips output stores of discarded patches.
    if st.gfx_level < GfxLevel::Gfx11 && !info.can_discard_patches {
        return b.imm_u32(VoteResult::Normal as u32);
    }

    // Initialize the vote dword with tf0 | tf1 at the start of the shader.
    b.cursor_at_function_start();
    {
        let subgroup_id = b.load_sysval(Intrinsic::LoadSubgroupId);
        let is_subgroup0 = b.ieq_imm(subgroup_id, 0);
        let is_lane0 = inverse_ballot(b, 0x1, st.wave_size);
        let cond = b.iand(is_subgroup0, is_lane0);
        let thread0 = b.push_if(cond);
        let init = b.imm_u32(0x3);
        let zero = b.imm_u32(0);
        b.intrinsic(Intrinsic::StoreShared)
            .src(init)
            .src(zero)
            .write_mask(0x1)
            .align(4, 0)
            .emit();
        b.pop_if(thread0);
    }
    b.cursor_at_function_end();

    // Without an earlier workgroup barrier, wait for the initialization.
    if !info.always_executes_barrier || st.tcs_out_patch_fits_subgroup {
        shared_barrier(b);
    }

    let invocation_id = b.load_sysval(Intrinsic::LoadInvocationId);
    let is_invocation0 = b.ieq_imm(invocation_id, 0);
    let if_invocation0 = b.push_if(is_invocation0);

    let loaded = st.load_tess_levels(b);
    let Some(outer) = loaded.outer else {
        unreachable!("every tess domain has outer levels");
    };
    let inner = loaded.inner;

    // if (triangles) .. else if (quads) .. else isolines
    let is_triangles = b.ieq_imm(prim_mode, TessPrimitiveMode::Triangles.hw_code() as u64);
    let if_triangles = b.push_if(is_triangles);
    let (tri_0, tri_1) = lane_votes(b, TessPrimitiveMode::Triangles, outer, inner);
    b.push_else(if_triangles);
    let is_quads = b.ieq_imm(prim_mode, TessPrimitiveMode::Quads.hw_code() as u64);
    let if_quads = b.push_if(is_quads);
    let (quad_0, quad_1) = lane_votes(b, TessPrimitiveMode::Quads, outer, inner);
    b.push_else(if_quads);
    let (iso_0, iso_1) = lane_votes(b, TessPrimitiveMode::Isolines, outer, inner);
    b.pop_if(if_quads);
    let else_0 = b.if_phi(quad_0, iso_0);
    let else_1 = b.if_phi(quad_1, iso_1);
    b.pop_if(if_triangles);
    let lane_tf0 = b.if_phi(tri_0, else_0);
    let lane_tf1 = b.if_phi(tri_1, else_1);

    // Mutually exclusive, so the AND across waves never yields 0b11.
    let not_tf0 = b.inot(lane_tf0);
    let lane_tf1 = b.iand(lane_tf1, not_tf0);

    let all_tf0 = b.intrinsic(Intrinsic::VoteAll).src(lane_tf0).sysval();
    let all_tf1 = b.intrinsic(Intrinsic::VoteAll).src(lane_tf1).sysval();
    let tf0 = b.b2i32(all_tf0);
    let tf1 = b.b2i32(all_tf1);
    let tf1 = b.ishl_imm(tf1, 1);
    let packed = b.ior(tf0, tf1);

    // Only invocation 0 of each patch is active here, and the first patch of the wave starts in
    // the lowest tcs_vertices_out lanes.
    assert!(st.tcs_vertices_out <= 32, "output patch of {} vertices", st.tcs_vertices_out);
    let first_lane_mask = (1u64 << st.tcs_vertices_out) - 1;
    let is_first_lane = inverse_ballot(b, first_lane_mask, st.wave_size);
    let if_first_lane = b.push_if(is_first_lane);
    let zero = b.imm_u32(0);
    b.intrinsic(Intrinsic::SharedAtomic)
        .src(zero)
        .src(packed)
        .atomic_op(AtomicOp::Iand)
        .def(1, 32);
    b.pop_if(if_first_lane);

    b.push_else(if_invocation0);
    let outer_undef = b.undef(b.num_components(outer), 32);
    let inner_undef = inner.map(|inner| b.undef(b.num_components(inner), 32));
    b.pop_if(if_invocation0);
    levels.outer = Some(b.if_phi(outer, outer_undef));
    levels.inner = match (inner, inner_undef) {
        (Some(inner), Some(undef)) => Some(b.if_phi(inner, undef)),
        _ => None,
    };

    // Wait for the atomics of every wave.
    shared_barrier(b);

    // One lane reads the result to avoid bank conflicts.
    let is_lane0 = inverse_ballot(b, 0x1, st.wave_size);
    let if_lane0 = b.push_if(is_lane0);
    let zero = b.imm_u32(0);
    let lds_result = b.intrinsic(Intrinsic::LoadShared).src(zero).align(4, 0).def(1, 32);
    b.push_else(if_lane0);
    let undef = b.undef(1, 32);
    b.pop_if(if_lane0);
    let lds_result = b.if_phi(lds_result, undef);
    let lane0 = b.imm_u32(0);
    let result = b
        .intrinsic(Intrinsic::ReadInvocation)
        .src(lds_result)
        .src(lane0)
        .def(1, 32);

    if st.gfx_level >= GfxLevel::Gfx11 {
        let use_memory = b.ieq_imm(result, VoteResult::Normal.value());
        let skip_memory = b.inot(use_memory);
        let subgroup_id = b.load_sysval(Intrinsic::LoadSubgroupId);
        let is_subgroup0 = b.ieq_imm(subgroup_id, 0);
        let cond = b.iand(skip_memory, is_subgroup0);
        let if_send = b.push_if(cond);
        let m0 = b.iadd_imm(result, u32::MAX as u64);
        send_hs_tessfactor(b, m0);
        b.pop_if(if_send);
    }

    debug!(
        gfx_level = %st.gfx_level,
        wave_size = st.wave_size,
        initial_barrier = !info.always_executes_barrier || st.tcs_out_patch_fits_subgroup,
        "emitted tess level group vote"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tess::{lower_hs_outputs_to_mem, HsOutputsOptions, TessIoInfo};
    use nir::varying::{self, TESS_LEVEL_OUTER};
    use nir::{IoSemantics, Shader, Stage, TcsInfo};
    use pretty_assertions::assert_eq;

    #[test]
    fn fractional_even_treats_two_as_one() {
        use TessPrimitiveMode::{Isolines, Quads};
        assert_eq!(effectively_one_limit(TessSpacing::FractionalEven, Quads, Some(0)), 2.0);
        assert_eq!(effectively_one_limit(TessSpacing::FractionalEven, Quads, None), 2.0);
        assert_eq!(effectively_one_limit(TessSpacing::FractionalEven, Isolines, Some(0)), 1.0);
        assert_eq!(effectively_one_limit(TessSpacing::FractionalEven, Isolines, Some(1)), 2.0);
        assert_eq!(effectively_one_limit(TessSpacing::FractionalOdd, Quads, Some(0)), 1.0);
        assert_eq!(effectively_one_limit(TessSpacing::Unspecified, Quads, None), 1.0);
    }

    /// `(discarded, effectively one)` of one lane as voted, with the one vote masked by the
    /// discard vote.
    fn votes(prim: TessPrimitiveMode, spacing: TessSpacing, outer: [f32; 4], inner: [f32; 2]) -> (bool, bool) {
        let mut shader = Shader::new(Stage::TessCtrl, "votes");
        shader.info.tess.spacing = spacing;
        let mut b = Builder::at_end(&mut shader);
        let outer = b.imm_vec4_f32(outer);
        let inner_x = b.imm_float(inner[0]);
        let inner_y = b.imm_float(inner[1]);
        let inner = b.vec2(inner_x, inner_y);
        let (tf0, tf1) = lane_votes(&mut b, prim, outer, Some(inner));
        let not_tf0 = b.inot(tf0);
        let tf1 = b.iand(tf1, not_tf0);

        let no_sysvals = |_: &nir::IntrinsicInstr| -> Option<Vec<u64>> { None };
        let tf0 = nir::eval_u32(&shader, tf0, &no_sysvals);
        let tf1 = nir::eval_u32(&shader, tf1, &no_sysvals);
        (tf0 == Some(1), tf1 == Some(1))
    }

    #[test]
    fn a_lane_never_votes_discard_and_one() {
        use TessPrimitiveMode::{Isolines, Quads, Triangles};
        let levels = [0.0, -1.0, f32::NAN, 0.5, 1.0, 2.0, 3.0];
        for prim in [Triangles, Quads, Isolines] {
            for spacing in [TessSpacing::Equal, TessSpacing::FractionalEven] {
                for &first in &levels {
                    for &rest in &levels {
                        let (tf0, tf1) = votes(prim, spacing, [first, rest, rest, rest], [rest, rest]);
                        assert!(
                            !(tf0 && tf1),
                            "{prim:?} {spacing:?} first={first} rest={rest} votes both"
                        );
                        // A level of 0.5 everywhere is neither discarded nor masked.
                        if first == 0.5 && rest == 0.5 {
                            assert_eq!((tf0, tf1), (false, true), "{prim:?} {spacing:?}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn nan_levels_discard_the_patch() {
        use TessPrimitiveMode::{Isolines, Quads, Triangles};
        for prim in [Triangles, Quads, Isolines] {
            let (tf0, tf1) = votes(prim, TessSpacing::Equal, [f32::NAN, 1.0, 1.0, 1.0], [1.0, 1.0]);
            assert_eq!((tf0, tf1), (true, false), "{prim:?}");
        }
        let (tf0, _) = votes(Quads, TessSpacing::Equal, [2.0, -1.0, 2.0, 2.0], [2.0, 2.0]);
        assert!(tf0);
    }

    #[test]
    fn fractional_even_isolines_clamp_only_the_second_level_to_two() {
        let spacing = TessSpacing::FractionalEven;
        let iso = TessPrimitiveMode::Isolines;
        assert_eq!(votes(iso, spacing, [2.0, 1.0, 0.0, 0.0], [0.0, 0.0]), (false, false));
        assert_eq!(votes(iso, spacing, [1.0, 2.0, 0.0, 0.0], [0.0, 0.0]), (false, true));
        assert_eq!(votes(iso, spacing, [1.0, 1.5, 9.0, 9.0], [9.0, 9.0]), (false, true));
        assert_eq!(votes(TessPrimitiveMode::Quads, spacing, [2.0; 4], [2.0, 2.0]), (false, true));
        assert_eq!(votes(iso, TessSpacing::Equal, [1.0, 2.0, 0.0, 0.0], [0.0, 0.0]), (false, false));
    }

    /// A TCS whose invocation 0 writes the outer levels.
    fn tcs() -> Shader {
        let mut shader = Shader::new(Stage::TessCtrl, "tcs");
        shader.info.tess.tcs_vertices_out = 4;
        shader.info.tess.primitive_mode = TessPrimitiveMode::Quads;
        shader.info.outputs_written = varying::bit(TESS_LEVEL_OUTER);
        let mut b = Builder::at_end(&mut shader);
        let levels = b.imm_vec4_f32([0.0, 4.0, 4.0, 4.0]);
        let zero = b.imm_u32(0);
        b.intrinsic(Intrinsic::StoreOutput)
            .srcs(&[levels, zero])
            .write_mask(0xf)
            .io(IoSemantics {
                location: TESS_LEVEL_OUTER,
                num_slots: 1,
                ..Default::default()
            })
            .emit();
        shader
    }

    fn lower(shader: &mut Shader, gfx_level: GfxLevel, tcs_info: TcsInfo) {
        let io_info = TessIoInfo {
            vgpr_output_mask: varying::bit(TESS_LEVEL_OUTER),
            ..Default::default()
        };
        let options = HsOutputsOptions {
            gfx_level: Some(gfx_level),
            ..Default::default()
        };
        lower_hs_outputs_to_mem(shader, &tcs_info, &io_info, &options).unwrap();
    }

    fn sendmsg_payloads(shader: &Shader) -> Vec<Option<u32>> {
        shader
            .find_intrinsics(Intrinsic::SendmsgAmd)
            .iter()
            .map(|&id| shader.const_u32(shader.intrinsic(id).unwrap().srcs[0]))
            .collect()
    }

    #[test]
    fn known_zero_levels_send_the_message_directly() {
        let mut shader = tcs();
        let tcs_info = TcsInfo {
            all_tess_levels_are_effectively_zero: true,
            can_discard_patches: true,
            ..Default::default()
        };
        lower(&mut shader, GfxLevel::Gfx11, tcs_info);
        assert_eq!(sendmsg_payloads(&shader), vec![Some(0)]);
        assert_eq!(shader.count_intrinsics(Intrinsic::VoteAll), 0);
        assert_eq!(shader.count_intrinsics(Intrinsic::SharedAtomic), 0);
        // Discarded patches store nothing to the off-chip ring.
        nir::validate(&shader).unwrap();
    }

    #[test]
    fn older_chips_skip_the_vote_without_discards() {
        let mut shader = tcs();
        lower(&mut shader, GfxLevel::Gfx10_3, TcsInfo::default());
        assert_eq!(shader.count_intrinsics(Intrinsic::VoteAll), 0);
        assert_eq!(shader.count_intrinsics(Intrinsic::SendmsgAmd), 0);
        assert_eq!(shader.count_intrinsics(Intrinsic::StoreShared), 0);
    }

    #[test]
    fn runtime_vote_reduces_through_lds() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut shader = tcs();
        let tcs_info = TcsInfo {
            can_discard_patches: true,
            ..Default::default()
        };
        lower(&mut shader, GfxLevel::Gfx11, tcs_info);

        // Initialization is the first LDS access of the shader.
        let init = shader.find_intrinsics(Intrinsic::StoreShared)[0];
        let first = shader
            .instrs_in_order()
            .into_iter()
            .find(|&id| {
                shader
                    .intrinsic(id)
                    .is_some_and(|i| matches!(i.op, Intrinsic::StoreShared | Intrinsic::StoreVar))
            })
            .unwrap();
        assert_eq!(first, init);
        assert_eq!(shader.const_u32(shader.intrinsic(init).unwrap().srcs[0]), Some(0x3));

        assert_eq!(shader.count_intrinsics(Intrinsic::VoteAll), 2);
        assert_eq!(shader.count_intrinsics(Intrinsic::SharedAtomic), 1);
        assert_eq!(shader.count_intrinsics(Intrinsic::ReadInvocation), 1);
        // The message payload is computed from the vote.
        assert_eq!(sendmsg_payloads(&shader), vec![None]);
        nir::validate(&shader).unwrap();
    }
}
