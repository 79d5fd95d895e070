//! Code appended to the end of the HS: tess factor stores for the tessellator and the TES, and the
//! off-chip ring stores of every output the TES reads.

use nir::varying::{self, NUM_SLOTS, PATCH0, TESS_LEVEL_OUTER};
use nir::{Access, Builder, Def, Intrinsic, MemoryModes, MemorySemantics, Scope, Shader, TessPrimitiveMode};
use tracing::debug;

use super::hs_outputs::{ChannelVars, HsOutputState, TessLevels};
use super::vote::{hs_tess_level_group_vote, VoteResult};
use super::TESS_LVL_MASK;
use crate::gfx::GfxLevel;
use crate::hw::{merged_wave_info, TF_RING_CONTROL_WORD};
use crate::prerast::BitIter;

const TF_RING_ACCESS: Access = Access::COHERENT.union(Access::CP_GE_COHERENT);

/// Patch 0 of each workgroup writes the dynamic HS control word in front of the factors.
fn store_dynamic_control_word_gfx6(b: &mut Builder) {
    let rel_patch_id = b.load_sysval(Intrinsic::LoadTessRelPatchIdAmd);
    let ring = b.load_sysval(Intrinsic::LoadRingTessFactorsAmd);
    let base = b.load_sysval(Intrinsic::LoadRingTessFactorsOffsetAmd);

    let is_patch0 = b.ieq_imm(rel_patch_id, 0);
    let if_patch0 = b.push_if(is_patch0);
    let zero = b.imm_u32(0);
    let control_word = b.imm_u32(TF_RING_CONTROL_WORD);
    b.intrinsic(Intrinsic::StoreBufferAmd)
        .srcs(&[control_word, ring, zero, base, zero])
        .access(Access::COHERENT)
        .emit();
    b.pop_if(if_patch0);
}

fn resize_tess_factor(b: &mut Builder, tf: Option<Def>, comps: u32) -> Option<Def> {
    let comps = comps as u8;
    if comps == 0 {
        return None;
    }
    let Some(tf) = tf else {
        return Some(b.imm_zero(comps, 32));
    };
    let nc = b.num_components(tf);
    Some(if comps > nc {
        b.pad_vector_imm_int(tf, 0, comps)
    } else if comps < nc {
        b.trim_vector(tf, comps)
    } else {
        tf
    })
}

/// Stores the factors of the current patch in the layout the tessellator expects for `prim`.
fn store_tess_factors_for_tessellator(b: &mut Builder, gfx_level: GfxLevel, prim: TessPrimitiveMode, levels: TessLevels) {
    let rel_patch_id = b.load_sysval(Intrinsic::LoadTessRelPatchIdAmd);
    let ring = b.load_sysval(Intrinsic::LoadRingTessFactorsAmd);
    let base = b.load_sysval(Intrinsic::LoadRingTessFactorsOffsetAmd);
    let zero = b.imm_u32(0);

    // GFX6-8 have the control word in the first dword.
    let const_offset = if gfx_level <= GfxLevel::Gfx8 { 4 } else { 0 };
    let (outer_comps, inner_comps) = prim.tess_level_components();
    let offset = b.imul_imm(rel_patch_id, ((outer_comps + inner_comps) * 4) as u64);

    let outer = resize_tess_factor(b, levels.outer, outer_comps);
    let inner = resize_tess_factor(b, levels.inner, inner_comps);

    let store = |b: &mut Builder, value: Def, const_offset: u32| {
        b.intrinsic(Intrinsic::StoreBufferAmd)
            .srcs(&[value, ring, offset, base, zero])
            .base(const_offset as i32)
            .access(TF_RING_ACCESS)
            .emit();
    };

    match (prim, outer, inner) {
        (TessPrimitiveMode::Isolines, Some(outer), _) => {
            // The tessellator wants the line density first.
            let x = b.channel(outer, 1);
            let y = b.channel(outer, 0);
            let reversed = b.vec2(x, y);
            store(b, reversed, const_offset);
        }
        (TessPrimitiveMode::Triangles, Some(outer), Some(inner)) => {
            let comps = [b.channel(outer, 0), b.channel(outer, 1), b.channel(outer, 2), b.channel(inner, 0)];
            let packed = b.vec(&comps);
            store(b, packed, const_offset);
        }
        (_, Some(outer), Some(inner)) => {
            store(b, outer, const_offset);
            store(b, inner, const_offset + 4 * outer_comps);
        }
        _ => unreachable!("{prim:?} without tess factors"),
    }
}

/// Writes the tess levels the TES reads to their per-patch ring attributes as whole vec4s.
fn store_tess_factors_for_tes(b: &mut Builder, st: &HsOutputState<'_>, levels: TessLevels) {
    let ring = b.load_sysval(Intrinsic::LoadRingTessOffchipAmd);
    let offchip_offset = b.load_sysval(Intrinsic::LoadRingTessOffchipOffsetAmd);
    let zero = b.imm_u32(0);

    for (i, level) in [levels.outer, levels.inner].into_iter().enumerate() {
        let slot = TESS_LEVEL_OUTER + i as u32;
        let Some(level) = level else { continue };
        // Linked layouts reuse the slots of levels the TES doesn't read.
        if st.io_info.vram_output_mask & varying::bit(slot) == 0 {
            continue;
        }
        let off = st.vram().per_patch_offset(b, slot, 0, zero, None);
        let value = b.pad_vec4(level);
        b.intrinsic(Intrinsic::StoreBufferAmd)
            .srcs(&[value, ring, off, offchip_offset, zero])
            .modes(MemoryModes::SHADER_OUT)
            .access(Access::COHERENT)
            .emit();
    }
}

/// One 32-bit channel from its variables: a 32-bit value or two 16-bit halves.
fn load_output_channel(b: &mut Builder, vars: &ChannelVars, chan: usize) -> Def {
    let lo = vars[chan].map(|var| b.load_var(var));
    let hi = vars[4 + chan].map(|var| b.load_var(var));
    match (lo, hi) {
        (Some(lo), Some(hi)) => b.pack_32_2x16_split(lo, hi),
        (None, Some(hi)) => {
            let hi = b.u2u32(hi);
            b.ishl_imm(hi, 16)
        }
        (Some(lo), None) => b.u2u32(lo),
        (None, None) => b.undef(1, 32),
    }
}

fn make_vec4(b: &mut Builder, comps: [Option<Def>; 4]) -> Def {
    let comps = comps.map(|c| c.unwrap_or_else(|| b.undef(1, 32)));
    b.vec(&comps)
}

/// Ring values of every per-vertex and per-patch output, gathered by each invocation.
struct GatheredOutputs {
    per_vertex: [Option<Def>; NUM_SLOTS],
    per_patch: [Option<Def>; 32],
}

impl GatheredOutputs {
    fn gather(b: &mut Builder, st: &HsOutputState<'_>) -> Self {
        let outputs_in_lds = b.shader.info.outputs_written & !st.io_info.vgpr_output_mask;
        let patch_outputs_in_lds = b.shader.info.patch_outputs_written & !st.io_info.vgpr_patch_output_mask;
        let invocation_id = b.load_sysval(Intrinsic::LoadInvocationId);
        let zero = b.imm_u32(0);
        let mut gathered = Self {
            per_vertex: [None; NUM_SLOTS],
            per_patch: [None; 32],
        };

        for slot in BitIter(st.io_info.vram_output_mask & !TESS_LVL_MASK) {
            let chan_mask = st.per_vertex_vmem_chan_mask[slot as usize];
            if chan_mask == 0 {
                continue;
            }
            let mut comps = [None; 4];
            for i in BitIter(chan_mask as u64) {
                comps[i as usize] = Some(if outputs_in_lds & varying::bit(slot) != 0 {
                    let off = st.lds().output_offset(b, slot, i, Some(invocation_id), Some(zero));
                    b.intrinsic(Intrinsic::LoadShared).src(off).def(1, 32)
                } else {
                    load_output_channel(b, &st.per_vertex_vars[slot as usize], i as usize)
                });
            }
            gathered.per_vertex[slot as usize] = Some(make_vec4(b, comps));
        }

        for index in BitIter(st.io_info.vram_patch_output_mask as u64) {
            let chan_mask = st.per_patch_vmem_chan_mask[index as usize];
            if chan_mask == 0 {
                continue;
            }
            let mut comps = [None; 4];
            for i in BitIter(chan_mask as u64) {
                comps[i as usize] = Some(if patch_outputs_in_lds & (1 << index) != 0 {
                    let off = st.lds().output_offset(b, PATCH0 + index, i, None, Some(zero));
                    b.intrinsic(Intrinsic::LoadShared).src(off).def(1, 32)
                } else {
                    load_output_channel(b, &st.per_patch_vars[index as usize], i as usize)
                });
            }
            gathered.per_patch[index as usize] = Some(make_vec4(b, comps));
        }
        gathered
    }

    fn defs(&self) -> impl Iterator<Item = Def> + '_ {
        self.per_vertex.iter().chain(&self.per_patch).flatten().copied()
    }

    /// Replaces every value with a phi of it and an undef from the else branch of the `if`
    /// preceding the cursor.
    fn merge(&mut self, b: &mut Builder, undefs: &[Def]) {
        let mut undefs = undefs.iter().copied();
        for value in self.per_vertex.iter_mut().chain(&mut self.per_patch).flatten() {
            let Some(undef) = undefs.next() else {
                unreachable!("an undef for every gathered output");
            };
            *value = b.if_phi(*value, undef);
        }
    }
}

/// Closes the `if` opened at the cursor's block and merges the gathered outputs with undefs.
fn pop_if_with_undef_outputs(b: &mut Builder, nif: nir::IfId, outputs: &mut GatheredOutputs, extra: &[Def]) -> Vec<Def> {
    b.push_else(nif);
    let undefs: Vec<Def> = outputs.defs().map(|_| b.undef(4, 32)).collect();
    let extra_undefs: Vec<Def> = extra
        .iter()
        .map(|&def| {
            let (nc, bits) = (b.num_components(def), b.bit_size(def));
            b.undef(nc, bits)
        })
        .collect();
    b.pop_if(nif);
    let merged = extra
        .iter()
        .zip(extra_undefs)
        .map(|(&def, undef)| b.if_phi(def, undef))
        .collect();
    outputs.merge(b, &undefs);
    merged
}

pub(super) fn hs_finale(shader: &mut Shader, st: &mut HsOutputState<'_>) {
    let mut b = Builder::at_end(shader);
    let b = &mut b;
    let info = &b.shader.info;

    // Wait for the output stores to LDS.
    if info.outputs_written & !st.io_info.vgpr_output_mask != 0
        || info.patch_outputs_written & !st.io_info.vgpr_patch_output_mask != 0
    {
        let scope = if st.tcs_out_patch_fits_subgroup { Scope::Subgroup } else { Scope::Workgroup };
        b.barrier(scope, scope, MemorySemantics::ACQ_REL, MemoryModes::SHARED);
        st.tcs_info.always_executes_barrier = true;
    }

    let prim_mode = b.load_sysval(Intrinsic::LoadTcsPrimitiveModeAmd);
    let mut levels = TessLevels::default();
    let mut vote_result = hs_tess_level_group_vote(b, st, &mut levels, prim_mode);

    // Only the first invocation of each patch stores the tess factors.
    let invocation_id = b.load_sysval(Intrinsic::LoadInvocationId);
    let is_invocation0 = b.ieq_imm(invocation_id, 0);
    let if_invocation0 = b.push_if(is_invocation0);
    {
        if levels.outer.is_none() {
            levels = st.load_tess_levels(b);
        }

        let if_use_memory = (st.gfx_level >= GfxLevel::Gfx11).then(|| {
            let normal = b.ieq_imm(vote_result, VoteResult::Normal.value());
            b.push_if(normal)
        });

        if st.gfx_level <= GfxLevel::Gfx8 {
            store_dynamic_control_word_gfx6(b);
        }

        let is_triangles = b.ieq_imm(prim_mode, TessPrimitiveMode::Triangles.hw_code() as u64);
        let if_triangles = b.push_if(is_triangles);
        store_tess_factors_for_tessellator(b, st.gfx_level, TessPrimitiveMode::Triangles, levels);
        b.push_else(if_triangles);
        {
            let is_isolines = b.ieq_imm(prim_mode, TessPrimitiveMode::Isolines.hw_code() as u64);
            let if_isolines = b.push_if(is_isolines);
            store_tess_factors_for_tessellator(b, st.gfx_level, TessPrimitiveMode::Isolines, levels);
            b.push_else(if_isolines);
            store_tess_factors_for_tessellator(b, st.gfx_level, TessPrimitiveMode::Quads, levels);
            b.pop_if(if_isolines);
        }
        b.pop_if(if_triangles);

        if let Some(if_use_memory) = if_use_memory {
            b.pop_if(if_use_memory);
        }

        let tes_reads_levels = b.load_sysval(Intrinsic::LoadTcsTessLevelsToTesAmd);
        let if_tes_reads = b.push_if(tes_reads_levels);
        store_tess_factors_for_tes(b, st, levels);
        b.pop_if(if_tes_reads);
    }
    b.pop_if(if_invocation0);

    // Discarded patches don't need their outputs.
    let not_discarded = b.ine_imm(vote_result, VoteResult::AllTfZero.value());
    let if_not_discarded = b.push_if(not_discarded);
    let mut outputs = GatheredOutputs::gather(b, st);
    pop_if_with_undef_outputs(b, if_not_discarded, &mut outputs, &[]);

    if st.gfx_level >= GfxLevel::Gfx9 {
        // LS and HS share the wave; only the HS threads run the TCS.
        let body = b.shader.extract_body();
        b.cursor_at_function_start();
        let wave_info = b.load_sysval(Intrinsic::LoadMergedWaveInfoAmd);
        let is_hs_thread = b
            .intrinsic(Intrinsic::IsSubgroupInvocationLtAmd)
            .src(wave_info)
            .base(merged_wave_info::SECOND_STAGE_THREADS.0 as i32)
            .sysval();
        let if_hs = b.push_if(is_hs_thread);
        b.reinsert_cf(body);
        // The vote result is uniform, so its phi is free.
        vote_result = pop_if_with_undef_outputs(b, if_hs, &mut outputs, &[vote_result])[0];
    }

    let mut is_hs_thread = b.imm_true();
    let mut is_vertex_store_thread = b.imm_true();
    // Whole 128 B (GFX10+) or 64 B (GFX9) ring blocks are written when the EXEC mask is aligned
    // to 8 or 4 lanes. The EXEC mask of GFX6-8 is never aligned.
    if st.gfx_level >= GfxLevel::Gfx9 {
        let align = if st.gfx_level >= GfxLevel::Gfx10 { 8 } else { 4 };
        let wave_info = b.load_sysval(Intrinsic::LoadMergedWaveInfoAmd);
        let (offset, bits) = merged_wave_info::SECOND_STAGE_THREADS;
        let num_hs_threads = b.ubfe_imm(wave_info, offset, bits);
        let aligned_hs_threads = b.align_imm(num_hs_threads, align);
        is_hs_thread = b.intrinsic(Intrinsic::IsSubgroupInvocationLtAmd).src(num_hs_threads).sysval();
        is_vertex_store_thread = b
            .intrinsic(Intrinsic::IsSubgroupInvocationLtAmd)
            .src(aligned_hs_threads)
            .sysval();
    }

    let local_invocation_index = b.load_sysval(Intrinsic::LoadLocalInvocationIndex);
    let ring = b.load_sysval(Intrinsic::LoadRingTessOffchipAmd);
    let offchip_offset = b.load_sysval(Intrinsic::LoadRingTessOffchipOffsetAmd);
    let zero = b.imm_u32(0);
    // With one vertex per patch the aligned vertex threads store the patch outputs too.
    let patch_outputs_use_vertex_threads = st.tcs_vertices_out == 1;

    let store_ring = |b: &mut Builder, value: Def, off: Def| {
        b.intrinsic(Intrinsic::StoreBufferAmd)
            .srcs(&[value, ring, off, offchip_offset, zero])
            .modes(MemoryModes::SHADER_OUT)
            .access(Access::COHERENT)
            .emit();
    };

    let not_discarded = b.ine_imm(vote_result, VoteResult::AllTfZero.value());
    let cond = b.iand(is_vertex_store_thread, not_discarded);
    let if_vertex_stores = b.push_if(cond);
    for (slot, value) in outputs.per_vertex.iter().enumerate() {
        let Some(value) = *value else { continue };
        let off = st
            .vram()
            .per_vertex_offset(b, slot as u32, 0, local_invocation_index, zero, Some(zero));
        store_ring(b, value, off);
    }

    let if_patch_stores = if patch_outputs_use_vertex_threads {
        if_vertex_stores
    } else {
        b.pop_if(if_vertex_stores);
        let invocation_id = b.load_sysval(Intrinsic::LoadInvocationId);
        let is_invocation0 = b.ieq_imm(invocation_id, 0);
        let not_discarded = b.ine_imm(vote_result, VoteResult::AllTfZero.value());
        let first_live = b.iand(is_invocation0, not_discarded);
        let cond = b.iand(is_hs_thread, first_live);
        b.push_if(cond)
    };
    for (index, value) in outputs.per_patch.iter().enumerate() {
        let Some(value) = *value else { continue };
        let patch_offset = patch_outputs_use_vertex_threads.then(|| b.imul_imm(local_invocation_index, 16));
        let off = st
            .vram()
            .per_patch_offset(b, PATCH0 + index as u32, 0, zero, patch_offset);
        store_ring(b, value, off);
    }
    b.pop_if(if_patch_stores);

    debug!(
        gfx_level = %st.gfx_level,
        per_vertex = outputs.per_vertex.iter().flatten().count(),
        per_patch = outputs.per_patch.iter().flatten().count(),
        patch_outputs_use_vertex_threads,
        "emitted HS finale"
    );
}

#[cfg(test)]
mod tests {
    use crate::gfx::GfxLevel;
    use crate::tess::{lower_hs_outputs_to_mem, HsOutputsOptions, TessIoInfo};
    use nir::varying::{self, PATCH0, TESS_LEVEL_INNER, TESS_LEVEL_OUTER, VAR0};
    use nir::{Builder, Intrinsic, IoSemantics, Shader, Stage, TcsInfo, TessPrimitiveMode};
    use pretty_assertions::assert_eq;

    fn io(location: u32) -> IoSemantics {
        IoSemantics {
            location,
            num_slots: 1,
            ..Default::default()
        }
    }

    /// Writes `VAR0.xy` per vertex, `PATCH0.x`, and both tess levels.
    fn tcs(vertices_out: u8) -> Shader {
        let mut shader = Shader::new(Stage::TessCtrl, "tcs");
        shader.info.tess.tcs_vertices_out = vertices_out;
        shader.info.tess.primitive_mode = TessPrimitiveMode::Quads;
        shader.info.outputs_written = varying::bit(VAR0) | varying::bit(TESS_LEVEL_OUTER) | varying::bit(TESS_LEVEL_INNER);
        shader.info.patch_outputs_written = 0b1;

        let mut b = Builder::at_end(&mut shader);
        let invocation_id = b.load_sysval(Intrinsic::LoadInvocationId);
        let zero = b.imm_u32(0);
        let value = b.imm_vec4_f32([1.0, 2.0, 0.0, 0.0]);
        let value = b.trim_vector(value, 2);
        b.intrinsic(Intrinsic::StorePerVertexOutput)
            .srcs(&[value, invocation_id, zero])
            .write_mask(0x3)
            .io(io(VAR0))
            .emit();
        let patch = b.imm_float(7.0);
        b.intrinsic(Intrinsic::StoreOutput)
            .srcs(&[patch, zero])
            .write_mask(0x1)
            .io(io(PATCH0))
            .emit();
        let outer = b.imm_vec4_f32([4.0; 4]);
        b.intrinsic(Intrinsic::StoreOutput)
            .srcs(&[outer, zero])
            .write_mask(0xf)
            .io(io(TESS_LEVEL_OUTER))
            .emit();
        let inner = b.imm_vec4_f32([4.0, 4.0, 0.0, 0.0]);
        let inner = b.trim_vector(inner, 2);
        b.intrinsic(Intrinsic::StoreOutput)
            .srcs(&[inner, zero])
            .write_mask(0x3)
            .io(io(TESS_LEVEL_INNER))
            .emit();
        shader
    }

    fn all_in_vgprs() -> TessIoInfo {
        let tess_levels = varying::bit(TESS_LEVEL_OUTER) | varying::bit(TESS_LEVEL_INNER);
        TessIoInfo {
            vram_output_mask: varying::bit(VAR0) | tess_levels,
            vram_patch_output_mask: 0b1,
            vgpr_output_mask: varying::bit(VAR0) | tess_levels,
            vgpr_patch_output_mask: 0b1,
            ..Default::default()
        }
    }

    fn lower(shader: &mut Shader, gfx_level: GfxLevel, io_info: &TessIoInfo) {
        let options = HsOutputsOptions {
            gfx_level: Some(gfx_level),
            ..Default::default()
        };
        lower_hs_outputs_to_mem(shader, &TcsInfo::default(), io_info, &options).unwrap();
    }

    fn buffer_store_bases(shader: &Shader) -> Vec<i32> {
        shader
            .find_intrinsics(Intrinsic::StoreBufferAmd)
            .iter()
            .map(|&id| shader.intrinsic(id).unwrap().idx.base)
            .collect()
    }

    #[test]
    fn gfx8_writes_the_control_word_and_shifts_the_factors() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut shader = tcs(4);
        lower(&mut shader, GfxLevel::Gfx8, &all_in_vgprs());

        let stores = shader.find_intrinsics(Intrinsic::StoreBufferAmd);
        let control_word = shader.intrinsic(stores[0]).unwrap();
        assert_eq!(shader.const_u32(control_word.srcs[0]), Some(0x8000_0000));
        // control word, triangles, isolines, quads outer + inner, two TES levels, VAR0, PATCH0
        assert_eq!(buffer_store_bases(&shader), vec![0, 4, 4, 4, 20, 0, 0, 0, 0]);
        // No merged LS-HS wave before GFX9.
        assert_eq!(shader.count_intrinsics(Intrinsic::IsSubgroupInvocationLtAmd), 0);
        nir::validate(&shader).unwrap();
    }

    #[test]
    fn gfx10_wraps_the_tcs_in_the_hs_thread_check() {
        let mut shader = tcs(4);
        lower(&mut shader, GfxLevel::Gfx10_3, &all_in_vgprs());

        assert_eq!(buffer_store_bases(&shader), vec![0, 0, 0, 16, 0, 0, 0, 0]);
        // The wrap, the aligned vertex threads and the HS threads.
        let checks = shader.find_intrinsics(Intrinsic::IsSubgroupInvocationLtAmd);
        assert_eq!(checks.len(), 3);
        assert_eq!(shader.intrinsic(checks[0]).unwrap().idx.base, 8);
        assert_eq!(shader.instrs_in_order()[0], shader.parent_instr(shader.intrinsic(checks[0]).unwrap().srcs[0]));
        nir::validate(&shader).unwrap();
    }

    #[test]
    fn lds_outputs_are_gathered_from_lds() {
        let mut shader = tcs(4);
        let io_info = TessIoInfo {
            vram_output_mask: varying::bit(VAR0),
            lds_output_mask: varying::bit(VAR0),
            vgpr_output_mask: varying::bit(TESS_LEVEL_OUTER) | varying::bit(TESS_LEVEL_INNER),
            ..Default::default()
        };
        lower(&mut shader, GfxLevel::Gfx10_3, &io_info);

        // Two stored channels of VAR0 read back; the tess levels aren't in LDS.
        assert_eq!(shader.count_intrinsics(Intrinsic::LoadShared), 2);
        nir::validate(&shader).unwrap();
    }

    #[test]
    fn single_vertex_patches_store_patch_outputs_from_vertex_threads() {
        let mut shader = tcs(1);
        lower(&mut shader, GfxLevel::Gfx10_3, &all_in_vgprs());
        // Only the wrap and the aligned vertex threads; no per-patch thread check.
        assert_eq!(shader.count_intrinsics(Intrinsic::IsSubgroupInvocationLtAmd), 2);
        nir::validate(&shader).unwrap();
    }
}
