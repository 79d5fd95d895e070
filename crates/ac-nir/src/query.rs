//! Pipeline statistics and primitives-generated accounting for geometry shaders.

use nir::{Builder, Def, Intrinsic, ReduceOp};
use tracing::debug;

use crate::prerast::BitIter;

/// Queries a GS may have to feed. Whether each one is active is only known at draw time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GsQueries {
    pub primitives_generated: bool,
    pub gs_invocations: bool,
    pub gs_primitives: bool,
}

impl GsQueries {
    fn pipeline_stats(&self) -> bool {
        self.gs_invocations || self.gs_primitives
    }
}

/// Adds this wave's invocations and emitted primitives to the enabled query counters.
///
/// `vertex_count` and `primitive_count` hold the per-invocation totals of every active stream.
/// Emitted strips become `vertices - primitives * (vertices_per_primitive - 1)` list
/// primitives. Returns false when no query can be enabled.
pub fn gs_shader_query(
    b: &mut Builder,
    queries: GsQueries,
    vertices_per_primitive: u32,
    wave_size: u32,
    vertex_count: &[Option<Def>; 4],
    primitive_count: &[Option<Def>; 4],
) -> bool {
    let prim_gen_enabled = queries
        .primitives_generated
        .then(|| b.load_sysval(Intrinsic::LoadPrimGenQueryEnabledAmd));
    let pipeline_enabled = queries
        .pipeline_stats()
        .then(|| b.load_sysval(Intrinsic::LoadPipelineStatQueryEnabledAmd));

    let any_enabled = match (prim_gen_enabled, pipeline_enabled) {
        (Some(a), Some(p)) => b.ior(a, p),
        (Some(x), None) | (None, Some(x)) => x,
        (None, None) => return false,
    };

    let if_query = b.push_if(any_enabled);

    let always = b.imm_true();
    let active_mask = b.intrinsic(Intrinsic::Ballot).src(always).def(1, wave_size as u8);
    let num_active_threads = b.bit_count(active_mask);

    let mut prims_in_wave: [Option<Def>; 4] = [None; 4];
    let active_streams = b.shader.info.gs.active_stream_mask as u64;
    for i in BitIter(active_streams) {
        let i = i as usize;
        let (Some(vtx), Some(prm)) = (vertex_count[i], primitive_count[i]) else {
            panic!("stream {i} is active but has no vertex/primitive count");
        };

        match (b.shader.const_u32(vtx), b.shader.const_u32(prm)) {
            (Some(vtx), Some(prm)) => {
                let total = vtx.wrapping_sub(prm.wrapping_mul(vertices_per_primitive - 1));
                if total == 0 {
                    continue;
                }
                prims_in_wave[i] = Some(b.imul_imm(num_active_threads, total as u64));
            }
            _ => {
                let mut prims = prm;
                if vertices_per_primitive > 1 {
                    let neg = (vertices_per_primitive - 1).wrapping_neg();
                    let scaled = b.imul_imm(prm, neg as u64);
                    prims = b.iadd(scaled, vtx);
                }
                prims_in_wave[i] = Some(
                    b.intrinsic(Intrinsic::Reduce)
                        .src(prims)
                        .reduction_op(ReduceOp::Iadd)
                        .def(1, 32),
                );
            }
        }
    }

    let first_lane = b.load_sysval(Intrinsic::Elect);
    let if_first_lane = b.push_if(first_lane);

    if let Some(pipeline_enabled) = pipeline_enabled {
        let if_pipeline = b.push_if(pipeline_enabled);
        let count = prims_in_wave
            .iter()
            .flatten()
            .copied()
            .reduce(|acc, n| b.iadd(acc, n));
        if let (true, Some(count)) = (queries.gs_primitives, count) {
            b.intrinsic(Intrinsic::AtomicAddGsEmitPrimCountAmd).src(count).emit();
        }
        if queries.gs_invocations {
            b.intrinsic(Intrinsic::AtomicAddShaderInvocationCountAmd)
                .src(num_active_threads)
                .emit();
        }
        b.pop_if(if_pipeline);
    }

    if let Some(prim_gen_enabled) = prim_gen_enabled {
        let if_prim_gen = b.push_if(prim_gen_enabled);
        for (i, count) in prims_in_wave.iter().enumerate() {
            if let Some(count) = *count {
                b.intrinsic(Intrinsic::AtomicAddGenPrimCountAmd)
                    .src(count)
                    .stream_id(i as u32)
                    .emit();
            }
        }
        b.pop_if(if_prim_gen);
    }

    b.pop_if(if_first_lane);
    b.pop_if(if_query);

    debug!(?queries, vertices_per_primitive, "emitted GS query accounting");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use nir::{Shader, Stage};
    use pretty_assertions::assert_eq;

    fn gs(active_stream_mask: u8) -> Shader {
        let mut shader = Shader::new(Stage::Geometry, "query");
        shader.info.gs.active_stream_mask = active_stream_mask;
        shader
    }

    #[test]
    fn no_query_emits_nothing() {
        let mut shader = gs(0b1);
        let mut b = Builder::at_end(&mut shader);
        let counts = [None; 4];
        assert!(!gs_shader_query(&mut b, GsQueries::default(), 3, 64, &counts, &counts));
        assert!(shader.instrs_in_order().is_empty());
    }

    #[test]
    fn constant_strip_counts_scale_the_active_lanes() {
        let mut shader = gs(0b11);
        let mut b = Builder::at_end(&mut shader);
        // Stream 0: 6 vertices in 2 triangle strips = 2 triangles. Stream 1: 2 vertices, 1 strip.
        let vtx = [Some(b.imm_u32(6)), Some(b.imm_u32(2)), None, None];
        let prm = [Some(b.imm_u32(2)), Some(b.imm_u32(1)), None, None];
        let queries = GsQueries {
            primitives_generated: true,
            gs_invocations: true,
            gs_primitives: true,
        };
        assert!(gs_shader_query(&mut b, queries, 3, 64, &vtx, &prm));

        // The second stream produces no primitive and gets no counter update.
        let gen = shader.find_intrinsics(Intrinsic::AtomicAddGenPrimCountAmd);
        assert_eq!(gen.len(), 1);
        assert_eq!(shader.intrinsic(gen[0]).unwrap().idx.stream_id, 0);
        assert_eq!(shader.count_intrinsics(Intrinsic::AtomicAddGsEmitPrimCountAmd), 1);
        assert_eq!(shader.count_intrinsics(Intrinsic::AtomicAddShaderInvocationCountAmd), 1);
        assert_eq!(shader.count_intrinsics(Intrinsic::Reduce), 0);
    }

    #[test]
    fn dynamic_counts_are_reduced_across_the_wave() {
        let mut shader = gs(0b1);
        let mut b = Builder::at_end(&mut shader);
        let vtx = b.load_sysval(Intrinsic::LoadPrimitiveId);
        let prm = b.load_sysval(Intrinsic::LoadInvocationId);
        let queries = GsQueries {
            primitives_generated: true,
            ..Default::default()
        };
        assert!(gs_shader_query(&mut b, queries, 2, 32, &[Some(vtx), None, None, None], &[Some(prm), None, None, None]));
        assert_eq!(shader.count_intrinsics(Intrinsic::Reduce), 1);
        assert_eq!(shader.count_intrinsics(Intrinsic::LoadPipelineStatQueryEnabledAmd), 0);
        let ballot = shader.find_intrinsics(Intrinsic::Ballot)[0];
        let mask = shader.instr(ballot).def().unwrap();
        assert_eq!(shader.bit_size(mask), 32);
    }
}
