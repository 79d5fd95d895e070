//! Legacy (non-NGG) geometry shader lowering.
//!
//! A legacy GS can't export: every emitted vertex is written to the GSVS ring and a message
//! tells the fixed-function hardware about it. The ring is read back by the GS copy shader,
//! which runs as a VS and does the exports.
//!
//! Ring layout of one stream, per GS invocation: the non-constant output components of the
//! stream in slot order, each one a block of `vertices_out` dwords indexed by the vertex
//! counter. Components the GS hasn't written before an emit keep their block.

use nir::varying::VAR0_16BIT;
use nir::{
    Access, Builder, Def, InstrId, Intrinsic, MemoryModes, MemorySemantics, Scope, Shader, Stage,
};
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::gs_copy_shader::create_gs_copy_shader;
use crate::hw::{SENDMSG_GS, SENDMSG_GS_DONE, SENDMSG_GS_OP_CUT, SENDMSG_GS_OP_EMIT, SENDMSG_GS_OP_NOP};
use crate::legacy_vs::LegacyVsOptions;
use crate::prerast::{gather_store_output, gs_output_component_mask_with_stream, BitIter, PrerastOut};
use crate::query::{gs_shader_query, GsQueries};

/// Wave size of a legacy GS.
const LEGACY_GS_WAVE_SIZE: u32 = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyGsOptions<'a> {
    pub has_gen_prim_query: bool,
    pub has_pipeline_stats_query: bool,
    /// Exports of the GS copy shader.
    pub copy_shader: LegacyVsOptions<'a>,
}

impl LegacyGsOptions<'_> {
    pub fn validate(&self, shader: &Shader) -> Result<(), ConfigError> {
        if self.copy_shader.export_primitive_id {
            return Err(ConfigError::Invalid(
                "a GS writes its own primitive ID output, the copy shader can't add one",
            ));
        }
        self.copy_shader.validate(&shader.info).map(|_| ())
    }
}

struct LegacyGsState {
    out: PrerastOut,
    vertex_count: [Option<Def>; 4],
    primitive_count: [Option<Def>; 4],
    ring_stores: u32,
}

fn sendmsg_gs(b: &mut Builder, message: u32) {
    let wave_id = b.load_sysval(Intrinsic::LoadGsWaveIdAmd);
    b.intrinsic(Intrinsic::SendmsgAmd)
        .src(wave_id)
        .base(message as i32)
        .emit();
}

/// Stores one dword of the current vertex to the GSVS ring.
///
/// `block` is the component's byte offset inside one vertex; each component owns
/// `vertices_out` consecutive dwords of the ring.
fn store_ring_dword(b: &mut Builder, value: Def, ring: Def, vertex: Def, soffset: Def, block: u32) {
    let vertices_out = b.shader.info.gs.vertices_out as u32;
    let base = block * vertices_out;
    let (align_mul, align_offset) = match b.shader.const_u32(vertex) {
        Some(v) => (16, (base + v * 4) % 16),
        None => (4, 0),
    };
    let voffset = b.ishl_imm(vertex, 2);
    let zero = b.imm_int(0);
    b.intrinsic(Intrinsic::StoreBufferAmd)
        .srcs(&[value, ring, voffset, soffset, zero])
        .base(base as i32)
        .access(Access::COHERENT | Access::NON_TEMPORAL | Access::IS_SWIZZLED)
        // Orders the store with the emit message.
        .modes(MemoryModes::SHADER_OUT)
        .align(align_mul, align_offset)
        .emit();
}

fn lower_emit_vertex(b: &mut Builder, id: InstrId, s: &mut LegacyGsState) {
    let Some(intr) = b.shader.intrinsic(id) else {
        unreachable!("emit_vertex_with_counter is an intrinsic");
    };
    let stream = intr.idx.stream_id;
    let vertex = intr.srcs[0];

    let ring = b.intrinsic(Intrinsic::LoadRingGsvsAmd).stream_id(stream).sysval();
    let soffset = b.load_sysval(Intrinsic::LoadRingGs2vsOffsetAmd);
    let mut block = 0u32;

    for slot in BitIter(b.shader.info.outputs_written) {
        let mask = gs_output_component_mask_with_stream(&s.out.infos[slot as usize], stream);
        for c in BitIter(mask as u64) {
            if s.out.is_const_output(slot, c) {
                continue;
            }
            if let Some(value) = s.out.outputs[slot as usize][c as usize] {
                let value = b.u2u32(value);
                store_ring_dword(b, value, ring, vertex, soffset, block);
                s.ring_stores += 1;
            }
            block += 4;
        }
        // Outputs are undefined after an emit.
        s.out.clear_values(slot);
    }

    for i in BitIter(b.shader.info.outputs_written_16bit as u64) {
        let slot = VAR0_16BIT + i;
        let index = i as usize;
        let mask = gs_output_component_mask_with_stream(&s.out.infos_16bit_lo[index], stream)
            | gs_output_component_mask_with_stream(&s.out.infos_16bit_hi[index], stream);
        for c in BitIter(mask as u64) {
            if s.out.is_const_output(slot, c) {
                continue;
            }
            let lo = s.out.outputs_16bit_lo[index][c as usize];
            let hi = s.out.outputs_16bit_hi[index][c as usize];
            if lo.is_some() || hi.is_some() {
                let undef = b.undef(1, 16);
                let value = b.pack_32_2x16_split(lo.unwrap_or(undef), hi.unwrap_or(undef));
                store_ring_dword(b, value, ring, vertex, soffset, block);
                s.ring_stores += 1;
            }
            block += 4;
        }
        s.out.clear_values(slot);
    }

    trace!(stream, dwords = block / 4, "GS vertex emitted");
    sendmsg_gs(b, SENDMSG_GS_OP_EMIT | SENDMSG_GS | (stream << 8));
    b.remove(id);
}

fn lower_legacy_gs_intrinsic(b: &mut Builder, id: InstrId, s: &mut LegacyGsState) -> bool {
    let Some(intr) = b.shader.intrinsic(id) else {
        return false;
    };
    let stream = intr.idx.stream_id;
    match intr.op {
        Intrinsic::StoreOutput => {
            gather_store_output(b, &mut s.out, id, true);
            b.remove(id);
        }
        Intrinsic::EmitVertexWithCounter => lower_emit_vertex(b, id, s),
        Intrinsic::EndPrimitiveWithCounter => {
            sendmsg_gs(b, SENDMSG_GS_OP_CUT | SENDMSG_GS | (stream << 8));
            b.remove(id);
        }
        Intrinsic::SetVertexAndPrimitiveCount => {
            s.vertex_count[stream as usize] = Some(intr.srcs[0]);
            s.primitive_count[stream as usize] = Some(intr.srcs[1]);
            b.remove(id);
        }
        _ => return false,
    }
    true
}

/// Lowers a GS to GSVS ring stores and GS messages, and builds the copy shader that exports
/// the ring contents.
///
/// The GS must already use the counter forms of emit/end primitive, with
/// `set_vertex_and_primitive_count` at the end when queries are enabled.
pub fn lower_legacy_gs(shader: &mut Shader, options: &LegacyGsOptions<'_>) -> Result<Shader, ConfigError> {
    assert_eq!(shader.stage(), Stage::Geometry, "legacy GS lowering needs a geometry shader");
    options.validate(shader)?;

    let mut s = LegacyGsState {
        out: PrerastOut::new(),
        vertex_count: [None; 4],
        primitive_count: [None; 4],
        ring_stores: 0,
    };

    // Usage of every output over the whole shader, needed before the first emit.
    nir::intrinsics_pass(shader, |b, id| {
        if b.shader.intrinsic(id).is_some_and(|i| i.op == Intrinsic::StoreOutput) {
            gather_store_output(b, &mut s.out, id, false);
        }
        false
    });
    s.out.compute_packed_output_info(None);

    let vertices_per_primitive = shader.info.gs.output_primitive.output_vertices_per_primitive();
    nir::intrinsics_pass(shader, |b, id| lower_legacy_gs_intrinsic(b, id, &mut s));

    let mut b = Builder::at_end(shader);
    let queries = GsQueries {
        primitives_generated: options.has_gen_prim_query,
        gs_invocations: options.has_pipeline_stats_query,
        gs_primitives: options.has_pipeline_stats_query,
    };
    let query = gs_shader_query(
        &mut b,
        queries,
        vertices_per_primitive,
        LEGACY_GS_WAVE_SIZE,
        &s.vertex_count,
        &s.primitive_count,
    );

    // Ring stores must land before the GS_DONE message.
    b.barrier(
        Scope::Invocation,
        Scope::Device,
        MemorySemantics::RELEASE,
        MemoryModes::SHADER_OUT | MemoryModes::SSBO | MemoryModes::GLOBAL | MemoryModes::IMAGE,
    );
    sendmsg_gs(&mut b, SENDMSG_GS_OP_NOP | SENDMSG_GS_DONE);

    debug!(
        outputs_written = format_args!("{:#x}", shader.info.outputs_written),
        active_streams = format_args!("{:#b}", shader.info.gs.active_stream_mask),
        packed_gs_out_size = s.out.total_packed_gs_out_size,
        ring_stores = s.ring_stores,
        query,
        "lowered legacy GS"
    );

    create_gs_copy_shader(shader, &options.copy_shader, &s.out)
}
