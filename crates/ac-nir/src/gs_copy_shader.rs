//! The GS copy shader: a vertex shader that reads the legacy GS output back from the GSVS ring
//! and does the exports and streamout the GS can't do itself.

use nir::varying::VAR0_16BIT;
use nir::{Access, Builder, Intrinsic, Shader, Stage};
use tracing::debug;

use crate::error::ConfigError;
use crate::hw::streamout_config;
use crate::legacy_vs::{export_vertex, LegacyVsOptions};
use crate::prerast::{clamp_vertex_color_outputs, gs_output_component_mask_with_stream, BitIter, PrerastOut, NUM_16BIT_SLOTS, NUM_SLOTS};
use crate::streamout::{emit_legacy_streamout, sorted_xfb_info};

/// Ring bytes between two output components: one dword of each of the `vertices_out`
/// vertices for all 64 lanes, divided by the 4-lane swizzle of the GS stores.
fn component_stride(vertices_out: u32) -> u32 {
    vertices_out * 16 * 4
}

/// Builds the copy shader of a GS lowered by [`lower_legacy_gs`](crate::legacy_gs::lower_legacy_gs).
///
/// `gs_out` is the GS output table; only its usage information is read. Streams other than 0
/// are only read for streamout, selected by the stream ID of `streamout_config`.
pub fn create_gs_copy_shader(
    gs: &Shader,
    options: &LegacyVsOptions<'_>,
    gs_out: &PrerastOut,
) -> Result<Shader, ConfigError> {
    assert_eq!(gs.stage(), Stage::Geometry, "the copy shader copies geometry shader outputs");
    let gfx_level = options.validate(&gs.info)?;

    let mut shader = Shader::new(Stage::Vertex, format!("{}_gs_copy", gs.name));
    shader.info.outputs_written = gs.info.outputs_written;
    shader.info.outputs_written_16bit = gs.info.outputs_written_16bit;
    shader.info.clip_distance_array_size = gs.info.clip_distance_array_size;
    shader.info.cull_distance_array_size = gs.info.cull_distance_array_size;
    shader.xfb_info = gs.xfb_info.clone();

    let xfb = gs
        .xfb_info
        .as_ref()
        .filter(|_| !options.disable_streamout)
        .map(sorted_xfb_info);
    let stride = component_stride(gs.info.gs.vertices_out as u32);

    let mut b = Builder::at_end(&mut shader);
    let ring = b.load_sysval(Intrinsic::LoadRingGsvsAmd);
    let stream_id = xfb.as_ref().map(|_| {
        let config = b.load_sysval(Intrinsic::LoadStreamoutConfigAmd);
        let (offset, bits) = streamout_config::STREAM_ID;
        b.ubfe_imm(config, offset, bits)
    });
    let vertex_id = b.load_sysval(Intrinsic::LoadVertexIdZeroBase);
    let vtx_offset = b.imul_imm(vertex_id, 4);
    let zero = b.imm_zero(1, 32);

    let mut loads = 0u32;
    for stream in 0..4u32 {
        let streams_written = xfb.as_ref().map_or(0, |x| x.streams_written as u32);
        if stream > 0 && streams_written & (1 << stream) == 0 {
            continue;
        }

        let nif = stream_id.map(|id| {
            let cond = b.ieq_imm(id, stream as u64);
            b.push_if(cond)
        });

        let mut out = gs_out.clone();
        out.outputs = [[None; 4]; NUM_SLOTS];
        out.outputs_16bit_lo = [[None; 4]; NUM_16BIT_SLOTS];
        out.outputs_16bit_hi = [[None; 4]; NUM_16BIT_SLOTS];

        let mut offset = 0u32;
        let mut load = |b: &mut Builder| {
            let value = b
                .intrinsic(Intrinsic::LoadBufferAmd)
                .srcs(&[ring, vtx_offset, zero, zero])
                .base(offset as i32)
                .access(Access::COHERENT | Access::NON_TEMPORAL)
                .def(1, 32);
            offset += stride;
            loads += 1;
            value
        };

        for slot in BitIter(b.shader.info.outputs_written) {
            let s = slot as usize;
            let mask = gs_output_component_mask_with_stream(&gs_out.infos[s], stream);
            for c in BitIter(mask as u64) {
                let value = if gs_out.is_const_output(slot, c) {
                    b.imm_u32(gs_out.get_const_output(slot, c))
                } else {
                    load(&mut b)
                };
                out.outputs[s][c as usize] = Some(value);
            }
        }

        for i in BitIter(b.shader.info.outputs_written_16bit as u64) {
            let index = i as usize;
            let slot = VAR0_16BIT + i;
            let mask_lo = gs_output_component_mask_with_stream(&gs_out.infos_16bit_lo[index], stream);
            let mask_hi = gs_output_component_mask_with_stream(&gs_out.infos_16bit_hi[index], stream);
            for c in BitIter((mask_lo | mask_hi) as u64) {
                let data = if gs_out.is_const_output(slot, c) {
                    b.imm_u32(gs_out.get_const_output(slot, c))
                } else {
                    load(&mut b)
                };
                let bit = 1u8 << c;
                if mask_lo & bit != 0 {
                    out.outputs_16bit_lo[index][c as usize] = Some(b.unpack_32_2x16_split_x(data));
                }
                if mask_hi & bit != 0 {
                    out.outputs_16bit_hi[index][c as usize] = Some(b.unpack_32_2x16_split_y(data));
                }
            }
        }

        if let Some(xfb) = &xfb {
            emit_legacy_streamout(&mut b, stream, xfb, &out);
        }

        // After streamout, before the exports.
        clamp_vertex_color_outputs(&mut b, &mut out);

        if stream == 0 {
            export_vertex(&mut b, options, gfx_level, &out);
        }

        if let Some(nif) = nif {
            b.pop_if(nif);
        }
    }

    debug!(
        gs = %gs.name,
        %gfx_level,
        streamout = xfb.is_some(),
        ring_stride = stride,
        loads,
        "created GS copy shader"
    );
    Ok(shader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::GfxLevel;
    use crate::hw::{EXP_PARAM_UNDEFINED, SQ_EXP_PARAM, SQ_EXP_POS};
    use nir::varying::{self, COL0, POS, VAR0};
    use crate::prerast::gather_store_output;
    use nir::{AluType, Def, InstrId, IoSemantics, XfbBuffer, XfbInfo, XfbOutput};
    use pretty_assertions::assert_eq;

    fn gs(outputs_written: u64, vertices_out: u16) -> Shader {
        let mut shader = Shader::new(Stage::Geometry, "gs");
        shader.info.outputs_written = outputs_written;
        shader.info.gs.vertices_out = vertices_out;
        shader.info.gs.active_stream_mask = 0b1;
        shader
    }

    /// Records a store of `value` to `location` in `out` without keeping the store.
    fn gather(shader: &mut Shader, out: &mut PrerastOut, location: u32, value: impl Fn(&mut Builder) -> Def, gs_streams: u8) {
        let mut b = Builder::at_end(shader);
        let value = value(&mut b);
        let offset = b.imm_u32(0);
        let nc = b.num_components(value);
        let store: InstrId = b
            .intrinsic(Intrinsic::StoreOutput)
            .src(value)
            .src(offset)
            .write_mask((1u32 << nc) - 1)
            .src_type(AluType::FLOAT32)
            .io(IoSemantics {
                location,
                num_slots: 1,
                gs_streams,
                ..Default::default()
            })
            .emit();
        gather_store_output(&mut b, out, store, false);
        b.remove(store);
    }

    fn load_bases(shader: &Shader) -> Vec<i32> {
        shader
            .find_intrinsics(Intrinsic::LoadBufferAmd)
            .into_iter()
            .map(|id| shader.intrinsic(id).unwrap().idx.base)
            .collect()
    }

    #[test]
    fn ring_components_are_read_per_vertex() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut gs = gs(varying::bit(POS) | varying::bit(VAR0), 3);
        let mut out = PrerastOut::new();
        gather(&mut gs, &mut out, POS, |b| {
            let id = b.load_sysval(Intrinsic::LoadInvocationId);
            b.vec(&[id, id, id, id])
        }, 0);
        gather(&mut gs, &mut out, VAR0, |b| b.imm_float(0.5), 0);

        let mut offsets = vec![EXP_PARAM_UNDEFINED; 64];
        offsets[VAR0 as usize] = 0;
        let options = LegacyVsOptions {
            gfx_level: Some(GfxLevel::Gfx8),
            param_offsets: &offsets,
            has_param_exports: true,
            ..Default::default()
        };
        let copy = create_gs_copy_shader(&gs, &options, &out).unwrap();

        assert_eq!(copy.stage(), Stage::Vertex);
        assert_eq!(copy.name, "gs_gs_copy");
        // Four position components; the constant VAR0 doesn't occupy the ring.
        let stride = 3 * 16 * 4;
        assert_eq!(load_bases(&copy), vec![0, stride, 2 * stride, 3 * stride]);
        let load = copy.intrinsic(copy.find_intrinsics(Intrinsic::LoadBufferAmd)[0]).unwrap();
        let vertex_offset = nir::eval_u32(&copy, load.srcs[1], &|intr: &nir::IntrinsicInstr| {
            (intr.op == Intrinsic::LoadVertexIdZeroBase).then(|| vec![5])
        });
        assert_eq!(vertex_offset, Some(20));

        let exports: Vec<i32> = copy
            .find_intrinsics(Intrinsic::ExportAmd)
            .into_iter()
            .map(|id| copy.intrinsic(id).unwrap().idx.base)
            .collect();
        assert_eq!(exports, vec![SQ_EXP_POS as i32, SQ_EXP_PARAM as i32]);
        nir::validate(&copy).unwrap();
    }

    #[test]
    fn streamout_selects_the_stream_at_runtime() {
        let mut gs = gs(varying::bit(VAR0) | varying::bit(COL0), 1);
        gs.info.gs.active_stream_mask = 0b11;
        gs.xfb_info = Some(XfbInfo {
            buffers_written: 0b11,
            streams_written: 0b11,
            buffers: [XfbBuffer { stride: 4 }; 4],
            buffer_to_stream: [0, 1, 0, 0],
            outputs: vec![
                XfbOutput {
                    buffer: 0,
                    offset: 0,
                    location: VAR0 as u8,
                    high_16bits: false,
                    component_mask: 0b1,
                    component_offset: 0,
                },
                XfbOutput {
                    buffer: 1,
                    offset: 0,
                    location: VAR0 as u8,
                    high_16bits: false,
                    component_mask: 0b10,
                    component_offset: 1,
                },
            ],
        });
        let mut out = PrerastOut::new();
        // VAR0.x on stream 0, VAR0.y on stream 1.
        gather(&mut gs, &mut out, VAR0, |b| {
            let id = b.load_sysval(Intrinsic::LoadInvocationId);
            b.vec2(id, id)
        }, 0b01_00);
        gather(&mut gs, &mut out, COL0, |b| {
            let id = b.load_sysval(Intrinsic::LoadInvocationId);
            b.vec(&[id, id, id, id])
        }, 0);

        let options = LegacyVsOptions {
            gfx_level: Some(GfxLevel::Gfx7),
            ..Default::default()
        };
        let copy = create_gs_copy_shader(&gs, &options, &out).unwrap();

        // One read for the stream ID, one per streamout block.
        assert_eq!(copy.count_intrinsics(Intrinsic::LoadStreamoutConfigAmd), 3);
        // Stream 0 reads COL0 and VAR0.x, stream 1 reads VAR0.y; both restart at offset 0.
        assert_eq!(load_bases(&copy), vec![0, 64, 128, 192, 256, 0]);
        assert_eq!(copy.count_intrinsics(Intrinsic::StoreBufferAmd), 2);
        // Colours are clamped on both streams; only stream 0 exports.
        assert_eq!(copy.count_intrinsics(Intrinsic::LoadClampVertexColorAmd), 2);
        assert_eq!(copy.count_intrinsics(Intrinsic::ExportAmd), 1);
        nir::validate(&copy).unwrap();
    }
}
