//! Transform feedback for the legacy (non-NGG) vertex pipeline.

use nir::varying::VAR0_16BIT;
use nir::{Access, AluType, BaseType, Builder, Def, Intrinsic, XfbInfo};
use tracing::trace;

use crate::hw::streamout_config;
use crate::prerast::{BitIter, PrerastOut};

/// Transform feedback outputs ordered by buffer, then offset.
///
/// In this order the outputs of one vertex can be coalesced into vec4 stores in one walk.
pub fn sorted_xfb_info(info: &XfbInfo) -> XfbInfo {
    let mut sorted = info.clone();
    sorted.outputs.sort_by_key(|o| (o.buffer, o.offset));
    for pair in sorted.outputs.windows(2) {
        assert!(
            (pair[0].buffer, pair[0].offset) != (pair[1].buffer, pair[1].offset),
            "two outputs share offset {} of buffer {}",
            pair[0].offset,
            pair[0].buffer
        );
    }
    sorted
}

fn output_and_types(out: &PrerastOut, slot: u32, high_16bits: bool) -> ([Option<Def>; 4], Option<[AluType; 4]>) {
    if slot < VAR0_16BIT {
        return (out.outputs[slot as usize], None);
    }
    let i = (slot - VAR0_16BIT) as usize;
    if high_16bits {
        (out.outputs_16bit_hi[i], Some(out.types_16bit_hi[i]))
    } else {
        (out.outputs_16bit_lo[i], Some(out.types_16bit_lo[i]))
    }
}

fn widen_to_32bit(b: &mut Builder, data: Def, ty: AluType) -> Def {
    match ty.base {
        BaseType::Float => b.f2f(data, 32),
        BaseType::Int => b.i2i(data, 32),
        _ => b.u2u(data, 32),
    }
}

/// Writes the outputs of `stream` to the streamout buffers.
///
/// `info` must come from [`sorted_xfb_info`]. Lanes below the vertex count in
/// `streamout_config` store; contiguous components of one buffer are merged into stores of up
/// to four dwords.
pub fn emit_legacy_streamout(b: &mut Builder, stream: u32, info: &XfbInfo, out: &PrerastOut) {
    let config = b.load_sysval(Intrinsic::LoadStreamoutConfigAmd);
    let (offset, bits) = streamout_config::VERTEX_COUNT;
    let so_vtx_count = b.ubfe_imm(config, offset, bits);
    let tid = b.load_sysval(Intrinsic::LoadSubgroupInvocation);

    let active = b.ilt(tid, so_vtx_count);
    let nif = b.push_if(active);
    let write_index = b.load_sysval(Intrinsic::LoadStreamoutWriteIndexAmd);

    let mut buffers: [Option<(Def, Def)>; 4] = [None; 4];
    for i in BitIter(info.buffers_written as u64) {
        let buffer = b.intrinsic(Intrinsic::LoadStreamoutBufferAmd).base(i as i32).sysval();
        let stride = info.buffers[i as usize].stride as u64;
        let buffer_offset = b.intrinsic(Intrinsic::LoadStreamoutOffsetAmd).base(i as i32).sysval();
        let index = b.iadd(write_index, tid);
        let vertex_offset = b.imul_imm(index, stride);
        let buffer_offset = b.imul_imm(buffer_offset, 4);
        let offset = b.iadd(vertex_offset, buffer_offset);
        buffers[i as usize] = Some((buffer, offset));
    }

    let zero = b.imm_int(0);
    let mut values: Vec<Def> = Vec::with_capacity(4);
    let mut store_offset = 0u32;
    let mut store_buffer = 0usize;

    let flush = |b: &mut Builder, values: &mut Vec<Def>, buffer: usize, base: u32| {
        let Some((rsrc, offset)) = buffers[buffer] else {
            panic!("transform feedback buffer {buffer} is not in buffers_written");
        };
        let value = b.vec(values);
        b.intrinsic(Intrinsic::StoreBufferAmd)
            .srcs(&[value, rsrc, offset, zero, zero])
            .base(base as i32)
            .access(Access::NON_TEMPORAL)
            .emit();
        values.clear();
    };

    for output in &info.outputs {
        if info.buffer_to_stream[output.buffer as usize] as u32 != stream {
            continue;
        }
        let (data, types) = output_and_types(out, output.location as u32, output.high_16bits);

        for comp in BitIter(output.component_mask as u64) {
            let Some(mut value) = data[comp as usize] else {
                trace!(location = output.location, comp, "unwritten streamout component");
                continue;
            };
            if b.bit_size(value) < 32 {
                let Some(types) = types else {
                    panic!("sub-dword streamout from 32-bit slot {}", output.location);
                };
                value = widen_to_32bit(b, value, types[comp as usize]);
            }

            assert!(comp >= output.component_offset as u32, "streamout component below its offset");
            let store_comp_offset = output.offset as u32 + (comp - output.component_offset as u32) * 4;
            let has_hole = store_offset + values.len() as u32 * 4 != store_comp_offset;

            if !values.is_empty()
                && (values.len() == 4 || store_buffer != output.buffer as usize || has_hole)
            {
                flush(b, &mut values, store_buffer, store_offset);
            }
            if values.is_empty() {
                store_buffer = output.buffer as usize;
                store_offset = store_comp_offset;
            }
            values.push(value);
        }
    }

    if !values.is_empty() {
        flush(b, &mut values, store_buffer, store_offset);
    }

    b.pop_if(nif);
}

#[cfg(test)]
mod tests {
    use super::*;
    use nir::varying::VAR0;
    use nir::{Shader, Stage, XfbBuffer, XfbOutput};
    use pretty_assertions::assert_eq;

    fn xfb_output(buffer: u8, offset: u16, location: u32, component_mask: u8) -> XfbOutput {
        XfbOutput {
            buffer,
            offset,
            location: location as u8,
            high_16bits: false,
            component_mask,
            component_offset: component_mask.trailing_zeros() as u8,
        }
    }

    #[test]
    fn outputs_sort_by_buffer_then_offset() {
        let info = XfbInfo {
            outputs: vec![xfb_output(1, 0, VAR0, 1), xfb_output(0, 8, VAR0 + 1, 1), xfb_output(0, 0, VAR0 + 2, 1)],
            ..Default::default()
        };
        let sorted = sorted_xfb_info(&info);
        let order: Vec<(u8, u16)> = sorted.outputs.iter().map(|o| (o.buffer, o.offset)).collect();
        assert_eq!(order, vec![(0, 0), (0, 8), (1, 0)]);
    }

    #[test]
    fn contiguous_components_merge_into_vec4_stores() {
        let mut shader = Shader::new(Stage::Vertex, "xfb");
        let mut b = Builder::at_end(&mut shader);
        let mut out = PrerastOut::new();
        for c in 0..4 {
            out.outputs[VAR0 as usize][c] = Some(b.imm_float(c as f32));
            out.outputs[VAR0 as usize + 1][c] = Some(b.imm_float(10.0 + c as f32));
        }

        let info = XfbInfo {
            buffers_written: 0b1,
            streams_written: 0b1,
            buffers: [XfbBuffer { stride: 32 }; 4],
            buffer_to_stream: [0; 4],
            // Second output leaves a hole at byte 16.
            outputs: vec![xfb_output(0, 0, VAR0, 0b0111), xfb_output(0, 20, VAR0 + 1, 0b0011)],
        };
        emit_legacy_streamout(&mut b, 0, &sorted_xfb_info(&info), &out);

        let stores = shader.find_intrinsics(Intrinsic::StoreBufferAmd);
        let shapes: Vec<(i32, u8)> = stores
            .iter()
            .map(|&id| {
                let store = shader.intrinsic(id).unwrap();
                (store.idx.base, store.num_components)
            })
            .collect();
        assert_eq!(shapes, vec![(0, 3), (20, 2)]);
    }

    #[test]
    fn other_streams_are_skipped() {
        let mut shader = Shader::new(Stage::Vertex, "xfb");
        let mut b = Builder::at_end(&mut shader);
        let mut out = PrerastOut::new();
        out.outputs[VAR0 as usize][0] = Some(b.imm_float(1.0));
        let info = XfbInfo {
            buffers_written: 0b10,
            streams_written: 0b10,
            buffers: [XfbBuffer { stride: 4 }; 4],
            buffer_to_stream: [0, 1, 0, 0],
            outputs: vec![xfb_output(1, 0, VAR0, 0b1)],
        };
        emit_legacy_streamout(&mut b, 0, &info, &out);
        assert_eq!(shader.count_intrinsics(Intrinsic::StoreBufferAmd), 0);
    }
}
