//! TES inputs, read back from the off-chip ring the HS wrote.

use nir::{Access, Builder, InstrId, Intrinsic, Lowered, MemoryModes, Shader, Stage};
use tracing::debug;

use super::layout::VramLayout;
use crate::error::ConfigError;
use crate::io::{load_io, MapIoFn};

#[derive(Clone, Copy, Default)]
pub struct TesInputsOptions<'a> {
    /// Must be the callback the HS outputs were lowered with.
    pub map_io: MapIoFn<'a>,
}

fn lower_tes_input_load(b: &mut Builder, id: InstrId, layout: &VramLayout<'_>) -> Lowered {
    let Some(intr) = b.shader.intrinsic(id) else {
        return Lowered::Unchanged;
    };
    let per_vertex = intr.op == Intrinsic::LoadPerVertexInput;
    let io = intr.idx.io;
    let component = intr.idx.component as u32;
    let vertex_index = per_vertex.then(|| intr.srcs[0]);
    let Some(&io_offset) = intr.srcs.last() else {
        unreachable!("input load without an offset");
    };
    let Some(def) = intr.def else {
        unreachable!("input load without a destination");
    };
    let num_components = b.num_components(def);
    let bit_size = b.bit_size(def);

    let ring = b.load_sysval(Intrinsic::LoadRingTessOffchipAmd);
    let offchip_offset = b.load_sysval(Intrinsic::LoadRingTessOffchipOffsetAmd);
    let off = match vertex_index {
        Some(vertex_index) => layout.per_vertex_offset(b, io.location, component, vertex_index, io_offset, None),
        None => layout.per_patch_offset(b, io.location, component, io_offset, None),
    };
    let zero = b.imm_u32(0);

    let load = load_io(b, num_components, bit_size, io.high_16bits, |b, n, bits| {
        b.intrinsic(Intrinsic::LoadBufferAmd)
            .srcs(&[ring, off, offchip_offset, zero])
            .access(Access::COHERENT | Access::CAN_REORDER | Access::CAN_SPECULATE)
            .modes(MemoryModes::SHADER_IN)
            .def(n, bits)
    });
    Lowered::Replace(load)
}

fn is_input_load(shader: &Shader, id: InstrId) -> bool {
    shader
        .intrinsic(id)
        .is_some_and(|i| matches!(i.op, Intrinsic::LoadInput | Intrinsic::LoadPerVertexInput))
}

/// Lowers TES input loads to off-chip ring loads at the addresses the HS stored them to.
///
/// Without `map_io`, the ring layout is derived from what the TES reads, which is what
/// [`get_tess_io_info`](super::get_tess_io_info) assigns for a linked HS.
pub fn lower_tes_inputs_to_mem(shader: &mut Shader, options: &TesInputsOptions<'_>) -> Result<bool, ConfigError> {
    assert_eq!(shader.stage(), Stage::TessEval, "TES inputs belong to a tessellation evaluation shader");
    let layout = VramLayout {
        vram_output_mask: shader.info.inputs_read,
        vram_patch_output_mask: shader.info.patch_inputs_read,
        map_io: options.map_io,
    };
    let progress = nir::lower_instructions(shader, is_input_load, |b, id| lower_tes_input_load(b, id, &layout));
    debug!(
        inputs_read = format_args!("{:#x}", layout.vram_output_mask),
        patch_inputs_read = format_args!("{:#x}", layout.vram_patch_output_mask),
        progress,
        "lowered TES inputs"
    );
    Ok(progress)
}
