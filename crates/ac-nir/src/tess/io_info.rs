//! Where each TCS output lives: LDS, VGPRs (local variables), the off-chip ring, or several.

use nir::varying::{self, LAYER, PATCH0, PRIMITIVE_ID, PRIMITIVE_SHADING_RATE, TESS_LEVEL_OUTER, VIEWPORT};
use nir::{Shader, Stage, TcsInfo};
use tracing::debug;

use super::TESS_LVL_MASK;
use crate::io::MapIoFn;
use crate::prerast::BitIter;

/// Storage decisions for the outputs of one TCS, shared by the HS output lowering, the TES
/// input lowering and the workgroup sizing.
///
/// Per-vertex masks are indexed by varying slot and include the tess level slots; patch masks
/// are relative to `PATCH0`. Every written output is in the VGPR mask, the LDS mask, or both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TessIoInfo {
    /// Outputs written to the off-chip ring because the TES reads them.
    pub vram_output_mask: u64,
    pub vram_patch_output_mask: u32,
    /// Outputs read back through LDS.
    pub lds_output_mask: u64,
    pub lds_patch_output_mask: u32,
    /// Outputs whose value each invocation keeps in a local variable.
    pub vgpr_output_mask: u64,
    pub vgpr_patch_output_mask: u32,
    /// One past the highest ring attribute index used by a per-vertex output.
    pub highest_remapped_vram_output: u32,
    /// One past the highest ring attribute index used by a per-patch output.
    pub highest_remapped_vram_patch_output: u32,
}

impl TessIoInfo {
    /// LDS bytes of one output vertex.
    pub fn lds_output_vertex_size(&self) -> u32 {
        (self.lds_output_mask & !TESS_LVL_MASK).count_ones() * 16
    }

    pub fn lds_pervertex_output_patch_size(&self, tcs_vertices_out: u32) -> u32 {
        tcs_vertices_out * self.lds_output_vertex_size()
    }

    /// LDS bytes between the outputs of consecutive patches.
    ///
    /// The trailing dword reduces LDS bank conflicts.
    pub fn lds_output_patch_stride(&self, tcs_vertices_out: u32) -> u32 {
        let per_patch = ((self.lds_output_mask & TESS_LVL_MASK).count_ones() + self.lds_patch_output_mask.count_ones()) * 16;
        self.lds_pervertex_output_patch_size(tcs_vertices_out) + per_patch + 4
    }
}

/// Decides the storage of every TCS output.
///
/// `tes_inputs_read` and `tes_patch_inputs_read` come from the linked TES, or are all ones when
/// the TES is unknown. With `map_io` the ring indices are chosen by the driver; otherwise they are
/// the prefix sums of the ring masks. `remapped_outputs_include_tess_levels` counts the tess
/// levels as per-patch ring attributes.
pub fn get_tess_io_info(
    tcs: &Shader,
    tcs_info: &TcsInfo,
    tes_inputs_read: u64,
    tes_patch_inputs_read: u32,
    map_io: MapIoFn<'_>,
    remapped_outputs_include_tess_levels: bool,
) -> TessIoInfo {
    assert_eq!(tcs.stage(), Stage::TessCtrl, "tess I/O info needs a tessellation control shader");
    let info = &tcs.info;

    // These are never consumed by the TES.
    let vram_output_mask = info.tess.tcs_outputs_read_by_tes
        & tes_inputs_read
        & !(varying::bit(LAYER)
            | varying::bit(VIEWPORT)
            | varying::bit(PRIMITIVE_ID)
            | varying::bit(PRIMITIVE_SHADING_RATE));
    let vram_patch_output_mask = info.tess.tcs_patch_outputs_read_by_tes & tes_patch_inputs_read;

    // Tess level masks as varying slot masks.
    let tess_levels_defined_by_all_invoc = (tcs_info.tess_levels_defined_by_all_invoc as u64) << TESS_LEVEL_OUTER;
    let tess_levels_only_written_by_invoc0 = (tcs_info.tess_levels_only_written_by_invoc0 as u64) << TESS_LEVEL_OUTER;
    let tess_levels_only_read_by_invoc0 = (tcs_info.tess_levels_only_read_by_invoc0 as u64) << TESS_LEVEL_OUTER;

    // No LDS is needed without indirect indexing when the output is only written by invocation 0
    // and read by nobody else, or when every invocation defines it on every path.
    let tess_levels_written = info.outputs_written & TESS_LVL_MASK;
    let tess_levels_dont_need_lds = tess_levels_written
        & !info.outputs_read_indirectly
        & !info.outputs_written_indirectly
        & ((tess_levels_only_written_by_invoc0 & !info.outputs_read)
            | (tess_levels_only_written_by_invoc0 & tess_levels_only_read_by_invoc0)
            | tess_levels_defined_by_all_invoc);

    let patch_outputs_dont_need_lds = info.patch_outputs_written
        & !info.patch_outputs_read_indirectly
        & !info.patch_outputs_written_indirectly
        & ((tcs_info.patch_outputs_only_written_by_invoc0 & !info.patch_outputs_read)
            | (tcs_info.patch_outputs_only_written_by_invoc0 & tcs_info.patch_outputs_only_read_by_invoc0)
            | tcs_info.patch_outputs_defined_by_all_invoc);

    let cross_invocation = info.tess.tcs_cross_invocation_outputs_written;
    let lds_output_mask = (((info.outputs_read & info.outputs_written) | cross_invocation | info.outputs_written_indirectly)
        & !TESS_LVL_MASK)
        | (tess_levels_written & !tess_levels_dont_need_lds);
    let lds_patch_output_mask = info.patch_outputs_written & !patch_outputs_dont_need_lds;

    let vgpr_output_mask = (info.outputs_written & !(cross_invocation | info.outputs_written_indirectly) & !TESS_LVL_MASK)
        | (tess_levels_written & (tess_levels_defined_by_all_invoc | tess_levels_only_written_by_invoc0));
    let vgpr_patch_output_mask = info.patch_outputs_written
        & !info.patch_outputs_written_indirectly
        & (tcs_info.patch_outputs_defined_by_all_invoc | tcs_info.patch_outputs_only_written_by_invoc0);

    assert_eq!(
        info.outputs_written,
        vgpr_output_mask | lds_output_mask,
        "every TCS output must live in VGPRs or LDS"
    );
    assert_eq!(
        info.patch_outputs_written,
        vgpr_patch_output_mask | lds_patch_output_mask,
        "every TCS patch output must live in VGPRs or LDS"
    );

    let (highest_remapped_vram_output, highest_remapped_vram_patch_output) = match map_io {
        Some(map_io) => {
            let highest = |slots: BitIter, offset: u32| slots.map(|i| map_io(i + offset) + 1).max().unwrap_or(0);
            let mut patch = highest(BitIter(vram_patch_output_mask as u64), PATCH0);
            if remapped_outputs_include_tess_levels {
                patch = patch.max(highest(BitIter(vram_output_mask & TESS_LVL_MASK), 0));
            }
            (highest(BitIter(vram_output_mask & !TESS_LVL_MASK), 0), patch)
        }
        None => {
            let mut patch = vram_patch_output_mask.count_ones();
            if remapped_outputs_include_tess_levels {
                patch += (vram_output_mask & TESS_LVL_MASK).count_ones();
            }
            ((vram_output_mask & !TESS_LVL_MASK).count_ones(), patch)
        }
    };

    let io_info = TessIoInfo {
        vram_output_mask,
        vram_patch_output_mask,
        lds_output_mask,
        lds_patch_output_mask,
        vgpr_output_mask,
        vgpr_patch_output_mask,
        highest_remapped_vram_output,
        highest_remapped_vram_patch_output,
    };
    debug!(
        vram = format_args!("{vram_output_mask:#x}"),
        vram_patch = format_args!("{vram_patch_output_mask:#x}"),
        lds = format_args!("{lds_output_mask:#x}"),
        lds_patch = format_args!("{lds_patch_output_mask:#x}"),
        vgpr = format_args!("{vgpr_output_mask:#x}"),
        highest_remapped_vram_output,
        highest_remapped_vram_patch_output,
        "TCS output storage"
    );
    io_info
}
