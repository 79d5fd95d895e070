//! Number of patches per HS workgroup and its LDS allocation.

use tracing::debug;

use super::{TessConfig, TessIoInfo};
use crate::gfx::{GfxLevel, GpuInfo};

/// Threads an HS workgroup aims for: 3 full waves of 64, or 6 of 32.
const TARGET_THREADS_PER_WG: u32 = 192;
/// Patches the hardware launches per workgroup at most.
const MAX_PATCHES_PER_WG: u32 = 64;
/// Patches per workgroup when SEs take turns instead of distributing tessellation.
const MAX_PATCHES_WITHOUT_DISTRIBUTED_TESS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TessWgInfo {
    pub num_patches_per_wg: u32,
    /// LDS size in units of [`GpuInfo::lds_encode_granularity`].
    pub lds_size: u32,
}

/// Patches of one LS-HS workgroup, given the LDS and off-chip ring bytes each patch needs.
#[allow(clippy::too_many_arguments)]
fn num_tess_patches(
    info: &GpuInfo,
    num_tcs_input_cp: u32,
    num_tcs_output_cp: u32,
    num_mem_tcs_outputs: u32,
    num_mem_tcs_patch_outputs: u32,
    lds_per_patch: u32,
    wave_size: u32,
    tess_uses_primid: bool,
    vote_bytes: u32,
) -> u32 {
    // GFX6 with one SE can't split instanced draws between workgroups, so the patch id would
    // keep counting across instances.
    if info.gfx_level == GfxLevel::Gfx6 && info.max_se == 1 && tess_uses_primid {
        return 1;
    }

    let max_verts_per_patch = num_tcs_input_cp.max(num_tcs_output_cp).max(1);
    let mut num_patches = (TARGET_THREADS_PER_WG / max_verts_per_patch).clamp(1, MAX_PATCHES_PER_WG);

    if !info.has_distributed_tess && info.max_se > 1 {
        num_patches = num_patches.min(MAX_PATCHES_WITHOUT_DISTRIBUTED_TESS);
    }

    let mem_per_patch = (num_tcs_output_cp * num_mem_tcs_outputs + num_mem_tcs_patch_outputs) * 16;
    if mem_per_patch != 0 {
        num_patches = num_patches.min(info.hs_offchip_workgroup_dw_size * 4 / mem_per_patch);
    }

    if lds_per_patch != 0 {
        let lds_limit = info.hs_lds_size_limit - vote_bytes;
        num_patches = num_patches.min(lds_limit / lds_per_patch);
    }

    let mut num_patches = num_patches.max(1);

    // GFX6 hangs with LS-HS workgroups of more than one wave.
    if info.gfx_level == GfxLevel::Gfx6 {
        num_patches = num_patches.min((wave_size / max_verts_per_patch).max(1));
    }

    // Drop the patches of a partially filled last wave, unless that leaves no full wave.
    let threads = num_patches * max_verts_per_patch;
    if threads > wave_size {
        let full_wave_patches = threads / wave_size * wave_size / max_verts_per_patch;
        num_patches = full_wave_patches.max(1);
    }
    num_patches
}

/// Sizes an LS-HS workgroup.
///
/// `num_remapped_tess_level_outputs` counts the per-patch ring attributes taken by tess levels
/// when the driver maps them with the patch outputs.
#[allow(clippy::too_many_arguments)]
pub fn compute_tess_wg_info(
    info: &GpuInfo,
    io_info: &TessIoInfo,
    tcs_vertices_out: u32,
    wave_size: u32,
    tess_uses_primid: bool,
    num_tcs_input_cp: u32,
    lds_input_vertex_size: u32,
    num_remapped_tess_level_outputs: u32,
    tess: &TessConfig,
) -> TessWgInfo {
    let vote_bytes = tess.tess_level_vote_lds_bytes;
    let lds_per_patch = num_tcs_input_cp * lds_input_vertex_size + io_info.lds_output_patch_stride(tcs_vertices_out);
    let num_patches = num_tess_patches(
        info,
        num_tcs_input_cp,
        tcs_vertices_out,
        io_info.highest_remapped_vram_output,
        io_info
            .highest_remapped_vram_patch_output
            .max(num_remapped_tess_level_outputs),
        lds_per_patch,
        wave_size,
        tess_uses_primid,
        vote_bytes,
    );
    let lds_bytes = lds_per_patch * num_patches + vote_bytes;
    // The off-chip ring has a fixed slice per workgroup; only LDS is sized here.
    assert!(
        lds_bytes <= info.hs_lds_size_limit,
        "{lds_bytes} bytes of LDS for {num_patches} patches exceed {}",
        info.hs_lds_size_limit
    );

    let wg_info = TessWgInfo {
        num_patches_per_wg: num_patches,
        lds_size: lds_bytes.div_ceil(info.lds_encode_granularity),
    };
    debug!(
        gfx_level = %info.gfx_level,
        lds_per_patch,
        num_patches,
        lds_bytes,
        lds_size = wg_info.lds_size,
        "computed tess workgroup size"
    );
    wg_info
}
