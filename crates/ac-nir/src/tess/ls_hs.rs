//! VS (as LS) outputs and TCS (as HS) per-vertex inputs.
//!
//! On GFX9+ LS and HS run in the same wave. When the input and output patches have the same
//! size, an HS input read at `gl_InvocationID` is the value the same lane wrote as LS, so it can
//! stay in a VGPR. Everything else goes through LDS.

use nir::varying::{self, LAYER, VIEWPORT};
use nir::{Builder, Def, InstrId, Intrinsic, InstrKind, Lowered, Shader, Stage};
use tracing::{debug, trace};

use super::TessConfig;
use crate::error::ConfigError;
use crate::gfx::GfxLevel;
use crate::io::{calc_io_offset, load_io, map_io_location, store_io, MapIoFn};

/// Which LS outputs reach the HS through VGPRs and which through LDS.
#[derive(Clone, Copy, Default)]
struct InputRouting {
    via_temp: u64,
    via_lds: u64,
}

impl InputRouting {
    /// Without equal patch sizes, every input needs LDS.
    fn new(tcs_in_out_eq: bool, via_temp: u64, via_lds: u64) -> Self {
        if tcs_in_out_eq {
            Self { via_temp, via_lds }
        } else {
            Self {
                via_temp: 0,
                via_lds: via_lds | via_temp,
            }
        }
    }
}

fn check_in_out_eq(gfx_level: Option<GfxLevel>, tcs_in_out_eq: bool, tess: &TessConfig) -> Result<GfxLevel, ConfigError> {
    let gfx_level = gfx_level.ok_or(ConfigError::Invalid("gfx_level is required"))?;
    if tcs_in_out_eq && gfx_level < GfxLevel::Gfx9 {
        return Err(ConfigError::UnsupportedGfxLevel {
            feature: "passing TCS inputs in VGPRs",
            gfx_level,
        });
    }
    tess.validate()?;
    Ok(gfx_level)
}

#[derive(Clone, Copy, Default)]
pub struct LsOutputsOptions<'a> {
    pub gfx_level: Option<GfxLevel>,
    /// TCS input and output patches have the same number of vertices (GFX9+ only).
    pub tcs_in_out_eq: bool,
    /// TCS inputs read at `gl_InvocationID`.
    pub tcs_inputs_via_temp: u64,
    /// TCS inputs read across invocations or indirectly.
    pub tcs_inputs_via_lds: u64,
    pub map_io: MapIoFn<'a>,
    pub tess: TessConfig,
}

impl LsOutputsOptions<'_> {
    pub fn validate(&self) -> Result<GfxLevel, ConfigError> {
        check_in_out_eq(self.gfx_level, self.tcs_in_out_eq, &self.tess)
    }
}

#[derive(Clone, Copy, Default)]
pub struct HsInputsOptions<'a> {
    pub gfx_level: Option<GfxLevel>,
    pub tcs_in_out_eq: bool,
    pub tcs_inputs_via_temp: u64,
    pub tcs_inputs_via_lds: u64,
    pub map_io: MapIoFn<'a>,
    pub tess: TessConfig,
}

impl HsInputsOptions<'_> {
    pub fn validate(&self) -> Result<GfxLevel, ConfigError> {
        check_in_out_eq(self.gfx_level, self.tcs_in_out_eq, &self.tess)
    }
}

fn lower_ls_output_store(
    b: &mut Builder,
    id: InstrId,
    routing: InputRouting,
    map_io: MapIoFn<'_>,
    vote_bytes: u32,
) -> bool {
    let Some(intr) = b.shader.intrinsic(id) else {
        return false;
    };
    if intr.op != Intrinsic::StoreOutput {
        return false;
    }
    let io = intr.idx.io;
    let component = intr.idx.component as u32;
    let write_mask = intr.idx.write_mask;
    let value = intr.srcs[0];
    let offset_src = intr.srcs[1];

    // The last pre-rasterization stage owns the layer and viewport; an LS write is ignored.
    if io.location == LAYER || io.location == VIEWPORT {
        b.remove(id);
        return true;
    }

    let bit = varying::bit(io.location);
    if io.no_varying || (routing.via_temp | routing.via_lds) & bit == 0 {
        trace!(slot = %varying::name(io.location), "VS output not read by the TCS");
        b.remove(id);
        return true;
    }

    if routing.via_lds & bit != 0 {
        let vertex_idx = b.load_sysval(Intrinsic::LoadLocalInvocationIndex);
        let stride = b.load_sysval(Intrinsic::LoadLshsVertexStrideAmd);
        let base_off = b.imul(vertex_idx, stride);

        let mapped = map_io_location(io.location, routing.via_lds, map_io);
        let slot_stride = b.imm_u32(16);
        let io_off = calc_io_offset(b, component, offset_src, slot_stride, 4, mapped);
        let off = b.iadd_nuw(base_off, io_off);
        let off = b.iadd_imm_nuw(off, vote_bytes as u64);

        store_io(b, value, 0, write_mask, io.high_16bits, |b, v, const_offset, mask| {
            b.intrinsic(Intrinsic::StoreShared)
                .src(v)
                .src(off)
                .write_mask(mask)
                .base(const_offset as i32)
                .emit();
        });
    }

    // The store itself passes the value to the HS in a VGPR.
    if routing.via_temp & bit == 0 {
        b.remove(id);
    }
    true
}

/// Stores the VS outputs the TCS reads into LDS and drops the rest.
///
/// Outputs passed in VGPRs keep their `store_output`.
pub fn lower_ls_outputs_to_mem(shader: &mut Shader, options: &LsOutputsOptions<'_>) -> Result<bool, ConfigError> {
    assert_eq!(shader.stage(), Stage::Vertex, "LS outputs come from a vertex shader");
    let gfx_level = options.validate()?;
    let routing = InputRouting::new(options.tcs_in_out_eq, options.tcs_inputs_via_temp, options.tcs_inputs_via_lds);
    let vote_bytes = options.tess.tess_level_vote_lds_bytes;

    let progress = nir::intrinsics_pass(shader, |b, id| lower_ls_output_store(b, id, routing, options.map_io, vote_bytes));
    debug!(
        %gfx_level,
        via_temp = format_args!("{:#x}", routing.via_temp),
        via_lds = format_args!("{:#x}", routing.via_lds),
        progress,
        "lowered LS outputs"
    );
    Ok(progress)
}

/// Reads at `gl_InvocationID` of inputs kept in VGPRs need no lowering.
fn reads_own_vertex(shader: &Shader, id: InstrId, via_temp: u64) -> bool {
    let Some(intr) = shader.intrinsic(id) else {
        return false;
    };
    if via_temp & varying::bit(intr.idx.io.location) == 0 || shader.const_value(intr.srcs[1]).is_none() {
        return false;
    }
    match &shader.instr(shader.parent_instr(intr.srcs[0])).kind {
        InstrKind::Intrinsic(vertex) => vertex.op == Intrinsic::LoadInvocationId,
        _ => false,
    }
}

struct HsInputState<'a> {
    routing: InputRouting,
    map_io: MapIoFn<'a>,
    vote_bytes: u32,
}

impl HsInputState<'_> {
    /// `rel_patch_id * input patch size + vertex * stride + io_off + header`.
    fn lds_offset(&self, b: &mut Builder, id: InstrId) -> Def {
        let Some(intr) = b.shader.intrinsic(id) else {
            unreachable!("TCS input {id:?} is not an intrinsic");
        };
        let io = intr.idx.io;
        let component = intr.idx.component as u32;
        let vertex_index = intr.srcs[0];
        let offset_src = intr.srcs[1];

        let tcs_in_vtxcnt = b.load_sysval(Intrinsic::LoadPatchVerticesIn);
        let rel_patch_id = b.load_sysval(Intrinsic::LoadTessRelPatchIdAmd);
        let stride = b.load_sysval(Intrinsic::LoadLshsVertexStrideAmd);
        let patch_stride = b.imul(tcs_in_vtxcnt, stride);
        let vertex_index_off = b.imul(vertex_index, stride);
        let patch_offset = b.imul(rel_patch_id, patch_stride);

        let mapped = map_io_location(io.location, self.routing.via_lds, self.map_io);
        let slot_stride = b.imm_u32(16);
        let io_offset = calc_io_offset(b, component, offset_src, slot_stride, 4, mapped);

        let off = b.iadd_nuw(patch_offset, vertex_index_off);
        let off = b.iadd_nuw(off, io_offset);
        b.iadd_imm_nuw(off, self.vote_bytes as u64)
    }

    fn lower(&self, b: &mut Builder, id: InstrId) -> Lowered {
        let Some(intr) = b.shader.intrinsic(id) else {
            return Lowered::Unchanged;
        };
        let hi_16bit = intr.idx.io.high_16bits;
        let num_components = intr.num_components;
        let Some(def) = intr.def else {
            unreachable!("load_per_vertex_input without a destination");
        };
        let bit_size = b.bit_size(def);

        let off = self.lds_offset(b, id);
        let load = load_io(b, num_components, bit_size, hi_16bit, |b, n, bits| {
            b.intrinsic(Intrinsic::LoadShared).src(off).def(n, bits)
        });
        Lowered::Replace(load)
    }
}

/// Rewrites TCS per-vertex input loads into LDS loads, except reads of VGPR inputs at
/// `gl_InvocationID`.
pub fn lower_hs_inputs_to_mem(shader: &mut Shader, options: &HsInputsOptions<'_>) -> Result<bool, ConfigError> {
    assert_eq!(shader.stage(), Stage::TessCtrl, "HS inputs belong to a tessellation control shader");
    let gfx_level = options.validate()?;
    let routing = if options.tcs_in_out_eq {
        InputRouting::new(true, options.tcs_inputs_via_temp, options.tcs_inputs_via_lds)
    } else {
        InputRouting {
            via_temp: 0,
            via_lds: shader.info.inputs_read,
        }
    };
    let state = HsInputState {
        routing,
        map_io: options.map_io,
        vote_bytes: options.tess.tess_level_vote_lds_bytes,
    };

    let progress = nir::lower_instructions(
        shader,
        |s, id| {
            s.intrinsic(id).is_some_and(|i| i.op == Intrinsic::LoadPerVertexInput)
                && !reads_own_vertex(s, id, routing.via_temp)
        },
        |b, id| state.lower(b, id),
    );
    debug!(%gfx_level, via_lds = format_args!("{:#x}", routing.via_lds), progress, "lowered HS inputs");
    Ok(progress)
}
