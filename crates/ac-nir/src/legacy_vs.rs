//! Epilogue of the last pre-rasterization stage when it runs as a legacy (non-NGG) VS.
//!
//! All output stores are folded into a [`PrerastOut`] table and re-emitted at the end of the
//! shader as streamout stores, position exports and parameter exports.

use nir::varying::{self, LAYER, POS, PRIMITIVE_ID, PSIZ, VAR0_16BIT};
use nir::{AluType, Builder, InstrId, Intrinsic, Shader, ShaderInfo, Stage};
use tracing::debug;

use crate::error::ConfigError;
use crate::gfx::GfxLevel;
use crate::prerast::{
    clamp_vertex_color_outputs, export_parameters, export_position, gather_store_output, PositionExport,
    PrerastOut,
};
use crate::streamout::{emit_legacy_streamout, sorted_xfb_info};

#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyVsOptions<'a> {
    pub gfx_level: Option<GfxLevel>,
    /// Enabled clip and cull distances, one bit per distance.
    pub clip_cull_mask: u32,
    /// Parameter index of each varying slot. Slots past the end are not exported.
    pub param_offsets: &'a [u8],
    pub has_param_exports: bool,
    /// Export the primitive ID for a fragment shader that reads it.
    pub export_primitive_id: bool,
    pub disable_streamout: bool,
    pub kill_pointsize: bool,
    pub kill_layer: bool,
    pub force_vrs: bool,
}

impl LegacyVsOptions<'_> {
    pub fn validate(&self, info: &ShaderInfo) -> Result<GfxLevel, ConfigError> {
        let gfx_level = self.gfx_level.ok_or(ConfigError::Invalid("gfx_level is required"))?;
        if self.clip_cull_mask > 0xff {
            return Err(ConfigError::ClipCullMaskOverflow {
                mask: self.clip_cull_mask,
            });
        }
        if self.has_param_exports {
            let mut written = info.outputs_written;
            if self.export_primitive_id {
                written |= varying::bit(PRIMITIVE_ID);
            }
            let needed = if info.outputs_written_16bit != 0 {
                (VAR0_16BIT + 16 - info.outputs_written_16bit.leading_zeros()) as usize
            } else {
                (64 - written.leading_zeros()) as usize
            };
            if self.param_offsets.len() < needed {
                return Err(ConfigError::ParamOffsetsTooShort {
                    len: self.param_offsets.len(),
                    needed,
                });
            }
        }
        Ok(gfx_level)
    }
}

/// Position exports and, when enabled, parameter exports of one vertex.
///
/// Returns the mask of exported parameter indices.
pub(crate) fn export_vertex(b: &mut Builder, options: &LegacyVsOptions<'_>, gfx_level: GfxLevel, out: &PrerastOut) -> u32 {
    let outputs_written = b.shader.info.outputs_written;
    let outputs_written_16bit = b.shader.info.outputs_written_16bit;

    let mut export_outputs = outputs_written | varying::bit(POS);
    if options.kill_pointsize {
        export_outputs &= !varying::bit(PSIZ);
    }
    if options.kill_layer {
        export_outputs &= !varying::bit(LAYER);
    }

    let position = PositionExport {
        gfx_level,
        clip_cull_mask: options.clip_cull_mask as u8,
        no_param_export: !options.has_param_exports,
        force_vrs: options.force_vrs,
        done: true,
    };
    export_position(b, &position, export_outputs, out, None);

    if options.has_param_exports {
        export_parameters(b, options.param_offsets, outputs_written, outputs_written_16bit, out)
    } else {
        0
    }
}

fn is_store_output(shader: &Shader, id: InstrId) -> bool {
    shader.intrinsic(id).is_some_and(|i| i.op == Intrinsic::StoreOutput)
}

/// Replaces the output stores of a VS or TES with the legacy VS epilogue.
///
/// Output stores must already be in the outermost block, as after lowering outputs to
/// temporaries, so that their values reach the end of the shader.
pub fn lower_legacy_vs(shader: &mut Shader, options: &LegacyVsOptions<'_>) -> Result<bool, ConfigError> {
    assert!(
        matches!(shader.stage(), Stage::Vertex | Stage::TessEval),
        "the legacy VS epilogue needs a vertex or tessellation evaluation shader"
    );
    let gfx_level = options.validate(&shader.info)?;

    let mut out = PrerastOut::new();
    nir::intrinsics_pass(shader, |b, id| {
        if !is_store_output(b.shader, id) {
            return false;
        }
        let block = b.shader.instr(id).block;
        assert!(
            b.shader.is_top_level_block(block),
            "output stores must be lowered to temporaries before the legacy VS epilogue"
        );
        gather_store_output(b, &mut out, id, true);
        b.remove(id);
        true
    });

    let mut b = Builder::at_end(shader);

    if options.export_primitive_id {
        // The primitive ID is implicit for a VS or TES, so the FS can only see it when it's
        // exported explicitly.
        let prim_id = b.load_sysval(Intrinsic::LoadPrimitiveId);
        let slot = PRIMITIVE_ID as usize;
        out.outputs[slot][0] = Some(prim_id);
        out.types[slot][0] = AluType::UINT32;
        let info = &mut out.infos[slot];
        info.set_components_mask(info.components_mask() | 0x1);
        info.set_as_varying_mask(info.as_varying_mask() | 0x1);
        b.shader.info.outputs_written |= varying::bit(PRIMITIVE_ID);
    }

    let xfb = b
        .shader
        .xfb_info
        .as_ref()
        .filter(|_| !options.disable_streamout)
        .map(sorted_xfb_info);
    if let Some(xfb) = &xfb {
        emit_legacy_streamout(&mut b, 0, xfb, &out);
    }

    // After streamout, which captures the unclamped colours.
    let clamped = clamp_vertex_color_outputs(&mut b, &mut out);
    let params = export_vertex(&mut b, options, gfx_level, &out);

    debug!(
        %gfx_level,
        outputs_written = format_args!("{:#x}", b.shader.info.outputs_written),
        streamout = xfb.is_some(),
        clamped,
        params = format_args!("{params:#x}"),
        "lowered legacy VS outputs"
    );
    Ok(true)
}
