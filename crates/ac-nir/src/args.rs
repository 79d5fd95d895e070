//! Shader argument layout and the loads/stores that read hardware-provided inputs.
//!
//! The layout itself is built by the driver. The passes only ever see [`ArgRef`]s and turn
//! them into `load_scalar_arg_amd`/`load_vector_arg_amd` intrinsics whose `base` is the
//! argument index.

use hashbrown::HashMap;
use nir::{Builder, Def, Intrinsic, Lowered, Shader, Stage};
use tracing::{debug, trace};

use crate::error::ArgLayoutError;
use crate::gfx::GfxLevel;
use crate::hw::merged_wave_info;

/// Register file an argument is preloaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgFile {
    Sgpr,
    Vgpr,
}

/// Symbolic argument names.
///
/// Indexed variants name one element of a consecutive argument array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgName {
    VertexId,
    InstanceId,
    VsPrimId,
    /// LS: the vertex's patch index inside the workgroup.
    VsRelPatchId,
    /// HS: `rel_patch_id` in bits 0-7, invocation id in bits 8-12.
    TcsRelIds,
    TcsPatchId,
    TessOffchipOffset,
    TcsFactorOffset,
    TesPatchId,
    TesRelPatchId,
    TesU,
    TesV,
    MergedWaveInfo,
    GsWaveId,
    GsPrimId,
    GsInvocationId,
    GsVtxOffset(u8),
    Es2gsOffset,
    Gs2vsOffset,
    StreamoutConfig,
    StreamoutWriteIndex,
    StreamoutOffset(u8),
    AttrOffset,
}

/// Physical location of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgInfo {
    pub file: ArgFile,
    /// First register of the argument inside its file.
    pub offset: u32,
    /// Size in dwords.
    pub size: u8,
    /// The argument is declared for layout purposes but not loaded by the hardware.
    pub skip: bool,
}

/// Index of an argument in [`ShaderArgs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArgRef {
    pub index: u32,
}

impl ArgRef {
    /// The argument `n` slots after this one.
    pub fn offset(self, n: u32) -> ArgRef {
        ArgRef {
            index: self.index + n,
        }
    }
}

pub const MAX_SGPRS: u32 = 106;
pub const MAX_VGPRS: u32 = 256;

/// Argument layout of one shader compilation.
#[derive(Debug, Clone, Default)]
pub struct ShaderArgs {
    args: Vec<ArgInfo>,
    names: HashMap<ArgName, ArgRef>,
    num_sgprs: u32,
    num_vgprs: u32,
}

impl ShaderArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an argument after all previously declared ones of the same file.
    pub fn add_arg(&mut self, file: ArgFile, size: u8, name: ArgName) -> Result<ArgRef, ArgLayoutError> {
        if !(1..=4).contains(&size) {
            return Err(ArgLayoutError::InvalidSize { size });
        }
        if self.names.contains_key(&name) {
            return Err(ArgLayoutError::Duplicate { name });
        }
        let (used, max) = match file {
            ArgFile::Sgpr => (&mut self.num_sgprs, MAX_SGPRS),
            ArgFile::Vgpr => (&mut self.num_vgprs, MAX_VGPRS),
        };
        let offset = *used;
        if offset + size as u32 > max {
            return Err(ArgLayoutError::TooManyRegisters {
                file,
                used: offset + size as u32,
                max,
            });
        }
        *used += size as u32;

        let arg = ArgRef {
            index: self.args.len() as u32,
        };
        self.args.push(ArgInfo {
            file,
            offset,
            size,
            skip: false,
        });
        self.names.insert(name, arg);
        Ok(arg)
    }

    /// Keeps the argument's registers reserved but stops the hardware from loading it.
    pub fn set_skip(&mut self, arg: ArgRef, skip: bool) {
        self.args[arg.index as usize].skip = skip;
    }

    pub fn get(&self, name: ArgName) -> Option<ArgRef> {
        self.names.get(&name).copied()
    }

    pub fn info(&self, arg: ArgRef) -> &ArgInfo {
        &self.args[arg.index as usize]
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn num_sgprs(&self) -> u32 {
        self.num_sgprs
    }

    pub fn num_vgprs(&self) -> u32 {
        self.num_vgprs
    }
}

/// Loads the argument `relative_index` slots after `arg`.
pub fn load_arg_at_offset(b: &mut Builder, args: &ShaderArgs, arg: ArgRef, relative_index: u32) -> Def {
    let arg = arg.offset(relative_index);
    let info = *args.info(arg);
    if info.skip {
        return b.undef(info.size, 32);
    }
    let op = match info.file {
        ArgFile::Sgpr => Intrinsic::LoadScalarArgAmd,
        ArgFile::Vgpr => Intrinsic::LoadVectorArgAmd,
    };
    b.intrinsic(op).base(arg.index as i32).def(info.size, 32)
}

pub fn load_arg(b: &mut Builder, args: &ShaderArgs, arg: ArgRef) -> Def {
    load_arg_at_offset(b, args, arg, 0)
}

/// Loads `arg` and records that its value is always below `upper_bound`.
pub fn load_arg_upper_bound(b: &mut Builder, args: &ShaderArgs, arg: ArgRef, upper_bound: u32) -> Def {
    let value = load_arg(b, args, arg);
    let producer = b.shader.parent_instr(value);
    if let Some(intr) = b.shader.intrinsic_mut(producer) {
        intr.idx.arg_upper_bound = upper_bound;
    }
    value
}

/// Writes an output argument. Only legal in top-level control flow.
pub fn store_arg(b: &mut Builder, args: &ShaderArgs, arg: ArgRef, value: Def) {
    let block = b.cursor_block();
    assert!(
        b.shader.is_top_level_block(block),
        "output arguments can only be stored in top-level control flow"
    );
    let op = match args.info(arg).file {
        ArgFile::Sgpr => Intrinsic::StoreScalarArgAmd,
        ArgFile::Vgpr => Intrinsic::StoreVectorArgAmd,
    };
    b.intrinsic(op).src(value).base(arg.index as i32).emit();
}

/// Extracts `bitwidth` bits starting at `rshift` with the cheapest instruction that works.
pub fn unpack_value(b: &mut Builder, value: Def, rshift: u32, bitwidth: u32) -> Def {
    if rshift == 0 && bitwidth == 32 {
        value
    } else if rshift == 0 {
        b.iand_imm(value, (1u64 << bitwidth) - 1)
    } else if 32 - rshift <= bitwidth {
        b.ushr_imm(value, rshift)
    } else {
        b.ubfe_imm(value, rshift, bitwidth)
    }
}

pub fn unpack_arg(b: &mut Builder, args: &ShaderArgs, arg: ArgRef, rshift: u32, bitwidth: u32) -> Def {
    let value = load_arg(b, args, arg);
    unpack_value(b, value, rshift, bitwidth)
}

/// Hardware stage a shader is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwStage {
    /// Legacy vertex shader (last pre-rasterization stage without NGG).
    Vs,
    /// Vertex shader feeding tessellation; merged into the HS on GFX9+.
    Ls,
    Hs,
    /// Vertex or tess eval shader feeding a legacy GS; merged into the GS on GFX9+.
    Es,
    Gs,
}

#[derive(Debug, Clone)]
pub struct IntrinsicsToArgsOptions {
    pub gfx_level: GfxLevel,
    pub hw_stage: HwStage,
    pub wave_size: u32,
    /// Number of invocations in one workgroup.
    pub workgroup_size: u32,
}

struct ArgsState<'a> {
    args: &'a ShaderArgs,
    options: &'a IntrinsicsToArgsOptions,
    stage: Stage,
}

impl ArgsState<'_> {
    fn is_merged(&self) -> bool {
        self.options.gfx_level >= GfxLevel::Gfx9
            && matches!(self.options.hw_stage, HwStage::Hs | HwStage::Gs)
    }

    fn load(&self, b: &mut Builder, name: ArgName) -> Option<Def> {
        let arg = self.args.get(name)?;
        Some(load_arg(b, self.args, arg))
    }

    fn unpack(&self, b: &mut Builder, name: ArgName, rshift: u32, bitwidth: u32) -> Option<Def> {
        let arg = self.args.get(name)?;
        Some(unpack_arg(b, self.args, arg, rshift, bitwidth))
    }

    fn wave_id(&self, b: &mut Builder) -> Option<Def> {
        let (shift, bits) = merged_wave_info::WAVE_ID;
        self.unpack(b, ArgName::MergedWaveInfo, shift, bits)
    }

    fn lower(&self, b: &mut Builder, op: Intrinsic, base: i32) -> Option<Def> {
        let gfx_level = self.options.gfx_level;
        match op {
            Intrinsic::LoadMergedWaveInfoAmd => self.load(b, ArgName::MergedWaveInfo),
            Intrinsic::LoadSubgroupId if self.is_merged() => self.wave_id(b),
            Intrinsic::LoadLocalInvocationIndex => {
                if self.options.workgroup_size <= self.options.wave_size {
                    Some(b.load_sysval(Intrinsic::LoadSubgroupInvocation))
                } else if self.is_merged() {
                    let wave_id = self.wave_id(b)?;
                    let first = b.imul_imm(wave_id, self.options.wave_size as u64);
                    let lane = b.load_sysval(Intrinsic::LoadSubgroupInvocation);
                    Some(b.iadd_nuw(first, lane))
                } else {
                    None
                }
            }
            Intrinsic::LoadTessRelPatchIdAmd => match self.stage {
                Stage::TessCtrl => self.unpack(b, ArgName::TcsRelIds, 0, 8),
                Stage::TessEval => self.load(b, ArgName::TesRelPatchId),
                _ => None,
            },
            Intrinsic::LoadInvocationId => match self.stage {
                Stage::TessCtrl => self.unpack(b, ArgName::TcsRelIds, 8, 5),
                Stage::Geometry if gfx_level >= GfxLevel::Gfx12 => {
                    self.unpack(b, ArgName::GsVtxOffset(0), 27, 5)
                }
                Stage::Geometry if gfx_level >= GfxLevel::Gfx10 => {
                    self.unpack(b, ArgName::GsInvocationId, 0, 5)
                }
                Stage::Geometry => {
                    let arg = self.args.get(ArgName::GsInvocationId)?;
                    Some(load_arg_upper_bound(b, self.args, arg, 31))
                }
                _ => None,
            },
            Intrinsic::LoadPrimitiveId => match self.stage {
                Stage::Vertex => self.load(b, ArgName::VsPrimId),
                Stage::TessCtrl => self.load(b, ArgName::TcsPatchId),
                Stage::TessEval => self.load(b, ArgName::TesPatchId),
                Stage::Geometry => self.load(b, ArgName::GsPrimId),
                _ => None,
            },
            Intrinsic::LoadVertexIdZeroBase => self.load(b, ArgName::VertexId),
            Intrinsic::LoadGsWaveIdAmd => self.load(b, ArgName::GsWaveId),
            Intrinsic::LoadGsVertexOffsetAmd => {
                let first = self.args.get(ArgName::GsVtxOffset(0))?;
                Some(load_arg_at_offset(b, self.args, first, base as u32))
            }
            Intrinsic::LoadRingEs2gsOffsetAmd => self.load(b, ArgName::Es2gsOffset),
            Intrinsic::LoadRingGs2vsOffsetAmd => self.load(b, ArgName::Gs2vsOffset),
            Intrinsic::LoadRingTessOffchipOffsetAmd => self.load(b, ArgName::TessOffchipOffset),
            Intrinsic::LoadRingTessFactorsOffsetAmd => self.load(b, ArgName::TcsFactorOffset),
            Intrinsic::LoadRingAttrOffsetAmd => self.load(b, ArgName::AttrOffset),
            Intrinsic::LoadStreamoutConfigAmd => self.load(b, ArgName::StreamoutConfig),
            Intrinsic::LoadStreamoutWriteIndexAmd => self.load(b, ArgName::StreamoutWriteIndex),
            Intrinsic::LoadStreamoutOffsetAmd => self.load(b, ArgName::StreamoutOffset(base as u8)),
            _ => None,
        }
    }
}

/// Replaces system values that the hardware preloads into argument registers.
///
/// Intrinsics without a backing argument in `args` stay untouched.
pub fn lower_intrinsics_to_args(shader: &mut Shader, args: &ShaderArgs, options: &IntrinsicsToArgsOptions) -> bool {
    let state = ArgsState {
        args,
        options,
        stage: shader.stage(),
    };
    let progress = nir::lower_instructions(
        shader,
        |s, id| s.intrinsic(id).is_some_and(|i| i.def.is_some()),
        |b, id| {
            let Some(intr) = b.shader.intrinsic(id) else {
                return Lowered::Unchanged;
            };
            let (op, base) = (intr.op, intr.idx.base);
            match state.lower(b, op, base) {
                Some(replacement) => {
                    trace!(intrinsic = op.name(), "lowered to argument");
                    Lowered::Replace(replacement)
                }
                None => Lowered::Unchanged,
            }
        },
    );
    debug!(hw_stage = ?options.hw_stage, progress, "lower_intrinsics_to_args");
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use nir::{Shader, Stage};
    use pretty_assertions::assert_eq;

    fn tcs_args() -> ShaderArgs {
        let mut args = ShaderArgs::new();
        args.add_arg(ArgFile::Sgpr, 1, ArgName::TessOffchipOffset).unwrap();
        args.add_arg(ArgFile::Sgpr, 1, ArgName::MergedWaveInfo).unwrap();
        args.add_arg(ArgFile::Vgpr, 1, ArgName::TcsPatchId).unwrap();
        args.add_arg(ArgFile::Vgpr, 1, ArgName::TcsRelIds).unwrap();
        args
    }

    #[test]
    fn layout_assigns_offsets_per_file() {
        let args = tcs_args();
        let rel_ids = args.get(ArgName::TcsRelIds).unwrap();
        assert_eq!(rel_ids.index, 3);
        assert_eq!(
            *args.info(rel_ids),
            ArgInfo {
                file: ArgFile::Vgpr,
                offset: 1,
                size: 1,
                skip: false,
            }
        );
        assert_eq!(args.num_sgprs(), 2);
        assert_eq!(args.num_vgprs(), 2);
    }

    #[test]
    fn layout_rejects_duplicates_and_overflow() {
        let mut args = tcs_args();
        assert_eq!(
            args.add_arg(ArgFile::Vgpr, 1, ArgName::TcsRelIds),
            Err(ArgLayoutError::Duplicate {
                name: ArgName::TcsRelIds
            })
        );
        for i in 0..26 {
            args.add_arg(ArgFile::Sgpr, 4, ArgName::StreamoutOffset(i)).unwrap();
        }
        assert_eq!(
            args.add_arg(ArgFile::Sgpr, 1, ArgName::StreamoutConfig),
            Err(ArgLayoutError::TooManyRegisters {
                file: ArgFile::Sgpr,
                used: 107,
                max: MAX_SGPRS,
            })
        );
    }

    #[test]
    fn skipped_args_load_as_undef() {
        let mut args = tcs_args();
        let patch_id = args.get(ArgName::TcsPatchId).unwrap();
        args.set_skip(patch_id, true);

        let mut shader = Shader::new(Stage::TessCtrl, "skip");
        let mut b = Builder::at_end(&mut shader);
        let value = load_arg(&mut b, &args, patch_id);
        assert!(b.shader.is_undef(value));

        let offchip = args.get(ArgName::TessOffchipOffset).unwrap();
        let value = load_arg_upper_bound(&mut b, &args, offchip, 1024);
        let intr = b.shader.def_intrinsic(value).unwrap();
        assert_eq!(intr.op, Intrinsic::LoadScalarArgAmd);
        assert_eq!(intr.idx.arg_upper_bound, 1024);
        assert_eq!(intr.idx.base, 0);
    }

    #[test]
    fn unpack_picks_the_cheapest_form() {
        let mut shader = Shader::new(Stage::Vertex, "unpack");
        let mut b = Builder::at_end(&mut shader);
        let value = b.imm_u32(0xdead_beef);
        assert_eq!(unpack_value(&mut b, value, 0, 32), value);

        let masked = unpack_value(&mut b, value, 0, 8);
        assert_eq!(b.shader.const_u32(masked), Some(0xef));
        let shifted = unpack_value(&mut b, value, 24, 8);
        assert_eq!(b.shader.const_u32(shifted), Some(0xde));
        let field = unpack_value(&mut b, value, 8, 5);
        assert_eq!(b.shader.const_u32(field), Some(0xbe & 0x1f));
    }

    #[test]
    #[should_panic(expected = "top-level control flow")]
    fn store_arg_rejects_nested_blocks() {
        let mut args = ShaderArgs::new();
        let out = args.add_arg(ArgFile::Sgpr, 1, ArgName::GsWaveId).unwrap();
        let mut shader = Shader::new(Stage::Vertex, "store");
        let mut b = Builder::at_end(&mut shader);
        let cond = b.imm_true();
        let _nif = b.push_if(cond);
        let value = b.imm_u32(1);
        store_arg(&mut b, &args, out, value);
    }

    #[test]
    fn tcs_sysvals_come_from_rel_ids() {
        let args = tcs_args();
        let mut shader = Shader::new(Stage::TessCtrl, "tcs");
        let mut b = Builder::at_end(&mut shader);
        b.load_sysval(Intrinsic::LoadInvocationId);
        b.load_sysval(Intrinsic::LoadTessRelPatchIdAmd);
        b.load_sysval(Intrinsic::LoadPrimitiveId);
        // Nothing backs this one.
        b.load_sysval(Intrinsic::LoadGsWaveIdAmd);

        let options = IntrinsicsToArgsOptions {
            gfx_level: GfxLevel::Gfx10_3,
            hw_stage: HwStage::Hs,
            wave_size: 64,
            workgroup_size: 128,
        };
        assert!(lower_intrinsics_to_args(&mut shader, &args, &options));
        nir::validate(&shader).unwrap();

        assert_eq!(shader.count_intrinsics(Intrinsic::LoadInvocationId), 0);
        assert_eq!(shader.count_intrinsics(Intrinsic::LoadTessRelPatchIdAmd), 0);
        assert_eq!(shader.count_intrinsics(Intrinsic::LoadPrimitiveId), 0);
        assert_eq!(shader.count_intrinsics(Intrinsic::LoadGsWaveIdAmd), 1);
        let bases: Vec<i32> = shader
            .find_intrinsics(Intrinsic::LoadVectorArgAmd)
            .into_iter()
            .map(|id| shader.intrinsic(id).unwrap().idx.base)
            .collect();
        assert_eq!(bases, vec![3, 3, 2]);
    }

    #[test]
    fn local_invocation_index_on_merged_stages() {
        let args = tcs_args();
        let mut shader = Shader::new(Stage::TessCtrl, "index");
        let mut b = Builder::at_end(&mut shader);
        b.load_sysval(Intrinsic::LoadLocalInvocationIndex);

        let options = IntrinsicsToArgsOptions {
            gfx_level: GfxLevel::Gfx9,
            hw_stage: HwStage::Hs,
            wave_size: 64,
            workgroup_size: 192,
        };
        assert!(lower_intrinsics_to_args(&mut shader, &args, &options));
        assert_eq!(shader.count_intrinsics(Intrinsic::LoadSubgroupInvocation), 1);
        assert_eq!(shader.count_intrinsics(Intrinsic::LoadScalarArgAmd), 1);
    }
}
