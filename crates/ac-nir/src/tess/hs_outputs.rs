//! TCS (as HS) outputs.
//!
//! Every output store goes to LDS when some invocation reads it back, and to a local variable
//! when only the writing invocation needs it. Outputs the TES reads are collected at the end of
//! the shader by [`super::finale`] and written to the off-chip ring with whole vec4 stores.

use nir::varying::{self, NUM_SLOTS, PATCH0, PATCH31, TESS_LEVEL_OUTER};
use nir::{Builder, Def, InstrId, Intrinsic, Lowered, MemoryModes, Scope, Shader, Stage, TcsInfo, VarId};
use tracing::{debug, trace};

use super::finale::hs_finale;
use super::layout::{LdsLayout, VramLayout};
use super::{TessConfig, TessIoInfo, TESS_LVL_MASK};
use crate::error::ConfigError;
use crate::gfx::GfxLevel;
use crate::io::{load_io, store_io, MapIoFn};
use crate::prerast::store_var_components;

#[derive(Clone, Copy)]
pub struct HsOutputsOptions<'a> {
    pub gfx_level: Option<GfxLevel>,
    pub wave_size: u32,
    pub map_io: MapIoFn<'a>,
    pub tess: TessConfig,
}

impl Default for HsOutputsOptions<'_> {
    fn default() -> Self {
        Self {
            gfx_level: None,
            wave_size: 64,
            map_io: None,
            tess: TessConfig::default(),
        }
    }
}

impl HsOutputsOptions<'_> {
    pub fn validate(&self) -> Result<GfxLevel, ConfigError> {
        let gfx_level = self.gfx_level.ok_or(ConfigError::Invalid("gfx_level is required"))?;
        crate::check_wave_size(self.wave_size)?;
        self.tess.validate()?;
        Ok(gfx_level)
    }
}

/// One variable per channel; 4..8 are the upper halves of 16-bit stores.
pub(super) type ChannelVars = [Option<VarId>; 8];

/// Tess level values of the current patch. `None` where the domain has no such level.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct TessLevels {
    pub outer: Option<Def>,
    pub inner: Option<Def>,
}

pub(super) struct HsOutputState<'a> {
    pub gfx_level: GfxLevel,
    pub wave_size: u32,
    pub tcs_info: TcsInfo,
    pub io_info: TessIoInfo,
    pub map_io: MapIoFn<'a>,
    pub vote_bytes: u32,
    pub tcs_vertices_out: u32,
    /// A patch never spans two waves, so output barriers only need subgroup scope.
    pub tcs_out_patch_fits_subgroup: bool,

    pub per_vertex_vars: [ChannelVars; NUM_SLOTS],
    /// Channels written per slot, for outputs that go to the ring.
    pub per_vertex_vmem_chan_mask: [u8; NUM_SLOTS],
    /// vec4 outer and inner levels.
    pub tess_level_vars: [VarId; 2],
    pub tess_level_chan_mask: [u8; 2],
    pub per_patch_vars: [ChannelVars; 32],
    pub per_patch_vmem_chan_mask: [u8; 32],
}

fn is_patch_output(location: u32) -> bool {
    (PATCH0..=PATCH31).contains(&location)
}

fn get_or_create_output_variable(shader: &mut Shader, var: &mut Option<VarId>, name: &str, bit_size: u8) -> VarId {
    *var.get_or_insert_with(|| shader.add_variable(name, 1, bit_size))
}

/// Stores each written channel of `value` to its own variable.
fn store_output_variable(
    b: &mut Builder,
    vars: &mut ChannelVars,
    location: u32,
    value: Def,
    write_mask: u32,
    component: u32,
    high_16bits: bool,
) {
    let bit_size = b.bit_size(value);
    for i in 0..4u32 {
        if (write_mask << component) & (1 << i) == 0 {
            continue;
        }
        let i = i as usize;
        if let Some(lo) = vars[i] {
            assert_eq!(b.shader.variable(lo).bit_size, bit_size, "mixed bit sizes in output channel {i}");
        }
        if let Some(hi) = vars[4 + i] {
            assert_eq!(bit_size, 16, "32-bit store to a channel holding 16-bit halves");
            assert_eq!(b.shader.variable(hi).bit_size, 16, "mixed bit sizes in output channel {i}");
        }

        let chan = i + if high_16bits { 4 } else { 0 };
        let name = format!("{}.{chan}", varying::name(location));
        let var = get_or_create_output_variable(b.shader, &mut vars[chan], &name, bit_size);
        let comp = b.channel(value, (i as u32 - component) as u8);
        b.store_var(var, comp, 0x1);
    }
}

impl HsOutputState<'_> {
    pub fn lds(&self) -> LdsLayout<'_> {
        LdsLayout {
            io_info: &self.io_info,
            tcs_vertices_out: self.tcs_vertices_out,
            vote_bytes: self.vote_bytes,
        }
    }

    pub fn vram(&self) -> VramLayout<'_> {
        VramLayout {
            vram_output_mask: self.io_info.vram_output_mask,
            vram_patch_output_mask: self.io_info.vram_patch_output_mask,
            map_io: self.map_io,
        }
    }

    fn needs_vmem(&self, per_vertex: bool, location: u32) -> bool {
        if per_vertex {
            self.io_info.vram_output_mask & !TESS_LVL_MASK & varying::bit(location) != 0
        } else if varying::is_tess_level(location) {
            // Tess levels are written to the ring by the finale.
            false
        } else {
            is_patch_output(location) && self.io_info.vram_patch_output_mask & (1 << (location - PATCH0)) != 0
        }
    }

    fn needs_lds(&self, per_vertex: bool, location: u32) -> bool {
        if per_vertex {
            self.io_info.lds_output_mask & !TESS_LVL_MASK & varying::bit(location) != 0
        } else if varying::is_tess_level(location) {
            self.io_info.lds_output_mask & TESS_LVL_MASK & varying::bit(location) != 0
        } else {
            is_patch_output(location) && self.io_info.lds_patch_output_mask & (1 << (location - PATCH0)) != 0
        }
    }

    fn lower_store(&mut self, b: &mut Builder, id: InstrId) -> Lowered {
        let Some(intr) = b.shader.intrinsic(id) else {
            return Lowered::Unchanged;
        };
        let per_vertex = intr.op == Intrinsic::StorePerVertexOutput;
        let io = intr.idx.io;
        let component = intr.idx.component as u32;
        let write_mask = intr.idx.write_mask;
        let value = intr.srcs[0];
        let vertex_index = per_vertex.then(|| intr.srcs[1]);
        let Some(&offset) = intr.srcs.last() else {
            unreachable!("output store without an offset");
        };
        let location = io.location;
        let bit_size = b.bit_size(value);
        assert!(bit_size == 16 || bit_size == 32, "{bit_size}-bit TCS output store");

        let write_to_vmem = self.needs_vmem(per_vertex, location);
        let write_to_lds = self.needs_lds(per_vertex, location);
        let chan_mask = (write_mask << component) as u8;

        if write_to_vmem {
            if per_vertex {
                for slot in 0..io.num_slots as u32 {
                    self.per_vertex_vmem_chan_mask[(location + slot) as usize] |= chan_mask;
                }
            } else {
                assert!(is_patch_output(location), "patch output at slot {location}");
                let index = location - PATCH0;
                for slot in 0..io.num_slots as u32 {
                    self.per_patch_vmem_chan_mask[(index + slot) as usize] |= chan_mask;
                }
            }
        }

        if write_to_lds {
            let off = self.lds().output_offset(b, location, component, vertex_index, Some(offset));
            store_io(b, value, 0, write_mask, io.high_16bits, |b, v, const_offset, mask| {
                b.intrinsic(Intrinsic::StoreShared)
                    .src(v)
                    .src(off)
                    .write_mask(mask)
                    .base(const_offset as i32)
                    .emit();
            });
        }

        // Outputs for the ring are kept in variables until the finale.
        if write_to_vmem && per_vertex && self.io_info.vgpr_output_mask & varying::bit(location) != 0 {
            assert_eq!(io.num_slots, 1, "indirectly indexed output {location} can't live in VGPRs");
            let vars = &mut self.per_vertex_vars[location as usize];
            store_output_variable(b, vars, location, value, write_mask, component, io.high_16bits);
        }

        if write_to_vmem && !per_vertex {
            let index = location - PATCH0;
            if self.io_info.vgpr_patch_output_mask & (1 << index) != 0 {
                assert_eq!(io.num_slots, 1, "indirectly indexed patch output {index} can't live in VGPRs");
                let vars = &mut self.per_patch_vars[index as usize];
                store_output_variable(b, vars, location, value, write_mask, component, io.high_16bits);
            }
        }

        if varying::is_tess_level(location) {
            let i = (location - TESS_LEVEL_OUTER) as usize;
            self.tess_level_chan_mask[i] |= chan_mask;
            if self.io_info.vgpr_output_mask & varying::bit(location) != 0 {
                store_var_components(b, self.tess_level_vars[i], value, component, write_mask);
            }
        }

        trace!(slot = %varying::name(location), write_to_vmem, write_to_lds, "lowered HS output store");
        Lowered::Remove
    }

    fn lower_load(&mut self, b: &mut Builder, id: InstrId) -> Lowered {
        let Some(intr) = b.shader.intrinsic(id) else {
            return Lowered::Unchanged;
        };
        let per_vertex = intr.op == Intrinsic::LoadPerVertexOutput;
        let io = intr.idx.io;
        let component = intr.idx.component as u32;
        let vertex_index = per_vertex.then(|| intr.srcs[0]);
        let Some(&offset) = intr.srcs.last() else {
            unreachable!("output load without an offset");
        };
        let Some(def) = intr.def else {
            unreachable!("output load without a destination");
        };
        let location = io.location;
        let num_components = b.num_components(def);
        let bit_size = b.bit_size(def);
        let in_lds = self.needs_lds(per_vertex, location);

        if varying::is_tess_level(location) && !in_lds {
            let i = (location - TESS_LEVEL_OUTER) as usize;
            let var = b.load_var(self.tess_level_vars[i]);
            return Lowered::Replace(b.extract_bits(&[var], component * bit_size as u32, num_components, bit_size));
        }

        if is_patch_output(location) && !in_lds {
            assert_eq!(io.num_slots, 1, "indirectly indexed patch output read from VGPRs");
            let index = (location - PATCH0) as usize;
            let hi = if io.high_16bits { 4 } else { 0 };
            // A load can precede the first store inside a loop, so the variable may not exist yet.
            let comps: Vec<Def> = (0..num_components as usize)
                .map(|i| {
                    let chan = component as usize + i + hi;
                    let name = format!("{}.{chan}", varying::name(location));
                    let var = get_or_create_output_variable(b.shader, &mut self.per_patch_vars[index][chan], &name, bit_size);
                    b.load_var(var)
                })
                .collect();
            return Lowered::Replace(b.vec(&comps));
        }

        // Never stored.
        if !in_lds {
            return Lowered::Replace(b.undef(num_components, bit_size));
        }

        let off = self.lds().output_offset(b, location, component, vertex_index, Some(offset));
        let load = load_io(b, num_components, bit_size, io.high_16bits, |b, n, bits| {
            b.intrinsic(Intrinsic::LoadShared).src(off).def(n, bits)
        });
        Lowered::Replace(load)
    }

    /// Output accesses became LDS accesses, so barriers must order those instead.
    fn update_barrier(&self, b: &mut Builder, id: InstrId) -> Lowered {
        let fits_subgroup = self.tcs_out_patch_fits_subgroup;
        let Some(intr) = b.shader.intrinsic_mut(id) else {
            return Lowered::Unchanged;
        };
        let idx = &mut intr.idx;
        if idx.memory_modes.contains(MemoryModes::SHADER_OUT) {
            idx.memory_modes.remove(MemoryModes::SHADER_OUT);
            idx.memory_modes.insert(MemoryModes::SHARED);
        }
        if fits_subgroup {
            if idx.execution_scope == Scope::Workgroup {
                idx.execution_scope = Scope::Subgroup;
            }
            if idx.memory_scope == Scope::Workgroup {
                idx.memory_scope = Scope::Subgroup;
            }
        }
        Lowered::Progress
    }

    fn lower(&mut self, b: &mut Builder, id: InstrId) -> Lowered {
        let Some(op) = b.shader.intrinsic(id).map(|i| i.op) else {
            return Lowered::Unchanged;
        };
        match op {
            Intrinsic::StoreOutput | Intrinsic::StorePerVertexOutput => self.lower_store(b, id),
            Intrinsic::LoadOutput | Intrinsic::LoadPerVertexOutput => self.lower_load(b, id),
            Intrinsic::Barrier => self.update_barrier(b, id),
            op => unreachable!("{} is not an HS output access", op.name()),
        }
    }

    /// Current values of the tess levels the domain uses; zero for levels never written.
    pub fn load_tess_levels(&self, b: &mut Builder) -> TessLevels {
        let (outer_comps, inner_comps) = b.shader.info.tess.primitive_mode.tess_level_components();
        let mut levels = [None, None];
        let mut lds_base = None;

        for (i, comps) in [outer_comps, inner_comps].into_iter().enumerate() {
            let comps = comps as u8;
            if comps == 0 {
                continue;
            }
            if self.tess_level_chan_mask[i] == 0 {
                levels[i] = Some(b.imm_zero(comps, 32));
                continue;
            }

            let slot = TESS_LEVEL_OUTER + i as u32;
            if self.io_info.vgpr_output_mask & varying::bit(slot) != 0 {
                let value = b.load_var(self.tess_level_vars[i]);
                levels[i] = Some(b.trim_vector(value, comps));
                continue;
            }

            let base = match lds_base {
                Some(base) => base,
                None => {
                    let base = self.lds().output_offset(b, 0, 0, None, None);
                    lds_base = Some(base);
                    base
                }
            };
            let mapped = self.lds().map_location(false, slot);
            let value = b
                .intrinsic(Intrinsic::LoadShared)
                .src(base)
                .base((mapped * 16) as i32)
                .def(comps, 32);
            levels[i] = Some(value);
        }

        TessLevels {
            outer: levels[0],
            inner: levels[1],
        }
    }
}

fn is_hs_output_access(shader: &Shader, id: InstrId) -> bool {
    shader.intrinsic(id).is_some_and(|i| {
        matches!(
            i.op,
            Intrinsic::StoreOutput
                | Intrinsic::StorePerVertexOutput
                | Intrinsic::LoadOutput
                | Intrinsic::LoadPerVertexOutput
                | Intrinsic::Barrier
        )
    })
}

/// Lowers TCS output accesses to LDS and local variables, then appends the HS finale: the tess
/// factor stores, the group vote and the off-chip ring stores.
///
/// Always reports progress.
pub fn lower_hs_outputs_to_mem(
    shader: &mut Shader,
    tcs_info: &TcsInfo,
    io_info: &TessIoInfo,
    options: &HsOutputsOptions<'_>,
) -> Result<bool, ConfigError> {
    assert_eq!(shader.stage(), Stage::TessCtrl, "HS outputs belong to a tessellation control shader");
    let gfx_level = options.validate()?;
    let tcs_vertices_out = shader.info.tess.tcs_vertices_out as u32;
    assert!(tcs_vertices_out > 0, "tcs_vertices_out is not set");

    let tess_level_vars = [
        shader.add_variable("tess outer", 4, 32),
        shader.add_variable("tess inner", 4, 32),
    ];
    let mut state = HsOutputState {
        gfx_level,
        wave_size: options.wave_size,
        tcs_info: *tcs_info,
        io_info: *io_info,
        map_io: options.map_io,
        vote_bytes: options.tess.tess_level_vote_lds_bytes,
        tcs_vertices_out,
        tcs_out_patch_fits_subgroup: options.wave_size % tcs_vertices_out == 0,
        per_vertex_vars: [[None; 8]; NUM_SLOTS],
        per_vertex_vmem_chan_mask: [0; NUM_SLOTS],
        tess_level_vars,
        tess_level_chan_mask: [0; 2],
        per_patch_vars: [[None; 8]; 32],
        per_patch_vmem_chan_mask: [0; 32],
    };

    nir::lower_instructions(shader, is_hs_output_access, |b, id| state.lower(b, id));
    hs_finale(shader, &mut state);

    debug!(
        %gfx_level,
        wave_size = options.wave_size,
        tcs_vertices_out,
        fits_subgroup = state.tcs_out_patch_fits_subgroup,
        vram = format_args!("{:#x}/{:#x}", io_info.vram_output_mask, io_info.vram_patch_output_mask),
        lds = format_args!("{:#x}/{:#x}", io_info.lds_output_mask, io_info.lds_patch_output_mask),
        vgpr = format_args!("{:#x}/{:#x}", io_info.vgpr_output_mask, io_info.vgpr_patch_output_mask),
        "lowered HS outputs"
    );
    Ok(true)
}
