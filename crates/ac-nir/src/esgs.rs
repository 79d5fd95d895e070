//! ES output and GS input lowering.
//!
//! These hardware stages only exist when a geometry shader is bound. The export shader (ES)
//! runs the VS or TES in front of the GS.
//!
//! * GFX6-8: ES and GS are separate hardware stages and exchange data through the ESGS ring in
//!   VRAM. The ring is swizzled per 64-lane wave, so a vertex's dword `i` lives `i * 64` dwords
//!   after its first dword.
//! * GFX9+: ES and GS are merged into one wave and exchange data through LDS.

use nir::varying::{self, LAYER, VIEWPORT};
use nir::{Access, Builder, Def, InstrId, Intrinsic, Lowered, MemoryModes, Shader};
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::gfx::GfxLevel;
use crate::io::{calc_io_offset, consecutive_ranges, load_io, map_io_location, store_io, MapIoFn};

#[derive(Clone, Copy, Default)]
pub struct EsOutputsOptions<'a> {
    pub gfx_level: Option<GfxLevel>,
    /// Bytes of ES outputs per vertex in LDS (GFX9+).
    pub esgs_itemsize: u32,
    /// Inputs the GS reads; ES outputs outside this mask are dropped.
    pub gs_inputs_read: u64,
    pub map_io: MapIoFn<'a>,
}

impl EsOutputsOptions<'_> {
    pub fn validate(&self) -> Result<GfxLevel, ConfigError> {
        let gfx_level = self.gfx_level.ok_or(ConfigError::Invalid("gfx_level is required"))?;
        if gfx_level >= GfxLevel::Gfx9 && self.esgs_itemsize % 4 != 0 {
            return Err(ConfigError::Invalid("esgs_itemsize must be a multiple of 4"));
        }
        Ok(gfx_level)
    }
}

#[derive(Clone, Copy, Default)]
pub struct GsInputsOptions<'a> {
    pub gfx_level: Option<GfxLevel>,
    /// Rotate the vertex offsets of odd primitives, for triangle strips with adjacency.
    pub triangle_strip_adjacency_fix: bool,
    pub map_io: MapIoFn<'a>,
}

impl GsInputsOptions<'_> {
    pub fn validate(&self) -> Result<GfxLevel, ConfigError> {
        let gfx_level = self.gfx_level.ok_or(ConfigError::Invalid("gfx_level is required"))?;
        if self.triangle_strip_adjacency_fix && gfx_level >= GfxLevel::Gfx10 {
            return Err(ConfigError::UnsupportedGfxLevel {
                feature: "the triangle strip adjacency fix",
                gfx_level,
            });
        }
        Ok(gfx_level)
    }
}

/// Buffer loads covering `num_components * bit_size` bits, one dword at a time.
///
/// Dword `i` is read at `base = component_stride * i`. A trailing 3-byte remainder is read as
/// a full dword.
fn emit_split_buffer_load(
    b: &mut Builder,
    num_components: u8,
    bit_size: u8,
    component_stride: u32,
    desc: Def,
    v_off: Def,
    s_off: Def,
) -> Def {
    let total_bytes = num_components as u32 * bit_size as u32 / 8;
    let mut full_dwords = total_bytes / 4;
    let mut remaining_bytes = total_bytes - full_dwords * 4;
    if remaining_bytes == 3 {
        remaining_bytes = 0;
        full_dwords += 1;
    }

    let zero = b.imm_int(0);
    let access = Access::COHERENT | Access::CAN_REORDER | Access::CAN_SPECULATE;
    let load = |b: &mut Builder, bits: u8, index: u32| {
        b.intrinsic(Intrinsic::LoadBufferAmd)
            .srcs(&[desc, v_off, s_off, zero])
            .base((component_stride * index) as i32)
            .modes(MemoryModes::SHADER_IN)
            .access(access)
            .def(1, bits)
    };

    let mut comps: Vec<Def> = (0..full_dwords).map(|i| load(b, 32, i)).collect();
    if remaining_bytes != 0 {
        comps.push(load(b, (remaining_bytes * 8) as u8, full_dwords));
    }
    b.extract_bits(&comps, 0, num_components, bit_size)
}

/// Stores the written components of `value` with naturally aligned 1, 2 and 4 byte stores.
#[allow(clippy::too_many_arguments)]
fn emit_split_buffer_store(
    b: &mut Builder,
    value: Def,
    desc: Def,
    v_off: Def,
    s_off: Def,
    const_offset: u32,
    write_mask: u32,
    swizzled: bool,
    slc: bool,
) {
    let bit_size = b.bit_size(value) as u32;
    let zero = b.imm_int(0);
    let mut access = Access::COHERENT;
    if slc {
        access |= Access::NON_TEMPORAL;
    }
    if swizzled {
        access |= Access::IS_SWIZZLED;
    }

    for (start, count) in consecutive_ranges(write_mask) {
        let mut bytes = count * bit_size / 8;
        let mut start_byte = start * bit_size / 8;

        while bytes != 0 {
            let store_bytes = match start_byte % 4 {
                1 | 3 => bytes.min(1),
                2 => bytes.min(2),
                _ => bytes.min(4),
            };
            let piece = b.extract_bits(&[value], start_byte * 8, 1, (store_bytes * 8) as u8);
            b.intrinsic(Intrinsic::StoreBufferAmd)
                .srcs(&[piece, desc, v_off, s_off, zero])
                .base((start_byte + const_offset) as i32)
                .modes(MemoryModes::SHADER_OUT)
                .access(access)
                .emit();

            start_byte += store_bytes;
            bytes -= store_bytes;
        }
    }
}

fn lower_es_output_store(b: &mut Builder, id: InstrId, gfx_level: GfxLevel, options: &EsOutputsOptions<'_>) -> bool {
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

    // Only the last pre-rasterization stage controls the layer and viewport.
    if io.location == LAYER || io.location == VIEWPORT {
        b.remove(id);
        return true;
    }

    if io.no_varying || options.gs_inputs_read & varying::bit(io.location) == 0 {
        trace!(slot = %varying::name(io.location), "ES output not read by the GS");
        b.remove(id);
        return true;
    }

    let mapped = map_io_location(io.location, options.gs_inputs_read, options.map_io);
    let stride = b.imm_u32(16);
    let io_off = calc_io_offset(b, component, offset_src, stride, 4, mapped);

    if gfx_level <= GfxLevel::Gfx8 {
        let ring = b.load_sysval(Intrinsic::LoadRingEsgsAmd);
        let es2gs_off = b.load_sysval(Intrinsic::LoadRingEs2gsOffsetAmd);
        store_io(b, value, 0, write_mask, io.high_16bits, |b, v, const_offset, mask| {
            emit_split_buffer_store(b, v, ring, io_off, es2gs_off, const_offset, mask, true, true);
        });
    } else {
        let vertex_idx = b.load_sysval(Intrinsic::LoadLocalInvocationIndex);
        let vertex_off = b.imul_imm(vertex_idx, options.esgs_itemsize as u64);
        let off = b.iadd(vertex_off, io_off);
        store_io(b, value, 0, write_mask, io.high_16bits, |b, v, const_offset, mask| {
            let align = b.bit_size(v) as u32 / 8;
            b.intrinsic(Intrinsic::StoreShared)
                .src(v)
                .src(off)
                .write_mask(mask)
                .base(const_offset as i32)
                .align(align.max(1), 0)
                .emit();
        });
    }

    b.remove(id);
    true
}

/// Rewrites ES `store_output`s into ESGS ring stores (GFX6-8) or LDS stores (GFX9+).
pub fn lower_es_outputs_to_mem(shader: &mut Shader, options: &EsOutputsOptions<'_>) -> Result<bool, ConfigError> {
    let gfx_level = options.validate()?;
    let progress = nir::intrinsics_pass(shader, |b, id| lower_es_output_store(b, id, gfx_level, options));
    debug!(
        %gfx_level,
        esgs_itemsize = options.esgs_itemsize,
        gs_inputs_read = format_args!("{:#x}", options.gs_inputs_read),
        progress,
        "lowered ES outputs"
    );
    Ok(progress)
}

struct GsInputState<'a> {
    gfx_level: GfxLevel,
    triangle_strip_adjacency_fix: bool,
    vertices_in: u32,
    inputs_read: u64,
    map_io: MapIoFn<'a>,
}

impl GsInputState<'_> {
    fn vertex_offset(&self, b: &mut Builder, index: u32) -> Def {
        let origin = b.intrinsic(Intrinsic::LoadGsVertexOffsetAmd).base(index as i32).sysval();
        if !self.triangle_strip_adjacency_fix {
            return origin;
        }

        let fixed_index = if self.gfx_level < GfxLevel::Gfx9 {
            // Rotate by two vertices.
            (index + 4) % 6
        } else {
            // Six offsets packed into three registers.
            (index + 2) % 3
        };
        let fixed = b.intrinsic(Intrinsic::LoadGsVertexOffsetAmd).base(fixed_index as i32).sysval();

        let prim_id = b.load_sysval(Intrinsic::LoadPrimitiveId);
        let odd = b.iand_imm(prim_id, 1);
        let is_odd = b.ine_imm(odd, 0);
        b.bcsel(is_odd, fixed, origin)
    }

    fn vertex_offset_gfx6(&self, b: &mut Builder, vertex: Def) -> Def {
        if let Some(v) = b.shader.const_u32(vertex) {
            return self.vertex_offset(b, v);
        }
        let mut offset = self.vertex_offset(b, 0);
        for i in 1..self.vertices_in {
            let cond = b.ieq_imm(vertex, i as u64);
            let elem = self.vertex_offset(b, i);
            offset = b.bcsel(cond, elem, offset);
        }
        offset
    }

    /// Two 16-bit offsets per register.
    fn vertex_offset_gfx9(&self, b: &mut Builder, vertex: Def) -> Def {
        if let Some(v) = b.shader.const_u32(vertex) {
            let packed = self.vertex_offset(b, v / 2);
            return b.ubfe_imm(packed, (v & 1) * 16, 16);
        }
        let mut offset = self.vertex_offset(b, 0);
        for i in 1..self.vertices_in {
            let cond = b.ieq_imm(vertex, i as u64);
            let mut elem = self.vertex_offset(b, i / 2);
            if i % 2 != 0 {
                elem = b.ushr_imm(elem, 16);
            }
            offset = b.bcsel(cond, elem, offset);
        }
        b.iand_imm(offset, 0xffff)
    }

    /// Three 8-bit offsets per register, 9 bits apart.
    fn vertex_offset_gfx12(&self, b: &mut Builder, vertex: Def) -> Def {
        if let Some(v) = b.shader.const_u32(vertex) {
            let packed = self.vertex_offset(b, v / 3);
            return b.ubfe_imm(packed, (v % 3) * 9, 8);
        }
        let rem = b.umod_imm(vertex, 3);
        let bit_offset = b.imul_imm(rem, 9);
        let three = b.imm_int(3);
        let lt3 = b.ult(vertex, three);
        let eight = b.imm_int(8);
        let first = self.vertex_offset(b, 0);
        let first = b.ubfe(first, bit_offset, eight);
        let second = self.vertex_offset(b, 1);
        let second = b.ubfe(second, bit_offset, eight);
        b.bcsel(lt3, first, second)
    }

    /// Dword offset of the loaded input, times 4.
    fn input_offset(&self, b: &mut Builder, id: InstrId) -> Def {
        let Some(intr) = b.shader.intrinsic(id) else {
            unreachable!("GS input load {id:?} is not an intrinsic");
        };
        let io = intr.idx.io;
        let component = intr.idx.component as u32;
        let vertex = intr.srcs[0];
        let offset_src = intr.srcs[1];

        let mut vertex_offset = if self.gfx_level >= GfxLevel::Gfx12 {
            self.vertex_offset_gfx12(b, vertex)
        } else if self.gfx_level >= GfxLevel::Gfx9 {
            self.vertex_offset_gfx9(b, vertex)
        } else {
            self.vertex_offset_gfx6(b, vertex)
        };

        // GFX6-8 sizes the ESGS ring from VGT_ESGS_RING_ITEMSIZE, so the stride can't be
        // applied here.
        if self.gfx_level >= GfxLevel::Gfx9 {
            let stride = b.load_sysval(Intrinsic::LoadEsgsVertexStrideAmd);
            vertex_offset = b.imul(vertex_offset, stride);
        }

        // The GFX6-8 ring is interleaved per 64-lane wave.
        let base_stride = if self.gfx_level >= GfxLevel::Gfx9 { 1 } else { 64 };
        let mapped = map_io_location(io.location, self.inputs_read, self.map_io);
        let stride = b.imm_u32(base_stride * 4);
        let io_off = calc_io_offset(b, component, offset_src, stride, base_stride, mapped);
        let off = b.iadd(io_off, vertex_offset);
        b.imul_imm(off, 4)
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

        let off = self.input_offset(b, id);
        let load = if self.gfx_level >= GfxLevel::Gfx9 {
            load_io(b, num_components, bit_size, hi_16bit, |b, n, bits| {
                b.intrinsic(Intrinsic::LoadShared)
                    .src(off)
                    .align(bits as u32 / 8, 0)
                    .def(n, bits)
            })
        } else {
            load_io(b, num_components, bit_size, hi_16bit, |b, n, bits| {
                let ring = b.load_sysval(Intrinsic::LoadRingEsgsAmd);
                let zero = b.imm_int(0);
                emit_split_buffer_load(b, n, bits, 4 * 64, ring, off, zero)
            })
        };
        Lowered::Replace(load)
    }
}

/// Rewrites GS `load_per_vertex_input`s into LDS loads (GFX9+) or ESGS ring loads (GFX6-8).
pub fn lower_gs_inputs_to_mem(shader: &mut Shader, options: &GsInputsOptions<'_>) -> Result<bool, ConfigError> {
    let gfx_level = options.validate()?;
    let state = GsInputState {
        gfx_level,
        triangle_strip_adjacency_fix: options.triangle_strip_adjacency_fix,
        vertices_in: shader.info.gs.vertices_in as u32,
        inputs_read: shader.info.inputs_read,
        map_io: options.map_io,
    };
    let progress = nir::lower_instructions(
        shader,
        |s, id| s.intrinsic(id).is_some_and(|i| i.op == Intrinsic::LoadPerVertexInput),
        |b, id| state.lower(b, id),
    );
    debug!(%gfx_level, vertices_in = state.vertices_in, progress, "lowered GS inputs");
    Ok(progress)
}
