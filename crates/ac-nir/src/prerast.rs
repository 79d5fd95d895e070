//! Output table of the last pre-rasterization stage and the exports built from it.
//!
//! `store_output` intrinsics are folded into a dense `[slot][component]` table by
//! [`gather_store_output`]. The epilogues then read the table back to emit position, parameter
//! and primitive exports, attribute ring stores, GS ring stores and streamout.

use std::fmt;

use nir::varying::{
    self, BFC0, CLIP_DIST0, CLIP_VERTEX, COL0, EDGE, LAYER, POS, PRIMITIVE_SHADING_RATE, PSIZ,
    VAR0_16BIT, VIEWPORT,
};
use nir::{
    Access, AluType, Builder, Cursor, Def, InstrId, Intrinsic, MemoryModes, MemorySemantics,
    Scope, Stage, VarId, XfbInfo,
};
use tracing::trace;

use crate::gfx::GfxLevel;
use crate::hw::{
    EXP_FLAG_DONE, EXP_FLAG_VALID_MASK, EXP_PARAM_OFFSET_31, EXP_PARAM_UNDEFINED, SQ_EXP_PARAM,
    SQ_EXP_POS, SQ_EXP_PRIM,
};

pub const NUM_SLOTS: usize = varying::NUM_SLOTS;
pub const NUM_16BIT_SLOTS: usize = varying::NUM_16BIT_SLOTS;

/// Bytes of one parameter (a vec4) in the attribute ring.
const ATTR_RING_PARAM_BYTES: i32 = 16;

macro_rules! bitfields {
    ($ty:ident { $($(#[$meta:meta])* $get:ident, $set:ident: $field:ty = [$shift:expr; $bits:expr];)* }) => {
        impl $ty {
            $(
                $(#[$meta])*
                pub fn $get(&self) -> $field {
                    ((self.0 >> $shift) & ((1u64 << $bits) - 1)) as $field
                }

                pub fn $set(&mut self, value: $field) {
                    let mask = ((1u64 << $bits) - 1) << $shift;
                    debug_assert!(
                        (value as u64) < (1u64 << $bits),
                        concat!(stringify!($get), " does not fit in ", stringify!($bits), " bits")
                    );
                    self.0 = (self.0 & !mask) | (((value as u64) << $shift) & mask);
                }
            )*
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    $(.field(stringify!($get), &self.$get()))*
                    .finish()
            }
        }
    };
}

/// Per-slot usage record, packed into one integer.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PerOutputInfo(u64);

bitfields!(PerOutputInfo {
    /// GS vertex stream of each component, 2 bits per component.
    stream, set_stream: u8 = [0; 8];
    /// Components written by any store.
    components_mask, set_components_mask: u8 = [8; 4];
    /// Components consumed by the next stage as varyings.
    as_varying_mask, set_as_varying_mask: u8 = [12; 4];
    /// Components consumed by fixed-function hardware.
    as_sysval_mask, set_as_sysval_mask: u8 = [16; 4];
    /// Components captured by transform feedback.
    xfb_lds_components_mask, set_xfb_lds_components_mask: u8 = [20; 4];
    /// Components that every store wrote with the same constant.
    const_mask, set_const_mask: u8 = [24; 4];
    nonconst_mask, set_nonconst_mask: u8 = [28; 4];
    /// Dword offset of the slot among the non-constant GS outputs.
    packed_slot_gs_out_offset, set_packed_slot_gs_out_offset: u16 = [32; 12];
    /// Dword offset of the slot among the transform feedback outputs.
    packed_slot_xfb_lds_offset, set_packed_slot_xfb_lds_offset: u16 = [44; 12];
});

impl PerOutputInfo {
    pub fn stream_of(&self, component: u32) -> u32 {
        (self.stream() as u32 >> (component * 2)) & 0x3
    }

    fn mark_constant(&mut self, component: u32, value: Option<u32>, consts: &mut [u32; 4]) {
        let bit = 1u8 << component;
        match value {
            _ if self.nonconst_mask() & bit != 0 => {}
            Some(v) if self.const_mask() & bit == 0 => {
                self.set_const_mask(self.const_mask() | bit);
                consts[component as usize] = v;
            }
            Some(v) if consts[component as usize] == v => {}
            _ => {
                self.set_const_mask(self.const_mask() & !bit);
                self.set_nonconst_mask(self.nonconst_mask() | bit);
            }
        }
    }
}

/// Components of `info` that belong to `stream`.
pub fn gs_output_component_mask_with_stream(info: &PerOutputInfo, stream: u32) -> u8 {
    let mut mask = 0;
    for c in 0..4 {
        if info.components_mask() & (1 << c) != 0 && info.stream_of(c) == stream {
            mask |= 1 << c;
        }
    }
    mask
}

/// The output table.
///
/// Slots below [`VAR0_16BIT`] live in `outputs`. A 16-bit value stored to such a slot is packed
/// with the other half into a 32-bit lane. Dedicated 16-bit slots keep their halves apart in the
/// `*_16bit_lo`/`*_16bit_hi` arrays.
#[derive(Debug, Clone)]
pub struct PrerastOut {
    pub outputs: [[Option<Def>; 4]; NUM_SLOTS],
    pub types: [[AluType; 4]; NUM_SLOTS],
    pub infos: [PerOutputInfo; NUM_SLOTS],
    pub const_values: [[u32; 4]; NUM_SLOTS],

    pub outputs_16bit_lo: [[Option<Def>; 4]; NUM_16BIT_SLOTS],
    pub outputs_16bit_hi: [[Option<Def>; 4]; NUM_16BIT_SLOTS],
    pub types_16bit_lo: [[AluType; 4]; NUM_16BIT_SLOTS],
    pub types_16bit_hi: [[AluType; 4]; NUM_16BIT_SLOTS],
    pub infos_16bit_lo: [PerOutputInfo; NUM_16BIT_SLOTS],
    pub infos_16bit_hi: [PerOutputInfo; NUM_16BIT_SLOTS],
    pub const_values_16bit_lo: [[u32; 4]; NUM_16BIT_SLOTS],
    pub const_values_16bit_hi: [[u32; 4]; NUM_16BIT_SLOTS],

    /// Dwords per vertex of the non-constant GS outputs, all streams.
    pub total_packed_gs_out_size: u16,
    pub total_packed_xfb_lds_size: u16,
}

impl Default for PrerastOut {
    fn default() -> Self {
        Self {
            outputs: [[None; 4]; NUM_SLOTS],
            types: [[AluType::INVALID; 4]; NUM_SLOTS],
            infos: [PerOutputInfo::default(); NUM_SLOTS],
            const_values: [[0; 4]; NUM_SLOTS],
            outputs_16bit_lo: [[None; 4]; NUM_16BIT_SLOTS],
            outputs_16bit_hi: [[None; 4]; NUM_16BIT_SLOTS],
            types_16bit_lo: [[AluType::INVALID; 4]; NUM_16BIT_SLOTS],
            types_16bit_hi: [[AluType::INVALID; 4]; NUM_16BIT_SLOTS],
            infos_16bit_lo: [PerOutputInfo::default(); NUM_16BIT_SLOTS],
            infos_16bit_hi: [PerOutputInfo::default(); NUM_16BIT_SLOTS],
            const_values_16bit_lo: [[0; 4]; NUM_16BIT_SLOTS],
            const_values_16bit_hi: [[0; 4]; NUM_16BIT_SLOTS],
            total_packed_gs_out_size: 0,
            total_packed_xfb_lds_size: 0,
        }
    }
}

struct SlotMut<'a> {
    outputs: &'a mut [Option<Def>; 4],
    types: &'a mut [AluType; 4],
    info: &'a mut PerOutputInfo,
    consts: &'a mut [u32; 4],
}

impl PrerastOut {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, slot: u32, high_16bits: bool) -> SlotMut<'_> {
        if slot >= VAR0_16BIT {
            let i = (slot - VAR0_16BIT) as usize;
            if high_16bits {
                SlotMut {
                    outputs: &mut self.outputs_16bit_hi[i],
                    types: &mut self.types_16bit_hi[i],
                    info: &mut self.infos_16bit_hi[i],
                    consts: &mut self.const_values_16bit_hi[i],
                }
            } else {
                SlotMut {
                    outputs: &mut self.outputs_16bit_lo[i],
                    types: &mut self.types_16bit_lo[i],
                    info: &mut self.infos_16bit_lo[i],
                    consts: &mut self.const_values_16bit_lo[i],
                }
            }
        } else {
            let i = slot as usize;
            assert!(i < NUM_SLOTS, "slot {slot} is not a pre-rasterization output");
            SlotMut {
                outputs: &mut self.outputs[i],
                types: &mut self.types[i],
                info: &mut self.infos[i],
                consts: &mut self.const_values[i],
            }
        }
    }

    /// Value currently recorded for a slot/component; 16-bit slots select the half.
    pub fn output(&self, slot: u32, high_16bits: bool, component: u32) -> Option<Def> {
        let c = component as usize;
        if slot >= VAR0_16BIT {
            let i = (slot - VAR0_16BIT) as usize;
            if high_16bits {
                self.outputs_16bit_hi[i][c]
            } else {
                self.outputs_16bit_lo[i][c]
            }
        } else {
            self.outputs[slot as usize][c]
        }
    }

    /// Whether every store to the slot component wrote the same constant.
    ///
    /// A dedicated 16-bit slot is constant when each written half is.
    pub fn is_const_output(&self, slot: u32, component: u32) -> bool {
        let bit = 1u8 << component;
        if slot >= VAR0_16BIT {
            let i = (slot - VAR0_16BIT) as usize;
            let (lo, hi) = (&self.infos_16bit_lo[i], &self.infos_16bit_hi[i]);
            let written_lo = lo.components_mask() & bit != 0;
            let written_hi = hi.components_mask() & bit != 0;
            (written_lo || written_hi)
                && (!written_lo || lo.const_mask() & bit != 0)
                && (!written_hi || hi.const_mask() & bit != 0)
        } else {
            self.infos[slot as usize].const_mask() & bit != 0
        }
    }

    /// The constant of a constant output. Dedicated 16-bit slots return both halves packed.
    pub fn get_const_output(&self, slot: u32, component: u32) -> u32 {
        debug_assert!(self.is_const_output(slot, component));
        let c = component as usize;
        if slot >= VAR0_16BIT {
            let i = (slot - VAR0_16BIT) as usize;
            let lo = self.const_values_16bit_lo[i][c] & 0xffff;
            let hi = self.const_values_16bit_hi[i][c] & 0xffff;
            (hi << 16) | lo
        } else {
            self.const_values[slot as usize][c]
        }
    }

    /// Forgets all recorded values, keeping the usage information.
    pub fn clear_values(&mut self, slot: u32) {
        if slot >= VAR0_16BIT {
            let i = (slot - VAR0_16BIT) as usize;
            self.outputs_16bit_lo[i] = [None; 4];
            self.outputs_16bit_hi[i] = [None; 4];
        } else {
            self.outputs[slot as usize] = [None; 4];
        }
    }

    /// Assigns packed dword offsets to every written slot.
    ///
    /// GS offsets count the non-constant components; transform feedback offsets count the
    /// components captured by `xfb`.
    pub fn compute_packed_output_info(&mut self, xfb: Option<&XfbInfo>) {
        if let Some(xfb) = xfb {
            for output in &xfb.outputs {
                let info = self.slot_mut(output.location as u32, output.high_16bits).info;
                let mask = info.xfb_lds_components_mask() | output.component_mask;
                info.set_xfb_lds_components_mask(mask & 0xf);
            }
        }

        let mut gs_out = 0u16;
        let mut xfb_lds = 0u16;
        for info in self.infos.iter_mut() {
            if info.components_mask() == 0 {
                continue;
            }
            info.set_packed_slot_gs_out_offset(gs_out);
            info.set_packed_slot_xfb_lds_offset(xfb_lds);
            gs_out += (info.components_mask() & !info.const_mask()).count_ones() as u16;
            xfb_lds += info.xfb_lds_components_mask().count_ones() as u16;
        }
        for i in 0..NUM_16BIT_SLOTS {
            let mask = self.infos_16bit_lo[i].components_mask() | self.infos_16bit_hi[i].components_mask();
            if mask == 0 {
                continue;
            }
            let slot = VAR0_16BIT + i as u32;
            let nonconst = (0..4u32)
                .filter(|&c| mask & (1 << c) != 0 && !self.is_const_output(slot, c))
                .count() as u16;
            let xfb_mask =
                self.infos_16bit_lo[i].xfb_lds_components_mask() | self.infos_16bit_hi[i].xfb_lds_components_mask();
            for info in [&mut self.infos_16bit_lo[i], &mut self.infos_16bit_hi[i]] {
                info.set_packed_slot_gs_out_offset(gs_out);
                info.set_packed_slot_xfb_lds_offset(xfb_lds);
            }
            gs_out += nonconst;
            xfb_lds += xfb_mask.count_ones() as u16;
        }
        self.total_packed_gs_out_size = gs_out;
        self.total_packed_xfb_lds_size = xfb_lds;
    }
}

/// Records one `store_output` in the table. The caller removes the store afterwards.
///
/// With `gather_values == false` only the usage information is updated and no instruction is
/// emitted.
pub fn gather_store_output(b: &mut Builder, out: &mut PrerastOut, store: InstrId, gather_values: bool) {
    let Some(intr) = b.shader.intrinsic(store) else {
        panic!("{store:?} is not an intrinsic");
    };
    assert_eq!(intr.op, Intrinsic::StoreOutput, "only store_output can be gathered");
    assert_eq!(
        b.shader.const_u32(intr.srcs[1]),
        Some(0),
        "indirect output stores must be lowered before gathering"
    );
    let value = intr.srcs[0];
    let io = intr.idx.io;
    let component_offset = intr.idx.component as u32;
    let write_mask = intr.idx.write_mask;
    let src_type = intr.idx.src_type;
    let slot = io.location;

    let bit_size = b.bit_size(value);
    assert!(bit_size == 16 || bit_size == 32, "{bit_size}-bit outputs must be lowered first");
    assert_eq!(src_type.bit_size, bit_size, "store_output src_type disagrees with its value");

    b.set_cursor(Cursor::Before(store));

    let is_gs = b.shader.stage() == Stage::Geometry;
    let active_stream_mask = b.shader.info.gs.active_stream_mask as u32;
    // A 16-bit value in a slot that isn't a dedicated 16-bit slot.
    let non_dedicated_16bit = slot < VAR0_16BIT && bit_size == 16;

    for i in 0..4u32 {
        if write_mask & (1 << i) == 0 {
            continue;
        }
        let stream = (io.gs_streams as u32 >> (i * 2)) & 0x3;
        if is_gs && active_stream_mask & (1 << stream) == 0 {
            continue;
        }
        let c = component_offset + i;
        let bit = 1u8 << c;

        let (stored, ty, const_value) = if !gather_values {
            let constant = if non_dedicated_16bit {
                None
            } else {
                b.shader.const_component(value, i as usize).map(|v| v as u32)
            };
            (None, src_type, constant)
        } else {
            let comp = b.channel(value, i as u8);
            if non_dedicated_16bit {
                let prev = out.slot_mut(slot, false).outputs[c as usize];
                let packed = if io.high_16bits {
                    let lo = match prev {
                        Some(p) => b.unpack_32_2x16_split_x(p),
                        None => b.imm_intn(0, 16),
                    };
                    b.pack_32_2x16_split(lo, comp)
                } else {
                    let hi = match prev {
                        Some(p) => b.unpack_32_2x16_split_y(p),
                        None => b.imm_intn(0, 16),
                    };
                    b.pack_32_2x16_split(comp, hi)
                };
                (Some(packed), AluType::UINT32, b.shader.const_u32(packed))
            } else {
                (Some(comp), src_type, b.shader.const_u32(comp))
            }
        };

        let entry = out.slot_mut(slot, io.high_16bits && !non_dedicated_16bit);
        let info = entry.info;

        assert!(
            info.components_mask() & bit == 0 || info.stream_of(c) == stream,
            "component {c} of slot {slot} is written to streams {} and {stream}",
            info.stream_of(c)
        );
        info.set_stream(info.stream() | (stream << (c * 2)) as u8);
        info.set_components_mask(info.components_mask() | bit);
        if !io.no_varying {
            info.set_as_varying_mask(info.as_varying_mask() | bit);
        }
        if !io.no_sysval_output {
            info.set_as_sysval_mask(info.as_sysval_mask() | bit);
        }

        if non_dedicated_16bit && gather_values {
            // The packed value already includes the other half.
            info.set_const_mask(info.const_mask() & !bit);
            info.set_nonconst_mask(info.nonconst_mask() & !bit);
        }
        info.mark_constant(c, const_value, entry.consts);

        if let Some(stored) = stored {
            entry.outputs[c as usize] = Some(stored);
            entry.types[c as usize] = ty;
        }
    }
}

fn export(b: &mut Builder, value: Def, row: Option<Def>, base: u32, flags: u32, write_mask: u32) -> InstrId {
    match row {
        Some(row) => b
            .intrinsic(Intrinsic::ExportRowAmd)
            .src(value)
            .src(row)
            .base(base as i32)
            .flags(flags)
            .write_mask(write_mask)
            .emit(),
        None => b
            .intrinsic(Intrinsic::ExportAmd)
            .src(value)
            .base(base as i32)
            .flags(flags)
            .write_mask(write_mask)
            .emit(),
    }
}

/// Exports the primitive connectivity of an NGG primitive thread; always the last export.
pub fn export_primitive(b: &mut Builder, prim: Def, row: Option<Def>) -> InstrId {
    let write_mask = (1u32 << b.num_components(prim)) - 1;
    let prim = b.pad_vec4(prim);
    export(b, prim, row, SQ_EXP_PRIM, EXP_FLAG_DONE, write_mask)
}

fn get_export_output(b: &mut Builder, output: &[Option<Def>; 4]) -> Def {
    let comps: Vec<Def> = output
        .iter()
        .map(|o| match *o {
            Some(v) => b.u2u32(v),
            None => b.undef(1, 32),
        })
        .collect();
    b.vec(&comps)
}

/// Position with unwritten components defaulting to `(0, 0, 0, 1)`.
fn get_pos0_output(b: &mut Builder, output: &[Option<Def>; 4]) -> Def {
    let comps: Vec<Def> = output
        .iter()
        .enumerate()
        .map(|(i, o)| match *o {
            Some(v) => b.u2u32(v),
            None => b.imm_float(if i == 3 { 1.0 } else { 0.0 }),
        })
        .collect();
    b.vec(&comps)
}

/// Parameters of [`export_position`].
#[derive(Debug, Clone, Copy)]
pub struct PositionExport {
    pub gfx_level: GfxLevel,
    /// Enabled clip/cull distances, one bit per distance.
    pub clip_cull_mask: u8,
    /// No parameter export follows the position exports.
    pub no_param_export: bool,
    /// Derive a coarse shading rate from `pos.w` when the shader doesn't write one.
    pub force_vrs: bool,
    /// Set DONE on the last position export.
    pub done: bool,
}

/// Emits the position exports and returns them in order.
pub fn export_position(
    b: &mut Builder,
    opts: &PositionExport,
    mut outputs_written: u64,
    out: &PrerastOut,
    row: Option<Def>,
) -> Vec<InstrId> {
    let mut exports: Vec<InstrId> = Vec::with_capacity(4);
    let mut pos_offset = 0u32;

    if outputs_written & varying::bit(POS) != 0 {
        // GFX10 skips POS0 exports with EXEC=0 and DONE=0 and hangs; VALID_MASK avoids it.
        let flags = if opts.gfx_level == GfxLevel::Gfx10 {
            EXP_FLAG_VALID_MASK
        } else {
            0
        };
        let pos = get_pos0_output(b, &out.outputs[POS as usize]);
        exports.push(export(b, pos, row, SQ_EXP_POS, flags, 0xf));
    } else {
        pos_offset += 1;
    }

    let misc_mask = varying::bit(PSIZ)
        | varying::bit(EDGE)
        | varying::bit(LAYER)
        | varying::bit(VIEWPORT)
        | varying::bit(PRIMITIVE_SHADING_RATE);
    for slot in [PSIZ, EDGE, PRIMITIVE_SHADING_RATE, LAYER, VIEWPORT] {
        let s = slot as usize;
        if out.outputs[s][0].is_none() || out.infos[s].as_sysval_mask() == 0 {
            outputs_written &= !varying::bit(slot);
        }
    }
    let written = |slot: u32| outputs_written & varying::bit(slot) != 0;
    let first = |slot: u32| out.outputs[slot as usize][0];

    if outputs_written & misc_mask != 0 || opts.force_vrs {
        let zero = b.imm_float(0.0);
        let mut vec = [zero; 4];
        let mut write_mask = 0u32;

        if let Some(psiz) = first(PSIZ).filter(|_| written(PSIZ)) {
            vec[0] = psiz;
            write_mask |= 1 << 0;
        }
        if let Some(edge) = first(EDGE).filter(|_| written(EDGE)) {
            let one = b.imm_int(1);
            vec[1] = b.umin(edge, one);
            write_mask |= 1 << 1;
        }

        let rates = if let Some(rate) = first(PRIMITIVE_SHADING_RATE).filter(|_| written(PRIMITIVE_SHADING_RATE)) {
            Some(rate)
        } else if opts.force_vrs {
            // Pos.W != 1 is typical for non-GUI elements, which get coarse shading.
            let pos_w = match out.outputs[POS as usize][3] {
                Some(w) => b.u2u32(w),
                None => b.imm_float(1.0),
            };
            let cond = b.fneu_imm(pos_w, 1.0);
            let forced = b.load_sysval(Intrinsic::LoadForceVrsRatesAmd);
            let none = b.imm_int(0);
            Some(b.bcsel(cond, forced, none))
        } else {
            None
        };
        if let Some(rates) = rates {
            vec[1] = b.ior(vec[1], rates);
            write_mask |= 1 << 1;
        }

        if let Some(layer) = first(LAYER).filter(|_| written(LAYER)) {
            vec[2] = layer;
            write_mask |= 1 << 2;
        }
        if let Some(viewport) = first(VIEWPORT).filter(|_| written(VIEWPORT)) {
            if opts.gfx_level >= GfxLevel::Gfx9 {
                // Layer in bits 0-15, viewport index in bits 16-31.
                let v = b.ishl_imm(viewport, 16);
                vec[2] = b.ior(vec[2], v);
                write_mask |= 1 << 2;
            } else {
                vec[3] = viewport;
                write_mask |= 1 << 3;
            }
        }

        let value = b.vec(&vec);
        let base = SQ_EXP_POS + exports.len() as u32 + pos_offset;
        exports.push(export(b, value, row, base, 0, write_mask));
    }

    let clip_cull_mask = opts.clip_cull_mask as u32;
    for i in 0..2u32 {
        if written(CLIP_DIST0 + i) && clip_cull_mask & (0xf << (i * 4)) != 0 {
            let value = get_export_output(b, &out.outputs[(CLIP_DIST0 + i) as usize]);
            let base = SQ_EXP_POS + exports.len() as u32 + pos_offset;
            exports.push(export(b, value, row, base, 0, (clip_cull_mask >> (i * 4)) & 0xf));
        }
    }

    if written(CLIP_VERTEX) {
        let vtx = get_export_output(b, &out.outputs[CLIP_VERTEX as usize]);
        let mut clip_dist = [None; 8];
        for (i, dist) in clip_dist.iter_mut().enumerate() {
            if clip_cull_mask & (1 << i) != 0 {
                let ucp = b.intrinsic(Intrinsic::LoadUserClipPlane).ucp_id(i as u32).sysval();
                *dist = Some(b.fdot4(vtx, ucp));
            }
        }
        for i in 0..2u32 {
            if clip_cull_mask & (0xf << (i * 4)) != 0 {
                let mut group = [None; 4];
                group.copy_from_slice(&clip_dist[(i * 4) as usize..(i * 4 + 4) as usize]);
                let value = get_export_output(b, &group);
                let base = SQ_EXP_POS + exports.len() as u32 + pos_offset;
                exports.push(export(b, value, row, base, 0, (clip_cull_mask >> (i * 4)) & 0xf));
            }
        }
    }

    let Some(&last) = exports.last() else {
        return exports;
    };

    if opts.done {
        if let Some(intr) = b.shader.intrinsic_mut(last) {
            intr.idx.flags |= EXP_FLAG_DONE;
        }
    }

    // Without param exports rasterization may start before memory stores complete.
    if opts.gfx_level >= GfxLevel::Gfx10 && opts.no_param_export && b.shader.info.writes_memory {
        let cursor = b.cursor;
        b.set_cursor(Cursor::Before(last));
        b.barrier(
            Scope::None,
            Scope::Device,
            MemorySemantics::RELEASE,
            MemoryModes::SSBO | MemoryModes::GLOBAL | MemoryModes::IMAGE,
        );
        b.set_cursor(cursor);
    }

    exports
}

fn param_offset(param_offsets: &[u8], slot: u32) -> u32 {
    param_offsets
        .get(slot as usize)
        .copied()
        .unwrap_or(EXP_PARAM_UNDEFINED) as u32
}

/// Attribute ring index of `slot`, if it has one of the 32 ring parameters.
fn attr_ring_param(param_offsets: &[u8], slot: u32) -> Option<u8> {
    let param = param_offsets.get(slot as usize).copied()?;
    (param <= EXP_PARAM_OFFSET_31).then_some(param)
}

fn pack_16bit_halves(b: &mut Builder, out: &PrerastOut, index: usize) -> Def {
    let undef = b.undef(1, 16);
    let comps: Vec<Def> = (0..4)
        .map(|c| {
            let lo = out.outputs_16bit_lo[index][c].unwrap_or(undef);
            let hi = out.outputs_16bit_hi[index][c].unwrap_or(undef);
            b.pack_32_2x16_split(lo, hi)
        })
        .collect();
    b.vec(&comps)
}

/// Emits one parameter export per distinct parameter index.
///
/// `param_offsets` maps varying slots to parameter indices; several slots may share one index,
/// in which case only the first is exported.
pub fn export_parameters(
    b: &mut Builder,
    param_offsets: &[u8],
    outputs_written: u64,
    outputs_written_16bit: u16,
    out: &PrerastOut,
) -> u32 {
    let mut exported_params = 0u32;

    for slot in BitIter(outputs_written) {
        let offset = param_offset(param_offsets, slot);
        if offset > EXP_PARAM_OFFSET_31 as u32 {
            continue;
        }
        let s = slot as usize;
        let write_mask = (0..4)
            .filter(|&c| out.outputs[s][c].is_some())
            .fold(0u32, |m, c| m | (out.infos[s].as_varying_mask() as u32 & (1 << c)));
        if write_mask == 0 {
            trace!(slot = %varying::name(slot), "no varying components, skipping param export");
            continue;
        }
        if exported_params & (1 << offset) != 0 {
            continue;
        }
        let value = get_export_output(b, &out.outputs[s]);
        export(b, value, None, SQ_EXP_PARAM + offset, 0, write_mask);
        exported_params |= 1 << offset;
    }

    for i in BitIter(outputs_written_16bit as u64) {
        let offset = param_offset(param_offsets, VAR0_16BIT + i);
        if offset > EXP_PARAM_OFFSET_31 as u32 {
            continue;
        }
        let index = i as usize;
        let write_mask = (0..4)
            .filter(|&c| out.outputs_16bit_lo[index][c].is_some() || out.outputs_16bit_hi[index][c].is_some())
            .fold(0u32, |m, c| m | (1 << c));
        if write_mask == 0 || exported_params & (1 << offset) != 0 {
            continue;
        }
        let value = pack_16bit_halves(b, out, index);
        export(b, value, None, SQ_EXP_PARAM + offset, 0, write_mask);
        exported_params |= 1 << offset;
    }

    exported_params
}

/// Writes the parameters to the attribute ring as one vec4 per parameter and lane.
///
/// Lanes below `num_export_threads` rounded up to a multiple of 8 store, so that whole
/// cache lines are written. `export_tid` replaces the subgroup invocation as lane index.
pub fn store_parameters_to_attr_ring(
    b: &mut Builder,
    param_offsets: &[u8],
    outputs_written: u64,
    outputs_written_16bit: u16,
    out: &PrerastOut,
    export_tid: Option<Def>,
    num_export_threads: Def,
) {
    let attr_rsrc = b.load_sysval(Intrinsic::LoadRingAttrAmd);

    let rounded = b.iadd_imm(num_export_threads, 7);
    let num_export_threads = b.iand_imm(rounded, !7u64);
    let cond = match export_tid {
        None => b
            .intrinsic(Intrinsic::IsSubgroupInvocationLtAmd)
            .src(num_export_threads)
            .sysval(),
        Some(tid) => b.ult(tid, num_export_threads),
    };
    let nif = b.push_if(cond);

    let attr_offset = b.load_sysval(Intrinsic::LoadRingAttrOffsetAmd);
    let vindex = b.load_sysval(Intrinsic::LoadLocalInvocationIndex);
    let voffset = b.imm_int(0);
    let undef = b.undef(1, 32);

    let mut exported_params = 0u32;
    let store = |b: &mut Builder, value: Def, param: u8| {
        b.intrinsic(Intrinsic::StoreBufferAmd)
            .srcs(&[value, attr_rsrc, voffset, attr_offset, vindex])
            .base(i32::from(param) * ATTR_RING_PARAM_BYTES)
            .modes(MemoryModes::SHADER_OUT)
            .access(Access::COHERENT | Access::IS_SWIZZLED)
            .emit();
    };

    for slot in BitIter(outputs_written) {
        let Some(param) = attr_ring_param(param_offsets, slot) else {
            continue;
        };
        let s = slot as usize;
        if out.infos[s].as_varying_mask() == 0 || exported_params & (1 << param) != 0 {
            continue;
        }
        let comps: Vec<Def> = out.outputs[s].iter().map(|o| o.unwrap_or(undef)).collect();
        let value = b.vec(&comps);
        store(b, value, param);
        exported_params |= 1 << param;
    }

    for i in BitIter(outputs_written_16bit as u64) {
        let Some(param) = attr_ring_param(param_offsets, VAR0_16BIT + i) else {
            continue;
        };
        let index = i as usize;
        if (out.infos_16bit_lo[index].as_varying_mask() == 0 && out.infos_16bit_hi[index].as_varying_mask() == 0)
            || exported_params & (1 << param) != 0
        {
            continue;
        }
        let value = pack_16bit_halves(b, out, index);
        store(b, value, param);
        exported_params |= 1 << param;
    }

    b.pop_if(nif);
}

/// Clamps the vertex colour outputs to `[0, 1]` when `load_clamp_vertex_color_amd` is set.
pub fn clamp_vertex_color_outputs(b: &mut Builder, out: &mut PrerastOut) -> bool {
    let colors = varying::bit(COL0) | varying::bit(COL0 + 1) | varying::bit(BFC0) | varying::bit(BFC0 + 1);
    if b.shader.info.outputs_written & colors == 0 {
        return false;
    }

    let slot_of = |i: usize| (if i / 8 == 1 { BFC0 } else { COL0 }) as usize + (i % 8) / 4;
    let mut clamped: [Option<Def>; 16] = [None; 16];

    let cond = b.load_sysval(Intrinsic::LoadClampVertexColorAmd);
    let nif = b.push_if(cond);
    for (i, value) in clamped.iter_mut().enumerate() {
        if let Some(color) = out.outputs[slot_of(i)][i % 4] {
            *value = Some(b.fsat(color));
        }
    }
    b.pop_if(nif);

    for (i, value) in clamped.iter().enumerate() {
        if let (Some(sat), Some(orig)) = (*value, out.outputs[slot_of(i)][i % 4]) {
            out.outputs[slot_of(i)][i % 4] = Some(b.if_phi(sat, orig));
        }
    }
    true
}

/// Stores `value` to components `component..` of a vec4 variable.
pub fn store_var_components(b: &mut Builder, var: VarId, value: Def, component: u32, write_mask: u32) {
    let nc = b.num_components(value) as u32;
    if nc == 4 {
        assert_eq!(component, 0, "a vec4 store has no component offset");
        b.store_var(var, value, write_mask);
        return;
    }

    let undef = b.undef(1, b.bit_size(value));
    let comps: Vec<Def> = (0..4u32)
        .map(|i| {
            if i >= component && i < component + nc {
                b.channel(value, (i - component) as u8)
            } else {
                undef
            }
        })
        .collect();
    let value = b.vec(&comps);
    b.store_var(var, value, write_mask << component);
}

/// Set bits of a mask, lowest first.
pub(crate) struct BitIter(pub u64);

impl Iterator for BitIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nir::{IoSemantics, Shader};
    use pretty_assertions::assert_eq;

    fn store_output(b: &mut Builder, value: Def, location: u32, component: u8, io: IoSemantics) -> InstrId {
        let offset = b.imm_u32(0);
        let bits = b.bit_size(value);
        let nc = b.num_components(value);
        let ty = if bits == 16 { AluType::FLOAT16 } else { AluType::FLOAT32 };
        b.intrinsic(Intrinsic::StoreOutput)
            .src(value)
            .src(offset)
            .component(component)
            .write_mask((1 << nc) - 1)
            .src_type(ty)
            .io(IoSemantics { location, num_slots: 1, ..io })
            .emit()
    }

    fn gather(b: &mut Builder, out: &mut PrerastOut, store: InstrId) {
        gather_store_output(b, out, store, true);
        b.remove(store);
    }

    #[test]
    fn info_packs_named_fields() {
        let mut info = PerOutputInfo::default();
        info.set_stream(0b11_00_10_01);
        info.set_components_mask(0xf);
        info.set_packed_slot_gs_out_offset(0xabc);
        info.set_packed_slot_xfb_lds_offset(0x123);
        assert_eq!(info.stream_of(0), 1);
        assert_eq!(info.stream_of(1), 2);
        assert_eq!(info.stream_of(3), 3);
        assert_eq!(info.packed_slot_gs_out_offset(), 0xabc);
        assert_eq!(info.packed_slot_xfb_lds_offset(), 0x123);
        assert_eq!(info.as_varying_mask(), 0);
        assert_eq!(gs_output_component_mask_with_stream(&info, 2), 0b0010);
    }

    #[test]
    fn sixteen_bit_halves_pack_in_either_order() {
        let mut shader = Shader::new(Stage::Vertex, "pack");
        let mut b = Builder::at_end(&mut shader);
        let mut out = PrerastOut::new();

        let hi = b.imm_intn(0xabcd, 16);
        let s = store_output(&mut b, hi, varying::VAR0 + 1, 2, IoSemantics { high_16bits: true, ..Default::default() });
        gather(&mut b, &mut out, s);
        let lo = b.imm_intn(0x1234, 16);
        let s = store_output(&mut b, lo, varying::VAR0 + 1, 2, IoSemantics::default());
        gather(&mut b, &mut out, s);

        let slot = (varying::VAR0 + 1) as usize;
        let packed = out.outputs[slot][2].unwrap();
        assert_eq!(b.shader.const_u32(packed), Some(0xabcd_1234));
        assert_eq!(out.types[slot][2], AluType::UINT32);
        assert!(out.is_const_output(varying::VAR0 + 1, 2));
        assert_eq!(out.get_const_output(varying::VAR0 + 1, 2), 0xabcd_1234);

        // Only one half written: the other one is zero.
        let lo = b.imm_intn(0x5678, 16);
        let s = store_output(&mut b, lo, varying::VAR0 + 2, 0, IoSemantics::default());
        gather(&mut b, &mut out, s);
        let packed = out.outputs[slot + 1][0].unwrap();
        assert_eq!(b.shader.const_u32(packed), Some(0x0000_5678));
    }

    #[test]
    fn dedicated_16bit_slots_keep_halves_apart() {
        let mut shader = Shader::new(Stage::Vertex, "dedicated");
        let mut b = Builder::at_end(&mut shader);
        let mut out = PrerastOut::new();

        let lo = b.imm_intn(0x1111, 16);
        let s = store_output(&mut b, lo, VAR0_16BIT + 3, 1, IoSemantics::default());
        gather(&mut b, &mut out, s);
        let hi = b.imm_intn(0x2222, 16);
        let s = store_output(&mut b, hi, VAR0_16BIT + 3, 1, IoSemantics { high_16bits: true, ..Default::default() });
        gather(&mut b, &mut out, s);

        assert_eq!(out.outputs_16bit_lo[3][1], Some(lo));
        assert_eq!(out.outputs_16bit_hi[3][1], Some(hi));
        assert_eq!(out.types_16bit_hi[3][1], AluType::FLOAT16);
        assert_eq!(out.get_const_output(VAR0_16BIT + 3, 1), 0x2222_1111);
    }

    #[test]
    fn constant_tracking_needs_identical_stores() {
        let mut shader = Shader::new(Stage::Vertex, "const");
        let mut b = Builder::at_end(&mut shader);
        let mut out = PrerastOut::new();

        let one = b.imm_float(1.0);
        for _ in 0..2 {
            let s = store_output(&mut b, one, varying::VAR0, 0, IoSemantics::default());
            gather(&mut b, &mut out, s);
        }
        assert!(out.is_const_output(varying::VAR0, 0));

        let two = b.imm_float(2.0);
        let s = store_output(&mut b, two, varying::VAR0, 0, IoSemantics::default());
        gather(&mut b, &mut out, s);
        assert!(!out.is_const_output(varying::VAR0, 0));

        // Once non-constant, it stays that way.
        let s = store_output(&mut b, two, varying::VAR0, 0, IoSemantics::default());
        gather(&mut b, &mut out, s);
        assert!(!out.is_const_output(varying::VAR0, 0));
        let slot = varying::VAR0 as usize;
        assert_eq!(out.infos[slot].nonconst_mask(), 0x1);
    }

    #[test]
    #[should_panic(expected = "is written to streams 1 and 2")]
    fn stream_reassignment_is_fatal() {
        let mut shader = Shader::new(Stage::Geometry, "streams");
        shader.info.gs.active_stream_mask = 0b111;
        let mut b = Builder::at_end(&mut shader);
        let mut out = PrerastOut::new();

        let v = b.imm_float(1.0);
        let s = store_output(&mut b, v, varying::VAR0, 0, IoSemantics { gs_streams: 1, ..Default::default() });
        gather(&mut b, &mut out, s);
        let s = store_output(&mut b, v, varying::VAR0, 0, IoSemantics { gs_streams: 2, ..Default::default() });
        gather(&mut b, &mut out, s);
    }

    #[test]
    fn inactive_gs_streams_are_ignored() {
        let mut shader = Shader::new(Stage::Geometry, "inactive");
        shader.info.gs.active_stream_mask = 0b1;
        let mut b = Builder::at_end(&mut shader);
        let mut out = PrerastOut::new();

        let v = b.imm_vec4_f32([1.0, 2.0, 3.0, 4.0]);
        // Components 1 and 3 go to stream 1, which is inactive.
        let s = store_output(&mut b, v, varying::VAR0, 0, IoSemantics { gs_streams: 0b01_00_01_00, ..Default::default() });
        gather(&mut b, &mut out, s);
        assert_eq!(out.infos[varying::VAR0 as usize].components_mask(), 0b0101);
    }

    #[test]
    fn packed_offsets_skip_constant_components() {
        let mut shader = Shader::new(Stage::Geometry, "packed");
        shader.info.gs.active_stream_mask = 0b1;
        let mut b = Builder::at_end(&mut shader);
        let mut out = PrerastOut::new();

        let id = b.load_sysval(Intrinsic::LoadPrimitiveId);
        let pos = b.imm_vec4_f32([0.0, 0.0, 0.0, 1.0]);
        let pos = b.mov_swizzle(pos, &[0, 1, 2]);
        let s = store_output(&mut b, pos, POS, 0, IoSemantics::default());
        gather(&mut b, &mut out, s);
        let pos_w = b.alu(nir::AluOp::Mov, &[id]);
        let s = store_output(&mut b, pos_w, POS, 3, IoSemantics::default());
        gather(&mut b, &mut out, s);
        let s = store_output(&mut b, id, varying::VAR0, 0, IoSemantics::default());
        gather(&mut b, &mut out, s);

        out.compute_packed_output_info(None);
        assert_eq!(out.infos[POS as usize].packed_slot_gs_out_offset(), 0);
        assert_eq!(out.infos[varying::VAR0 as usize].packed_slot_gs_out_offset(), 1);
        assert_eq!(out.total_packed_gs_out_size, 2);
    }

    fn written_out(b: &mut Builder, slots: &[u32]) -> (PrerastOut, u64) {
        let mut out = PrerastOut::new();
        let mut written = 0;
        for &slot in slots {
            let v = b.load_sysval(Intrinsic::LoadPrimitiveId);
            let s = store_output(b, v, slot, 0, IoSemantics::default());
            gather(b, &mut out, s);
            written |= varying::bit(slot);
        }
        (out, written)
    }

    fn export_bases(shader: &Shader) -> Vec<(i32, u32, u32)> {
        shader
            .find_intrinsics(Intrinsic::ExportAmd)
            .into_iter()
            .map(|id| {
                let idx = &shader.intrinsic(id).unwrap().idx;
                (idx.base, idx.flags, idx.write_mask)
            })
            .collect()
    }

    #[test]
    fn position_exports_are_ordered_and_done_lands_last() {
        let mut shader = Shader::new(Stage::Vertex, "pos");
        let mut b = Builder::at_end(&mut shader);
        let (out, written) = written_out(&mut b, &[POS, PSIZ, CLIP_DIST0, varying::CLIP_DIST1]);

        let opts = PositionExport {
            gfx_level: GfxLevel::Gfx10,
            clip_cull_mask: 0x31,
            no_param_export: false,
            force_vrs: false,
            done: true,
        };
        let exports = export_position(&mut b, &opts, written, &out, None);
        assert_eq!(exports.len(), 4);
        assert_eq!(
            export_bases(&shader),
            vec![
                (SQ_EXP_POS as i32, EXP_FLAG_VALID_MASK, 0xf),
                (SQ_EXP_POS as i32 + 1, 0, 0x1),
                (SQ_EXP_POS as i32 + 2, 0, 0x1),
                (SQ_EXP_POS as i32 + 3, EXP_FLAG_DONE, 0x3),
            ]
        );
    }

    #[test]
    fn unwritten_position_shifts_the_export_index() {
        let mut shader = Shader::new(Stage::Vertex, "nopos");
        shader.info.writes_memory = true;
        let mut b = Builder::at_end(&mut shader);
        let (out, written) = written_out(&mut b, &[LAYER]);

        let opts = PositionExport {
            gfx_level: GfxLevel::Gfx11,
            clip_cull_mask: 0,
            no_param_export: true,
            force_vrs: false,
            done: true,
        };
        let exports = export_position(&mut b, &opts, written, &out, None);
        assert_eq!(exports.len(), 1);
        assert_eq!(
            export_bases(&shader),
            vec![(SQ_EXP_POS as i32 + 1, EXP_FLAG_DONE, 0x4)]
        );

        // The release barrier sits right before the final export.
        let order = shader.instrs_in_order();
        let at = order.iter().position(|&i| i == exports[0]).unwrap();
        let barrier = shader.intrinsic(order[at - 1]).unwrap();
        assert_eq!(barrier.op, Intrinsic::Barrier);
        assert_eq!(barrier.idx.memory_semantics, MemorySemantics::RELEASE);
        assert_eq!(barrier.idx.memory_scope, Scope::Device);
    }

    #[test]
    fn misc_outputs_without_sysval_use_are_dropped() {
        let mut shader = Shader::new(Stage::Vertex, "misc");
        let mut b = Builder::at_end(&mut shader);
        let mut out = PrerastOut::new();
        let v = b.imm_float(4.0);
        let s = store_output(&mut b, v, PSIZ, 0, IoSemantics { no_sysval_output: true, ..Default::default() });
        gather(&mut b, &mut out, s);

        let opts = PositionExport {
            gfx_level: GfxLevel::Gfx9,
            clip_cull_mask: 0,
            no_param_export: false,
            force_vrs: false,
            done: true,
        };
        let exports = export_position(&mut b, &opts, varying::bit(PSIZ), &out, None);
        assert!(exports.is_empty());
        assert_eq!(shader.count_intrinsics(Intrinsic::ExportAmd), 0);
    }

    #[test]
    fn viewport_packing_depends_on_generation() {
        for (gfx_level, mask) in [(GfxLevel::Gfx8, 0xc), (GfxLevel::Gfx9, 0x4)] {
            let mut shader = Shader::new(Stage::Vertex, "vp");
            let mut b = Builder::at_end(&mut shader);
            let (out, written) = written_out(&mut b, &[LAYER, VIEWPORT]);
            let opts = PositionExport {
                gfx_level,
                clip_cull_mask: 0,
                no_param_export: false,
                force_vrs: false,
                done: false,
            };
            export_position(&mut b, &opts, written, &out, None);
            assert_eq!(export_bases(&shader), vec![(SQ_EXP_POS as i32 + 1, 0, mask)]);
        }
    }

    #[test]
    fn clip_vertex_becomes_user_plane_distances() {
        let mut shader = Shader::new(Stage::Vertex, "ucp");
        let mut b = Builder::at_end(&mut shader);
        let (out, written) = written_out(&mut b, &[POS, CLIP_VERTEX]);
        let opts = PositionExport {
            gfx_level: GfxLevel::Gfx10_3,
            clip_cull_mask: 0b0001_0011,
            no_param_export: false,
            force_vrs: false,
            done: true,
        };
        let exports = export_position(&mut b, &opts, written, &out, None);
        assert_eq!(exports.len(), 3);
        assert_eq!(shader.count_intrinsics(Intrinsic::LoadUserClipPlane), 3);
        let last = shader.intrinsic(exports[2]).unwrap();
        assert_eq!(last.idx.write_mask, 0x1);
        assert_eq!(last.idx.flags, EXP_FLAG_DONE);
    }

    #[test]
    fn aliased_param_slots_export_once() {
        let mut shader = Shader::new(Stage::Vertex, "params");
        let mut b = Builder::at_end(&mut shader);
        let (out, written) = written_out(&mut b, &[varying::VAR0, varying::VAR0 + 1, varying::VAR0 + 2]);

        let mut offsets = [EXP_PARAM_UNDEFINED; varying::NUM_TOTAL_SLOTS as usize];
        offsets[varying::VAR0 as usize] = 0;
        offsets[varying::VAR0 as usize + 1] = 0;
        offsets[varying::VAR0 as usize + 2] = 3;
        let exported = export_parameters(&mut b, &offsets, written, 0, &out);
        assert_eq!(exported, 0b1001);
        assert_eq!(
            export_bases(&shader),
            vec![(SQ_EXP_PARAM as i32, 0, 0x1), (SQ_EXP_PARAM as i32 + 3, 0, 0x1)]
        );
    }

    #[test]
    fn attr_ring_rounds_thread_count_to_eight() {
        let mut shader = Shader::new(Stage::Vertex, "attr");
        let mut b = Builder::at_end(&mut shader);
        let (out, written) = written_out(&mut b, &[varying::VAR0]);
        let mut offsets = [EXP_PARAM_UNDEFINED; varying::NUM_TOTAL_SLOTS as usize];
        offsets[varying::VAR0 as usize] = 2;

        let n = b.imm_u32(13);
        let tid = b.load_sysval(Intrinsic::LoadLocalInvocationIndex);
        store_parameters_to_attr_ring(&mut b, &offsets, written, 0, &out, Some(tid), n);

        let stores = shader.find_intrinsics(Intrinsic::StoreBufferAmd);
        assert_eq!(stores.len(), 1);
        let store = shader.intrinsic(stores[0]).unwrap();
        assert_eq!(store.idx.base, 32);
        assert_eq!(store.idx.access, Access::COHERENT | Access::IS_SWIZZLED);
        let block = shader.instr(stores[0]).block;
        assert!(shader.is_nested(block));
        let cmp = shader
            .instrs_in_order()
            .into_iter()
            .filter_map(|id| shader.instr(id).as_alu().map(|alu| (id, alu.op)))
            .find(|(_, op)| *op == nir::AluOp::Ult)
            .map(|(id, _)| shader.instr(id).srcs()[1])
            .unwrap();
        assert_eq!(shader.const_u32(cmp), Some(16));
    }

    #[test]
    fn attr_ring_holds_parameters_up_to_31() {
        let mut shader = Shader::new(Stage::Vertex, "attr");
        let mut b = Builder::at_end(&mut shader);
        let slots = [varying::VAR0, varying::VAR0 + 1, varying::VAR0 + 2];
        let (out, written) = written_out(&mut b, &slots);
        let mut offsets = [EXP_PARAM_UNDEFINED; varying::NUM_TOTAL_SLOTS as usize];
        offsets[varying::VAR0 as usize] = EXP_PARAM_OFFSET_31;
        offsets[varying::VAR0 as usize + 1] = EXP_PARAM_OFFSET_31 + 1;

        let n = b.imm_u32(64);
        store_parameters_to_attr_ring(&mut b, &offsets, written, 0, &out, None, n);

        let bases: Vec<i32> = shader
            .find_intrinsics(Intrinsic::StoreBufferAmd)
            .into_iter()
            .map(|id| shader.intrinsic(id).unwrap().idx.base)
            .collect();
        assert_eq!(bases, vec![31 * 16]);
    }

    #[test]
    fn store_var_components_pads_to_vec4() {
        let mut shader = Shader::new(Stage::TessCtrl, "var");
        let var = shader.add_variable("out", 4, 32);
        let mut b = Builder::at_end(&mut shader);
        let v = b.imm_vec4_f32([1.0, 2.0, 3.0, 4.0]);
        let v = b.mov_swizzle(v, &[0, 1]);
        let id = {
            store_var_components(&mut b, var, v, 2, 0x3);
            *shader.find_intrinsics(Intrinsic::StoreVar).last().unwrap()
        };
        let store = shader.intrinsic(id).unwrap();
        assert_eq!(store.idx.write_mask, 0xc);
        assert_eq!(shader.num_components(store.srcs[0]), 4);
    }

    #[test]
    fn colors_are_clamped_under_a_runtime_flag() {
        let mut shader = Shader::new(Stage::Vertex, "clamp");
        shader.info.outputs_written = varying::bit(COL0);
        let mut b = Builder::at_end(&mut shader);
        let (mut out, _) = written_out(&mut b, &[COL0]);
        let before = out.outputs[COL0 as usize][0];

        assert!(clamp_vertex_color_outputs(&mut b, &mut out));
        assert_ne!(out.outputs[COL0 as usize][0], before);
        assert_eq!(shader.count_intrinsics(Intrinsic::LoadClampVertexColorAmd), 1);
        nir::validate(&shader).unwrap();
    }
}
