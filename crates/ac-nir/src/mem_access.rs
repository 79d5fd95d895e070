//! Late legalisation of memory accesses: SMEM selection, access sizes the hardware can execute,
//! load/store vectorisation limits and the store flags of the GFX6 TC L1 workaround.

use nir::{Access, Builder, Def, InstrId, Intrinsic, IntrinsicInstr, Shader};
use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::gfx::GfxLevel;
use crate::io::consecutive_ranges;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemAccessOptions {
    pub gfx_level: Option<GfxLevel>,
    /// The LLVM backend handles fewer sub-dword and SMEM forms than ACO.
    pub use_llvm: bool,
}

impl MemAccessOptions {
    pub fn validate(&self) -> Result<GfxLevel, ConfigError> {
        self.gfx_level.ok_or(ConfigError::Invalid("gfx_level is required"))
    }
}

/// How an access that starts below its required alignment gets its bytes into place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccessShift {
    /// Shift a 64-bit pair of dwords.
    Shift64,
    /// `v_alignbyte_b32` on each dword pair.
    ByteAlignAmd,
}

/// One access the hardware can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccessSizeAlign {
    pub num_components: u32,
    pub bit_size: u32,
    /// Byte alignment the access requires.
    pub align: u32,
    pub shift: MemAccessShift,
}

/// Largest power of two dividing `align_mul * k + align_offset` for every `k`.
fn combined_align(align_mul: u32, align_offset: u32) -> u32 {
    if align_offset != 0 {
        1 << align_offset.trailing_zeros()
    } else {
        align_mul
    }
}

fn round_down_power_of_two(n: u32) -> u32 {
    if n == 0 {
        0
    } else {
        1 << (31 - n.leading_zeros())
    }
}

fn round_up_components(n: u32) -> u32 {
    if n > 4 {
        n.next_power_of_two()
    } else {
        n
    }
}

fn round_down_components(n: u32) -> u32 {
    if n > 4 {
        round_down_power_of_two(n).max(4)
    } else {
        n
    }
}

/// The largest access the hardware supports for the first `bytes` of a load or store.
///
/// Loads may come back wider than asked; the caller extracts the requested bytes. Stores are
/// only ever split. `offset_is_const` is part of the query but doesn't change any rule.
#[allow(clippy::too_many_arguments)]
pub fn mem_access_size_align(
    op: Intrinsic,
    bytes: u32,
    bit_size: u32,
    align_mul: u32,
    align_offset: u32,
    _offset_is_const: bool,
    access: Access,
    gfx_level: GfxLevel,
    use_llvm: bool,
) -> MemAccessSizeAlign {
    let is_load = op.has_dest();
    let is_smem = op == Intrinsic::LoadPushConstant || access.contains(Access::SMEM);
    let combined = combined_align(align_mul, align_offset);
    let mut bytes = bytes;
    let mut bit_size = bit_size;

    if matches!(op, Intrinsic::LoadShared | Intrinsic::StoreShared) {
        let bit_size = (bit_size as u64).min(combined as u64 * 8) as u32;
        let align = bit_size / 8;
        // LDS accesses above 64 bits are slower than two 64-bit ones.
        let max_bytes = if op == Intrinsic::StoreShared && gfx_level >= GfxLevel::Gfx7 {
            16
        } else {
            8
        };
        let bytes = bytes.min(combined).min(max_bytes);
        let bytes = if bytes == 12 {
            bytes
        } else {
            round_down_power_of_two(bytes)
        };
        return MemAccessSizeAlign {
            num_components: bytes / align,
            bit_size,
            align,
            shift: MemAccessShift::ByteAlignAmd,
        };
    }

    let is_buffer_load = matches!(op, Intrinsic::LoadUbo | Intrinsic::LoadSsbo | Intrinsic::LoadConstant);

    if is_smem {
        let supported_subdword = gfx_level >= GfxLevel::Gfx12
            && op != Intrinsic::LoadPushConstant
            && (!use_llvm || op != Intrinsic::LoadUbo);

        if bytes <= 2 && combined % bytes == 0 && supported_subdword {
            bit_size = bytes * 8;
        } else if bytes % 4 != 0 || combined % 4 != 0 {
            if is_buffer_load {
                bytes += 4 - combined.min(4);
            }
            bytes = bytes.next_multiple_of(4);
            bit_size = 32;
        }

        let mut align = bytes.min(4);
        bit_size = bit_size.max(align * 8);
        // 16 dwords per SMEM load.
        bytes = bytes.min(64);

        if !bytes.is_power_of_two() && (gfx_level < GfxLevel::Gfx12 || bytes != 12) {
            let larger = bytes.next_power_of_two();
            let smaller = larger / 2;
            let is_aligned = align_mul % smaller == 0;
            // At most one dword past the end, and only when bounds checked or aligned.
            let overfetch = bytes + 4 >= larger && (is_buffer_load || is_aligned);
            bytes = if overfetch { larger } else { smaller };
            if is_aligned {
                align = smaller;
            }
        }
        return MemAccessSizeAlign {
            num_components: bytes.div_ceil(bit_size / 8),
            bit_size,
            align,
            shift: MemAccessShift::Shift64,
        };
    }

    if is_load && bit_size == 8 && combined >= 2 && bytes % 2 == 0 {
        bit_size = 16;
    }
    if bit_size <= 16 && combined >= 4 && bytes % 4 == 0 {
        bit_size = 32;
    }
    let max_bits = if combined == 4 { 64 } else { combined as u64 * 8 };
    bit_size = (bit_size as u64).min(max_bits) as u32;

    let max_components = if use_llvm
        && access.intersects(Access::COHERENT | Access::VOLATILE)
        && matches!(op, Intrinsic::LoadGlobal | Intrinsic::StoreGlobal)
    {
        1
    } else {
        4
    };

    let mut res = MemAccessSizeAlign {
        num_components: bytes.div_ceil(bit_size / 8).min(max_components),
        bit_size,
        // 64-bit accesses only need dword alignment.
        align: (bit_size / 8).min(4),
        shift: MemAccessShift::Shift64,
    };
    if !is_load {
        return res;
    }

    // Scalar sub-dword loads exist; wider ones are done as dwords.
    let supported_subdword = res.num_components == 1 && (!use_llvm || op != Intrinsic::LoadUbo);
    if res.bit_size >= 32 || supported_subdword {
        return res;
    }

    let max_pad = 4 - combined.min(4);
    let num_components = if is_buffer_load {
        round_up_components((bytes + max_pad).div_ceil(4))
    } else {
        // No bounds checking, so a dword load must not reach past the last requested byte.
        if align_mul < 4 && bytes.next_multiple_of(4) - max_pad < bytes {
            return res;
        }
        round_down_components(bytes.div_ceil(4))
    };
    res.num_components = num_components.min(max_components);
    res.bit_size = 32;
    res.align = 4;
    res.shift = MemAccessShift::ByteAlignAmd;
    res
}

/// Index of the offset (or address) source of the accesses this pass legalises.
fn offset_src(op: Intrinsic) -> Option<usize> {
    use Intrinsic::*;
    match op {
        LoadShared | LoadPushConstant | LoadConstant | LoadScratch | LoadGlobal | LoadGlobalConstant => Some(0),
        LoadUbo | LoadSsbo | StoreShared | StoreScratch | StoreGlobal => Some(1),
        StoreSsbo => Some(2),
        _ => None,
    }
}

struct Legalizer {
    gfx_level: GfxLevel,
    use_llvm: bool,
}

impl Legalizer {
    fn shape(&self, intr: &IntrinsicInstr, bytes: u32, bit_size: u32, align_mul: u32, align_offset: u32, offset_is_const: bool) -> MemAccessSizeAlign {
        mem_access_size_align(
            intr.op,
            bytes,
            bit_size,
            align_mul,
            align_offset,
            offset_is_const,
            intr.idx.access,
            self.gfx_level,
            self.use_llvm,
        )
    }
}

/// The alignment recorded on `intr`, natural alignment when none is.
fn access_alignment(intr: &IntrinsicInstr, bit_size: u32) -> (u32, u32) {
    if intr.idx.align_mul == 0 {
        ((bit_size / 8).max(1), 0)
    } else {
        (intr.idx.align_mul, intr.idx.align_offset % intr.idx.align_mul)
    }
}

/// `taken_bits` bits of `data` starting at `skip_bits`, in the widest unit that fits.
fn trim_bits(b: &mut Builder, data: Def, skip_bits: u32, taken_bits: u32) -> Def {
    let total = b.num_components(data) as u32 * b.bit_size(data) as u32;
    if skip_bits == 0 && taken_bits == total {
        return data;
    }
    let unit = [32u32, 16, 8]
        .into_iter()
        .find(|u| skip_bits % u == 0 && taken_bits % u == 0)
        .unwrap_or(8);
    b.extract_bits(&[data], skip_bits, (taken_bits / unit) as u8, unit as u8)
}

/// Shifts the dwords of `data` down by `addr & 3` bytes.
fn shift_dwords(b: &mut Builder, data: Def, addr: Def, shift: MemAccessShift) -> Def {
    let num_dwords = (b.num_components(data) as u32 * b.bit_size(data) as u32 / 32) as u8;
    let dwords = b.extract_bits(&[data], 0, num_dwords, 32);
    let addr = if b.bit_size(addr) == 32 { addr } else { b.u2u32(addr) };
    let zero = b.imm_u32(0);

    let mut comps = Vec::with_capacity(num_dwords as usize);
    for i in 0..num_dwords {
        let lo = b.channel(dwords, i);
        let hi = if i + 1 < num_dwords { b.channel(dwords, i + 1) } else { zero };
        let value = match shift {
            MemAccessShift::ByteAlignAmd => b.alignbyte_amd(hi, lo, addr),
            MemAccessShift::Shift64 => {
                let lo = b.u2u(lo, 64);
                let hi = b.u2u(hi, 64);
                let hi = b.ishl_imm(hi, 32);
                let wide = b.ior(lo, hi);
                let bytes = b.iand_imm(addr, 3);
                let bits = b.imul_imm(bytes, 8);
                let shifted = b.ushr(wide, bits);
                b.u2u32(shifted)
            }
        };
        comps.push(value);
    }
    b.vec(&comps)
}

/// Re-emits `intr` reading `req` at `offset`.
fn emit_load(b: &mut Builder, intr: &IntrinsicInstr, offset: Def, req: MemAccessSizeAlign, align_mul: u32, align_offset: u32) -> Def {
    let Some(src) = offset_src(intr.op) else {
        unreachable!("{} has no offset", intr.op.name());
    };
    let mut srcs = intr.srcs.clone();
    srcs[src] = offset;
    b.intrinsic(intr.op)
        .srcs(&srcs)
        .indices(intr.idx.clone())
        .align(align_mul, align_offset)
        .def(req.num_components as u8, req.bit_size as u8)
}

fn lower_load(b: &mut Builder, id: InstrId, legalizer: &Legalizer) -> bool {
    let Some(intr) = b.shader.intrinsic(id).cloned() else {
        return false;
    };
    let (Some(src), Some(def)) = (offset_src(intr.op), intr.def) else {
        return false;
    };
    let num_components = b.num_components(def) as u32;
    let bit_size = b.bit_size(def) as u32;
    let bytes = num_components * bit_size / 8;
    let (align_mul, align_offset) = access_alignment(&intr, bit_size);
    let offset = intr.srcs[src];
    let offset_is_const = b.shader.const_u32(offset).is_some();

    let whole = legalizer.shape(&intr, bytes, bit_size, align_mul, align_offset, offset_is_const);
    if whole.num_components == num_components
        && whole.bit_size == bit_size
        && whole.align <= combined_align(align_mul, align_offset)
    {
        return false;
    }

    let mut pieces = Vec::new();
    let mut start = 0u32;
    while start < bytes {
        let left = bytes - start;
        let chunk_offset = (align_offset + start) % align_mul;
        let chunk_align = combined_align(align_mul, chunk_offset);
        let req = legalizer.shape(&intr, left, bit_size, align_mul, chunk_offset, offset_is_const);
        let req_bytes = req.num_components * req.bit_size / 8;

        let (data, skip, taken) = if req.align <= chunk_align {
            let at = b.iadd_imm(offset, start as u64);
            let data = emit_load(b, &intr, at, req, align_mul, chunk_offset);
            (data, 0, req_bytes.min(left))
        } else if align_mul >= req.align {
            // The misalignment is known; load from the aligned address below.
            let pad = chunk_offset % req.align;
            let at = b.iadd_imm(offset, (start as i64 - pad as i64) as u64);
            let data = emit_load(b, &intr, at, req, align_mul, chunk_offset - pad);
            (data, pad, (req_bytes - pad).min(left))
        } else {
            let addr = b.iadd_imm(offset, start as u64);
            let aligned = b.iand_imm(addr, !(req.align as u64 - 1));
            let data = emit_load(b, &intr, aligned, req, req.align, 0);
            let data = shift_dwords(b, data, addr, req.shift);
            (data, 0, (req_bytes - (req.align - chunk_align)).min(left))
        };
        assert!(taken > 0, "{} of {left} bytes made no progress", intr.op.name());
        trace!(op = intr.op.name(), start, taken, skip, ?req, "load chunk");
        pieces.push(trim_bits(b, data, skip * 8, taken * 8));
        start += taken;
    }

    let value = b.extract_bits(&pieces, 0, num_components as u8, bit_size as u8);
    b.rewrite_uses(def, value);
    b.remove(id);
    true
}

fn lower_store(b: &mut Builder, id: InstrId, legalizer: &Legalizer) -> bool {
    let Some(intr) = b.shader.intrinsic(id).cloned() else {
        return false;
    };
    let Some(src) = offset_src(intr.op) else {
        return false;
    };
    let value = intr.srcs[0];
    let num_components = b.num_components(value) as u32;
    let bit_size = b.bit_size(value) as u32;
    let full_mask = (1u32 << num_components) - 1;
    let write_mask = if intr.idx.write_mask == 0 {
        full_mask
    } else {
        intr.idx.write_mask & full_mask
    };
    let (align_mul, align_offset) = access_alignment(&intr, bit_size);
    let offset = intr.srcs[src];
    let offset_is_const = b.shader.const_u32(offset).is_some();

    let bytes = num_components * bit_size / 8;
    let whole = legalizer.shape(&intr, bytes, bit_size, align_mul, align_offset, offset_is_const);
    if write_mask == full_mask
        && whole.num_components == num_components
        && whole.bit_size == bit_size
        && whole.align <= combined_align(align_mul, align_offset)
    {
        return false;
    }

    for (first, count) in consecutive_ranges(write_mask) {
        let range_start = first * bit_size / 8;
        let range_bytes = count * bit_size / 8;
        let mut done = 0u32;
        while done < range_bytes {
            let at = range_start + done;
            let left = range_bytes - done;
            let chunk_offset = (align_offset + at) % align_mul;
            let chunk_align = combined_align(align_mul, chunk_offset);
            let req = legalizer.shape(&intr, left, bit_size, align_mul, chunk_offset, offset_is_const);
            assert!(
                req.align <= chunk_align,
                "{} of {left} bytes needs {}-byte alignment, has {chunk_align}",
                intr.op.name(),
                req.align
            );
            let unit = req.bit_size / 8;
            let store_components = (left / unit).min(req.num_components);
            assert!(store_components > 0, "{} of {left} bytes made no progress", intr.op.name());

            let data = b.extract_bits(&[value], at * 8, store_components as u8, req.bit_size as u8);
            let mut srcs = intr.srcs.clone();
            srcs[0] = data;
            srcs[src] = b.iadd_imm(offset, at as u64);
            b.intrinsic(intr.op)
                .srcs(&srcs)
                .indices(intr.idx.clone())
                .write_mask((1 << store_components) - 1)
                .align(align_mul, chunk_offset)
                .emit();
            trace!(op = intr.op.name(), at, store_components, ?req, "store chunk");
            done += store_components * unit;
        }
    }
    b.remove(id);
    true
}

/// Splits and widens UBO, SSBO, global, constant, push constant, shared and scratch accesses
/// into shapes from [`mem_access_size_align`].
pub fn lower_mem_access_bit_sizes(shader: &mut Shader, options: &MemAccessOptions) -> Result<bool, ConfigError> {
    let legalizer = Legalizer {
        gfx_level: options.validate()?,
        use_llvm: options.use_llvm,
    };
    let mut loads = 0u32;
    let mut stores = 0u32;
    let progress = nir::intrinsics_pass(shader, |b, id| {
        let Some(intr) = b.shader.intrinsic(id) else {
            return false;
        };
        if offset_src(intr.op).is_none() {
            return false;
        }
        if intr.op.has_dest() {
            let lowered = lower_load(b, id, &legalizer);
            loads += lowered as u32;
            lowered
        } else {
            let lowered = lower_store(b, id, &legalizer);
            stores += lowered as u32;
            lowered
        }
    });
    debug!(
        gfx_level = %legalizer.gfx_level,
        use_llvm = legalizer.use_llvm,
        loads,
        stores,
        "lowered memory access sizes"
    );
    Ok(progress)
}

fn can_reorder(op: Intrinsic, access: Access) -> bool {
    if access.contains(Access::VOLATILE) {
        return false;
    }
    matches!(op, Intrinsic::LoadUbo | Intrinsic::LoadPushConstant | Intrinsic::LoadConstant)
        || access.contains(Access::CAN_REORDER)
}

/// Marks uniform loads that can go through the scalar cache with [`Access::SMEM`].
///
/// Loads whose descriptor is computed in top-level control flow before any `terminate` are
/// also marked [`Access::CAN_SPECULATE`].
pub fn flag_smem_for_loads(shader: &mut Shader, options: &MemAccessOptions) -> Result<bool, ConfigError> {
    let gfx_level = options.validate()?;
    nir::divergence_analysis(shader);
    shader.clear_pass_flags();

    let mut had_terminate = false;
    let mut flagged = 0u32;
    let progress = nir::intrinsics_pass(shader, |b, id| {
        let Some(intr) = b.shader.intrinsic(id) else {
            return false;
        };
        let op = intr.op;

        if !had_terminate {
            match op {
                Intrinsic::Terminate | Intrinsic::TerminateIf => {
                    had_terminate = true;
                    return false;
                }
                Intrinsic::LoadUbo | Intrinsic::LoadSsbo | Intrinsic::LoadConstant => {
                    let parent = b.shader.parent_instr(intr.srcs[0]);
                    let top_level = b.shader.is_top_level_block(b.shader.instr(parent).block);
                    if top_level || op == Intrinsic::LoadConstant {
                        b.shader.instr_mut(parent).pass_flags = 1;
                    }
                }
                _ => {}
            }
        }

        let Some(intr) = b.shader.intrinsic(id) else {
            return false;
        };
        let eligible = match op {
            Intrinsic::LoadUbo => true,
            Intrinsic::LoadSsbo | Intrinsic::LoadGlobal | Intrinsic::LoadGlobalConstant | Intrinsic::LoadConstant => {
                !options.use_llvm
            }
            _ => false,
        };
        if !eligible || intr.def.is_some_and(|def| b.shader.is_divergent(def)) {
            return false;
        }

        let access = intr.idx.access;
        let glc = access.intersects(Access::VOLATILE | Access::COHERENT);
        let reorder = can_reorder(op, access)
            || (access.contains(Access::NON_WRITEABLE) && !access.contains(Access::VOLATILE));
        if !reorder || (glc && gfx_level < GfxLevel::Gfx8) {
            return false;
        }

        let mut new_access = access | Access::SMEM;
        if b.shader.instr(b.shader.parent_instr(intr.srcs[0])).pass_flags == 1 {
            new_access |= Access::CAN_SPECULATE;
        }
        if let Some(intr) = b.shader.intrinsic_mut(id) {
            intr.idx.access = new_access;
        }
        flagged += 1;
        new_access != access
    });
    debug!(%gfx_level, use_llvm = options.use_llvm, flagged, "flagged SMEM loads");
    Ok(progress)
}

#[derive(Debug, Clone, Copy)]
pub struct MemVectorizeConfig {
    pub gfx_level: GfxLevel,
    pub uses_aco: bool,
}

/// Access size the hardware executes for `size` bits.
fn align_load_store_size(gfx_level: GfxLevel, size: u32, uses_smem: bool, is_shared: bool) -> u32 {
    // Partially out-of-range LDS accesses are dropped whole, so LDS never overfetches.
    if is_shared {
        return size;
    }
    let min_gfx_for_96 = if uses_smem { GfxLevel::Gfx12 } else { GfxLevel::Gfx7 };
    if gfx_level >= min_gfx_for_96 && size == 96 {
        size
    } else {
        size.next_power_of_two()
    }
}

/// Whether the load/store vectoriser may merge `low` and `high` into one access of
/// `num_components` x `bit_size` bits at the given alignment.
///
/// `hole_size` is the gap in bytes between the two; stores never have one.
#[allow(clippy::too_many_arguments)]
pub fn mem_vectorize_callback(
    shader: &Shader,
    align_mul: u32,
    align_offset: u32,
    bit_size: u32,
    num_components: u32,
    hole_size: i64,
    low: InstrId,
    high: InstrId,
    config: &MemVectorizeConfig,
) -> bool {
    let (Some(low), Some(high)) = (shader.intrinsic(low), shader.intrinsic(high)) else {
        return false;
    };
    let uses_smem = low.idx.access.contains(Access::SMEM)
        || matches!(low.op, Intrinsic::LoadSmemAmd | Intrinsic::LoadPushConstant);
    let is_store = !low.op.has_dest();
    let is_scratch = matches!(low.op, Intrinsic::LoadScratch | Intrinsic::StoreScratch);
    let is_shared = matches!(low.op, Intrinsic::LoadShared | Intrinsic::StoreShared);
    assert!(!is_store || hole_size <= 0, "stores are vectorised without holes");

    // Merged descriptor loads make LLVM spill.
    if !config.uses_aco && low.op == Intrinsic::LoadSmemAmd {
        return false;
    }

    use Intrinsic::*;
    if !matches!(
        low.op,
        LoadSmemAmd
            | LoadPushConstant
            | LoadUbo
            | LoadScratch
            | StoreScratch
            | LoadGlobalConstant
            | LoadGlobal
            | StoreGlobal
            | LoadSsbo
            | StoreSsbo
            | LoadShared
            | StoreShared
    ) {
        return false;
    }

    let gfx_level = config.gfx_level;
    let unaligned_new_size = num_components * bit_size;
    let aligned_new_size = align_load_store_size(gfx_level, unaligned_new_size, uses_smem, is_shared);

    if uses_smem {
        let max = if gfx_level >= GfxLevel::Gfx8 {
            if config.uses_aco {
                512
            } else {
                256
            }
        } else {
            128
        };
        if aligned_new_size > max {
            return false;
        }
    } else {
        if aligned_new_size > 128 {
            return false;
        }
        // GFX6-8 scratch accesses are dword only.
        if gfx_level <= GfxLevel::Gfx8 && is_scratch && aligned_new_size > 32 {
            return false;
        }
    }

    if !is_store {
        let access_bits = |intr: &IntrinsicInstr| {
            let bits = intr.def.map_or(32, |def| shader.bit_size(def) as u32);
            intr.num_components as u32 * bits
        };

        // Widening a load must not touch a new page; descriptor loads are bounds checked.
        if !matches!(low.op, LoadUbo | LoadSsbo) {
            let resource_align = if matches!(low.op, LoadGlobalConstant | LoadGlobal) {
                u32::MAX
            } else {
                4
            };
            let mul = align_mul.min(4096).min(resource_align).max(1);
            let end = (align_offset + unaligned_new_size / 8) & (mul - 1);
            if (aligned_new_size - unaligned_new_size) / 8 > mul - end {
                return false;
            }
        }

        // ACO may overfetch one dword per merge of wide SMEM loads.
        let overfetch = if config.uses_aco && uses_smem && aligned_new_size >= 128 {
            32
        } else {
            0
        };
        let unvectorized = align_load_store_size(gfx_level, access_bits(low), uses_smem, is_shared)
            + align_load_store_size(gfx_level, access_bits(high), uses_smem, is_shared);
        if aligned_new_size > unvectorized + overfetch {
            return false;
        }
    }

    let align = combined_align(align_mul, align_offset);
    if !is_shared {
        let max_components = if align % 4 == 0 {
            16
        } else if align % 2 == 0 {
            16 / bit_size
        } else {
            8 / bit_size
        };
        return align % (bit_size / 8).max(1) == 0 && num_components <= max_components;
    }

    if bit_size * num_components == 96 {
        // Split unless 128-bit aligned.
        align % 16 == 0
    } else if bit_size == 16 && align % 4 != 0 {
        // 2-byte aligned f16vec2 LDS loads don't exist, but help ALU vectorisation.
        align % 2 == 0 && num_components <= 2
    } else if num_components == 3 {
        false
    } else {
        let mut req = bit_size * num_components;
        // ds_read2/ds_write2 split 64- and 128-bit accesses in halves.
        if req == 64 || req == 128 {
            req /= 2;
        }
        align % (req / 8).max(1) == 0
    }
}

/// Access flags of a memory intrinsic, with [`Access::MAY_STORE_SUBDWORD`] derived for stores.
///
/// GFX6 has a TC L1 bug with sub-dword stores that the backend works around.
pub fn get_mem_access_flags(shader: &Shader, id: InstrId) -> Access {
    let Some(intr) = shader.intrinsic(id) else {
        return Access::empty();
    };
    let mut access = intr.idx.access;
    if intr.op.has_dest() {
        return access;
    }
    match intr.op {
        Intrinsic::StoreSsbo | Intrinsic::StoreBufferAmd | Intrinsic::StoreGlobal => {
            let value = intr.srcs[0];
            let stored_bytes = shader.bit_size(value) as u32 / 8 * shader.num_components(value) as u32;
            let misaligned = intr.idx.align_mul != 0 && intr.idx.align() % 4 != 0;
            if access.contains(Access::USES_FORMAT) || misaligned || stored_bytes % 4 != 0 {
                access |= Access::MAY_STORE_SUBDWORD;
            }
        }
        op => panic!("unexpected store instruction {}", op.name()),
    }
    access
}

/// Waits about `cycles` cycles: `s_sleep` in units of 64, then `s_nop`s of up to 16.
pub fn sleep(b: &mut Builder, cycles: u32) {
    let mut cycles = cycles;
    if cycles >= 64 {
        b.intrinsic(Intrinsic::SleepAmd).base((cycles / 64) as i32).emit();
        cycles &= 63;
    }
    while cycles > 0 {
        let nop = cycles.min(16);
        b.intrinsic(Intrinsic::NopAmd).base(nop as i32 - 1).emit();
        cycles -= nop;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nir::{eval, eval_u32, AluType, IoSemantics, Stage};
    use pretty_assertions::assert_eq;
    use MemAccessShift::{ByteAlignAmd, Shift64};

    fn shape(op: Intrinsic, bytes: u32, bit_size: u32, align_mul: u32, align_offset: u32, access: Access, gfx_level: GfxLevel) -> (u32, u32, u32, MemAccessShift) {
        let r = mem_access_size_align(op, bytes, bit_size, align_mul, align_offset, false, access, gfx_level, false);
        (r.num_components, r.bit_size, r.align, r.shift)
    }

    #[test]
    fn shared_accesses_split_at_the_alignment() {
        let none = Access::empty();
        assert_eq!(shape(Intrinsic::LoadShared, 16, 32, 4, 0, none, GfxLevel::Gfx9), (1, 32, 4, ByteAlignAmd));
        assert_eq!(shape(Intrinsic::LoadShared, 16, 32, 16, 0, none, GfxLevel::Gfx9), (2, 32, 4, ByteAlignAmd));
        assert_eq!(shape(Intrinsic::StoreShared, 16, 32, 16, 0, none, GfxLevel::Gfx9), (4, 32, 4, ByteAlignAmd));
        assert_eq!(shape(Intrinsic::StoreShared, 16, 32, 16, 0, none, GfxLevel::Gfx6), (2, 32, 4, ByteAlignAmd));
        assert_eq!(shape(Intrinsic::StoreShared, 12, 32, 16, 0, none, GfxLevel::Gfx9), (3, 32, 4, ByteAlignAmd));
        assert_eq!(shape(Intrinsic::LoadShared, 12, 32, 16, 0, none, GfxLevel::Gfx9), (2, 32, 4, ByteAlignAmd));
        assert_eq!(shape(Intrinsic::LoadShared, 8, 64, 8, 4, none, GfxLevel::Gfx9), (1, 32, 4, ByteAlignAmd));
    }

    #[test]
    fn smem_loads_round_to_supported_sizes() {
        let smem = Access::SMEM;
        // vec3 overfetches a dword before GFX12.
        assert_eq!(shape(Intrinsic::LoadUbo, 12, 32, 16, 0, smem, GfxLevel::Gfx9), (4, 32, 8, Shift64));
        assert_eq!(shape(Intrinsic::LoadUbo, 12, 32, 16, 0, smem, GfxLevel::Gfx12), (3, 32, 4, Shift64));
        // Unaligned global loads have no bounds checking to overfetch into.
        assert_eq!(shape(Intrinsic::LoadGlobal, 12, 32, 4, 0, smem, GfxLevel::Gfx9), (2, 32, 4, Shift64));
        assert_eq!(shape(Intrinsic::LoadPushConstant, 128, 32, 4, 0, Access::empty(), GfxLevel::Gfx9), (16, 32, 4, Shift64));
        // Sub-dword SMEM only exists on GFX12.
        assert_eq!(shape(Intrinsic::LoadUbo, 2, 16, 2, 0, smem, GfxLevel::Gfx11), (1, 32, 4, Shift64));
        assert_eq!(shape(Intrinsic::LoadUbo, 2, 16, 2, 0, smem, GfxLevel::Gfx12), (1, 16, 2, Shift64));
        let llvm = mem_access_size_align(Intrinsic::LoadUbo, 2, 16, 2, 0, false, smem, GfxLevel::Gfx12, true);
        assert_eq!(llvm.bit_size, 32);
    }

    #[test]
    fn vmem_accesses_widen_and_split() {
        let none = Access::empty();
        assert_eq!(shape(Intrinsic::LoadGlobal, 4, 8, 4, 0, none, GfxLevel::Gfx9), (1, 32, 4, Shift64));
        assert_eq!(shape(Intrinsic::LoadGlobal, 16, 64, 8, 0, none, GfxLevel::Gfx9), (2, 64, 4, Shift64));
        assert_eq!(shape(Intrinsic::StoreGlobal, 2, 8, 2, 0, none, GfxLevel::Gfx9), (2, 8, 1, Shift64));
        // Unaligned bytes of a global load stay bytes; a buffer load reads padded dwords.
        assert_eq!(shape(Intrinsic::LoadGlobal, 3, 8, 1, 0, none, GfxLevel::Gfx9), (3, 8, 1, Shift64));
        assert_eq!(shape(Intrinsic::LoadSsbo, 3, 8, 1, 0, none, GfxLevel::Gfx9), (2, 32, 4, ByteAlignAmd));
        assert_eq!(shape(Intrinsic::LoadSsbo, 1, 8, 1, 0, none, GfxLevel::Gfx9), (1, 8, 1, Shift64));
        let coherent = mem_access_size_align(Intrinsic::LoadGlobal, 16, 32, 16, 0, false, Access::COHERENT, GfxLevel::Gfx9, true);
        assert_eq!(coherent.num_components, 1);
    }

    fn load(b: &mut Builder, op: Intrinsic, srcs: &[Def], nc: u8, bits: u8, align_mul: u32, access: Access) -> Def {
        b.intrinsic(op).srcs(srcs).align(align_mul, 0).access(access).def(nc, bits)
    }

    fn sink(b: &mut Builder, value: Def) {
        let zero = b.imm_u32(0);
        b.intrinsic(Intrinsic::StoreOutput)
            .srcs(&[value, zero])
            .write_mask(0xf)
            .src_type(AluType::UINT32)
            .io(IoSemantics::default())
            .emit();
    }

    fn options(gfx_level: GfxLevel) -> MemAccessOptions {
        MemAccessOptions {
            gfx_level: Some(gfx_level),
            use_llvm: false,
        }
    }

    #[test]
    fn unaligned_shared_loads_are_split() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut shader = Shader::new(Stage::Compute, "lds");
        let mut b = Builder::at_end(&mut shader);
        let index = b.load_sysval(Intrinsic::LoadLocalInvocationIndex);
        let addr = b.imul_imm(index, 16);
        let value = load(&mut b, Intrinsic::LoadShared, &[addr], 4, 32, 4, Access::empty());
        sink(&mut b, value);

        assert_eq!(lower_mem_access_bit_sizes(&mut shader, &options(GfxLevel::Gfx9)), Ok(true));
        let loads = shader.find_intrinsics(Intrinsic::LoadShared);
        let offsets: Vec<u32> = loads
            .iter()
            .map(|&id| {
                let load = shader.intrinsic(id).unwrap();
                assert_eq!(load.num_components, 1);
                eval_u32(&shader, load.srcs[0], &|intr: &IntrinsicInstr| {
                    (intr.op == Intrinsic::LoadLocalInvocationIndex).then(|| vec![2])
                })
                .unwrap()
            })
            .collect();
        assert_eq!(offsets, vec![32, 36, 40, 44]);
        nir::validate(&shader).unwrap();

        // Nothing left to do.
        assert_eq!(lower_mem_access_bit_sizes(&mut shader, &options(GfxLevel::Gfx9)), Ok(false));
    }

    #[test]
    fn partial_shared_stores_follow_the_write_mask() {
        let mut shader = Shader::new(Stage::Compute, "lds");
        let mut b = Builder::at_end(&mut shader);
        let value = b.load_sysval(Intrinsic::LoadLocalInvocationIndex);
        let value = b.vec4(value, value, value, value);
        let addr = b.imm_u32(64);
        b.intrinsic(Intrinsic::StoreShared)
            .srcs(&[value, addr])
            .write_mask(0b1011)
            .align(16, 0)
            .emit();

        lower_mem_access_bit_sizes(&mut shader, &options(GfxLevel::Gfx9)).unwrap();
        let stores: Vec<(u32, u32, u32, u32)> = shader
            .find_intrinsics(Intrinsic::StoreShared)
            .into_iter()
            .map(|id| {
                let store = shader.intrinsic(id).unwrap();
                let offset = shader.const_u32(store.srcs[1]).unwrap();
                (offset, store.num_components as u32, store.idx.write_mask, store.idx.align_offset)
            })
            .collect();
        assert_eq!(stores, vec![(64, 2, 0b11, 0), (76, 1, 0b1, 12)]);
        nir::validate(&shader).unwrap();
    }

    #[test]
    fn unaligned_bytes_come_from_shifted_dwords() {
        let mut shader = Shader::new(Stage::Compute, "ssbo");
        let mut b = Builder::at_end(&mut shader);
        let desc = b.load_sysval(Intrinsic::LoadRingAttrAmd);
        let offset = b.imm_u32(5);
        let value = load(&mut b, Intrinsic::LoadSsbo, &[desc, offset], 3, 8, 1, Access::empty());
        sink(&mut b, value);

        lower_mem_access_bit_sizes(&mut shader, &options(GfxLevel::Gfx9)).unwrap();
        let loads = shader.find_intrinsics(Intrinsic::LoadSsbo);
        assert_eq!(loads.len(), 1);
        let ssbo = shader.intrinsic(loads[0]).unwrap();
        assert_eq!((ssbo.num_components, shader.bit_size(ssbo.def.unwrap())), (2, 32));
        assert_eq!(shader.const_u32(ssbo.srcs[1]), Some(4));
        assert_eq!((ssbo.idx.align_mul, ssbo.idx.align_offset), (4, 0));

        // Memory holds its own byte offsets.
        let memory = |intr: &IntrinsicInstr| {
            (intr.op == Intrinsic::LoadSsbo).then(|| vec![0x0706_0504, 0x0b0a_0908])
        };
        let store = shader.intrinsic(shader.find_intrinsics(Intrinsic::StoreOutput)[0]).unwrap();
        assert_eq!(eval(&shader, store.srcs[0], &memory), Some(vec![5, 6, 7]));
        nir::validate(&shader).unwrap();
    }

    #[test]
    fn padded_smem_loads_keep_the_requested_bytes() {
        let mut shader = Shader::new(Stage::Compute, "ubo");
        let mut b = Builder::at_end(&mut shader);
        let desc = b.load_sysval(Intrinsic::LoadRingAttrAmd);
        let offset = b.imm_u32(32);
        let value = load(&mut b, Intrinsic::LoadUbo, &[desc, offset], 3, 32, 16, Access::SMEM);
        sink(&mut b, value);

        lower_mem_access_bit_sizes(&mut shader, &options(GfxLevel::Gfx9)).unwrap();
        let loads = shader.find_intrinsics(Intrinsic::LoadUbo);
        assert_eq!(loads.len(), 1);
        assert_eq!(shader.intrinsic(loads[0]).unwrap().num_components, 4);
        let memory = |intr: &IntrinsicInstr| (intr.op == Intrinsic::LoadUbo).then(|| vec![10, 11, 12, 13]);
        let store = shader.intrinsic(shader.find_intrinsics(Intrinsic::StoreOutput)[0]).unwrap();
        assert_eq!(eval(&shader, store.srcs[0], &memory), Some(vec![10, 11, 12]));
    }

    fn scalar_arg(b: &mut Builder) -> Def {
        b.intrinsic(Intrinsic::LoadScalarArgAmd).base(0).def(4, 32)
    }

    fn access_of(shader: &Shader, id: InstrId) -> Access {
        shader.intrinsic(id).unwrap().idx.access
    }

    #[test]
    fn uniform_loads_use_smem() {
        let mut shader = Shader::new(Stage::Fragment, "fs");
        let mut b = Builder::at_end(&mut shader);
        let desc = scalar_arg(&mut b);
        let zero = b.imm_u32(0);
        let (ubo, _) = b.intrinsic(Intrinsic::LoadUbo).srcs(&[desc, zero]).def_with_id(1, 32);
        let (ssbo, _) = b.intrinsic(Intrinsic::LoadSsbo).srcs(&[desc, zero]).def_with_id(1, 32);
        let (readonly, _) = b
            .intrinsic(Intrinsic::LoadSsbo)
            .srcs(&[desc, zero])
            .access(Access::NON_WRITEABLE)
            .def_with_id(1, 32);
        let lane = b.load_sysval(Intrinsic::LoadLocalInvocationIndex);
        let (divergent, _) = b.intrinsic(Intrinsic::LoadUbo).srcs(&[desc, lane]).def_with_id(1, 32);

        assert_eq!(flag_smem_for_loads(&mut shader, &options(GfxLevel::Gfx9)), Ok(true));
        assert_eq!(access_of(&shader, ubo), Access::SMEM | Access::CAN_SPECULATE);
        assert_eq!(access_of(&shader, ssbo), Access::empty());
        assert_eq!(access_of(&shader, readonly), Access::NON_WRITEABLE | Access::SMEM | Access::CAN_SPECULATE);
        assert_eq!(access_of(&shader, divergent), Access::empty());
    }

    #[test]
    fn speculation_stops_at_terminate() {
        let mut shader = Shader::new(Stage::Fragment, "fs");
        let mut b = Builder::at_end(&mut shader);
        let desc = scalar_arg(&mut b);
        let late_desc = scalar_arg(&mut b);
        let zero = b.imm_u32(0);
        let (early, _) = b.intrinsic(Intrinsic::LoadUbo).srcs(&[desc, zero]).def_with_id(1, 32);
        b.intrinsic(Intrinsic::Terminate).emit();
        let (late, _) = b.intrinsic(Intrinsic::LoadUbo).srcs(&[late_desc, zero]).def_with_id(1, 32);

        flag_smem_for_loads(&mut shader, &options(GfxLevel::Gfx10)).unwrap();
        assert_eq!(access_of(&shader, early), Access::SMEM | Access::CAN_SPECULATE);
        assert_eq!(access_of(&shader, late), Access::SMEM);
    }

    #[test]
    fn coherent_and_llvm_loads_stay_vmem() {
        let build = || {
            let mut shader = Shader::new(Stage::Compute, "cs");
            let mut b = Builder::at_end(&mut shader);
            let desc = scalar_arg(&mut b);
            let zero = b.imm_u32(0);
            let (coherent, _) = b
                .intrinsic(Intrinsic::LoadSsbo)
                .srcs(&[desc, zero])
                .access(Access::COHERENT | Access::CAN_REORDER)
                .def_with_id(1, 32);
            (shader, coherent)
        };

        let (mut shader, coherent) = build();
        assert_eq!(flag_smem_for_loads(&mut shader, &options(GfxLevel::Gfx7)), Ok(false));
        assert!(!access_of(&shader, coherent).contains(Access::SMEM));

        let (mut shader, coherent) = build();
        flag_smem_for_loads(&mut shader, &options(GfxLevel::Gfx8)).unwrap();
        assert!(access_of(&shader, coherent).contains(Access::SMEM));

        let (mut shader, coherent) = build();
        let llvm = MemAccessOptions {
            use_llvm: true,
            ..options(GfxLevel::Gfx8)
        };
        flag_smem_for_loads(&mut shader, &llvm).unwrap();
        assert!(!access_of(&shader, coherent).contains(Access::SMEM));
    }

    fn pair(op: Intrinsic, access: Access, low_nc: u8, high_nc: u8, bits: u8) -> (Shader, InstrId, InstrId) {
        let mut shader = Shader::new(Stage::Compute, "vec");
        let mut b = Builder::at_end(&mut shader);
        let addr = b.imm_u32(0);
        let access_at = |b: &mut Builder, nc: u8| {
            if op.has_dest() {
                let srcs = vec![addr; op.num_srcs()];
                b.intrinsic(op).srcs(&srcs).access(access).def_with_id(nc, bits).0
            } else {
                let value = b.imm_zero(nc, bits);
                b.intrinsic(op).srcs(&[value, addr]).access(access).emit()
            }
        };
        let low = access_at(&mut b, low_nc);
        let high = access_at(&mut b, high_nc);
        (shader, low, high)
    }

    #[test]
    fn vectorisation_limits() {
        let aco = |gfx_level| MemVectorizeConfig { gfx_level, uses_aco: true };
        let check = |p: &(Shader, InstrId, InstrId), align_mul, align_offset, bits, nc, config: MemVectorizeConfig| {
            mem_vectorize_callback(&p.0, align_mul, align_offset, bits, nc, 0, p.1, p.2, &config)
        };

        // SMEM may overfetch one dword, not two.
        let ubo = pair(Intrinsic::LoadUbo, Access::SMEM, 2, 1, 32);
        assert!(check(&ubo, 16, 0, 32, 3, aco(GfxLevel::Gfx9)));
        let holey = pair(Intrinsic::LoadUbo, Access::SMEM, 1, 1, 32);
        assert!(!check(&holey, 16, 0, 32, 3, aco(GfxLevel::Gfx9)));

        // GFX6 has no 96-bit VMEM loads, so the vec3 would overfetch.
        let global = pair(Intrinsic::LoadGlobal, Access::empty(), 2, 1, 32);
        assert!(check(&global, 16, 4, 32, 3, aco(GfxLevel::Gfx9)));
        assert!(!check(&global, 16, 4, 32, 3, aco(GfxLevel::Gfx6)));

        let shared = pair(Intrinsic::LoadShared, Access::empty(), 2, 1, 32);
        assert!(check(&shared, 16, 0, 32, 3, aco(GfxLevel::Gfx9)));
        assert!(!check(&shared, 8, 0, 32, 3, aco(GfxLevel::Gfx9)));
        let halves = pair(Intrinsic::LoadShared, Access::empty(), 1, 1, 16);
        assert!(check(&halves, 2, 0, 16, 2, aco(GfxLevel::Gfx9)));
        // Two vec2 halves make a 64-bit ds_read2_b32.
        let quads = pair(Intrinsic::LoadShared, Access::empty(), 2, 2, 16);
        assert!(check(&quads, 8, 0, 16, 4, aco(GfxLevel::Gfx9)));
        assert!(!check(&quads, 2, 0, 16, 4, aco(GfxLevel::Gfx9)));

        let scratch = pair(Intrinsic::StoreScratch, Access::empty(), 1, 1, 32);
        assert!(!check(&scratch, 8, 0, 32, 2, aco(GfxLevel::Gfx8)));
        assert!(check(&scratch, 8, 0, 32, 2, aco(GfxLevel::Gfx9)));

        let atomics = pair(Intrinsic::SharedAtomic, Access::empty(), 1, 1, 32);
        assert!(!check(&atomics, 8, 0, 32, 2, aco(GfxLevel::Gfx9)));
    }

    #[test]
    fn subdword_stores_are_flagged() {
        let mut shader = Shader::new(Stage::Compute, "stores");
        let mut b = Builder::at_end(&mut shader);
        let desc = scalar_arg(&mut b);
        let zero = b.imm_u32(0);
        let bytes = b.imm_zero(3, 8);
        let dwords = b.imm_zero(2, 32);
        let store = |b: &mut Builder, value: Def, access: Access, align_mul: u32| {
            b.intrinsic(Intrinsic::StoreSsbo)
                .srcs(&[value, desc, zero])
                .access(access)
                .align(align_mul, 0)
                .emit()
        };
        let narrow = store(&mut b, bytes, Access::empty(), 4);
        let wide = store(&mut b, dwords, Access::empty(), 4);
        let misaligned = store(&mut b, dwords, Access::empty(), 2);
        let formatted = store(&mut b, dwords, Access::USES_FORMAT, 4);
        let (load, _) = b.intrinsic(Intrinsic::LoadSsbo).srcs(&[desc, zero]).access(Access::COHERENT).def_with_id(1, 32);

        assert!(get_mem_access_flags(&shader, narrow).contains(Access::MAY_STORE_SUBDWORD));
        assert_eq!(get_mem_access_flags(&shader, wide), Access::empty());
        assert!(get_mem_access_flags(&shader, misaligned).contains(Access::MAY_STORE_SUBDWORD));
        assert!(get_mem_access_flags(&shader, formatted).contains(Access::MAY_STORE_SUBDWORD));
        assert_eq!(get_mem_access_flags(&shader, load), Access::COHERENT);
    }

    #[test]
    #[should_panic(expected = "unexpected store instruction store_shared")]
    fn lds_stores_have_no_subdword_flag() {
        let mut shader = Shader::new(Stage::Compute, "lds");
        let mut b = Builder::at_end(&mut shader);
        let value = b.imm_u32(1);
        let store = b.intrinsic(Intrinsic::StoreShared).srcs(&[value, value]).emit();
        get_mem_access_flags(&shader, store);
    }

    #[test]
    fn sleep_uses_s_sleep_then_nops() {
        let waits = |cycles| {
            let mut shader = Shader::new(Stage::Compute, "sleep");
            let mut b = Builder::at_end(&mut shader);
            sleep(&mut b, cycles);
            shader
                .instrs_in_order()
                .into_iter()
                .filter_map(|id| shader.intrinsic(id).map(|i| (i.op.name(), i.idx.base)))
                .collect::<Vec<_>>()
        };
        insta::assert_debug_snapshot!((waits(200), waits(40), waits(64)), @r#"
        (
            [
                (
                    "sleep_amd",
                    3,
                ),
                (
                    "nop_amd",
                    7,
                ),
            ],
            [
                (
                    "nop_amd",
                    15,
                ),
                (
                    "nop_amd",
                    15,
                ),
                (
                    "nop_amd",
                    7,
                ),
            ],
            [
                (
                    "sleep_amd",
                    1,
                ),
            ],
        )
        "#);
    }
}
