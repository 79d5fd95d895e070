//! Address helpers shared by the LDS and ring layouts.

use nir::{Builder, Def};

/// Driver callback mapping a varying slot to its location in an unlinked layout.
pub type MapIoFn<'a> = Option<&'a dyn Fn(u32) -> u32>;

/// Dense index of `location` among the locations set in `mask`.
///
/// With a callback the driver decides instead; that is used when the consumer stage is not
/// known at compile time.
pub fn map_io_location(location: u32, mask: u64, map_io: MapIoFn<'_>) -> u32 {
    if let Some(map_io) = map_io {
        return map_io(location);
    }
    assert!(
        location < 64 && mask & (1u64 << location) != 0,
        "location {location} is not in the usage mask {mask:#x}"
    );
    (mask & ((1u64 << location) - 1)).count_ones()
}

/// `base_stride * mapped + base_stride * io_offset + component * component_stride`.
///
/// The additions are marked no-unsigned-wrap.
pub fn calc_io_offset(
    b: &mut Builder,
    component: u32,
    io_offset: Def,
    base_stride: Def,
    component_stride: u32,
    mapped: u32,
) -> Def {
    let base_off = b.imul_imm(base_stride, mapped as u64);
    let io_off = b.imul(base_stride, io_offset);
    let sum = b.iadd_nuw(base_off, io_off);
    b.iadd_imm_nuw(sum, (component * component_stride) as u64)
}

/// Stores `value`, splitting sub-dword values into one store per component.
///
/// `store` receives `(value, const_offset, write_mask)`. A 16-bit component lands at
/// `const_offset + c * 4`, plus 2 for the high half.
pub fn store_io(
    b: &mut Builder,
    value: Def,
    const_offset: u32,
    write_mask: u32,
    hi_16bit: bool,
    mut store: impl FnMut(&mut Builder, Def, u32, u32),
) {
    if b.bit_size(value) >= 32 {
        store(b, value, const_offset, write_mask);
        return;
    }
    for c in 0..b.num_components(value) as u32 {
        if write_mask & (1 << c) == 0 {
            continue;
        }
        let comp = b.channel(value, c as u8);
        let offset = const_offset + c * 4 + if hi_16bit { 2 } else { 0 };
        store(b, comp, offset, 0x1);
    }
}

/// Loads `num_components` values of at least 32 bits and unpacks the requested 16-bit half.
pub fn load_io(
    b: &mut Builder,
    num_components: u8,
    bit_size: u8,
    hi_16bit: bool,
    load: impl FnOnce(&mut Builder, u8, u8) -> Def,
) -> Def {
    let load_bit_size = bit_size.max(32);
    let value = load(b, num_components, load_bit_size);
    if bit_size >= load_bit_size {
        value
    } else if hi_16bit {
        b.unpack_32_2x16_split_y(value)
    } else {
        b.unpack_32_2x16_split_x(value)
    }
}

/// Consecutive runs of set bits as `(start, count)`, lowest first.
pub(crate) fn consecutive_ranges(mut mask: u32) -> impl Iterator<Item = (u32, u32)> {
    std::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let start = mask.trailing_zeros();
        let count = (mask >> start).trailing_ones();
        mask &= !(((1u64 << count) - 1) as u32) << start;
        Some((start, count))
    })
}
