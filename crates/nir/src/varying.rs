//! Varying slot numbering.
//!
//! Slots `0..64` are tracked by `outputs_written`/`inputs_read`, per-patch slots by the
//! `patch_*` masks (relative to [`PATCH0`]) and the dedicated 16-bit slots by the `*_16bit`
//! masks (relative to [`VAR0_16BIT`]).

pub const POS: u32 = 0;
pub const COL0: u32 = 1;
pub const COL1: u32 = 2;
pub const FOGC: u32 = 3;
pub const TEX0: u32 = 4;
pub const PSIZ: u32 = 12;
pub const BFC0: u32 = 13;
pub const BFC1: u32 = 14;
pub const EDGE: u32 = 15;
pub const CLIP_VERTEX: u32 = 16;
pub const CLIP_DIST0: u32 = 17;
pub const CLIP_DIST1: u32 = 18;
pub const CULL_DIST0: u32 = 19;
pub const CULL_DIST1: u32 = 20;
pub const PRIMITIVE_ID: u32 = 21;
pub const LAYER: u32 = 22;
pub const VIEWPORT: u32 = 23;
pub const FACE: u32 = 24;
/// Shares its number with [`FACE`], which is never a pre-rasterization output.
pub const PRIMITIVE_SHADING_RATE: u32 = FACE;
pub const PNTC: u32 = 25;
pub const TESS_LEVEL_OUTER: u32 = 26;
pub const TESS_LEVEL_INNER: u32 = 27;
pub const BOUNDING_BOX0: u32 = 28;
pub const BOUNDING_BOX1: u32 = 29;
pub const VIEW_INDEX: u32 = 30;
pub const VIEWPORT_MASK: u32 = 31;
pub const VAR0: u32 = 32;
pub const VAR31: u32 = 63;
pub const PATCH0: u32 = 64;
pub const PATCH31: u32 = 95;
pub const VAR0_16BIT: u32 = 96;
pub const VAR15_16BIT: u32 = 111;
pub const NUM_TOTAL_SLOTS: u32 = 112;

/// Number of 64-bit-mask tracked slots.
pub const NUM_SLOTS: usize = 64;
pub const NUM_16BIT_SLOTS: usize = 16;

pub const fn bit(slot: u32) -> u64 {
    1u64 << slot
}

pub fn is_patch(slot: u32) -> bool {
    (PATCH0..=PATCH31).contains(&slot)
}

pub fn is_16bit(slot: u32) -> bool {
    (VAR0_16BIT..=VAR15_16BIT).contains(&slot)
}

pub fn is_tess_level(slot: u32) -> bool {
    slot == TESS_LEVEL_OUTER || slot == TESS_LEVEL_INNER
}

pub fn is_per_patch(slot: u32) -> bool {
    is_patch(slot) || is_tess_level(slot)
}

/// Short name used by the IR printer.
pub fn name(slot: u32) -> String {
    match slot {
        POS => "POS".into(),
        COL0 => "COL0".into(),
        COL1 => "COL1".into(),
        FOGC => "FOGC".into(),
        PSIZ => "PSIZ".into(),
        BFC0 => "BFC0".into(),
        BFC1 => "BFC1".into(),
        EDGE => "EDGE".into(),
        CLIP_VERTEX => "CLIP_VERTEX".into(),
        CLIP_DIST0 => "CLIP_DIST0".into(),
        CLIP_DIST1 => "CLIP_DIST1".into(),
        CULL_DIST0 => "CULL_DIST0".into(),
        CULL_DIST1 => "CULL_DIST1".into(),
        PRIMITIVE_ID => "PRIMITIVE_ID".into(),
        LAYER => "LAYER".into(),
        VIEWPORT => "VIEWPORT".into(),
        FACE => "FACE".into(),
        PNTC => "PNTC".into(),
        TESS_LEVEL_OUTER => "TESS_LEVEL_OUTER".into(),
        TESS_LEVEL_INNER => "TESS_LEVEL_INNER".into(),
        s if (TEX0..TEX0 + 8).contains(&s) => format!("TEX{}", s - TEX0),
        s if (VAR0..=VAR31).contains(&s) => format!("VAR{}", s - VAR0),
        s if is_patch(s) => format!("PATCH{}", s - PATCH0),
        s if is_16bit(s) => format!("VAR{}_16BIT", s - VAR0_16BIT),
        s => format!("SLOT{s}"),
    }
}
