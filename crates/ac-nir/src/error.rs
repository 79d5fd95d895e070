use thiserror::Error;

use crate::args::{ArgFile, ArgName};
use crate::gfx::GfxLevel;

/// Invalid options handed to a lowering pass.
///
/// Everything past option validation is compiler-internal and fails fast instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("wave size {wave_size} is not 32 or 64")]
    InvalidWaveSize { wave_size: u32 },

    #[error("tess level vote LDS header of {bytes} bytes is not a multiple of 4")]
    MisalignedVoteHeader { bytes: u32 },

    #[error("{feature} is not supported on {gfx_level}")]
    UnsupportedGfxLevel {
        feature: &'static str,
        gfx_level: GfxLevel,
    },

    #[error("parameter offset table has {len} entries, {needed} required")]
    ParamOffsetsTooShort { len: usize, needed: usize },

    #[error("clip/cull distance mask {mask:#x} uses more than 8 distances")]
    ClipCullMaskOverflow { mask: u32 },

    #[error("invalid option: {0}")]
    Invalid(&'static str),
}

/// Argument layout construction failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArgLayoutError {
    #[error("{file:?} usage {used} exceeds the limit of {max} registers")]
    TooManyRegisters { file: ArgFile, used: u32, max: u32 },

    #[error("argument {name:?} declared twice")]
    Duplicate { name: ArgName },

    #[error("argument size {size} is not in 1..=4 registers")]
    InvalidSize { size: u8 },
}
