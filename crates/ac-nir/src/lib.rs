//! Lowering of cross-stage shader I/O to AMD hardware.
//!
//! The passes in this crate rewrite the abstract `load_input`/`store_output` family of
//! intrinsics into the LDS accesses, ring buffer stores, exports and messages that the
//! hardware stages actually execute:
//! - [`esgs`]: ES outputs and GS inputs (ESGS ring on GFX6-8, LDS on GFX9+),
//! - [`tess`]: LS outputs, HS inputs/outputs, the HS finale with the tess factor vote, and
//!   TES inputs,
//! - [`legacy_vs`], [`legacy_gs`] and [`gs_copy_shader`]: the non-NGG epilogues,
//! - [`mem_access`]: late legalisation of memory access sizes.
//!
//! Shader arguments are described by [`args::ShaderArgs`]; device constants by
//! [`gfx::GpuInfo`].

pub mod args;
pub mod error;
pub mod esgs;
pub mod gfx;
pub mod gs_copy_shader;
pub mod hw;
pub mod io;
pub mod legacy_gs;
pub mod legacy_vs;
pub mod mem_access;
pub mod prerast;
pub mod query;
pub mod streamout;
pub mod tess;

pub use args::{ArgFile, ArgInfo, ArgName, ArgRef, ShaderArgs};
pub use error::{ArgLayoutError, ConfigError};
pub use gfx::{GfxLevel, GpuInfo};
pub use io::{calc_io_offset, map_io_location, MapIoFn};
pub use prerast::{PerOutputInfo, PrerastOut};

/// Wave sizes the hardware supports.
pub(crate) fn check_wave_size(wave_size: u32) -> Result<(), ConfigError> {
    match wave_size {
        32 | 64 => Ok(()),
        _ => Err(ConfigError::InvalidWaveSize { wave_size }),
    }
}
