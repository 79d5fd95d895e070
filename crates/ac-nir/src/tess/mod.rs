//! Tessellation I/O.
//!
//! ```text
//!              SW VS        SW TCS      tessellator     SW TES
//! HW stage:    LS    --->   HS    --->   fixed func  --->  VS/ES
//! memory:         LDS/VGPR      off-chip ring (VRAM)
//! ```
//!
//! LS and HS share one workgroup and its LDS (merged into one HW stage on GFX9+). The HS keeps
//! outputs it reads back in LDS and writes every output the TES reads to the off-chip ring.
//!
//! LDS of an HS workgroup:
//!
//! ```text
//! tess level vote header                  <- 0
//! per-vertex inputs of patch 0..n         <- header
//! per-vertex outputs of patch 0           <- header + n * input patch size
//! per-patch outputs of patch 0
//! per-vertex outputs of patch 1
//! ...
//! ```
//!
//! Off-chip ring:
//!
//! ```text
//! attr 0 of patch 0 vertex 0..v, patch 1 vertex 0..v, ...
//! [pad to 256 B] attr 1 ...
//! per-patch attr 0 of patch 0..n          <- hs_out_patch_data_offset, 256 B aligned
//! [pad to 256 B] per-patch attr 1 ...
//! ```

mod finale;
pub mod hs_outputs;
pub mod io_info;
mod layout;
pub mod ls_hs;
pub mod tes;
pub mod vote;
pub mod wg_info;

use nir::varying::{self, TESS_LEVEL_INNER, TESS_LEVEL_OUTER};

use crate::error::ConfigError;
use crate::hw::DEFAULT_TESS_LEVEL_VOTE_LDS_BYTES;

pub use hs_outputs::{lower_hs_outputs_to_mem, HsOutputsOptions};
pub use io_info::{get_tess_io_info, TessIoInfo};
pub use ls_hs::{lower_hs_inputs_to_mem, lower_ls_outputs_to_mem, HsInputsOptions, LsOutputsOptions};
pub use tes::{lower_tes_inputs_to_mem, TesInputsOptions};
pub use wg_info::{compute_tess_wg_info, TessWgInfo};

/// Both tess level slots.
pub const TESS_LVL_MASK: u64 = varying::bit(TESS_LEVEL_OUTER) | varying::bit(TESS_LEVEL_INNER);

/// Layout constants the driver and every tessellation pass must agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TessConfig {
    /// LDS bytes reserved at offset 0 for the tess level group vote. Everything else in LDS is
    /// placed after it.
    pub tess_level_vote_lds_bytes: u32,
}

impl Default for TessConfig {
    fn default() -> Self {
        Self {
            tess_level_vote_lds_bytes: DEFAULT_TESS_LEVEL_VOTE_LDS_BYTES,
        }
    }
}

impl TessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bytes = self.tess_level_vote_lds_bytes;
        if bytes == 0 || bytes % 4 != 0 {
            return Err(ConfigError::MisalignedVoteHeader { bytes });
        }
        Ok(())
    }
}
