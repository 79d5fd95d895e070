//! Register field encodings shared by the export, message and ring code.

/// Export targets (`V_008DFC_SQ_EXP_*`).
pub const SQ_EXP_POS: u32 = 12;
pub const SQ_EXP_PRIM: u32 = 20;
pub const SQ_EXP_PARAM: u32 = 32;

/// Highest parameter index an export can address; larger table entries mean "not exported".
pub const EXP_PARAM_OFFSET_31: u8 = 31;
/// Parameter table value for outputs that are never exported.
pub const EXP_PARAM_UNDEFINED: u8 = 255;

/// Export instruction flags.
pub const EXP_FLAG_COMPRESSED: u32 = 1 << 0;
pub const EXP_FLAG_DONE: u32 = 1 << 1;
pub const EXP_FLAG_VALID_MASK: u32 = 1 << 2;

/// `s_sendmsg` message types.
pub const SENDMSG_GS: u32 = 2;
pub const SENDMSG_GS_DONE: u32 = 3;
pub const SENDMSG_HS_TESSFACTOR: u32 = 2;

/// GS operations, ORed into the `GS`/`GS_DONE` message together with the stream in bits 8-9.
pub const SENDMSG_GS_OP_NOP: u32 = 0 << 4;
pub const SENDMSG_GS_OP_CUT: u32 = 1 << 4;
pub const SENDMSG_GS_OP_EMIT: u32 = 2 << 4;
pub const SENDMSG_GS_OP_EMIT_CUT: u32 = 3 << 4;

/// Tessellation factor ring control word written by GFX6-8 patch 0 of each workgroup.
pub const TF_RING_CONTROL_WORD: u32 = 0x8000_0000;

/// LDS bytes reserved at offset 0 of the HS workgroup for the tess level group vote.
pub const DEFAULT_TESS_LEVEL_VOTE_LDS_BYTES: u32 = 16;

/// Bit positions inside `merged_wave_info`.
pub mod merged_wave_info {
    /// Threads of the first merged stage (ES/LS) in this wave.
    pub const FIRST_STAGE_THREADS: (u32, u32) = (0, 8);
    /// Threads of the second merged stage (GS/HS) in this wave.
    pub const SECOND_STAGE_THREADS: (u32, u32) = (8, 8);
    /// Wave index inside the workgroup.
    pub const WAVE_ID: (u32, u32) = (24, 4);
}

/// Bit positions inside `streamout_config`.
pub mod streamout_config {
    pub const VERTEX_COUNT: (u32, u32) = (16, 7);
    pub const STREAM_ID: (u32, u32) = (24, 2);
}
