//! A compact SSA shader IR shaped after Mesa's NIR.
//!
//! The AMD lowering passes in `ac-nir` only need a narrow slice of a real compiler IR:
//! - SSA values with a component count and bit size,
//! - ALU and intrinsic instructions with a typed index record,
//! - structured control flow (blocks, `if`, `loop`) with phis after an `if`,
//! - a cursor based [`Builder`] that constant-folds when every operand is known,
//! - "rewrite every instruction matching P" pass plumbing ([`pass`]),
//! - a divergence oracle ([`divergence`]) and a validator ([`validate()`]).
//!
//! The TCS control-flow summary used by tessellation lowering lives in [`tcs_info`].

pub mod builder;
pub mod divergence;
pub mod eval;
pub mod fold;
pub mod intrinsics;
pub mod ir;
pub mod pass;
pub mod print;
pub mod tcs_info;
pub mod types;
pub mod validate;
pub mod varying;

pub use builder::{Builder, Cursor, IntrinsicBuilder};
pub use divergence::divergence_analysis;
pub use eval::{eval, eval_u32};
pub use intrinsics::Intrinsic;
pub use ir::{
    Access, AluInstr, AluOp, AluSrc, AtomicOp, Block, BlockId, CfNode, CfParent, Def, DefData,
    IfId, IfNode, Indices, Instr, InstrId, InstrKind, IntrinsicInstr, IoSemantics, Jump, LoopId,
    LoopNode, MemoryModes, MemorySemantics, Phi, ReduceOp, Scope, Shader, VarId, Variable,
};
pub use pass::{intrinsics_pass, lower_instructions, Lowered};
pub use tcs_info::{gather_tcs_info, TcsInfo};
pub use types::{
    AluType, BaseType, GsInfo, GsPrimitive, ShaderInfo, Stage, TessInfo, TessPrimitiveMode,
    TessSpacing, XfbBuffer, XfbInfo, XfbOutput,
};
pub use validate::{validate, ValidationError};
