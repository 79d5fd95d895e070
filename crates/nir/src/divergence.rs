//! Forward divergence analysis.
//!
//! A value is divergent when it may differ between invocations of one subgroup. The analysis
//! is a single pass in program order; loops carry no SSA values in this IR, so no fixed point
//! is needed.

use tracing::trace;

use crate::intrinsics::Intrinsic;
use crate::ir::{CfParent, InstrKind, Shader};

fn intrinsic_is_divergent(op: Intrinsic) -> Option<bool> {
    use Intrinsic::*;
    Some(match op {
        LoadVectorArgAmd | LoadLocalInvocationIndex | LoadInvocationId | LoadVertexIdZeroBase
        | LoadSubgroupInvocation | LoadGsVertexOffsetAmd | LoadTessRelPatchIdAmd | LoadPrimitiveId
        | InverseBallot | Elect | IsSubgroupInvocationLtAmd | LoadVar | SharedAtomic | SsboAtomic
        | LoadScratch | LoadPerVertexInput | LoadPerVertexOutput => true,

        LoadScalarArgAmd | LoadSubgroupId | LoadGsWaveIdAmd | LoadEsgsVertexStrideAmd
        | LoadLshsVertexStrideAmd | LoadPatchVerticesIn | LoadTcsNumPatchesAmd
        | LoadTcsMemAttribStride | LoadHsOutPatchDataOffsetAmd | LoadMergedWaveInfoAmd
        | LoadTcsPrimitiveModeAmd | LoadStreamoutConfigAmd | LoadStreamoutWriteIndexAmd
        | LoadStreamoutOffsetAmd | LoadRingGs2vsOffsetAmd | LoadRingEs2gsOffsetAmd
        | LoadRingTessOffchipOffsetAmd | LoadRingTessFactorsOffsetAmd | LoadRingAttrOffsetAmd
        | LoadForceVrsRatesAmd | LoadTcsTessLevelsToTesAmd | LoadPrimGenQueryEnabledAmd
        | LoadPipelineStatQueryEnabledAmd | LoadClampVertexColorAmd | LoadRingGsvsAmd
        | LoadRingEsgsAmd | LoadRingTessOffchipAmd | LoadRingTessFactorsAmd | LoadRingAttrAmd
        | LoadStreamoutBufferAmd | LoadUserClipPlane | LoadPushConstant | Ballot | VoteAll
        | Reduce => false,

        _ => return None,
    })
}

/// Recomputes the `divergent` flag of every def.
pub fn divergence_analysis(shader: &mut Shader) {
    for id in shader.instrs_in_order() {
        let instr = shader.instr(id);
        let Some(def) = instr.def() else { continue };
        let srcs_divergent = instr.srcs().iter().any(|&s| shader.is_divergent(s));
        let divergent = match &instr.kind {
            InstrKind::LoadConst { .. } | InstrKind::Undef(_) => false,
            InstrKind::Alu(_) => srcs_divergent,
            InstrKind::Intrinsic(intr) => {
                intrinsic_is_divergent(intr.op).unwrap_or(srcs_divergent)
            }
            InstrKind::Phi(_) => {
                let cond_divergent = shader
                    .preceding_if(instr.block)
                    .is_some_and(|nif| shader.is_divergent(shader.if_node(nif).condition));
                srcs_divergent || cond_divergent
            }
            InstrKind::Jump(_) => false,
        };
        trace!(def = def.index(), divergent, "divergence");
        shader.defs[def.index()].divergent = divergent;
    }
}

/// Whether `block` is only reached under uniform control flow.
pub fn block_is_uniform(shader: &Shader, block: crate::ir::BlockId) -> bool {
    let mut parent = shader.block(block).parent;
    loop {
        match parent {
            CfParent::Function => return true,
            CfParent::Then(nif) | CfParent::Else(nif) => {
                let node = shader.if_node(nif);
                if shader.is_divergent(node.condition) {
                    return false;
                }
                parent = node.parent;
            }
            CfParent::Loop(lp) => parent = shader.loop_node(lp).parent,
        }
    }
}
