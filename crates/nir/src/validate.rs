//! Structural IR checks, run by tests after every pass.

use thiserror::Error;

use crate::intrinsics::Intrinsic;
use crate::ir::{BlockId, CfNode, CfParent, Def, InstrId, InstrKind, Shader};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("instruction {instr:?} reads {def:?} before it is defined")]
    UseBeforeDef { instr: InstrId, def: Def },
    #[error("instruction {instr:?} reads {def:?} whose producer was removed")]
    RemovedSource { instr: InstrId, def: Def },
    #[error("instruction {instr:?} is listed in {listed:?} but records block {recorded:?}")]
    BlockMismatch {
        instr: InstrId,
        listed: BlockId,
        recorded: BlockId,
    },
    #[error("phi {instr:?} is not at the start of its block")]
    PhiNotAtStart { instr: InstrId },
    #[error("instruction {instr:?} swizzles component {component} of a {num_components}-component value")]
    SwizzleOutOfRange {
        instr: InstrId,
        component: u8,
        num_components: u8,
    },
    #[error("{name} has {actual} sources, expected {expected}")]
    SourceCount {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{name} must be in top-level control flow")]
    ArgStoreNotTopLevel { name: &'static str },
    #[error("CF list of {parent:?} does not alternate blocks and control flow")]
    MalformedCfList { parent: CfParent },
}

pub fn validate(shader: &Shader) -> Result<(), ValidationError> {
    validate_cf(shader, &shader.body, CfParent::Function)?;

    let mut defined = vec![false; shader.defs.len()];
    for block in shader.blocks_in_order() {
        let mut seen_non_phi = false;
        for &id in &shader.block(block).instrs {
            let instr = shader.instr(id);
            if instr.block != block {
                return Err(ValidationError::BlockMismatch {
                    instr: id,
                    listed: block,
                    recorded: instr.block,
                });
            }

            match &instr.kind {
                InstrKind::Phi(_) => {
                    if seen_non_phi {
                        return Err(ValidationError::PhiNotAtStart { instr: id });
                    }
                }
                _ => seen_non_phi = true,
            }

            for src in instr.srcs() {
                if shader.instr(shader.parent_instr(src)).is_removed() {
                    return Err(ValidationError::RemovedSource { instr: id, def: src });
                }
                if !defined[src.index()] {
                    return Err(ValidationError::UseBeforeDef { instr: id, def: src });
                }
            }

            match &instr.kind {
                InstrKind::Alu(alu) => {
                    let nc = shader.num_components(alu.def) as usize;
                    for src in &alu.srcs {
                        let src_nc = shader.num_components(src.def);
                        let used = match alu.op {
                            crate::ir::AluOp::Vec => 1,
                            crate::ir::AluOp::Fdot4 => 4,
                            _ => nc,
                        };
                        if let Some(&c) = src.swizzle[..used].iter().find(|&&c| c >= src_nc) {
                            return Err(ValidationError::SwizzleOutOfRange {
                                instr: id,
                                component: c,
                                num_components: src_nc,
                            });
                        }
                    }
                }
                InstrKind::Intrinsic(intr) => {
                    if intr.srcs.len() != intr.op.num_srcs() {
                        return Err(ValidationError::SourceCount {
                            name: intr.op.name(),
                            expected: intr.op.num_srcs(),
                            actual: intr.srcs.len(),
                        });
                    }
                    if matches!(intr.op, Intrinsic::StoreScalarArgAmd | Intrinsic::StoreVectorArgAmd)
                        && shader.is_nested(block)
                    {
                        return Err(ValidationError::ArgStoreNotTopLevel {
                            name: intr.op.name(),
                        });
                    }
                }
                _ => {}
            }

            if let Some(def) = instr.def() {
                defined[def.index()] = true;
            }
        }
    }
    Ok(())
}

fn validate_cf(shader: &Shader, list: &[CfNode], parent: CfParent) -> Result<(), ValidationError> {
    let malformed = || ValidationError::MalformedCfList { parent };
    if !matches!(list.first(), Some(CfNode::Block(_))) || !matches!(list.last(), Some(CfNode::Block(_))) {
        return Err(malformed());
    }
    for pair in list.windows(2) {
        if matches!(pair[0], CfNode::Block(_)) == matches!(pair[1], CfNode::Block(_)) {
            return Err(malformed());
        }
    }
    for node in list {
        match *node {
            CfNode::Block(b) => {
                if shader.block(b).parent != parent {
                    return Err(malformed());
                }
            }
            CfNode::If(id) => {
                let nif = shader.if_node(id);
                validate_cf(shader, &nif.then_list, CfParent::Then(id))?;
                validate_cf(shader, &nif.else_list, CfParent::Else(id))?;
            }
            CfNode::Loop(id) => validate_cf(shader, &shader.loop_node(id).body, CfParent::Loop(id))?,
        }
    }
    Ok(())
}
