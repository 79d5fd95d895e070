//! Core IR data structures.
//!
//! Everything is stored in arenas owned by [`Shader`] and addressed by small copyable ids.
//! Control flow is structured: a CF list always starts and ends with a block, and blocks
//! alternate with `if`/`loop` nodes, so the block following an `if` is where its phis live.

use bitflags::bitflags;

use crate::intrinsics::Intrinsic;
use crate::types::{AluType, ShaderInfo, Stage, XfbInfo};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

id_type!(
    /// An SSA value.
    Def
);
id_type!(InstrId);
id_type!(BlockId);
id_type!(IfId);
id_type!(LoopId);
id_type!(
    /// A function-temporary variable.
    VarId
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefData {
    pub num_components: u8,
    pub bit_size: u8,
    pub parent: InstrId,
    /// Set by [`crate::divergence::divergence_analysis`].
    pub divergent: bool,
}

bitflags! {
    /// Memory access qualifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Access: u32 {
        const COHERENT = 1 << 0;
        const VOLATILE = 1 << 1;
        const RESTRICT = 1 << 2;
        const NON_WRITEABLE = 1 << 3;
        const NON_READABLE = 1 << 4;
        const CAN_REORDER = 1 << 5;
        const NON_TEMPORAL = 1 << 6;
        const INCLUDE_HELPERS = 1 << 7;
        /// Buffer access uses the swizzled (per-lane interleaved) addressing mode.
        const IS_SWIZZLED = 1 << 8;
        const USES_FORMAT = 1 << 9;
        const CAN_SPECULATE = 1 << 10;
        /// Coherent with the fixed-function geometry engine (tess factor ring).
        const CP_GE_COHERENT = 1 << 11;
        /// Load is executed on the scalar memory path.
        const SMEM = 1 << 12;
        const MAY_STORE_SUBDWORD = 1 << 13;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryModes: u32 {
        const SHADER_IN = 1 << 0;
        const SHADER_OUT = 1 << 1;
        const SHARED = 1 << 2;
        const SSBO = 1 << 3;
        const GLOBAL = 1 << 4;
        const IMAGE = 1 << 5;
        const UBO = 1 << 6;
        const PUSH_CONST = 1 << 7;
        const FUNCTION_TEMP = 1 << 8;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemorySemantics: u8 {
        const ACQUIRE = 1 << 0;
        const RELEASE = 1 << 1;
        const ACQ_REL = Self::ACQUIRE.bits() | Self::RELEASE.bits();
    }
}

/// Execution/memory scope, ordered from narrowest to widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Scope {
    #[default]
    None,
    Invocation,
    Subgroup,
    Workgroup,
    QueueFamily,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AtomicOp {
    #[default]
    Iadd,
    Iand,
    Ior,
    Umin,
    Umax,
    Xchg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReduceOp {
    #[default]
    Iadd,
    Iand,
    Ior,
    Umin,
    Umax,
}

/// I/O semantics attached to `load_input`/`store_output` style intrinsics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IoSemantics {
    pub location: u32,
    pub num_slots: u8,
    /// The access addresses the upper half of a 32-bit lane (16-bit I/O).
    pub high_16bits: bool,
    /// The output is not consumed as an interpolated varying.
    pub no_varying: bool,
    /// The output is not consumed as a fixed-function system value.
    pub no_sysval_output: bool,
    /// GS vertex stream per written component, 2 bits each.
    pub gs_streams: u8,
}

/// Constant indices of an intrinsic. Fields an intrinsic doesn't use stay at their default.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Indices {
    pub base: i32,
    pub component: u8,
    pub write_mask: u32,
    pub io: IoSemantics,
    pub src_type: AluType,
    pub access: Access,
    pub align_mul: u32,
    pub align_offset: u32,
    pub memory_modes: MemoryModes,
    pub execution_scope: Scope,
    pub memory_scope: Scope,
    pub memory_semantics: MemorySemantics,
    pub stream_id: u32,
    pub ucp_id: u32,
    /// Known exclusive upper bound of an argument load, 0 when unknown.
    pub arg_upper_bound: u32,
    pub flags: u32,
    pub atomic_op: AtomicOp,
    pub reduction_op: ReduceOp,
    pub var: Option<VarId>,
}

impl Indices {
    /// Largest power of two known to divide the accessed address.
    pub fn align(&self) -> u32 {
        if self.align_offset != 0 {
            1 << self.align_offset.trailing_zeros()
        } else {
            self.align_mul.max(1)
        }
    }
}

/// ALU opcodes. Folding rules live in [`crate::fold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Mov,
    Vec,
    Iadd,
    Isub,
    Imul,
    Ineg,
    Iand,
    Ior,
    Ixor,
    Inot,
    Ishl,
    Ushr,
    Ishr,
    Umin,
    Umax,
    Imin,
    Imax,
    Udiv,
    Umod,
    Ubfe,
    Ibfe,
    Bcsel,
    Ieq,
    Ine,
    Ult,
    Uge,
    Ilt,
    Ige,
    Feq,
    Fneu,
    Flt,
    Fge,
    /// Unordered `>=`: true if either operand is NaN.
    Fgeu,
    Fadd,
    Fmul,
    Fneg,
    Fmin,
    Fmax,
    Fsat,
    Fdot4,
    B2i32,
    U2u(u8),
    I2i(u8),
    F2f(u8),
    Pack32_2x16Split,
    Unpack32_2x16SplitX,
    Unpack32_2x16SplitY,
    BitCount,
    /// `((hi << 32 | lo) >> ((shift & 3) * 8))` truncated to 32 bits.
    AlignbyteAmd,
}

impl AluOp {
    pub fn name(self) -> String {
        match self {
            AluOp::U2u(bits) => format!("u2u{bits}"),
            AluOp::I2i(bits) => format!("i2i{bits}"),
            AluOp::F2f(bits) => format!("f2f{bits}"),
            other => {
                let debug = format!("{other:?}");
                let mut out = String::with_capacity(debug.len() + 4);
                for (i, ch) in debug.chars().enumerate() {
                    if ch.is_ascii_uppercase() && i != 0 {
                        out.push('_');
                    }
                    out.push(ch.to_ascii_lowercase());
                }
                out
            }
        }
    }

    pub fn num_srcs(self) -> Option<usize> {
        match self {
            AluOp::Mov
            | AluOp::Ineg
            | AluOp::Inot
            | AluOp::Fneg
            | AluOp::Fsat
            | AluOp::B2i32
            | AluOp::U2u(_)
            | AluOp::I2i(_)
            | AluOp::F2f(_)
            | AluOp::Unpack32_2x16SplitX
            | AluOp::Unpack32_2x16SplitY
            | AluOp::BitCount => Some(1),
            AluOp::Ubfe | AluOp::Ibfe | AluOp::Bcsel | AluOp::AlignbyteAmd => Some(3),
            AluOp::Vec => None,
            _ => Some(2),
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            AluOp::Ieq
                | AluOp::Ine
                | AluOp::Ult
                | AluOp::Uge
                | AluOp::Ilt
                | AluOp::Ige
                | AluOp::Feq
                | AluOp::Fneu
                | AluOp::Flt
                | AluOp::Fge
                | AluOp::Fgeu
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluSrc {
    pub def: Def,
    pub swizzle: [u8; 16],
}

impl AluSrc {
    pub const IDENTITY: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

    pub fn new(def: Def) -> Self {
        Self {
            def,
            swizzle: Self::IDENTITY,
        }
    }

    /// Reads component `c` for every destination component.
    pub fn broadcast(def: Def, c: u8) -> Self {
        Self {
            def,
            swizzle: [c; 16],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AluInstr {
    pub op: AluOp,
    pub def: Def,
    pub srcs: Vec<AluSrc>,
    pub no_unsigned_wrap: bool,
    pub exact: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicInstr {
    pub op: Intrinsic,
    pub def: Option<Def>,
    pub srcs: Vec<Def>,
    /// Components of the destination, or of the stored value for stores.
    pub num_components: u8,
    pub idx: Indices,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    pub def: Def,
    /// `(predecessor block, value)` pairs.
    pub srcs: Vec<(BlockId, Def)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jump {
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    Alu(AluInstr),
    Intrinsic(IntrinsicInstr),
    LoadConst { def: Def, values: Vec<u64> },
    Undef(Def),
    Phi(Phi),
    Jump(Jump),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub block: BlockId,
    pub kind: InstrKind,
    /// Scratch storage owned by whichever pass is currently running.
    pub pass_flags: u8,
    pub(crate) removed: bool,
}

impl Instr {
    pub fn def(&self) -> Option<Def> {
        match &self.kind {
            InstrKind::Alu(alu) => Some(alu.def),
            InstrKind::Intrinsic(intr) => intr.def,
            InstrKind::LoadConst { def, .. } | InstrKind::Undef(def) => Some(*def),
            InstrKind::Phi(phi) => Some(phi.def),
            InstrKind::Jump(_) => None,
        }
    }

    pub fn srcs(&self) -> Vec<Def> {
        match &self.kind {
            InstrKind::Alu(alu) => alu.srcs.iter().map(|s| s.def).collect(),
            InstrKind::Intrinsic(intr) => intr.srcs.clone(),
            InstrKind::Phi(phi) => phi.srcs.iter().map(|(_, d)| *d).collect(),
            InstrKind::LoadConst { .. } | InstrKind::Undef(_) | InstrKind::Jump(_) => Vec::new(),
        }
    }

    pub(crate) fn for_each_src_mut(&mut self, mut f: impl FnMut(&mut Def)) {
        match &mut self.kind {
            InstrKind::Alu(alu) => alu.srcs.iter_mut().for_each(|s| f(&mut s.def)),
            InstrKind::Intrinsic(intr) => intr.srcs.iter_mut().for_each(f),
            InstrKind::Phi(phi) => phi.srcs.iter_mut().for_each(|(_, d)| f(d)),
            InstrKind::LoadConst { .. } | InstrKind::Undef(_) | InstrKind::Jump(_) => {}
        }
    }

    pub fn as_intrinsic(&self) -> Option<&IntrinsicInstr> {
        match &self.kind {
            InstrKind::Intrinsic(intr) => Some(intr),
            _ => None,
        }
    }

    pub fn as_intrinsic_mut(&mut self) -> Option<&mut IntrinsicInstr> {
        match &mut self.kind {
            InstrKind::Intrinsic(intr) => Some(intr),
            _ => None,
        }
    }

    pub fn as_alu(&self) -> Option<&AluInstr> {
        match &self.kind {
            InstrKind::Alu(alu) => Some(alu),
            _ => None,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

/// Where a CF list lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfParent {
    Function,
    Then(IfId),
    Else(IfId),
    Loop(LoopId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CfNode {
    Block(BlockId),
    If(IfId),
    Loop(LoopId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub instrs: Vec<InstrId>,
    pub parent: CfParent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfNode {
    pub condition: Def,
    pub then_list: Vec<CfNode>,
    pub else_list: Vec<CfNode>,
    pub parent: CfParent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopNode {
    pub body: Vec<CfNode>,
    pub parent: CfParent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub num_components: u8,
    pub bit_size: u8,
}

/// A single-function shader.
#[derive(Debug, Clone)]
pub struct Shader {
    pub info: ShaderInfo,
    pub name: String,
    pub xfb_info: Option<XfbInfo>,
    pub(crate) body: Vec<CfNode>,
    pub(crate) defs: Vec<DefData>,
    pub(crate) instrs: Vec<Instr>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) ifs: Vec<IfNode>,
    pub(crate) loops: Vec<LoopNode>,
    pub(crate) variables: Vec<Variable>,
}

impl Shader {
    pub fn new(stage: Stage, name: impl Into<String>) -> Self {
        let mut shader = Self {
            info: ShaderInfo::new(stage),
            name: name.into(),
            xfb_info: None,
            body: Vec::new(),
            defs: Vec::new(),
            instrs: Vec::new(),
            blocks: Vec::new(),
            ifs: Vec::new(),
            loops: Vec::new(),
            variables: Vec::new(),
        };
        let start = shader.new_block(CfParent::Function);
        shader.body.push(CfNode::Block(start));
        shader
    }

    pub fn stage(&self) -> Stage {
        self.info.stage
    }

    pub fn body(&self) -> &[CfNode] {
        &self.body
    }

    pub fn def(&self, def: Def) -> &DefData {
        &self.defs[def.index()]
    }

    pub fn num_components(&self, def: Def) -> u8 {
        self.defs[def.index()].num_components
    }

    pub fn bit_size(&self, def: Def) -> u8 {
        self.defs[def.index()].bit_size
    }

    pub fn is_divergent(&self, def: Def) -> bool {
        self.defs[def.index()].divergent
    }

    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.index()]
    }

    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.index()]
    }

    pub fn intrinsic(&self, id: InstrId) -> Option<&IntrinsicInstr> {
        self.instrs[id.index()].as_intrinsic()
    }

    pub fn intrinsic_mut(&mut self, id: InstrId) -> Option<&mut IntrinsicInstr> {
        self.instrs[id.index()].as_intrinsic_mut()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn if_node(&self, id: IfId) -> &IfNode {
        &self.ifs[id.index()]
    }

    pub fn loop_node(&self, id: LoopId) -> &LoopNode {
        &self.loops[id.index()]
    }

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.index()]
    }

    pub fn add_variable(&mut self, name: impl Into<String>, num_components: u8, bit_size: u8) -> VarId {
        let id = VarId(self.variables.len() as u32);
        self.variables.push(Variable {
            name: name.into(),
            num_components,
            bit_size,
        });
        id
    }

    /// The instruction producing `def`.
    pub fn parent_instr(&self, def: Def) -> InstrId {
        self.defs[def.index()].parent
    }

    /// Intrinsic producing `def`, if any.
    pub fn def_intrinsic(&self, def: Def) -> Option<&IntrinsicInstr> {
        self.intrinsic(self.parent_instr(def))
    }

    /// Raw constant bits of `def` when it is produced by a `load_const`.
    pub fn const_value(&self, def: Def) -> Option<&[u64]> {
        match &self.instr(self.parent_instr(def)).kind {
            InstrKind::LoadConst { values, .. } => Some(values),
            _ => None,
        }
    }

    pub fn const_component(&self, def: Def, c: usize) -> Option<u64> {
        self.const_value(def).and_then(|v| v.get(c).copied())
    }

    /// Scalar constant as an unsigned integer.
    pub fn const_u32(&self, def: Def) -> Option<u32> {
        self.const_component(def, 0).map(|v| v as u32)
    }

    pub fn is_undef(&self, def: Def) -> bool {
        matches!(self.instr(self.parent_instr(def)).kind, InstrKind::Undef(_))
    }

    pub fn cf_list(&self, parent: CfParent) -> &[CfNode] {
        match parent {
            CfParent::Function => &self.body,
            CfParent::Then(id) => &self.ifs[id.index()].then_list,
            CfParent::Else(id) => &self.ifs[id.index()].else_list,
            CfParent::Loop(id) => &self.loops[id.index()].body,
        }
    }

    pub(crate) fn cf_list_mut(&mut self, parent: CfParent) -> &mut Vec<CfNode> {
        match parent {
            CfParent::Function => &mut self.body,
            CfParent::Then(id) => &mut self.ifs[id.index()].then_list,
            CfParent::Else(id) => &mut self.ifs[id.index()].else_list,
            CfParent::Loop(id) => &mut self.loops[id.index()].body,
        }
    }

    pub fn start_block(&self) -> BlockId {
        match self.body.first() {
            Some(CfNode::Block(b)) => *b,
            _ => unreachable!("function body must start with a block"),
        }
    }

    pub fn end_block(&self) -> BlockId {
        match self.body.last() {
            Some(CfNode::Block(b)) => *b,
            _ => unreachable!("function body must end with a block"),
        }
    }

    pub fn first_block_of(&self, list: &[CfNode]) -> BlockId {
        match list.first() {
            Some(CfNode::Block(b)) => *b,
            _ => unreachable!("CF list must start with a block"),
        }
    }

    pub fn last_block_of(&self, list: &[CfNode]) -> BlockId {
        match list.last() {
            Some(CfNode::Block(b)) => *b,
            _ => unreachable!("CF list must end with a block"),
        }
    }

    pub fn is_top_level_block(&self, block: BlockId) -> bool {
        self.blocks[block.index()].parent == CfParent::Function
    }

    /// Whether `block` sits inside any `if` or `loop`.
    pub fn is_nested(&self, block: BlockId) -> bool {
        !self.is_top_level_block(block)
    }

    /// The `if` immediately preceding `block` in its CF list.
    pub fn preceding_if(&self, block: BlockId) -> Option<IfId> {
        let list = self.cf_list(self.blocks[block.index()].parent);
        let pos = list.iter().position(|n| *n == CfNode::Block(block))?;
        match pos.checked_sub(1).map(|p| list[p]) {
            Some(CfNode::If(id)) => Some(id),
            _ => None,
        }
    }

    /// Every live instruction in program order.
    pub fn instrs_in_order(&self) -> Vec<InstrId> {
        self.blocks_in_order()
            .into_iter()
            .flat_map(|b| self.blocks[b.index()].instrs.iter().copied())
            .collect()
    }

    pub fn blocks_in_order(&self) -> Vec<BlockId> {
        let mut out = Vec::new();
        self.collect_blocks(&self.body, &mut out);
        out
    }

    fn collect_blocks(&self, list: &[CfNode], out: &mut Vec<BlockId>) {
        for node in list {
            match *node {
                CfNode::Block(b) => out.push(b),
                CfNode::If(id) => {
                    let nif = &self.ifs[id.index()];
                    self.collect_blocks(&nif.then_list, out);
                    self.collect_blocks(&nif.else_list, out);
                }
                CfNode::Loop(id) => self.collect_blocks(&self.loops[id.index()].body, out),
            }
        }
    }

    /// All live intrinsics of kind `op`, in program order.
    pub fn find_intrinsics(&self, op: Intrinsic) -> Vec<InstrId> {
        self.instrs_in_order()
            .into_iter()
            .filter(|&id| self.intrinsic(id).is_some_and(|intr| intr.op == op))
            .collect()
    }

    pub fn count_intrinsics(&self, op: Intrinsic) -> usize {
        self.find_intrinsics(op).len()
    }

    /// Replaces every use of `old` with `new`.
    pub fn rewrite_uses(&mut self, old: Def, new: Def) {
        if old == new {
            return;
        }
        for instr in self.instrs.iter_mut().filter(|i| !i.removed) {
            instr.for_each_src_mut(|d| {
                if *d == old {
                    *d = new;
                }
            });
        }
        for nif in &mut self.ifs {
            if nif.condition == old {
                nif.condition = new;
            }
        }
    }

    /// Whether any live instruction or `if` condition reads `def`.
    pub fn has_uses(&self, def: Def) -> bool {
        self.instrs
            .iter()
            .filter(|i| !i.removed)
            .any(|i| i.srcs().contains(&def))
            || self.ifs.iter().any(|nif| nif.condition == def)
    }

    pub fn remove_instr(&mut self, id: InstrId) {
        let block = self.instrs[id.index()].block;
        self.blocks[block.index()].instrs.retain(|&i| i != id);
        self.instrs[id.index()].removed = true;
    }

    /// Detaches the whole function body, leaving a single empty block behind.
    pub fn extract_body(&mut self) -> Vec<CfNode> {
        let start = self.new_block(CfParent::Function);
        std::mem::replace(&mut self.body, vec![CfNode::Block(start)])
    }

    pub(crate) fn new_block(&mut self, parent: CfParent) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            instrs: Vec::new(),
            parent,
        });
        id
    }

    pub(crate) fn next_instr_id(&self) -> InstrId {
        InstrId(self.instrs.len() as u32)
    }

    pub(crate) fn new_def(&mut self, num_components: u8, bit_size: u8, parent: InstrId) -> Def {
        assert!(
            (1..=16).contains(&num_components),
            "invalid component count {num_components}"
        );
        assert!(
            matches!(bit_size, 1 | 8 | 16 | 32 | 64),
            "invalid bit size {bit_size}"
        );
        let id = Def(self.defs.len() as u32);
        self.defs.push(DefData {
            num_components,
            bit_size,
            parent,
            divergent: false,
        });
        id
    }

    pub(crate) fn push_instr(&mut self, block: BlockId, kind: InstrKind) -> InstrId {
        let id = self.next_instr_id();
        self.instrs.push(Instr {
            block,
            kind,
            pass_flags: 0,
            removed: false,
        });
        id
    }

    /// Re-parents the top-level nodes of `list` to `parent`.
    pub(crate) fn reparent(&mut self, list: &[CfNode], parent: CfParent) {
        for node in list {
            match *node {
                CfNode::Block(b) => self.blocks[b.index()].parent = parent,
                CfNode::If(id) => self.ifs[id.index()].parent = parent,
                CfNode::Loop(id) => self.loops[id.index()].parent = parent,
            }
        }
    }

    /// Clears `pass_flags` on every instruction.
    pub fn clear_pass_flags(&mut self) {
        for instr in &mut self.instrs {
            instr.pass_flags = 0;
        }
    }
}
