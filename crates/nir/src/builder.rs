//! Cursor based instruction builder.
//!
//! Every emitted ALU instruction is constant-folded when all of its sources are `load_const`,
//! which lets tests drive the address arithmetic emitted by the lowering passes with known
//! inputs and read the result back as a constant.

use crate::fold::{self, fold_component};
use crate::intrinsics::{DestShape, Intrinsic};
use crate::ir::{
    Access, AluInstr, AluOp, AluSrc, AtomicOp, BlockId, CfNode, CfParent, Def, IfId, IfNode,
    Indices, InstrId, InstrKind, IntrinsicInstr, IoSemantics, Jump, LoopId, LoopNode, MemoryModes,
    MemorySemantics, Phi, ReduceOp, Scope, Shader, VarId,
};
use crate::types::AluType;

/// Insertion point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Before(InstrId),
    After(InstrId),
    /// After any phis at the start of the block.
    BlockStart(BlockId),
    /// Before a trailing jump, if any.
    BlockEnd(BlockId),
}

pub struct Builder<'a> {
    pub shader: &'a mut Shader,
    pub cursor: Cursor,
}

impl<'a> Builder<'a> {
    pub fn new(shader: &'a mut Shader, cursor: Cursor) -> Self {
        Self { shader, cursor }
    }

    pub fn at_start(shader: &'a mut Shader) -> Self {
        let start = shader.start_block();
        Self::new(shader, Cursor::BlockStart(start))
    }

    pub fn at_end(shader: &'a mut Shader) -> Self {
        let end = shader.end_block();
        Self::new(shader, Cursor::BlockEnd(end))
    }

    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }

    pub fn cursor_at_function_start(&mut self) {
        self.cursor = Cursor::BlockStart(self.shader.start_block());
    }

    pub fn cursor_at_function_end(&mut self) {
        self.cursor = Cursor::BlockEnd(self.shader.end_block());
    }

    pub fn cursor_block(&self) -> BlockId {
        match self.cursor {
            Cursor::Before(i) | Cursor::After(i) => self.shader.instr(i).block,
            Cursor::BlockStart(b) | Cursor::BlockEnd(b) => b,
        }
    }

    fn leading_phis(&self, block: BlockId) -> usize {
        self.shader
            .block(block)
            .instrs
            .iter()
            .take_while(|&&i| matches!(self.shader.instr(i).kind, InstrKind::Phi(_)))
            .count()
    }

    /// Index inside the cursor's block at which the next instruction lands.
    fn cursor_pos(&self) -> usize {
        let block = self.cursor_block();
        let instrs = &self.shader.block(block).instrs;
        let position = |id: InstrId| {
            instrs
                .iter()
                .position(|&i| i == id)
                .unwrap_or_else(|| panic!("cursor instruction {id:?} is not in its block"))
        };
        match self.cursor {
            Cursor::Before(i) => position(i),
            Cursor::After(i) => position(i) + 1,
            Cursor::BlockStart(b) => self.leading_phis(b),
            Cursor::BlockEnd(_) => match instrs.last() {
                Some(&last) if matches!(self.shader.instr(last).kind, InstrKind::Jump(_)) => {
                    instrs.len() - 1
                }
                _ => instrs.len(),
            },
        }
    }

    fn insert(&mut self, kind: InstrKind) -> InstrId {
        let block = self.cursor_block();
        let pos = self.cursor_pos();
        let id = self.shader.push_instr(block, kind);
        self.shader.blocks[block.index()].instrs.insert(pos, id);
        self.cursor = Cursor::After(id);
        id
    }

    /// Removes an instruction, keeping the cursor valid.
    pub fn remove(&mut self, id: InstrId) {
        let block = self.shader.instr(id).block;
        match self.cursor {
            Cursor::Before(i) | Cursor::After(i) if i == id => {
                let instrs = &self.shader.block(block).instrs;
                let pos = instrs.iter().position(|&x| x == id).unwrap_or(0);
                self.cursor = match pos.checked_sub(1).map(|p| instrs[p]) {
                    Some(prev) => Cursor::After(prev),
                    None => Cursor::BlockStart(block),
                };
            }
            _ => {}
        }
        self.shader.remove_instr(id);
    }

    pub fn rewrite_uses(&mut self, old: Def, new: Def) {
        self.shader.rewrite_uses(old, new);
    }

    pub fn num_components(&self, def: Def) -> u8 {
        self.shader.num_components(def)
    }

    pub fn bit_size(&self, def: Def) -> u8 {
        self.shader.bit_size(def)
    }

    // ---- constants ----

    pub fn imm(&mut self, values: &[u64], bit_size: u8) -> Def {
        let id = self.shader.next_instr_id();
        let def = self.shader.new_def(values.len() as u8, bit_size, id);
        let m = fold::mask(bit_size);
        let values = values.iter().map(|v| v & m).collect();
        self.insert(InstrKind::LoadConst { def, values });
        def
    }

    pub fn imm_intn(&mut self, value: i64, bit_size: u8) -> Def {
        self.imm(&[value as u64], bit_size)
    }

    pub fn imm_int(&mut self, value: i32) -> Def {
        self.imm_intn(value as i64, 32)
    }

    pub fn imm_u32(&mut self, value: u32) -> Def {
        self.imm(&[value as u64], 32)
    }

    pub fn imm_zero(&mut self, num_components: u8, bit_size: u8) -> Def {
        self.imm(&vec![0; num_components as usize], bit_size)
    }

    pub fn imm_bool(&mut self, value: bool) -> Def {
        self.imm(&[value as u64], 1)
    }

    pub fn imm_true(&mut self) -> Def {
        self.imm_bool(true)
    }

    pub fn imm_false(&mut self) -> Def {
        self.imm_bool(false)
    }

    pub fn imm_floatn(&mut self, value: f64, bit_size: u8) -> Def {
        self.imm(&[fold::write_float(value, bit_size)], bit_size)
    }

    pub fn imm_float(&mut self, value: f32) -> Def {
        self.imm_floatn(value as f64, 32)
    }

    pub fn imm_vec4_f32(&mut self, values: [f32; 4]) -> Def {
        let bits = values.map(|v| v.to_bits() as u64);
        self.imm(&bits, 32)
    }

    pub fn undef(&mut self, num_components: u8, bit_size: u8) -> Def {
        let id = self.shader.next_instr_id();
        let def = self.shader.new_def(num_components, bit_size, id);
        self.insert(InstrKind::Undef(def));
        def
    }

    // ---- ALU ----

    fn try_fold(&self, op: AluOp, srcs: &[AluSrc], nc: u8, bits: u8) -> Option<Vec<u64>> {
        let consts = srcs
            .iter()
            .map(|s| self.shader.const_value(s.def))
            .collect::<Option<Vec<_>>>()?;
        let src_bits = self.shader.bit_size(srcs[0].def);
        let pick = |k: usize, c: usize| consts[k][srcs[k].swizzle[c] as usize];
        match op {
            AluOp::Vec => Some((0..srcs.len()).map(|k| pick(k, 0)).collect()),
            AluOp::Fdot4 => {
                let vals: Vec<u64> = (0..2).flat_map(|k| (0..4).map(move |c| (k, c))).map(|(k, c)| pick(k, c)).collect();
                Some(vec![fold_component(op, &vals, src_bits, bits)])
            }
            _ => Some(
                (0..nc as usize)
                    .map(|c| {
                        let vals: Vec<u64> = (0..srcs.len()).map(|k| pick(k, c)).collect();
                        fold_component(op, &vals, src_bits, bits)
                    })
                    .collect(),
            ),
        }
    }

    /// Emits an ALU instruction with explicit sources and destination shape.
    pub fn alu_srcs(&mut self, op: AluOp, srcs: Vec<AluSrc>, nc: u8, bits: u8, nuw: bool) -> Def {
        if let Some(values) = self.try_fold(op, &srcs, nc, bits) {
            return self.imm(&values, bits);
        }
        let id = self.shader.next_instr_id();
        let def = self.shader.new_def(nc, bits, id);
        self.insert(InstrKind::Alu(AluInstr {
            op,
            def,
            srcs,
            no_unsigned_wrap: nuw,
            exact: false,
        }));
        def
    }

    fn alu_inner(&mut self, op: AluOp, srcs: &[Def], nuw: bool) -> Def {
        if let Some(n) = op.num_srcs() {
            assert_eq!(srcs.len(), n, "{} takes {n} sources", op.name());
        }
        match op {
            AluOp::Vec => {
                let bits = self.bit_size(srcs[0]);
                let alu_srcs = srcs
                    .iter()
                    .map(|&d| {
                        assert_eq!(self.num_components(d), 1, "vec sources must be scalars");
                        assert_eq!(self.bit_size(d), bits, "vec sources must share a bit size");
                        AluSrc::new(d)
                    })
                    .collect();
                self.alu_srcs(op, alu_srcs, srcs.len() as u8, bits, false)
            }
            AluOp::Fdot4 => {
                let bits = self.bit_size(srcs[0]);
                let alu_srcs = srcs.iter().map(|&d| AluSrc::new(d)).collect();
                self.alu_srcs(op, alu_srcs, 1, bits, false)
            }
            _ => {
                let nc = srcs.iter().map(|&d| self.num_components(d)).max().unwrap_or(1);
                let alu_srcs = srcs
                    .iter()
                    .map(|&d| match self.num_components(d) {
                        1 => AluSrc::broadcast(d, 0),
                        n if n == nc => AluSrc::new(d),
                        n => panic!("{} source has {n} components, expected 1 or {nc}", op.name()),
                    })
                    .collect();
                let src_bits = self.bit_size(srcs[0]);
                let bits = match op {
                    _ if op.is_comparison() => 1,
                    AluOp::Bcsel => self.bit_size(srcs[1]),
                    AluOp::U2u(n) | AluOp::I2i(n) | AluOp::F2f(n) => n,
                    AluOp::B2i32 | AluOp::Pack32_2x16Split | AluOp::BitCount | AluOp::AlignbyteAmd => 32,
                    AluOp::Unpack32_2x16SplitX | AluOp::Unpack32_2x16SplitY => 16,
                    _ => src_bits,
                };
                self.alu_srcs(op, alu_srcs, nc, bits, nuw)
            }
        }
    }

    pub fn alu(&mut self, op: AluOp, srcs: &[Def]) -> Def {
        self.alu_inner(op, srcs, false)
    }

    pub fn mov_swizzle(&mut self, def: Def, swizzle: &[u8]) -> Def {
        let bits = self.bit_size(def);
        let mut src = AluSrc::new(def);
        src.swizzle[..swizzle.len()].copy_from_slice(swizzle);
        self.alu_srcs(AluOp::Mov, vec![src], swizzle.len() as u8, bits, false)
    }

    pub fn channel(&mut self, def: Def, c: u8) -> Def {
        assert!(c < self.num_components(def), "channel {c} out of range");
        if c == 0 && self.num_components(def) == 1 {
            return def;
        }
        self.mov_swizzle(def, &[c])
    }

    /// Components selected by `mask`, packed.
    pub fn channels(&mut self, def: Def, mask: u32) -> Def {
        let swizzle: Vec<u8> = (0..16u8).filter(|c| mask & (1 << c) != 0).collect();
        if swizzle.len() == self.num_components(def) as usize
            && swizzle.iter().enumerate().all(|(i, &c)| i == c as usize)
        {
            return def;
        }
        self.mov_swizzle(def, &swizzle)
    }

    pub fn vec(&mut self, comps: &[Def]) -> Def {
        if comps.len() == 1 {
            return comps[0];
        }
        self.alu(AluOp::Vec, comps)
    }

    pub fn vec2(&mut self, x: Def, y: Def) -> Def {
        self.vec(&[x, y])
    }

    pub fn vec4(&mut self, x: Def, y: Def, z: Def, w: Def) -> Def {
        self.vec(&[x, y, z, w])
    }

    pub fn trim_vector(&mut self, def: Def, n: u8) -> Def {
        if self.num_components(def) == n {
            return def;
        }
        self.channels(def, (1u32 << n) - 1)
    }

    /// Pads `def` to `n` components with undefined values.
    pub fn pad_vector(&mut self, def: Def, n: u8) -> Def {
        let nc = self.num_components(def);
        if nc >= n {
            return def;
        }
        let bits = self.bit_size(def);
        let undef = self.undef(1, bits);
        let mut comps: Vec<Def> = (0..nc).map(|c| self.channel(def, c)).collect();
        comps.resize(n as usize, undef);
        self.vec(&comps)
    }

    pub fn pad_vec4(&mut self, def: Def) -> Def {
        self.pad_vector(def, 4)
    }

    pub fn pad_vector_imm_int(&mut self, def: Def, value: u64, n: u8) -> Def {
        let nc = self.num_components(def);
        if nc >= n {
            return def;
        }
        let bits = self.bit_size(def);
        let filler = self.imm(&[value], bits);
        let mut comps: Vec<Def> = (0..nc).map(|c| self.channel(def, c)).collect();
        comps.resize(n as usize, filler);
        self.vec(&comps)
    }

    /// Reinterprets the concatenated bits of `defs` as `nc` components of `bit_size` bits,
    /// starting at `first_bit`.
    pub fn extract_bits(&mut self, defs: &[Def], first_bit: u32, nc: u8, bit_size: u8) -> Def {
        let mut pieces = Vec::new();
        let mut at = 0u32;
        for &d in defs {
            let bits = self.bit_size(d) as u32;
            for c in 0..self.num_components(d) {
                pieces.push((at, bits, d, c));
                at += bits;
            }
        }

        // Fast path: the request lines up with whole source components.
        let aligned: Option<Vec<Def>> = (0..nc as u32)
            .map(|i| {
                let start = first_bit + i * bit_size as u32;
                pieces
                    .iter()
                    .find(|&&(s, bits, _, _)| s == start && bits == bit_size as u32)
                    .map(|&(_, _, d, c)| (d, c))
            })
            .collect::<Option<Vec<_>>>()
            .map(|v| v.into_iter().map(|(d, c)| self.channel(d, c)).collect());
        if let Some(comps) = aligned {
            return self.vec(&comps);
        }

        let work_bits: u8 = if bit_size == 64 { 64 } else { 32 };
        let mut comps = Vec::with_capacity(nc as usize);
        for i in 0..nc as u32 {
            let lo = first_bit + i * bit_size as u32;
            let hi = lo + bit_size as u32;
            let mut acc: Option<Def> = None;
            for &(start, bits, d, c) in &pieces {
                let end = start + bits;
                if end <= lo || start >= hi {
                    continue;
                }
                let comp = self.channel(d, c);
                let wide = if bits as u8 == work_bits {
                    comp
                } else {
                    self.alu(AluOp::U2u(work_bits), &[comp])
                };
                let piece = if start < lo {
                    self.ushr_imm(wide, lo - start)
                } else {
                    self.ishl_imm(wide, start - lo)
                };
                acc = Some(match acc {
                    Some(prev) => self.ior(prev, piece),
                    None => piece,
                });
            }
            let value = match acc {
                Some(v) => v,
                None => self.imm_zero(1, work_bits),
            };
            let value = if bit_size == work_bits {
                value
            } else {
                self.alu(AluOp::U2u(bit_size), &[value])
            };
            comps.push(value);
        }
        self.vec(&comps)
    }

    fn imm_like(&mut self, like: Def, value: u64) -> Def {
        let bits = self.bit_size(like);
        self.imm(&[value], bits)
    }

    pub fn iadd(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Iadd, &[a, b])
    }

    pub fn iadd_nuw(&mut self, a: Def, b: Def) -> Def {
        self.alu_inner(AluOp::Iadd, &[a, b], true)
    }

    pub fn iadd_imm(&mut self, a: Def, value: u64) -> Def {
        if value & fold::mask(self.bit_size(a)) == 0 {
            return a;
        }
        let imm = self.imm_like(a, value);
        self.iadd(a, imm)
    }

    pub fn iadd_imm_nuw(&mut self, a: Def, value: u64) -> Def {
        if value == 0 {
            return a;
        }
        let imm = self.imm_like(a, value);
        self.iadd_nuw(a, imm)
    }

    pub fn isub(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Isub, &[a, b])
    }

    pub fn imul(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Imul, &[a, b])
    }

    pub fn imul_imm(&mut self, a: Def, value: u64) -> Def {
        match value {
            0 => {
                let (nc, bits) = (self.num_components(a), self.bit_size(a));
                self.imm_zero(nc, bits)
            }
            1 => a,
            v if v.is_power_of_two() => self.ishl_imm(a, v.trailing_zeros()),
            v => {
                let imm = self.imm_like(a, v);
                self.imul(a, imm)
            }
        }
    }

    pub fn ineg(&mut self, a: Def) -> Def {
        self.alu(AluOp::Ineg, &[a])
    }

    pub fn iand(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Iand, &[a, b])
    }

    pub fn iand_imm(&mut self, a: Def, value: u64) -> Def {
        let m = fold::mask(self.bit_size(a));
        if value & m == m {
            return a;
        }
        let imm = self.imm_like(a, value);
        self.iand(a, imm)
    }

    pub fn ior(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Ior, &[a, b])
    }

    pub fn ior_imm(&mut self, a: Def, value: u64) -> Def {
        if value == 0 {
            return a;
        }
        let imm = self.imm_like(a, value);
        self.ior(a, imm)
    }

    pub fn ixor(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Ixor, &[a, b])
    }

    pub fn inot(&mut self, a: Def) -> Def {
        self.alu(AluOp::Inot, &[a])
    }

    pub fn ishl(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Ishl, &[a, b])
    }

    pub fn ishl_imm(&mut self, a: Def, shift: u32) -> Def {
        if shift == 0 {
            return a;
        }
        let imm = self.imm_u32(shift);
        self.ishl(a, imm)
    }

    pub fn ushr(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Ushr, &[a, b])
    }

    pub fn ushr_imm(&mut self, a: Def, shift: u32) -> Def {
        if shift == 0 {
            return a;
        }
        let imm = self.imm_u32(shift);
        self.ushr(a, imm)
    }

    pub fn ubfe(&mut self, value: Def, offset: Def, bits: Def) -> Def {
        self.alu(AluOp::Ubfe, &[value, offset, bits])
    }

    pub fn ubfe_imm(&mut self, value: Def, offset: u32, bits: u32) -> Def {
        let offset = self.imm_u32(offset);
        let bits = self.imm_u32(bits);
        self.ubfe(value, offset, bits)
    }

    pub fn umin(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Umin, &[a, b])
    }

    pub fn umax(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Umax, &[a, b])
    }

    pub fn umod(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Umod, &[a, b])
    }

    pub fn umod_imm(&mut self, a: Def, value: u64) -> Def {
        let imm = self.imm_like(a, value);
        self.umod(a, imm)
    }

    pub fn udiv_imm(&mut self, a: Def, value: u64) -> Def {
        if value == 1 {
            return a;
        }
        let imm = self.imm_like(a, value);
        self.alu(AluOp::Udiv, &[a, imm])
    }

    /// Rounds `a` up to a multiple of the power of two `align`.
    pub fn align_imm(&mut self, a: Def, align: u64) -> Def {
        debug_assert!(align.is_power_of_two());
        let plus = self.iadd_imm(a, align - 1);
        self.iand_imm(plus, !(align - 1))
    }

    pub fn bcsel(&mut self, cond: Def, a: Def, b: Def) -> Def {
        self.alu(AluOp::Bcsel, &[cond, a, b])
    }

    pub fn ieq(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Ieq, &[a, b])
    }

    pub fn ieq_imm(&mut self, a: Def, value: u64) -> Def {
        let imm = self.imm_like(a, value);
        self.ieq(a, imm)
    }

    pub fn ine(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Ine, &[a, b])
    }

    pub fn ine_imm(&mut self, a: Def, value: u64) -> Def {
        let imm = self.imm_like(a, value);
        self.ine(a, imm)
    }

    pub fn ult(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Ult, &[a, b])
    }

    pub fn ult_imm(&mut self, a: Def, value: u64) -> Def {
        let imm = self.imm_like(a, value);
        self.ult(a, imm)
    }

    pub fn uge(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Uge, &[a, b])
    }

    pub fn ilt(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Ilt, &[a, b])
    }

    pub fn feq(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Feq, &[a, b])
    }

    pub fn fneu(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Fneu, &[a, b])
    }

    pub fn fneu_imm(&mut self, a: Def, value: f64) -> Def {
        let bits = self.bit_size(a);
        let imm = self.imm_floatn(value, bits);
        self.fneu(a, imm)
    }

    pub fn flt(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Flt, &[a, b])
    }

    pub fn fge(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Fge, &[a, b])
    }

    pub fn fgeu(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Fgeu, &[a, b])
    }

    /// `a <= b`, false for NaN.
    pub fn fle(&mut self, a: Def, b: Def) -> Def {
        self.fge(b, a)
    }

    pub fn fle_imm(&mut self, a: Def, value: f64) -> Def {
        let bits = self.bit_size(a);
        let imm = self.imm_floatn(value, bits);
        self.fle(a, imm)
    }

    pub fn fadd(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Fadd, &[a, b])
    }

    pub fn fmul(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Fmul, &[a, b])
    }

    pub fn fsat(&mut self, a: Def) -> Def {
        self.alu(AluOp::Fsat, &[a])
    }

    pub fn fdot4(&mut self, a: Def, b: Def) -> Def {
        self.alu(AluOp::Fdot4, &[a, b])
    }

    pub fn b2i32(&mut self, a: Def) -> Def {
        self.alu(AluOp::B2i32, &[a])
    }

    pub fn u2u(&mut self, a: Def, bits: u8) -> Def {
        if self.bit_size(a) == bits {
            return a;
        }
        self.alu(AluOp::U2u(bits), &[a])
    }

    pub fn u2u32(&mut self, a: Def) -> Def {
        self.u2u(a, 32)
    }

    pub fn i2i(&mut self, a: Def, bits: u8) -> Def {
        if self.bit_size(a) == bits {
            return a;
        }
        self.alu(AluOp::I2i(bits), &[a])
    }

    pub fn f2f(&mut self, a: Def, bits: u8) -> Def {
        if self.bit_size(a) == bits {
            return a;
        }
        self.alu(AluOp::F2f(bits), &[a])
    }

    pub fn pack_32_2x16_split(&mut self, lo: Def, hi: Def) -> Def {
        self.alu(AluOp::Pack32_2x16Split, &[lo, hi])
    }

    pub fn unpack_32_2x16_split_x(&mut self, a: Def) -> Def {
        self.alu(AluOp::Unpack32_2x16SplitX, &[a])
    }

    pub fn unpack_32_2x16_split_y(&mut self, a: Def) -> Def {
        self.alu(AluOp::Unpack32_2x16SplitY, &[a])
    }

    pub fn bit_count(&mut self, a: Def) -> Def {
        self.alu(AluOp::BitCount, &[a])
    }

    pub fn alignbyte_amd(&mut self, hi: Def, lo: Def, shift: Def) -> Def {
        self.alu(AluOp::AlignbyteAmd, &[hi, lo, shift])
    }

    // ---- intrinsics ----

    pub fn intrinsic(&mut self, op: Intrinsic) -> IntrinsicBuilder<'_, 'a> {
        IntrinsicBuilder {
            b: self,
            instr: IntrinsicInstr {
                op,
                def: None,
                srcs: Vec::new(),
                num_components: 0,
                idx: Indices::default(),
            },
        }
    }

    /// Loads a fixed-shape system value.
    pub fn load_sysval(&mut self, op: Intrinsic) -> Def {
        self.intrinsic(op).sysval()
    }

    pub fn load_var(&mut self, var: VarId) -> Def {
        let v = self.shader.variable(var);
        let (nc, bits) = (v.num_components, v.bit_size);
        self.intrinsic(Intrinsic::LoadVar).var(var).def(nc, bits)
    }

    pub fn store_var(&mut self, var: VarId, value: Def, write_mask: u32) -> InstrId {
        self.intrinsic(Intrinsic::StoreVar)
            .src(value)
            .var(var)
            .write_mask(write_mask)
            .emit()
    }

    pub fn barrier(&mut self, exec: Scope, mem: Scope, sem: MemorySemantics, modes: MemoryModes) -> InstrId {
        self.intrinsic(Intrinsic::Barrier)
            .scopes(exec, mem, sem, modes)
            .emit()
    }

    pub fn jump(&mut self, jump: Jump) -> InstrId {
        self.insert(InstrKind::Jump(jump))
    }

    // ---- control flow ----

    /// Splits the cursor block, moving everything after the cursor into a new block that
    /// follows `node`. Returns the new block.
    fn split_for(&mut self, node: CfNode) -> BlockId {
        let block = self.cursor_block();
        let parent = self.shader.block(block).parent;
        let pos = self.cursor_pos();
        let tail = self.shader.blocks[block.index()].instrs.split_off(pos);
        let after = self.shader.new_block(parent);
        for &id in &tail {
            self.shader.instrs[id.index()].block = after;
        }
        self.shader.blocks[after.index()].instrs = tail;

        for instr in self.shader.instrs.iter_mut().filter(|i| !i.removed) {
            if let InstrKind::Phi(phi) = &mut instr.kind {
                for (pred, _) in &mut phi.srcs {
                    if *pred == block {
                        *pred = after;
                    }
                }
            }
        }

        let list = self.shader.cf_list_mut(parent);
        let at = list
            .iter()
            .position(|n| *n == CfNode::Block(block))
            .unwrap_or_else(|| panic!("block {block:?} missing from its CF list"));
        list.insert(at + 1, node);
        list.insert(at + 2, CfNode::Block(after));
        after
    }

    pub fn push_if(&mut self, condition: Def) -> IfId {
        assert_eq!(self.bit_size(condition), 1, "if condition must be a boolean");
        let id = IfId(self.shader.ifs.len() as u32);
        let then_block = self.shader.new_block(CfParent::Then(id));
        let else_block = self.shader.new_block(CfParent::Else(id));
        let parent = self.shader.block(self.cursor_block()).parent;
        self.shader.ifs.push(IfNode {
            condition,
            then_list: vec![CfNode::Block(then_block)],
            else_list: vec![CfNode::Block(else_block)],
            parent,
        });
        self.split_for(CfNode::If(id));
        self.cursor = Cursor::BlockEnd(then_block);
        id
    }

    pub fn push_else(&mut self, nif: IfId) {
        let last = self.shader.last_block_of(&self.shader.ifs[nif.index()].else_list);
        self.cursor = Cursor::BlockEnd(last);
    }

    pub fn pop_if(&mut self, nif: IfId) {
        let parent = self.shader.ifs[nif.index()].parent;
        let list = self.shader.cf_list(parent);
        let Some(at) = list.iter().position(|n| *n == CfNode::If(nif)) else {
            panic!("if {nif:?} missing from its CF list");
        };
        let CfNode::Block(after) = list[at + 1] else {
            panic!("if {nif:?} must be followed by a block");
        };
        self.cursor = Cursor::BlockStart(after);
    }

    /// Merges `then_def` and `else_def` of the `if` directly preceding the cursor block.
    pub fn if_phi(&mut self, then_def: Def, else_def: Def) -> Def {
        let block = self.cursor_block();
        let Some(nif) = self.shader.preceding_if(block) else {
            panic!("if_phi must be placed in the block following an if");
        };
        let nc = self.num_components(then_def);
        let bits = self.bit_size(then_def);
        assert_eq!(nc, self.num_components(else_def), "phi sources must match");
        assert_eq!(bits, self.bit_size(else_def), "phi sources must match");

        let node = &self.shader.ifs[nif.index()];
        let then_pred = self.shader.last_block_of(&node.then_list);
        let else_pred = self.shader.last_block_of(&node.else_list);

        let id = self.shader.next_instr_id();
        let def = self.shader.new_def(nc, bits, id);
        let pos = self.leading_phis(block);
        let instr = self.shader.push_instr(
            block,
            InstrKind::Phi(Phi {
                def,
                srcs: vec![(then_pred, then_def), (else_pred, else_def)],
            }),
        );
        self.shader.blocks[block.index()].instrs.insert(pos, instr);
        // Keep later instructions after every phi of the block.
        let cursor_in_phis = match self.cursor {
            Cursor::BlockStart(_) => true,
            Cursor::After(i) => matches!(self.shader.instr(i).kind, InstrKind::Phi(_)),
            _ => false,
        };
        if cursor_in_phis {
            self.cursor = Cursor::After(instr);
        }
        def
    }

    pub fn push_loop(&mut self) -> LoopId {
        let id = LoopId(self.shader.loops.len() as u32);
        let body = self.shader.new_block(CfParent::Loop(id));
        let parent = self.shader.block(self.cursor_block()).parent;
        self.shader.loops.push(LoopNode {
            body: vec![CfNode::Block(body)],
            parent,
        });
        self.split_for(CfNode::Loop(id));
        self.cursor = Cursor::BlockEnd(body);
        id
    }

    pub fn pop_loop(&mut self, lp: LoopId) {
        let parent = self.shader.loops[lp.index()].parent;
        let list = self.shader.cf_list(parent);
        let Some(at) = list.iter().position(|n| *n == CfNode::Loop(lp)) else {
            panic!("loop {lp:?} missing from its CF list");
        };
        let CfNode::Block(after) = list[at + 1] else {
            panic!("loop {lp:?} must be followed by a block");
        };
        self.cursor = Cursor::BlockStart(after);
    }

    /// Re-inserts a CF list previously detached with [`Shader::extract_body`] at the cursor,
    /// which must be at the end of a block.
    pub fn reinsert_cf(&mut self, extracted: Vec<CfNode>) {
        let Cursor::BlockEnd(block) = self.cursor else {
            panic!("CF can only be reinserted at the end of a block");
        };
        let parent = self.shader.block(block).parent;
        let first = self.shader.first_block_of(&extracted);
        let last = self.shader.last_block_of(&extracted);

        let moved = std::mem::take(&mut self.shader.blocks[first.index()].instrs);
        for &id in &moved {
            self.shader.instrs[id.index()].block = block;
        }
        self.shader.blocks[block.index()].instrs.extend(moved);
        for instr in self.shader.instrs.iter_mut().filter(|i| !i.removed) {
            if let InstrKind::Phi(phi) = &mut instr.kind {
                for (pred, _) in &mut phi.srcs {
                    if *pred == first {
                        *pred = block;
                    }
                }
            }
        }

        let rest = &extracted[1..];
        self.shader.reparent(rest, parent);
        let list = self.shader.cf_list_mut(parent);
        let Some(at) = list.iter().position(|n| *n == CfNode::Block(block)) else {
            panic!("block {block:?} missing from its CF list");
        };
        for (k, node) in rest.iter().enumerate() {
            list.insert(at + 1 + k, *node);
        }

        self.cursor = if rest.is_empty() {
            Cursor::BlockEnd(block)
        } else {
            Cursor::BlockEnd(last)
        };
    }
}

/// Fluent construction of one intrinsic.
pub struct IntrinsicBuilder<'b, 'a> {
    b: &'b mut Builder<'a>,
    instr: IntrinsicInstr,
}

impl<'b, 'a> IntrinsicBuilder<'b, 'a> {
    pub fn src(mut self, def: Def) -> Self {
        self.instr.srcs.push(def);
        self
    }

    pub fn srcs(mut self, defs: &[Def]) -> Self {
        self.instr.srcs.extend_from_slice(defs);
        self
    }

    pub fn base(mut self, base: i32) -> Self {
        self.instr.idx.base = base;
        self
    }

    pub fn component(mut self, component: u8) -> Self {
        self.instr.idx.component = component;
        self
    }

    pub fn write_mask(mut self, mask: u32) -> Self {
        self.instr.idx.write_mask = mask;
        self
    }

    pub fn io(mut self, io: IoSemantics) -> Self {
        self.instr.idx.io = io;
        self
    }

    pub fn src_type(mut self, ty: AluType) -> Self {
        self.instr.idx.src_type = ty;
        self
    }

    pub fn access(mut self, access: Access) -> Self {
        self.instr.idx.access = access;
        self
    }

    pub fn align(mut self, mul: u32, offset: u32) -> Self {
        self.instr.idx.align_mul = mul;
        self.instr.idx.align_offset = offset;
        self
    }

    pub fn modes(mut self, modes: MemoryModes) -> Self {
        self.instr.idx.memory_modes = modes;
        self
    }

    pub fn scopes(mut self, exec: Scope, mem: Scope, sem: MemorySemantics, modes: MemoryModes) -> Self {
        self.instr.idx.execution_scope = exec;
        self.instr.idx.memory_scope = mem;
        self.instr.idx.memory_semantics = sem;
        self.instr.idx.memory_modes = modes;
        self
    }

    pub fn stream_id(mut self, stream: u32) -> Self {
        self.instr.idx.stream_id = stream;
        self
    }

    pub fn ucp_id(mut self, id: u32) -> Self {
        self.instr.idx.ucp_id = id;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.instr.idx.flags = flags;
        self
    }

    pub fn atomic_op(mut self, op: AtomicOp) -> Self {
        self.instr.idx.atomic_op = op;
        self
    }

    pub fn reduction_op(mut self, op: ReduceOp) -> Self {
        self.instr.idx.reduction_op = op;
        self
    }

    pub fn var(mut self, var: VarId) -> Self {
        self.instr.idx.var = Some(var);
        self
    }

    pub fn indices(mut self, idx: Indices) -> Self {
        self.instr.idx = idx;
        self
    }

    fn check_srcs(&self) {
        assert_eq!(
            self.instr.srcs.len(),
            self.instr.op.num_srcs(),
            "{} takes {} sources",
            self.instr.op.name(),
            self.instr.op.num_srcs()
        );
    }

    /// Emits an intrinsic without a destination.
    pub fn emit(mut self) -> InstrId {
        self.check_srcs();
        assert!(!self.instr.op.has_dest(), "{} has a destination", self.instr.op.name());
        if self.instr.op.stores_value() {
            self.instr.num_components = self.b.num_components(self.instr.srcs[0]);
        }
        self.b.insert(InstrKind::Intrinsic(self.instr))
    }

    /// Emits an intrinsic with an explicitly sized destination.
    pub fn def_with_id(mut self, nc: u8, bit_size: u8) -> (InstrId, Def) {
        self.check_srcs();
        assert!(self.instr.op.has_dest(), "{} has no destination", self.instr.op.name());
        let id = self.b.shader.next_instr_id();
        let def = self.b.shader.new_def(nc, bit_size, id);
        self.instr.def = Some(def);
        self.instr.num_components = nc;
        let inserted = self.b.insert(InstrKind::Intrinsic(self.instr));
        debug_assert_eq!(inserted, id);
        (id, def)
    }

    pub fn def(self, nc: u8, bit_size: u8) -> Def {
        self.def_with_id(nc, bit_size).1
    }

    /// Emits an intrinsic with a fixed destination shape.
    pub fn sysval(self) -> Def {
        match self.instr.op.dest_shape() {
            DestShape::Fixed(nc, bits) => self.def(nc, bits),
            shape => panic!("{} has destination shape {shape:?}", self.instr.op.name()),
        }
    }
}
