//! Textual dump of a shader, loosely following `nir_print_shader`.

use std::fmt::{self, Write};

use crate::ir::{CfNode, Def, Indices, InstrId, InstrKind, Shader};
use crate::varying;

impl fmt::Display for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "shader: {} {}", self.stage().name(), self.name)?;
        print_list(self, &self.body, 0, f)
    }
}

fn print_list(shader: &Shader, list: &[CfNode], depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let pad = "    ".repeat(depth);
    for node in list {
        match *node {
            CfNode::Block(b) => {
                let instrs = &shader.block(b).instrs;
                if instrs.is_empty() {
                    continue;
                }
                for &id in instrs {
                    writeln!(f, "{pad}{}", instr_to_string(shader, id))?;
                }
            }
            CfNode::If(id) => {
                let nif = shader.if_node(id);
                writeln!(f, "{pad}if {} {{", def_name(nif.condition))?;
                print_list(shader, &nif.then_list, depth + 1, f)?;
                let else_empty = nif.else_list.iter().all(|n| match *n {
                    CfNode::Block(b) => shader.block(b).instrs.is_empty(),
                    _ => false,
                });
                if !else_empty {
                    writeln!(f, "{pad}}} else {{")?;
                    print_list(shader, &nif.else_list, depth + 1, f)?;
                }
                writeln!(f, "{pad}}}")?;
            }
            CfNode::Loop(id) => {
                writeln!(f, "{pad}loop {{")?;
                print_list(shader, &shader.loop_node(id).body, depth + 1, f)?;
                writeln!(f, "{pad}}}")?;
            }
        }
    }
    Ok(())
}

fn def_name(def: Def) -> String {
    format!("%{}", def.index())
}

fn def_decl(shader: &Shader, def: Def) -> String {
    format!(
        "{}x{} {}",
        shader.bit_size(def),
        shader.num_components(def),
        def_name(def)
    )
}

fn swizzle_suffix(swizzle: &[u8]) -> String {
    const NAMES: &[u8; 16] = b"xyzwefghijklmnop";
    swizzle.iter().map(|&c| NAMES[c as usize] as char).collect()
}

fn indices_to_string(idx: &Indices) -> String {
    let defaults = Indices::default();
    let mut out = Vec::new();
    if idx.base != defaults.base {
        out.push(format!("base={}", idx.base));
    }
    if idx.component != 0 {
        out.push(format!("component={}", idx.component));
    }
    if idx.write_mask != 0 {
        out.push(format!("wrmask={:#x}", idx.write_mask));
    }
    if idx.io != defaults.io {
        let mut io = format!("location={}", varying::name(idx.io.location));
        if idx.io.num_slots > 1 {
            let _ = write!(io, " slots={}", idx.io.num_slots);
        }
        if idx.io.high_16bits {
            io.push_str(" high_16bits");
        }
        if idx.io.gs_streams != 0 {
            let _ = write!(io, " gs_streams={:#x}", idx.io.gs_streams);
        }
        out.push(io);
    }
    if !idx.access.is_empty() {
        out.push(format!("access={:?}", idx.access));
    }
    if idx.align_mul != 0 {
        out.push(format!("align={}/{}", idx.align_mul, idx.align_offset));
    }
    if !idx.memory_modes.is_empty() {
        out.push(format!("modes={:?}", idx.memory_modes));
    }
    if idx.stream_id != 0 {
        out.push(format!("stream_id={:#x}", idx.stream_id));
    }
    if idx.flags != 0 {
        out.push(format!("flags={:#x}", idx.flags));
    }
    if let Some(var) = idx.var {
        out.push(format!("var={}", var.index()));
    }
    if out.is_empty() {
        String::new()
    } else {
        format!(" ({})", out.join(", "))
    }
}

pub fn instr_to_string(shader: &Shader, id: InstrId) -> String {
    let instr = shader.instr(id);
    match &instr.kind {
        InstrKind::LoadConst { def, values } => {
            let vals: Vec<String> = values.iter().map(|v| format!("{v:#x}")).collect();
            format!("{} = load_const ({})", def_decl(shader, *def), vals.join(", "))
        }
        InstrKind::Undef(def) => format!("{} = undefined", def_decl(shader, *def)),
        InstrKind::Alu(alu) => {
            let nc = shader.num_components(alu.def) as usize;
            let srcs: Vec<String> = alu
                .srcs
                .iter()
                .map(|s| {
                    let used = match alu.op {
                        crate::ir::AluOp::Vec => 1,
                        crate::ir::AluOp::Fdot4 => 4,
                        _ => nc,
                    };
                    let src_nc = shader.num_components(s.def) as usize;
                    let sw = &s.swizzle[..used];
                    if used == src_nc && sw.iter().enumerate().all(|(i, &c)| i == c as usize) {
                        def_name(s.def)
                    } else {
                        format!("{}.{}", def_name(s.def), swizzle_suffix(sw))
                    }
                })
                .collect();
            format!("{} = {} {}", def_decl(shader, alu.def), alu.op.name(), srcs.join(", "))
        }
        InstrKind::Intrinsic(intr) => {
            let srcs: Vec<String> = intr.srcs.iter().map(|&d| def_name(d)).collect();
            let call = format!("{} ({}){}", intr.op.name(), srcs.join(", "), indices_to_string(&intr.idx));
            match intr.def {
                Some(def) => format!("{} = {call}", def_decl(shader, def)),
                None => call,
            }
        }
        InstrKind::Phi(phi) => {
            let srcs: Vec<String> = phi
                .srcs
                .iter()
                .map(|(b, d)| format!("b{}: {}", b.index(), def_name(*d)))
                .collect();
            format!("{} = phi {}", def_decl(shader, phi.def), srcs.join(", "))
        }
        InstrKind::Jump(j) => format!("{j:?}").to_lowercase(),
    }
}
