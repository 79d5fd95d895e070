use nir::{
    validate, Builder, CfNode, Cursor, Intrinsic, IoSemantics, Jump, Shader, Stage,
};
use pretty_assertions::assert_eq;

#[test]
fn printer_snapshot_of_shared_store() {
    let mut shader = Shader::new(Stage::Vertex, "snap");
    let mut b = Builder::at_end(&mut shader);
    let idx = b.load_sysval(Intrinsic::LoadLocalInvocationIndex);
    let addr = b.imul_imm(idx, 16);
    let value = b.imm_u32(7);
    b.intrinsic(Intrinsic::StoreShared)
        .src(value)
        .src(addr)
        .write_mask(0x1)
        .align(4, 0)
        .emit();
    validate(&shader).unwrap();

    insta::assert_snapshot!(shader.to_string(), @r"
    shader: vertex snap
    32x1 %0 = load_local_invocation_index ()
    32x1 %1 = load_const (0x4)
    32x1 %2 = ishl %0, %1
    32x1 %3 = load_const (0x7)
    store_shared (%3, %2) (wrmask=0x1, align=4/0)
    ");
}

#[test]
fn nested_ifs_keep_structure_valid() {
    let mut shader = Shader::new(Stage::TessCtrl, "nested");
    let mut b = Builder::at_end(&mut shader);
    let id = b.load_sysval(Intrinsic::LoadInvocationId);
    let is_zero = b.ieq_imm(id, 0);
    let outer = b.push_if(is_zero);
    {
        let is_one = b.ult_imm(id, 1);
        let inner = b.push_if(is_one);
        let a = b.imm_u32(1);
        b.push_else(inner);
        let c = b.imm_u32(2);
        b.pop_if(inner);
        let phi = b.if_phi(a, c);
        let offset = b.imm_u32(0);
        b.intrinsic(Intrinsic::StoreOutput)
            .src(phi)
            .src(offset)
            .write_mask(0x1)
            .io(IoSemantics {
                location: nir::varying::PATCH0,
                num_slots: 1,
                ..Default::default()
            })
            .emit();
    }
    b.pop_if(outer);
    validate(&shader).unwrap();

    assert_eq!(shader.body().len(), 3);
    assert!(matches!(shader.body()[1], CfNode::If(_)));
    assert_eq!(shader.count_intrinsics(Intrinsic::StoreOutput), 1);
}

#[test]
fn inserting_before_an_instruction_keeps_order() {
    let mut shader = Shader::new(Stage::Vertex, "order");
    let mut b = Builder::at_end(&mut shader);
    let first = b.load_sysval(Intrinsic::LoadVertexIdZeroBase);
    let store_offset = b.imm_u32(0);
    let store = b
        .intrinsic(Intrinsic::StoreOutput)
        .src(first)
        .src(store_offset)
        .write_mask(0x1)
        .emit();

    let mut b = Builder::new(&mut shader, Cursor::Before(store));
    let prim = b.load_sysval(Intrinsic::LoadPrimitiveId);
    validate(&shader).unwrap();

    let order = shader.instrs_in_order();
    let prim_instr = shader.parent_instr(prim);
    let pos = |id| order.iter().position(|&i| i == id).unwrap();
    assert_eq!(pos(prim_instr) + 1, pos(store));
}

#[test]
fn loops_accept_breaks_and_wrap_body() {
    let mut shader = Shader::new(Stage::Vertex, "loop");
    let mut b = Builder::at_end(&mut shader);
    let lp = b.push_loop();
    b.jump(Jump::Break);
    b.pop_loop(lp);
    let _ = b.imm_u32(3);
    validate(&shader).unwrap();

    // Wrap the whole body in a new if.
    let body = shader.extract_body();
    let mut b = Builder::at_end(&mut shader);
    let cond = b.imm_true();
    let nif = b.push_if(cond);
    b.reinsert_cf(body);
    b.pop_if(nif);
    validate(&shader).unwrap();
    assert_eq!(shader.body().len(), 3);
    let CfNode::If(wrapped) = shader.body()[1] else {
        panic!("expected an if");
    };
    assert_eq!(shader.if_node(wrapped).then_list.len(), 3);
}

#[test]
fn extract_bits_with_constants() {
    let mut shader = Shader::new(Stage::Vertex, "bits");
    let mut b = Builder::at_end(&mut shader);
    let bytes: Vec<_> = [0x11u64, 0x22, 0x33, 0x44]
        .iter()
        .map(|&v| b.imm(&[v], 8))
        .collect();
    let dword = b.extract_bits(&bytes, 0, 1, 32);
    assert_eq!(b.shader.const_u32(dword), Some(0x4433_2211));
}
