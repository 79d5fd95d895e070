use nir::varying::{self, PATCH0, TESS_LEVEL_INNER, TESS_LEVEL_OUTER};
use nir::{
    gather_tcs_info, Builder, Def, Intrinsic, IoSemantics, MemoryModes, MemorySemantics, Scope,
    Shader, Stage, TessPrimitiveMode, TessSpacing,
};
use pretty_assertions::assert_eq;

fn tcs(vertices_out: u8) -> Shader {
    let mut shader = Shader::new(Stage::TessCtrl, "tcs");
    shader.info.tess.tcs_vertices_out = vertices_out;
    shader
}

fn store_output(b: &mut Builder, location: u32, value: Def, write_mask: u32) {
    let offset = b.imm_u32(0);
    b.intrinsic(Intrinsic::StoreOutput)
        .src(value)
        .src(offset)
        .write_mask(write_mask)
        .io(IoSemantics {
            location,
            num_slots: 1,
            ..Default::default()
        })
        .emit();
    if varying::is_patch(location) {
        b.shader.info.patch_outputs_written |= 1 << (location - PATCH0);
    } else {
        b.shader.info.outputs_written |= varying::bit(location);
    }
}

fn store_floats(b: &mut Builder, location: u32, values: &[f32]) {
    let comps: Vec<Def> = values.iter().map(|&v| b.imm_float(v)).collect();
    let vec = b.vec(&comps);
    store_output(b, location, vec, (1 << values.len()) - 1);
}

fn output_barrier(b: &mut Builder) {
    b.barrier(
        Scope::Workgroup,
        Scope::Workgroup,
        MemorySemantics::ACQ_REL,
        MemoryModes::SHADER_OUT,
    );
}

#[test]
fn triangles_with_half_levels_are_effectively_one() {
    let mut shader = tcs(3);
    let mut b = Builder::at_end(&mut shader);
    store_floats(&mut b, TESS_LEVEL_OUTER, &[0.5, 0.5, 0.5]);
    store_floats(&mut b, TESS_LEVEL_INNER, &[0.5]);

    let info = gather_tcs_info(&shader, TessPrimitiveMode::Triangles, TessSpacing::Equal);
    assert!(info.all_tess_levels_are_effectively_one);
    assert!(!info.all_tess_levels_are_effectively_zero);
    assert!(!info.can_discard_patches);
    assert_eq!(info.tess_levels_defined_by_all_invoc, 0x3);
    assert!(info.all_invocations_define_tess_levels);
}

#[test]
fn quads_with_negative_outer_level_are_effectively_zero() {
    let mut shader = tcs(4);
    let mut b = Builder::at_end(&mut shader);
    store_floats(&mut b, TESS_LEVEL_OUTER, &[-1.0, 2.0, 2.0, 2.0]);
    store_floats(&mut b, TESS_LEVEL_INNER, &[2.0, 2.0]);

    let info = gather_tcs_info(&shader, TessPrimitiveMode::Quads, TessSpacing::Equal);
    assert!(info.all_tess_levels_are_effectively_zero);
    assert!(!info.all_tess_levels_are_effectively_one);
    assert!(info.can_discard_patches);
}

#[test]
fn fractional_even_isolines_clamp_outer0_to_one() {
    let mut shader = tcs(2);
    let mut b = Builder::at_end(&mut shader);
    store_floats(&mut b, TESS_LEVEL_OUTER, &[1.0, 1.5]);

    let info = gather_tcs_info(&shader, TessPrimitiveMode::Isolines, TessSpacing::FractionalEven);
    assert!(info.all_tess_levels_are_effectively_one);
    assert!(!info.all_tess_levels_are_effectively_zero);

    // outer[0] = 1.5 is not effectively one for isolines.
    let mut shader = tcs(2);
    let mut b = Builder::at_end(&mut shader);
    store_floats(&mut b, TESS_LEVEL_OUTER, &[1.5, 1.5]);
    let info = gather_tcs_info(&shader, TessPrimitiveMode::Isolines, TessSpacing::FractionalEven);
    assert!(!info.all_tess_levels_are_effectively_one);
}

#[test]
fn one_zero_outer_component_discards_regardless_of_others() {
    let mut shader = tcs(3);
    let mut b = Builder::at_end(&mut shader);
    let prim = b.load_sysval(Intrinsic::LoadPrimitiveId);
    let zero = b.imm_float(0.0);
    let dyn_vec = b.vec(&[prim, zero, prim]);
    store_output(&mut b, TESS_LEVEL_OUTER, dyn_vec, 0x7);

    let info = gather_tcs_info(&shader, TessPrimitiveMode::Triangles, TessSpacing::Equal);
    // outer[1] is always zero; the dynamic components don't matter.
    assert!(info.all_tess_levels_are_effectively_zero);
    assert!(!info.all_tess_levels_are_effectively_one);
    assert!(info.can_discard_patches);
}

#[test]
fn conditional_writes_are_not_defined_by_all() {
    let mut shader = tcs(3);
    let mut b = Builder::at_end(&mut shader);
    let id = b.load_sysval(Intrinsic::LoadInvocationId);
    let cond = b.ult_imm(id, 2);
    let value = b.imm_float(1.0);

    // PATCH0 is written on both sides, PATCH1 only in the then branch.
    let nif = b.push_if(cond);
    store_output(&mut b, PATCH0, value, 0x1);
    store_output(&mut b, PATCH0 + 1, value, 0x1);
    b.push_else(nif);
    store_output(&mut b, PATCH0, value, 0x1);
    b.pop_if(nif);

    let info = gather_tcs_info(&shader, TessPrimitiveMode::Triangles, TessSpacing::Equal);
    assert_eq!(info.patch_outputs_defined_by_all_invoc, 0x1);
}

#[test]
fn barrier_segments_are_analysed_separately() {
    let mut shader = tcs(3);
    let mut b = Builder::at_end(&mut shader);
    let value = b.imm_float(1.0);
    store_output(&mut b, PATCH0, value, 0x1);
    output_barrier(&mut b);
    let id = b.load_sysval(Intrinsic::LoadInvocationId);
    let cond = b.ieq_imm(id, 1);
    let nif = b.push_if(cond);
    store_output(&mut b, PATCH0, value, 0x1);
    b.pop_if(nif);

    let info = gather_tcs_info(&shader, TessPrimitiveMode::Triangles, TessSpacing::Equal);
    assert_eq!(info.patch_outputs_defined_by_all_invoc, 0);
    assert!(info.always_executes_barrier);
}

#[test]
fn nested_barrier_poisons_everything() {
    let mut shader = tcs(3);
    let mut b = Builder::at_end(&mut shader);
    let value = b.imm_float(1.0);
    store_output(&mut b, PATCH0, value, 0x1);
    let id = b.load_sysval(Intrinsic::LoadInvocationId);
    let cond = b.ieq_imm(id, 1);
    let nif = b.push_if(cond);
    output_barrier(&mut b);
    b.pop_if(nif);

    let info = gather_tcs_info(&shader, TessPrimitiveMode::Triangles, TessSpacing::Equal);
    assert_eq!(info.patch_outputs_defined_by_all_invoc, 0);
    assert!(!info.always_executes_barrier);
}

#[test]
fn invocation_zero_accesses_are_detected() {
    let mut shader = tcs(3);
    let mut b = Builder::at_end(&mut shader);
    let id = b.load_sysval(Intrinsic::LoadInvocationId);
    let is_zero = b.ieq_imm(id, 0);
    let nif = b.push_if(is_zero);
    store_floats(&mut b, TESS_LEVEL_OUTER, &[3.0, 3.0, 3.0]);
    let value = b.imm_float(1.0);
    store_output(&mut b, PATCH0, value, 0x1);
    b.pop_if(nif);
    // PATCH1 is written by everyone.
    store_output(&mut b, PATCH0 + 1, value, 0x1);

    let info = gather_tcs_info(&shader, TessPrimitiveMode::Triangles, TessSpacing::Equal);
    assert_eq!(info.patch_outputs_only_written_by_invoc0, 0x1);
    assert_eq!(info.tess_levels_only_written_by_invoc0, 0x1);
    assert_eq!(info.patch_outputs_defined_by_all_invoc, 0x2);
}

#[test]
fn single_vertex_patches_are_trivially_uniform() {
    let mut shader = tcs(1);
    let mut b = Builder::at_end(&mut shader);
    let id = b.load_sysval(Intrinsic::LoadInvocationId);
    let cond = b.ult_imm(id, 1);
    let nif = b.push_if(cond);
    let value = b.imm_float(1.0);
    store_output(&mut b, PATCH0 + 3, value, 0x1);
    b.pop_if(nif);

    let info = gather_tcs_info(&shader, TessPrimitiveMode::Quads, TessSpacing::Unspecified);
    assert_eq!(info.patch_outputs_defined_by_all_invoc, 0x8);
    assert_eq!(info.patch_outputs_only_written_by_invoc0, 0x8);
    assert!(info.all_invocations_define_tess_levels);
}
