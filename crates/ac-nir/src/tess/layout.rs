//! Address arithmetic of the HS output area in LDS and of the off-chip ring.

use nir::varying::{self, PATCH0};
use nir::{Builder, Def, Intrinsic, Stage};

use super::{TessIoInfo, TESS_LVL_MASK};
use crate::io::{calc_io_offset, MapIoFn};

fn below(mask: u64, bit: u32) -> u64 {
    mask & ((1u64 << bit) - 1)
}

/// Dense index of `loc` among `tf_mask` followed by `patch_mask`, or among `vertex_mask`.
fn prefix_index(per_vertex: bool, loc: u32, vertex_mask: u64, tf_mask: u64, patch_mask: u32) -> u32 {
    if per_vertex {
        assert!(vertex_mask & varying::bit(loc) != 0, "per-vertex output {loc} is not in {vertex_mask:#x}");
        return below(vertex_mask, loc).count_ones();
    }
    if varying::is_tess_level(loc) {
        assert!(tf_mask & varying::bit(loc) != 0, "tess level slot {loc} is not in {tf_mask:#x}");
        return below(tf_mask, loc).count_ones();
    }
    let index = loc - PATCH0;
    assert!(patch_mask & (1 << index) != 0, "patch output {index} is not in {patch_mask:#x}");
    tf_mask.count_ones() + below(patch_mask as u64, index).count_ones()
}

/// HS outputs kept in LDS, after the input patches of the whole workgroup.
pub(super) struct LdsLayout<'a> {
    pub io_info: &'a TessIoInfo,
    pub tcs_vertices_out: u32,
    pub vote_bytes: u32,
}

impl LdsLayout<'_> {
    pub fn map_location(&self, per_vertex: bool, loc: u32) -> u32 {
        prefix_index(
            per_vertex,
            loc,
            self.io_info.lds_output_mask & !TESS_LVL_MASK,
            self.io_info.lds_output_mask & TESS_LVL_MASK,
            self.io_info.lds_patch_output_mask,
        )
    }

    /// LDS address of an output of the current patch.
    ///
    /// Without `vertex_index` the address is in the per-patch part. Without `io_offset` it is
    /// the start of that part.
    pub fn output_offset(
        &self,
        b: &mut Builder,
        location: u32,
        component: u32,
        vertex_index: Option<Def>,
        io_offset: Option<Def>,
    ) -> Def {
        let mut off = match io_offset {
            Some(io_offset) => {
                let mapped = self.map_location(vertex_index.is_some(), location);
                let stride = b.imm_u32(16);
                calc_io_offset(b, component, io_offset, stride, 4, mapped)
            }
            None => b.imm_u32(0),
        };

        let rel_patch_id = b.load_sysval(Intrinsic::LoadTessRelPatchIdAmd);
        let patch_stride = self.io_info.lds_output_patch_stride(self.tcs_vertices_out);
        let patch_offset = b.imul_imm(rel_patch_id, patch_stride as u64);

        let tcs_in_vtxcnt = b.load_sysval(Intrinsic::LoadPatchVerticesIn);
        let tcs_num_patches = b.load_sysval(Intrinsic::LoadTcsNumPatchesAmd);
        let vertex_stride = b.load_sysval(Intrinsic::LoadLshsVertexStrideAmd);
        let input_patch_size = b.imul(tcs_in_vtxcnt, vertex_stride);
        let output_patch0_offset = b.imul(input_patch_size, tcs_num_patches);
        let output_patch_offset = b.iadd_nuw(patch_offset, output_patch0_offset);

        off = match vertex_index {
            Some(vertex_index) => {
                let vertex_off = b.imul_imm(vertex_index, self.io_info.lds_output_vertex_size() as u64);
                b.iadd_nuw(off, vertex_off)
            }
            None => {
                let per_vertex_size = self.io_info.lds_pervertex_output_patch_size(self.tcs_vertices_out);
                b.iadd_imm_nuw(off, per_vertex_size as u64)
            }
        };

        let lds_offset = b.iadd_nuw(off, output_patch_offset);
        b.iadd_imm_nuw(lds_offset, self.vote_bytes as u64)
    }
}

/// HS outputs in the off-chip ring, as written by the HS and read by the TES.
pub(super) struct VramLayout<'a> {
    pub vram_output_mask: u64,
    pub vram_patch_output_mask: u32,
    pub map_io: MapIoFn<'a>,
}

impl VramLayout<'_> {
    /// Ring attribute index of `loc`. Unlinked shaders let the driver decide.
    fn map_location(&self, per_vertex: bool, loc: u32) -> u32 {
        if let Some(map_io) = self.map_io {
            return map_io(loc);
        }
        prefix_index(
            per_vertex,
            loc,
            self.vram_output_mask & !TESS_LVL_MASK,
            self.vram_output_mask & TESS_LVL_MASK,
            self.vram_patch_output_mask,
        )
    }

    /// `attr_stride * mapped + rel_patch_id * out_vertices * 16 + vertex * 16`, with the patch
    /// term replaced by `patch_offset` when given.
    pub fn per_vertex_offset(
        &self,
        b: &mut Builder,
        location: u32,
        component: u32,
        vertex_index: Def,
        io_offset: Def,
        patch_offset: Option<Def>,
    ) -> Def {
        let attr_stride = b.load_sysval(Intrinsic::LoadTcsMemAttribStride);
        let mapped = self.map_location(true, location);
        let off = calc_io_offset(b, component, io_offset, attr_stride, 4, mapped);

        let patch_offset = match patch_offset {
            Some(patch_offset) => patch_offset,
            None => {
                let out_vertices_per_patch = if b.shader.stage() == Stage::TessCtrl {
                    let n = b.shader.info.tess.tcs_vertices_out as u32;
                    b.imm_u32(n)
                } else {
                    b.load_sysval(Intrinsic::LoadPatchVerticesIn)
                };
                let rel_patch_id = b.load_sysval(Intrinsic::LoadTessRelPatchIdAmd);
                let patch_size = b.imul_imm(out_vertices_per_patch, 16);
                b.imul(rel_patch_id, patch_size)
            }
        };

        let vertex_index_off = b.imul_imm(vertex_index, 16);
        let sum = b.iadd_nuw(patch_offset, vertex_index_off);
        b.iadd_nuw(sum, off)
    }

    /// `align(num_patches * 16, 256) * mapped + patch_data_offset + rel_patch_id * 16`.
    pub fn per_patch_offset(
        &self,
        b: &mut Builder,
        location: u32,
        component: u32,
        io_offset: Def,
        patch_offset: Option<Def>,
    ) -> Def {
        let tcs_num_patches = b.load_sysval(Intrinsic::LoadTcsNumPatchesAmd);
        let per_patch_data_offset = b.load_sysval(Intrinsic::LoadHsOutPatchDataOffsetAmd);
        let patches_size = b.imul_imm(tcs_num_patches, 16);
        let attr_stride = b.align_imm(patches_size, 256);

        let mapped = self.map_location(false, location);
        let off = calc_io_offset(b, component, io_offset, attr_stride, 4, mapped);

        let patch_offset = match patch_offset {
            Some(patch_offset) => patch_offset,
            None => {
                let rel_patch_id = b.load_sysval(Intrinsic::LoadTessRelPatchIdAmd);
                b.imul_imm(rel_patch_id, 16)
            }
        };

        let off = b.iadd_nuw(off, per_patch_data_offset);
        b.iadd_nuw(off, patch_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nir::varying::{TESS_LEVEL_INNER, TESS_LEVEL_OUTER, VAR0};
    use nir::{eval_u32, IntrinsicInstr, Shader};
    use pretty_assertions::assert_eq;

    #[test]
    fn patch_indices_follow_the_tess_levels() {
        let tf = varying::bit(TESS_LEVEL_OUTER) | varying::bit(TESS_LEVEL_INNER);
        assert_eq!(prefix_index(false, TESS_LEVEL_INNER, 0, tf, 0), 1);
        assert_eq!(prefix_index(false, PATCH0 + 3, 0, tf, 0b1010), 3);
        assert_eq!(prefix_index(true, VAR0 + 2, varying::bit(VAR0) | varying::bit(VAR0 + 2), 0, 0), 1);
    }

    #[test]
    #[should_panic(expected = "patch output 1 is not in")]
    fn unmapped_patch_output_is_fatal() {
        prefix_index(false, PATCH0 + 1, 0, 0, 0b1);
    }

    fn sysvals(intr: &IntrinsicInstr) -> Option<Vec<u64>> {
        let value = match intr.op {
            Intrinsic::LoadTessRelPatchIdAmd => 1,
            Intrinsic::LoadPatchVerticesIn => 3,
            Intrinsic::LoadLshsVertexStrideAmd => 48,
            Intrinsic::LoadTcsNumPatchesAmd => 5,
            Intrinsic::LoadTcsMemAttribStride => 1024,
            Intrinsic::LoadHsOutPatchDataOffsetAmd => 8192,
            _ => return None,
        };
        Some(vec![value])
    }

    #[test]
    fn lds_output_offsets_skip_the_input_patches_and_the_header() {
        let io_info = TessIoInfo {
            lds_output_mask: varying::bit(VAR0) | varying::bit(VAR0 + 1) | varying::bit(TESS_LEVEL_OUTER),
            lds_patch_output_mask: 0b1,
            ..Default::default()
        };
        let layout = LdsLayout {
            io_info: &io_info,
            tcs_vertices_out: 3,
            vote_bytes: 16,
        };
        let mut shader = Shader::new(Stage::TessCtrl, "lds");
        let mut b = Builder::at_end(&mut shader);
        let vertex = b.imm_u32(2);
        let zero = b.imm_u32(0);
        let vertex_off = layout.output_offset(&mut b, VAR0 + 1, 1, Some(vertex), Some(zero));
        let patch_off = layout.output_offset(&mut b, PATCH0, 0, None, Some(zero));
        let patch_base = layout.output_offset(&mut b, 0, 0, None, None);

        // Patch 1 of 5, 3 input vertices of 48 bytes, output patch stride 132, header 16.
        let patch_start = 5 * 3 * 48 + 132 + 16;
        assert_eq!(eval_u32(&shader, vertex_off, &sysvals), Some(patch_start + 2 * 32 + 16 + 4));
        assert_eq!(eval_u32(&shader, patch_off, &sysvals), Some(patch_start + 3 * 32 + 16));
        assert_eq!(eval_u32(&shader, patch_base, &sysvals), Some(patch_start + 3 * 32));
    }

    #[test]
    fn lds_output_patches_never_overlap() {
        for tcs_vertices_out in [1u32, 2, 4, 8] {
            for num_vertex_outputs in [0u32, 1, 4] {
                for num_patch_outputs in [1u32, 4, 32] {
                    let io_info = TessIoInfo {
                        lds_output_mask: (((1u64 << num_vertex_outputs) - 1) << VAR0) | TESS_LVL_MASK,
                        lds_patch_output_mask: u32::MAX >> (32 - num_patch_outputs),
                        ..Default::default()
                    };
                    let point = format!("{tcs_vertices_out} vertices, {num_vertex_outputs}+{num_patch_outputs} outputs");
                    let pervertex_size = io_info.lds_pervertex_output_patch_size(tcs_vertices_out);
                    assert_eq!(pervertex_size, tcs_vertices_out * num_vertex_outputs * 16, "{point}");
                    assert_eq!(
                        io_info.lds_output_patch_stride(tcs_vertices_out),
                        pervertex_size + (2 + num_patch_outputs) * 16 + 4,
                        "{point}"
                    );

                    let layout = LdsLayout {
                        io_info: &io_info,
                        tcs_vertices_out,
                        vote_bytes: 16,
                    };
                    let mut shader = Shader::new(Stage::TessCtrl, "lds");
                    let mut b = Builder::at_end(&mut shader);
                    let zero = b.imm_u32(0);
                    let last_vertex = b.imm_u32(tcs_vertices_out - 1);
                    let lowest = match num_vertex_outputs {
                        0 => layout.output_offset(&mut b, TESS_LEVEL_OUTER, 0, None, Some(zero)),
                        _ => layout.output_offset(&mut b, VAR0, 0, Some(zero), Some(zero)),
                    };
                    let highest_vertex = (num_vertex_outputs > 0).then(|| {
                        layout.output_offset(&mut b, VAR0 + num_vertex_outputs - 1, 3, Some(last_vertex), Some(zero))
                    });
                    let first_patch = layout.output_offset(&mut b, TESS_LEVEL_OUTER, 0, None, Some(zero));
                    let highest = layout.output_offset(&mut b, PATCH0 + num_patch_outputs - 1, 3, None, Some(zero));

                    let at = |def: Def, rel_patch_id: u64| {
                        eval_u32(&shader, def, &|intr: &IntrinsicInstr| match intr.op {
                            Intrinsic::LoadTessRelPatchIdAmd => Some(vec![rel_patch_id]),
                            _ => sysvals(intr),
                        })
                        .unwrap()
                    };
                    for rel_patch_id in [0u64, 3] {
                        if let Some(highest_vertex) = highest_vertex {
                            // The per-patch part starts right after the last vertex.
                            assert_eq!(at(highest_vertex, rel_patch_id) + 4, at(first_patch, rel_patch_id), "{point}");
                        }
                        // The next patch starts after the padding dword.
                        assert_eq!(at(highest, rel_patch_id) + 8, at(lowest, rel_patch_id + 1), "{point}");
                    }
                }
            }
        }
    }

    #[test]
    fn ring_offsets_per_vertex_and_per_patch() {
        let layout = VramLayout {
            vram_output_mask: varying::bit(VAR0) | varying::bit(VAR0 + 4) | varying::bit(TESS_LEVEL_INNER),
            vram_patch_output_mask: 0b10,
            map_io: None,
        };
        let mut shader = Shader::new(Stage::TessCtrl, "vram");
        shader.info.tess.tcs_vertices_out = 4;
        let mut b = Builder::at_end(&mut shader);
        let vertex = b.imm_u32(3);
        let zero = b.imm_u32(0);
        let vertex_off = layout.per_vertex_offset(&mut b, VAR0 + 4, 2, vertex, zero, None);
        let patch_off = layout.per_patch_offset(&mut b, PATCH0 + 1, 0, zero, None);
        let level_off = layout.per_patch_offset(&mut b, TESS_LEVEL_INNER, 0, zero, None);

        assert_eq!(eval_u32(&shader, vertex_off, &sysvals), Some(1024 + 4 * 16 + 3 * 16 + 2 * 4));
        // align(5 * 16, 256) per attribute; the tess level comes first.
        assert_eq!(eval_u32(&shader, patch_off, &sysvals), Some(256 + 8192 + 16));
        assert_eq!(eval_u32(&shader, level_off, &sysvals), Some(8192 + 16));
    }
}
