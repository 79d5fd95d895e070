//! Intrinsic opcode table.
//!
//! Source layouts follow NIR: the value operand of a store is always source 0, the I/O offset
//! is always the last source of an I/O intrinsic, and the vertex index of a per-vertex access
//! precedes the offset.

/// Shape of an intrinsic's destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestShape {
    None,
    /// Fixed `(num_components, bit_size)`.
    Fixed(u8, u8),
    /// Sized by the builder call.
    Explicit,
}

macro_rules! intrinsics {
    ($($variant:ident => $name:literal, $srcs:expr, $dest:expr;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Intrinsic {
            $($variant,)*
        }

        impl Intrinsic {
            pub fn name(self) -> &'static str {
                match self {
                    $(Intrinsic::$variant => $name,)*
                }
            }

            pub fn num_srcs(self) -> usize {
                match self {
                    $(Intrinsic::$variant => $srcs,)*
                }
            }

            pub fn dest_shape(self) -> DestShape {
                match self {
                    $(Intrinsic::$variant => $dest,)*
                }
            }
        }
    };
}

use DestShape::{Explicit, Fixed, None as NoDest};

intrinsics! {
    LoadInput => "load_input", 1, Explicit;
    LoadPerVertexInput => "load_per_vertex_input", 2, Explicit;
    LoadOutput => "load_output", 1, Explicit;
    LoadPerVertexOutput => "load_per_vertex_output", 2, Explicit;
    StoreOutput => "store_output", 2, NoDest;
    StorePerVertexOutput => "store_per_vertex_output", 3, NoDest;

    LoadVar => "load_var", 0, Explicit;
    StoreVar => "store_var", 1, NoDest;

    LoadShared => "load_shared", 1, Explicit;
    StoreShared => "store_shared", 2, NoDest;
    SharedAtomic => "shared_atomic", 2, Explicit;
    LoadBufferAmd => "load_buffer_amd", 4, Explicit;
    StoreBufferAmd => "store_buffer_amd", 5, NoDest;
    LoadGlobal => "load_global", 1, Explicit;
    LoadGlobalConstant => "load_global_constant", 1, Explicit;
    StoreGlobal => "store_global", 2, NoDest;
    LoadSsbo => "load_ssbo", 2, Explicit;
    StoreSsbo => "store_ssbo", 3, NoDest;
    SsboAtomic => "ssbo_atomic", 3, Explicit;
    LoadUbo => "load_ubo", 2, Explicit;
    LoadPushConstant => "load_push_constant", 1, Explicit;
    LoadConstant => "load_constant", 1, Explicit;
    LoadScratch => "load_scratch", 1, Explicit;
    StoreScratch => "store_scratch", 2, NoDest;
    LoadSmemAmd => "load_smem_amd", 2, Explicit;

    ExportAmd => "export_amd", 1, NoDest;
    ExportRowAmd => "export_row_amd", 2, NoDest;
    SendmsgAmd => "sendmsg_amd", 1, NoDest;

    EmitVertexWithCounter => "emit_vertex_with_counter", 2, NoDest;
    EndPrimitiveWithCounter => "end_primitive_with_counter", 2, NoDest;
    SetVertexAndPrimitiveCount => "set_vertex_and_primitive_count", 2, NoDest;

    Ballot => "ballot", 1, Explicit;
    InverseBallot => "inverse_ballot", 1, Fixed(1, 1);
    VoteAll => "vote_all", 1, Fixed(1, 1);
    Elect => "elect", 0, Fixed(1, 1);
    Reduce => "reduce", 1, Explicit;
    ReadInvocation => "read_invocation", 2, Explicit;
    IsSubgroupInvocationLtAmd => "is_subgroup_invocation_lt_amd", 1, Fixed(1, 1);

    Barrier => "barrier", 0, NoDest;

    LoadScalarArgAmd => "load_scalar_arg_amd", 0, Explicit;
    LoadVectorArgAmd => "load_vector_arg_amd", 0, Explicit;
    StoreScalarArgAmd => "store_scalar_arg_amd", 1, NoDest;
    StoreVectorArgAmd => "store_vector_arg_amd", 1, NoDest;

    SleepAmd => "sleep_amd", 0, NoDest;
    NopAmd => "nop_amd", 0, NoDest;
    Terminate => "terminate", 0, NoDest;
    TerminateIf => "terminate_if", 1, NoDest;

    AtomicAddGsEmitPrimCountAmd => "atomic_add_gs_emit_prim_count_amd", 1, NoDest;
    AtomicAddGenPrimCountAmd => "atomic_add_gen_prim_count_amd", 1, NoDest;
    AtomicAddShaderInvocationCountAmd => "atomic_add_shader_invocation_count_amd", 1, NoDest;

    LoadLocalInvocationIndex => "load_local_invocation_index", 0, Fixed(1, 32);
    LoadInvocationId => "load_invocation_id", 0, Fixed(1, 32);
    LoadPrimitiveId => "load_primitive_id", 0, Fixed(1, 32);
    LoadVertexIdZeroBase => "load_vertex_id_zero_base", 0, Fixed(1, 32);
    LoadSubgroupId => "load_subgroup_id", 0, Fixed(1, 32);
    LoadSubgroupInvocation => "load_subgroup_invocation", 0, Fixed(1, 32);
    LoadGsWaveIdAmd => "load_gs_wave_id_amd", 0, Fixed(1, 32);
    LoadGsVertexOffsetAmd => "load_gs_vertex_offset_amd", 0, Fixed(1, 32);
    LoadEsgsVertexStrideAmd => "load_esgs_vertex_stride_amd", 0, Fixed(1, 32);
    LoadLshsVertexStrideAmd => "load_lshs_vertex_stride_amd", 0, Fixed(1, 32);
    LoadPatchVerticesIn => "load_patch_vertices_in", 0, Fixed(1, 32);
    LoadTessRelPatchIdAmd => "load_tess_rel_patch_id_amd", 0, Fixed(1, 32);
    LoadTcsNumPatchesAmd => "load_tcs_num_patches_amd", 0, Fixed(1, 32);
    LoadTcsMemAttribStride => "load_tcs_mem_attrib_stride", 0, Fixed(1, 32);
    LoadHsOutPatchDataOffsetAmd => "load_hs_out_patch_data_offset_amd", 0, Fixed(1, 32);
    LoadMergedWaveInfoAmd => "load_merged_wave_info_amd", 0, Fixed(1, 32);
    LoadTcsPrimitiveModeAmd => "load_tcs_primitive_mode_amd", 0, Fixed(1, 32);
    LoadStreamoutConfigAmd => "load_streamout_config_amd", 0, Fixed(1, 32);
    LoadStreamoutWriteIndexAmd => "load_streamout_write_index_amd", 0, Fixed(1, 32);
    LoadStreamoutOffsetAmd => "load_streamout_offset_amd", 0, Fixed(1, 32);
    LoadRingGs2vsOffsetAmd => "load_ring_gs2vs_offset_amd", 0, Fixed(1, 32);
    LoadRingEs2gsOffsetAmd => "load_ring_es2gs_offset_amd", 0, Fixed(1, 32);
    LoadRingTessOffchipOffsetAmd => "load_ring_tess_offchip_offset_amd", 0, Fixed(1, 32);
    LoadRingTessFactorsOffsetAmd => "load_ring_tess_factors_offset_amd", 0, Fixed(1, 32);
    LoadRingAttrOffsetAmd => "load_ring_attr_offset_amd", 0, Fixed(1, 32);
    LoadForceVrsRatesAmd => "load_force_vrs_rates_amd", 0, Fixed(1, 32);

    LoadTcsTessLevelsToTesAmd => "load_tcs_tess_levels_to_tes_amd", 0, Fixed(1, 1);
    LoadPrimGenQueryEnabledAmd => "load_prim_gen_query_enabled_amd", 0, Fixed(1, 1);
    LoadPipelineStatQueryEnabledAmd => "load_pipeline_stat_query_enabled_amd", 0, Fixed(1, 1);
    LoadClampVertexColorAmd => "load_clamp_vertex_color_amd", 0, Fixed(1, 1);

    LoadRingGsvsAmd => "load_ring_gsvs_amd", 0, Fixed(4, 32);
    LoadRingEsgsAmd => "load_ring_esgs_amd", 0, Fixed(4, 32);
    LoadRingTessOffchipAmd => "load_ring_tess_offchip_amd", 0, Fixed(4, 32);
    LoadRingTessFactorsAmd => "load_ring_tess_factors_amd", 0, Fixed(4, 32);
    LoadRingAttrAmd => "load_ring_attr_amd", 0, Fixed(4, 32);
    LoadStreamoutBufferAmd => "load_streamout_buffer_amd", 0, Fixed(4, 32);
    LoadUserClipPlane => "load_user_clip_plane", 0, Fixed(4, 32);
}

impl Intrinsic {
    pub fn has_dest(self) -> bool {
        self.dest_shape() != DestShape::None
    }

    /// Index of the I/O offset source for `load_*input`/`*output` intrinsics.
    pub fn io_offset_src(self) -> Option<usize> {
        match self {
            Intrinsic::LoadInput | Intrinsic::LoadOutput => Some(0),
            Intrinsic::LoadPerVertexInput | Intrinsic::LoadPerVertexOutput => Some(1),
            Intrinsic::StoreOutput => Some(1),
            Intrinsic::StorePerVertexOutput => Some(2),
            _ => None,
        }
    }

    /// Index of the vertex index source of per-vertex I/O.
    pub fn vertex_index_src(self) -> Option<usize> {
        match self {
            Intrinsic::LoadPerVertexInput | Intrinsic::LoadPerVertexOutput => Some(0),
            Intrinsic::StorePerVertexOutput => Some(1),
            _ => None,
        }
    }

    pub fn is_output_store(self) -> bool {
        matches!(self, Intrinsic::StoreOutput | Intrinsic::StorePerVertexOutput)
    }

    pub fn is_output_load(self) -> bool {
        matches!(self, Intrinsic::LoadOutput | Intrinsic::LoadPerVertexOutput)
    }

    /// Whether source 0 is the stored value.
    pub fn stores_value(self) -> bool {
        matches!(
            self,
            Intrinsic::StoreOutput
                | Intrinsic::StorePerVertexOutput
                | Intrinsic::StoreVar
                | Intrinsic::StoreShared
                | Intrinsic::StoreBufferAmd
                | Intrinsic::StoreGlobal
                | Intrinsic::StoreSsbo
                | Intrinsic::StoreScratch
                | Intrinsic::ExportAmd
                | Intrinsic::ExportRowAmd
                | Intrinsic::StoreScalarArgAmd
                | Intrinsic::StoreVectorArgAmd
        )
    }
}
