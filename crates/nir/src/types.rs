use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Vertex,
    TessCtrl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Vertex => "vertex",
            Stage::TessCtrl => "tess_ctrl",
            Stage::TessEval => "tess_eval",
            Stage::Geometry => "geometry",
            Stage::Fragment => "fragment",
            Stage::Compute => "compute",
        }
    }
}

/// Tessellator domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TessPrimitiveMode {
    #[default]
    Unspecified,
    Triangles,
    Quads,
    Isolines,
}

impl TessPrimitiveMode {
    /// Number of `(outer, inner)` tess level components the domain consumes.
    ///
    /// An unspecified domain reports the maximum (quads).
    pub fn tess_level_components(self) -> (u32, u32) {
        match self {
            TessPrimitiveMode::Triangles => (3, 1),
            TessPrimitiveMode::Isolines => (2, 0),
            TessPrimitiveMode::Quads | TessPrimitiveMode::Unspecified => (4, 2),
        }
    }

    /// Value of `load_tcs_primitive_mode_amd` for this domain.
    pub fn hw_code(self) -> u32 {
        match self {
            TessPrimitiveMode::Unspecified => 0,
            TessPrimitiveMode::Triangles => 1,
            TessPrimitiveMode::Quads => 2,
            TessPrimitiveMode::Isolines => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TessSpacing {
    #[default]
    Unspecified,
    Equal,
    FractionalOdd,
    FractionalEven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GsPrimitive {
    #[default]
    Points,
    Lines,
    LinesAdjacency,
    LineStrip,
    Triangles,
    TrianglesAdjacency,
    TriangleStrip,
}

impl GsPrimitive {
    /// Vertices per output primitive for the strip topologies a GS may emit.
    pub fn output_vertices_per_primitive(self) -> u32 {
        match self {
            GsPrimitive::Points => 1,
            GsPrimitive::LineStrip => 2,
            GsPrimitive::TriangleStrip => 3,
            other => unreachable!("invalid GS output primitive {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BaseType {
    #[default]
    Invalid,
    Int,
    Uint,
    Float,
    Bool,
}

/// Scalar type of a value as recorded by `store_output`'s `src_type` index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AluType {
    pub base: BaseType,
    pub bit_size: u8,
}

impl AluType {
    pub const INVALID: AluType = AluType::new(BaseType::Invalid, 0);
    pub const UINT16: AluType = AluType::new(BaseType::Uint, 16);
    pub const UINT32: AluType = AluType::new(BaseType::Uint, 32);
    pub const INT32: AluType = AluType::new(BaseType::Int, 32);
    pub const FLOAT16: AluType = AluType::new(BaseType::Float, 16);
    pub const FLOAT32: AluType = AluType::new(BaseType::Float, 32);

    pub const fn new(base: BaseType, bit_size: u8) -> Self {
        Self { base, bit_size }
    }

    pub fn with_bit_size(self, bit_size: u8) -> Self {
        Self::new(self.base, bit_size)
    }
}

impl fmt::Display for AluType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.base {
            BaseType::Invalid => return f.write_str("invalid"),
            BaseType::Int => "int",
            BaseType::Uint => "uint",
            BaseType::Float => "float",
            BaseType::Bool => "bool",
        };
        write!(f, "{prefix}{}", self.bit_size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TessInfo {
    pub tcs_vertices_out: u8,
    pub primitive_mode: TessPrimitiveMode,
    pub spacing: TessSpacing,
    /// Per-vertex outputs some invocation writes for another invocation's vertex.
    pub tcs_cross_invocation_outputs_written: u64,
    /// Outputs the linked TES may read (all of them when unlinked).
    pub tcs_outputs_read_by_tes: u64,
    pub tcs_patch_outputs_read_by_tes: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GsInfo {
    pub vertices_in: u8,
    pub vertices_out: u16,
    pub input_primitive: GsPrimitive,
    pub output_primitive: GsPrimitive,
    pub invocations: u8,
    /// One bit per vertex stream the GS emits to.
    pub active_stream_mask: u8,
}

/// Shader-wide I/O usage, the subset of `shader_info` the AMD passes consult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderInfo {
    pub stage: Stage,
    pub inputs_read: u64,
    pub inputs_read_16bit: u16,
    pub patch_inputs_read: u32,
    pub outputs_written: u64,
    pub outputs_written_16bit: u16,
    pub outputs_read: u64,
    pub outputs_read_indirectly: u64,
    pub outputs_written_indirectly: u64,
    pub patch_outputs_written: u32,
    pub patch_outputs_read: u32,
    pub patch_outputs_read_indirectly: u32,
    pub patch_outputs_written_indirectly: u32,
    pub writes_memory: bool,
    pub clip_distance_array_size: u8,
    pub cull_distance_array_size: u8,
    pub tess: TessInfo,
    pub gs: GsInfo,
}

impl ShaderInfo {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            inputs_read: 0,
            inputs_read_16bit: 0,
            patch_inputs_read: 0,
            outputs_written: 0,
            outputs_written_16bit: 0,
            outputs_read: 0,
            outputs_read_indirectly: 0,
            outputs_written_indirectly: 0,
            patch_outputs_written: 0,
            patch_outputs_read: 0,
            patch_outputs_read_indirectly: 0,
            patch_outputs_written_indirectly: 0,
            writes_memory: false,
            clip_distance_array_size: 0,
            cull_distance_array_size: 0,
            tess: TessInfo::default(),
            gs: GsInfo::default(),
        }
    }
}

/// One transform-feedback output record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XfbOutput {
    pub buffer: u8,
    /// Byte offset inside one vertex record of `buffer`.
    pub offset: u16,
    pub location: u8,
    pub high_16bits: bool,
    pub component_mask: u8,
    pub component_offset: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XfbBuffer {
    /// Vertex stride in bytes.
    pub stride: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XfbInfo {
    pub buffers_written: u8,
    pub streams_written: u8,
    pub buffers: [XfbBuffer; 4],
    pub buffer_to_stream: [u8; 4],
    pub outputs: Vec<XfbOutput>,
}
