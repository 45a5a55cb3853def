//! Public value types: handles, pass descriptions, commands.
//!
//! Handles are opaque `(index, generation, flags)` triples. The generation
//! must match the pool slot for the handle to resolve; flag bits mark the
//! two special cases (the per-frame swap-chain texture and frame-scoped
//! scratch buffers, whose generation is the frame number they were created
//! in).

use smallvec::SmallVec;

use crate::data::DataProvider;

pub const MAX_SPECIALIZATION_CONSTANTS: usize = 8;
pub const MAX_BINDINGS: usize = 8;
pub const MAX_PASS_DEPENDENCIES: usize = 64;
pub const MAX_PASS_RENDER_TARGETS: usize = 8;

/// Bitset over pass indices of the current frame; bit `i` means "execute
/// after pass `i`".
pub type PassDependencies = u64;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ProgramRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct SamplerRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TextureRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
    pub(crate) is_swap_chain: bool,
}

impl TextureRef {
    pub fn is_swap_chain(&self) -> bool {
        self.is_swap_chain
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BufferRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
    pub(crate) is_scratch: bool,
}

impl BufferRef {
    pub fn is_scratch(&self) -> bool {
        self.is_scratch
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum RenderTargetLoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TextureFormat {
    /// Resolved to the device's preferred depth-stencil format.
    DepthStencil,
    R8Unorm,
    R8Srgb,
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba32Float,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PolygonMode {
    Fill,
    Line,
    Point,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CullMode {
    None,
    Front,
    Back,
    FrontAndBack,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

/// Requested multisample count; the pipeline picks the largest supported
/// mode that does not exceed it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum SamplingType {
    X1,
    X2,
    X4,
    X8,
    X16,
    X32,
    X64,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct StencilOpState {
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct DepthState {
    pub test_enabled: bool,
    pub write_enabled: bool,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum SpecConstantValue {
    Int(i32),
    Uint(u32),
    Float(f32),
    Bool(bool),
}

impl SpecConstantValue {
    /// Raw 32-bit payload handed to the driver.
    pub(crate) fn bits(self) -> u32 {
        match self {
            SpecConstantValue::Int(v) => v as u32,
            SpecConstantValue::Uint(v) => v,
            SpecConstantValue::Float(v) => v.to_bits(),
            SpecConstantValue::Bool(v) => v as u32,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SpecConstant {
    pub constant_id: u32,
    pub value: SpecConstantValue,
}

#[derive(Clone, Debug)]
pub struct ProgramWithConstants {
    pub program: ProgramRef,
    pub constants: SmallVec<[SpecConstant; MAX_SPECIALIZATION_CONSTANTS]>,
}

impl ProgramWithConstants {
    pub fn new(program: ProgramRef) -> ProgramWithConstants {
        ProgramWithConstants {
            program,
            constants: SmallVec::new(),
        }
    }

    pub fn with_constants(
        program: ProgramRef,
        constants: &[SpecConstant],
    ) -> ProgramWithConstants {
        assert!(constants.len() <= MAX_SPECIALIZATION_CONSTANTS);
        ProgramWithConstants {
            program,
            constants: SmallVec::from_slice(constants),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PassRenderTarget {
    pub texture: TextureRef,
    pub load_op: RenderTargetLoadOp,
    pub clear_color: [f32; 4],
}

impl PassRenderTarget {
    pub fn new(texture: TextureRef, load_op: RenderTargetLoadOp) -> PassRenderTarget {
        PassRenderTarget {
            texture,
            load_op,
            clear_color: [0.0; 4],
        }
    }

    pub fn cleared(texture: TextureRef, clear_color: [f32; 4]) -> PassRenderTarget {
        PassRenderTarget {
            texture,
            load_op: RenderTargetLoadOp::Clear,
            clear_color,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GraphicsPassInfo {
    pub dependencies: PassDependencies,
    pub vertex_program: ProgramWithConstants,
    pub fragment_program: ProgramWithConstants,
    pub render_targets: SmallVec<[PassRenderTarget; MAX_PASS_RENDER_TARGETS]>,
    pub depth_stencil_target: Option<PassRenderTarget>,
    pub front_stencil: Option<StencilOpState>,
    pub back_stencil: Option<StencilOpState>,
    pub depth: DepthState,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub sampling: SamplingType,
}

#[derive(Clone, Debug)]
pub struct ComputePassInfo {
    pub dependencies: PassDependencies,
    pub program: ProgramWithConstants,
}

#[derive(Copy, Clone, Debug)]
pub enum BindingValue {
    Texture {
        texture: TextureRef,
        sampler: SamplerRef,
    },
    Buffer {
        buffer: BufferRef,
        offset: u64,
        /// 0 means "rest of the buffer" (or of the scratch view).
        size: u64,
    },
}

#[derive(Copy, Clone, Debug)]
pub struct Binding {
    pub binding: u32,
    pub value: BindingValue,
}

#[derive(Clone, Debug)]
pub struct BindInfo {
    pub set: u32,
    pub bindings: SmallVec<[Binding; MAX_BINDINGS]>,
}

#[derive(Copy, Clone, Debug)]
pub struct DrawInfo {
    pub num_vertices: u32,
    pub num_instances: u32,
}

#[derive(Copy, Clone, Debug)]
pub struct DispatchInfo {
    pub group_count_x: u32,
    pub group_count_y: u32,
    pub group_count_z: u32,
}

#[derive(Clone, Debug)]
pub struct ProgramInfo {
    pub data: DataProvider,
}

#[derive(Clone, Debug)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: DataProvider,
}

#[derive(Clone, Debug)]
pub struct MemoryBufferInfo {
    pub data: DataProvider,
}

#[derive(Copy, Clone, Debug)]
pub struct SamplerInfo {
    pub mag_filter: SamplerFilter,
    pub min_filter: SamplerFilter,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    pub mipmap_mode: SamplerMipmapMode,
    pub mip_lod_bias: f32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub compare_enabled: bool,
    pub compare_op: CompareOp,
}

impl Default for SamplerInfo {
    fn default() -> SamplerInfo {
        SamplerInfo {
            mag_filter: SamplerFilter::Linear,
            min_filter: SamplerFilter::Linear,
            address_mode_u: SamplerAddressMode::Repeat,
            address_mode_v: SamplerAddressMode::Repeat,
            address_mode_w: SamplerAddressMode::Repeat,
            mipmap_mode: SamplerMipmapMode::Linear,
            mip_lod_bias: 0.0,
            min_lod: 0.0,
            max_lod: 0.0,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
            compare_enabled: false,
            compare_op: CompareOp::Always,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SamplerFilter {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SamplerAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SamplerMipmapMode {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TextureSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct ComputeWorkgroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}
