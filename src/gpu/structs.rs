use bitflags::bitflags;
use std::hash::Hash;

#[cfg(feature = "rhi-serde")]
use serde::{Deserialize, Serialize};

pub const MAX_COLOR_ATTACHMENTS: usize = 4;

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum BufferType {
    Vertex,
    Index,
    Uniform,
    PixelPack,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum BufferUsage {
    #[default]
    Static,
    Dynamic,
    Immutable,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum ShaderStage {
    Fragment,
    Vertex,
    Compute,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum VertexFormat {
    Float4,
    Float3,
    Float2,
    Float,
    Int4,
    Int3,
    Int2,
    Int,
    UShort4,
    UShort2,
    UByte4,
    Mat4,
}

impl VertexFormat {
    /// Size in bytes of one attribute of this format.
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float4 | VertexFormat::Int4 => 16,
            VertexFormat::Float3 | VertexFormat::Int3 => 12,
            VertexFormat::Float2 | VertexFormat::Int2 | VertexFormat::UShort4 => 8,
            VertexFormat::Float
            | VertexFormat::Int
            | VertexFormat::UShort2
            | VertexFormat::UByte4 => 4,
            VertexFormat::Mat4 => 64,
        }
    }

    /// Components per location slot.
    pub fn components(self) -> u32 {
        match self {
            VertexFormat::Float4
            | VertexFormat::Int4
            | VertexFormat::UShort4
            | VertexFormat::UByte4
            | VertexFormat::Mat4 => 4,
            VertexFormat::Float3 | VertexFormat::Int3 => 3,
            VertexFormat::Float2 | VertexFormat::Int2 | VertexFormat::UShort2 => 2,
            VertexFormat::Float | VertexFormat::Int => 1,
        }
    }

    /// Number of consecutive attribute locations consumed.
    pub fn location_slots(self) -> u32 {
        match self {
            VertexFormat::Mat4 => 4,
            _ => 1,
        }
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum PixelFormat {
    Pvrtc4,
    Pvrtc4A,
    Pvrtc2,
    Pvrtc2A,
    Etc1,
    Etc2Rgb,
    Etc2Rgba,
    S3tcDxt1,
    S3tcDxt3,
    S3tcDxt5,
    AtcRgb,
    AtcExplicitAlpha,
    AtcInterpolatedAlpha,
    Astc4x4,
    Astc5x4,
    Astc5x5,
    Astc6x5,
    Astc6x6,
    Astc8x5,
    Astc8x6,
    Astc8x8,
    Astc10x5,
    Astc10x6,
    Astc10x8,
    Astc10x10,
    Astc12x10,
    Astc12x12,
    #[default]
    RGBA8,
    BGRA8,
    RGB8,
    RGB565,
    RGBA4,
    RGB5A1,
    R8,
    RG8,
    RGBA32F,
    D24S8,
    None,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 37] = [
        PixelFormat::Pvrtc4,
        PixelFormat::Pvrtc4A,
        PixelFormat::Pvrtc2,
        PixelFormat::Pvrtc2A,
        PixelFormat::Etc1,
        PixelFormat::Etc2Rgb,
        PixelFormat::Etc2Rgba,
        PixelFormat::S3tcDxt1,
        PixelFormat::S3tcDxt3,
        PixelFormat::S3tcDxt5,
        PixelFormat::AtcRgb,
        PixelFormat::AtcExplicitAlpha,
        PixelFormat::AtcInterpolatedAlpha,
        PixelFormat::Astc4x4,
        PixelFormat::Astc5x4,
        PixelFormat::Astc5x5,
        PixelFormat::Astc6x5,
        PixelFormat::Astc6x6,
        PixelFormat::Astc8x5,
        PixelFormat::Astc8x6,
        PixelFormat::Astc8x8,
        PixelFormat::Astc10x5,
        PixelFormat::Astc10x6,
        PixelFormat::Astc10x8,
        PixelFormat::Astc10x10,
        PixelFormat::Astc12x10,
        PixelFormat::Astc12x12,
        PixelFormat::RGBA8,
        PixelFormat::BGRA8,
        PixelFormat::RGB8,
        PixelFormat::RGB565,
        PixelFormat::RGBA4,
        PixelFormat::RGB5A1,
        PixelFormat::R8,
        PixelFormat::RG8,
        PixelFormat::RGBA32F,
        PixelFormat::D24S8,
    ];
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum TextureType {
    #[default]
    Texture2D,
    Texture2DArray,
    TextureCube,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum TextureUsage {
    #[default]
    Read,
    Write,
    RenderTarget,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum TextureCubeFace {
    PositiveX,
    NegativeX,
    PositiveY,
    NegativeY,
    PositiveZ,
    NegativeZ,
}

impl TextureCubeFace {
    pub fn index(self) -> u32 {
        self as u32
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum IndexFormat {
    #[default]
    UShort,
    UInt,
}

impl IndexFormat {
    pub fn size(self) -> usize {
        match self {
            IndexFormat::UShort => 2,
            IndexFormat::UInt => 4,
        }
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum PrimitiveType {
    Point,
    Line,
    LineLoop,
    LineStrip,
    #[default]
    Triangle,
    TriangleStrip,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    #[default]
    Always,
}

impl CompareFunc {
    pub fn passes<T: PartialOrd>(self, incoming: T, stored: T) -> bool {
        match self {
            CompareFunc::Never => false,
            CompareFunc::Less => incoming < stored,
            CompareFunc::Equal => incoming == stored,
            CompareFunc::LessEqual => incoming <= stored,
            CompareFunc::Greater => incoming > stored,
            CompareFunc::NotEqual => incoming != stored,
            CompareFunc::GreaterEqual => incoming >= stored,
            CompareFunc::Always => true,
        }
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantAlpha,
    SrcAlphaSaturate,
    OneMinusConstantAlpha,
    BlendColor,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum CullMode {
    #[default]
    None,
    Back,
    Front,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum Winding {
    ClockWise,
    #[default]
    CounterClockWise,
}

bitflags! {
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
    pub struct ColorWriteMask: u32 {
        const RED   = 0x1;
        const GREEN = 0x2;
        const BLUE  = 0x4;
        const ALPHA = 0x8;
        const ALL   = 0xF;
    }
}

impl Default for ColorWriteMask {
    fn default() -> Self {
        ColorWriteMask::ALL
    }
}

bitflags! {
    /// Attachment selection, used both for clear requests and for a render
    /// target's per-attachment dirty set.
    #[repr(C)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
    pub struct TargetBufferFlags: u32 {
        const COLOR0 = 0x1;
        const COLOR1 = 0x2;
        const COLOR2 = 0x4;
        const COLOR3 = 0x8;
        const COLOR = Self::COLOR0.bits();
        const COLOR_ALL = Self::COLOR0.bits() | Self::COLOR1.bits() | Self::COLOR2.bits() | Self::COLOR3.bits();
        const DEPTH = 0x10;
        const STENCIL = 0x20;
        const DEPTH_AND_STENCIL = Self::DEPTH.bits() | Self::STENCIL.bits();
        const ALL = Self::COLOR_ALL.bits() | Self::DEPTH_AND_STENCIL.bits();
    }
}

impl TargetBufferFlags {
    /// Flag for color attachment `index`.
    pub fn color(index: usize) -> Self {
        debug_assert!(index < MAX_COLOR_ATTACHMENTS);
        TargetBufferFlags::from_bits_truncate(1 << index)
    }

    pub fn has_color(self, index: usize) -> bool {
        self.contains(Self::color(index))
    }

    pub fn has_depth_stencil(self) -> bool {
        self.intersects(TargetBufferFlags::DEPTH_AND_STENCIL)
    }
}

bitflags! {
    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
    pub struct DepthStencilFlags: u32 {
        const DEPTH_TEST   = 0x1;
        const DEPTH_WRITE  = 0x2;
        const STENCIL_TEST = 0x4;
        const DEPTH_STENCIL_TEST = Self::DEPTH_TEST.bits() | Self::STENCIL_TEST.bits();
        const ALL = Self::DEPTH_TEST.bits() | Self::DEPTH_WRITE.bits() | Self::STENCIL_TEST.bits();
    }
}

impl Default for DepthStencilFlags {
    fn default() -> Self {
        DepthStencilFlags::ALL
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum SamplerAddressMode {
    Repeat,
    MirrorRepeat,
    #[default]
    ClampToEdge,
    ClampToBorder,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum SamplerMinFilter {
    Nearest,
    #[default]
    Linear,
    Anisotropic,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum SamplerMagFilter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub enum SamplerMipFilter {
    Nearest,
    Linear,
    /// No mip filtering.
    #[default]
    Default,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub struct SamplerDesc {
    pub min_filter: SamplerMinFilter,
    pub mag_filter: SamplerMagFilter,
    pub mip_filter: SamplerMipFilter,
    pub s_address_mode: SamplerAddressMode,
    pub t_address_mode: SamplerAddressMode,
    pub w_address_mode: SamplerAddressMode,
    pub compare_func: CompareFunc,
    pub anisotropy: u8,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: SamplerMinFilter::Linear,
            mag_filter: SamplerMagFilter::Linear,
            mip_filter: SamplerMipFilter::Default,
            s_address_mode: SamplerAddressMode::ClampToEdge,
            t_address_mode: SamplerAddressMode::ClampToEdge,
            w_address_mode: SamplerAddressMode::ClampToEdge,
            compare_func: CompareFunc::Never,
            anisotropy: 1,
        }
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub struct TextureDesc {
    pub texture_type: TextureType,
    pub format: PixelFormat,
    pub usage: TextureUsage,
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
    /// Zero asks the device to generate the full chain.
    pub mip_levels: u32,
    pub sampler: SamplerDesc,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            texture_type: TextureType::Texture2D,
            format: PixelFormat::RGBA8,
            usage: TextureUsage::Read,
            width: 1,
            height: 1,
            array_size: 1,
            mip_levels: 1,
            sampler: SamplerDesc::default(),
        }
    }
}

impl TextureDesc {
    /// Number of array layers the device allocates (six for cube maps).
    pub fn layer_count(&self) -> u32 {
        match self.texture_type {
            TextureType::Texture2D => 1,
            TextureType::Texture2DArray => self.array_size.max(1),
            TextureType::TextureCube => 6,
        }
    }
}

/// Number of levels in a full mip chain for a `width` x `height` image.
pub fn full_mip_chain(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub struct BlendDesc {
    pub write_mask: ColorWriteMask,
    pub blend_enabled: bool,
    pub rgb_blend_op: BlendOp,
    pub alpha_blend_op: BlendOp,
    pub source_rgb_blend_factor: BlendFactor,
    pub destination_rgb_blend_factor: BlendFactor,
    pub source_alpha_blend_factor: BlendFactor,
    pub destination_alpha_blend_factor: BlendFactor,
}

impl Default for BlendDesc {
    fn default() -> Self {
        Self {
            write_mask: ColorWriteMask::ALL,
            blend_enabled: false,
            rgb_blend_op: BlendOp::Add,
            alpha_blend_op: BlendOp::Add,
            source_rgb_blend_factor: BlendFactor::One,
            destination_rgb_blend_factor: BlendFactor::Zero,
            source_alpha_blend_factor: BlendFactor::One,
            destination_alpha_blend_factor: BlendFactor::Zero,
        }
    }
}

impl BlendDesc {
    /// Premultiplied-style alpha blending.
    pub fn alpha_blend() -> Self {
        Self {
            blend_enabled: true,
            source_rgb_blend_factor: BlendFactor::SrcAlpha,
            destination_rgb_blend_factor: BlendFactor::OneMinusSrcAlpha,
            source_alpha_blend_factor: BlendFactor::One,
            destination_alpha_blend_factor: BlendFactor::OneMinusSrcAlpha,
            ..Default::default()
        }
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub struct StencilDesc {
    pub stencil_failure_operation: StencilOp,
    pub depth_failure_operation: StencilOp,
    pub depth_stencil_pass_operation: StencilOp,
    pub stencil_compare_function: CompareFunc,
    pub read_mask: u32,
    pub write_mask: u32,
}

impl Default for StencilDesc {
    fn default() -> Self {
        Self {
            stencil_failure_operation: StencilOp::Keep,
            depth_failure_operation: StencilOp::Keep,
            depth_stencil_pass_operation: StencilOp::Keep,
            stencil_compare_function: CompareFunc::Always,
            read_mask: 0,
            write_mask: 0,
        }
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub struct DepthStencilDesc {
    pub depth_compare_function: CompareFunc,
    pub back_face_stencil: StencilDesc,
    pub front_face_stencil: StencilDesc,
    pub flags: DepthStencilFlags,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_compare_function: CompareFunc::Less,
            back_face_stencil: StencilDesc::default(),
            front_face_stencil: StencilDesc::default(),
            flags: DepthStencilFlags::ALL,
        }
    }
}

impl DepthStencilDesc {
    pub fn is_enabled(&self) -> bool {
        self.flags.intersects(DepthStencilFlags::DEPTH_STENCIL_TEST)
    }

    pub fn depth_test(&self) -> bool {
        self.flags.contains(DepthStencilFlags::DEPTH_TEST)
    }

    pub fn depth_write(&self) -> bool {
        self.flags.contains(DepthStencilFlags::DEPTH_WRITE)
    }

    pub fn stencil_test(&self) -> bool {
        self.flags.contains(DepthStencilFlags::STENCIL_TEST)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderPassDesc {
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub clear_flags: TargetBufferFlags,
}

impl Default for RenderPassDesc {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 0.0],
            clear_depth: 1.0,
            clear_stencil: 0,
            clear_flags: TargetBufferFlags::empty(),
        }
    }
}

impl RenderPassDesc {
    pub fn clear_color(color: [f32; 4]) -> Self {
        Self {
            clear_color: color,
            clear_flags: TargetBufferFlags::COLOR,
            ..Default::default()
        }
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "rhi-serde", derive(Serialize, Deserialize))]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Fixed-function rasterizer configuration applied lazily at draw time.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RasterizerState {
    pub cull_mode: CullMode,
    pub winding: Winding,
    pub scissor: Option<ScissorRect>,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureType {
    Etc1,
    Etc2,
    S3tc,
    AmdCompressedAtc,
    Pvrtc,
    ImgFormatBgra8888,
    DiscardFramebuffer,
    PackedDepthStencil,
    Vao,
    Mapbuffer,
    Depth24,
    Astc,
    VertexAttribBinding,
}

impl FeatureType {
    pub const ALL: [FeatureType; 13] = [
        FeatureType::Etc1,
        FeatureType::Etc2,
        FeatureType::S3tc,
        FeatureType::AmdCompressedAtc,
        FeatureType::Pvrtc,
        FeatureType::ImgFormatBgra8888,
        FeatureType::DiscardFramebuffer,
        FeatureType::PackedDepthStencil,
        FeatureType::Vao,
        FeatureType::Mapbuffer,
        FeatureType::Depth24,
        FeatureType::Astc,
        FeatureType::VertexAttribBinding,
    ];
}

/// Strings reported by the device at construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor: String,
    pub renderer: String,
    pub version: String,
    pub shader_version: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub max_attributes: u32,
    pub max_texture_size: u32,
    pub max_texture_units: u32,
    pub max_samples: u32,
    pub compressed_formats: Vec<PixelFormat>,
}

/// CPU-side result of a color readback. RGBA8, tightly packed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PixelBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PixelBuffer {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// RGBA of the texel at (`x`, `y`) in buffer order.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = ((y * self.width + x) * 4) as usize;
        let px = self.data.get(at..at + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Reverse row order in place.
    pub fn flip_rows(&mut self) {
        let stride = self.width as usize * 4;
        if stride == 0 {
            return;
        }
        let rows = self.data.len() / stride;
        for row in 0..rows / 2 {
            let (top, bottom) = self.data.split_at_mut((rows - 1 - row) * stride);
            top[row * stride..(row + 1) * stride].swap_with_slice(&mut bottom[..stride]);
        }
    }
}
