use crate::gpu::{FeatureType, GlConfig};

/// Version parsed from a `GL_VERSION` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlVersion {
    pub es: bool,
    pub major: u32,
    pub minor: u32,
}

fn digit_at(s: &str, at: usize) -> Option<u32> {
    s.as_bytes().get(at).and_then(|b| (*b as char).to_digit(10))
}

impl GlVersion {
    /// Parse `"4.6.0 NVIDIA 535.54"` or `"OpenGL ES 3.2 Mesa 23.1"`. The
    /// digits sit at fixed positions in both spellings.
    pub fn parse(version: &str) -> Option<Self> {
        if let Some(at) = version.find("OpenGL ES") {
            let hint = &version[at..];
            return Some(Self {
                es: true,
                major: digit_at(hint, 10)?,
                minor: digit_at(hint, 12)?,
            });
        }
        Some(Self {
            es: false,
            major: digit_at(version, 0)?,
            minor: digit_at(version, 2)?,
        })
    }

    /// Check the context against the minimum: desktop 3.3, or the
    /// configured GLES major. The error is the user-facing message.
    pub fn check_minimum(&self, config: &GlConfig, raw: &str) -> Result<(), String> {
        let too_old = if self.es {
            self.major < config.required_gles_major
        } else {
            (self.major, self.minor) < (3, 3)
        };
        if !too_old {
            return Ok(());
        }
        Err(if self.es {
            format!(
                "OpenGL ES {}.0+ is required. Current version: {raw} incompatible (update driver or make current context).",
                config.required_gles_major
            )
        } else {
            format!("OpenGL 3.3+ is required. Current version: {raw} incompatible (update driver or make current context).")
        })
    }
}

/// Extension whose presence reports `feature`. Features answered from the
/// compressed-format list or a probe have none.
pub fn feature_extension(feature: FeatureType, es: bool) -> Option<&'static str> {
    Some(match feature {
        FeatureType::Etc1 => "GL_OES_compressed_ETC1_RGB8_texture",
        FeatureType::S3tc => "GL_EXT_texture_compression_s3tc",
        FeatureType::AmdCompressedAtc => "GL_AMD_compressed_ATC_texture",
        FeatureType::Pvrtc => "GL_IMG_texture_compression_pvrtc",
        FeatureType::ImgFormatBgra8888 => "GL_IMG_texture_format_BGRA8888",
        FeatureType::DiscardFramebuffer => "GL_EXT_discard_framebuffer",
        FeatureType::PackedDepthStencil => "GL_OES_packed_depth_stencil",
        FeatureType::Vao if es => "GL_OES_vertex_array_object",
        FeatureType::Vao => "GL_ARB_vertex_array_object",
        FeatureType::Mapbuffer => "GL_OES_mapbuffer",
        FeatureType::Depth24 => "GL_OES_depth24",
        FeatureType::Etc2 | FeatureType::Astc | FeatureType::VertexAttribBinding => return None,
    })
}

#[cfg(feature = "rhi-gl")]
pub(crate) use convert::*;

#[cfg(feature = "rhi-gl")]
mod convert {
    use super::super::state::{BufferTarget, Capability, Face};
    use crate::gpu::{
        BlendFactor, BlendOp, CompareFunc, IndexFormat, PixelFormat, PrimitiveType,
        SamplerAddressMode, SamplerDesc, SamplerMagFilter, SamplerMinFilter, SamplerMipFilter,
        StencilOp, TextureType, VertexFormat, Winding,
    };

    // Extension enums by value; not every registry constant is exported.
    const COMPRESSED_RGB_PVRTC_4BPPV1_IMG: u32 = 0x8C00;
    const COMPRESSED_RGB_PVRTC_2BPPV1_IMG: u32 = 0x8C01;
    const COMPRESSED_RGBA_PVRTC_4BPPV1_IMG: u32 = 0x8C02;
    const COMPRESSED_RGBA_PVRTC_2BPPV1_IMG: u32 = 0x8C03;
    const ETC1_RGB8_OES: u32 = 0x8D64;
    const COMPRESSED_RGB8_ETC2: u32 = 0x9274;
    pub const COMPRESSED_RGBA8_ETC2_EAC: u32 = 0x9278;
    const COMPRESSED_RGBA_S3TC_DXT1_EXT: u32 = 0x83F1;
    const COMPRESSED_RGBA_S3TC_DXT3_EXT: u32 = 0x83F2;
    const COMPRESSED_RGBA_S3TC_DXT5_EXT: u32 = 0x83F3;
    const ATC_RGB_AMD: u32 = 0x8C92;
    const ATC_RGBA_EXPLICIT_ALPHA_AMD: u32 = 0x8C93;
    const ATC_RGBA_INTERPOLATED_ALPHA_AMD: u32 = 0x87EE;
    pub const COMPRESSED_RGBA_ASTC_4X4_KHR: u32 = 0x93B0;
    const COMPRESSED_RGBA_ASTC_5X4_KHR: u32 = 0x93B1;
    const COMPRESSED_RGBA_ASTC_5X5_KHR: u32 = 0x93B2;
    const COMPRESSED_RGBA_ASTC_6X5_KHR: u32 = 0x93B3;
    const COMPRESSED_RGBA_ASTC_6X6_KHR: u32 = 0x93B4;
    const COMPRESSED_RGBA_ASTC_8X5_KHR: u32 = 0x93B5;
    const COMPRESSED_RGBA_ASTC_8X6_KHR: u32 = 0x93B6;
    const COMPRESSED_RGBA_ASTC_8X8_KHR: u32 = 0x93B7;
    const COMPRESSED_RGBA_ASTC_10X5_KHR: u32 = 0x93B8;
    const COMPRESSED_RGBA_ASTC_10X6_KHR: u32 = 0x93B9;
    const COMPRESSED_RGBA_ASTC_10X8_KHR: u32 = 0x93BA;
    const COMPRESSED_RGBA_ASTC_10X10_KHR: u32 = 0x93BB;
    const COMPRESSED_RGBA_ASTC_12X10_KHR: u32 = 0x93BC;
    const COMPRESSED_RGBA_ASTC_12X12_KHR: u32 = 0x93BD;
    const BGRA_EXT: u32 = 0x80E1;

    /// Internal format, upload format and upload type for `format`.
    pub fn pixel_format(format: PixelFormat) -> (u32, u32, u32) {
        use PixelFormat as P;
        let compressed = |f: u32| (f, f, 0);
        match format {
            P::Pvrtc4 => compressed(COMPRESSED_RGB_PVRTC_4BPPV1_IMG),
            P::Pvrtc4A => compressed(COMPRESSED_RGBA_PVRTC_4BPPV1_IMG),
            P::Pvrtc2 => compressed(COMPRESSED_RGB_PVRTC_2BPPV1_IMG),
            P::Pvrtc2A => compressed(COMPRESSED_RGBA_PVRTC_2BPPV1_IMG),
            P::Etc1 => compressed(ETC1_RGB8_OES),
            P::Etc2Rgb => compressed(COMPRESSED_RGB8_ETC2),
            P::Etc2Rgba => compressed(COMPRESSED_RGBA8_ETC2_EAC),
            P::S3tcDxt1 => compressed(COMPRESSED_RGBA_S3TC_DXT1_EXT),
            P::S3tcDxt3 => compressed(COMPRESSED_RGBA_S3TC_DXT3_EXT),
            P::S3tcDxt5 => compressed(COMPRESSED_RGBA_S3TC_DXT5_EXT),
            P::AtcRgb => compressed(ATC_RGB_AMD),
            P::AtcExplicitAlpha => compressed(ATC_RGBA_EXPLICIT_ALPHA_AMD),
            P::AtcInterpolatedAlpha => compressed(ATC_RGBA_INTERPOLATED_ALPHA_AMD),
            P::Astc4x4 => compressed(COMPRESSED_RGBA_ASTC_4X4_KHR),
            P::Astc5x4 => compressed(COMPRESSED_RGBA_ASTC_5X4_KHR),
            P::Astc5x5 => compressed(COMPRESSED_RGBA_ASTC_5X5_KHR),
            P::Astc6x5 => compressed(COMPRESSED_RGBA_ASTC_6X5_KHR),
            P::Astc6x6 => compressed(COMPRESSED_RGBA_ASTC_6X6_KHR),
            P::Astc8x5 => compressed(COMPRESSED_RGBA_ASTC_8X5_KHR),
            P::Astc8x6 => compressed(COMPRESSED_RGBA_ASTC_8X6_KHR),
            P::Astc8x8 => compressed(COMPRESSED_RGBA_ASTC_8X8_KHR),
            P::Astc10x5 => compressed(COMPRESSED_RGBA_ASTC_10X5_KHR),
            P::Astc10x6 => compressed(COMPRESSED_RGBA_ASTC_10X6_KHR),
            P::Astc10x8 => compressed(COMPRESSED_RGBA_ASTC_10X8_KHR),
            P::Astc10x10 => compressed(COMPRESSED_RGBA_ASTC_10X10_KHR),
            P::Astc12x10 => compressed(COMPRESSED_RGBA_ASTC_12X10_KHR),
            P::Astc12x12 => compressed(COMPRESSED_RGBA_ASTC_12X12_KHR),
            P::RGBA8 => (glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE),
            P::BGRA8 => (glow::RGBA8, BGRA_EXT, glow::UNSIGNED_BYTE),
            P::RGB8 => (glow::RGB8, glow::RGB, glow::UNSIGNED_BYTE),
            P::RGB565 => (glow::RGB565, glow::RGB, glow::UNSIGNED_SHORT_5_6_5),
            P::RGBA4 => (glow::RGBA4, glow::RGBA, glow::UNSIGNED_SHORT_4_4_4_4),
            P::RGB5A1 => (glow::RGB5_A1, glow::RGBA, glow::UNSIGNED_SHORT_5_5_5_1),
            P::R8 => (glow::R8, glow::RED, glow::UNSIGNED_BYTE),
            P::RG8 => (glow::RG8, glow::RG, glow::UNSIGNED_BYTE),
            P::RGBA32F => (glow::RGBA32F, glow::RGBA, glow::FLOAT),
            P::D24S8 => (glow::DEPTH24_STENCIL8, glow::DEPTH_STENCIL, glow::UNSIGNED_INT_24_8),
            P::None => (0, 0, 0),
        }
    }

    pub fn texture_target(ty: TextureType) -> u32 {
        match ty {
            TextureType::Texture2D => glow::TEXTURE_2D,
            TextureType::Texture2DArray => glow::TEXTURE_2D_ARRAY,
            TextureType::TextureCube => glow::TEXTURE_CUBE_MAP,
        }
    }

    /// Image target for layer `layer` of a texture of type `ty`.
    pub fn image_target(ty: TextureType, layer: u32) -> u32 {
        match ty {
            TextureType::TextureCube => glow::TEXTURE_CUBE_MAP_POSITIVE_X + layer,
            other => texture_target(other),
        }
    }

    pub fn buffer_target(target: BufferTarget) -> u32 {
        match target {
            BufferTarget::Array => glow::ARRAY_BUFFER,
            BufferTarget::ElementArray => glow::ELEMENT_ARRAY_BUFFER,
            BufferTarget::Uniform => glow::UNIFORM_BUFFER,
            BufferTarget::PixelPack => glow::PIXEL_PACK_BUFFER,
        }
    }

    pub fn capability(cap: Capability) -> u32 {
        match cap {
            Capability::Blend => glow::BLEND,
            Capability::CullFace => glow::CULL_FACE,
            Capability::DepthTest => glow::DEPTH_TEST,
            Capability::StencilTest => glow::STENCIL_TEST,
            Capability::ScissorTest => glow::SCISSOR_TEST,
        }
    }

    pub fn face(face: Face) -> u32 {
        match face {
            Face::Front => glow::FRONT,
            Face::Back => glow::BACK,
        }
    }

    pub fn winding(winding: Winding) -> u32 {
        match winding {
            Winding::ClockWise => glow::CW,
            Winding::CounterClockWise => glow::CCW,
        }
    }

    pub fn compare_func(func: CompareFunc) -> u32 {
        match func {
            CompareFunc::Never => glow::NEVER,
            CompareFunc::Less => glow::LESS,
            CompareFunc::Equal => glow::EQUAL,
            CompareFunc::LessEqual => glow::LEQUAL,
            CompareFunc::Greater => glow::GREATER,
            CompareFunc::NotEqual => glow::NOTEQUAL,
            CompareFunc::GreaterEqual => glow::GEQUAL,
            CompareFunc::Always => glow::ALWAYS,
        }
    }

    pub fn stencil_op(op: StencilOp) -> u32 {
        match op {
            StencilOp::Keep => glow::KEEP,
            StencilOp::Zero => glow::ZERO,
            StencilOp::Replace => glow::REPLACE,
            StencilOp::Invert => glow::INVERT,
            StencilOp::IncrementWrap => glow::INCR_WRAP,
            StencilOp::DecrementWrap => glow::DECR_WRAP,
        }
    }

    pub fn blend_op(op: BlendOp) -> u32 {
        match op {
            BlendOp::Add => glow::FUNC_ADD,
            BlendOp::Subtract => glow::FUNC_SUBTRACT,
            BlendOp::ReverseSubtract => glow::FUNC_REVERSE_SUBTRACT,
        }
    }

    pub fn blend_factor(factor: BlendFactor) -> u32 {
        match factor {
            BlendFactor::Zero => glow::ZERO,
            BlendFactor::One => glow::ONE,
            BlendFactor::SrcColor => glow::SRC_COLOR,
            BlendFactor::OneMinusSrcColor => glow::ONE_MINUS_SRC_COLOR,
            BlendFactor::SrcAlpha => glow::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => glow::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstColor => glow::DST_COLOR,
            BlendFactor::OneMinusDstColor => glow::ONE_MINUS_DST_COLOR,
            BlendFactor::DstAlpha => glow::DST_ALPHA,
            BlendFactor::OneMinusDstAlpha => glow::ONE_MINUS_DST_ALPHA,
            BlendFactor::ConstantAlpha => glow::CONSTANT_ALPHA,
            BlendFactor::SrcAlphaSaturate => glow::SRC_ALPHA_SATURATE,
            BlendFactor::OneMinusConstantAlpha => glow::ONE_MINUS_CONSTANT_ALPHA,
            BlendFactor::BlendColor => glow::CONSTANT_COLOR,
        }
    }

    pub fn primitive(primitive: PrimitiveType) -> u32 {
        match primitive {
            PrimitiveType::Point => glow::POINTS,
            PrimitiveType::Line => glow::LINES,
            PrimitiveType::LineLoop => glow::LINE_LOOP,
            PrimitiveType::LineStrip => glow::LINE_STRIP,
            PrimitiveType::Triangle => glow::TRIANGLES,
            PrimitiveType::TriangleStrip => glow::TRIANGLE_STRIP,
        }
    }

    pub fn index_type(format: IndexFormat) -> u32 {
        match format {
            IndexFormat::UShort => glow::UNSIGNED_SHORT,
            IndexFormat::UInt => glow::UNSIGNED_INT,
        }
    }

    /// Component count and component type of one location slot.
    pub fn vertex_format(format: VertexFormat) -> (i32, u32) {
        let components = format.components() as i32;
        let ty = match format {
            VertexFormat::Float4
            | VertexFormat::Float3
            | VertexFormat::Float2
            | VertexFormat::Float
            | VertexFormat::Mat4 => glow::FLOAT,
            VertexFormat::Int4 | VertexFormat::Int3 | VertexFormat::Int2 | VertexFormat::Int => glow::INT,
            VertexFormat::UShort4 | VertexFormat::UShort2 => glow::UNSIGNED_SHORT,
            VertexFormat::UByte4 => glow::UNSIGNED_BYTE,
        };
        (components, ty)
    }

    fn address_mode(mode: SamplerAddressMode) -> i32 {
        (match mode {
            SamplerAddressMode::Repeat => glow::REPEAT,
            SamplerAddressMode::MirrorRepeat => glow::MIRRORED_REPEAT,
            SamplerAddressMode::ClampToEdge => glow::CLAMP_TO_EDGE,
            SamplerAddressMode::ClampToBorder => glow::CLAMP_TO_BORDER,
        }) as i32
    }

    /// `(parameter, value)` pairs for `glTexParameteri`. Mip filters only
    /// apply when the texture has more than one level.
    pub fn sampler_parameters(desc: &SamplerDesc, mipmapped: bool) -> Vec<(u32, i32)> {
        let linear = desc.min_filter != SamplerMinFilter::Nearest;
        let min = match (mipmapped, desc.mip_filter, linear) {
            (true, SamplerMipFilter::Nearest, true) => glow::LINEAR_MIPMAP_NEAREST,
            (true, SamplerMipFilter::Linear, true) => glow::LINEAR_MIPMAP_LINEAR,
            (true, SamplerMipFilter::Nearest, false) => glow::NEAREST_MIPMAP_NEAREST,
            (true, SamplerMipFilter::Linear, false) => glow::NEAREST_MIPMAP_LINEAR,
            (_, _, true) => glow::LINEAR,
            (_, _, false) => glow::NEAREST,
        };
        let mag = match desc.mag_filter {
            SamplerMagFilter::Nearest => glow::NEAREST,
            SamplerMagFilter::Linear => glow::LINEAR,
        };
        let mut params = vec![
            (glow::TEXTURE_MIN_FILTER, min as i32),
            (glow::TEXTURE_MAG_FILTER, mag as i32),
            (glow::TEXTURE_WRAP_S, address_mode(desc.s_address_mode)),
            (glow::TEXTURE_WRAP_T, address_mode(desc.t_address_mode)),
            (glow::TEXTURE_WRAP_R, address_mode(desc.w_address_mode)),
        ];
        if desc.compare_func != CompareFunc::Never {
            params.push((glow::TEXTURE_COMPARE_MODE, glow::COMPARE_REF_TO_TEXTURE as i32));
            params.push((glow::TEXTURE_COMPARE_FUNC, compare_func(desc.compare_func) as i32));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_desktop_and_es_strings() {
        assert_eq!(
            GlVersion::parse("4.6.0 NVIDIA 535.54.03"),
            Some(GlVersion {
                es: false,
                major: 4,
                minor: 6
            })
        );
        assert_eq!(
            GlVersion::parse("OpenGL ES 3.2 Mesa 23.1.4"),
            Some(GlVersion {
                es: true,
                major: 3,
                minor: 2
            })
        );
        assert_eq!(GlVersion::parse(""), None);
    }

    #[test]
    fn minimum_version_gate() {
        let config = GlConfig::default();
        let old = GlVersion::parse("3.2.0 Mesa").unwrap();
        assert!(old.check_minimum(&config, "3.2.0 Mesa").is_err());
        let ok = GlVersion::parse("3.3.0 Mesa").unwrap();
        assert!(ok.check_minimum(&config, "3.3.0 Mesa").is_ok());
        let es2 = GlVersion::parse("OpenGL ES 2.0").unwrap();
        let message = es2.check_minimum(&config, "OpenGL ES 2.0").unwrap_err();
        assert!(message.contains("OpenGL ES 3.0+"));
    }

    #[test]
    fn vao_extension_depends_on_profile() {
        assert_eq!(
            feature_extension(FeatureType::Vao, true),
            Some("GL_OES_vertex_array_object")
        );
        assert_eq!(feature_extension(FeatureType::Astc, false), None);
    }
}
