//! Builder pattern wrappers for resource descriptors and shader containers.

use super::reflect::{
    CodeKind, ContainerHeader, Reflection, ScType, ShaderContainer, TextureBinding, UniformBlock,
    UniformMember, VertexInputInfo,
};
use super::{
    Backend, Buffer, BufferType, BufferUsage, Driver, PixelFormat, Result, SamplerDesc,
    ShaderStage, Texture, TextureDesc, TextureType, TextureUsage,
};

/// Bytes one value of `ty` occupies inside a uniform block.
fn uniform_size(ty: ScType) -> u32 {
    match ty {
        ScType::Float4 | ScType::Int4 => 16,
        ScType::Float3 | ScType::Int3 => 12,
        ScType::Float2 | ScType::Int2 | ScType::UShort4 | ScType::Half4 => 8,
        ScType::Half3 => 6,
        ScType::Float | ScType::Int | ScType::UShort2 | ScType::UByte4 | ScType::Half2 => 4,
        ScType::Half => 2,
        ScType::Mat4 => 64,
        // Three vec4 columns.
        ScType::Mat3 => 48,
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// Builds a [`ShaderContainer`] and its reflection table.
///
/// Uniform block members are laid out in declaration order; vectors of three
/// or four components, matrices and arrays start on a 16 byte boundary.
pub struct ShaderContainerBuilder {
    stage: ShaderStage,
    kind: CodeKind,
    code: Vec<u8>,
    header: ContainerHeader,
    reflection: Reflection,
}

impl ShaderContainerBuilder {
    /// Start a container for `stage` holding source text.
    pub fn new(stage: ShaderStage, source: &str) -> Self {
        Self {
            stage,
            kind: CodeKind::Source,
            code: source.as_bytes().to_vec(),
            header: ContainerHeader::default(),
            reflection: Reflection::default(),
        }
    }

    /// Replace the code with precompiled bytes.
    pub fn binary(mut self, code: &[u8]) -> Self {
        self.kind = CodeKind::Binary;
        self.code = code.to_vec();
        self
    }

    /// Set the container version and profile.
    pub fn header(mut self, header: ContainerHeader) -> Self {
        self.header = header;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.reflection.name = name.into();
        self
    }

    /// Declare a vertex input at `location`.
    pub fn input(mut self, name: &str, location: i32, format: ScType) -> Self {
        self.reflection.inputs.push(VertexInputInfo {
            name: name.to_string(),
            location,
            semantic: String::new(),
            semantic_index: 0,
            format,
        });
        self
    }

    /// Open a uniform block at `binding`. Members added afterwards go into it.
    pub fn uniform_block(mut self, name: &str, binding: i32) -> Self {
        self.reflection.uniform_blocks.push(UniformBlock {
            name: name.to_string(),
            binding,
            size_bytes: 0,
            array_size: 1,
            members: Vec::new(),
        });
        self
    }

    /// Add a member to the last block, opening a default block when none
    /// exists yet.
    pub fn uniform(mut self, name: &str, format: ScType, array_size: u16) -> Self {
        if self.reflection.uniform_blocks.is_empty() {
            self = self.uniform_block("Uniforms", 0);
        }
        let Some(block) = self.reflection.uniform_blocks.last_mut() else {
            return self;
        };

        let count = u32::from(array_size.max(1));
        let element = uniform_size(format);
        let wide = count > 1 || element >= 12;
        let stride = if count > 1 { align_to(element, 16) } else { element };
        let offset = if wide {
            align_to(block.size_bytes, 16)
        } else {
            align_to(block.size_bytes, element.min(4).max(1))
        };
        let size = stride * count;
        block.members.push(UniformMember {
            name: name.to_string(),
            offset: offset as i32,
            format,
            size_bytes: size,
            array_size: array_size.max(1),
        });
        block.size_bytes = offset + size;
        self
    }

    /// Declare a sampler bound to texture unit `binding`.
    pub fn texture(mut self, name: &str, binding: i32, count: u8) -> Self {
        self.reflection.textures.push(TextureBinding {
            name: name.to_string(),
            binding,
            image_dim: 2,
            flags: 0,
            count: count.max(1),
            sampler_slot: binding.max(0) as u8,
        });
        self
    }

    /// Finish the container. Block sizes are rounded up to 16 bytes.
    pub fn build(mut self) -> ShaderContainer {
        for block in &mut self.reflection.uniform_blocks {
            block.size_bytes = align_to(block.size_bytes, 16);
        }
        ShaderContainer {
            header: self.header,
            stage: self.stage,
            kind: self.kind,
            code: self.code,
            reflection: Some(self.reflection),
        }
    }

    /// Finish the container and serialize it.
    pub fn to_bytes(self) -> Vec<u8> {
        self.build().to_bytes()
    }
}

/// Builds a [`Buffer`] via the builder pattern.
pub struct BufferBuilder<'a> {
    size: usize,
    buffer_type: BufferType,
    usage: BufferUsage,
    data: Option<&'a [u8]>,
}

impl<'a> BufferBuilder<'a> {
    pub fn new(buffer_type: BufferType) -> Self {
        Self {
            size: 0,
            buffer_type,
            usage: BufferUsage::Static,
            data: None,
        }
    }

    /// Capacity in bytes. Defaults to the length of the initial data.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn data(mut self, data: &'a [u8]) -> Self {
        self.data = Some(data);
        self
    }

    pub fn build<B: Backend>(self, driver: &Driver<B>) -> Result<Buffer<B>> {
        let size = self.size.max(self.data.map_or(0, <[u8]>::len));
        driver.create_buffer(size, self.buffer_type, self.usage, self.data)
    }
}

/// Builds a [`TextureDesc`], and optionally the [`Texture`], via the builder
/// pattern.
pub struct TextureBuilder {
    desc: TextureDesc,
}

impl TextureBuilder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            desc: TextureDesc {
                width,
                height,
                ..Default::default()
            },
        }
    }

    pub fn format(mut self, format: PixelFormat) -> Self {
        self.desc.format = format;
        self
    }

    pub fn texture_type(mut self, texture_type: TextureType) -> Self {
        self.desc.texture_type = texture_type;
        self
    }

    pub fn usage(mut self, usage: TextureUsage) -> Self {
        self.desc.usage = usage;
        self
    }

    /// Shorthand for a render-target texture of `format`.
    pub fn render_target(self, format: PixelFormat) -> Self {
        self.format(format).usage(TextureUsage::RenderTarget)
    }

    pub fn array_size(mut self, layers: u32) -> Self {
        self.desc.array_size = layers;
        self
    }

    /// Zero requests the full chain.
    pub fn mip_levels(mut self, levels: u32) -> Self {
        self.desc.mip_levels = levels;
        self
    }

    pub fn sampler(mut self, sampler: SamplerDesc) -> Self {
        self.desc.sampler = sampler;
        self
    }

    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    pub fn build<B: Backend>(self, driver: &Driver<B>) -> Texture<B> {
        driver.create_texture(&self.desc)
    }
}
