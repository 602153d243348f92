//! Reader and writer for the tagged-chunk compiled shader container.
//!
//! Layout (little endian):
//! ```text
//! 'AXSC' u32 size | u16 major u16 minor u32 lang u32 profile
//! 'STAG' u32 size | u32 stage
//!   'CODE'|'DATA' i32 len | bytes
//!   ['REFL' u32 size | reflection header, inputs, uniform blocks,
//!                      textures, storage images, storage buffers]
//! ```
//! Names are 32-byte NUL padded fields. A declared size of zero on the
//! container or stage chunk means "unspecified"; the reflection chunk size
//! is always checked.

use thiserror::Error;

use super::structs::{ShaderStage, VertexFormat};

pub const NAME_LEN: usize = 32;

pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    (tag[0] as u32) | ((tag[1] as u32) << 8) | ((tag[2] as u32) << 16) | ((tag[3] as u32) << 24)
}

pub const CHUNK_CONTAINER: u32 = fourcc(b"AXSC");
pub const CHUNK_STAGE: u32 = fourcc(b"STAG");
pub const CHUNK_REFL: u32 = fourcc(b"REFL");
pub const CHUNK_CODE: u32 = fourcc(b"CODE");
pub const CHUNK_DATA: u32 = fourcc(b"DATA");

pub const LANG_GLES: u32 = fourcc(b"GLES");
pub const LANG_HLSL: u32 = fourcc(b"HLSL");
pub const LANG_GLSL: u32 = fourcc(b"GLSL");
pub const LANG_MSL: u32 = fourcc(b"MSL ");
pub const LANG_SPIRV: u32 = fourcc(b"SPIR");

pub const STAGE_VERTEX: u32 = fourcc(b"VERT");
pub const STAGE_FRAGMENT: u32 = fourcc(b"FRAG");
pub const STAGE_COMPUTE: u32 = fourcc(b"COMP");

const REFL_HEADER_SIZE: usize = NAME_LEN + 5 * 4 + 2 * 2;
const STORAGE_IMAGE_SIZE: usize = NAME_LEN + 8;
const STORAGE_BUFFER_SIZE: usize = NAME_LEN + 12;

fn tag_name(tag: u32) -> String {
    tag.to_le_bytes()
        .iter()
        .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '?' })
        .collect()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReflectError {
    #[error("container truncated at offset {offset}: {needed} more bytes needed")]
    UnexpectedEof { offset: usize, needed: usize },
    #[error("expected chunk '{expected}' at offset {offset}, found '{found}'")]
    BadTag {
        expected: &'static str,
        found: String,
        offset: usize,
    },
    #[error("container version {major}.{minor} is older than 3.3")]
    VersionTooOld { major: u16, minor: u16 },
    #[error("unknown shader stage '{0}'")]
    UnknownStage(String),
    #[error("unknown shader data type {0}")]
    UnknownType(u32),
    #[error("invalid code length {0}")]
    InvalidLength(i32),
    #[error("{chunk} chunk declares {declared} bytes but {consumed} were read")]
    SizeMismatch {
        chunk: &'static str,
        declared: usize,
        consumed: usize,
    },
    #[error("{0} trailing bytes after the container")]
    TrailingBytes(usize),
}

/// Shader data types as written by the shader compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScType {
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
    Mat3,
    Half4,
    Half3,
    Half2,
    Half,
}

impl ScType {
    const TABLE: [ScType; 17] = [
        ScType::Float4,
        ScType::Float3,
        ScType::Float2,
        ScType::Float,
        ScType::Int4,
        ScType::Int3,
        ScType::Int2,
        ScType::Int,
        ScType::UShort4,
        ScType::UShort2,
        ScType::UByte4,
        ScType::Mat4,
        ScType::Mat3,
        ScType::Half4,
        ScType::Half3,
        ScType::Half2,
        ScType::Half,
    ];

    pub fn from_raw(raw: u32) -> Result<Self, ReflectError> {
        Self::TABLE
            .get(raw as usize)
            .copied()
            .ok_or(ReflectError::UnknownType(raw))
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Matching vertex attribute format, if the type can feed a vertex input.
    pub fn vertex_format(self) -> Option<VertexFormat> {
        Some(match self {
            ScType::Float4 => VertexFormat::Float4,
            ScType::Float3 => VertexFormat::Float3,
            ScType::Float2 => VertexFormat::Float2,
            ScType::Float => VertexFormat::Float,
            ScType::Int4 => VertexFormat::Int4,
            ScType::Int3 => VertexFormat::Int3,
            ScType::Int2 => VertexFormat::Int2,
            ScType::Int => VertexFormat::Int,
            ScType::UShort4 => VertexFormat::UShort4,
            ScType::UShort2 => VertexFormat::UShort2,
            ScType::UByte4 => VertexFormat::UByte4,
            ScType::Mat4 => VertexFormat::Mat4,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub major: u16,
    pub minor: u16,
    pub lang: u32,
    pub profile_ver: u32,
}

impl Default for ContainerHeader {
    fn default() -> Self {
        Self {
            major: 3,
            minor: 3,
            lang: LANG_GLSL,
            profile_ver: 330,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInputInfo {
    pub name: String,
    pub location: i32,
    pub semantic: String,
    pub semantic_index: u32,
    pub format: ScType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    pub offset: i32,
    pub format: ScType,
    pub size_bytes: u32,
    pub array_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlock {
    pub name: String,
    pub binding: i32,
    pub size_bytes: u32,
    pub array_size: u16,
    pub members: Vec<UniformMember>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureBinding {
    pub name: String,
    pub binding: i32,
    pub image_dim: u8,
    pub flags: u8,
    /// Array length, at least one.
    pub count: u8,
    pub sampler_slot: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reflection {
    pub name: String,
    pub inputs: Vec<VertexInputInfo>,
    pub uniform_blocks: Vec<UniformBlock>,
    pub textures: Vec<TextureBinding>,
    pub storage_images: u32,
    pub storage_buffers: u32,
    pub flatten_ubo: bool,
    pub debug_info: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// Source text compiled by the device.
    Source,
    /// Precompiled bytecode.
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderContainer {
    pub header: ContainerHeader,
    pub stage: ShaderStage,
    pub kind: CodeKind,
    pub code: Vec<u8>,
    pub reflection: Option<Reflection>,
}

/// Length-checked little-endian cursor.
struct ChunkReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ChunkReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ReflectError> {
        if self.remaining() < len {
            return Err(ReflectError::UnexpectedEof {
                offset: self.pos,
                needed: len - self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ReflectError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ReflectError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ReflectError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ReflectError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, ReflectError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn name(&mut self) -> Result<String, ReflectError> {
        let raw = self.bytes(NAME_LEN)?;
        let end = raw.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn expect_tag(&mut self, expected: u32, label: &'static str) -> Result<(), ReflectError> {
        let offset = self.pos;
        let found = self.u32()?;
        if found != expected {
            return Err(ReflectError::BadTag {
                expected: label,
                found: tag_name(found),
                offset,
            });
        }
        Ok(())
    }

    fn check_size(
        &self,
        chunk: &'static str,
        declared: usize,
        start: usize,
    ) -> Result<(), ReflectError> {
        let consumed = self.pos - start;
        if declared != consumed {
            return Err(ReflectError::SizeMismatch {
                chunk,
                declared,
                consumed,
            });
        }
        Ok(())
    }
}

impl ShaderContainer {
    pub fn parse(bytes: &[u8]) -> Result<Self, ReflectError> {
        let mut r = ChunkReader::new(bytes);
        r.expect_tag(CHUNK_CONTAINER, "AXSC")?;
        let container_size = r.u32()? as usize;
        let container_start = r.pos;
        let header = ContainerHeader {
            major: r.u16()?,
            minor: r.u16()?,
            lang: r.u32()?,
            profile_ver: r.u32()?,
        };
        if (header.major, header.minor) < (3, 3) {
            return Err(ReflectError::VersionTooOld {
                major: header.major,
                minor: header.minor,
            });
        }

        r.expect_tag(CHUNK_STAGE, "STAG")?;
        let stage_size = r.u32()? as usize;
        let stage_start = r.pos;
        let stage = match r.u32()? {
            STAGE_VERTEX => ShaderStage::Vertex,
            STAGE_FRAGMENT => ShaderStage::Fragment,
            STAGE_COMPUTE => ShaderStage::Compute,
            other => return Err(ReflectError::UnknownStage(tag_name(other))),
        };

        let code_offset = r.pos;
        let kind = match r.u32()? {
            CHUNK_CODE => CodeKind::Source,
            CHUNK_DATA => CodeKind::Binary,
            other => {
                return Err(ReflectError::BadTag {
                    expected: "CODE",
                    found: tag_name(other),
                    offset: code_offset,
                })
            }
        };
        let len = r.i32()?;
        if len < 0 {
            return Err(ReflectError::InvalidLength(len));
        }
        let code = r.bytes(len as usize)?.to_vec();

        let reflection = if r.remaining() > 0 {
            r.expect_tag(CHUNK_REFL, "REFL")?;
            Some(parse_reflection(&mut r)?)
        } else {
            None
        };

        if stage_size != 0 {
            r.check_size("STAG", stage_size, stage_start)?;
        }
        if container_size != 0 {
            r.check_size("AXSC", container_size, container_start)?;
        }
        if r.remaining() > 0 {
            return Err(ReflectError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            header,
            stage,
            kind,
            code,
            reflection,
        })
    }

    /// Serialize into the container layout accepted by [`ShaderContainer::parse`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut stage = ChunkWriter::default();
        stage.u32(match self.stage {
            ShaderStage::Vertex => STAGE_VERTEX,
            ShaderStage::Fragment => STAGE_FRAGMENT,
            ShaderStage::Compute => STAGE_COMPUTE,
        });
        stage.u32(match self.kind {
            CodeKind::Source => CHUNK_CODE,
            CodeKind::Binary => CHUNK_DATA,
        });
        stage.u32(self.code.len() as u32);
        stage.bytes(&self.code);
        if let Some(refl) = &self.reflection {
            let body = write_reflection(refl);
            stage.u32(CHUNK_REFL);
            stage.u32(body.len() as u32);
            stage.bytes(&body);
        }

        let mut body = ChunkWriter::default();
        body.u16(self.header.major);
        body.u16(self.header.minor);
        body.u32(self.header.lang);
        body.u32(self.header.profile_ver);
        body.u32(CHUNK_STAGE);
        body.u32(stage.data.len() as u32);
        body.bytes(&stage.data);

        let mut out = ChunkWriter::default();
        out.u32(CHUNK_CONTAINER);
        out.u32(body.data.len() as u32);
        out.bytes(&body.data);
        out.data
    }
}

fn parse_reflection(r: &mut ChunkReader<'_>) -> Result<Reflection, ReflectError> {
    let declared = r.u32()? as usize;
    let start = r.pos;

    let name = r.name()?;
    let num_inputs = r.u32()?;
    let num_textures = r.u32()?;
    let num_uniform_buffers = r.u32()?;
    let storage_images = r.u32()?;
    let storage_buffers = r.u32()?;
    let flatten_ubo = r.u16()? != 0;
    let debug_info = r.u16()? != 0;

    let mut inputs = Vec::with_capacity(num_inputs.min(64) as usize);
    for _ in 0..num_inputs {
        inputs.push(VertexInputInfo {
            name: r.name()?,
            location: r.i32()?,
            semantic: r.name()?,
            semantic_index: r.u32()?,
            format: ScType::from_raw(r.u32()?)?,
        });
    }

    let mut uniform_blocks = Vec::with_capacity(num_uniform_buffers.min(16) as usize);
    for _ in 0..num_uniform_buffers {
        let name = r.name()?;
        let binding = r.i32()?;
        let size_bytes = r.u32()?;
        let array_size = r.u16()?;
        let num_members = r.u16()?;
        let mut members = Vec::with_capacity(num_members as usize);
        for _ in 0..num_members {
            members.push(UniformMember {
                name: r.name()?,
                offset: r.i32()?,
                format: ScType::from_raw(r.u32()?)?,
                size_bytes: r.u32()?,
                array_size: r.u16()?,
            });
        }
        uniform_blocks.push(UniformBlock {
            name,
            binding,
            size_bytes,
            array_size,
            members,
        });
    }

    let mut textures = Vec::with_capacity(num_textures.min(16) as usize);
    for _ in 0..num_textures {
        textures.push(TextureBinding {
            name: r.name()?,
            binding: r.i32()?,
            image_dim: r.u8()?,
            flags: r.u8()?,
            count: r.u8()?.max(1),
            sampler_slot: r.u8()?,
        });
    }

    r.bytes(storage_images as usize * STORAGE_IMAGE_SIZE)?;
    r.bytes(storage_buffers as usize * STORAGE_BUFFER_SIZE)?;
    r.check_size("REFL", declared, start)?;

    Ok(Reflection {
        name,
        inputs,
        uniform_blocks,
        textures,
        storage_images,
        storage_buffers,
        flatten_ubo,
        debug_info,
    })
}

#[derive(Default)]
struct ChunkWriter {
    data: Vec<u8>,
}

impl ChunkWriter {
    fn bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn u8(&mut self, v: u8) {
        self.data.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    fn name(&mut self, name: &str) {
        let mut field = [0u8; NAME_LEN];
        let raw = name.as_bytes();
        debug_assert!(raw.len() <= NAME_LEN, "name '{name}' exceeds {NAME_LEN} bytes");
        let len = raw.len().min(NAME_LEN);
        field[..len].copy_from_slice(&raw[..len]);
        self.bytes(&field);
    }
}

fn write_reflection(refl: &Reflection) -> Vec<u8> {
    let mut w = ChunkWriter::default();
    w.name(&refl.name);
    w.u32(refl.inputs.len() as u32);
    w.u32(refl.textures.len() as u32);
    w.u32(refl.uniform_blocks.len() as u32);
    w.u32(refl.storage_images);
    w.u32(refl.storage_buffers);
    w.u16(refl.flatten_ubo as u16);
    w.u16(refl.debug_info as u16);
    debug_assert_eq!(w.data.len(), REFL_HEADER_SIZE);

    for input in &refl.inputs {
        w.name(&input.name);
        w.i32(input.location);
        w.name(&input.semantic);
        w.u32(input.semantic_index);
        w.u32(input.format.raw());
    }
    for block in &refl.uniform_blocks {
        w.name(&block.name);
        w.i32(block.binding);
        w.u32(block.size_bytes);
        w.u16(block.array_size);
        w.u16(block.members.len() as u16);
        for member in &block.members {
            w.name(&member.name);
            w.i32(member.offset);
            w.u32(member.format.raw());
            w.u32(member.size_bytes);
            w.u16(member.array_size);
        }
    }
    for tex in &refl.textures {
        w.name(&tex.name);
        w.i32(tex.binding);
        w.u8(tex.image_dim);
        w.u8(tex.flags);
        w.u8(tex.count);
        w.u8(tex.sampler_slot);
    }
    w.bytes(&vec![0u8; refl.storage_images as usize * STORAGE_IMAGE_SIZE]);
    w.bytes(&vec![0u8; refl.storage_buffers as usize * STORAGE_BUFFER_SIZE]);
    w.data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ShaderContainer {
        ShaderContainer {
            header: ContainerHeader::default(),
            stage: ShaderStage::Vertex,
            kind: CodeKind::Source,
            code: b"void main() {}".to_vec(),
            reflection: Some(Reflection {
                name: "sprite".into(),
                inputs: vec![VertexInputInfo {
                    name: "a_position".into(),
                    location: 0,
                    semantic: "POSITION".into(),
                    semantic_index: 0,
                    format: ScType::Float3,
                }],
                uniform_blocks: vec![UniformBlock {
                    name: "vs_ub".into(),
                    binding: 0,
                    size_bytes: 64,
                    array_size: 0,
                    members: vec![UniformMember {
                        name: "u_MVPMatrix".into(),
                        offset: 0,
                        format: ScType::Mat4,
                        size_bytes: 64,
                        array_size: 0,
                    }],
                }],
                textures: vec![],
                storage_images: 1,
                storage_buffers: 0,
                flatten_ubo: false,
                debug_info: false,
            }),
        }
    }

    #[test]
    fn parses_written_container() {
        let container = sample();
        let parsed = ShaderContainer::parse(&container.to_bytes()).unwrap();
        assert_eq!(parsed, container);
    }

    #[test]
    fn tolerates_missing_reflection_and_empty_tables() {
        let mut container = sample();
        container.reflection = None;
        assert!(ShaderContainer::parse(&container.to_bytes()).unwrap().reflection.is_none());

        let mut container = sample();
        container.reflection = Some(Reflection::default());
        let parsed = ShaderContainer::parse(&container.to_bytes()).unwrap();
        let refl = parsed.reflection.unwrap();
        assert!(refl.uniform_blocks.is_empty());
        assert!(refl.textures.is_empty());
    }

    #[test]
    fn names_are_trimmed() {
        let parsed = ShaderContainer::parse(&sample().to_bytes()).unwrap();
        let refl = parsed.reflection.unwrap();
        assert_eq!(refl.inputs[0].name, "a_position");
        assert_eq!(refl.uniform_blocks[0].members[0].name.len(), "u_MVPMatrix".len());
    }

    #[test]
    fn truncated_container_is_an_error() {
        let bytes = sample().to_bytes();
        let err = ShaderContainer::parse(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, ReflectError::UnexpectedEof { .. }));
    }

    #[test]
    fn reflection_size_mismatch_is_an_error() {
        let mut bytes = sample().to_bytes();
        let refl_at = bytes
            .windows(4)
            .position(|w| w == b"REFL")
            .unwrap();
        let declared = u32::from_le_bytes(bytes[refl_at + 4..refl_at + 8].try_into().unwrap());
        bytes[refl_at + 4..refl_at + 8].copy_from_slice(&(declared + 4).to_le_bytes());
        bytes.extend_from_slice(&[0; 4]);
        // Outer sizes are rewritten so only the reflection chunk disagrees.
        let total = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&(total - 8).to_le_bytes());
        bytes[24..28].copy_from_slice(&(total - 28).to_le_bytes());

        let err = ShaderContainer::parse(&bytes).unwrap_err();
        assert!(matches!(err, ReflectError::SizeMismatch { chunk: "REFL", .. }));
    }

    #[test]
    fn old_versions_are_rejected() {
        let mut container = sample();
        container.header.major = 3;
        container.header.minor = 2;
        let err = ShaderContainer::parse(&container.to_bytes()).unwrap_err();
        assert_eq!(err, ReflectError::VersionTooOld { major: 3, minor: 2 });

        container.header.major = 4;
        container.header.minor = 0;
        assert!(ShaderContainer::parse(&container.to_bytes()).is_ok());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut container = sample();
        container.reflection = None;
        let mut bytes = container.to_bytes();
        bytes.extend_from_slice(b"REFX");
        let err = ShaderContainer::parse(&bytes).unwrap_err();
        assert!(matches!(err, ReflectError::BadTag { expected: "REFL", .. }));
    }
}
