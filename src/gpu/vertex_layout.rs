use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::program::{ProgramLayout, VertexInputDesc, VertexInputKind};
use super::structs::VertexFormat;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub name: String,
    pub semantic: String,
    /// First attribute location. MAT4 attributes occupy four.
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
    pub normalized: bool,
    /// Zero steps per vertex, otherwise per `n` instances.
    pub instance_step_rate: u8,
}

impl VertexAttribute {
    pub fn is_instanced(&self) -> bool {
        self.instance_step_rate != 0
    }
}

/// Attribute list under construction. Finishing it with
/// [`VertexLayoutDesc::end_layout`] produces an immutable [`VertexLayout`].
#[derive(Debug, Default)]
pub struct VertexLayoutDesc {
    attributes: Vec<VertexAttribute>,
    strides: [u32; 2],
}

impl VertexLayoutDesc {
    pub fn start_layout(capacity: usize) -> Self {
        Self {
            attributes: Vec::with_capacity(capacity),
            strides: [0, 0],
        }
    }

    /// Add an attribute bound to the reflected shader input `input`. A missing
    /// input (unused or optimized out by the compiler) is skipped.
    pub fn add_attrib(
        &mut self,
        name: &str,
        input: Option<&VertexInputDesc>,
        format: VertexFormat,
        offset: u32,
        normalized: bool,
        instance_step_rate: u8,
    ) -> &mut Self {
        let Some(input) = input else {
            log::warn!("vertex input '{name}' ({format:?}) does not exist, unused or optimized out?");
            return self;
        };

        let stride = if instance_step_rate == 0 {
            &mut self.strides[0]
        } else {
            &mut self.strides[1]
        };
        *stride += format.size();

        self.attributes.push(VertexAttribute {
            name: name.to_string(),
            semantic: input.semantic.clone(),
            location: input.location.max(0) as u32,
            format,
            offset,
            normalized,
            instance_step_rate,
        });
        self
    }

    /// Resolve `name` against a program's reflected inputs and add it.
    pub fn add_program_attrib(
        &mut self,
        program: &ProgramLayout,
        name: &str,
        format: VertexFormat,
        offset: u32,
        normalized: bool,
    ) -> &mut Self {
        self.add_attrib(name, program.vertex_input(name), format, offset, normalized, 0)
    }

    /// Seal the layout. `stride` overrides the computed per-vertex stride.
    pub fn end_layout(self, stride: Option<u32>) -> VertexLayout {
        let mut strides = self.strides;
        if let Some(stride) = stride {
            strides[0] = stride;
        }

        let mut hasher = DefaultHasher::new();
        self.attributes.hash(&mut hasher);
        strides.hash(&mut hasher);

        VertexLayout {
            inner: Arc::new(LayoutInner {
                attributes: self.attributes,
                strides,
                hash: hasher.finish(),
            }),
        }
    }
}

#[derive(Debug)]
struct LayoutInner {
    attributes: Vec<VertexAttribute>,
    strides: [u32; 2],
    hash: u64,
}

/// Immutable, hashed attribute layout shared between draws.
#[derive(Debug, Clone)]
pub struct VertexLayout {
    inner: Arc<LayoutInner>,
}

impl PartialEq for VertexLayout {
    fn eq(&self, other: &Self) -> bool {
        self.inner.hash == other.inner.hash && self.inner.attributes == other.inner.attributes
    }
}

impl Eq for VertexLayout {}

impl VertexLayout {
    pub fn attributes(&self) -> &[VertexAttribute] {
        &self.inner.attributes
    }

    pub fn vertex_stride(&self) -> u32 {
        self.inner.strides[0]
    }

    pub fn instance_stride(&self) -> u32 {
        self.inner.strides[1]
    }

    pub fn hash_value(&self) -> u64 {
        self.inner.hash
    }

    pub fn is_valid(&self) -> bool {
        self.inner.strides[0] != 0
    }

    pub fn has_instancing(&self) -> bool {
        self.inner.attributes.iter().any(VertexAttribute::is_instanced)
    }

    /// Build one of the stock layouts against `program`'s inputs.
    pub fn builtin(kind: VertexLayoutKind, program: &ProgramLayout) -> VertexLayout {
        use VertexFormat as F;
        use VertexInputKind as K;

        let attrs: &[(K, F, u32, bool, u8)] = match kind {
            VertexLayoutKind::Pos | VertexLayoutKind::SkyBox => &[(K::Position, F::Float3, 0, false, 0)],
            VertexLayoutKind::Texture => &[
                (K::Position, F::Float3, 0, false, 0),
                (K::Texcoord, F::Float2, 12, false, 0),
            ],
            VertexLayoutKind::PosUvColor => &[
                (K::Position, F::Float3, 0, false, 0),
                (K::Texcoord, F::Float2, 12, false, 0),
                (K::Color, F::Float4, 20, false, 0),
            ],
            VertexLayoutKind::Sprite => &[
                (K::Position, F::Float3, 0, false, 0),
                (K::Texcoord, F::Float2, 12, false, 0),
                (K::Color, F::UByte4, 20, true, 0),
            ],
            VertexLayoutKind::Sprite2D => &[
                (K::Position, F::Float2, 0, false, 0),
                (K::Texcoord, F::Float2, 8, false, 0),
                (K::Color, F::UByte4, 16, true, 0),
            ],
            VertexLayoutKind::DrawNode => &[
                (K::Position, F::Float2, 0, false, 0),
                (K::Texcoord, F::Float2, 8, false, 0),
                (K::Color, F::Float4, 16, true, 0),
            ],
            VertexLayoutKind::DrawNode3D => &[
                (K::Position, F::Float3, 0, false, 0),
                (K::Color, F::Float4, 12, true, 0),
            ],
            VertexLayoutKind::PosColor => &[
                (K::Position, F::Float3, 0, false, 0),
                (K::Color, F::Float4, 12, false, 0),
            ],
            VertexLayoutKind::Terrain3D => &[
                (K::Position, F::Float3, 0, false, 0),
                (K::Texcoord, F::Float2, 12, false, 0),
                (K::Normal, F::Float3, 20, false, 0),
            ],
            VertexLayoutKind::Instanced => &[
                (K::Position, F::Float3, 0, false, 0),
                (K::Texcoord, F::Float2, 12, false, 0),
                (K::Instance, F::Mat4, 0, false, 1),
            ],
        };

        let mut desc = VertexLayoutDesc::start_layout(attrs.len());
        for (input, format, offset, normalized, step) in attrs.iter().copied() {
            desc.add_attrib(
                input.name(),
                program.builtin_vertex_input(input),
                format,
                offset,
                normalized,
                step,
            );
        }
        desc.end_layout(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexLayoutKind {
    Pos,
    Texture,
    PosUvColor,
    Sprite,
    Sprite2D,
    DrawNode,
    DrawNode3D,
    SkyBox,
    PosColor,
    Terrain3D,
    Instanced,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(location: i32) -> VertexInputDesc {
        VertexInputDesc {
            semantic: "TEXCOORD".into(),
            location,
            format: VertexFormat::Float4,
        }
    }

    #[test]
    fn strides_split_by_step_rate() {
        let mut desc = VertexLayoutDesc::start_layout(3);
        desc.add_attrib("a_position", Some(&input(0)), VertexFormat::Float3, 0, false, 0)
            .add_attrib("a_texCoord", Some(&input(1)), VertexFormat::Float2, 12, false, 0)
            .add_attrib("a_instance", Some(&input(2)), VertexFormat::Mat4, 0, false, 1);
        let layout = desc.end_layout(None);

        assert_eq!(layout.vertex_stride(), 20);
        assert_eq!(layout.instance_stride(), 64);
        assert!(layout.has_instancing());
        assert!(layout.is_valid());
    }

    #[test]
    fn missing_inputs_are_skipped() {
        let mut desc = VertexLayoutDesc::start_layout(2);
        desc.add_attrib("a_position", Some(&input(0)), VertexFormat::Float3, 0, false, 0)
            .add_attrib("a_normal", None, VertexFormat::Float3, 12, false, 0);
        let layout = desc.end_layout(Some(24));

        assert_eq!(layout.attributes().len(), 1);
        assert_eq!(layout.vertex_stride(), 24);
    }

    #[test]
    fn identical_layouts_hash_equal() {
        let build = || {
            let mut desc = VertexLayoutDesc::start_layout(1);
            desc.add_attrib("a_position", Some(&input(0)), VertexFormat::Float2, 0, false, 0);
            desc.end_layout(None)
        };
        assert_eq!(build().hash_value(), build().hash_value());
        assert_eq!(build(), build());
        assert!(!VertexLayoutDesc::start_layout(0).end_layout(None).is_valid());
    }
}
