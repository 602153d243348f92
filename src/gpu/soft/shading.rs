//! Fixed-function stand-ins for shader stages, plus texel conversion.
//!
//! Programs are interpreted by their reflected names: `a_position` is
//! transformed by an optional per-instance `a_instance` matrix and then by
//! `u_MVPMatrix`; the fragment color is `a_color`, modulated by a `u_tex0`
//! sample and a `u_color` uniform when either is present.

use super::raster::{to_unorm8, Image};
use crate::gpu::{
    PixelFormat, ProgramLayout, SamplerAddressMode, SamplerDesc, SamplerMagFilter, Uniform,
    VertexAttribute, VertexFormat, VertexLayout,
};

/// Name of the optional color multiplier read by the fragment stage.
pub(crate) const COLOR_UNIFORM: &str = "u_color";

pub(crate) type Mat4 = [f32; 16];

/// Convert tightly packed texels of `format` to RGBA8.
pub(crate) fn to_rgba8(format: PixelFormat, src: &[u8], texels: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(texels * 4);
    let push = |out: &mut Vec<u8>, px: [u8; 4]| out.extend_from_slice(&px);
    let expand = |v: u16, bits: u32| -> u8 {
        let max = (1u32 << bits) - 1;
        ((u32::from(v) * 255 + max / 2) / max) as u8
    };
    match format {
        PixelFormat::RGBA8 => out.extend(src.iter().take(texels * 4)),
        PixelFormat::BGRA8 => src
            .chunks_exact(4)
            .take(texels)
            .for_each(|p| push(&mut out, [p[2], p[1], p[0], p[3]])),
        PixelFormat::RGB8 => src
            .chunks_exact(3)
            .take(texels)
            .for_each(|p| push(&mut out, [p[0], p[1], p[2], 255])),
        PixelFormat::R8 => src
            .iter()
            .take(texels)
            .for_each(|r| push(&mut out, [*r, 0, 0, 255])),
        PixelFormat::RG8 => src
            .chunks_exact(2)
            .take(texels)
            .for_each(|p| push(&mut out, [p[0], p[1], 0, 255])),
        PixelFormat::RGB565 | PixelFormat::RGBA4 | PixelFormat::RGB5A1 => {
            for p in src.chunks_exact(2).take(texels) {
                let v = u16::from_le_bytes([p[0], p[1]]);
                let px = match format {
                    PixelFormat::RGB565 => [
                        expand(v >> 11, 5),
                        expand((v >> 5) & 0x3f, 6),
                        expand(v & 0x1f, 5),
                        255,
                    ],
                    PixelFormat::RGBA4 => [
                        expand(v >> 12, 4),
                        expand((v >> 8) & 0xf, 4),
                        expand((v >> 4) & 0xf, 4),
                        expand(v & 0xf, 4),
                    ],
                    _ => [
                        expand(v >> 11, 5),
                        expand((v >> 6) & 0x1f, 5),
                        expand((v >> 1) & 0x1f, 5),
                        if v & 1 != 0 { 255 } else { 0 },
                    ],
                };
                push(&mut out, px);
            }
        }
        PixelFormat::RGBA32F => {
            for p in src.chunks_exact(16).take(texels) {
                let c: [f32; 4] = bytemuck::pod_read_unaligned(p);
                push(&mut out, c.map(to_unorm8));
            }
        }
        _ => {}
    }
    out.resize(texels * 4, 0);
    out
}

/// Split packed D24S8 texels (depth in the upper 24 bits).
pub(crate) fn unpack_depth_stencil(src: &[u8], texels: usize) -> (Vec<f32>, Vec<u8>) {
    let mut depth = Vec::with_capacity(texels);
    let mut stencil = Vec::with_capacity(texels);
    for p in src.chunks_exact(4).take(texels) {
        let v = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
        depth.push((v >> 8) as f32 / 0x00ff_ffff as f32);
        stencil.push((v & 0xff) as u8);
    }
    depth.resize(texels, 1.0);
    stencil.resize(texels, 0);
    (depth, stencil)
}

/// Column-major 4x4 matrix times a column vector.
fn transform(m: &Mat4, v: [f32; 4]) -> [f32; 4] {
    let mut out = [0.0; 4];
    for (row, o) in out.iter_mut().enumerate() {
        *o = (0..4).map(|col| m[col * 4 + row] * v[col]).sum();
    }
    out
}

fn read_f32(bytes: &[u8], at: usize) -> Option<f32> {
    bytes.get(at..at + 4).map(bytemuck::pod_read_unaligned)
}

/// Fetch attribute `attr` of element `index` from `data`.
fn fetch(attr: &VertexAttribute, data: &[u8], stride: u32, index: u32) -> Option<[f32; 16]> {
    let base = index as usize * stride as usize + attr.offset as usize;
    let bytes = data.get(base..base + attr.format.size() as usize)?;
    let mut out = [0.0f32; 16];
    let components = attr.format.components() as usize * attr.format.location_slots() as usize;
    for (i, o) in out.iter_mut().enumerate().take(components) {
        *o = match attr.format {
            VertexFormat::Float4
            | VertexFormat::Float3
            | VertexFormat::Float2
            | VertexFormat::Float
            | VertexFormat::Mat4 => read_f32(bytes, i * 4)?,
            VertexFormat::Int4 | VertexFormat::Int3 | VertexFormat::Int2 | VertexFormat::Int => {
                let v: i32 = bytemuck::pod_read_unaligned(bytes.get(i * 4..i * 4 + 4)?);
                v as f32
            }
            VertexFormat::UShort4 | VertexFormat::UShort2 => {
                let v = f32::from(u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]));
                if attr.normalized {
                    v / 65535.0
                } else {
                    v
                }
            }
            VertexFormat::UByte4 => {
                let v = f32::from(bytes[i]);
                if attr.normalized {
                    v / 255.0
                } else {
                    v
                }
            }
        };
    }
    Some(out)
}

/// Vertex data bound by the last `bind_vertex_input`.
pub(crate) struct VertexInput {
    pub layout: VertexLayout,
    pub vertex: Vec<u8>,
    pub instance: Option<Vec<u8>>,
}

/// Vertex stage output in clip space.
pub(crate) struct ClipVertex {
    pub position: [f32; 4],
    pub color: [f32; 4],
    pub uv: [f32; 2],
}

impl VertexInput {
    fn attribute(&self, name: &str) -> Option<&VertexAttribute> {
        self.layout.attributes().iter().find(|a| a.name == name)
    }

    fn read(&self, attr: &VertexAttribute, vertex: u32, instance: u32) -> Option<[f32; 16]> {
        if attr.is_instanced() {
            let step = u32::from(attr.instance_step_rate).max(1);
            let data = self.instance.as_deref()?;
            fetch(attr, data, self.layout.instance_stride(), instance / step)
        } else {
            fetch(attr, &self.vertex, self.layout.vertex_stride(), vertex)
        }
    }

    pub fn run(&self, layout: &ProgramLayout, uniforms: &[u8], vertex: u32, instance: u32) -> ClipVertex {
        let value = |name: &str| {
            let attr = self.attribute(name)?;
            self.read(attr, vertex, instance).map(|v| (attr, v))
        };

        let mut position = [0.0, 0.0, 0.0, 1.0];
        if let Some((attr, v)) = value("a_position") {
            let n = attr.format.components() as usize;
            position[..n.min(4)].copy_from_slice(&v[..n.min(4)]);
        }
        if let Some((_, m)) = value("a_instance") {
            position = transform(&m, position);
        }
        let mvp = layout.vertex().builtin_uniform(Uniform::MvpMatrix);
        if let Some(mvp) = uniform_mat4(mvp.map(|u| u.buffer_offset), uniforms) {
            position = transform(&mvp, position);
        }

        let mut color = [1.0; 4];
        if let Some((attr, v)) = value("a_color") {
            let n = attr.format.components() as usize;
            color[..n.min(4)].copy_from_slice(&v[..n.min(4)]);
        }
        let uv = value("a_texCoord").map(|(_, v)| [v[0], v[1]]).unwrap_or_default();

        ClipVertex { position, color, uv }
    }
}

fn uniform_mat4(offset: Option<u32>, uniforms: &[u8]) -> Option<Mat4> {
    let at = offset? as usize;
    uniforms
        .get(at..at + 64)
        .map(bytemuck::pod_read_unaligned::<Mat4>)
}

/// Fragment stage inputs gathered before rasterization.
pub(crate) struct FragmentStage {
    pub tint: [f32; 4],
    pub texture: Option<Sampled>,
}

impl FragmentStage {
    pub fn new(layout: &ProgramLayout, uniforms: &[u8], texture: Option<Sampled>) -> Self {
        let tint = layout
            .fragment()
            .uniform_info(COLOR_UNIFORM)
            .filter(|info| info.size >= 16)
            .and_then(|info| {
                let at = info.buffer_offset as usize;
                uniforms.get(at..at + 16).map(bytemuck::pod_read_unaligned::<[f32; 4]>)
            })
            .unwrap_or([1.0; 4]);
        Self { tint, texture }
    }

    pub fn shade(&self, color: [f32; 4], uv: [f32; 2]) -> [f32; 4] {
        let texel = self
            .texture
            .as_ref()
            .map(|t| t.sample(uv))
            .unwrap_or([1.0; 4]);
        let mut out = [0.0; 4];
        for c in 0..4 {
            out[c] = color[c] * texel[c] * self.tint[c];
        }
        out
    }
}

/// Snapshot of a texture's base level taken before a draw.
pub(crate) struct Sampled {
    pub image: Image,
    pub sampler: SamplerDesc,
}

fn wrap(coord: i64, size: u32, mode: SamplerAddressMode) -> Option<u32> {
    let size = i64::from(size);
    match mode {
        SamplerAddressMode::Repeat => Some(coord.rem_euclid(size) as u32),
        SamplerAddressMode::MirrorRepeat => {
            let period = coord.rem_euclid(size * 2);
            let mirrored = if period < size { period } else { size * 2 - 1 - period };
            Some(mirrored as u32)
        }
        SamplerAddressMode::ClampToEdge => Some(coord.clamp(0, size - 1) as u32),
        SamplerAddressMode::ClampToBorder => (0..size).contains(&coord).then_some(coord as u32),
    }
}

impl Sampled {
    fn texel(&self, x: i64, y: i64) -> [f32; 4] {
        let s = wrap(x, self.image.width, self.sampler.s_address_mode);
        let t = wrap(y, self.image.height, self.sampler.t_address_mode);
        match (s, t) {
            (Some(s), Some(t)) => self.image.texel(s, t).map(|c| f32::from(c) / 255.0),
            _ => [0.0; 4],
        }
    }

    /// Sample at normalized `uv`, with `v = 0` on the first stored row.
    pub fn sample(&self, uv: [f32; 2]) -> [f32; 4] {
        if self.image.is_empty() {
            return [0.0, 0.0, 0.0, 1.0];
        }
        let x = uv[0] * self.image.width as f32 - 0.5;
        let y = uv[1] * self.image.height as f32 - 0.5;
        match self.sampler.mag_filter {
            SamplerMagFilter::Nearest => self.texel((x + 0.5).floor() as i64, (y + 0.5).floor() as i64),
            SamplerMagFilter::Linear => {
                let (x0, y0) = (x.floor(), y.floor());
                let (fx, fy) = (x - x0, y - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let a = self.texel(x0, y0);
                let b = self.texel(x0 + 1, y0);
                let c = self.texel(x0, y0 + 1);
                let d = self.texel(x0 + 1, y0 + 1);
                let mut out = [0.0; 4];
                for i in 0..4 {
                    let top = a[i] + (b[i] - a[i]) * fx;
                    let bottom = c[i] + (d[i] - c[i]) * fx;
                    out[i] = top + (bottom - top) * fy;
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_formats_expand_to_rgba8() {
        assert_eq!(to_rgba8(PixelFormat::RGB565, &0xf800u16.to_le_bytes(), 1), vec![255, 0, 0, 255]);
        assert_eq!(to_rgba8(PixelFormat::BGRA8, &[1, 2, 3, 4], 1), vec![3, 2, 1, 4]);
        assert_eq!(to_rgba8(PixelFormat::R8, &[9], 1), vec![9, 0, 0, 255]);
        // Short input is zero-padded.
        assert_eq!(to_rgba8(PixelFormat::RGB8, &[], 1), vec![0, 0, 0, 0]);
    }

    #[test]
    fn depth_occupies_upper_bits() {
        let (depth, stencil) = unpack_depth_stencil(&0xffff_ff07u32.to_le_bytes(), 1);
        assert_eq!(stencil, vec![7]);
        assert!((depth[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn repeat_and_mirror_wrap() {
        assert_eq!(wrap(-1, 4, SamplerAddressMode::Repeat), Some(3));
        assert_eq!(wrap(5, 4, SamplerAddressMode::MirrorRepeat), Some(2));
        assert_eq!(wrap(9, 4, SamplerAddressMode::ClampToEdge), Some(3));
        assert_eq!(wrap(4, 4, SamplerAddressMode::ClampToBorder), None);
    }

    #[test]
    fn identity_transform_keeps_position() {
        let mut identity = [0.0; 16];
        for i in 0..4 {
            identity[i * 5] = 1.0;
        }
        assert_eq!(transform(&identity, [1.0, 2.0, 3.0, 1.0]), [1.0, 2.0, 3.0, 1.0]);
    }
}
