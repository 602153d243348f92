//! Scanline-free rasterizer: edge functions over the primitive's bounding
//! box, GL conventions (window origin bottom-left, pixel centers at +0.5).

use crate::gpu::{
    BlendDesc, BlendFactor, BlendOp, ColorWriteMask, CullMode, DepthStencilDesc, RasterizerState,
    StencilDesc, StencilOp, Viewport, Winding,
};

/// One mip level of one layer. Color is RGBA8, rows stored bottom-up.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Image {
    pub width: u32,
    pub height: u32,
    pub color: Vec<u8>,
    pub depth: Vec<f32>,
    pub stencil: Vec<u8>,
}

impl Image {
    pub fn color(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            color: vec![0; width as usize * height as usize * 4],
            ..Default::default()
        }
    }

    pub fn depth_stencil(width: u32, height: u32) -> Self {
        let texels = width as usize * height as usize;
        Self {
            width,
            height,
            depth: vec![1.0; texels],
            stencil: vec![0; texels],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height).then(|| (y * self.width + x) as usize)
    }

    pub fn texel(&self, x: u32, y: u32) -> [u8; 4] {
        match self.index(x, y) {
            Some(i) if self.color.len() >= (i + 1) * 4 => {
                let p = &self.color[i * 4..i * 4 + 4];
                [p[0], p[1], p[2], p[3]]
            }
            _ => [0; 4],
        }
    }

    pub fn fill_color(&mut self, rgba: [u8; 4]) {
        for px in self.color.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
    }

    /// Box-filter this level down to the next one.
    pub fn downsample(&self) -> Image {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut out = Image::color(width, height);
        for y in 0..height {
            for x in 0..width {
                let mut sum = [0u32; 4];
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let sx = (x * 2 + dx).min(self.width - 1);
                    let sy = (y * 2 + dy).min(self.height - 1);
                    let t = self.texel(sx, sy);
                    for c in 0..4 {
                        sum[c] += u32::from(t[c]);
                    }
                }
                let i = ((y * width + x) * 4) as usize;
                for c in 0..4 {
                    out.color[i + c] = ((sum[c] + 2) / 4) as u8;
                }
            }
        }
        out
    }
}

/// Attachments a draw writes into.
pub(crate) struct Surface {
    pub colors: Vec<Image>,
    pub depth: Option<Image>,
}

impl Surface {
    fn extent(&self) -> (u32, u32) {
        self.colors
            .iter()
            .chain(self.depth.iter())
            .filter(|image| !image.is_empty())
            .map(|image| (image.width, image.height))
            .next()
            .unwrap_or((0, 0))
    }
}

/// Per-vertex values after the vertex stage, already in window space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Vertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Reciprocal of clip w, for perspective-correct interpolation.
    pub inv_w: f32,
    pub color: [f32; 4],
    pub uv: [f32; 2],
}

impl Vertex {
    /// Map a clip-space position into `viewport`. `None` for vertices at or
    /// behind the eye.
    pub fn from_clip(clip: [f32; 4], viewport: &Viewport, color: [f32; 4], uv: [f32; 2]) -> Option<Self> {
        if clip[3] <= f32::EPSILON {
            return None;
        }
        let inv_w = 1.0 / clip[3];
        let (nx, ny, nz) = (clip[0] * inv_w, clip[1] * inv_w, clip[2] * inv_w);
        Some(Self {
            x: viewport.x as f32 + (nx + 1.0) * 0.5 * viewport.width as f32,
            y: viewport.y as f32 + (ny + 1.0) * 0.5 * viewport.height as f32,
            z: ((nz + 1.0) * 0.5).clamp(0.0, 1.0),
            inv_w,
            color,
            uv,
        })
    }
}

/// Fixed-function state for one draw.
pub(crate) struct Pipeline<'a> {
    pub raster: RasterizerState,
    pub blend: Option<BlendDesc>,
    pub depth_stencil: Option<DepthStencilDesc>,
    pub stencil_ref: u32,
    pub shade: &'a dyn Fn([f32; 4], [f32; 2]) -> [f32; 4],
}

fn edge(ax: f32, ay: f32, bx: f32, by: f32, px: f32, py: f32) -> f32 {
    (bx - ax) * (py - ay) - (by - ay) * (px - ax)
}

/// Top and left edges own the pixels centered exactly on them.
fn owns_tie(a: &Vertex, b: &Vertex) -> bool {
    let top = a.y == b.y && b.x < a.x;
    let left = b.y < a.y;
    top || left
}

/// Pixel bounds clipped to the surface and the scissor rectangle.
fn clip_bounds(p: &Pipeline, surface: &Surface, min: (f32, f32), max: (f32, f32)) -> Option<(u32, u32, u32, u32)> {
    let (width, height) = surface.extent();
    let (mut x0, mut y0) = (0i64, 0i64);
    let (mut x1, mut y1) = (width as i64, height as i64);
    if let Some(s) = p.raster.scissor {
        x0 = x0.max(s.x as i64);
        y0 = y0.max(s.y as i64);
        x1 = x1.min(s.x as i64 + s.width as i64);
        y1 = y1.min(s.y as i64 + s.height as i64);
    }
    x0 = x0.max(min.0.floor() as i64);
    y0 = y0.max(min.1.floor() as i64);
    x1 = x1.min(max.0.ceil() as i64);
    y1 = y1.min(max.1.ceil() as i64);
    (x0 < x1 && y0 < y1).then(|| (x0 as u32, y0 as u32, x1 as u32, y1 as u32))
}

pub(crate) fn triangle(p: &Pipeline, surface: &mut Surface, v: [&Vertex; 3]) {
    let [mut a, mut b, c] = v;
    let area = edge(a.x, a.y, b.x, b.y, c.x, c.y);
    if area == 0.0 || !area.is_finite() {
        return;
    }

    let ccw = area > 0.0;
    let front = match p.raster.winding {
        Winding::CounterClockWise => ccw,
        Winding::ClockWise => !ccw,
    };
    match p.raster.cull_mode {
        CullMode::Back if !front => return,
        CullMode::Front if front => return,
        _ => {}
    }
    if !ccw {
        std::mem::swap(&mut a, &mut b);
    }
    let area = area.abs();

    let min = (a.x.min(b.x).min(c.x), a.y.min(b.y).min(c.y));
    let max = (a.x.max(b.x).max(c.x), a.y.max(b.y).max(c.y));
    let Some((x0, y0, x1, y1)) = clip_bounds(p, surface, min, max) else {
        return;
    };
    let ties = [owns_tie(b, c), owns_tie(c, a), owns_tie(a, b)];

    for y in y0..y1 {
        for x in x0..x1 {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            let w = [
                edge(b.x, b.y, c.x, c.y, px, py),
                edge(c.x, c.y, a.x, a.y, px, py),
                edge(a.x, a.y, b.x, b.y, px, py),
            ];
            let inside = w
                .iter()
                .zip(ties)
                .all(|(w, tie)| *w > 0.0 || (*w == 0.0 && tie));
            if !inside {
                continue;
            }
            let l = [w[0] / area, w[1] / area, w[2] / area];
            let z = l[0] * a.z + l[1] * b.z + l[2] * c.z;
            let persp = [l[0] * a.inv_w, l[1] * b.inv_w, l[2] * c.inv_w];
            let norm = persp[0] + persp[1] + persp[2];
            let weights = if norm > 0.0 {
                [persp[0] / norm, persp[1] / norm, persp[2] / norm]
            } else {
                l
            };
            let color = blend4(&[a.color, b.color, c.color], weights);
            let uv = [
                weights[0] * a.uv[0] + weights[1] * b.uv[0] + weights[2] * c.uv[0],
                weights[0] * a.uv[1] + weights[1] * b.uv[1] + weights[2] * c.uv[1],
            ];
            fragment(p, surface, x, y, z, front, color, uv);
        }
    }
}

pub(crate) fn line(p: &Pipeline, surface: &mut Surface, a: &Vertex, b: &Vertex) {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as u32;
    let min = (a.x.min(b.x) - 1.0, a.y.min(b.y) - 1.0);
    let max = (a.x.max(b.x) + 1.0, a.y.max(b.y) + 1.0);
    let Some((x0, y0, x1, y1)) = clip_bounds(p, surface, min, max) else {
        return;
    };
    for i in 0..steps {
        let t = (i as f32 + 0.5) / steps as f32;
        let (px, py) = (a.x + dx * t, a.y + dy * t);
        if px < x0 as f32 || py < y0 as f32 || px >= x1 as f32 || py >= y1 as f32 {
            continue;
        }
        let color = blend4(&[a.color, b.color], [1.0 - t, t, 0.0]);
        let uv = [
            a.uv[0] + (b.uv[0] - a.uv[0]) * t,
            a.uv[1] + (b.uv[1] - a.uv[1]) * t,
        ];
        let z = a.z + (b.z - a.z) * t;
        fragment(p, surface, px as u32, py as u32, z, true, color, uv);
    }
}

pub(crate) fn point(p: &Pipeline, surface: &mut Surface, v: &Vertex) {
    let Some((x0, y0, _, _)) = clip_bounds(p, surface, (v.x, v.y), (v.x + 1.0, v.y + 1.0)) else {
        return;
    };
    if v.x.floor() as i64 == x0 as i64 && v.y.floor() as i64 == y0 as i64 {
        fragment(p, surface, x0, y0, v.z, true, v.color, v.uv);
    }
}

fn blend4(values: &[[f32; 4]], weights: [f32; 3]) -> [f32; 4] {
    let mut out = [0.0; 4];
    for (value, weight) in values.iter().zip(weights) {
        for c in 0..4 {
            out[c] += value[c] * weight;
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn fragment(p: &Pipeline, surface: &mut Surface, x: u32, y: u32, z: f32, front: bool, color: [f32; 4], uv: [f32; 2]) {
    if let (Some(ds), Some(depth)) = (p.depth_stencil.as_ref(), surface.depth.as_mut()) {
        let Some(i) = depth.index(x, y) else {
            return;
        };
        if !depth_stencil_test(ds, depth, i, z, front, p.stencil_ref) {
            return;
        }
    }

    let src = (p.shade)(color, uv);
    for image in surface.colors.iter_mut() {
        let Some(i) = image.index(x, y) else {
            continue;
        };
        let Some(px) = image.color.get_mut(i * 4..i * 4 + 4) else {
            continue;
        };
        let dst = [
            f32::from(px[0]) / 255.0,
            f32::from(px[1]) / 255.0,
            f32::from(px[2]) / 255.0,
            f32::from(px[3]) / 255.0,
        ];
        let (out, mask) = match &p.blend {
            Some(desc) if desc.blend_enabled => (blend(desc, src, dst), desc.write_mask),
            Some(desc) => (src, desc.write_mask),
            None => (src, ColorWriteMask::ALL),
        };
        let channels = [
            ColorWriteMask::RED,
            ColorWriteMask::GREEN,
            ColorWriteMask::BLUE,
            ColorWriteMask::ALPHA,
        ];
        for (c, channel) in channels.iter().enumerate() {
            if mask.contains(*channel) {
                px[c] = to_unorm8(out[c]);
            }
        }
    }
}

pub(crate) fn to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn depth_stencil_test(ds: &DepthStencilDesc, image: &mut Image, i: usize, z: f32, front: bool, reference: u32) -> bool {
    let face = if front {
        &ds.front_face_stencil
    } else {
        &ds.back_face_stencil
    };

    if ds.stencil_test() {
        let stored = u32::from(image.stencil[i]);
        let mask = face.read_mask;
        if !face.stencil_compare_function.passes(reference & mask, stored & mask) {
            apply_stencil_op(face, face.stencil_failure_operation, image, i, reference);
            return false;
        }
    }

    if ds.depth_test() {
        if !ds.depth_compare_function.passes(z, image.depth[i]) {
            if ds.stencil_test() {
                apply_stencil_op(face, face.depth_failure_operation, image, i, reference);
            }
            return false;
        }
        if ds.depth_write() {
            image.depth[i] = z;
        }
    }

    if ds.stencil_test() {
        apply_stencil_op(face, face.depth_stencil_pass_operation, image, i, reference);
    }
    true
}

fn apply_stencil_op(face: &StencilDesc, op: StencilOp, image: &mut Image, i: usize, reference: u32) {
    let old = image.stencil[i];
    let value = match op {
        StencilOp::Keep => return,
        StencilOp::Zero => 0,
        StencilOp::Replace => reference as u8,
        StencilOp::Invert => !old,
        StencilOp::IncrementWrap => old.wrapping_add(1),
        StencilOp::DecrementWrap => old.wrapping_sub(1),
    };
    let mask = face.write_mask as u8;
    image.stencil[i] = (old & !mask) | (value & mask);
}

fn factor(f: BlendFactor, src: [f32; 4], dst: [f32; 4], channel: usize) -> f32 {
    // Constant blend color stays at its GL default of transparent black.
    let constant = [0.0f32; 4];
    match f {
        BlendFactor::Zero => 0.0,
        BlendFactor::One => 1.0,
        BlendFactor::SrcColor => src[channel],
        BlendFactor::OneMinusSrcColor => 1.0 - src[channel],
        BlendFactor::SrcAlpha => src[3],
        BlendFactor::OneMinusSrcAlpha => 1.0 - src[3],
        BlendFactor::DstColor => dst[channel],
        BlendFactor::OneMinusDstColor => 1.0 - dst[channel],
        BlendFactor::DstAlpha => dst[3],
        BlendFactor::OneMinusDstAlpha => 1.0 - dst[3],
        BlendFactor::ConstantAlpha => constant[3],
        BlendFactor::OneMinusConstantAlpha => 1.0 - constant[3],
        BlendFactor::BlendColor => constant[channel],
        BlendFactor::SrcAlphaSaturate if channel == 3 => 1.0,
        BlendFactor::SrcAlphaSaturate => src[3].min(1.0 - dst[3]),
    }
}

fn blend(desc: &BlendDesc, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    let mut out = [0.0; 4];
    for c in 0..4 {
        let (op, sf, df) = if c < 3 {
            (
                desc.rgb_blend_op,
                desc.source_rgb_blend_factor,
                desc.destination_rgb_blend_factor,
            )
        } else {
            (
                desc.alpha_blend_op,
                desc.source_alpha_blend_factor,
                desc.destination_alpha_blend_factor,
            )
        };
        let s = src[c] * factor(sf, src, dst, c);
        let d = dst[c] * factor(df, src, dst, c);
        out[c] = match op {
            BlendOp::Add => s + d,
            BlendOp::Subtract => s - d,
            BlendOp::ReverseSubtract => d - s,
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32, y: f32) -> Vertex {
        Vertex {
            x,
            y,
            z: 0.5,
            inv_w: 1.0,
            color: [1.0, 0.0, 0.0, 1.0],
            uv: [0.0, 0.0],
        }
    }

    fn solid(color: [f32; 4], _: [f32; 2]) -> [f32; 4] {
        color
    }

    fn pipeline(raster: RasterizerState) -> Pipeline<'static> {
        Pipeline {
            raster,
            blend: None,
            depth_stencil: None,
            stencil_ref: 0,
            shade: &solid,
        }
    }

    fn coverage(surface: &Surface) -> usize {
        surface.colors[0]
            .color
            .chunks_exact(4)
            .filter(|px| px[0] == 255)
            .count()
    }

    #[test]
    fn shared_edges_are_drawn_once() {
        let mut surface = Surface {
            colors: vec![Image::color(4, 4)],
            depth: None,
        };
        let additive = BlendDesc {
            blend_enabled: true,
            ..Default::default()
        };
        let mut p = pipeline(RasterizerState::default());
        p.blend = Some(BlendDesc {
            destination_rgb_blend_factor: BlendFactor::One,
            destination_alpha_blend_factor: BlendFactor::One,
            ..additive
        });
        let dim = |x, y| Vertex {
            color: [0.2, 0.0, 0.0, 0.0],
            ..vertex(x, y)
        };
        let (a, b, c, d) = (dim(0.0, 0.0), dim(4.0, 0.0), dim(4.0, 4.0), dim(0.0, 4.0));
        triangle(&p, &mut surface, [&a, &b, &c]);
        triangle(&p, &mut surface, [&a, &c, &d]);
        assert!(surface.colors[0].color.chunks_exact(4).all(|px| px[0] == 51));
    }

    #[test]
    fn back_faces_are_culled() {
        let mut surface = Surface {
            colors: vec![Image::color(4, 4)],
            depth: None,
        };
        let p = pipeline(RasterizerState {
            cull_mode: CullMode::Back,
            ..Default::default()
        });
        let (a, b, c) = (vertex(0.0, 0.0), vertex(0.0, 4.0), vertex(4.0, 0.0));
        triangle(&p, &mut surface, [&a, &b, &c]);
        assert_eq!(coverage(&surface), 0);
    }

    #[test]
    fn alpha_blend_mixes_with_destination() {
        let out = blend(&BlendDesc::alpha_blend(), [1.0, 0.0, 0.0, 0.5], [0.0, 0.0, 1.0, 1.0]);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[2] - 0.5).abs() < 1e-6);
    }
}
