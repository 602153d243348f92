//! Mirror of the GL context's current state. Every stateful call the GL
//! device makes goes through [`StateCache`], which drops calls that would
//! not change anything. After a context is recreated the mirror is
//! [`reset`](StateCache::reset) to "unknown", so the next call of each kind
//! is always issued.

use std::collections::HashMap;
use std::num::NonZeroU32;

use crate::gpu::{
    BlendDesc, BlendFactor, BlendOp, ColorWriteMask, CompareFunc, CullMode, DepthStencilDesc,
    RasterizerState, ScissorRect, StencilDesc, StencilOp, TargetBufferFlags, TextureType, Viewport,
    Winding,
};

/// Raw GL object name. Zero (the default object) is `None`.
pub type GlName = NonZeroU32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    Array,
    ElementArray,
    Uniform,
    PixelPack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Blend,
    CullFace,
    DepthTest,
    StencilTest,
    ScissorTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Face {
    Front,
    Back,
}

/// The GL entry points the cache mediates.
pub trait GlStateApi {
    fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<GlName>);
    fn bind_buffer_base(&mut self, index: u32, buffer: Option<GlName>);
    fn bind_framebuffer(&mut self, framebuffer: Option<GlName>);
    fn active_texture(&mut self, unit: u32);
    fn bind_texture(&mut self, target: TextureType, texture: Option<GlName>);
    fn bind_sampler(&mut self, unit: u32, sampler: Option<GlName>);
    fn use_program(&mut self, program: Option<GlName>);
    fn set_vertex_attrib_enabled(&mut self, index: u32, enabled: bool);
    fn set_capability(&mut self, capability: Capability, enabled: bool);
    fn cull_face(&mut self, face: Face);
    fn front_face(&mut self, winding: Winding);
    fn blend_equation(&mut self, rgb: BlendOp, alpha: BlendOp);
    fn blend_func(&mut self, factors: [BlendFactor; 4]);
    fn color_mask(&mut self, mask: ColorWriteMask);
    fn depth_mask(&mut self, write: bool);
    fn depth_func(&mut self, func: CompareFunc);
    fn stencil_func(&mut self, face: Face, func: CompareFunc, reference: u32, mask: u32);
    fn stencil_op(&mut self, face: Face, ops: [StencilOp; 3]);
    fn stencil_mask(&mut self, face: Face, mask: u32);
    fn scissor(&mut self, rect: ScissorRect);
    fn viewport(&mut self, viewport: Viewport);
}

/// Store `value` in `slot`, returning whether it differed.
fn changed<T: PartialEq>(slot: &mut Option<T>, value: T, elided: &mut u64) -> bool {
    if slot.as_ref() == Some(&value) {
        *elided += 1;
        return false;
    }
    *slot = Some(value);
    true
}

fn face_index(face: Face) -> usize {
    match face {
        Face::Front => 0,
        Face::Back => 1,
    }
}

#[derive(Debug, Default)]
pub struct StateCache {
    buffers: HashMap<BufferTarget, Option<Option<GlName>>>,
    buffer_bases: HashMap<u32, Option<Option<GlName>>>,
    framebuffer: Option<Option<GlName>>,
    active_unit: Option<u32>,
    textures: HashMap<u32, Option<(TextureType, Option<GlName>)>>,
    samplers: HashMap<u32, Option<Option<GlName>>>,
    program: Option<Option<GlName>>,
    attribs: HashMap<u32, Option<bool>>,
    capabilities: HashMap<Capability, Option<bool>>,
    cull_face: Option<Face>,
    front_face: Option<Winding>,
    blend_equation: Option<(BlendOp, BlendOp)>,
    blend_func: Option<[BlendFactor; 4]>,
    color_mask: Option<ColorWriteMask>,
    depth_mask: Option<bool>,
    depth_func: Option<CompareFunc>,
    stencil_func: [Option<(CompareFunc, u32, u32)>; 2],
    stencil_op: [Option<[StencilOp; 3]>; 2],
    stencil_mask: [Option<u32>; 2],
    scissor: Option<ScissorRect>,
    viewport: Option<Viewport>,
    elided: u64,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; the next call of every kind reaches GL.
    pub fn reset(&mut self) {
        let elided = self.elided;
        *self = Self {
            elided,
            ..Self::default()
        };
    }

    /// Calls dropped because they matched the mirrored state.
    pub fn elided(&self) -> u64 {
        self.elided
    }

    pub fn bind_buffer(&mut self, api: &mut impl GlStateApi, target: BufferTarget, buffer: Option<GlName>) {
        let slot = self.buffers.entry(target).or_default();
        if changed(slot, buffer, &mut self.elided) {
            api.bind_buffer(target, buffer);
        }
    }

    pub fn bind_buffer_base(&mut self, api: &mut impl GlStateApi, index: u32, buffer: Option<GlName>) {
        let slot = self.buffer_bases.entry(index).or_default();
        if changed(slot, buffer, &mut self.elided) {
            api.bind_buffer_base(index, buffer);
            // glBindBufferBase also rebinds the generic uniform target.
            self.buffers.insert(BufferTarget::Uniform, Some(buffer));
        }
    }

    pub fn bind_framebuffer(&mut self, api: &mut impl GlStateApi, framebuffer: Option<GlName>) {
        if changed(&mut self.framebuffer, framebuffer, &mut self.elided) {
            api.bind_framebuffer(framebuffer);
        }
    }

    pub fn bind_texture(&mut self, api: &mut impl GlStateApi, unit: u32, target: TextureType, texture: Option<GlName>) {
        let slot = self.textures.entry(unit).or_default();
        if slot.as_ref() == Some(&(target, texture)) {
            self.elided += 1;
            return;
        }
        *slot = Some((target, texture));
        if changed(&mut self.active_unit, unit, &mut self.elided) {
            api.active_texture(unit);
        }
        api.bind_texture(target, texture);
    }

    /// Sampler objects bind by unit index, independent of the active unit.
    pub fn bind_sampler(&mut self, api: &mut impl GlStateApi, unit: u32, sampler: Option<GlName>) {
        let slot = self.samplers.entry(unit).or_default();
        if changed(slot, sampler, &mut self.elided) {
            api.bind_sampler(unit, sampler);
        }
    }

    pub fn use_program(&mut self, api: &mut impl GlStateApi, program: Option<GlName>) {
        if changed(&mut self.program, program, &mut self.elided) {
            api.use_program(program);
        }
    }

    /// Enable exactly the attribute locations in `enabled`, disabling any
    /// other location this cache previously enabled.
    pub fn set_enabled_attribs(&mut self, api: &mut impl GlStateApi, enabled: &[u32]) {
        let previously: Vec<u32> = self
            .attribs
            .iter()
            .filter(|(index, on)| **on == Some(true) && !enabled.contains(*index))
            .map(|(index, _)| *index)
            .collect();
        for index in previously {
            self.attribs.insert(index, Some(false));
            api.set_vertex_attrib_enabled(index, false);
        }
        for index in enabled {
            let slot = self.attribs.entry(*index).or_default();
            if changed(slot, true, &mut self.elided) {
                api.set_vertex_attrib_enabled(*index, true);
            }
        }
    }

    pub fn set_capability(&mut self, api: &mut impl GlStateApi, capability: Capability, enabled: bool) {
        let slot = self.capabilities.entry(capability).or_default();
        if changed(slot, enabled, &mut self.elided) {
            api.set_capability(capability, enabled);
        }
    }

    pub fn color_mask(&mut self, api: &mut impl GlStateApi, mask: ColorWriteMask) {
        if changed(&mut self.color_mask, mask, &mut self.elided) {
            api.color_mask(mask);
        }
    }

    pub fn depth_mask(&mut self, api: &mut impl GlStateApi, write: bool) {
        if changed(&mut self.depth_mask, write, &mut self.elided) {
            api.depth_mask(write);
        }
    }

    pub fn stencil_mask(&mut self, api: &mut impl GlStateApi, face: Face, mask: u32) {
        if changed(&mut self.stencil_mask[face_index(face)], mask, &mut self.elided) {
            api.stencil_mask(face, mask);
        }
    }

    pub fn viewport(&mut self, api: &mut impl GlStateApi, viewport: Viewport) {
        if changed(&mut self.viewport, viewport, &mut self.elided) {
            api.viewport(viewport);
        }
    }

    pub fn apply_blend(&mut self, api: &mut impl GlStateApi, desc: &BlendDesc) {
        self.color_mask(api, desc.write_mask);
        self.set_capability(api, Capability::Blend, desc.blend_enabled);
        if !desc.blend_enabled {
            return;
        }
        let equation = (desc.rgb_blend_op, desc.alpha_blend_op);
        if changed(&mut self.blend_equation, equation, &mut self.elided) {
            api.blend_equation(equation.0, equation.1);
        }
        let factors = [
            desc.source_rgb_blend_factor,
            desc.destination_rgb_blend_factor,
            desc.source_alpha_blend_factor,
            desc.destination_alpha_blend_factor,
        ];
        if changed(&mut self.blend_func, factors, &mut self.elided) {
            api.blend_func(factors);
        }
    }

    /// `None` turns depth and stencil testing off.
    pub fn apply_depth_stencil(&mut self, api: &mut impl GlStateApi, desc: Option<&DepthStencilDesc>, reference: u32) {
        let Some(desc) = desc else {
            self.set_capability(api, Capability::DepthTest, false);
            self.set_capability(api, Capability::StencilTest, false);
            return;
        };

        self.set_capability(api, Capability::DepthTest, desc.depth_test());
        if desc.depth_test() {
            self.depth_mask(api, desc.depth_write());
            if changed(&mut self.depth_func, desc.depth_compare_function, &mut self.elided) {
                api.depth_func(desc.depth_compare_function);
            }
        }

        self.set_capability(api, Capability::StencilTest, desc.stencil_test());
        if desc.stencil_test() {
            self.apply_stencil_face(api, Face::Front, &desc.front_face_stencil, reference);
            self.apply_stencil_face(api, Face::Back, &desc.back_face_stencil, reference);
        }
    }

    fn apply_stencil_face(&mut self, api: &mut impl GlStateApi, face: Face, desc: &StencilDesc, reference: u32) {
        let i = face_index(face);
        let func = (desc.stencil_compare_function, reference, desc.read_mask);
        if changed(&mut self.stencil_func[i], func, &mut self.elided) {
            api.stencil_func(face, func.0, func.1, func.2);
        }
        let ops = [
            desc.stencil_failure_operation,
            desc.depth_failure_operation,
            desc.depth_stencil_pass_operation,
        ];
        if changed(&mut self.stencil_op[i], ops, &mut self.elided) {
            api.stencil_op(face, ops);
        }
        self.stencil_mask(api, face, desc.write_mask);
    }

    pub fn apply_rasterizer(&mut self, api: &mut impl GlStateApi, state: &RasterizerState) {
        match state.cull_mode {
            CullMode::None => self.set_capability(api, Capability::CullFace, false),
            mode => {
                self.set_capability(api, Capability::CullFace, true);
                let face = if mode == CullMode::Front { Face::Front } else { Face::Back };
                if changed(&mut self.cull_face, face, &mut self.elided) {
                    api.cull_face(face);
                }
            }
        }
        if changed(&mut self.front_face, state.winding, &mut self.elided) {
            api.front_face(state.winding);
        }
        self.set_capability(api, Capability::ScissorTest, state.scissor.is_some());
        if let Some(rect) = state.scissor {
            if changed(&mut self.scissor, rect, &mut self.elided) {
                api.scissor(rect);
            }
        }
    }

    /// Run `clear` with write masks opened for the requested buffers, then
    /// put back whatever masks were in effect before.
    pub fn clear<A: GlStateApi>(&mut self, api: &mut A, flags: TargetBufferFlags, clear: impl FnOnce(&mut A)) {
        let color = self.color_mask;
        let depth = self.depth_mask;
        let stencil = self.stencil_mask;

        if flags.intersects(TargetBufferFlags::COLOR_ALL) {
            self.color_mask(api, ColorWriteMask::ALL);
        }
        if flags.contains(TargetBufferFlags::DEPTH) {
            self.depth_mask(api, true);
        }
        if flags.contains(TargetBufferFlags::STENCIL) {
            self.stencil_mask(api, Face::Front, 0xff);
            self.stencil_mask(api, Face::Back, 0xff);
        }

        clear(api);

        if let Some(mask) = color {
            self.color_mask(api, mask);
        }
        if let Some(write) = depth {
            self.depth_mask(api, write);
        }
        for (face, mask) in [Face::Front, Face::Back].into_iter().zip(stencil) {
            if let Some(mask) = mask {
                self.stencil_mask(api, face, mask);
            }
        }
    }

    /// GL unbinds a deleted buffer from every target it was bound to.
    pub fn forget_buffer(&mut self, buffer: GlName) {
        for slot in self.buffers.values_mut().chain(self.buffer_bases.values_mut()) {
            if *slot == Some(Some(buffer)) {
                *slot = Some(None);
            }
        }
    }

    pub fn forget_texture(&mut self, texture: GlName) {
        for (_, bound) in self.textures.values_mut().flatten() {
            if *bound == Some(texture) {
                *bound = None;
            }
        }
    }

    pub fn forget_framebuffer(&mut self, framebuffer: GlName) {
        if self.framebuffer == Some(Some(framebuffer)) {
            self.framebuffer = Some(None);
        }
    }

    pub fn forget_program(&mut self, program: GlName) {
        if self.program == Some(Some(program)) {
            self.program = Some(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        BindBuffer(BufferTarget, Option<GlName>),
        ActiveTexture(u32),
        BindTexture(Option<GlName>),
        BindSampler(u32, Option<GlName>),
        UseProgram(Option<GlName>),
        Attrib(u32, bool),
        Capability(Capability, bool),
        DepthMask(bool),
        ColorMask(ColorWriteMask),
        Other(&'static str),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
    }

    impl GlStateApi for Recorder {
        fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<GlName>) {
            self.calls.push(Call::BindBuffer(target, buffer));
        }
        fn bind_buffer_base(&mut self, _: u32, _: Option<GlName>) {
            self.calls.push(Call::Other("bind_buffer_base"));
        }
        fn bind_framebuffer(&mut self, _: Option<GlName>) {
            self.calls.push(Call::Other("bind_framebuffer"));
        }
        fn active_texture(&mut self, unit: u32) {
            self.calls.push(Call::ActiveTexture(unit));
        }
        fn bind_texture(&mut self, _: TextureType, texture: Option<GlName>) {
            self.calls.push(Call::BindTexture(texture));
        }
        fn bind_sampler(&mut self, unit: u32, sampler: Option<GlName>) {
            self.calls.push(Call::BindSampler(unit, sampler));
        }
        fn use_program(&mut self, program: Option<GlName>) {
            self.calls.push(Call::UseProgram(program));
        }
        fn set_vertex_attrib_enabled(&mut self, index: u32, enabled: bool) {
            self.calls.push(Call::Attrib(index, enabled));
        }
        fn set_capability(&mut self, capability: Capability, enabled: bool) {
            self.calls.push(Call::Capability(capability, enabled));
        }
        fn cull_face(&mut self, _: Face) {
            self.calls.push(Call::Other("cull_face"));
        }
        fn front_face(&mut self, _: Winding) {
            self.calls.push(Call::Other("front_face"));
        }
        fn blend_equation(&mut self, _: BlendOp, _: BlendOp) {
            self.calls.push(Call::Other("blend_equation"));
        }
        fn blend_func(&mut self, _: [BlendFactor; 4]) {
            self.calls.push(Call::Other("blend_func"));
        }
        fn color_mask(&mut self, mask: ColorWriteMask) {
            self.calls.push(Call::ColorMask(mask));
        }
        fn depth_mask(&mut self, write: bool) {
            self.calls.push(Call::DepthMask(write));
        }
        fn depth_func(&mut self, _: CompareFunc) {
            self.calls.push(Call::Other("depth_func"));
        }
        fn stencil_func(&mut self, _: Face, _: CompareFunc, _: u32, _: u32) {
            self.calls.push(Call::Other("stencil_func"));
        }
        fn stencil_op(&mut self, _: Face, _: [StencilOp; 3]) {
            self.calls.push(Call::Other("stencil_op"));
        }
        fn stencil_mask(&mut self, _: Face, _: u32) {
            self.calls.push(Call::Other("stencil_mask"));
        }
        fn scissor(&mut self, _: ScissorRect) {
            self.calls.push(Call::Other("scissor"));
        }
        fn viewport(&mut self, _: Viewport) {
            self.calls.push(Call::Other("viewport"));
        }
    }

    fn name(n: u32) -> Option<GlName> {
        NonZeroU32::new(n)
    }

    #[test]
    fn redundant_binds_are_elided() {
        let (mut cache, mut gl) = (StateCache::new(), Recorder::default());
        cache.bind_buffer(&mut gl, BufferTarget::Array, name(3));
        cache.bind_buffer(&mut gl, BufferTarget::Array, name(3));
        cache.use_program(&mut gl, name(7));
        cache.use_program(&mut gl, name(7));
        assert_eq!(
            gl.calls,
            vec![
                Call::BindBuffer(BufferTarget::Array, name(3)),
                Call::UseProgram(name(7))
            ]
        );
        assert_eq!(cache.elided(), 2);
    }

    #[test]
    fn reset_forces_the_next_call() {
        let (mut cache, mut gl) = (StateCache::new(), Recorder::default());
        cache.use_program(&mut gl, name(7));
        cache.reset();
        cache.use_program(&mut gl, name(7));
        assert_eq!(gl.calls.len(), 2);
    }

    #[test]
    fn texture_units_switch_only_when_needed() {
        let (mut cache, mut gl) = (StateCache::new(), Recorder::default());
        cache.bind_texture(&mut gl, 0, TextureType::Texture2D, name(1));
        cache.bind_texture(&mut gl, 0, TextureType::Texture2D, name(2));
        cache.bind_texture(&mut gl, 0, TextureType::Texture2D, name(2));
        assert_eq!(
            gl.calls,
            vec![
                Call::ActiveTexture(0),
                Call::BindTexture(name(1)),
                Call::BindTexture(name(2))
            ]
        );
    }

    #[test]
    fn sampler_binds_skip_the_active_unit() {
        let (mut cache, mut gl) = (StateCache::new(), Recorder::default());
        cache.bind_sampler(&mut gl, 2, name(5));
        cache.bind_sampler(&mut gl, 2, name(5));
        cache.bind_sampler(&mut gl, 3, name(5));
        assert_eq!(
            gl.calls,
            vec![Call::BindSampler(2, name(5)), Call::BindSampler(3, name(5))]
        );
        assert_eq!(cache.elided(), 1);
    }

    #[test]
    fn clear_restores_a_disabled_depth_mask() {
        let (mut cache, mut gl) = (StateCache::new(), Recorder::default());
        cache.depth_mask(&mut gl, false);
        gl.calls.clear();
        cache.clear(&mut gl, TargetBufferFlags::DEPTH, |gl| gl.calls.push(Call::Other("clear")));
        assert_eq!(
            gl.calls,
            vec![Call::DepthMask(true), Call::Other("clear"), Call::DepthMask(false)]
        );
    }

    #[test]
    fn attribs_left_over_from_the_last_draw_are_disabled() {
        let (mut cache, mut gl) = (StateCache::new(), Recorder::default());
        cache.set_enabled_attribs(&mut gl, &[0, 1, 2]);
        gl.calls.clear();
        cache.set_enabled_attribs(&mut gl, &[0, 1]);
        assert_eq!(gl.calls, vec![Call::Attrib(2, false)]);
    }

    #[test]
    fn deleted_buffers_are_unbound() {
        let (mut cache, mut gl) = (StateCache::new(), Recorder::default());
        cache.bind_buffer(&mut gl, BufferTarget::Array, name(4));
        cache.forget_buffer(NonZeroU32::new(4).unwrap());
        cache.bind_buffer(&mut gl, BufferTarget::Array, name(4));
        assert_eq!(gl.calls.len(), 2);
    }

    #[test]
    fn disabled_blend_skips_factors() {
        let (mut cache, mut gl) = (StateCache::new(), Recorder::default());
        cache.apply_blend(&mut gl, &BlendDesc::default());
        assert_eq!(
            gl.calls,
            vec![
                Call::ColorMask(ColorWriteMask::ALL),
                Call::Capability(Capability::Blend, false)
            ]
        );
    }
}
