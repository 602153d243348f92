use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use glow::HasContext;

use super::state::{BufferTarget, Capability, Face, GlName, GlStateApi, StateCache};
use super::utils::{self as conv, feature_extension, GlVersion};
use crate::gpu::reflect::CodeKind;
use crate::gpu::{
    full_mip_chain, Backend, BlendDesc, BlendFactor, BlendOp, BufferDesc, BufferType, BufferUsage,
    Capabilities, ColorWriteMask, CompareFunc, DepthStencilDesc, Device, DeviceInfo, DrawCall,
    DrawKind, DriverConfig, FeatureType, GPUError, GlConfig, PixelBuffer, PixelFormat,
    ProgramLayout, RasterizerState, ReadSource, RenderPassDesc, Result, SamplerDesc, ScissorRect,
    ShaderContainer, ShaderStage, StencilOp, TargetBufferFlags, TextureDesc, TextureRegion,
    TextureType, VertexFormat, VertexLayout, Viewport, Winding, MAX_COLOR_ATTACHMENTS,
};
use crate::utils::lock;

const TEXTURE_MAX_ANISOTROPY_EXT: u32 = 0x84FE;
const ANISOTROPY_EXTENSION: &str = "GL_EXT_texture_filter_anisotropic";

/// A GL context made current on the render thread, plus the hook that
/// swaps its buffers.
pub struct GlSurface {
    pub context: glow::Context,
    pub present: Box<dyn FnMut() + Send>,
    pub width: u32,
    pub height: u32,
}

// SAFETY: the context is only used by the thread that created the driver,
// behind the driver lock.
unsafe impl Send for GlSurface {}

static SURFACE: Mutex<Option<GlSurface>> = Mutex::new(None);

/// Hand a context to the GL backend. Install one before creating the driver,
/// and a fresh one after a context loss before recovering.
pub fn install_surface(surface: GlSurface) {
    *lock(&SURFACE) = Some(surface);
}

fn take_surface() -> Option<GlSurface> {
    lock(&SURFACE).take()
}

pub struct GlBackend;

impl Backend for GlBackend {
    type Device = GlDevice;

    const NAME: &'static str = "gl";

    fn create_device(config: &DriverConfig) -> Result<GlDevice> {
        let surface = take_surface()
            .ok_or_else(|| GPUError::Device("no GL context installed, call install_surface first".into()))?;
        GlDevice::new(surface, config)
    }
}

struct Gl(glow::Context);

// SAFETY: see `GlSurface`.
unsafe impl Send for Gl {}

impl GlStateApi for Gl {
    fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<GlName>) {
        unsafe { self.0.bind_buffer(conv::buffer_target(target), buffer.map(glow::NativeBuffer)) }
    }

    fn bind_buffer_base(&mut self, index: u32, buffer: Option<GlName>) {
        unsafe { self.0.bind_buffer_base(glow::UNIFORM_BUFFER, index, buffer.map(glow::NativeBuffer)) }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<GlName>) {
        unsafe {
            self.0
                .bind_framebuffer(glow::FRAMEBUFFER, framebuffer.map(glow::NativeFramebuffer))
        }
    }

    fn active_texture(&mut self, unit: u32) {
        unsafe { self.0.active_texture(glow::TEXTURE0 + unit) }
    }

    fn bind_texture(&mut self, target: TextureType, texture: Option<GlName>) {
        unsafe {
            self.0
                .bind_texture(conv::texture_target(target), texture.map(glow::NativeTexture))
        }
    }

    fn bind_sampler(&mut self, unit: u32, sampler: Option<GlName>) {
        unsafe { self.0.bind_sampler(unit, sampler.map(glow::NativeSampler)) }
    }

    fn use_program(&mut self, program: Option<GlName>) {
        unsafe { self.0.use_program(program.map(glow::NativeProgram)) }
    }

    fn set_vertex_attrib_enabled(&mut self, index: u32, enabled: bool) {
        unsafe {
            if enabled {
                self.0.enable_vertex_attrib_array(index);
            } else {
                self.0.disable_vertex_attrib_array(index);
            }
        }
    }

    fn set_capability(&mut self, capability: Capability, enabled: bool) {
        let cap = conv::capability(capability);
        unsafe {
            if enabled {
                self.0.enable(cap);
            } else {
                self.0.disable(cap);
            }
        }
    }

    fn cull_face(&mut self, face: Face) {
        unsafe { self.0.cull_face(conv::face(face)) }
    }

    fn front_face(&mut self, winding: Winding) {
        unsafe { self.0.front_face(conv::winding(winding)) }
    }

    fn blend_equation(&mut self, rgb: BlendOp, alpha: BlendOp) {
        unsafe {
            self.0
                .blend_equation_separate(conv::blend_op(rgb), conv::blend_op(alpha))
        }
    }

    fn blend_func(&mut self, factors: [BlendFactor; 4]) {
        let [src_rgb, dst_rgb, src_alpha, dst_alpha] = factors.map(conv::blend_factor);
        unsafe { self.0.blend_func_separate(src_rgb, dst_rgb, src_alpha, dst_alpha) }
    }

    fn color_mask(&mut self, mask: ColorWriteMask) {
        unsafe {
            self.0.color_mask(
                mask.contains(ColorWriteMask::RED),
                mask.contains(ColorWriteMask::GREEN),
                mask.contains(ColorWriteMask::BLUE),
                mask.contains(ColorWriteMask::ALPHA),
            )
        }
    }

    fn depth_mask(&mut self, write: bool) {
        unsafe { self.0.depth_mask(write) }
    }

    fn depth_func(&mut self, func: CompareFunc) {
        unsafe { self.0.depth_func(conv::compare_func(func)) }
    }

    fn stencil_func(&mut self, face: Face, func: CompareFunc, reference: u32, mask: u32) {
        unsafe {
            self.0.stencil_func_separate(
                conv::face(face),
                conv::compare_func(func),
                reference as i32,
                mask,
            )
        }
    }

    fn stencil_op(&mut self, face: Face, ops: [StencilOp; 3]) {
        let [fail, depth_fail, pass] = ops.map(conv::stencil_op);
        unsafe { self.0.stencil_op_separate(conv::face(face), fail, depth_fail, pass) }
    }

    fn stencil_mask(&mut self, face: Face, mask: u32) {
        unsafe { self.0.stencil_mask_separate(conv::face(face), mask) }
    }

    fn scissor(&mut self, rect: ScissorRect) {
        unsafe { self.0.scissor(rect.x, rect.y, rect.width as i32, rect.height as i32) }
    }

    fn viewport(&mut self, viewport: Viewport) {
        unsafe {
            self.0
                .viewport(viewport.x, viewport.y, viewport.width as i32, viewport.height as i32)
        }
    }
}

pub struct GlBuffer {
    name: GlName,
    target: BufferTarget,
    size: usize,
}

/// Shared sampler object. `None` leaves the texture's own parameters in
/// effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlSampler(Option<GlName>);

pub struct GlTexture {
    name: GlName,
    ty: TextureType,
    format: PixelFormat,
    width: u32,
    height: u32,
    levels: u32,
}

impl GlTexture {
    fn target(&self) -> u32 {
        conv::texture_target(self.ty)
    }
}

pub struct GlShader {
    name: GlName,
    stage: ShaderStage,
}

/// Uniform buffer backing one reflected block.
struct BlockBuffer {
    fragment: bool,
    binding: u32,
    offset: usize,
    size: usize,
    buffer: GlName,
}

pub struct GlProgram {
    name: GlName,
    blocks: Vec<BlockBuffer>,
}

#[derive(Default)]
pub struct GlTargetViews {
    /// `None` when the framebuffer could not be created.
    framebuffer: Option<GlName>,
    colors: [bool; MAX_COLOR_ATTACHMENTS],
}

/// Everything queried from a fresh context.
struct Probe {
    version: GlVersion,
    info: DeviceInfo,
    caps: Capabilities,
    extensions: HashSet<String>,
    compressed: Vec<u32>,
}

impl Probe {
    fn run(gl: &glow::Context, config: &GlConfig) -> Result<Self> {
        let raw = unsafe { gl.get_parameter_string(glow::VERSION) };
        let version = GlVersion::parse(&raw)
            .ok_or_else(|| GPUError::Unsupported(format!("unrecognized GL version '{raw}'")))?;
        version
            .check_minimum(config, &raw)
            .map_err(GPUError::Unsupported)?;

        let info = unsafe {
            DeviceInfo {
                vendor: gl.get_parameter_string(glow::VENDOR),
                renderer: gl.get_parameter_string(glow::RENDERER),
                version: raw.clone(),
                shader_version: gl.get_parameter_string(glow::SHADING_LANGUAGE_VERSION),
            }
        };

        let compressed = unsafe {
            let count = gl.get_parameter_i32(glow::NUM_COMPRESSED_TEXTURE_FORMATS).max(0);
            let mut formats = vec![0i32; count as usize];
            if count > 0 {
                gl.get_parameter_i32_slice(glow::COMPRESSED_TEXTURE_FORMATS, &mut formats);
            }
            formats.into_iter().map(|f| f as u32).collect::<Vec<_>>()
        };

        let caps = unsafe {
            Capabilities {
                max_attributes: gl.get_parameter_i32(glow::MAX_VERTEX_ATTRIBS).max(0) as u32,
                max_texture_size: gl.get_parameter_i32(glow::MAX_TEXTURE_SIZE).max(0) as u32,
                max_texture_units: gl
                    .get_parameter_i32(glow::MAX_COMBINED_TEXTURE_IMAGE_UNITS)
                    .max(0) as u32,
                max_samples: gl.get_parameter_i32(glow::MAX_SAMPLES).max(1) as u32,
                compressed_formats: PixelFormat::ALL
                    .into_iter()
                    .filter(|f| f.is_compressed() && compressed.contains(&conv::pixel_format(*f).0))
                    .collect(),
            }
        };

        Ok(Self {
            version,
            info,
            caps,
            extensions: gl.supported_extensions().clone(),
            compressed,
        })
    }
}

pub struct GlDevice {
    gl: Gl,
    present: Box<dyn FnMut() + Send>,
    state: StateCache,
    config: GlConfig,
    probe: Probe,
    vao: Option<glow::NativeVertexArray>,
    /// Framebuffer used to read textures back.
    scratch: Option<GlName>,
    size: (u32, u32),
    lost: bool,
    /// `None` while the default framebuffer is bound.
    target: Option<GlName>,
    bound_units: Vec<(u32, TextureType)>,
    warned_wireframe: bool,
}

impl GlDevice {
    /// Wrap a current context. Contexts older than the configured minimum are
    /// rejected with [`GPUError::Unsupported`].
    pub fn new(surface: GlSurface, config: &DriverConfig) -> Result<Self> {
        let GlSurface {
            context,
            present,
            width,
            height,
        } = surface;
        let probe = Probe::run(&context, &config.gl)?;
        let mut device = Self {
            gl: Gl(context),
            present,
            state: StateCache::new(),
            config: config.gl.clone(),
            probe,
            vao: None,
            scratch: None,
            size: (width, height),
            lost: false,
            target: None,
            bound_units: Vec::new(),
            warned_wireframe: false,
        };
        device.init_context()?;
        Ok(device)
    }

    /// Calls the state cache dropped as redundant.
    pub fn elided_calls(&self) -> u64 {
        self.state.elided()
    }

    fn init_context(&mut self) -> Result<()> {
        self.state.reset();
        self.scratch = None;
        self.target = None;
        self.bound_units.clear();
        unsafe {
            self.gl.0.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            self.gl.0.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            let vao = self.gl.0.create_vertex_array().map_err(GPUError::Device)?;
            self.gl.0.bind_vertex_array(Some(vao));
            self.vao = Some(vao);
        }
        log::debug!(
            "GL context ready: {} ({} extensions)",
            self.probe.info.version,
            self.probe.extensions.len()
        );
        Ok(())
    }

    fn has_extension(&self, name: &str) -> bool {
        self.probe.extensions.contains(name)
    }

    fn scratch_framebuffer(&mut self) -> Result<GlName> {
        if let Some(fb) = self.scratch {
            return Ok(fb);
        }
        let fb = unsafe { self.gl.0.create_framebuffer() }.map_err(GPUError::Readback)?.0;
        self.scratch = Some(fb);
        Ok(fb)
    }

    /// Attach `attachment` to the bound framebuffer at `point`.
    fn attach(&mut self, point: u32, attachment: Option<(&GlTexture, u32)>) {
        unsafe {
            match attachment {
                Some((texture, level)) if texture.ty == TextureType::Texture2DArray => {
                    self.gl.0.framebuffer_texture_layer(
                        glow::FRAMEBUFFER,
                        point,
                        Some(glow::NativeTexture(texture.name)),
                        level as i32,
                        0,
                    );
                }
                Some((texture, level)) => self.gl.0.framebuffer_texture_2d(
                    glow::FRAMEBUFFER,
                    point,
                    conv::image_target(texture.ty, 0),
                    Some(glow::NativeTexture(texture.name)),
                    level as i32,
                ),
                None => {
                    self.gl
                        .0
                        .framebuffer_texture_2d(glow::FRAMEBUFFER, point, glow::TEXTURE_2D, None, 0)
                }
            }
        }
    }

    fn check_framebuffer(&self, framebuffer: GlName) {
        let status = unsafe { self.gl.0.check_framebuffer_status(glow::FRAMEBUFFER) };
        if status != glow::FRAMEBUFFER_COMPLETE {
            log::debug!("framebuffer {framebuffer} incomplete: 0x{status:04x}");
        }
    }

    /// Read the bound read framebuffer as RGBA8.
    fn read_bound(&mut self, x: i32, y: i32, width: u32, height: u32) -> Result<PixelBuffer> {
        self.state.bind_buffer(&mut self.gl, BufferTarget::PixelPack, None);
        let mut data = vec![0u8; width as usize * height as usize * 4];
        let error = unsafe {
            self.gl.0.read_pixels(
                x,
                y,
                width as i32,
                height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(&mut data),
            );
            self.gl.0.get_error()
        };
        if error != glow::NO_ERROR {
            return Err(GPUError::Readback(format!("glReadPixels failed with 0x{error:04x}")));
        }
        Ok(PixelBuffer {
            data,
            width,
            height,
        })
    }

    fn set_polygon_mode(&mut self, mode: u32) {
        unsafe { self.gl.0.polygon_mode(glow::FRONT_AND_BACK, mode) }
    }

}

fn buffer_target(ty: BufferType) -> BufferTarget {
    match ty {
        BufferType::Vertex => BufferTarget::Array,
        BufferType::Index => BufferTarget::ElementArray,
        BufferType::Uniform => BufferTarget::Uniform,
        BufferType::PixelPack => BufferTarget::PixelPack,
    }
}

impl Device for GlDevice {
    type Buffer = GlBuffer;
    type Texture = GlTexture;
    type Shader = GlShader;
    type Program = GlProgram;
    type TargetViews = GlTargetViews;
    type BlendState = BlendDesc;
    type DepthStencil = DepthStencilDesc;
    type Sampler = GlSampler;

    fn info(&self) -> DeviceInfo {
        self.probe.info.clone()
    }

    fn capabilities(&self) -> Capabilities {
        self.probe.caps.clone()
    }

    fn probe_feature(&mut self, feature: FeatureType) -> bool {
        match feature {
            FeatureType::Etc2 => self.probe.compressed.contains(&conv::COMPRESSED_RGBA8_ETC2_EAC),
            FeatureType::Astc => self.probe.compressed.contains(&conv::COMPRESSED_RGBA_ASTC_4X4_KHR),
            FeatureType::VertexAttribBinding => false,
            // Core in every accepted version.
            FeatureType::Vao => true,
            other => feature_extension(other, self.probe.version.es)
                .map_or(false, |ext| self.has_extension(ext)),
        }
    }

    fn bottom_up(&self) -> bool {
        true
    }

    fn create_buffer(&mut self, desc: &BufferDesc, data: Option<&[u8]>) -> Result<GlBuffer> {
        let target = buffer_target(desc.buffer_type);
        let usage = match desc.usage {
            BufferUsage::Static | BufferUsage::Immutable => glow::STATIC_DRAW,
            BufferUsage::Dynamic => glow::DYNAMIC_DRAW,
        };
        let name = unsafe { self.gl.0.create_buffer() }.map_err(GPUError::Device)?.0;
        self.state.bind_buffer(&mut self.gl, target, Some(name));
        let gl_target = conv::buffer_target(target);
        unsafe {
            match data {
                Some(data) if data.len() >= desc.size => {
                    self.gl
                        .0
                        .buffer_data_u8_slice(gl_target, &data[..desc.size], usage)
                }
                Some(data) => {
                    self.gl.0.buffer_data_size(gl_target, desc.size as i32, usage);
                    self.gl.0.buffer_sub_data_u8_slice(gl_target, 0, data);
                }
                None => self.gl.0.buffer_data_size(gl_target, desc.size as i32, usage),
            }
        }
        Ok(GlBuffer {
            name,
            target,
            size: desc.size,
        })
    }

    fn update_buffer(&mut self, buffer: &mut GlBuffer, offset: usize, data: &[u8]) {
        if offset + data.len() > buffer.size {
            log::error!("buffer {} update out of range", buffer.name);
            return;
        }
        self.state.bind_buffer(&mut self.gl, buffer.target, Some(buffer.name));
        unsafe {
            self.gl
                .0
                .buffer_sub_data_u8_slice(conv::buffer_target(buffer.target), offset as i32, data)
        }
    }

    fn destroy_buffer(&mut self, buffer: GlBuffer) {
        unsafe { self.gl.0.delete_buffer(glow::NativeBuffer(buffer.name)) };
        self.state.forget_buffer(buffer.name);
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<GlTexture> {
        let full = full_mip_chain(desc.width, desc.height);
        let levels = if desc.mip_levels == 0 {
            full
        } else {
            desc.mip_levels.min(full)
        };
        let name = unsafe { self.gl.0.create_texture() }.map_err(GPUError::Device)?.0;
        let texture = GlTexture {
            name,
            ty: desc.texture_type,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            levels,
        };
        self.state
            .bind_texture(&mut self.gl, 0, texture.ty, Some(texture.name));

        let target = texture.target();
        let (internal, format, ty) = conv::pixel_format(desc.format);
        unsafe {
            if !desc.format.is_compressed() {
                for level in 0..levels {
                    let w = (desc.width >> level).max(1) as i32;
                    let h = (desc.height >> level).max(1) as i32;
                    if desc.texture_type == TextureType::Texture2DArray {
                        self.gl.0.tex_image_3d(
                            target,
                            level as i32,
                            internal as i32,
                            w,
                            h,
                            desc.layer_count() as i32,
                            0,
                            format,
                            ty,
                            None,
                        );
                        continue;
                    }
                    for layer in 0..desc.layer_count() {
                        self.gl.0.tex_image_2d(
                            conv::image_target(desc.texture_type, layer),
                            level as i32,
                            internal as i32,
                            w,
                            h,
                            0,
                            format,
                            ty,
                            None,
                        );
                    }
                }
            }
            self.gl
                .0
                .tex_parameter_i32(target, glow::TEXTURE_MAX_LEVEL, levels as i32 - 1);
        }
        Ok(texture)
    }

    fn update_texture(&mut self, texture: &mut GlTexture, region: &TextureRegion, data: &[u8]) -> Result<()> {
        if region.level >= texture.levels {
            return Err(GPUError::InvalidData(format!(
                "texture {} has no level {}",
                texture.name, region.level
            )));
        }
        self.state
            .bind_texture(&mut self.gl, 0, texture.ty, Some(texture.name));
        let (internal, format, ty) = conv::pixel_format(texture.format);
        let (x, y) = (region.x as i32, region.y as i32);
        let (w, h) = (region.width as i32, region.height as i32);
        let level = region.level as i32;
        let array = texture.ty == TextureType::Texture2DArray;

        if region.compressed || texture.format.is_compressed() {
            if array {
                return Err(GPUError::Unsupported("compressed texture arrays".into()));
            }
            unsafe {
                self.gl.0.compressed_tex_image_2d(
                    conv::image_target(texture.ty, region.layer),
                    level,
                    internal as i32,
                    w,
                    h,
                    0,
                    data.len() as i32,
                    data,
                );
            }
            return Ok(());
        }

        unsafe {
            if array {
                self.gl.0.tex_sub_image_3d(
                    texture.target(),
                    level,
                    x,
                    y,
                    region.layer as i32,
                    w,
                    h,
                    1,
                    format,
                    ty,
                    glow::PixelUnpackData::Slice(data),
                );
            } else {
                self.gl.0.tex_sub_image_2d(
                    conv::image_target(texture.ty, region.layer),
                    level,
                    x,
                    y,
                    w,
                    h,
                    format,
                    ty,
                    glow::PixelUnpackData::Slice(data),
                );
            }
        }
        Ok(())
    }

    fn generate_mipmaps(&mut self, texture: &mut GlTexture) {
        self.state
            .bind_texture(&mut self.gl, 0, texture.ty, Some(texture.name));
        unsafe { self.gl.0.generate_mipmap(texture.target()) }
    }

    fn destroy_texture(&mut self, texture: GlTexture) {
        unsafe { self.gl.0.delete_texture(glow::NativeTexture(texture.name)) };
        self.state.forget_texture(texture.name);
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> GlSampler {
        let sampler = match unsafe { self.gl.0.create_sampler() } {
            Ok(sampler) => sampler,
            Err(err) => {
                log::error!("glGenSamplers failed, falling back to texture parameters: {err}");
                return GlSampler(None);
            }
        };
        // Every texture carries TEXTURE_MAX_LEVEL, so mip filters are safe on
        // single-level images.
        let anisotropy = self.has_extension(ANISOTROPY_EXTENSION) && desc.anisotropy > 1;
        unsafe {
            for (parameter, value) in conv::sampler_parameters(desc, true) {
                self.gl.0.sampler_parameter_i32(sampler, parameter, value);
            }
            if anisotropy {
                self.gl.0.sampler_parameter_f32(
                    sampler,
                    TEXTURE_MAX_ANISOTROPY_EXT,
                    f32::from(desc.anisotropy),
                );
            }
        }
        GlSampler(Some(sampler.0))
    }

    fn create_shader(&mut self, container: &ShaderContainer) -> Result<GlShader> {
        let kind = match container.stage {
            ShaderStage::Vertex => glow::VERTEX_SHADER,
            ShaderStage::Fragment => glow::FRAGMENT_SHADER,
            ShaderStage::Compute => {
                return Err(GPUError::ShaderCompile("compute shaders need GL 4.3".into()))
            }
        };
        if container.kind == CodeKind::Binary {
            return Err(GPUError::ShaderCompile(
                "precompiled shader binaries are not accepted by the GL device".into(),
            ));
        }
        let source = std::str::from_utf8(&container.code)
            .map_err(|e| GPUError::ShaderCompile(format!("0:0: error: {e}")))?;
        if source.trim().is_empty() {
            return Err(GPUError::ShaderCompile("0:0: error: empty translation unit".into()));
        }
        unsafe {
            let shader = self.gl.0.create_shader(kind).map_err(GPUError::ShaderCompile)?;
            self.gl.0.shader_source(shader, source);
            self.gl.0.compile_shader(shader);
            if !self.gl.0.get_shader_compile_status(shader) {
                let log = self.gl.0.get_shader_info_log(shader);
                self.gl.0.delete_shader(shader);
                return Err(GPUError::ShaderCompile(log));
            }
            Ok(GlShader {
                name: shader.0,
                stage: container.stage,
            })
        }
    }

    fn destroy_shader(&mut self, shader: GlShader) {
        unsafe { self.gl.0.delete_shader(glow::NativeShader(shader.name)) }
    }

    fn create_program(
        &mut self,
        vertex: &GlShader,
        fragment: &GlShader,
        layout: &Arc<ProgramLayout>,
    ) -> Result<GlProgram> {
        if vertex.stage != ShaderStage::Vertex || fragment.stage != ShaderStage::Fragment {
            return Err(GPUError::ProgramLink(format!(
                "cannot link {:?} with {:?}",
                vertex.stage, fragment.stage
            )));
        }
        let program = unsafe {
            let program = self.gl.0.create_program().map_err(GPUError::ProgramLink)?;
            let shaders = [glow::NativeShader(vertex.name), glow::NativeShader(fragment.name)];
            for shader in shaders {
                self.gl.0.attach_shader(program, shader);
            }
            for (name, input) in layout.vertex().vertex_inputs() {
                if input.location >= 0 {
                    self.gl.0.bind_attrib_location(program, input.location as u32, name);
                }
            }
            self.gl.0.link_program(program);
            for shader in shaders {
                self.gl.0.detach_shader(program, shader);
            }
            if !self.gl.0.get_program_link_status(program) {
                let log = self.gl.0.get_program_info_log(program);
                self.gl.0.delete_program(program);
                return Err(GPUError::ProgramLink(log));
            }
            program
        };

        self.state.use_program(&mut self.gl, Some(program.0));
        let mut blocks: Vec<BlockBuffer> = Vec::new();
        for module in [layout.vertex(), layout.fragment()] {
            let fragment = module.stage() == ShaderStage::Fragment;
            for block in module.blocks() {
                let binding = block.binding.max(0) as u32;
                if blocks.iter().any(|b| b.binding == binding) {
                    continue;
                }
                let buffer = unsafe {
                    if let Some(index) = self.gl.0.get_uniform_block_index(program, &block.name) {
                        self.gl.0.uniform_block_binding(program, index, binding);
                    }
                    self.gl.0.create_buffer().map_err(GPUError::Device)?.0
                };
                self.state.bind_buffer(&mut self.gl, BufferTarget::Uniform, Some(buffer));
                unsafe {
                    self.gl
                        .0
                        .buffer_data_size(glow::UNIFORM_BUFFER, block.size as i32, glow::DYNAMIC_DRAW)
                };
                blocks.push(BlockBuffer {
                    fragment,
                    binding,
                    offset: block.offset as usize,
                    size: block.size as usize,
                    buffer,
                });
            }
            for slot in module.textures() {
                unsafe {
                    if let Some(location) = self.gl.0.get_uniform_location(program, &slot.name) {
                        self.gl.0.uniform_1_i32(Some(&location), slot.binding as i32);
                    }
                }
            }
        }
        Ok(GlProgram {
            name: program.0,
            blocks,
        })
    }

    fn destroy_program(&mut self, program: GlProgram) {
        for block in program.blocks {
            unsafe { self.gl.0.delete_buffer(glow::NativeBuffer(block.buffer)) };
            self.state.forget_buffer(block.buffer);
        }
        unsafe { self.gl.0.delete_program(glow::NativeProgram(program.name)) };
        self.state.forget_program(program.name);
    }

    fn create_target_views(&mut self) -> GlTargetViews {
        match unsafe { self.gl.0.create_framebuffer() } {
            Ok(fb) => GlTargetViews {
                framebuffer: Some(fb.0),
                ..Default::default()
            },
            Err(err) => {
                log::error!("cannot create framebuffer: {err}");
                GlTargetViews::default()
            }
        }
    }

    fn update_color_view(&mut self, views: &mut GlTargetViews, index: usize, attachment: Option<(&GlTexture, u32)>) {
        let Some(fb) = views.framebuffer else {
            return;
        };
        if index >= MAX_COLOR_ATTACHMENTS {
            return;
        }
        self.state.bind_framebuffer(&mut self.gl, Some(fb));
        self.attach(glow::COLOR_ATTACHMENT0 + index as u32, attachment);
        views.colors[index] = attachment.is_some();
        let draw_buffers: Vec<u32> = views
            .colors
            .iter()
            .enumerate()
            .map(|(i, on)| {
                if *on {
                    glow::COLOR_ATTACHMENT0 + i as u32
                } else {
                    glow::NONE
                }
            })
            .collect();
        unsafe { self.gl.0.draw_buffers(&draw_buffers) };
        self.check_framebuffer(fb);
        self.state.bind_framebuffer(&mut self.gl, self.target);
    }

    fn update_depth_stencil_view(&mut self, views: &mut GlTargetViews, attachment: Option<(&GlTexture, u32)>) {
        let Some(fb) = views.framebuffer else {
            return;
        };
        self.state.bind_framebuffer(&mut self.gl, Some(fb));
        self.attach(glow::DEPTH_STENCIL_ATTACHMENT, attachment);
        self.check_framebuffer(fb);
        self.state.bind_framebuffer(&mut self.gl, self.target);
    }

    fn destroy_target_views(&mut self, views: GlTargetViews) {
        let Some(fb) = views.framebuffer else {
            return;
        };
        if self.target == Some(fb) {
            self.target = None;
        }
        unsafe { self.gl.0.delete_framebuffer(glow::NativeFramebuffer(fb)) };
        self.state.forget_framebuffer(fb);
    }

    fn bind_target(&mut self, views: Option<&GlTargetViews>) {
        self.target = views.and_then(|v| v.framebuffer);
        self.state.bind_framebuffer(&mut self.gl, self.target);
    }

    fn clear(&mut self, flags: TargetBufferFlags, desc: &RenderPassDesc) {
        let colors: Vec<u32> = if self.target.is_none() {
            flags.has_color(0).then_some(0).into_iter().collect()
        } else {
            (0..MAX_COLOR_ATTACHMENTS)
                .filter(|i| flags.has_color(*i))
                .map(|i| i as u32)
                .collect()
        };
        let depth = flags.contains(TargetBufferFlags::DEPTH);
        let stencil = flags.contains(TargetBufferFlags::STENCIL);
        self.state.clear(&mut self.gl, flags, |gl| unsafe {
            for buffer in colors {
                gl.0.clear_buffer_f32_slice(glow::COLOR, buffer, &desc.clear_color);
            }
            match (depth, stencil) {
                (true, true) => gl.0.clear_buffer_depth_stencil(
                    glow::DEPTH_STENCIL,
                    0,
                    desc.clear_depth,
                    desc.clear_stencil as i32,
                ),
                (true, false) => gl.0.clear_buffer_f32_slice(glow::DEPTH, 0, &[desc.clear_depth]),
                (false, true) => {
                    gl.0.clear_buffer_i32_slice(glow::STENCIL, 0, &[desc.clear_stencil as i32])
                }
                (false, false) => {}
            }
        });
    }

    fn create_blend_state(&mut self, desc: &BlendDesc) -> BlendDesc {
        *desc
    }

    fn apply_blend_state(&mut self, state: &BlendDesc) {
        self.state.apply_blend(&mut self.gl, state);
    }

    fn create_depth_stencil_state(&mut self, desc: &DepthStencilDesc) -> DepthStencilDesc {
        *desc
    }

    fn apply_depth_stencil_state(&mut self, state: Option<&DepthStencilDesc>, stencil_ref: u32) {
        self.state.apply_depth_stencil(&mut self.gl, state, stencil_ref);
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.state.viewport(&mut self.gl, *viewport);
    }

    fn apply_rasterizer_state(&mut self, state: &RasterizerState) {
        self.state.apply_rasterizer(&mut self.gl, state);
    }

    fn bind_program(&mut self, program: &GlProgram) {
        self.state.use_program(&mut self.gl, Some(program.name));
        for block in &program.blocks {
            self.state
                .bind_buffer_base(&mut self.gl, block.binding, Some(block.buffer));
        }
    }

    fn bind_vertex_input(&mut self, layout: &VertexLayout, vertex: &GlBuffer, instance: Option<&GlBuffer>) {
        let mut enabled = Vec::new();
        for attr in layout.attributes() {
            let (buffer, stride) = if attr.is_instanced() {
                match instance {
                    Some(buffer) => (buffer, layout.instance_stride()),
                    None => {
                        log::warn!("instanced attribute '{}' without an instance buffer", attr.name);
                        continue;
                    }
                }
            } else {
                (vertex, layout.vertex_stride())
            };
            self.state
                .bind_buffer(&mut self.gl, BufferTarget::Array, Some(buffer.name));
            let (components, ty) = conv::vertex_format(attr.format);
            let integer = ty == glow::INT && !attr.normalized;
            for slot in 0..attr.format.location_slots() {
                let location = attr.location + slot;
                // Matrix columns are consecutive vec4s.
                let offset = (attr.offset + slot * VertexFormat::Float4.size()) as i32;
                unsafe {
                    if integer {
                        self.gl
                            .0
                            .vertex_attrib_pointer_i32(location, components, ty, stride as i32, offset);
                    } else {
                        self.gl.0.vertex_attrib_pointer_f32(
                            location,
                            components,
                            ty,
                            attr.normalized,
                            stride as i32,
                            offset,
                        );
                    }
                    self.gl
                        .0
                        .vertex_attrib_divisor(location, u32::from(attr.instance_step_rate));
                }
                enabled.push(location);
            }
        }
        self.state.set_enabled_attribs(&mut self.gl, &enabled);
    }

    fn upload_uniforms(&mut self, program: &mut GlProgram, vertex: &[u8], fragment: &[u8]) {
        for block in &program.blocks {
            let source = if block.fragment { fragment } else { vertex };
            let Some(bytes) = source.get(block.offset..block.offset + block.size) else {
                log::warn!("uniform block at binding {} lies outside the uniform data", block.binding);
                continue;
            };
            self.state
                .bind_buffer(&mut self.gl, BufferTarget::Uniform, Some(block.buffer));
            unsafe { self.gl.0.buffer_sub_data_u8_slice(glow::UNIFORM_BUFFER, 0, bytes) };
        }
    }

    fn bind_texture(&mut self, _program: &GlProgram, slot: u32, texture: &GlTexture, sampler: &GlSampler) {
        self.state
            .bind_texture(&mut self.gl, slot, texture.ty, Some(texture.name));
        self.state.bind_sampler(&mut self.gl, slot, sampler.0);
        if !self.bound_units.iter().any(|(unit, _)| *unit == slot) {
            self.bound_units.push((slot, texture.ty));
        }
    }

    fn draw(&mut self, call: &DrawCall<'_, GlBuffer>) {
        if call.instance_count == 0 {
            return;
        }
        let mode = conv::primitive(call.primitive);
        let instances = call.instance_count as i32;
        let wireframe = call.wireframe && !self.probe.version.es;
        if call.wireframe && self.probe.version.es && !self.warned_wireframe {
            log::warn!("wireframe is unavailable on OpenGL ES, drawing filled");
            self.warned_wireframe = true;
        }
        if wireframe {
            self.set_polygon_mode(glow::LINE);
        }
        match &call.kind {
            DrawKind::Arrays { start, count } => unsafe {
                if instances > 1 {
                    self.gl
                        .0
                        .draw_arrays_instanced(mode, *start as i32, *count as i32, instances);
                } else {
                    self.gl.0.draw_arrays(mode, *start as i32, *count as i32);
                }
            },
            DrawKind::Elements {
                index_buffer,
                format,
                count,
                offset,
            } => {
                self.state
                    .bind_buffer(&mut self.gl, BufferTarget::ElementArray, Some(index_buffer.name));
                let ty = conv::index_type(*format);
                unsafe {
                    if instances > 1 {
                        self.gl.0.draw_elements_instanced(
                            mode,
                            *count as i32,
                            ty,
                            *offset as i32,
                            instances,
                        );
                    } else {
                        self.gl.0.draw_elements(mode, *count as i32, ty, *offset as i32);
                    }
                }
            }
        }
        if wireframe {
            self.set_polygon_mode(glow::FILL);
        }
    }

    fn end_pass(&mut self) {
        for (unit, ty) in self.bound_units.drain(..) {
            self.state.bind_texture(&mut self.gl, unit, ty, None);
            self.state.bind_sampler(&mut self.gl, unit, None);
        }
    }

    fn begin_frame(&mut self) -> Result<()> {
        if self.lost {
            return Err(GPUError::DeviceLost("GL context lost".into()));
        }
        Ok(())
    }

    fn present(&mut self) -> Result<()> {
        if self.lost {
            return Err(GPUError::DeviceLost("GL context lost".into()));
        }
        (self.present)();
        let error = unsafe { self.gl.0.get_error() };
        if error == glow::CONTEXT_LOST {
            log::error!("GL context lost at present");
            self.lost = true;
            return Err(GPUError::DeviceLost("GL context lost".into()));
        }
        if error != glow::NO_ERROR {
            log::warn!("GL error 0x{error:04x} pending at present");
        }
        Ok(())
    }

    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()> {
        // The window system owns the default framebuffer.
        self.size = (width, height);
        Ok(())
    }

    fn swap_chain_size(&self) -> (u32, u32) {
        self.size
    }

    fn read_pixels(&mut self, source: ReadSource<'_, GlTexture>) -> Result<PixelBuffer> {
        match source {
            ReadSource::Backbuffer(rect) => {
                self.state.bind_framebuffer(&mut self.gl, None);
                let result = self.read_bound(rect.x, rect.y, rect.width, rect.height);
                self.state.bind_framebuffer(&mut self.gl, self.target);
                result
            }
            ReadSource::Texture(texture, level) => {
                if texture.format.is_depth() {
                    return Err(GPUError::Readback("depth attachments cannot be read back".into()));
                }
                if level >= texture.levels {
                    return Err(GPUError::Readback(format!("texture {} has no level {level}", texture.name)));
                }
                let fb = self.scratch_framebuffer()?;
                self.state.bind_framebuffer(&mut self.gl, Some(fb));
                self.attach(glow::COLOR_ATTACHMENT0, Some((texture, level)));
                let width = (texture.width >> level).max(1);
                let height = (texture.height >> level).max(1);
                let result = self.read_bound(0, 0, width, height);
                self.attach(glow::COLOR_ATTACHMENT0, None);
                self.state.bind_framebuffer(&mut self.gl, self.target);
                result
            }
        }
    }

    fn is_lost(&self) -> bool {
        self.lost
    }

    fn recreate(&mut self) -> Result<()> {
        let surface = take_surface().ok_or_else(|| {
            GPUError::DeviceLost("no replacement GL context installed".into())
        })?;
        let probe = Probe::run(&surface.context, &self.config)?;
        // Names from the lost context are gone with it.
        self.gl = Gl(surface.context);
        self.present = surface.present;
        self.size = (surface.width, surface.height);
        self.probe = probe;
        self.init_context()?;
        self.lost = false;
        log::info!("GL device recreated on {}", self.probe.info.renderer);
        Ok(())
    }

    fn reset_state(&mut self) {
        self.state.reset();
        self.target = None;
        self.bound_units.clear();
        unsafe { self.gl.0.bind_vertex_array(self.vao) };
    }
}
