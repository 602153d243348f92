//! CPU reference device. Everything renders into RGBA8 images held in host
//! memory, which makes it the default backend for headless use and tests.

mod raster;
mod shading;

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Mutex};

use raster::{Image, Pipeline, Surface, Vertex};
use shading::{FragmentStage, Sampled, VertexInput};

use super::{
    full_mip_chain, Backend, BlendDesc, BufferDesc, Capabilities, DepthStencilDesc, Device,
    DeviceInfo, DrawCall, DrawKind, DriverConfig, FeatureType, GPUError, IndexFormat, PixelBuffer,
    PixelFormat, PrimitiveType, ProgramLayout, RasterizerState, ReadSource, RenderPassDesc, Result,
    SamplerDesc, ShaderContainer, ShaderStage, SoftConfig, TextureDesc, TextureRegion,
    TargetBufferFlags, Uniform, VertexLayout, Viewport, MAX_COLOR_ATTACHMENTS,
};
use crate::gpu::reflect::CodeKind;
use crate::utils::lock;

pub struct SoftBackend;

impl Backend for SoftBackend {
    type Device = SoftDevice;

    const NAME: &'static str = "soft";

    fn create_device(config: &DriverConfig) -> Result<SoftDevice> {
        Ok(SoftDevice::new(config))
    }
}

/// Counters the device keeps about the work it was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub textures_created: usize,
    pub textures_destroyed: usize,
    pub shaders_created: usize,
    pub shaders_destroyed: usize,
    pub programs_created: usize,
    pub programs_destroyed: usize,
    pub targets_created: usize,
    pub targets_destroyed: usize,
    /// Destroy calls for objects that were already gone.
    pub double_destroys: usize,
    pub color_view_rebuilds: usize,
    pub depth_stencil_view_rebuilds: usize,
    pub blend_states_created: usize,
    pub depth_stencil_states_created: usize,
    pub samplers_created: usize,
    pub rasterizer_applies: usize,
    pub clears: usize,
    pub draws: usize,
    pub frames: usize,
    pub presents: usize,
    pub recreations: usize,
    pub last_blend_state: Option<u64>,
    pub last_depth_stencil_state: Option<u64>,
}

impl SoftStats {
    pub fn created(&self) -> usize {
        self.buffers_created
            + self.textures_created
            + self.shaders_created
            + self.programs_created
            + self.targets_created
    }

    pub fn destroyed(&self) -> usize {
        self.buffers_destroyed
            + self.textures_destroyed
            + self.shaders_destroyed
            + self.programs_destroyed
            + self.targets_destroyed
    }
}

pub struct SoftBuffer {
    id: u64,
    data: Vec<u8>,
}

impl SoftBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

struct TextureStorage {
    format: PixelFormat,
    /// Indexed by layer, then mip level.
    layers: Vec<Vec<Image>>,
}

impl TextureStorage {
    fn image_mut(&mut self, layer: u32, level: u32) -> Option<&mut Image> {
        self.layers.get_mut(layer as usize)?.get_mut(level as usize)
    }
}

pub struct SoftTexture {
    id: u64,
    storage: Arc<Mutex<TextureStorage>>,
}

impl SoftTexture {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct SoftShader {
    id: u64,
    stage: ShaderStage,
}

pub struct SoftProgram {
    id: u64,
    layout: Arc<ProgramLayout>,
    vertex_uniforms: Vec<u8>,
    fragment_uniforms: Vec<u8>,
}

impl SoftProgram {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Uniform bytes last uploaded for the vertex and fragment stage.
    pub fn uniforms(&self) -> (&[u8], &[u8]) {
        (&self.vertex_uniforms, &self.fragment_uniforms)
    }
}

/// Mip level of a texture attached to a target.
#[derive(Clone)]
struct View {
    storage: Arc<Mutex<TextureStorage>>,
    level: u32,
}

impl View {
    fn new(texture: &SoftTexture, level: u32) -> Self {
        Self {
            storage: texture.storage.clone(),
            level,
        }
    }

    fn with_image<R>(&self, f: impl FnOnce(&mut Image) -> R) -> Option<R> {
        let mut storage = lock(&self.storage);
        storage.image_mut(0, self.level).map(f)
    }

    fn take(&self) -> Image {
        self.with_image(mem::take).unwrap_or_default()
    }

    fn put(&self, image: Image) {
        if !image.is_empty() {
            self.with_image(|slot| *slot = image);
        }
    }
}

#[derive(Clone, Default)]
pub struct SoftTargetViews {
    id: u64,
    colors: [Option<View>; MAX_COLOR_ATTACHMENTS],
    depth_stencil: Option<View>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoftBlendState {
    pub id: u64,
    pub desc: BlendDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoftDepthStencil {
    pub id: u64,
    pub desc: DepthStencilDesc,
}

struct Backbuffer {
    color: Image,
    depth: Image,
}

impl Backbuffer {
    fn new(width: u32, height: u32) -> Self {
        Self {
            color: Image::color(width, height),
            depth: Image::depth_stencil(width, height),
        }
    }
}

pub struct SoftDevice {
    config: SoftConfig,
    stats: SoftStats,
    next_id: u64,
    live: HashSet<u64>,
    lost: bool,
    failing_allocations: u32,
    backbuffer: Backbuffer,
    /// `None` while the backbuffer is bound.
    target: Option<SoftTargetViews>,
    viewport: Viewport,
    raster: RasterizerState,
    blend: Option<BlendDesc>,
    depth_stencil: Option<DepthStencilDesc>,
    stencil_ref: u32,
    program: Option<Arc<ProgramLayout>>,
    uniforms: (Vec<u8>, Vec<u8>),
    vertex_input: Option<VertexInput>,
    units: HashMap<u32, (Arc<Mutex<TextureStorage>>, SamplerDesc)>,
}

impl SoftDevice {
    pub fn new(config: &DriverConfig) -> Self {
        let (width, height) = (config.surface.width, config.surface.height);
        log::debug!("software device with a {width}x{height} backbuffer");
        Self {
            config: config.soft.clone(),
            stats: SoftStats::default(),
            next_id: 1,
            live: HashSet::new(),
            lost: false,
            failing_allocations: 0,
            backbuffer: Backbuffer::new(width, height),
            target: None,
            viewport: Viewport {
                x: 0,
                y: 0,
                width,
                height,
            },
            raster: RasterizerState::default(),
            blend: None,
            depth_stencil: None,
            stencil_ref: 0,
            program: None,
            uniforms: (Vec::new(), Vec::new()),
            vertex_input: None,
            units: HashMap::new(),
        }
    }

    pub fn stats(&self) -> &SoftStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SoftStats::default();
    }

    /// Number of native objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.live.len()
    }

    /// Make the next present and every later frame fail as if the GPU had
    /// been removed, until [`Device::recreate`] runs.
    pub fn simulate_device_loss(&mut self) {
        log::warn!("simulating device loss");
        self.lost = true;
    }

    /// Make the next `count` buffer or texture creations fail.
    pub fn fail_next_allocations(&mut self, count: u32) {
        self.failing_allocations = count;
    }

    fn check_allocation(&mut self) -> Result<()> {
        if self.failing_allocations > 0 {
            self.failing_allocations -= 1;
            return Err(GPUError::Device("simulated allocation failure".into()));
        }
        Ok(())
    }

    fn alloc(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn track(&mut self) -> u64 {
        let id = self.alloc();
        self.live.insert(id);
        id
    }

    /// Returns false on a double destroy.
    fn retire(&mut self, id: u64, kind: &str) -> bool {
        if self.live.remove(&id) {
            return true;
        }
        log::error!("{kind} {id} destroyed twice");
        self.stats.double_destroys += 1;
        false
    }
}

fn read_indices(data: &[u8], format: IndexFormat, count: u32, offset: usize) -> Vec<u32> {
    let size = format.size();
    let Some(bytes) = data.get(offset..) else {
        return Vec::new();
    };
    bytes
        .chunks_exact(size)
        .take(count as usize)
        .map(|c| match format {
            IndexFormat::UShort => u32::from(u16::from_le_bytes([c[0], c[1]])),
            IndexFormat::UInt => u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
        })
        .collect()
}

fn take_surface(target: Option<&SoftTargetViews>, backbuffer: &mut Backbuffer) -> Surface {
    match target {
        None => Surface {
            colors: vec![mem::take(&mut backbuffer.color)],
            depth: Some(mem::take(&mut backbuffer.depth)),
        },
        Some(views) => Surface {
            colors: views
                .colors
                .iter()
                .map(|view| view.as_ref().map(View::take).unwrap_or_default())
                .collect(),
            depth: views.depth_stencil.as_ref().map(View::take),
        },
    }
}

fn restore_surface(target: Option<&SoftTargetViews>, backbuffer: &mut Backbuffer, surface: Surface) {
    let Surface { colors, depth } = surface;
    match target {
        None => {
            if let Some(color) = colors.into_iter().next() {
                backbuffer.color = color;
            }
            if let Some(depth) = depth {
                backbuffer.depth = depth;
            }
        }
        Some(views) => {
            for (view, image) in views.colors.iter().zip(colors) {
                if let Some(view) = view {
                    view.put(image);
                }
            }
            if let (Some(view), Some(image)) = (views.depth_stencil.as_ref(), depth) {
                view.put(image);
            }
        }
    }
}

fn fill(p: &Pipeline, surface: &mut Surface, wireframe: bool, v: [&Vertex; 3]) {
    if wireframe {
        raster::line(p, surface, v[0], v[1]);
        raster::line(p, surface, v[1], v[2]);
        raster::line(p, surface, v[2], v[0]);
    } else {
        raster::triangle(p, surface, v);
    }
}

/// Split transformed vertices into primitives and rasterize them. Any
/// primitive touching a vertex behind the eye is dropped.
fn assemble(p: &Pipeline, surface: &mut Surface, primitive: PrimitiveType, wireframe: bool, v: &[Option<Vertex>]) {
    match primitive {
        PrimitiveType::Point => {
            for vertex in v.iter().flatten() {
                raster::point(p, surface, vertex);
            }
        }
        PrimitiveType::Line => {
            for pair in v.chunks_exact(2) {
                if let [Some(a), Some(b)] = pair {
                    raster::line(p, surface, a, b);
                }
            }
        }
        PrimitiveType::LineStrip | PrimitiveType::LineLoop => {
            for pair in v.windows(2) {
                if let [Some(a), Some(b)] = pair {
                    raster::line(p, surface, a, b);
                }
            }
            if primitive == PrimitiveType::LineLoop && v.len() > 2 {
                if let (Some(Some(last)), Some(Some(first))) = (v.last(), v.first()) {
                    raster::line(p, surface, last, first);
                }
            }
        }
        PrimitiveType::Triangle => {
            for tri in v.chunks_exact(3) {
                if let [Some(a), Some(b), Some(c)] = tri {
                    fill(p, surface, wireframe, [a, b, c]);
                }
            }
        }
        PrimitiveType::TriangleStrip => {
            for (i, tri) in v.windows(3).enumerate() {
                if let [Some(a), Some(b), Some(c)] = tri {
                    // Odd triangles swap to keep a consistent winding.
                    let order = if i % 2 == 0 { [a, b, c] } else { [b, a, c] };
                    fill(p, surface, wireframe, order);
                }
            }
        }
    }
}

impl Device for SoftDevice {
    type Buffer = SoftBuffer;
    type Texture = SoftTexture;
    type Shader = SoftShader;
    type Program = SoftProgram;
    type TargetViews = SoftTargetViews;
    type BlendState = SoftBlendState;
    type DepthStencil = SoftDepthStencil;
    type Sampler = SamplerDesc;

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            vendor: "rhi".into(),
            renderer: "software rasterizer".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            shader_version: "fixed-function".into(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_attributes: 16,
            max_texture_size: self.config.max_texture_size,
            max_texture_units: 16,
            max_samples: self.config.max_samples,
            compressed_formats: PixelFormat::ALL
                .into_iter()
                .filter(|f| f.is_compressed())
                .filter(|f| {
                    super::format::format_info(*f)
                        .feature
                        .map_or(false, |feature| self.config.features.contains(&feature))
                })
                .collect(),
        }
    }

    fn probe_feature(&mut self, feature: FeatureType) -> bool {
        self.config.features.contains(&feature)
    }

    fn bottom_up(&self) -> bool {
        true
    }

    fn create_buffer(&mut self, desc: &BufferDesc, data: Option<&[u8]>) -> Result<SoftBuffer> {
        self.check_allocation()?;
        let mut contents = vec![0; desc.size];
        if let Some(data) = data {
            let n = data.len().min(desc.size);
            contents[..n].copy_from_slice(&data[..n]);
        }
        self.stats.buffers_created += 1;
        Ok(SoftBuffer {
            id: self.track(),
            data: contents,
        })
    }

    fn update_buffer(&mut self, buffer: &mut SoftBuffer, offset: usize, data: &[u8]) {
        match buffer.data.get_mut(offset..offset + data.len()) {
            Some(dst) => dst.copy_from_slice(data),
            None => log::error!("buffer {} update out of range", buffer.id),
        }
    }

    fn destroy_buffer(&mut self, buffer: SoftBuffer) {
        if self.retire(buffer.id, "buffer") {
            self.stats.buffers_destroyed += 1;
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<SoftTexture> {
        self.check_allocation()?;
        let full = full_mip_chain(desc.width, desc.height);
        let levels = if desc.mip_levels == 0 {
            full
        } else {
            desc.mip_levels.min(full)
        };
        let depth = desc.format.is_depth();
        let layers = (0..desc.layer_count())
            .map(|_| {
                (0..levels)
                    .map(|level| {
                        let w = (desc.width >> level).max(1);
                        let h = (desc.height >> level).max(1);
                        if depth {
                            Image::depth_stencil(w, h)
                        } else {
                            Image::color(w, h)
                        }
                    })
                    .collect()
            })
            .collect();
        self.stats.textures_created += 1;
        Ok(SoftTexture {
            id: self.track(),
            storage: Arc::new(Mutex::new(TextureStorage {
                format: desc.format,
                layers,
            })),
        })
    }

    fn update_texture(&mut self, texture: &mut SoftTexture, region: &TextureRegion, data: &[u8]) -> Result<()> {
        let mut storage = lock(&texture.storage);
        let format = storage.format;
        let image = storage
            .image_mut(region.layer, region.level)
            .ok_or_else(|| {
                GPUError::InvalidData(format!(
                    "texture {} has no layer {} level {}",
                    texture.id, region.layer, region.level
                ))
            })?;
        if region.compressed || format.is_compressed() {
            // Block formats are accepted but not decoded; they sample as black.
            log::trace!("texture {}: {} compressed bytes kept opaque", texture.id, data.len());
            return Ok(());
        }
        if !region.fits(image.width, image.height) {
            return Err(GPUError::InvalidData(format!(
                "region {}x{} at ({}, {}) exceeds {}x{} level",
                region.width, region.height, region.x, region.y, image.width, image.height
            )));
        }

        let (w, stride) = (region.width as usize, image.width as usize);
        let texels = w * region.height as usize;
        if format.is_depth() {
            let (depth, stencil) = shading::unpack_depth_stencil(data, texels);
            for row in 0..region.height as usize {
                let dst = (region.y as usize + row) * stride + region.x as usize;
                image.depth[dst..dst + w].copy_from_slice(&depth[row * w..(row + 1) * w]);
                image.stencil[dst..dst + w].copy_from_slice(&stencil[row * w..(row + 1) * w]);
            }
        } else {
            let rgba = shading::to_rgba8(format, data, texels);
            for row in 0..region.height as usize {
                let dst = ((region.y as usize + row) * stride + region.x as usize) * 4;
                image.color[dst..dst + w * 4].copy_from_slice(&rgba[row * w * 4..(row + 1) * w * 4]);
            }
        }
        Ok(())
    }

    fn generate_mipmaps(&mut self, texture: &mut SoftTexture) {
        let mut storage = lock(&texture.storage);
        if storage.format.is_depth() || storage.format.is_compressed() {
            return;
        }
        for levels in storage.layers.iter_mut() {
            let Some(base) = levels.first() else {
                continue;
            };
            let full = full_mip_chain(base.width, base.height) as usize;
            levels.truncate(1);
            while levels.len() < full {
                let next = levels[levels.len() - 1].downsample();
                levels.push(next);
            }
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> SamplerDesc {
        self.stats.samplers_created += 1;
        *desc
    }

    fn destroy_texture(&mut self, texture: SoftTexture) {
        if self.retire(texture.id, "texture") {
            self.stats.textures_destroyed += 1;
        }
    }

    fn create_shader(&mut self, container: &ShaderContainer) -> Result<SoftShader> {
        if container.stage == ShaderStage::Compute {
            return Err(GPUError::ShaderCompile(
                "compute stages are not supported by the software device".into(),
            ));
        }
        if container.code.is_empty() {
            return Err(GPUError::ShaderCompile("0:0: error: empty translation unit".into()));
        }
        if container.kind == CodeKind::Source && std::str::from_utf8(&container.code).is_err() {
            return Err(GPUError::ShaderCompile("0:0: error: source is not valid UTF-8".into()));
        }
        self.stats.shaders_created += 1;
        Ok(SoftShader {
            id: self.track(),
            stage: container.stage,
        })
    }

    fn destroy_shader(&mut self, shader: SoftShader) {
        if self.retire(shader.id, "shader") {
            self.stats.shaders_destroyed += 1;
        }
    }

    fn create_program(
        &mut self,
        vertex: &SoftShader,
        fragment: &SoftShader,
        layout: &Arc<ProgramLayout>,
    ) -> Result<SoftProgram> {
        if vertex.stage != ShaderStage::Vertex || fragment.stage != ShaderStage::Fragment {
            return Err(GPUError::ProgramLink(format!(
                "cannot link {:?} shader {} with {:?} shader {}",
                vertex.stage, vertex.id, fragment.stage, fragment.id
            )));
        }
        self.stats.programs_created += 1;
        Ok(SoftProgram {
            id: self.track(),
            layout: layout.clone(),
            vertex_uniforms: Vec::new(),
            fragment_uniforms: Vec::new(),
        })
    }

    fn destroy_program(&mut self, program: SoftProgram) {
        if self.retire(program.id, "program") {
            self.stats.programs_destroyed += 1;
        }
    }

    fn create_target_views(&mut self) -> SoftTargetViews {
        self.stats.targets_created += 1;
        SoftTargetViews {
            id: self.track(),
            ..Default::default()
        }
    }

    fn update_color_view(&mut self, views: &mut SoftTargetViews, index: usize, attachment: Option<(&SoftTexture, u32)>) {
        let Some(slot) = views.colors.get_mut(index) else {
            return;
        };
        *slot = attachment.map(|(texture, level)| View::new(texture, level));
        self.stats.color_view_rebuilds += 1;
    }

    fn update_depth_stencil_view(&mut self, views: &mut SoftTargetViews, attachment: Option<(&SoftTexture, u32)>) {
        views.depth_stencil = attachment.map(|(texture, level)| View::new(texture, level));
        self.stats.depth_stencil_view_rebuilds += 1;
    }

    fn destroy_target_views(&mut self, views: SoftTargetViews) {
        if self.target.as_ref().map(|t| t.id) == Some(views.id) {
            self.target = None;
        }
        if self.retire(views.id, "render target") {
            self.stats.targets_destroyed += 1;
        }
    }

    fn bind_target(&mut self, views: Option<&SoftTargetViews>) {
        self.target = views.cloned();
    }

    fn clear(&mut self, flags: TargetBufferFlags, desc: &RenderPassDesc) {
        self.stats.clears += 1;
        let rgba = desc.clear_color.map(raster::to_unorm8);
        let clear_depth = |image: &mut Image| {
            if flags.contains(TargetBufferFlags::DEPTH) {
                image.depth.fill(desc.clear_depth.clamp(0.0, 1.0));
            }
            if flags.contains(TargetBufferFlags::STENCIL) {
                image.stencil.fill(desc.clear_stencil as u8);
            }
        };
        match &self.target {
            None => {
                if flags.has_color(0) {
                    self.backbuffer.color.fill_color(rgba);
                }
                clear_depth(&mut self.backbuffer.depth);
            }
            Some(views) => {
                for (i, view) in views.colors.iter().enumerate() {
                    if let Some(view) = view.as_ref().filter(|_| flags.has_color(i)) {
                        view.with_image(|image| image.fill_color(rgba));
                    }
                }
                if let Some(view) = &views.depth_stencil {
                    view.with_image(clear_depth);
                }
            }
        }
    }

    fn create_blend_state(&mut self, desc: &BlendDesc) -> SoftBlendState {
        self.stats.blend_states_created += 1;
        SoftBlendState {
            id: self.alloc(),
            desc: *desc,
        }
    }

    fn apply_blend_state(&mut self, state: &SoftBlendState) {
        self.blend = Some(state.desc);
        self.stats.last_blend_state = Some(state.id);
    }

    fn create_depth_stencil_state(&mut self, desc: &DepthStencilDesc) -> SoftDepthStencil {
        self.stats.depth_stencil_states_created += 1;
        SoftDepthStencil {
            id: self.alloc(),
            desc: *desc,
        }
    }

    fn apply_depth_stencil_state(&mut self, state: Option<&SoftDepthStencil>, stencil_ref: u32) {
        self.depth_stencil = state.map(|s| s.desc);
        self.stats.last_depth_stencil_state = state.map(|s| s.id);
        self.stencil_ref = stencil_ref;
    }

    fn set_viewport(&mut self, viewport: &Viewport) {
        self.viewport = *viewport;
    }

    fn apply_rasterizer_state(&mut self, state: &RasterizerState) {
        self.raster = *state;
        self.stats.rasterizer_applies += 1;
    }

    fn bind_program(&mut self, program: &SoftProgram) {
        self.program = Some(program.layout.clone());
        self.uniforms = (program.vertex_uniforms.clone(), program.fragment_uniforms.clone());
    }

    fn bind_vertex_input(&mut self, layout: &VertexLayout, vertex: &SoftBuffer, instance: Option<&SoftBuffer>) {
        self.vertex_input = Some(VertexInput {
            layout: layout.clone(),
            vertex: vertex.data.clone(),
            instance: instance.map(|b| b.data.clone()),
        });
    }

    fn upload_uniforms(&mut self, program: &mut SoftProgram, vertex: &[u8], fragment: &[u8]) {
        program.vertex_uniforms = vertex.to_vec();
        program.fragment_uniforms = fragment.to_vec();
        self.uniforms = (program.vertex_uniforms.clone(), program.fragment_uniforms.clone());
    }

    fn bind_texture(&mut self, _program: &SoftProgram, slot: u32, texture: &SoftTexture, sampler: &SamplerDesc) {
        self.units.insert(slot, (texture.storage.clone(), *sampler));
    }

    fn draw(&mut self, call: &DrawCall<'_, SoftBuffer>) {
        let (Some(layout), Some(input)) = (self.program.as_ref(), self.vertex_input.as_ref()) else {
            log::warn!("draw without a bound program or vertex input");
            return;
        };
        if call.instance_count == 0 {
            return;
        }
        self.stats.draws += 1;

        let indices: Vec<u32> = match &call.kind {
            DrawKind::Arrays { start, count } => (*start..start.saturating_add(*count)).collect(),
            DrawKind::Elements {
                index_buffer,
                format,
                count,
                offset,
            } => read_indices(&index_buffer.data, *format, *count, *offset),
        };

        // Sampled images are snapshotted first so a texture may also be the
        // draw's own attachment.
        let texture = layout
            .fragment()
            .builtin_uniform(Uniform::Texture)
            .filter(|info| info.is_texture())
            .and_then(|info| self.units.get(&(info.location.max(0) as u32)))
            .map(|(storage, sampler)| {
                let storage = lock(storage);
                Sampled {
                    image: storage
                        .layers
                        .first()
                        .and_then(|levels| levels.first())
                        .cloned()
                        .unwrap_or_default(),
                    sampler: *sampler,
                }
            });
        let fragment = FragmentStage::new(layout, &self.uniforms.1, texture);
        let shade = |color: [f32; 4], uv: [f32; 2]| fragment.shade(color, uv);
        let pipeline = Pipeline {
            raster: self.raster,
            blend: self.blend,
            depth_stencil: self.depth_stencil,
            stencil_ref: self.stencil_ref,
            shade: &shade,
        };

        let mut surface = take_surface(self.target.as_ref(), &mut self.backbuffer);
        for instance in 0..call.instance_count {
            let vertices: Vec<Option<Vertex>> = indices
                .iter()
                .map(|&index| {
                    let out = input.run(layout, &self.uniforms.0, index, instance);
                    Vertex::from_clip(out.position, &self.viewport, out.color, out.uv)
                })
                .collect();
            assemble(&pipeline, &mut surface, call.primitive, call.wireframe, &vertices);
        }
        restore_surface(self.target.as_ref(), &mut self.backbuffer, surface);
    }

    fn end_pass(&mut self) {
        self.units.clear();
        self.vertex_input = None;
        self.program = None;
    }

    fn begin_frame(&mut self) -> Result<()> {
        if self.lost {
            return Err(GPUError::DeviceLost("software device removed".into()));
        }
        self.stats.frames += 1;
        Ok(())
    }

    fn present(&mut self) -> Result<()> {
        self.stats.presents += 1;
        if self.lost {
            return Err(GPUError::DeviceLost("software device removed".into()));
        }
        Ok(())
    }

    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()> {
        if (width, height) != self.swap_chain_size() {
            log::debug!("backbuffer resized to {width}x{height}");
            self.backbuffer = Backbuffer::new(width, height);
        }
        Ok(())
    }

    fn swap_chain_size(&self) -> (u32, u32) {
        (self.backbuffer.color.width, self.backbuffer.color.height)
    }

    fn read_pixels(&mut self, source: ReadSource<'_, SoftTexture>) -> Result<PixelBuffer> {
        match source {
            ReadSource::Backbuffer(rect) => {
                let image = &self.backbuffer.color;
                let x0 = rect.x.max(0) as u32;
                let y0 = rect.y.max(0) as u32;
                let width = rect.width.min(image.width.saturating_sub(x0));
                let height = rect.height.min(image.height.saturating_sub(y0));
                let mut data = Vec::with_capacity(width as usize * height as usize * 4);
                for y in y0..y0 + height {
                    let start = ((y * image.width + x0) * 4) as usize;
                    data.extend_from_slice(&image.color[start..start + width as usize * 4]);
                }
                Ok(PixelBuffer { data, width, height })
            }
            ReadSource::Texture(texture, level) => {
                let mut storage = lock(&texture.storage);
                if storage.format.is_depth() {
                    return Err(GPUError::Readback("depth attachments cannot be read back".into()));
                }
                let image = storage
                    .image_mut(0, level)
                    .ok_or_else(|| GPUError::Readback(format!("texture {} has no level {level}", texture.id)))?;
                Ok(PixelBuffer {
                    data: image.color.clone(),
                    width: image.width,
                    height: image.height,
                })
            }
        }
    }

    fn is_lost(&self) -> bool {
        self.lost
    }

    fn recreate(&mut self) -> Result<()> {
        let (width, height) = self.swap_chain_size();
        self.lost = false;
        self.live.clear();
        self.backbuffer = Backbuffer::new(width, height);
        self.stats.recreations += 1;
        log::info!("software device recreated");
        Ok(())
    }

    fn reset_state(&mut self) {
        self.target = None;
        self.raster = RasterizerState::default();
        self.blend = None;
        self.depth_stencil = None;
        self.stencil_ref = 0;
        self.end_pass();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> SoftDevice {
        SoftDevice::new(&DriverConfig::default())
    }

    #[test]
    fn destroying_twice_is_counted() {
        let mut device = device();
        let desc = BufferDesc {
            size: 4,
            buffer_type: crate::gpu::BufferType::Vertex,
            usage: Default::default(),
        };
        let buffer = device.create_buffer(&desc, None).unwrap();
        let id = buffer.id();
        device.destroy_buffer(buffer);
        device.destroy_buffer(SoftBuffer { id, data: Vec::new() });
        assert_eq!(device.stats().buffers_destroyed, 1);
        assert_eq!(device.stats().double_destroys, 1);
    }

    #[test]
    fn uploads_convert_into_place() {
        let mut device = device();
        let desc = TextureDesc {
            format: PixelFormat::RGB8,
            width: 2,
            height: 2,
            ..Default::default()
        };
        let mut texture = device.create_texture(&desc).unwrap();
        let region = TextureRegion {
            x: 1,
            y: 1,
            width: 1,
            height: 1,
            level: 0,
            layer: 0,
            compressed: false,
        };
        device.update_texture(&mut texture, &region, &[10, 20, 30]).unwrap();
        let pixels = device.read_pixels(ReadSource::Texture(&texture, 0)).unwrap();
        assert_eq!(pixels.pixel(1, 1), Some([10, 20, 30, 255]));
        assert_eq!(pixels.pixel(0, 0), Some([0, 0, 0, 0]));

        let wrapping = TextureRegion {
            x: u32::MAX,
            width: 2,
            ..region
        };
        assert!(matches!(
            device.update_texture(&mut texture, &wrapping, &[0; 6]),
            Err(GPUError::InvalidData(_))
        ));
    }

    #[test]
    fn mipmaps_average_the_base_level() {
        let mut device = device();
        let desc = TextureDesc {
            width: 2,
            height: 2,
            ..Default::default()
        };
        let mut texture = device.create_texture(&desc).unwrap();
        let region = TextureRegion {
            x: 0,
            y: 0,
            width: 2,
            height: 2,
            level: 0,
            layer: 0,
            compressed: false,
        };
        let data = [
            200, 0, 0, 255, 0, 0, 0, 255, //
            200, 0, 0, 255, 0, 0, 0, 255,
        ];
        device.update_texture(&mut texture, &region, &data).unwrap();
        device.generate_mipmaps(&mut texture);
        let pixels = device.read_pixels(ReadSource::Texture(&texture, 1)).unwrap();
        assert_eq!(pixels.pixel(0, 0), Some([100, 0, 0, 255]));
    }

    #[test]
    fn lost_device_fails_until_recreated() {
        let mut device = device();
        device.simulate_device_loss();
        assert!(matches!(device.present(), Err(GPUError::DeviceLost(_))));
        assert!(device.begin_frame().is_err());
        device.recreate().unwrap();
        assert!(device.begin_frame().is_ok());
        assert_eq!(device.stats().recreations, 1);
    }
}
