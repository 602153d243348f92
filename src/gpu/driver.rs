use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, ThreadId};

use super::format::{format_info, resolve_format};
use super::program::{recreate_shader, ProgramRecord, ShaderModuleCache, ShaderRecord};
use super::render_target::TargetRecord;
use super::resources::{BufferRecord, TextureRecord};
use super::{
    fatal, Backend, BlendDesc, Buffer, BufferType, BufferUsage, Capabilities, CommandBuffer,
    DefaultBackend, DepthStencilDesc, DepthStencilState, Device, DeviceInfo, DriverConfig, FeatureType,
    GPUError, PixelFormat, Program, RenderPipeline, RenderTarget, Result, ShaderModule,
    PipelineCache, SamplerCache, ShaderStage, Texture, TextureDesc, VertexLayout, VertexLayoutDesc,
};
use crate::utils::{lock, Handle, Pool};

pub(crate) type NativeBuffer<B> = <<B as Backend>::Device as Device>::Buffer;
pub(crate) type NativeTexture<B> = <<B as Backend>::Device as Device>::Texture;
pub(crate) type NativeShader<B> = <<B as Backend>::Device as Device>::Shader;
pub(crate) type NativeProgram<B> = <<B as Backend>::Device as Device>::Program;
pub(crate) type NativeViews<B> = <<B as Backend>::Device as Device>::TargetViews;
pub(crate) type NativeBlendState<B> = <<B as Backend>::Device as Device>::BlendState;
pub(crate) type NativeDepthStencil<B> = <<B as Backend>::Device as Device>::DepthStencil;
pub(crate) type NativeSampler<B> = <<B as Backend>::Device as Device>::Sampler;

/// Native object whose last owner went away.
pub(crate) enum Release<B: Backend> {
    Buffer(Handle<BufferRecord<B>>),
    Texture(Handle<TextureRecord<B>>),
    Shader(Handle<ShaderRecord<B>>),
    Program(Handle<ProgramRecord<B>>),
    Target(Handle<TargetRecord<B>>),
}

type Operation = Box<dyn FnOnce() + Send>;
type Listener = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct DriverState<B: Backend> {
    pub(crate) device: B::Device,
    pub(crate) buffers: Pool<BufferRecord<B>>,
    pub(crate) textures: Pool<TextureRecord<B>>,
    pub(crate) shaders: Pool<ShaderRecord<B>>,
    pub(crate) programs: Pool<ProgramRecord<B>>,
    pub(crate) targets: Pool<TargetRecord<B>>,
}

impl<B: Backend> DriverState<B> {
    fn destroy(&mut self, release: Release<B>) {
        match release {
            Release::Buffer(h) => {
                if let Some(rec) = self.buffers.release(h) {
                    self.device.destroy_buffer(rec.native);
                }
            }
            Release::Texture(h) => {
                if let Some(rec) = self.textures.release(h) {
                    self.device.destroy_texture(rec.native);
                }
            }
            Release::Shader(h) => {
                if let Some(native) = self.shaders.release(h).and_then(|rec| rec.native) {
                    self.device.destroy_shader(native);
                }
            }
            Release::Program(h) => {
                if let Some(native) = self.programs.release(h).and_then(|rec| rec.native) {
                    self.device.destroy_program(native);
                }
            }
            Release::Target(h) => {
                if let Some(rec) = self.targets.release(h) {
                    self.device.destroy_target_views(rec.views);
                }
            }
        }
    }

    fn destroy_all(&mut self) {
        for rec in self.programs.drain() {
            if let Some(native) = rec.native {
                self.device.destroy_program(native);
            }
        }
        for rec in self.shaders.drain() {
            if let Some(native) = rec.native {
                self.device.destroy_shader(native);
            }
        }
        for rec in self.targets.drain() {
            self.device.destroy_target_views(rec.views);
        }
        for rec in self.textures.drain() {
            self.device.destroy_texture(rec.native);
        }
        for rec in self.buffers.drain() {
            self.device.destroy_buffer(rec.native);
        }
    }
}

pub(crate) struct Shared<B: Backend> {
    state: Mutex<DriverState<B>>,
    pub(crate) config: DriverConfig,
    info: DeviceInfo,
    caps: Capabilities,
    features: [bool; FeatureType::ALL.len()],
    render_thread: ThreadId,
    releases: (flume::Sender<Release<B>>, flume::Receiver<Release<B>>),
    operations: (flume::Sender<Operation>, flume::Receiver<Operation>),
    listeners: Mutex<Vec<Listener>>,
    pub(crate) blend_states: PipelineCache<BlendDesc, NativeBlendState<B>>,
    pub(crate) depth_stencil_states: PipelineCache<DepthStencilDesc, NativeDepthStencil<B>>,
    pub(crate) samplers: SamplerCache<NativeSampler<B>>,
    shader_modules: ShaderModuleCache<B>,
    pub(crate) command_buffer_taken: AtomicBool,
    pub(crate) device_lost: AtomicBool,
    /// Bumped on every device recreation so cached native handles can tell
    /// they are stale.
    pub(crate) epoch: AtomicU64,
    shut_down: Arc<AtomicBool>,
}

impl<B: Backend> Shared<B> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, DriverState<B>> {
        lock(&self.state)
    }

    /// Destroy the native object now when on the render thread and the lock
    /// is free, otherwise defer it to the next collection point.
    pub(crate) fn release(&self, release: Release<B>) {
        if self.is_render_thread() {
            match self.state.try_lock() {
                Ok(mut state) => return state.destroy(release),
                Err(TryLockError::Poisoned(poisoned)) => {
                    return poisoned.into_inner().destroy(release)
                }
                Err(TryLockError::WouldBlock) => {}
            }
        }
        if self.releases.0.send(release).is_err() {
            log::error!("release queue closed, native object leaked");
        }
    }

    pub(crate) fn collect_garbage(&self) -> usize {
        let pending: Vec<_> = self.releases.1.try_iter().collect();
        if pending.is_empty() {
            return 0;
        }
        let count = pending.len();
        let mut state = self.lock();
        for release in pending {
            state.destroy(release);
        }
        log::trace!("collected {count} deferred releases");
        count
    }

    pub(crate) fn drain_operations(&self) -> usize {
        let pending: Vec<_> = self.operations.1.try_iter().collect();
        if self.shut_down.load(Ordering::Acquire) {
            return 0;
        }
        let count = pending.len();
        for op in pending {
            op();
        }
        count
    }

    pub(crate) fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub(crate) fn feature(&self, feature: FeatureType) -> bool {
        self.features[feature as usize]
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn is_render_thread(&self) -> bool {
        thread::current().id() == self.render_thread
    }
}

/// Cloneable sender other threads use to run closures on the render thread.
#[derive(Clone)]
pub struct OperationQueue {
    tx: flume::Sender<Operation>,
    shut_down: Arc<AtomicBool>,
}

impl OperationQueue {
    /// Queue `op` for the next frame. Returns `false` once the driver is gone.
    pub fn push(&self, op: impl FnOnce() + Send + 'static) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(Box::new(op)).is_ok()
    }
}

/// Factory for every resource type and owner of the device. Cheap to clone.
pub struct Driver<B: Backend = DefaultBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Clone for Driver<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> Driver<B> {
    /// Create the device on the calling thread, which becomes the render
    /// thread. An unusable environment terminates the process.
    pub fn new(config: DriverConfig) -> Self {
        match Self::try_new(config) {
            Ok(driver) => driver,
            Err(err) => fatal(&format!("{} device unavailable: {err}", B::NAME)),
        }
    }

    /// Build a driver from a `.toml` config file. Load failures surface as
    /// [`GPUError::Config`].
    pub fn from_config_file(path: &str) -> Result<Self> {
        let config = DriverConfig::load_from_file(path)?;
        Self::try_new(config)
    }

    pub fn try_new(config: DriverConfig) -> Result<Self> {
        let mut device = B::create_device(&config)?;
        let info = device.info();
        let caps = device.capabilities();
        let mut features = [false; FeatureType::ALL.len()];
        for feature in FeatureType::ALL {
            features[feature as usize] = device.probe_feature(feature);
        }

        log::info!(
            "{} driver: {} / {} / {} (shading language {})",
            B::NAME,
            info.vendor,
            info.renderer,
            info.version,
            info.shader_version
        );
        log::info!(
            "max attributes {}, max texture size {}, texture units {}, samples {}",
            caps.max_attributes,
            caps.max_texture_size,
            caps.max_texture_units,
            caps.max_samples
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(DriverState {
                device,
                buffers: Pool::default(),
                textures: Pool::default(),
                shaders: Pool::default(),
                programs: Pool::default(),
                targets: Pool::default(),
            }),
            config,
            info,
            caps,
            features,
            render_thread: thread::current().id(),
            releases: flume::unbounded(),
            operations: flume::unbounded(),
            listeners: Mutex::new(Vec::new()),
            blend_states: PipelineCache::new(),
            depth_stencil_states: PipelineCache::new(),
            samplers: SamplerCache::new(),
            shader_modules: ShaderModuleCache::default(),
            command_buffer_taken: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            shut_down: Arc::new(AtomicBool::new(false)),
        });
        Ok(Self { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<B>> {
        &self.shared
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    pub fn vendor(&self) -> &str {
        &self.shared.info.vendor
    }

    pub fn renderer(&self) -> &str {
        &self.shared.info.renderer
    }

    pub fn version(&self) -> &str {
        &self.shared.info.version
    }

    pub fn shader_version(&self) -> &str {
        &self.shared.info.shader_version
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.shared.caps
    }

    pub fn max_attributes(&self) -> u32 {
        self.shared.caps.max_attributes
    }

    pub fn max_texture_size(&self) -> u32 {
        self.shared.caps.max_texture_size
    }

    pub fn max_texture_units(&self) -> u32 {
        self.shared.caps.max_texture_units
    }

    pub fn max_samples_allowed(&self) -> u32 {
        self.shared.caps.max_samples
    }

    /// Cached answer from construction time.
    pub fn check_for_feature_supported(&self, feature: FeatureType) -> bool {
        self.shared.feature(feature)
    }

    pub fn is_format_supported(&self, format: PixelFormat) -> bool {
        format != PixelFormat::None
            && format_info(format)
                .feature
                .map_or(true, |feature| self.shared.feature(feature))
    }

    /// Format a texture of `format` is actually created with.
    pub fn resolve_format(&self, format: PixelFormat) -> PixelFormat {
        resolve_format(format, |feature| self.shared.feature(feature))
    }

    /// Create a buffer with one reference. `data` may be shorter than
    /// `size`; longer data is rejected.
    pub fn create_buffer(
        &self,
        size: usize,
        buffer_type: BufferType,
        usage: BufferUsage,
        data: Option<&[u8]>,
    ) -> Result<Buffer<B>> {
        Buffer::create(&self.shared, size, buffer_type, usage, data)
    }

    /// Create a texture. Unsupported compressed formats degrade through the
    /// fallback table; other failures return an invalid texture.
    pub fn create_texture(&self, desc: &TextureDesc) -> Texture<B> {
        Texture::create(&self.shared, desc)
    }

    pub fn create_render_target(&self) -> RenderTarget<B> {
        RenderTarget::create(&self.shared)
    }

    /// Target bound to the swap chain rather than explicit textures.
    pub fn create_default_render_target(&self) -> RenderTarget<B> {
        RenderTarget::create_default(&self.shared)
    }

    /// Parse and compile one stage. Failures are logged and return an
    /// invalid module carrying the diagnostics. Identical source for a stage
    /// returns the module already alive instead of compiling again.
    pub fn create_shader_module(&self, stage: ShaderStage, source: &[u8]) -> ShaderModule<B> {
        self.shared.shader_modules.get_or_create(&self.shared, stage, source)
    }

    /// Distinct shader modules currently alive and shareable.
    pub fn cached_shader_modules(&self) -> usize {
        self.shared.shader_modules.len()
    }

    pub fn create_program(&self, vertex_source: &[u8], fragment_source: &[u8]) -> Program<B> {
        let vertex = self.create_shader_module(ShaderStage::Vertex, vertex_source);
        let fragment = self.create_shader_module(ShaderStage::Fragment, fragment_source);
        self.link_program(&vertex, &fragment)
    }

    pub fn link_program(&self, vertex: &ShaderModule<B>, fragment: &ShaderModule<B>) -> Program<B> {
        Program::link(&self.shared, vertex, fragment)
    }

    pub fn create_vertex_layout(&self, desc: VertexLayoutDesc) -> VertexLayout {
        desc.end_layout(None)
    }

    pub fn create_depth_stencil_state(&self) -> DepthStencilState<B> {
        DepthStencilState::new(&self.shared)
    }

    pub fn create_render_pipeline(&self) -> RenderPipeline<B> {
        RenderPipeline::new(&self.shared)
    }

    /// Acquire the command buffer. Only one may exist per driver.
    pub fn command_buffer(&self) -> Result<CommandBuffer<B>> {
        if self.shared.command_buffer_taken.swap(true, Ordering::AcqRel) {
            return Err(GPUError::CommandBufferInUse);
        }
        Ok(CommandBuffer::new(self.shared.clone()))
    }

    /// Queue a closure to run on the render thread at the next frame start.
    pub fn queue_operation(&self, op: impl FnOnce() + Send + 'static) -> bool {
        self.operation_queue().push(op)
    }

    pub fn operation_queue(&self) -> OperationQueue {
        OperationQueue {
            tx: self.shared.operations.0.clone(),
            shut_down: self.shared.shut_down.clone(),
        }
    }

    /// Run queued operations now. Called by `begin_frame`.
    pub fn drain_operations(&self) -> usize {
        self.shared.drain_operations()
    }

    /// Destroy natives released from other threads.
    pub fn collect_garbage(&self) -> usize {
        self.shared.collect_garbage()
    }

    pub fn is_device_lost(&self) -> bool {
        self.shared.device_lost.load(Ordering::Acquire)
    }

    /// Called after recovery finishes, on the render thread. A listener may
    /// register further listeners; they first run on the next recovery.
    pub fn add_recreate_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.listeners).push(Arc::new(listener));
    }

    /// Rebuild every native object on a fresh device from retained CPU-side
    /// data, then resume drawing. If any object fails to come back the
    /// device stays lost and the call may be retried.
    pub fn recover_device(&self) -> Result<()> {
        self.shared.collect_garbage();
        let recreated = {
            let mut guard = self.shared.lock();
            self.recreate_natives(&mut guard)
        };
        if let Err(err) = recreated {
            log::error!("device recovery failed, device stays lost: {err}");
            self.shared.device_lost.store(true, Ordering::Release);
            return Err(err);
        }
        self.shared.device_lost.store(false, Ordering::Release);

        let listeners: Vec<Listener> = lock(&self.shared.listeners).clone();
        for listener in listeners {
            listener();
        }
        Ok(())
    }

    fn recreate_natives(&self, state: &mut DriverState<B>) -> Result<()> {
        state.device.recreate()?;
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.blend_states.clear();
        self.shared.depth_stencil_states.clear();
        let device = &mut state.device;

        // Every target rebuilds its views on next bind, whatever fails below.
        for handle in state.targets.handles() {
            if let Some(rec) = state.targets.get_mut_ref(handle) {
                rec.views = device.create_target_views();
                rec.stale = true;
            }
        }

        let mut first_error = None;
        for handle in state.buffers.handles() {
            if let Some(rec) = state.buffers.get_mut_ref(handle) {
                if let Err(err) = rec.recreate(device) {
                    first_error.get_or_insert(err);
                }
            }
        }
        for handle in state.textures.handles() {
            if let Some(rec) = state.textures.get_mut_ref(handle) {
                if let Err(err) = rec.recreate(device, self.shared.config.recovery.retain_texture_data) {
                    first_error.get_or_insert(err);
                }
            }
        }
        for handle in state.shaders.handles() {
            if let Some(rec) = state.shaders.get_mut_ref(handle) {
                rec.native = recreate_shader(device, &rec.container);
            }
        }
        for handle in state.programs.handles() {
            let Some(rec) = state.programs.get_mut_ref(handle) else {
                continue;
            };
            let vs = state.shaders.get_ref(rec.vertex).and_then(|s| s.native.as_ref());
            let fs = state.shaders.get_ref(rec.fragment).and_then(|s| s.native.as_ref());
            rec.native = match (vs, fs) {
                (Some(vs), Some(fs)) => match device.create_program(vs, fs, &rec.layout) {
                    Ok(native) => Some(native),
                    Err(err) => {
                        log::error!("program relink after device loss failed: {err}");
                        None
                    }
                },
                _ => None,
            };
        }
        device.reset_state();
        if let Some(err) = first_error {
            return Err(err);
        }
        log::info!(
            "device recreated: {} buffers, {} textures, {} programs restored",
            state.buffers.len(),
            state.textures.len(),
            state.programs.len()
        );
        Ok(())
    }

    /// Run `f` against the native device. Meant for diagnostics and tests.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut B::Device) -> R) -> R {
        let mut state = self.shared.lock();
        f(&mut state.device)
    }

    /// Discard queued operations and free every native object still
    /// registered.
    pub(crate) fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        let discarded = self.shared.operations.1.try_iter().count();
        if discarded > 0 {
            log::debug!("discarded {discarded} queued operations at shutdown");
        }
        self.shared.collect_garbage();
        if Arc::strong_count(&self.shared) == 1 {
            self.shared.lock().destroy_all();
        }
    }
}
