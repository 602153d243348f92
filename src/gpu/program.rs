use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};

use super::driver::{NativeProgram, NativeShader, Release, Shared};
use super::reflect::{Reflection, ScType, ShaderContainer};
use super::structs::{ShaderStage, VertexFormat};
use super::{Backend, DefaultBackend, Device, GPUError};
use crate::utils::{lock, Handle};

/// Well-known uniforms resolved once per module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uniform {
    MvpMatrix,
    Texture,
    Texture1,
    Texture2,
    Texture3,
    TextColor,
    EffectColor,
    EffectWidth,
    LabelPass,
    DistanceSpread,
}

impl Uniform {
    pub const COUNT: usize = 10;
    pub const ALL: [Uniform; Self::COUNT] = [
        Uniform::MvpMatrix,
        Uniform::Texture,
        Uniform::Texture1,
        Uniform::Texture2,
        Uniform::Texture3,
        Uniform::TextColor,
        Uniform::EffectColor,
        Uniform::EffectWidth,
        Uniform::LabelPass,
        Uniform::DistanceSpread,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Uniform::MvpMatrix => "u_MVPMatrix",
            Uniform::Texture => "u_tex0",
            Uniform::Texture1 => "u_tex1",
            Uniform::Texture2 => "u_tex2",
            Uniform::Texture3 => "u_tex3",
            Uniform::TextColor => "u_textColor",
            Uniform::EffectColor => "u_effectColor",
            Uniform::EffectWidth => "u_effectWidth",
            Uniform::LabelPass => "u_labelPass",
            Uniform::DistanceSpread => "u_distanceSpread",
        }
    }
}

/// Well-known vertex inputs resolved once per module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexInputKind {
    Position,
    Color,
    Texcoord,
    Texcoord1,
    Texcoord2,
    Texcoord3,
    Normal,
    Instance,
}

impl VertexInputKind {
    pub const COUNT: usize = 8;
    pub const ALL: [VertexInputKind; Self::COUNT] = [
        VertexInputKind::Position,
        VertexInputKind::Color,
        VertexInputKind::Texcoord,
        VertexInputKind::Texcoord1,
        VertexInputKind::Texcoord2,
        VertexInputKind::Texcoord3,
        VertexInputKind::Normal,
        VertexInputKind::Instance,
    ];

    pub fn name(self) -> &'static str {
        match self {
            VertexInputKind::Position => "a_position",
            VertexInputKind::Color => "a_color",
            VertexInputKind::Texcoord => "a_texCoord",
            VertexInputKind::Texcoord1 => "a_texCoord1",
            VertexInputKind::Texcoord2 => "a_texCoord2",
            VertexInputKind::Texcoord3 => "a_texCoord3",
            VertexInputKind::Normal => "a_normal",
            VertexInputKind::Instance => "a_instance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInputDesc {
    pub semantic: String,
    pub location: i32,
    pub format: VertexFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformInfo {
    /// Array length, at least one.
    pub count: u32,
    /// Block binding for values, texture unit for samplers.
    pub location: i32,
    /// `None` for samplers.
    pub ty: Option<ScType>,
    pub size: u32,
    /// Offset inside the stage's CPU uniform buffer.
    pub buffer_offset: u32,
}

impl UniformInfo {
    pub fn is_texture(&self) -> bool {
        self.ty.is_none()
    }
}

/// Placement of one uniform block inside a stage's CPU buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    pub name: String,
    pub binding: i32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSlot {
    pub name: String,
    pub binding: u32,
    pub count: u32,
}

/// Name-keyed view of one stage's reflection.
#[derive(Debug, Clone)]
pub struct ModuleReflection {
    stage: ShaderStage,
    inputs: HashMap<String, VertexInputDesc>,
    uniforms: HashMap<String, UniformInfo>,
    blocks: Vec<BlockLayout>,
    textures: Vec<TextureSlot>,
    uniform_buffer_size: u32,
    builtin_uniforms: [Option<UniformInfo>; Uniform::COUNT],
    builtin_inputs: [Option<VertexInputDesc>; VertexInputKind::COUNT],
}

fn align16(v: u32) -> u32 {
    (v + 15) & !15
}

impl ModuleReflection {
    pub fn empty(stage: ShaderStage) -> Self {
        Self {
            stage,
            inputs: HashMap::new(),
            uniforms: HashMap::new(),
            blocks: Vec::new(),
            textures: Vec::new(),
            uniform_buffer_size: 0,
            builtin_uniforms: Default::default(),
            builtin_inputs: Default::default(),
        }
    }

    pub fn from_reflection(stage: ShaderStage, refl: &Reflection) -> Self {
        let mut out = Self::empty(stage);

        for input in &refl.inputs {
            let Some(format) = input.format.vertex_format() else {
                log::warn!("vertex input '{}' has non-attribute type {:?}", input.name, input.format);
                continue;
            };
            out.inputs.insert(
                input.name.clone(),
                VertexInputDesc {
                    semantic: input.semantic.clone(),
                    location: input.location,
                    format,
                },
            );
        }

        let mut cursor = 0u32;
        for block in &refl.uniform_blocks {
            let offset = align16(cursor);
            cursor = offset + block.size_bytes;
            out.blocks.push(BlockLayout {
                name: block.name.clone(),
                binding: block.binding,
                offset,
                size: block.size_bytes,
            });
            for member in &block.members {
                out.uniforms.insert(
                    member.name.clone(),
                    UniformInfo {
                        count: u32::from(member.array_size.max(1)),
                        location: block.binding,
                        ty: Some(member.format),
                        size: member.size_bytes,
                        buffer_offset: offset + member.offset.max(0) as u32,
                    },
                );
            }
        }
        out.uniform_buffer_size = cursor;

        for tex in &refl.textures {
            let info = UniformInfo {
                count: u32::from(tex.count),
                location: tex.binding,
                ty: None,
                size: 0,
                buffer_offset: 0,
            };
            if out.uniforms.insert(tex.name.clone(), info).is_some() {
                log::warn!("texture '{}' shadows a uniform of the same name", tex.name);
            }
            out.textures.push(TextureSlot {
                name: tex.name.clone(),
                binding: tex.binding.max(0) as u32,
                count: u32::from(tex.count),
            });
        }

        for (slot, kind) in VertexInputKind::ALL.iter().enumerate() {
            out.builtin_inputs[slot] = out.inputs.get(kind.name()).cloned();
        }
        for (slot, uniform) in Uniform::ALL.iter().enumerate() {
            out.builtin_uniforms[slot] = out.uniforms.get(uniform.name()).copied();
        }
        out
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn vertex_input(&self, name: &str) -> Option<&VertexInputDesc> {
        self.inputs.get(name)
    }

    pub fn vertex_inputs(&self) -> impl Iterator<Item = (&str, &VertexInputDesc)> {
        self.inputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn builtin_vertex_input(&self, kind: VertexInputKind) -> Option<&VertexInputDesc> {
        self.builtin_inputs[kind as usize].as_ref()
    }

    pub fn uniform_info(&self, name: &str) -> Option<&UniformInfo> {
        self.uniforms.get(name)
    }

    pub fn builtin_uniform(&self, uniform: Uniform) -> Option<&UniformInfo> {
        self.builtin_uniforms[uniform as usize].as_ref()
    }

    pub fn uniforms(&self) -> impl Iterator<Item = (&str, &UniformInfo)> {
        self.uniforms.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn blocks(&self) -> &[BlockLayout] {
        &self.blocks
    }

    pub fn textures(&self) -> &[TextureSlot] {
        &self.textures
    }

    pub fn uniform_buffer_size(&self) -> u32 {
        self.uniform_buffer_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StageUniformLocation {
    /// Block binding or texture unit.
    pub location: i32,
    /// Offset inside the program's CPU uniform buffer.
    pub offset: u32,
    pub size: u32,
}

/// Where a named uniform lives in each stage. Either half may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct UniformLocation {
    pub vertex: Option<StageUniformLocation>,
    pub fragment: Option<StageUniformLocation>,
}

impl UniformLocation {
    pub fn is_valid(&self) -> bool {
        self.vertex.is_some() || self.fragment.is_some()
    }

    pub(crate) fn stages(&self) -> impl Iterator<Item = StageUniformLocation> {
        self.vertex.into_iter().chain(self.fragment)
    }
}

/// Merged uniform and input tables of a vertex/fragment pair. The program's
/// CPU uniform buffer holds the vertex stage first, then the fragment stage.
#[derive(Debug)]
pub struct ProgramLayout {
    vertex: Arc<ModuleReflection>,
    fragment: Arc<ModuleReflection>,
    locations: HashMap<String, UniformLocation>,
    builtin_locations: [UniformLocation; Uniform::COUNT],
}

impl ProgramLayout {
    fn empty() -> Self {
        Self {
            vertex: Arc::new(ModuleReflection::empty(ShaderStage::Vertex)),
            fragment: Arc::new(ModuleReflection::empty(ShaderStage::Fragment)),
            locations: HashMap::new(),
            builtin_locations: [UniformLocation::default(); Uniform::COUNT],
        }
    }

    /// Merge both stages. A uniform declared by both must agree on type and
    /// size.
    pub fn link(
        vertex: Arc<ModuleReflection>,
        fragment: Arc<ModuleReflection>,
    ) -> Result<Self, String> {
        let vs_size = vertex.uniform_buffer_size();
        let mut locations: HashMap<String, UniformLocation> = HashMap::new();

        for (name, info) in vertex.uniforms() {
            locations.entry(name.to_string()).or_default().vertex = Some(StageUniformLocation {
                location: info.location,
                offset: info.buffer_offset,
                size: info.size,
            });
        }
        for (name, info) in fragment.uniforms() {
            if let Some(other) = vertex.uniform_info(name) {
                if other.ty != info.ty || other.size != info.size {
                    return Err(format!(
                        "uniform '{name}' differs between stages: vertex {:?}/{} bytes, fragment {:?}/{} bytes",
                        other.ty, other.size, info.ty, info.size
                    ));
                }
            }
            let offset = if info.is_texture() {
                0
            } else {
                vs_size + info.buffer_offset
            };
            locations.entry(name.to_string()).or_default().fragment = Some(StageUniformLocation {
                location: info.location,
                offset,
                size: info.size,
            });
        }

        let mut builtin_locations = [UniformLocation::default(); Uniform::COUNT];
        for (slot, uniform) in Uniform::ALL.iter().enumerate() {
            builtin_locations[slot] = locations.get(uniform.name()).copied().unwrap_or_default();
        }

        Ok(Self {
            vertex,
            fragment,
            locations,
            builtin_locations,
        })
    }

    pub fn vertex(&self) -> &ModuleReflection {
        &self.vertex
    }

    pub fn fragment(&self) -> &ModuleReflection {
        &self.fragment
    }

    pub fn uniform_location(&self, name: &str) -> UniformLocation {
        self.locations.get(name).copied().unwrap_or_default()
    }

    pub fn builtin_uniform_location(&self, uniform: Uniform) -> UniformLocation {
        self.builtin_locations[uniform as usize]
    }

    pub fn vertex_input(&self, name: &str) -> Option<&VertexInputDesc> {
        self.vertex.vertex_input(name)
    }

    pub fn builtin_vertex_input(&self, kind: VertexInputKind) -> Option<&VertexInputDesc> {
        self.vertex.builtin_vertex_input(kind)
    }

    pub fn vertex_uniform_size(&self) -> usize {
        self.vertex.uniform_buffer_size() as usize
    }

    pub fn uniform_buffer_size(&self) -> usize {
        (self.vertex.uniform_buffer_size() + self.fragment.uniform_buffer_size()) as usize
    }

    /// Look up a value uniform by name in either stage.
    pub fn uniform_info(&self, name: &str) -> Option<(ShaderStage, &UniformInfo)> {
        if let Some(info) = self.vertex.uniform_info(name) {
            return Some((ShaderStage::Vertex, info));
        }
        self.fragment
            .uniform_info(name)
            .map(|info| (ShaderStage::Fragment, info))
    }
}

pub(crate) struct ShaderRecord<B: Backend> {
    pub(crate) native: Option<NativeShader<B>>,
    pub(crate) container: ShaderContainer,
}

pub(crate) struct ProgramRecord<B: Backend> {
    pub(crate) native: Option<NativeProgram<B>>,
    pub(crate) vertex: Handle<ShaderRecord<B>>,
    pub(crate) fragment: Handle<ShaderRecord<B>>,
    pub(crate) layout: Arc<ProgramLayout>,
}

struct ShaderInner<B: Backend> {
    shared: Arc<Shared<B>>,
    handle: Option<Handle<ShaderRecord<B>>>,
    stage: ShaderStage,
    reflection: Arc<ModuleReflection>,
    diagnostics: String,
    error: Option<GPUError>,
}

impl<B: Backend> Drop for ShaderInner<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            self.shared.release(Release::Shader(handle));
        }
    }
}

/// One compiled stage plus its reflection.
pub struct ShaderModule<B: Backend = DefaultBackend> {
    inner: Arc<ShaderInner<B>>,
}

impl<B: Backend> Clone for ShaderModule<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> ShaderModule<B> {
    pub(crate) fn create(shared: &Arc<Shared<B>>, stage: ShaderStage, source: &[u8]) -> Self {
        let invalid = |error: GPUError| {
            let diagnostics = diagnostics_of(&error);
            log::error!("{stage:?} shader rejected: {diagnostics}");
            Self {
                inner: Arc::new(ShaderInner {
                    shared: shared.clone(),
                    handle: None,
                    stage,
                    reflection: Arc::new(ModuleReflection::empty(stage)),
                    diagnostics,
                    error: Some(error),
                }),
            }
        };

        let container = match ShaderContainer::parse(source) {
            Ok(container) => container,
            Err(err) => return invalid(GPUError::Reflection(err)),
        };
        if container.stage != stage {
            return invalid(GPUError::ShaderCompile(format!(
                "container holds a {:?} stage",
                container.stage
            )));
        }
        let reflection = Arc::new(match &container.reflection {
            Some(refl) => ModuleReflection::from_reflection(stage, refl),
            None => ModuleReflection::empty(stage),
        });

        let mut state = shared.lock();
        let native = match state.device.create_shader(&container) {
            Ok(native) => native,
            Err(err) => {
                drop(state);
                return invalid(err);
            }
        };
        let handle = state.shaders.insert(ShaderRecord {
            native: Some(native),
            container,
        });
        drop(state);

        if handle.is_none() {
            return invalid(GPUError::Device("shader pool exhausted".to_string()));
        }
        Self {
            inner: Arc::new(ShaderInner {
                shared: shared.clone(),
                handle,
                stage,
                reflection,
                diagnostics: String::new(),
                error: None,
            }),
        }
    }

    pub(crate) fn handle(&self) -> Option<Handle<ShaderRecord<B>>> {
        self.inner.handle
    }

    pub fn is_valid(&self) -> bool {
        self.inner.handle.is_some()
    }

    pub fn stage(&self) -> ShaderStage {
        self.inner.stage
    }

    pub fn reflection(&self) -> &Arc<ModuleReflection> {
        &self.inner.reflection
    }

    /// Compiler or parser output for an invalid module.
    pub fn diagnostics(&self) -> &str {
        &self.inner.diagnostics
    }

    /// Why the module is invalid: [`GPUError::Reflection`] for a malformed
    /// container, [`GPUError::ShaderCompile`] for a compiler rejection.
    pub fn error(&self) -> Option<&GPUError> {
        self.inner.error.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

struct CachedModule<B: Backend> {
    source: Vec<u8>,
    module: Weak<ShaderInner<B>>,
}

/// Compiled modules keyed by stage and source hash. Entries are weak, so a
/// source compiles again once every user of the previous module is gone.
/// Invalid modules are never cached.
pub(crate) struct ShaderModuleCache<B: Backend> {
    modules: Mutex<HashMap<(ShaderStage, u64), CachedModule<B>>>,
}

impl<B: Backend> Default for ShaderModuleCache<B> {
    fn default() -> Self {
        Self {
            modules: Mutex::new(HashMap::new()),
        }
    }
}

impl<B: Backend> ShaderModuleCache<B> {
    pub(crate) fn get_or_create(
        &self,
        shared: &Arc<Shared<B>>,
        stage: ShaderStage,
        source: &[u8],
    ) -> ShaderModule<B> {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        let key = (stage, hasher.finish());

        let mut modules = lock(&self.modules);
        let live = modules
            .get(&key)
            .filter(|cached| cached.source == source)
            .and_then(|cached| cached.module.upgrade());
        if let Some(inner) = live {
            log::trace!("reusing compiled {stage:?} module {:016x}", key.1);
            return ShaderModule { inner };
        }

        let module = ShaderModule::create(shared, stage, source);
        if module.is_valid() {
            modules.retain(|_, cached| cached.module.strong_count() > 0);
            modules.insert(
                key,
                CachedModule {
                    source: source.to_vec(),
                    module: Arc::downgrade(&module.inner),
                },
            );
        }
        module
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.modules)
            .values()
            .filter(|cached| cached.module.strong_count() > 0)
            .count()
    }
}

struct ProgramInner<B: Backend> {
    shared: Arc<Shared<B>>,
    handle: Option<Handle<ProgramRecord<B>>>,
    vertex: ShaderModule<B>,
    fragment: ShaderModule<B>,
    layout: Arc<ProgramLayout>,
    diagnostics: String,
    error: Option<GPUError>,
}

impl<B: Backend> Drop for ProgramInner<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            self.shared.release(Release::Program(handle));
        }
    }
}

/// A linked vertex/fragment pair.
pub struct Program<B: Backend = DefaultBackend> {
    inner: Arc<ProgramInner<B>>,
}

impl<B: Backend> Clone for Program<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> PartialEq for Program<B> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<B: Backend> Program<B> {
    pub(crate) fn link(
        shared: &Arc<Shared<B>>,
        vertex: &ShaderModule<B>,
        fragment: &ShaderModule<B>,
    ) -> Self {
        let linked = ProgramLayout::link(vertex.reflection().clone(), fragment.reflection().clone());
        let (layout, mut error) = match linked {
            Ok(layout) => (Arc::new(layout), None),
            Err(err) => (Arc::new(ProgramLayout::empty()), Some(GPUError::ProgramLink(err))),
        };

        let mut handle = None;
        match (vertex.handle(), fragment.handle()) {
            _ if error.is_some() => {}
            (Some(vs), Some(fs)) => {
                let mut guard = shared.lock();
                let state = &mut *guard;
                let natives = state
                    .shaders
                    .get_ref(vs)
                    .and_then(|r| r.native.as_ref())
                    .zip(state.shaders.get_ref(fs).and_then(|r| r.native.as_ref()));
                match natives {
                    Some((vs_native, fs_native)) => {
                        match state.device.create_program(vs_native, fs_native, &layout) {
                            Ok(native) => {
                                handle = state.programs.insert(ProgramRecord {
                                    native: Some(native),
                                    vertex: vs,
                                    fragment: fs,
                                    layout: layout.clone(),
                                });
                            }
                            Err(err) => error = Some(err),
                        }
                    }
                    None => {
                        error = Some(GPUError::ProgramLink(
                            "shader stage has no native object".to_string(),
                        ))
                    }
                }
            }
            _ => {
                error = Some(GPUError::ProgramLink(format!(
                    "cannot link invalid stages: {}{}",
                    vertex.diagnostics(),
                    fragment.diagnostics()
                )));
            }
        }

        if handle.is_none() && error.is_none() {
            error = Some(GPUError::Device("program pool exhausted".to_string()));
        }
        let diagnostics = error.as_ref().map(diagnostics_of).unwrap_or_default();
        if handle.is_none() {
            log::error!("program link failed: {diagnostics}");
        }

        Self {
            inner: Arc::new(ProgramInner {
                shared: shared.clone(),
                handle,
                vertex: vertex.clone(),
                fragment: fragment.clone(),
                layout,
                diagnostics,
                error,
            }),
        }
    }

    pub(crate) fn handle(&self) -> Option<Handle<ProgramRecord<B>>> {
        self.inner.handle
    }

    pub fn is_valid(&self) -> bool {
        self.inner.handle.is_some()
    }

    pub fn diagnostics(&self) -> &str {
        &self.inner.diagnostics
    }

    pub fn error(&self) -> Option<&GPUError> {
        self.inner.error.as_ref()
    }

    pub fn layout(&self) -> &Arc<ProgramLayout> {
        &self.inner.layout
    }

    pub fn vertex_shader(&self) -> &ShaderModule<B> {
        &self.inner.vertex
    }

    pub fn fragment_shader(&self) -> &ShaderModule<B> {
        &self.inner.fragment
    }

    pub fn uniform_location(&self, name: &str) -> UniformLocation {
        self.inner.layout.uniform_location(name)
    }

    pub fn builtin_uniform_location(&self, uniform: Uniform) -> UniformLocation {
        self.inner.layout.builtin_uniform_location(uniform)
    }

    pub fn vertex_input(&self, name: &str) -> Option<&VertexInputDesc> {
        self.inner.layout.vertex_input(name)
    }

    pub fn builtin_vertex_input(&self, kind: VertexInputKind) -> Option<&VertexInputDesc> {
        self.inner.layout.builtin_vertex_input(kind)
    }

    pub fn uniform_buffer_size(&self) -> usize {
        self.inner.layout.uniform_buffer_size()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// Compiler and linker logs are kept verbatim; other errors use their message.
fn diagnostics_of(error: &GPUError) -> String {
    match error {
        GPUError::ShaderCompile(log) | GPUError::ProgramLink(log) => log.clone(),
        other => other.to_string(),
    }
}

/// Recompile a stored container against a fresh device.
pub(crate) fn recreate_shader<D: Device>(device: &mut D, container: &ShaderContainer) -> Option<D::Shader> {
    match device.create_shader(container) {
        Ok(native) => Some(native),
        Err(err) => {
            log::error!("shader recompile after device loss failed: {err}");
            None
        }
    }
}
