/// Defines the interface that rendering backends must implement.
///
/// A backend is chosen at build time. It wraps one graphics API and
/// exposes a [`Device`] that realizes every resource the
/// [`Driver`] hands out.
///
/// # Examples
/// ```ignore
/// use rhi::gpu::{Backend, DriverConfig};
/// fn init<B: Backend>(config: &DriverConfig) -> rhi::Result<B::Device> {
///     B::create_device(config)
/// }
/// ```
pub trait Backend: Sized + Send + Sync + 'static {
    /// Backend specific device used for resource creation and drawing.
    type Device: Device;

    const NAME: &'static str;

    /// Create the device. Version or capability checks that fail here are
    /// unrecoverable and terminate the process in [`Driver::new`].
    fn create_device(config: &DriverConfig) -> Result<Self::Device>;
}

/// Where a readback takes its pixels from.
pub enum ReadSource<'a, T> {
    /// The swap chain backbuffer, restricted to a rectangle.
    Backbuffer(ScissorRect),
    /// Mip `level` of a color texture.
    Texture(&'a T, u32),
}

/// Subresource addressed by a texture upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub level: u32,
    /// Array layer or cube face.
    pub layer: u32,
    pub compressed: bool,
}

impl TextureRegion {
    /// Whether the region lies inside a `width` x `height` image. Extents
    /// that overflow `u32` never fit.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        let right = self.x.checked_add(self.width);
        let bottom = self.y.checked_add(self.height);
        matches!((right, bottom), (Some(r), Some(b)) if r <= width && b <= height)
    }
}

pub enum DrawKind<'a, B> {
    Arrays {
        start: u32,
        count: u32,
    },
    Elements {
        index_buffer: &'a B,
        format: IndexFormat,
        count: u32,
        /// Byte offset into the index buffer.
        offset: usize,
    },
}

pub struct DrawCall<'a, B> {
    pub primitive: PrimitiveType,
    pub kind: DrawKind<'a, B>,
    /// 1 for non-instanced draws. Zero draws nothing.
    pub instance_count: u32,
    pub wireframe: bool,
}

/// Native half of a backend. Every method runs on the render thread with
/// the driver lock held.
pub trait Device: Send + 'static {
    type Buffer: Send + 'static;
    type Texture: Send + 'static;
    type Shader: Send + 'static;
    type Program: Send + 'static;
    type TargetViews: Send + 'static;
    type BlendState: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static;
    type DepthStencil: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static;
    type Sampler: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static;

    fn info(&self) -> DeviceInfo;
    fn capabilities(&self) -> Capabilities;
    /// Probe a feature once. The driver caches the answer.
    fn probe_feature(&mut self, feature: FeatureType) -> bool;
    /// Whether readbacks come back with the bottom row first.
    fn bottom_up(&self) -> bool;

    fn create_buffer(&mut self, desc: &BufferDesc, data: Option<&[u8]>) -> Result<Self::Buffer>;
    fn update_buffer(&mut self, buffer: &mut Self::Buffer, offset: usize, data: &[u8]);
    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<Self::Texture>;
    fn update_texture(
        &mut self,
        texture: &mut Self::Texture,
        region: &TextureRegion,
        data: &[u8],
    ) -> Result<()>;
    fn generate_mipmaps(&mut self, texture: &mut Self::Texture);
    fn destroy_texture(&mut self, texture: Self::Texture);
    /// Realize a sampler object. The driver caches the result per
    /// descriptor, so this runs once per distinct [`SamplerDesc`] and epoch.
    fn create_sampler(&mut self, desc: &SamplerDesc) -> Self::Sampler;

    /// Compile one stage. Failures are [`GPUError::ShaderCompile`] carrying
    /// the compiler log.
    fn create_shader(&mut self, container: &ShaderContainer) -> Result<Self::Shader>;
    fn destroy_shader(&mut self, shader: Self::Shader);
    /// Link a program. Failures are [`GPUError::ProgramLink`] carrying the
    /// linker log.
    fn create_program(
        &mut self,
        vertex: &Self::Shader,
        fragment: &Self::Shader,
        layout: &Arc<ProgramLayout>,
    ) -> Result<Self::Program>;
    fn destroy_program(&mut self, program: Self::Program);

    fn create_target_views(&mut self) -> Self::TargetViews;
    fn update_color_view(
        &mut self,
        views: &mut Self::TargetViews,
        index: usize,
        attachment: Option<(&Self::Texture, u32)>,
    );
    fn update_depth_stencil_view(
        &mut self,
        views: &mut Self::TargetViews,
        attachment: Option<(&Self::Texture, u32)>,
    );
    fn destroy_target_views(&mut self, views: Self::TargetViews);
    /// Bind a target; `None` selects the backbuffer.
    fn bind_target(&mut self, views: Option<&Self::TargetViews>);
    /// Clear the bound target. Any state forced for the clear is restored.
    fn clear(&mut self, flags: TargetBufferFlags, desc: &RenderPassDesc);

    fn create_blend_state(&mut self, desc: &BlendDesc) -> Self::BlendState;
    fn apply_blend_state(&mut self, state: &Self::BlendState);
    fn create_depth_stencil_state(&mut self, desc: &DepthStencilDesc) -> Self::DepthStencil;
    /// `None` disables depth and stencil testing.
    fn apply_depth_stencil_state(&mut self, state: Option<&Self::DepthStencil>, stencil_ref: u32);
    fn set_viewport(&mut self, viewport: &Viewport);
    fn apply_rasterizer_state(&mut self, state: &RasterizerState);

    fn bind_program(&mut self, program: &Self::Program);
    fn bind_vertex_input(
        &mut self,
        layout: &VertexLayout,
        vertex: &Self::Buffer,
        instance: Option<&Self::Buffer>,
    );
    fn upload_uniforms(&mut self, program: &mut Self::Program, vertex: &[u8], fragment: &[u8]);
    fn bind_texture(
        &mut self,
        program: &Self::Program,
        slot: u32,
        texture: &Self::Texture,
        sampler: &Self::Sampler,
    );
    fn draw(&mut self, call: &DrawCall<'_, Self::Buffer>);
    /// Drop per-pass bindings, including texture units.
    fn end_pass(&mut self);

    fn begin_frame(&mut self) -> Result<()>;
    /// Present the backbuffer. Device removal surfaces as
    /// [`GPUError::DeviceLost`].
    fn present(&mut self) -> Result<()>;
    fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()>;
    fn swap_chain_size(&self) -> (u32, u32);
    /// Read RGBA8 pixels in the device's native row order.
    fn read_pixels(&mut self, source: ReadSource<'_, Self::Texture>) -> Result<PixelBuffer>;

    fn is_lost(&self) -> bool;
    /// Replace the lost native context. Handles created before the call are
    /// dead and must not be passed back.
    fn recreate(&mut self) -> Result<()>;
    /// Forget all cached native state so the next call re-emits it.
    fn reset_state(&mut self);
}

pub mod builders;
pub mod command_buffer;
pub mod config;
pub mod driver;
pub mod error;
pub mod format;
pub mod opengl;
pub mod pipeline_cache;
pub mod pipeline_state;
pub mod program;
pub mod program_state;
pub mod reflect;
pub mod render_target;
pub mod resources;
pub mod soft;
pub mod structs;
pub mod vertex_layout;

pub use builders::*;
pub use command_buffer::*;
pub use config::*;
pub use driver::*;
pub use error::*;
pub use pipeline_cache::{PipelineCache, SamplerCache};
pub use pipeline_state::*;
pub use program::*;
pub use program_state::*;
pub use reflect::ShaderContainer;
pub use render_target::*;
pub use resources::*;
pub use structs::*;
pub use vertex_layout::*;

use std::sync::Arc;

#[cfg(feature = "rhi-gl")]
pub type DefaultBackend = opengl::GlBackend;
#[cfg(not(feature = "rhi-gl"))]
pub type DefaultBackend = soft::SoftBackend;
