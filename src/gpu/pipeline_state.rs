use std::sync::{Arc, Mutex};

use super::driver::{NativeBlendState, NativeDepthStencil, Shared};
use super::{
    Backend, BlendDesc, DefaultBackend, DepthStencilDesc, Device, ProgramState, VertexLayout,
};
use crate::utils::lock;

/// State bundled by [`CommandBuffer::update_pipeline_state`](super::CommandBuffer::update_pipeline_state).
pub struct PipelineDesc<B: Backend = DefaultBackend> {
    pub program_state: Option<ProgramState<B>>,
    pub vertex_layout: Option<VertexLayout>,
    pub blend_desc: BlendDesc,
}

impl<B: Backend> Default for PipelineDesc<B> {
    fn default() -> Self {
        Self {
            program_state: None,
            vertex_layout: None,
            blend_desc: BlendDesc::default(),
        }
    }
}

impl<B: Backend> Clone for PipelineDesc<B> {
    fn clone(&self) -> Self {
        Self {
            program_state: self.program_state.clone(),
            vertex_layout: self.vertex_layout.clone(),
            blend_desc: self.blend_desc,
        }
    }
}

/// Cached native object plus the device epoch it was created in.
struct Realized<T> {
    epoch: u64,
    native: T,
}

struct PipelineInner<B: Backend> {
    blend_desc: BlendDesc,
    blend: Option<Realized<NativeBlendState<B>>>,
}

/// Blend configuration. Realized through the driver's blend-state cache, so
/// identical descriptors share one native object.
pub struct RenderPipeline<B: Backend = DefaultBackend> {
    shared: Arc<Shared<B>>,
    inner: Arc<Mutex<PipelineInner<B>>>,
}

impl<B: Backend> Clone for RenderPipeline<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> RenderPipeline<B> {
    pub(crate) fn new(shared: &Arc<Shared<B>>) -> Self {
        Self {
            shared: shared.clone(),
            inner: Arc::new(Mutex::new(PipelineInner {
                blend_desc: BlendDesc::default(),
                blend: None,
            })),
        }
    }

    pub fn blend_desc(&self) -> BlendDesc {
        lock(&self.inner).blend_desc
    }

    /// Resolve `desc` to a native blend state, creating it on a cache miss.
    /// Runs with the driver lock held.
    pub(crate) fn realize(&self, device: &mut B::Device, desc: &BlendDesc) -> NativeBlendState<B> {
        let mut inner = lock(&self.inner);
        let epoch = self.shared.epoch();
        if let Some(realized) = &inner.blend {
            if realized.epoch == epoch && inner.blend_desc == *desc {
                return realized.native.clone();
            }
        }
        let native = self
            .shared
            .blend_states
            .get_or_create(desc, |desc| device.create_blend_state(desc));
        inner.blend_desc = *desc;
        inner.blend = Some(Realized {
            epoch,
            native: native.clone(),
        });
        native
    }
}

struct DepthStencilInner<B: Backend> {
    desc: DepthStencilDesc,
    native: Option<Realized<NativeDepthStencil<B>>>,
}

/// Depth and stencil configuration, realized lazily through the driver's
/// depth-stencil cache.
pub struct DepthStencilState<B: Backend = DefaultBackend> {
    shared: Arc<Shared<B>>,
    inner: Arc<Mutex<DepthStencilInner<B>>>,
}

impl<B: Backend> Clone for DepthStencilState<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> PartialEq for DepthStencilState<B> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<B: Backend> DepthStencilState<B> {
    pub(crate) fn new(shared: &Arc<Shared<B>>) -> Self {
        Self {
            shared: shared.clone(),
            inner: Arc::new(Mutex::new(DepthStencilInner {
                desc: DepthStencilDesc::default(),
                native: None,
            })),
        }
    }

    pub fn update(&self, desc: &DepthStencilDesc) {
        let mut inner = lock(&self.inner);
        if inner.desc != *desc {
            inner.desc = *desc;
            inner.native = None;
        }
    }

    pub fn desc(&self) -> DepthStencilDesc {
        lock(&self.inner).desc
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.inner).desc.is_enabled()
    }

    /// Native state to apply, or `None` when depth and stencil tests are off.
    pub(crate) fn realize(&self, device: &mut B::Device) -> Option<NativeDepthStencil<B>> {
        let mut inner = lock(&self.inner);
        if !inner.desc.is_enabled() {
            return None;
        }
        let epoch = self.shared.epoch();
        if let Some(realized) = &inner.native {
            if realized.epoch == epoch {
                return Some(realized.native.clone());
            }
        }
        let desc = inner.desc;
        let native = self
            .shared
            .depth_stencil_states
            .get_or_create(&desc, |desc| device.create_depth_stencil_state(desc));
        inner.native = Some(Realized {
            epoch,
            native: native.clone(),
        });
        Some(native)
    }
}
