use std::sync::{Arc, Mutex};

use super::driver::{DriverState, NativeViews, Release, Shared};
use super::{
    Backend, DefaultBackend, Device, GPUError, Result, TargetBufferFlags, Texture,
    MAX_COLOR_ATTACHMENTS,
};
use crate::utils::{lock, Handle};

pub(crate) struct TargetRecord<B: Backend> {
    pub(crate) views: NativeViews<B>,
    /// Set after device recreation: every view must be rebuilt on next bind.
    pub(crate) stale: bool,
}

struct Attachments<B: Backend> {
    colors: Vec<(Texture<B>, u32)>,
    depth_stencil: Option<(Texture<B>, u32)>,
    dirty: TargetBufferFlags,
}

struct TargetInner<B: Backend> {
    shared: Arc<Shared<B>>,
    handle: Option<Handle<TargetRecord<B>>>,
    default: bool,
    attachments: Mutex<Attachments<B>>,
}

impl<B: Backend> Drop for TargetInner<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            self.shared.release(Release::Target(handle));
        }
    }
}

/// Up to four color attachments plus an optional depth-stencil attachment.
/// The default target renders to the swap chain and has no attachments of
/// its own.
pub struct RenderTarget<B: Backend = DefaultBackend> {
    inner: Arc<TargetInner<B>>,
}

impl<B: Backend> Clone for RenderTarget<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> PartialEq for RenderTarget<B> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<B: Backend> RenderTarget<B> {
    pub(crate) fn create(shared: &Arc<Shared<B>>) -> Self {
        let mut state = shared.lock();
        let views = state.device.create_target_views();
        let handle = state.targets.insert(TargetRecord { views, stale: false });
        drop(state);
        if handle.is_none() {
            log::error!("render target pool exhausted");
        }
        Self::from_parts(shared, handle, false)
    }

    pub(crate) fn create_default(shared: &Arc<Shared<B>>) -> Self {
        Self::from_parts(shared, None, true)
    }

    fn from_parts(shared: &Arc<Shared<B>>, handle: Option<Handle<TargetRecord<B>>>, default: bool) -> Self {
        Self {
            inner: Arc::new(TargetInner {
                shared: shared.clone(),
                handle,
                default,
                attachments: Mutex::new(Attachments {
                    colors: Vec::new(),
                    depth_stencil: None,
                    dirty: TargetBufferFlags::empty(),
                }),
            }),
        }
    }

    /// Attach `texture` at color `index`, or detach it with `None`.
    ///
    /// Attachments stay contiguous from index 0: attaching past the end
    /// fails with [`GPUError::AttachmentGap`], and only the last attachment
    /// can be detached.
    pub fn set_color_texture(
        &self,
        index: usize,
        texture: Option<&Texture<B>>,
        level: u32,
    ) -> Result<()> {
        if self.inner.default {
            return Err(GPUError::Unsupported(
                "the default render target takes its attachments from the swap chain".into(),
            ));
        }
        if index >= MAX_COLOR_ATTACHMENTS {
            return Err(GPUError::AttachmentIndex(index));
        }

        let mut att = lock(&self.inner.attachments);
        let count = att.colors.len();
        match texture {
            Some(texture) => {
                if !texture.is_valid() {
                    return Err(GPUError::InvalidResource);
                }
                if index > count {
                    return Err(GPUError::AttachmentGap { index, count });
                }
                if index == count {
                    att.colors.push((texture.clone(), level));
                } else {
                    att.colors[index] = (texture.clone(), level);
                }
            }
            None => {
                if index >= count {
                    return Ok(());
                }
                if index + 1 != count {
                    return Err(GPUError::AttachmentGap { index, count });
                }
                att.colors.pop();
            }
        }
        att.dirty |= TargetBufferFlags::color(index);
        Ok(())
    }

    pub fn set_depth_stencil_texture(&self, texture: Option<&Texture<B>>, level: u32) -> Result<()> {
        if self.inner.default {
            return Err(GPUError::Unsupported(
                "the default render target takes its attachments from the swap chain".into(),
            ));
        }
        if let Some(texture) = texture {
            if !texture.format().is_depth() {
                return Err(GPUError::NotDepthFormat(format!("{:?}", texture.format())));
            }
            if !texture.is_valid() {
                return Err(GPUError::InvalidResource);
            }
        }
        let mut att = lock(&self.inner.attachments);
        att.depth_stencil = texture.map(|texture| (texture.clone(), level));
        att.dirty |= TargetBufferFlags::DEPTH_AND_STENCIL;
        Ok(())
    }

    pub fn color_attachment_count(&self) -> usize {
        lock(&self.inner.attachments).colors.len()
    }

    pub fn color_texture(&self, index: usize) -> Option<Texture<B>> {
        lock(&self.inner.attachments)
            .colors
            .get(index)
            .map(|(texture, _)| texture.clone())
    }

    pub fn depth_stencil_texture(&self) -> Option<Texture<B>> {
        lock(&self.inner.attachments)
            .depth_stencil
            .as_ref()
            .map(|(texture, _)| texture.clone())
    }

    /// Attachments changed since the last bind.
    pub fn dirty_flags(&self) -> TargetBufferFlags {
        lock(&self.inner.attachments).dirty
    }

    pub fn is_color_dirty(&self, index: usize) -> bool {
        index < MAX_COLOR_ATTACHMENTS && self.dirty_flags().has_color(index)
    }

    pub fn is_depth_stencil_dirty(&self) -> bool {
        self.dirty_flags().has_depth_stencil()
    }

    pub fn is_default(&self) -> bool {
        self.inner.default
    }

    /// Size of the first attachment, or `None` for the default target and
    /// targets without attachments.
    pub fn size(&self) -> Option<(u32, u32)> {
        let att = lock(&self.inner.attachments);
        let (texture, level) = att.colors.first().or(att.depth_stencil.as_ref())?;
        Some((
            texture.width().checked_shr(*level).unwrap_or(0).max(1),
            texture.height().checked_shr(*level).unwrap_or(0).max(1),
        ))
    }

    /// Mip level bound at color `index`.
    pub(crate) fn color_attachment(&self, index: usize) -> Option<(Texture<B>, u32)> {
        lock(&self.inner.attachments).colors.get(index).cloned()
    }

    /// Rebuild dirty views and bind the target. Runs with the driver lock
    /// held.
    pub(crate) fn bind(&self, state: &mut DriverState<B>) -> Result<()> {
        let Some(handle) = self.inner.handle else {
            if !self.inner.default {
                return Err(GPUError::InvalidResource);
            }
            state.device.bind_target(None);
            return Ok(());
        };

        let mut att = lock(&self.inner.attachments);
        let rec = state
            .targets
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidResource)?;
        let mut dirty = att.dirty;
        if rec.stale {
            dirty = TargetBufferFlags::ALL;
            rec.stale = false;
        }

        if !dirty.is_empty() {
            log::debug!("rebuilding render target views {dirty:?}");
        }
        for index in 0..MAX_COLOR_ATTACHMENTS {
            if !dirty.has_color(index) {
                continue;
            }
            let native = att.colors.get(index).and_then(|(texture, level)| {
                let handle = texture.handle()?;
                let native = &state.textures.get_ref(handle)?.native;
                Some((native, *level))
            });
            state.device.update_color_view(&mut rec.views, index, native);
        }
        if dirty.has_depth_stencil() {
            let native = att.depth_stencil.as_ref().and_then(|(texture, level)| {
                let handle = texture.handle()?;
                let native = &state.textures.get_ref(handle)?.native;
                Some((native, *level))
            });
            state.device.update_depth_stencil_view(&mut rec.views, native);
        }
        att.dirty = TargetBufferFlags::empty();

        state.device.bind_target(Some(&rec.views));
        Ok(())
    }
}
