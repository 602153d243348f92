use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::driver::{NativeBuffer, NativeTexture, Release, Shared};
use super::format::{format_info, resolve_format};
use super::{
    fatal, full_mip_chain, Backend, BufferType, BufferUsage, DefaultBackend, Device, GPUError,
    PixelFormat, Result, SamplerDesc, TextureCubeFace, TextureDesc, TextureRegion, TextureType,
    TextureUsage,
};
use crate::utils::{lock, Handle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDesc {
    pub size: usize,
    pub buffer_type: BufferType,
    pub usage: BufferUsage,
}

pub(crate) struct BufferRecord<B: Backend> {
    pub(crate) native: NativeBuffer<B>,
    desc: BufferDesc,
    /// CPU copy used to restore content after device loss.
    shadow: Option<Vec<u8>>,
    written: bool,
}

impl<B: Backend> BufferRecord<B> {
    pub(crate) fn recreate(&mut self, device: &mut B::Device) -> Result<()> {
        let zeroed;
        let data = match &self.shadow {
            Some(shadow) => shadow.as_slice(),
            None => {
                if self.written {
                    log::warn!(
                        "{:?} buffer of {} bytes has no shadow copy, content is lost",
                        self.desc.buffer_type,
                        self.desc.size
                    );
                }
                zeroed = vec![0; self.desc.size];
                zeroed.as_slice()
            }
        };
        self.native = device.create_buffer(&self.desc, Some(data))?;
        Ok(())
    }
}

struct BufferInner<B: Backend> {
    shared: Arc<Shared<B>>,
    handle: Handle<BufferRecord<B>>,
    desc: BufferDesc,
}

impl<B: Backend> Drop for BufferInner<B> {
    fn drop(&mut self) {
        self.shared.release(Release::Buffer(self.handle));
    }
}

/// GPU memory region. Clones share the native buffer, which is destroyed
/// when the last clone drops.
pub struct Buffer<B: Backend = DefaultBackend> {
    inner: Arc<BufferInner<B>>,
}

impl<B: Backend> Clone for Buffer<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> PartialEq for Buffer<B> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<B: Backend> std::fmt::Debug for Buffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("desc", &self.inner.desc)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl<B: Backend> Buffer<B> {
    pub(crate) fn create(
        shared: &Arc<Shared<B>>,
        size: usize,
        buffer_type: BufferType,
        usage: BufferUsage,
        data: Option<&[u8]>,
    ) -> Result<Self> {
        let desc = BufferDesc {
            size,
            buffer_type,
            usage,
        };
        if let Some(data) = data {
            if data.len() > size {
                return Err(GPUError::BufferOverflow {
                    offset: 0,
                    size: data.len(),
                    capacity: size,
                });
            }
        }

        let mut state = shared.lock();
        let native = match state.device.create_buffer(&desc, data) {
            Ok(native) => native,
            Err(err) => {
                drop(state);
                fatal(&format!("cannot allocate {size} byte {buffer_type:?} buffer: {err}"));
            }
        };
        let mut shadow = vec![0; size];
        if let Some(data) = data {
            shadow[..data.len()].copy_from_slice(data);
        }
        let handle = state.buffers.insert(BufferRecord {
            native,
            desc,
            shadow: Some(shadow),
            written: data.is_some(),
        });
        drop(state);

        let handle = handle.ok_or_else(|| GPUError::Device("buffer pool exhausted".into()))?;
        Ok(Self {
            inner: Arc::new(BufferInner {
                shared: shared.clone(),
                handle,
                desc,
            }),
        })
    }

    pub(crate) fn handle(&self) -> Handle<BufferRecord<B>> {
        self.inner.handle
    }

    /// Replace the buffer's content from offset zero.
    pub fn update_data(&self, data: &[u8]) -> Result<()> {
        self.update_sub_data(data, 0)
    }

    /// Write `data` at `offset`. Writes past the capacity are rejected
    /// whole, and an immutable buffer accepts exactly one write.
    pub fn update_sub_data(&self, data: &[u8], offset: usize) -> Result<()> {
        let capacity = self.inner.desc.size;
        let end = offset.checked_add(data.len());
        if end.map_or(true, |end| end > capacity) {
            return Err(GPUError::BufferOverflow {
                offset,
                size: data.len(),
                capacity,
            });
        }

        let mut guard = self.inner.shared.lock();
        let state = &mut *guard;
        let rec = state
            .buffers
            .get_mut_ref(self.inner.handle)
            .ok_or(GPUError::InvalidResource)?;
        if rec.desc.usage == BufferUsage::Immutable && rec.written {
            return Err(GPUError::ImmutableBuffer);
        }
        rec.written = true;
        state.device.update_buffer(&mut rec.native, offset, data);
        if let Some(shadow) = rec.shadow.as_mut() {
            shadow[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    /// Keep (default) or drop the CPU copy restored after device loss.
    pub fn retain_shadow_copy(&self, retain: bool) {
        let mut state = self.inner.shared.lock();
        if let Some(rec) = state.buffers.get_mut_ref(self.inner.handle) {
            match (retain, rec.shadow.is_some()) {
                (false, _) => rec.shadow = None,
                // Content written before retention was enabled is unknown.
                (true, false) => rec.shadow = Some(vec![0; rec.desc.size]),
                (true, true) => {}
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner.desc.size
    }

    pub fn buffer_type(&self) -> BufferType {
        self.inner.desc.buffer_type
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.desc.usage
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[derive(Debug, Clone)]
struct RetainedImage {
    width: u32,
    height: u32,
    compressed: bool,
    data: Vec<u8>,
}

pub(crate) struct TextureRecord<B: Backend> {
    pub(crate) native: NativeTexture<B>,
    desc: TextureDesc,
    /// Uploads keyed by (layer, level).
    retained: BTreeMap<(u32, u32), RetainedImage>,
    uploaded: bool,
    mipmaps_generated: bool,
    mip_count: Option<u32>,
}

impl<B: Backend> TextureRecord<B> {
    pub(crate) fn sampler(&self) -> &SamplerDesc {
        &self.desc.sampler
    }

    pub(crate) fn recreate(&mut self, device: &mut B::Device, restore: bool) -> Result<()> {
        self.native = device.create_texture(&self.desc)?;
        if !restore || self.retained.is_empty() {
            if self.uploaded {
                log::warn!(
                    "{}x{} {:?} texture content was not retained and is lost",
                    self.desc.width,
                    self.desc.height,
                    self.desc.format
                );
            }
            return Ok(());
        }
        for (&(layer, level), image) in &self.retained {
            let region = TextureRegion {
                x: 0,
                y: 0,
                width: image.width,
                height: image.height,
                level,
                layer,
                compressed: image.compressed,
            };
            device.update_texture(&mut self.native, &region, &image.data)?;
        }
        if self.mipmaps_generated {
            device.generate_mipmaps(&mut self.native);
        }
        Ok(())
    }

    /// Fold an upload into the retained copy of its level.
    fn retain(&mut self, region: &TextureRegion, data: &[u8]) {
        let level_w = level_extent(self.desc.width, region.level);
        let level_h = level_extent(self.desc.height, region.level);
        let key = (region.layer, region.level);

        if region.x == 0 && region.y == 0 && region.width == level_w && region.height == level_h {
            let size = self.desc.format.data_size(level_w, level_h);
            self.retained.insert(
                key,
                RetainedImage {
                    width: level_w,
                    height: level_h,
                    compressed: region.compressed,
                    data: data[..size.min(data.len())].to_vec(),
                },
            );
            return;
        }

        let bytes_per_pixel = (format_info(self.desc.format).bpp / 8) as usize;
        if region.compressed || bytes_per_pixel == 0 {
            log::debug!("partial compressed upload at level {} is not retained", region.level);
            return;
        }
        let format = self.desc.format;
        let image = self.retained.entry(key).or_insert_with(|| RetainedImage {
            width: level_w,
            height: level_h,
            compressed: false,
            data: vec![0; format.data_size(level_w, level_h)],
        });
        let src_stride = region.width as usize * bytes_per_pixel;
        let dst_stride = image.width as usize * bytes_per_pixel;
        for row in 0..region.height as usize {
            let src = &data[row * src_stride..(row + 1) * src_stride];
            let at = (region.y as usize + row) * dst_stride + region.x as usize * bytes_per_pixel;
            image.data[at..at + src_stride].copy_from_slice(src);
        }
    }
}

fn level_extent(extent: u32, level: u32) -> u32 {
    (extent >> level.min(31)).max(1)
}

struct TextureInner<B: Backend> {
    shared: Arc<Shared<B>>,
    handle: Option<Handle<TextureRecord<B>>>,
    /// Descriptor with the format actually in use.
    desc: TextureDesc,
    requested_format: PixelFormat,
    sampler: Mutex<SamplerDesc>,
}

impl<B: Backend> Drop for TextureInner<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            self.shared.release(Release::Texture(handle));
        }
    }
}

/// GPU image plus its sampler. An invalid texture (creation failed) rejects
/// every update with [`GPUError::InvalidResource`].
pub struct Texture<B: Backend = DefaultBackend> {
    inner: Arc<TextureInner<B>>,
}

impl<B: Backend> Clone for Texture<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> PartialEq for Texture<B> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<B: Backend> std::fmt::Debug for Texture<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("desc", &self.inner.desc)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl<B: Backend> Texture<B> {
    pub(crate) fn create(shared: &Arc<Shared<B>>, desc: &TextureDesc) -> Self {
        let mut resolved = *desc;
        resolved.format = resolve_format(desc.format, |feature| shared.feature(feature));

        let invalid = |reason: String| {
            log::error!("texture creation failed: {reason}");
            Self::from_parts(shared, None, resolved, desc.format)
        };
        if resolved.format == PixelFormat::None {
            return invalid("no pixel format".into());
        }
        if desc.usage == TextureUsage::RenderTarget && resolved.format.is_compressed() {
            return invalid(format!("{:?} cannot be rendered to", resolved.format));
        }
        let limit = shared.capabilities().max_texture_size;
        let too_large = limit != 0 && resolved.width.max(resolved.height) > limit;
        if resolved.width == 0 || resolved.height == 0 || too_large {
            return invalid(format!(
                "size {}x{} outside 1..={limit}",
                resolved.width, resolved.height
            ));
        }

        let mut state = shared.lock();
        let native = match state.device.create_texture(&resolved) {
            Ok(native) => native,
            Err(err) => {
                drop(state);
                return invalid(err.to_string());
            }
        };
        let handle = state.textures.insert(TextureRecord {
            native,
            desc: resolved,
            retained: BTreeMap::new(),
            uploaded: false,
            mipmaps_generated: false,
            mip_count: None,
        });
        drop(state);

        if handle.is_none() {
            return invalid("texture pool exhausted".into());
        }
        Self::from_parts(shared, handle, resolved, desc.format)
    }

    fn from_parts(
        shared: &Arc<Shared<B>>,
        handle: Option<Handle<TextureRecord<B>>>,
        desc: TextureDesc,
        requested_format: PixelFormat,
    ) -> Self {
        Self {
            inner: Arc::new(TextureInner {
                shared: shared.clone(),
                handle,
                desc,
                requested_format,
                sampler: Mutex::new(desc.sampler),
            }),
        }
    }

    pub(crate) fn handle(&self) -> Option<Handle<TextureRecord<B>>> {
        self.inner.handle
    }

    fn upload(&self, region: TextureRegion, data: &[u8]) -> Result<()> {
        let handle = self.inner.handle.ok_or(GPUError::InvalidResource)?;
        let desc = &self.inner.desc;
        let level_w = level_extent(desc.width, region.level);
        let level_h = level_extent(desc.height, region.level);
        if !region.fits(level_w, level_h) {
            return Err(GPUError::InvalidData(format!(
                "region {}x{} at ({}, {}) exceeds level {} extent {level_w}x{level_h}",
                region.width, region.height, region.x, region.y, region.level
            )));
        }
        if region.layer >= desc.layer_count() {
            return Err(GPUError::InvalidData(format!(
                "layer {} out of {}",
                region.layer,
                desc.layer_count()
            )));
        }
        let needed = desc.format.data_size(region.width, region.height);
        if data.len() < needed {
            return Err(GPUError::InvalidData(format!(
                "{} bytes supplied, {:?} {}x{} needs {needed}",
                data.len(),
                desc.format,
                region.width,
                region.height
            )));
        }

        let retain = self.inner.shared.config.recovery.retain_texture_data
            && desc.usage != TextureUsage::RenderTarget;
        let mut guard = self.inner.shared.lock();
        let state = &mut *guard;
        let rec = state
            .textures
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidResource)?;
        state.device.update_texture(&mut rec.native, &region, &data[..needed])?;
        rec.uploaded = true;
        if retain {
            rec.retain(&region, &data[..needed]);
        }
        Ok(())
    }

    fn check_compressed(&self, compressed: bool) -> Result<()> {
        let format = self.inner.desc.format;
        if compressed && self.inner.requested_format != format {
            return Err(GPUError::Unsupported(format!(
                "{:?} data was substituted by {:?}; decode it before upload",
                self.inner.requested_format, format
            )));
        }
        if compressed != format.is_compressed() {
            return Err(GPUError::InvalidData(format!(
                "{:?} upload does not match texture format {format:?}",
                if compressed { "compressed" } else { "uncompressed" }
            )));
        }
        Ok(())
    }

    /// Upload a whole mip level.
    pub fn update_data(&self, data: &[u8], width: u32, height: u32, level: u32) -> Result<()> {
        self.update_sub_data(0, 0, width, height, level, data)
    }

    pub fn update_sub_data(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        level: u32,
        data: &[u8],
    ) -> Result<()> {
        self.check_compressed(false)?;
        self.upload(
            TextureRegion {
                x,
                y,
                width,
                height,
                level,
                layer: 0,
                compressed: false,
            },
            data,
        )
    }

    pub fn update_compressed_data(&self, data: &[u8], width: u32, height: u32, level: u32) -> Result<()> {
        self.update_compressed_sub_data(0, 0, width, height, level, data)
    }

    pub fn update_compressed_sub_data(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        level: u32,
        data: &[u8],
    ) -> Result<()> {
        self.check_compressed(true)?;
        self.upload(
            TextureRegion {
                x,
                y,
                width,
                height,
                level,
                layer: 0,
                compressed: true,
            },
            data,
        )
    }

    /// Upload a whole mip level of one cube face.
    pub fn update_face_data(&self, face: TextureCubeFace, data: &[u8], level: u32) -> Result<()> {
        if self.inner.desc.texture_type != TextureType::TextureCube {
            return Err(GPUError::InvalidData("face upload on a non-cube texture".into()));
        }
        let compressed = self.inner.desc.format.is_compressed();
        self.check_compressed(compressed)?;
        self.upload(
            TextureRegion {
                x: 0,
                y: 0,
                width: level_extent(self.inner.desc.width, level),
                height: level_extent(self.inner.desc.height, level),
                level,
                layer: face.index(),
                compressed,
            },
            data,
        )
    }

    /// Regenerate the mip chain from level zero.
    pub fn generate_mipmaps(&self) -> Result<()> {
        if self.inner.desc.usage == TextureUsage::RenderTarget {
            return Err(GPUError::MipmapOnRenderTarget);
        }
        let handle = self.inner.handle.ok_or(GPUError::InvalidResource)?;
        let mut guard = self.inner.shared.lock();
        let state = &mut *guard;
        let rec = state
            .textures
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidResource)?;
        state.device.generate_mipmaps(&mut rec.native);
        rec.mipmaps_generated = true;
        rec.mip_count = None;
        Ok(())
    }

    /// Number of mip levels in use, cached until the next mip generation.
    pub fn mip_level_count(&self) -> u32 {
        let desc = &self.inner.desc;
        let Some(handle) = self.inner.handle else {
            return 0;
        };
        let mut state = self.inner.shared.lock();
        let Some(rec) = state.textures.get_mut_ref(handle) else {
            return 0;
        };
        let full_chain = rec.mipmaps_generated || desc.mip_levels == 0;
        *rec.mip_count.get_or_insert_with(|| {
            if full_chain {
                full_mip_chain(desc.width, desc.height)
            } else {
                desc.mip_levels
            }
        })
    }

    pub fn update_sampler_desc(&self, sampler: SamplerDesc) -> Result<()> {
        let handle = self.inner.handle.ok_or(GPUError::InvalidResource)?;
        let mut state = self.inner.shared.lock();
        let rec = state
            .textures
            .get_mut_ref(handle)
            .ok_or(GPUError::InvalidResource)?;
        rec.desc.sampler = sampler;
        *lock(&self.inner.sampler) = sampler;
        Ok(())
    }

    /// Descriptor in effect, including any format substitution.
    pub fn desc(&self) -> TextureDesc {
        TextureDesc {
            sampler: self.sampler_desc(),
            ..self.inner.desc
        }
    }

    pub fn sampler_desc(&self) -> SamplerDesc {
        *lock(&self.inner.sampler)
    }

    pub fn width(&self) -> u32 {
        self.inner.desc.width
    }

    pub fn height(&self) -> u32 {
        self.inner.desc.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.desc.format
    }

    /// Format asked for at creation, before fallback.
    pub fn requested_format(&self) -> PixelFormat {
        self.inner.requested_format
    }

    pub fn texture_type(&self) -> TextureType {
        self.inner.desc.texture_type
    }

    pub fn usage(&self) -> TextureUsage {
        self.inner.desc.usage
    }

    pub fn is_valid(&self) -> bool {
        self.inner.handle.is_some()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}
