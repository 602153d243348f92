use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::driver::Shared;
use super::program_state::PreparedState;
use super::{
    Backend, Buffer, CullMode, DefaultBackend, DepthStencilDesc, DepthStencilState, Device,
    DrawCall, DrawKind, GPUError, IndexFormat, PassState, PipelineDesc, PixelBuffer,
    PrimitiveType, ProgramState, RasterizerState, ReadSource, RenderPassDesc, RenderPipeline,
    RenderTarget, Result, ScissorRect, VertexLayout, Viewport, Winding,
};

/// Records and submits one frame at a time.
///
/// Passes through `Idle -> FrameActive -> RenderPassActive -> FrameActive ->
/// Idle`. State setters and draws are only legal inside a render pass. Calls
/// made in the wrong state fail with [`GPUError::InvalidState`].
/// Only one command buffer exists per driver; dropping it lets
/// [`Driver::command_buffer`](super::Driver::command_buffer) hand out another.
pub struct CommandBuffer<B: Backend = DefaultBackend> {
    shared: Arc<Shared<B>>,
    state: PassState,
    screen: RenderTarget<B>,
    render_target: Option<RenderTarget<B>>,
    render_pipeline: RenderPipeline<B>,
    program_state: Option<ProgramState<B>>,
    vertex_layout: Option<VertexLayout>,
    vertex_buffer: Option<Buffer<B>>,
    index_buffer: Option<Buffer<B>>,
    instance_buffer: Option<Buffer<B>>,
    depth_stencil: Option<DepthStencilState<B>>,
    depth_stencil_dirty: bool,
    stencil_reference: u32,
    rasterizer: RasterizerState,
    applied_rasterizer: Option<RasterizerState>,
}

impl<B: Backend> Drop for CommandBuffer<B> {
    fn drop(&mut self) {
        self.shared.command_buffer_taken.store(false, Ordering::Release);
    }
}

impl<B: Backend> CommandBuffer<B> {
    pub(crate) fn new(shared: Arc<Shared<B>>) -> Self {
        let screen = RenderTarget::create_default(&shared);
        let render_pipeline = RenderPipeline::new(&shared);
        Self {
            shared,
            state: PassState::Idle,
            screen,
            render_target: None,
            render_pipeline,
            program_state: None,
            vertex_layout: None,
            vertex_buffer: None,
            index_buffer: None,
            instance_buffer: None,
            depth_stencil: None,
            depth_stencil_dirty: true,
            stencil_reference: 0,
            rasterizer: RasterizerState::default(),
            applied_rasterizer: None,
        }
    }

    fn expect(&self, expected: PassState) -> Result<()> {
        if self.state != expected {
            return Err(GPUError::InvalidState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    fn check_device(&self) -> Result<()> {
        if self.shared.device_lost.load(Ordering::Acquire) {
            return Err(GPUError::DeviceLost("device must be recovered first".into()));
        }
        Ok(())
    }

    pub fn current_state(&self) -> PassState {
        self.state
    }

    /// The default target rendering to the swap chain.
    pub fn screen_target(&self) -> RenderTarget<B> {
        self.screen.clone()
    }

    pub fn begin_frame(&mut self) -> Result<()> {
        self.expect(PassState::Idle)?;
        self.check_device()?;
        let ran = self.shared.drain_operations();
        if ran > 0 {
            log::trace!("ran {ran} queued operations");
        }
        self.shared.collect_garbage();
        self.shared.lock().device.begin_frame()?;
        self.state = PassState::FrameActive;
        Ok(())
    }

    /// Bind `target`, rebuilding views whose attachments changed, then
    /// apply the clears requested by `desc`.
    pub fn begin_render_pass(&mut self, target: &RenderTarget<B>, desc: &RenderPassDesc) -> Result<()> {
        self.expect(PassState::FrameActive)?;
        self.check_device()?;

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        target.bind(state)?;
        let (width, height) = target
            .size()
            .unwrap_or_else(|| state.device.swap_chain_size());
        state.device.set_viewport(&Viewport {
            x: 0,
            y: 0,
            width,
            height,
        });
        if !desc.clear_flags.is_empty() {
            state.device.clear(desc.clear_flags, desc);
        }
        drop(guard);

        self.render_target = Some(target.clone());
        self.applied_rasterizer = None;
        self.depth_stencil_dirty = true;
        self.state = PassState::RenderPassActive;
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.shared.lock().device.set_viewport(&viewport);
        Ok(())
    }

    pub fn set_cull_mode(&mut self, mode: CullMode) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.rasterizer.cull_mode = mode;
        Ok(())
    }

    pub fn set_winding(&mut self, winding: Winding) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.rasterizer.winding = winding;
        Ok(())
    }

    pub fn set_scissor_rect(&mut self, enabled: bool, rect: ScissorRect) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.rasterizer.scissor = enabled.then_some(rect);
        Ok(())
    }

    /// `None` turns depth and stencil testing off for following draws.
    pub fn set_depth_stencil_state(&mut self, state: Option<&DepthStencilState<B>>) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.depth_stencil = state.cloned();
        self.depth_stencil_dirty = true;
        Ok(())
    }

    pub fn update_depth_stencil_state(&mut self, desc: &DepthStencilDesc) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        if let Some(state) = &self.depth_stencil {
            state.update(desc);
            self.depth_stencil_dirty = true;
        }
        Ok(())
    }

    pub fn set_stencil_reference_value(&mut self, value: u32) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        if self.stencil_reference != value {
            self.stencil_reference = value;
            self.depth_stencil_dirty = true;
        }
        Ok(())
    }

    pub fn set_render_pipeline(&mut self, pipeline: &RenderPipeline<B>) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.render_pipeline = pipeline.clone();
        Ok(())
    }

    /// Apply the blend state through the pipeline cache and record the
    /// program state and vertex layout for the next draws.
    pub fn update_pipeline_state(&mut self, desc: &PipelineDesc<B>) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.check_device()?;
        if let Some(program_state) = &desc.program_state {
            self.program_state = Some(program_state.clone());
        }
        if let Some(layout) = &desc.vertex_layout {
            self.vertex_layout = Some(layout.clone());
        }
        let mut state = self.shared.lock();
        let native = self.render_pipeline.realize(&mut state.device, &desc.blend_desc);
        state.device.apply_blend_state(&native);
        Ok(())
    }

    pub fn set_program_state(&mut self, program_state: &ProgramState<B>) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.program_state = Some(program_state.clone());
        Ok(())
    }

    pub fn set_vertex_buffer(&mut self, buffer: &Buffer<B>) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.vertex_buffer = Some(buffer.clone());
        Ok(())
    }

    pub fn set_index_buffer(&mut self, buffer: &Buffer<B>) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.index_buffer = Some(buffer.clone());
        Ok(())
    }

    pub fn set_instance_buffer(&mut self, buffer: &Buffer<B>) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.instance_buffer = Some(buffer.clone());
        Ok(())
    }

    pub fn draw_arrays(&mut self, primitive: PrimitiveType, start: u32, count: u32, wireframe: bool) -> Result<()> {
        self.draw(primitive, None, 1, wireframe, start, count)
    }

    pub fn draw_arrays_instanced(
        &mut self,
        primitive: PrimitiveType,
        start: u32,
        count: u32,
        instance_count: u32,
        wireframe: bool,
    ) -> Result<()> {
        self.draw(primitive, None, instance_count, wireframe, start, count)
    }

    /// Draw `count` indices starting `offset` bytes into the index buffer.
    /// `offset` must be a multiple of the index size.
    pub fn draw_elements(
        &mut self,
        primitive: PrimitiveType,
        format: IndexFormat,
        count: u32,
        offset: usize,
        wireframe: bool,
    ) -> Result<()> {
        self.draw(primitive, Some((format, offset)), 1, wireframe, 0, count)
    }

    pub fn draw_elements_instanced(
        &mut self,
        primitive: PrimitiveType,
        format: IndexFormat,
        count: u32,
        offset: usize,
        instance_count: u32,
        wireframe: bool,
    ) -> Result<()> {
        self.draw(primitive, Some((format, offset)), instance_count, wireframe, 0, count)
    }

    fn draw(
        &mut self,
        primitive: PrimitiveType,
        indexed: Option<(IndexFormat, usize)>,
        instance_count: u32,
        wireframe: bool,
        start: u32,
        count: u32,
    ) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.check_device()?;

        if let Some((format, offset)) = indexed {
            debug_assert!(
                offset % format.size() == 0,
                "index offset {offset} is not a multiple of {}",
                format.size()
            );
            if offset % format.size() != 0 {
                log::error!("draw refused: index offset {offset} is misaligned for {format:?}");
                return Err(GPUError::InvalidData(format!("misaligned index offset {offset}")));
            }
        }

        let program_state = self
            .program_state
            .as_ref()
            .ok_or_else(|| GPUError::InvalidData("no program state bound".into()))?;
        let layout = self
            .vertex_layout
            .as_ref()
            .filter(|layout| layout.is_valid())
            .ok_or_else(|| GPUError::InvalidData("no valid vertex layout bound".into()))?;
        let vertex_buffer = self
            .vertex_buffer
            .as_ref()
            .ok_or_else(|| GPUError::InvalidData("no vertex buffer bound".into()))?;
        let index_buffer = match indexed {
            Some(_) => Some(
                self.index_buffer
                    .as_ref()
                    .ok_or_else(|| GPUError::InvalidData("no index buffer bound".into()))?,
            ),
            None => None,
        };
        let instance_buffer = if layout.has_instancing() {
            Some(
                self.instance_buffer
                    .as_ref()
                    .ok_or_else(|| GPUError::InvalidData("no instance buffer bound".into()))?,
            )
        } else {
            None
        };

        // Callback uniforms run before the driver lock is taken.
        let prepared: PreparedState<B> = program_state.prepare();
        let program_handle = prepared.program.handle().ok_or(GPUError::InvalidResource)?;

        let mut guard = self.shared.lock();
        let state = &mut *guard;
        let program = state
            .programs
            .get_mut_ref(program_handle)
            .and_then(|rec| rec.native.as_mut())
            .ok_or(GPUError::InvalidResource)?;
        let vertex_native = &state
            .buffers
            .get_ref(vertex_buffer.handle())
            .ok_or(GPUError::InvalidResource)?
            .native;
        let instance_native = match instance_buffer {
            Some(buffer) => Some(
                &state
                    .buffers
                    .get_ref(buffer.handle())
                    .ok_or(GPUError::InvalidResource)?
                    .native,
            ),
            None => None,
        };

        state.device.bind_program(program);
        state.device.bind_vertex_input(layout, vertex_native, instance_native);
        state.device.upload_uniforms(
            program,
            prepared.uniforms.vertex(),
            prepared.uniforms.fragment(),
        );
        for (unit, texture) in &prepared.textures {
            let native = texture
                .handle()
                .and_then(|handle| state.textures.get_ref(handle));
            match native {
                Some(rec) => {
                    let device = &mut state.device;
                    let sampler = self
                        .shared
                        .samplers
                        .get_or_create(self.shared.epoch(), rec.sampler(), |desc| {
                            device.create_sampler(desc)
                        });
                    device.bind_texture(program, *unit, &rec.native, &sampler);
                }
                None => log::warn!("skipping invalid texture at unit {unit}"),
            }
        }
        if self.applied_rasterizer != Some(self.rasterizer) {
            state.device.apply_rasterizer_state(&self.rasterizer);
            self.applied_rasterizer = Some(self.rasterizer);
        }
        if self.depth_stencil_dirty {
            let native = self
                .depth_stencil
                .as_ref()
                .and_then(|ds| ds.realize(&mut state.device));
            state
                .device
                .apply_depth_stencil_state(native.as_ref(), self.stencil_reference);
            self.depth_stencil_dirty = false;
        }

        let kind = match (indexed, index_buffer) {
            (Some((format, offset)), Some(buffer)) => DrawKind::Elements {
                index_buffer: &state
                    .buffers
                    .get_ref(buffer.handle())
                    .ok_or(GPUError::InvalidResource)?
                    .native,
                format,
                count,
                offset,
            },
            _ => DrawKind::Arrays { start, count },
        };
        state.device.draw(&DrawCall {
            primitive,
            kind,
            instance_count,
            wireframe,
        });
        drop(guard);
        drop(prepared);
        Ok(())
    }

    /// Release per-pass bindings and unbind textures from their units.
    pub fn end_render_pass(&mut self) -> Result<()> {
        self.expect(PassState::RenderPassActive)?;
        self.shared.lock().device.end_pass();
        self.program_state = None;
        self.vertex_buffer = None;
        self.index_buffer = None;
        self.instance_buffer = None;
        self.render_target = None;
        self.state = PassState::FrameActive;
        Ok(())
    }

    /// Present the frame. A lost device is reported as
    /// [`GPUError::DeviceLost`] and must be recovered through
    /// [`Driver::recover_device`](super::Driver::recover_device).
    pub fn end_frame(&mut self) -> Result<()> {
        self.expect(PassState::FrameActive)?;
        self.state = PassState::Idle;

        let presented = {
            let mut state = self.shared.lock();
            match state.device.present() {
                Ok(()) if state.device.is_lost() => {
                    Err(GPUError::DeviceLost("device lost during present".into()))
                }
                other => other,
            }
        };
        self.shared.collect_garbage();

        if let Err(err) = presented {
            if matches!(err, GPUError::DeviceLost(_)) {
                log::error!("{err}");
                self.shared.device_lost.store(true, Ordering::Release);
            } else {
                log::warn!("present failed, frame dropped: {err}");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Resize the backbuffer. Only legal between frames; a zero extent is
    /// accepted and ignored.
    pub fn resize_swap_chain(&mut self, width: u32, height: u32) -> Result<()> {
        self.expect(PassState::Idle)?;
        if width == 0 || height == 0 {
            log::debug!("ignoring swap chain resize to {width}x{height}");
            return Ok(());
        }
        self.shared.lock().device.resize_swap_chain(width, height)
    }

    /// Read color attachment 0 of `target` into a top-down RGBA8 buffer and
    /// pass it to `callback`. With `preserve` the device's native row order
    /// is kept.
    pub fn read_pixels(
        &mut self,
        target: &RenderTarget<B>,
        preserve: bool,
        callback: impl FnOnce(&PixelBuffer),
    ) -> Result<()> {
        self.check_device()?;
        let attachment = target.color_attachment(0);
        let result = {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            let bottom_up = state.device.bottom_up();
            let read = match &attachment {
                _ if target.is_default() => {
                    let (width, height) = state.device.swap_chain_size();
                    state.device.read_pixels(ReadSource::Backbuffer(ScissorRect {
                        x: 0,
                        y: 0,
                        width,
                        height,
                    }))
                }
                Some((texture, level)) => {
                    let rec = texture
                        .handle()
                        .and_then(|handle| state.textures.get_ref(handle))
                        .ok_or(GPUError::InvalidResource)?;
                    state.device.read_pixels(ReadSource::Texture(&rec.native, *level))
                }
                None => Err(GPUError::Readback("render target has no color attachment".into())),
            };
            read.map(|mut pixels| {
                if bottom_up && !preserve {
                    pixels.flip_rows();
                }
                pixels
            })
        };

        match result {
            Ok(pixels) => {
                callback(&pixels);
                Ok(())
            }
            Err(err) => {
                log::warn!("readback failed: {err}");
                Err(err)
            }
        }
    }
}
