use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::{
    Backend, DefaultBackend, GPUError, Program, Result, StageUniformLocation, Texture, Uniform,
    UniformLocation, VertexInputDesc,
};
use crate::utils::lock;

/// CPU copy of a program's uniforms: the vertex stage's bytes followed by
/// the fragment stage's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformBuffer {
    data: Vec<u8>,
    vertex_size: usize,
}

impl UniformBuffer {
    fn new(size: usize, vertex_size: usize) -> Self {
        Self {
            data: vec![0; size],
            vertex_size: vertex_size.min(size),
        }
    }

    /// Write `value` to every stage `location` lives in.
    pub fn set(&mut self, location: &UniformLocation, value: &[u8]) -> Result<()> {
        if !location.is_valid() {
            return Err(GPUError::InvalidData("uniform location does not resolve".into()));
        }
        for stage in location.stages() {
            self.write(stage, value)?;
        }
        Ok(())
    }

    fn write(&mut self, stage: StageUniformLocation, value: &[u8]) -> Result<()> {
        let offset = stage.offset as usize;
        let overflow = GPUError::BufferOverflow {
            offset,
            size: value.len(),
            capacity: stage.size as usize,
        };
        if value.len() > stage.size as usize {
            return Err(overflow);
        }
        let end = offset + value.len();
        let slot = self.data.get_mut(offset..end).ok_or(overflow)?;
        slot.copy_from_slice(value);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn vertex(&self) -> &[u8] {
        &self.data[..self.vertex_size]
    }

    pub fn fragment(&self) -> &[u8] {
        &self.data[self.vertex_size..]
    }
}

/// Computes a uniform right before each draw, e.g. from a frame clock.
pub type UniformCallback = Box<dyn FnMut(&mut UniformBuffer, &UniformLocation) + Send>;

struct StateInner<B: Backend> {
    program: Program<B>,
    uniforms: UniformBuffer,
    callbacks: Vec<(UniformLocation, UniformCallback)>,
    textures: BTreeMap<UniformLocation, Vec<Texture<B>>>,
}

/// Values a draw feeds into a program.
pub(crate) struct PreparedState<B: Backend> {
    pub(crate) program: Program<B>,
    pub(crate) uniforms: UniformBuffer,
    /// Texture unit and texture.
    pub(crate) textures: Vec<(u32, Texture<B>)>,
}

/// A program plus the uniform values and textures bound for it. Clones
/// share the same state.
pub struct ProgramState<B: Backend = DefaultBackend> {
    inner: Arc<Mutex<StateInner<B>>>,
}

impl<B: Backend> Clone for ProgramState<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> PartialEq for ProgramState<B> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<B: Backend> ProgramState<B> {
    pub fn new(program: &Program<B>) -> Self {
        let layout = program.layout();
        Self {
            inner: Arc::new(Mutex::new(StateInner {
                program: program.clone(),
                uniforms: UniformBuffer::new(layout.uniform_buffer_size(), layout.vertex_uniform_size()),
                callbacks: Vec::new(),
                textures: BTreeMap::new(),
            })),
        }
    }

    pub fn program(&self) -> Program<B> {
        lock(&self.inner).program.clone()
    }

    pub fn uniform_location(&self, name: &str) -> UniformLocation {
        lock(&self.inner).program.uniform_location(name)
    }

    pub fn builtin_location(&self, uniform: Uniform) -> UniformLocation {
        lock(&self.inner).program.builtin_uniform_location(uniform)
    }

    pub fn attribute(&self, name: &str) -> Option<VertexInputDesc> {
        lock(&self.inner).program.vertex_input(name).cloned()
    }

    /// Copy `value` into the uniform at `location`. Values larger than the
    /// reflected uniform are rejected.
    pub fn set_uniform(&self, location: &UniformLocation, value: &[u8]) -> Result<()> {
        lock(&self.inner).uniforms.set(location, value)
    }

    /// Typed form of [`ProgramState::set_uniform`].
    pub fn set_uniform_value<T: bytemuck::Pod>(&self, location: &UniformLocation, value: &T) -> Result<()> {
        self.set_uniform(location, bytemuck::bytes_of(value))
    }

    /// Register `callback` to fill `location` before every draw. Callbacks run
    /// in registration order; registering the same location again replaces
    /// the earlier callback in place.
    pub fn set_callback_uniform(
        &self,
        location: &UniformLocation,
        callback: impl FnMut(&mut UniformBuffer, &UniformLocation) + Send + 'static,
    ) {
        let mut inner = lock(&self.inner);
        let callback: UniformCallback = Box::new(callback);
        match inner.callbacks.iter_mut().find(|(loc, _)| loc == location) {
            Some(entry) => entry.1 = callback,
            None => inner.callbacks.push((*location, callback)),
        }
    }

    pub fn set_texture(&self, location: &UniformLocation, texture: &Texture<B>) {
        self.set_textures(location, std::slice::from_ref(texture));
    }

    /// Bind a texture array starting at the location's reflected unit.
    pub fn set_textures(&self, location: &UniformLocation, textures: &[Texture<B>]) {
        if !location.is_valid() {
            log::warn!("texture bound to an unresolved uniform location");
            return;
        }
        lock(&self.inner)
            .textures
            .insert(*location, textures.to_vec());
    }

    /// Snapshot of the CPU uniform buffer.
    pub fn uniform_buffer(&self) -> UniformBuffer {
        lock(&self.inner).uniforms.clone()
    }

    /// Run callbacks, then capture everything the draw uploads.
    pub(crate) fn prepare(&self) -> PreparedState<B> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        for (location, callback) in inner.callbacks.iter_mut() {
            callback(&mut inner.uniforms, location);
        }

        let mut textures = Vec::new();
        for (location, bound) in &inner.textures {
            for stage in location.stages() {
                let base = stage.location.max(0) as u32;
                textures.extend(
                    bound
                        .iter()
                        .enumerate()
                        .map(|(i, texture)| (base + i as u32, texture.clone())),
                );
            }
        }
        PreparedState {
            program: inner.program.clone(),
            uniforms: inner.uniforms.clone(),
            textures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(offset: u32, size: u32) -> UniformLocation {
        UniformLocation {
            vertex: Some(StageUniformLocation {
                location: 0,
                offset,
                size,
            }),
            fragment: None,
        }
    }

    #[test]
    fn writes_land_at_stage_offsets() {
        let mut buffer = UniformBuffer::new(32, 16);
        buffer.set(&location(4, 8), &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(&buffer.vertex()[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buffer.fragment().len(), 16);
    }

    #[test]
    fn oversized_values_are_rejected() {
        let mut buffer = UniformBuffer::new(16, 16);
        assert!(matches!(
            buffer.set(&location(0, 4), &[0; 8]),
            Err(GPUError::BufferOverflow { .. })
        ));
        assert!(buffer.set(&UniformLocation::default(), &[0; 4]).is_err());
        assert!(buffer.as_bytes().iter().all(|b| *b == 0));
    }
}
