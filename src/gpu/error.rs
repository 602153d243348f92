use thiserror::Error;

use super::config::ConfigError;
use super::reflect::ReflectError;

/// Pass state of a [`CommandBuffer`](super::CommandBuffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassState {
    Idle,
    FrameActive,
    RenderPassActive,
}

#[derive(Debug, Error)]
pub enum GPUError {
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("command buffer is {found:?}, operation requires {expected:?}")]
    InvalidState {
        expected: PassState,
        found: PassState,
    },
    #[error("buffer update of {size} bytes at offset {offset} exceeds capacity {capacity}")]
    BufferOverflow {
        offset: usize,
        size: usize,
        capacity: usize,
    },
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("immutable buffer can only be written once")]
    ImmutableBuffer,
    #[error("color attachment {index} would leave a gap ({count} attached)")]
    AttachmentGap { index: usize, count: usize },
    #[error("color attachment index {0} is out of range")]
    AttachmentIndex(usize),
    #[error("format {0} cannot back a depth-stencil attachment")]
    NotDepthFormat(String),
    #[error("mipmaps cannot be generated for render-target textures")]
    MipmapOnRenderTarget,
    #[error("resource is in the invalid state")]
    InvalidResource,
    #[error("a command buffer is already acquired for this driver")]
    CommandBufferInUse,
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),
    #[error("program link failed: {0}")]
    ProgramLink(String),
    #[error(transparent)]
    Reflection(#[from] ReflectError),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("readback failed: {0}")]
    Readback(String),
    #[error("device error: {0}")]
    Device(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = GPUError> = std::result::Result<T, E>;

/// Report an unrecoverable environment error and terminate the process.
pub fn fatal(message: &str) -> ! {
    log::error!("{message}");
    eprintln!("rhi: {message}");
    std::process::exit(1);
}
