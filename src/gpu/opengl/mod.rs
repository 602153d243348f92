//! OpenGL 3.3 / OpenGL ES 3 device built on `glow`.
//!
//! The state cache and version handling compile on every build so they can
//! be tested without a context. The device itself needs the `rhi-gl`
//! feature and a context installed with [`install_surface`].

pub mod state;
pub mod utils;

#[cfg(feature = "rhi-gl")]
mod device;

#[cfg(feature = "rhi-gl")]
pub use device::{install_surface, GlBackend, GlDevice, GlSurface};

pub use state::{BufferTarget, Capability, Face, GlName, GlStateApi, StateCache};
pub use utils::{feature_extension, GlVersion};
