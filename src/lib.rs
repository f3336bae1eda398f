// Ember - a minimal real-time renderer on explicit Vulkan
//
// The library covers GPU resource ownership and frame synchronization:
// device/queue acquisition, swap-chain images, command-buffer pooling,
// semaphore/fence pacing, descriptor allocation, staged buffer/texture
// upload, and the per-frame begin/draw/end protocol tying them together.
// Scene data, asset import, and UI overlays are external collaborators.

pub mod backend;
pub mod config;
pub mod error;
pub mod renderer;

pub use backend::DeviceContext;
pub use config::Config;
pub use renderer::{Mesh, Renderer, RendererOptions};
