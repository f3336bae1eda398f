// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Ownership: every GPU object holds an Arc to the device context, which
// therefore drops last

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod pipeline;
pub mod render_pass;
pub mod shader;
pub mod slots;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::Buffer;
pub use command::{CommandBufferId, CommandManager};
pub use descriptor::{DescriptorKind, DescriptorManager, PoolId};
pub use device::DeviceContext;
pub use pipeline::{Pipeline, Vertex};
pub use render_pass::RenderPass;
pub use swapchain::Swapchain;
pub use sync::{FenceId, SemaphoreId, SyncManager};
pub use texture::Texture;
