// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod barrier;
pub mod deletion;
pub mod device;
pub mod frame;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use frame::{ActiveFrame, FrameSynchronizer};
pub use swapchain::SwapchainManager;
