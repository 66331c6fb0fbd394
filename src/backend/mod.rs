// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Ownership: allocator holds the context, buffers go back to the allocator,
// command pools are destroyed explicitly against the context

pub mod allocator;
pub mod buffer;
pub mod command;
pub mod device;
pub mod extensions;

pub use allocator::ResourceAllocator;
pub use buffer::{Buffer, BufferDesc};
pub use command::{CommandPool, FillCommand};
pub use device::VulkanContext;
pub use extensions::ContextCreateInfo;
