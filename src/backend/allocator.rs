// Resource allocator - buffer creation and destruction
//
// Every buffer gets its own dedicated VkDeviceMemory. The allocator keeps the
// context alive, so the device can't be destroyed while memory is still
// allocated from it.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::sync::Arc;

use super::buffer::{check_memory_properties, memory_location_for, Buffer, BufferDesc};
use super::VulkanContext;

pub struct ResourceAllocator {
    // Field order matters for drop: allocator memory goes before the context
    allocator: Mutex<Allocator>,
    context: Arc<VulkanContext>,
}

impl ResourceAllocator {
    pub fn new(context: Arc<VulkanContext>) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance.clone(),
            device: context.device.clone(),
            physical_device: context.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: context.features.buffer_device_address,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        log::debug!("Memory allocator ready");

        Ok(Self {
            allocator: Mutex::new(allocator),
            context,
        })
    }

    /// Create a buffer backed by dedicated memory matching `desc`
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer> {
        let device = &self.context.device;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", desc.name))?;

        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name: &desc.name,
            requirements,
            location: memory_location_for(desc.memory_properties),
            linear: true,
            allocation_scheme: AllocationScheme::DedicatedBuffer(handle),
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(handle, None) };
                return Err(e)
                    .with_context(|| format!("Failed to allocate memory for '{}'", desc.name));
            }
        };

        let bound = unsafe {
            device.bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind buffer memory")
        .and_then(|_| {
            check_memory_properties(desc.memory_properties, allocation.memory_properties())
        });

        if let Err(e) = bound {
            unsafe { device.destroy_buffer(handle, None) };
            if let Err(free_err) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free memory of '{}': {}", desc.name, free_err);
            }
            return Err(e.context(format!("Failed to set up buffer '{}'", desc.name)));
        }

        log::debug!(
            "Created buffer '{}': {} bytes, {:?}",
            desc.name,
            desc.size,
            allocation.memory_properties()
        );

        Ok(Buffer {
            handle,
            allocation,
            size: desc.size,
            usage: desc.usage,
        })
    }

    /// Destroy the buffer, then release its memory
    pub fn destroy_buffer(&self, buffer: Buffer) -> Result<()> {
        let Buffer {
            handle, allocation, ..
        } = buffer;

        unsafe { self.context.device.destroy_buffer(handle, None) };
        self.allocator
            .lock()
            .free(allocation)
            .context("Failed to free buffer memory")?;

        Ok(())
    }

    /// Tear down the allocator. Every buffer must have been destroyed already.
    pub fn deinit(self) {
        log::info!("Destroying memory allocator...");
        drop(self);
    }
}
