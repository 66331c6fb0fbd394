// Buffer descriptions and handles
//
// Buffers are created and destroyed through the ResourceAllocator; this file
// holds the plain data side: sizes, usage/memory flags and the mapping from
// Vulkan memory property flags to gpu-allocator memory locations.

use anyhow::Result;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

/// Properties that change whether the host can read results without extra
/// flush/invalidate calls. Missing either one is an error.
const REQUIRED_HOST_FLAGS: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
        | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// What to create
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory_properties: vk::MemoryPropertyFlags,
}

impl BufferDesc {
    /// Storage buffer the GPU writes and the CPU reads back.
    ///
    /// Host-cached memory makes CPU reads fast, host-coherent means no
    /// explicit invalidate is needed before reading.
    pub fn readback_storage(name: &str, size: vk::DeviceSize) -> Self {
        Self {
            name: name.to_string(),
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            memory_properties: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_CACHED
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }
}

/// A buffer and its memory. Move-only; hand it back to
/// `ResourceAllocator::destroy_buffer` to release it.
pub struct Buffer {
    pub(super) handle: vk::Buffer,
    pub(super) allocation: Allocation,
    pub(super) size: vk::DeviceSize,
    pub(super) usage: vk::BufferUsageFlags,
}

impl Buffer {
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Flags of the memory type the allocation actually landed in
    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.allocation.memory_properties()
    }

    pub fn is_host_readable(&self) -> bool {
        self.memory_properties().contains(REQUIRED_HOST_FLAGS)
    }
}

/// Bytes needed for a `width` x `height` float image with `channels` channels
pub fn image_buffer_size(width: u32, height: u32, channels: u32) -> Result<vk::DeviceSize> {
    let size = u64::from(width)
        .checked_mul(u64::from(height))
        .and_then(|texels| texels.checked_mul(u64::from(channels)))
        .and_then(|floats| floats.checked_mul(std::mem::size_of::<f32>() as vk::DeviceSize));

    match size {
        Some(size) => Ok(size),
        None => anyhow::bail!(
            "Image of {}x{} with {} channels does not fit in a device size",
            width,
            height,
            channels
        ),
    }
}

/// Translate Vulkan memory property flags to a gpu-allocator location.
///
/// gpu-allocator's GpuToCpu prefers HOST_VISIBLE | HOST_COHERENT | HOST_CACHED,
/// CpuToGpu prefers HOST_VISIBLE | HOST_COHERENT without caching.
pub fn memory_location_for(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
    if properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
        MemoryLocation::GpuToCpu
    } else if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::GpuOnly
    }
}

/// Check that `actual` satisfies the host-access part of `requested`
pub fn check_memory_properties(
    requested: vk::MemoryPropertyFlags,
    actual: vk::MemoryPropertyFlags,
) -> Result<()> {
    let required = requested & REQUIRED_HOST_FLAGS;
    if !actual.contains(required) {
        anyhow::bail!(
            "Allocated memory is {:?}, but {:?} was required",
            actual,
            required
        );
    }

    if requested.contains(vk::MemoryPropertyFlags::HOST_CACHED)
        && !actual.contains(vk::MemoryPropertyFlags::HOST_CACHED)
    {
        log::debug!("No host-cached memory type available, using uncached memory");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_image_size() {
        assert_eq!(image_buffer_size(800, 600, 3).unwrap(), 5_760_000);
        assert_eq!(image_buffer_size(800, 600, 3).unwrap(), 800 * 600 * 3 * 4);
    }

    #[test]
    fn image_size_does_not_overflow_u32() {
        // 65536 * 65536 * 4 channels * 4 bytes is well past u32::MAX
        assert_eq!(image_buffer_size(65_536, 65_536, 4).unwrap(), 1 << 36);
        assert_eq!(image_buffer_size(0, 600, 3).unwrap(), 0);
    }

    #[test]
    fn image_size_overflowing_u64_is_an_error() {
        let err = image_buffer_size(u32::MAX, u32::MAX, 3).unwrap_err();
        assert!(err.to_string().contains("4294967295x4294967295"));

        // 2^31 * 2^31 * 3 * 4 would wrap to exactly 0
        assert!(image_buffer_size(1 << 31, 1 << 31, 3).is_err());
        assert!(image_buffer_size(u32::MAX, u32::MAX, 1).is_ok());
    }

    #[test]
    fn readback_storage_flags() {
        let desc = BufferDesc::readback_storage("out", 16);
        assert!(desc.usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(desc.usage.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(desc.memory_properties.contains(
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        ));
        assert_eq!(memory_location_for(desc.memory_properties), MemoryLocation::GpuToCpu);
    }

    #[test]
    fn memory_location_mapping() {
        let host_visible =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(memory_location_for(host_visible), MemoryLocation::CpuToGpu);
        assert_eq!(
            memory_location_for(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            memory_location_for(vk::MemoryPropertyFlags::empty()),
            MemoryLocation::GpuOnly
        );
    }

    #[test]
    fn coherent_visible_memory_satisfies_readback() {
        let requested = BufferDesc::readback_storage("out", 16).memory_properties;
        let actual =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert!(check_memory_properties(requested, actual).is_ok());
    }

    #[test]
    fn non_coherent_memory_is_rejected_for_readback() {
        let requested = BufferDesc::readback_storage("out", 16).memory_properties;
        let actual =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED;
        assert!(check_memory_properties(requested, actual).is_err());
        assert!(
            check_memory_properties(requested, vk::MemoryPropertyFlags::DEVICE_LOCAL).is_err()
        );
    }

    #[test]
    fn device_local_request_accepts_anything() {
        assert!(check_memory_properties(
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        )
        .is_ok());
    }
}
