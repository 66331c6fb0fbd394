// Command pools and command buffers
//
// The pool is bound to one queue family. Command buffers track their
// recording state so out-of-order recording calls fail instead of hitting
// undefined behaviour in the driver.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanContext;

/// Command buffer lifecycle, as far as this crate drives it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

impl CommandBufferState {
    pub fn begin(self) -> Result<Self> {
        match self {
            Self::Initial => Ok(Self::Recording),
            other => anyhow::bail!("Cannot begin recording in {:?} state", other),
        }
    }

    /// Check that commands may be recorded now
    pub fn record(self) -> Result<Self> {
        match self {
            Self::Recording => Ok(Self::Recording),
            other => anyhow::bail!("Cannot record commands in {:?} state", other),
        }
    }

    pub fn end(self) -> Result<Self> {
        match self {
            Self::Recording => Ok(Self::Executable),
            other => anyhow::bail!("Cannot end a command buffer in {:?} state", other),
        }
    }
}

/// Reinterpret a float as the 32-bit word vkCmdFillBuffer repeats
pub fn fill_pattern(value: f32) -> u32 {
    value.to_bits()
}

/// A validated vkCmdFillBuffer call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillCommand {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub data: u32,
}

impl FillCommand {
    /// `size` may be `vk::WHOLE_SIZE` to fill up to the end of the buffer
    pub fn new(
        buffer: vk::Buffer,
        buffer_size: vk::DeviceSize,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) -> Result<Self> {
        if offset % 4 != 0 {
            anyhow::bail!("Fill offset {} is not a multiple of 4", offset);
        }
        if offset >= buffer_size {
            anyhow::bail!(
                "Fill offset {} is past the end of a {} byte buffer",
                offset,
                buffer_size
            );
        }
        if size != vk::WHOLE_SIZE {
            if size == 0 || size % 4 != 0 {
                anyhow::bail!("Fill size {} must be a non-zero multiple of 4", size);
            }
            if size > buffer_size - offset {
                anyhow::bail!(
                    "Fill of {} bytes at offset {} overruns a {} byte buffer",
                    size,
                    offset,
                    buffer_size
                );
            }
        }

        Ok(Self {
            buffer,
            offset,
            size,
            data,
        })
    }

    /// Fill every byte of the buffer, starting at offset 0
    pub fn whole(buffer: vk::Buffer, buffer_size: vk::DeviceSize, data: u32) -> Result<Self> {
        Self::new(buffer, buffer_size, 0, buffer_size, data)
    }
}

pub struct CommandPool {
    handle: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    pub fn new(context: &VulkanContext, queue_family: u32) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::builder().queue_family_index(queue_family);

        let handle = unsafe { context.device.create_command_pool(&create_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            handle,
            queue_family,
        })
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn allocate_primary(&self, context: &VulkanContext) -> Result<CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { context.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;

        let handle = buffers
            .into_iter()
            .next()
            .context("Driver returned no command buffer")?;

        Ok(CommandBuffer {
            handle,
            state: CommandBufferState::Initial,
        })
    }

    /// Destroying the pool also frees every command buffer allocated from it
    pub fn destroy(self, context: &VulkanContext) {
        unsafe { context.device.destroy_command_pool(self.handle, None) };
    }
}

pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    state: CommandBufferState,
}

impl CommandBuffer {
    /// Begin recording for a single submission
    pub fn begin_one_time(&mut self, device: &ash::Device) -> Result<()> {
        let next = self.state.begin()?;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(self.handle, &begin_info) }
            .context("Failed to begin command buffer")?;

        self.state = next;
        Ok(())
    }

    pub fn fill_buffer(&mut self, device: &ash::Device, fill: &FillCommand) -> Result<()> {
        self.state.record()?;

        unsafe {
            device.cmd_fill_buffer(self.handle, fill.buffer, fill.offset, fill.size, fill.data);
        }
        Ok(())
    }

    pub fn end(&mut self, device: &ash::Device) -> Result<()> {
        let next = self.state.end()?;

        unsafe { device.end_command_buffer(self.handle) }
            .context("Failed to end command buffer")?;

        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: vk::DeviceSize = 5_760_000;

    #[test]
    fn half_fills_with_expected_bits() {
        assert_eq!(fill_pattern(0.5), 0x3F00_0000);
        assert_eq!(fill_pattern(0.5).to_le_bytes(), [0x00, 0x00, 0x00, 0x3F]);
        assert_eq!(f32::from_bits(fill_pattern(0.5)), 0.5);
    }

    #[test]
    fn whole_fill_covers_buffer_from_start() {
        let fill = FillCommand::whole(vk::Buffer::null(), SIZE, fill_pattern(0.5)).unwrap();
        assert_eq!(fill.offset, 0);
        assert_eq!(fill.size, SIZE);
        assert_eq!(fill.data, 0x3F00_0000);
    }

    #[test]
    fn fill_rejects_misaligned_ranges() {
        let buffer = vk::Buffer::null();
        assert!(FillCommand::new(buffer, SIZE, 2, 4, 0).is_err());
        assert!(FillCommand::new(buffer, SIZE, 0, 6, 0).is_err());
        assert!(FillCommand::new(buffer, SIZE, 0, 0, 0).is_err());
    }

    #[test]
    fn fill_rejects_out_of_bounds_ranges() {
        let buffer = vk::Buffer::null();
        assert!(FillCommand::new(buffer, SIZE, SIZE, vk::WHOLE_SIZE, 0).is_err());
        assert!(FillCommand::new(buffer, SIZE, 4, SIZE, 0).is_err());
        assert!(FillCommand::new(buffer, SIZE, 4, SIZE - 4, 0).is_ok());
    }

    #[test]
    fn whole_size_fill_is_accepted() {
        let fill = FillCommand::new(vk::Buffer::null(), SIZE, 16, vk::WHOLE_SIZE, 7).unwrap();
        assert_eq!(fill.size, vk::WHOLE_SIZE);
    }

    #[test]
    fn whole_fill_of_unaligned_buffer_fails() {
        // Whole-buffer fills need a size that is a multiple of 4
        assert!(FillCommand::whole(vk::Buffer::null(), 10, 0).is_err());
    }

    #[test]
    fn state_machine_follows_begin_record_end() {
        let state = CommandBufferState::Initial;
        assert!(state.record().is_err());
        assert!(state.end().is_err());

        let recording = state.begin().unwrap();
        assert_eq!(recording, CommandBufferState::Recording);
        assert_eq!(recording.record().unwrap(), CommandBufferState::Recording);
        assert!(recording.begin().is_err());

        let executable = recording.end().unwrap();
        assert_eq!(executable, CommandBufferState::Executable);
        assert!(executable.record().is_err());
        assert!(executable.begin().is_err());
    }
}
