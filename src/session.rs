// =============================================================================
// SESSION - Device and resource lifecycle
// =============================================================================
//
// Acquires everything in dependency order and releases it in reverse:
//
//   context -> allocator -> buffer -> command pool -> command buffer
//   (fill recorded)
//   command pool -> buffer -> allocator -> context
//
// The command buffer is recorded and ended, never submitted.

use anyhow::{Context, Result};
use ash::vk;

use crate::backend::buffer::image_buffer_size;
use crate::backend::command::fill_pattern;
use crate::backend::{
    Buffer, BufferDesc, CommandPool, ContextCreateInfo, FillCommand, ResourceAllocator,
    VulkanContext,
};
use crate::config::Config;

/// RGB, one f32 per channel
pub const CHANNELS: u32 = 3;

/// What the session set up, for logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub device_name: String,
    pub buffer_size: vk::DeviceSize,
    pub fill_pattern: u32,
    pub host_readable: bool,
}

/// Context settings for a ray query capable device
pub fn context_create_info(config: &Config) -> ContextCreateInfo {
    let mut info = ContextCreateInfo::ray_query(&config.device.app_name, config.api_version());
    info.validation = cfg!(debug_assertions) && config.device.validation_layers;
    info.device_index = config.device.device_index;
    info
}

pub fn run(config: &Config) -> Result<SessionSummary> {
    let buffer_size = image_buffer_size(config.render.width, config.render.height, CHANNELS)?;
    if buffer_size == 0 {
        anyhow::bail!(
            "Render size {}x{} is empty",
            config.render.width,
            config.render.height
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 1: Device context with deferred host ops, AS and ray query
    // ─────────────────────────────────────────────────────────────────────────
    let context = VulkanContext::new(&context_create_info(config))?;

    // Everything after this point assumes ray tracing support
    context.features.require_ray_tracing()?;
    log::info!("Enabled device extensions: {:?}", context.enabled_extensions);

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 2: Allocator + output buffer
    // ─────────────────────────────────────────────────────────────────────────
    let allocator = ResourceAllocator::new(context.clone())?;

    log::info!(
        "Creating {}x{} output buffer ({} bytes)",
        config.render.width,
        config.render.height,
        buffer_size
    );
    let buffer = allocator.create_buffer(&BufferDesc::readback_storage("output", buffer_size))?;
    log::debug!(
        "Output buffer usage {:?}, memory {:?}",
        buffer.usage(),
        buffer.memory_properties()
    );

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 3: Record the fill
    // ─────────────────────────────────────────────────────────────────────────
    let pattern = fill_pattern(config.render.fill_value);
    let recorded = record_fill(&context, &buffer, pattern);

    let summary = SessionSummary {
        device_name: context.device_name(),
        buffer_size: buffer.size(),
        fill_pattern: pattern,
        host_readable: buffer.is_host_readable(),
    };

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 4: Teardown (reverse order of creation)
    // ─────────────────────────────────────────────────────────────────────────
    let destroyed = allocator.destroy_buffer(buffer);
    allocator.deinit();
    drop(context);

    first_error(recorded, destroyed)?;

    Ok(summary)
}

/// Recording failures win; a teardown failure behind one is logged, not lost
fn first_error(recorded: Result<()>, destroyed: Result<()>) -> Result<()> {
    match (recorded, destroyed) {
        (Err(record_err), Err(destroy_err)) => {
            log::error!("Failed to destroy output buffer: {:#}", destroy_err);
            Err(record_err)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Records a whole-buffer fill into a fresh one-time-submit command buffer.
/// The pool is destroyed before returning, whether or not recording worked.
fn record_fill(context: &VulkanContext, buffer: &Buffer, pattern: u32) -> Result<()> {
    let pool = CommandPool::new(context, context.queue_gct_family)?;
    let recorded = record_commands(context, &pool, buffer, pattern);
    pool.destroy(context);
    recorded
}

fn record_commands(
    context: &VulkanContext,
    pool: &CommandPool,
    buffer: &Buffer,
    pattern: u32,
) -> Result<()> {
    let mut cmd = pool.allocate_primary(context)?;
    let fill = FillCommand::whole(buffer.handle(), buffer.size(), pattern)
        .context("Invalid fill range")?;

    cmd.begin_one_time(&context.device)?;
    cmd.fill_buffer(&context.device, &fill)?;
    cmd.end(&context.device)?;

    log::info!(
        "Recorded fill of {} bytes with 0x{:08X} for queue {:?} (family {}), not submitted",
        buffer.size(),
        pattern,
        context.queue_gct,
        pool.queue_family()
    );
    Ok(())
}
