// =============================================================================
// VK-FILL - Ray query device setup and buffer fill
// =============================================================================
//
// Brings up a Vulkan device capable of ray queries, allocates a host-readable
// buffer big enough for an 800x600 RGB float image, and records a command that
// fills it with 0.5. The command buffer is never submitted.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  main (config, logging)                                         │
// │    └── session::run                                             │
// │          └── VulkanContext (instance, GPU, device, GCT queue)   │
// │                └── ResourceAllocator (dedicated memory)         │
// │                      └── Buffer                                 │
// │                └── CommandPool                                  │
// │                      └── CommandBuffer (begin, fill, end)       │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

mod backend;
mod config;
mod session;

use anyhow::{Context, Result};
use config::Config;
use std::fs::OpenOptions;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, origin) = Config::load();

    // Initialize logging, then report how loading the config went
    init_logging(&config)?;
    log::info!("Starting vk-fill");
    origin.log_outcome();
    log::debug!("Config: {:?}", config);
    if config.parsed_log_level().is_none() {
        log::warn!(
            "Unknown log level '{}', defaulting to info",
            config.debug.log_level
        );
    }
    log::info!(
        "Output: {}x{} RGB32F, fill value {}",
        config.render.width,
        config.render.height,
        config.render.fill_value
    );

    let summary = session::run(&config)?;

    log::info!(
        "Done on {}: {} bytes, pattern 0x{:08X}, host readable: {}",
        summary.device_name,
        summary.buffer_size,
        summary.fill_pattern,
        summary.host_readable
    );
    Ok(())
}

/// Initialize logging, optionally writing to the configured log file.
/// RUST_LOG overrides the configured level.
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};

    let mut builder = Builder::new();
    builder.filter_level(config.log_level());
    builder.parse_default_env();

    if config.debug.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {:?}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}
