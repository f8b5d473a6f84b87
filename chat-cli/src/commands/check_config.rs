//! Validate an engine configuration file.

use anyhow::{Context, Result};
use std::path::Path;

use chatsync_client::EngineConfig;

/// Run the check-config command.
pub fn run(path: &Path) -> Result<()> {
    let config = EngineConfig::from_file(path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    println!("=== {} ===", path.display());
    println!();
    println!("Typing:");
    println!("  Window:   {} ms", config.typing.window_ms);
    println!("  Capacity: {}", config.typing.capacity);
    println!("Resync:");
    println!("  Attempts: {}", config.resync.max_attempts);
    println!(
        "  Backoff:  {} ms .. {} ms",
        config.resync.base_delay_ms, config.resync.max_delay_ms
    );
    println!("Storage:");
    println!("  Bucket:   {}", config.storage.bucket);
    println!("Feed:");
    println!("  Buffer:   {}", config.feed.buffer);
    println!();
    println!("OK");

    Ok(())
}
