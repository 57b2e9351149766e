//! Utility Functions
//!
//! Common utilities used throughout the client.

pub mod byte_buffer;
mod logging;

pub use byte_buffer::{ByteBuffer, BufferError};
pub use logging::*;

use std::path::PathBuf;

/// Get the application data directory
pub fn get_app_data_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lumen-streamer")
}

/// Ensure a directory exists
pub fn ensure_dir(path: &PathBuf) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
