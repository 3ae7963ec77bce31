#![allow(dead_code)]

/// Registers FFmpeg components (codecs, formats, devices). Call once at
/// startup before opening file or camera inputs.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod bot;
pub mod bus;
pub mod data;
pub mod metrics;
pub mod sink;
pub mod source;
pub mod streams;
pub mod video;
