//! The bot instance and the runner that wires it into a pipeline.

mod instance;
mod runner;

pub use instance::{BotDescriptor, BotInstance, ControlCallback, ImageCallback, RunBot};
pub use runner::{run_bot, RunnerOptions, VideoOrigin};

#[cfg(test)]
#[path = "bot_test.rs"]
mod bot_test;
