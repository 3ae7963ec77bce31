//! Sinks terminate a pipeline: bot messages to the bus, encoded packets to
//! a container file or back onto the bus as chunked network frames.

mod container;
mod message;
mod publish;

pub use container::ContainerSink;
pub use message::MessageSink;
pub use publish::PublishPacketsSink;

/// Invoked once when a sink sees its terminal signal.
pub type DoneCallback = Box<dyn FnOnce() + Send>;
