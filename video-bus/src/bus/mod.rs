//! Messaging-bus client abstraction. The wire dialect lives behind the
//! [`Client`] trait; this module supplies the pieces every dialect shares:
//! the callback surface, subscription options, channel positions, the I/O
//! event thread and the resilient / thread-checking wrappers.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

mod io;
mod local;
mod resilient;
mod thread_check;

pub use io::{IoHandle, IoLoop};
pub use local::LocalBus;
pub use resilient::{ClientFactory, ResilientClient};
pub use thread_check::ThreadCheckingClient;

#[cfg(test)]
#[path = "bus_test.rs"]
mod bus_test;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("failed to parse response: {0}")]
    ResponseParsing(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("unsubscribe failed: {0}")]
    Unsubscribe(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("unknown client error")]
    Unknown,
}

pub trait ErrorCallbacks: Send + Sync {
    fn on_error(&self, error: ClientError);
}

/// Completion callbacks for publish / subscribe / unsubscribe requests.
pub trait RequestCallbacks: ErrorCallbacks {
    fn on_ok(&self) {}
}

/// Payload delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct ChannelData {
    pub payload: serde_json::Value,
    pub arrival_time: SystemTime,
}

pub trait SubscriptionCallbacks: ErrorCallbacks {
    fn on_data(&self, subscription: &Subscription, data: ChannelData);
}

/// Caller-owned identity token for one channel subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
}

impl Subscription {
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryOptions {
    pub count: Option<u64>,
    pub age: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub force: bool,
    pub fast_forward: bool,
    pub history: HistoryOptions,
    /// Resume position, `"<gen>:<pos>"` on the wire.
    pub position: Option<ChannelPosition>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            force: false,
            fast_forward: true,
            history: HistoryOptions::default(),
            position: None,
        }
    }
}

/// Position in a channel's history: a 32-bit generation and a 64-bit offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelPosition {
    pub generation: u32,
    pub position: u64,
}

impl ChannelPosition {
    pub fn new(generation: u32, position: u64) -> Self {
        Self {
            generation,
            position,
        }
    }

    /// Parses `"<gen>:<pos>"`. Malformed input yields `(0, 0)`.
    pub fn parse(input: &str) -> Self {
        let Some((generation, position)) = input.split_once(':') else {
            return Self::default();
        };
        match (generation.parse(), position.parse()) {
            (Ok(generation), Ok(position)) => Self {
                generation,
                position,
            },
            _ => Self::default(),
        }
    }
}

impl Display for ChannelPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}:{}", self.generation, self.position)
    }
}

/// A messaging-bus client. Calls return immediately; completion arrives via
/// the callbacks, dispatched on the I/O thread.
pub trait Client: Send + Sync {
    fn publish(
        &self,
        channel: &str,
        message: serde_json::Value,
        callbacks: Option<Arc<dyn RequestCallbacks>>,
    );

    fn subscribe(
        &self,
        channel: &str,
        sub: &Subscription,
        data_callbacks: Arc<dyn SubscriptionCallbacks>,
        callbacks: Option<Arc<dyn RequestCallbacks>>,
        options: Option<&SubscriptionOptions>,
    );

    fn unsubscribe(&self, sub: &Subscription, callbacks: Option<Arc<dyn RequestCallbacks>>);

    fn start(&self) -> Result<(), ClientError>;

    fn stop(&self) -> Result<(), ClientError>;
}
