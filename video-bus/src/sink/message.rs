use std::sync::Arc;

use crate::bus::Client;
use crate::data::{BotOutput, MessageKind};
use crate::metrics;
use crate::sink::DoneCallback;
use crate::streams::{Subscriber, SubscriptionHandle};

/// Publishes bot messages on the channel matching their kind. Frames are not
/// published by the bot variant; they end here.
pub struct MessageSink {
    client: Arc<dyn Client>,
    analysis_channel: String,
    debug_channel: String,
    control_channel: String,
    subscription: Option<SubscriptionHandle>,
    done: Option<DoneCallback>,
}

impl MessageSink {
    pub fn new(client: Arc<dyn Client>, channel: &str, done: DoneCallback) -> Self {
        Self {
            client,
            analysis_channel: format!("{}/analysis", channel),
            debug_channel: format!("{}/debug", channel),
            control_channel: format!("{}/control", channel),
            subscription: None,
            done: Some(done),
        }
    }

    fn finish(&mut self) {
        self.subscription = None;
        if let Some(done) = self.done.take() {
            done();
        }
    }
}

impl Subscriber<BotOutput> for MessageSink {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        subscription.request(1);
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, element: BotOutput) {
        match element {
            BotOutput::Message(message) => {
                let channel = match message.kind {
                    MessageKind::Analysis => &self.analysis_channel,
                    MessageKind::Debug => &self.debug_channel,
                    MessageKind::Control => &self.control_channel,
                };
                metrics::registry().incr("sink.messages_published");
                self.client.publish(channel, message.data, None);
            }
            BotOutput::Packet(_) => {}
        }
        if let Some(subscription) = self.subscription.as_ref() {
            subscription.request(1);
        }
    }

    fn on_error(&mut self, error: anyhow::Error) {
        log::error!("bot pipeline failed: {:#}", error);
        self.finish();
    }

    fn on_complete(&mut self) {
        log::info!("bot pipeline complete");
        self.finish();
    }
}
