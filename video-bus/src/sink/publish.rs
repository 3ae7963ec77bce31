use std::sync::Arc;
use std::time::UNIX_EPOCH;

use base64::Engine as _;

use crate::bus::Client;
use crate::data::{EncodedFrame, EncodedPacket, NetworkFrame, NetworkMetadata};
use crate::metrics;
use crate::sink::DoneCallback;
use crate::streams::{Subscriber, SubscriptionHandle};

/// Largest frame chunk published in one message; larger frames are split
/// into sequentially numbered chunks.
const MAX_CHUNK_BYTES: usize = 48 * 1024;

/// Republishes an encoded stream onto the bus: metadata on change, frames as
/// base64 chunks.
pub struct PublishPacketsSink {
    client: Arc<dyn Client>,
    frames_channel: String,
    metadata_channel: String,
    last_metadata: Option<NetworkMetadata>,
    subscription: Option<SubscriptionHandle>,
    done: Option<DoneCallback>,
}

impl PublishPacketsSink {
    pub fn new(client: Arc<dyn Client>, channel: &str, done: DoneCallback) -> Self {
        Self {
            client,
            frames_channel: channel.to_string(),
            metadata_channel: format!("{}/metadata", channel),
            last_metadata: None,
            subscription: None,
            done: Some(done),
        }
    }

    fn publish_frame(&self, frame: &EncodedFrame) {
        let parts: Vec<&[u8]> = if frame.data.is_empty() {
            vec![&[]]
        } else {
            frame.data.chunks(MAX_CHUNK_BYTES).collect()
        };
        let chunks = parts.len() as u32;
        let timestamp = frame
            .arrival_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .ok();
        for (index, chunk) in parts.into_iter().enumerate() {
            let message = NetworkFrame {
                i: [frame.id.i1, frame.id.i2],
                chunk: index as u32 + 1,
                chunks,
                d: base64::engine::general_purpose::STANDARD.encode(chunk),
                key: frame.key_frame,
                t: timestamp,
            };
            match serde_json::to_value(&message) {
                Ok(payload) => self.client.publish(&self.frames_channel, payload, None),
                Err(e) => log::error!("cannot serialize frame {}: {}", frame.id, e),
            }
        }
        metrics::registry().incr("sink.frames_published");
    }

    fn finish(&mut self) {
        self.subscription = None;
        if let Some(done) = self.done.take() {
            done();
        }
    }
}

impl Subscriber<EncodedPacket> for PublishPacketsSink {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        subscription.request(1);
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, element: EncodedPacket) {
        match element {
            EncodedPacket::Params(params) => {
                let metadata = NetworkMetadata {
                    codec: params.name.clone(),
                    width: params.width,
                    height: params.height,
                    extra_data_base64: if params.extra_data.is_empty() {
                        None
                    } else {
                        Some(base64::engine::general_purpose::STANDARD.encode(&params.extra_data))
                    },
                    additional_data: None,
                };
                if self.last_metadata.as_ref() != Some(&metadata) {
                    match serde_json::to_value(&metadata) {
                        Ok(payload) => {
                            self.client.publish(&self.metadata_channel, payload, None)
                        }
                        Err(e) => log::error!("cannot serialize metadata: {}", e),
                    }
                    self.last_metadata = Some(metadata);
                }
            }
            EncodedPacket::Frame(frame) => self.publish_frame(&frame),
        }
        if let Some(subscription) = self.subscription.as_ref() {
            subscription.request(1);
        }
    }

    fn on_error(&mut self, error: anyhow::Error) {
        log::error!("publish pipeline failed: {:#}", error);
        self.finish();
    }

    fn on_complete(&mut self) {
        log::info!("publish pipeline complete");
        self.finish();
    }
}
