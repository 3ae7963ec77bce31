use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use base64::Engine as _;
use bytes::Bytes;

use crate::bus::{
    ChannelData, Client, ClientError, ErrorCallbacks, HistoryOptions, Subscription,
    SubscriptionCallbacks, SubscriptionOptions,
};
use crate::data::{
    CodecParameters, EncodedFrame, EncodedPacket, FrameId, NetworkFrame, NetworkMetadata,
};
use crate::metrics;
use crate::streams::{
    BoxSubscriber, Publisher, PublisherImpl, Subscriber as _,
    Subscription as StreamSubscription,
};

/// Encoded packets from the bus: codec parameters from `<channel>/metadata`
/// (first value and every change), frames assembled from chunks on
/// `<channel>`. Data is pushed by the bus and buffered until downstream
/// demand picks it up.
pub fn bus_source(
    client: Arc<dyn Client>,
    channel: &str,
    options: Option<SubscriptionOptions>,
) -> Publisher<EncodedPacket> {
    Publisher::new(BusSourcePublisher {
        client,
        channel: channel.to_string(),
        options,
    })
}

struct BusSourcePublisher {
    client: Arc<dyn Client>,
    channel: String,
    options: Option<SubscriptionOptions>,
}

impl PublisherImpl<EncodedPacket> for BusSourcePublisher {
    fn subscribe(self: Box<Self>, mut subscriber: BoxSubscriber<EncodedPacket>) {
        let metadata_sub = Subscription::new();
        let frames_sub = Subscription::new();
        let core = Arc::new(SourceCore {
            inner: Mutex::new(SourceInner {
                subscriber: None,
                requested: 0,
                draining: true,
                cancelled: false,
                terminated: false,
                buffered: VecDeque::new(),
                failed: None,
                metadata: None,
                partial: None,
                callbacks: None,
                self_ref: None,
            }),
            client: self.client.clone(),
            metadata_sub: metadata_sub.clone(),
            frames_sub: frames_sub.clone(),
        });
        core.inner.lock().unwrap().self_ref = Some(core.clone());

        subscriber.on_subscribe(Arc::new(BusSourceSubscription {
            core: Arc::downgrade(&core),
        }));
        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled {
                inner.self_ref = None;
                return;
            }
            inner.subscriber = Some(subscriber);
            inner.draining = false;
        }

        let callbacks = Arc::new(BusSourceCallbacks {
            core: Arc::downgrade(&core),
            metadata_id: metadata_sub.id(),
            frames_id: frames_sub.id(),
        });
        core.inner.lock().unwrap().callbacks = Some(callbacks.clone());

        // Metadata with history so a late joiner sees the current codec
        // parameters right away.
        let metadata_options = SubscriptionOptions {
            history: HistoryOptions {
                count: Some(1),
                age: None,
            },
            ..Default::default()
        };
        self.client.subscribe(
            &format!("{}/metadata", self.channel),
            &metadata_sub,
            callbacks.clone(),
            None,
            Some(&metadata_options),
        );
        self.client.subscribe(
            &self.channel,
            &frames_sub,
            callbacks,
            None,
            self.options.as_ref(),
        );
    }
}

/// Raw JSON payloads from a single channel, buffered until demand picks
/// them up. The runner merges this with the frame stream for control input.
pub fn control_source(client: Arc<dyn Client>, channel: &str) -> Publisher<serde_json::Value> {
    Publisher::new(ControlSourcePublisher {
        client,
        channel: channel.to_string(),
    })
}

struct ControlSourcePublisher {
    client: Arc<dyn Client>,
    channel: String,
}

impl PublisherImpl<serde_json::Value> for ControlSourcePublisher {
    fn subscribe(self: Box<Self>, mut subscriber: BoxSubscriber<serde_json::Value>) {
        let sub = Subscription::new();
        let core = Arc::new(ControlCore {
            inner: Mutex::new(ControlInner {
                subscriber: None,
                requested: 0,
                draining: true,
                cancelled: false,
                terminated: false,
                buffered: VecDeque::new(),
                failed: None,
                callbacks: None,
                self_ref: None,
            }),
            client: self.client.clone(),
            sub: sub.clone(),
        });
        core.inner.lock().unwrap().self_ref = Some(core.clone());

        subscriber.on_subscribe(Arc::new(ControlSubscription {
            core: Arc::downgrade(&core),
        }));
        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled {
                inner.self_ref = None;
                return;
            }
            inner.subscriber = Some(subscriber);
            inner.draining = false;
        }

        let callbacks = Arc::new(ControlCallbacks {
            core: Arc::downgrade(&core),
        });
        core.inner.lock().unwrap().callbacks = Some(callbacks.clone());
        self.client
            .subscribe(&self.channel, &sub, callbacks, None, None);
    }
}

struct ControlCore {
    inner: Mutex<ControlInner>,
    client: Arc<dyn Client>,
    sub: Subscription,
}

struct ControlInner {
    subscriber: Option<BoxSubscriber<serde_json::Value>>,
    requested: u64,
    draining: bool,
    cancelled: bool,
    terminated: bool,
    buffered: VecDeque<serde_json::Value>,
    failed: Option<ClientError>,
    callbacks: Option<Arc<ControlCallbacks>>,
    self_ref: Option<Arc<ControlCore>>,
}

impl ControlCore {
    fn drain(core: &Arc<Self>) {
        let mut subscriber = {
            let mut inner = core.inner.lock().unwrap();
            if inner.draining || inner.terminated || inner.cancelled {
                return;
            }
            if inner.requested == 0 && inner.failed.is_none() {
                return;
            }
            inner.draining = true;
            inner.subscriber.take()
        };

        loop {
            enum Step {
                Emit(serde_json::Value),
                Fail(ClientError),
                Idle,
            }
            let step = {
                let mut inner = core.inner.lock().unwrap();
                if inner.cancelled {
                    Step::Idle
                } else if inner.requested > 0 && !inner.buffered.is_empty() {
                    inner.requested -= 1;
                    Step::Emit(inner.buffered.pop_front().unwrap())
                } else if inner.buffered.is_empty() && inner.failed.is_some() {
                    Step::Fail(inner.failed.take().unwrap())
                } else {
                    inner.subscriber = subscriber.take();
                    inner.draining = false;
                    return;
                }
            };
            match step {
                Step::Emit(payload) => {
                    if let Some(subscriber) = subscriber.as_mut() {
                        subscriber.on_next(payload);
                    }
                }
                Step::Fail(error) => {
                    if let Some(subscriber) = subscriber.as_mut() {
                        subscriber.on_error(anyhow::anyhow!("control source failed: {}", error));
                    }
                    let mut inner = core.inner.lock().unwrap();
                    inner.terminated = true;
                    inner.draining = false;
                    Self::release(&mut inner);
                    return;
                }
                Step::Idle => {
                    let mut inner = core.inner.lock().unwrap();
                    inner.draining = false;
                    Self::release(&mut inner);
                    return;
                }
            }
        }
    }

    fn release(inner: &mut ControlInner) {
        inner.subscriber = None;
        inner.buffered.clear();
        inner.callbacks = None;
        inner.self_ref = None;
    }
}

struct ControlCallbacks {
    core: Weak<ControlCore>,
}

impl ErrorCallbacks for ControlCallbacks {
    fn on_error(&self, error: ClientError) {
        log::error!("control channel subscription error: {}", error);
        let Some(core) = self.core.upgrade() else {
            return;
        };
        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled || inner.terminated || inner.failed.is_some() {
                return;
            }
            inner.failed = Some(error);
        }
        ControlCore::drain(&core);
    }
}

impl SubscriptionCallbacks for ControlCallbacks {
    fn on_data(&self, _subscription: &Subscription, data: ChannelData) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled || inner.terminated {
                return;
            }
            inner.buffered.push_back(data.payload);
        }
        ControlCore::drain(&core);
    }
}

struct ControlSubscription {
    core: Weak<ControlCore>,
}

impl StreamSubscription for ControlSubscription {
    fn request(&self, n: u64) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled || inner.terminated {
                return;
            }
            inner.requested = inner.requested.saturating_add(n);
        }
        ControlCore::drain(&core);
    }

    fn cancel(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled || inner.terminated {
                return;
            }
            inner.cancelled = true;
            if !inner.draining {
                ControlCore::release(&mut inner);
            }
        }
        core.client.unsubscribe(&core.sub, None);
    }
}

struct SourceCore {
    inner: Mutex<SourceInner>,
    client: Arc<dyn Client>,
    metadata_sub: Subscription,
    frames_sub: Subscription,
}

struct SourceInner {
    subscriber: Option<BoxSubscriber<EncodedPacket>>,
    requested: u64,
    draining: bool,
    cancelled: bool,
    terminated: bool,
    buffered: VecDeque<EncodedPacket>,
    failed: Option<ClientError>,
    metadata: Option<NetworkMetadata>,
    partial: Option<PartialFrame>,
    /// Keeps the bus callbacks alive; the wrappers only hold them weakly.
    callbacks: Option<Arc<BusSourceCallbacks>>,
    self_ref: Option<Arc<SourceCore>>,
}

struct PartialFrame {
    id: FrameId,
    chunks: u32,
    received: u32,
    data: Vec<u8>,
    key_frame: bool,
}

impl SourceCore {
    fn on_metadata(core: &Arc<Self>, payload: serde_json::Value) {
        let metadata: NetworkMetadata = match serde_json::from_value(payload) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::error!("bad metadata message: {}", e);
                return;
            }
        };

        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled || inner.terminated {
                return;
            }
            if inner.metadata.as_ref() == Some(&metadata) {
                return;
            }
            let extra_data = match metadata.extra_data_base64.as_deref() {
                Some(encoded) => {
                    match base64::engine::general_purpose::STANDARD.decode(encoded) {
                        Ok(data) => Bytes::from(data),
                        Err(e) => {
                            log::error!("bad metadata extra data: {}", e);
                            return;
                        }
                    }
                }
                None => Bytes::new(),
            };
            log::info!(
                "codec parameters: {} {}x{}",
                metadata.codec,
                metadata.width,
                metadata.height
            );
            inner.buffered.push_back(EncodedPacket::Params(CodecParameters {
                name: metadata.codec.clone(),
                extra_data,
                width: metadata.width,
                height: metadata.height,
            }));
            inner.metadata = Some(metadata);
            // Metadata change invalidates any frame being assembled.
            inner.partial = None;
        }
        Self::drain(core);
    }

    fn on_frame(core: &Arc<Self>, payload: serde_json::Value, arrival_time: SystemTime) {
        let frame: NetworkFrame = match serde_json::from_value(payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("bad frame message: {}", e);
                return;
            }
        };

        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled || inner.terminated {
                return;
            }
            if inner.metadata.is_none() {
                log::debug!("dropping frame {:?}, no metadata yet", frame.i);
                metrics::registry().incr("source.frames_dropped");
                return;
            }

            let id = FrameId::new(frame.i[0], frame.i[1]);
            let data = match base64::engine::general_purpose::STANDARD.decode(&frame.d) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("bad frame data for {}: {}", id, e);
                    return;
                }
            };

            if let Some(partial) = inner.partial.as_ref() {
                if partial.id != id {
                    if (id.i1, id.i2) > (partial.id.i1, partial.id.i2) {
                        log::warn!(
                            "gap in frames channel: dropping partial {} for {}",
                            partial.id,
                            id
                        );
                        metrics::registry().incr("source.gaps");
                        inner.partial = None;
                    } else {
                        log::debug!("stale chunk for {}, current is {}", id, partial.id);
                        return;
                    }
                }
            }

            match inner.partial.as_mut() {
                Some(partial) => {
                    partial.data.extend_from_slice(&data);
                    partial.received += 1;
                    if partial.received == partial.chunks {
                        let partial = inner.partial.take().unwrap();
                        inner.buffered.push_back(EncodedPacket::Frame(EncodedFrame {
                            id: partial.id,
                            data: Bytes::from(partial.data),
                            key_frame: partial.key_frame,
                            arrival_time,
                        }));
                        metrics::registry().incr("source.frames_assembled");
                    }
                }
                None => {
                    if frame.chunks <= 1 {
                        inner.buffered.push_back(EncodedPacket::Frame(EncodedFrame {
                            id,
                            data: Bytes::from(data),
                            key_frame: frame.key,
                            arrival_time,
                        }));
                        metrics::registry().incr("source.frames_assembled");
                    } else if frame.chunk == 1 {
                        inner.partial = Some(PartialFrame {
                            id,
                            chunks: frame.chunks,
                            received: 1,
                            data,
                            key_frame: frame.key,
                        });
                    } else {
                        log::warn!("chunk {}/{} of {} without a start", frame.chunk, frame.chunks, id);
                        metrics::registry().incr("source.frames_dropped");
                    }
                }
            }
        }
        Self::drain(core);
    }

    fn on_client_error(core: &Arc<Self>, error: ClientError) {
        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled || inner.terminated || inner.failed.is_some() {
                return;
            }
            inner.failed = Some(error);
        }
        Self::drain(core);
    }

    fn drain(core: &Arc<Self>) {
        let mut subscriber = {
            let mut inner = core.inner.lock().unwrap();
            if inner.draining || inner.terminated || inner.cancelled {
                return;
            }
            if inner.requested == 0 && inner.failed.is_none() {
                return;
            }
            inner.draining = true;
            inner.subscriber.take()
        };

        loop {
            enum Step {
                Emit(EncodedPacket),
                Fail(ClientError),
                Idle,
            }
            let step = {
                let mut inner = core.inner.lock().unwrap();
                if inner.cancelled {
                    Step::Idle
                } else if inner.requested > 0 && !inner.buffered.is_empty() {
                    inner.requested -= 1;
                    Step::Emit(inner.buffered.pop_front().unwrap())
                } else if inner.buffered.is_empty() && inner.failed.is_some() {
                    Step::Fail(inner.failed.take().unwrap())
                } else {
                    // Restore under the lock; demand arriving later drives a
                    // fresh drain.
                    inner.subscriber = subscriber.take();
                    inner.draining = false;
                    return;
                }
            };
            match step {
                Step::Emit(packet) => {
                    if let Some(subscriber) = subscriber.as_mut() {
                        subscriber.on_next(packet);
                    }
                }
                Step::Fail(error) => {
                    if let Some(subscriber) = subscriber.as_mut() {
                        subscriber.on_error(anyhow::anyhow!("bus source failed: {}", error));
                    }
                    let mut inner = core.inner.lock().unwrap();
                    inner.terminated = true;
                    inner.draining = false;
                    Self::release(&mut inner);
                    return;
                }
                Step::Idle => {
                    let mut inner = core.inner.lock().unwrap();
                    inner.draining = false;
                    Self::release(&mut inner);
                    return;
                }
            }
        }
    }

    fn release(inner: &mut SourceInner) {
        inner.subscriber = None;
        inner.buffered.clear();
        inner.partial = None;
        inner.callbacks = None;
        inner.self_ref = None;
    }

    fn cancel(core: &Arc<Self>) {
        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled || inner.terminated {
                return;
            }
            inner.cancelled = true;
            if !inner.draining {
                Self::release(&mut inner);
            }
        }
        core.client.unsubscribe(&core.metadata_sub, None);
        core.client.unsubscribe(&core.frames_sub, None);
    }
}

struct BusSourceCallbacks {
    core: Weak<SourceCore>,
    metadata_id: u64,
    frames_id: u64,
}

impl ErrorCallbacks for BusSourceCallbacks {
    fn on_error(&self, error: ClientError) {
        log::error!("bus source subscription error: {}", error);
        if let Some(core) = self.core.upgrade() {
            SourceCore::on_client_error(&core, error);
        }
    }
}

impl SubscriptionCallbacks for BusSourceCallbacks {
    fn on_data(&self, subscription: &Subscription, data: ChannelData) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if subscription.id() == self.metadata_id {
            SourceCore::on_metadata(&core, data.payload);
        } else if subscription.id() == self.frames_id {
            SourceCore::on_frame(&core, data.payload, data.arrival_time);
        }
    }
}

struct BusSourceSubscription {
    core: Weak<SourceCore>,
}

impl StreamSubscription for BusSourceSubscription {
    fn request(&self, n: u64) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        {
            let mut inner = core.inner.lock().unwrap();
            if inner.cancelled || inner.terminated {
                return;
            }
            inner.requested = inner.requested.saturating_add(n);
        }
        SourceCore::drain(&core);
    }

    fn cancel(&self) {
        if let Some(core) = self.core.upgrade() {
            SourceCore::cancel(&core);
        }
    }
}
