use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::data::{
    BotInput, BotMessage, BotOutput, FrameId, ImageMetadata, ImagePacket, MessageKind,
    OwnedImageFrame, PixelFormat,
};
use crate::metrics;
use crate::streams::{generators, publishers, Publisher};

/// Called with each batch of decoded frames. Emit messages through
/// [`BotInstance::queue_message`].
pub type ImageCallback = Box<dyn FnMut(&mut BotInstance, &[OwnedImageFrame]) + Send>;

/// Called with control messages addressed to this bot (plus the synthesized
/// configure and shutdown commands). A non-null response is sent back.
pub type ControlCallback =
    Box<dyn FnMut(&mut BotInstance, serde_json::Value) -> Option<serde_json::Value> + Send>;

pub struct BotDescriptor {
    pub pixel_format: PixelFormat,
    pub img_callback: ImageCallback,
    pub ctrl_callback: Option<ControlCallback>,
}

/// Per-bot state visible to the user callbacks.
pub struct BotInstance {
    bot_id: String,
    image_metadata: ImageMetadata,
    message_buffer: VecDeque<BotMessage>,
    current_frame_id: FrameId,
}

impl BotInstance {
    fn new(bot_id: &str) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            image_metadata: ImageMetadata::default(),
            message_buffer: VecDeque::new(),
            current_frame_id: FrameId::default(),
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn image_metadata(&self) -> &ImageMetadata {
        &self.image_metadata
    }

    /// Queues an outbound message. A zero id is replaced by the frame id
    /// currently being processed, when there is one.
    pub fn queue_message(&mut self, kind: MessageKind, data: serde_json::Value, id: FrameId) {
        assert!(data.is_object(), "message is not an object: {}", data);

        let effective_id = if id.is_zero()
            && self.current_frame_id.i1 != 0
            && self.current_frame_id.i2 != 0
        {
            self.current_frame_id
        } else {
            id
        };
        self.message_buffer.push_back(BotMessage {
            kind,
            data,
            id: effective_id,
        });
    }

    /// Stamps every buffered message for downstream: a sent metric by kind,
    /// the frame id pair under `"i"` and the sender under `"from"`.
    fn prepare_message_buffer_for_downstream(&mut self) {
        for message in self.message_buffer.iter_mut() {
            metrics::registry().incr(&format!("messages_sent.{}", message.kind.as_str()));

            let data = message
                .data
                .as_object_mut()
                .unwrap_or_else(|| panic!("message data is not an object"));

            if message.id.i1 >= 0 && !message.id.is_zero() {
                data.insert("i".to_string(), json!([message.id.i1, message.id.i2]));
            }
            if !self.bot_id.is_empty() {
                data.insert("from".to_string(), json!(self.bot_id));
            }
        }
    }

    fn drain_message_buffer(&mut self) -> VecDeque<BotMessage> {
        self.prepare_message_buffer_for_downstream();
        std::mem::take(&mut self.message_buffer)
    }
}

/// Runs a bot: turns a stream of bot inputs into the bot's outputs, with the
/// configure command up front and the shutdown burst appended at the end.
pub struct RunBot {
    instance: BotInstance,
    descriptor: BotDescriptor,
}

impl RunBot {
    pub fn new(bot_id: &str, descriptor: BotDescriptor) -> Self {
        Self {
            instance: BotInstance::new(bot_id),
            descriptor,
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.descriptor.pixel_format
    }

    /// Dispatches the synthesized configure command. A configuration without
    /// a control callback is a contract violation.
    pub fn configure(&mut self, config: Option<serde_json::Value>) {
        let Some(ctrl_callback) = self.descriptor.ctrl_callback.as_mut() else {
            if config.is_none() {
                return;
            }
            panic!("bot control handler was not provided but config was");
        };

        let cmd = json!({
            "action": "configure",
            "body": config.unwrap_or_else(|| json!({})),
        });
        log::info!("configuring bot: {}", cmd);
        if let Some(response) = ctrl_callback(&mut self.instance, cmd) {
            self.instance
                .queue_message(MessageKind::Debug, response, FrameId::default());
        }
    }

    /// The bot operator: main stream first, then the shutdown burst.
    pub fn run(self, source: Publisher<BotInput>) -> Publisher<BotOutput> {
        let shared = Arc::new(Mutex::new(self));

        let dispatch_shared = shared.clone();
        let main = source.flat_map(move |input| dispatch_shared.lock().unwrap().dispatch(input));

        let shutdown_shared = shared;
        let shutdown = generators::stateful(
            move || shutdown_shared.lock().unwrap().shutdown(),
            |buffer: &mut VecDeque<BotMessage>, sink| match buffer.pop_front() {
                Some(message) => sink.next(BotOutput::Message(message)),
                None => sink.complete(),
            },
        );

        publishers::concat(main, shutdown)
    }

    fn dispatch(&mut self, input: BotInput) -> VecDeque<BotOutput> {
        match input {
            BotInput::Frames(batch) => self.dispatch_frames(batch),
            BotInput::Control(message) => self.dispatch_control(message),
        }
    }

    fn dispatch_frames(&mut self, batch: VecDeque<ImagePacket>) -> VecDeque<BotOutput> {
        metrics::registry().observe("frame_batch_size", batch.len() as u64);

        let frames: Vec<OwnedImageFrame> = batch
            .iter()
            .filter_map(|packet| match packet {
                ImagePacket::Frame(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect();
        let mut result: VecDeque<BotOutput> = batch.into_iter().map(BotOutput::Packet).collect();

        for frame in &frames {
            self.latch_metadata(frame);
        }

        if !frames.is_empty() {
            log::debug!(
                "process {} frames {}x{}",
                frames.len(),
                self.instance.image_metadata.width,
                self.instance.image_metadata.height
            );
            self.instance.current_frame_id = frames.last().unwrap().id;
            (self.descriptor.img_callback)(&mut self.instance, &frames);
            metrics::registry().incr("frame_batches_processed");

            result.extend(self.instance.drain_message_buffer().into_iter().map(BotOutput::Message));
        }

        result
    }

    /// Frame geometry is latched by the first frame; any later change is a
    /// contract violation.
    fn latch_metadata(&mut self, frame: &OwnedImageFrame) {
        let metadata = &mut self.instance.image_metadata;
        if frame.width == metadata.width && frame.height == metadata.height {
            return;
        }
        assert!(
            metadata.width == 0,
            "frame resolution has been changed: {}x{} -> {}x{}",
            metadata.width,
            metadata.height,
            frame.width,
            frame.height
        );
        metadata.width = frame.width;
        metadata.height = frame.height;
        metadata.pixel_format = self.descriptor.pixel_format;
        metadata.plane_strides = frame.plane_strides;
    }

    fn dispatch_control(&mut self, message: serde_json::Value) -> VecDeque<BotOutput> {
        metrics::registry().incr("messages_received.control");

        if let serde_json::Value::Array(elements) = message {
            let mut aggregated = VecDeque::new();
            for element in elements {
                aggregated.append(&mut self.dispatch_control(element));
            }
            return aggregated;
        }

        let Some(to) = message.get("to") else {
            log::error!("unsupported kind of message: {}", message);
            return VecDeque::new();
        };
        if self.instance.bot_id.is_empty() || to.as_str() != Some(self.instance.bot_id.as_str()) {
            log::info!("message for a different bot: {}", message);
            return VecDeque::new();
        }

        let Some(ctrl_callback) = self.descriptor.ctrl_callback.as_mut() else {
            log::warn!("bot has no control handler, dropping: {}", message);
            return VecDeque::new();
        };

        let request_id = message.get("request_id").cloned();
        if let Some(mut response) = ctrl_callback(&mut self.instance, message) {
            assert!(
                response.is_object(),
                "bot response is not an object: {}",
                response
            );
            if let (Some(request_id), Some(response)) = (request_id, response.as_object_mut()) {
                response.insert("request_id".to_string(), request_id);
            }
            self.instance
                .queue_message(MessageKind::Control, response, FrameId::default());
        }

        self.instance
            .drain_message_buffer()
            .into_iter()
            .map(BotOutput::Message)
            .collect()
    }

    fn shutdown(&mut self) -> VecDeque<BotMessage> {
        log::info!("shutting down bot");
        if let Some(ctrl_callback) = self.descriptor.ctrl_callback.as_mut() {
            let cmd = json!({"action": "shutdown"});
            match ctrl_callback(&mut self.instance, cmd) {
                Some(response) => {
                    log::info!("got shutdown response: {}", response);
                    self.instance
                        .queue_message(MessageKind::Debug, response, FrameId::default());
                }
                None => log::info!("shutdown response is null"),
            }
        }
        self.instance.drain_message_buffer()
    }
}
