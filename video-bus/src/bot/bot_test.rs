use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::bot::{BotDescriptor, RunBot};
use crate::data::{
    BotInput, BotOutput, FrameId, ImageMetadata, ImagePacket, MessageKind, OwnedImageFrame,
    PixelFormat, MAX_IMAGE_PLANES,
};
use crate::streams::{publishers, Subscriber, SubscriptionHandle};

struct OutputCollector {
    outputs: Arc<Mutex<Vec<BotOutput>>>,
    completions: Arc<Mutex<u32>>,
}

impl Subscriber<BotOutput> for OutputCollector {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        subscription.request(u64::MAX);
    }

    fn on_next(&mut self, element: BotOutput) {
        self.outputs.lock().unwrap().push(element);
    }

    fn on_error(&mut self, error: anyhow::Error) {
        panic!("unexpected bot stream error: {:#}", error);
    }

    fn on_complete(&mut self) {
        *self.completions.lock().unwrap() += 1;
    }
}

fn noop_image_callback() -> crate::bot::ImageCallback {
    Box::new(|_, _| {})
}

fn frame(id: FrameId, width: u32, height: u32) -> OwnedImageFrame {
    let mut plane_strides = [0u32; MAX_IMAGE_PLANES];
    plane_strides[0] = width * 4;
    OwnedImageFrame {
        id,
        width,
        height,
        plane_strides,
        plane_data: Default::default(),
    }
}

/// Runs the bot over `inputs` and returns (outputs, completions).
fn run_collecting(
    bot: RunBot,
    inputs: Vec<BotInput>,
) -> (Arc<Mutex<Vec<BotOutput>>>, Arc<Mutex<u32>>) {
    let outputs = Arc::new(Mutex::new(Vec::new()));
    let completions = Arc::new(Mutex::new(0));
    bot.run(publishers::of(inputs)).subscribe(OutputCollector {
        outputs: outputs.clone(),
        completions: completions.clone(),
    });
    (outputs, completions)
}

fn messages(outputs: &[BotOutput]) -> Vec<(MessageKind, serde_json::Value)> {
    outputs
        .iter()
        .filter_map(|output| match output {
            BotOutput::Message(message) => Some((message.kind, message.data.clone())),
            _ => None,
        })
        .collect()
}

#[test]
fn test_configure_and_shutdown_empty_bot() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let ctrl_calls = calls.clone();
    let mut bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: noop_image_callback(),
            ctrl_callback: Some(Box::new(move |_, cmd| {
                ctrl_calls.lock().unwrap().push(cmd);
                None
            })),
        },
    );
    bot.configure(Some(json!({"k": 1})));

    let (outputs, completions) = run_collecting(bot, Vec::new());

    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            json!({"action": "configure", "body": {"k": 1}}),
            json!({"action": "shutdown"}),
        ]
    );
    assert!(outputs.lock().unwrap().is_empty(), "null responses emit nothing");
    assert_eq!(*completions.lock().unwrap(), 1);
}

#[test]
fn test_single_frame_batch_latches_metadata() {
    let seen: Arc<Mutex<Vec<(usize, ImageMetadata)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_callback = seen.clone();
    let bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: Box::new(move |instance, frames| {
                seen_in_callback
                    .lock()
                    .unwrap()
                    .push((frames.len(), *instance.image_metadata()));
            }),
            ctrl_callback: None,
        },
    );

    let batch: VecDeque<ImagePacket> =
        vec![ImagePacket::Frame(frame(FrameId::new(10, 11), 640, 480))].into();
    let (outputs, completions) = run_collecting(bot, vec![BotInput::Frames(batch)]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1, "image callback runs once");
    assert_eq!(seen[0].0, 1, "one-frame span");
    assert_eq!(seen[0].1.width, 640, "metadata latched before the callback");
    assert_eq!(seen[0].1.height, 480);

    let outputs = outputs.lock().unwrap();
    assert_eq!(outputs.len(), 1);
    match &outputs[0] {
        BotOutput::Packet(ImagePacket::Frame(f)) => assert_eq!(f.id, FrameId::new(10, 11)),
        other => panic!("expected the frame to pass through, got {:?}", other),
    }
    assert_eq!(*completions.lock().unwrap(), 1);
}

#[test]
#[should_panic(expected = "frame resolution has been changed")]
fn test_geometry_change_after_latch_is_fatal() {
    let bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: noop_image_callback(),
            ctrl_callback: None,
        },
    );
    let first: VecDeque<ImagePacket> =
        vec![ImagePacket::Frame(frame(FrameId::new(1, 2), 640, 480))].into();
    let second: VecDeque<ImagePacket> =
        vec![ImagePacket::Frame(frame(FrameId::new(2, 3), 1280, 720))].into();
    run_collecting(bot, vec![BotInput::Frames(first), BotInput::Frames(second)]);
}

#[test]
fn test_message_stamping_uses_current_frame_id() {
    let bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: Box::new(|instance, _frames| {
                instance.queue_message(MessageKind::Analysis, json!({"x": 3}), FrameId::default());
            }),
            ctrl_callback: None,
        },
    );

    let batch: VecDeque<ImagePacket> =
        vec![ImagePacket::Frame(frame(FrameId::new(20, 21), 640, 480))].into();
    let (outputs, _) = run_collecting(bot, vec![BotInput::Frames(batch)]);

    let outputs = outputs.lock().unwrap();
    assert_eq!(
        messages(&outputs),
        vec![(
            MessageKind::Analysis,
            json!({"x": 3, "i": [20, 21], "from": "b1"})
        )]
    );
}

#[test]
fn test_control_routing_by_bot_id() {
    let pings = Arc::new(Mutex::new(0u32));
    let ping_count = pings.clone();
    let bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: noop_image_callback(),
            ctrl_callback: Some(Box::new(move |_, _cmd| {
                *ping_count.lock().unwrap() += 1;
                Some(json!({"pong": true}))
            })),
        },
    );

    let inputs = vec![
        BotInput::Control(json!({"to": "b2", "request_id": "r", "action": "ping"})),
        BotInput::Control(json!({"to": "b1", "request_id": "r", "action": "ping"})),
    ];
    let (outputs, _) = run_collecting(bot, inputs);

    // Only the message addressed to b1 reaches the callback (the shutdown
    // command is the second call).
    assert_eq!(*pings.lock().unwrap(), 2);

    let outputs = outputs.lock().unwrap();
    let control_messages: Vec<_> = messages(&outputs)
        .into_iter()
        .filter(|(kind, _)| *kind == MessageKind::Control)
        .collect();
    assert_eq!(
        control_messages,
        vec![(
            MessageKind::Control,
            json!({"pong": true, "request_id": "r", "from": "b1"})
        )]
    );
}

#[test]
fn test_control_array_recurses_and_bad_messages_drop() {
    let actions = Arc::new(Mutex::new(Vec::new()));
    let seen_actions = actions.clone();
    let bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: noop_image_callback(),
            ctrl_callback: Some(Box::new(move |_, cmd| {
                seen_actions
                    .lock()
                    .unwrap()
                    .push(cmd["action"].as_str().unwrap_or_default().to_string());
                None
            })),
        },
    );

    let inputs = vec![
        BotInput::Control(json!([
            {"to": "b1", "action": "first"},
            "not an object",
            {"no_to_field": true},
            {"to": "b1", "action": "second"},
        ])),
    ];
    let (outputs, _) = run_collecting(bot, inputs);

    assert_eq!(
        *actions.lock().unwrap(),
        vec!["first", "second", "shutdown"],
        "array elements recurse; junk is dropped with a warning"
    );
    assert!(outputs.lock().unwrap().is_empty());
}

#[test]
fn test_metadata_packets_pass_through_without_callback() {
    let called = Arc::new(Mutex::new(false));
    let called_flag = called.clone();
    let bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: Box::new(move |_, _| {
                *called_flag.lock().unwrap() = true;
            }),
            ctrl_callback: None,
        },
    );

    let batch: VecDeque<ImagePacket> =
        vec![ImagePacket::Metadata(ImageMetadata::default())].into();
    let (outputs, _) = run_collecting(bot, vec![BotInput::Frames(batch)]);

    assert!(!*called.lock().unwrap(), "no frames, no image callback");
    let outputs = outputs.lock().unwrap();
    assert_eq!(outputs.len(), 1);
    assert!(matches!(
        outputs[0],
        BotOutput::Packet(ImagePacket::Metadata(_))
    ));
}

#[test]
fn test_shutdown_response_becomes_debug_message() {
    let bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: noop_image_callback(),
            ctrl_callback: Some(Box::new(|_, cmd| {
                if cmd["action"] == "shutdown" {
                    Some(json!({"bye": true}))
                } else {
                    None
                }
            })),
        },
    );

    let (outputs, completions) = run_collecting(bot, Vec::new());

    let outputs = outputs.lock().unwrap();
    assert_eq!(
        messages(&outputs),
        vec![(MessageKind::Debug, json!({"bye": true, "from": "b1"}))]
    );
    assert_eq!(*completions.lock().unwrap(), 1);
}

#[test]
#[should_panic(expected = "control handler was not provided")]
fn test_config_without_control_callback_is_fatal() {
    let mut bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: noop_image_callback(),
            ctrl_callback: None,
        },
    );
    bot.configure(Some(json!({"k": 1})));
}

#[test]
fn test_queue_message_keeps_explicit_frame_id() {
    let bot = RunBot::new(
        "b1",
        BotDescriptor {
            pixel_format: PixelFormat::Rgb0,
            img_callback: Box::new(|instance, _frames| {
                instance.queue_message(
                    MessageKind::Analysis,
                    json!({"explicit": true}),
                    FrameId::new(7, 8),
                );
                instance.queue_message(MessageKind::Debug, json!({"synthetic": true}), FrameId::new(-1, 0));
            }),
            ctrl_callback: None,
        },
    );

    let batch: VecDeque<ImagePacket> =
        vec![ImagePacket::Frame(frame(FrameId::new(30, 31), 640, 480))].into();
    let (outputs, _) = run_collecting(bot, vec![BotInput::Frames(batch)]);

    let outputs = outputs.lock().unwrap();
    assert_eq!(
        messages(&outputs),
        vec![
            (
                MessageKind::Analysis,
                json!({"explicit": true, "i": [7, 8], "from": "b1"})
            ),
            // A negative id means no frame context: the "i" field is omitted.
            (MessageKind::Debug, json!({"synthetic": true, "from": "b1"})),
        ]
    );
}
