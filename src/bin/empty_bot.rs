//! Minimal bot wired end to end over the in-process bus: a feeder thread
//! VP9-encodes a synthetic test picture (or a looped input file) and
//! publishes it as chunked network frames; the bot consumes it like any live
//! channel. Useful as a template for bot authors.

use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use video_bus::bot::{run_bot, BotDescriptor, RunnerOptions, VideoOrigin};
use video_bus::bus::LocalBus;
use video_bus::data::{
    FrameId, ImageMetadata, ImagePacket, MessageKind, OwnedImageFrame, PixelFormat,
    MAX_IMAGE_PLANES,
};
use video_bus::sink::PublishPacketsSink;
use video_bus::source::{av_source, AvInput};
use video_bus::streams::{generators, Publisher};
use video_bus::video::encode_vp9;

const CHANNEL: &str = "empty_bot";
const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// A moving gradient, paced to roughly 10 fps.
fn synthetic_frames() -> Publisher<ImagePacket> {
    let stride = (WIDTH * 4) as usize;
    let mut plane_strides = [0u32; MAX_IMAGE_PLANES];
    plane_strides[0] = stride as u32;
    let metadata = ImageMetadata {
        width: WIDTH,
        height: HEIGHT,
        pixel_format: PixelFormat::Rgb0,
        plane_strides,
    };

    struct FeederState {
        sequence: i64,
        announced: bool,
    }

    generators::stateful(
        move || FeederState {
            sequence: 0,
            announced: false,
        },
        move |state, sink| {
            if !state.announced {
                state.announced = true;
                sink.next(ImagePacket::Metadata(metadata));
                return;
            }

            std::thread::sleep(FRAME_INTERVAL);
            let mut data = vec![0u8; stride * HEIGHT as usize];
            for (row, line) in data.chunks_mut(stride).enumerate() {
                for (col, pixel) in line.chunks_mut(4).enumerate() {
                    pixel[0] = (col as i64 + state.sequence) as u8;
                    pixel[1] = row as u8;
                    pixel[2] = (state.sequence * 3) as u8;
                }
            }
            let mut plane_data: [Bytes; MAX_IMAGE_PLANES] = Default::default();
            plane_data[0] = Bytes::from(data);
            let frame = OwnedImageFrame {
                id: FrameId::new(state.sequence, state.sequence + 1),
                width: WIDTH,
                height: HEIGHT,
                plane_strides,
                plane_data,
            };
            state.sequence += 1;
            sink.next(ImagePacket::Frame(frame));
        },
    )
}

fn feeder_stream() -> Publisher<video_bus::data::EncodedPacket> {
    if let Ok(path) = std::env::var("VBOT_INPUT_FILE") {
        log::info!("feeding from {}", path);
        return av_source(AvInput::File {
            path,
            loop_file: true,
        });
    }
    log::info!("feeding a synthetic test picture");
    encode_vp9(synthetic_frames(), 0)
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    video_bus::init().expect("ffmpeg init");

    let bus = LocalBus::new();

    // Feeder runs on its own thread: an endless demand loop paced by the
    // frame interval.
    let feeder_bus = bus.clone();
    std::thread::spawn(move || {
        feeder_stream().subscribe(PublishPacketsSink::new(
            feeder_bus,
            CHANNEL,
            Box::new(|| log::info!("feeder stream ended")),
        ));
    });

    let descriptor = BotDescriptor {
        pixel_format: PixelFormat::Bgr,
        img_callback: Box::new(|instance, frames| {
            let metadata = instance.image_metadata();
            log::info!(
                "got {} frame(s) {}x{}",
                frames.len(),
                metadata.width,
                metadata.height
            );
            instance.queue_message(
                MessageKind::Analysis,
                json!({"frames_seen": frames.len()}),
                FrameId::default(),
            );
        }),
        ctrl_callback: Some(Box::new(|_, cmd| {
            log::info!("control: {}", cmd);
            None
        })),
    };

    let options = RunnerOptions {
        bot_id: "empty_bot".to_string(),
        channel: CHANNEL.to_string(),
        origin: VideoOrigin::Bus,
        config: None,
    };

    let factory_bus = bus.clone();
    let result = run_bot(
        descriptor,
        options,
        Box::new(move |_callbacks| {
            let client: std::sync::Arc<dyn video_bus::bus::Client> = factory_bus.clone();
            Ok(client)
        }),
    );
    if let Err(e) = result {
        log::error!("bot failed: {:#}", e);
        std::process::exit(1);
    }
}
