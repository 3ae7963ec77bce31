use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::data::{
    EncodedFrame, EncodedPacket, FrameId, ImageMetadata, ImagePacket, OwnedImageFrame, PixelFormat,
    MAX_IMAGE_PLANES,
};
use crate::streams::{publishers, Subscriber, SubscriptionHandle};
use crate::video::{decode, encode_vp9};

struct Collector<T> {
    items: Arc<Mutex<Vec<T>>>,
    completions: Arc<Mutex<u32>>,
}

impl<T: Send + 'static> Subscriber<T> for Collector<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        subscription.request(u64::MAX);
    }

    fn on_next(&mut self, element: T) {
        self.items.lock().unwrap().push(element);
    }

    fn on_error(&mut self, error: anyhow::Error) {
        panic!("unexpected stream error: {:#}", error);
    }

    fn on_complete(&mut self) {
        *self.completions.lock().unwrap() += 1;
    }
}

fn collector<T: Send + 'static>() -> (Collector<T>, Arc<Mutex<Vec<T>>>, Arc<Mutex<u32>>) {
    let items = Arc::new(Mutex::new(Vec::new()));
    let completions = Arc::new(Mutex::new(0));
    (
        Collector {
            items: items.clone(),
            completions: completions.clone(),
        },
        items,
        completions,
    )
}

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

fn rgb0_metadata() -> ImageMetadata {
    let mut plane_strides = [0u32; MAX_IMAGE_PLANES];
    plane_strides[0] = WIDTH * 4;
    ImageMetadata {
        width: WIDTH,
        height: HEIGHT,
        pixel_format: PixelFormat::Rgb0,
        plane_strides,
    }
}

fn rgb0_frame(id: FrameId, shade: u8) -> OwnedImageFrame {
    let stride = (WIDTH * 4) as usize;
    let mut data = vec![0u8; stride * HEIGHT as usize];
    for (row, line) in data.chunks_mut(stride).enumerate() {
        for pixel in line.chunks_mut(4) {
            pixel[0] = shade;
            pixel[1] = row as u8;
            pixel[2] = 128;
        }
    }
    let mut plane_strides = [0u32; MAX_IMAGE_PLANES];
    plane_strides[0] = stride as u32;
    let mut plane_data: [Bytes; MAX_IMAGE_PLANES] = Default::default();
    plane_data[0] = Bytes::from(data);
    OwnedImageFrame {
        id,
        width: WIDTH,
        height: HEIGHT,
        plane_strides,
        plane_data,
    }
}

fn transcode_frames(count: i64) -> Vec<EncodedPacket> {
    crate::init().unwrap();

    let mut input = vec![ImagePacket::Metadata(rgb0_metadata())];
    for n in 0..count {
        input.push(ImagePacket::Frame(rgb0_frame(
            FrameId::new(10 + n, 11 + n),
            (n * 16) as u8,
        )));
    }

    let (collector, items, completions) = collector();
    encode_vp9(publishers::of(input), 0).subscribe(collector);

    assert_eq!(*completions.lock().unwrap(), 1, "encoder stream completes");
    let packets = items.lock().unwrap().clone();
    packets
}

#[test]
fn test_vp9_emits_params_then_frames_with_ids() {
    let packets = transcode_frames(5);

    match &packets[0] {
        EncodedPacket::Params(params) => assert_eq!(params.name, "vp9"),
        other => panic!("expected codec params first, got {:?}", other),
    }

    let frames: Vec<&EncodedFrame> = packets
        .iter()
        .filter_map(|packet| match packet {
            EncodedPacket::Frame(frame) => Some(frame),
            _ => None,
        })
        .collect();
    assert_eq!(frames.len(), 5, "every input frame comes out");
    assert!(frames[0].key_frame, "stream starts with a key frame");
    for (n, frame) in frames.iter().enumerate() {
        assert_eq!(frame.id, FrameId::new(10 + n as i64, 11 + n as i64));
        assert!(!frame.data.is_empty());
    }
}

#[test]
fn test_vp9_round_trip_preserves_geometry_and_ids() {
    let packets = transcode_frames(3);

    let (collector, items, completions) = collector();
    decode(publishers::of(packets), PixelFormat::Rgb0).subscribe(collector);

    assert_eq!(*completions.lock().unwrap(), 1);
    let decoded = items.lock().unwrap();
    match decoded.first() {
        Some(ImagePacket::Metadata(metadata)) => {
            assert_eq!(metadata.width, WIDTH);
            assert_eq!(metadata.height, HEIGHT);
            assert_eq!(metadata.pixel_format, PixelFormat::Rgb0);
        }
        other => panic!("expected image metadata first, got {:?}", other),
    }

    let frames: Vec<&OwnedImageFrame> = decoded
        .iter()
        .filter_map(|packet| match packet {
            ImagePacket::Frame(frame) => Some(frame),
            _ => None,
        })
        .collect();
    assert_eq!(frames.len(), 3);
    for (n, frame) in frames.iter().enumerate() {
        assert_eq!(frame.id, FrameId::new(10 + n as i64, 11 + n as i64));
        assert_eq!(frame.width, WIDTH, "frame geometry matches the metadata");
        assert_eq!(frame.height, HEIGHT);
        assert!(!frame.plane_data[0].is_empty());
    }
}

#[test]
fn test_decoder_drops_undecodable_frame_and_continues() {
    let mut packets = transcode_frames(2);

    // Splice a garbage frame in after the codec parameters.
    packets.insert(
        1,
        EncodedPacket::Frame(EncodedFrame {
            id: FrameId::new(1, 2),
            data: Bytes::from_static(b"not a vp9 frame"),
            key_frame: false,
            arrival_time: std::time::SystemTime::now(),
        }),
    );

    let (collector, items, completions) = collector();
    decode(publishers::of(packets), PixelFormat::Bgr).subscribe(collector);

    assert_eq!(*completions.lock().unwrap(), 1, "stream survives a bad frame");
    let decoded = items.lock().unwrap();
    let frames: Vec<&OwnedImageFrame> = decoded
        .iter()
        .filter_map(|packet| match packet {
            ImagePacket::Frame(frame) => Some(frame),
            _ => None,
        })
        .collect();
    assert_eq!(frames.len(), 2, "the two real frames still decode");
    for frame in frames {
        assert_ne!(frame.id, FrameId::new(1, 2));
    }
}
