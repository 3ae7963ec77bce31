use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;

use crate::data::{
    CodecParameters, EncodedFrame, EncodedPacket, FrameId, ImageMetadata, ImagePacket,
};
use crate::metrics;
use crate::streams::{generators, publishers, Publisher};
use crate::video::{av_frame_from_owned, Scaler};

/// VP9 transcode stage: image packets in, encoded packets out. The first
/// output is a codec-parameters packet; frame ids and key flags are carried
/// through. `lag_in_frames` trades latency for compression.
pub fn encode_vp9(source: Publisher<ImagePacket>, lag_in_frames: u32) -> Publisher<EncodedPacket> {
    let state = Arc::new(Mutex::new(EncoderState::new(lag_in_frames)));

    let process_state = state.clone();
    let main = source.flat_map(move |packet| process_state.lock().unwrap().process(packet));

    let flush_state = state;
    let tail = generators::stateful(
        move || flush_state.lock().unwrap().flush(),
        |buffered: &mut VecDeque<EncodedPacket>, sink| match buffered.pop_front() {
            Some(packet) => sink.next(packet),
            None => sink.complete(),
        },
    );

    publishers::concat(main, tail)
}

struct EncoderState {
    lag_in_frames: u32,
    encoder: Option<ffmpeg_next::codec::encoder::Video>,
    scaler: Option<Scaler>,
    metadata: Option<ImageMetadata>,
    pending_ids: VecDeque<FrameId>,
    frame_index: i64,
}

impl EncoderState {
    fn new(lag_in_frames: u32) -> Self {
        Self {
            lag_in_frames,
            encoder: None,
            scaler: None,
            metadata: None,
            pending_ids: VecDeque::new(),
            frame_index: 0,
        }
    }

    fn process(&mut self, packet: ImagePacket) -> Vec<EncodedPacket> {
        match packet {
            ImagePacket::Metadata(metadata) => match self.reinit(&metadata) {
                Ok(params) => vec![EncodedPacket::Params(params)],
                Err(e) => {
                    log::error!("vp9 encoder init failed: {:#}", e);
                    Vec::new()
                }
            },
            ImagePacket::Frame(frame) => {
                let Some(metadata) = self.metadata else {
                    log::debug!("no encoder metadata, dropping frame {}", frame.id);
                    return Vec::new();
                };
                if self.encoder.is_none() {
                    return Vec::new();
                }

                let av_frame = match av_frame_from_owned(&frame, metadata.pixel_format) {
                    Ok(av_frame) => av_frame,
                    Err(e) => {
                        log::error!("bad input frame {}: {:#}", frame.id, e);
                        return Vec::new();
                    }
                };
                let mut yuv = match self.convert(&av_frame) {
                    Ok(yuv) => yuv,
                    Err(e) => {
                        log::error!("conversion failed for {}: {:#}", frame.id, e);
                        return Vec::new();
                    }
                };
                yuv.set_pts(Some(self.frame_index));
                self.frame_index += 1;

                self.pending_ids.push_back(frame.id);
                let encoder = self.encoder.as_mut().unwrap();
                if let Err(e) = encoder.send_frame(&yuv) {
                    log::error!("vp9 encode failed for {}: {}", frame.id, e);
                    self.pending_ids.pop_back();
                    return Vec::new();
                }
                self.receive_all()
            }
        }
    }

    fn reinit(&mut self, metadata: &ImageMetadata) -> anyhow::Result<CodecParameters> {
        self.encoder = None;
        self.scaler = None;
        self.pending_ids.clear();
        self.metadata = Some(*metadata);

        let codec = ffmpeg_next::encoder::find_by_name("libvpx-vp9")
            .ok_or_else(|| anyhow::anyhow!("libvpx-vp9 encoder not found"))?;
        let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = ctx.encoder().video()?;
        encoder.set_width(metadata.width);
        encoder.set_height(metadata.height);
        encoder.set_format(ffmpeg_next::format::Pixel::YUV420P);
        encoder.set_time_base(ffmpeg_next::Rational::new(1, 1000));
        encoder.set_gop(30);

        let mut opts = ffmpeg_next::Dictionary::new();
        opts.set("deadline", "realtime");
        opts.set("lag-in-frames", &self.lag_in_frames.to_string());
        let encoder = encoder.open_with(opts)?;

        log::info!(
            "vp9 encoder ready: {}x{}, lag {}",
            metadata.width,
            metadata.height,
            self.lag_in_frames
        );
        self.encoder = Some(encoder);
        Ok(CodecParameters {
            name: "vp9".to_string(),
            extra_data: Bytes::new(),
            width: metadata.width,
            height: metadata.height,
        })
    }

    fn convert(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
    ) -> anyhow::Result<ffmpeg_next::frame::Video> {
        if self.scaler.is_none() {
            self.scaler = Some(Scaler::new(ffmpeg_next::software::scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                ffmpeg_next::format::Pixel::YUV420P,
                frame.width(),
                frame.height(),
                ffmpeg_next::software::scaling::flag::Flags::empty(),
            )?));
        }
        let mut converted = ffmpeg_next::frame::Video::empty();
        self.scaler.as_mut().unwrap().run(frame, &mut converted)?;
        converted.set_pts(frame.pts());
        Ok(converted)
    }

    fn receive_all(&mut self) -> Vec<EncodedPacket> {
        let mut out = Vec::new();
        loop {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            let received = match self.encoder.as_mut() {
                Some(encoder) => match encoder.receive_packet(&mut packet) {
                    Ok(()) => true,
                    Err(ffmpeg_next::Error::Eof) => false,
                    Err(ffmpeg_next::Error::Other { errno })
                        if errno == ffmpeg_next::util::error::EAGAIN =>
                    {
                        false
                    }
                    Err(e) => {
                        log::error!("receive packet error: {}", e);
                        false
                    }
                },
                None => false,
            };
            if !received {
                break;
            }

            let id = self.pending_ids.pop_front().unwrap_or_default();
            metrics::registry().incr("vp9.frames_encoded");
            out.push(EncodedPacket::Frame(EncodedFrame {
                id,
                data: packet
                    .data()
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default(),
                key_frame: packet.is_key(),
                arrival_time: SystemTime::now(),
            }));
        }
        out
    }

    fn flush(&mut self) -> VecDeque<EncodedPacket> {
        let mut out = VecDeque::new();
        let Some(encoder) = self.encoder.as_mut() else {
            return out;
        };
        if let Err(e) = encoder.send_eof() {
            log::debug!("send eof: {}", e);
            return out;
        }
        out.extend(self.receive_all());
        out
    }
}
