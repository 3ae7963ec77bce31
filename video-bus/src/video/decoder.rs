use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::data::{CodecParameters, EncodedPacket, FrameId, ImagePacket, PixelFormat};
use crate::metrics;
use crate::streams::{generators, publishers, Publisher};
use crate::video::{metadata_of, owned_frame_from_av, Scaler};

/// Decoder stage: rebuilds image frames from encoded packets, converted to
/// the requested pixel format. Codec-parameter packets (re)initialize the
/// decoder; an undecodable frame is dropped and the stream continues; EOF
/// drains frames still buffered in the codec.
pub fn decode(source: Publisher<EncodedPacket>, pixel_format: PixelFormat) -> Publisher<ImagePacket> {
    let state = Arc::new(Mutex::new(DecoderState::new(pixel_format)));

    let process_state = state.clone();
    let main = source.flat_map(move |packet| process_state.lock().unwrap().process(packet));

    // Runs after the main stream completes: flush the codec and hand out
    // whatever it still holds.
    let flush_state = state;
    let tail = generators::stateful(
        move || flush_state.lock().unwrap().flush(),
        |buffered: &mut VecDeque<ImagePacket>, sink| match buffered.pop_front() {
            Some(packet) => sink.next(packet),
            None => sink.complete(),
        },
    );

    publishers::concat(main, tail)
}

struct DecoderState {
    pixel_format: PixelFormat,
    decoder: Option<ffmpeg_next::codec::decoder::Video>,
    scaler: Option<Scaler>,
    /// Ids of packets fed to the codec whose frames have not come out yet.
    pending_ids: VecDeque<FrameId>,
    announced: bool,
}

impl DecoderState {
    fn new(pixel_format: PixelFormat) -> Self {
        Self {
            pixel_format,
            decoder: None,
            scaler: None,
            pending_ids: VecDeque::new(),
            announced: false,
        }
    }

    fn process(&mut self, packet: EncodedPacket) -> Vec<ImagePacket> {
        match packet {
            EncodedPacket::Params(params) => {
                log::info!("decoder init: {}", params.name);
                if let Err(e) = self.reinit(&params) {
                    log::error!("decoder init failed for {}: {:#}", params.name, e);
                }
                Vec::new()
            }
            EncodedPacket::Frame(frame) => {
                let Some(decoder) = self.decoder.as_mut() else {
                    log::debug!("no decoder, dropping frame {}", frame.id);
                    metrics::registry().incr("decoder.frames_dropped");
                    return Vec::new();
                };

                let packet = ffmpeg_next::Packet::copy(&frame.data);
                self.pending_ids.push_back(frame.id);
                if let Err(e) = decoder.send_packet(&packet) {
                    log::error!("decode failed for {}: {}", frame.id, e);
                    metrics::registry().incr("decoder.frames_dropped");
                    self.pending_ids.pop_back();
                    return Vec::new();
                }
                self.receive_all(frame.id)
            }
        }
    }

    /// Tears down and rebuilds the codec context; frames still buffered in
    /// the old context are discarded.
    fn reinit(&mut self, params: &CodecParameters) -> anyhow::Result<()> {
        if self.decoder.take().is_some() {
            log::debug!("codec parameters changed, discarding decoder state");
        }
        self.scaler = None;
        self.pending_ids.clear();
        self.announced = false;

        let codec = ffmpeg_next::decoder::find_by_name(&params.name)
            .ok_or_else(|| anyhow::anyhow!("decoder not found: {}", params.name))?;
        let mut ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        if !params.extra_data.is_empty() {
            set_extradata(&mut ctx, &params.extra_data);
        }
        if params.width > 0 && params.height > 0 {
            unsafe {
                (*ctx.as_mut_ptr()).width = params.width as i32;
                (*ctx.as_mut_ptr()).height = params.height as i32;
            }
        }
        self.decoder = Some(ctx.decoder().video()?);
        Ok(())
    }

    fn receive_all(&mut self, fallback_id: FrameId) -> Vec<ImagePacket> {
        let mut out = Vec::new();
        loop {
            let mut decoded = ffmpeg_next::frame::Video::empty();
            let received = match self.decoder.as_mut() {
                Some(decoder) => match decoder.receive_frame(&mut decoded) {
                    Ok(()) => true,
                    Err(ffmpeg_next::Error::Eof) => false,
                    Err(ffmpeg_next::Error::Other { errno })
                        if errno == ffmpeg_next::util::error::EAGAIN =>
                    {
                        false
                    }
                    Err(e) => {
                        log::error!("receive frame error: {}", e);
                        false
                    }
                },
                None => false,
            };
            if !received {
                break;
            }

            let id = self.pending_ids.pop_front().unwrap_or(fallback_id);
            let converted = match self.convert(&decoded) {
                Ok(converted) => converted,
                Err(e) => {
                    log::error!("pixel format conversion failed for {}: {:#}", id, e);
                    metrics::registry().incr("decoder.frames_dropped");
                    continue;
                }
            };
            if !self.announced {
                out.push(ImagePacket::Metadata(metadata_of(
                    &converted,
                    self.pixel_format,
                )));
                self.announced = true;
            }
            metrics::registry().incr("decoder.frames_decoded");
            out.push(ImagePacket::Frame(owned_frame_from_av(&converted, id)));
        }
        out
    }

    fn convert(
        &mut self,
        decoded: &ffmpeg_next::frame::Video,
    ) -> anyhow::Result<ffmpeg_next::frame::Video> {
        if self.scaler.is_none() {
            self.scaler = Some(Scaler::new(ffmpeg_next::software::scaling::Context::get(
                decoded.format(),
                decoded.width(),
                decoded.height(),
                self.pixel_format.to_av(),
                decoded.width(),
                decoded.height(),
                ffmpeg_next::software::scaling::flag::Flags::empty(),
            )?));
        }
        let mut converted = ffmpeg_next::frame::Video::empty();
        self.scaler.as_mut().unwrap().run(decoded, &mut converted)?;
        Ok(converted)
    }

    fn flush(&mut self) -> VecDeque<ImagePacket> {
        let mut out = VecDeque::new();
        let Some(decoder) = self.decoder.as_mut() else {
            return out;
        };
        if let Err(e) = decoder.send_eof() {
            log::debug!("send eof: {}", e);
            return out;
        }
        let fallback = self.pending_ids.front().copied().unwrap_or_default();
        out.extend(self.receive_all(fallback));
        out
    }
}

fn set_extradata(ctx: &mut ffmpeg_next::codec::Context, extra_data: &[u8]) {
    unsafe {
        let size = extra_data.len();
        let buffer = ffmpeg_next::ffi::av_mallocz(
            size + ffmpeg_next::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize,
        ) as *mut u8;
        std::ptr::copy_nonoverlapping(extra_data.as_ptr(), buffer, size);
        (*ctx.as_mut_ptr()).extradata = buffer;
        (*ctx.as_mut_ptr()).extradata_size = size as i32;
    }
}
