use std::time::SystemTime;

use crate::data::{CodecParameters, EncodedFrame, EncodedPacket};
use crate::metrics;
use crate::sink::DoneCallback;
use crate::streams::{Subscriber, SubscriptionHandle};

/// Writes encoded packets into a Matroska file: the first codec-parameters
/// packet configures the stream header, every frame becomes a block with its
/// key flag and a timestamp derived from arrival time.
pub struct ContainerSink {
    path: String,
    writer: Option<ContainerWriter>,
    params: Option<CodecParameters>,
    subscription: Option<SubscriptionHandle>,
    done: Option<DoneCallback>,
}

impl ContainerSink {
    pub fn new(path: &str, done: DoneCallback) -> Self {
        Self {
            path: path.to_string(),
            writer: None,
            params: None,
            subscription: None,
            done: Some(done),
        }
    }

    fn finish(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.finish() {
                log::error!("error finishing {}: {:#}", self.path, e);
            }
        }
        self.subscription = None;
        if let Some(done) = self.done.take() {
            done();
        }
    }
}

impl Subscriber<EncodedPacket> for ContainerSink {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        subscription.request(1);
        self.subscription = Some(subscription);
    }

    fn on_next(&mut self, element: EncodedPacket) {
        match element {
            EncodedPacket::Params(params) => {
                if self.writer.is_none() {
                    log::info!("writing {} ({} stream)", self.path, params.name);
                    match ContainerWriter::create(&self.path, &params) {
                        Ok(writer) => {
                            self.writer = Some(writer);
                            self.params = Some(params);
                        }
                        Err(e) => log::error!("cannot create {}: {:#}", self.path, e),
                    }
                } else if self.params.as_ref() != Some(&params) {
                    log::warn!("codec parameters changed mid-file, keeping original header");
                }
            }
            EncodedPacket::Frame(frame) => match self.writer.as_mut() {
                Some(writer) => {
                    if let Err(e) = writer.write(&frame) {
                        log::error!("error writing frame {}: {:#}", frame.id, e);
                    } else {
                        metrics::registry().incr("sink.frames_written");
                    }
                }
                None => log::warn!("dropping frame {} before codec parameters", frame.id),
            },
        }
        if let Some(subscription) = self.subscription.as_ref() {
            subscription.request(1);
        }
    }

    fn on_error(&mut self, error: anyhow::Error) {
        log::error!("recorder pipeline failed: {:#}", error);
        self.finish();
    }

    fn on_complete(&mut self) {
        log::info!("recorder pipeline complete");
        self.finish();
    }
}

impl Drop for ContainerSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.finish();
        }
    }
}

struct ContainerWriter {
    output: ffmpeg_next::format::context::Output,
    have_written_header: bool,
    have_written_trailer: bool,
    start_time: Option<SystemTime>,
    /// Enforce monotonically increasing DTS (muxer requirement).
    last_dts: Option<i64>,
}

impl ContainerWriter {
    fn create(path: &str, params: &CodecParameters) -> anyhow::Result<Self> {
        let mut output = ffmpeg_next::format::output_as(&path, "matroska")
            .map_err(|e| anyhow::anyhow!("output_as({:?}, matroska): {:?}", path, e))?;

        let codec_id = codec_id_for(&params.name)?;
        let stream = output
            .add_stream(ffmpeg_next::encoder::find(codec_id))
            .map_err(|e| anyhow::anyhow!("add_stream({:?}): {:?}", codec_id, e))?;

        unsafe {
            let stream_ptr = stream.as_ptr() as *mut ffmpeg_next::ffi::AVStream;
            (*stream_ptr).time_base = ffmpeg_next::Rational::new(1, 1000).into();
            let par = (*stream_ptr).codecpar;
            (*par).codec_type = ffmpeg_next::ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*par).codec_id = codec_id.into();
            (*par).width = params.width as i32;
            (*par).height = params.height as i32;
            if !params.extra_data.is_empty() {
                let size = params.extra_data.len();
                let buffer = ffmpeg_next::ffi::av_mallocz(
                    size + ffmpeg_next::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize,
                ) as *mut u8;
                std::ptr::copy_nonoverlapping(params.extra_data.as_ptr(), buffer, size);
                (*par).extradata = buffer;
                (*par).extradata_size = size as i32;
            }
        }

        Ok(Self {
            output,
            have_written_header: false,
            have_written_trailer: false,
            start_time: None,
            last_dts: None,
        })
    }

    fn write(&mut self, frame: &EncodedFrame) -> anyhow::Result<()> {
        if !self.have_written_header {
            self.output.write_header()?;
            self.have_written_header = true;
        }

        let start = *self.start_time.get_or_insert(frame.arrival_time);
        let mut timestamp = frame
            .arrival_time
            .duration_since(start)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        if let Some(last) = self.last_dts {
            if timestamp <= last {
                timestamp = last + 1;
            }
        }
        self.last_dts = Some(timestamp);

        let mut packet = ffmpeg_next::Packet::copy(&frame.data);
        packet.set_stream(0);
        packet.set_position(-1);
        packet.set_pts(Some(timestamp));
        packet.set_dts(Some(timestamp));
        if frame.key_frame {
            packet.set_flags(ffmpeg_next::codec::packet::Flags::KEY);
        }
        packet.write(&mut self.output)?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.output.write_trailer()?;
        }
        Ok(())
    }
}

fn codec_id_for(name: &str) -> anyhow::Result<ffmpeg_next::codec::Id> {
    use ffmpeg_next::codec::Id;
    let id = match name {
        "vp8" => Id::VP8,
        "vp9" => Id::VP9,
        "h264" => Id::H264,
        "h265" | "hevc" => Id::HEVC,
        "av1" => Id::AV1,
        other => {
            ffmpeg_next::decoder::find_by_name(other)
                .map(|codec| codec.id())
                .ok_or_else(|| anyhow::anyhow!("unknown codec: {}", other))?
        }
    };
    Ok(id)
}
