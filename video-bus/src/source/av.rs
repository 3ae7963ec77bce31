use std::ffi::CString;
use std::time::SystemTime;

use bytes::Bytes;

use crate::data::{CodecParameters, EncodedFrame, EncodedPacket, FrameId};
use crate::streams::{generators, Publisher};

/// Origin of an encoded video stream read through FFmpeg.
#[derive(Debug, Clone)]
pub enum AvInput {
    File { path: String, loop_file: bool },
    Url { url: String },
    /// Capture device, e.g. format "v4l2" with device "/dev/video0", or
    /// format "lavfi" with a filter graph for a synthetic picture.
    Camera { device: String, format: String },
}

impl AvInput {
    fn location(&self) -> &str {
        match self {
            AvInput::File { path, .. } => path,
            AvInput::Url { url } => url,
            AvInput::Camera { device, .. } => device,
        }
    }
}

/// Lazy encoded-packet source: the input is opened when demand first arrives
/// and packets are read one per request. Emits codec parameters, then frames
/// with synthetic monotonically increasing ids.
pub fn av_source(input: AvInput) -> Publisher<EncodedPacket> {
    generators::stateful(
        move || AvSourceState {
            config: input,
            opened: None,
            sequence: 0,
        },
        |state, sink| loop {
            if state.opened.is_none() {
                match Opened::open(&state.config) {
                    Ok((opened, params)) => {
                        log::info!(
                            "opened {} ({} video stream {})",
                            state.config.location(),
                            params.name,
                            opened.stream_index,
                        );
                        state.opened = Some(opened);
                        sink.next(EncodedPacket::Params(params));
                        return;
                    }
                    Err(e) => {
                        sink.error(e);
                        return;
                    }
                }
            }

            match state.opened.as_mut().unwrap().read_frame(&mut state.sequence) {
                Some(frame) => {
                    sink.next(EncodedPacket::Frame(frame));
                    return;
                }
                None => {
                    if let AvInput::File {
                        loop_file: true, ..
                    } = state.config
                    {
                        log::debug!("end of {}, looping", state.config.location());
                        state.opened = None;
                        continue;
                    }
                    log::info!("end of {}", state.config.location());
                    sink.complete();
                    return;
                }
            }
        },
    )
}

struct AvSourceState {
    config: AvInput,
    opened: Option<Opened>,
    sequence: i64,
}

struct Opened {
    input: ffmpeg_next::format::context::Input,
    stream_index: usize,
}

impl Opened {
    fn open(config: &AvInput) -> anyhow::Result<(Self, CodecParameters)> {
        let input = match config {
            AvInput::File { path, .. } => ffmpeg_next::format::input(path)
                .map_err(|e| anyhow::anyhow!("input({:?}): {}", path, e))?,
            AvInput::Url { url } => ffmpeg_next::format::input(url)
                .map_err(|e| anyhow::anyhow!("input({:?}): {}", url, e))?,
            AvInput::Camera { device, format } => open_device(device, format)?,
        };

        let stream = input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("no video stream in {}", config.location()))?;
        let stream_index = stream.index();
        let parameters = stream.parameters();
        let (width, height) = video_size(&parameters);
        let params = CodecParameters {
            name: format!("{:?}", parameters.id()).to_lowercase(),
            extra_data: extradata(&parameters),
            width,
            height,
        };

        Ok((
            Self {
                input,
                stream_index,
            },
            params,
        ))
    }

    fn read_frame(&mut self, sequence: &mut i64) -> Option<EncodedFrame> {
        loop {
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    let data = packet
                        .data()
                        .map(Bytes::copy_from_slice)
                        .unwrap_or_default();
                    let id = FrameId::new(*sequence, *sequence + 1);
                    *sequence += 1;
                    return Some(EncodedFrame {
                        id,
                        data,
                        key_frame: packet.is_key(),
                        arrival_time: SystemTime::now(),
                    });
                }
                None => return None,
            }
        }
    }
}

/// Opens a capture device with an explicit input format (not exposed by
/// ffmpeg-next for inputs).
fn open_device(device: &str, format: &str) -> anyhow::Result<ffmpeg_next::format::context::Input> {
    unsafe {
        let format_name = CString::new(format)?;
        let input_format = ffmpeg_next::ffi::av_find_input_format(format_name.as_ptr());
        if input_format.is_null() {
            return Err(anyhow::anyhow!("input format not found: {}", format));
        }

        let device_name = CString::new(device)?;
        let mut ctx = std::ptr::null_mut();
        match ffmpeg_next::ffi::avformat_open_input(
            &mut ctx,
            device_name.as_ptr(),
            input_format,
            std::ptr::null_mut(),
        ) {
            0 => {}
            e => {
                return Err(anyhow::anyhow!(
                    "avformat_open_input({:?}, {:?}): {}",
                    device,
                    format,
                    e
                ))
            }
        }

        let ret = ffmpeg_next::ffi::avformat_find_stream_info(ctx, std::ptr::null_mut());
        if ret < 0 {
            ffmpeg_next::ffi::avformat_close_input(&mut ctx);
            return Err(anyhow::anyhow!(
                "avformat_find_stream_info({:?}): {}",
                device,
                ret
            ));
        }

        Ok(ffmpeg_next::format::context::Input::wrap(ctx))
    }
}

/// Reads video width/height from codec parameters (not exposed by
/// ffmpeg-next).
fn video_size(params: &ffmpeg_next::codec::Parameters) -> (u32, u32) {
    unsafe {
        let ptr = params.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
        let width = (*ptr).width;
        let height = (*ptr).height;
        (width.max(0) as u32, height.max(0) as u32)
    }
}

/// Reads codec extradata (e.g. SPS/PPS) from codec parameters.
fn extradata(params: &ffmpeg_next::codec::Parameters) -> Bytes {
    unsafe {
        let ptr = params.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
        let data = (*ptr).extradata;
        let size = (*ptr).extradata_size;
        if data.is_null() || size <= 0 {
            return Bytes::new();
        }
        Bytes::copy_from_slice(std::slice::from_raw_parts(data, size as usize))
    }
}
