use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const MAX_IMAGE_PLANES: usize = 4;

/// Half-open interval of packet sequence numbers that compose one frame.
/// `(0, 0)` means unassigned, `i1 < 0` means synthetic (no frame context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameId {
    pub i1: i64,
    pub i2: i64,
}

impl FrameId {
    pub fn new(i1: i64, i2: i64) -> Self {
        Self { i1, i2 }
    }

    pub fn is_zero(&self) -> bool {
        self.i1 == 0 && self.i2 == 0
    }
}

impl Display for FrameId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "({}, {})", self.i1, self.i2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Rgb0,
    Bgr,
    I420,
}

impl PixelFormat {
    pub fn to_av(self) -> ffmpeg_next::format::Pixel {
        match self {
            PixelFormat::Rgb0 => ffmpeg_next::format::Pixel::RGBZ,
            PixelFormat::Bgr => ffmpeg_next::format::Pixel::BGR24,
            PixelFormat::I420 => ffmpeg_next::format::Pixel::YUV420P,
        }
    }

    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Rgb0 | PixelFormat::Bgr => 1,
            PixelFormat::I420 => 3,
        }
    }
}

/// Geometry and layout of decoded frames. Latched once per live pipeline by
/// the first frame; a geometry change afterwards is a contract violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub plane_strides: [u32; MAX_IMAGE_PLANES],
}

impl ImageMetadata {
    pub fn is_set(&self) -> bool {
        self.width != 0 || self.height != 0
    }
}

/// A decoded frame owning its plane buffers. Any plane may be empty.
#[derive(Debug, Clone, Default)]
pub struct OwnedImageFrame {
    pub id: FrameId,
    pub width: u32,
    pub height: u32,
    pub plane_strides: [u32; MAX_IMAGE_PLANES],
    pub plane_data: [Bytes; MAX_IMAGE_PLANES],
}

impl Display for OwnedImageFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "OwnedImageFrame id: {}, {}x{}, planes: {}",
            self.id,
            self.width,
            self.height,
            self.plane_data.iter().filter(|p| !p.is_empty()).count()
        )
    }
}

/// Decoder-init payload announcing the codec and its extradata. Geometry is
/// carried for container headers; zero when the origin does not know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParameters {
    pub name: String,
    pub extra_data: Bytes,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub id: FrameId,
    pub data: Bytes,
    pub key_frame: bool,
    pub arrival_time: SystemTime,
}

/// Element of an encoded video stream.
#[derive(Debug, Clone)]
pub enum EncodedPacket {
    Params(CodecParameters),
    Frame(EncodedFrame),
}

/// Element of a decoded video stream. Non-frame packets pass through the bot
/// verbatim.
#[derive(Debug, Clone)]
pub enum ImagePacket {
    Metadata(ImageMetadata),
    Frame(OwnedImageFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Analysis,
    Debug,
    Control,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Analysis => "analysis",
            MessageKind::Debug => "debug",
            MessageKind::Control => "control",
        }
    }
}

/// Outbound message queued by bot logic; `data` must be a JSON object.
#[derive(Debug, Clone)]
pub struct BotMessage {
    pub kind: MessageKind,
    pub data: serde_json::Value,
    pub id: FrameId,
}

/// Unit of work delivered to the bot instance.
pub enum BotInput {
    /// Batch of image packets that arrived contiguously.
    Frames(std::collections::VecDeque<ImagePacket>),
    /// Control message addressed to a bot.
    Control(serde_json::Value),
}

/// Element emitted downstream of the bot instance.
#[derive(Debug, Clone)]
pub enum BotOutput {
    Packet(ImagePacket),
    Message(BotMessage),
}

/// One chunk of an encoded frame as carried on the frames channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFrame {
    pub i: [i64; 2],
    #[serde(default = "default_chunk")]
    pub chunk: u32,
    #[serde(default = "default_chunk")]
    pub chunks: u32,
    pub d: String,
    #[serde(default)]
    pub key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<f64>,
}

fn default_chunk() -> u32 {
    1
}

/// Stream metadata as carried on the metadata channel. A change in any field
/// is a codec-parameter change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetadata {
    pub codec: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_data_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<serde_json::Value>,
}
