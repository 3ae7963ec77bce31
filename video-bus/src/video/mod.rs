//! Codec stages: decoding encoded packets into owned image frames and
//! transcoding image frames to VP9.

use bytes::Bytes;

use crate::data::{FrameId, ImageMetadata, OwnedImageFrame, PixelFormat, MAX_IMAGE_PLANES};

pub mod decoder;
pub mod vp9;

pub use decoder::decode;
pub use vp9::encode_vp9;

#[cfg(test)]
#[path = "video_test.rs"]
mod video_test;

pub(crate) struct Scaler {
    context: ffmpeg_next::software::scaling::Context,
}

impl Scaler {
    pub(crate) fn new(context: ffmpeg_next::software::scaling::Context) -> Self {
        Self { context }
    }

    pub(crate) fn run(
        &mut self,
        frame: &ffmpeg_next::frame::Video,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> anyhow::Result<()> {
        self.context.run(frame, dst).map_err(|e| e.into())
    }
}

unsafe impl Send for Scaler {}

pub(crate) fn metadata_of(frame: &ffmpeg_next::frame::Video, pixel_format: PixelFormat) -> ImageMetadata {
    let mut plane_strides = [0u32; MAX_IMAGE_PLANES];
    for plane in 0..frame.planes().min(MAX_IMAGE_PLANES) {
        plane_strides[plane] = frame.stride(plane) as u32;
    }
    ImageMetadata {
        width: frame.width(),
        height: frame.height(),
        pixel_format,
        plane_strides,
    }
}

/// Copies a decoded/converted FFmpeg frame into an owned frame.
pub(crate) fn owned_frame_from_av(frame: &ffmpeg_next::frame::Video, id: FrameId) -> OwnedImageFrame {
    let mut plane_strides = [0u32; MAX_IMAGE_PLANES];
    let mut plane_data: [Bytes; MAX_IMAGE_PLANES] = Default::default();
    for plane in 0..frame.planes().min(MAX_IMAGE_PLANES) {
        plane_strides[plane] = frame.stride(plane) as u32;
        plane_data[plane] = Bytes::copy_from_slice(frame.data(plane));
    }
    OwnedImageFrame {
        id,
        width: frame.width(),
        height: frame.height(),
        plane_strides,
        plane_data,
    }
}

/// Builds an FFmpeg frame from an owned frame, copying plane rows across the
/// differing strides.
pub(crate) fn av_frame_from_owned(
    frame: &OwnedImageFrame,
    pixel_format: PixelFormat,
) -> anyhow::Result<ffmpeg_next::frame::Video> {
    let mut av_frame =
        ffmpeg_next::frame::Video::new(pixel_format.to_av(), frame.width, frame.height);
    for plane in 0..pixel_format.plane_count() {
        let src = &frame.plane_data[plane];
        if src.is_empty() {
            anyhow::bail!("plane {} is empty", plane);
        }
        let src_stride = frame.plane_strides[plane] as usize;
        let dst_stride = av_frame.stride(plane);
        let rows = plane_rows(pixel_format, plane, frame.height as usize);
        let row_bytes = plane_row_bytes(pixel_format, plane, frame.width as usize);
        if src_stride * (rows - 1) + row_bytes > src.len() {
            anyhow::bail!(
                "plane {} too small: {} bytes for {} rows of {}",
                plane,
                src.len(),
                rows,
                row_bytes
            );
        }
        let dst = av_frame.data_mut(plane);
        for row in 0..rows {
            dst[row * dst_stride..row * dst_stride + row_bytes]
                .copy_from_slice(&src[row * src_stride..row * src_stride + row_bytes]);
        }
    }
    Ok(av_frame)
}

fn plane_rows(pixel_format: PixelFormat, plane: usize, height: usize) -> usize {
    match (pixel_format, plane) {
        (PixelFormat::I420, 1) | (PixelFormat::I420, 2) => height.div_ceil(2),
        _ => height,
    }
}

fn plane_row_bytes(pixel_format: PixelFormat, plane: usize, width: usize) -> usize {
    match (pixel_format, plane) {
        (PixelFormat::Rgb0, _) => width * 4,
        (PixelFormat::Bgr, _) => width * 3,
        (PixelFormat::I420, 0) => width,
        (PixelFormat::I420, _) => width.div_ceil(2),
    }
}
