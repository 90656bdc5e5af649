//! Producer side of the pixel payload framing convention
//!
//! A `Yuv` header message is followed by exactly three raw frames (Y, U, V)
//! and an `Rgb` header by exactly one. Raw frames carry no schema framing
//! and are never encrypted; when `compress` is set each one is LZ4
//! compressed independently with its decompressed size prepended.

use super::codec::encode;
use super::message::{Message, Rgb, VideoFrame, Yuv};

/// A header message plus the raw frames that must follow it, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPixels {
    pub header: Message,
    pub raw_frames: Vec<Vec<u8>>,
}

impl FramedPixels {
    /// Header encoding followed by the raw frames, as they go on the wire
    /// of an unencrypted channel
    pub fn to_wire(&self) -> Result<Vec<Vec<u8>>, bincode::Error> {
        let mut frames = Vec::with_capacity(1 + self.raw_frames.len());
        frames.push(encode(&self.header)?);
        frames.extend(self.raw_frames.iter().cloned());
        Ok(frames)
    }
}

fn pack(plane: &[u8], compress: bool) -> Vec<u8> {
    if compress {
        lz4_flex::compress_prepend_size(plane)
    } else {
        plane.to_vec()
    }
}

/// Frame three planes behind a `Yuv` header
pub fn encode_yuv_frame(stride: u32, compress: bool, y: &[u8], u: &[u8], v: &[u8]) -> FramedPixels {
    FramedPixels {
        header: Message::VideoFrame(VideoFrame::Yuv(Yuv { compress, stride })),
        raw_frames: vec![pack(y, compress), pack(u, compress), pack(v, compress)],
    }
}

/// Frame one RGB payload behind an `Rgb` header
pub fn encode_rgb_frame(compress: bool, data: &[u8]) -> FramedPixels {
    FramedPixels {
        header: Message::VideoFrame(VideoFrame::Rgb(Rgb { compress })),
        raw_frames: vec![pack(data, compress)],
    }
}
