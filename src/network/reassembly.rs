//! Reassembly of pixel frames split across a header and raw frames
//!
//! ```text
//! Idle --Yuv header--> AwaitingYuvPlanes(0) --Y--> (1) --U--> (2) --V--> Idle (deliver)
//! Idle --Rgb header--> AwaitingRgbPayload --payload--> Idle (deliver)
//! ```
//!
//! Partial state is dropped with the reassembler; nothing incomplete is
//! ever delivered. Plane sizes are checked against the announced stride
//! so traffic interleaved between a header and its planes fails loudly
//! instead of being rendered as pixels.

use tracing::trace;

use crate::protocol::{PixelFormat, Rgb, Yuv};

use super::error::NetworkError;

/// Largest decompressed plane accepted (8K RGBA)
const MAX_PLANE_SIZE: usize = 7680 * 4320 * 4;

/// A reassembled YUV 4:2:0 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YuvFrame {
    pub stride: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl YuvFrame {
    pub fn chroma_stride(&self) -> u32 {
        self.stride / 2
    }
}

/// A reassembled RGB frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>,
}

/// A complete pixel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelFrame {
    Yuv(YuvFrame),
    Rgb(RgbFrame),
}

#[derive(Debug, Default)]
enum ReassemblyState {
    #[default]
    Idle,
    AwaitingYuvPlanes {
        format: Yuv,
        planes: Vec<Vec<u8>>,
    },
    AwaitingRgbPayload {
        format: Rgb,
    },
}

/// Collects the raw frames that follow a pixel header
#[derive(Debug, Default)]
pub struct Reassembler {
    state: ReassemblyState,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while raw frames are expected
    pub fn is_active(&self) -> bool {
        !matches!(self.state, ReassemblyState::Idle)
    }

    /// Start collecting the frames announced by a header
    pub fn begin(&mut self, format: PixelFormat) -> Result<(), NetworkError> {
        if self.is_active() {
            return Err(NetworkError::ProtocolViolation(
                "pixel header received while a frame is still incomplete".into(),
            ));
        }
        self.state = match format {
            PixelFormat::Yuv(yuv) => {
                if yuv.stride < 2 {
                    return Err(NetworkError::ProtocolViolation(format!(
                        "invalid YUV stride {}",
                        yuv.stride
                    )));
                }
                ReassemblyState::AwaitingYuvPlanes {
                    format: yuv,
                    planes: Vec::with_capacity(3),
                }
            }
            PixelFormat::Rgb(rgb) => ReassemblyState::AwaitingRgbPayload { format: rgb },
        };
        Ok(())
    }

    /// Feed the next raw frame; returns the frame once it is complete
    pub fn push(&mut self, raw: Vec<u8>) -> Result<Option<PixelFrame>, NetworkError> {
        match std::mem::take(&mut self.state) {
            ReassemblyState::Idle => Err(NetworkError::ProtocolViolation(
                "raw frame without a pixel header".into(),
            )),
            ReassemblyState::AwaitingRgbPayload { format } => {
                let data = unpack(raw, format.compress, "RGB payload")?;
                trace!("Reassembled RGB frame ({} bytes)", data.len());
                Ok(Some(PixelFrame::Rgb(RgbFrame { data })))
            }
            ReassemblyState::AwaitingYuvPlanes { format, mut planes } => {
                let index = planes.len();
                let plane = unpack(raw, format.compress, plane_name(index))?;
                let row = if index == 0 {
                    format.stride
                } else {
                    format.chroma_stride()
                };
                if plane.len() % row as usize != 0 {
                    return Err(NetworkError::ProtocolViolation(format!(
                        "{} of {} bytes is not a multiple of stride {}",
                        plane_name(index),
                        plane.len(),
                        row
                    )));
                }
                planes.push(plane);

                if planes.len() < 3 {
                    self.state = ReassemblyState::AwaitingYuvPlanes { format, planes };
                    return Ok(None);
                }

                let v = planes.pop().unwrap_or_default();
                let u = planes.pop().unwrap_or_default();
                let y = planes.pop().unwrap_or_default();
                if u.len() != v.len() {
                    return Err(NetworkError::ProtocolViolation(format!(
                        "U plane ({} bytes) and V plane ({} bytes) differ",
                        u.len(),
                        v.len()
                    )));
                }
                trace!(
                    "Reassembled YUV frame: stride={}, y={}, u={}, v={}",
                    format.stride,
                    y.len(),
                    u.len(),
                    v.len()
                );
                Ok(Some(PixelFrame::Yuv(YuvFrame {
                    stride: format.stride,
                    y,
                    u,
                    v,
                })))
            }
        }
    }
}

fn plane_name(index: usize) -> &'static str {
    match index {
        0 => "Y plane",
        1 => "U plane",
        _ => "V plane",
    }
}

fn unpack(raw: Vec<u8>, compressed: bool, what: &str) -> Result<Vec<u8>, NetworkError> {
    if !compressed {
        return Ok(raw);
    }
    let claimed = raw
        .get(..4)
        .map(|prefix| u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize)
        .unwrap_or(0);
    if claimed > MAX_PLANE_SIZE {
        return Err(NetworkError::ProtocolViolation(format!(
            "{} claims {} decompressed bytes",
            what, claimed
        )));
    }
    lz4_flex::decompress_size_prepended(&raw).map_err(|e| {
        NetworkError::ProtocolViolation(format!("{} failed to decompress: {}", what, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuv(compress: bool, stride: u32) -> PixelFormat {
        PixelFormat::Yuv(Yuv { compress, stride })
    }

    #[test]
    fn test_yuv_planes_reassemble_in_order() {
        let mut reassembler = Reassembler::new();
        reassembler.begin(yuv(false, 8)).unwrap();
        assert!(reassembler.is_active());

        assert_eq!(reassembler.push(vec![1; 32]).unwrap(), None);
        assert_eq!(reassembler.push(vec![2; 8]).unwrap(), None);
        let frame = reassembler.push(vec![3; 8]).unwrap();

        assert_eq!(
            frame,
            Some(PixelFrame::Yuv(YuvFrame {
                stride: 8,
                y: vec![1; 32],
                u: vec![2; 8],
                v: vec![3; 8],
            }))
        );
        assert!(!reassembler.is_active());
    }

    #[test]
    fn test_compressed_rgb_payload() {
        let mut reassembler = Reassembler::new();
        reassembler
            .begin(PixelFormat::Rgb(Rgb { compress: true }))
            .unwrap();
        let packed = lz4_flex::compress_prepend_size(&[9u8; 400]);

        let frame = reassembler.push(packed).unwrap();
        assert_eq!(
            frame,
            Some(PixelFrame::Rgb(RgbFrame {
                data: vec![9; 400]
            }))
        );
    }

    #[test]
    fn test_partial_frame_is_never_delivered() {
        let mut reassembler = Reassembler::new();
        reassembler.begin(yuv(false, 4)).unwrap();
        assert_eq!(reassembler.push(vec![0; 16]).unwrap(), None);
        assert_eq!(reassembler.push(vec![0; 4]).unwrap(), None);
        assert!(reassembler.is_active());
        drop(reassembler);
    }

    #[test]
    fn test_corrupt_compressed_plane_fails_loudly() {
        let mut reassembler = Reassembler::new();
        reassembler.begin(yuv(true, 4)).unwrap();
        let err = reassembler.push(vec![16, 0, 0, 0, 0xF0]).unwrap_err();
        assert!(matches!(err, NetworkError::ProtocolViolation(_)));
    }

    #[test]
    fn test_oversized_plane_claim_rejected() {
        let mut reassembler = Reassembler::new();
        reassembler
            .begin(PixelFormat::Rgb(Rgb { compress: true }))
            .unwrap();
        assert!(reassembler.push(vec![0xFF, 0xFF, 0xFF, 0x7F, 0]).is_err());
    }

    #[test]
    fn test_misaligned_plane_rejected() {
        let mut reassembler = Reassembler::new();
        reassembler.begin(yuv(false, 8)).unwrap();
        assert!(reassembler.push(vec![0; 13]).is_err());
    }

    #[test]
    fn test_mismatched_chroma_planes_rejected() {
        let mut reassembler = Reassembler::new();
        reassembler.begin(yuv(false, 8)).unwrap();
        reassembler.push(vec![0; 16]).unwrap();
        reassembler.push(vec![0; 4]).unwrap();
        assert!(reassembler.push(vec![0; 8]).is_err());
    }

    #[test]
    fn test_header_during_reassembly_rejected() {
        let mut reassembler = Reassembler::new();
        reassembler.begin(yuv(false, 8)).unwrap();
        assert!(reassembler
            .begin(PixelFormat::Rgb(Rgb { compress: false }))
            .is_err());
    }

    #[test]
    fn test_raw_frame_without_header_rejected() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn test_zero_stride_rejected() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.begin(yuv(false, 0)).is_err());
        assert!(!reassembler.is_active());
    }
}
