// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The data model shared by every component of the pipeline (spec §3).

use bon::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Pixel format tag of a [`PixelPlanes`] buffer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum PixelFormat {
    /// 8-bit interleaved RGB, one plane.
    Rgb24,
    /// 16-bit little-endian interleaved RGB, one plane.
    Rgb48Le,
    /// Planar YUV 4:2:0, three planes.
    Yuv420P,
    /// Planar YUV 4:2:2, three planes.
    Yuv422P,
    /// Planar YUV 4:4:4, three planes.
    Yuv444P,
}

impl PixelFormat {
    /// Number of planes this format requires.
    #[must_use]
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Rgb48Le => 1,
            PixelFormat::Yuv420P | PixelFormat::Yuv422P | PixelFormat::Yuv444P => 3,
        }
    }

    /// Bytes per pixel of plane `plane_index` (luma plane for YUV formats).
    #[must_use]
    pub fn bytes_per_pixel(self, plane_index: usize) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgb48Le => 6,
            PixelFormat::Yuv420P | PixelFormat::Yuv422P | PixelFormat::Yuv444P => {
                if plane_index == 0 { 1 } else { 1 }
            }
        }
    }

    /// The numeric wire-protocol code for this format, used in the `encode`
    /// metadata message (spec §4.3).
    #[must_use]
    pub fn wire_code(self) -> u8 {
        match self {
            PixelFormat::Rgb24 => 0,
            PixelFormat::Rgb48Le => 1,
            PixelFormat::Yuv420P => 2,
            PixelFormat::Yuv422P => 3,
            PixelFormat::Yuv444P => 4,
        }
    }

    /// Parses a wire-protocol pixel format code.
    ///
    /// # Errors
    /// * `code` is not one of the five known formats.
    pub fn from_wire_code(code: u8) -> Result<Self, CoreError> {
        match code {
            0 => Ok(PixelFormat::Rgb24),
            1 => Ok(PixelFormat::Rgb48Le),
            2 => Ok(PixelFormat::Yuv420P),
            3 => Ok(PixelFormat::Yuv422P),
            4 => Ok(PixelFormat::Yuv444P),
            other => Err(CoreError::Protocol(format!(
                "unknown pixel format code {other}"
            ))),
        }
    }
}

/// Which eye a picture frame represents, for stereoscopic (3D) content.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Eye {
    /// Non-stereoscopic content.
    Mono,
    /// Left eye of a stereoscopic pair.
    Left,
    /// Right eye of a stereoscopic pair.
    Right,
}

impl Eye {
    /// The wire-protocol token for this eye (spec §4.3).
    #[must_use]
    pub fn wire_token(self) -> &'static str {
        match self {
            Eye::Mono => "mono",
            Eye::Left => "left",
            Eye::Right => "right",
        }
    }

    /// Parses a wire-protocol eye token.
    ///
    /// # Errors
    /// * `token` is not one of `mono`, `left`, `right`.
    pub fn from_wire_token(token: &str) -> Result<Self, CoreError> {
        match token {
            "mono" => Ok(Eye::Mono),
            "left" => Ok(Eye::Left),
            "right" => Ok(Eye::Right),
            other => Err(CoreError::Protocol(format!("unknown eye token {other}"))),
        }
    }
}

/// Output resolution tag for the JPEG2000 encode (spec §3, §4.2).
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Resolution {
    /// 2048-wide cinema resolution.
    TwoK,
    /// 4096-wide cinema resolution.
    FourK,
}

impl Resolution {
    /// The wire-protocol token for this resolution.
    #[must_use]
    pub fn wire_token(self) -> &'static str {
        match self {
            Resolution::TwoK => "2k",
            Resolution::FourK => "4k",
        }
    }

    /// Parses a wire-protocol resolution token.
    ///
    /// # Errors
    /// * `token` is not one of `2k`, `4k`.
    pub fn from_wire_token(token: &str) -> Result<Self, CoreError> {
        match token {
            "2k" => Ok(Resolution::TwoK),
            "4k" => Ok(Resolution::FourK),
            other => Err(CoreError::Protocol(format!(
                "unknown resolution token {other}"
            ))),
        }
    }
}

/// An immutable multi-plane image (spec §3).
#[derive(Builder, Clone, Debug, Getters)]
pub struct PixelPlanes {
    #[getset(get = "pub")]
    format: PixelFormat,
    width: u32,
    height: u32,
    /// Per-plane row stride, in bytes.
    strides: Vec<usize>,
    /// Per-plane raw buffer.
    planes: Vec<Vec<u8>>,
}

impl PixelPlanes {
    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes of plane `index`.
    #[must_use]
    pub fn stride(&self, index: usize) -> usize {
        self.strides[index]
    }

    /// Raw bytes of plane `index`.
    #[must_use]
    pub fn plane(&self, index: usize) -> &[u8] {
        &self.planes[index]
    }

    /// Number of planes.
    #[must_use]
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Checks the invariants from spec §3: plane count matches format;
    /// stride is at least one pixel wide; buffer length matches
    /// `stride * height`.
    ///
    /// # Errors
    /// * Any invariant above is violated.
    pub fn validate(&self) -> Result<(), CoreError> {
        let expected_planes = self.format.plane_count();
        if self.planes.len() != expected_planes || self.strides.len() != expected_planes {
            return Err(CoreError::InvalidPixelPlanes(format!(
                "format {:?} requires {} planes, got {} planes / {} strides",
                self.format,
                expected_planes,
                self.planes.len(),
                self.strides.len()
            )));
        }
        for index in 0..expected_planes {
            let min_stride = self.width as usize * self.format.bytes_per_pixel(index);
            if self.strides[index] < min_stride {
                return Err(CoreError::InvalidPixelPlanes(format!(
                    "plane {index} stride {} is less than minimum {min_stride}",
                    self.strides[index]
                )));
            }
            let expected_len = self.strides[index] * self.height as usize;
            if self.planes[index].len() != expected_len {
                return Err(CoreError::InvalidPixelPlanes(format!(
                    "plane {index} has {} bytes, expected {expected_len}",
                    self.planes[index].len()
                )));
            }
        }
        Ok(())
    }
}

/// A two-segment gamma curve: linear below `threshold`, a pure power curve
/// above it. Used for both the input decoding gamma and the inverse output
/// gamma (spec §4.2 step 1).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct GammaCurve {
    /// The power exponent applied above `threshold`.
    pub power: f64,
    /// The slope of the linear segment below `threshold`.
    pub linear_slope: f64,
    /// The input value below which the linear segment applies.
    pub threshold: f64,
}

impl GammaCurve {
    /// A simple pure-power curve with no linear segment (threshold at 0).
    #[must_use]
    pub fn pure_power(power: f64) -> Self {
        Self {
            power,
            linear_slope: 1.0,
            threshold: 0.0,
        }
    }

    /// Applies the curve to a normalized sample in `[0, 1]`.
    #[must_use]
    pub fn apply(self, value: f64) -> f64 {
        if value < self.threshold {
            value * self.linear_slope
        } else {
            value.powf(self.power)
        }
    }
}

/// Describes the colour conversion to apply before JPEG2000 encoding
/// (spec §3, §4.2 step 1).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ColourConversion {
    /// Gamma curve applied to decode the input RGB samples to linear light.
    pub input_gamma: GammaCurve,
    /// Whether the input is already linear (skips `input_gamma`).
    pub linearized: bool,
    /// Row-major 3x3 RGB-to-XYZ matrix.
    pub rgb_to_xyz: [[f64; 3]; 3],
    /// Gamma curve whose inverse is applied to the companded XYZ samples.
    pub output_gamma: GammaCurve,
}

/// What the Encode Coordinator consumes: one picture frame ready for a
/// worker (spec §3).
#[derive(Builder, Clone, Debug, Getters)]
pub struct PreparedFrame {
    #[getset(get = "pub")]
    planes: PixelPlanes,
    #[getset(get = "pub")]
    eye: Eye,
    /// `None` means the planes already hold XYZ samples.
    colour_conversion: Option<ColourConversion>,
    #[getset(get = "pub")]
    resolution: Resolution,
}

impl PreparedFrame {
    /// The colour conversion to apply, if any.
    #[must_use]
    pub fn colour_conversion(&self) -> Option<&ColourConversion> {
        self.colour_conversion.as_ref()
    }
}

/// One JPEG2000-encoded picture frame, produced by any worker and consumed
/// by the Writer (spec §3).
#[derive(Builder, Clone, Debug, Getters)]
pub struct EncodedFrame {
    #[getset(get_copy = "pub")]
    index: u32,
    #[getset(get_copy = "pub")]
    eye: Eye,
    #[getset(get = "pub")]
    data: Vec<u8>,
    /// 128-bit content hash, see [`crate::hash::content_hash`].
    #[getset(get_copy = "pub")]
    hash: [u8; 16],
}

/// Fixed 48-byte record written alongside the essence: offset, size, and a
/// 32-ASCII-byte hex hash (spec §3, §6).
#[derive(Clone, Copy, CopyGetters, Debug, Eq, PartialEq)]
pub struct FrameInfo {
    #[getset(get_copy = "pub")]
    offset: u64,
    #[getset(get_copy = "pub")]
    size: u64,
    hash: [u8; 16],
}

/// Byte length of one encoded [`FrameInfo`] record.
pub const FRAME_INFO_RECORD_LEN: usize = 48;

impl FrameInfo {
    /// Builds a new record.
    #[must_use]
    pub fn new(offset: u64, size: u64, hash: [u8; 16]) -> Self {
        Self { offset, size, hash }
    }

    /// The content hash this record was written with.
    #[must_use]
    pub fn hash(&self) -> [u8; 16] {
        self.hash
    }

    /// Encodes this record as the 48-byte on-disk form:
    /// `offset:u64-LE | size:u64-LE | hash:[u8; 32] (ASCII hex)`.
    #[must_use]
    pub fn to_bytes(self) -> [u8; FRAME_INFO_RECORD_LEN] {
        let mut out = [0u8; FRAME_INFO_RECORD_LEN];
        out[0..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        let hex = hex::encode(self.hash);
        out[16..48].copy_from_slice(hex.as_bytes());
        out
    }

    /// Parses a 48-byte on-disk record.
    ///
    /// # Errors
    /// * `bytes` is not exactly 48 bytes long.
    /// * The hash field is not valid ASCII hex.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() != FRAME_INFO_RECORD_LEN {
            return Err(CoreError::InvalidFrameInfo(format!(
                "expected {FRAME_INFO_RECORD_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let offset = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let size = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let hash_hex = std::str::from_utf8(&bytes[16..48])
            .map_err(|e| CoreError::InvalidFrameInfo(format!("hash is not ASCII: {e}")))?;
        let hash_vec = hex::decode(hash_hex)
            .map_err(|e| CoreError::InvalidFrameInfo(format!("hash is not hex: {e}")))?;
        let hash: [u8; 16] = hash_vec
            .try_into()
            .map_err(|_| CoreError::InvalidFrameInfo("hash is not 16 bytes".to_string()))?;
        Ok(Self { offset, size, hash })
    }

    /// The byte position of record `(index, eye)` in the frame-info file,
    /// per spec §6: `48*index` for MONO, `96*index + (RIGHT ? 48 : 0)` for 3D.
    #[must_use]
    pub fn record_position(index: u32, eye: Eye) -> u64 {
        match eye {
            Eye::Mono => u64::from(index) * FRAME_INFO_RECORD_LEN as u64,
            Eye::Left => u64::from(index) * 2 * FRAME_INFO_RECORD_LEN as u64,
            Eye::Right => {
                u64::from(index) * 2 * FRAME_INFO_RECORD_LEN as u64
                    + FRAME_INFO_RECORD_LEN as u64
            }
        }
    }
}

/// One entry in the coordinator's work queue (spec §3).
#[derive(Clone, Debug)]
pub enum EncodeQueueEntry {
    /// A picture frame that needs encoding.
    Full {
        /// DCP frame index.
        index: u32,
        /// Which eye.
        eye: Eye,
        /// The frame to encode.
        frame: Box<PreparedFrame>,
    },
    /// Bytes already exist in a prior run's essence; copy them across.
    Fake {
        /// DCP frame index.
        index: u32,
        /// Which eye.
        eye: Eye,
    },
    /// Reuse the last fully-written frame's essence bytes.
    Repeat {
        /// DCP frame index.
        index: u32,
        /// Which eye.
        eye: Eye,
    },
}

impl EncodeQueueEntry {
    /// The `(index, eye)` key common to every variant.
    #[must_use]
    pub fn key(&self) -> (u32, Eye) {
        match self {
            EncodeQueueEntry::Full { index, eye, .. }
            | EncodeQueueEntry::Fake { index, eye }
            | EncodeQueueEntry::Repeat { index, eye } => (*index, *eye),
        }
    }
}

/// Describes a remote encoding server discovered or configured (spec §3).
#[derive(Builder, Clone, CopyGetters, Debug, Eq, Getters, Hash, PartialEq)]
pub struct ServerDescription {
    #[getset(get = "pub")]
    host: String,
    #[getset(get_copy = "pub")]
    port: u16,
    #[getset(get_copy = "pub")]
    thread_count: u32,
}

/// A block of already-resampled, interleaved PCM audio samples submitted to
/// the coordinator in presentation order (spec §4.6, §4.7).
#[derive(Builder, Clone, Debug, Getters)]
pub struct PcmBlock {
    #[getset(get_copy = "pub")]
    channels: u16,
    #[getset(get_copy = "pub")]
    sample_rate: u32,
    /// Interleaved 16-bit little-endian samples.
    #[getset(get = "pub")]
    samples: Vec<u8>,
}

impl PcmBlock {
    /// Number of audio frames (samples per channel) in this block.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        let bytes_per_frame = usize::from(self.channels) * 2;
        if bytes_per_frame == 0 {
            0
        } else {
            self.samples.len() / bytes_per_frame
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Eye, FRAME_INFO_RECORD_LEN, FrameInfo, PixelFormat, PixelPlanes};

    #[test]
    fn pixel_format_round_trips_wire_code() {
        for format in [
            PixelFormat::Rgb24,
            PixelFormat::Rgb48Le,
            PixelFormat::Yuv420P,
            PixelFormat::Yuv422P,
            PixelFormat::Yuv444P,
        ] {
            let code = format.wire_code();
            assert_eq!(PixelFormat::from_wire_code(code).unwrap().wire_code(), code);
        }
    }

    #[test]
    fn pixel_planes_validate_accepts_correct_shape() {
        let planes = PixelPlanes::builder()
            .format(PixelFormat::Rgb24)
            .width(4)
            .height(2)
            .strides(vec![12])
            .planes(vec![vec![0u8; 24]])
            .build();
        assert!(planes.validate().is_ok());
    }

    #[test]
    fn pixel_planes_validate_rejects_short_buffer() {
        let planes = PixelPlanes::builder()
            .format(PixelFormat::Rgb24)
            .width(4)
            .height(2)
            .strides(vec![12])
            .planes(vec![vec![0u8; 10]])
            .build();
        assert!(planes.validate().is_err());
    }

    #[test]
    fn pixel_planes_validate_rejects_wrong_plane_count() {
        let planes = PixelPlanes::builder()
            .format(PixelFormat::Yuv420P)
            .width(4)
            .height(2)
            .strides(vec![4])
            .planes(vec![vec![0u8; 8]])
            .build();
        assert!(planes.validate().is_err());
    }

    #[test]
    fn frame_info_round_trips_bytes() {
        let info = FrameInfo::new(128, 4096, [7u8; 16]);
        let bytes = info.to_bytes();
        assert_eq!(bytes.len(), FRAME_INFO_RECORD_LEN);
        let parsed = FrameInfo::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn frame_info_record_position_matches_spec() {
        assert_eq!(FrameInfo::record_position(5, Eye::Mono), 240);
        assert_eq!(FrameInfo::record_position(5, Eye::Left), 480);
        assert_eq!(FrameInfo::record_position(5, Eye::Right), 528);
    }

    #[test]
    fn pcm_block_frame_count_divides_by_channels_and_sample_width() {
        let block = super::PcmBlock::builder()
            .channels(2)
            .sample_rate(48_000)
            .samples(vec![0u8; 16])
            .build();
        assert_eq!(block.frame_count(), 4);
    }
}
