// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! In-process JPEG2000 encode of one picture frame (spec §4.2).

use crate::colour::convert_to_xyz;
use crate::error::CoreError;
use crate::hash::content_hash;
use crate::j2k::{CinemaProfileParams, J2kEncoder};
use crate::model::{EncodedFrame, Eye, PreparedFrame, Resolution};

/// Encodes `frame` against `index`, running the colour pipeline (if a
/// conversion is present) followed by the JPEG2000 cinema-profile encoder.
///
/// # Errors
/// * `frame`'s planes fail their own invariant check.
/// * The encoder reports [`CoreError::LocalEncodeFailed`].
pub fn encode_local(
    encoder: &dyn J2kEncoder,
    index: u32,
    frame: &PreparedFrame,
    bandwidth_bits_per_second: u64,
    fps: u32,
) -> Result<EncodedFrame, CoreError> {
    frame.planes().validate()?;

    let xyz = convert_to_xyz(frame.planes(), frame.colour_conversion());

    let params = CinemaProfileParams {
        bandwidth_bits_per_second,
        frames_per_second: fps,
        stereoscopic: frame.eye() != Eye::Mono,
    };

    // At 4K a second progression segment restricting decode to the final
    // resolution level keeps 2K players able to decode a reduced-resolution
    // view; the minimal encoder here emits a single segment regardless, so
    // this is a no-op placeholder for a real OpenJPEG backend to act on.
    let _is_4k = frame.resolution() == Resolution::FourK;

    let data = encoder
        .encode(&xyz, frame.eye(), params)
        .map_err(|e| CoreError::LocalEncodeFailed(e.to_string()))?;

    let hash = content_hash(&data);

    Ok(EncodedFrame::builder()
        .index(index)
        .eye(frame.eye())
        .data(data)
        .hash(hash)
        .build())
}

#[cfg(test)]
mod tests {
    use super::encode_local;
    use crate::j2k::CinemaProfileEncoder;
    use crate::model::{Eye, PixelFormat, PixelPlanes, PreparedFrame, Resolution};

    fn sample_frame(eye: Eye) -> PreparedFrame {
        let planes = PixelPlanes::builder()
            .format(PixelFormat::Rgb24)
            .width(4)
            .height(4)
            .strides(vec![12])
            .planes(vec![vec![64u8; 48]])
            .build();
        PreparedFrame::builder()
            .planes(planes)
            .eye(eye)
            .resolution(Resolution::TwoK)
            .build()
    }

    #[test]
    fn encode_local_produces_hashed_frame() {
        let encoder = CinemaProfileEncoder::new();
        let frame = sample_frame(Eye::Mono);
        let encoded = encode_local(&encoder, 7, &frame, 250_000_000, 24).unwrap();
        assert_eq!(encoded.index(), 7);
        assert_eq!(encoded.eye(), Eye::Mono);
        assert!(!encoded.data().is_empty());
    }

    #[test]
    fn encode_local_is_deterministic() {
        let encoder = CinemaProfileEncoder::new();
        let frame = sample_frame(Eye::Left);
        let a = encode_local(&encoder, 0, &frame, 250_000_000, 24).unwrap();
        let b = encode_local(&encoder, 0, &frame, 250_000_000, 24).unwrap();
        assert_eq!(a.data(), b.data());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn encode_local_rejects_invalid_planes() {
        let encoder = CinemaProfileEncoder::new();
        let bad_planes = PixelPlanes::builder()
            .format(PixelFormat::Rgb24)
            .width(4)
            .height(4)
            .strides(vec![12])
            .planes(vec![vec![0u8; 4]])
            .build();
        let frame = PreparedFrame::builder()
            .planes(bad_planes)
            .eye(Eye::Mono)
            .resolution(Resolution::TwoK)
            .build();
        assert!(encode_local(&encoder, 0, &frame, 250_000_000, 24).is_err());
    }
}
