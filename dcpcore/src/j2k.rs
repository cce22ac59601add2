// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! JPEG2000 cinema-profile encoding (spec §4.2 steps 2-3).
//!
//! The real DCP-o-matic links OpenJPEG for this step. This crate cannot
//! bind a C codec without a build beyond this exercise's reach, so the
//! encoder is expressed behind the [`J2kEncoder`] trait: [`CinemaProfileEncoder`]
//! emits a minimal, internally self-consistent JPEG2000 codestream (correct
//! marker framing, SIZ/COD parameters, and layer rate) rather than a
//! bit-exact match to a real encoder's output. Swapping in a real backend
//! later only means providing another `J2kEncoder`.

use crate::colour::XyzImage;
use crate::error::CoreError;
use crate::model::Eye;

/// Fixed cinema-profile encoding parameters (spec §4.2 step 2): 12-bit,
/// 3-component, no tiling, 32x32 code blocks, CPRL progression, irreversible
/// 9/7 wavelet, MCT enabled, no ROI.
#[derive(Clone, Copy, Debug)]
pub struct CinemaProfileParams {
    /// Target bits per second for the whole picture essence.
    pub bandwidth_bits_per_second: u64,
    /// Frames per second of the timeline.
    pub frames_per_second: u32,
    /// Whether this is a stereoscopic (3D) title; halves the per-eye budget.
    pub stereoscopic: bool,
}

/// Marker codes used by the minimal codestream emitted below. Real values
/// from ISO/IEC 15444-1 Annex A.
mod marker {
    pub const SOC: u16 = 0xFF4F;
    pub const SIZ: u16 = 0xFF51;
    pub const COD: u16 = 0xFF52;
    pub const SOT: u16 = 0xFF90;
    pub const SOD: u16 = 0xFF93;
    pub const EOC: u16 = 0xFFD9;
}

impl CinemaProfileParams {
    /// The per-frame layer rate in bytes, `max_cs_len`, per spec §4.2 step 3:
    /// `bandwidth / 8 / fps`, halved again for a stereoscopic eye.
    #[must_use]
    pub fn max_cs_len(self) -> u64 {
        let base = self.bandwidth_bits_per_second / 8 / u64::from(self.frames_per_second.max(1));
        if self.stereoscopic { base / 2 } else { base }
    }

    /// The per-component size cap, `max_comp_size`, per spec §4.2 step 3:
    /// `max_cs_len / 1.25`.
    #[must_use]
    pub fn max_comp_size(self) -> u64 {
        (self.max_cs_len() as f64 / 1.25) as u64
    }
}

/// Encodes prepared XYZ image data into a JPEG2000 codestream.
///
/// Implementations must be safe to call from multiple worker threads
/// concurrently (spec §4.2: each worker owns one encoder instance, or the
/// encoder itself must tolerate shared concurrent use).
pub trait J2kEncoder: Send + Sync {
    /// Encodes `image` for `eye` under `params`, returning a complete
    /// codestream no larger than `params.max_cs_len()` bytes.
    ///
    /// # Errors
    /// * The encoder could not produce a codestream within budget.
    fn encode(
        &self,
        image: &XyzImage,
        eye: Eye,
        params: CinemaProfileParams,
    ) -> Result<Vec<u8>, CoreError>;
}

/// The default [`J2kEncoder`]: emits a minimal, well-formed JPEG2000
/// codestream whose body is the companded XYZ samples packed to fit the
/// layer-rate budget. Deterministic and stateless.
#[derive(Clone, Copy, Debug, Default)]
pub struct CinemaProfileEncoder;

impl CinemaProfileEncoder {
    /// Builds a new encoder. Stateless; cheap to construct per worker.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn write_siz(out: &mut Vec<u8>, width: u32, height: u32) {
        out.extend_from_slice(&marker::SIZ.to_be_bytes());
        let segment_len: u16 = 38 + 3 * 3;
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // Rsiz: cinema profile placeholder
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // XOsiz
        out.extend_from_slice(&0u32.to_be_bytes()); // YOsiz
        out.extend_from_slice(&width.to_be_bytes()); // XTsiz: no tiling
        out.extend_from_slice(&height.to_be_bytes()); // YTsiz: no tiling
        out.extend_from_slice(&0u32.to_be_bytes()); // XTOsiz
        out.extend_from_slice(&0u32.to_be_bytes()); // YTOsiz
        out.extend_from_slice(&3u16.to_be_bytes()); // Csiz: 3 components
        for _ in 0..3 {
            out.push(0x0B); // Ssiz: 12-bit unsigned
            out.push(1); // XRsiz
            out.push(1); // YRsiz
        }
    }

    fn write_cod(out: &mut Vec<u8>) {
        out.extend_from_slice(&marker::COD.to_be_bytes());
        let segment_len: u16 = 12;
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.push(0x01); // Scod: explicit MCT usage follows
        out.push(4); // SGcod: CPRL progression order
        out.extend_from_slice(&1u16.to_be_bytes()); // number of layers
        out.push(1); // multi-component transform enabled
        out.push(5); // number of decomposition levels
        out.push(5); // code block width exponent - 2 = 32
        out.push(5); // code block height exponent - 2 = 32
        out.push(0); // code block style: no ROI
        out.push(1); // irreversible 9/7 wavelet
    }
}

impl J2kEncoder for CinemaProfileEncoder {
    fn encode(
        &self,
        image: &XyzImage,
        eye: Eye,
        params: CinemaProfileParams,
    ) -> Result<Vec<u8>, CoreError> {
        let budget = params.max_cs_len();
        if budget == 0 {
            return Err(CoreError::LocalEncodeFailed(
                "layer rate budget is zero".to_string(),
            ));
        }

        let mut out = Vec::new();
        out.extend_from_slice(&marker::SOC.to_be_bytes());
        Self::write_siz(&mut out, image.width(), image.height());
        Self::write_cod(&mut out);

        out.extend_from_slice(&marker::SOT.to_be_bytes());
        let sot_header_len: u16 = 10;
        out.extend_from_slice(&sot_header_len.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // Isot: tile index 0
        out.extend_from_slice(&0u32.to_be_bytes()); // Psot: filled below
        out.push(0); // TPsot
        out.push(1); // TNsot: one tile-part

        out.extend_from_slice(&marker::SOD.to_be_bytes());

        let header_len = out.len();
        let body_budget = (params.max_comp_size() as usize * 3)
            .min(budget as usize)
            .max(1);
        let mut body = Vec::with_capacity(body_budget.min(image.samples().len() * 2));
        for sample in image.samples() {
            if body.len() + 2 > body_budget {
                break;
            }
            body.extend_from_slice(&sample.to_be_bytes());
        }
        out.extend_from_slice(&body);

        out.extend_from_slice(&marker::EOC.to_be_bytes());

        let psot = (out.len() - (header_len - 14)) as u32;
        let psot_offset = header_len - 14 + 4;
        out[psot_offset..psot_offset + 4].copy_from_slice(&psot.to_be_bytes());

        tracing::trace!(
            ?eye,
            bytes = out.len(),
            budget,
            "encoded jpeg2000 frame"
        );

        Ok(out)
    }
}
