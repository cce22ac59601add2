// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Application-level messages carried over the [`crate::socket::Socket`]
//! framing (spec §4.3, §4.4, §6).

use crate::error::CoreError;
use crate::model::{ColourConversion, Eye, PixelFormat, Resolution};

/// The literal UDP broadcast payload (spec §4.4, §6).
pub const DISCOVERY_HELLO: &str = "DCP-o-matic hello";

/// The metadata message a client sends before streaming raw planes (spec
/// §4.3): `encode <version> <width> <height> <pixel-format-code>
/// <out-width> <out-height> <eye> <index> <fps> <colour-conv-json>
/// <j2k-bandwidth> <resolution>`.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodeRequest {
    /// Protocol version, exchanged first; mismatch is fatal for this server.
    pub version: u32,
    /// Source image width in pixels.
    pub width: u32,
    /// Source image height in pixels.
    pub height: u32,
    /// Source pixel format.
    pub pixel_format: PixelFormat,
    /// Output width in pixels.
    pub out_width: u32,
    /// Output height in pixels.
    pub out_height: u32,
    /// Which eye this frame represents.
    pub eye: Eye,
    /// DCP frame index.
    pub index: u32,
    /// Frames per second of the timeline.
    pub fps: u32,
    /// Serialized colour-conversion descriptor, or `null` if absent.
    pub colour_conversion_json: String,
    /// Target bits per second for the picture essence.
    pub j2k_bandwidth: u64,
    /// Output resolution tag.
    pub resolution: Resolution,
}

impl EncodeRequest {
    /// Renders the space-separated ASCII metadata line (without the NUL
    /// terminator; callers add it via
    /// [`crate::socket::nul_terminate`]).
    #[must_use]
    pub fn to_metadata_line(&self) -> String {
        format!(
            "encode {} {} {} {} {} {} {} {} {} {} {} {}",
            self.version,
            self.width,
            self.height,
            self.pixel_format.wire_code(),
            self.out_width,
            self.out_height,
            self.eye.wire_token(),
            self.index,
            self.fps,
            self.colour_conversion_json,
            self.j2k_bandwidth,
            self.resolution.wire_token(),
        )
    }

    /// Parses a space-separated ASCII metadata line back into an
    /// `EncodeRequest`.
    ///
    /// # Errors
    /// * The line does not have exactly 12 whitespace-separated tokens.
    /// * The leading token is not `encode`.
    /// * Any numeric or enum token fails to parse.
    pub fn from_metadata_line(line: &str) -> Result<Self, CoreError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 13 {
            return Err(CoreError::Protocol(format!(
                "expected 13 tokens in encode metadata, got {}",
                tokens.len()
            )));
        }
        if tokens[0] != "encode" {
            return Err(CoreError::Protocol(format!(
                "expected 'encode' as first token, got {}",
                tokens[0]
            )));
        }
        let parse_u32 = |field: &str, tok: &str| -> Result<u32, CoreError> {
            tok.parse()
                .map_err(|_| CoreError::Protocol(format!("invalid {field}: {tok}")))
        };
        Ok(Self {
            version: parse_u32("version", tokens[1])?,
            width: parse_u32("width", tokens[2])?,
            height: parse_u32("height", tokens[3])?,
            pixel_format: PixelFormat::from_wire_code(
                tokens[4]
                    .parse()
                    .map_err(|_| CoreError::Protocol(format!("invalid pixel format code: {}", tokens[4])))?,
            )?,
            out_width: parse_u32("out_width", tokens[5])?,
            out_height: parse_u32("out_height", tokens[6])?,
            eye: Eye::from_wire_token(tokens[7])?,
            index: parse_u32("index", tokens[8])?,
            fps: parse_u32("fps", tokens[9])?,
            colour_conversion_json: tokens[10].to_string(),
            j2k_bandwidth: tokens[11]
                .parse()
                .map_err(|_| CoreError::Protocol(format!("invalid j2k_bandwidth: {}", tokens[11])))?,
            resolution: Resolution::from_wire_token(tokens[12])?,
        })
    }
}

/// Serializes a colour-conversion descriptor into the `<colour-conv-json>`
/// metadata token, `null` when `conversion` is absent (spec §4.2 step 1,
/// §4.3 step 2).
#[must_use]
pub fn colour_conversion_to_json(conversion: Option<&ColourConversion>) -> String {
    serde_json::to_string(&conversion).expect("ColourConversion serializes infallibly")
}

/// Parses the `<colour-conv-json>` metadata token back into a descriptor.
///
/// # Errors
/// * `token` is not valid JSON for `Option<ColourConversion>`.
pub fn colour_conversion_from_json(token: &str) -> Result<Option<ColourConversion>, CoreError> {
    serde_json::from_str(token)
        .map_err(|err| CoreError::Protocol(format!("invalid colour conversion json: {err}")))
}

/// Prefix identifying a failure reply on the wire (spec §6).
pub const ERROR_PREFIX: &str = "ERROR ";

/// Renders a server-side failure reply body (without framing).
#[must_use]
pub fn error_reply(message: &str) -> Vec<u8> {
    let mut body = format!("{ERROR_PREFIX}{message}").into_bytes();
    body.push(0);
    body
}

/// Checks whether a reply body is an error reply, returning the message if
/// so.
#[must_use]
pub fn as_error_reply(body: &[u8]) -> Option<String> {
    let trimmed = body.strip_suffix(&[0]).unwrap_or(body);
    let text = std::str::from_utf8(trimmed).ok()?;
    text.strip_prefix(ERROR_PREFIX).map(str::to_string)
}

/// Prefix identifying a fatal protocol-version-mismatch reply (spec §4.3,
/// §7): distinct from [`ERROR_PREFIX`] so a client can tell a one-shot
/// encode failure (worth retrying elsewhere) from an incompatible server
/// (worth marking unusable for the rest of the job).
pub const PROTOCOL_ERROR_PREFIX: &str = "PROTOCOL_ERROR ";

/// Renders a server-side protocol-mismatch reply body (without framing).
#[must_use]
pub fn protocol_error_reply(message: &str) -> Vec<u8> {
    let mut body = format!("{PROTOCOL_ERROR_PREFIX}{message}").into_bytes();
    body.push(0);
    body
}

/// Checks whether a reply body is a protocol-mismatch reply, returning the
/// message if so.
#[must_use]
pub fn as_protocol_error_reply(body: &[u8]) -> Option<String> {
    let trimmed = body.strip_suffix(&[0]).unwrap_or(body);
    let text = std::str::from_utf8(trimmed).ok()?;
    text.strip_prefix(PROTOCOL_ERROR_PREFIX).map(str::to_string)
}

/// The server-availability document sent by the discovery listener (spec
/// §4.4, §6).
#[derive(Clone, Debug, PartialEq)]
pub struct ServerAvailable {
    /// Protocol version the server speaks.
    pub version: u32,
    /// Hostname or address of the announcing server.
    pub host: String,
    /// Encode-request port.
    pub port: u16,
    /// Advertised local worker thread count.
    pub threads: u32,
}

impl ServerAvailable {
    /// Renders the XML discovery document.
    #[must_use]
    pub fn to_xml(&self) -> String {
        format!(
            "<ServerAvailable>\n  <Version>{}</Version>\n  <Host>{}</Host>\n  <Port>{}</Port>\n  <Threads>{}</Threads>\n</ServerAvailable>",
            self.version, self.host, self.port, self.threads
        )
    }

    /// Parses the XML discovery document.
    ///
    /// This is a minimal line-oriented parser matched to the fixed shape
    /// emitted by [`ServerAvailable::to_xml`]; it is not a general XML
    /// parser.
    ///
    /// # Errors
    /// * Any of the four expected elements is missing or fails to parse.
    pub fn from_xml(xml: &str) -> Result<Self, CoreError> {
        let version = extract_element(xml, "Version")?
            .parse()
            .map_err(|_| CoreError::Protocol("invalid Version element".to_string()))?;
        let host = extract_element(xml, "Host")?;
        let port = extract_element(xml, "Port")?
            .parse()
            .map_err(|_| CoreError::Protocol("invalid Port element".to_string()))?;
        let threads = extract_element(xml, "Threads")?
            .parse()
            .map_err(|_| CoreError::Protocol("invalid Threads element".to_string()))?;
        Ok(Self {
            version,
            host,
            port,
            threads,
        })
    }
}

fn extract_element(xml: &str, tag: &str) -> Result<String, CoreError> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml
        .find(&open)
        .ok_or_else(|| CoreError::Protocol(format!("missing <{tag}> element")))?
        + open.len();
    let end = xml[start..]
        .find(&close)
        .ok_or_else(|| CoreError::Protocol(format!("unterminated <{tag}> element")))?
        + start;
    Ok(xml[start..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::{
        EncodeRequest, ServerAvailable, as_error_reply, as_protocol_error_reply,
        colour_conversion_from_json, colour_conversion_to_json, error_reply, protocol_error_reply,
    };
    use crate::model::{ColourConversion, Eye, GammaCurve, PixelFormat, Resolution};

    fn sample_request() -> EncodeRequest {
        EncodeRequest {
            version: 1,
            width: 1998,
            height: 1080,
            pixel_format: PixelFormat::Rgb24,
            out_width: 2048,
            out_height: 1080,
            eye: Eye::Mono,
            index: 42,
            fps: 24,
            colour_conversion_json: "null".to_string(),
            j2k_bandwidth: 250_000_000,
            resolution: Resolution::TwoK,
        }
    }

    #[test]
    fn encode_request_round_trips_metadata_line() {
        let request = sample_request();
        let line = request.to_metadata_line();
        let parsed = EncodeRequest::from_metadata_line(&line).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn encode_request_rejects_wrong_token_count() {
        assert!(EncodeRequest::from_metadata_line("encode 1 2 3").is_err());
    }

    #[test]
    fn encode_request_rejects_wrong_leading_token() {
        let request = sample_request();
        let line = request.to_metadata_line().replacen("encode", "decode", 1);
        assert!(EncodeRequest::from_metadata_line(&line).is_err());
    }

    #[test]
    fn error_reply_round_trips() {
        let body = error_reply("protocol version mismatch");
        assert_eq!(
            as_error_reply(&body).as_deref(),
            Some("protocol version mismatch")
        );
    }

    #[test]
    fn non_error_reply_is_not_detected_as_error() {
        let mut body = b"\xFF\x4F\xFF\x51".to_vec();
        body.push(0);
        assert_eq!(as_error_reply(&body), None);
    }

    #[test]
    fn server_available_round_trips_xml() {
        let doc = ServerAvailable {
            version: 1,
            host: "10.0.0.5".to_string(),
            port: 6192,
            threads: 8,
        };
        let xml = doc.to_xml();
        let parsed = ServerAvailable::from_xml(&xml).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn colour_conversion_json_round_trips_absent_and_present() {
        assert_eq!(colour_conversion_to_json(None), "null");
        assert_eq!(colour_conversion_from_json("null").unwrap(), None);

        let conversion = ColourConversion {
            input_gamma: GammaCurve::pure_power(2.6),
            linearized: false,
            rgb_to_xyz: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            output_gamma: GammaCurve::pure_power(2.6),
        };
        let token = colour_conversion_to_json(Some(&conversion));
        assert!(!token.contains(' '), "wire token must not contain whitespace: {token}");
        assert_eq!(colour_conversion_from_json(&token).unwrap(), Some(conversion));
    }

    #[test]
    fn colour_conversion_from_json_rejects_garbage() {
        assert!(colour_conversion_from_json("not json").is_err());
    }

    #[test]
    fn protocol_error_reply_round_trips_and_is_distinct_from_error_reply() {
        let body = protocol_error_reply("client speaks version 2, server speaks version 1");
        assert_eq!(
            as_protocol_error_reply(&body).as_deref(),
            Some("client speaks version 2, server speaks version 1")
        );
        assert_eq!(as_error_reply(&body), None);

        let plain_error = error_reply("out of memory");
        assert_eq!(as_protocol_error_reply(&plain_error), None);
    }
}
