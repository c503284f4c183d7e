//! RTP parameters negotiated for a consumer and the source encodings it may consume.
//!
//! These types are plain data: the control plane builds them (usually from
//! JSON, hence the serde derives) and the forwarding engine only reads them.

#[cfg(test)]
mod rtp_parameters_test;

use serde::{Deserialize, Serialize};
use shared::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// URI of the abs-send-time header extension required by the REMB client.
pub const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";

/// Kind of media carried by a consumer.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// RTCP feedback mechanism negotiated for a codec, e.g. `nack`, `nack pli`,
/// `ccm fir` or `goog-remb`.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub parameter: String,
}

impl RtcpFeedback {
    pub fn new(typ: &str, parameter: &str) -> Self {
        Self {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    /// Returns true for RFC 4588 retransmission codecs.
    pub fn is_rtx(&self) -> bool {
        self.mime_type.to_ascii_lowercase().ends_with("/rtx")
    }

    /// Associated payload type of an RTX codec.
    pub fn apt(&self) -> Option<u8> {
        self.parameters.get("apt").and_then(|apt| apt.parse().ok())
    }

    pub fn has_feedback(&self, typ: &str, parameter: &str) -> bool {
        self.rtcp_feedback
            .iter()
            .any(|fb| fb.typ == typ && fb.parameter == parameter)
    }

    pub(crate) fn parameter_is_one(&self, name: &str) -> bool {
        self.parameters.get(name).map(String::as_str) == Some("1")
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default)]
    pub ssrc: u32,
    #[serde(default)]
    pub rid: Option<String>,
    #[serde(default)]
    pub codec_payload_type: Option<u8>,
    #[serde(default)]
    pub rtx: Option<RtxParameters>,
    #[serde(default)]
    pub dtx: bool,
    #[serde(default)]
    pub scalability_mode: Option<String>,
    #[serde(default)]
    pub max_bitrate: Option<u32>,
}

impl RtpEncodingParameters {
    /// Parsed scalability mode, `L1T1` when absent.
    pub fn scalability(&self) -> Result<ScalabilityMode> {
        match &self.scalability_mode {
            Some(mode) => mode.parse(),
            None => Ok(ScalabilityMode::default()),
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
    #[serde(default)]
    pub encrypt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default)]
    pub cname: Option<String>,
    #[serde(default = "default_reduced_size")]
    pub reduced_size: bool,
}

fn default_reduced_size() -> bool {
    true
}

impl Default for RtcpParameters {
    fn default() -> Self {
        Self {
            cname: None,
            reduced_size: true,
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default)]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    pub fn media_codecs(&self) -> impl Iterator<Item = &RtpCodecParameters> {
        self.codecs.iter().filter(|codec| !codec.is_rtx())
    }

    /// Media codec used by `encoding`: the one named by its codec payload type,
    /// or the first media codec.
    pub fn codec_for_encoding(
        &self,
        encoding: &RtpEncodingParameters,
    ) -> Option<&RtpCodecParameters> {
        match encoding.codec_payload_type {
            Some(pt) => self.media_codecs().find(|codec| codec.payload_type == pt),
            None => self.media_codecs().next(),
        }
    }

    pub fn rtx_codec_for_encoding(
        &self,
        encoding: &RtpEncodingParameters,
    ) -> Option<&RtpCodecParameters> {
        let media_codec = self.codec_for_encoding(encoding)?;
        self.codecs
            .iter()
            .find(|codec| codec.is_rtx() && codec.apt() == Some(media_codec.payload_type))
    }

    pub fn header_extension_id(&self, uri: &str) -> Option<u8> {
        self.header_extensions
            .iter()
            .find(|ext| ext.uri == uri)
            .map(|ext| ext.id)
    }

    pub fn has_feedback(&self, typ: &str) -> bool {
        self.codecs
            .iter()
            .any(|codec| codec.rtcp_feedback.iter().any(|fb| fb.typ == typ))
    }
}

/// Number of spatial and temporal layers advertised by an encoding, parsed
/// from scalability mode strings such as `L1T3`, `S3T3` or `L3T3_KEY`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScalabilityMode {
    pub spatial_layers: u8,
    pub temporal_layers: u8,
    pub ksvc: bool,
}

impl Default for ScalabilityMode {
    fn default() -> Self {
        Self {
            spatial_layers: 1,
            temporal_layers: 1,
            ksvc: false,
        }
    }
}

impl std::str::FromStr for ScalabilityMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        let invalid = || Error::ErrInvalidScalabilityMode(mode.to_owned());

        let (layers, suffix) = match mode.split_once('_') {
            Some((layers, suffix)) => (layers, Some(suffix)),
            None => (mode, None),
        };
        let ksvc = match suffix {
            None => false,
            Some("KEY") | Some("KEY_SHIFT") => true,
            Some(_) => return Err(invalid()),
        };

        let rest = layers
            .strip_prefix('L')
            .or_else(|| layers.strip_prefix('S'))
            .ok_or_else(invalid)?;
        let (spatial, temporal) = rest.split_once('T').ok_or_else(invalid)?;
        let spatial_layers: u8 = spatial.parse().map_err(|_| invalid())?;
        let temporal_layers: u8 = temporal.parse().map_err(|_| invalid())?;
        if spatial_layers == 0 || temporal_layers == 0 {
            return Err(invalid());
        }

        Ok(Self {
            spatial_layers,
            temporal_layers,
            ksvc,
        })
    }
}

/// Whether packets of the given codec carry key frame information.
pub fn can_be_key_frame(mime_type: &str) -> bool {
    matches!(
        mime_type.to_ascii_lowercase().as_str(),
        "video/vp8" | "video/vp9" | "video/h264" | "video/h265" | "video/av1"
    )
}
