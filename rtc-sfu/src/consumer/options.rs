use super::layers::ConsumerLayers;
use crate::rtp_parameters::{MediaKind, RtpEncodingParameters, RtpParameters};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Forwarding strategy of a consumer.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    /// One source encoding, forwarded as is.
    #[default]
    Simple,
    /// One source encoding per spatial layer.
    Simulcast,
    /// One source encoding carrying every layer.
    Svc,
}

impl fmt::Display for ConsumerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerType::Simple => write!(f, "simple"),
            ConsumerType::Simulcast => write!(f, "simulcast"),
            ConsumerType::Svc => write!(f, "svc"),
        }
    }
}

/// Subscription request creating a consumer.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub rtp_parameters: RtpParameters,
    /// Source encodings, in spatial layer order for simulcast.
    pub consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub producer_paused: bool,
    #[serde(default)]
    pub preferred_layers: Option<ConsumerLayers>,
}
