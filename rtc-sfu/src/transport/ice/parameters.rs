use serde::{Deserialize, Serialize};

/// Local ICE parameters announced to the remote peer.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    /// Always true, this side only answers connectivity checks.
    pub ice_lite: bool,
}
