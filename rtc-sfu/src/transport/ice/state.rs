use serde::Serialize;
use std::fmt;

/// State of the ICE-Lite side of a transport.
///
/// ```text
/// New -> Connected -> Completed
///   \________\___________\-> Disconnected -> Connected | Completed
/// ```
///
/// `Connected` means a valid binding request selected a tuple, `Completed`
/// means the controlling peer nominated it with USE-CANDIDATE.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    #[default]
    New,
    Connected,
    Completed,
    Disconnected,
}

const ICE_STATE_NEW_STR: &str = "new";
const ICE_STATE_CONNECTED_STR: &str = "connected";
const ICE_STATE_COMPLETED_STR: &str = "completed";
const ICE_STATE_DISCONNECTED_STR: &str = "disconnected";

impl IceState {
    /// DTLS may only run in these states.
    pub fn is_connected(&self) -> bool {
        matches!(self, IceState::Connected | IceState::Completed)
    }
}

impl fmt::Display for IceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            IceState::New => ICE_STATE_NEW_STR,
            IceState::Connected => ICE_STATE_CONNECTED_STR,
            IceState::Completed => ICE_STATE_COMPLETED_STR,
            IceState::Disconnected => ICE_STATE_DISCONNECTED_STR,
        };
        write!(f, "{s}")
    }
}
