use serde::Serialize;
use std::fmt;

/// Indicates the state of the DTLS transport.
///
/// ```text
/// New -> Connecting -> Connected -> Closed
///            \-> Failed
/// ```
///
/// `Connecting` is entered when both the local role is known and ICE has a
/// usable tuple. Media only flows in `Connected`.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsTransportState {
    #[default]
    New,
    Connecting,
    Connected,
    /// A close_notify alert was received or the transport was closed locally.
    Closed,
    /// Handshake failure, error alert or remote fingerprint mismatch.
    Failed,
}

const DTLS_TRANSPORT_STATE_NEW_STR: &str = "new";
const DTLS_TRANSPORT_STATE_CONNECTING_STR: &str = "connecting";
const DTLS_TRANSPORT_STATE_CONNECTED_STR: &str = "connected";
const DTLS_TRANSPORT_STATE_CLOSED_STR: &str = "closed";
const DTLS_TRANSPORT_STATE_FAILED_STR: &str = "failed";

impl DtlsTransportState {
    /// Records are only fed to the engine in these states.
    pub(crate) fn accepts_records(&self) -> bool {
        matches!(
            self,
            DtlsTransportState::Connecting | DtlsTransportState::Connected
        )
    }
}

impl fmt::Display for DtlsTransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            DtlsTransportState::New => DTLS_TRANSPORT_STATE_NEW_STR,
            DtlsTransportState::Connecting => DTLS_TRANSPORT_STATE_CONNECTING_STR,
            DtlsTransportState::Connected => DTLS_TRANSPORT_STATE_CONNECTED_STR,
            DtlsTransportState::Closed => DTLS_TRANSPORT_STATE_CLOSED_STR,
            DtlsTransportState::Failed => DTLS_TRANSPORT_STATE_FAILED_STR,
        };
        write!(f, "{s}")
    }
}
