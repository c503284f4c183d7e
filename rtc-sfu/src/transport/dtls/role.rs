use serde::{Deserialize, Serialize};
use std::fmt;

/// DtlsRole indicates the role of the DTLS endpoint of a transport.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtlsRole {
    /// The role is decided by the peer answering the parameters.
    #[default]
    #[serde(rename = "auto")]
    Auto,

    /// DtlsRoleClient defines the DTLS client role.
    #[serde(rename = "client")]
    Client,

    /// DtlsRoleServer defines the DTLS server role.
    #[serde(rename = "server")]
    Server,
}

/// <https://tools.ietf.org/html/rfc5763>
/// setup:active allows the answer and the DTLS handshake to occur in
/// parallel, so an undecided role resolves to client.
pub(crate) const DEFAULT_DTLS_ROLE_ANSWER: DtlsRole = DtlsRole::Client;

impl fmt::Display for DtlsRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DtlsRole::Auto => write!(f, "auto"),
            DtlsRole::Client => write!(f, "client"),
            DtlsRole::Server => write!(f, "server"),
        }
    }
}

impl DtlsRole {
    /// Local role answering a remote role.
    ///
    /// An explicit remote role gets the opposite one. `auto` gets the
    /// configured answering role, itself `auto` when unset, which falls back
    /// to client.
    pub fn answer(remote: Option<DtlsRole>, answering_role: DtlsRole) -> DtlsRole {
        match remote {
            Some(DtlsRole::Client) => DtlsRole::Server,
            Some(DtlsRole::Server) => DtlsRole::Client,
            Some(DtlsRole::Auto) | None => {
                if answering_role != DtlsRole::Auto {
                    answering_role
                } else {
                    DEFAULT_DTLS_ROLE_ANSWER
                }
            }
        }
    }
}
