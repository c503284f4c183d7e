use super::fingerprint::DtlsFingerprint;
use super::role::DtlsRole;
use serde::{Deserialize, Serialize};

/// DTLS role and certificate fingerprints exchanged over signaling.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: Option<DtlsRole>,
    pub fingerprints: Vec<DtlsFingerprint>,
}
