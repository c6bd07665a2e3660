use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::fmt;

/// Raw kubeconfig bytes used to reach a cluster. Empty means "infer from the
/// environment".
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential(Bytes);

impl Credential {
    #[must_use]
    pub const fn new(raw: Bytes) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self(Bytes::new())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex SHA-256 of the credential content. Equal content, equal fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.0))
    }
}

impl From<Vec<u8>> for Credential {
    fn from(raw: Vec<u8>) -> Self {
        Self(Bytes::from(raw))
    }
}

impl From<&str> for Credential {
    fn from(raw: &str) -> Self {
        Self(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

/// Never prints the secret material
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fingerprint = self.fingerprint();
        write!(f, "Credential({})", &fingerprint[..12])
    }
}
