//! Reading Helm release records. The format belongs to Helm; only the fields
//! needed to follow a release's lifecycle are decoded.
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use super::compress::decompress_if_gzip;
use crate::error::{Error, Result};

/// Name prefix of Helm's release secrets
pub const RELEASE_KEY_PREFIX: &str = "sh.helm.release.v1.";
/// Data key holding the encoded release
pub const RELEASE_DATA_KEY: &str = "release";
/// Label selector matching Helm's release secrets
pub const RELEASE_LABEL_SELECTOR: &str = "owner=helm";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Release {
    pub name: String,
    pub info: Option<Info>,
    pub manifest: String,
    pub version: i64,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Info {
    pub first_deployed: String,
    pub last_deployed: String,
    pub deleted: String,
    pub description: String,
    pub status: String,
}

impl Release {
    /// Helm may keep the record of an uninstalled release around
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.info.as_ref().is_some_and(|info| !info.deleted.is_empty())
    }
}

/// base64, then gzip if the magic header is present, then JSON.
///
/// # Errors
///
/// Will return `Err` if any of the layers is malformed
pub fn decode_release(data: &[u8]) -> Result<Release> {
    let raw = STANDARD.decode(data)?;
    let json = decompress_if_gzip(&raw)?;
    Ok(k8s_openapi::serde_json::from_slice(&json)?)
}

/// Release name from a `[ns/]sh.helm.release.v1.<name>.v<revision>` key.
///
/// # Errors
///
/// Will return `Err` if the key does not follow Helm's naming
pub fn release_name_from_key(key: &str) -> Result<String> {
    let Some((_, rest)) = key.rsplit_once(RELEASE_KEY_PREFIX) else {
        return Err(Error::Custom(format!(
            "Invalid Helm key {key}, not contain '{RELEASE_KEY_PREFIX}'"
        )));
    };
    match rest.rsplit_once(".v") {
        Some((name, revision))
            if !name.is_empty()
                && !revision.is_empty()
                && revision.bytes().all(|b| b.is_ascii_digit()) =>
        {
            Ok(name.to_string())
        }
        _ => Err(Error::Custom(format!("Invalid Helm key {key}"))),
    }
}
