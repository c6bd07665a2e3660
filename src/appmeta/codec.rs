//! Mapping between [`ApplicationMeta`] and its backing secret.
//!
//! Only the record name and the state key `s` are mandatory. Every other key
//! is read through [`SoftField`]: a missing or corrupt value decodes as empty
//! and is logged, so one bad field never hides the application state.
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::warn;

use super::compress::{compress, decompress_if_gzip};
use super::{
    AppConfig, AppType, ApplicationMeta, ApplicationState, DevMeta, KEY_APP_TYPE, KEY_CONFIG,
    KEY_DEP_CONFIG, KEY_DEV_META, KEY_HELM_RELEASE, KEY_MANIFEST, KEY_PRE_INSTALL, KEY_STATE,
    application_name,
};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("record {name} carries no data")]
    MissingData { name: String },

    #[error("record name {name} is illegal, must start with {prefix}")]
    IllegalName { name: String, prefix: &'static str },

    #[error("record {name} is illegal, must contain data key {key}")]
    MissingState { name: String, key: &'static str },
}

/// A field that may be absent or unreadable without failing the record
#[derive(Debug, Clone, PartialEq)]
pub enum SoftField<T> {
    Absent,
    Valid(T),
    Corrupt(String),
}

impl<T: Default> SoftField<T> {
    /// The decoded value, or the type's empty value (logged if corrupt).
    pub fn or_empty(self, record: &str, key: &str) -> T {
        match self {
            Self::Absent => T::default(),
            Self::Valid(value) => value,
            Self::Corrupt(reason) => {
                warn!("Field '{}' of record {} is corrupt, treating as empty: {}", key, record, reason);
                T::default()
            }
        }
    }
}

type RecordData = BTreeMap<String, ByteString>;

fn required<'a>(
    data: &'a RecordData,
    record: &str,
    key: &'static str,
) -> core::result::Result<&'a [u8], DecodeError> {
    data.get(key)
        .map(|value| value.0.as_slice())
        .ok_or_else(|| DecodeError::MissingState {
            name: record.to_string(),
            key,
        })
}

fn plain_text(data: &RecordData, key: &str) -> SoftField<String> {
    match data.get(key) {
        None => SoftField::Absent,
        Some(value) => String::from_utf8(value.0.clone())
            .map_or_else(|e| SoftField::Corrupt(e.to_string()), SoftField::Valid),
    }
}

fn packed_text(data: &RecordData, key: &str) -> SoftField<String> {
    let Some(value) = data.get(key) else {
        return SoftField::Absent;
    };
    match decompress_if_gzip(&value.0) {
        Ok(raw) => String::from_utf8(raw)
            .map_or_else(|e| SoftField::Corrupt(e.to_string()), SoftField::Valid),
        Err(e) => SoftField::Corrupt(e.to_string()),
    }
}

fn dev_meta(data: &RecordData) -> SoftField<DevMeta> {
    let Some(value) = data.get(KEY_DEV_META) else {
        return SoftField::Absent;
    };
    serde_yaml::from_slice::<Option<DevMeta>>(&value.0).map_or_else(
        |e| SoftField::Corrupt(e.to_string()),
        |meta| {
            let mut meta = meta.unwrap_or_default();
            meta.normalize();
            SoftField::Valid(meta)
        },
    )
}

/// Older writers quoted this port, which no longer parses as a number
static QUOTED_DEBUG_PORT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"remoteDebugPort: "[0-9]*""#).ok());

fn config(data: &RecordData) -> SoftField<Option<AppConfig>> {
    let text = match packed_text(data, KEY_CONFIG) {
        SoftField::Valid(text) => text,
        SoftField::Absent => return SoftField::Absent,
        SoftField::Corrupt(reason) => return SoftField::Corrupt(reason),
    };
    match serde_yaml::from_str::<AppConfig>(&text) {
        Ok(value) => SoftField::Valid(Some(value)),
        Err(first) => {
            let repaired = QUOTED_DEBUG_PORT
                .as_ref()
                .map(|re| re.replace_all(&text, "").into_owned());
            repaired
                .and_then(|repaired| serde_yaml::from_str::<AppConfig>(&repaired).ok())
                .map_or_else(|| SoftField::Corrupt(first.to_string()), |v| SoftField::Valid(Some(v)))
        }
    }
}

/// Decode a backing secret.
///
/// # Errors
///
/// Will return `Err` if the name lacks the record prefix or the state key is absent
pub fn decode(secret: &Secret) -> core::result::Result<ApplicationMeta, DecodeError> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let namespace = secret.metadata.namespace.clone().unwrap_or_default();
    let application = application_name(&name)?;

    let Some(data) = secret.data.as_ref() else {
        return Err(DecodeError::MissingData { name });
    };
    let state = ApplicationState::from_bytes(required(data, &name, KEY_STATE)?);

    let mut meta = ApplicationMeta::new(&namespace, &application);
    meta.application_state = state;
    meta.pre_install_manifest = packed_text(data, KEY_PRE_INSTALL).or_empty(&name, KEY_PRE_INSTALL);
    meta.manifest = packed_text(data, KEY_MANIFEST).or_empty(&name, KEY_MANIFEST);
    meta.dep_config_name = plain_text(data, KEY_DEP_CONFIG).or_empty(&name, KEY_DEP_CONFIG);
    meta.helm_release_name = plain_text(data, KEY_HELM_RELEASE).or_empty(&name, KEY_HELM_RELEASE);
    meta.application_type =
        AppType::from_tag(&plain_text(data, KEY_APP_TYPE).or_empty(&name, KEY_APP_TYPE));
    meta.dev_meta = dev_meta(data).or_empty(&name, KEY_DEV_META);
    meta.config = config(data)
        .or_empty(&name, KEY_CONFIG)
        .unwrap_or(AppConfig::Null);
    meta.secret = Some(secret.clone());
    Ok(meta)
}

fn encoded_fields(meta: &ApplicationMeta) -> Result<[(&'static str, Vec<u8>); 8]> {
    let dev_meta = serde_yaml::to_string(&meta.dev_meta.normalized())?;
    let config = serde_yaml::to_string(&meta.config)?;
    Ok([
        (KEY_PRE_INSTALL, compress(meta.pre_install_manifest.as_bytes())?),
        (KEY_MANIFEST, compress(meta.manifest.as_bytes())?),
        (KEY_CONFIG, compress(config.as_bytes())?),
        (KEY_DEV_META, dev_meta.into_bytes()),
        (KEY_STATE, meta.application_state.as_str().as_bytes().to_vec()),
        (KEY_DEP_CONFIG, meta.dep_config_name.as_bytes().to_vec()),
        (KEY_APP_TYPE, meta.application_type.as_str().as_bytes().to_vec()),
        (KEY_HELM_RELEASE, meta.helm_release_name.as_bytes().to_vec()),
    ])
}

/// Overwrite every known key of `secret` from `meta`.
///
/// All values are encoded before the first one is written, so a failure
/// leaves the record untouched.
///
/// # Errors
///
/// Will return `Err` if a field cannot be serialized or compressed
pub fn encode_into(meta: &ApplicationMeta, secret: &mut Secret) -> Result<()> {
    let fields = encoded_fields(meta)?;
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    for (key, value) in fields {
        data.insert(key.to_string(), ByteString(value));
    }
    Ok(())
}
