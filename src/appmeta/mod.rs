//! The application meta record: install lifecycle and dev-mode ownership of
//! one application in one namespace, persisted as a cluster secret.
pub mod codec;
pub mod compress;
pub mod dev_meta;
pub mod helm;
mod lifecycle;
pub mod operator;

use k8s_openapi::api::core::v1::Secret;
use serde::Serialize;
use std::fmt;

use crate::error::Result;
pub use codec::DecodeError;
pub use dev_meta::{ApplicationEvent, DevMeta, DevType, EventType};
pub use operator::{KubeSecretOperator, SecretOperator};

/// Secret type marking a record as application meta
pub const RECORD_TYPE: &str = "dev.nocalhost/application.meta";
/// Record name is this prefix followed by the application name
pub const RECORD_NAME_PREFIX: &str = "dev.nocalhost.application.";
/// Dependency config maps removed on uninstall
pub const DEPENDENCE_CONFIG_MAP_PREFIX: &str = "nocalhost-depends-do-not-overwrite";

pub const KEY_PRE_INSTALL: &str = "p";
pub const KEY_MANIFEST: &str = "m";
pub const KEY_DEV_META: &str = "v";
pub const KEY_STATE: &str = "s";
pub const KEY_DEP_CONFIG: &str = "d";
pub const KEY_CONFIG: &str = "c";
pub const KEY_APP_TYPE: &str = "t";
pub const KEY_HELM_RELEASE: &str = "r";

/// Application configuration; owned by another subsystem and carried opaquely.
pub type AppConfig = serde_yaml::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationState {
    #[default]
    Uninstalled,
    Installing,
    Installed,
}

impl ApplicationState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninstalled => "UNINSTALLED",
            Self::Installing => "INSTALLING",
            Self::Installed => "INSTALLED",
        }
    }

    /// Anything that is not exactly `INSTALLING` or `INSTALLED` is uninstalled.
    #[must_use]
    pub fn from_bytes(raw: &[u8]) -> Self {
        match raw {
            b"INSTALLING" => Self::Installing,
            b"INSTALLED" => Self::Installed,
            _ => Self::Uninstalled,
        }
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the application was installed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum AppType {
    #[serde(rename = "helmGit")]
    HelmGit,
    #[serde(rename = "helmRepo")]
    HelmRepo,
    #[serde(rename = "helmLocal")]
    HelmLocal,
    #[default]
    #[serde(rename = "rawManifest")]
    Manifest,
    #[serde(rename = "rawManifestGit")]
    ManifestGit,
    #[serde(rename = "rawManifestLocal")]
    ManifestLocal,
    #[serde(rename = "kustomizeGit")]
    KustomizeGit,
    #[serde(rename = "kustomizeLocal")]
    KustomizeLocal,
}

impl AppType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HelmGit => "helmGit",
            Self::HelmRepo => "helmRepo",
            Self::HelmLocal => "helmLocal",
            Self::Manifest => "rawManifest",
            Self::ManifestGit => "rawManifestGit",
            Self::ManifestLocal => "rawManifestLocal",
            Self::KustomizeGit => "kustomizeGit",
            Self::KustomizeLocal => "kustomizeLocal",
        }
    }

    /// Unknown tags fall back to a raw manifest application.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "helmGit" => Self::HelmGit,
            "helmRepo" => Self::HelmRepo,
            "helmLocal" => Self::HelmLocal,
            "rawManifestGit" => Self::ManifestGit,
            "rawManifestLocal" => Self::ManifestLocal,
            "kustomizeGit" => Self::KustomizeGit,
            "kustomizeLocal" => Self::KustomizeLocal,
            _ => Self::Manifest,
        }
    }

    #[must_use]
    pub const fn is_helm(self) -> bool {
        matches!(self, Self::HelmGit | Self::HelmRepo | Self::HelmLocal)
    }
}

/// Name of the backing record for `application`
#[must_use]
pub fn record_name(application: &str) -> String {
    format!("{RECORD_NAME_PREFIX}{application}")
}

/// Resolve the application name from a record name or a `namespace/name` key
///
/// # Errors
///
/// Will return `Err` if the name does not carry the record prefix
pub fn application_name(record_name: &str) -> core::result::Result<String, DecodeError> {
    let name = match record_name.split_once('/') {
        Some((_, rest)) if !rest.is_empty() => rest,
        _ => record_name,
    };
    name.strip_prefix(RECORD_NAME_PREFIX)
        .map(ToString::to_string)
        .ok_or_else(|| DecodeError::IllegalName {
            name: name.to_string(),
            prefix: RECORD_NAME_PREFIX,
        })
}

/// Decoded application meta. Mutations stay in memory until persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationMeta {
    pub application: String,
    pub namespace: String,
    pub application_type: AppType,
    pub helm_release_name: String,
    pub application_state: ApplicationState,
    pub dep_config_name: String,
    pub pre_install_manifest: String,
    pub manifest: String,
    /// Applied out of band; never persisted
    pub custom_manifest: String,
    pub dev_meta: DevMeta,
    pub config: AppConfig,
    /// The backing record this meta was decoded from, if any
    pub secret: Option<Secret>,
}

impl ApplicationMeta {
    /// An uninstalled application with no backing record
    #[must_use]
    pub fn new(namespace: &str, application: &str) -> Self {
        Self {
            application: application.to_string(),
            namespace: namespace.to_string(),
            application_type: AppType::default(),
            helm_release_name: String::new(),
            application_state: ApplicationState::Uninstalled,
            dep_config_name: String::new(),
            pre_install_manifest: String::new(),
            manifest: String::new(),
            custom_manifest: String::new(),
            dev_meta: DevMeta::new(),
            config: AppConfig::Null,
            secret: None,
        }
    }

    /// Decode a backing record
    ///
    /// # Errors
    ///
    /// Will return `Err` if the record name or its mandatory state field is invalid
    pub fn decode(secret: &Secret) -> core::result::Result<Self, DecodeError> {
        codec::decode(secret)
    }

    #[must_use]
    pub fn record_name(&self) -> String {
        record_name(&self.application)
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.application_state == ApplicationState::Installed
    }

    #[must_use]
    pub fn is_installing(&self) -> bool {
        self.application_state == ApplicationState::Installing
    }

    #[must_use]
    pub fn is_not_installed(&self) -> bool {
        self.application_state == ApplicationState::Uninstalled
    }

    #[must_use]
    pub const fn is_helm(&self) -> bool {
        self.application_type.is_helm()
    }

    #[must_use]
    pub fn not_install_tips(&self) -> String {
        format!(
            "Application {} in ns {} is not installed or under installing, \
             or maybe the kubeconfig provided has not permitted to this namespace",
            self.application, self.namespace
        )
    }

    #[must_use]
    pub fn is_dev_possessor(&self, resource: &str, dev_type: &DevType, identifier: &str) -> bool {
        self.dev_meta.is_possessor(resource, dev_type, identifier)
    }

    #[must_use]
    pub fn is_developing(&self, resource: &str, dev_type: &DevType) -> bool {
        self.dev_meta.is_developing(resource, dev_type)
    }

    /// Write every known field into the backing record, in memory only
    ///
    /// # Errors
    ///
    /// Will return `Err` if a field cannot be encoded
    pub fn prepare(&self, secret: &mut Secret) -> Result<()> {
        codec::encode_into(self, secret)
    }

    #[must_use]
    pub fn summary(&self) -> ApplicationMetaSummary {
        ApplicationMetaSummary {
            application: self.application.clone(),
            namespace: self.namespace.clone(),
            application_state: self.application_state,
            application_type: self.application_type,
            dev_meta: self.dev_meta.clone(),
            manifest: self.manifest.clone(),
            pre_install_manifest: self.pre_install_manifest.clone(),
        }
    }
}

/// What the CLI prints for an application
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationMetaSummary {
    pub application: String,
    #[serde(rename = "ns")]
    pub namespace: String,
    pub application_state: ApplicationState,
    pub application_type: AppType,
    pub dev_meta: DevMeta,
    pub manifest: String,
    pub pre_install_manifest: String,
}
