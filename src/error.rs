use derive_more::From;
use k8s_openapi::serde_json;

use crate::appmeta::codec::DecodeError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Yaml(serde_yaml::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Kubeconfig(kube::config::KubeconfigError),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    Watch(kube::runtime::watcher::Error),

    #[from]
    HttpHeader(hyper::http::Error),

    #[from]
    Base64(base64::DecodeError),

    #[from]
    Io(std::io::Error),

    /// A backing record could not be turned into an application meta
    #[from]
    Decode(DecodeError),

    /// The named record does not exist
    NotFound(String),

    /// The resource is already possessed by a dev session
    AlreadyDev { resource: String, identifier: String },

    /// The watch could not be re-established; the owning watcher is gone
    FatalWatch(String),

    /// Custom error message
    Custom(String),
}

impl Error {
    /// True when the cluster reported the object as absent, or we did.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(api_error)) => api_error.code == 404,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(api_error)) if api_error.code == 409)
    }

    /// Connectivity and API failures that are worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Kube(_) | Self::Watch(_) | Self::Io(_))
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Decode(e) => write!(fmt, "{e}"),
            Self::NotFound(name) => write!(fmt, "{name} not found"),
            Self::AlreadyDev {
                resource,
                identifier,
            } => write!(
                fmt,
                "{resource} already in dev mode (possessed by {identifier})"
            ),
            Self::FatalWatch(msg) => write!(fmt, "watch terminated: {msg}"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
            _ => write!(fmt, "{self:?}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_classification() {
        assert!(api_error(404).is_not_found());
        assert!(Error::NotFound("x".to_string()).is_not_found());
        assert!(!api_error(409).is_not_found());

        assert!(api_error(409).is_already_exists());
        assert!(!api_error(500).is_already_exists());

        assert!(api_error(500).is_transient());
        assert!(!Error::FatalWatch("gone".to_string()).is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::AlreadyDev {
            resource: "web".to_string(),
            identifier: "sess-1".to_string(),
        };
        assert_eq!(err.to_string(), "web already in dev mode (possessed by sess-1)");
    }
}
