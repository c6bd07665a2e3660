// Client creation from raw kubeconfig bytes with custom user-agent support
use crate::error::Result;
use crate::k8s::credential::Credential;
use hyper::http::{HeaderName, HeaderValue};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::warn;

/// Create a new k8s client for `credential`
///
/// An empty credential falls back to the ambient configuration
/// (`KUBECONFIG`, `~/.kube/config` or the in-cluster service account).
///
/// # Errors
///
/// Will return `Err` if the kubeconfig can not be parsed or the client can not be built
pub async fn new(credential: &Credential, custom_user_agent: Option<&str>) -> Result<Client> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut config = if credential.is_empty() {
        Config::infer().await?
    } else {
        let text = String::from_utf8_lossy(credential.as_bytes());
        let kubeconfig = Kubeconfig::from_yaml(&text)?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
    };

    if let Some(user_agent) = custom_user_agent {
        match HeaderValue::from_str(user_agent) {
            Ok(header_value) => config
                .headers
                .push((HeaderName::from_static("user-agent"), header_value)),
            Err(e) => warn!("Ignoring invalid user agent {:?}: {}", user_agent, e),
        }
    }

    Ok(Client::try_from(config)?)
}
