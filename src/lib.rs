pub mod appmeta;
pub mod config;
pub mod error;
pub mod k8s;
pub mod manager;

pub use appmeta::{ApplicationEvent, ApplicationMeta, ApplicationState, DevMeta, DevType, EventType};
pub use error::{Error, Result};
pub use k8s::Credential;
pub use manager::{AppMetaManager, ApplicationEventPack, EventBus};
