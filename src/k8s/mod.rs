pub mod client;
pub mod controller;
pub mod credential;
pub mod source;
pub mod workqueue;

pub use controller::{Controller, ErrorReporter, LogReporter, Reconciler};
pub use credential::Credential;
pub use source::{ChannelFeed, ChannelSource, KubeSource, Notice, RecordSource};
