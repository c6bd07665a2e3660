//! Dev-mode ownership for an application and the transitions between two
//! snapshots of it.
//!
//! A [`DevMeta`] maps a [`DevType`] to the resources of that kind which are
//! currently possessed, each with the identifier of the owning dev session.
//! [`DevMeta::events`] turns two snapshots into the ordered
//! [`ApplicationEvent`]s that explain the change.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Workload category a dev-mode entry applies to.
///
/// Persisted under its alias: `Deployment` is stored as `D`, the others under
/// their own name. Tags written by other tools are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DevType {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Other(String),
}

impl DevType {
    /// The tag used inside persisted dev meta
    #[must_use]
    pub fn alias(&self) -> &str {
        match self {
            Self::Deployment => "D",
            Self::StatefulSet => "statefulset",
            Self::DaemonSet => "daemonSet",
            Self::Job => "job",
            Self::CronJob => "cronJob",
            Self::Other(tag) => tag,
        }
    }

    /// User input, case-insensitive
    fn known(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "d" | "deployment" => Some(Self::Deployment),
            "statefulset" => Some(Self::StatefulSet),
            "daemonset" => Some(Self::DaemonSet),
            "job" => Some(Self::Job),
            "cronjob" => Some(Self::CronJob),
            _ => None,
        }
    }
}

/// Persisted tags match their alias exactly; anything else is kept verbatim.
impl From<String> for DevType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "D" => Self::Deployment,
            "statefulset" => Self::StatefulSet,
            "daemonSet" => Self::DaemonSet,
            "job" => Self::Job,
            "cronJob" => Self::CronJob,
            _ => Self::Other(tag),
        }
    }
}

impl From<DevType> for String {
    fn from(dev_type: DevType) -> Self {
        match dev_type {
            DevType::Other(tag) => tag,
            known => known.alias().to_string(),
        }
    }
}

/// Parses user input; an empty string means `Deployment`.
impl FromStr for DevType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::Deployment);
        }
        Self::known(s).ok_or_else(|| Error::Custom(format!("Unsupported dev type {s}")))
    }
}

impl fmt::Display for DevType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alias())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "DEV_STA")]
    DevStart,
    #[serde(rename = "DEV_END")]
    DevEnd,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DevStart => f.write_str("DEV_STA"),
            Self::DevEnd => f.write_str("DEV_END"),
        }
    }
}

/// One resource entering or leaving dev mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationEvent {
    pub event_type: EventType,
    pub resource_name: String,
    pub identifier: String,
    pub dev_type: DevType,
}

impl ApplicationEvent {
    #[must_use]
    pub fn start(resource_name: &str, identifier: &str, dev_type: &DevType) -> Self {
        Self {
            event_type: EventType::DevStart,
            resource_name: resource_name.to_string(),
            identifier: identifier.to_string(),
            dev_type: dev_type.clone(),
        }
    }

    #[must_use]
    pub fn end(resource_name: &str, identifier: &str, dev_type: &DevType) -> Self {
        Self {
            event_type: EventType::DevEnd,
            resource_name: resource_name.to_string(),
            identifier: identifier.to_string(),
            dev_type: dev_type.clone(),
        }
    }
}

/// `DevType -> (resource name -> identifier)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevMeta(BTreeMap<DevType, BTreeMap<String, String>>);

impl DevMeta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops empty inner mappings so "no resources" is always an absent key.
    pub fn normalize(&mut self) {
        self.0.retain(|_, resources| !resources.is_empty());
    }

    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut copy = self.clone();
        copy.normalize();
        copy
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    /// Identifier of the session possessing `resource`, if any
    #[must_use]
    pub fn identifier(&self, resource: &str, dev_type: &DevType) -> Option<&str> {
        self.0
            .get(dev_type)
            .and_then(|resources| resources.get(resource))
            .map(String::as_str)
    }

    #[must_use]
    pub fn is_developing(&self, resource: &str, dev_type: &DevType) -> bool {
        self.identifier(resource, dev_type).is_some()
    }

    /// True if `identifier` is the (non-empty) owner of `resource`
    #[must_use]
    pub fn is_possessor(&self, resource: &str, dev_type: &DevType, identifier: &str) -> bool {
        !identifier.is_empty() && self.identifier(resource, dev_type) == Some(identifier)
    }

    /// Records `identifier` as owner of `resource`.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyDev` if the resource is already possessed.
    pub fn start(&mut self, resource: &str, dev_type: &DevType, identifier: &str) -> Result<()> {
        let resources = self.0.entry(dev_type.clone()).or_default();
        if let Some(owner) = resources.get(resource) {
            return Err(Error::AlreadyDev {
                resource: resource.to_string(),
                identifier: owner.clone(),
            });
        }
        resources.insert(resource.to_string(), identifier.to_string());
        Ok(())
    }

    /// Removes the owner of `resource`; returns the identifier it had.
    pub fn end(&mut self, resource: &str, dev_type: &DevType) -> Option<String> {
        let resources = self.0.get_mut(dev_type)?;
        let previous = resources.remove(resource);
        if resources.is_empty() {
            self.0.remove(dev_type);
        }
        previous
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DevType, &str, &str)> {
        self.0.iter().flat_map(|(dev_type, resources)| {
            resources
                .iter()
                .map(move |(name, identifier)| (dev_type, name.as_str(), identifier.as_str()))
        })
    }

    /// Ordered transitions that turn `self` into `to`.
    ///
    /// Each resource yields nothing, a single `DEV_END`, a single `DEV_STA`,
    /// or `DEV_END` followed by `DEV_STA` when ownership is handed over.
    /// `to` is never modified.
    #[must_use]
    pub fn events(&self, to: &Self) -> Vec<ApplicationEvent> {
        let mut remaining = to.normalized();
        if self.normalized() == remaining {
            return Vec::new();
        }

        let mut result = Vec::new();
        for (dev_type, resources) in &self.0 {
            let mut to_resources = remaining.0.get_mut(dev_type);
            for (name, identifier) in resources {
                match to_resources.as_mut().and_then(|m| m.remove(name)) {
                    None => result.push(ApplicationEvent::end(name, identifier, dev_type)),
                    Some(to_identifier) if to_identifier != *identifier => {
                        result.push(ApplicationEvent::end(name, identifier, dev_type));
                        result.push(ApplicationEvent::start(name, &to_identifier, dev_type));
                    }
                    Some(_) => {}
                }
            }
        }

        for (dev_type, resources) in &remaining.0 {
            for (name, identifier) in resources {
                result.push(ApplicationEvent::start(name, identifier, dev_type));
            }
        }

        result
    }
}

impl<const N: usize> From<[(DevType, &str, &str); N]> for DevMeta {
    fn from(entries: [(DevType, &str, &str); N]) -> Self {
        let mut meta = Self::default();
        for (dev_type, resource, identifier) in entries {
            meta.0
                .entry(dev_type)
                .or_default()
                .insert(resource.to_string(), identifier.to_string());
        }
        meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: DevType = DevType::Deployment;

    fn kinds(events: &[ApplicationEvent], resource: &str) -> Vec<EventType> {
        events
            .iter()
            .filter(|e| e.resource_name == resource)
            .map(|e| e.event_type)
            .collect()
    }

    #[test]
    fn test_handoff_ends_before_start() {
        let from = DevMeta::from([(D, "web", "sess-1")]);
        let to = DevMeta::from([(D, "web", "sess-2")]);

        assert_eq!(
            from.events(&to),
            vec![
                ApplicationEvent::end("web", "sess-1", &D),
                ApplicationEvent::start("web", "sess-2", &D),
            ]
        );
    }

    #[test]
    fn test_new_resource_starts() {
        let from = DevMeta::new();
        let to = DevMeta::from([(D, "web", "sess-1")]);

        assert_eq!(from.events(&to), vec![ApplicationEvent::start("web", "sess-1", &D)]);
    }

    #[test]
    fn test_removed_resource_ends() {
        let from = DevMeta::from([(D, "web", "sess-1"), (D, "api", "sess-9")]);
        let to = DevMeta::from([(D, "api", "sess-9")]);

        assert_eq!(from.events(&to), vec![ApplicationEvent::end("web", "sess-1", &D)]);
    }

    #[test]
    fn test_missing_dev_type_still_tags_end() {
        let from = DevMeta::from([(DevType::StatefulSet, "db", "sess-3")]);
        let to = DevMeta::from([(D, "web", "sess-1")]);

        let events = from.events(&to);
        assert_eq!(
            events,
            vec![
                ApplicationEvent::end("db", "sess-3", &DevType::StatefulSet),
                ApplicationEvent::start("web", "sess-1", &D),
            ]
        );
    }

    #[test]
    fn test_idempotent_including_empty_inner_maps() {
        let meta = DevMeta::from([(D, "web", "sess-1"), (DevType::Job, "batch", "sess-2")]);
        assert!(meta.events(&meta).is_empty());

        let mut with_empty = DevMeta::new();
        with_empty.0.insert(DevType::CronJob, BTreeMap::new());
        assert!(with_empty.events(&DevMeta::new()).is_empty());
        assert!(DevMeta::new().events(&with_empty).is_empty());
    }

    #[test]
    fn test_to_is_not_mutated() {
        let from = DevMeta::from([(D, "web", "sess-1")]);
        let to = DevMeta::from([(D, "web", "sess-1"), (D, "api", "sess-2")]);
        let before = to.clone();

        let events = from.events(&to);

        assert_eq!(to, before);
        assert_eq!(events, vec![ApplicationEvent::start("api", "sess-2", &D)]);
    }

    #[test]
    fn test_partition_per_resource() {
        let from = DevMeta::from([
            (D, "same", "a"),
            (D, "gone", "b"),
            (D, "moved", "c"),
            (DevType::DaemonSet, "agent", "d"),
        ]);
        let to = DevMeta::from([
            (D, "same", "a"),
            (D, "moved", "z"),
            (D, "fresh", "e"),
            (DevType::DaemonSet, "agent", "d"),
        ]);

        let events = from.events(&to);

        assert!(kinds(&events, "same").is_empty());
        assert!(kinds(&events, "agent").is_empty());
        assert_eq!(kinds(&events, "gone"), vec![EventType::DevEnd]);
        assert_eq!(kinds(&events, "fresh"), vec![EventType::DevStart]);
        assert_eq!(kinds(&events, "moved"), vec![EventType::DevEnd, EventType::DevStart]);
    }

    #[test]
    fn test_start_and_end() {
        let mut meta = DevMeta::new();
        meta.start("web", &D, "sess-1").unwrap();

        assert!(meta.is_developing("web", &D));
        assert!(meta.is_possessor("web", &D, "sess-1"));
        assert!(!meta.is_possessor("web", &D, ""));
        assert!(!meta.is_developing("web", &DevType::StatefulSet));

        let err = meta.start("web", &D, "sess-2").unwrap_err();
        assert!(matches!(err, Error::AlreadyDev { identifier, .. } if identifier == "sess-1"));

        assert_eq!(meta.end("web", &D), Some("sess-1".to_string()));
        assert_eq!(meta, DevMeta::new());
        assert_eq!(meta.end("web", &D), None);
    }

    #[test]
    fn test_dev_type_aliases() {
        assert_eq!(DevType::Deployment.alias(), "D");
        assert_eq!(DevType::from("D".to_string()), DevType::Deployment);
        assert_eq!(DevType::from("daemonSet".to_string()), DevType::DaemonSet);
        assert_eq!(
            DevType::from("rollout".to_string()),
            DevType::Other("rollout".to_string())
        );
        assert_eq!(
            DevType::from("deployment".to_string()),
            DevType::Other("deployment".to_string())
        );
        assert_eq!(
            DevType::from("DaemonSet".to_string()),
            DevType::Other("DaemonSet".to_string())
        );

        assert_eq!("".parse::<DevType>().unwrap(), DevType::Deployment);
        assert_eq!("StatefulSet".parse::<DevType>().unwrap(), DevType::StatefulSet);
        assert!("rollout".parse::<DevType>().is_err());
    }

    #[test]
    fn test_yaml_shape() {
        let meta = DevMeta::from([(D, "web", "sess-1"), (DevType::CronJob, "nightly", "sess-2")]);
        let yaml = serde_yaml::to_string(&meta).unwrap();

        assert!(yaml.contains("D:\n  web: sess-1"));
        assert!(yaml.contains("cronJob:\n  nightly: sess-2"));
        assert_eq!(serde_yaml::from_str::<DevMeta>(&yaml).unwrap(), meta);
    }

    #[test]
    fn test_foreign_tags_survive_a_rewrite() {
        let stored = "D:\n  web: sess-1\ndeployment:\n  api: sess-2\nDaemonSet:\n  agent: sess-3\n";
        let meta: DevMeta = serde_yaml::from_str(stored).unwrap();

        assert_eq!(meta.iter().count(), 3);
        assert!(meta.is_possessor("web", &D, "sess-1"));
        assert!(meta.is_possessor("api", &DevType::Other("deployment".to_string()), "sess-2"));

        let rewritten = serde_yaml::to_string(&meta).unwrap();
        assert!(rewritten.contains("deployment:\n  api: sess-2"));
        assert!(rewritten.contains("DaemonSet:\n  agent: sess-3"));
        assert!(!rewritten.contains("daemonSet"));
    }
}
