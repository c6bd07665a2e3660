use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::{
    ApplicationMeta, ApplicationState, DEPENDENCE_CONFIG_MAP_PREFIX, DevType, KEY_STATE,
    RECORD_TYPE, SecretOperator,
};
use crate::error::{Error, Result};

impl ApplicationMeta {
    /// Create the backing record in `INSTALLING` state.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the record already exists or cannot be created
    pub async fn initial(&mut self, op: &dyn SecretOperator) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.record_name()),
                namespace: Some(self.namespace.clone()),
                ..ObjectMeta::default()
            },
            immutable: Some(false),
            type_: Some(RECORD_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                KEY_STATE.to_string(),
                ByteString(ApplicationState::Installing.as_str().as_bytes().to_vec()),
            )])),
            ..Secret::default()
        };

        let created = op.create(&self.namespace, &secret).await?;
        self.application_state = ApplicationState::Installing;
        self.secret = Some(created);
        debug!("Initialized application {} in {}", self.application, self.namespace);
        Ok(())
    }

    /// Create the record, let `customize` fill it in, then persist it as installed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the record cannot be created or updated
    pub async fn one_time_initial<F>(&mut self, op: &dyn SecretOperator, customize: F) -> Result<()>
    where
        F: FnOnce(&mut Self) + Send,
    {
        self.initial(op).await?;
        customize(self);
        self.application_state = ApplicationState::Installed;
        self.update(op).await
    }

    /// Persist every field to the backing record.
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is no backing record or the write fails
    pub async fn update(&mut self, op: &dyn SecretOperator) -> Result<()> {
        let mut secret = self
            .secret
            .clone()
            .ok_or_else(|| Error::NotFound(self.record_name()))?;
        self.prepare(&mut secret)?;
        let updated = op.update(&self.namespace, &secret).await?;
        self.secret = Some(updated);
        Ok(())
    }

    /// Possess `resource` for `identifier` and persist.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the resource is already in dev mode or the write fails
    pub async fn dev_start(
        &mut self,
        op: &dyn SecretOperator,
        resource: &str,
        dev_type: &DevType,
        identifier: &str,
    ) -> Result<()> {
        self.dev_meta.start(resource, dev_type, identifier)?;
        self.update(op).await?;
        info!(
            "Resource({} - {} - {}), Name({}) Start DevMode",
            self.namespace, self.application, dev_type, resource
        );
        Ok(())
    }

    /// Release `resource` and persist. Releasing a free resource only rewrites the record.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the write fails
    pub async fn dev_end(
        &mut self,
        op: &dyn SecretOperator,
        resource: &str,
        dev_type: &DevType,
    ) -> Result<()> {
        if self.dev_meta.end(resource, dev_type).is_none() {
            debug!("{} ({}) was not in dev mode", resource, dev_type);
        }
        self.update(op).await?;
        info!(
            "Resource({} - {} - {}), Name({}) End DevMode",
            self.namespace, self.application, dev_type, resource
        );
        Ok(())
    }

    /// # Errors
    ///
    /// See [`ApplicationMeta::dev_start`]
    pub async fn deployment_dev_start(
        &mut self,
        op: &dyn SecretOperator,
        resource: &str,
        identifier: &str,
    ) -> Result<()> {
        self.dev_start(op, resource, &DevType::Deployment, identifier)
            .await
    }

    /// # Errors
    ///
    /// See [`ApplicationMeta::dev_end`]
    pub async fn deployment_dev_end(&mut self, op: &dyn SecretOperator, resource: &str) -> Result<()> {
        self.dev_end(op, resource, &DevType::Deployment).await
    }

    /// Remove dependency config maps, then the backing record.
    ///
    /// # Errors
    ///
    /// Will return `Err` only if deleting the backing record fails
    pub async fn uninstall(&mut self, op: &dyn SecretOperator) -> Result<()> {
        if let Err(e) = self.clean_up_dep_config_maps(op).await {
            warn!("Error while cleaning up dependency config maps: {}", e);
        }
        self.delete(op).await
    }

    async fn clean_up_dep_config_maps(&mut self, op: &dyn SecretOperator) -> Result<()> {
        if self.dep_config_name.is_empty() {
            debug!("No dependency config map needs to clean up");
        } else {
            debug!("Cleaning up config map {}", self.dep_config_name);
            op.delete_config_map(&self.namespace, &self.dep_config_name)
                .await?;
            self.dep_config_name.clear();
        }

        for name in op.list_config_maps(&self.namespace).await? {
            if !name.starts_with(DEPENDENCE_CONFIG_MAP_PREFIX) {
                continue;
            }
            if let Err(e) = op.delete_config_map(&self.namespace, &name).await {
                warn!("Failed to clean up config map {}: {}", name, e);
            }
        }
        Ok(())
    }

    /// Delete the backing record. A record that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cluster refuses the delete
    pub async fn delete(&mut self, op: &dyn SecretOperator) -> Result<()> {
        let name = self
            .secret
            .as_ref()
            .and_then(|s| s.metadata.name.clone())
            .unwrap_or_else(|| self.record_name());
        match op.delete(&self.namespace, &name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Record {} already deleted", name),
            Err(e) => return Err(e),
        }
        self.secret = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appmeta::AppType;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryOperator {
        secrets: Mutex<BTreeMap<String, Secret>>,
        config_maps: Mutex<Vec<String>>,
        failing_config_map: Option<String>,
    }

    #[async_trait]
    impl SecretOperator for MemoryOperator {
        async fn create(&self, _namespace: &str, secret: &Secret) -> Result<Secret> {
            let name = secret.metadata.name.clone().unwrap_or_default();
            let mut secrets = self.secrets.lock().unwrap();
            if secrets.contains_key(&name) {
                return Err(Error::Custom(format!("{name} already exists")));
            }
            secrets.insert(name, secret.clone());
            Ok(secret.clone())
        }

        async fn get(&self, _namespace: &str, name: &str) -> Result<Secret> {
            self.secrets
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound(name.to_string()))
        }

        async fn update(&self, _namespace: &str, secret: &Secret) -> Result<Secret> {
            let name = secret.metadata.name.clone().unwrap_or_default();
            self.secrets.lock().unwrap().insert(name, secret.clone());
            Ok(secret.clone())
        }

        async fn delete(&self, _namespace: &str, name: &str) -> Result<()> {
            self.secrets
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::NotFound(name.to_string()))
        }

        async fn list_config_maps(&self, _namespace: &str) -> Result<Vec<String>> {
            Ok(self.config_maps.lock().unwrap().clone())
        }

        async fn delete_config_map(&self, _namespace: &str, name: &str) -> Result<()> {
            if self.failing_config_map.as_deref() == Some(name) {
                return Err(Error::Custom("forbidden".to_string()));
            }
            self.config_maps.lock().unwrap().retain(|cm| cm != name);
            Ok(())
        }
    }

    fn stored(op: &MemoryOperator, app: &str) -> ApplicationMeta {
        let secrets = op.secrets.lock().unwrap();
        ApplicationMeta::decode(&secrets[&crate::appmeta::record_name(app)]).unwrap()
    }

    #[tokio::test]
    async fn test_initial_then_dev_cycle() {
        let op = MemoryOperator::default();
        let mut meta = ApplicationMeta::new("dev", "bookinfo");

        meta.initial(&op).await.unwrap();
        assert!(meta.is_installing());
        assert!(stored(&op, "bookinfo").is_installing());
        assert!(meta.initial(&op).await.is_err());

        meta.application_state = ApplicationState::Installed;
        meta.deployment_dev_start(&op, "productpage", "sess-1").await.unwrap();
        let persisted = stored(&op, "bookinfo");
        assert!(persisted.is_installed());
        assert!(persisted.is_dev_possessor("productpage", &DevType::Deployment, "sess-1"));

        let err = meta
            .deployment_dev_start(&op, "productpage", "sess-2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyDev { .. }));

        meta.deployment_dev_end(&op, "productpage").await.unwrap();
        assert!(stored(&op, "bookinfo").dev_meta.is_empty());
    }

    #[tokio::test]
    async fn test_one_time_initial() {
        let op = MemoryOperator::default();
        let mut meta = ApplicationMeta::new("dev", "reviews");

        meta.one_time_initial(&op, |m| {
            m.application_type = AppType::HelmLocal;
            m.helm_release_name = "reviews".to_string();
        })
        .await
        .unwrap();

        let persisted = stored(&op, "reviews");
        assert!(persisted.is_installed());
        assert!(persisted.is_helm());
        assert_eq!(persisted.helm_release_name, "reviews");
    }

    #[tokio::test]
    async fn test_update_without_record() {
        let op = MemoryOperator::default();
        let mut meta = ApplicationMeta::new("dev", "ghost");
        assert!(meta.update(&op).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_uninstall_cleans_config_maps_and_tolerates_failures() {
        let op = MemoryOperator {
            failing_config_map: Some("nocalhost-depends-do-not-overwrite-b".to_string()),
            ..MemoryOperator::default()
        };
        *op.config_maps.lock().unwrap() = vec![
            "nocalhost-depends-do-not-overwrite-a".to_string(),
            "nocalhost-depends-do-not-overwrite-b".to_string(),
            "kube-root-ca.crt".to_string(),
        ];
        let mut meta = ApplicationMeta::new("dev", "bookinfo");
        meta.initial(&op).await.unwrap();
        meta.dep_config_name = "nocalhost-depends-do-not-overwrite-a".to_string();

        meta.uninstall(&op).await.unwrap();

        assert!(meta.secret.is_none());
        assert!(op.secrets.lock().unwrap().is_empty());
        assert_eq!(
            *op.config_maps.lock().unwrap(),
            vec![
                "nocalhost-depends-do-not-overwrite-b".to_string(),
                "kube-root-ca.crt".to_string()
            ]
        );

        // already gone
        meta.delete(&op).await.unwrap();
    }
}
