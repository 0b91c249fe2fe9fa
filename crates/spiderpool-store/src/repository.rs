use crate::event::ResourceEvent;
use crate::store::Store;
use crate::{Result, StoreError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use spiderpool_core::Resource;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Thin typed repository over the store with a uniform
/// Get/List/Create/Update/UpdateStatus/Delete surface.
///
/// Writes are conditional on the resourceVersion the caller read; a losing
/// writer gets `StoreError::Conflict` and is expected to re-read and retry
/// (see [`crate::retry`]).
pub struct Repository<T: Resource> {
    store: Arc<Store>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Resource> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> Repository<T> {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Storage key for one resource
    fn key(namespace: Option<&str>, name: &str) -> Result<String> {
        if T::NAMESPACED {
            let ns = namespace.ok_or_else(|| {
                StoreError::invalid_key(format!("{} is namespaced, no namespace given", T::KIND))
            })?;
            Ok(format!("{}/{}/{}/{}", T::API_VERSION, T::KIND, ns, name))
        } else {
            Ok(format!("{}/{}/{}", T::API_VERSION, T::KIND, name))
        }
    }

    fn key_of(resource: &T) -> Result<String> {
        Self::key(resource.namespace(), resource.name())
    }

    fn prefix(namespace: Option<&str>) -> String {
        match (T::NAMESPACED, namespace) {
            (true, Some(ns)) => format!("{}/{}/{}/", T::API_VERSION, T::KIND, ns),
            _ => format!("{}/{}/", T::API_VERSION, T::KIND),
        }
    }

    /// Decode a stored value, stamping the authoritative revision into
    /// `metadata.resourceVersion` (the stored copy's own field is stale by
    /// one write).
    fn decode(data: &[u8], revision: u64) -> Result<T> {
        let mut resource: T = serde_json::from_slice(data)?;
        resource.set_resource_version(revision);
        Ok(resource)
    }

    /// Get a resource; `NotFound` if absent
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Result<T> {
        let key = Self::key(namespace, name)?;
        let value = self
            .store
            .kv
            .get(&key)?
            .ok_or_else(|| StoreError::not_found(&key))?;
        Self::decode(&value.data, value.revision)
    }

    /// Get a resource; `None` if absent
    pub fn try_get(&self, namespace: Option<&str>, name: &str) -> Result<Option<T>> {
        match self.get(namespace, name) {
            Ok(resource) => Ok(Some(resource)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List resources, optionally within one namespace
    pub fn list(&self, namespace: Option<&str>) -> Result<Vec<T>> {
        let prefix = Self::prefix(namespace);
        let entries = self.store.kv.scan_prefix(&prefix)?;

        let mut resources = Vec::with_capacity(entries.len());
        for (_key, value) in entries {
            resources.push(Self::decode(&value.data, value.revision)?);
        }
        debug!("Listed {} {} resources", resources.len(), T::KIND);
        Ok(resources)
    }

    /// Create a resource, assigning a UID and creation timestamp
    pub fn create(&self, resource: &T) -> Result<T> {
        let key = Self::key_of(resource)?;

        let mut resource = resource.clone();
        if resource.uid().is_none() {
            resource.metadata_mut().uid = Some(Uuid::new_v4().to_string());
        }
        if resource.metadata().creation_timestamp.is_none() {
            resource.metadata_mut().creation_timestamp = Some(Time(chrono::Utc::now()));
        }

        let data = serde_json::to_vec(&resource)?;
        let revision = self.store.kv.insert(&key, &data)?;
        resource.set_resource_version(revision);

        debug!("Created {} '{}' at revision {}", T::KIND, key, revision);
        if let Ok(object) = serde_json::to_value(&resource) {
            self.store.publish(ResourceEvent::added(
                T::KIND,
                resource.namespace(),
                resource.name(),
                object,
                revision,
            ));
        }
        Ok(resource)
    }

    /// Replace a resource, conditional on its resourceVersion
    pub fn update(&self, resource: &T) -> Result<T> {
        let key = Self::key_of(resource)?;
        let expected = resource
            .resource_version()
            .ok_or_else(|| StoreError::MissingRevision { key: key.clone() })?;

        let data = serde_json::to_vec(resource)?;
        let revision = self.store.kv.update(&key, &data, expected)?;

        let mut updated = resource.clone();
        updated.set_resource_version(revision);

        debug!("Updated {} '{}' at revision {}", T::KIND, key, revision);
        if let Ok(object) = serde_json::to_value(&updated) {
            self.store.publish(ResourceEvent::modified(
                T::KIND,
                updated.namespace(),
                updated.name(),
                object,
                revision,
            ));
        }
        Ok(updated)
    }

    /// Replace only `.status`, preserving the stored `.spec` and metadata.
    /// Conditional on the caller's resourceVersion like `update`.
    pub fn update_status(&self, resource: &T) -> Result<T> {
        let key = Self::key_of(resource)?;
        let expected = resource
            .resource_version()
            .ok_or_else(|| StoreError::MissingRevision { key: key.clone() })?;

        let stored = self
            .store
            .kv
            .get(&key)?
            .ok_or_else(|| StoreError::not_found(&key))?;

        let mut merged: serde_json::Value = serde_json::from_slice(&stored.data)?;
        let incoming = serde_json::to_value(resource)?;
        match incoming.get("status") {
            Some(status) => merged["status"] = status.clone(),
            None => {
                if let Some(obj) = merged.as_object_mut() {
                    obj.remove("status");
                }
            }
        }

        let data = serde_json::to_vec(&merged)?;
        let revision = self.store.kv.update(&key, &data, expected)?;

        let mut updated: T = serde_json::from_value(merged.clone())?;
        updated.set_resource_version(revision);

        debug!(
            "Updated status of {} '{}' at revision {}",
            T::KIND,
            key,
            revision
        );
        self.store.publish(ResourceEvent::modified(
            T::KIND,
            updated.namespace(),
            updated.name(),
            merged,
            revision,
        ));
        Ok(updated)
    }

    /// Delete a resource unconditionally
    pub fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = Self::key(namespace, name)?;

        let last = self.store.kv.get(&key)?;
        self.store.kv.delete(&key, None)?;

        debug!("Deleted {} '{}'", T::KIND, key);
        if let Some(value) = last {
            if let Ok(object) = serde_json::from_slice(&value.data) {
                self.store.publish(ResourceEvent::deleted(
                    T::KIND,
                    namespace,
                    name,
                    object,
                    value.revision,
                ));
            }
        }
        Ok(())
    }
}
