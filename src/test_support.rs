//! In-memory stand-ins for the registry, the cluster's secrets and its workloads.

use crate::credentials::{RegistryCredentials, SecretSource};
use crate::image_reference::ImageReference;
use crate::oci_registry::RegistryAccess;
use crate::workload::{Workload, WorkloadStore};
use anyhow::{Context, Result};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Container, Secret};
use kube::ResourceExt;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeRegistry {
    tags: HashMap<String, Vec<String>>,
    digests: HashMap<String, String>,
    fail: bool,
    calls: Mutex<Vec<String>>,
    credentials: Mutex<Vec<RegistryCredentials>>,
}

impl FakeRegistry {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// `repository` is an image name without tag, e.g. `ghcr.io/org/app`.
    pub fn with_tags(mut self, repository: &str, tags: &[&str]) -> Self {
        let name = ImageReference::parse(repository).unwrap().name();
        self.tags
            .insert(name, tags.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn with_digest(mut self, image: &str, digest: &str) -> Self {
        let key = ImageReference::parse(image).unwrap().to_string();
        self.digests.insert(key, digest.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn credentials(&self) -> Vec<RegistryCredentials> {
        self.credentials.lock().unwrap().clone()
    }

    fn record(&self, call: String, credentials: &RegistryCredentials) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        self.credentials.lock().unwrap().push(credentials.clone());
        if self.fail {
            anyhow::bail!("registry unavailable");
        }
        Ok(())
    }
}

impl RegistryAccess for FakeRegistry {
    async fn list_tags(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<Vec<String>> {
        self.record(format!("tags {}", image.name()), credentials)?;
        self.tags
            .get(&image.name())
            .cloned()
            .with_context(|| format!("repository {} not found", image.name()))
    }

    async fn get_digest(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<String> {
        self.record(format!("digest {}", image), credentials)?;
        self.digests
            .get(&image.to_string())
            .cloned()
            .with_context(|| format!("manifest {} not found", image))
    }
}

#[derive(Default)]
pub struct StaticSecrets {
    secrets: BTreeMap<(String, String), Secret>,
}

impl StaticSecrets {
    pub fn with(mut self, namespace: &str, name: &str, secret: Secret) -> Self {
        self.secrets
            .insert((namespace.to_string(), name.to_string()), secret);
        self
    }
}

impl SecretSource for StaticSecrets {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .with_context(|| format!("secrets \"{}\" not found", name))
    }
}

/// Workloads of any kind, listed by type. Replace calls are recorded as `namespace/name`.
#[derive(Default)]
pub struct FakeWorkloadStore {
    objects: Vec<Box<dyn Any + Send + Sync>>,
    failing_lists: BTreeSet<&'static str>,
    failing_replaces: BTreeSet<String>,
    replace_calls: Mutex<Vec<String>>,
    replaced: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
}

impl FakeWorkloadStore {
    pub fn with<W: Workload>(mut self, workload: W) -> Self {
        self.objects.push(Box::new(workload));
        self
    }

    pub fn failing_list<W: Workload>(mut self) -> Self {
        self.failing_lists.insert(W::kind_name());
        self
    }

    /// Every replace of an object called `name` fails.
    pub fn failing_replace(mut self, name: &str) -> Self {
        self.failing_replaces.insert(name.to_string());
        self
    }

    pub fn replace_calls(&self) -> Vec<String> {
        self.replace_calls.lock().unwrap().clone()
    }

    /// Objects of kind `W` that were written successfully, in write order.
    pub fn replaced<W: Workload>(&self) -> Vec<W> {
        self.replaced
            .lock()
            .unwrap()
            .iter()
            .filter_map(|object| object.downcast_ref::<W>())
            .cloned()
            .collect()
    }
}

impl WorkloadStore for FakeWorkloadStore {
    async fn list<W: Workload>(&self) -> Result<Vec<W>> {
        if self.failing_lists.contains(W::kind_name()) {
            anyhow::bail!("Failed to list {} objects", W::kind_name());
        }
        Ok(self
            .objects
            .iter()
            .filter_map(|object| object.downcast_ref::<W>())
            .cloned()
            .collect())
    }

    async fn replace<W: Workload>(&self, workload: &W) -> Result<()> {
        let name = workload.name_any();
        self.replace_calls.lock().unwrap().push(format!(
            "{}/{}",
            workload.namespace().unwrap_or_default(),
            name
        ));
        if self.failing_replaces.contains(&name) {
            anyhow::bail!("Operation cannot be fulfilled on {}: the object has been modified", name);
        }
        self.replaced.lock().unwrap().push(Box::new(workload.clone()));
        Ok(())
    }
}

pub fn docker_config_secret(json: &str) -> Secret {
    Secret {
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(BTreeMap::from([(
            ".dockerconfigjson".to_string(),
            ByteString(json.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

pub fn opaque_secret() -> Secret {
    Secret {
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            "password".to_string(),
            ByteString(b"hunter2".to_vec()),
        )])),
        ..Default::default()
    }
}

pub fn container(name: &str, image: &str, image_pull_policy: Option<&str>) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: image_pull_policy.map(str::to_string),
        ..Default::default()
    }
}
