use crate::evaluator::ContainerMutation;
use crate::policy::{ANNOTATION_LAST_DIGEST, KUBECTL_ROLLOUT_ANNOTATION, UpdatePolicy, is_enabled};
use anyhow::Context;
use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;
use thiserror::Error;

pub static FIELD_MANAGER: &str = "kube-image-updater";
static PULL_POLICY_ALWAYS: &str = "Always";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployment" => Ok(WorkloadKind::Deployment),
            "statefulset" => Ok(WorkloadKind::StatefulSet),
            "daemonset" => Ok(WorkloadKind::DaemonSet),
            other => Err(format!(
                "kind must be one of: deployment, statefulset, daemonset (got {})",
                other
            )),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "deployment"),
            WorkloadKind::StatefulSet => write!(f, "statefulset"),
            WorkloadKind::DaemonSet => write!(f, "daemonset"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignError {
    #[error("{kind} has no containers")]
    NoContainers { kind: &'static str },
    #[error("container {container} not found in {kind}")]
    ContainerNotFound {
        container: String,
        kind: &'static str,
    },
}

/// Outcome of pointing a container at an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageAssignment {
    /// Same image with `imagePullPolicy: Always`, the pods are restarted to pull it again
    Restarted { container: String },
    Updated { container: String },
    UpToDate { container: String },
}

impl ImageAssignment {
    pub fn changed(&self) -> bool {
        !matches!(self, ImageAssignment::UpToDate { .. })
    }
}

/// A pod-template based workload the updater can evaluate and write back.
pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("workload")
    }
    fn pod_template(&self) -> Option<&PodTemplateSpec>;
    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec>;

    fn containers(&self) -> &[Container] {
        self.pod_template()
            .and_then(|t| t.spec.as_ref())
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default()
    }

    fn container_mut(&mut self, name: &str) -> Option<&mut Container> {
        self.pod_template_mut()
            .and_then(|t| t.spec.as_mut())
            .and_then(|spec| spec.containers.iter_mut().find(|c| c.name == name))
    }

    fn image_pull_secrets(&self) -> Vec<String> {
        self.pod_template()
            .and_then(|t| t.spec.as_ref())
            .and_then(|ps| ps.image_pull_secrets.as_ref())
            .map(|secrets| secrets.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    fn update_enabled(&self) -> bool {
        is_enabled(self.annotations(), self.labels())
    }

    /// Policy snapshot from the current state of this object.
    fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy::from_metadata(self.annotations(), self.labels(), self.image_pull_secrets())
    }

    fn stamp_restart(&mut self, timestamp: String) {
        if let Some(template) = self.pod_template_mut() {
            template
                .metadata
                .get_or_insert_with(Default::default)
                .annotations
                .get_or_insert_with(Default::default)
                .insert(KUBECTL_ROLLOUT_ANNOTATION.to_string(), timestamp);
        }
    }

    fn apply_mutation(&mut self, container_name: &str, mutation: &ContainerMutation) {
        if let Some(image) = &mutation.image {
            if let Some(container) = self.container_mut(container_name) {
                container.image = Some(image.clone());
            }
        }
        if let Some(digest) = &mutation.last_digest {
            self.annotations_mut()
                .insert(ANNOTATION_LAST_DIGEST.to_string(), digest.clone());
        }
        if let Some(timestamp) = &mutation.restarted_at {
            self.stamp_restart(timestamp.clone());
        }
    }

    /// Points `container` (the first container when `None`) at `image`, bypassing any policy.
    fn assign_image(
        &mut self,
        container: Option<&str>,
        image: &str,
    ) -> Result<ImageAssignment, AssignError> {
        let kind = Self::kind_name();
        let name = match container.filter(|c| !c.is_empty()) {
            Some(name) => name.to_string(),
            None => self
                .containers()
                .first()
                .map(|c| c.name.clone())
                .ok_or(AssignError::NoContainers { kind })?,
        };

        let target = self
            .container_mut(&name)
            .ok_or_else(|| AssignError::ContainerNotFound {
                container: name.clone(),
                kind,
            })?;

        if target.image.as_deref() != Some(image) {
            target.image = Some(image.to_string());
            return Ok(ImageAssignment::Updated { container: name });
        }
        if target.image_pull_policy.as_deref() == Some(PULL_POLICY_ALWAYS) {
            self.stamp_restart(Utc::now().to_rfc3339());
            return Ok(ImageAssignment::Restarted { container: name });
        }
        Ok(ImageAssignment::UpToDate { container: name })
    }
}

impl Workload for Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl Workload for StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

impl Workload for DaemonSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.spec.as_mut().map(|s| &mut s.template)
    }
}

/// Cluster-wide read and write access to workloads.
pub trait WorkloadStore {
    async fn list<W: Workload>(&self) -> anyhow::Result<Vec<W>>;

    /// Writes the whole object back. A concurrent change surfaces as a conflict error.
    async fn replace<W: Workload>(&self, workload: &W) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct KubeWorkloadStore {
    client: Client,
}

impl KubeWorkloadStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl WorkloadStore for KubeWorkloadStore {
    async fn list<W: Workload>(&self) -> anyhow::Result<Vec<W>> {
        let api: Api<W> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list {} objects", W::kind_name()))?;
        Ok(list.items)
    }

    async fn replace<W: Workload>(&self, workload: &W) -> anyhow::Result<()> {
        let namespace = workload.namespace().unwrap_or_default();
        let name = workload.name_any();
        let api: Api<W> = Api::namespaced(self.client.clone(), &namespace);
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(&name, &pp, workload)
            .await
            .with_context(|| format!("Failed to replace {} {}/{}", W::kind_name(), namespace, name))?;
        Ok(())
    }
}
