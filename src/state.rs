use crate::config::{Config, NamespaceFilter};
use crate::credentials::{CredentialResolver, KubeSecretSource};
use crate::oci_registry::HttpRegistry;
use crate::workload::KubeWorkloadStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct ControllerContext {
    pub(crate) kube_client: kube::Client,
    pub(crate) config: Arc<Config>,
    pub(crate) registry: HttpRegistry,
    pub(crate) namespace_filter: NamespaceFilter,
}

impl ControllerContext {
    pub fn credential_resolver(&self) -> CredentialResolver<KubeSecretSource> {
        CredentialResolver::new(KubeSecretSource::new(self.kube_client.clone()))
    }

    pub fn workload_store(&self) -> KubeWorkloadStore {
        KubeWorkloadStore::new(self.kube_client.clone())
    }
}
