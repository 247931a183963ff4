use crate::image_reference::canonical_registry_host;
use crate::secret_string::SecretString;
use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CFG_TYPE: &str = "kubernetes.io/dockercfg";
const DOCKER_CFG_KEY: &str = ".dockercfg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCredentials {
    Anonymous,
    Basic {
        username: String,
        password: SecretString,
    },
}

impl RegistryCredentials {
    /// Basic credentials need both parts, anything less is anonymous access.
    pub fn new(username: &str, password: &str) -> Self {
        if username.is_empty() || password.is_empty() {
            RegistryCredentials::Anonymous
        } else {
            RegistryCredentials::Basic {
                username: username.to_string(),
                password: SecretString::new(password.to_string()),
            }
        }
    }
}

/// Read access to the pull secrets of a namespace.
pub trait SecretSource {
    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Secret>;
}

#[derive(Clone)]
pub struct KubeSecretSource {
    client: Client,
}

impl KubeSecretSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl SecretSource for KubeSecretSource {
    async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Secret> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets
            .get(name)
            .await
            .with_context(|| format!("Failed to get secret {}/{}", namespace, name))
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfigEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    auth: String,
}

#[derive(Debug, Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, DockerConfigEntry>,
}

pub struct CredentialResolver<S> {
    secrets: S,
}

impl<S: SecretSource> CredentialResolver<S> {
    pub fn new(secrets: S) -> Self {
        Self { secrets }
    }

    /// Walks `secret_names` in order and returns the first credentials stored for `registry`.
    ///
    /// Never fails: unreadable or unrelated secrets are skipped and the result degrades to
    /// anonymous access.
    pub async fn resolve(
        &self,
        registry: &str,
        namespace: &str,
        secret_names: &[String],
    ) -> RegistryCredentials {
        for secret_name in secret_names {
            let secret = match self.secrets.get_secret(namespace, secret_name).await {
                Ok(secret) => secret,
                Err(e) => {
                    debug!(
                        "Skipping secret {}/{}, it could not be read: {:?}",
                        namespace, secret_name, e
                    );
                    continue;
                }
            };

            let auths = match docker_auths(&secret) {
                Ok(Some(auths)) => auths,
                Ok(None) => {
                    debug!(
                        "Skipping secret {}/{}, it is not a registry credential secret",
                        namespace, secret_name
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        "Skipping secret {}/{}, failed to parse docker config: {:?}",
                        namespace, secret_name, e
                    );
                    continue;
                }
            };

            let Some(entry) = auths
                .iter()
                .find(|(host, _)| normalize_host(host) == normalize_host(registry))
                .map(|(_, entry)| entry)
            else {
                continue;
            };

            match entry_credentials(entry) {
                Ok(credentials) => {
                    debug!(
                        "Found credentials for registry {} in secret {}/{}",
                        registry, namespace, secret_name
                    );
                    return credentials;
                }
                Err(e) => {
                    warn!(
                        "Failed to decode auth for registry {} in secret {}/{}, skipping: {:?}",
                        registry, namespace, secret_name, e
                    );
                }
            }
        }

        debug!(
            "No credentials found for registry {}, using anonymous access",
            registry
        );
        RegistryCredentials::Anonymous
    }
}

/// Returns the host-keyed entries of a registry credential secret, or `None` for other secrets.
fn docker_auths(secret: &Secret) -> anyhow::Result<Option<BTreeMap<String, DockerConfigEntry>>> {
    let (key, legacy) = match secret.type_.as_deref() {
        Some(DOCKER_CONFIG_JSON_TYPE) => (DOCKER_CONFIG_JSON_KEY, false),
        Some(DOCKER_CFG_TYPE) => (DOCKER_CFG_KEY, true),
        _ => return Ok(None),
    };

    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .with_context(|| format!("Secret does not contain key {}", key))?;

    let auths = if legacy {
        serde_json::from_slice::<BTreeMap<String, DockerConfigEntry>>(&data.0)?
    } else {
        serde_json::from_slice::<DockerConfigJson>(&data.0)?.auths
    };
    Ok(Some(auths))
}

fn entry_credentials(entry: &DockerConfigEntry) -> anyhow::Result<RegistryCredentials> {
    if entry.auth.is_empty() {
        return Ok(RegistryCredentials::new(&entry.username, &entry.password));
    }

    let decoded = STANDARD
        .decode(entry.auth.trim())
        .context("auth is not valid base64")?;
    let decoded = String::from_utf8(decoded).context("auth is not valid UTF-8")?;
    match decoded.split_once(':') {
        Some((username, password)) => Ok(RegistryCredentials::new(username, password)),
        None => Ok(RegistryCredentials::new(&entry.username, &entry.password)),
    }
}

/// `https://index.docker.io/v1/` and `docker.io` name the same registry.
fn normalize_host(host: &str) -> String {
    let host = host
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    canonical_registry_host(host).to_ascii_lowercase()
}
