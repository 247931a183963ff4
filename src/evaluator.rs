use crate::credentials::{CredentialResolver, RegistryCredentials, SecretSource};
use crate::image_reference::{ImageReference, ParseError};
use crate::oci_registry::RegistryAccess;
use crate::policy::{UpdateMode, UpdatePolicy};
use crate::tags;
use chrono::Utc;
use k8s_openapi::api::core::v1::Container;
use thiserror::Error;
use tracing::{debug, info, warn};

static PULL_POLICY_ALWAYS: &str = "Always";

#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error("failed to parse image {image}: {source}")]
    InvalidReference { image: String, source: ParseError },
    #[error("invalid allow-tags regex {pattern}: {source}")]
    InvalidFilterPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("registry request for {image} failed: {reason:#}")]
    Registry { image: String, reason: anyhow::Error },
}

impl EvaluateError {
    /// Bad input on the workload itself, as opposed to a remote failure that may heal.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            EvaluateError::InvalidReference { .. } | EvaluateError::InvalidFilterPattern { .. }
        )
    }
}

/// Changes one container's evaluation asks for. The caller applies them to its own copy of the
/// workload before writing it back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMutation {
    pub image: Option<String>,
    pub last_digest: Option<String>,
    pub restarted_at: Option<String>,
}

impl ContainerMutation {
    fn with_image(image: String) -> Self {
        Self {
            image: Some(image),
            ..Default::default()
        }
    }

    pub fn restart_required(&self) -> bool {
        self.restarted_at.is_some()
    }
}

pub struct Evaluator<'a, R, S> {
    registry: &'a R,
    credentials: &'a CredentialResolver<S>,
}

impl<'a, R: RegistryAccess, S: SecretSource> Evaluator<'a, R, S> {
    pub fn new(registry: &'a R, credentials: &'a CredentialResolver<S>) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    /// Decides whether `container` needs a new image or a restart under `policy`.
    ///
    /// `Ok(None)` means nothing to do this pass. Errors are scoped to this container, the caller
    /// logs them and moves on.
    pub async fn evaluate(
        &self,
        container: &Container,
        policy: &UpdatePolicy,
        namespace: &str,
    ) -> Result<Option<ContainerMutation>, EvaluateError> {
        if !policy.enabled {
            debug!("Auto-update not enabled for container {}", container.name);
            return Ok(None);
        }
        if !policy.applies_to(&container.name) {
            debug!(
                "Container {} does not match target container {}",
                container.name,
                policy.container_filter.as_deref().unwrap_or_default()
            );
            return Ok(None);
        }
        if let UpdateMode::Unknown(mode) = &policy.mode {
            warn!(
                "Unknown update mode {} for container {}, skipping",
                mode, container.name
            );
            return Ok(None);
        }
        if policy.mode == UpdateMode::Latest
            && container.image_pull_policy.as_deref() != Some(PULL_POLICY_ALWAYS)
        {
            warn!(
                "Container {} is in latest mode but imagePullPolicy is not Always, skipping update",
                container.name
            );
            return Ok(None);
        }

        let image = container.image.as_deref().unwrap_or_default();
        let reference =
            ImageReference::parse(image).map_err(|source| EvaluateError::InvalidReference {
                image: image.to_string(),
                source,
            })?;

        let credentials = self
            .credentials
            .resolve(&reference.registry, namespace, &policy.secret_refs)
            .await;

        debug!(
            "Using update mode {} for container {}",
            policy.mode, container.name
        );

        let mutation = match &policy.mode {
            UpdateMode::Release => self
                .check_tags(
                    &reference,
                    &credentials,
                    policy.allow_tags.pattern(),
                    tags::sort_version_descending,
                )
                .await?
                .map(ContainerMutation::with_image),
            UpdateMode::Alphabetical => self
                .check_tags(
                    &reference,
                    &credentials,
                    policy.allow_tags.pattern(),
                    tags::sort_alphabetical_descending,
                )
                .await?
                .map(ContainerMutation::with_image),
            UpdateMode::Digest => self
                .check_digest(&reference, &credentials, policy.allow_tags.watched_tag())
                .await?
                .map(ContainerMutation::with_image),
            UpdateMode::Latest => {
                self.check_latest(&reference, &credentials, policy.last_digest.as_deref())
                    .await?
            }
            UpdateMode::Unknown(_) => None,
        };

        if let Some(new_image) = mutation.as_ref().and_then(|m| m.image.as_deref()) {
            info!(
                "Updating image for container {} from {} to {}",
                container.name, image, new_image
            );
        }
        Ok(mutation)
    }

    /// Release and alphabetical mode: move to the first tag of `order` when it is not the current one.
    async fn check_tags(
        &self,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
        pattern: &str,
        order: fn(&[String]) -> Vec<String>,
    ) -> Result<Option<String>, EvaluateError> {
        let tags = self
            .registry
            .list_tags(reference, credentials)
            .await
            .map_err(|reason| EvaluateError::Registry {
                image: reference.to_string(),
                reason,
            })?;
        debug!("Found {} tags for image {}", tags.len(), reference);

        let tags = tags::filter_by_regex(tags, pattern).map_err(|source| {
            EvaluateError::InvalidFilterPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;

        match order(&tags).first() {
            Some(top) if Some(top.as_str()) != reference.tag.as_deref() => {
                debug!(
                    "Current tag: {}, latest tag: {}",
                    reference.tag.as_deref().unwrap_or("<none>"),
                    top
                );
                Ok(Some(reference.format(Some(top), None)))
            }
            _ => Ok(None),
        }
    }

    /// Digest mode: pin the digest currently behind `watched_tag`. The result is digest-addressed.
    async fn check_digest(
        &self,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
        watched_tag: &str,
    ) -> Result<Option<String>, EvaluateError> {
        let watched = reference.with_tag(watched_tag);
        let new_digest = self
            .registry
            .get_digest(&watched, credentials)
            .await
            .map_err(|reason| EvaluateError::Registry {
                image: watched.to_string(),
                reason,
            })?;

        debug!(
            "Checking digest for {}. Current digest: {}, new digest from registry: {}",
            watched,
            reference.digest.as_deref().unwrap_or("<none>"),
            new_digest
        );
        if reference.digest.as_deref() == Some(new_digest.as_str()) {
            return Ok(None);
        }
        Ok(Some(reference.format(None, Some(&new_digest))))
    }

    /// Latest mode: the image string stays, a changed digest behind it triggers a restart.
    ///
    /// The first observation (no stored digest) also counts as a change, so the stored state and
    /// the running pods converge on the first pass.
    async fn check_latest(
        &self,
        reference: &ImageReference,
        credentials: &RegistryCredentials,
        last_digest: Option<&str>,
    ) -> Result<Option<ContainerMutation>, EvaluateError> {
        let new_digest = self
            .registry
            .get_digest(reference, credentials)
            .await
            .map_err(|reason| EvaluateError::Registry {
                image: reference.to_string(),
                reason,
            })?;

        match last_digest {
            Some(last) if last == new_digest => return Ok(None),
            Some(last) => info!(
                "New digest detected for {}: {} -> {}",
                reference, last, new_digest
            ),
            None => debug!(
                "First time seeing image {}, storing digest {}",
                reference, new_digest
            ),
        }

        Ok(Some(ContainerMutation {
            image: None,
            last_digest: Some(new_digest),
            restarted_at: Some(Utc::now().to_rfc3339()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{
        ANNOTATION_ALLOW_TAGS, ANNOTATION_CONTAINER, ANNOTATION_ENABLED, ANNOTATION_LAST_DIGEST,
        ANNOTATION_MODE,
    };
    use crate::test_support::{FakeRegistry, StaticSecrets, container, docker_config_secret};
    use std::collections::BTreeMap;

    fn policy(entries: &[(&str, &str)]) -> UpdatePolicy {
        let mut annotations: BTreeMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        annotations
            .entry(ANNOTATION_ENABLED.to_string())
            .or_insert_with(|| "true".to_string());
        UpdatePolicy::from_metadata(&annotations, &BTreeMap::new(), Vec::new())
    }

    async fn evaluate(
        registry: &FakeRegistry,
        container: &Container,
        policy: &UpdatePolicy,
    ) -> Result<Option<ContainerMutation>, EvaluateError> {
        let resolver = CredentialResolver::new(StaticSecrets::default());
        Evaluator::new(registry, &resolver)
            .evaluate(container, policy, "default")
            .await
    }

    #[tokio::test]
    async fn test_release_mode_proposes_highest_version() {
        let registry = FakeRegistry::default().with_tags(
            "ghcr.io/org/app",
            &["1.0.0", "1.2.0", "1.10.0", "latest", "1.10.0-rc.1"],
        );
        let app = container("app", "ghcr.io/org/app:1.2.0", None);
        let mutation = evaluate(&registry, &app, &policy(&[(ANNOTATION_MODE, "release")]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(mutation.image.as_deref(), Some("ghcr.io/org/app:1.10.0"));
        assert_eq!(mutation.last_digest, None);
        assert!(!mutation.restart_required());
    }

    #[tokio::test]
    async fn test_release_mode_moves_to_four_segment_version() {
        let registry =
            FakeRegistry::default().with_tags("ghcr.io/org/app", &["1.2.2", "1.2.3", "1.2.3.1"]);
        let app = container("app", "ghcr.io/org/app:1.2.3", None);
        let mutation = evaluate(&registry, &app, &policy(&[]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(mutation.image.as_deref(), Some("ghcr.io/org/app:1.2.3.1"));
    }

    #[tokio::test]
    async fn test_release_mode_is_idempotent() {
        let registry =
            FakeRegistry::default().with_tags("ghcr.io/org/app", &["1.0.0", "1.2.0", "v1.10.0"]);
        let release = policy(&[]);

        let first = evaluate(&registry, &container("app", "ghcr.io/org/app:1.0.0", None), &release)
            .await
            .unwrap()
            .unwrap();
        let updated = first.image.unwrap();
        assert_eq!(updated, "ghcr.io/org/app:v1.10.0");

        for _ in 0..3 {
            let again = evaluate(&registry, &container("app", &updated, None), &release)
                .await
                .unwrap();
            assert_eq!(again, None);
        }
    }

    #[tokio::test]
    async fn test_release_mode_applies_regex_filter() {
        let registry =
            FakeRegistry::default().with_tags("ghcr.io/org/app", &["1.0", "2.0-beta", "v3"]);
        let filtered = policy(&[(ANNOTATION_ALLOW_TAGS, "regexp:^[0-9.]+$")]);

        let mutation = evaluate(&registry, &container("app", "ghcr.io/org/app:0.9", None), &filtered)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mutation.image.as_deref(), Some("ghcr.io/org/app:1.0"));
    }

    #[tokio::test]
    async fn test_release_mode_literal_allow_tags_is_not_a_filter() {
        let registry = FakeRegistry::default().with_tags("ghcr.io/org/app", &["1.0", "2.0"]);
        let literal = policy(&[(ANNOTATION_ALLOW_TAGS, "1.0")]);

        let mutation = evaluate(&registry, &container("app", "ghcr.io/org/app:1.0", None), &literal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mutation.image.as_deref(), Some("ghcr.io/org/app:2.0"));
    }

    #[tokio::test]
    async fn test_release_mode_without_versions_is_noop() {
        let registry = FakeRegistry::default().with_tags("ghcr.io/org/app", &["latest", "main"]);
        let result = evaluate(&registry, &container("app", "ghcr.io/org/app:main", None), &policy(&[]))
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_invalid_filter_pattern_is_malformed_input() {
        let registry = FakeRegistry::default().with_tags("ghcr.io/org/app", &["1.0"]);
        let broken = policy(&[(ANNOTATION_ALLOW_TAGS, "regexp:^[0-9")]);

        let error = evaluate(&registry, &container("app", "ghcr.io/org/app:1.0", None), &broken)
            .await
            .unwrap_err();
        assert!(matches!(error, EvaluateError::InvalidFilterPattern { .. }));
        assert!(error.is_malformed_input());
    }

    #[tokio::test]
    async fn test_alphabetical_mode_and_name_alias() {
        let registry = FakeRegistry::default().with_tags(
            "docker.io/library/nginx",
            &["2024-01-05", "2024-02-01", "2023-12-31"],
        );
        let current = container("web", "nginx:2024-01-05", None);

        for mode in ["alphabetical", "name"] {
            let mutation = evaluate(&registry, &current, &policy(&[(ANNOTATION_MODE, mode)]))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                mutation.image.as_deref(),
                Some("docker.io/library/nginx:2024-02-01")
            );
        }

        let newest = container("web", "docker.io/library/nginx:2024-02-01", None);
        let result = evaluate(&registry, &newest, &policy(&[(ANNOTATION_MODE, "name")]))
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_digest_mode_defaults_to_latest_tag_and_drops_tag() {
        let registry =
            FakeRegistry::default().with_digest("ghcr.io/org/app:latest", "sha256:BBB");
        let pinned = container("app", "ghcr.io/org/app@sha256:AAA", None);

        let mutation = evaluate(&registry, &pinned, &policy(&[(ANNOTATION_MODE, "digest")]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mutation.image.as_deref(), Some("ghcr.io/org/app@sha256:BBB"));
        assert_eq!(registry.calls(), vec!["digest ghcr.io/org/app:latest"]);

        let converged = container("app", "ghcr.io/org/app@sha256:BBB", None);
        let result = evaluate(&registry, &converged, &policy(&[(ANNOTATION_MODE, "digest")]))
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_digest_mode_watches_literal_tag() {
        let registry =
            FakeRegistry::default().with_digest("ghcr.io/org/app:stable", "sha256:CCC");
        let tagged = container("app", "ghcr.io/org/app:1.0", None);
        let stable = policy(&[(ANNOTATION_MODE, "digest"), (ANNOTATION_ALLOW_TAGS, "stable")]);

        let mutation = evaluate(&registry, &tagged, &stable).await.unwrap().unwrap();
        assert_eq!(mutation.image.as_deref(), Some("ghcr.io/org/app@sha256:CCC"));
    }

    #[tokio::test]
    async fn test_digest_mode_regex_allow_tags_watches_latest() {
        let registry =
            FakeRegistry::default().with_digest("ghcr.io/org/app:latest", "sha256:DDD");
        let regex = policy(&[(ANNOTATION_MODE, "digest"), (ANNOTATION_ALLOW_TAGS, "regexp:.*")]);

        let mutation = evaluate(&registry, &container("app", "ghcr.io/org/app:1.0", None), &regex)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mutation.image.as_deref(), Some("ghcr.io/org/app@sha256:DDD"));
    }

    // Documented default: the first observation in latest mode always reports an update and
    // restarts the workload, even though nothing about the image changed.
    #[tokio::test]
    async fn test_latest_mode_first_observation_reports_update() {
        let registry = FakeRegistry::default().with_digest("ghcr.io/org/app:latest", "sha256:AAA");
        let app = container("app", "ghcr.io/org/app:latest", Some("Always"));

        let mutation = evaluate(&registry, &app, &policy(&[(ANNOTATION_MODE, "latest")]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mutation.image, None);
        assert_eq!(mutation.last_digest.as_deref(), Some("sha256:AAA"));
        assert!(mutation.restart_required());
    }

    #[tokio::test]
    async fn test_latest_mode_changed_and_unchanged_digest() {
        let registry = FakeRegistry::default().with_digest("ghcr.io/org/app:latest", "sha256:NEW");
        let app = container("app", "ghcr.io/org/app:latest", Some("Always"));

        let stale = policy(&[(ANNOTATION_MODE, "latest"), (ANNOTATION_LAST_DIGEST, "sha256:OLD")]);
        let mutation = evaluate(&registry, &app, &stale).await.unwrap().unwrap();
        assert_eq!(mutation.image, None);
        assert_eq!(mutation.last_digest.as_deref(), Some("sha256:NEW"));
        assert!(mutation.restart_required());

        let current = policy(&[(ANNOTATION_MODE, "latest"), (ANNOTATION_LAST_DIGEST, "sha256:NEW")]);
        assert_eq!(evaluate(&registry, &app, &current).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_latest_mode_requires_pull_policy_always() {
        let registry = FakeRegistry::default().with_digest("ghcr.io/org/app:latest", "sha256:AAA");
        let latest = policy(&[(ANNOTATION_MODE, "latest")]);

        for pull_policy in [None, Some("IfNotPresent")] {
            let app = container("app", "ghcr.io/org/app:latest", pull_policy);
            assert_eq!(evaluate(&registry, &app, &latest).await.unwrap(), None);
        }
        assert!(registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_container_filter_mismatch_is_always_skipped() {
        let registries = [
            FakeRegistry::default().with_tags("ghcr.io/org/app", &["9.9.9"]),
            FakeRegistry::failing(),
        ];
        for registry in &registries {
            for mode in ["release", "alphabetical", "digest", "latest", "bogus"] {
                let filtered = policy(&[(ANNOTATION_MODE, mode), (ANNOTATION_CONTAINER, "other")]);
                let app = container("app", "ghcr.io/org/app:1.0.0", Some("Always"));
                assert_eq!(evaluate(registry, &app, &filtered).await.unwrap(), None);
            }
            assert!(registry.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_disabled_policy_is_skipped() {
        let registry = FakeRegistry::default().with_tags("ghcr.io/org/app", &["9.9.9"]);
        let disabled = policy(&[(ANNOTATION_ENABLED, "false")]);
        let app = container("app", "ghcr.io/org/app:1.0.0", None);
        assert_eq!(evaluate(&registry, &app, &disabled).await.unwrap(), None);
        assert!(registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_mode_is_a_noop() {
        let registry = FakeRegistry::failing();
        let unknown = policy(&[(ANNOTATION_MODE, "nightly")]);
        let app = container("app", "ghcr.io/org/app:1.0.0", None);
        assert_eq!(evaluate(&registry, &app, &unknown).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_reference_is_malformed_input() {
        let registry = FakeRegistry::default();
        let app = container("app", "ghcr.io/Org/App:1.0", None);
        let error = evaluate(&registry, &app, &policy(&[])).await.unwrap_err();
        assert!(matches!(error, EvaluateError::InvalidReference { .. }));
        assert!(error.is_malformed_input());
    }

    #[tokio::test]
    async fn test_registry_failure_is_not_malformed_input() {
        let registry = FakeRegistry::failing();
        let app = container("app", "ghcr.io/org/app:1.0", None);
        let error = evaluate(&registry, &app, &policy(&[])).await.unwrap_err();
        assert!(matches!(error, EvaluateError::Registry { .. }));
        assert!(!error.is_malformed_input());
    }

    #[tokio::test]
    async fn test_credentials_from_pull_secrets_reach_the_registry() {
        let registry = FakeRegistry::default().with_tags("ghcr.io/org/app", &["1.1.0"]);
        let secrets = StaticSecrets::default().with(
            "apps",
            "ghcr-pull",
            docker_config_secret(r#"{"auths":{"ghcr.io":{"username":"bot","password":"pw"}}}"#),
        );
        let resolver = CredentialResolver::new(secrets);
        let mut release = policy(&[]);
        release.secret_refs = vec!["missing".to_string(), "ghcr-pull".to_string()];

        let mutation = Evaluator::new(&registry, &resolver)
            .evaluate(&container("app", "ghcr.io/org/app:1.0.0", None), &release, "apps")
            .await
            .unwrap();
        assert!(mutation.is_some());
        assert_eq!(
            registry.credentials(),
            vec![RegistryCredentials::new("bot", "pw")]
        );
    }
}
