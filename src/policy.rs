use std::collections::BTreeMap;
use std::fmt;

pub static ANNOTATION_ENABLED: &str = "image-updater.k8s.io/enabled";
pub static ANNOTATION_MODE: &str = "image-updater.k8s.io/mode";
pub static ANNOTATION_CONTAINER: &str = "image-updater.k8s.io/container";
pub static ANNOTATION_ALLOW_TAGS: &str = "image-updater.k8s.io/allow-tags";
pub static ANNOTATION_LAST_DIGEST: &str = "image-updater.k8s.io/last-digest";
pub static KUBECTL_ROLLOUT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

static REGEXP_PREFIX: &str = "regexp:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateMode {
    /// Highest semantic version tag
    Release,
    /// Lexicographically greatest tag
    Alphabetical,
    /// Pin the digest currently behind a watched tag
    Digest,
    /// Restart when the digest behind the running tag changes
    Latest,
    Unknown(String),
}

impl UpdateMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim).unwrap_or_default() {
            "" | "release" => UpdateMode::Release,
            "alphabetical" | "name" => UpdateMode::Alphabetical,
            "digest" => UpdateMode::Digest,
            "latest" => UpdateMode::Latest,
            other => UpdateMode::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateMode::Release => write!(f, "release"),
            UpdateMode::Alphabetical => write!(f, "alphabetical"),
            UpdateMode::Digest => write!(f, "digest"),
            UpdateMode::Latest => write!(f, "latest"),
            UpdateMode::Unknown(mode) => write!(f, "{}", mode),
        }
    }
}

/// The `allow-tags` annotation: a `regexp:` filter or a literal tag to watch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AllowTags {
    #[default]
    Any,
    Pattern(String),
    Tag(String),
}

impl AllowTags {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim).unwrap_or_default() {
            "" => AllowTags::Any,
            value => match value.strip_prefix(REGEXP_PREFIX) {
                Some(pattern) => AllowTags::Pattern(pattern.to_string()),
                None => AllowTags::Tag(value.to_string()),
            },
        }
    }

    /// Pattern for tag filtering, empty when no `regexp:` filter is configured.
    pub fn pattern(&self) -> &str {
        match self {
            AllowTags::Pattern(pattern) => pattern,
            _ => "",
        }
    }

    /// Tag watched in digest mode.
    pub fn watched_tag(&self) -> &str {
        match self {
            AllowTags::Tag(tag) => tag,
            _ => crate::image_reference::DEFAULT_TAG,
        }
    }
}

/// Snapshot of a workload's update settings, derived fresh on every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub enabled: bool,
    pub mode: UpdateMode,
    pub container_filter: Option<String>,
    pub allow_tags: AllowTags,
    pub secret_refs: Vec<String>,
    pub last_digest: Option<String>,
}

impl UpdatePolicy {
    pub fn from_metadata(
        annotations: &BTreeMap<String, String>,
        labels: &BTreeMap<String, String>,
        secret_refs: Vec<String>,
    ) -> Self {
        let non_empty = |key: &str| {
            annotations
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            enabled: is_enabled(annotations, labels),
            mode: UpdateMode::parse(annotations.get(ANNOTATION_MODE).map(String::as_str)),
            container_filter: non_empty(ANNOTATION_CONTAINER),
            allow_tags: AllowTags::parse(annotations.get(ANNOTATION_ALLOW_TAGS).map(String::as_str)),
            secret_refs,
            last_digest: non_empty(ANNOTATION_LAST_DIGEST),
        }
    }

    pub fn applies_to(&self, container_name: &str) -> bool {
        self.container_filter
            .as_deref()
            .is_none_or(|filter| filter == container_name)
    }
}

/// The enable switch may be set as annotation or as label.
pub fn is_enabled(annotations: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    [annotations.get(ANNOTATION_ENABLED), labels.get(ANNOTATION_ENABLED)]
        .into_iter()
        .flatten()
        .any(|value| value.trim().eq_ignore_ascii_case("true"))
}
