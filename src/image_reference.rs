use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

pub const DOCKER_HUB_REGISTRY: &str = "docker.io";
pub const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
pub const DEFAULT_TAG: &str = "latest";

static DOCKER_HUB_ALIASES: [&str; 3] = [DOCKER_HUB_REGISTRY, "index.docker.io", DOCKER_HUB_API_HOST];

static REGISTRY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?$",
    )
    .unwrap()
});
static PATH_COMPONENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap());
static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").unwrap());
static DIGEST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]+$").unwrap()
});

/// A registry-qualified image name, addressed either by tag or by digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("image reference is empty")]
    Empty,
    #[error("invalid registry host: {0}")]
    InvalidRegistry(String),
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),
    #[error("invalid tag: {0}")]
    InvalidTag(String),
    #[error("invalid digest: {0}")]
    InvalidDigest(String),
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(None, None))
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        let (name_and_tag, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                if !DIGEST_REGEX.is_match(digest) {
                    return Err(ParseError::InvalidDigest(digest.to_string()));
                }
                (name, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon only starts a tag when it comes after the last slash, otherwise it is a registry port
        let last_slash = name_and_tag.rfind('/');
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                (&name_and_tag[..pos], Some(&name_and_tag[pos + 1..]))
            }
            _ => (name_and_tag, None),
        };

        if let Some(tag) = tag {
            if !TAG_REGEX.is_match(tag) {
                return Err(ParseError::InvalidTag(tag.to_string()));
            }
        }

        let (registry, path) = split_registry(name);
        if !REGISTRY_REGEX.is_match(registry) {
            return Err(ParseError::InvalidRegistry(registry.to_string()));
        }
        if path.is_empty() || !path.split('/').all(|c| PATH_COMPONENT_REGEX.is_match(c)) {
            return Err(ParseError::InvalidRepository(path.to_string()));
        }

        let registry = canonical_registry_host(registry).to_string();
        let repository = if registry == DOCKER_HUB_REGISTRY && !path.contains('/') {
            format!("library/{}", path)
        } else {
            path.to_string()
        };

        // A digest pins the content, so a tag written next to it carries no meaning
        let tag = match digest {
            Some(_) => None,
            None => Some(tag.unwrap_or(DEFAULT_TAG).to_string()),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Renders `registry/repository@digest` or `registry/repository:tag`.
    ///
    /// An explicit digest wins over everything. An explicit tag replaces both the own tag and the
    /// own digest. Without overrides the reference renders in the form it was parsed from.
    pub fn format(&self, tag: Option<&str>, digest: Option<&str>) -> String {
        let digest = digest.or(match tag {
            Some(_) => None,
            None => self.digest.as_deref(),
        });
        match digest {
            Some(digest) => format!("{}@{}", self.name(), digest),
            None => format!(
                "{}:{}",
                self.name(),
                tag.or(self.tag.as_deref()).unwrap_or(DEFAULT_TAG)
            ),
        }
    }

    /// The same repository addressed by `tag`.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Tag or digest, whichever addresses the manifest.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Host serving the distribution API for this reference.
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }
}

/// Maps the different Docker Hub host names onto `docker.io`, leaving other hosts untouched.
pub fn canonical_registry_host(host: &str) -> &str {
    if DOCKER_HUB_ALIASES.iter().any(|alias| alias.eq_ignore_ascii_case(host)) {
        DOCKER_HUB_REGISTRY
    } else {
        host
    }
}

fn split_registry(name: &str) -> (&str, &str) {
    match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first, rest)
        }
        _ => (DOCKER_HUB_REGISTRY, name),
    }
}
