use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub webserver: Webserver,
    pub updater: Updater,
    pub kubeconfig: Option<PathBuf>,
    pub log_level: Option<String>,
    pub tls: Tls,
    pub registries: RegistriesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Webserver {
    pub port: u16,
    pub api_key: Option<SecretString>,
}

impl Default for Webserver {
    fn default() -> Self {
        Self {
            port: 8080,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Updater {
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    pub allowed_namespaces: Vec<String>,
}

impl Default for Updater {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5 * 60),
            allowed_namespaces: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tls {
    pub ca_certificate_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistriesConfig {
    /// Registry hosts spoken to over plain HTTP
    pub insecure: Vec<String>,
    pub enable_jfrog_artifactory_fallback: bool,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.updater.interval.is_zero() {
        anyhow::bail!("updater.interval must be greater than zero");
    }
    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    if let Some(missing) = re
        .captures_iter(input)
        .map(|caps| caps[1].to_string())
        .find(|var_name| env::var(var_name).is_err())
    {
        anyhow::bail!("Missing environment variable: {}", missing);
    }

    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_default()
    });

    Ok(result.into_owned())
}

/// Accepts `90` (seconds) or unit strings such as `500ms`, `30s`, `5m`, `1h30m`.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_duration(text: &str) -> Result<Duration> {
    let re = Regex::new(r"(\d+)(ms|s|m|h)").context("Invalid regex pattern for durations")?;
    let text = text.trim();
    if let Ok(seconds) = text.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in re.captures_iter(text) {
        let whole = caps.get(0).context("Missing duration match")?;
        if whole.start() != consumed {
            anyhow::bail!("Invalid duration: {}", text);
        }
        consumed = whole.end();

        let value: u64 = caps[1]
            .parse()
            .with_context(|| format!("Invalid duration: {}", text))?;
        total += match &caps[2] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            _ => Duration::from_secs(value * 60 * 60),
        };
    }

    if consumed == 0 || consumed != text.len() {
        anyhow::bail!("Invalid duration: {}", text);
    }
    Ok(total)
}

/// Namespaces the updater may touch. Entries are namespace names or glob patterns.
#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    globs: Option<GlobSet>,
}

impl NamespaceFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns: Vec<&str> = patterns
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            return Ok(Self { globs: None });
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("Invalid namespace pattern {}", pattern))?,
            );
        }
        Ok(Self {
            globs: Some(builder.build().context("Failed to build namespace filter")?),
        })
    }

    pub fn allows(&self, namespace: &str) -> bool {
        match &self.globs {
            Some(globs) => globs.is_match(namespace),
            None => true,
        }
    }
}
