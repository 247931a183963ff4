use crate::config::{Config, RegistriesConfig};
use crate::credentials::RegistryCredentials;
use crate::image_reference::ImageReference;
use anyhow::{Context, Result};
use regex::Regex;
use reqwest::header::{ACCEPT, HeaderMap, LINK, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";
const DIGEST_HEADER: &str = "Docker-Content-Digest";
const MAX_TAG_PAGES: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static CHALLENGE_PARAM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)="([^"]*)""#).unwrap());
static NEXT_LINK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).unwrap());

/// Remote operations the update policies need from a registry.
pub trait RegistryAccess {
    async fn list_tags(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<Vec<String>>;

    async fn get_digest(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<String>;
}

pub fn create_client(config: &Config) -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("kube-image-updater/", env!("CARGO_PKG_VERSION")));

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

/// Distribution API client. Holds no per-registry state, every call authenticates on its own.
#[derive(Clone)]
pub struct HttpRegistry {
    client: Client,
    insecure_registries: Vec<String>,
    enable_jfrog_artifactory_fallback: bool,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, PartialEq)]
struct Challenge {
    scheme: String,
    params: HashMap<String, String>,
}

impl HttpRegistry {
    pub fn new(client: Client, config: &RegistriesConfig) -> Self {
        Self {
            client,
            insecure_registries: config.insecure.clone(),
            enable_jfrog_artifactory_fallback: config.enable_jfrog_artifactory_fallback,
        }
    }

    fn base_url(&self, image: &ImageReference) -> String {
        let scheme = if self
            .insecure_registries
            .iter()
            .any(|host| host.eq_ignore_ascii_case(&image.registry))
        {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, image.api_host())
    }

    fn request(&self, method: Method, url: &str, accept: Option<&str>) -> RequestBuilder {
        let request = self.client.request(method, url);
        match accept {
            Some(accept) => request.header(ACCEPT, accept),
            None => request,
        }
    }

    /// Sends anonymously first and answers a `401` challenge with a bearer token or basic auth.
    async fn send(
        &self,
        method: Method,
        url: &str,
        accept: Option<&str>,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<Response> {
        debug!("Sending {} {}", method, url);
        let response = self
            .request(method.clone(), url, accept)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_challenge)
            .with_context(|| {
                format!(
                    "Registry {} requires authentication but sent no usable challenge",
                    image.registry
                )
            })?;

        let request = self.request(method, url, accept);
        let request = match challenge.scheme.as_str() {
            "bearer" => {
                let token = self.fetch_token(&challenge, image, credentials).await?;
                request.bearer_auth(token)
            }
            "basic" => match credentials {
                RegistryCredentials::Basic { username, password } => {
                    request.basic_auth(username, Some(password.expose_secret()))
                }
                RegistryCredentials::Anonymous => anyhow::bail!(
                    "Registry {} requires basic authentication but no credentials were found",
                    image.registry
                ),
            },
            other => anyhow::bail!(
                "Registry {} requested unsupported authentication scheme {}",
                image.registry,
                other
            ),
        };

        request
            .send()
            .await
            .with_context(|| format!("Failed to send authenticated request to {}", url))
    }

    async fn fetch_token(
        &self,
        challenge: &Challenge,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<String> {
        let realm = challenge
            .params
            .get("realm")
            .context("Bearer challenge does not contain a realm")?;
        let scope = challenge
            .params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", image.repository));

        let mut query = vec![("scope", scope)];
        if let Some(service) = challenge.params.get("service") {
            query.push(("service", service.clone()));
        }

        let mut request = self.client.get(realm).query(&query);
        if let RegistryCredentials::Basic { username, password } = credentials {
            request = request.basic_auth(username, Some(password.expose_secret()));
        }

        debug!("Fetching registry token from {}", realm);
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to request token from {}", realm))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Token endpoint {} returned error status {}",
                realm,
                response.status()
            );
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse token response")?;
        token
            .token
            .or(token.access_token)
            .filter(|token| !token.is_empty())
            .with_context(|| format!("Token endpoint {} returned no token", realm))
    }

    async fn fetch_manifest_digest(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
        url: &str,
    ) -> Result<String> {
        info!("Fetching manifest digest from URL {}", url);
        let response = self
            .send(Method::HEAD, url, Some(MANIFEST_MEDIA_TYPES), image, credentials)
            .await?;
        let response = ensure_success(response, image, "fetching the image manifest")?;
        if let Some(digest) = get_digest_from_headers(response.headers())? {
            return Ok(digest);
        }

        debug!("HEAD response carried no digest, retrying with GET");
        let response = self
            .send(Method::GET, url, Some(MANIFEST_MEDIA_TYPES), image, credentials)
            .await?;
        let response = ensure_success(response, image, "fetching the image manifest")?;
        get_digest_from_headers(response.headers())?
            .with_context(|| format!("Response does not contain HTTP header {}", DIGEST_HEADER))
    }
}

impl RegistryAccess for HttpRegistry {
    async fn list_tags(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<Vec<String>> {
        let base_url = self.base_url(image);
        let mut url = format!("{}/v2/{}/tags/list", base_url, image.repository);
        let mut tags = Vec::new();

        for _ in 0..MAX_TAG_PAGES {
            let response = self.send(Method::GET, &url, None, image, credentials).await?;
            let response = ensure_success(response, image, "listing tags")?;
            let next = next_page_url(response.headers(), &base_url);
            let page: TagList = response
                .json()
                .await
                .context("Failed to parse tag list response")?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) => url = next,
                None => return Ok(tags),
            }
        }

        warn!(
            "Stopped listing tags of {} after {} pages",
            image.name(),
            MAX_TAG_PAGES
        );
        Ok(tags)
    }

    async fn get_digest(
        &self,
        image: &ImageReference,
        credentials: &RegistryCredentials,
    ) -> Result<String> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(image),
            image.repository,
            image.manifest_reference()
        );

        match self.fetch_manifest_digest(image, credentials, &url).await {
            Ok(digest) => Ok(digest),
            Err(e) if self.enable_jfrog_artifactory_fallback => {
                info!(
                    "Falling back to JFrog Artifactory specific Repository Path Method after: {:?}",
                    e
                );
                let repository_name = image
                    .repository
                    .split('/')
                    .next()
                    .unwrap_or(&image.repository);
                // Create URL according to JFrog Artifactory's Repository Path Method (https://jfrog.com/help/r/jfrog-artifactory-documentation/the-repository-path-method-for-docker)
                let fallback_url = format!(
                    "{}/artifactory/api/docker/{}/v2/{}/manifests/{}",
                    self.base_url(image),
                    repository_name,
                    image.repository,
                    image.manifest_reference()
                );
                self.fetch_manifest_digest(image, credentials, &fallback_url)
                    .await
            }
            Err(e) => Err(e),
        }
    }
}

fn ensure_success(response: Response, image: &ImageReference, action: &str) -> Result<Response> {
    if !response.status().is_success() {
        anyhow::bail!(
            "Registry {} returned error status {} while {} for {}",
            image.registry,
            response.status(),
            action,
            image.name()
        );
    }
    Ok(response)
}

fn get_digest_from_headers(headers: &HeaderMap) -> Result<Option<String>> {
    headers
        .get(DIGEST_HEADER)
        .map(|value| {
            value
                .to_str()
                .map(str::to_owned)
                .context("Received invalid UTF-8 content in Docker-Content-Digest header")
        })
        .transpose()
}

fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(char::is_whitespace).unwrap_or((header, ""));
    if scheme.is_empty() {
        return None;
    }
    let params = CHALLENGE_PARAM_REGEX
        .captures_iter(rest)
        .map(|caps| (caps[1].to_ascii_lowercase(), caps[2].to_string()))
        .collect();
    Some(Challenge {
        scheme: scheme.to_ascii_lowercase(),
        params,
    })
}

fn next_page_url(headers: &HeaderMap, base_url: &str) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    let target = NEXT_LINK_REGEX.captures(link)?.get(1)?.as_str();
    if target.starts_with("http://") || target.starts_with("https://") {
        Some(target.to_string())
    } else {
        Some(format!("{}{}", base_url, target))
    }
}
