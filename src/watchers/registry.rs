//! Registry watcher
//!
//! Resolves the current digest of each image referenced by the stack through
//! the registry HTTP API: a HEAD on the manifest of the tag, answered with a
//! `Docker-Content-Digest` header. Private registries use the configured
//! basic credentials; everything else falls back to Docker Hub with an
//! anonymous pull token.

use std::time::Duration;

use futures::future::try_join_all;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::RegistrySettings;
use crate::errors::AgentError;
use crate::shutdown::ShutdownToken;
use crate::utils::sha256_hash;

const DOCKER_HUB_REGISTRY: &str = "https://registry-1.docker.io/v2";
const DOCKER_HUB_AUTH: &str = "https://auth.docker.io/token";
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry authority (`host[:port]`); `None` means Docker Hub
    pub registry: Option<String>,
    pub repository: String,
    pub tag: String,
    /// Digest pin (`name@sha256:…`), already resolved
    pub digest: Option<String>,
}

/// Split an image reference into registry, repository and tag.
pub fn parse_image_ref(image: &str) -> ImageRef {
    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name, Some(digest.to_string())),
        None => (image, None),
    };

    let (registry, remainder) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Some(first.to_string()), rest)
        }
        _ => (None, name),
    };

    let (repository, tag) = match remainder.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository.to_string(), tag.to_string()),
        _ => (remainder.to_string(), "latest".to_string()),
    };

    // official Docker Hub images live under the library namespace
    let repository = if registry.is_none() && !repository.contains('/') {
        format!("library/{}", repository)
    } else {
        repository
    };

    ImageRef {
        registry,
        repository,
        tag,
        digest,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

pub struct RegistryWatcher {
    registries: Vec<RegistrySettings>,
    client: reqwest::Client,
}

impl RegistryWatcher {
    pub fn new(registries: Vec<RegistrySettings>, timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { registries, client })
    }

    /// Resolve the current digest of an image reference.
    pub async fn resolve(
        &self,
        image: &str,
        shutdown: &ShutdownToken,
    ) -> Result<String, AgentError> {
        if shutdown.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let parsed = parse_image_ref(image);
        if let Some(digest) = parsed.digest {
            return Ok(digest);
        }

        match &parsed.registry {
            Some(authority) => {
                let (base, credentials) = match self.registry_for(authority) {
                    Some(cfg) => (
                        cfg.url.trim_end_matches('/').to_string(),
                        cfg.username.clone().zip(cfg.password.clone()),
                    ),
                    None => (format!("https://{}/v2", authority), None),
                };
                self.head_manifest(&base, &parsed, credentials, None, image, shutdown)
                    .await
            }
            None => {
                let token = self.docker_hub_token(&parsed.repository, shutdown).await?;
                self.head_manifest(DOCKER_HUB_REGISTRY, &parsed, None, Some(token), image, shutdown)
                    .await
            }
        }
    }

    /// Fingerprint over the sorted `(ref, digest)` pairs of the given images.
    pub async fn fingerprint(
        &self,
        images: &[String],
        shutdown: &ShutdownToken,
    ) -> Result<String, AgentError> {
        let resolved = try_join_all(images.iter().map(|image| async move {
            let digest = self.resolve(image, shutdown).await?;
            Ok::<_, AgentError>(format!("{}@{}", image, digest))
        }))
        .await?;
        let mut pairs = resolved;
        pairs.sort();
        pairs.dedup();
        Ok(sha256_hash(pairs.join("\n").as_bytes()))
    }

    /// The configured registry whose URL authority matches, if any.
    fn registry_for(&self, authority: &str) -> Option<&RegistrySettings> {
        self.registries.iter().find(|cfg| {
            Url::parse(&cfg.url)
                .ok()
                .and_then(|url| {
                    url.host_str().map(|host| match url.port() {
                        Some(port) => format!("{}:{}", host, port),
                        None => host.to_string(),
                    })
                })
                .map(|candidate| candidate == authority)
                .unwrap_or(false)
        })
    }

    async fn head_manifest(
        &self,
        base: &str,
        parsed: &ImageRef,
        credentials: Option<(String, String)>,
        bearer: Option<String>,
        image: &str,
        shutdown: &ShutdownToken,
    ) -> Result<String, AgentError> {
        let url = format!("{}/{}/manifests/{}", base, parsed.repository, parsed.tag);
        debug!("HEAD {}", url);

        let mut request = self
            .client
            .head(&url)
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT);
        let authenticated = credentials.is_some();
        if let Some((username, password)) = credentials {
            request = request.basic_auth(username, Some(password));
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            result = request.send() => result?,
            _ = shutdown.cancelled() => return Err(AgentError::Cancelled),
        };
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            if authenticated {
                return Err(AgentError::RegistryAuth(format!(
                    "registry rejected configured credentials for {}",
                    image
                )));
            }
            return Err(AgentError::Registry(format!(
                "registry requires authentication for {}",
                image
            )));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AgentError::Registry(format!("image {} not found", image)));
        }
        if !status.is_success() {
            return Err(AgentError::Registry(format!(
                "manifest request for {} returned {}",
                image, status
            )));
        }

        response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                AgentError::Registry(format!(
                    "registry did not return a digest for {}",
                    image
                ))
            })
    }

    async fn docker_hub_token(
        &self,
        repository: &str,
        shutdown: &ShutdownToken,
    ) -> Result<String, AgentError> {
        let request = self.client.get(DOCKER_HUB_AUTH).query(&[
            ("service", "registry.docker.io"),
            ("scope", &format!("repository:{}:pull", repository)),
        ]);
        let response = tokio::select! {
            result = request.send() => result?,
            _ = shutdown.cancelled() => return Err(AgentError::Cancelled),
        };
        if !response.status().is_success() {
            return Err(AgentError::Registry(format!(
                "docker hub token request returned {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.token)
    }
}
