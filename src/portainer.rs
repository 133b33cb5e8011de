//! Portainer client
//!
//! Talks to one Portainer-compatible instance: session authentication with a
//! cached bearer token (transparently refreshed once on 401), endpoint
//! discovery, and stack find/create/update with status verification.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::PortainerSettings;
use crate::errors::AgentError;
use crate::shutdown::ShutdownToken;

const STACK_STATUS_ACTIVE: i64 = 1;
const VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What a deploy did on the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Created,
    Updated,
    /// Descriptor digest matched the previous deploy and the remote stack is
    /// active; nothing was sent
    Unchanged,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    jwt: String,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    #[serde(rename = "Id")]
    id: i64,
}

#[derive(Debug, Deserialize)]
struct SwarmInfo {
    #[serde(rename = "ID")]
    id: String,
}

/// A stack as listed by the Portainer API
#[derive(Debug, Clone, Deserialize)]
pub struct Stack {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Status", default)]
    pub status: i64,
}

#[derive(Debug)]
pub struct PortainerClient {
    settings: PortainerSettings,
    base: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
    verify_timeout: Duration,
}

impl PortainerClient {
    pub fn new(
        settings: PortainerSettings,
        http_timeout: Duration,
        verify_timeout: Duration,
    ) -> Result<Self, AgentError> {
        if settings.stack_name != settings.stack_name.to_lowercase() {
            return Err(AgentError::ConfigInvalid(format!(
                "swarm stack names must be lowercase, got '{}'",
                settings.stack_name
            )));
        }
        let base = settings.url.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder().timeout(http_timeout).build()?;
        Ok(Self {
            settings,
            base,
            client,
            token: RwLock::new(None),
            verify_timeout,
        })
    }

    pub fn stack_name(&self) -> &str {
        &self.settings.stack_name
    }

    pub fn url(&self) -> &str {
        &self.base
    }

    /// POST credentials, cache the returned bearer token.
    pub async fn authenticate(&self) -> Result<String, AgentError> {
        debug!("authenticating with portainer at {}", self.base);
        let response = self
            .client
            .post(format!("{}/api/auth", self.base))
            .json(&serde_json::json!({
                "Username": self.settings.username,
                "Password": self.settings.password,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, "authentication", &body));
        }

        let auth: AuthResponse = response.json().await?;
        let mut token = self.token.write().await;
        *token = Some(auth.jwt.clone());
        debug!("authenticated with portainer at {}", self.base);
        Ok(auth.jwt)
    }

    async fn bearer(&self) -> Result<String, AgentError> {
        {
            let token = self.token.read().await;
            if let Some(token) = token.as_ref() {
                return Ok(token.clone());
            }
        }
        self.authenticate().await
    }

    /// Send a request, re-authenticating once on 401.
    async fn send_with_refresh<F>(&self, build: F) -> Result<reqwest::Response, AgentError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.bearer().await?;
        let response = build(&token).send().await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            debug!("bearer token expired, re-authenticating");
            let token = self.authenticate().await?;
            return Ok(build(&token).send().await?);
        }
        Ok(response)
    }

    /// The configured endpoint id, or the single one the instance exposes.
    pub async fn resolve_endpoint_id(&self) -> Result<i64, AgentError> {
        if self.settings.endpoint_id >= 0 {
            return Ok(self.settings.endpoint_id);
        }
        let url = format!("{}/api/endpoints", self.base);
        let response = self
            .send_with_refresh(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        let endpoints: Vec<Endpoint> = expect_json(response, "endpoint discovery").await?;
        match endpoints.as_slice() {
            [single] => Ok(single.id),
            [] => Err(AgentError::OrchestratorRejected(
                "portainer does not expose any endpoint".to_string(),
            )),
            _ => Err(AgentError::OrchestratorRejected(format!(
                "portainer exposes {} endpoints, set endpoint_id explicitly",
                endpoints.len()
            ))),
        }
    }

    pub async fn swarm_id(&self, endpoint_id: i64) -> Result<String, AgentError> {
        let url = format!("{}/api/endpoints/{}/docker/swarm", self.base, endpoint_id);
        let response = self
            .send_with_refresh(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        let swarm: SwarmInfo = expect_json(response, "swarm lookup").await?;
        Ok(swarm.id)
    }

    /// Find the configured stack by case-sensitive name.
    pub async fn find_stack(&self, swarm_id: &str) -> Result<Option<Stack>, AgentError> {
        let url = format!("{}/api/stacks", self.base);
        let filters = serde_json::json!({ "SwarmID": swarm_id }).to_string();
        let response = self
            .send_with_refresh(|token| {
                self.client
                    .get(&url)
                    .query(&[("filters", filters.as_str())])
                    .bearer_auth(token)
            })
            .await?;
        let stacks: Vec<Stack> = expect_json(response, "stack listing").await?;
        Ok(stacks
            .into_iter()
            .find(|stack| stack.name == self.settings.stack_name))
    }

    async fn create_stack(
        &self,
        swarm_id: &str,
        endpoint_id: i64,
        content: &str,
    ) -> Result<Stack, AgentError> {
        info!("creating stack '{}' on {}", self.settings.stack_name, self.base);
        let url = format!("{}/api/stacks", self.base);
        let endpoint = endpoint_id.to_string();
        let body = serde_json::json!({
            "Name": self.settings.stack_name,
            "SwarmID": swarm_id,
            "StackFileContent": content,
        });
        let response = self
            .send_with_refresh(|token| {
                self.client
                    .post(&url)
                    .query(&[
                        ("type", "1"),
                        ("method", "string"),
                        ("endpointId", endpoint.as_str()),
                    ])
                    .json(&body)
                    .bearer_auth(token)
            })
            .await?;
        expect_json(response, "stack creation").await
    }

    async fn update_stack(
        &self,
        stack_id: i64,
        endpoint_id: i64,
        content: &str,
    ) -> Result<(), AgentError> {
        info!("updating stack '{}' on {}", self.settings.stack_name, self.base);
        let url = format!("{}/api/stacks/{}", self.base, stack_id);
        let endpoint = endpoint_id.to_string();
        let body = serde_json::json!({
            "StackFileContent": content,
            "Env": [],
            "Prune": true,
        });
        let response = self
            .send_with_refresh(|token| {
                self.client
                    .put(&url)
                    .query(&[("endpointId", endpoint.as_str())])
                    .json(&body)
                    .bearer_auth(token)
            })
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, "stack update", &text));
        }
        Ok(())
    }

    /// Poll the stack until it reports active or the deadline elapses.
    pub async fn verify(
        &self,
        stack_id: i64,
        shutdown: &ShutdownToken,
    ) -> Result<(), AgentError> {
        let deadline = tokio::time::Instant::now() + self.verify_timeout;
        loop {
            if shutdown.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            let url = format!("{}/api/stacks/{}", self.base, stack_id);
            let response = self
                .send_with_refresh(|token| self.client.get(&url).bearer_auth(token))
                .await?;
            let stack: Stack = expect_json(response, "stack status").await?;
            if stack.status == STACK_STATUS_ACTIVE {
                debug!("stack {} is active", stack_id);
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::OrchestratorUnavailable(format!(
                    "stack '{}' did not become active within {}s",
                    self.settings.stack_name,
                    self.verify_timeout.as_secs()
                )));
            }
            tokio::time::sleep(VERIFY_POLL_INTERVAL).await;
        }
    }

    /// Find-or-create the stack and push the descriptor.
    pub async fn publish(
        &self,
        content: &str,
        digest: &str,
        previous_digest: Option<&str>,
        shutdown: &ShutdownToken,
    ) -> Result<DeployOutcome, AgentError> {
        let endpoint_id = self.resolve_endpoint_id().await?;
        let swarm_id = self.swarm_id(endpoint_id).await?;

        match self.find_stack(&swarm_id).await? {
            Some(stack) => {
                if previous_digest == Some(digest) && stack.status == STACK_STATUS_ACTIVE {
                    info!(
                        "stack '{}' already at digest {}, nothing to deploy",
                        self.settings.stack_name,
                        short(digest)
                    );
                    return Ok(DeployOutcome::Unchanged);
                }
                self.update_stack(stack.id, endpoint_id, content).await?;
                self.verify(stack.id, shutdown).await?;
                Ok(DeployOutcome::Updated)
            }
            None => {
                let created = self.create_stack(&swarm_id, endpoint_id, content).await?;
                self.verify(created.id, shutdown).await?;
                Ok(DeployOutcome::Created)
            }
        }
    }

    /// Whether the configured stack currently exists on the instance.
    pub async fn stack_exists(&self) -> Result<bool, AgentError> {
        let endpoint_id = self.resolve_endpoint_id().await?;
        let swarm_id = self.swarm_id(endpoint_id).await?;
        Ok(self.find_stack(&swarm_id).await?.is_some())
    }
}

async fn expect_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    context: &str,
) -> Result<T, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, context, &body))
}

fn classify_status(status: reqwest::StatusCode, context: &str, body: &str) -> AgentError {
    if status.is_client_error() {
        AgentError::OrchestratorRejected(format!("{} failed with {}: {}", context, status, body))
    } else {
        AgentError::OrchestratorUnavailable(format!("{} failed with {}: {}", context, status, body))
    }
}

fn short(digest: &str) -> &str {
    &digest[..digest.len().min(12)]
}
