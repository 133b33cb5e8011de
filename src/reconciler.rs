//! Reconciler / state machine
//!
//! Drives the loop: scheduling, change detection, ordering of the watchers,
//! recipe and orchestrator, error classification, backoff and cancellation.
//! The reconciler owns the cycle; all components are invoked from it, so
//! there is never more than one outstanding recipe execution or orchestrator
//! call (single-flight).

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::errors::{AgentError, ErrorKind};
use crate::notifier::Notifier;
use crate::portainer::{DeployOutcome, PortainerClient};
use crate::recipe::{BuiltStack, RecipeEngine};
use crate::shutdown::ShutdownToken;
use crate::utils::{apply_jitter, backoff_delay, BackoffOptions};
use crate::watchers::git::{GitWatcher, RepoSync, SyncOutcome};
use crate::watchers::registry::RegistryWatcher;

/// Reconciler state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Starting,
    Idle,
    Observing,
    Evaluating,
    Deploying,
    Notifying,
    Failing,
    Stopping,
    Stopped,
}

/// Per-controller deployment state, lost on restart; the orchestrator holds
/// the ground truth.
#[derive(Debug, Clone, Default)]
pub struct DeploymentState {
    pub last_source_fp: Option<String>,
    pub last_images_fp: Option<String>,
    pub last_deployed_stack_digest: Option<String>,
    /// Image references of the last deployed stack, re-resolved every cycle
    pub watched_images: Vec<String>,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Observable status for the health surface
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl StatusSnapshot {
    pub fn service_status(&self) -> &'static str {
        match self.phase {
            Phase::Starting => "SERVICE_STARTING",
            Phase::Stopping | Phase::Stopped => "SERVICE_STOPPED",
            _ if self.consecutive_failures > 0 => "SERVICE_PAUSED",
            _ => "SERVICE_RUNNING",
        }
    }
}

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot {
        phase: Phase::Starting,
        last_ok_at: None,
        last_error: None,
        consecutive_failures: 0,
    }))
}

/// What the source watchers saw this cycle
#[derive(Debug, Clone)]
pub enum SourceObservation {
    Ready {
        syncs: Vec<RepoSync>,
        fingerprint: String,
    },
    /// Tag-sync is enabled and a repository has no matching tag
    TagMiss { repo_id: String },
}

#[async_trait]
pub trait SourceWatcher: Send + Sync {
    async fn observe(&self, shutdown: &ShutdownToken) -> Result<SourceObservation, AgentError>;
    fn repo_dirs(&self) -> HashMap<String, PathBuf>;
}

#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn images_fingerprint(
        &self,
        images: &[String],
        shutdown: &ShutdownToken,
    ) -> Result<String, AgentError>;
}

#[async_trait]
pub trait StackBuilder: Send + Sync {
    async fn build_stack(
        &self,
        repo_dirs: &HashMap<String, PathBuf>,
        shutdown: &ShutdownToken,
    ) -> Result<BuiltStack, AgentError>;
}

#[async_trait]
pub trait StackPublisher: Send + Sync {
    fn target(&self) -> String;

    async fn publish(
        &self,
        content: &str,
        digest: &str,
        previous_digest: Option<&str>,
        shutdown: &ShutdownToken,
    ) -> Result<DeployOutcome, AgentError>;

    async fn stack_exists(&self) -> Result<bool, AgentError>;
}

#[async_trait]
pub trait Notify: Send + Sync {
    async fn send(&self, detail: &str);
}

#[async_trait]
impl SourceWatcher for GitWatcher {
    async fn observe(&self, shutdown: &ShutdownToken) -> Result<SourceObservation, AgentError> {
        let outcomes = self.sync_all(shutdown).await?;
        let mut syncs = Vec::new();
        for outcome in outcomes {
            match outcome {
                SyncOutcome::Synced(sync) => syncs.push(sync),
                SyncOutcome::NoMatchingTag { repo_id } => {
                    return Ok(SourceObservation::TagMiss { repo_id })
                }
            }
        }
        let fingerprint = self.fingerprint(&syncs).await?;
        Ok(SourceObservation::Ready { syncs, fingerprint })
    }

    fn repo_dirs(&self) -> HashMap<String, PathBuf> {
        GitWatcher::repo_dirs(self)
    }
}

#[async_trait]
impl ImageResolver for RegistryWatcher {
    async fn images_fingerprint(
        &self,
        images: &[String],
        shutdown: &ShutdownToken,
    ) -> Result<String, AgentError> {
        self.fingerprint(images, shutdown).await
    }
}

#[async_trait]
impl StackBuilder for RecipeEngine {
    async fn build_stack(
        &self,
        repo_dirs: &HashMap<String, PathBuf>,
        shutdown: &ShutdownToken,
    ) -> Result<BuiltStack, AgentError> {
        self.build(repo_dirs, shutdown).await
    }
}

#[async_trait]
impl StackPublisher for PortainerClient {
    fn target(&self) -> String {
        format!("{} ({})", self.stack_name(), self.url())
    }

    async fn publish(
        &self,
        content: &str,
        digest: &str,
        previous_digest: Option<&str>,
        shutdown: &ShutdownToken,
    ) -> Result<DeployOutcome, AgentError> {
        PortainerClient::publish(self, content, digest, previous_digest, shutdown).await
    }

    async fn stack_exists(&self) -> Result<bool, AgentError> {
        PortainerClient::stack_exists(self).await
    }
}

#[async_trait]
impl Notify for Notifier {
    async fn send(&self, detail: &str) {
        self.notify(detail).await;
    }
}

/// Reconciler options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between cycles, counted from the end of the previous cycle
    pub polling_interval: Duration,

    /// Fraction of jitter applied to the normal interval
    pub jitter_fraction: f64,

    pub backoff: BackoffOptions,

    /// Consecutive orchestrator rejections before the loud error
    pub rejected_alert_threshold: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(30),
            jitter_fraction: 0.1,
            backoff: BackoffOptions::default(),
            rejected_alert_threshold: 5,
        }
    }
}

/// How one cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// At least one orchestrator accepted a new descriptor
    Deployed { summary: String },
    /// A stack was built but every orchestrator already had this digest
    Unchanged,
    /// Neither fingerprint changed, nothing was built
    NoChange,
    /// Tag-sync found no matching tag; success, not failure
    TagMiss { repo_id: String },
}

pub struct Reconciler {
    sources: Arc<dyn SourceWatcher>,
    images: Arc<dyn ImageResolver>,
    builder: Arc<dyn StackBuilder>,
    publishers: Vec<Arc<dyn StackPublisher>>,
    notifier: Arc<dyn Notify>,
    options: Options,
    state: RwLock<DeploymentState>,
    status: SharedStatus,
}

impl Reconciler {
    pub fn new(
        sources: Arc<dyn SourceWatcher>,
        images: Arc<dyn ImageResolver>,
        builder: Arc<dyn StackBuilder>,
        publishers: Vec<Arc<dyn StackPublisher>>,
        notifier: Arc<dyn Notify>,
        options: Options,
    ) -> Self {
        Self {
            sources,
            images,
            builder,
            publishers,
            notifier,
            options,
            state: RwLock::new(DeploymentState::default()),
            status: new_shared_status(),
        }
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub async fn state(&self) -> DeploymentState {
        self.state.read().await.clone()
    }

    /// Run the loop until shutdown. The next wake is scheduled from the end
    /// of the previous cycle, so a slow cycle never overlaps the next.
    pub async fn run<S, F>(&self, sleep_fn: S, shutdown: ShutdownToken)
    where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        info!("reconciler starting...");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_cycle(&shutdown).await {
                Ok(CycleOutcome::Deployed { summary }) => {
                    info!("stack deployed: {}", summary);
                }
                Ok(CycleOutcome::Unchanged) => {
                    debug!("descriptor unchanged, no deploy needed");
                }
                Ok(CycleOutcome::NoChange) => {
                    debug!("no changes detected");
                }
                Ok(CycleOutcome::TagMiss { repo_id }) => {
                    debug!("no matching tag in '{}', cycle skipped", repo_id);
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    warn!("cycle failed: {}", e);
                }
            }

            let delay = self.next_delay().await;
            debug!("next cycle in {:?}", delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep_fn(delay) => {}
            }
        }
        self.set_phase(Phase::Stopped).await;
        info!("reconciler stopped");
    }

    /// One full pass through the state machine, with bookkeeping.
    pub async fn run_cycle(&self, shutdown: &ShutdownToken) -> Result<CycleOutcome, AgentError> {
        match self.cycle(shutdown).await {
            Ok(outcome) => {
                self.record_success().await;
                Ok(outcome)
            }
            Err(e) if e.is_cancelled() => {
                self.set_phase(Phase::Stopping).await;
                Err(e)
            }
            Err(e) => {
                self.record_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Delay until the next wake: jittered polling interval after success,
    /// multiplied backoff after failures.
    pub async fn next_delay(&self) -> Duration {
        let failures = self.state.read().await.consecutive_failures;
        if failures > 0 {
            backoff_delay(&self.options.backoff, self.options.polling_interval, failures)
        } else {
            apply_jitter(self.options.polling_interval, self.options.jitter_fraction)
        }
    }

    async fn cycle(&self, shutdown: &ShutdownToken) -> Result<CycleOutcome, AgentError> {
        if shutdown.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        self.set_phase(Phase::Observing).await;

        let watched_images = { self.state.read().await.watched_images.clone() };
        let (source, images_fp) = tokio::join!(
            self.sources.observe(shutdown),
            self.images.images_fingerprint(&watched_images, shutdown)
        );
        let source = source?;
        let images_fp = images_fp?;

        let (syncs, source_fp) = match source {
            SourceObservation::Ready { syncs, fingerprint } => (syncs, fingerprint),
            SourceObservation::TagMiss { repo_id } => {
                return Ok(CycleOutcome::TagMiss { repo_id })
            }
        };

        self.set_phase(Phase::Evaluating).await;
        let previous = { self.state.read().await.clone() };
        let sources_changed = previous.last_source_fp.as_deref() != Some(source_fp.as_str());
        let images_changed = previous.last_images_fp.as_deref() != Some(images_fp.as_str());
        let never_deployed = previous.last_deployed_stack_digest.is_none();

        if !sources_changed && !images_changed && !never_deployed {
            // a stack that vanished remotely is re-created even without a
            // fingerprint change
            let mut vanished = false;
            for publisher in &self.publishers {
                if !publisher.stack_exists().await? {
                    warn!("stack missing on {}, re-deploying", publisher.target());
                    vanished = true;
                }
            }
            if !vanished {
                return Ok(CycleOutcome::NoChange);
            }
        }

        if shutdown.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        self.set_phase(Phase::Deploying).await;

        let repo_dirs = self.sources.repo_dirs();
        let built = self.builder.build_stack(&repo_dirs, shutdown).await?;

        if shutdown.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut outcomes: Vec<(String, DeployOutcome)> = Vec::new();
        for publisher in &self.publishers {
            let outcome = publisher
                .publish(
                    &built.yaml,
                    &built.digest,
                    previous.last_deployed_stack_digest.as_deref(),
                    shutdown,
                )
                .await?;
            outcomes.push((publisher.target(), outcome));
        }

        // from now on the registry watcher tracks the new stack's images
        let new_images = built.descriptor.image_refs();
        let new_images_fp = self
            .images
            .images_fingerprint(&new_images, shutdown)
            .await?;

        // commit only after every orchestrator confirmed; a crash before this
        // point causes one redundant but idempotent redeploy
        {
            let mut state = self.state.write().await;
            state.last_source_fp = Some(source_fp);
            state.last_images_fp = Some(new_images_fp);
            state.last_deployed_stack_digest = Some(built.digest.clone());
            state.watched_images = new_images;
        }

        let deployed = outcomes
            .iter()
            .any(|(_, outcome)| *outcome != DeployOutcome::Unchanged);
        if !deployed {
            return Ok(CycleOutcome::Unchanged);
        }

        self.set_phase(Phase::Notifying).await;
        let summary = describe(&syncs, &outcomes);
        self.notifier.send(&summary).await;
        Ok(CycleOutcome::Deployed { summary })
    }

    async fn record_success(&self) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.last_ok_at = Some(Utc::now());
            state.last_error = None;
            state.consecutive_failures = 0;
            state.clone()
        };
        let mut status = self.status.write().await;
        status.phase = Phase::Idle;
        status.last_ok_at = snapshot.last_ok_at;
        status.last_error = None;
        status.consecutive_failures = 0;
    }

    async fn record_failure(&self, error: &AgentError) {
        let failures = {
            let mut state = self.state.write().await;
            state.consecutive_failures += 1;
            state.last_error = Some(error.to_string());
            state.consecutive_failures
        };

        if error.kind() == ErrorKind::OrchestratorRejected
            && failures >= self.options.rejected_alert_threshold
        {
            error!(
                "orchestrator rejected {} consecutive deploys, operator attention required: {}",
                failures, error
            );
        }

        let mut status = self.status.write().await;
        status.phase = Phase::Failing;
        status.last_error = Some(error.to_string());
        status.consecutive_failures = failures;
    }

    async fn set_phase(&self, phase: Phase) {
        let mut status = self.status.write().await;
        status.phase = phase;
    }
}

fn describe(syncs: &[RepoSync], outcomes: &[(String, DeployOutcome)]) -> String {
    let refs: Vec<String> = syncs
        .iter()
        .map(|sync| match &sync.matched_tag {
            Some(tag) => format!("{}:{}:{}", sync.repo_id, tag, sync.resolved_ref),
            None => format!("{}:{}", sync.repo_id, sync.resolved_ref),
        })
        .collect();
    let actions: Vec<String> = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome != DeployOutcome::Unchanged)
        .map(|(target, outcome)| {
            let verb = match outcome {
                DeployOutcome::Created => "created",
                DeployOutcome::Updated => "updated",
                DeployOutcome::Unchanged => "unchanged",
            };
            format!("{} {}", verb, target)
        })
        .collect();
    format!("{} [{}]", actions.join(", "), refs.join(", "))
}
