//! Configuration file loading and validation
//!
//! The configuration is a YAML document bound to a typed schema at startup.
//! `${VAR}` tokens are substituted from the process environment before
//! parsing; a missing variable is fatal. Unknown top-level keys are rejected.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::errors::AgentError;
use crate::logs::LogLevel;

/// The only supported configuration schema version.
pub const CONFIG_VERSION: &str = "1.0";

/// Top-level configuration document
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub version: String,
    pub rest: RestSettings,
    pub main: MainSettings,
}

/// Location of the OpenAPI document served by the health surface
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestSettings {
    pub version: String,
    pub location: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MainSettings {
    #[serde(default)]
    pub log_level: LogLevel,

    pub host: String,
    pub port: u16,

    /// When true the matched tag name participates in change detection, so
    /// an untagged commit does not trigger a deploy.
    #[serde(default)]
    pub synced_via_tags: bool,

    pub watched_git_repositories: Vec<RepoSettings>,

    #[serde(default)]
    pub docker_private_registries: Vec<RegistrySettings>,

    pub docker_stack_recipe: RecipeSettings,

    pub portainer: Vec<PortainerSettings>,

    /// Seconds between cycles, counted from the end of the previous cycle
    pub polling_interval: u64,

    #[serde(default)]
    pub notifications: Vec<NotificationSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoSettings {
    pub id: String,
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Tag-match pattern (regular expression) or null
    #[serde(default)]
    pub tags: Option<String>,
    /// Path selectors (globs or plain paths) participating in change detection
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySettings {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipeSettings {
    #[serde(default)]
    pub files: Vec<FileGroup>,
    pub workdir: Workdir,
    #[serde(default)]
    pub command: Option<String>,
    pub stack_file: String,
    #[serde(default)]
    pub excluded_services: Vec<String>,
    #[serde(default)]
    pub excluded_volumes: Vec<String>,
    #[serde(default)]
    pub additional_parameters: serde_yaml::Mapping,
    #[serde(default)]
    pub services_prefix: Option<String>,
}

impl RecipeSettings {
    /// The recipe command, treating an empty string as absent.
    pub fn effective_command(&self) -> Option<&str> {
        match self.command.as_deref() {
            Some(cmd) if !cmd.trim().is_empty() => Some(cmd),
            _ => None,
        }
    }
}

/// Files staged from one watched repository
#[derive(Debug, Clone, Deserialize)]
pub struct FileGroup {
    pub id: String,
    pub paths: Vec<String>,
}

/// Where the recipe executes: a scratch directory or a repo working copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Workdir {
    Temporary,
    Repo(String),
}

impl<'de> Deserialize<'de> for Workdir {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "temp" {
            Ok(Workdir::Temporary)
        } else {
            Ok(Workdir::Repo(s))
        }
    }
}

impl fmt::Display for Workdir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workdir::Temporary => write!(f, "temp"),
            Workdir::Repo(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortainerSettings {
    pub url: String,
    /// Negative means "discover the single endpoint"
    pub endpoint_id: i64,
    pub username: String,
    pub password: String,
    pub stack_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSettings {
    pub service: NotificationKind,
    pub url: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub personal_token: String,
    #[serde(default)]
    pub header_unique_name: String,
}

fn default_true() -> bool {
    true
}

fn default_branch() -> String {
    "master".to_string()
}

/// Recognized notification services; unknown kinds are carried through so
/// validation can skip them with a warning instead of failing the startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Mattermost,
    Unknown(String),
}

impl<'de> Deserialize<'de> for NotificationKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "mattermost" => Ok(NotificationKind::Mattermost),
            _ => Ok(NotificationKind::Unknown(s)),
        }
    }
}

/// Substitute `${VAR}` tokens from the process environment.
pub fn substitute_env_vars(raw: &str) -> Result<String, AgentError> {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| AgentError::ConfigInvalid(e.to_string()))?;

    let mut missing: Vec<String> = Vec::new();
    let substituted = pattern.replace_all(raw, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(AgentError::ConfigInvalid(format!(
            "missing environment variables: {}",
            missing.join(", ")
        )));
    }
    Ok(substituted.into_owned())
}

/// Parse and validate a configuration document.
pub fn from_str(raw: &str) -> Result<Settings, AgentError> {
    let substituted = substitute_env_vars(raw)?;
    let settings: Settings = serde_yaml::from_str(&substituted)
        .map_err(|e| AgentError::ConfigInvalid(format!("invalid configuration: {}", e)))?;
    validate(&settings)?;
    Ok(settings)
}

/// Load a configuration file from disk.
pub async fn load(path: &Path) -> Result<Settings, AgentError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        AgentError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
    })?;
    from_str(&raw)
}

fn validate(settings: &Settings) -> Result<(), AgentError> {
    if settings.version != CONFIG_VERSION {
        return Err(AgentError::ConfigInvalid(format!(
            "unsupported config version '{}', expected '{}'",
            settings.version, CONFIG_VERSION
        )));
    }

    let main = &settings.main;
    if main.polling_interval < 1 {
        return Err(AgentError::ConfigInvalid(
            "polling_interval must be at least 1 second".to_string(),
        ));
    }

    let mut repo_ids: HashSet<&str> = HashSet::new();
    for repo in &main.watched_git_repositories {
        if !repo_ids.insert(repo.id.as_str()) {
            return Err(AgentError::ConfigInvalid(format!(
                "duplicate watched repository id '{}'",
                repo.id
            )));
        }
        if let Some(pattern) = &repo.tags {
            Regex::new(pattern).map_err(|e| {
                AgentError::ConfigInvalid(format!(
                    "invalid tags pattern for repository '{}': {}",
                    repo.id, e
                ))
            })?;
        }
    }

    let recipe = &main.docker_stack_recipe;
    for group in &recipe.files {
        if !repo_ids.contains(group.id.as_str()) {
            return Err(AgentError::ConfigInvalid(format!(
                "recipe references unknown repository id '{}'",
                group.id
            )));
        }
    }
    if let Workdir::Repo(id) = &recipe.workdir {
        if !repo_ids.contains(id.as_str()) {
            return Err(AgentError::ConfigInvalid(format!(
                "recipe workdir references unknown repository id '{}'",
                id
            )));
        }
    }

    for portainer in &main.portainer {
        if portainer.stack_name != portainer.stack_name.to_lowercase() {
            return Err(AgentError::ConfigInvalid(format!(
                "swarm stack names must be lowercase, got '{}'",
                portainer.stack_name
            )));
        }
    }

    for notification in &main.notifications {
        if let NotificationKind::Unknown(kind) = &notification.service {
            warn!(
                "unknown notification service '{}' for {}, entry will be skipped",
                kind, notification.url
            );
        }
    }

    Ok(())
}
