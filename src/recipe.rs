//! Recipe engine
//!
//! Turns source working copies plus the configured recipe into a deployable
//! stack descriptor: stage files into the working directory, run the recipe
//! command, read the stack file back, apply the structural rewrites and emit
//! canonical YAML.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info};

use crate::cmd::shell_command;
use crate::config::{RecipeSettings, Workdir};
use crate::errors::AgentError;
use crate::shutdown::ShutdownToken;
use crate::stack::StackDescriptor;

/// A fully built stack: the descriptor plus the exact bytes that will be
/// pushed to the orchestrator and their digest.
#[derive(Debug, Clone)]
pub struct BuiltStack {
    pub descriptor: StackDescriptor,
    pub yaml: String,
    pub digest: String,
}

pub struct RecipeEngine {
    recipe: RecipeSettings,
    scratch_dir: PathBuf,
    command_timeout: Duration,
}

impl RecipeEngine {
    pub fn new(recipe: RecipeSettings, base_dir: &Path, command_timeout: Duration) -> Self {
        Self {
            recipe,
            scratch_dir: base_dir.join("recipe-workdir"),
            command_timeout,
        }
    }

    /// Run the full recipe protocol against the given working copies.
    pub async fn build(
        &self,
        repo_dirs: &HashMap<String, PathBuf>,
        shutdown: &ShutdownToken,
    ) -> Result<BuiltStack, AgentError> {
        let workdir = self.effective_workdir(repo_dirs).await?;

        self.stage(repo_dirs, &workdir).await?;

        if let Some(command) = self.recipe.effective_command() {
            debug!("running recipe command in {}", workdir.display());
            let output = shell_command(
                command,
                &workdir,
                &HashMap::new(),
                self.command_timeout,
                shutdown,
            )
            .await
            .map_err(|e| match e {
                AgentError::Cancelled => AgentError::Cancelled,
                AgentError::CmdLine { detail, .. } => {
                    AgentError::Recipe(format!("recipe command failed: {}", detail))
                }
                other => other,
            })?;
            if !output.stdout.is_empty() {
                debug!("recipe stdout:\n{}", output.stdout);
            }
            if !output.stderr.is_empty() {
                debug!("recipe stderr:\n{}", output.stderr);
            }
        } else {
            debug!("no recipe command configured, reading staged stack file directly");
        }

        let descriptor = self.read_stack_file(&workdir).await?;
        let descriptor = self.rewrite(descriptor);

        let yaml = descriptor.canonical_yaml()?;
        let digest = descriptor.digest()?;
        info!("built stack descriptor, digest {}", &digest[..12]);
        Ok(BuiltStack {
            descriptor,
            yaml,
            digest,
        })
    }

    /// Resolve the working directory. The scratch directory is deleted and
    /// recreated on every cycle so a previous run never leaks files into the
    /// next one.
    async fn effective_workdir(
        &self,
        repo_dirs: &HashMap<String, PathBuf>,
    ) -> Result<PathBuf, AgentError> {
        match &self.recipe.workdir {
            Workdir::Temporary => {
                if fs::metadata(&self.scratch_dir).await.is_ok() {
                    fs::remove_dir_all(&self.scratch_dir).await?;
                }
                fs::create_dir_all(&self.scratch_dir).await?;
                Ok(self.scratch_dir.clone())
            }
            Workdir::Repo(id) => repo_dirs.get(id).cloned().ok_or_else(|| {
                AgentError::Recipe(format!("recipe workdir references unknown repository '{}'", id))
            }),
        }
    }

    /// Copy the recipe's file groups into the working directory, preserving
    /// relative structure. Copies overwrite.
    async fn stage(
        &self,
        repo_dirs: &HashMap<String, PathBuf>,
        workdir: &Path,
    ) -> Result<(), AgentError> {
        for group in &self.recipe.files {
            let src_dir = repo_dirs.get(&group.id).ok_or_else(|| {
                AgentError::Recipe(format!(
                    "recipe references repository '{}' which is not watched",
                    group.id
                ))
            })?;
            for rel_path in &group.paths {
                let src = src_dir.join(rel_path);
                if fs::metadata(&src).await.is_err() {
                    return Err(AgentError::Recipe(format!(
                        "staged file '{}' does not exist in repository '{}'",
                        rel_path, group.id
                    )));
                }
                let dest = workdir.join(rel_path);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::copy(&src, &dest).await?;
                debug!("staged {} -> {}", src.display(), dest.display());
            }
        }
        Ok(())
    }

    async fn read_stack_file(&self, workdir: &Path) -> Result<StackDescriptor, AgentError> {
        let path = workdir.join(&self.recipe.stack_file);
        let metadata = fs::metadata(&path).await.map_err(|_| {
            AgentError::Recipe(format!(
                "stack file '{}' was not produced by the recipe",
                self.recipe.stack_file
            ))
        })?;
        if metadata.len() == 0 {
            return Err(AgentError::Recipe(format!(
                "stack file '{}' is empty",
                self.recipe.stack_file
            )));
        }
        let text = fs::read_to_string(&path).await?;
        StackDescriptor::parse(&text)
    }

    /// Apply the rewrite pipeline. Each step is idempotent and total.
    fn rewrite(&self, mut descriptor: StackDescriptor) -> StackDescriptor {
        let prefix = self.recipe.services_prefix.as_deref().unwrap_or("");

        descriptor.prefix_services(prefix);

        // exclusions are configured with original (un-prefixed) names
        let excluded: Vec<String> = self
            .recipe
            .excluded_services
            .iter()
            .map(|name| {
                if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}_{}", prefix, name)
                }
            })
            .collect();
        descriptor.exclude_services(&excluded);
        descriptor.exclude_volumes(&self.recipe.excluded_volumes);

        descriptor.strip_build_keys();
        descriptor.normalize_extra_hosts();
        descriptor.merge_additional_parameters(&self.recipe.additional_parameters);
        descriptor
    }
}
