//! Recipe engine tests

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_yaml::Mapping;
use stackwatch::config::{FileGroup, RecipeSettings, Workdir};
use stackwatch::errors::{AgentError, ErrorKind};
use stackwatch::recipe::RecipeEngine;
use stackwatch::shutdown::shutdown_channel;
use tempfile::TempDir;

const COMPOSE: &str = "\
version: \"3.7\"
services:
  web:
    image: registry.example.com/web:1.0
  webclient:
    image: registry.example.com/webclient:1.0
";

fn recipe(workdir: Workdir, command: Option<&str>, stack_file: &str) -> RecipeSettings {
    RecipeSettings {
        files: vec![FileGroup {
            id: "webapp".to_string(),
            paths: vec!["services/docker-compose.yml".to_string()],
        }],
        workdir,
        command: command.map(str::to_string),
        stack_file: stack_file.to_string(),
        excluded_services: vec!["webclient".to_string()],
        excluded_volumes: vec![],
        additional_parameters: Mapping::new(),
        services_prefix: Some("stg".to_string()),
    }
}

fn fake_repo() -> (TempDir, HashMap<String, PathBuf>) {
    let repo = TempDir::new().unwrap();
    let services = repo.path().join("services");
    std::fs::create_dir_all(&services).unwrap();
    std::fs::write(services.join("docker-compose.yml"), COMPOSE).unwrap();
    let mut dirs = HashMap::new();
    dirs.insert("webapp".to_string(), repo.path().to_path_buf());
    (repo, dirs)
}

#[tokio::test]
async fn test_build_without_command_reads_staged_file() {
    let (_repo, dirs) = fake_repo();
    let base = TempDir::new().unwrap();
    let engine = RecipeEngine::new(
        recipe(Workdir::Temporary, None, "services/docker-compose.yml"),
        base.path(),
        Duration::from_secs(30),
    );
    let (_handle, token) = shutdown_channel();

    let built = engine.build(&dirs, &token).await.unwrap();
    assert_eq!(built.descriptor.service_names(), vec!["stg_web"]);
    assert!(built.yaml.contains("stg_web"));
    assert!(!built.yaml.contains("webclient"));
}

#[tokio::test]
async fn test_build_runs_recipe_command() {
    let (_repo, dirs) = fake_repo();
    let base = TempDir::new().unwrap();
    let engine = RecipeEngine::new(
        recipe(
            Workdir::Temporary,
            Some("cp services/docker-compose.yml stack.yml"),
            "stack.yml",
        ),
        base.path(),
        Duration::from_secs(30),
    );
    let (_handle, token) = shutdown_channel();

    let built = engine.build(&dirs, &token).await.unwrap();
    assert_eq!(built.descriptor.service_names(), vec!["stg_web"]);
}

#[tokio::test]
async fn test_recipe_command_failure_aborts() {
    let (_repo, dirs) = fake_repo();
    let base = TempDir::new().unwrap();
    let engine = RecipeEngine::new(
        recipe(Workdir::Temporary, Some("exit 3"), "stack.yml"),
        base.path(),
        Duration::from_secs(30),
    );
    let (_handle, token) = shutdown_channel();

    let err = engine.build(&dirs, &token).await.expect_err("must fail");
    assert_eq!(err.kind(), ErrorKind::RecipeFailed);
}

#[tokio::test]
async fn test_missing_staged_file_aborts() {
    let (_repo, dirs) = fake_repo();
    let base = TempDir::new().unwrap();
    let mut settings = recipe(Workdir::Temporary, None, "stack.yml");
    settings.files[0].paths = vec!["services/nope.yml".to_string()];
    let engine = RecipeEngine::new(settings, base.path(), Duration::from_secs(30));
    let (_handle, token) = shutdown_channel();

    let err = engine.build(&dirs, &token).await.expect_err("must fail");
    assert!(matches!(err, AgentError::Recipe(_)));
    assert!(err.to_string().contains("services/nope.yml"));
}

#[tokio::test]
async fn test_missing_stack_file_aborts() {
    let (_repo, dirs) = fake_repo();
    let base = TempDir::new().unwrap();
    let engine = RecipeEngine::new(
        recipe(Workdir::Temporary, Some("true"), "never-produced.yml"),
        base.path(),
        Duration::from_secs(30),
    );
    let (_handle, token) = shutdown_channel();

    let err = engine.build(&dirs, &token).await.expect_err("must fail");
    assert!(err.to_string().contains("never-produced.yml"));
}

#[tokio::test]
async fn test_empty_stack_file_aborts() {
    let (_repo, dirs) = fake_repo();
    let base = TempDir::new().unwrap();
    let engine = RecipeEngine::new(
        recipe(Workdir::Temporary, Some("touch empty.yml"), "empty.yml"),
        base.path(),
        Duration::from_secs(30),
    );
    let (_handle, token) = shutdown_channel();

    let err = engine.build(&dirs, &token).await.expect_err("must fail");
    assert!(err.to_string().contains("empty"));
}

#[tokio::test]
async fn test_recipe_is_idempotent() {
    let (_repo, dirs) = fake_repo();
    let base = TempDir::new().unwrap();
    let engine = RecipeEngine::new(
        recipe(
            Workdir::Temporary,
            Some("cp services/docker-compose.yml stack.yml"),
            "stack.yml",
        ),
        base.path(),
        Duration::from_secs(30),
    );
    let (_handle, token) = shutdown_channel();

    let first = engine.build(&dirs, &token).await.unwrap();
    let second = engine.build(&dirs, &token).await.unwrap();
    assert_eq!(first.yaml, second.yaml);
    assert_eq!(first.digest, second.digest);
}

#[tokio::test]
async fn test_workdir_inside_repo_working_copy() {
    let (_repo, dirs) = fake_repo();
    let base = TempDir::new().unwrap();
    let mut settings = recipe(
        Workdir::Repo("webapp".to_string()),
        None,
        "services/docker-compose.yml",
    );
    settings.files.clear();
    let engine = RecipeEngine::new(settings, base.path(), Duration::from_secs(30));
    let (_handle, token) = shutdown_channel();

    let built = engine.build(&dirs, &token).await.unwrap();
    assert_eq!(built.descriptor.service_names(), vec!["stg_web"]);
}

#[tokio::test]
async fn test_additional_parameters_are_merged() {
    let (_repo, dirs) = fake_repo();
    let base = TempDir::new().unwrap();
    let mut settings = recipe(Workdir::Temporary, None, "services/docker-compose.yml");
    settings.additional_parameters =
        serde_yaml::from_str("environment:\n  DEPLOYED_BY: stackwatch\n").unwrap();
    let engine = RecipeEngine::new(settings, base.path(), Duration::from_secs(30));
    let (_handle, token) = shutdown_channel();

    let built = engine.build(&dirs, &token).await.unwrap();
    assert!(built.yaml.contains("DEPLOYED_BY"));
}
