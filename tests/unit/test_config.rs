//! Configuration loading tests

use std::time::Duration;

use stackwatch::config::{self, NotificationKind, Workdir};
use stackwatch::notifier::Notifier;

fn sample_config() -> &'static str {
    r#"
version: "1.0"
rest:
  version: v0
  location: api/v0/openapi.yaml
main:
  log_level: INFO
  host: 127.0.0.1
  port: 8888
  synced_via_tags: false
  watched_git_repositories:
    - id: webapp
      url: https://github.com/example/webapp.git
      branch: master
      username: bot
      password: ${STACKWATCH_TEST_GIT_PASSWORD}
      tags: null
      paths:
        - services/docker-compose.yml
        - Makefile
  docker_private_registries:
    - url: https://registry.example.com/v2
      username: reg
      password: regpass
  docker_stack_recipe:
    files:
      - id: webapp
        paths:
          - services/docker-compose.yml
    workdir: temp
    command: "cp services/docker-compose.yml stack.yml"
    stack_file: stack.yml
    excluded_services:
      - webclient
    excluded_volumes: []
    additional_parameters:
      extra_hosts: []
      environment: {}
    services_prefix: stg
  portainer:
    - url: https://portainer.example.com
      endpoint_id: -1
      username: admin
      password: adminpass
      stack_name: deployment-agent
  polling_interval: 15
  notifications:
    - service: mattermost
      url: https://mattermost.example.com/api/v4/posts
      message: deployed
      enabled: true
      channel_id: abc
      personal_token: tok
      header_unique_name: agent-1
    - service: carrier-pigeon
      url: https://example.com/hook
      message: hi
"#
}

#[test]
fn test_valid_config_parses() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let settings = config::from_str(sample_config()).unwrap();

    assert_eq!(settings.version, "1.0");
    assert_eq!(settings.rest.version, "v0");
    assert_eq!(settings.main.port, 8888);
    assert_eq!(settings.main.polling_interval, 15);

    let repo = &settings.main.watched_git_repositories[0];
    assert_eq!(repo.id, "webapp");
    assert_eq!(repo.password.as_deref(), Some("s3cret"));
    assert_eq!(repo.tags, None);
    assert_eq!(repo.paths.len(), 2);

    let recipe = &settings.main.docker_stack_recipe;
    assert_eq!(recipe.workdir, Workdir::Temporary);
    assert_eq!(recipe.stack_file, "stack.yml");
    assert_eq!(recipe.excluded_services, vec!["webclient".to_string()]);
    assert_eq!(recipe.services_prefix.as_deref(), Some("stg"));

    assert_eq!(settings.main.portainer[0].endpoint_id, -1);
    assert_eq!(settings.main.notifications.len(), 2);
    assert_eq!(
        settings.main.notifications[0].service,
        NotificationKind::Mattermost
    );
    assert_eq!(
        settings.main.notifications[1].service,
        NotificationKind::Unknown("carrier-pigeon".to_string())
    );
}

#[test]
fn test_missing_env_var_is_fatal() {
    std::env::remove_var("STACKWATCH_TEST_GIT_PASSWORD_MISSING");
    let raw = sample_config().replace(
        "STACKWATCH_TEST_GIT_PASSWORD",
        "STACKWATCH_TEST_GIT_PASSWORD_MISSING",
    );
    let err = config::from_str(&raw).expect_err("must fail");
    assert!(err
        .to_string()
        .contains("STACKWATCH_TEST_GIT_PASSWORD_MISSING"));
}

#[test]
fn test_unknown_top_level_key_rejected() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let raw = format!("{}\nbogus: true\n", sample_config());
    assert!(config::from_str(&raw).is_err());
}

#[test]
fn test_unsupported_version_rejected() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let raw = sample_config().replace("version: \"1.0\"", "version: \"2.0\"");
    let err = config::from_str(&raw).expect_err("must fail");
    assert!(err.to_string().contains("2.0"));
}

#[test]
fn test_zero_polling_interval_rejected() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let raw = sample_config().replace("polling_interval: 15", "polling_interval: 0");
    assert!(config::from_str(&raw).is_err());
}

#[test]
fn test_recipe_with_unknown_repo_id_rejected() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let raw = sample_config().replace("- id: webapp\n        paths:", "- id: nosuch\n        paths:");
    assert!(config::from_str(&raw).is_err());
}

#[test]
fn test_workdir_can_name_a_repo() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let raw = sample_config().replace("workdir: temp", "workdir: webapp");
    let settings = config::from_str(&raw).unwrap();
    assert_eq!(
        settings.main.docker_stack_recipe.workdir,
        Workdir::Repo("webapp".to_string())
    );
}

#[test]
fn test_workdir_naming_unknown_repo_rejected() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let raw = sample_config().replace("workdir: temp", "workdir: nosuch");
    assert!(config::from_str(&raw).is_err());
}

#[test]
fn test_uppercase_stack_name_rejected() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let raw = sample_config().replace("stack_name: deployment-agent", "stack_name: Deployment-Agent");
    assert!(config::from_str(&raw).is_err());
}

#[test]
fn test_notifier_keeps_only_enabled_mattermost_targets() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let settings = config::from_str(sample_config()).unwrap();
    let notifier =
        Notifier::from_settings(&settings.main.notifications, Duration::from_secs(5)).unwrap();
    assert_eq!(notifier.target_count(), 1);
}

#[test]
fn test_empty_command_is_treated_as_absent() {
    std::env::set_var("STACKWATCH_TEST_GIT_PASSWORD", "s3cret");
    let raw = sample_config().replace(
        "command: \"cp services/docker-compose.yml stack.yml\"",
        "command: \"\"",
    );
    let settings = config::from_str(&raw).unwrap();
    assert_eq!(settings.main.docker_stack_recipe.effective_command(), None);
}
