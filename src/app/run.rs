//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, ServerOptions};
use crate::config::Settings;
use crate::errors::AgentError;
use crate::notifier::Notifier;
use crate::portainer::PortainerClient;
use crate::recipe::RecipeEngine;
use crate::reconciler::{self, Reconciler, StackPublisher};
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::shutdown::{shutdown_channel, ShutdownHandle};
use crate::watchers::git::GitWatcher;
use crate::watchers::registry::RegistryWatcher;

const SERVICE_NAME: &str = "stackwatch";

/// Run the controller until the shutdown signal resolves.
pub async fn run(
    settings: Settings,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing stackwatch...");

    let (shutdown_handle, shutdown_token) = shutdown_channel();

    tokio::fs::create_dir_all(&options.base_dir).await?;

    let main = &settings.main;

    let git_watcher = Arc::new(GitWatcher::from_settings(
        main,
        &options.base_dir.join("repos"),
        options.git_timeout,
    )?);

    let registry_watcher = Arc::new(RegistryWatcher::new(
        main.docker_private_registries.clone(),
        options.http_timeout,
    )?);

    let recipe_engine = Arc::new(RecipeEngine::new(
        main.docker_stack_recipe.clone(),
        &options.base_dir,
        options.recipe_timeout,
    ));

    let mut publishers: Vec<Arc<dyn StackPublisher>> = Vec::new();
    for portainer in &main.portainer {
        publishers.push(Arc::new(PortainerClient::new(
            portainer.clone(),
            options.http_timeout,
            options.verify_timeout,
        )?));
    }

    let notifier = Arc::new(Notifier::from_settings(
        &main.notifications,
        options.http_timeout,
    )?);
    info!("{} notification target(s) configured", notifier.target_count());

    let reconciler = Arc::new(Reconciler::new(
        git_watcher,
        registry_watcher,
        recipe_engine,
        publishers,
        notifier,
        reconciler::Options {
            polling_interval: Duration::from_secs(main.polling_interval),
            ..Default::default()
        },
    ));

    // the OpenAPI document is best-effort; the health surface works without it
    let openapi = match tokio::fs::read_to_string(&settings.rest.location).await {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(
                "cannot read OpenAPI document at {}: {}",
                settings.rest.location, e
            );
            None
        }
    };

    let server_state = Arc::new(ServerState {
        status: reconciler.status(),
        service_name: SERVICE_NAME.to_string(),
        api_version: settings.rest.version.clone(),
        openapi,
    });

    let server_options = ServerOptions {
        host: main.host.clone(),
        port: main.port,
    };
    let server_handle = serve(&server_options, server_state, {
        let token = shutdown_token.clone();
        async move { token.cancelled().await }
    })
    .await?;

    let reconciler_handle = tokio::spawn({
        let reconciler = reconciler.clone();
        let token = shutdown_token.clone();
        async move {
            reconciler.run(tokio::time::sleep, token).await;
        }
    });

    // wait for the shutdown signal
    shutdown_signal.await;
    info!("Shutting down stackwatch...");
    shutdown(
        shutdown_handle,
        reconciler_handle,
        server_handle,
        options.max_shutdown_delay,
    )
    .await
}

async fn shutdown(
    handle: ShutdownHandle,
    reconciler_handle: JoinHandle<()>,
    server_handle: JoinHandle<Result<(), AgentError>>,
    max_delay: Duration,
) -> Result<(), AgentError> {
    handle.trigger();

    let join_all = async {
        reconciler_handle
            .await
            .map_err(|e| AgentError::Shutdown(e.to_string()))?;
        server_handle
            .await
            .map_err(|e| AgentError::Shutdown(e.to_string()))??;
        Ok::<(), AgentError>(())
    };

    match tokio::time::timeout(max_delay, join_all).await {
        Ok(result) => {
            result?;
            info!("Shutdown complete");
            Ok(())
        }
        Err(_) => {
            error!("Shutdown timed out after {:?}, forcing shutdown...", max_delay);
            std::process::exit(1);
        }
    }
}
