//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

/// Main application options
///
/// Everything that is not part of the configuration file schema: base paths
/// and the operational deadlines.
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Base path for git working copies and the recipe scratch directory
    pub base_dir: PathBuf,

    /// Deadline for each outbound HTTP call
    pub http_timeout: Duration,

    /// Deadline for git subprocesses
    pub git_timeout: Duration,

    /// Deadline for the recipe subprocess
    pub recipe_timeout: Duration,

    /// Deadline for the post-deploy stack status verification
    pub verify_timeout: Duration,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("stackwatch"),
            http_timeout: Duration::from_secs(30),
            git_timeout: Duration::from_secs(120),
            recipe_timeout: Duration::from_secs(120),
            verify_timeout: Duration::from_secs(60),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
        }
    }
}
