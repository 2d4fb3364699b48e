//! Application configuration options

use std::time::Duration;

use crate::backend;
use crate::http::cc_client::CcClientOptions;
use crate::nats::client::NatsAddress;
use crate::server::serve::ServerOptions;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// NATS cluster to consume staging requests from
    pub nats: NatsAddress,

    /// Cloud Controller client configuration
    pub cc: CcClientOptions,

    /// Base URL of the downstream scheduler's task API
    pub diego_api_url: String,

    /// Completion-callback server configuration
    pub server: ServerOptions,

    /// Recipe builder configuration
    pub backend: backend::Config,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            nats: NatsAddress::default(),
            cc: CcClientOptions::default(),
            diego_api_url: String::new(),
            server: ServerOptions::default(),
            backend: backend::Config::default(),
        }
    }
}

/// Lifecycle options for the coordinator process
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}
