//! Main application run loop

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::backend::buildpack::BuildpackBackend;
use crate::backend::docker::DockerBackend;
use crate::backend::Backend;
use crate::errors::StagerError;
use crate::http::cc_client::CcClient;
use crate::http::consul::DockerRegistryClient;
use crate::http::task_client::{HttpTaskClient, TaskClient};
use crate::models::staging::{BUILDPACK_LIFECYCLE_NAME, DOCKER_LIFECYCLE_NAME};
use crate::nats::client::NatsClient;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::inbox;

/// Run the staging coordinator
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), StagerError> {
    info!("Initializing stager...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start stager: {}", e);
        drop(shutdown_tx);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    info!("Listening for staging requests!");

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Construct every backend the coordinator serves, keyed by lifecycle
pub fn build_backends(
    config: &crate::backend::Config,
) -> Result<HashMap<&'static str, Arc<dyn Backend>>, StagerError> {
    let registry_client = DockerRegistryClient::new(&config.consul_cluster)?;

    let mut backends: HashMap<&'static str, Arc<dyn Backend>> = HashMap::new();
    backends.insert(
        BUILDPACK_LIFECYCLE_NAME,
        Arc::new(BuildpackBackend::new(config.clone())),
    );
    backends.insert(
        DOCKER_LIFECYCLE_NAME,
        Arc::new(DockerBackend::new(config.clone(), registry_client)),
    );
    Ok(backends)
}

// =============================== INITIALIZATION ================================== //

// Startup order matters: bus client first, then the inbox consuming it,
// then the callback server. Shutdown runs the same chain in reverse.
async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), StagerError> {
    let backends = build_backends(&options.backend)?;

    let cc_client = Arc::new(CcClient::new(&options.cc)?);
    let task_client: Arc<dyn TaskClient> = Arc::new(HttpTaskClient::new(&options.diego_api_url)?);

    let nats_client = NatsClient::connect(&options.nats).await?;
    let subscription = nats_client.subscribe_staging_start().await?;
    shutdown_manager.with_nats_client(nats_client)?;

    init_inbox_worker(
        subscription,
        backends.clone(),
        task_client.clone(),
        cc_client.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_server(
        options,
        backends,
        cc_client,
        task_client,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    Ok(())
}

fn init_inbox_worker(
    subscription: async_nats::Subscriber,
    backends: HashMap<&'static str, Arc<dyn Backend>>,
    task_client: Arc<dyn TaskClient>,
    cc_client: Arc<CcClient>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), StagerError> {
    info!("Initializing inbox worker...");

    let inbox_handle = tokio::spawn(async move {
        inbox::run(
            subscription,
            Arc::new(backends),
            task_client,
            cc_client,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_inbox_worker_handle(inbox_handle)
}

async fn init_server(
    options: &AppOptions,
    backends: HashMap<&'static str, Arc<dyn Backend>>,
    cc_client: Arc<CcClient>,
    task_client: Arc<dyn TaskClient>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), StagerError> {
    info!("Initializing callback server...");

    let server_state = ServerState::new(
        backends,
        cc_client,
        task_client,
        options.server.max_concurrent_callbacks,
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    lifecycle_options: LifecycleOptions,
    nats_client: Option<NatsClient>,
    inbox_worker_handle: Option<JoinHandle<()>>,
    server_handle: Option<JoinHandle<Result<(), StagerError>>>,
}

impl ShutdownManager {
    pub fn new(lifecycle_options: LifecycleOptions) -> Self {
        Self {
            lifecycle_options,
            nats_client: None,
            inbox_worker_handle: None,
            server_handle: None,
        }
    }

    pub fn with_nats_client(&mut self, client: NatsClient) -> Result<(), StagerError> {
        if self.nats_client.is_some() {
            return Err(StagerError::ShutdownError("nats_client already set".to_string()));
        }
        self.nats_client = Some(client);
        Ok(())
    }

    pub fn with_inbox_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), StagerError> {
        if self.inbox_worker_handle.is_some() {
            return Err(StagerError::ShutdownError("inbox_handle already set".to_string()));
        }
        self.inbox_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), StagerError>>,
    ) -> Result<(), StagerError> {
        if self.server_handle.is_some() {
            return Err(StagerError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), StagerError> {
        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), StagerError> {
        info!("Shutting down stager...");

        // 1. Callback server
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| StagerError::ShutdownError(e.to_string()))??;
        }

        // 2. Inbox worker
        if let Some(handle) = self.inbox_worker_handle.take() {
            handle
                .await
                .map_err(|e| StagerError::ShutdownError(e.to_string()))?;
        }

        // 3. NATS client
        if let Some(client) = self.nats_client.take() {
            client.flush().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
