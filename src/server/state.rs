//! Server state

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::backend::Backend;
use crate::http::cc_client::CcClient;
use crate::http::task_client::TaskClient;

/// Server state shared across handlers
pub struct ServerState {
    pub backends: HashMap<&'static str, Arc<dyn Backend>>,
    pub cc_client: Arc<CcClient>,
    pub task_client: Arc<dyn TaskClient>,

    /// Bounds concurrent callback handlers so a callback burst cannot
    /// overload the Cloud Controller.
    pub cc_permits: Semaphore,
}

impl ServerState {
    pub fn new(
        backends: HashMap<&'static str, Arc<dyn Backend>>,
        cc_client: Arc<CcClient>,
        task_client: Arc<dyn TaskClient>,
        max_concurrent_callbacks: usize,
    ) -> Self {
        Self {
            backends,
            cc_client,
            task_client,
            cc_permits: Semaphore::new(max_concurrent_callbacks),
        }
    }
}
