//! NATS client implementation

use tracing::info;

use crate::errors::StagerError;
use crate::nats::subjects;

/// NATS cluster address
#[derive(Debug, Clone)]
pub struct NatsAddress {
    /// Comma-separated list of `nats://ip:port` addresses
    pub addresses: String,
    pub username: String,
    pub password: String,
}

impl Default for NatsAddress {
    fn default() -> Self {
        Self {
            addresses: "".to_string(),
            username: "".to_string(),
            password: "".to_string(),
        }
    }
}

/// NATS client wrapper
pub struct NatsClient {
    client: async_nats::Client,
}

impl NatsClient {
    /// Connect to the NATS cluster. Reconnection after the initial
    /// connect is handled by the underlying client.
    pub async fn connect(address: &NatsAddress) -> Result<Self, StagerError> {
        if address.addresses.is_empty() {
            return Err(StagerError::NatsError(
                "NATS addresses are not configured".to_string(),
            ));
        }

        let mut options = async_nats::ConnectOptions::new();
        if !address.username.is_empty() {
            options = options.user_and_password(
                address.username.clone(),
                address.password.clone(),
            );
        }

        // Flag values arrive as bare ip:port pairs; the client wants
        // explicit nats:// URLs.
        let servers: Vec<String> = address
            .addresses
            .split(',')
            .map(|addr| {
                let addr = addr.trim();
                if addr.contains("://") {
                    addr.to_string()
                } else {
                    format!("nats://{}", addr)
                }
            })
            .collect();

        let client = options
            .connect(servers.join(",").as_str())
            .await
            .map_err(|e| StagerError::NatsError(e.to_string()))?;

        info!("Connected to NATS: {}", address.addresses);
        Ok(Self { client })
    }

    /// Subscribe to the staging-start subject
    pub async fn subscribe_staging_start(&self) -> Result<async_nats::Subscriber, StagerError> {
        let subscriber = self
            .client
            .subscribe(subjects::STAGING_START)
            .await
            .map_err(|e| StagerError::NatsError(e.to_string()))?;
        info!("Subscribed to: {}", subjects::STAGING_START);
        Ok(subscriber)
    }

    /// Flush pending protocol messages before shutdown
    pub async fn flush(&self) -> Result<(), StagerError> {
        self.client
            .flush()
            .await
            .map_err(|e| StagerError::NatsError(e.to_string()))
    }
}
