//! Outbound HTTP clients

pub mod cc_client;
pub mod consul;
pub mod task_client;
