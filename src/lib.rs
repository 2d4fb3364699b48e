//! Stager Library
//!
//! Core modules for the staging coordinator: accepts staging requests
//! from the Cloud Controller over the message bus, turns each into a task
//! recipe for the downstream scheduler, and correlates asynchronous task
//! completions back to the Cloud Controller.

pub mod app;
pub mod backend;
pub mod errors;
pub mod http;
pub mod logs;
pub mod models;
pub mod nats;
pub mod server;
pub mod utils;
pub mod workers;
