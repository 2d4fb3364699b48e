//! Task recipe DSL submitted to the downstream scheduler
//!
//! A recipe is a tree of composed actions (downloads, uploads, runs,
//! combinators) plus the resource and callback fields the scheduler needs
//! to place and report the task. The tree is a closed sum: the scheduler
//! interprets it, the stager only assembles it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::staging::{EgressRule, EnvironmentVariable};

/// One node of the recipe action tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Download(DownloadAction),
    Upload(UploadAction),
    Run(RunAction),
    Parallel(ParallelAction),
    Serial(SerialAction),
    Try(TryAction),
    EmitProgress(EmitProgressAction),
    Timeout(TimeoutAction),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadAction {
    /// Human-readable label used in progress output
    #[serde(skip_serializing_if = "String::is_empty")]
    pub artifact: String,

    pub from: String,
    pub to: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub cache_key: String,

    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadAction {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub artifact: String,

    pub from: String,
    pub to: String,
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunAction {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<EnvironmentVariable>,
    pub resource_limits: ResourceLimits,
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nofile: Option<u64>,
}

/// All children run concurrently; the node fails if any child fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelAction {
    pub actions: Vec<Action>,
}

/// Children run left to right, stopping at the first failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialAction {
    pub actions: Vec<Action>,
}

/// Runs the child and swallows its failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryAction {
    pub action: Box<Action>,
}

/// Wraps a child with human-readable progress banners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitProgressAction {
    pub action: Box<Action>,

    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub start_message: String,

    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub success_message: String,

    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub failure_message: String,
}

/// Fails the child if wall-clock time exceeds the budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutAction {
    pub action: Box<Action>,
    pub timeout_ms: u64,
}

pub fn serial(actions: Vec<Action>) -> Action {
    Action::Serial(SerialAction { actions })
}

pub fn parallel(actions: Vec<Action>) -> Action {
    Action::Parallel(ParallelAction { actions })
}

pub fn try_action(action: Action) -> Action {
    Action::Try(TryAction {
        action: Box::new(action),
    })
}

pub fn emit_progress_for(
    action: Action,
    start_message: &str,
    success_message: &str,
    failure_message: &str,
) -> Action {
    Action::EmitProgress(EmitProgressAction {
        action: Box::new(action),
        start_message: start_message.to_string(),
        success_message: success_message.to_string(),
        failure_message: failure_message.to_string(),
    })
}

pub fn with_timeout(action: Action, timeout: Duration) -> Action {
    Action::Timeout(TimeoutAction {
        action: Box::new(action),
        timeout_ms: timeout.as_millis() as u64,
    })
}

/// RootFS identifier for a stack preloaded on the cells
pub fn preloaded_root_fs(stack: &str) -> String {
    format!("preloaded:{}", stack)
}

/// Scheduler-agnostic description of a staging task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefinition {
    pub root_fs: String,

    pub memory_mb: u32,
    pub disk_mb: u32,

    #[serde(skip_serializing_if = "is_zero")]
    pub cpu_weight: u32,

    pub privileged: bool,

    pub log_source: String,
    pub log_guid: String,

    /// Left empty on purpose: staging tasks must not emit app metrics.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub metrics_guid: String,

    pub result_file: String,

    pub completion_callback_url: String,

    /// Opaque to the scheduler; echoed back in the completion callback
    pub annotation: String,

    pub egress_rules: Vec<EgressRule>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// A task definition addressed for submission to the scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequest {
    pub task_guid: String,
    pub domain: String,

    #[serde(flatten)]
    pub definition: TaskDefinition,
}

impl TaskRequest {
    /// The serial actions under the recipe's outer timeout wrapper.
    ///
    /// Every staging recipe has the shape `Timeout(Serial(...))`; this is
    /// the test- and log-friendly accessor for the interesting part.
    pub fn serial_actions(&self) -> &[Action] {
        match self.definition.action {
            Some(Action::Timeout(TimeoutAction { ref action, .. })) => match **action {
                Action::Serial(SerialAction { ref actions }) => actions,
                _ => &[],
            },
            _ => &[],
        }
    }
}
