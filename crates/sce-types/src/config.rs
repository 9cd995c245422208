//! Engine configuration types.
//!
//! `EngineConfig` represents the `engine.toml` that controls platform
//! defaults for timeouts, task queues and retries.

use serde::{Deserialize, Serialize};

use crate::workflow::RetryPolicy;

/// Top-level configuration for the execution engine.
///
/// All fields have defaults, so an empty file is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Start-to-close timeout for activity and subflow calls when the node sets none.
    #[serde(default = "default_activity_timeout_secs")]
    pub default_activity_timeout_secs: u64,

    /// Timeout for `ai_action` calls when the node sets none.
    #[serde(default = "default_ai_action_timeout_secs")]
    pub ai_action_timeout_secs: u64,

    /// Timeout for external automation calls when the node sets none.
    #[serde(default = "default_automation_timeout_secs")]
    pub automation_timeout_secs: u64,

    /// How long a human task waits for a decision before timing out.
    #[serde(default = "default_human_task_timeout_secs")]
    pub human_task_timeout_secs: u64,

    /// Timer duration for a `wait` node without `duration_seconds`.
    #[serde(default = "default_wait_secs")]
    pub default_wait_secs: u64,

    /// Task queue hint for AI calls.
    #[serde(default = "default_ai_task_queue")]
    pub ai_task_queue: String,

    /// Task queue hint for external automation calls.
    #[serde(default = "default_integration_task_queue")]
    pub integration_task_queue: String,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Retry policy applied when a node has none.
    #[serde(default)]
    pub default_retry: RetryPolicy,
}

fn default_activity_timeout_secs() -> u64 {
    30
}

fn default_ai_action_timeout_secs() -> u64 {
    120
}

fn default_automation_timeout_secs() -> u64 {
    300
}

fn default_human_task_timeout_secs() -> u64 {
    86_400
}

fn default_wait_secs() -> u64 {
    60
}

fn default_ai_task_queue() -> String {
    "ai-actions".to_string()
}

fn default_integration_task_queue() -> String {
    "integrations".to_string()
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_activity_timeout_secs: default_activity_timeout_secs(),
            ai_action_timeout_secs: default_ai_action_timeout_secs(),
            automation_timeout_secs: default_automation_timeout_secs(),
            human_task_timeout_secs: default_human_task_timeout_secs(),
            default_wait_secs: default_wait_secs(),
            ai_task_queue: default_ai_task_queue(),
            integration_task_queue: default_integration_task_queue(),
            event_bus_capacity: default_event_bus_capacity(),
            default_retry: RetryPolicy::default(),
        }
    }
}
