// ABOUTME: Tuning knobs for the action execution engine
// ABOUTME: Serde-backed settings with sensible defaults, no persistence of their own

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning parameters.
///
/// Deserializable so a host application can load overrides from its own
/// config; every field has a default so `EngineSettings::default()` is a
/// complete working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Sampling window for streaming action deliveries: at most one
    /// execution per window per action.
    #[serde(default = "default_streaming_sample_ms")]
    pub streaming_sample_ms: u64,

    /// Poll interval of the idle tracker's safety-net loop.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Default timeout for `wait_for_message_idle` when the caller passes none.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Prefix of the out-of-band completion marker echoed after each shell
    /// command. Must not collide with expected command output.
    #[serde(default = "default_shell_marker_prefix")]
    pub shell_marker_prefix: String,

    /// Upper bound on captured output retained per shell command.
    #[serde(default = "default_max_shell_output_bytes")]
    pub max_shell_output_bytes: usize,
}

fn default_streaming_sample_ms() -> u64 {
    100
}

fn default_idle_poll_ms() -> u64 {
    250
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_shell_marker_prefix() -> String {
    "__atelier_done__".to_string()
}

fn default_max_shell_output_bytes() -> usize {
    2 * 1024 * 1024
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            streaming_sample_ms: default_streaming_sample_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            shell_marker_prefix: default_shell_marker_prefix(),
            max_shell_output_bytes: default_max_shell_output_bytes(),
        }
    }
}

impl EngineSettings {
    pub fn streaming_sample_window(&self) -> Duration {
        Duration::from_millis(self.streaming_sample_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}
