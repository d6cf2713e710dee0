//! Metrics recording.
//!
//! Thin wrapper over the `metrics` facade; exporters are a deployment
//! concern wired by whoever embeds the gateway.

use std::time::Duration;

/// Records gateway metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Construct a recorder.
    pub fn new() -> Self {
        Self
    }

    /// One tool call completed.
    pub fn record_tool_call(
        &self,
        server: &str,
        tool: &str,
        duration: Duration,
        is_error: bool,
    ) {
        metrics::counter!(
            "manifold_tool_calls_total",
            "server" => server.to_owned(),
            "tool" => tool.to_owned(),
            "error" => is_error.to_string(),
        )
        .increment(1);
        metrics::histogram!(
            "manifold_tool_call_duration_seconds",
            "server" => server.to_owned(),
            "tool" => tool.to_owned(),
        )
        .record(duration.as_secs_f64());
    }

    /// A session opened or closed.
    pub fn record_session_event(&self, opened: bool) {
        let delta = if opened { 1.0 } else { -1.0 };
        metrics::gauge!("manifold_open_sessions").increment(delta);
    }

    /// A full target reload ran.
    pub fn record_reload(&self) {
        metrics::counter!("manifold_target_reloads_total").increment(1);
    }

    /// A config transaction settled.
    pub fn record_config_apply(&self, outcome: &'static str) {
        metrics::counter!(
            "manifold_config_applies_total",
            "outcome" => outcome,
        )
        .increment(1);
    }
}
