//! Trace sink for per-step spans.
//!
//! A run opens one trace; every step records a span with its input and output
//! summaries. The trace id ends up on the draft and the final email.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Open a trace for a run. `None` when tracing is disabled.
    async fn start_trace(&self, session_id: &str) -> Option<String>;

    async fn record_span(&self, trace_id: &str, step: &str, input: &serde_json::Value, output: &serde_json::Value);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTraceSink;

#[async_trait]
impl TraceSink for NoopTraceSink {
    async fn start_trace(&self, _session_id: &str) -> Option<String> {
        None
    }

    async fn record_span(&self, _trace_id: &str, _step: &str, _input: &serde_json::Value, _output: &serde_json::Value) {}
}

/// Emits spans as `tracing` events under the `mail_crew::trace` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTraceSink;

#[async_trait]
impl TraceSink for LogTraceSink {
    async fn start_trace(&self, session_id: &str) -> Option<String> {
        let trace_id = Uuid::new_v4().to_string();
        info!(target: "mail_crew::trace", session_id, trace_id = %trace_id, "Trace started");
        Some(trace_id)
    }

    async fn record_span(&self, trace_id: &str, step: &str, input: &serde_json::Value, output: &serde_json::Value) {
        info!(
            target: "mail_crew::trace",
            trace_id,
            step,
            input = %input,
            output = %output,
            "Span"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_sink_has_no_trace() {
        assert!(NoopTraceSink.start_trace("s").await.is_none());
    }

    #[tokio::test]
    async fn log_sink_issues_uuid_trace_ids() {
        let a = LogTraceSink.start_trace("s").await.unwrap();
        let b = LogTraceSink.start_trace("s").await.unwrap();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
        LogTraceSink
            .record_span(&a, "draft", &serde_json::json!({}), &serde_json::json!({"ok": true}))
            .await;
    }
}
