//! The "external request-log interface" of spec §6/§4.5 step 11. The
//! database-backed log store and its query surface (`GET/DELETE /logs`,
//! `GET /stats`) are named Non-goals — this module gives the Forwarder a
//! real, concrete collaborator to call (`RequestLogSink`) and one
//! production-shaped implementation that doesn't require standing up a
//! database, matching §5's "fire-and-forget dispatch to a background
//! writer" requirement via a bounded channel and a detached drain task.
//!
//! Grounded in the teacher's `structured_logging` device
//! (`device/builtin/structured_logging.rs`) for the shape of a per-request
//! structured log event, and in `server/setup.rs`'s pattern of spawning a
//! long-lived background task off the control-plane runtime.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::family::Family;

/// SSE-derived token usage, extracted from the tail of a streamed response
/// (spec §4.5 step 10; Anthropic `message_stop`, OpenAI trailing `usage`).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// One completed request, as logged after the Forwarder finishes (spec
/// §4.5 step 11).
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub request_id: String,
    pub family: Family,
    pub endpoint: Option<String>,
    pub method: String,
    pub path: String,
    pub status: Option<u16>,
    pub duration_ms: u64,
    pub streaming: bool,
    pub sanitized_blocks_removed: u32,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

/// The Forwarder's only coupling to "persist this request somewhere" — the
/// actual request-log database is a named Non-goal and lives outside this
/// crate; this trait is the seam a real sink would implement against.
pub trait RequestLogSink: Send + Sync {
    fn record(&self, entry: RequestLogEntry);
}

/// Emits a structured `tracing` event per request and never blocks the
/// Forwarder: `record` just pushes onto a bounded channel drained by a
/// background task, matching spec §5's fire-and-forget dispatch. A full
/// channel drops the oldest-style: the entry is logged as dropped and the
/// request itself is never slowed down or failed because of logging.
pub struct TracingRequestLogSink {
    tx: mpsc::Sender<RequestLogEntry>,
}

impl TracingRequestLogSink {
    /// Spawns the background drain task and returns the sink. The task runs
    /// until every sender (including the one held by this sink) is dropped.
    pub fn spawn(buffer: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(buffer);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                info!(
                    event = "request_complete",
                    request_id = %entry.request_id,
                    family = %entry.family,
                    endpoint = entry.endpoint.as_deref().unwrap_or(""),
                    method = %entry.method,
                    path = %entry.path,
                    status = entry.status,
                    duration_ms = entry.duration_ms,
                    streaming = entry.streaming,
                    sanitized_blocks_removed = entry.sanitized_blocks_removed,
                    input_tokens = entry.usage.and_then(|u| u.input_tokens),
                    output_tokens = entry.usage.and_then(|u| u.output_tokens),
                    error = entry.error.as_deref(),
                );
            }
        });
        Self { tx }
    }
}

impl RequestLogSink for TracingRequestLogSink {
    fn record(&self, entry: RequestLogEntry) {
        if self.tx.try_send(entry).is_err() {
            warn!("request log channel full or closed; dropping completed-request record");
        }
    }
}
