//! Forwarder (spec §4.5): the per-family request-rewrite pipeline. This
//! module holds the pure transforms (body sanitisation, header rewrite,
//! upstream URL construction, SSE usage extraction) plus the stateful
//! service object that ties Selector + Health Tracker + Freeze Manager +
//! the request-log sink together. The actual streaming I/O — reading the
//! client body, teeing the upstream response to the client while
//! accumulating a copy — lives in the pingora `ProxyHttp` implementation in
//! [`crate::server`], which calls into the functions here at each step.
//!
//! Grounded in the teacher's device pipeline for the "rewrite, then proxy"
//! shape (`device/builtin/request_filter.rs`, `device/core/pipeline.rs`),
//! generalized from a pluggable device chain to this spec's fixed
//! five-step pipeline, and in `traffic_management/manager.rs`'s
//! success/failure reporting for how a completed attempt feeds back into
//! health state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::{header, HeaderMap, HeaderValue};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::{ConfigStore, EndpointProfile};
use crate::family::Family;
use crate::freeze::{FreezeManager, Outcome};
use crate::health::HealthTracker;
use crate::requestlog::{RequestLogEntry, RequestLogSink, TokenUsage};
use crate::selection::Selector;

/// Error kinds from spec §7 that surface directly out of the forwarding
/// pipeline (as opposed to `ConfigError`, which covers the Config Store).
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no upstream available")]
    NoUpstreamAvailable,
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),
    #[error("invalid endpoint base url: {0}")]
    InvalidBaseUrl(String),
}

impl ForwardError {
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::NoUpstreamAvailable => "no-upstream-available",
            ForwardError::UpstreamTransport(_) => "upstream-transport",
            ForwardError::InvalidBaseUrl(_) => "upstream-transport",
        }
    }
}

/// Result of the Anthropic-only body sanitiser (spec §4.5 step 4).
pub struct SanitizeOutcome {
    /// Bytes to forward upstream: the original bytes, byte-exact, if
    /// nothing was removed; otherwise a re-serialised body.
    pub body: Bytes,
    pub removed_blocks: u32,
}

/// Walks `messages[]` and `previous_messages[]` (if present), dropping any
/// `content[]` block whose `type` (case-insensitive) is `thinking`,
/// `assistant_thinking`, or `reasoning`. Malformed JSON is non-fatal: the
/// raw bytes are returned unchanged (spec's `sanitise` error kind is logged
/// by the caller, never fatal to the request).
pub fn sanitize_anthropic_body(original: &[u8]) -> SanitizeOutcome {
    let Ok(mut value) = serde_json::from_slice::<Value>(original) else {
        return SanitizeOutcome {
            body: Bytes::copy_from_slice(original),
            removed_blocks: 0,
        };
    };

    let mut removed = 0u32;
    if let Some(obj) = value.as_object_mut() {
        for key in ["messages", "previous_messages"] {
            if let Some(Value::Array(messages)) = obj.get_mut(key) {
                for message in messages.iter_mut() {
                    let Some(msg_obj) = message.as_object_mut() else {
                        continue;
                    };
                    let Some(Value::Array(content)) = msg_obj.get_mut("content") else {
                        continue;
                    };
                    let before = content.len();
                    content.retain(|block| !is_thinking_block(block));
                    removed += (before - content.len()) as u32;
                }
            }
        }
    }

    if removed == 0 {
        return SanitizeOutcome {
            body: Bytes::copy_from_slice(original),
            removed_blocks: 0,
        };
    }

    match serde_json::to_vec(&value) {
        Ok(bytes) => SanitizeOutcome {
            body: Bytes::from(bytes),
            removed_blocks: removed,
        },
        Err(_) => SanitizeOutcome {
            body: Bytes::copy_from_slice(original),
            removed_blocks: 0,
        },
    }
}

fn is_thinking_block(block: &Value) -> bool {
    block
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| {
            let lower = t.to_ascii_lowercase();
            matches!(lower.as_str(), "thinking" | "assistant_thinking" | "reasoning")
        })
}

/// Header rewrite (spec §4.5 step 5). `upstream_host` is `host[:port]`
/// parsed from the endpoint's base URL.
pub fn rewrite_headers(
    inbound: &HeaderMap,
    endpoint: &EndpointProfile,
    family: Family,
    upstream_host: &str,
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if matches!(
            name.as_str(),
            "host" | "content-length" | "authorization" | "x-api-key"
        ) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Ok(v) = HeaderValue::from_str(upstream_host) {
        out.insert(header::HOST, v);
    }
    out.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

    match (&endpoint.api_key, &endpoint.auth_token) {
        (Some(key), _) => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {key}")) {
                out.insert(header::AUTHORIZATION, v);
            }
            if !out.contains_key("x-api-key")
                && let Ok(v) = HeaderValue::from_str(key)
            {
                out.insert("x-api-key", v);
            }
        }
        (None, Some(token)) => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {token}")) {
                out.insert(header::AUTHORIZATION, v);
            }
        }
        (None, None) => {
            // No credentials configured on the endpoint: pass the client's
            // own credentials through unchanged.
            if let Some(v) = inbound.get(header::AUTHORIZATION) {
                out.insert(header::AUTHORIZATION, v.clone());
            }
            if let Some(v) = inbound.get("x-api-key") {
                out.insert("x-api-key", v.clone());
            }
        }
    }

    // Propagate client `x-api-key` / `openai-organization` when the endpoint
    // didn't already supply its own credential for that slot.
    if let Some(v) = inbound.get("x-api-key") {
        out.entry("x-api-key").or_insert_with(|| v.clone());
    }
    if let Some(v) = inbound.get("openai-organization") {
        out.insert("openai-organization", v.clone());
    }

    if family.is_anthropic() {
        if !out.contains_key("x-api-key")
            && let Some(auth) = out.get(header::AUTHORIZATION)
            && let Ok(s) = auth.to_str()
            && let Some(token) = s.strip_prefix("Bearer ")
            && let Ok(v) = HeaderValue::from_str(token)
        {
            out.insert("x-api-key", v);
        }
        out.insert(
            "anthropic-version",
            HeaderValue::from_static("2023-06-01"),
        );
    }

    out.remove(header::ACCEPT_ENCODING);

    out
}

/// `host[:port]` for the `Host` header, parsed from an endpoint's base URL.
pub fn upstream_host(base_url: &str) -> Result<String, ForwardError> {
    let url =
        Url::parse(base_url).map_err(|_| ForwardError::InvalidBaseUrl(base_url.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| ForwardError::InvalidBaseUrl(base_url.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Joins the endpoint base URL, the inbound path, and the inbound query
/// string verbatim (spec §4.5 step 6) — not `Url::join`, which would
/// normalise away a base URL that already carries its own path prefix.
pub fn build_upstream_url(
    base_url: &str,
    path: &str,
    query: Option<&str>,
) -> Result<Url, ForwardError> {
    let trimmed = base_url.trim_end_matches('/');
    let mut joined = format!("{trimmed}{path}");
    if let Some(q) = query {
        if !q.is_empty() {
            joined.push('?');
            joined.push_str(q);
        }
    }
    Url::parse(&joined).map_err(|_| ForwardError::InvalidBaseUrl(joined))
}

/// Whether the client asked for a streaming response (spec §4.5 step 7).
pub fn wants_streaming(inbound: &HeaderMap) -> bool {
    inbound
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|s| s.to_ascii_lowercase().contains("text/event-stream"))
}

/// Parses a completed SSE byte stream for token-usage metadata (spec §4.5
/// step 10): Anthropic's `message_stop` event carries `usage.input_tokens`/
/// `usage.output_tokens`; OpenAI's trailing chunk carries a top-level
/// `usage.prompt_tokens`/`usage.completion_tokens`. Malformed or partial
/// frames are skipped, never failed — this is a best-effort logging aid,
/// not part of the response contract.
pub fn parse_sse_usage(bytes: &[u8], family: Family) -> Option<TokenUsage> {
    let text = std::str::from_utf8(bytes).ok()?;
    let mut usage = None;
    let mut current_event: Option<&str> = None;

    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() {
            current_event = None;
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            current_event = Some(rest.trim());
            continue;
        }
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let data = rest.trim();
        if data.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(data) else {
            continue;
        };

        match family {
            Family::Anthropic => {
                let is_message_stop = current_event == Some("message_stop")
                    || value.get("type").and_then(Value::as_str) == Some("message_stop");
                if is_message_stop
                    && let Some(u) = value
                        .get("usage")
                        .or_else(|| value.get("message").and_then(|m| m.get("usage")))
                {
                    usage = Some(TokenUsage {
                        input_tokens: u.get("input_tokens").and_then(Value::as_u64),
                        output_tokens: u.get("output_tokens").and_then(Value::as_u64),
                    });
                }
            }
            Family::OpenAi => {
                if let Some(u) = value.get("usage") {
                    usage = Some(TokenUsage {
                        input_tokens: u.get("prompt_tokens").and_then(Value::as_u64),
                        output_tokens: u.get("completion_tokens").and_then(Value::as_u64),
                    });
                }
            }
        }
    }

    usage
}

/// Parses a non-streaming JSON response body for the same usage metadata
/// [`parse_sse_usage`] extracts from a stream: both families put a
/// top-level `usage` object on their non-streaming completions.
pub fn parse_json_usage(bytes: &[u8], family: Family) -> Option<TokenUsage> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let usage = value.get("usage")?;
    Some(match family {
        Family::Anthropic => TokenUsage {
            input_tokens: usage.get("input_tokens").and_then(Value::as_u64),
            output_tokens: usage.get("output_tokens").and_then(Value::as_u64),
        },
        Family::OpenAi => TokenUsage {
            input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
            output_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
        },
    })
}

pub(crate) fn probe_path(family: Family) -> &'static str {
    match family {
        Family::Anthropic => "/v1/models",
        Family::OpenAi => "/v1/models",
    }
}

fn truncate_preview(body: &str) -> String {
    const MAX: usize = 500;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

/// Full detail of one credential probe, as reported by the dashboard's
/// `POST /configs/{name}/test` (spec §6). `Forwarder::probe` discards all of
/// this but the bare [`Outcome`] for the re-probe loop, which only cares
/// whether to thaw or freeze.
pub struct ProbeReport {
    pub outcome: Outcome,
    pub status_code: Option<u16>,
    pub message: String,
    pub response_preview: Option<String>,
}

/// Ties Selector + Health Tracker + Freeze Manager + the request-log sink
/// together for one request. The streaming proxy loop in [`crate::server`]
/// drives the pipeline; this struct is its shared, cloneable handle to the
/// stateful collaborators.
pub struct Forwarder {
    pub config: Arc<ConfigStore>,
    pub health: Arc<HealthTracker>,
    pub selector: Arc<Selector>,
    pub freeze: Arc<FreezeManager>,
    pub log_sink: Arc<dyn RequestLogSink>,
    http_client: reqwest::Client,
}

/// Result of a fully-buffered (non-streaming) forward, used by the
/// dashboard's convenience proxy routes (spec §6).
pub struct BufferedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Forwarder {
    pub fn new(
        config: Arc<ConfigStore>,
        health: Arc<HealthTracker>,
        selector: Arc<Selector>,
        freeze: Arc<FreezeManager>,
        log_sink: Arc<dyn RequestLogSink>,
    ) -> Self {
        Self {
            config,
            health,
            selector,
            freeze,
            log_sink,
            http_client: reqwest::Client::builder()
                .build()
                .expect("default reqwest client configuration is always valid"),
        }
    }

    pub fn assign_request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Spec §4.5 step 2: consult the Config Store + Health Tracker + now
    /// through the Selector. `None` means "respond 503".
    pub fn select_endpoint(&self, family: Family) -> Option<EndpointProfile> {
        let pool = self.config.eligible_pool(family);
        let settings = self.config.snapshot(family).loadbalancer;
        let now_ms = Utc::now().timestamp_millis();
        self.selector
            .select(family, &pool, &self.health, &settings, now_ms)
    }

    /// Spec §4.5 steps 8–9 / §4.4: feed a completed attempt's outcome back
    /// into health tracking and, if warranted, the Freeze Manager.
    pub fn on_outcome(&self, family: Family, name: &str, outcome: Outcome) {
        self.freeze.on_outcome(family, name, outcome);
    }

    pub fn log(&self, entry: RequestLogEntry) {
        self.log_sink.record(entry);
    }

    /// Issues a synthetic probe against `profile`'s base URL (used by the
    /// re-probe loop, spec §4.4, and the dashboard's credential-test
    /// helper, spec §6). Reuses `on_outcome` so a successful probe thaws
    /// the endpoint exactly like a successful real request would.
    pub async fn probe(&self, family: Family, profile: &EndpointProfile, timeout: Duration) -> Outcome {
        self.probe_with_report(family, profile, timeout).await.outcome
    }

    /// Same probe as [`Forwarder::probe`], but returns the full detail the
    /// dashboard's credential-test endpoint reports back (spec §6).
    pub async fn probe_with_report(
        &self,
        family: Family,
        profile: &EndpointProfile,
        timeout: Duration,
    ) -> ProbeReport {
        let report = self.probe_inner(family, profile, timeout).await;
        self.on_outcome(family, &profile.name, report.outcome);
        report
    }

    async fn probe_inner(&self, family: Family, profile: &EndpointProfile, timeout: Duration) -> ProbeReport {
        let Ok(url) = build_upstream_url(&profile.base_url, probe_path(family), None) else {
            return ProbeReport {
                outcome: Outcome::Transport,
                status_code: None,
                message: "invalid upstream base URL".to_string(),
                response_preview: None,
            };
        };

        let mut request = self.http_client.get(url).timeout(timeout);
        if let Some(key) = &profile.api_key {
            request = request.header("x-api-key", key).bearer_auth(key);
        } else if let Some(token) = &profile.auth_token {
            request = request.bearer_auth(token);
        }
        if family.is_anthropic() {
            request = request.header("anthropic-version", "2023-06-01");
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                let success = status.is_success() || status.is_redirection();
                let body = resp.text().await.unwrap_or_default();
                ProbeReport {
                    outcome: if success {
                        Outcome::Success
                    } else {
                        Outcome::HttpStatus(status.as_u16())
                    },
                    status_code: Some(status.as_u16()),
                    message: if success {
                        "probe succeeded".to_string()
                    } else {
                        format!("upstream responded {}", status.as_u16())
                    },
                    response_preview: Some(truncate_preview(&body)),
                }
            }
            Err(err) => ProbeReport {
                outcome: Outcome::Transport,
                status_code: None,
                message: format!("transport error: {err}"),
                response_preview: None,
            },
        }
    }

    /// Selects an endpoint and issues a fully-buffered (non-streaming)
    /// request through it, reusing the same sanitise/rewrite/outcome
    /// pipeline as the streaming proxy listeners. Used by the dashboard's
    /// `/v1/...` and `/codex/v1/...` convenience routes (spec §6), which
    /// run on the dashboard listener rather than the dedicated family
    /// listeners and so don't get pingora's native streaming path.
    pub async fn forward_buffered(
        &self,
        family: Family,
        method: http::Method,
        path: &str,
        query: Option<&str>,
        inbound_headers: &HeaderMap,
        body: Bytes,
    ) -> Result<(EndpointProfile, BufferedResponse), ForwardError> {
        let endpoint = self
            .select_endpoint(family)
            .ok_or(ForwardError::NoUpstreamAvailable)?;
        let host = upstream_host(&endpoint.base_url)?;
        let url = build_upstream_url(&endpoint.base_url, path, query)?;
        let headers = rewrite_headers(inbound_headers, &endpoint, family, &host);

        let sanitized = if family.is_anthropic() {
            sanitize_anthropic_body(&body).body
        } else {
            body
        };

        let mut request = self.http_client.request(method, url).body(sanitized.to_vec());
        for (name, value) in headers.iter() {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                let mut out_headers = HeaderMap::new();
                for (name, value) in resp.headers().iter() {
                    out_headers.append(name.clone(), value.clone());
                }
                out_headers.remove(header::CONTENT_ENCODING);
                out_headers.remove(header::CONTENT_LENGTH);

                let outcome = if status.is_success() || status.is_redirection() {
                    Outcome::Success
                } else {
                    Outcome::HttpStatus(status.as_u16())
                };
                self.on_outcome(family, &endpoint.name, outcome);

                let body = resp.bytes().await.unwrap_or_default();
                Ok((
                    endpoint,
                    BufferedResponse {
                        status: status.as_u16(),
                        headers: out_headers,
                        body,
                    },
                ))
            }
            Err(_) => {
                self.on_outcome(family, &endpoint.name, Outcome::Transport);
                Err(ForwardError::UpstreamTransport(format!(
                    "{family} {}",
                    endpoint.name
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn profile(api_key: Option<&str>, auth_token: Option<&str>) -> EndpointProfile {
        EndpointProfile {
            name: "x".to_string(),
            base_url: "https://api.example.invalid".to_string(),
            auth_token: auth_token.map(str::to_string),
            api_key: api_key.map(str::to_string),
            weight: 1.0,
            enabled: true,
            freeze_until: None,
        }
    }

    #[test]
    fn sanitiser_drops_thinking_blocks_case_insensitively() {
        let body = serde_json::json!({
            "model": "claude-3-haiku",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "Thinking", "text": "scratch"},
                    {"type": "text", "text": "hi"}
                ]
            }]
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        let out = sanitize_anthropic_body(&bytes);
        assert_eq!(out.removed_blocks, 1);

        let value: Value = serde_json::from_slice(&out.body).unwrap();
        let content = &value["messages"][0]["content"];
        assert_eq!(content.as_array().unwrap().len(), 1);
        assert_eq!(content[0]["type"], "text");
    }

    #[test]
    fn sanitiser_is_byte_exact_when_nothing_removed() {
        let bytes = br#"{"messages":[{"role":"user","content":[{"type":"text","text":"hi"}]}]}"#;
        let out = sanitize_anthropic_body(bytes);
        assert_eq!(out.removed_blocks, 0);
        assert_eq!(&out.body[..], &bytes[..]);
    }

    #[test]
    fn sanitiser_is_a_fixpoint() {
        let body = serde_json::json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "reasoning", "text": "scratch"},
                    {"type": "text", "text": "hi"}
                ]
            }]
        });
        let bytes = serde_json::to_vec(&body).unwrap();
        let once = sanitize_anthropic_body(&bytes);
        let twice = sanitize_anthropic_body(&once.body);
        assert_eq!(twice.removed_blocks, 0);
        assert_eq!(&twice.body[..], &once.body[..]);
    }

    #[test]
    fn malformed_json_is_forwarded_raw() {
        let bytes = b"not json";
        let out = sanitize_anthropic_body(bytes);
        assert_eq!(out.removed_blocks, 0);
        assert_eq!(&out.body[..], &bytes[..]);
    }

    #[test]
    fn credential_rewrite_sets_bearer_and_x_api_key_from_auth_token() {
        let inbound = HeaderMap::new();
        let endpoint = profile(None, Some("abc"));
        let out = rewrite_headers(&inbound, &endpoint, Family::Anthropic, "upstream.invalid");
        assert_eq!(out.get(header::AUTHORIZATION).unwrap(), "Bearer abc");
        assert_eq!(out.get("x-api-key").unwrap(), "abc");
        assert_eq!(out.get("anthropic-version").unwrap(), "2023-06-01");
    }

    #[test]
    fn api_key_endpoint_does_not_override_explicit_x_api_key() {
        let inbound = HeaderMap::new();
        let endpoint = profile(Some("the-key"), None);
        let out = rewrite_headers(&inbound, &endpoint, Family::Anthropic, "upstream.invalid");
        assert_eq!(out.get(header::AUTHORIZATION).unwrap(), "Bearer the-key");
        assert_eq!(out.get("x-api-key").unwrap(), "the-key");
    }

    #[test]
    fn strips_hop_and_credential_headers_then_sets_host_and_connection() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("client-side.invalid"));
        inbound.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br"));
        let endpoint = profile(None, Some("tok"));
        let out = rewrite_headers(&inbound, &endpoint, Family::OpenAi, "upstream.invalid:443");
        assert_eq!(out.get(header::HOST).unwrap(), "upstream.invalid:443");
        assert_eq!(out.get(header::CONNECTION).unwrap(), "keep-alive");
        assert!(out.get(header::ACCEPT_ENCODING).is_none());
    }

    #[test]
    fn build_upstream_url_joins_verbatim() {
        let url = build_upstream_url("https://api.example.invalid/", "/v1/messages", Some("a=1")).unwrap();
        assert_eq!(url.as_str(), "https://api.example.invalid/v1/messages?a=1");
    }

    #[test]
    fn sse_usage_anthropic_message_stop() {
        let stream = concat!(
            "event: message_start\ndata: {}\n\n",
            "event: content_block_delta\ndata: {\"delta\":\"hi\"}\n\n",
            "event: message_stop\ndata: {\"usage\":{\"input_tokens\":5,\"output_tokens\":2}}\n\n",
        );
        let usage = parse_sse_usage(stream.as_bytes(), Family::Anthropic).unwrap();
        assert_eq!(usage.input_tokens, Some(5));
        assert_eq!(usage.output_tokens, Some(2));
    }

    #[test]
    fn sse_usage_openai_trailing_chunk() {
        let stream = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
            "data: {\"usage\":{\"prompt_tokens\":11,\"completion_tokens\":3}}\n\n",
            "data: [DONE]\n\n",
        );
        let usage = parse_sse_usage(stream.as_bytes(), Family::OpenAi).unwrap();
        assert_eq!(usage.input_tokens, Some(11));
        assert_eq!(usage.output_tokens, Some(3));
    }
}
