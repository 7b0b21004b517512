//! Listener Set (spec §6, C6): three pingora `http_proxy_service`s — the
//! Anthropic proxy, the OpenAI proxy, and the dashboard/API listener — all
//! registered on one `pingora::server::Server`.
//!
//! Grounded in the teacher's `server/setup.rs` (`Server::new`/`bootstrap`/
//! `http_proxy_service`/`add_service`/`run_forever` wiring and the
//! control-plane Tokio runtime for background tasks) and `proxy/gateway.rs`
//! (the `ProxyHttp` hook chain) for the two family listeners, and
//! `proxy/admin_gateway.rs` + `proxy/handlers/admin.rs` (a terminal
//! `ProxyHttp` whose `request_filter` always handles the request itself,
//! `send_json_response`'s build-insert-write pattern) for the dashboard
//! listener's REST surface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use http::{header, Method, StatusCode};
use pingora::prelude::*;
use pingora_http::{RequestHeader, ResponseHeader};
use serde_json::{json, Value};
use tracing::info;

use crate::config::{ConfigStore, EndpointProfile, LoadBalancerSettings, Mode};
use crate::family::Family;
use crate::forward::{
    build_upstream_url, parse_json_usage, parse_sse_usage, probe_path, rewrite_headers,
    sanitize_anthropic_body, upstream_host, wants_streaming, ForwardError, Forwarder,
};
use crate::freeze::{FreezeManager, Outcome};
use crate::health::HealthTracker;
use crate::requestlog::{RequestLogEntry, RequestLogSink, TracingRequestLogSink};
use crate::selection::Selector;

/// Per-request state threaded through the `ProxyHttp` hook chain for the
/// two family listeners.
#[derive(Default)]
pub struct ProxyCtx {
    request_id: String,
    method: String,
    path: String,
    selected: Option<EndpointProfile>,
    streaming: bool,
    sanitized_blocks_removed: u32,
    sanitized_body: Option<Bytes>,
    response_tee: BytesMut,
    status: Option<u16>,
    start: Option<Instant>,
}

/// Proxies one family's traffic (`/` on the Anthropic or OpenAI listener).
/// The request body is fully buffered before the upstream connection is
/// made — sanitisation needs the whole JSON document, and buffering first
/// lets `upstream_request_filter` set an accurate `Content-Length` instead
/// of guessing at a streamed length.
pub struct FamilyProxy {
    family: Family,
    forwarder: Arc<Forwarder>,
}

impl FamilyProxy {
    pub fn new(family: Family, forwarder: Arc<Forwarder>) -> Self {
        Self { family, forwarder }
    }
}

#[async_trait]
impl ProxyHttp for FamilyProxy {
    type CTX = ProxyCtx;

    fn new_ctx(&self) -> Self::CTX {
        ProxyCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        ctx.start = Some(Instant::now());
        ctx.request_id = Forwarder::assign_request_id();

        let req = session.req_header();
        ctx.method = req.method.to_string();
        ctx.path = req.uri.path().to_string();

        if req.method == Method::OPTIONS {
            respond_cors_preflight(session).await?;
            return Ok(true);
        }

        ctx.streaming = wants_streaming(&req.headers);

        let Some(endpoint) = self.forwarder.select_endpoint(self.family) else {
            respond_json(
                session,
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({"error": {"kind": "no-upstream-available", "message": "no healthy upstream available"}}),
            )
            .await?;
            return Ok(true);
        };
        ctx.selected = Some(endpoint);

        let mut buf = BytesMut::new();
        while let Some(chunk) = session
            .read_request_body()
            .await
            .map_err(|_| Error::new(Custom("failed to read request body")))?
        {
            buf.extend_from_slice(&chunk);
        }

        ctx.sanitized_body = Some(if self.family.is_anthropic() {
            let outcome = sanitize_anthropic_body(&buf);
            ctx.sanitized_blocks_removed = outcome.removed_blocks;
            outcome.body
        } else {
            buf.freeze()
        });

        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let endpoint = ctx
            .selected
            .as_ref()
            .ok_or_else(|| Error::new(Custom("no endpoint selected before upstream_peer")))?;

        let url = url::Url::parse(&endpoint.base_url)
            .map_err(|_| Error::new(Custom("invalid endpoint base url")))?;
        let use_tls = url.scheme() == "https";
        let host = url
            .host_str()
            .ok_or_else(|| Error::new(Custom("endpoint base url has no host")))?;
        let port = url
            .port_or_known_default()
            .unwrap_or(if use_tls { 443 } else { 80 });

        let peer = HttpPeer::new((host, port), use_tls, host.to_string());
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let endpoint = ctx
            .selected
            .as_ref()
            .ok_or_else(|| Error::new(Custom("no endpoint selected before upstream_request_filter")))?;

        let host = upstream_host(&endpoint.base_url)
            .map_err(|_| Error::new(Custom("invalid endpoint base url")))?;
        let rewritten = rewrite_headers(&upstream.headers, endpoint, self.family, &host);

        let existing: Vec<_> = upstream.headers.keys().cloned().collect();
        for name in existing {
            upstream.remove_header(&name);
        }
        for (name, value) in rewritten.iter() {
            upstream.insert_header(name.clone(), value.clone())?;
        }

        let body_len = ctx.sanitized_body.as_ref().map(Bytes::len).unwrap_or(0);
        upstream.insert_header(header::CONTENT_LENGTH, body_len.to_string())?;

        let joined = build_upstream_url(&endpoint.base_url, &ctx.path, _session.req_header().uri.query())
            .map_err(|_| Error::new(Custom("invalid endpoint base url")))?;
        let mut target = joined.path().to_string();
        if let Some(q) = joined.query() {
            target.push('?');
            target.push_str(q);
        }
        upstream.set_uri(
            target
                .parse()
                .map_err(|_| Error::new(Custom("invalid upstream request target")))?,
        );

        Ok(())
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        _end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        // The whole body was already buffered (and, for Anthropic, sanitised)
        // in `request_filter`. `take()` hands it over on the first call the
        // streaming machinery makes and is `None` forever after.
        *body = ctx.sanitized_body.take();
        Ok(())
    }

    fn upstream_response_filter(
        &self,
        _session: &mut Session,
        upstream: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        upstream.remove_header(&header::CONTENT_ENCODING);
        upstream.remove_header(&header::CONTENT_LENGTH);
        ctx.status = Some(upstream.status.as_u16());
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        _end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        if let Some(chunk) = body {
            ctx.response_tee.extend_from_slice(chunk);
        }
        Ok(None)
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        let Some(endpoint) = ctx.selected.take() else {
            return;
        };

        let outcome = if e.is_some() {
            Outcome::Transport
        } else {
            match ctx.status {
                Some(status) if (200..400).contains(&status) => Outcome::Success,
                Some(status) => Outcome::HttpStatus(status),
                None => Outcome::Transport,
            }
        };
        self.forwarder.on_outcome(self.family, &endpoint.name, outcome);

        let usage = if ctx.streaming {
            parse_sse_usage(&ctx.response_tee, self.family)
        } else {
            parse_json_usage(&ctx.response_tee, self.family)
        };

        let duration_ms = ctx
            .start
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0);

        self.forwarder.log(RequestLogEntry {
            request_id: std::mem::take(&mut ctx.request_id),
            family: self.family,
            endpoint: Some(endpoint.name),
            method: std::mem::take(&mut ctx.method),
            path: std::mem::take(&mut ctx.path),
            status: ctx.status,
            duration_ms,
            streaming: ctx.streaming,
            sanitized_blocks_removed: ctx.sanitized_blocks_removed,
            usage,
            error: e.map(|err| err.to_string()),
        });
    }
}

async fn respond_json(session: &mut Session, status: StatusCode, body: &Value) -> Result<()> {
    let bytes = serde_json::to_vec(body).map_err(|_| Error::new(Custom("json serialization failed")))?;
    let mut resp = ResponseHeader::build(status, None)?;
    resp.insert_header(header::CONTENT_TYPE, "application/json")?;
    resp.insert_header(header::CONTENT_LENGTH, bytes.len().to_string())?;
    resp.insert_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")?;
    session.write_response_header(Box::new(resp), false).await?;
    session.write_response_body(Some(bytes.into()), true).await?;
    Ok(())
}

async fn respond_cors_preflight(session: &mut Session) -> Result<()> {
    let mut resp = ResponseHeader::build(StatusCode::NO_CONTENT, None)?;
    resp.insert_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")?;
    resp.insert_header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, PUT, DELETE, OPTIONS")?;
    resp.insert_header(header::ACCESS_CONTROL_ALLOW_HEADERS, "*")?;
    resp.insert_header(header::CONTENT_LENGTH, "0")?;
    session.write_response_header(Box::new(resp), true).await?;
    Ok(())
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    let query = query?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn family_from_query(query: Option<&str>) -> std::result::Result<Family, Value> {
    let raw = query_param(query, "service")
        .ok_or_else(|| json!({"error": {"kind": "bad-request", "message": "missing `service` query parameter"}}))?;
    Family::from_config_name(raw).ok_or_else(|| {
        let err = crate::config::ConfigError::UnknownFamily(raw.to_string());
        json!({"error": {"kind": err.kind(), "message": err.to_string()}})
    })
}

/// The dashboard/API listener (spec §6): a JSON REST surface over the
/// Config Store, Health Tracker and Selector, plus two convenience
/// pass-through routes (`/v1/...` → Anthropic, `/codex/v1/...` → OpenAI)
/// that share the Forwarder's sanitise/rewrite/outcome pipeline but run
/// fully-buffered through `reqwest` rather than pingora's native streaming
/// path used by the two dedicated family listeners.
pub struct DashboardGateway {
    config: Arc<ConfigStore>,
    health: Arc<HealthTracker>,
    selector: Arc<Selector>,
    forwarder: Arc<Forwarder>,
    /// Process start, for `GET /status`'s `uptime` field.
    start: Instant,
    /// Most recent `/configs/{name}/test` result per `(family, endpoint)`,
    /// surfaced as `last_results` by `GET /configs/separated` (spec §6).
    /// Lost on restart — it isn't part of the persisted Config Store.
    last_results: DashMap<(Family, String), Value>,
}

impl DashboardGateway {
    pub fn new(
        config: Arc<ConfigStore>,
        health: Arc<HealthTracker>,
        selector: Arc<Selector>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            config,
            health,
            selector,
            forwarder,
            start: Instant::now(),
            last_results: DashMap::new(),
        }
    }

    async fn handle(&self, session: &mut Session, ctx: &mut ProxyCtx) -> Result<bool> {
        let req = session.req_header();
        let method = req.method.clone();
        let path = req.uri.path().to_string();
        let query = req.uri.query().map(str::to_string);

        if method == Method::OPTIONS {
            respond_cors_preflight(session).await?;
            return Ok(true);
        }

        if let Some(rest) = path.strip_prefix("/codex") {
            if rest.starts_with("/v1") {
                return self
                    .proxy_convenience(session, ctx, Family::OpenAi, rest, query.as_deref())
                    .await;
            }
        } else if path.starts_with("/v1") {
            return self
                .proxy_convenience(session, ctx, Family::Anthropic, &path, query.as_deref())
                .await;
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        // `http::Method` isn't a plain enum (its variants are associated
        // consts), so routes are matched on the path shape and disambiguated
        // by method with guards rather than matched on `(method, path)` pairs.
        let result = match segments.as_slice() {
            ["status"] if method == Method::GET => self.handle_status(),
            ["configs", "separated"] if method == Method::GET => {
                self.handle_configs_separated(query.as_deref())
            }
            ["configs", "mode"] if method == Method::PUT => {
                self.handle_put_mode(session, query.as_deref()).await
            }
            ["configs"] if method == Method::GET => self.handle_get_configs(query.as_deref()),
            ["configs"] if method == Method::POST => {
                self.handle_post_config(session, query.as_deref()).await
            }
            ["configs", name, "activate"] if method == Method::POST => {
                self.handle_activate(name, query.as_deref())
            }
            ["configs", name, "freeze"] if method == Method::PUT => {
                self.handle_freeze(session, name, query.as_deref()).await
            }
            ["configs", name, "test"] if method == Method::POST => {
                self.handle_test(name, query.as_deref()).await
            }
            ["configs", name] if method == Method::PUT => {
                self.handle_put_config(session, name, query.as_deref()).await
            }
            ["configs", name] if method == Method::DELETE => self.handle_delete_config(name, query.as_deref()),
            ["loadbalancer"] if method == Method::GET => self.handle_get_loadbalancer(query.as_deref()),
            ["loadbalancer"] if method == Method::PUT => {
                self.handle_put_loadbalancer(session, query.as_deref()).await
            }
            ["stats"] if method == Method::GET => self.handle_stats(),
            ["logs"] if method == Method::GET || method == Method::DELETE => Err((
                StatusCode::NOT_IMPLEMENTED,
                json!({"error": {"kind": "not-implemented", "message": "request log storage is not part of this deployment"}}),
            )),
            ["logs", _] if method == Method::GET => Err((
                StatusCode::NOT_IMPLEMENTED,
                json!({"error": {"kind": "not-implemented", "message": "request log storage is not part of this deployment"}}),
            )),
            _ => Err((
                StatusCode::NOT_FOUND,
                json!({"error": {"kind": "not-found", "message": "no such route"}}),
            )),
        };

        match result {
            Ok((status, body)) => respond_json(session, status, &body).await?,
            Err((status, body)) => respond_json(session, status, &body).await?,
        }
        Ok(true)
    }

    fn handle_status(&self) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        Ok((
            StatusCode::OK,
            json!({"status": "ok", "uptime": self.start.elapsed().as_secs()}),
        ))
    }

    /// Listed on its own line in spec §6, not part of the `?service=`
    /// group that follows it: one response covering both families, each
    /// annotated with its currently-selected endpoint and the most recent
    /// `/test` result per endpoint.
    fn handle_configs_separated(
        &self,
        _query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let mut families = serde_json::Map::new();
        let mut last_results = serde_json::Map::new();

        for family in Family::ALL {
            let state = self.config.snapshot(family);
            let pool = self.config.eligible_pool(family);
            let current = self.selector.current_server_name(family, &pool, &self.health);
            let (enabled, disabled): (Vec<_>, Vec<_>) =
                state.configs.iter().cloned().partition(|p| p.enabled);

            families.insert(
                family.config_name().to_string(),
                json!({
                    "mode": state.mode,
                    "active": state.active_name(),
                    "current": current,
                    "enabled": enabled,
                    "disabled": disabled,
                }),
            );

            let mut by_name = serde_json::Map::new();
            for entry in self.last_results.iter() {
                let (entry_family, name) = entry.key();
                if *entry_family == family {
                    by_name.insert(name.clone(), entry.value().clone());
                }
            }
            last_results.insert(family.config_name().to_string(), Value::Object(by_name));
        }

        families.insert("last_results".to_string(), Value::Object(last_results));
        Ok((StatusCode::OK, Value::Object(families)))
    }

    fn handle_get_configs(
        &self,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let state = self.config.snapshot(family);
        Ok((
            StatusCode::OK,
            json!({
                "mode": state.mode,
                "active": state.active_name(),
                "configs": state.configs,
                "loadbalancer": state.loadbalancer,
            }),
        ))
    }

    async fn handle_post_config(
        &self,
        session: &mut Session,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let profile = read_json_body::<EndpointProfile>(session)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

        let mut conflict = false;
        self.config
            .mutate_family(family, |state| {
                if state.find(&profile.name).is_some() {
                    conflict = true;
                } else {
                    state.configs.push(profile.clone());
                }
            })
            .map_err(persist_error)?;

        if conflict {
            return Err((
                StatusCode::CONFLICT,
                json!({"error": {"kind": "conflict", "message": "an endpoint with this name already exists"}}),
            ));
        }
        Ok((StatusCode::CREATED, json!({"status": "created"})))
    }

    async fn handle_put_config(
        &self,
        session: &mut Session,
        name: &str,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let patch = read_json_body::<Value>(session)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

        let mut found = false;
        self.config
            .mutate_family(family, |state| {
                if let Some(profile) = state.find_mut(name) {
                    found = true;
                    apply_profile_patch(profile, &patch);
                }
            })
            .map_err(persist_error)?;

        if !found {
            return Err((
                StatusCode::NOT_FOUND,
                json!({"error": {"kind": "not-found", "message": "no such endpoint"}}),
            ));
        }
        Ok((StatusCode::OK, json!({"status": "updated"})))
    }

    fn handle_delete_config(
        &self,
        name: &str,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let mut found = false;
        self.config
            .mutate_family(family, |state| {
                let before = state.configs.len();
                state.configs.retain(|p| p.name != name);
                found = state.configs.len() != before;
            })
            .map_err(persist_error)?;

        if !found {
            return Err((
                StatusCode::NOT_FOUND,
                json!({"error": {"kind": "not-found", "message": "no such endpoint"}}),
            ));
        }
        Ok((StatusCode::OK, json!({"status": "deleted"})))
    }

    fn handle_activate(
        &self,
        name: &str,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let mut found = false;
        self.config
            .mutate_family(family, |state| {
                if state.find(name).is_some() {
                    found = true;
                    state.active.name = name.to_string();
                }
            })
            .map_err(persist_error)?;

        if !found {
            return Err((
                StatusCode::NOT_FOUND,
                json!({"error": {"kind": "not-found", "message": "no such endpoint"}}),
            ));
        }
        Ok((StatusCode::OK, json!({"status": "activated"})))
    }

    async fn handle_freeze(
        &self,
        session: &mut Session,
        name: &str,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let body = read_json_body::<Value>(session)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

        if body.get("clear").and_then(Value::as_bool).unwrap_or(false) {
            self.config.clear_freeze(family, name).map_err(persist_error)?;
            return Ok((StatusCode::OK, json!({"status": "cleared"})));
        }

        let duration_ms = body
            .get("duration_ms")
            .and_then(Value::as_i64)
            .unwrap_or(60_000);
        let until = chrono::Utc::now().timestamp_millis().saturating_add(duration_ms);
        self.config.extend_freeze(family, name, until).map_err(persist_error)?;
        Ok((StatusCode::OK, json!({"status": "frozen", "frozen_until": until})))
    }

    /// Spec §6: triggers a single credential probe and reports the fixed
    /// eight-field shape the dashboard's test button expects. The core only
    /// contract-matches this response; the Anthropic-family variant that
    /// shells out to the external `claude` CLI is the dashboard's concern
    /// (spec §1 non-goals), so both families are probed the same way here,
    /// through the Forwarder's ordinary HTTP probe path.
    async fn handle_test(
        &self,
        name: &str,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let snapshot = self.config.snapshot(family);
        let Some(profile) = snapshot.find(name).cloned() else {
            return Err((
                StatusCode::NOT_FOUND,
                json!({"error": {"kind": "not-found", "message": "no such endpoint"}}),
            ));
        };

        let timeout = Duration::from_millis(snapshot.loadbalancer.health_check.timeout);
        let started = Instant::now();
        let report = self.forwarder.probe_with_report(family, &profile, timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = json!({
            "success": matches!(report.outcome, Outcome::Success),
            "status_code": report.status_code,
            "duration_ms": duration_ms,
            "message": report.message,
            "response_preview": report.response_preview,
            "completed_at": chrono::Utc::now().to_rfc3339(),
            "source": family.config_name(),
            "method": "GET",
            "path": probe_path(family),
        });

        self.last_results
            .insert((family, name.to_string()), result.clone());

        Ok((StatusCode::OK, result))
    }

    async fn handle_put_mode(
        &self,
        session: &mut Session,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let body = read_json_body::<Value>(session)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

        let mode = match body.get("mode").and_then(Value::as_str) {
            Some("manual") => Mode::Manual,
            Some("load_balance") => Mode::LoadBalance,
            _ => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    json!({"error": {"kind": "bad-request", "message": "mode must be \"manual\" or \"load_balance\""}}),
                ))
            }
        };

        self.config
            .mutate_family(family, |state| state.mode = mode)
            .map_err(persist_error)?;
        Ok((StatusCode::OK, json!({"status": "updated"})))
    }

    fn handle_get_loadbalancer(
        &self,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let state = self.config.snapshot(family);
        Ok((StatusCode::OK, json!(state.loadbalancer)))
    }

    async fn handle_put_loadbalancer(
        &self,
        session: &mut Session,
        query: Option<&str>,
    ) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let family = family_from_query(query).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        let settings = read_json_body::<LoadBalancerSettings>(session)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

        self.config
            .mutate_family(family, |state| state.loadbalancer = settings)
            .map_err(persist_error)?;
        Ok((StatusCode::OK, json!({"status": "updated"})))
    }

    fn handle_stats(&self) -> std::result::Result<(StatusCode, Value), (StatusCode, Value)> {
        let mut out = serde_json::Map::new();
        for family in Family::ALL {
            let state = self.config.snapshot(family);
            let endpoints: serde_json::Map<String, Value> = state
                .configs
                .iter()
                .map(|p| {
                    let record = self.health.snapshot(family, &p.name);
                    (p.name.clone(), json!(record))
                })
                .collect();
            out.insert(family.config_name().to_string(), Value::Object(endpoints));
        }
        Ok((StatusCode::OK, Value::Object(out)))
    }

    async fn proxy_convenience(
        &self,
        session: &mut Session,
        ctx: &mut ProxyCtx,
        family: Family,
        path: &str,
        query: Option<&str>,
    ) -> Result<bool> {
        ctx.start = Some(Instant::now());
        let req = session.req_header();
        let method = req.method.clone();
        let headers = req.headers.clone();

        let mut buf = BytesMut::new();
        while let Some(chunk) = session
            .read_request_body()
            .await
            .map_err(|_| Error::new(Custom("failed to read request body")))?
        {
            buf.extend_from_slice(&chunk);
        }

        match self
            .forwarder
            .forward_buffered(family, method, path, query, &headers, buf.freeze())
            .await
        {
            Ok((_, resp)) => {
                let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
                let mut resp_header = ResponseHeader::build(status, None)?;
                for (name, value) in resp.headers.iter() {
                    resp_header.insert_header(name.clone(), value.clone())?;
                }
                resp_header.insert_header(header::CONTENT_LENGTH, resp.body.len().to_string())?;
                session.write_response_header(Box::new(resp_header), false).await?;
                session.write_response_body(Some(resp.body), true).await?;
            }
            Err(err) => {
                let status = match err {
                    ForwardError::NoUpstreamAvailable => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::BAD_GATEWAY,
                };
                respond_json(
                    session,
                    status,
                    &json!({"error": {"kind": err.kind(), "message": err.to_string()}}),
                )
                .await?;
            }
        }
        Ok(true)
    }
}

fn persist_error(err: crate::config::ConfigError) -> (StatusCode, Value) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": {"kind": err.kind(), "message": err.to_string()}}),
    )
}

fn apply_profile_patch(profile: &mut EndpointProfile, patch: &Value) {
    if let Some(v) = patch.get("base_url").and_then(Value::as_str) {
        profile.base_url = v.to_string();
    }
    if let Some(v) = patch.get("auth_token") {
        profile.auth_token = v.as_str().map(str::to_string);
    }
    if let Some(v) = patch.get("api_key") {
        profile.api_key = v.as_str().map(str::to_string);
    }
    if let Some(v) = patch.get("weight").and_then(Value::as_f64) {
        profile.weight = v;
    }
    if let Some(v) = patch.get("enabled").and_then(Value::as_bool) {
        profile.enabled = v;
    }
}

async fn read_json_body<T: serde::de::DeserializeOwned>(session: &mut Session) -> std::result::Result<T, Value> {
    let mut buf = BytesMut::new();
    loop {
        match session.read_request_body().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(_) => {
                return Err(json!({"error": {"kind": "bad-request", "message": "failed to read request body"}}))
            }
        }
    }
    serde_json::from_slice(&buf)
        .map_err(|e| json!({"error": {"kind": "bad-request", "message": e.to_string()}}))
}

#[async_trait]
impl ProxyHttp for DashboardGateway {
    type CTX = ProxyCtx;

    fn new_ctx(&self) -> Self::CTX {
        ProxyCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        self.handle(session, ctx).await
    }

    async fn upstream_peer(&self, _session: &mut Session, _ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        // Unreachable: `request_filter` always terminates the request itself,
        // either as a REST response or a fully-buffered convenience forward.
        Err(Error::new(Custom("DashboardGateway attempted to proxy upstream (bug)")))
    }
}

/// Builds and owns the three listeners plus the background tasks that feed
/// them (per-family re-probe loops, the request-log drain task).
pub struct ListenerSet {
    server: pingora::server::Server,
    _control_rt: tokio::runtime::Runtime,
}

impl ListenerSet {
    pub fn build(config: Arc<ConfigStore>, health: Arc<HealthTracker>) -> anyhow::Result<Self> {
        let selector = Arc::new(Selector::new());
        let freeze = Arc::new(FreezeManager::new(Arc::clone(&config), Arc::clone(&health)));

        let control_rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("failed to build control-plane Tokio runtime");

        // `TracingRequestLogSink::spawn` calls bare `tokio::spawn`, which
        // needs an entered runtime context; `control_rt` isn't running yet
        // (pingora hasn't called `run_forever`), so enter it manually for
        // the duration of this call.
        let log_sink: Arc<dyn RequestLogSink> = {
            let _entered = control_rt.enter();
            Arc::new(TracingRequestLogSink::spawn(1024))
        };
        let forwarder = Arc::new(Forwarder::new(
            Arc::clone(&config),
            Arc::clone(&health),
            Arc::clone(&selector),
            Arc::clone(&freeze),
            Arc::clone(&log_sink),
        ));

        for family in Family::ALL {
            let config = Arc::clone(&config);
            let freeze = Arc::clone(&freeze);
            let forwarder = Arc::clone(&forwarder);
            control_rt.spawn(async move {
                let config_for_probe = Arc::clone(&config);
                crate::freeze::run_reprobe_loop(family, config, Arc::clone(&freeze), move |family, profile| {
                    let forwarder = Arc::clone(&forwarder);
                    let timeout = Duration::from_millis(
                        config_for_probe.snapshot(family).loadbalancer.health_check.timeout,
                    );
                    async move {
                        forwarder.probe(family, &profile, timeout).await;
                    }
                })
                .await;
            });
        }

        let system = config.system();

        let mut server = pingora::server::Server::new(None)?;
        server.bootstrap();

        let anthropic = FamilyProxy::new(Family::Anthropic, Arc::clone(&forwarder));
        let mut anthropic_svc = http_proxy_service(&server.configuration, anthropic);
        anthropic_svc.add_tcp(&format!("0.0.0.0:{}", system.anthropic_port));
        server.add_service(anthropic_svc);

        let openai = FamilyProxy::new(Family::OpenAi, Arc::clone(&forwarder));
        let mut openai_svc = http_proxy_service(&server.configuration, openai);
        openai_svc.add_tcp(&format!("0.0.0.0:{}", system.openai_port));
        server.add_service(openai_svc);

        let dashboard = DashboardGateway::new(config, health, selector, forwarder);
        let mut dashboard_svc = http_proxy_service(&server.configuration, dashboard);
        dashboard_svc.add_tcp(&format!("0.0.0.0:{}", system.web_port));
        server.add_service(dashboard_svc);

        // Graceful shutdown (SPEC_FULL §11): pingora's own SIGINT/SIGTERM
        // handling stops new connections and drains in-flight requests
        // before `run_forever` returns; this handler only logs the request
        // so an operator watching the log sees the shutdown was noticed
        // before the drain, not just silence.
        ctrlc::set_handler(|| {
            info!(event = "shutdown_requested", "shutdown signal received, draining in-flight requests");
        })?;

        Ok(Self {
            server,
            _control_rt: control_rt,
        })
    }

    /// Blocks forever, serving all three listeners. Pingora installs its own
    /// SIGINT/SIGTERM handling and drains in-flight requests before exiting.
    pub fn run_forever(self) -> ! {
        self.server.run_forever()
    }
}
