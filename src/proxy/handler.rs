use crate::events::Event;
use crate::limiter::{LimitDecision, LimiterError};
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::rules::{IdentifyBy, Rule, RuleMatch, RulesMatcher};
use crate::server::GatewayState;
use crate::upstream::ForwardError;
use chrono::Utc;
use http::header::{HeaderName, HeaderValue, HOST};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle one inbound request through the admission pipeline:
///
/// 1. IDENTITY  — derive the client identity string
/// 2. MATCH     — snapshot the rule set, resolve to at most one rule
/// 3. DECIDE    — atomic sliding-window check (rule key or global fallback);
///                store failure fails open
/// 4. FORWARD   — stream the exchange to the upstream, or answer 429
/// 5. EMIT      — publish the outcome event, metrics, access log
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_uppercase();

    let client_id = derive_identity(
        req.headers(),
        Some(peer_addr.ip()),
        state.config.proxy.trust_forwarded_for,
    );

    let mut ctx = RequestContext::new(method, path, client_id);
    metrics::gauge!("gateway_http_requests_in_flight").increment(1.0);

    let prefix = state.config.proxy.path_prefix.as_str();
    if !ctx.path.starts_with(prefix) {
        debug!("proxy: path outside prefix, path={}", ctx.path);
        return Ok(ctx.error_response(StatusCode::NOT_FOUND, "not found"));
    }

    // One consistent snapshot for the life of this request; concurrent
    // set_rule_set calls affect only requests that start later.
    let matcher = RulesMatcher::new(state.rules.load_full());
    let matched = matcher.match_request(&ctx.method, &ctx.path);

    if let Some(ref m) = matched {
        ctx.rule_name = m.rule.name.clone();
    }

    let admission = match &matched {
        Some(m) => check_rule(&state, m, req.headers(), &ctx).await,
        None => check_global(&state, &ctx).await,
    };

    let decision = match admission {
        Admission::Decided(decision) if !decision.allowed => {
            metrics::counter!(
                "gateway_rate_limit_rejected_total",
                "rule" => ctx.rule_name.clone(),
            )
            .increment(1);

            let resp = rejection_response(&decision, matched.as_ref());
            emit_event(&state, &ctx, false, Some(&decision), 429, 0);
            ctx.finalize_metrics(429);
            access_log(&ctx, 429, Duration::ZERO);
            return Ok(resp);
        }
        Admission::Decided(decision) => {
            metrics::counter!(
                "gateway_rate_limit_allowed_total",
                "rule" => ctx.rule_name.clone(),
            )
            .increment(1);
            Some(decision)
        }
        // Limiter degraded: availability over enforcement.
        Admission::FailOpen => {
            metrics::counter!("gateway_rate_limit_fail_open_total").increment(1);
            None
        }
    };

    // Forward. Bodies stream through untouched in both directions.
    let suffix = upstream_suffix(&req, prefix);
    let mut headers = req.headers().clone();
    inject_forwarded_headers(&mut headers, peer_addr);
    let req_method = req.method().clone();
    let body = req.into_body().boxed();

    ctx.upstream_start = Some(Instant::now());
    let (upstream_resp, upstream_elapsed) = match state
        .upstream
        .forward(req_method, &suffix, headers, body)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            // Transport failure is a separate concern from admission: no
            // outcome event, just the 502 and the log line.
            warn!(
                "proxy: upstream error, path={}, upstream={}, error={}",
                ctx.path,
                state.upstream.authority(),
                e
            );
            let reason = match e {
                ForwardError::Timeout => "timeout",
                ForwardError::Connect(_) => "connect",
            };
            metrics::counter!("gateway_upstream_errors_total", "reason" => reason).increment(1);
            return Ok(ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway"));
        }
    };

    let mut resp = build_downstream_response(upstream_resp);
    if let Some(ref decision) = decision {
        apply_limit_headers(
            resp.headers_mut(),
            decision,
            matched.as_ref().map(|m| m.rule.name.as_str()),
        );
    }

    let status = resp.status().as_u16();
    emit_event(
        &state,
        &ctx,
        true,
        decision.as_ref(),
        status,
        upstream_elapsed.as_millis() as i64,
    );

    ctx.finalize_metrics(status);
    access_log(&ctx, status, upstream_elapsed);

    Ok(resp)
}

enum Admission {
    Decided(LimitDecision),
    FailOpen,
}

/// Rule-scoped check: `rule:{name}:{identity}` against the shared store.
async fn check_rule(
    state: &GatewayState,
    m: &RuleMatch,
    headers: &http::HeaderMap,
    ctx: &RequestContext,
) -> Admission {
    let identity = rule_identity(&m.rule, headers, &ctx.client_id);
    let key = format!("rule:{}:{}", m.rule.name, identity);

    match state
        .store
        .check_sliding_window(&key, m.rule.limit, m.rule.window)
        .await
    {
        Ok(decision) => Admission::Decided(decision),
        Err(e) => {
            warn!(
                "proxy: store unavailable, failing open, rule={}, error={}",
                m.rule.name, e
            );
            Admission::FailOpen
        }
    }
}

async fn check_global(state: &GatewayState, ctx: &RequestContext) -> Admission {
    match state.global_limiter.allow(&ctx.client_id).await {
        Ok(decision) => Admission::Decided(decision),
        Err(LimiterError::Store(e)) => {
            warn!("proxy: store unavailable, failing open, error={}", e);
            Admission::FailOpen
        }
        // Identities are non-empty by construction; treat a rejection like a
        // degraded limiter rather than failing the request.
        Err(e) => {
            warn!("proxy: limiter rejected identity, failing open, error={}", e);
            Admission::FailOpen
        }
    }
}

/// Identity used for the rate-limit key of a header-identified rule: the
/// trimmed header value, falling back to the client identity when the header
/// is absent or empty.
fn rule_identity<'a>(
    rule: &Rule,
    headers: &http::HeaderMap,
    client_id: &'a str,
) -> Cow<'a, str> {
    if let IdentifyBy::Header(ref name) = rule.identify_by {
        if let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Cow::Owned(trimmed.to_string());
            }
        }
    }
    Cow::Borrowed(client_id)
}

/// Derive the client identity. With `trust_forwarded_for`, the leftmost
/// non-empty `X-Forwarded-For` token wins (operators behind chained proxies
/// must normalize upstream); otherwise the socket peer host, or `"unknown"`
/// when no peer address is available.
fn derive_identity(
    headers: &http::HeaderMap,
    peer_ip: Option<IpAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        if let Some(xff) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(token) = xff.split(',').map(str::trim).find(|t| !t.is_empty()) {
                return token.to_string();
            }
        }
    }
    match peer_ip {
        Some(ip) => ip.to_string(),
        None => "unknown".to_string(),
    }
}

/// Path+query sent upstream: the configured prefix is stripped, the
/// remainder is appended to the upstream base path.
fn upstream_suffix(req: &Request<Incoming>, prefix: &str) -> String {
    let full = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    if prefix == "/" {
        return full.to_string();
    }
    let rest = &full[prefix.len()..];
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

fn apply_limit_headers(
    headers: &mut http::HeaderMap,
    decision: &LimitDecision,
    rule_name: Option<&str>,
) {
    let mut buf = itoa::Buffer::new();

    if let Ok(v) = HeaderValue::from_str(buf.format(decision.limit)) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), v);
    }
    if let Ok(v) = HeaderValue::from_str(buf.format(decision.remaining)) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), v);
    }
    if let Ok(v) = HeaderValue::from_str(buf.format(decision.reset_at.timestamp())) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), v);
    }
    if let Some(name) = rule_name {
        if let Ok(v) = HeaderValue::from_str(name) {
            headers.insert(HeaderName::from_static("x-ratelimit-rule"), v);
        }
    }
}

fn rejection_response(
    decision: &LimitDecision,
    matched: Option<&RuleMatch>,
) -> Response<BoxBody> {
    let mut body = serde_json::json!({
        "error": "rate limit exceeded",
        "limit": decision.limit,
        "remaining": decision.remaining,
        "reset_at": decision.reset_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    });
    if let Some(m) = matched {
        body["rule"] = serde_json::Value::String(m.rule.name.clone());
    }

    let mut resp = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap();

    apply_limit_headers(
        resp.headers_mut(),
        decision,
        matched.map(|m| m.rule.name.as_str()),
    );
    resp
}

/// Publish the outcome event. The broker fans it out to live subscribers and
/// the analytics sink without ever blocking this request.
fn emit_event(
    state: &GatewayState,
    ctx: &RequestContext,
    allowed: bool,
    decision: Option<&LimitDecision>,
    status: u16,
    response_ms: i64,
) {
    state.broker.publish(Event {
        timestamp: Utc::now(),
        client_id: ctx.client_id.clone(),
        method: ctx.method.clone(),
        path: ctx.path.clone(),
        allowed,
        rule_name: ctx.rule_name.clone(),
        limit: decision.map(|d| d.limit).unwrap_or(0),
        remaining: decision.map(|d| d.remaining).unwrap_or(0),
        status,
        response_ms,
    });
}

fn access_log(ctx: &RequestContext, status: u16, upstream_elapsed: Duration) {
    tracing::info!(
        client_id = %ctx.client_id,
        method = %ctx.method,
        path = %ctx.path,
        status = status,
        rule = %ctx.rule_name,
        latency_ms = %ctx.start.elapsed().as_millis(),
        upstream_ms = %upstream_elapsed.as_millis(),
        "access"
    );
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (mut parts, body) = upstream_resp.into_parts();
    crate::upstream::remove_hop_headers(&mut parts.headers);
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder.body(body.boxed()).unwrap()
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so the upstream
/// can identify the original client and protocol.
fn inject_forwarded_headers(headers: &mut http::HeaderMap, peer_addr: SocketAddr) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    // X-Forwarded-For: append the peer IP to any existing chain.
    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    // X-Forwarded-Proto: trust an incoming value (e.g. set by a TLS-
    // terminating balancer), default to "http" when absent.
    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    // X-Forwarded-Host: the original Host header.
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(XFH.clone(), host);
    }

    // X-Real-IP: always the immediate peer.
    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
