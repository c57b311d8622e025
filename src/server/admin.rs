use super::GatewayState;
use crate::rules::{RuleConfig, RuleSet};
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response};
use tracing::info;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match path.as_str() {
        "/health" | "/healthz" => {
            Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#.into()))
        }

        "/ready" | "/readyz" => {
            let store = match state.store.ping().await {
                Ok(()) => "ok",
                Err(_) => "unavailable",
            };
            // A degraded store does not gate readiness; admission fails
            // open.
            Ok(json_response(
                StatusCode::OK,
                format!(
                    r#"{{"status":"ready","rules":{},"store":"{}"}}"#,
                    state.rule_count(),
                    store,
                ),
            ))
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/rules" if method == Method::GET => {
            let set = state.rules.load();
            let configs: Vec<RuleConfig> = set.rules().iter().map(|r| r.to_config()).collect();
            let body = serde_json::to_string_pretty(&configs).unwrap_or_default();
            Ok(json_response(StatusCode::OK, body))
        }

        // The hot-swap entry point: the admin CRUD collaborator pushes the
        // full enabled rule collection here after any mutation.
        "/rules" if method == Method::PUT => {
            let body = req.into_body().collect().await?.to_bytes();

            let configs: Vec<RuleConfig> = match serde_json::from_slice(&body) {
                Ok(c) => c,
                Err(e) => {
                    return Ok(json_response(
                        StatusCode::BAD_REQUEST,
                        format!(r#"{{"error":"invalid rules payload: {}"}}"#, e),
                    ));
                }
            };

            match RuleSet::compile(&configs) {
                Ok(set) => {
                    let count = state.set_rule_set(set);
                    info!("admin: rule set replaced, rules={}", count);
                    Ok(json_response(
                        StatusCode::OK,
                        format!(r#"{{"status":"ok","rules":{}}}"#, count),
                    ))
                }
                Err(e) => Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    serde_json::json!({
                        "error": e.reason,
                        "rule": e.rule,
                    })
                    .to_string(),
                )),
            }
        }

        // Live outcome stream: one NDJSON line per event. The subscription
        // is cancelled when the client goes away and the body is dropped.
        "/events" => {
            let (events, subscription) = state.broker.subscribe();

            let stream = futures_util::stream::unfold(
                (events, subscription),
                |(mut events, subscription)| async move {
                    let event = events.recv().await?;
                    let mut line = serde_json::to_vec(&event).unwrap_or_default();
                    line.push(b'\n');
                    let frame: Result<Frame<Bytes>, hyper::Error> =
                        Ok(Frame::data(Bytes::from(line)));
                    Some((frame, (events, subscription)))
                },
            );

            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/x-ndjson")
                .header("cache-control", "no-cache")
                .body(BodyExt::boxed(StreamBody::new(stream)))
                .unwrap())
        }

        "/stats" => {
            let sink = state.sink.stats();
            Ok(json_response(
                StatusCode::OK,
                serde_json::json!({
                    "rules": state.rule_count(),
                    "events": {
                        "logged": sink.logged,
                        "dropped": sink.dropped,
                    },
                    "broker": {
                        "subscribers": state.broker.subscriber_count(),
                        "dropped": state.broker.dropped(),
                    },
                })
                .to_string(),
            ))
        }

        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            r#"{"error":"not found"}"#.into(),
        )),
    }
}
