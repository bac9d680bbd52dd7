//! Route handlers for the control-plane HTTP surface, plus the tiny
//! hand-rolled preamble parser the tunnel listener uses to read
//! `GET /proxy/{id}` off a raw socket before handing it to an
//! interceptor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Method, Request, Response};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::middleware::{authenticate, json_response, require_admin};
use super::AppState;
use crate::authorizer::Authorizer;
use crate::error::BrokerError;

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

pub async fn route(
    state: &Arc<AppState>,
    _remote: SocketAddr,
    req: Request<Body>,
) -> Result<Response<Body>, BrokerError> {
    if req.method() == Method::OPTIONS {
        return Ok(Response::builder()
            .status(204)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "*")
            .body(Body::empty())
            .unwrap());
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (&method, segments.as_slice()) {
        (&Method::POST, ["login"]) => login(state, req).await,
        (&Method::GET, ["connections"]) => list_connections(state, req).await,
        (&Method::POST, ["connect", name]) => {
            let name = name.to_string();
            connect(state, req, &name).await
        }
        (&Method::GET, ["approvals", id, "approve"]) | (&Method::POST, ["approvals", id, "approve"]) => {
            let id = id.to_string();
            decide(state, req, &id, true).await
        }
        (&Method::GET, ["approvals", id, "reject"]) | (&Method::POST, ["approvals", id, "reject"]) => {
            let id = id.to_string();
            decide(state, req, &id, false).await
        }
        (&Method::GET, ["health"]) => Ok(json_response(200, serde_json::json!({"status": "healthy"}))),
        (&Method::GET, ["metrics"]) => Ok(metrics_response()),
        (&Method::GET, ["admin", "recent-logs"]) => recent_logs(state, req).await,
        (&Method::DELETE, ["admin", "connections", id]) => {
            let id = id.to_string();
            revoke_connection(state, req, &id).await
        }
        _ => Err(BrokerError::NotFound(format!("no route for {method} {path}"))),
    }
}

async fn login(state: &Arc<AppState>, req: Request<Body>) -> Result<Response<Body>, BrokerError> {
    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| BrokerError::ProtocolError(format!("could not read request body: {e}")))?;
    let login_req: LoginRequest = serde_json::from_slice(&body)
        .map_err(|e| BrokerError::ProtocolError(format!("invalid login payload: {e}")))?;

    let (token, expires_at, identity) = match state.validator.login(&login_req.username, &login_req.password) {
        Ok(ok) => ok,
        Err(e) => {
            crate::metrics::AUTH_FAILURES_TOTAL.inc();
            return Err(e);
        }
    };
    state.audit.log(
        &identity.username,
        "login",
        "control-plane",
        serde_json::json!({}),
    );

    Ok(json_response(
        200,
        serde_json::json!({
            "token": token,
            "expires_at": expires_at,
            "user": identity,
        }),
    ))
}

async fn list_connections(
    state: &Arc<AppState>,
    req: Request<Body>,
) -> Result<Response<Body>, BrokerError> {
    let identity = authenticate(&req, &state.validator).await?;
    let snapshot = state.config.load();
    let authorizer = Authorizer::new(&snapshot);
    let names: Vec<serde_json::Value> = authorizer
        .accessible_connections(&identity.roles)
        .into_iter()
        .map(|c| {
            serde_json::json!({
                "name": c.name,
                "type": c.kind,
                "tags": c.tags,
                "metadata": c.metadata,
            })
        })
        .collect();

    state.audit.log(
        &identity.username,
        "list_connections",
        "control-plane",
        serde_json::json!({"count": names.len()}),
    );

    // Per the control-plane contract this is a bare JSON array: never
    // leak host/port/credentials here, only name + tags + metadata.
    Ok(json_response(200, serde_json::Value::Array(names)))
}

async fn connect(
    state: &Arc<AppState>,
    req: Request<Body>,
    name: &str,
) -> Result<Response<Body>, BrokerError> {
    let identity = authenticate(&req, &state.validator).await?;
    let snapshot = state.config.load();
    let authorizer = Authorizer::new(&snapshot);
    let allow_list = match authorizer.allow_list_for(&identity.roles, name) {
        Ok(list) => list,
        Err(e) => {
            crate::metrics::CONNECTS_TOTAL.with_label_values(&["denied"]).inc();
            state.audit.log(
                &identity.username,
                "connect_denied",
                name,
                serde_json::json!({"reason": e.to_string()}),
            );
            return Err(e);
        }
    };

    let definition = snapshot
        .connection(name)
        .ok_or_else(|| BrokerError::NotFound(format!("unknown connection: {name}")))?
        .clone();

    let requested = req
        .uri()
        .query()
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k.as_ref() == "ttl")
                .map(|(_, v)| v.into_owned())
        })
        .and_then(|v| humantime::parse_duration(&v).ok());

    let max = snapshot.raw.server.max_connection_duration;
    let default = definition.duration.unwrap_or(max);
    let duration = requested.map(|d| d.min(max)).unwrap_or(default.min(max));

    let kind = definition.kind;
    let database = definition.backend_database.clone();
    let base_url = snapshot
        .raw
        .server
        .base_url
        .clone()
        .unwrap_or_else(|| format!("tcp://{}", state.tunnel_addr));

    let handle = state
        .manager
        .create(
            identity.username.clone(),
            Arc::new(definition),
            duration,
            allow_list,
        )
        .await;

    crate::metrics::CONNECTS_TOTAL.with_label_values(&["allowed"]).inc();
    state.audit.log(
        &identity.username,
        "connect",
        name,
        serde_json::json!({"connection_id": handle.id, "duration_secs": duration.as_secs()}),
    );

    let proxy_url = format!("{base_url}/proxy/{}", handle.id);

    Ok(json_response(
        200,
        serde_json::json!({
            "connection_id": handle.id,
            "expires_at": handle.expires_at_unix(),
            "proxy_url": proxy_url,
            "type": kind,
            "database": database,
        }),
    ))
}

/// `/approvals/{id}/{approve|reject}` is deliberately unauthenticated:
/// out-of-band deciders (Slack, a webhook's emailed link) must be able to
/// land here directly without first obtaining a bearer token. `approver`
/// and `reason` arrive as query params rather than a JSON body so a plain
/// hyperlink click is enough.
async fn decide(
    state: &Arc<AppState>,
    req: Request<Body>,
    id: &str,
    approved: bool,
) -> Result<Response<Body>, BrokerError> {
    let approval_id = uuid::Uuid::parse_str(id)
        .map_err(|_| BrokerError::NotFound("malformed approval id".into()))?;

    let wants_json = req
        .headers()
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);

    let query: Vec<(String, String)> = req
        .uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    let approver = query
        .iter()
        .find(|(k, _)| k == "approver")
        .map(|(_, v)| v.clone());
    let reason = query
        .iter()
        .find(|(k, _)| k == "reason")
        .map(|(_, v)| v.clone());

    let applied = state
        .approval
        .submit_decision(approval_id, approved, approver.clone(), reason.clone());

    state.audit.log(
        approver.as_deref().unwrap_or("anonymous"),
        if approved {
            "http_approval_granted"
        } else {
            "http_approval_rejected"
        },
        "approval",
        serde_json::json!({"approval_id": approval_id, "applied": applied, "reason": reason}),
    );

    if wants_json {
        return Ok(json_response(
            200,
            serde_json::json!({ "applied": applied, "decision": if approved { "approved" } else { "rejected" } }),
        ));
    }

    let verb = if approved { "approved" } else { "rejected" };
    let html = format!(
        "<html><body><h1>Request {verb}</h1><p>approval {approval_id} was {verb}{}.</p></body></html>",
        if applied { "" } else { " (already decided)" }
    );
    Ok(Response::builder()
        .status(200)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Body::from(html))
        .unwrap_or_else(|_| Response::new(Body::empty())))
}

async fn recent_logs(
    state: &Arc<AppState>,
    req: Request<Body>,
) -> Result<Response<Body>, BrokerError> {
    let identity = authenticate(&req, &state.validator).await?;
    require_admin(&identity)?;
    let records = state.audit.recent();
    Ok(json_response(200, serde_json::json!({ "entries": records })))
}

/// Lets an admin force-expire a handle early. This closes the manager's
/// bookkeeping (registered streams, attached teardown) immediately, but
/// — since a raw socket read has no async cancel handle once a protocol
/// interceptor is blocked inside one — the interceptor task itself only
/// notices and exits once its own deadline-bounded read wakes up. That
/// deadline is already bounded by the handle's `expires_at`, so revoking
/// early mainly matters for interceptors that hold pooled backend state
/// (Redis cluster node connections) rather than the socket itself.
async fn revoke_connection(
    state: &Arc<AppState>,
    req: Request<Body>,
    id: &str,
) -> Result<Response<Body>, BrokerError> {
    let identity = authenticate(&req, &state.validator).await?;
    require_admin(&identity)?;
    let connection_id = uuid::Uuid::parse_str(id)
        .map_err(|_| BrokerError::NotFound("malformed connection id".into()))?;

    state.manager.remove_and_close(connection_id).await;
    state.audit.log(
        &identity.username,
        "connection_revoked",
        "admin",
        serde_json::json!({"connection_id": connection_id}),
    );

    Ok(json_response(200, serde_json::json!({ "revoked": true })))
}

fn metrics_response() -> Response<Body> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buf))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Everything read off the raw socket before the tunnel becomes
/// protocol-opaque: the target connection id and (optionally) a bearer
/// token re-asserting the caller's identity.
pub struct TunnelPreamble {
    pub connection_id: String,
    pub bearer_token: Option<String>,
}

const MAX_PREAMBLE_BYTES: usize = 8 * 1024;

pub async fn read_tunnel_preamble(
    stream: &mut tokio::net::TcpStream,
) -> Result<TunnelPreamble, BrokerError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_PREAMBLE_BYTES {
            return Err(BrokerError::ProtocolError("tunnel preamble too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(BrokerError::ProtocolError("connection closed before preamble".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut headers_buf = [httparse::EMPTY_HEADER; 16];
    let mut parsed = httparse::Request::new(&mut headers_buf);
    parsed
        .parse(&buf[..header_end])
        .map_err(|e| BrokerError::ProtocolError(format!("malformed tunnel preamble: {e}")))?;

    let path = parsed.path.unwrap_or("").to_string();
    let connection_id = path
        .trim_start_matches('/')
        .strip_prefix("proxy/")
        .unwrap_or("")
        .to_string();

    let bearer_token = parsed
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("authorization"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    Ok(TunnelPreamble { connection_id, bearer_token })
}

pub async fn write_tunnel_ok(stream: &mut tokio::net::TcpStream) -> Result<(), BrokerError> {
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    Ok(())
}

pub async fn write_tunnel_error(stream: &mut tokio::net::TcpStream, e: &BrokerError) {
    let body = e.to_string();
    let response = format!(
        "HTTP/1.1 {} Broker Error\r\nContent-Length: {}\r\n\r\n{}",
        e.http_status(),
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}
