//! HTTP/1.1 interceptor: reads requests off the hijacked socket, applies
//! the allow-list and approval gate to `"METHOD path"`, then proxies the
//! request to the real backend and relays the response back, injecting
//! permissive CORS headers along the way.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Interceptor, InterceptorContext};
use crate::approval::{ApprovalRequest, Decision};
use crate::authorizer;
use crate::error::BrokerError;
use crate::manager::ConnectionHandle;

pub struct HttpInterceptor;

struct ParsedRequest {
    method: String,
    path: String,
    version_minor: u8,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    keep_alive: bool,
}

const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Reads one HTTP/1.1 request (request line + headers via `httparse`,
/// then the body per `Content-Length`, chunked bodies unsupported in
/// this core). Returns `Ok(None)` on a clean connection close before any
/// bytes of a new request arrive.
async fn read_request(stream: &mut TcpStream) -> Result<Option<ParsedRequest>, BrokerError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(BrokerError::ProtocolError("request headers too large".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(BrokerError::ProtocolError("connection closed mid-request".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let mut headers_buf = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers_buf);
    let status = req
        .parse(&buf[..header_end])
        .map_err(|e| BrokerError::ProtocolError(format!("malformed request: {e}")))?;
    if status.is_partial() {
        return Err(BrokerError::ProtocolError("incomplete request line".into()));
    }

    let method = req.method.unwrap_or("GET").to_string();
    let path = req.path.unwrap_or("/").to_string();
    let version_minor = req.version.unwrap_or(1);

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    let mut keep_alive = version_minor != 0;
    for h in req.headers.iter() {
        let name = h.name.to_string();
        let value = String::from_utf8_lossy(h.value).to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.trim().parse().unwrap_or(0);
        }
        if name.eq_ignore_ascii_case("connection") {
            keep_alive = !value.eq_ignore_ascii_case("close");
        }
        headers.push((name, value));
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(BrokerError::ProtocolError("connection closed mid-body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(ParsedRequest {
        method,
        path,
        version_minor,
        headers,
        body,
        keep_alive,
    }))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn cors_headers() -> Vec<(String, String)> {
    vec![
        ("Access-Control-Allow-Origin".into(), "*".into()),
        (
            "Access-Control-Allow-Methods".into(),
            "GET, POST, PUT, PATCH, DELETE, OPTIONS".into(),
        ),
        ("Access-Control-Allow-Headers".into(), "*".into()),
    ]
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    extra_headers: &[(String, String)],
    body: &[u8],
) -> Result<(), BrokerError> {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n").into_bytes();
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    for (k, v) in extra_headers {
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    for (k, v) in cors_headers() {
        out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    stream.write_all(&out).await?;
    Ok(())
}

fn hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "keep-alive" | "proxy-authenticate" | "proxy-authorization"
            | "te" | "trailers" | "transfer-encoding" | "upgrade"
            // write_response always emits its own Content-Length computed
            // from the body it's actually writing; forwarding the
            // backend's copy alongside it would send the header twice.
            | "content-length"
    )
}

/// The broker injects its own permissive CORS headers (`cors_headers`)
/// on every response it writes, so any `Access-Control-*` header the
/// real backend sent is dropped rather than forwarded alongside them.
fn is_cors_header(name: &str) -> bool {
    name.to_ascii_lowercase().starts_with("access-control-")
}

#[async_trait::async_trait]
impl Interceptor for HttpInterceptor {
    async fn handle(
        &self,
        mut client: TcpStream,
        handle: Arc<ConnectionHandle>,
        ctx: Arc<InterceptorContext>,
    ) -> Result<(), BrokerError> {
        let base_url = format!(
            "{}://{}:{}",
            handle.definition.scheme.clone().unwrap_or_else(|| "http".to_string()),
            handle.definition.host,
            handle.definition.port,
        );
        let http_client = reqwest::Client::new();
        let deadline = handle.deadline();

        ctx.audit.log(
            &handle.username,
            "http_connect",
            &handle.definition.name,
            serde_json::json!({}),
        );

        let result = self.serve_requests(&mut client, &handle, &ctx, &http_client, &base_url, deadline).await;

        ctx.audit.log(
            &handle.username,
            "http_disconnect",
            &handle.definition.name,
            serde_json::json!({}),
        );

        result
    }
}

impl HttpInterceptor {
    #[allow(clippy::too_many_arguments)]
    async fn serve_requests(
        &self,
        client: &mut TcpStream,
        handle: &Arc<ConnectionHandle>,
        ctx: &Arc<InterceptorContext>,
        http_client: &reqwest::Client,
        base_url: &str,
        deadline: tokio::time::Instant,
    ) -> Result<(), BrokerError> {
        loop {
            let req = tokio::select! {
                r = read_request(client) => r?,
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
            };
            let req = match req {
                Some(r) => r,
                None => return Ok(()),
            };

            if req.method.eq_ignore_ascii_case("OPTIONS") {
                write_response(client, 200, "OK", &[], b"").await?;
                if !req.keep_alive {
                    return Ok(());
                }
                continue;
            }

            let subject = format!("{} {}", req.method, req.path);
            if !authorizer::validate_pattern(&subject, &handle.allow_list)? {
                ctx.audit.log(
                    &handle.username,
                    "http_request_blocked",
                    &handle.definition.name,
                    serde_json::json!({"method": req.method, "path": req.path}),
                );
                let body = serde_json::json!({"error": "blocked by whitelist"}).to_string();
                write_response(
                    client,
                    403,
                    "Forbidden",
                    &[("Content-Type".into(), "application/json".into())],
                    body.as_bytes(),
                )
                .await?;
                if !req.keep_alive {
                    return Ok(());
                }
                continue;
            }

            if let Some(timeout) = ctx.approval.requires_approval(&subject, &handle.definition.tags) {
                let request = ApprovalRequest {
                    id: uuid::Uuid::new_v4(),
                    username: handle.username.clone(),
                    connection_id: handle.id,
                    method: req.method.clone(),
                    path: req.path.clone(),
                };
                ctx.audit.log(
                    &handle.username,
                    "http_approval_requested",
                    &handle.definition.name,
                    serde_json::json!({"method": req.method, "path": req.path}),
                );
                let outcome = ctx.approval.request_approval(request, timeout).await;
                if outcome.decision == Decision::Approved {
                    ctx.audit.log(
                        &handle.username,
                        "http_approval_granted",
                        &handle.definition.name,
                        serde_json::json!({"decision": outcome.decision}),
                    );
                } else {
                    ctx.audit.log(
                        &handle.username,
                        "http_approval_rejected",
                        &handle.definition.name,
                        serde_json::json!({"decision": outcome.decision}),
                    );
                    write_response(client, 403, "Forbidden", &[], b"approval denied or timed out").await?;
                    if !req.keep_alive {
                        return Ok(());
                    }
                    continue;
                }
            }

            let url = format!("{base_url}{}", req.path);
            let method = reqwest::Method::from_bytes(req.method.as_bytes())
                .map_err(|_| BrokerError::ProtocolError(format!("unsupported method {}", req.method)))?;

            let mut builder = http_client.request(method, &url);
            for (k, v) in &req.headers {
                if hop_by_hop(k) || k.eq_ignore_ascii_case("host") {
                    continue;
                }
                builder = builder.header(k, v);
            }
            if !req.body.is_empty() {
                builder = builder.body(Bytes::from(req.body.clone()));
            }

            ctx.audit.log(
                &handle.username,
                "http_request",
                &handle.definition.name,
                serde_json::json!({"method": req.method, "path": req.path}),
            );

            match builder.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let reason = resp
                        .status()
                        .canonical_reason()
                        .unwrap_or("")
                        .to_string();
                    let mut headers = Vec::new();
                    for (k, v) in resp.headers().iter() {
                        if hop_by_hop(k.as_str()) || is_cors_header(k.as_str()) {
                            continue;
                        }
                        headers.push((k.to_string(), String::from_utf8_lossy(v.as_bytes()).to_string()));
                    }
                    let body = resp.bytes().await.unwrap_or_default();
                    write_response(client, status, &reason, &headers, &body).await?;
                }
                Err(e) => {
                    ctx.audit.log(
                        &handle.username,
                        "http_backend_error",
                        &handle.definition.name,
                        serde_json::json!({"error": e.to_string()}),
                    );
                    write_response(client, 502, "Bad Gateway", &[], b"backend unavailable").await?;
                }
            }

            if !req.keep_alive || req.version_minor == 0 {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_header_terminator() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody";
        assert_eq!(find_header_end(buf), Some(buf.len() - 4));
    }

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(hop_by_hop("Connection"));
        assert!(hop_by_hop("Transfer-Encoding"));
        assert!(!hop_by_hop("Content-Type"));
    }

    #[test]
    fn backend_content_length_is_filtered_since_write_response_computes_its_own() {
        // write_response always derives Content-Length from the body it's
        // actually writing; forwarding the backend's own header alongside
        // it would duplicate the header on the wire.
        assert!(hop_by_hop("Content-Length"));
        assert!(hop_by_hop("content-length"));
    }

    #[test]
    fn cors_headers_include_wildcard_origin() {
        let headers = cors_headers();
        assert!(headers
            .iter()
            .any(|(k, v)| k == "Access-Control-Allow-Origin" && v == "*"));
    }
}
