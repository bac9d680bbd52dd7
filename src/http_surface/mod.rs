//! The control-plane HTTP surface: login, connection discovery, tunnel
//! establishment (the hijack handshake), approval decisions, and a
//! couple of operational endpoints (`/health`, `/metrics`,
//! `/admin/recent-logs`).
//!
//! Routing is a direct `hyper::service::service_fn` match on method and
//! path rather than a router crate: the handshake itself already needs
//! to reach under `hyper`'s request/response abstraction to call
//! `hyper::upgrade::on`, so the rest of the surface stays on the same
//! level rather than mixing two different routing styles.

pub mod middleware;
pub mod routes;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tokio::net::TcpListener;

use crate::approval::ApprovalCoordinator;
use crate::audit::AuditSink;
use crate::config::ConfigHandle;
use crate::identity::LocalValidator;
use crate::interceptors::{self, InterceptorContext, InterceptorKind};
use crate::manager::ConnectionManager;

/// Everything a request handler needs, bundled so `service_fn` closures
/// stay small.
pub struct AppState {
    pub config: ConfigHandle,
    pub manager: Arc<ConnectionManager>,
    pub audit: Arc<AuditSink>,
    pub approval: Arc<ApprovalCoordinator>,
    pub validator: Arc<LocalValidator>,
    /// The tunnel listener's bound address, used to build `proxy_url`
    /// when `server.base_url` isn't configured.
    pub tunnel_addr: SocketAddr,
}

async fn dispatch(
    state: Arc<AppState>,
    remote: SocketAddr,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let response = routes::route(&state, remote, req).await;
    Ok(response.unwrap_or_else(|e| middleware::error_response(&e)))
}

/// Runs the control-plane HTTP server; never returns under normal
/// operation.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
        let state = state.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                dispatch(state.clone(), remote, req)
            }))
        }
    });

    tracing::info!(%addr, "control plane listening");
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

/// Runs the tunnel listener: a plain TCP socket where clients present a
/// single minimal HTTP preamble (`GET /proxy/{id} HTTP/1.1` plus an
/// `Authorization` header) before the connection is handed off, byte
/// for byte, to the protocol interceptor selected by the connection
/// definition's kind.
pub async fn serve_tunnel(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tunnel listener listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tunnel_connection(stream, &state).await {
                tracing::warn!(error = %e, %peer, "tunnel connection ended with error");
            }
        });
    }
}

async fn handle_tunnel_connection(
    mut stream: tokio::net::TcpStream,
    state: &AppState,
) -> Result<(), crate::error::BrokerError> {
    let preamble = routes::read_tunnel_preamble(&mut stream).await?;
    let id = uuid::Uuid::parse_str(&preamble.connection_id)
        .map_err(|_| crate::error::BrokerError::NotFound("malformed connection id".into()))?;

    let handle = match state.manager.get(id).await {
        Ok(h) => h,
        Err(e) => {
            routes::write_tunnel_error(&mut stream, &e).await;
            return Err(e);
        }
    };

    if let Some(token) = &preamble.bearer_token {
        match state.validator.validate(token).await {
            Ok(identity) if identity.username == handle.username => {}
            _ => {
                let err = crate::error::BrokerError::AuthFailure("token does not match session".into());
                routes::write_tunnel_error(&mut stream, &err).await;
                return Err(err);
            }
        }
    }

    routes::write_tunnel_ok(&mut stream).await?;

    state.audit.log(
        &handle.username,
        "proxy_session",
        &handle.definition.name,
        serde_json::json!({"kind": handle.definition.kind}),
    );

    let kind = InterceptorKind::for_connection_kind(handle.definition.kind, handle.definition.redis_cluster);
    let interceptor = interceptors::build(&kind);
    let ctx = Arc::new(InterceptorContext {
        audit: state.audit.clone(),
        approval: state.approval.clone(),
        manager: state.manager.clone(),
    });

    interceptor.handle(stream, handle, ctx).await
}
