//! Protocol interceptors share only a "take over a hijacked stream and
//! run the protocol state machine" contract. Per-kind state is carried
//! as a tagged enum payload rather than a deeper trait-object hierarchy.

pub mod http;
pub mod postgres;
pub mod redis;
pub mod tcp;

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::approval::ApprovalCoordinator;
use crate::audit::AuditSink;
use crate::config::ConnectionKind;
use crate::error::BrokerError;
use crate::manager::{ConnectionHandle, ConnectionManager};

/// Per-kind dispatch tag. Each variant's payload (if any) is the
/// per-connection state the interceptor needs across the stream's
/// lifetime (e.g. the Redis cluster's set of per-node connections).
pub enum InterceptorKind {
    Postgres,
    Redis { cluster: bool },
    Http,
    Tcp,
}

impl InterceptorKind {
    pub fn for_connection_kind(kind: ConnectionKind, redis_cluster: bool) -> Self {
        match kind {
            ConnectionKind::Postgres => InterceptorKind::Postgres,
            ConnectionKind::Redis => InterceptorKind::Redis {
                cluster: redis_cluster,
            },
            ConnectionKind::Http | ConnectionKind::Https => InterceptorKind::Http,
            ConnectionKind::Tcp => InterceptorKind::Tcp,
        }
    }
}

/// Shared collaborators every interceptor needs: where to log, where to
/// ask for human approval (Redis/HTTP), and the manager that owns this
/// stream's handle — so an interceptor holding its own pooled backend
/// state (the Redis cluster node pool) can register a teardown hook that
/// an admin-triggered revoke wakes up, rather than only the handle's own
/// deadline.
pub struct InterceptorContext {
    pub audit: Arc<AuditSink>,
    pub approval: Arc<ApprovalCoordinator>,
    pub manager: Arc<ConnectionManager>,
}

/// `HandleHijackedStream(stream, handle) -> error`.
#[async_trait::async_trait]
pub trait Interceptor: Send + Sync {
    async fn handle(
        &self,
        client: TcpStream,
        handle: Arc<ConnectionHandle>,
        ctx: Arc<InterceptorContext>,
    ) -> Result<(), BrokerError>;
}

pub fn build(kind: &InterceptorKind) -> Box<dyn Interceptor> {
    match kind {
        InterceptorKind::Postgres => Box::new(postgres::PostgresInterceptor),
        InterceptorKind::Redis { cluster } => Box::new(redis::RedisInterceptor { cluster: *cluster }),
        InterceptorKind::Http => Box::new(http::HttpInterceptor),
        InterceptorKind::Tcp => Box::new(tcp::TcpInterceptor),
    }
}
