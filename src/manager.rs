//! Connection lifecycle manager: handle issuance, TTL enforcement, and
//! forced stream termination.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex as SyncMutex;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::config::ConnectionDefinition;
use crate::error::BrokerError;

/// A client socket registered against a handle, so the sweeper can force
/// it closed when the handle expires. Identified by an opaque id rather
/// than the socket itself; the socket owns its own shutdown via the
/// `closed` flag checked by the copier loops.
pub struct StreamHandle {
    pub id: Uuid,
    closed: Arc<AtomicBool>,
}

impl StreamHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

pub struct ConnectionHandle {
    pub id: Uuid,
    pub username: String,
    pub definition: Arc<ConnectionDefinition>,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    pub allow_list: Vec<String>,
    active_streams: SyncMutex<HashMap<Uuid, Arc<StreamHandle>>>,
}

impl ConnectionHandle {
    pub fn is_expired(&self) -> bool {
        SystemTime::now() > self.expires_at
    }

    pub fn expires_at_unix(&self) -> u64 {
        self.expires_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    pub fn register_stream(&self) -> Arc<StreamHandle> {
        let stream = Arc::new(StreamHandle::new());
        self.active_streams.lock().insert(stream.id, stream.clone());
        stream
    }

    pub fn unregister_stream(&self, id: Uuid) {
        self.active_streams.lock().remove(&id);
    }

    fn force_close_all(&self) {
        for (_, stream) in self.active_streams.lock().drain() {
            stream.mark_closed();
        }
    }

    /// Applies the handle's deadline to a hijacked socket's read/write
    /// timeouts is done by callers via [`ConnectionHandle::expires_at`];
    /// TCP itself has no notion of a deadline, so interceptors race reads
    /// against `tokio::time::sleep_until(expires_at)`.
    pub fn deadline(&self) -> tokio::time::Instant {
        let now_std = SystemTime::now();
        let remaining = self
            .expires_at
            .duration_since(now_std)
            .unwrap_or(Duration::ZERO);
        tokio::time::Instant::now() + remaining
    }
}

/// Anything the manager needs to tear down when a handle dies: the PG/
/// Redis/HTTP/TCP interceptor's own per-connection state (pooled sockets,
/// cluster node connections, ...). Protocol interceptors that need
/// teardown register one of these; stateless ones (PG, HTTP) don't need
/// to since their state lives entirely on the per-stream task stack.
#[async_trait::async_trait]
pub trait InterceptorTeardown: Send + Sync {
    async fn teardown(&self);
}

struct ManagedHandle {
    handle: Arc<ConnectionHandle>,
    teardown: Option<Arc<dyn InterceptorTeardown>>,
}

pub struct ConnectionManager {
    handles: RwLock<HashMap<Uuid, ManagedHandle>>,
    audit: Arc<AuditSink>,
}

impl ConnectionManager {
    pub fn new(audit: Arc<AuditSink>) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            audit,
        }
    }

    /// `Create(user, def, duration, allow_list)`.
    pub async fn create(
        &self,
        username: String,
        definition: Arc<ConnectionDefinition>,
        duration: Duration,
        allow_list: Vec<String>,
    ) -> Arc<ConnectionHandle> {
        let now = SystemTime::now();
        let handle = Arc::new(ConnectionHandle {
            id: Uuid::new_v4(),
            username,
            definition,
            created_at: now,
            expires_at: now + duration,
            allow_list,
            active_streams: SyncMutex::new(HashMap::new()),
        });

        self.handles.write().await.insert(
            handle.id,
            ManagedHandle {
                handle: handle.clone(),
                teardown: None,
            },
        );
        crate::metrics::ACTIVE_CONNECTIONS.inc();

        handle
    }

    pub async fn attach_teardown(&self, id: Uuid, teardown: Arc<dyn InterceptorTeardown>) {
        if let Some(entry) = self.handles.write().await.get_mut(&id) {
            entry.teardown = Some(teardown);
        }
    }

    /// `Get(id)`. Unknown and expired ids are reported distinctly so
    /// callers can map them to `NotFound`/`Expired` respectively.
    pub async fn get(&self, id: Uuid) -> Result<Arc<ConnectionHandle>, BrokerError> {
        let handles = self.handles.read().await;
        let entry = handles
            .get(&id)
            .ok_or_else(|| BrokerError::NotFound(format!("unknown connection handle {id}")))?;
        if entry.handle.is_expired() {
            return Err(BrokerError::Expired);
        }
        Ok(entry.handle.clone())
    }

    pub async fn remove_and_close(&self, id: Uuid) {
        let removed = self.handles.write().await.remove(&id);
        if let Some(entry) = removed {
            crate::metrics::ACTIVE_CONNECTIONS.dec();
            entry.handle.force_close_all();
            if let Some(teardown) = entry.teardown {
                teardown.teardown().await;
            }
        }
    }

    /// One sweep: force-close every handle past its `expires_at`. A
    /// single failing teardown must not prevent closing the rest.
    pub async fn sweep(&self) {
        let expired: Vec<(Uuid, String, String)> = {
            let handles = self.handles.read().await;
            handles
                .iter()
                .filter(|(_, e)| e.handle.is_expired())
                .map(|(id, e)| (*id, e.handle.username.clone(), e.handle.definition.name.clone()))
                .collect()
        };

        for (id, username, connection_name) in expired {
            self.remove_and_close(id).await;
            crate::metrics::HANDLES_EXPIRED_TOTAL.inc();
            self.audit.log(
                &username,
                "proxy_disconnect",
                &connection_name,
                serde_json::json!({"reason": "timeout"}),
            );
        }
    }

    /// `CloseAll`: invoked on shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<Uuid> = self.handles.read().await.keys().copied().collect();
        for id in ids {
            self.remove_and_close(id).await;
        }
    }

    pub async fn active_count(&self) -> usize {
        self.handles.read().await.len()
    }
}

/// Spawns the periodic sweeper loop; never returns.
pub async fn run_sweeper(manager: Arc<ConnectionManager>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        manager.sweep().await;
    }
}

/// Dials the TCP backend for a connection definition, applying the
/// connect-side of the handle's deadline as a timeout.
pub async fn dial_backend(
    definition: &ConnectionDefinition,
    connect_timeout: Duration,
) -> Result<TcpStream, BrokerError> {
    let addr = format!("{}:{}", definition.host, definition.port);
    tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| BrokerError::BackendUnavailable(format!("timed out dialing {addr}")))?
        .map_err(|e| BrokerError::BackendUnavailable(format!("could not dial {addr}: {e}")))
}
