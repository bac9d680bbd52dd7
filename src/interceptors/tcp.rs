//! Raw TCP interceptor: no protocol awareness, just a deadline-bounded
//! dual-pipe copy between client and backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Interceptor, InterceptorContext};
use crate::error::BrokerError;
use crate::manager::ConnectionHandle;

pub struct TcpInterceptor;

async fn copy_until_deadline(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    deadline: tokio::time::Instant,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = tokio::select! {
            r = read_half.read(&mut buf) => r,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        let n = match read {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if write_half.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

#[async_trait::async_trait]
impl Interceptor for TcpInterceptor {
    async fn handle(
        &self,
        client: TcpStream,
        handle: Arc<ConnectionHandle>,
        ctx: Arc<InterceptorContext>,
    ) -> Result<(), BrokerError> {
        let backend = crate::manager::dial_backend(&handle.definition, Duration::from_secs(10)).await?;

        ctx.audit.log(
            &handle.username,
            "tcp_connect",
            &handle.definition.name,
            serde_json::json!({}),
        );

        let deadline = handle.deadline();
        let (client_read, client_write) = client.into_split();
        let (backend_read, backend_write) = backend.into_split();

        let a = tokio::spawn(copy_until_deadline(client_read, backend_write, deadline));
        let b = tokio::spawn(copy_until_deadline(backend_read, client_write, deadline));
        let _ = tokio::join!(a, b);

        ctx.audit.log(
            &handle.username,
            "tcp_disconnect",
            &handle.definition.name,
            serde_json::json!({}),
        );

        Ok(())
    }
}
