//! RESP interceptor: standalone passthrough plus cluster MOVED/ASK
//! redirection.
//!
//! The wire format is kept byte-exact end to end; we only decode enough
//! of the RESP array framing to pull out the command name and its first
//! argument (the key, when the command takes one) for the allow-list and
//! approval checks. Everything else — bulk string bodies, pipelining,
//! inline commands — passes through untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Interceptor, InterceptorContext};
use crate::approval::{ApprovalRequest, Decision};
use crate::error::BrokerError;
use crate::manager::{ConnectionHandle, InterceptorTeardown};

pub struct RedisInterceptor {
    pub cluster: bool,
}

/// One fully-framed RESP command: the raw bytes as received (forwarded
/// verbatim) plus the parsed argument list (for inspection only).
struct RespCommand {
    raw: Vec<u8>,
    args: Vec<Vec<u8>>,
}

/// Buffered reader over a RESP stream that yields one complete command
/// (an array of bulk strings, or a single inline line) at a time,
/// preserving the exact bytes read.
struct RespReader<'a> {
    stream: &'a mut (dyn tokio::io::AsyncRead + Unpin + Send),
    buf: Vec<u8>,
}

impl<'a> RespReader<'a> {
    fn new(stream: &'a mut (dyn tokio::io::AsyncRead + Unpin + Send)) -> Self {
        Self { stream, buf: Vec::new() }
    }

    async fn fill_until(&mut self, needed: usize) -> Result<(), BrokerError> {
        while self.buf.len() < needed {
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(BrokerError::ProtocolError("connection closed mid-frame".into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, BrokerError> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let line = self.buf[..pos].to_vec();
                self.buf.drain(..pos + 2);
                return Ok(line);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(BrokerError::ProtocolError("connection closed awaiting line".into()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads one full RESP command. Returns `Ok(None)` on clean EOF before
    /// any bytes of a new command arrive.
    async fn read_command(&mut self) -> Result<Option<RespCommand>, BrokerError> {
        let first_byte = {
            if self.buf.is_empty() {
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(None);
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
            self.buf[0]
        };

        if first_byte != b'*' {
            // Inline command: a single CRLF-terminated line, forwarded as-is.
            let line = self.read_line().await?;
            let mut raw = line.clone();
            raw.extend_from_slice(b"\r\n");
            let args = line
                .split(|&b| b == b' ')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_vec())
                .collect();
            return Ok(Some(RespCommand { raw, args }));
        }

        let header = self.read_line().await?; // consumes "*<n>"
        let count: i64 = std::str::from_utf8(&header[1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| BrokerError::ProtocolError("malformed array header".into()))?;

        let mut raw = Vec::new();
        raw.push(b'*');
        raw.extend_from_slice(count.to_string().as_bytes());
        raw.extend_from_slice(b"\r\n");

        let mut args = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count.max(0) {
            let bulk_header = self.read_line().await?;
            if bulk_header.first() != Some(&b'$') {
                return Err(BrokerError::ProtocolError("expected bulk string".into()));
            }
            raw.push(b'$');
            raw.extend_from_slice(&bulk_header[1..]);
            raw.extend_from_slice(b"\r\n");

            let len: i64 = std::str::from_utf8(&bulk_header[1..])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| BrokerError::ProtocolError("malformed bulk length".into()))?;
            if len < 0 {
                args.push(Vec::new());
                continue;
            }
            self.fill_until(len as usize + 2).await?;
            let body: Vec<u8> = self.buf.drain(..len as usize).collect();
            self.buf.drain(..2); // trailing CRLF
            raw.extend_from_slice(&body);
            raw.extend_from_slice(b"\r\n");
            args.push(body);
        }

        Ok(Some(RespCommand { raw, args }))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn command_name(cmd: &RespCommand) -> String {
    cmd.args
        .first()
        .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
        .unwrap_or_default()
}

fn command_subject(cmd: &RespCommand) -> String {
    let parts: Vec<String> = cmd
        .args
        .iter()
        .map(|a| String::from_utf8_lossy(a).to_string())
        .collect();
    parts.join(" ")
}

/// Matches `input` against a single glob term: `*` alone means "any
/// value", and `*` elsewhere in the literal acts as a wildcard segment —
/// the same semantics the `glob` crate's `Pattern` gives us for
/// filesystem globs, repurposed here for a single path component.
fn glob_term_matches(term: &str, input: &str) -> bool {
    if term == "*" {
        return true;
    }
    match glob::Pattern::new(term) {
        Ok(pattern) => pattern.matches(input),
        Err(_) => term.eq_ignore_ascii_case(input),
    }
}

/// A Redis allow-list entry: `COMMAND [arg-glob...]`. A pattern with only
/// a command matches that command irrespective of its arguments; an
/// arg-glob pattern requires the command to carry at least as many
/// arguments as globs, each matching positionally.
fn redis_pattern_matches(pattern: &str, cmd: &RespCommand) -> bool {
    let mut parts = pattern.split_whitespace();
    let want_cmd = match parts.next() {
        Some(c) => c,
        None => return false,
    };
    let have_cmd = command_name(cmd);
    if !want_cmd.eq_ignore_ascii_case(&have_cmd) {
        return false;
    }

    let globs: Vec<&str> = parts.collect();
    if globs.is_empty() {
        return true;
    }
    // args[0] is the command name itself; actual arguments start at 1.
    let arg_count = cmd.args.len().saturating_sub(1);
    if arg_count < globs.len() {
        return false;
    }
    globs.iter().enumerate().all(|(i, glob)| {
        let arg = String::from_utf8_lossy(&cmd.args[i + 1]);
        glob_term_matches(glob, &arg)
    })
}

/// `ValidatePattern` for Redis: an empty allow-list accepts everything;
/// otherwise the command must match at least one allow-list entry.
fn redis_allow(cmd: &RespCommand, allow_list: &[String]) -> bool {
    if allow_list.is_empty() {
        return true;
    }
    allow_list.iter().any(|p| redis_pattern_matches(p, cmd))
}

/// A `-MOVED <slot> <host>:<port>` or `-ASK <slot> <host>:<port>` error
/// line from a cluster node.
struct Redirect {
    ask: bool,
    host: String,
    port: u16,
}

fn parse_redirect(line: &[u8]) -> Option<Redirect> {
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.trim_start_matches('-').split_whitespace();
    let kind = parts.next()?;
    let ask = match kind {
        "MOVED" => false,
        "ASK" => true,
        _ => return None,
    };
    let _slot = parts.next()?;
    let addr = parts.next()?;
    let (host, port) = addr.rsplit_once(':')?;
    Some(Redirect {
        ask,
        host: host.to_string(),
        port: port.parse().ok()?,
    })
}

const MAX_REDIRECTS: u32 = 5;

struct NodePool {
    connections: SyncMutex<HashMap<String, ()>>,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl InterceptorTeardown for NodePool {
    async fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connections.lock().clear();
    }
}

/// Outcome of the allow-list + approval gate for one command.
enum Gate {
    Allowed,
    Blocked,
    ApprovalDenied,
}

async fn check_allowed(
    handle: &ConnectionHandle,
    ctx: &InterceptorContext,
    cmd: &RespCommand,
) -> Result<Gate, BrokerError> {
    let subject = command_subject(cmd);

    if !redis_allow(cmd, &handle.allow_list) {
        ctx.audit.log(
            &handle.username,
            "redis_command_blocked",
            &handle.definition.name,
            serde_json::json!({"command": command_name(cmd)}),
        );
        return Ok(Gate::Blocked);
    }

    if let Some(timeout) = ctx.approval.requires_approval(&subject, &handle.definition.tags) {
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4(),
            username: handle.username.clone(),
            connection_id: handle.id,
            method: command_name(cmd),
            path: subject.clone(),
        };
        ctx.audit.log(
            &handle.username,
            "redis_command_awaiting_approval",
            &handle.definition.name,
            serde_json::json!({"command": subject}),
        );
        let outcome = ctx.approval.request_approval(request, timeout).await;
        ctx.audit.log(
            &handle.username,
            if outcome.decision == Decision::Approved {
                "redis_command_approved"
            } else {
                "redis_command_rejected"
            },
            &handle.definition.name,
            serde_json::json!({
                "decision": outcome.decision,
                "command": subject,
                "approver": outcome.decided_by,
            }),
        );
        if outcome.decision != Decision::Approved {
            return Ok(Gate::ApprovalDenied);
        }
    }

    Ok(Gate::Allowed)
}

async fn write_error(stream: &mut TcpStream, message: &str) -> Result<(), BrokerError> {
    stream
        .write_all(format!("-ERR {message}\r\n").as_bytes())
        .await?;
    Ok(())
}

/// Same as [`write_error`], but for the standalone path's write half,
/// shared with the backend->client passthrough copier under a mutex.
async fn write_error_locked(
    write: &Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    message: &str,
) -> Result<(), BrokerError> {
    write
        .lock()
        .await
        .write_all(format!("-ERR {message}\r\n").as_bytes())
        .await?;
    Ok(())
}

/// Backend->client passthrough with no RESP interpretation: used by the
/// standalone flow so pipelined replies and unsolicited RESP3 push frames
/// are relayed independently of the client->backend command gate loop.
async fn copy_plain(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    write_half: Arc<tokio::sync::Mutex<tokio::net::tcp::OwnedWriteHalf>>,
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
        if write_half.lock().await.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = write_half.lock().await.shutdown().await;
}

/// Sends `AUTH <password>` on a freshly-dialed backend connection and
/// requires `+OK`. A no-op when `password` is `None` (the backend has no
/// password configured).
async fn authenticate_backend(conn: &mut TcpStream, password: Option<&str>) -> Result<(), BrokerError> {
    let password = match password {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(()),
    };
    let mut msg = Vec::new();
    msg.extend_from_slice(b"*2\r\n$4\r\nAUTH\r\n");
    msg.extend_from_slice(format!("${}\r\n", password.len()).as_bytes());
    msg.extend_from_slice(password.as_bytes());
    msg.extend_from_slice(b"\r\n");
    conn.write_all(&msg).await?;

    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        conn.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
    }
    if line.first() == Some(&b'+') {
        Ok(())
    } else {
        Err(BrokerError::BackendUnavailable(format!(
            "backend AUTH failed: {}",
            String::from_utf8_lossy(&line)
        )))
    }
}

#[async_trait::async_trait]
impl Interceptor for RedisInterceptor {
    async fn handle(
        &self,
        client: TcpStream,
        handle: Arc<ConnectionHandle>,
        ctx: Arc<InterceptorContext>,
    ) -> Result<(), BrokerError> {
        ctx.audit.log(
            &handle.username,
            "redis_connect",
            &handle.definition.name,
            serde_json::json!({"cluster": self.cluster}),
        );
        let result = if self.cluster {
            self.handle_cluster(client, handle.clone(), ctx.clone()).await
        } else {
            let mut backend =
                crate::manager::dial_backend(&handle.definition, Duration::from_secs(10)).await?;
            authenticate_backend(&mut backend, handle.definition.backend_password.as_deref()).await?;
            self.pump(client, backend, &handle, &ctx).await
        };
        ctx.audit.log(
            &handle.username,
            "redis_disconnect",
            &handle.definition.name,
            serde_json::json!({}),
        );
        result
    }
}

impl RedisInterceptor {
    /// Standalone loop: read a command from the client, gate it, forward
    /// to `backend` if allowed. The backend->client direction runs as its
    /// own dedicated passthrough task rather than one reply read per
    /// command here, so pipelined commands and unsolicited RESP3 push
    /// frames are relayed independently of the serial client->backend gate
    /// loop (spec's "preserves pipelining and out-of-order RESP3 push
    /// frames").
    async fn pump(
        &self,
        client: TcpStream,
        backend: TcpStream,
        handle: &Arc<ConnectionHandle>,
        ctx: &Arc<InterceptorContext>,
    ) -> Result<(), BrokerError> {
        let deadline = handle.deadline();
        let (mut client_read, client_write) = client.into_split();
        let (backend_read, mut backend_write) = backend.into_split();
        let client_write = Arc::new(tokio::sync::Mutex::new(client_write));

        let passthrough = tokio::spawn(copy_plain(backend_read, client_write.clone(), deadline));

        loop {
            let mut reader = RespReader::new(&mut client_read);
            let cmd = tokio::select! {
                c = reader.read_command() => c?,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            let cmd = match cmd {
                Some(c) => c,
                None => break,
            };

            match check_allowed(handle, ctx, &cmd).await? {
                Gate::Allowed => {}
                Gate::Blocked => {
                    write_error_locked(&client_write, "command not permitted by policy").await?;
                    continue;
                }
                Gate::ApprovalDenied => {
                    write_error_locked(&client_write, "Command rejected or timed out").await?;
                    continue;
                }
            }

            backend_write.write_all(&cmd.raw).await?;
            ctx.audit.log(
                &handle.username,
                "redis_command",
                &handle.definition.name,
                serde_json::json!({"command": command_name(&cmd)}),
            );
        }

        passthrough.abort();
        Ok(())
    }

    async fn handle_cluster(
        &self,
        mut client: TcpStream,
        handle: Arc<ConnectionHandle>,
        ctx: Arc<InterceptorContext>,
    ) -> Result<(), BrokerError> {
        let pool = Arc::new(NodePool {
            connections: SyncMutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        });
        ctx.manager.attach_teardown(handle.id, pool.clone()).await;

        let deadline = handle.deadline();
        let mut current = crate::manager::dial_backend(&handle.definition, Duration::from_secs(10)).await?;
        authenticate_backend(&mut current, handle.definition.backend_password.as_deref()).await?;

        loop {
            if pool.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            let mut reader = RespReader::new(&mut client);
            let cmd = tokio::select! {
                c = reader.read_command() => c?,
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
            };
            let cmd = match cmd {
                Some(c) => c,
                None => return Ok(()),
            };

            match check_allowed(&handle, &ctx, &cmd).await? {
                Gate::Allowed => {}
                Gate::Blocked => {
                    write_error(&mut client, "command not permitted by policy").await?;
                    continue;
                }
                Gate::ApprovalDenied => {
                    write_error(&mut client, "Command rejected or timed out").await?;
                    continue;
                }
            }

            ctx.audit.log(
                &handle.username,
                "redis_command",
                &handle.definition.name,
                serde_json::json!({"command": command_name(&cmd)}),
            );

            let mut redirects = 0u32;
            let mut redirected_conn: Option<TcpStream> = None;

            loop {
                let target = redirected_conn.as_mut().unwrap_or(&mut current);
                target.write_all(&cmd.raw).await?;

                match relay_one_reply(target, &mut client).await? {
                    None => break,
                    Some((_, line)) if redirects >= MAX_REDIRECTS => {
                        client.write_all(&line).await?;
                        break;
                    }
                    Some((redirect, _)) => {
                        redirects += 1;
                        let addr = format!("{}:{}", redirect.host, redirect.port);
                        let mut next = TcpStream::connect(&addr).await.map_err(|e| {
                            BrokerError::BackendUnavailable(format!("could not dial redirect target {addr}: {e}"))
                        })?;
                        authenticate_backend(&mut next, handle.definition.backend_password.as_deref())
                            .await?;
                        ctx.audit.log(
                            &handle.username,
                            if redirect.ask {
                                "redis_cluster_ask"
                            } else {
                                "redis_cluster_moved"
                            },
                            &handle.definition.name,
                            serde_json::json!({"new_node": addr}),
                        );
                        if redirect.ask {
                            let asking = b"*1\r\n$6\r\nASKING\r\n";
                            next.write_all(asking).await?;
                            let mut discard = Vec::new();
                            let mut single = [0u8; 1];
                            loop {
                                next.read_exact(&mut single).await?;
                                discard.push(single[0]);
                                if discard.ends_with(b"\r\n") && discard.len() > 2 {
                                    break;
                                }
                            }
                        }
                        redirected_conn = Some(next);
                    }
                }
            }

            if let Some(conn) = redirected_conn {
                drop(conn);
            }
        }
    }
}

/// Reads one full reply off `from` and forwards it verbatim to `to`.
/// Returns `Some(redirect)` if the reply was a `-MOVED`/`-ASK` error, so
/// the caller can re-dial and retry rather than passing it through.
async fn relay_one_reply(
    from: &mut TcpStream,
    to: &mut TcpStream,
) -> Result<Option<(Redirect, Vec<u8>)>, BrokerError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        from.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
    }

    if line[0] == b'-' {
        if let Some(redirect) = parse_redirect(&line[..line.len() - 2]) {
            return Ok(Some((redirect, line)));
        }
        to.write_all(&line).await?;
        return Ok(None);
    }

    to.write_all(&line).await?;

    match line[0] {
        b'+' | b':' => {}
        b'$' => {
            let len: i64 = std::str::from_utf8(&line[1..line.len() - 2])
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(-1);
            if len >= 0 {
                let mut body = vec![0u8; len as usize + 2];
                from.read_exact(&mut body).await?;
                to.write_all(&body).await?;
            }
        }
        b'*' => {
            let count: i64 = std::str::from_utf8(&line[1..line.len() - 2])
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            for _ in 0..count.max(0) {
                relay_array_element(from, to).await?;
            }
        }
        _ => {}
    }

    Ok(None)
}

fn relay_array_element<'a>(
    from: &'a mut TcpStream,
    to: &'a mut TcpStream,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), BrokerError>> + Send + 'a>> {
    Box::pin(async move {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            from.read_exact(&mut byte).await?;
            line.push(byte[0]);
            if line.ends_with(b"\r\n") {
                break;
            }
        }
        to.write_all(&line).await?;
        match line[0] {
            b'$' => {
                let len: i64 = std::str::from_utf8(&line[1..line.len() - 2])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(-1);
                if len >= 0 {
                    let mut body = vec![0u8; len as usize + 2];
                    from.read_exact(&mut body).await?;
                    to.write_all(&body).await?;
                }
            }
            b'*' => {
                let count: i64 = std::str::from_utf8(&line[1..line.len() - 2])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                for _ in 0..count.max(0) {
                    relay_array_element(from, to).await?;
                }
            }
            _ => {}
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_moved_redirect() {
        let r = parse_redirect(b"-MOVED 3999 127.0.0.1:6381").unwrap();
        assert!(!r.ask);
        assert_eq!(r.host, "127.0.0.1");
        assert_eq!(r.port, 6381);
    }

    #[test]
    fn parses_ask_redirect() {
        let r = parse_redirect(b"-ASK 3999 10.0.0.5:7000").unwrap();
        assert!(r.ask);
        assert_eq!(r.port, 7000);
    }

    #[test]
    fn non_redirect_error_returns_none() {
        assert!(parse_redirect(b"-ERR unknown command").is_none());
    }

    async fn feed(bytes: &[u8]) -> tokio::io::DuplexStream {
        let (mut writer, reader) = tokio::io::duplex(4096);
        writer.write_all(bytes).await.unwrap();
        drop(writer);
        reader
    }

    #[tokio::test]
    async fn reads_array_command_and_preserves_raw_bytes() {
        let raw = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n".to_vec();
        let mut source = feed(&raw).await;
        let mut reader = RespReader::new(&mut source);
        let cmd = reader.read_command().await.unwrap().unwrap();
        assert_eq!(cmd.args, vec![b"GET".to_vec(), b"foo".to_vec()]);
        assert_eq!(cmd.raw, raw);
    }

    #[tokio::test]
    async fn reads_inline_command() {
        let raw = b"PING\r\n".to_vec();
        let mut source = feed(&raw).await;
        let mut reader = RespReader::new(&mut source);
        let cmd = reader.read_command().await.unwrap().unwrap();
        assert_eq!(cmd.args, vec![b"PING".to_vec()]);
    }

    #[test]
    fn command_subject_joins_args_with_spaces() {
        let cmd = RespCommand {
            raw: Vec::new(),
            args: vec![b"SET".to_vec(), b"foo".to_vec(), b"bar".to_vec()],
        };
        assert_eq!(command_subject(&cmd), "SET foo bar");
    }

    fn cmd(args: &[&str]) -> RespCommand {
        RespCommand {
            raw: Vec::new(),
            args: args.iter().map(|a| a.as_bytes().to_vec()).collect(),
        }
    }

    #[test]
    fn command_only_pattern_matches_regardless_of_args() {
        assert!(redis_pattern_matches("GET", &cmd(&["GET", "any-key"])));
        assert!(redis_pattern_matches("get", &cmd(&["GET", "any-key"])));
    }

    #[test]
    fn arg_glob_matches_positionally() {
        assert!(redis_pattern_matches("SET user:*", &cmd(&["SET", "user:42", "val"])));
        assert!(!redis_pattern_matches("SET user:*", &cmd(&["SET", "order:42", "val"])));
    }

    #[test]
    fn arg_glob_requires_enough_arguments() {
        assert!(!redis_pattern_matches("SET user:* *", &cmd(&["SET", "user:42"])));
    }

    #[test]
    fn redis_allow_empty_list_accepts_everything() {
        assert!(redis_allow(&cmd(&["FLUSHALL"]), &[]));
    }

    #[test]
    fn redis_allow_denies_unmatched_command() {
        let allow_list = vec!["GET *".to_string()];
        assert!(redis_allow(&cmd(&["GET", "foo"]), &allow_list));
        assert!(!redis_allow(&cmd(&["FLUSHALL"]), &allow_list));
    }
}
