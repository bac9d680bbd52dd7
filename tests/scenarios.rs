//! End-to-end tests driving the control plane and tunnel listener the
//! same way a real client would: log in over HTTP, request a connection,
//! open the raw tunnel socket, and speak the backend protocol directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as TokioMutex;

use brokerd::audit::AuditSink;
use brokerd::config;
use brokerd::http_surface::{self, AppState};
use brokerd::identity::LocalValidator;
use brokerd::manager::ConnectionManager;

mod support {
    use super::*;

    pub struct TestBroker {
        pub control_addr: SocketAddr,
        pub tunnel_addr: SocketAddr,
        pub audit: Arc<AuditSink>,
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Boots a broker against an in-process config, on ephemeral ports.
    /// Ports are claimed by binding then immediately dropping, same as the
    /// control/tunnel listeners themselves do when re-bound a moment
    /// later; acceptable for local, single-process test runs.
    pub async fn spawn_broker(yaml: &str) -> TestBroker {
        let snapshot = config::load_from_str(yaml).expect("valid test config");
        let audit = Arc::new(AuditSink::open(&snapshot.raw.logging.audit_log_path, 1024 * 1024).unwrap());
        let validator = Arc::new(LocalValidator::new(
            snapshot.raw.auth.jwt_secret.clone().into_bytes(),
            snapshot.raw.auth.token_expiry.as_secs(),
            snapshot.raw.auth.users.clone(),
        ));
        let approval = Arc::new(
            brokerd::approval::ApprovalCoordinator::from_config(snapshot.raw.approval.as_ref()).unwrap(),
        );
        let manager = Arc::new(ConnectionManager::new(audit.clone()));

        let control_addr: SocketAddr = format!("127.0.0.1:{}", free_port().await).parse().unwrap();
        let tunnel_addr: SocketAddr = format!("127.0.0.1:{}", free_port().await).parse().unwrap();

        let config_handle = config::ConfigHandle::new(snapshot);
        let state = Arc::new(AppState {
            config: config_handle,
            manager: manager.clone(),
            audit: audit.clone(),
            approval,
            validator,
            tunnel_addr,
        });

        tokio::spawn(http_surface::serve(control_addr, state.clone()));
        tokio::spawn(http_surface::serve_tunnel(tunnel_addr, state));
        tokio::spawn(async move {
            brokerd::manager::run_sweeper(manager, Duration::from_millis(200)).await;
        });
        tokio::time::sleep(Duration::from_millis(150)).await;

        TestBroker { control_addr, tunnel_addr, audit }
    }

    pub async fn login(control_addr: SocketAddr, username: &str, password: &str) -> String {
        let resp = reqwest::Client::new()
            .post(format!("http://{control_addr}/login"))
            .json(&serde_json::json!({"username": username, "password": password}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    pub async fn connect(control_addr: SocketAddr, token: &str, name: &str, ttl: Option<&str>) -> serde_json::Value {
        let url = match ttl {
            Some(t) => format!("http://{control_addr}/connect/{name}?ttl={t}"),
            None => format!("http://{control_addr}/connect/{name}"),
        };
        let resp = reqwest::Client::new().post(url).bearer_auth(token).send().await.unwrap();
        assert_eq!(resp.status(), 200, "connect should succeed");
        resp.json().await.unwrap()
    }

    /// Opens the tunnel socket and drives the hijack handshake; returns
    /// the raw stream, now speaking whatever protocol the connection kind
    /// expects.
    pub async fn open_tunnel(tunnel_addr: SocketAddr, connection_id: &str, token: &str) -> TcpStream {
        let mut stream = TcpStream::connect(tunnel_addr).await.unwrap();
        let preamble = format!("GET /proxy/{connection_id} HTTP/1.1\r\nAuthorization: Bearer {token}\r\n\r\n");
        stream.write_all(preamble.as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "tunnel closed before handshake reply");
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        assert!(buf.starts_with(b"HTTP/1.1 200"), "tunnel handshake failed: {}", String::from_utf8_lossy(&buf));
        stream
    }

    pub fn find_action<'a>(
        records: &'a [brokerd::audit::AuditRecord],
        action: &str,
        resource: &str,
    ) -> Option<&'a brokerd::audit::AuditRecord> {
        records.iter().rev().find(|r| r.action == action && r.resource == resource)
    }

    pub mod pgwire {
        use super::*;

        const PROTOCOL_VERSION_3: i32 = 196_608;

        pub async fn read_message(stream: &mut TcpStream) -> (u8, Vec<u8>) {
            let tag = stream.read_u8().await.unwrap();
            let len = stream.read_i32().await.unwrap() as usize;
            let mut body = vec![0u8; len - 4];
            stream.read_exact(&mut body).await.unwrap();
            (tag, body)
        }

        /// Drives the client side of the startup/auth handshake: any
        /// password digest is accepted by the broker (identity was
        /// already proven at `/connect`), only the username is checked.
        pub async fn client_handshake(stream: &mut TcpStream, username: &str, database: &str) {
            let mut params = Vec::new();
            params.extend_from_slice(b"user\0");
            params.extend_from_slice(username.as_bytes());
            params.push(0);
            params.extend_from_slice(b"database\0");
            params.extend_from_slice(database.as_bytes());
            params.push(0);
            params.push(0);

            let mut startup = Vec::new();
            startup.extend_from_slice(&((params.len() + 8) as i32).to_be_bytes());
            startup.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
            startup.extend_from_slice(&params);
            stream.write_all(&startup).await.unwrap();

            let (tag, body) = read_message(stream).await;
            assert_eq!(tag, b'R');
            assert_eq!(i32::from_be_bytes(body[0..4].try_into().unwrap()), 5, "expected AuthenticationMD5Password");

            let digest = "md5deadbeefdeadbeefdeadbeefdead";
            let mut msg = vec![b'p'];
            msg.extend_from_slice(&((digest.len() + 1 + 4) as i32).to_be_bytes());
            msg.extend_from_slice(digest.as_bytes());
            msg.push(0);
            stream.write_all(&msg).await.unwrap();

            loop {
                let (tag, _) = read_message(stream).await;
                if tag == b'Z' {
                    break;
                }
            }
        }

        pub async fn simple_query(stream: &mut TcpStream, sql: &str) {
            let mut body = sql.as_bytes().to_vec();
            body.push(0);
            let mut msg = vec![b'Q'];
            msg.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
            msg.extend_from_slice(&body);
            stream.write_all(&msg).await.unwrap();
        }

        /// A fake Postgres backend: trust-auths any startup, records every
        /// Simple Query it receives, and replies with a canned
        /// CommandComplete/ReadyForQuery pair.
        pub async fn spawn_fake_backend() -> (u16, Arc<TokioMutex<Vec<String>>>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let queries = Arc::new(TokioMutex::new(Vec::new()));
            let queries2 = queries.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(s) => s,
                        Err(_) => break,
                    };
                    tokio::spawn(serve_one(stream, queries2.clone()));
                }
            });
            (port, queries)
        }

        async fn serve_one(mut stream: TcpStream, queries: Arc<TokioMutex<Vec<String>>>) {
            let len = match stream.read_i32().await {
                Ok(l) => l,
                Err(_) => return,
            };
            let mut rest = vec![0u8; (len as usize).saturating_sub(4)];
            if stream.read_exact(&mut rest).await.is_err() {
                return;
            }

            let mut ok = vec![b'R'];
            ok.extend_from_slice(&8i32.to_be_bytes());
            ok.extend_from_slice(&0i32.to_be_bytes());
            if stream.write_all(&ok).await.is_err() {
                return;
            }

            let mut rfq = vec![b'Z'];
            rfq.extend_from_slice(&5i32.to_be_bytes());
            rfq.push(b'I');
            if stream.write_all(&rfq).await.is_err() {
                return;
            }

            loop {
                let tag = match stream.read_u8().await {
                    Ok(t) => t,
                    Err(_) => return,
                };
                let len = match stream.read_i32().await {
                    Ok(l) => l as usize,
                    Err(_) => return,
                };
                let mut body = vec![0u8; len.saturating_sub(4)];
                if stream.read_exact(&mut body).await.is_err() {
                    return;
                }
                if tag == b'Q' {
                    let sql = String::from_utf8_lossy(&body[..body.len().saturating_sub(1)]).to_string();
                    queries.lock().await.push(sql);

                    let tag_str = b"SELECT 1\0";
                    let mut complete = vec![b'C'];
                    complete.extend_from_slice(&((tag_str.len() + 4) as i32).to_be_bytes());
                    complete.extend_from_slice(tag_str);
                    if stream.write_all(&complete).await.is_err() {
                        return;
                    }
                    if stream.write_all(&rfq).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    pub mod redis_backend {
        use super::*;

        /// Treats each `read()` call as one forwarded command: fine for
        /// these tests, which send one command at a time and wait for
        /// the reply before sending the next.
        pub async fn spawn_fake_backend() -> (u16, Arc<TokioMutex<Vec<String>>>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let commands = Arc::new(TokioMutex::new(Vec::new()));
            let commands2 = commands.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(s) => s,
                        Err(_) => break,
                    };
                    tokio::spawn(serve_one(stream, commands2.clone()));
                }
            });
            (port, commands)
        }

        async fn serve_one(mut stream: TcpStream, commands: Arc<TokioMutex<Vec<String>>>) {
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                commands.lock().await.push(String::from_utf8_lossy(&buf[..n]).to_string());
                if stream.write_all(b"+OK\r\n").await.is_err() {
                    return;
                }
            }
        }

        /// Always replies `-MOVED 3999 <target>` to whatever it receives;
        /// used both as a one-shot redirector (pointed at a real node)
        /// and, pointed at its own address, to exercise the redirect cap.
        pub async fn spawn_moved_node(target: impl Into<String> + Send + 'static) -> u16 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            tokio::spawn(async move {
                let target = target.into();
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(s) => s,
                        Err(_) => break,
                    };
                    tokio::spawn(reply_moved(stream, target.clone()));
                }
            });
            port
        }

        async fn reply_moved(mut stream: TcpStream, target: String) {
            let mut buf = vec![0u8; 4096];
            let msg = format!("-MOVED 3999 {target}\r\n");
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let _ = n;
                if stream.write_all(msg.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }

    /// A TCP "backend" that accepts connections and holds them open
    /// without reading or writing anything, for the idle-expiry test.
    pub async fn spawn_silent_backend() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => held.push(stream),
                    Err(_) => break,
                }
            }
        });
        port
    }

    /// Captures the JSON bodies `WebhookDecider` posts, so a test can
    /// learn an approval's id the same way a real webhook receiver would.
    pub async fn spawn_fake_webhook() -> (u16, Arc<TokioMutex<Vec<serde_json::Value>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let captured = Arc::new(TokioMutex::new(Vec::new()));
        let captured2 = captured.clone();
        tokio::spawn(async move {
            let make_svc = hyper::service::make_service_fn(move |_conn| {
                let captured = captured2.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(hyper::service::service_fn(move |req: hyper::Request<hyper::Body>| {
                        let captured = captured.clone();
                        async move {
                            let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
                            if let Ok(v) = serde_json::from_slice::<serde_json::Value>(&body) {
                                captured.lock().await.push(v);
                            }
                            Ok::<_, std::convert::Infallible>(hyper::Response::new(hyper::Body::from("ok")))
                        }
                    }))
                }
            });
            let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            let _ = hyper::Server::bind(&addr).serve(make_svc).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        (port, captured)
    }
}

use support::{connect, login, open_tunnel, pgwire, redis_backend, spawn_broker};

// S1: the regex whitelist is informational only for Postgres — a query
// that wouldn't match `^SELECT.*` is still forwarded when no SQL
// permissions are configured, and audited under `postgres_query`.
#[tokio::test]
async fn pg_whitelist_is_informational_without_sql_permissions() {
    let (backend_port, queries) = pgwire::spawn_fake_backend().await;
    let yaml = format!(
        r#"
server:
  port: 0
  max_connection_duration: 1h
auth:
  jwt_secret: test-secret
  token_expiry: 1h
  users:
    - username: alice
      password: hunter2
      roles: [developer]
connections:
  - name: pg-test
    type: postgres
    host: 127.0.0.1
    port: {backend_port}
    tags: [env:test]
    backend_username: alice
    backend_database: testdb
policies:
  - name: dev
    roles: [developer]
    tags: [env:test]
    whitelist: ["^SELECT.*"]
logging:
  audit_log_path: "-"
  log_level: error
"#
    );

    let broker = spawn_broker(&yaml).await;
    let token = login(broker.control_addr, "alice", "hunter2").await;
    let conn = connect(broker.control_addr, &token, "pg-test", None).await;
    let id = conn["connection_id"].as_str().unwrap().to_string();

    let mut stream = open_tunnel(broker.tunnel_addr, &id, &token).await;
    pgwire::client_handshake(&mut stream, "alice", "testdb").await;

    pgwire::simple_query(&mut stream, "DROP TABLE users").await;
    let (tag, _) = pgwire::read_message(&mut stream).await;
    assert_eq!(tag, b'C', "query not covered by sql_permissions should still be forwarded");
    let (tag, _) = pgwire::read_message(&mut stream).await;
    assert_eq!(tag, b'Z');

    assert_eq!(queries.lock().await.as_slice(), &["DROP TABLE users".to_string()]);

    let records = broker.audit.recent();
    assert!(support::find_action(&records, "postgres_query", "pg-test").is_some());
}

// S1: with `sql_permissions` configured, the semantic gate is the
// authoritative enforcement point — a disallowed statement never reaches
// the backend and the client gets a Postgres `ErrorResponse` instead.
#[tokio::test]
async fn pg_sql_gate_blocks_disallowed_statement() {
    let (backend_port, queries) = pgwire::spawn_fake_backend().await;
    let yaml = format!(
        r#"
server:
  port: 0
  max_connection_duration: 1h
auth:
  jwt_secret: test-secret
  token_expiry: 1h
  users:
    - username: alice
      password: hunter2
      roles: [developer]
connections:
  - name: pg-gated
    type: postgres
    host: 127.0.0.1
    port: {backend_port}
    tags: [env:test]
    backend_username: alice
    backend_database: testdb
    sql_permissions:
      - operations: [SELECT]
        tables: ["*"]
policies:
  - name: dev
    roles: [developer]
    tags: [env:test]
    whitelist: []
logging:
  audit_log_path: "-"
  log_level: error
"#
    );

    let broker = spawn_broker(&yaml).await;
    let token = login(broker.control_addr, "alice", "hunter2").await;
    let conn = connect(broker.control_addr, &token, "pg-gated", None).await;
    let id = conn["connection_id"].as_str().unwrap().to_string();

    let mut stream = open_tunnel(broker.tunnel_addr, &id, &token).await;
    pgwire::client_handshake(&mut stream, "alice", "testdb").await;

    pgwire::simple_query(&mut stream, "DROP TABLE users").await;
    let (tag, body) = pgwire::read_message(&mut stream).await;
    assert_eq!(tag, b'E', "DROP should be blocked by the semantic gate");
    assert!(String::from_utf8_lossy(&body).contains("DROP"));
    assert!(queries.lock().await.is_empty(), "blocked query must never reach the backend");

    pgwire::simple_query(&mut stream, "SELECT * FROM users").await;
    let (tag, _) = pgwire::read_message(&mut stream).await;
    assert_eq!(tag, b'C', "SELECT is permitted and should be forwarded");
    let (tag, _) = pgwire::read_message(&mut stream).await;
    assert_eq!(tag, b'Z');
    assert_eq!(queries.lock().await.as_slice(), &["SELECT * FROM users".to_string()]);

    let records = broker.audit.recent();
    assert!(support::find_action(&records, "postgres_blocked", "pg-gated").is_some());
    assert!(support::find_action(&records, "postgres_query", "pg-gated").is_some());
}

// S2: a Redis command matching an approval pattern blocks the client
// until a webhook-notified approver decides it; approval unblocks the
// command and forwards it to the backend.
#[tokio::test]
async fn redis_command_approved_via_webhook_unblocks_client() {
    let (backend_port, commands) = redis_backend::spawn_fake_backend().await;
    let (webhook_port, webhook_calls) = support::spawn_fake_webhook().await;
    let yaml = format!(
        r#"
server:
  port: 0
  max_connection_duration: 1h
auth:
  jwt_secret: test-secret
  token_expiry: 1h
  users:
    - username: alice
      password: hunter2
      roles: [developer]
connections:
  - name: redis-test
    type: redis
    host: 127.0.0.1
    port: {backend_port}
    tags: [env:test]
policies:
  - name: dev
    roles: [developer]
    tags: [env:test]
    whitelist: []
logging:
  audit_log_path: "-"
  log_level: error
approval:
  enabled: true
  patterns:
    - pattern: "^FLUSHDB$"
      timeout_seconds: 60
  webhook:
    url: "http://127.0.0.1:{webhook_port}/notify"
"#
    );

    let broker = spawn_broker(&yaml).await;
    let token = login(broker.control_addr, "alice", "hunter2").await;
    let conn = connect(broker.control_addr, &token, "redis-test", None).await;
    let id = conn["connection_id"].as_str().unwrap().to_string();

    let mut stream = open_tunnel(broker.tunnel_addr, &id, &token).await;
    stream.write_all(b"*1\r\n$7\r\nFLUSHDB\r\n").await.unwrap();

    let approval_id = {
        let mut found = None;
        for _ in 0..50 {
            if let Some(v) = webhook_calls.lock().await.last().cloned() {
                found = Some(v["id"].as_str().unwrap().to_string());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        found.expect("webhook decider should have fired with the approval id")
    };

    let mut buf = [0u8; 16];
    let blocked = tokio::time::timeout(Duration::from_millis(150), stream.read(&mut buf)).await;
    assert!(blocked.is_err(), "client must not get a reply before the approval decision");

    let records = broker.audit.recent();
    assert!(support::find_action(&records, "redis_command_awaiting_approval", "redis-test").is_some());

    let resp = reqwest::Client::new()
        .get(format!("http://{}/approvals/{approval_id}/approve?approver=bob", broker.control_addr))
        .header("Accept", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["applied"], true);

    let mut reply = vec![0u8; 16];
    let n = stream.read(&mut reply).await.unwrap();
    assert_eq!(&reply[..n], b"+OK\r\n");

    assert!(commands.lock().await.iter().any(|c| c.contains("FLUSHDB")));

    let records = broker.audit.recent();
    let approved = support::find_action(&records, "redis_command_approved", "redis-test").unwrap();
    assert_eq!(approved.metadata["approver"], "bob");
}

// S3: nobody decides in time — the client gets a RESP error and the
// outcome is audited as a timeout, not a rejection.
#[tokio::test]
async fn redis_command_times_out_without_a_decision() {
    let (backend_port, _commands) = redis_backend::spawn_fake_backend().await;
    let yaml = format!(
        r#"
server:
  port: 0
  max_connection_duration: 1h
auth:
  jwt_secret: test-secret
  token_expiry: 1h
  users:
    - username: alice
      password: hunter2
      roles: [developer]
connections:
  - name: redis-timeout
    type: redis
    host: 127.0.0.1
    port: {backend_port}
    tags: [env:test]
policies:
  - name: dev
    roles: [developer]
    tags: [env:test]
    whitelist: []
logging:
  audit_log_path: "-"
  log_level: error
approval:
  enabled: true
  patterns:
    - pattern: "^FLUSHDB$"
      timeout_seconds: 1
"#
    );

    let broker = spawn_broker(&yaml).await;
    let token = login(broker.control_addr, "alice", "hunter2").await;
    let conn = connect(broker.control_addr, &token, "redis-timeout", None).await;
    let id = conn["connection_id"].as_str().unwrap().to_string();

    let mut stream = open_tunnel(broker.tunnel_addr, &id, &token).await;
    stream.write_all(b"*1\r\n$7\r\nFLUSHDB\r\n").await.unwrap();

    let mut reply = vec![0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut reply))
        .await
        .expect("client should eventually get the timeout error")
        .unwrap();
    assert_eq!(&reply[..n], b"-ERR Command rejected or timed out\r\n");

    let records = broker.audit.recent();
    let rejected = support::find_action(&records, "redis_command_rejected", "redis-timeout").unwrap();
    assert_eq!(rejected.metadata["decision"], "timed_out");
}

// S4: a role whose policy only whitelists GET gets a JSON 403 for a POST,
// and the real backend is never contacted.
#[tokio::test]
async fn http_request_blocked_by_role_whitelist() {
    let unused_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let yaml = format!(
        r#"
server:
  port: 0
  max_connection_duration: 1h
auth:
  jwt_secret: test-secret
  token_expiry: 1h
  users:
    - username: reader
      password: pw
      roles: [reader]
connections:
  - name: http-test
    type: http
    host: 127.0.0.1
    port: {unused_port}
    tags: [env:test]
policies:
  - name: reader-policy
    roles: [reader]
    tags: [env:test]
    whitelist: ["^GET "]
logging:
  audit_log_path: "-"
  log_level: error
"#
    );

    let broker = spawn_broker(&yaml).await;
    let token = login(broker.control_addr, "reader", "pw").await;
    let conn = connect(broker.control_addr, &token, "http-test", None).await;
    let id = conn["connection_id"].as_str().unwrap().to_string();

    let mut stream = open_tunnel(broker.tunnel_addr, &id, &token).await;
    stream
        .write_all(b"POST /api/users HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 403"), "unexpected response: {text}");
    assert!(text.contains("blocked by whitelist"));

    let records = broker.audit.recent();
    assert!(support::find_action(&records, "http_request_blocked", "http-test").is_some());
}

// S5: an idle tunnel is force-closed once its handle's duration elapses,
// and the sweeper audits the disconnect as a timeout.
#[tokio::test]
async fn idle_tunnel_is_closed_on_expiry() {
    let backend_port = support::spawn_silent_backend().await;
    let yaml = format!(
        r#"
server:
  port: 0
  max_connection_duration: 1h
auth:
  jwt_secret: test-secret
  token_expiry: 1h
  users:
    - username: alice
      password: hunter2
      roles: [developer]
connections:
  - name: tcp-idle-test
    type: tcp
    host: 127.0.0.1
    port: {backend_port}
    tags: [env:test]
policies:
  - name: dev
    roles: [developer]
    tags: [env:test]
    whitelist: []
logging:
  audit_log_path: "-"
  log_level: error
"#
    );

    let broker = spawn_broker(&yaml).await;
    let token = login(broker.control_addr, "alice", "hunter2").await;
    let conn = connect(broker.control_addr, &token, "tcp-idle-test", Some("2s")).await;
    let id = conn["connection_id"].as_str().unwrap().to_string();

    let mut stream = open_tunnel(broker.tunnel_addr, &id, &token).await;

    let mut buf = [0u8; 16];
    let closed = tokio::time::timeout(Duration::from_secs(4), stream.read(&mut buf))
        .await
        .expect("copier should shut the socket down once the deadline passes");
    assert_eq!(closed.unwrap(), 0, "client side should observe EOF once expired");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let records = broker.audit.recent();
    let disconnect = support::find_action(&records, "proxy_disconnect", "tcp-idle-test")
        .expect("sweeper should have audited the timeout");
    assert_eq!(disconnect.metadata["reason"], "timeout");
}

// S6: a cluster node's MOVED reply makes the interceptor dial the
// redirect target, resend the command, and relay the real reply back.
#[tokio::test]
async fn redis_cluster_follows_a_moved_redirect() {
    let (real_port, real_commands) = redis_backend::spawn_fake_backend().await;
    let seed_port = redis_backend::spawn_moved_node(format!("127.0.0.1:{real_port}")).await;

    let yaml = format!(
        r#"
server:
  port: 0
  max_connection_duration: 1h
auth:
  jwt_secret: test-secret
  token_expiry: 1h
  users:
    - username: alice
      password: hunter2
      roles: [developer]
connections:
  - name: redis-cluster-test
    type: redis
    host: 127.0.0.1
    port: {seed_port}
    tags: [env:test]
    redis_cluster: true
policies:
  - name: dev
    roles: [developer]
    tags: [env:test]
    whitelist: []
logging:
  audit_log_path: "-"
  log_level: error
"#
    );

    let broker = spawn_broker(&yaml).await;
    let token = login(broker.control_addr, "alice", "hunter2").await;
    let conn = connect(broker.control_addr, &token, "redis-cluster-test", None).await;
    let id = conn["connection_id"].as_str().unwrap().to_string();

    let mut stream = open_tunnel(broker.tunnel_addr, &id, &token).await;
    stream.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").await.unwrap();

    let mut reply = vec![0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut reply)).await.unwrap().unwrap();
    assert_eq!(&reply[..n], b"+OK\r\n");

    assert!(real_commands.lock().await.iter().any(|c| c.contains("GET")));

    let records = broker.audit.recent();
    let moved = support::find_action(&records, "redis_cluster_moved", "redis-cluster-test").unwrap();
    assert_eq!(moved.metadata["new_node"], format!("127.0.0.1:{real_port}"));
}

// S6: a node that always redirects to itself forces the client to see
// the raw MOVED line once `MAX_REDIRECTS` is exceeded, rather than
// looping forever.
#[tokio::test]
async fn redis_cluster_surfaces_error_after_max_redirects() {
    let self_port = {
        // bind once to reserve the port, then hand the same port to the
        // node so it can redirect to itself.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        redis_backend::spawn_moved_node(format!("127.0.0.1:{port}")).await;
        port
    };

    let yaml = format!(
        r#"
server:
  port: 0
  max_connection_duration: 1h
auth:
  jwt_secret: test-secret
  token_expiry: 1h
  users:
    - username: alice
      password: hunter2
      roles: [developer]
connections:
  - name: redis-cluster-loop
    type: redis
    host: 127.0.0.1
    port: {self_port}
    tags: [env:test]
    redis_cluster: true
policies:
  - name: dev
    roles: [developer]
    tags: [env:test]
    whitelist: []
logging:
  audit_log_path: "-"
  log_level: error
"#
    );

    let broker = spawn_broker(&yaml).await;
    let token = login(broker.control_addr, "alice", "hunter2").await;
    let conn = connect(broker.control_addr, &token, "redis-cluster-loop", None).await;
    let id = conn["connection_id"].as_str().unwrap().to_string();

    let mut stream = open_tunnel(broker.tunnel_addr, &id, &token).await;
    stream.write_all(b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n").await.unwrap();

    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut byte)).await.unwrap().unwrap();
        assert!(n > 0);
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
    }
    assert!(line.starts_with(b"-MOVED"), "expected a raw MOVED line after exhausting redirects, got {}", String::from_utf8_lossy(&line));

    let records = broker.audit.recent();
    let moved_count = records
        .iter()
        .filter(|r| r.action == "redis_cluster_moved" && r.resource == "redis-cluster-loop")
        .count();
    assert_eq!(moved_count, 5, "should redirect exactly MAX_REDIRECTS times before surfacing the error");
}
