use super::*;
use crate::codec::{DataMode, Direction, Frame, OBJECT_STREAM_HEADER};
use crate::config::PoolSettings;
use crate::connection::{Session, MAX_HOLDERS};
use crate::handler::{
    AuthStatus, Authenticator, BinaryHandler, ClientEventHandler, CommandHandler, HandlerResult,
    ObjectHandler, WriteHandler,
};
use bytes::Bytes;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::TcpStream;

struct Echo;

impl CommandHandler for Echo {
    fn handle_command(&self, session: &mut Session<'_>, line: &str) -> HandlerResult {
        match line {
            "QUIT" => {
                session.send_line("+OK Bye")?;
                session.close();
            }
            "STARTTLS" => {
                session.send_line("+OK Begin TLS negotiation")?;
                session.make_secure()?;
            }
            _ => session.send_line(&format!("ECHO: {line}"))?,
        }
        Ok(())
    }
}

struct Greeter;

impl ClientEventHandler for Greeter {
    fn on_connect(&self, session: &mut Session<'_>) -> HandlerResult {
        session.send_line("+OK ready")?;
        Ok(())
    }
}

struct Password;

impl Authenticator for Password {
    fn ask_authentication(&self, session: &mut Session<'_>) -> HandlerResult {
        session.send_line("+AUTH Password:")?;
        Ok(())
    }

    fn handle_authentication(
        &self,
        session: &mut Session<'_>,
        frame: &Frame,
    ) -> HandlerResult<AuthStatus> {
        if frame.as_text() == Some("secret") {
            session.send_line("+OK Authenticated")?;
            Ok(AuthStatus::Accepted)
        } else {
            session.send_line("-ERR Bad password")?;
            Ok(AuthStatus::Rejected)
        }
    }
}

fn test_config(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        port: 0,
        timeout_ms: 0,
        close_drain_timeout_ms: 2_000,
        pools: PoolSettings {
            worker_threads: 2,
            max_active_handlers: 8,
            buffer_size: 4096,
            max_buffers: 64,
            max_concurrent_writers: None,
        },
        ..ServerConfig::default()
    }
}

fn start(config: ServerConfig) -> Server {
    ServerBuilder::new(config)
        .command_handler(Echo)
        .start()
        .unwrap()
}

async fn connect(server: &Server) -> AsyncBufReader<TcpStream> {
    AsyncBufReader::new(TcpStream::connect(server.local_addr()).await.unwrap())
}

async fn read_line(client: &mut AsyncBufReader<TcpStream>) -> String {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_line(&mut line))
        .await
        .expect("timed out waiting for a line")
        .unwrap();
    line
}

/// Waits for the server to close the socket.
async fn expect_eof(client: &mut AsyncBufReader<TcpStream>) {
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("timed out waiting for close");
    match read {
        Ok(n) => assert_eq!(n, 0, "unexpected data: {:?}", &buf[..n]),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_echo() {
    let server = start(test_config("echo"));
    let mut client = connect(&server).await;

    client.write_all(b"HELLO\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: HELLO\r\n");

    // Pipelined
    client.write_all(b"one\r\ntwo\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: one\r\n");
    assert_eq!(read_line(&mut client).await, "ECHO: two\r\n");
}

#[tokio::test]
async fn test_handler_close() {
    let server = start(test_config("quit"));
    let mut client = connect(&server).await;

    client.write_all(b"QUIT\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "+OK Bye\r\n");
    expect_eof(&mut client).await;

    settle().await;
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.stats().active_connections, 0);
}

#[tokio::test]
async fn test_greeting() {
    let server = ServerBuilder::new(test_config("greet"))
        .command_handler(Echo)
        .event_handler(Greeter)
        .start()
        .unwrap();
    let mut client = connect(&server).await;

    assert_eq!(read_line(&mut client).await, "+OK ready\r\n");
    client.write_all(b"hi\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: hi\r\n");
}

#[tokio::test]
async fn test_max_connections() {
    let mut config = test_config("max-conn");
    config.max_connections = Some(1);
    let server = start(config);

    let mut first = connect(&server).await;
    first.write_all(b"first\r\n").await.unwrap();
    assert_eq!(read_line(&mut first).await, "ECHO: first\r\n");

    let mut second = connect(&server).await;
    assert_eq!(
        read_line(&mut second).await,
        "-ERR Server Busy. Max Connection Reached\r\n"
    );
    expect_eof(&mut second).await;

    first.write_all(b"still here\r\n").await.unwrap();
    assert_eq!(read_line(&mut first).await, "ECHO: still here\r\n");

    settle().await;
    let stats = server.stats();
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.connections_rejected, 1);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_idle_timeout() {
    let mut config = test_config("timeout");
    config.timeout_ms = 1_000;
    let server = start(config);

    let mut client = connect(&server).await;
    client.write_all(b"ping\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: ping\r\n");

    assert_eq!(read_line(&mut client).await, "-ERR Timeout\r\n");
    expect_eof(&mut client).await;

    settle().await;
    assert_eq!(server.stats().timeouts, 1);
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_auth_success() {
    let server = ServerBuilder::new(test_config("auth-ok"))
        .command_handler(Echo)
        .authenticator(Password)
        .start()
        .unwrap();
    let mut client = connect(&server).await;

    assert_eq!(read_line(&mut client).await, "+AUTH Password:\r\n");
    client.write_all(b"secret\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "+OK Authenticated\r\n");

    client.write_all(b"hello\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: hello\r\n");
}

#[tokio::test]
async fn test_max_auth_try() {
    let mut config = test_config("auth-max");
    config.max_auth_try = 3;
    let server = ServerBuilder::new(config)
        .command_handler(Echo)
        .authenticator(Password)
        .start()
        .unwrap();
    let mut client = connect(&server).await;

    assert_eq!(read_line(&mut client).await, "+AUTH Password:\r\n");
    for attempt in 1..=3 {
        client.write_all(b"guess\r\n").await.unwrap();
        assert_eq!(read_line(&mut client).await, "-ERR Bad password\r\n");
        if attempt < 3 {
            assert_eq!(read_line(&mut client).await, "+AUTH Password:\r\n");
        }
    }
    assert_eq!(
        read_line(&mut client).await,
        "-ERR Max Auth Try Reached\r\n"
    );
    expect_eof(&mut client).await;

    settle().await;
    assert_eq!(server.stats().auth_failures, 3);
}

#[tokio::test]
async fn test_pool_exhausted() {
    let mut config = test_config("exhausted");
    config.pools.max_active_handlers = 1;
    let server = start(config);

    let mut first = connect(&server).await;
    first.write_all(b"a\r\n").await.unwrap();
    assert_eq!(read_line(&mut first).await, "ECHO: a\r\n");

    let mut second = connect(&server).await;
    expect_eof(&mut second).await;

    // The slot is reused once the first client leaves
    drop(first);
    settle().await;
    let mut third = connect(&server).await;
    third.write_all(b"c\r\n").await.unwrap();
    assert_eq!(read_line(&mut third).await, "ECHO: c\r\n");
}

#[tokio::test]
async fn test_blocking_mode() {
    let mut config = test_config("blocking");
    config.mode = ExecutionMode::Blocking;
    let server = start(config);

    let mut a = connect(&server).await;
    let mut b = connect(&server).await;
    a.write_all(b"from a\r\n").await.unwrap();
    b.write_all(b"from b\r\n").await.unwrap();
    assert_eq!(read_line(&mut b).await, "ECHO: from b\r\n");
    assert_eq!(read_line(&mut a).await, "ECHO: from a\r\n");

    a.write_all(b"QUIT\r\n").await.unwrap();
    assert_eq!(read_line(&mut a).await, "+OK Bye\r\n");
    expect_eof(&mut a).await;

    settle().await;
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_blocking_timeout() {
    let mut config = test_config("blocking-timeout");
    config.mode = ExecutionMode::Blocking;
    config.timeout_ms = 500;
    let server = start(config);

    let mut client = connect(&server).await;
    assert_eq!(read_line(&mut client).await, "-ERR Timeout\r\n");
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn test_close_connection() {
    let server = start(test_config("close-one"));
    let mut client = connect(&server).await;
    client.write_all(b"x\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: x\r\n");

    let live = server.connections();
    assert_eq!(live.len(), 1);
    let info = &live[0];
    assert!(info.bytes_read >= 3);
    assert_eq!(server.find(info.id).map(|i| i.id), Some(info.id));

    assert!(server.close_connection(info.id));
    expect_eof(&mut client).await;

    settle().await;
    assert!(server.find(info.id).is_none());
    assert!(!server.close_connection(info.id));

    let stats = server.stats();
    assert_eq!(stats.connections_accepted, 1);
    assert_eq!(stats.active_connections, 0);
    assert!(stats.frames_processed >= 1);
    assert!(stats.bytes_written > 0);
}

#[tokio::test]
async fn test_shutdown() {
    let hook_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&hook_ran);
    let server = ServerBuilder::new(test_config("shutdown"))
        .command_handler(Echo)
        .on_shutdown(move || flag.store(true, Ordering::SeqCst))
        .start()
        .unwrap();
    let addr = server.local_addr();

    let mut client = connect(&server).await;
    client.write_all(b"bye\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: bye\r\n");

    server.shutdown();
    expect_eof(&mut client).await;

    settle().await;
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(hook_ran.load(Ordering::SeqCst));

    tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || server.wait()),
    )
    .await
    .expect("wait did not return")
    .unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}

// ── TLS ───────────────────────────────────────────────────────────────

fn tls_configs() -> (Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let server = crate::tls::server_config(vec![cert_der.clone()], key).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    (server, Arc::new(client))
}

fn tls_client(
    config: Arc<rustls::ClientConfig>,
    tcp: std::net::TcpStream,
) -> rustls::StreamOwned<rustls::ClientConnection, std::net::TcpStream> {
    let name = ServerName::try_from("localhost").unwrap();
    let conn = rustls::ClientConnection::new(config, name).unwrap();
    rustls::StreamOwned::new(conn, tcp)
}

fn plain_connect(server: &Server) -> std::net::TcpStream {
    let tcp = std::net::TcpStream::connect(server.local_addr()).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    tcp
}

/// Reads one CRLF-terminated line a byte at a time so nothing past it is
/// consumed.
fn read_plain_line(stream: &mut impl Read) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\r\n") {
        assert_eq!(stream.read(&mut byte).unwrap(), 1, "connection closed");
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap()
}

#[test]
fn test_tls_start_secure() {
    let (server_tls, client_tls) = tls_configs();
    let server = ServerBuilder::new(test_config("tls-secure"))
        .command_handler(Echo)
        .event_handler(Greeter)
        .tls(server_tls, true)
        .start()
        .unwrap();

    let mut client = BufReader::new(tls_client(client_tls, plain_connect(&server)));
    let mut line = String::new();
    client.read_line(&mut line).unwrap();
    assert_eq!(line, "+OK ready\r\n");

    client.get_mut().write_all(b"HELLO\r\n").unwrap();
    line.clear();
    client.read_line(&mut line).unwrap();
    assert_eq!(line, "ECHO: HELLO\r\n");
}

#[test]
fn test_starttls_upgrade() {
    let (server_tls, client_tls) = tls_configs();
    let server = ServerBuilder::new(test_config("starttls"))
        .command_handler(Echo)
        .event_handler(Greeter)
        .tls(server_tls, false)
        .start()
        .unwrap();

    let mut tcp = plain_connect(&server);
    assert_eq!(read_plain_line(&mut tcp), "+OK ready\r\n");
    tcp.write_all(b"STARTTLS\r\n").unwrap();
    assert_eq!(read_plain_line(&mut tcp), "+OK Begin TLS negotiation\r\n");

    let mut secure = tls_client(client_tls, tcp);
    secure.write_all(b"HELLO\r\n").unwrap();
    assert_eq!(read_plain_line(&mut secure), "ECHO: HELLO\r\n");

    secure.write_all(b"QUIT\r\n").unwrap();
    assert_eq!(read_plain_line(&mut secure), "+OK Bye\r\n");
}

#[test]
fn test_starttls_blocking() {
    let (server_tls, client_tls) = tls_configs();
    let mut config = test_config("starttls-blocking");
    config.mode = ExecutionMode::Blocking;
    let server = ServerBuilder::new(config)
        .command_handler(Echo)
        .tls(server_tls, false)
        .start()
        .unwrap();

    let mut tcp = plain_connect(&server);
    tcp.write_all(b"STARTTLS\r\n").unwrap();
    assert_eq!(read_plain_line(&mut tcp), "+OK Begin TLS negotiation\r\n");

    let mut secure = tls_client(client_tls, tcp);
    secure.write_all(b"over tls\r\n").unwrap();
    assert_eq!(read_plain_line(&mut secure), "ECHO: over tls\r\n");
}

#[test]
fn test_tls_handshake_failure_sends_alert() {
    let (server_tls, _) = tls_configs();
    let server = ServerBuilder::new(test_config("tls-alert"))
        .command_handler(Echo)
        .tls(server_tls, true)
        .start()
        .unwrap();

    // Plaintext where a ClientHello belongs
    let mut tcp = plain_connect(&server);
    tcp.write_all(b"HELLO\r\n").unwrap();
    let mut reply = Vec::new();
    let _ = tcp.read_to_end(&mut reply);

    // A TLS alert record goes out before the socket closes
    assert_eq!(reply.first(), Some(&0x15));
    wait_until(|| server.connection_count() == 0);
}

#[test]
fn test_builder_rejects_missing_handler() {
    let result = ServerBuilder::new(test_config("no-handler")).start();
    assert!(result.is_err());
}

// ── failure handling ──────────────────────────────────────────────────

struct Fragile;

impl CommandHandler for Fragile {
    fn handle_command(&self, session: &mut Session<'_>, line: &str) -> HandlerResult {
        if line == "PANIC" {
            panic!("handler blew up");
        }
        session.send_line(&format!("ECHO: {line}"))?;
        Ok(())
    }
}

/// Records which lifecycle callback fired, and why.
#[derive(Clone, Default)]
struct Lifecycle {
    log: Arc<Mutex<Vec<(&'static str, CloseReason)>>>,
}

impl Lifecycle {
    fn entries(&self) -> Vec<(&'static str, CloseReason)> {
        self.log.lock().clone()
    }
}

impl ClientEventHandler for Lifecycle {
    fn on_closing(&self, _session: &mut Session<'_>, reason: CloseReason) {
        self.log.lock().push(("closing", reason));
    }

    fn on_lost(&self, _session: &mut Session<'_>, reason: CloseReason) {
        self.log.lock().push(("lost", reason));
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}

async fn wait_for_exit(server: Server) {
    tokio::time::timeout(
        Duration::from_secs(10),
        tokio::task::spawn_blocking(move || server.wait()),
    )
    .await
    .expect("wait did not return")
    .unwrap();
}

async fn panicking_handler_closes(mode: ExecutionMode) {
    let mut config = test_config("fragile");
    config.mode = mode;
    let lifecycle = Lifecycle::default();
    let server = ServerBuilder::new(config)
        .command_handler(Fragile)
        .event_handler(lifecycle.clone())
        .start()
        .unwrap();

    let mut client = connect(&server).await;
    client.write_all(b"PANIC\r\n").await.unwrap();
    expect_eof(&mut client).await;

    settle().await;
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.stats().active_connections, 0);
    assert_eq!(lifecycle.entries(), vec![("lost", CloseReason::Internal)]);

    // The worker that caught the panic keeps serving
    let mut next = connect(&server).await;
    next.write_all(b"still up\r\n").await.unwrap();
    assert_eq!(read_line(&mut next).await, "ECHO: still up\r\n");

    server.shutdown();
    expect_eof(&mut next).await;
    wait_for_exit(server).await;
}

#[tokio::test]
async fn test_handler_panic_closes_connection() {
    panicking_handler_closes(ExecutionMode::EventDriven).await;
}

#[tokio::test]
async fn test_handler_panic_closes_blocking_connection() {
    panicking_handler_closes(ExecutionMode::Blocking).await;
}

#[tokio::test]
async fn test_shutdown_with_stuck_blocking_writer() {
    let mut config = test_config("stuck-writer");
    config.mode = ExecutionMode::Blocking;
    config.close_drain_timeout_ms = 1_000;
    config.socket.send_buffer_size = Some(8 * 1024);
    config.socket.recv_buffer_size = Some(8 * 1024);
    let server = start(config);

    // The client floods echo requests and never reads a reply, so the
    // worker ends up parked in a socket write.
    let client = TcpStream::connect(server.local_addr()).await.unwrap();
    let (_reader, mut writer) = client.into_split();
    let flood = tokio::spawn(async move {
        let line = format!("{}\r\n", "y".repeat(60 * 1024));
        while writer.write_all(line.as_bytes()).await.is_ok() {}
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.connection_count(), 1);

    let started = Instant::now();
    server.shutdown();
    wait_for_exit(server).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    flood.abort();
}

#[tokio::test]
async fn test_stale_timeout_event_ignored() {
    let mut config = test_config("stale-timeout");
    config.timeout_ms = 60_000;
    let server = start(config);

    let mut client = connect(&server).await;
    client.write_all(b"ping\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: ping\r\n");

    // A TIMEOUT queued by a sweep that raced with client activity
    let (id, conn) = server.ctx.registry.snapshot_locked().remove(0);
    if conn.push_event(Event::Timeout) {
        dispatch(&server.ctx, &conn, id.generation);
    }
    settle().await;

    client.write_all(b"pong\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: pong\r\n");
    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.stats().timeouts, 0);

    // A forced reclaim is not second-guessed
    conn.request_close(CloseReason::Timeout, true);
    if conn.push_event(Event::Timeout) {
        dispatch(&server.ctx, &conn, id.generation);
    }
    assert_eq!(read_line(&mut client).await, "-ERR Timeout\r\n");
    expect_eof(&mut client).await;

    settle().await;
    assert_eq!(server.stats().timeouts, 1);
}

// ── slots, holders and the reaper ─────────────────────────────────────

#[tokio::test]
async fn test_reused_slot_prompts_for_auth() {
    let mut config = test_config("auth-reuse");
    config.pools.max_active_handlers = 1;
    let server = ServerBuilder::new(config)
        .command_handler(Echo)
        .authenticator(Password)
        .start()
        .unwrap();

    let mut first = connect(&server).await;
    assert_eq!(read_line(&mut first).await, "+AUTH Password:\r\n");
    first.write_all(b"secret\r\n").await.unwrap();
    assert_eq!(read_line(&mut first).await, "+OK Authenticated\r\n");
    first.write_all(b"QUIT\r\n").await.unwrap();
    assert_eq!(read_line(&mut first).await, "+OK Bye\r\n");
    expect_eof(&mut first).await;
    settle().await;

    // Same slot, new client: it starts unauthenticated
    let mut second = connect(&server).await;
    assert_eq!(read_line(&mut second).await, "+AUTH Password:\r\n");
    second.write_all(b"hello\r\n").await.unwrap();
    assert_eq!(read_line(&mut second).await, "-ERR Bad password\r\n");
    assert_eq!(read_line(&mut second).await, "+AUTH Password:\r\n");
    second.write_all(b"secret\r\n").await.unwrap();
    assert_eq!(read_line(&mut second).await, "+OK Authenticated\r\n");
    second.write_all(b"hello\r\n").await.unwrap();
    assert_eq!(read_line(&mut second).await, "ECHO: hello\r\n");
}

#[test]
fn test_last_holder_recycles_once() {
    let server = start(test_config("holders"));
    let ctx = &server.ctx;
    let conn = ctx.connections.borrow().unwrap();
    let generation = conn.bind("127.0.0.1:5000".parse().unwrap(), &ctx.config, None);
    assert!(conn.try_hold(ctx, generation));

    let churn: Vec<_> = (0..4)
        .map(|_| {
            let ctx = Arc::clone(&server.ctx);
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                for _ in 0..1000 {
                    if conn.try_hold(&ctx, generation) {
                        conn.release(&ctx);
                    }
                }
            })
        })
        .collect();
    for handle in churn {
        handle.join().unwrap();
    }
    assert_eq!(conn.holders(), 1);

    // A stale generation never holds
    assert!(!conn.try_hold(ctx, generation + 1));
    assert_eq!(conn.holders(), 1);

    for _ in 1..MAX_HOLDERS {
        assert!(conn.try_hold(ctx, generation));
    }
    assert!(!conn.try_hold(ctx, generation));

    conn.mark_closed();
    for _ in 1..MAX_HOLDERS {
        conn.release(ctx);
    }
    assert_eq!(ctx.connections.outstanding(), 1);
    conn.release(ctx);
    assert_eq!(conn.holders(), 0);
    assert_eq!(ctx.connections.outstanding(), 0);
    assert_eq!(ctx.connections.idle(), 1);

    // A late holder of the closed binding must not recycle it again
    assert!(!conn.try_hold(ctx, generation));
    assert_eq!(conn.holders(), 0);
    assert_eq!(ctx.connections.outstanding(), 0);
    assert_eq!(ctx.connections.idle(), 1);
}

#[test]
fn test_sweep_respects_limit() {
    let mut config = test_config("sweep");
    config.mode = ExecutionMode::Blocking;
    config.timeout_ms = 60_000;
    config.reaper.blocking_padding_ms = 200;
    let server = start(config);

    let mut client = plain_connect(&server);
    client.write_all(b"hi\r\n").unwrap();
    assert_eq!(read_plain_line(&mut client), "ECHO: hi\r\n");

    // Blocking connections get the padding on top of the timeout
    assert_eq!(crate::reaper::sweep(&server.ctx, Duration::ZERO), 0);
    assert_eq!(server.connection_count(), 1);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(crate::reaper::sweep(&server.ctx, Duration::ZERO), 1);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
    wait_until(|| server.connection_count() == 0);
    assert_eq!(server.stats().timeouts, 1);
}

// ── data modes and write readiness ────────────────────────────────────

struct Modes;

impl CommandHandler for Modes {
    fn handle_command(&self, session: &mut Session<'_>, line: &str) -> HandlerResult {
        match line {
            "OBJECT" => {
                session.send_line("+OK object mode")?;
                session.set_data_mode(Direction::Out, DataMode::Object)?;
                session.set_data_mode(Direction::In, DataMode::Object)?;
            }
            "BINARY" => {
                session.send_line("+OK binary mode")?;
                session.set_data_mode(Direction::Out, DataMode::Binary)?;
                session.set_data_mode(Direction::In, DataMode::Binary)?;
            }
            _ => session.send_line(&format!("ECHO: {line}"))?,
        }
        Ok(())
    }
}

impl ObjectHandler for Modes {
    fn handle_object(&self, session: &mut Session<'_>, object: serde_json::Value) -> HandlerResult {
        if object["back"] == "line" {
            session.set_data_mode(Direction::Out, DataMode::Line)?;
            session.set_data_mode(Direction::In, DataMode::Line)?;
            session.send_line("+OK line mode")?;
        } else {
            session.send_object(&json!({ "echo": object }))?;
        }
        Ok(())
    }
}

impl BinaryHandler for Modes {
    fn handle_binary(&self, session: &mut Session<'_>, data: Bytes) -> HandlerResult {
        let reversed: Vec<u8> = data.iter().rev().copied().collect();
        session.send_bytes(&reversed)?;
        Ok(())
    }
}

fn start_modes(name: &str) -> Server {
    ServerBuilder::new(test_config(name))
        .command_handler(Modes)
        .object_handler(Modes)
        .binary_handler(Modes)
        .start()
        .unwrap()
}

fn object_frame(value: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::to_vec(value).unwrap();
    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&body);
    frame
}

async fn read_exact(client: &mut AsyncBufReader<TcpStream>, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("timed out waiting for data")
        .unwrap();
    buf
}

async fn read_object(client: &mut AsyncBufReader<TcpStream>) -> serde_json::Value {
    let prefix = read_exact(client, 4).await;
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    serde_json::from_slice(&read_exact(client, len).await).unwrap()
}

#[tokio::test]
async fn test_object_mode_switch() {
    let server = start_modes("object");
    let mut client = connect(&server).await;

    client.write_all(b"OBJECT\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "+OK object mode\r\n");
    assert_eq!(read_exact(&mut client, 5).await, OBJECT_STREAM_HEADER);

    let mut wire = OBJECT_STREAM_HEADER.to_vec();
    wire.extend(object_frame(&json!({ "n": 1 })));
    client.write_all(&wire).await.unwrap();
    assert_eq!(read_object(&mut client).await, json!({ "echo": { "n": 1 } }));

    client
        .write_all(&object_frame(&json!({ "back": "line" })))
        .await
        .unwrap();
    assert_eq!(read_line(&mut client).await, "+OK line mode\r\n");
    client.write_all(b"plain\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "ECHO: plain\r\n");
}

#[tokio::test]
async fn test_binary_mode_switch() {
    let server = start_modes("binary");
    let mut client = connect(&server).await;

    client.write_all(b"BINARY\r\n").await.unwrap();
    assert_eq!(read_line(&mut client).await, "+OK binary mode\r\n");

    client.write_all(&[1, 2, 3, 0xff]).await.unwrap();
    assert_eq!(read_exact(&mut client, 4).await, vec![0xff, 3, 2, 1]);
}

/// Size of a reply no socket buffer swallows in one write.
const FLOOD_LEN: usize = 16 * 1024 * 1024;

struct Flood;

impl CommandHandler for Flood {
    fn handle_command(&self, session: &mut Session<'_>, line: &str) -> HandlerResult {
        if line == "FLOOD" {
            session.send_line(&"x".repeat(FLOOD_LEN))?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct DrainNotice {
    sent: AtomicBool,
}

impl WriteHandler for DrainNotice {
    fn on_write_ready(&self, session: &mut Session<'_>) -> HandlerResult {
        if !self.sent.swap(true, Ordering::SeqCst) {
            session.send_line("+DRAINED")?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_write_ready_after_backlog() {
    let server = ServerBuilder::new(test_config("write-ready"))
        .command_handler(Flood)
        .write_handler(DrainNotice::default())
        .start()
        .unwrap();
    let mut client = connect(&server).await;

    client.write_all(b"FLOOD\r\n").await.unwrap();
    // Let the backlog build up before reading
    tokio::time::sleep(Duration::from_millis(200)).await;

    let flood = read_line(&mut client).await;
    assert_eq!(flood.len(), FLOOD_LEN + 2);
    assert_eq!(read_line(&mut client).await, "+DRAINED\r\n");
}

// ── lifecycle callbacks ───────────────────────────────────────────────

#[test]
fn test_closing_versus_lost() {
    let lifecycle = Lifecycle::default();
    let server = ServerBuilder::new(test_config("lifecycle"))
        .command_handler(Echo)
        .event_handler(lifecycle.clone())
        .start()
        .unwrap();

    // Local close
    let mut quitter = plain_connect(&server);
    quitter.write_all(b"QUIT\r\n").unwrap();
    assert_eq!(read_plain_line(&mut quitter), "+OK Bye\r\n");
    wait_until(|| lifecycle.entries().len() == 1);

    // Orderly end of stream from the peer
    let mut leaver = plain_connect(&server);
    leaver.write_all(b"hi\r\n").unwrap();
    assert_eq!(read_plain_line(&mut leaver), "ECHO: hi\r\n");
    drop(leaver);
    wait_until(|| lifecycle.entries().len() == 2);

    // Reset from the peer
    let mut resetter = plain_connect(&server);
    resetter.write_all(b"hi\r\n").unwrap();
    assert_eq!(read_plain_line(&mut resetter), "ECHO: hi\r\n");
    socket2::SockRef::from(&resetter)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(resetter);
    wait_until(|| lifecycle.entries().len() == 3);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        lifecycle.entries(),
        vec![
            ("closing", CloseReason::Requested),
            ("lost", CloseReason::PeerClosed),
            ("lost", CloseReason::Io),
        ]
    );
    assert_eq!(server.connection_count(), 0);
}
