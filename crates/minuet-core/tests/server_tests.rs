//! End-to-end tests over real TCP connections: one server per test on an
//! ephemeral port, plain std TcpStream clients.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use minuet_core::fileserver::{FileServer, FileServerConfig, FileServerMode};
use minuet_core::http::ResponseState;
use minuet_core::reactor::Repeat;
use minuet_core::routing::RouteHandler;
use minuet_core::server::Server;

struct TestServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// Build and run a server on an ephemeral port. `setup` wires routes
    /// and the file server before the loop starts.
    fn start(setup: impl FnOnce(&Server) + Send + 'static) -> Self {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || {
            let server = Server::new().expect("server");
            setup(&server);
            let port = server.bind("127.0.0.1", 0).expect("bind");
            tx.send((port, server.shutdown_flag())).unwrap();
            server.run().expect("run");
        });
        let (port, shutdown) = rx.recv_timeout(Duration::from_secs(5)).expect("startup");
        TestServer {
            port,
            shutdown,
            thread: Some(thread),
        }
    }

    /// Send one raw request and read until the peer stops sending.
    fn roundtrip(&self, raw: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_millis(1500)))
            .unwrap();
        stream.write_all(raw.as_bytes()).unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&chunk[..n]);
                    if has_full_response(&response) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&response).into_owned()
    }
}

fn has_full_response(buf: &[u8]) -> bool {
    let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&buf[..head_end]);
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    buf.len() >= head_end + 4 + content_length
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn setup_static_assets() -> (tempfile::TempDir, FileServerConfig) {
    let dir = tempfile::TempDir::new().unwrap();
    let assets = dir.path().join("assets");
    std::fs::create_dir_all(&assets).unwrap();
    std::fs::write(assets.join("hello.css"), b"body{color:red}\n").unwrap();

    let config = FileServerConfig {
        static_dir: assets,
        cache_file: dir.path().join("build/static_cache.bin"),
        url_prefix: "/assets/".to_string(),
        mode: FileServerMode::Hybrid,
        auto_reload: false,
        max_file_size: 10 * 1024 * 1024,
        exclude_patterns: Vec::new(),
    };
    (dir, config)
}

#[test]
fn static_get_hit() {
    let (dir, config) = setup_static_assets();
    let server = TestServer::start(move |server| {
        let fs = FileServer::init(config).expect("fileserver");
        *server.context().fileserver.borrow_mut() = Some(fs);
    });

    let response = server.roundtrip("GET /assets/hello.css HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/css\r\n"));
    assert!(response.contains("Cache-Control: public, max-age=31536000\r\n"));
    // The stylesheet is already minimal apart from its trailing newline,
    // which minification strips.
    assert!(response.ends_with("\r\n\r\nbody{color:red}"));
    assert!(response.contains("Content-Length: 15\r\n"));
    drop(server);
    drop(dir);
}

#[test]
fn static_traversal_rejected() {
    let (dir, config) = setup_static_assets();
    let server = TestServer::start(move |server| {
        let fs = FileServer::init(config).expect("fileserver");
        *server.context().fileserver.borrow_mut() = Some(fs);
    });

    let response = server.roundtrip("GET /assets/../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 403 Unknown\r\n"));
    assert!(response.ends_with("Forbidden"));
    drop(server);
    drop(dir);
}

#[test]
fn route_miss_returns_404_html() {
    let server = TestServer::start(|_| {});

    let response = server.roundtrip("GET /nope HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.contains("Content-Type: text/html\r\n"));
    assert!(response.ends_with("<h1>404 Not Found</h1>"));
}

fn hello_handler() -> RouteHandler {
    Rc::new(|_ctx, exchange| {
        let mut res = exchange.res.borrow_mut();
        res.status = 200;
        res.add_header("Content-Type", "text/plain");
        res.set_body("hi");
        res.state = ResponseState::Processed;
    })
}

#[test]
fn session_cookie_is_issued_once() {
    let server = TestServer::start(|server| {
        server
            .context()
            .routes
            .borrow_mut()
            .add_route("/account", hello_handler(), true);
    });

    let first = server.roundtrip("GET /account HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
    let cookie_line = first
        .lines()
        .find(|l| l.starts_with("Set-Cookie: "))
        .expect("set-cookie header");
    assert!(cookie_line.contains("; HttpOnly; Path=/; Max-Age=1800"));

    let session_id = cookie_line
        .strip_prefix("Set-Cookie: session_id=")
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    assert_eq!(session_id.len(), 32);
    assert!(session_id.chars().all(|c| c.is_ascii_hexdigit()));

    let second = server.roundtrip(&format!(
        "GET /account HTTP/1.1\r\nHost: x\r\nCookie: session_id={session_id}\r\n\r\n"
    ));
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!second.contains("Set-Cookie:"));
}

#[test]
fn async_handler_completes_via_pending_sweep() {
    // The handler leaves the response in Processing and finishes it from a
    // reactor timer; the pending sweep must pick it up and send it.
    let server = TestServer::start(|server| {
        let handler: RouteHandler = Rc::new(|ctx, exchange| {
            exchange.res.borrow_mut().state = ResponseState::Processing;
            let weak = Rc::downgrade(exchange);
            ctx.reactor
                .add_timer(Duration::from_millis(20), Repeat::Once, move |_| {
                    if let Some(exchange) = weak.upgrade() {
                        if exchange.cancelled.get() {
                            return;
                        }
                        let mut res = exchange.res.borrow_mut();
                        res.status = 200;
                        res.add_header("Content-Type", "text/plain");
                        res.set_body("deferred");
                        res.state = ResponseState::Processed;
                    }
                });
        });
        server
            .context()
            .routes
            .borrow_mut()
            .add_route("/slow", handler, false);
    });

    let response = server.roundtrip("GET /slow HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("deferred"));
}

#[test]
fn dynamic_param_route_matches_query() {
    let server = TestServer::start(|server| {
        let mut routes = server.context().routes.borrow_mut();
        routes.add_route("/echo", hello_handler(), false);
        routes.set_dynamic_param("/echo", true);
    });

    let ok = server.roundtrip("GET /echo?x=1 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(ok.starts_with("HTTP/1.1 200 OK\r\n"));

    let miss = server.roundtrip("GET /echo/sub HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(miss.starts_with("HTTP/1.1 404 Not Found\r\n"));
}
