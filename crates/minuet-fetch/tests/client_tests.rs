//! Transfer tests against throwaway local HTTP servers.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use minuet_core::reactor::{Reactor, Repeat};
use minuet_fetch::{FetchClient, FetchConfig, FetchError, FetchRequest, FetchResponse, FetchResult};

type Captured = Rc<RefCell<Option<FetchResult<FetchResponse>>>>;

/// Serve canned responses: one accepted connection per element, request
/// head read and discarded, response written, connection closed.
fn serve_script(responses: Vec<String>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut buf = [0u8; 4096];
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let _ = stream.write_all(response.as_bytes());
        }
    });
    port
}

/// Run one request to completion on a private reactor.
fn run_fetch(config: FetchConfig, request: FetchRequest) -> FetchResult<FetchResponse> {
    let reactor = Reactor::new().unwrap();
    let client = FetchClient::new(reactor.clone(), config);

    let captured: Captured = Rc::new(RefCell::new(None));
    let shutdown = Arc::new(AtomicBool::new(false));

    let slot = captured.clone();
    let flag = shutdown.clone();
    client.execute(
        request,
        Box::new(move |_req, result| {
            *slot.borrow_mut() = Some(result);
            flag.store(true, Ordering::Release);
        }),
    );

    let safety = shutdown.clone();
    reactor.add_timer(Duration::from_secs(10), Repeat::Once, move |_| {
        safety.store(true, Ordering::Release);
    });

    reactor.run(&shutdown).unwrap();
    captured
        .borrow_mut()
        .take()
        .expect("transfer did not complete")
}

#[test]
fn content_length_framed_response() {
    let port = serve_script(vec![
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello".into(),
    ]);

    let res = run_fetch(
        FetchConfig::default(),
        FetchRequest::get(format!("http://127.0.0.1:{port}/file")),
    )
    .expect("success");

    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"hello");
    assert_eq!(res.header("content-type").as_deref(), Some("text/plain"));
    assert!(res.total_time >= Duration::ZERO);
}

#[test]
fn chunked_framed_response() {
    let port = serve_script(vec![
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"
            .into(),
    ]);

    let res = run_fetch(
        FetchConfig::default(),
        FetchRequest::get(format!("http://127.0.0.1:{port}/chunked")),
    )
    .expect("success");

    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"Wikipedia");
}

#[test]
fn close_delimited_response() {
    let port = serve_script(vec![
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nuntil-close".into(),
    ]);

    let res = run_fetch(
        FetchConfig::default(),
        FetchRequest::get(format!("http://127.0.0.1:{port}/stream")),
    )
    .expect("success");

    assert_eq!(res.body, b"until-close");
}

#[test]
fn json_body_parses_lazily() {
    let port = serve_script(vec![
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 19\r\n\r\n{\"login\":\"octocat\"}"
            .into(),
    ]);

    let res = run_fetch(
        FetchConfig::default(),
        FetchRequest::get(format!("http://127.0.0.1:{port}/user")),
    )
    .expect("success");

    let json = res.json().expect("json");
    assert_eq!(json["login"], "octocat");
}

#[test]
fn redirects_are_followed() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let responses = [
            format!(
                "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:{port}/next\r\nContent-Length: 0\r\n\r\n"
            ),
            "HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\narrived".to_string(),
        ];
        for response in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(response.as_bytes());
        }
    });

    let res = run_fetch(
        FetchConfig::default(),
        FetchRequest::get(format!("http://127.0.0.1:{port}/start")),
    )
    .expect("success");

    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"arrived");
}

#[test]
fn https_is_rejected_through_the_callback() {
    let result = run_fetch(
        FetchConfig::default(),
        FetchRequest::get("https://api.github.com/users/octocat"),
    );
    assert!(matches!(result, Err(FetchError::TlsUnsupported)));
}

#[test]
fn silent_server_times_out() {
    // Listener that accepts and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        thread::sleep(Duration::from_secs(5));
        drop(stream);
    });

    let config = FetchConfig {
        timeout_ms: 200,
        ..FetchConfig::default()
    };
    let result = run_fetch(config, FetchRequest::get(format!("http://127.0.0.1:{port}/")));
    assert!(matches!(result, Err(FetchError::Timeout)));
}

#[test]
fn cancellation_reaches_the_callback() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let Ok(_stream) = listener.accept().map(|(s, _)| s) else {
            return;
        };
        thread::sleep(Duration::from_secs(5));
    });

    let reactor = Reactor::new().unwrap();
    let client = FetchClient::new(reactor.clone(), FetchConfig::default());

    let captured: Captured = Rc::new(RefCell::new(None));
    let shutdown = Arc::new(AtomicBool::new(false));

    let slot = captured.clone();
    let flag = shutdown.clone();
    let handle = client.execute(
        FetchRequest::get(format!("http://127.0.0.1:{port}/")),
        Box::new(move |_req, result| {
            *slot.borrow_mut() = Some(result);
            flag.store(true, Ordering::Release);
        }),
    );

    let handle = Rc::new(handle);
    let cancel_target = handle.clone();
    reactor.add_timer(Duration::from_millis(50), Repeat::Once, move |_| {
        cancel_target.cancel();
    });

    let safety = shutdown.clone();
    reactor.add_timer(Duration::from_secs(5), Repeat::Once, move |_| {
        safety.store(true, Ordering::Release);
    });

    reactor.run(&shutdown).unwrap();
    let result = captured.borrow_mut().take().expect("callback ran");
    assert!(matches!(result, Err(FetchError::Cancelled)));
    assert!(handle.is_finished());
}
