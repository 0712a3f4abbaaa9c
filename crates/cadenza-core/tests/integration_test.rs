use cadenza_core::http::EMPTY_FILE_BODY;
use cadenza_core::{Server, ServerConfig, ShutdownHandle, Status};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    handle: Option<thread::JoinHandle<()>>,
    _root: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_file(dir: &Path, name: &str, contents: &[u8], mode: u32) {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
}

fn setup_test_server() -> TestServer {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path(), "index.html", b"<h1>Hello, World!</h1>", 0o644);
    write_file(root.path(), "empty.html", b"", 0o644);
    write_file(root.path(), "private.txt", b"secret", 0o600);
    fs::create_dir(root.path().join("docs")).unwrap();
    fs::set_permissions(root.path().join("docs"), fs::Permissions::from_mode(0o755)).unwrap();
    write_file(root.path(), "docs/guide.txt", b"read me", 0o644);

    let big: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
    write_file(root.path(), "big.bin", &big, 0o644);

    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        doc_root: root.path().to_path_buf(),
        max_path_len: 4096,
        workers: 2,
        poll_timeout_ms: 20,
        ..ServerConfig::default()
    };
    let server = Server::bind(config).unwrap();
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    let handle = thread::spawn(move || server.serve().unwrap());

    TestServer {
        addr,
        shutdown,
        handle: Some(handle),
        _root: root,
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

fn roundtrip(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = connect(addr);
    stream.write_all(request).unwrap();
    let mut res = Vec::new();
    stream.read_to_end(&mut res).unwrap();
    res
}

fn head(status: &str, len: usize, keep_alive: bool) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status,
        len,
        if keep_alive { "keep-alive" } else { "close" }
    )
}

fn error_response(status: Status, line: &str) -> String {
    let text = status.error_text().unwrap();
    format!("{}{}", head(line, text.len(), false), text)
}

/// Read exactly one response whose total size is known up front.
fn read_response(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn test_serves_file() {
    let server = setup_test_server();
    let res = roundtrip(
        server.addr,
        b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    let expected = format!("{}<h1>Hello, World!</h1>", head("200 OK", 22, false));
    assert_eq!(String::from_utf8(res).unwrap(), expected);
}

#[test]
fn test_absolute_form_url_and_nested_path() {
    let server = setup_test_server();
    let res = roundtrip(
        server.addr,
        b"GET http://localhost/docs/guide.txt HTTP/1.1\r\n\r\n",
    );
    let expected = format!("{}read me", head("200 OK", 7, false));
    assert_eq!(String::from_utf8(res).unwrap(), expected);
}

#[test]
fn test_error_statuses() {
    let server = setup_test_server();

    let res = roundtrip(server.addr, b"GET /nope.html HTTP/1.1\r\n\r\n");
    assert_eq!(
        String::from_utf8(res).unwrap(),
        error_response(Status::NotFound, "404 Not Found")
    );

    let res = roundtrip(server.addr, b"GET /private.txt HTTP/1.1\r\n\r\n");
    assert_eq!(
        String::from_utf8(res).unwrap(),
        error_response(Status::Forbidden, "403 Forbidden")
    );

    let res = roundtrip(server.addr, b"GET /docs HTTP/1.1\r\n\r\n");
    assert_eq!(
        String::from_utf8(res).unwrap(),
        error_response(Status::BadRequest, "400 Bad Request")
    );
}

#[test]
fn test_bad_requests() {
    let server = setup_test_server();
    for request in [
        &b"POST / HTTP/1.1\r\n\r\n"[..],
        b"GET /x HTTP/1.0\r\n\r\n",
        b"GET /../etc/passwd HTTP/1.1\r\n\r\n",
        b"GET /index.html HTTP/1.1\nHost: x\n\n",
        b"GET /index.html HTTP/1.1\r\nContent-Length: ten\r\n\r\n",
    ] {
        let res = roundtrip(server.addr, request);
        assert!(
            res.starts_with(b"HTTP/1.1 400 Bad Request\r\n"),
            "{:?} -> {:?}",
            String::from_utf8_lossy(request),
            String::from_utf8_lossy(&res)
        );
    }
}

#[test]
fn test_empty_file_placeholder() {
    let server = setup_test_server();
    let res = roundtrip(server.addr, b"GET /empty.html HTTP/1.1\r\n\r\n");
    let expected = format!(
        "{}{}",
        head("200 OK", EMPTY_FILE_BODY.len(), false),
        EMPTY_FILE_BODY
    );
    assert_eq!(String::from_utf8(res).unwrap(), expected);
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let server = setup_test_server();
    let mut stream = connect(server.addr);

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let first_head = head("200 OK", 22, true);
    let first = read_response(&mut stream, first_head.len() + 22);
    assert_eq!(
        first,
        format!("{}<h1>Hello, World!</h1>", first_head).into_bytes()
    );

    stream
        .write_all(b"GET /docs/guide.txt HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let second_head = head("200 OK", 7, true);
    let second = read_response(&mut stream, second_head.len() + 7);
    assert_eq!(second, format!("{}read me", second_head).into_bytes());

    stream
        .write_all(b"GET /missing HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert_eq!(
        String::from_utf8(rest).unwrap(),
        error_response(Status::NotFound, "404 Not Found")
    );
}

#[test]
fn test_fragmented_request() {
    let server = setup_test_server();
    let mut stream = connect(server.addr);
    stream.set_nodelay(true).unwrap();

    let request = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
    for chunk in request.chunks(3) {
        stream.write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    let mut res = Vec::new();
    stream.read_to_end(&mut res).unwrap();
    let expected = format!("{}<h1>Hello, World!</h1>", head("200 OK", 22, false));
    assert_eq!(String::from_utf8(res).unwrap(), expected);
}

#[test]
fn test_large_file_is_byte_exact() {
    let server = setup_test_server();
    let res = roundtrip(server.addr, b"GET /big.bin HTTP/1.1\r\n\r\n");

    let expected_head = head("200 OK", 2 * 1024 * 1024, false);
    assert_eq!(&res[..expected_head.len()], expected_head.as_bytes());
    let body = &res[expected_head.len()..];
    assert_eq!(body.len(), 2 * 1024 * 1024);
    assert!(body.iter().enumerate().all(|(i, &b)| b == (i % 253) as u8));
}

#[test]
fn test_concurrent_clients() {
    let server = setup_test_server();
    let addr = server.addr;
    let clients: Vec<_> = (0..16)
        .map(|_| {
            thread::spawn(move || {
                roundtrip(addr, b"GET /docs/guide.txt HTTP/1.1\r\n\r\n")
            })
        })
        .collect();

    let expected = format!("{}read me", head("200 OK", 7, false));
    for client in clients {
        assert_eq!(String::from_utf8(client.join().unwrap()).unwrap(), expected);
    }
}
