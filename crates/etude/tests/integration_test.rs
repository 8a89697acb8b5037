use etude::{Server, ServerConfig, ServerContext};
use std::fs::{self, Permissions};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const INDEX: &[u8] = b"<html><body>etude</body></html>\n";

struct TestServer {
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    root: TempDir,
}

fn write_file(root: &TempDir, name: &str, contents: &[u8], mode: u32) {
    let path = root.path().join(name);
    fs::write(&path, contents).unwrap();
    fs::set_permissions(&path, Permissions::from_mode(mode)).unwrap();
}

fn start_with(tune: impl FnOnce(ServerConfig) -> ServerConfig) -> TestServer {
    let root = TempDir::new().unwrap();
    write_file(&root, "index.html", INDEX, 0o644);

    let config = tune(ServerConfig::new(Ipv4Addr::LOCALHOST, 0, root.path()).workers(2));
    let mut server = Server::bind(config).unwrap();
    let addr = server.local_addr().unwrap();
    let ctx = server.context();

    thread::spawn(move || server.serve_forever());

    TestServer { addr, ctx, root }
}

fn start() -> TestServer {
    start_with(|c| c)
}

fn connect(server: &TestServer) -> TcpStream {
    let stream = TcpStream::connect(server.addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn roundtrip(server: &TestServer, request: &[u8]) -> Vec<u8> {
    let mut stream = connect(server);
    stream.write_all(request).unwrap();
    let mut res = Vec::new();
    stream.read_to_end(&mut res).unwrap();
    res
}

/// Read one response framed by its Content-Length, leaving the socket open.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "connection closed mid-header");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn serves_file_with_exact_bytes() {
    let server = start();
    let res = roundtrip(&server, b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");

    let mut expected = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        INDEX.len()
    )
    .into_bytes();
    expected.extend_from_slice(INDEX);
    assert_eq!(res, expected);
}

#[test]
fn request_split_across_packets_matches_single_write() {
    let server = start();
    let request = b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let whole = roundtrip(&server, request);

    let mut stream = connect(&server);
    for chunk in request.chunks(7) {
        stream.write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(15));
    }
    let mut split = Vec::new();
    stream.read_to_end(&mut split).unwrap();

    assert_eq!(split, whole);
}

#[test]
fn error_statuses() {
    let server = start();
    write_file(&server.root, "private.txt", b"secret", 0o640);
    fs::create_dir(server.root.path().join("dir")).unwrap();
    fs::set_permissions(server.root.path().join("dir"), Permissions::from_mode(0o755)).unwrap();

    let cases: [(&[u8], &str, &str); 5] = [
        (
            b"GET /missing.html HTTP/1.1\r\n\r\n",
            "HTTP/1.1 404 Not Found\r\n",
            "The requested file was not found on this server.\n",
        ),
        (
            b"GET /private.txt HTTP/1.1\r\n\r\n",
            "HTTP/1.1 403 Forbidden\r\n",
            "You do not have permission to get file from this server.\n",
        ),
        (
            b"POST /index.html HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
            "HTTP/1.1 400 Bad Request\r\n",
            "Your request has bad syntax or is inherently impossible to satisfy.\n",
        ),
        (
            b"GET/index.htmlHTTP/1.1\r\n\r\n",
            "HTTP/1.1 400 Bad Request\r\n",
            "Your request has bad syntax or is inherently impossible to satisfy.\n",
        ),
        (
            b"GET /dir HTTP/1.1\r\n\r\n",
            "HTTP/1.1 400 Bad Request\r\n",
            "Your request has bad syntax or is inherently impossible to satisfy.\n",
        ),
    ];

    for (request, status, body) in cases {
        let res = String::from_utf8(roundtrip(&server, request)).unwrap();
        assert!(res.starts_with(status), "{:?} -> {:?}", request, res);
        assert!(res.contains("Connection: close\r\n"));
        assert!(res.ends_with(body), "{:?}", res);
    }
}

#[test]
fn empty_file_gets_placeholder() {
    let server = start();
    write_file(&server.root, "empty.txt", b"", 0o644);
    let res = roundtrip(&server, b"GET /empty.txt HTTP/1.1\r\n\r\n");
    assert_eq!(
        res,
        b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nit's Empty!"
    );
}

#[test]
fn keep_alive_reuses_the_connection() {
    let server = start();
    let mut stream = connect(&server);

    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, INDEX);

    // Errors on a persistent connection leave it open too.
    stream
        .write_all(b"GET /nope HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    stream.write_all(b"GET /index.html HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body, INDEX);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn declared_body_is_awaited_before_responding() {
    let server = start();
    let mut stream = connect(&server);
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345")
        .unwrap();

    stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut buf = [0u8; 64];
    let err = stream.read(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"67890").unwrap();
    let mut res = Vec::new();
    stream.read_to_end(&mut res).unwrap();
    assert!(res.starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert!(res.ends_with(INDEX));
}

#[test]
fn full_table_answers_busy() {
    let server = start_with(|c| c.max_connections(1));
    let _holder = connect(&server);
    assert!(wait_until(|| server.ctx.live_connections() == 1));

    let mut rejected = connect(&server);
    let mut res = Vec::new();
    rejected.read_to_end(&mut res).unwrap();
    assert_eq!(res, b"Internal server busy");
    assert_eq!(server.ctx.live_connections(), 1);
}

#[test]
fn large_file_survives_partial_writes() {
    let server = start();
    let payload: Vec<u8> = (0..(1 << 20) as u32).map(|i| (i * 7 % 253) as u8).collect();
    write_file(&server.root, "large.bin", &payload, 0o644);

    let mut stream = connect(&server);
    stream.write_all(b"GET /large.bin HTTP/1.1\r\n\r\n").unwrap();
    // Let the server hit a full socket buffer before draining.
    thread::sleep(Duration::from_millis(100));
    let mut res = Vec::new();
    stream.read_to_end(&mut res).unwrap();

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    assert_eq!(&res[..head.len()], head.as_bytes());
    assert!(res[head.len()..] == payload[..]);
}

#[test]
fn closed_connections_release_their_slots() {
    let server = start();
    for _ in 0..5 {
        roundtrip(&server, b"GET /index.html HTTP/1.1\r\n\r\n");
    }
    {
        let _idle = connect(&server);
        assert!(wait_until(|| server.ctx.live_connections() == 1));
    }
    assert!(wait_until(|| server.ctx.live_connections() == 0));
}

#[test]
fn tiny_queue_still_serves_every_client() {
    let server = Arc::new(start_with(|c| c.workers(1).max_queued_tasks(1)));
    let clients: Vec<_> = (0..24)
        .map(|_| {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                roundtrip(&server, b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n")
            })
        })
        .collect();

    for client in clients {
        let res = client.join().unwrap();
        assert!(res.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(res.ends_with(INDEX));
    }
}
