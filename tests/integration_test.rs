//! Integration tests for domain-proxy
//!
//! Runs a real proxy on ephemeral ports against local backends:
//! - Forwarding with headers and streaming bodies
//! - Redirects, HTTPS upgrade and CORS
//! - SNI certificate selection on the TLS listener
//! - Reload and shutdown

use bytes::Bytes;
use domain_proxy::certificate::generate_self_signed;
use domain_proxy::{
    CertificateFiles, EntryStore, MemoryStore, ProxyConfig, ProxyEntry, ProxyServer, SqliteStore,
};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use reqwest::redirect::Policy;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Backend for tests: `/ping` answers `pong`, `/echo` returns the request body,
/// anything else describes the request it received
async fn run_backend_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("none")
                            .to_string()
                    };
                    let path = req.uri().path().to_string();
                    let description = format!(
                        "path={}|host={}|xff={}|xfh={}|proto={}",
                        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
                        header("host"),
                        header("x-forwarded-for"),
                        header("x-forwarded-host"),
                        header("x-forwarded-proto"),
                    );

                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    let reply = match path.as_str() {
                        "/ping" => Bytes::from_static(b"pong"),
                        "/echo" => body,
                        _ => Bytes::from(description),
                    };

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(200)
                            .header("x-backend", "echo")
                            .body(Full::new(reply))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    addr
}

/// Read until the end of the request head; the body, if any, is ignored
async fn read_request_head(stream: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            return;
        }
        head.extend_from_slice(&buf[..n]);
    }
}

/// Raw backend that handles a single connection with `handler`
async fn run_raw_backend<F, Fut>(handler: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        handler(stream).await;
    });

    addr
}

fn test_config(certs_dir: &Path, enable_https: bool) -> ProxyConfig {
    ProxyConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        http_port: 0,
        https_port: 0,
        enable_https,
        certs_dir: certs_dir.to_path_buf(),
        certificate_files: CertificateFiles::default(),
    }
}

/// Start a proxy serving `entries` from an in-memory store
async fn setup_proxy(entries: Vec<ProxyEntry>, certs_dir: &Path, enable_https: bool) -> ProxyServer {
    let store = Arc::new(MemoryStore::with_entries(entries));
    let server = ProxyServer::new(test_config(certs_dir, enable_https), store);
    server.start().await.unwrap();
    server
}

/// Client that resolves `host` to `addr` and never follows redirects
fn client_for(host: &str, addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .danger_accept_invalid_certs(true)
        .resolve(host, addr)
        .build()
        .unwrap()
}

fn backend_url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_unknown_host_is_not_found() {
    let dir = tempdir().unwrap();
    let backend = run_backend_server().await;
    let entry = ProxyEntry::forward("api.test", &backend_url(backend)).unwrap();
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();

    let response = client_for("unknown.test", addr)
        .get(format!("http://unknown.test:{}/", addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    proxy.stop().await;
}

#[tokio::test]
async fn test_forward_end_to_end() {
    let dir = tempdir().unwrap();
    let backend = run_backend_server().await;
    let entry = ProxyEntry::forward("api.test", &backend_url(backend)).unwrap();
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();
    let client = client_for("api.test", addr);

    let response = client
        .get(format!("http://api.test:{}/ping", addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-backend"], "echo");
    assert_eq!(response.text().await.unwrap(), "pong");

    let text = client
        .get(format!("http://api.test:{}/users/7?full=1", addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(text.contains("path=/users/7?full=1"), "{}", text);
    assert!(text.contains(&format!("host={}", backend)), "{}", text);
    assert!(text.contains("xff=127.0.0.1"), "{}", text);
    assert!(text.contains("xfh=api.test"), "{}", text);
    assert!(text.contains("proto=http"), "{}", text);

    proxy.stop().await;
}

#[tokio::test]
async fn test_streaming_request_body() {
    let dir = tempdir().unwrap();
    let backend = run_backend_server().await;
    let entry = ProxyEntry::forward("api.test", &backend_url(backend)).unwrap();
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();

    let payload = "x".repeat(1 << 20);
    let response = client_for("api.test", addr)
        .post(format!("http://api.test:{}/echo", addr.port()))
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), payload);
    proxy.stop().await;
}

#[tokio::test]
async fn test_redirect_url() {
    let dir = tempdir().unwrap();
    let entry = ProxyEntry::redirect_to("old.test", "https://new.test/landing").unwrap();
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();

    let response = client_for("old.test", addr)
        .get(format!("http://old.test:{}/anything", addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(response.headers()["location"], "https://new.test/landing");
    proxy.stop().await;
}

#[tokio::test]
async fn test_https_upgrade_and_tls_forwarding() {
    let dir = tempdir().unwrap();
    generate_self_signed(dir.path(), "api.test").unwrap();

    let backend = run_backend_server().await;
    let entry = ProxyEntry::forward("api.test", &backend_url(backend))
        .unwrap()
        .with_https_redirect(true);
    let proxy = setup_proxy(vec![entry], dir.path(), true).await;
    let http = proxy.http_addr().unwrap();
    let https = proxy.https_addr().unwrap();

    let response = client_for("api.test", http)
        .get(format!("http://api.test:{}/login?next=%2F", http.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 301);
    assert_eq!(response.headers()["location"], "https://api.test/login?next=%2F");

    let text = client_for("api.test", https)
        .get(format!("https://api.test:{}/login", https.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(text.contains("proto=https"), "{}", text);
    proxy.stop().await;
}

#[tokio::test]
async fn test_tls_handshake_fails_without_certificate() {
    let dir = tempdir().unwrap();
    generate_self_signed(dir.path(), "api.test").unwrap();

    let backend = run_backend_server().await;
    let entries = vec![
        ProxyEntry::forward("api.test", &backend_url(backend)).unwrap(),
        ProxyEntry::forward("other.org", &backend_url(backend)).unwrap(),
    ];
    let proxy = setup_proxy(entries, dir.path(), true).await;
    let https = proxy.https_addr().unwrap();

    let result = client_for("other.org", https)
        .get(format!("https://other.org:{}/ping", https.port()))
        .send()
        .await;

    assert!(result.is_err());

    // a subdomain is covered by its root domain's certificate
    let response = client_for("www.api.test", https)
        .get(format!("https://www.api.test:{}/ping", https.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    proxy.stop().await;
}

#[tokio::test]
async fn test_cors_preflight_and_simple_request() {
    let dir = tempdir().unwrap();
    let backend = run_backend_server().await;
    let entry = ProxyEntry::forward("api.test", &backend_url(backend))
        .unwrap()
        .with_cors(true);
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();
    let client = client_for("api.test", addr);

    let preflight = client
        .request(reqwest::Method::OPTIONS, format!("http://api.test:{}/data", addr.port()))
        .header("origin", "https://app.test")
        .header("access-control-request-method", "PUT")
        .header("access-control-request-headers", "x-token")
        .send()
        .await
        .unwrap();

    assert_eq!(preflight.status(), 204);
    let headers = preflight.headers();
    assert_eq!(headers["access-control-allow-origin"], "https://app.test");
    assert_eq!(headers["access-control-allow-methods"], "PUT");
    assert_eq!(headers["access-control-allow-headers"], "x-token");
    assert_eq!(headers["access-control-allow-credentials"], "true");
    assert!(preflight.headers().get("x-backend").is_none());

    let simple = client
        .get(format!("http://api.test:{}/ping", addr.port()))
        .header("origin", "https://app.test")
        .send()
        .await
        .unwrap();

    assert_eq!(simple.status(), 200);
    assert_eq!(simple.headers()["access-control-allow-origin"], "https://app.test");
    assert_eq!(simple.headers()["x-backend"], "echo");

    proxy.stop().await;
}

#[tokio::test]
async fn test_refused_backend_is_bad_gateway() {
    let dir = tempdir().unwrap();

    // grab a free port, then close it
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

    let entry = ProxyEntry::forward("api.test", &backend_url(unused)).unwrap();
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();

    let response = client_for("api.test", addr)
        .get(format!("http://api.test:{}/ping", addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    proxy.stop().await;
}

#[tokio::test]
async fn test_path_entries_route_by_prefix() {
    let dir = tempdir().unwrap();
    let root = run_backend_server().await;
    let api = run_backend_server().await;

    let entries = vec![
        ProxyEntry::forward("site.test", &backend_url(root)).unwrap(),
        ProxyEntry::forward("site.test/api", &backend_url(api)).unwrap(),
    ];
    let proxy = setup_proxy(entries, dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();
    let client = client_for("site.test", addr);

    let via_api = client
        .get(format!("http://site.test:{}/api/items", addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(via_api.contains(&format!("host={}", api)), "{}", via_api);

    let via_root = client
        .get(format!("http://site.test:{}/apiary", addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(via_root.contains(&format!("host={}", root)), "{}", via_root);

    proxy.stop().await;
}

#[tokio::test]
async fn test_remove_entry_keeps_shared_certificate() {
    let dir = tempdir().unwrap();
    let certs = dir.path().join("certs");
    generate_self_signed(&certs, "api.test").unwrap();

    let backend = run_backend_server().await;
    let store = Arc::new(SqliteStore::open(dir.path().join("proxy.db")).unwrap());
    store
        .insert(&ProxyEntry::forward("api.test", &backend_url(backend)).unwrap())
        .unwrap();
    store
        .insert(&ProxyEntry::forward("www.api.test", &backend_url(backend)).unwrap())
        .unwrap();

    let proxy = ProxyServer::new(test_config(&certs, true), store.clone());
    proxy.start().await.unwrap();
    let https = proxy.https_addr().unwrap();

    let removed = proxy.remove_entry("www.api.test", None).await.unwrap();
    assert_eq!(removed, 1);

    let gone = client_for("www.api.test", https)
        .get(format!("https://www.api.test:{}/ping", https.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);

    let kept = client_for("api.test", https)
        .get(format!("https://api.test:{}/ping", https.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(kept.status(), 200);
    assert_eq!(kept.text().await.unwrap(), "pong");

    // changes made behind the server's back show up after reload
    store.remove("api.test", None).unwrap();
    proxy.reload().await.unwrap();

    let after_reload = client_for("api.test", https)
        .get(format!("https://api.test:{}/ping", https.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(after_reload.status(), 404);

    proxy.stop().await;
}

#[tokio::test]
async fn test_stop_closes_listeners() {
    let dir = tempdir().unwrap();
    let proxy = setup_proxy(Vec::new(), dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();

    proxy.stop().await;
    proxy.stop().await;

    assert!(proxy.http_addr().is_none());

    let result = client_for("api.test", addr)
        .get(format!("http://api.test:{}/", addr.port()))
        .send()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_forwarded_headers_reach_backend() {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .and(header("x-forwarded-host", "api.test"))
        .and(header("x-forwarded-proto", "http"))
        .and(header("forwarded", "for=127.0.0.1;host=api.test;proto=http"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
        .expect(1)
        .mount(&backend)
        .await;

    let dir = tempdir().unwrap();
    let entry = ProxyEntry::forward("api.test", &backend.uri()).unwrap();
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();

    let response = client_for("api.test", addr)
        .get(format!("http://api.test:{}/hello", addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hi");
    proxy.stop().await;
}

#[tokio::test]
async fn test_backend_closing_without_response_is_server_error() {
    let dir = tempdir().unwrap();
    let backend = run_raw_backend(|mut stream| async move {
        read_request_head(&mut stream).await;
        drop(stream);
    })
    .await;

    let entry = ProxyEntry::forward("api.test", &backend_url(backend)).unwrap();
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();

    let response = client_for("api.test", addr)
        .get(format!("http://api.test:{}/ping", addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    proxy.stop().await;
}

#[tokio::test]
async fn test_backend_dropping_mid_body_closes_client() {
    let dir = tempdir().unwrap();
    let backend = run_raw_backend(|mut stream| async move {
        read_request_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nhello")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        drop(stream);
    })
    .await;

    let entry = ProxyEntry::forward("api.test", &backend_url(backend)).unwrap();
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();

    let response = client_for("api.test", addr)
        .get(format!("http://api.test:{}/download", addr.port()))
        .send()
        .await
        .unwrap();

    // headers were already flushed, so the status stands
    assert_eq!(response.status(), 200);

    let body = timeout(Duration::from_secs(5), response.bytes())
        .await
        .expect("client connection left hanging");
    assert!(body.is_err());

    proxy.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_aborts_backend() {
    let dir = tempdir().unwrap();
    let (aborted_tx, aborted_rx) = oneshot::channel();

    let backend = run_raw_backend(|mut stream| async move {
        read_request_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n")
            .await
            .unwrap();

        // stream chunks until the proxy goes away
        loop {
            if stream.write_all(b"5\r\nhello\r\n").await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let _ = aborted_tx.send(());
    })
    .await;

    let entry = ProxyEntry::forward("api.test", &backend_url(backend)).unwrap();
    let proxy = setup_proxy(vec![entry], dir.path(), false).await;
    let addr = proxy.http_addr().unwrap();

    let client = client_for("api.test", addr);
    let mut response = client
        .get(format!("http://api.test:{}/events", addr.port()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let first = response.chunk().await.unwrap().unwrap();
    assert!(!first.is_empty());

    drop(response);
    drop(client);

    timeout(Duration::from_secs(10), aborted_rx)
        .await
        .expect("backend connection still open after client left")
        .unwrap();

    proxy.stop().await;
}
