//! Reverse proxy engine
//! Resolves each request against the published routing table, then redirects,
//! answers CORS preflights, or streams the exchange to the backend.

use crate::entry::ProxyEntry;
use crate::error::UpstreamError;
use crate::routing::RoutingTable;
use crate::server::SharedSnapshot;
use crate::tls;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, CONNECTION, CONTENT_LENGTH,
    FORWARDED, HOST, LOCATION, ORIGIN, TE, TRAILER, UPGRADE, VARY,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error};
use url::Url;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

const DEFAULT_CORS_METHODS: &str = "GET,HEAD,PUT,PATCH,POST,DELETE";

/// Scheme of the listener a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving a request, decided before any backend traffic
#[derive(Debug)]
pub enum Dispatch {
    /// No host, or no entry for it
    NotFound,
    /// Unconditional redirect (302)
    Redirect(String),
    /// Plaintext request to an HTTPS-only entry (301)
    UpgradeToHttps(String),
    /// CORS preflight answered locally (204)
    Preflight(HeaderMap),
    Forward(Arc<ProxyEntry>),
}

/// Decide what to do with `req`. Order: redirect URL, HTTPS upgrade, preflight, forward.
pub fn dispatch<B>(routes: &RoutingTable, req: &Request<B>, scheme: Scheme) -> Dispatch {
    let Some(host) = request_host(req) else {
        return Dispatch::NotFound;
    };
    let Some(entry) = routes.resolve_path(&host, req.uri().path()) else {
        return Dispatch::NotFound;
    };

    if let Some(url) = entry.redirect_url() {
        return Dispatch::Redirect(url.to_string());
    }

    if entry.redirect() && scheme == Scheme::Http {
        return Dispatch::UpgradeToHttps(https_location(&host, req.uri()));
    }

    if req.method() == Method::OPTIONS && entry.cors() {
        return Dispatch::Preflight(cors_headers(req.headers()));
    }

    Dispatch::Forward(entry)
}

/// Requested host: `x-forwarded-host`, then `Host`, then the URI authority.
/// Port stripped, lowercased.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = first_header(req.headers(), &X_FORWARDED_HOST)
        .or_else(|| first_header(req.headers(), &HOST))
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let authority = hyper::http::uri::Authority::from_str(raw).ok()?;
    let host = authority.host().trim_end_matches('.').to_ascii_lowercase();

    (!host.is_empty()).then_some(host)
}

fn first_header<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn https_location(host: &str, uri: &Uri) -> String {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{}{}", host, path)
}

/// CORS response headers for a request, reflecting its `Origin`
pub fn cors_headers(request: &HeaderMap) -> HeaderMap {
    let origin = request
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(normalize_origin)
        .and_then(|o| HeaderValue::from_str(&o).ok())
        .unwrap_or_else(|| HeaderValue::from_static("*"));

    let methods = request
        .get(ACCESS_CONTROL_REQUEST_METHOD)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CORS_METHODS));

    let allowed_headers = request
        .get(ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));

    let mut headers = HeaderMap::new();
    headers.insert(VARY, HeaderValue::from_static("Origin"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allowed_headers);
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods);
    headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    headers
}

fn normalize_origin(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) if url.origin().is_tuple() => url.origin().ascii_serialization(),
        _ => raw.to_string(),
    }
}

/// Drop hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_str(name.trim()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in [CONNECTION, KEEP_ALIVE, PROXY_CONNECTION, TE, TRAILER, UPGRADE] {
        headers.remove(name);
    }
}

/// Point the request at the backend and record the original client and scheme
pub fn set_forwarding_headers(
    headers: &mut HeaderMap,
    target_authority: &str,
    original_host: &str,
    client: IpAddr,
    scheme: Scheme,
) -> Result<(), hyper::header::InvalidHeaderValue> {
    let client_node = match client {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => format!("\"[{}]\"", ip),
    };

    headers.insert(HOST, HeaderValue::from_str(target_authority)?);
    headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&client.to_string())?);
    headers.insert(X_FORWARDED_HOST, HeaderValue::from_str(original_host)?);
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));
    headers.insert(
        FORWARDED,
        HeaderValue::from_str(&format!(
            "for={};host={};proto={}",
            client_node,
            forwarded_value(original_host),
            scheme
        ))?,
    );
    Ok(())
}

/// A `forwarded` parameter value: bare when it is a token, quoted otherwise
fn forwarded_value(value: &str) -> String {
    let is_token = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c));

    if is_token {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// `host[:port]` of a target URL, port only when not the scheme default
fn target_authority(target: &Url) -> Option<String> {
    let host = target.host_str()?;
    Some(match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Serves requests against whatever snapshot is published when each request starts
pub struct ProxyEngine {
    snapshot: SharedSnapshot,
    tls: TlsConnector,
}

impl ProxyEngine {
    pub fn new(snapshot: SharedSnapshot) -> Self {
        Self {
            snapshot,
            tls: tls::backend_connector(),
        }
    }

    /// Serve HTTP/1.1 on an accepted (and, for HTTPS, already handshaken) connection
    pub async fn serve_connection<I>(
        self: Arc<Self>,
        io: I,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<(), hyper::Error>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(io);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let engine = self.clone();
                    async move { engine.handle_request(req, remote_addr, scheme).await }
                }),
            )
            .await
    }

    /// Handle one request. Never fails: errors become status responses.
    pub async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>, Infallible> {
        // Held for the whole request, even across a reload
        let snapshot = self.snapshot.load_full();

        debug!("{} {} {} from {}", scheme, req.method(), req.uri(), remote_addr);

        let response = match dispatch(&snapshot.routes, &req, scheme) {
            Dispatch::NotFound => {
                debug!("No entry for {:?}", request_host(&req));
                status_response(StatusCode::NOT_FOUND)
            }
            Dispatch::Redirect(location) => redirect_response(StatusCode::FOUND, &location),
            Dispatch::UpgradeToHttps(location) => {
                redirect_response(StatusCode::MOVED_PERMANENTLY, &location)
            }
            Dispatch::Preflight(headers) => preflight_response(headers),
            Dispatch::Forward(entry) => {
                match self.forward(req, &entry, remote_addr, scheme).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!("Proxy error for {}: {}", entry.host_key(), e);
                        status_response(e.status())
                    }
                }
            }
        };

        Ok(response)
    }

    /// Stream the request to the entry's target and the response back
    async fn forward(
        &self,
        req: Request<Incoming>,
        entry: &ProxyEntry,
        remote_addr: SocketAddr,
        scheme: Scheme,
    ) -> Result<Response<ProxyBody>, UpstreamError> {
        let target = entry
            .target()
            .ok_or_else(|| UpstreamError::InvalidTarget(entry.host_key()))?;
        let authority = target_authority(target)
            .ok_or_else(|| UpstreamError::InvalidTarget(target.to_string()))?;
        let host = target.host_str().unwrap_or_default().to_string();
        let port = target.port_or_known_default().unwrap_or(80);

        let original_host = request_host(&req).unwrap_or_default();
        let simple_cors = entry.cors()
            && req.method() != Method::OPTIONS
            && req.headers().contains_key(ORIGIN);
        let simple_cors = simple_cors.then(|| cors_headers(req.headers()));

        let outbound = build_outbound(req, &authority, &original_host, remote_addr, scheme)?;

        debug!("Proxying {} {} to {}", outbound.method(), outbound.uri(), target);

        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr).await.map_err(|source| {
            if source.kind() == io::ErrorKind::ConnectionRefused {
                UpstreamError::Refused { addr: addr.clone() }
            } else {
                UpstreamError::Connect { addr: addr.clone(), source }
            }
        })?;

        let response = if target.scheme() == "https" {
            let name = host.trim_start_matches('[').trim_end_matches(']');
            let server_name = ServerName::try_from(name)
                .map_err(|e| UpstreamError::InvalidTarget(format!("{}: {}", host, e)))?
                .to_owned();
            let stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|source| UpstreamError::Tls { host: host.clone(), source })?;
            send(stream, outbound).await?
        } else {
            send(stream, outbound).await?
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_headers(&mut parts.headers);
        if let Some(cors) = simple_cors {
            parts.headers.extend(cors);
        }

        // Headers are flushed once this is returned; later failures only abort the stream
        let host_key = entry.host_key();
        let body = body
            .map_err(move |e| {
                error!("Backend stream for {} aborted: {}", host_key, e);
                e
            })
            .boxed();

        Ok(Response::from_parts(parts, body))
    }
}

fn build_outbound(
    req: Request<Incoming>,
    target_authority: &str,
    original_host: &str,
    remote_addr: SocketAddr,
    scheme: Scheme,
) -> Result<Request<Incoming>, UpstreamError> {
    let (mut parts, body) = req.into_parts();

    let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    parts.uri = Uri::from_str(path).map_err(hyper::http::Error::from)?;
    parts.version = Version::HTTP_11;

    strip_hop_headers(&mut parts.headers);
    set_forwarding_headers(
        &mut parts.headers,
        target_authority,
        original_host,
        remote_addr.ip(),
        scheme,
    )
    .map_err(hyper::http::Error::from)?;

    Ok(Request::from_parts(parts, body))
}

async fn send<I>(io: I, request: Request<Incoming>) -> Result<Response<Incoming>, UpstreamError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Backend connection error: {}", e);
        }
    });

    Ok(sender.send_request(request).await?)
}

/// Bare status response with an empty body
fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

fn redirect_response(status: StatusCode, location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = status_response(status);
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(e) => {
            error!("Invalid redirect location {:?}: {}", location, e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn preflight_response(cors: HeaderMap) -> Response<ProxyBody> {
    let mut response = status_response(StatusCode::NO_CONTENT);
    response.headers_mut().extend(cors);
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    response
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
