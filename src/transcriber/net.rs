//! Phase-timed HTTP client.
//!
//! Every provider call runs through [`TracedClient`], which owns its
//! connections outright (hyper's client conn API over tokio-rustls) so each
//! phase of a request is separately measurable: pool checkout, DNS lookup,
//! TCP connect, TLS handshake, request headers, request body, time to first
//! byte, and body download. reqwest stays in the tree for plain calls; it
//! cannot expose these hooks.
//!
//! The response body is buffered in full before returning, so `download` is
//! a real measurement and connections go back to the pool clean.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, LOCATION};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::TranscribeError;

const MAX_IDLE_PER_HOST: usize = 4;
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_REDIRECTS: usize = 5;

/// Elapsed durations for every phase of one request.
///
/// `conn_reused == true` implies dns, tcp, and tls are zero, and the parts
/// sum to the total within measurement noise.
#[derive(Debug, Clone, Default)]
pub struct NetMetrics {
    pub conn_wait: Duration,
    pub dns: Duration,
    pub tcp: Duration,
    pub tls: Duration,
    pub req_headers: Duration,
    pub req_body: Duration,
    pub ttfb: Duration,
    pub download: Duration,
    pub total: Duration,
    pub conn_reused: bool,
    pub tls_protocol: String,
}

impl NetMetrics {
    pub fn sum(&self) -> Duration {
        self.conn_wait
            + self.dns
            + self.tcp
            + self.tls
            + self.req_headers
            + self.req_body
            + self.ttfb
            + self.download
    }
}

pub struct TracedResponse {
    pub body: Bytes,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub metrics: NetMetrics,
}

#[derive(Default)]
struct BodyTimes {
    first_poll: Option<Instant>,
    last_poll: Option<Instant>,
}

/// Request body wrapper recording when hyper starts and finishes pulling
/// frames: headers are already on the wire by the first poll, and the last
/// poll marks end of body, the two instants that split req_headers /
/// req_body / ttfb.
struct TimedBody {
    inner: Full<Bytes>,
    times: Arc<Mutex<BodyTimes>>,
}

impl Body for TimedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        let this = self.get_mut();
        {
            let mut times = this.times.lock().unwrap();
            let now = Instant::now();
            if times.first_poll.is_none() {
                times.first_poll = Some(now);
            }
            times.last_poll = Some(now);
        }
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

enum PooledSender {
    H1(hyper::client::conn::http1::SendRequest<TimedBody>),
    H2(hyper::client::conn::http2::SendRequest<TimedBody>),
}

impl PooledSender {
    fn is_closed(&self) -> bool {
        match self {
            PooledSender::H1(s) => s.is_closed(),
            PooledSender::H2(s) => s.is_closed(),
        }
    }

    async fn ready(&mut self) -> Result<(), hyper::Error> {
        match self {
            PooledSender::H1(s) => s.ready().await,
            PooledSender::H2(s) => s.ready().await,
        }
    }
}

struct IdleConn {
    sender: PooledSender,
    tls_protocol: String,
    idle_since: Instant,
}

pub struct TracedClient {
    pool: Mutex<HashMap<String, Vec<IdleConn>>>,
    tls: TlsConnector,
    warm_url: String,
    last_tls: Arc<Mutex<Option<Duration>>>,
}

impl TracedClient {
    /// `api_url` seeds the origin the warm HEAD goes to.
    pub fn new(api_url: &str) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut cfg = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let warm_url = match api_url.parse::<Uri>() {
            Ok(uri) => match (uri.scheme_str(), uri.host()) {
                (Some(scheme), Some(host)) => format!("{scheme}://{host}/"),
                _ => "/".to_string(),
            },
            Err(_) => "/".to_string(),
        };

        Self {
            pool: Mutex::new(HashMap::new()),
            tls: TlsConnector::from(Arc::new(cfg)),
            warm_url,
            last_tls: Arc::new(Mutex::new(None)),
        }
    }

    /// TLS handshake latency of the most recent fresh connection; feeds the
    /// adaptive encoder's size threshold.
    pub fn last_tls_handle(&self) -> Arc<Mutex<Option<Duration>>> {
        self.last_tls.clone()
    }

    /// Prime a pooled connection with a HEAD against the API origin.
    pub async fn warm(&self) {
        let url = self.warm_url.clone();
        match self
            .send(Method::HEAD, &url, HeaderMap::new(), Bytes::new())
            .await
        {
            Ok(resp) => debug!(
                "warm {} -> {} (tls {}ms)",
                url,
                resp.status,
                resp.metrics.tls.as_millis()
            ),
            Err(e) => debug!("warm {} failed: {}", url, e),
        }
    }

    /// Issue one request. Redirects are followed; non-2xx statuses come back
    /// as a normal response for the caller to classify.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<TracedResponse, TranscribeError> {
        match tokio::time::timeout(REQUEST_TIMEOUT, self.send_inner(method, url, headers, body))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(TranscribeError::Timeout),
        }
    }

    async fn send_inner(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<TracedResponse, TranscribeError> {
        let mut uri: Uri = url
            .parse()
            .map_err(|e| TranscribeError::Connect(format!("parsing url {url:?}: {e}")))?;

        for _ in 0..=MAX_REDIRECTS {
            let resp = self
                .round_trip(method.clone(), &uri, headers.clone(), body.clone())
                .await?;

            if resp.status.is_redirection() {
                if let Some(location) = resp.headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                    uri = resolve_redirect(&uri, location)?;
                    debug!("following redirect to {}", uri);
                    continue;
                }
            }
            return Ok(resp);
        }
        Err(TranscribeError::Connect(format!(
            "too many redirects for {url}"
        )))
    }

    async fn round_trip(
        &self,
        method: Method,
        uri: &Uri,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<TracedResponse, TranscribeError> {
        let host = uri
            .host()
            .ok_or_else(|| TranscribeError::Connect(format!("no host in {uri}")))?
            .to_string();
        if uri.scheme_str() != Some("https") {
            return Err(TranscribeError::Connect(format!(
                "unsupported scheme in {uri} (https only)"
            )));
        }
        let port = uri.port_u16().unwrap_or(443);
        let pool_key = format!("{host}:{port}");

        let total_start = Instant::now();
        let mut metrics = NetMetrics::default();

        let checkout_start = Instant::now();
        let (mut sender, tls_protocol, reused) = match self.checkout(&pool_key) {
            Some(conn) => (conn.sender, conn.tls_protocol, true),
            None => {
                let (sender, proto) = self.dial(&host, port, &mut metrics).await?;
                (sender, proto, false)
            }
        };
        metrics.conn_wait = checkout_start
            .elapsed()
            .saturating_sub(metrics.dns + metrics.tcp + metrics.tls);
        metrics.conn_reused = reused;
        metrics.tls_protocol = tls_protocol.clone();

        let times = Arc::new(Mutex::new(BodyTimes::default()));
        let content_length = body.len();
        let timed_body = TimedBody {
            inner: Full::new(body),
            times: times.clone(),
        };

        // http/1 wants origin-form paths plus a Host header; h2 carries the
        // authority in the URI itself.
        let request_uri = match sender {
            PooledSender::H1(_) => {
                let host_value = HeaderValue::from_str(&pool_key)
                    .map_err(|e| TranscribeError::Connect(format!("host header: {e}")))?;
                headers.insert(HOST, host_value);
                Uri::try_from(
                    uri.path_and_query()
                        .map(|pq| pq.as_str())
                        .unwrap_or("/")
                        .to_string(),
                )
                .map_err(|e| TranscribeError::Connect(format!("request path: {e}")))?
            }
            PooledSender::H2(_) => uri.clone(),
        };
        if content_length > 0 {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
        }

        let mut builder = Request::builder().method(method).uri(request_uri);
        if let Some(h) = builder.headers_mut() {
            h.extend(headers);
        }
        let request = builder
            .body(timed_body)
            .map_err(|e| TranscribeError::Connect(format!("building request: {e}")))?;

        let send_start = Instant::now();
        sender
            .ready()
            .await
            .map_err(|e| TranscribeError::Connect(format!("connection not ready: {e}")))?;
        let response = match &mut sender {
            PooledSender::H1(s) => s.send_request(request).await,
            PooledSender::H2(s) => s.send_request(request).await,
        }
        .map_err(|e| TranscribeError::Connect(format!("sending request: {e}")))?;
        let headers_at = Instant::now();

        {
            let t = times.lock().unwrap();
            let first = t.first_poll.unwrap_or(send_start);
            let last = t.last_poll.unwrap_or(first);
            metrics.req_headers = first.duration_since(send_start);
            metrics.req_body = last.duration_since(first);
            metrics.ttfb = headers_at.duration_since(last);
        }

        let (parts, incoming) = response.into_parts();
        let download_start = Instant::now();
        let collected = incoming
            .collect()
            .await
            .map_err(|e| TranscribeError::Connect(format!("reading response body: {e}")))?;
        metrics.download = download_start.elapsed();
        metrics.total = total_start.elapsed();

        self.checkin(pool_key, sender, tls_protocol);

        Ok(TracedResponse {
            body: collected.to_bytes(),
            status: parts.status,
            headers: parts.headers,
            metrics,
        })
    }

    async fn dial(
        &self,
        host: &str,
        port: u16,
        metrics: &mut NetMetrics,
    ) -> Result<(PooledSender, String), TranscribeError> {
        let dns_start = Instant::now();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TranscribeError::Connect(format!("resolving {host}: {e}")))?
            .collect();
        metrics.dns = dns_start.elapsed();
        let addr = *addrs
            .first()
            .ok_or_else(|| TranscribeError::Connect(format!("no addresses for {host}")))?;

        let tcp_start = Instant::now();
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| TranscribeError::Connect(format!("connecting {addr}: {e}")))?;
        let _ = tcp.set_nodelay(true);
        metrics.tcp = tcp_start.elapsed();

        let tls_start = Instant::now();
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| TranscribeError::Tls(format!("server name {host}: {e}")))?;
        let tls_stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| TranscribeError::Tls(format!("handshake with {host}: {e}")))?;
        metrics.tls = tls_start.elapsed();
        *self.last_tls.lock().unwrap() = Some(metrics.tls);

        let protocol = {
            let (_, conn) = tls_stream.get_ref();
            conn.alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_else(|| "http/1.1".to_string())
        };

        let io = TokioIo::new(tls_stream);
        let sender = if protocol == "h2" {
            let (sender, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), io)
                .await
                .map_err(|e| TranscribeError::Connect(format!("h2 handshake: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("h2 connection ended: {}", e);
                }
            });
            PooledSender::H2(sender)
        } else {
            let (sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| TranscribeError::Connect(format!("http1 handshake: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("http1 connection ended: {}", e);
                }
            });
            PooledSender::H1(sender)
        };
        Ok((sender, protocol))
    }

    fn checkout(&self, key: &str) -> Option<IdleConn> {
        let mut pool = self.pool.lock().unwrap();
        let list = pool.get_mut(key)?;
        while let Some(conn) = list.pop() {
            if conn.idle_since.elapsed() < IDLE_TIMEOUT && !conn.sender.is_closed() {
                return Some(conn);
            }
        }
        None
    }

    fn checkin(&self, key: String, sender: PooledSender, tls_protocol: String) {
        if sender.is_closed() {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        let list = pool.entry(key).or_default();
        list.retain(|c| c.idle_since.elapsed() < IDLE_TIMEOUT);
        if list.len() < MAX_IDLE_PER_HOST {
            list.push(IdleConn {
                sender,
                tls_protocol,
                idle_since: Instant::now(),
            });
        } else {
            warn!("connection pool full, dropping connection");
        }
    }
}

fn resolve_redirect(base: &Uri, location: &str) -> Result<Uri, TranscribeError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location
            .parse()
            .map_err(|e| TranscribeError::Connect(format!("redirect location: {e}")));
    }
    // Relative redirect: keep scheme and authority.
    let scheme = base.scheme_str().unwrap_or("https");
    let authority = base
        .authority()
        .map(|a| a.as_str())
        .ok_or_else(|| TranscribeError::Connect("redirect from authority-less uri".into()))?;
    let path = if location.starts_with('/') {
        location.to_string()
    } else {
        format!("/{location}")
    };
    format!("{scheme}://{authority}{path}")
        .parse()
        .map_err(|e| TranscribeError::Connect(format!("redirect location: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_parts_sum_to_total_within_noise() {
        let m = NetMetrics {
            conn_wait: Duration::from_millis(1),
            dns: Duration::from_millis(12),
            tcp: Duration::from_millis(20),
            tls: Duration::from_millis(45),
            req_headers: Duration::from_millis(1),
            req_body: Duration::from_millis(30),
            ttfb: Duration::from_millis(180),
            download: Duration::from_millis(9),
            total: Duration::from_millis(300),
            conn_reused: false,
            tls_protocol: "h2".into(),
        };
        let diff = m.total.abs_diff(m.sum());
        assert!(diff <= Duration::from_millis(5), "diff {diff:?}");
    }

    #[test]
    fn reused_connection_has_no_handshake_phases() {
        let m = NetMetrics {
            conn_reused: true,
            ..NetMetrics::default()
        };
        assert_eq!(m.dns, Duration::ZERO);
        assert_eq!(m.tcp, Duration::ZERO);
        assert_eq!(m.tls, Duration::ZERO);
    }

    #[test]
    fn redirects_resolve_relative_and_absolute() {
        let base: Uri = "https://api.example.com/v1/listen?model=nova-3"
            .parse()
            .expect("base uri");
        let abs = resolve_redirect(&base, "https://other.example.com/x").expect("absolute");
        assert_eq!(abs.host(), Some("other.example.com"));

        let rel = resolve_redirect(&base, "/v2/listen").expect("relative");
        assert_eq!(rel.host(), Some("api.example.com"));
        assert_eq!(rel.path(), "/v2/listen");
    }

    #[test]
    fn warm_url_is_origin_only() {
        let client = TracedClient::new("https://api.groq.com/openai/v1/audio/transcriptions");
        assert_eq!(client.warm_url, "https://api.groq.com/");
    }
}
