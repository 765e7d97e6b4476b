//! Outbound call executor seam
//!
//! Shards decide *which* proxy serves a request; the `Outbound` implementation
//! performs the actual call through it. The default implementation speaks
//! plain HTTP/1.1 to the upstream proxy in absolute form.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, Uri};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{CarouselError, Result};
use crate::models::ProxyId;

/// A buffered, cloneable request: the router may replay it against several
/// proxies before one answers.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    /// Convenience constructor for a bodyless GET.
    pub fn get(uri: &str) -> Result<Self> {
        let uri: Uri = uri
            .parse()
            .map_err(|e| CarouselError::InvalidRequest(format!("bad URI: {}", e)))?;
        Ok(Self::new(Method::GET, uri, HeaderMap::new(), Bytes::new()))
    }

    /// Buffer a hyper request into a replayable form.
    pub async fn from_request(req: Request<Full<Bytes>>) -> Result<Self> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };
        Ok(Self::new(parts.method, parts.uri, parts.headers, body))
    }
}

/// Performs the outbound call through a chosen proxy.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn call(&self, proxy: ProxyId, request: &ProxyRequest) -> Result<Response<Full<Bytes>>>;
}

/// Default executor: dials the proxy over TCP and forwards the request in
/// absolute form over HTTP/1.1.
pub struct HyperOutbound {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HyperOutbound {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl Default for HyperOutbound {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(30))
    }
}

#[async_trait]
impl Outbound for HyperOutbound {
    async fn call(&self, proxy: ProxyId, request: &ProxyRequest) -> Result<Response<Full<Bytes>>> {
        if request.uri.scheme().is_none() {
            return Err(CarouselError::InvalidRequest(
                "outbound request URI must be absolute".into(),
            ));
        }

        // Connect to proxy (address format is "ip:port")
        let stream = timeout(self.connect_timeout, TcpStream::connect(proxy.addr()))
            .await
            .map_err(|_| CarouselError::Timeout)?
            .map_err(|e| CarouselError::ProxyConnectionFailed(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| CarouselError::ProxyConnectionFailed(format!("handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("outbound connection ended: {}", e);
            }
        });

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.uri.clone());

        // Copy headers, except hop-by-hop headers
        for (name, value) in &request.headers {
            if !is_hop_by_hop_header(name.as_str()) {
                builder = builder.header(name, value);
            }
        }

        let upstream = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| CarouselError::InvalidRequest(format!("failed to build request: {}", e)))?;

        let response = timeout(self.request_timeout, sender.send_request(upstream))
            .await
            .map_err(|_| CarouselError::RequestTimeout)?
            .map_err(|e| CarouselError::ProxyConnectionFailed(format!("request failed: {}", e)))?;

        let (parts, body) = response.into_parts();
        let body = timeout(self.request_timeout, body.collect())
            .await
            .map_err(|_| CarouselError::RequestTimeout)?
            .map_err(|e| {
                CarouselError::ProxyConnectionFailed(format!("failed to read response: {}", e))
            })?
            .to_bytes();

        Ok(Response::from_parts(parts, Full::new(body)))
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
