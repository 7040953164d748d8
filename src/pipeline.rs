//! Proxy request pipeline: inbound request for a virtual host -> outbound
//! request against the leased local port.

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::host::Host;
use crate::pool::{ConnectionPool, ProxyBody};
use crate::registry::HostRegistry;
use crate::rewrite::{backend_base, is_hop_by_hop, rewrite_url_from_request, BACKEND_HOST};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Request, Response, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// A response from a leased port, with the target it was fetched from
pub struct ProxiedResponse {
    /// `http://localhost:<port>/` of the lease that served the request
    pub target: Uri,
    pub response: Response<Incoming>,
}

impl ProxiedResponse {
    /// Target base without the trailing slash, for redirect rewriting
    pub fn backend_base(&self) -> String {
        let target = self.target.to_string();
        target.trim_end_matches('/').to_string()
    }
}

pub struct ProxyPipeline {
    registry: Arc<HostRegistry>,
    settings: ProxyConfig,
    pool: Arc<ConnectionPool>,
}

impl ProxyPipeline {
    pub fn new(registry: Arc<HostRegistry>, settings: ProxyConfig, pool: Arc<ConnectionPool>) -> Self {
        Self {
            registry,
            settings,
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    fn resolve<B>(&self, req: &Request<B>) -> Option<Arc<Host>> {
        let host_header = req.headers().get(HOST)?.to_str().ok()?;
        self.registry.resolve(host_header)
    }

    /// `http://localhost:<port>/` for the lease named by the Host header
    pub fn target_location<B>(&self, req: &Request<B>) -> Option<Uri> {
        let host = self.resolve(req)?;
        target_uri(host.port())
    }

    /// Forward `req` to the leased port named by its Host header.
    ///
    /// `Ok(None)` means no live lease matches (the caller answers 404).
    /// Transport failures are returned as errors; the response body is left
    /// for the caller to relay or drain.
    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Result<Option<ProxiedResponse>, ProxyError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let Some(host) = self.resolve(&req) else {
            return Ok(None);
        };
        let Some(target) = target_uri(host.port()) else {
            return Ok(None);
        };

        let Some(outbound) = self.build_outbound_request(req, host.port(), client_addr)? else {
            return Ok(None);
        };

        debug!(
            name = host.name(),
            port = host.port(),
            method = %outbound.method(),
            uri = %outbound.uri(),
            "Forwarding request"
        );

        match self.pool.send_request(outbound).await {
            Ok(response) => Ok(Some(ProxiedResponse { target, response })),
            Err(e) => {
                warn!(name = host.name(), port = host.port(), error = %e, "Failed to forward request");
                Err(e)
            }
        }
    }

    /// Build the outbound request for a leased port.
    ///
    /// Returns `Ok(None)` if the rewritten URI is not a valid URI.
    pub fn build_outbound_request<B>(
        &self,
        req: Request<B>,
        port: u16,
        client_addr: SocketAddr,
    ) -> Result<Option<Request<ProxyBody>>, ProxyError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let (parts, body) = req.into_parts();

        let raw = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let url = rewrite_url_from_request(port, raw, self.settings.forward_fragment);
        let Ok(uri) = url.parse::<Uri>() else {
            debug!(url = %url, "Rewritten URI is invalid");
            return Ok(None);
        };

        // Content-Length or Transfer-Encoding signals a message body
        let has_body = parts.headers.contains_key(CONTENT_LENGTH) || parts.headers.contains_key(TRANSFER_ENCODING);
        let body: ProxyBody = if has_body {
            body.boxed()
        } else {
            Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
        };

        let mut headers = copy_request_headers(&parts.headers, port);
        if self.settings.forward_client_ip {
            set_forwarded_for(&mut headers, &parts.headers, client_addr);
        }

        let mut outbound = Request::builder().method(parts.method).uri(uri).body(body)?;
        *outbound.headers_mut() = headers;
        Ok(Some(outbound))
    }
}

fn target_uri(port: u16) -> Option<Uri> {
    format!("{}/", backend_base(port)).parse().ok()
}

/// Copy inbound headers, dropping hop-by-hop headers and Content-Length and
/// pointing Host at the leased port.
fn copy_request_headers(inbound: &HeaderMap, port: u16) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());

    for (name, value) in inbound.iter() {
        if name == CONTENT_LENGTH || name == HOST || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(value) = HeaderValue::from_str(&format!("{}:{}", BACKEND_HOST, port)) {
        headers.insert(HOST, value);
    }
    headers
}

/// Append the client address to any existing X-Forwarded-For value
fn set_forwarded_for(headers: &mut HeaderMap, inbound: &HeaderMap, client_addr: SocketAddr) {
    let client_ip = client_addr.ip().to_string();
    let existing: Vec<&str> = inbound
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if existing.is_empty() {
        client_ip
    } else {
        format!("{}, {}", existing.join(", "), client_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
