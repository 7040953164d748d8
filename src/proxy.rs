//! HTTP front end: accepts requests for virtual hosts, runs them through the
//! pipeline and relays the backend response to the client.

use crate::error::{json_error_response, ProxyError, ProxyErrorCode};
use crate::pipeline::ProxyPipeline;
use crate::pool::ProxyBody;
use crate::rewrite::{is_hop_by_hop, rewrite_url_from_response};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The public-facing reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    pipeline: Arc<ProxyPipeline>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, pipeline: Arc<ProxyPipeline>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            pipeline,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pipeline = Arc::clone(&self.pipeline);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, pipeline).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, pipeline: Arc<ProxyPipeline>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let pipeline = Arc::clone(&pipeline);
        async move { handle_request(req, pipeline, addr).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    pipeline: Arc<ProxyPipeline>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let frontend = frontend_base(&req);
    debug!(method = %req.method(), uri = %req.uri(), client = %client_addr, "Incoming request");

    match pipeline.handle(req, client_addr).await {
        Ok(Some(proxied)) => {
            let backend = proxied.backend_base();
            match relay_response(proxied.response, &backend, frontend.as_deref()) {
                Ok(response) => Ok(response),
                Err(e) => {
                    warn!(backend = %backend, error = %e, "Invalid response from backend");
                    Ok(json_error_response(e.code(), "Invalid response from local service"))
                }
            }
        }
        Ok(None) => Ok(json_error_response(
            ProxyErrorCode::UnknownHost,
            "No host is registered under this name",
        )),
        Err(e) => Ok(json_error_response(e.code(), "Failed to reach local service")),
    }
}

/// `http://<Host header>` of the inbound request
fn frontend_base<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|host| format!("http://{}", host))
}

/// Turn a backend response into the client-facing one.
///
/// - 300..=303: requires `Location`, rebased onto the front end; body dropped.
/// - 304: passed through with `Content-Length: 0` and no body.
/// - anything else: hop-by-hop headers stripped, body streamed as is.
///
/// Bodies that are not relayed are drained in the background so the pooled
/// connection can be reused.
pub fn relay_response<B>(
    response: Response<B>,
    backend_base: &str,
    frontend_base: Option<&str>,
) -> Result<Response<ProxyBody>, ProxyError>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
{
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    let status = parts.status;
    if (300..304).contains(&status.as_u16()) {
        drain(body);
        if !parts.headers.contains_key(LOCATION) {
            return Err(ProxyError::MissingLocation(status.as_u16()));
        }
        rewrite_location(&mut parts.headers, backend_base, frontend_base);
        parts.headers.remove(CONTENT_LENGTH);
        return Ok(Response::from_parts(parts, empty_body()));
    }

    if status == StatusCode::NOT_MODIFIED {
        drain(body);
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        return Ok(Response::from_parts(parts, empty_body()));
    }

    rewrite_location(&mut parts.headers, backend_base, frontend_base);
    Ok(Response::from_parts(parts, body.boxed()))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<HeaderName> = headers.keys().filter(|name| is_hop_by_hop(name)).cloned().collect();
    for name in hop_by_hop {
        headers.remove(&name);
    }
}

fn rewrite_location(headers: &mut HeaderMap, backend_base: &str, frontend_base: Option<&str>) {
    let Some(frontend_base) = frontend_base else {
        return;
    };
    let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };

    let rewritten = rewrite_url_from_response(location, backend_base, frontend_base);
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(LOCATION, value);
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn drain<B>(body: B)
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
{
    tokio::spawn(async move {
        let _ = body.collect().await;
    });
}
