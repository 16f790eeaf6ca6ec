//! Local reverse proxy adapter.
//!
//! Point a test's HTTP client at [`ProxyHandle::listen_addr`]; every request
//! is rewritten onto the configured upstream origin and run through a
//! [`RouteTable`], so whatever engine registered routes on that table
//! records or replays it.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{HeaderName, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};
use url::Url;

use crate::{
    config::ProxyConfig,
    intercept::{InterceptedRequest, RouteTable, Upstream, strip_hop_by_hop},
    upstream::header_pairs,
};

#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ProxyState {
    upstream_base: Url,
    routes: RouteTable,
    upstream: Arc<dyn Upstream>,
}

pub async fn serve(
    config: &ProxyConfig,
    routes: RouteTable,
    upstream: Arc<dyn Upstream>,
) -> anyhow::Result<ProxyHandle> {
    let upstream_base = parse_upstream_base(&config.upstream)?;
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    let listen_addr = listener.local_addr().context("get local_addr")?;
    tracing::info!(%listen_addr, upstream = %upstream_base, "proxy listening");

    let state = Arc::new(ProxyState {
        upstream_base,
        routes,
        upstream,
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

fn parse_upstream_base(raw: &str) -> anyhow::Result<Url> {
    let base = Url::parse(raw).with_context(|| format!("parse proxy upstream `{raw}`"))?;
    if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
        anyhow::bail!("proxy upstream `{raw}` must be an absolute http(s) URL");
    }
    Ok(base)
}

/// Joins the upstream base path with the request's path and query.
fn upstream_url(base: &Url, path_and_query: &str) -> Url {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{prefix}{path}"));
    url.set_query(query);
    url.set_fragment(None);
    url
}

async fn proxy_handler(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let url = upstream_url(&state.upstream_base, path_and_query);
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::debug!("failed to read request body: {err}");
            return Ok(simple_response(StatusCode::BAD_REQUEST, "failed to read request body"));
        }
    };

    let request = InterceptedRequest {
        method: parts.method,
        url,
        version: parts.version,
        headers: header_pairs(&parts.headers),
        body,
    };
    let method = request.method.clone();
    let target = request.url.clone();

    match state.routes.dispatch(request, state.upstream.as_ref()).await {
        Ok(response) => {
            let mut headers = response.headers;
            strip_hop_by_hop(&mut headers);
            headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));

            let mut out = Response::new(Full::new(response.body));
            *out.status_mut() = response.status;
            for (name, value) in &headers {
                let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) else {
                    tracing::debug!(header = %name, "skipping invalid response header");
                    continue;
                };
                out.headers_mut().append(name, value);
            }
            Ok(out)
        }
        Err(err) => {
            tracing::debug!(%method, url = %target, "proxy request failed: {err}");
            Ok(simple_response(StatusCode::BAD_GATEWAY, &err.to_string()))
        }
    }
}

fn simple_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}
