use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::intercept::{InterceptedRequest, InterceptedResponse, Upstream, strip_hop_by_hop};

type UpstreamConnector = HttpsConnector<HttpConnector>;
type HttpClient = Client<UpstreamConnector, Full<Bytes>>;

/// Live network forwarder over HTTP/1.1 and HTTP/2, TLS via rustls with the
/// platform's root certificates.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: HttpClient,
}

impl HttpUpstream {
    pub fn new() -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self::from_connector(connector))
    }

    /// Trusts only `roots`, e.g. a private test CA.
    pub fn with_root_store(roots: rustls::RootCertStore) -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self::from_connector(connector))
    }

    fn from_connector(connector: UpstreamConnector) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }
}

pub(crate) fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

/// Request headers worth forwarding. The client derives `host` and
/// `content-length` itself; the URI may have been rewritten.
fn forwardable_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut headers = headers.to_vec();
    strip_hop_by_hop(&mut headers);
    headers.retain(|(name, _)| {
        !name.eq_ignore_ascii_case("host") && !name.eq_ignore_ascii_case("content-length")
    });
    headers
}

pub(crate) fn header_pairs(headers: &hyper::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: &InterceptedRequest) -> anyhow::Result<InterceptedResponse> {
        let uri: Uri = request
            .url
            .as_str()
            .parse()
            .with_context(|| format!("parse upstream uri {}", request.url))?;

        let mut builder = Request::builder().method(request.method.clone()).uri(uri);
        for (name, value) in forwardable_headers(&request.headers) {
            builder = builder.header(name, value);
        }
        let upstream_request = builder
            .body(Full::new(request.body.clone()))
            .context("build upstream request")?;

        let response = self
            .client
            .request(upstream_request)
            .await
            .with_context(|| format!("{} {}", request.method, request.url))?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .context("read upstream response body")?
            .to_bytes();

        Ok(InterceptedResponse {
            status: parts.status,
            version: parts.version,
            headers: header_pairs(&parts.headers),
            body,
        })
    }
}
