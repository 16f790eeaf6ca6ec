use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use tokio::{net::TcpListener, sync::oneshot};
use trafficreplay::{
    config::{Config, LockConfig, LogNamingConfig, ProxyConfig},
    engine::TrafficReplay,
    intercept::{NoNetwork, RouteTable, Upstream},
    mode::Mode,
    proxy,
    store::TestIdentity,
    upstream::HttpUpstream,
};

type TestClient = Client<HttpConnector, Full<Bytes>>;

fn client() -> TestClient {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    Client::builder(TokioExecutor::new()).build(connector)
}

fn config(dir: &std::path::Path) -> Config {
    Config {
        logs: LogNamingConfig {
            dir: dir.to_path_buf(),
            ..LogNamingConfig::default()
        },
        lock: LockConfig {
            attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..Config::default()
    }
}

fn proxy_config(upstream: &str) -> ProxyConfig {
    ProxyConfig {
        listen: "127.0.0.1:0".parse().expect("listen addr should parse"),
        upstream: upstream.to_owned(),
    }
}

fn test_identity() -> TestIdentity {
    TestIdentity::new("proxy::greets", "proxy greets").with_file("tests/proxy_roundtrip.rs")
}

async fn send(
    client: &TestClient,
    proxy_addr: SocketAddr,
    method: Method,
    path: &str,
    body: &'static [u8],
) -> (StatusCode, hyper::HeaderMap, Bytes) {
    let uri: Uri = format!("http://{proxy_addr}{path}")
        .parse()
        .expect("proxy uri should parse");
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONNECTION, "x-hop")
        .header("x-hop", "secret")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from_static(body)))
        .expect("request should build");
    let res = client.request(req).await.expect("proxy should answer");
    let status = res.status();
    let headers = res.headers().clone();
    let body = res
        .into_body()
        .collect()
        .await
        .expect("response body should be readable")
        .to_bytes();
    (status, headers, body)
}

/// Upstream that answers every request with a per-call sequence number and
/// reports which request headers it saw.
async fn spawn_upstream() -> (SocketAddr, Arc<AtomicUsize>, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("upstream should bind");
    let addr = listener.local_addr().expect("upstream addr");
    let hits = Arc::new(AtomicUsize::new(0));
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let counter = Arc::clone(&counter);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            let counter = Arc::clone(&counter);
                            async move {
                                let hit = counter.fetch_add(1, Ordering::SeqCst) + 1;
                                let saw_hop = req.headers().contains_key("x-hop");
                                let path = req.uri().path().to_owned();
                                let method = req.method().clone();
                                let body = req.into_body().collect().await.unwrap().to_bytes();

                                let payload = format!(
                                    r#"{{"hit":{hit},"method":"{method}","path":"{path}","saw_hop":{saw_hop},"echo":{}}}"#,
                                    if body.is_empty() { "null".to_owned() } else { String::from_utf8_lossy(&body).into_owned() }
                                );
                                let mut res = Response::new(Full::new(Bytes::from(payload)));
                                *res.status_mut() = StatusCode::CREATED;
                                res.headers_mut().insert(
                                    header::CONTENT_TYPE,
                                    HeaderValue::from_static("application/json"),
                                );
                                res.headers_mut().insert(
                                    header::CONNECTION,
                                    HeaderValue::from_static("x-resp-hop"),
                                );
                                res.headers_mut()
                                    .insert("x-resp-hop", HeaderValue::from_static("yes"));
                                res.headers_mut()
                                    .insert("x-resp-end", HeaderValue::from_static("ok"));
                                Ok::<_, hyper::Error>(res)
                            }
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        let _ = builder.serve_connection(io, service).await;
                    });
                }
            }
        }
    });

    (addr, hits, shutdown_tx)
}

fn live_upstream() -> Arc<dyn Upstream> {
    Arc::new(HttpUpstream::with_root_store(rustls::RootCertStore::empty()).expect("upstream client should build"))
}

#[tokio::test]
async fn proxy_records_live_traffic_then_replays_it_offline() {
    let (upstream_addr, hits, upstream_shutdown) = spawn_upstream().await;
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let upstream_base = format!("http://{upstream_addr}/api");
    let client = client();

    let mut recording =
        TrafficReplay::with_mode_flag(config(dir.path()), test_identity(), Some("record"))
            .expect("engine should build");
    let mut routes = RouteTable::new();
    recording.setup(&mut routes).await.expect("setup should succeed");
    let proxy = proxy::serve(&proxy_config(&upstream_base), routes.clone(), live_upstream())
        .await
        .expect("proxy should start");

    let (status, headers, body) =
        send(&client, proxy.listen_addr, Method::POST, "/greet?lang=en", br#"{"name":"ada"}"#).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(headers.get("x-resp-end").unwrap(), "ok");
    assert!(headers.get("x-resp-hop").is_none());
    assert!(headers.get(header::CONNECTION).is_none());
    let recorded: serde_json::Value = serde_json::from_slice(&body).expect("body should be JSON");
    assert_eq!(recorded["hit"], 1);
    assert_eq!(recorded["path"], "/api/greet");
    assert_eq!(recorded["saw_hop"], false);
    assert_eq!(recorded["echo"]["name"], "ada");

    proxy.shutdown().await;
    recording.cleanup().await.expect("cleanup should succeed");
    assert_eq!(recording.stats().await.entry_count, Some(1));

    let _ = upstream_shutdown.send(());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let mut playback =
        TrafficReplay::with_mode_flag(config(dir.path()), test_identity(), Some("playback"))
            .expect("engine should build");
    let mut routes = RouteTable::new();
    playback.setup(&mut routes).await.expect("setup should succeed");
    assert_eq!(playback.mode(), Mode::Playback);
    let proxy = proxy::serve(&proxy_config(&upstream_base), routes.clone(), Arc::new(NoNetwork))
        .await
        .expect("proxy should start");

    let (status, headers, replayed) =
        send(&client, proxy.listen_addr, Method::POST, "/greet?lang=en", b"").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(replayed, body);
    assert_eq!(headers.get("x-resp-end").unwrap(), "ok");
    assert_eq!(
        headers.get(header::CONTENT_LENGTH).unwrap(),
        body.len().to_string().as_str()
    );

    let (status, _, message) =
        send(&client, proxy.listen_addr, Method::GET, "/never-recorded", b"").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(
        String::from_utf8_lossy(&message).contains("no recorded exchange"),
        "unexpected body: {}",
        String::from_utf8_lossy(&message)
    );

    proxy.shutdown().await;
    playback.cleanup().await.expect("cleanup should succeed");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proxy_without_routes_forwards_to_upstream() {
    let (upstream_addr, hits, upstream_shutdown) = spawn_upstream().await;
    let client = client();
    let proxy = proxy::serve(
        &proxy_config(&format!("http://{upstream_addr}")),
        RouteTable::new(),
        live_upstream(),
    )
    .await
    .expect("proxy should start");

    let (status, _, body) = send(&client, proxy.listen_addr, Method::GET, "/plain", b"").await;
    assert_eq!(status, StatusCode::CREATED);
    let body: serde_json::Value = serde_json::from_slice(&body).expect("body should be JSON");
    assert_eq!(body["path"], "/plain");
    assert_eq!(body["method"], "GET");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    proxy.shutdown().await;
    let _ = upstream_shutdown.send(());
}

#[tokio::test]
async fn proxy_rejects_non_http_upstreams() {
    let err = proxy::serve(
        &proxy_config("ftp://files.example.com"),
        RouteTable::new(),
        Arc::new(NoNetwork),
    )
    .await
    .unwrap_err();
    assert!(
        err.to_string().contains("must be an absolute http(s) URL"),
        "unexpected error: {err}"
    );
}
