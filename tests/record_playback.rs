use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use hyper::{Method, StatusCode};
use serde_json::{Value, json};
use trafficreplay::{
    config::{Config, LockConfig, LogNamingConfig, StatefulMockMode},
    engine::TrafficReplay,
    intercept::{
        ExchangeError, InterceptedRequest, InterceptedResponse, NoNetwork, RouteTable, Upstream,
    },
    mode::Mode,
    store::TestIdentity,
};
use url::Url;

const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0xff, 0xfe];

/// Fake backend: fixed payloads plus a counter that changes on every call.
#[derive(Default)]
struct Backend {
    counter: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl Upstream for Backend {
    async fn fetch(&self, request: &InterceptedRequest) -> anyhow::Result<InterceptedResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = match request.url.path() {
            "/logo.png" => InterceptedResponse::new(StatusCode::OK)
                .with_header("content-type", "image/png")
                .with_body(PNG_BYTES.to_vec()),
            "/counter" => {
                let value = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                InterceptedResponse::new(StatusCode::OK)
                    .with_header("content-type", "application/json")
                    .with_body(json!({ "value": value }).to_string())
            }
            "/session" => InterceptedResponse::new(StatusCode::CREATED)
                .with_header("content-type", "application/json")
                .with_header("set-cookie", "sid=abc; Path=/; HttpOnly")
                .with_header("access-control-allow-origin", "https://dev.example.com")
                .with_body(r#"{"ok":true}"#),
            "/unreachable" => anyhow::bail!("connection refused"),
            _ => InterceptedResponse::new(StatusCode::NOT_FOUND).with_body("missing"),
        };
        Ok(response)
    }
}

fn config(dir: &Path) -> Config {
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

fn test_identity(title: &str) -> TestIdentity {
    TestIdentity::new(format!("suite::{title}"), title).with_file("tests/record_playback.rs")
}

fn request(method: Method, url: &str) -> InterceptedRequest {
    InterceptedRequest::new(method, Url::parse(url).expect("request url should parse"))
}

fn body_json(response: &InterceptedResponse) -> Value {
    serde_json::from_slice(&response.body).expect("response body should be JSON")
}

async fn record(
    config: Config,
    title: &str,
    requests: Vec<InterceptedRequest>,
    backend: &Backend,
) -> Vec<Result<InterceptedResponse, ExchangeError>> {
    let mut engine = TrafficReplay::with_mode_flag(config, test_identity(title), Some("record"))
        .expect("engine should build");
    let mut table = RouteTable::new();
    engine.setup(&mut table).await.expect("record setup should succeed");

    let mut results = Vec::new();
    for request in requests {
        results.push(table.dispatch(request, backend).await);
    }
    engine.cleanup().await.expect("recording should flush");
    results
}

#[tokio::test]
async fn recorded_exchanges_replay_byte_for_byte_offline() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend = Backend::default();
    let recorded = record(
        config(dir.path()),
        "round trip",
        vec![
            request(Method::GET, "https://api.example.com/logo.png"),
            request(Method::POST, "https://api.example.com/session")
                .with_header("content-type", "application/json")
                .with_body(r#"{"user":"ada"}"#),
            request(Method::GET, "https://api.example.com/nothing-here"),
        ],
        &backend,
    )
    .await;
    assert!(recorded.iter().all(Result::is_ok));
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

    let mut engine =
        TrafficReplay::with_mode_flag(config(dir.path()), test_identity("round trip"), Some("PLAYBACK"))
            .expect("engine should build");
    let mut table = RouteTable::new();
    engine.setup(&mut table).await.expect("setup should succeed");
    assert_eq!(engine.context().mode, Mode::Playback);

    let logo = table
        .dispatch(request(Method::GET, "https://api.example.com/logo.png"), &NoNetwork)
        .await
        .expect("exchange should succeed");
    assert_eq!(logo.status, StatusCode::OK);
    assert_eq!(logo.body.as_ref(), PNG_BYTES);
    assert_eq!(logo.header("content-type"), Some("image/png"));

    let session = table
        .dispatch(request(Method::POST, "https://api.example.com/session"), &NoNetwork)
        .await
        .expect("exchange should succeed");
    assert_eq!(session.status, StatusCode::CREATED);
    assert_eq!(session.header("set-cookie"), Some("sid=abc; Path=/; HttpOnly"));
    assert_eq!(body_json(&session), json!({"ok": true}));

    let missing = table
        .dispatch(request(Method::GET, "https://api.example.com/nothing-here"), &NoNetwork)
        .await
        .expect("exchange should succeed");
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.body.as_ref(), b"missing");

    assert!(engine.status_message().starts_with("replaying 3 exchanges from"));
    engine.cleanup().await.expect("cleanup should succeed");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn repeated_requests_cycle_through_recorded_responses() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend = Backend::default();
    let counter = "https://api.example.com/counter";
    record(
        config(dir.path()),
        "cycling",
        (0..3).map(|_| request(Method::GET, counter)).collect(),
        &backend,
    )
    .await;

    let mut engine =
        TrafficReplay::with_mode_flag(config(dir.path()), test_identity("cycling"), Some("playback"))
            .expect("engine should build");
    let mut table = RouteTable::new();
    engine.setup(&mut table).await.expect("setup should succeed");

    let mut values = Vec::new();
    for _ in 0..5 {
        let response = table.dispatch(request(Method::GET, counter), &NoNetwork).await.expect("exchange should succeed");
        values.push(body_json(&response)["value"].as_u64().unwrap());
    }
    assert_eq!(values, [1, 2, 3, 1, 2]);
    engine.cleanup().await.expect("cleanup should succeed");

    // Cycling restarts for a fresh setup.
    let mut table = RouteTable::new();
    engine.setup(&mut table).await.expect("setup should succeed");
    let response = table.dispatch(request(Method::GET, counter), &NoNetwork).await.expect("exchange should succeed");
    assert_eq!(body_json(&response)["value"], json!(1));
    engine.cleanup().await.expect("cleanup should succeed");
}

#[tokio::test]
async fn failed_exchanges_are_recorded_and_replayed_as_failures() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend = Backend::default();
    let results = record(
        config(dir.path()),
        "failures",
        vec![request(Method::GET, "https://api.example.com/unreachable")],
        &backend,
    )
    .await;
    assert!(matches!(results[0], Err(ExchangeError::Aborted(_))));

    let mut engine =
        TrafficReplay::with_mode_flag(config(dir.path()), test_identity("failures"), Some("playback"))
            .expect("engine should build");
    let mut table = RouteTable::new();
    engine.setup(&mut table).await.expect("setup should succeed");
    let err = table
        .dispatch(request(Method::GET, "https://api.example.com/unreachable"), &NoNetwork)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("connection refused"), "unexpected: {err}");
    engine.cleanup().await.expect("cleanup should succeed");
}

#[tokio::test]
async fn logs_recorded_on_one_host_replay_on_another() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend = Backend::default();
    record(
        config(dir.path()),
        "remap",
        vec![request(Method::POST, "https://dev.example.com/session")],
        &backend,
    )
    .await;

    let mut replay_config = config(dir.path());
    replay_config.playback.remap.hosts.insert(
        "dev.example.com".to_owned(),
        "preview.example.com".to_owned(),
    );
    let mut engine =
        TrafficReplay::with_mode_flag(replay_config, test_identity("remap"), Some("playback"))
            .expect("engine should build");
    let mut table = RouteTable::new();
    engine.setup(&mut table).await.expect("setup should succeed");

    let response = table
        .dispatch(
            request(Method::POST, "https://preview.example.com/session")
                .with_header("origin", "https://preview.example.com"),
            &NoNetwork,
        )
        .await
        .expect("exchange should succeed");
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(
        response.header("access-control-allow-origin"),
        Some("https://preview.example.com")
    );

    // The recorded host is remapped the same way, so it matches too.
    let response = table
        .dispatch(request(Method::POST, "https://dev.example.com/session"), &NoNetwork)
        .await
        .expect("exchange should succeed");
    assert_eq!(response.status, StatusCode::CREATED);
    engine.cleanup().await.expect("cleanup should succeed");
}

#[tokio::test]
async fn custom_remapper_runs_before_configured_rules() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend = Backend::default();
    record(
        config(dir.path()),
        "custom remap",
        vec![request(Method::GET, "https://api.example.com/logo.png")],
        &backend,
    )
    .await;

    let mut engine = TrafficReplay::with_mode_flag(
        config(dir.path()),
        test_identity("custom remap"),
        Some("playback"),
    )
    .expect("engine should build")
    .with_url_remapper(Arc::new(|url: &Url| {
        if url.host_str() != Some("localhost") {
            return None;
        }
        let mut remapped = url.clone();
        remapped.set_scheme("https").ok()?;
        remapped.set_host(Some("api.example.com")).ok()?;
        remapped.set_port(None).ok()?;
        Some(remapped)
    }));
    let mut table = RouteTable::new();
    engine.setup(&mut table).await.expect("setup should succeed");

    let logo = table
        .dispatch(request(Method::GET, "http://localhost:5173/logo.png"), &NoNetwork)
        .await
        .expect("exchange should succeed");
    assert_eq!(logo.body.as_ref(), PNG_BYTES);
    engine.cleanup().await.expect("cleanup should succeed");
}

#[tokio::test]
async fn stateful_mock_replays_a_crud_flow_semantically() {
    let dir = tempfile::tempdir().expect("tempdir should be created");

    struct Movies;

    #[async_trait]
    impl Upstream for Movies {
        async fn fetch(&self, request: &InterceptedRequest) -> anyhow::Result<InterceptedResponse> {
            let body = match (request.method.as_str(), request.url.path()) {
                ("POST", "/movies") => json!({"status": "success", "data": {"id": 1, "title": "Heat"}}),
                ("GET", "/movies") => json!({"status": "success", "data": [{"id": 1, "title": "Heat"}]}),
                ("PUT", "/movies/1") => json!({"status": "success", "data": {"id": 1, "title": "Ronin"}}),
                ("DELETE", "/movies/1") => json!({"status": "success", "message": "deleted"}),
                _ => json!({"status": "error", "message": "not found"}),
            };
            Ok(InterceptedResponse::new(StatusCode::OK)
                .with_header("content-type", "application/json")
                .with_body(body.to_string()))
        }
    }

    let base = "https://api.example.com/movies";
    let mut recording =
        TrafficReplay::with_mode_flag(config(dir.path()), test_identity("crud"), Some("record"))
            .expect("engine should build");
    let mut table = RouteTable::new();
    recording.setup(&mut table).await.expect("setup should succeed");
    for request in [
        request(Method::POST, base).with_body(r#"{"title":"Heat"}"#),
        request(Method::GET, base),
        request(Method::PUT, &format!("{base}/1")).with_body(r#"{"title":"Ronin"}"#),
        request(Method::DELETE, &format!("{base}/1")),
    ] {
        table.dispatch(request, &Movies).await.expect("exchange should succeed");
    }
    recording.cleanup().await.expect("cleanup should succeed");

    let mut replay_config = config(dir.path());
    replay_config.playback.stateful_mock = StatefulMockMode::Always;
    let mut engine =
        TrafficReplay::with_mode_flag(replay_config, test_identity("crud"), Some("playback"))
            .expect("engine should build");
    let mut table = RouteTable::new();
    engine.setup(&mut table).await.expect("setup should succeed");
    assert!(engine.status_message().contains("stateful: /movies"));

    let created = table
        .dispatch(request(Method::POST, base).with_body(r#"{"title":"Heat"}"#), &NoNetwork)
        .await
        .expect("exchange should succeed");
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(body_json(&created)["data"], json!({"id": 1, "title": "Heat"}));

    let listed = table.dispatch(request(Method::GET, base), &NoNetwork).await.expect("exchange should succeed");
    assert_eq!(body_json(&listed)["data"], json!([{"id": 1, "title": "Heat"}]));

    let renamed = table
        .dispatch(
            request(Method::PUT, &format!("{base}/1")).with_body(r#"{"title":"Ronin"}"#),
            &NoNetwork,
        )
        .await
        .expect("exchange should succeed");
    assert_eq!(body_json(&renamed)["data"]["title"], json!("Ronin"));

    let deleted = table
        .dispatch(request(Method::DELETE, &format!("{base}/1")), &NoNetwork)
        .await
        .expect("exchange should succeed");
    assert_eq!(deleted.status, StatusCode::OK);

    let listed = table.dispatch(request(Method::GET, base), &NoNetwork).await.expect("exchange should succeed");
    assert_eq!(body_json(&listed), json!({"status": "success", "data": []}));

    let again = table
        .dispatch(request(Method::DELETE, &format!("{base}/1")), &NoNetwork)
        .await
        .expect("exchange should succeed");
    assert_eq!(again.status, StatusCode::NOT_FOUND);
    assert_eq!(body_json(&again)["status"], json!("error"));
    engine.cleanup().await.expect("cleanup should succeed");
}

#[tokio::test]
async fn missing_log_records_then_replays_on_the_next_run() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend = Backend::default();

    let mut first = TrafficReplay::with_mode_flag(
        config(dir.path()),
        test_identity("fallback"),
        Some("playback"),
    )
    .expect("engine should build");
    let mut table = RouteTable::new();
    first.setup(&mut table).await.expect("setup should succeed");
    assert!(first.context().fell_back_to_record);
    table
        .dispatch(request(Method::GET, "https://api.example.com/counter"), &backend)
        .await
        .expect("exchange should succeed");
    first.cleanup().await.expect("cleanup should succeed");
    assert_eq!(first.stats().await.entry_count, Some(1));

    let mut second = TrafficReplay::with_mode_flag(
        config(dir.path()),
        test_identity("fallback"),
        Some("playback"),
    )
    .expect("engine should build");
    let mut table = RouteTable::new();
    second.setup(&mut table).await.expect("setup should succeed");
    assert!(!second.context().fell_back_to_record);
    let response = table
        .dispatch(request(Method::GET, "https://api.example.com/counter"), &NoNetwork)
        .await
        .expect("exchange should succeed");
    assert_eq!(body_json(&response), json!({"value": 1}));
    second.cleanup().await.expect("cleanup should succeed");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn engines_for_different_tests_run_side_by_side() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let backend = Backend::default();

    let mut a =
        TrafficReplay::with_mode_flag(config(dir.path()), test_identity("a"), Some("record"))
            .expect("engine should build");
    let mut b =
        TrafficReplay::with_mode_flag(config(dir.path()), test_identity("b"), Some("record"))
            .expect("engine should build");
    let mut table_a = RouteTable::new();
    let mut table_b = RouteTable::new();
    a.setup(&mut table_a).await.expect("setup should succeed");
    b.setup(&mut table_b).await.expect("setup should succeed");

    let (ra, rb) = tokio::join!(
        table_a.dispatch(request(Method::GET, "https://api.example.com/counter"), &backend),
        table_b.dispatch(request(Method::GET, "https://api.example.com/logo.png"), &backend),
    );
    ra.expect("exchange should succeed");
    rb.expect("exchange should succeed");

    a.cleanup().await.expect("cleanup should succeed");
    b.cleanup().await.expect("cleanup should succeed");
    assert_ne!(a.log_path(), b.log_path());
    assert!(a.log_path().exists() && b.log_path().exists());
}

#[tokio::test]
async fn engine_built_from_toml_config() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let toml = format!(
        r#"
mode = "record"

[logs]
dir = "{}"
organize_by_file = false
include_test_id = true

[record]
url_filter = "^https://api\\.example\\.com/"
"#,
        dir.path().display().to_string().replace('\\', "\\\\")
    );
    let config = Config::from_toml_str(&toml)
        .expect("config should parse");
    let backend = Backend::default();

    let mut engine = TrafficReplay::with_mode_flag(config, test_identity("toml"), None).expect("engine should build");
    assert_eq!(engine.mode(), Mode::Record);
    let name = engine.log_path().file_name().unwrap().to_str().unwrap().to_owned();
    assert!(name.starts_with("toml-") && name.ends_with(".har"), "name: {name}");
    assert_eq!(engine.log_path().parent(), Some(dir.path()));

    let mut table = RouteTable::new();
    engine.setup(&mut table).await.expect("setup should succeed");
    table
        .dispatch(request(Method::GET, "https://api.example.com/counter"), &backend)
        .await
        .expect("exchange should succeed");
    table
        .dispatch(request(Method::GET, "https://cdn.example.com/logo.png"), &backend)
        .await
        .expect("exchange should succeed");
    engine.cleanup().await.expect("cleanup should succeed");
    assert_eq!(engine.stats().await.entry_count, Some(1));
}
