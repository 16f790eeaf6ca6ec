use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context as _;
use async_trait::async_trait;
use hyper::StatusCode;
use url::Url;

use crate::{
    builder::{decode_body, parse_http_version},
    config::{QueryMatchMode, StatefulMockMode},
    error::EngineError,
    har::{Entry, LogDocument},
    intercept::{
        InterceptedRequest, InterceptedResponse, InterceptionTarget, RouteDecision, RouteHandle,
        RouteHandler, Upstream, UrlFilter, strip_hop_by_hop,
    },
    matching::RequestSignature,
    remap::UrlRemapper,
    stateful::{StatefulMock, collections_with_creates, stateful_collections},
};

#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub remapper: UrlRemapper,
    pub match_query: QueryMatchMode,
    /// Send unmatched requests to the network instead of aborting them.
    pub fallback: bool,
    pub filter: UrlFilter,
    pub stateful_mock: StatefulMockMode,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            remapper: UrlRemapper::default(),
            match_query: QueryMatchMode::default(),
            fallback: false,
            filter: UrlFilter::All,
            stateful_mock: StatefulMockMode::default(),
        }
    }
}

/// Serves recorded exchanges instead of the network.
#[derive(Debug)]
pub struct Player {
    log_path: PathBuf,
    filter: UrlFilter,
    index: Arc<PlaybackIndex>,
    registered: bool,
    route: Option<RouteHandle>,
}

#[derive(Debug)]
struct PlaybackIndex {
    /// Sorted by start time; URLs already remapped.
    entries: Vec<Entry>,
    by_signature: HashMap<RequestSignature, Vec<usize>>,
    cursors: Mutex<HashMap<RequestSignature, usize>>,
    remapper: UrlRemapper,
    match_query: QueryMatchMode,
    fallback: bool,
    mock: Option<Mutex<StatefulMock>>,
    active: AtomicBool,
}

impl Player {
    pub fn new(log_path: impl Into<PathBuf>, document: LogDocument, options: PlayerOptions) -> Self {
        let PlayerOptions {
            remapper,
            match_query,
            fallback,
            filter,
            stateful_mock,
        } = options;

        let mut log = document.log;
        log.entries.sort_by_key(|entry| entry.started_date_time);
        for entry in &mut log.entries {
            if let Ok(url) = Url::parse(&entry.request.url) {
                entry.request.url = remapper.remap(&url).into();
            }
        }

        let mut by_signature: HashMap<RequestSignature, Vec<usize>> = HashMap::new();
        for (position, entry) in log.entries.iter().enumerate() {
            by_signature
                .entry(entry_signature(entry, match_query))
                .or_default()
                .push(position);
        }

        let mocked = match stateful_mock {
            StatefulMockMode::Never => Vec::new(),
            StatefulMockMode::Auto => stateful_collections(&log),
            StatefulMockMode::Always => collections_with_creates(&log),
        };
        let mock = (!mocked.is_empty()).then(|| {
            tracing::debug!(collections = ?mocked, "serving collections from the stateful mock");
            Mutex::new(StatefulMock::from_log(&log, &mocked))
        });

        Self {
            log_path: log_path.into(),
            filter,
            index: Arc::new(PlaybackIndex {
                entries: log.entries,
                by_signature,
                cursors: Mutex::new(HashMap::new()),
                remapper,
                match_query,
                fallback,
                mock,
                active: AtomicBool::new(false),
            }),
            registered: false,
            route: None,
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn entry_count(&self) -> usize {
        self.index.entries.len()
    }

    pub fn mocked_collections(&self) -> Vec<String> {
        self.index
            .mock
            .as_ref()
            .map(|mock| {
                mock.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .collections()
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn setup(&mut self, target: &mut dyn InterceptionTarget) -> Result<(), EngineError> {
        if self.registered {
            return Err(EngineError::AlreadyActive {
                path: self.log_path.clone(),
            });
        }
        let handler = PlaybackHandler {
            index: Arc::clone(&self.index),
        };
        let route = target
            .route(self.filter.clone(), Arc::new(handler))
            .map_err(|err| EngineError::Route(err.into()))?;
        self.route = Some(route);
        self.registered = true;
        self.index.active.store(true, Ordering::SeqCst);
        tracing::debug!(
            log = %self.log_path.display(),
            entries = self.index.entries.len(),
            "player armed"
        );
        Ok(())
    }

    /// Unroutes the handler and forgets cycling and mock state.
    pub fn cleanup(&mut self) {
        if let Some(route) = self.route.take() {
            route.unroute();
        }
        self.index.active.store(false, Ordering::SeqCst);
        self.index
            .cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(mock) = self.index.mock.as_ref() {
            mock.lock().unwrap_or_else(PoisonError::into_inner).reset();
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Some(route) = self.route.take() {
            route.unroute();
        }
    }
}

fn entry_signature(entry: &Entry, match_query: QueryMatchMode) -> RequestSignature {
    match Url::parse(&entry.request.url) {
        Ok(url) => RequestSignature::new(&entry.request.method, &url, match_query),
        Err(_) => RequestSignature::from_raw(&entry.request.method, &entry.request.url),
    }
}

impl PlaybackIndex {
    /// Next entry for `signature`, cycling through duplicates in recorded order.
    fn next_entry(&self, signature: &RequestSignature) -> Option<&Entry> {
        let candidates = self.by_signature.get(signature)?;
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(signature.clone()).or_insert(0);
        let position = candidates[*cursor % candidates.len()];
        *cursor = (*cursor + 1) % candidates.len();
        self.entries.get(position)
    }
}

struct PlaybackHandler {
    index: Arc<PlaybackIndex>,
}

#[async_trait]
impl RouteHandler for PlaybackHandler {
    async fn handle(&self, request: &InterceptedRequest, _upstream: &dyn Upstream) -> RouteDecision {
        let index = &self.index;
        if !index.active.load(Ordering::SeqCst) {
            return RouteDecision::Continue;
        }

        let url = index.remapper.remap(&request.url);
        if let Some(mock) = index.mock.as_ref() {
            let answered = mock
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .handle(&request.method, &url, &request.body);
            if let Some(response) = answered {
                return RouteDecision::Fulfill(response);
            }
        }

        let signature = RequestSignature::new(request.method.as_str(), &url, index.match_query);
        match index.next_entry(&signature) {
            Some(entry) if entry.is_failed() => {
                let reason = entry
                    .error
                    .clone()
                    .unwrap_or_else(|| "recorded exchange failed".to_owned());
                tracing::debug!(%signature, "replaying recorded failure: {reason}");
                RouteDecision::Abort(reason)
            }
            Some(entry) => match replay_response(entry, request) {
                Ok(response) => {
                    tracing::debug!(%signature, status = response.status.as_u16(), "replayed");
                    RouteDecision::Fulfill(response)
                }
                Err(err) => {
                    tracing::warn!(%signature, "recorded entry cannot be replayed: {err:#}");
                    RouteDecision::Abort(format!("{err:#}"))
                }
            },
            None if index.fallback => {
                tracing::debug!(%signature, "no recorded exchange; passing through");
                RouteDecision::Continue
            }
            None => {
                tracing::debug!(%signature, "no recorded exchange; aborting");
                RouteDecision::Abort(format!("no recorded exchange for {signature}"))
            }
        }
    }
}

fn replay_response(
    entry: &Entry,
    request: &InterceptedRequest,
) -> anyhow::Result<InterceptedResponse> {
    let recorded = &entry.response;
    let status = StatusCode::from_u16(recorded.status)
        .with_context(|| format!("recorded status {} is not a valid HTTP status", recorded.status))?;
    let body = match recorded.content.text.as_deref() {
        Some(text) => decode_body(text, recorded.content.encoding.as_deref())
            .context("decode recorded response body")?,
        None => Vec::new(),
    };

    let origin = request.header("origin");
    let mut headers = recorded
        .headers
        .iter()
        .map(|header| (header.name.clone(), header.value.clone()))
        .collect::<Vec<_>>();
    strip_hop_by_hop(&mut headers);
    headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));
    if let Some(origin) = origin {
        for (name, value) in &mut headers {
            if name.eq_ignore_ascii_case("access-control-allow-origin") && value.trim() != "*" {
                *value = origin.to_owned();
            }
        }
    }
    headers.push(("content-length".to_owned(), body.len().to_string()));

    Ok(InterceptedResponse {
        status,
        version: parse_http_version(&recorded.http_version),
        headers,
        body: body.into(),
    })
}
