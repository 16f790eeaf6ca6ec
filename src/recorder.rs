use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    builder::{CaptureOptions, add_page, build_entry, build_failed_entry, new_log, push_entry},
    error::EngineError,
    har::{Entry, LogDocument},
    intercept::{
        InterceptedRequest, InterceptionTarget, RouteDecision, RouteHandle, RouteHandler, Upstream,
        UrlFilter,
    },
    store::LogStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    /// Route registered, nothing captured yet.
    Armed,
    Recording,
    Flushed,
}

/// Captures every exchange that passes its route into one log document.
#[derive(Debug)]
pub struct Recorder {
    log_path: PathBuf,
    filter: UrlFilter,
    page_title: Option<String>,
    session: Arc<RecordingSession>,
    route: Option<RouteHandle>,
}

#[derive(Debug)]
struct RecordingSession {
    options: CaptureOptions,
    inner: Mutex<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    state: RecorderState,
    document: LogDocument,
}

impl RecordingSession {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_capturing(&self) -> bool {
        matches!(
            self.lock().state,
            RecorderState::Armed | RecorderState::Recording
        )
    }

    fn append(&self, entry: Entry) {
        let mut inner = self.lock();
        match inner.state {
            RecorderState::Armed | RecorderState::Recording => {
                push_entry(&mut inner.document.log, entry);
                inner.state = RecorderState::Recording;
            }
            RecorderState::Idle | RecorderState::Flushed => {
                tracing::debug!(
                    url = %entry.request.url,
                    "dropping exchange that completed outside the recording window"
                );
            }
        }
    }
}

impl Recorder {
    pub fn new(log_path: impl Into<PathBuf>, options: CaptureOptions, filter: UrlFilter) -> Self {
        Self {
            log_path: log_path.into(),
            filter,
            page_title: None,
            session: Arc::new(RecordingSession {
                options,
                inner: Mutex::new(SessionInner {
                    state: RecorderState::Idle,
                    document: new_log(),
                }),
            }),
            route: None,
        }
    }

    /// Opens a page named `title` when recording starts.
    pub fn with_page(mut self, title: impl Into<String>) -> Self {
        self.page_title = Some(title.into());
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn state(&self) -> RecorderState {
        self.session.lock().state
    }

    pub fn entry_count(&self) -> usize {
        self.session.lock().document.log.entries.len()
    }

    pub fn setup(&mut self, target: &mut dyn InterceptionTarget) -> Result<(), EngineError> {
        {
            let mut inner = self.session.lock();
            if inner.state != RecorderState::Idle {
                return Err(EngineError::AlreadyActive {
                    path: self.log_path.clone(),
                });
            }
            if let Some(title) = self.page_title.as_deref() {
                add_page(&mut inner.document.log, title, Utc::now());
            }
            inner.state = RecorderState::Armed;
        }

        let handler = RecordHandler {
            session: Arc::clone(&self.session),
        };
        match target.route(self.filter.clone(), Arc::new(handler)) {
            Ok(route) => self.route = Some(route),
            Err(err) => {
                self.session.lock().state = RecorderState::Flushed;
                return Err(EngineError::Route(err.into()));
            }
        }
        tracing::debug!(log = %self.log_path.display(), "recorder armed");
        Ok(())
    }

    /// Writes the captured log when at least one exchange was recorded.
    ///
    /// Returns the number of entries written. Safe to call repeatedly; the
    /// route is removed from its target on the first call.
    pub async fn cleanup(&mut self, store: &LogStore) -> Result<usize, EngineError> {
        if let Some(route) = self.route.take() {
            route.unroute();
        }
        let document = {
            let mut inner = self.session.lock();
            if !matches!(
                inner.state,
                RecorderState::Armed | RecorderState::Recording
            ) {
                return Ok(0);
            }
            inner.state = RecorderState::Flushed;
            std::mem::replace(&mut inner.document, new_log())
        };

        let entry_count = document.log.entries.len();
        if entry_count == 0 {
            tracing::debug!(log = %self.log_path.display(), "nothing recorded; log not written");
            return Ok(0);
        }

        store.write(&self.log_path, document).await?;
        tracing::info!(
            log = %self.log_path.display(),
            entries = entry_count,
            "exchange log written"
        );
        Ok(entry_count)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(route) = self.route.take() {
            route.unroute();
        }
    }
}

struct RecordHandler {
    session: Arc<RecordingSession>,
}

#[async_trait]
impl RouteHandler for RecordHandler {
    async fn handle(&self, request: &InterceptedRequest, upstream: &dyn Upstream) -> RouteDecision {
        if !self.session.is_capturing() {
            return RouteDecision::Continue;
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcome = upstream.fetch(request).await;
        let ended_at = started_at
            + chrono::Duration::from_std(clock.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        let options = &self.session.options;

        match outcome {
            Ok(response) => {
                tracing::debug!(
                    method = %request.method,
                    url = %request.url,
                    status = response.status.as_u16(),
                    "recorded exchange"
                );
                self.session.append(build_entry(
                    request,
                    Some(&response),
                    started_at,
                    ended_at,
                    options,
                ));
                RouteDecision::Fulfill(response)
            }
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::debug!(
                    method = %request.method,
                    url = %request.url,
                    "recorded failed exchange: {reason}"
                );
                self.session.append(build_failed_entry(
                    request, &reason, started_at, ended_at, options,
                ));
                RouteDecision::Abort(reason)
            }
        }
    }
}
