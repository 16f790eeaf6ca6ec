//! Seams to the interception layer.
//!
//! The engine never talks to the network or to a browser/client directly. It
//! registers a [`RouteHandler`] on an [`InterceptionTarget`]; for every
//! matching request the handler either fulfills it with a synthetic response,
//! lets it continue to the network, or aborts it. Forwarding is done through
//! an [`Upstream`] the interception layer supplies.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Method, StatusCode, Version};
use regex::Regex;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedRequest {
    pub method: Method,
    pub url: Url,
    pub version: Version,
    /// In wire order; duplicates preserved.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl InterceptedRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            version: Version::HTTP_11,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl InterceptedResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Headers that describe one connection and never travel past a hop.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

/// Drops hop-by-hop headers, including any named by `connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    let listed: Vec<String> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
        .collect();
    headers.retain(|(name, _)| {
        !is_hop_by_hop(name) && !listed.iter().any(|token| token.eq_ignore_ascii_case(name))
    });
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Fulfill(InterceptedResponse),
    Continue,
    Abort(String),
}

#[derive(Debug, Clone, Default)]
pub enum UrlFilter {
    #[default]
    All,
    Pattern(Regex),
}

impl UrlFilter {
    pub fn from_pattern(pattern: Option<&str>) -> Result<Self, regex::Error> {
        match pattern {
            Some(pattern) => Ok(Self::Pattern(Regex::new(pattern)?)),
            None => Ok(Self::All),
        }
    }

    pub fn matches(&self, url: &Url) -> bool {
        match self {
            Self::All => true,
            Self::Pattern(regex) => regex.is_match(url.as_str()),
        }
    }
}

/// Sends a request to the real network.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: &InterceptedRequest) -> anyhow::Result<InterceptedResponse>;
}

#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, request: &InterceptedRequest, upstream: &dyn Upstream)
    -> RouteDecision;
}

pub trait InterceptionTarget {
    /// Registers `handler` for requests matching `filter` until the returned
    /// handle is unrouted.
    fn route(
        &mut self,
        filter: UrlFilter,
        handler: Arc<dyn RouteHandler>,
    ) -> anyhow::Result<RouteHandle>;
}

/// Removes one registered route. Dropping the handle leaves the route in
/// place.
pub struct RouteHandle {
    unroute: Box<dyn FnOnce() + Send + Sync>,
}

impl RouteHandle {
    pub fn new(unroute: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unroute: Box::new(unroute),
        }
    }

    pub fn unroute(self) {
        (self.unroute)();
    }
}

impl fmt::Debug for RouteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteHandle").finish_non_exhaustive()
    }
}

/// Upstream for runs that must stay offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNetwork;

#[async_trait]
impl Upstream for NoNetwork {
    async fn fetch(&self, request: &InterceptedRequest) -> anyhow::Result<InterceptedResponse> {
        anyhow::bail!("network access disabled for {} {}", request.method, request.url)
    }
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("request aborted: {0}")]
    Aborted(String),
    #[error("upstream request failed: {0:#}")]
    Upstream(anyhow::Error),
}

/// In-process route registry.
///
/// Callers that own their HTTP client run each outbound request through
/// [`RouteTable::dispatch`]. When several routes match, the most recently
/// registered one handles the request.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<Routes>>,
}

#[derive(Default)]
struct Routes {
    next_id: u64,
    entries: Vec<RegisteredRoute>,
}

struct RegisteredRoute {
    id: u64,
    filter: UrlFilter,
    handler: Arc<dyn RouteHandler>,
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.len())
            .finish()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
    }

    fn handler_for(&self, url: &Url) -> Option<Arc<dyn RouteHandler>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .rev()
            .find(|route| route.filter.matches(url))
            .map(|route| Arc::clone(&route.handler))
    }

    pub async fn dispatch(
        &self,
        request: InterceptedRequest,
        upstream: &dyn Upstream,
    ) -> Result<InterceptedResponse, ExchangeError> {
        let decision = match self.handler_for(&request.url) {
            Some(handler) => handler.handle(&request, upstream).await,
            None => RouteDecision::Continue,
        };

        match decision {
            RouteDecision::Fulfill(response) => Ok(response),
            RouteDecision::Continue => upstream
                .fetch(&request)
                .await
                .map_err(ExchangeError::Upstream),
            RouteDecision::Abort(reason) => Err(ExchangeError::Aborted(reason)),
        }
    }
}

impl InterceptionTarget for RouteTable {
    fn route(
        &mut self,
        filter: UrlFilter,
        handler: Arc<dyn RouteHandler>,
    ) -> anyhow::Result<RouteHandle> {
        let id = {
            let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
            let id = routes.next_id;
            routes.next_id += 1;
            routes.entries.push(RegisteredRoute {
                id,
                filter,
                handler,
            });
            id
        };

        let routes = Arc::downgrade(&self.routes);
        Ok(RouteHandle::new(move || {
            if let Some(routes) = routes.upgrade() {
                routes
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entries
                    .retain(|route| route.id != id);
            }
        }))
    }
}
