//! Semantic replay for CRUD-style collections.
//!
//! Literal replay breaks down when a test creates, reads, changes and
//! deletes the same resources: ids and list contents differ run to run. For
//! collections that look like that, [`StatefulMock`] answers from an
//! in-memory table instead of the log.

use std::collections::{BTreeMap, BTreeSet};

use hyper::{Method, StatusCode};
use serde_json::{Map, Value, json};
use url::Url;

use crate::{
    builder::decode_body,
    har::{Entry, ExchangeLog},
    intercept::InterceptedResponse,
    matching::normalized_method,
};

/// Splits a URL path into its collection and an optional trailing id.
///
/// The id is a numeric or UUID-shaped last segment.
pub fn split_collection(path: &str) -> (String, Option<String>) {
    let trimmed = path.trim_end_matches('/');
    if let Some((parent, last)) = trimmed.rsplit_once('/')
        && !parent.is_empty()
        && is_id_segment(last)
    {
        return (parent.to_owned(), Some(last.to_owned()));
    }
    let collection = if trimmed.is_empty() { "/" } else { trimmed };
    (collection.to_owned(), None)
}

fn is_id_segment(segment: &str) -> bool {
    (!segment.is_empty() && segment.bytes().all(|byte| byte.is_ascii_digit())) || is_uuid(segment)
}

fn is_uuid(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(idx, byte)| match idx {
            8 | 13 | 18 | 23 => *byte == b'-',
            _ => byte.is_ascii_hexdigit(),
        })
}

fn is_mutation(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH" | "DELETE")
}

fn entry_collection(entry: &Entry) -> Option<(String, Option<String>)> {
    let url = Url::parse(&entry.request.url).ok()?;
    Some(split_collection(url.path()))
}

/// Collections that receive more than two reads with a mutation recorded
/// between the first and the last of them, in log order.
pub fn stateful_collections(log: &ExchangeLog) -> Vec<String> {
    #[derive(Default)]
    struct Activity {
        reads: Vec<usize>,
        mutations: Vec<usize>,
    }

    let mut activity: BTreeMap<String, Activity> = BTreeMap::new();
    for (position, entry) in log.entries.iter().enumerate() {
        let Some((collection, _)) = entry_collection(entry) else {
            continue;
        };
        let method = normalized_method(&entry.request.method);
        let slot = activity.entry(collection).or_default();
        if method == "GET" {
            slot.reads.push(position);
        } else if is_mutation(&method) {
            slot.mutations.push(position);
        }
    }

    activity
        .into_iter()
        .filter(|(_, activity)| {
            let (Some(first), Some(last)) = (activity.reads.first(), activity.reads.last()) else {
                return false;
            };
            activity.reads.len() > 2
                && activity
                    .mutations
                    .iter()
                    .any(|position| first < position && position < last)
        })
        .map(|(collection, _)| collection)
        .collect()
}

pub fn is_stateful(log: &ExchangeLog) -> bool {
    !stateful_collections(log).is_empty()
}

/// Collections with at least one captured create (`POST` to the collection).
pub fn collections_with_creates(log: &ExchangeLog) -> Vec<String> {
    log.entries
        .iter()
        .filter(|entry| normalized_method(&entry.request.method) == "POST")
        .filter_map(entry_collection)
        .filter(|(_, id)| id.is_none())
        .map(|(collection, _)| collection)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusStyle {
    /// The HTTP status code itself.
    Numeric,
    Text { success: String, failure: String },
}

/// Response shape the real backend used for a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Bare,
    /// `{status, data}` on success, `{status, message}` otherwise.
    Status(StatusStyle),
}

impl Envelope {
    /// Infers the envelope from captured responses; the first enveloped body
    /// decides the status style.
    pub fn infer<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut style: Option<StatusStyle> = None;
        let mut success = None;
        let mut failure = None;

        for entry in entries {
            let Some(Value::Object(body)) = response_json(entry) else {
                continue;
            };
            let Some(status) = body.get("status") else {
                continue;
            };
            if !body.contains_key("data") && !body.contains_key("message") {
                continue;
            }
            match status {
                Value::Number(_) if style.is_none() => style = Some(StatusStyle::Numeric),
                Value::String(text) => {
                    if style.is_none() {
                        style = Some(StatusStyle::Text {
                            success: String::new(),
                            failure: String::new(),
                        });
                    }
                    let slot = if entry.response.status < 400 {
                        &mut success
                    } else {
                        &mut failure
                    };
                    slot.get_or_insert_with(|| text.clone());
                }
                _ => {}
            }
        }

        match style {
            None => Self::Bare,
            Some(StatusStyle::Numeric) => Self::Status(StatusStyle::Numeric),
            Some(StatusStyle::Text { .. }) => Self::Status(StatusStyle::Text {
                success: success.unwrap_or_else(|| "success".to_owned()),
                failure: failure.unwrap_or_else(|| "error".to_owned()),
            }),
        }
    }

    fn status_value(style: &StatusStyle, status: StatusCode) -> Value {
        match style {
            StatusStyle::Numeric => json!(status.as_u16()),
            StatusStyle::Text { success, failure } => {
                if status.is_client_error() || status.is_server_error() {
                    json!(failure)
                } else {
                    json!(success)
                }
            }
        }
    }

    fn data(&self, status: StatusCode, data: Value) -> Value {
        match self {
            Self::Bare => data,
            Self::Status(style) => json!({
                "status": Self::status_value(style, status),
                "data": data,
            }),
        }
    }

    fn message(&self, status: StatusCode, message: String) -> Value {
        match self {
            Self::Bare => json!({ "message": message }),
            Self::Status(style) => json!({
                "status": Self::status_value(style, status),
                "message": message,
            }),
        }
    }

    /// Strips the envelope off a captured body.
    fn unwrap(&self, body: Value) -> Value {
        match (self, body) {
            (Self::Status(_), Value::Object(mut object)) if object.contains_key("data") => {
                object.remove("data").unwrap_or(Value::Null)
            }
            (_, body) => body,
        }
    }
}

fn response_json(entry: &Entry) -> Option<Value> {
    let content = &entry.response.content;
    let body = decode_body(content.text.as_deref()?, content.encoding.as_deref()).ok()?;
    serde_json::from_slice(&body).ok()
}

#[derive(Debug, Clone)]
struct Collection {
    envelope: Envelope,
    next_id: u64,
    rows: BTreeMap<u64, Map<String, Value>>,
}

impl Collection {
    fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            next_id: 1,
            rows: BTreeMap::new(),
        }
    }

    fn insert(&mut self, mut row: Map<String, Value>) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        row.insert("id".to_owned(), json!(id));
        self.rows.insert(id, row.clone());
        Value::Object(row)
    }
}

/// In-memory resource tables, one per mocked collection.
#[derive(Debug, Clone, Default)]
pub struct StatefulMock {
    collections: BTreeMap<String, Collection>,
}

impl StatefulMock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mocks `collections`, inferring each envelope from the log. Tables start
    /// empty.
    pub fn from_log(log: &ExchangeLog, collections: &[String]) -> Self {
        let mut mock = Self::new();
        for collection in collections {
            let envelope = Envelope::infer(log.entries.iter().filter(|entry| {
                entry_collection(entry).is_some_and(|(candidate, _)| &candidate == collection)
            }));
            mock.add_collection(collection.clone(), envelope);
        }
        mock
    }

    pub fn add_collection(&mut self, path: impl Into<String>, envelope: Envelope) {
        self.collections.insert(path.into(), Collection::new(envelope));
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn envelope(&self, collection: &str) -> Option<&Envelope> {
        self.collections.get(collection).map(|collection| &collection.envelope)
    }

    /// Loads the resources created by successful captured `POST`s.
    pub fn seed_from_captured_creates(&mut self, log: &ExchangeLog) {
        for entry in &log.entries {
            if normalized_method(&entry.request.method) != "POST"
                || !(200..300).contains(&entry.response.status)
            {
                continue;
            }
            let Some((path, None)) = entry_collection(entry) else {
                continue;
            };
            let Some(collection) = self.collections.get_mut(&path) else {
                continue;
            };
            let Some(Value::Object(row)) =
                response_json(entry).map(|body| collection.envelope.unwrap(body))
            else {
                continue;
            };

            match row.get("id").and_then(Value::as_u64) {
                Some(id) => {
                    collection.rows.insert(id, row);
                    collection.next_id = collection.next_id.max(id + 1);
                }
                None => {
                    collection.insert(row);
                }
            }
        }
    }

    pub fn reset(&mut self) {
        for collection in self.collections.values_mut() {
            collection.rows.clear();
            collection.next_id = 1;
        }
    }

    /// Answers `method url` from the table, or `None` when the request is not
    /// a CRUD operation on a mocked collection.
    pub fn handle(&mut self, method: &Method, url: &Url, body: &[u8]) -> Option<InterceptedResponse> {
        let (path, id) = split_collection(url.path());
        let collection = self.collections.get_mut(&path)?;

        let (status, payload) = match (method.as_str(), id) {
            ("GET", None) => {
                let rows = collection.rows.values().cloned().map(Value::Object).collect();
                (StatusCode::OK, collection.envelope.data(StatusCode::OK, Value::Array(rows)))
            }
            ("POST", None) => match serde_json::from_slice::<Value>(body) {
                Ok(Value::Object(row)) => {
                    let created = collection.insert(row);
                    (
                        StatusCode::CREATED,
                        collection.envelope.data(StatusCode::CREATED, created),
                    )
                }
                _ => (
                    StatusCode::BAD_REQUEST,
                    collection.envelope.message(
                        StatusCode::BAD_REQUEST,
                        "request body must be a JSON object".to_owned(),
                    ),
                ),
            },
            ("GET" | "PUT" | "PATCH" | "DELETE", Some(raw_id)) => {
                collection.by_id(method, &raw_id, body)
            }
            _ => return None,
        };

        tracing::debug!(%method, url = %url, status = status.as_u16(), "stateful mock answered");
        Some(json_response(status, &payload))
    }
}

impl Collection {
    fn by_id(&mut self, method: &Method, raw_id: &str, body: &[u8]) -> (StatusCode, Value) {
        let Some(id) = raw_id.parse::<u64>().ok().filter(|id| self.rows.contains_key(id)) else {
            return self.not_found(raw_id);
        };

        match method.as_str() {
            "PUT" | "PATCH" => {
                let changes = match serde_json::from_slice::<Value>(body) {
                    Ok(Value::Object(changes)) => changes,
                    _ => {
                        return (
                            StatusCode::BAD_REQUEST,
                            self.envelope.message(
                                StatusCode::BAD_REQUEST,
                                "request body must be a JSON object".to_owned(),
                            ),
                        );
                    }
                };
                let Some(row) = self.rows.get_mut(&id) else {
                    return self.not_found(raw_id);
                };
                for (key, value) in changes {
                    if key != "id" {
                        row.insert(key, value);
                    }
                }
                let updated = Value::Object(row.clone());
                (StatusCode::OK, self.envelope.data(StatusCode::OK, updated))
            }
            "DELETE" => match self.rows.remove(&id) {
                Some(_) => (
                    StatusCode::OK,
                    self.envelope
                        .message(StatusCode::OK, format!("resource {id} deleted")),
                ),
                None => self.not_found(raw_id),
            },
            _ => match self.rows.get(&id).cloned() {
                Some(row) => (
                    StatusCode::OK,
                    self.envelope.data(StatusCode::OK, Value::Object(row)),
                ),
                None => self.not_found(raw_id),
            },
        }
    }

    fn not_found(&self, raw_id: &str) -> (StatusCode, Value) {
        (
            StatusCode::NOT_FOUND,
            self.envelope.message(
                StatusCode::NOT_FOUND,
                format!("resource {raw_id} not found"),
            ),
        )
    }
}

fn json_response(status: StatusCode, payload: &Value) -> InterceptedResponse {
    InterceptedResponse::new(status)
        .with_header("content-type", "application/json")
        .with_body(payload.to_string())
}
