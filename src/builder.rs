//! Turns intercepted exchanges into log entries.
//!
//! Everything here is pure: no clocks, no I/O. Callers pass the timestamps.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use hyper::Version;

use crate::{
    config::BodyCapture,
    har::{
        BASE64_ENCODING, Cache, Content, Cookie, Creator, Entry, ExchangeLog, FORMAT_VERSION,
        LogDocument, NameValue, Page, PageTimings, PostData, Request, Response, Timings,
    },
    intercept::{InterceptedRequest, InterceptedResponse},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Store response body text; when off only size and MIME type are kept.
    pub embed_bodies: bool,
    pub body_capture: BodyCapture,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            embed_bodies: true,
            body_capture: BodyCapture::Auto,
        }
    }
}

pub fn new_log() -> LogDocument {
    LogDocument {
        log: ExchangeLog {
            version: FORMAT_VERSION.to_owned(),
            creator: Creator::this_crate(),
            pages: Vec::new(),
            entries: Vec::new(),
        },
    }
}

/// Appends a page marker and returns its id.
pub fn add_page(log: &mut ExchangeLog, title: &str, started_at: DateTime<Utc>) -> String {
    let id = format!("page_{}", log.pages.len() + 1);
    log.pages.push(Page {
        started_date_time: started_at,
        id: id.clone(),
        title: title.to_owned(),
        page_timings: PageTimings::default(),
    });
    id
}

/// Appends `entry`, attaching it to the latest page when it has none.
pub fn push_entry(log: &mut ExchangeLog, mut entry: Entry) {
    if entry.pageref.is_none() {
        entry.pageref = log.pages.last().map(|page| page.id.clone());
    }
    log.entries.push(entry);
}

/// Builds one entry. A missing `response` yields a degenerate status-0 entry.
pub fn build_entry(
    request: &InterceptedRequest,
    response: Option<&InterceptedResponse>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    options: &CaptureOptions,
) -> Entry {
    let time = elapsed_ms(started_at, ended_at);
    Entry {
        pageref: None,
        started_date_time: started_at,
        time,
        request: build_request(request),
        response: match response {
            Some(response) => build_response(response, options),
            None => failed_response(),
        },
        cache: Cache::default(),
        timings: Timings {
            wait: time,
            ..Timings::default()
        },
        error: None,
    }
}

pub fn build_failed_entry(
    request: &InterceptedRequest,
    reason: &str,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    options: &CaptureOptions,
) -> Entry {
    let mut entry = build_entry(request, None, started_at, ended_at, options);
    entry.error = Some(reason.to_owned());
    entry
}

fn elapsed_ms(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> f64 {
    let micros = ended_at
        .signed_duration_since(started_at)
        .num_microseconds()
        .unwrap_or(i64::MAX);
    (micros.max(0) as f64) / 1000.0
}

fn build_request(request: &InterceptedRequest) -> Request {
    let post_data = (!request.body.is_empty()).then(|| {
        let mime_type = request.header("content-type").unwrap_or_default().to_owned();
        let (text, encoding) = capture_body(&request.body, &mime_type, BodyCapture::Auto);
        PostData {
            mime_type,
            text,
            encoding,
        }
    });

    Request {
        method: request.method.as_str().to_owned(),
        url: request.url.as_str().to_owned(),
        http_version: http_version_label(request.version).to_owned(),
        headers: name_values(&request.headers),
        query_string: request
            .url
            .query_pairs()
            .map(|(name, value)| NameValue::new(name, value))
            .collect(),
        cookies: request_cookies(&request.headers),
        post_data,
        headers_size: -1,
        body_size: body_size(request.body.len()),
    }
}

fn build_response(response: &InterceptedResponse, options: &CaptureOptions) -> Response {
    let mime_type = response
        .header("content-type")
        .unwrap_or_default()
        .to_owned();
    let (text, encoding) = if options.embed_bodies {
        let (text, encoding) = capture_body(&response.body, &mime_type, options.body_capture);
        (Some(text), encoding)
    } else {
        (None, None)
    };

    Response {
        status: response.status.as_u16(),
        status_text: response
            .status
            .canonical_reason()
            .unwrap_or_default()
            .to_owned(),
        http_version: http_version_label(response.version).to_owned(),
        headers: name_values(&response.headers),
        cookies: response_cookies(&response.headers),
        content: Content {
            size: body_size(response.body.len()),
            mime_type,
            text,
            encoding,
        },
        redirect_url: response.header("location").unwrap_or_default().to_owned(),
        headers_size: -1,
        body_size: body_size(response.body.len()),
    }
}

fn failed_response() -> Response {
    Response {
        status: 0,
        status_text: String::new(),
        http_version: String::new(),
        headers: Vec::new(),
        cookies: Vec::new(),
        content: Content::empty(),
        redirect_url: String::new(),
        headers_size: -1,
        body_size: 0,
    }
}

fn body_size(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

fn name_values(headers: &[(String, String)]) -> Vec<NameValue> {
    headers
        .iter()
        .map(|(name, value)| NameValue::new(name.as_str(), value.as_str()))
        .collect()
}

pub fn http_version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

pub fn parse_http_version(label: &str) -> Version {
    match label.trim().to_ascii_uppercase().as_str() {
        "HTTP/0.9" => Version::HTTP_09,
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/2" | "HTTP/2.0" | "H2" => Version::HTTP_2,
        "HTTP/3" | "HTTP/3.0" | "H3" => Version::HTTP_3,
        _ => Version::HTTP_11,
    }
}

fn request_cookies(headers: &[(String, String)]) -> Vec<Cookie> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, value)| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some(Cookie {
                name: name.trim().to_owned(),
                value: value.trim().to_owned(),
                ..Cookie::default()
            })
        })
        .collect()
}

fn response_cookies(headers: &[(String, String)]) -> Vec<Cookie> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
        .filter_map(|(_, value)| parse_set_cookie(value))
        .collect()
}

fn parse_set_cookie(raw: &str) -> Option<Cookie> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    let mut cookie = Cookie {
        name: name.trim().to_owned(),
        value: value.trim().to_owned(),
        ..Cookie::default()
    };

    for attribute in parts {
        let attribute = attribute.trim();
        let (key, value) = match attribute.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim())),
            None => (attribute, None),
        };
        match key.to_ascii_lowercase().as_str() {
            "path" => cookie.path = value.map(str::to_owned),
            "domain" => cookie.domain = value.map(str::to_owned),
            "expires" => cookie.expires = value.map(str::to_owned),
            "samesite" => cookie.same_site = value.map(str::to_owned),
            "httponly" => cookie.http_only = Some(true),
            "secure" => cookie.secure = Some(true),
            _ => {}
        }
    }
    Some(cookie)
}

fn is_textual_mime(mime_type: &str) -> bool {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.is_empty()
        || essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json"
                | "application/xml"
                | "application/javascript"
                | "application/ecmascript"
                | "application/graphql"
                | "application/x-www-form-urlencoded"
        )
}

/// Returns the stored text and its `encoding` marker.
pub fn capture_body(body: &[u8], mime_type: &str, capture: BodyCapture) -> (String, Option<String>) {
    if capture == BodyCapture::Auto
        && is_textual_mime(mime_type)
        && let Ok(text) = std::str::from_utf8(body)
    {
        return (text.to_owned(), None);
    }
    (BASE64.encode(body), Some(BASE64_ENCODING.to_owned()))
}

/// Inverse of [`capture_body`].
pub fn decode_body(text: &str, encoding: Option<&str>) -> Result<Vec<u8>, base64::DecodeError> {
    match encoding {
        Some(encoding) if encoding.eq_ignore_ascii_case(BASE64_ENCODING) => BASE64.decode(text),
        _ => Ok(text.as_bytes().to_vec()),
    }
}
