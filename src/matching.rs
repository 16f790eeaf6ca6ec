use std::borrow::Cow;

use url::Url;

use crate::config::QueryMatchMode;

/// Key used to find candidate log entries for a request: the upper-cased
/// method plus the (already remapped) URL.
///
/// The fragment never takes part. How the query takes part follows
/// [`QueryMatchMode`]:
/// - `exact`: query string as written
/// - `normalized`: raw `name=value` pairs sorted by name then value, repeated
///   keys preserved
/// - `ignore`: excluded
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestSignature {
    method: String,
    url: String,
}

impl RequestSignature {
    pub fn new(method: &str, url: &Url, query_mode: QueryMatchMode) -> Self {
        Self {
            method: normalized_method(method).into_owned(),
            url: signature_url(url, query_mode),
        }
    }

    /// Signature for a recorded URL that does not parse; matched verbatim.
    pub fn from_raw(method: &str, raw_url: &str) -> Self {
        Self {
            method: normalized_method(method).into_owned(),
            url: raw_url.to_owned(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

pub(crate) fn normalized_method(method: &str) -> Cow<'_, str> {
    if method.bytes().any(|byte| byte.is_ascii_lowercase()) {
        return Cow::Owned(method.to_ascii_uppercase());
    }
    Cow::Borrowed(method)
}

fn signature_url(url: &Url, query_mode: QueryMatchMode) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    match query_mode {
        QueryMatchMode::Exact => {}
        QueryMatchMode::Normalized => {
            let normalized = normalized_query(url.query());
            if normalized.is_empty() {
                url.set_query(None);
            } else {
                url.set_query(Some(&normalized));
            }
        }
        QueryMatchMode::Ignore => url.set_query(None),
    }
    url.into()
}

fn query_params_sorted(query: Option<&str>) -> Vec<(&str, &str)> {
    let mut out = Vec::new();
    let Some(query) = query else { return out };

    for segment in query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let mut parts = segment.splitn(2, '=');
        let name = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        out.push((name, value));
    }

    out.sort_unstable_by(|(a_name, a_value), (b_name, b_value)| {
        a_name.cmp(b_name).then_with(|| a_value.cmp(b_value))
    });
    out
}

pub(crate) fn normalized_query(query: Option<&str>) -> String {
    let mut normalized = String::new();
    for (idx, (name, value)) in query_params_sorted(query).iter().enumerate() {
        if idx > 0 {
            normalized.push('&');
        }
        normalized.push_str(name);
        normalized.push('=');
        normalized.push_str(value);
    }
    normalized
}
