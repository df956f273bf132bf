//! Cache key derivation.
//!
//! A key starts as the request path. Routes with key augmentation fold request
//! headers and/or the query into it:
//!
//! - headers, named: `#` then the named headers' values in list order
//! - headers, all: `#` then every header value in request order
//! - query, named: `?` then every query value in request order. The names are
//!   not used as a filter, only the presence of a list counts. A repeated name
//!   contributes its values joined with `,` at the position it first appeared.
//! - query, all: `?` then the raw query string
//!
//! Values are concatenated without separators, so adjacent values can collide
//! (`"ab" + "c"` and `"a" + "bc"`).

use crate::http::Request;
use crate::route::{FieldSelection, KeyAugmentation};

/// Suffix of the record holding status, message and headers.
pub const HEADERS_SUFFIX: &str = ":headers";
/// Suffix of the record holding the raw payload.
pub const BODY_SUFFIX: &str = ":body";

/// Build the cache key for `request` under the matched route's augmentation.
///
/// # Examples
///
/// ```
/// use route_cache::http::Request;
/// use route_cache::key::build_key;
/// use route_cache::route::{FieldSelection, KeyAugmentation};
///
/// let raw = b"GET /a?x=1&y=2 HTTP/1.1\r\nh1: foo\r\n\r\n";
/// let (request, _) = Request::parse(raw).unwrap();
/// let augmentation = KeyAugmentation {
///     headers: Some(FieldSelection::Names(vec!["h1".into()])),
///     query: Some(FieldSelection::All),
/// };
///
/// assert_eq!(build_key(&request, Some(&augmentation)), "/a#foo?x=1&y=2");
/// ```
pub fn build_key(request: &Request, augmentation: Option<&KeyAugmentation>) -> String {
    let mut key = request.path().to_owned();
    let Some(augmentation) = augmentation else {
        return key;
    };

    match &augmentation.headers {
        Some(FieldSelection::Names(names)) => {
            key.push('#');
            for name in names {
                if let Some(value) = request.headers().get(name) {
                    key.push_str(value);
                }
            }
        }
        Some(FieldSelection::All) => {
            key.push('#');
            request.headers().values().for_each(|value| key.push_str(value));
        }
        None => {}
    }

    match &augmentation.query {
        Some(FieldSelection::Names(_)) => {
            key.push('?');
            for (_, values) in request.query_values() {
                key.push_str(&values.join(","));
            }
        }
        Some(FieldSelection::All) => {
            key.push('?');
            key.push_str(request.query_string().unwrap_or_default());
        }
        None => {}
    }

    key
}

/// Store key of the `:headers` record for `key`.
pub fn headers_key(key: &str) -> String {
    format!("{key}{HEADERS_SUFFIX}")
}

/// Store key of the `:body` record for `key`.
pub fn body_key(key: &str) -> String {
    format!("{key}{BODY_SUFFIX}")
}
