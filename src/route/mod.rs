//! Route table compilation: turn declared cache routes into ordered matchers.
//!
//! Each entry of the configured route table binds a path pattern to a TTL policy and an
//! optional key-augmentation spec. Three pattern styles are supported:
//!
//! | Pattern         | Example match                 | Matcher                                      |
//! |-----------------|-------------------------------|----------------------------------------------|
//! | `/users`        | `/users`                      | exact string comparison                      |
//! | `/users/:id`    | `/users/42`, `/users/42/`     | anchored, `:name` = one or more alphanumerics |
//! | `/files/*`      | `/files/docs/readme.txt`      | unanchored, `*` = any substring              |
//!
//! Matching is two-pass: a request path equal to a declared pattern always selects that
//! route, regardless of where it was declared. Otherwise the first pattern route, in
//! declaration order, whose matcher accepts the path wins. No match means passthrough.

use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::{ConfigError, ConfigResult};

/// The tag that selects the adaptive TTL policy.
pub const INCREASING: &str = "increasing";

/// How long responses of a route live in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlDescriptor {
    /// Never cache; the store is not touched.
    Disabled,
    /// Use the engine's default TTL.
    UseDefault,
    /// A fixed TTL in milliseconds.
    Fixed(u64),
    /// TTL grows with the number of calls, per the adaptive step table.
    Adaptive,
}

/// Which request fields are folded into the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    /// The named fields. For headers the values are taken in list order; for the
    /// query only the presence of a list matters.
    Names(Vec<String>),
    /// Every field the request carries.
    All,
}

/// Header and query augmentation for a route's cache keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyAugmentation {
    pub headers: Option<FieldSelection>,
    pub query: Option<FieldSelection>,
}

impl KeyAugmentation {
    pub fn is_empty(&self) -> bool {
        self.headers.is_none() && self.query.is_none()
    }
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    // Matches one exact path string, e.g. `/users`.
    Exact,
    // `/users/:id` style; `:name` segments become alphanumeric runs.
    Parameterized(Regex),
    // `/files/*` style; every `*` matches any substring.
    Wildcard(Regex),
}

impl Pattern {
    /// Compile a declared route pattern.
    ///
    /// The pattern is classified as follows (checked in order):
    ///
    /// 1. Contains `*` → [`Pattern::Wildcard`], searched anywhere in the path.
    /// 2. Contains `:` → [`Pattern::Parameterized`], anchored at the start when the
    ///    pattern starts with `/`, always anchored at the end with one optional
    ///    trailing `/`.
    /// 3. Otherwise → [`Pattern::Exact`].
    ///
    /// All other characters are matched literally.
    fn parse(pattern: &str) -> Result<Self, regex::Error> {
        if pattern.contains('*') {
            let body = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            return Ok(Pattern::Wildcard(Regex::new(&body)?));
        }

        if pattern.contains(':') {
            let mut source = String::with_capacity(pattern.len() * 2);
            if pattern.starts_with('/') {
                source.push('^');
            }
            let mut rest = pattern;
            while let Some(pos) = rest.find(':') {
                source.push_str(&regex::escape(&rest[..pos]));
                let after = &rest[pos + 1..];
                let name_len = after
                    .find(|c: char| !c.is_ascii_alphanumeric())
                    .unwrap_or(after.len());
                if name_len == 0 {
                    // A lone `:` is literal text.
                    source.push(':');
                } else {
                    source.push_str("[A-Za-z0-9]+");
                }
                rest = &after[name_len..];
            }
            source.push_str(&regex::escape(rest));
            source.push_str("/?$");
            return Ok(Pattern::Parameterized(Regex::new(&source)?));
        }

        Ok(Pattern::Exact)
    }

    fn kind(&self) -> PatternKind {
        match self {
            Pattern::Exact => PatternKind::Exact,
            Pattern::Parameterized(_) => PatternKind::Parameterized,
            Pattern::Wildcard(_) => PatternKind::Wildcard,
        }
    }

    fn regex(&self) -> Option<&Regex> {
        match self {
            Pattern::Exact => None,
            Pattern::Parameterized(re) | Pattern::Wildcard(re) => Some(re),
        }
    }
}

/// The style of a compiled route pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Exact,
    Parameterized,
    Wildcard,
}

/// One compiled cache route. Immutable once the table is built.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pattern: String,
    matcher: Pattern,
    ttl: TtlDescriptor,
    key_augmentation: Option<KeyAugmentation>,
}

impl RouteSpec {
    /// Compile one route entry from its raw configuration value.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing why the entry is unusable; the caller
    /// drops such entries.
    pub fn compile(pattern: &str, value: &Value) -> ConfigResult<Self> {
        let (ttl, key_augmentation) = match value {
            Value::Object(fields) => {
                let ttl = match fields.get("timeout") {
                    None | Some(Value::Null) => TtlDescriptor::UseDefault,
                    Some(timeout) => {
                        parse_ttl(timeout).ok_or_else(|| ConfigError::InvalidTimeout {
                            route: pattern.to_owned(),
                            value: timeout.clone(),
                        })?
                    }
                };
                let augmentation = match fields.get("cacheKeyArgs") {
                    None | Some(Value::Null) => None,
                    Some(args) => parse_key_args(pattern, args)?,
                };
                (ttl, augmentation)
            }
            other => {
                let ttl = parse_ttl(other).ok_or_else(|| ConfigError::InvalidRoute {
                    route: pattern.to_owned(),
                    value: other.clone(),
                })?;
                (ttl, None)
            }
        };

        let matcher = Pattern::parse(pattern).map_err(|_| ConfigError::InvalidRoute {
            route: pattern.to_owned(),
            value: value.clone(),
        })?;

        Ok(Self {
            pattern: pattern.to_owned(),
            matcher,
            ttl,
            key_augmentation,
        })
    }

    /// The declared pattern string; the route's identity.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn kind(&self) -> PatternKind {
        self.matcher.kind()
    }

    pub fn ttl(&self) -> TtlDescriptor {
        self.ttl
    }

    pub fn key_augmentation(&self) -> Option<&KeyAugmentation> {
        self.key_augmentation.as_ref()
    }

    // Pattern pass only; exact comparison is done by the table.
    fn matches_pattern(&self, path: &str) -> bool {
        self.matcher.regex().is_some_and(|re| re.is_match(path))
    }
}

// number (or numeric string) | bool | "increasing"
fn parse_ttl(value: &Value) -> Option<TtlDescriptor> {
    match value {
        Value::Bool(true) => Some(TtlDescriptor::UseDefault),
        Value::Bool(false) => Some(TtlDescriptor::Disabled),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(TtlDescriptor::Fixed),
        Value::String(s) if s == INCREASING => Some(TtlDescriptor::Adaptive),
        Value::String(s) => s.trim().parse::<u64>().ok().map(TtlDescriptor::Fixed),
        _ => None,
    }
}

fn parse_key_args(route: &str, args: &Value) -> ConfigResult<Option<KeyAugmentation>> {
    match args {
        Value::Array(_) => Err(ConfigError::ArrayKeyArgs {
            route: route.to_owned(),
        }),
        // A bare string or `true` names no header or query field.
        Value::String(_) | Value::Bool(true) => Ok(Some(KeyAugmentation::default())),
        Value::Object(fields) => Ok(Some(KeyAugmentation {
            headers: parse_selection(route, "headers", fields)?,
            query: parse_selection(route, "query", fields)?,
        })),
        Value::Bool(false) => Ok(None),
        other => Err(ConfigError::InvalidRoute {
            route: route.to_owned(),
            value: other.clone(),
        }),
    }
}

fn parse_selection(
    route: &str,
    field: &'static str,
    fields: &Map<String, Value>,
) -> ConfigResult<Option<FieldSelection>> {
    let invalid = |value: &Value| ConfigError::InvalidKeyArgs {
        route: route.to_owned(),
        field,
        value: value.clone(),
    };

    match fields.get(field) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(Value::Bool(true)) => Ok(Some(FieldSelection::All)),
        Some(Value::String(name)) => Ok(Some(FieldSelection::Names(vec![name.clone()]))),
        Some(Value::Array(items)) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(name) => names.push(name.to_owned()),
                    None => return Err(invalid(item)),
                }
            }
            Ok(Some(FieldSelection::Names(names)))
        }
        Some(other) => Err(invalid(other)),
    }
}

/// The compiled, ordered route table.
///
/// # Examples
///
/// ```
/// use route_cache::route::{RouteTable, TtlDescriptor};
/// use serde_json::json;
///
/// let routes = json!({ "/users/:id": 2000, "/users/me": false });
/// let table = RouteTable::compile(routes.as_object().unwrap());
///
/// // The exact entry wins even though the pattern was declared first.
/// assert_eq!(table.find("/users/me").unwrap().ttl(), TtlDescriptor::Disabled);
/// assert_eq!(table.find("/users/42").unwrap().ttl(), TtlDescriptor::Fixed(2000));
/// assert!(table.find("/posts").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteSpec>,
}

impl RouteTable {
    /// Compile every entry of `routes`, in declaration order.
    ///
    /// Entries that cannot be compiled are logged and left out of the table.
    pub fn compile(routes: &Map<String, Value>) -> Self {
        let routes = routes
            .iter()
            .filter_map(|(pattern, value)| match RouteSpec::compile(pattern, value) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    warn!(route = %pattern, error = %e, "dropping cache route");
                    None
                }
            })
            .collect();

        Self { routes }
    }

    /// Find the route responsible for `path`.
    pub fn find(&self, path: &str) -> Option<&RouteSpec> {
        self.routes
            .iter()
            .find(|route| route.pattern == path)
            .or_else(|| self.routes.iter().find(|route| route.matches_pattern(path)))
    }

    /// Returns `true` when any route uses the adaptive policy.
    pub fn has_adaptive(&self) -> bool {
        self.routes
            .iter()
            .any(|route| route.ttl == TtlDescriptor::Adaptive)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteSpec> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
