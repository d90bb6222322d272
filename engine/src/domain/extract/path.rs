//! Path expressions used by navigation rules.
//!
//! Attribute-rooted paths address flat span attribute keys:
//!
//! - `gen_ai.request.model` looks up one key
//! - `gen_ai.completion.*.content` expands `*` to 0, 1, 2, ... until the first
//!   missing index
//! - `gen_ai.completion.0.tool_calls.` (trailing dot) gathers every key under
//!   the prefix, used by `ObjectMerge`
//! - `llm.invocation_parameters#temperature` descends into the attribute value,
//!   parsing it first when it is a JSON string
//!
//! Value-rooted paths (`choices.*.message.content`) walk a nested response
//! object directly; `*` iterates array elements and object values.
//!
//! Several terms can be joined with `+` for aggregating extraction methods.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::domain::Attributes;
use crate::utils::json::{as_container, set_nested_value};

/// Upper bound on indices tried per wildcard, and on elements visited per
/// nested wildcard.
const MAX_WILDCARD_EXPANSION: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path has an empty segment")]
    EmptySegment,
    #[error("invalid segment '{0}'")]
    InvalidSegment(String),
    #[error("'#' is only allowed once, in attribute-rooted paths")]
    NestedNotAllowed,
    #[error("prefix paths cannot contain wildcards or nested parts")]
    InvalidPrefix,
}

/// Where a path starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    /// Flat span attribute map
    Attributes,
    /// A nested JSON value
    Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Segment {
    Key(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeyPart {
    Text(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrKey {
    /// Exact attribute key
    Literal(String),
    /// Attribute key with numeric index wildcards
    Indexed(Vec<KeyPart>),
    /// Every attribute under this prefix (includes the trailing dot)
    Prefix(String),
}

/// One parsed path term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathExpr {
    raw: String,
    key: Option<AttrKey>,
    nested: Vec<Segment>,
}

fn segment_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_\-:/@$]+$").expect("Invalid regex"))
}

fn parse_segments(raw: &str) -> Result<Vec<Segment>, PathError> {
    raw.split('.')
        .map(|seg| match seg {
            "" => Err(PathError::EmptySegment),
            "*" => Ok(Segment::Wildcard),
            s if segment_regex().is_match(s) => Ok(Segment::Key(s.to_string())),
            s => Err(PathError::InvalidSegment(s.to_string())),
        })
        .collect()
}

fn parse_key(raw: &str) -> Result<AttrKey, PathError> {
    if let Some(body) = raw.strip_suffix('.') {
        let segments = parse_segments(body)?;
        if segments.contains(&Segment::Wildcard) {
            return Err(PathError::InvalidPrefix);
        }
        return Ok(AttrKey::Prefix(raw.to_string()));
    }

    let segments = parse_segments(raw)?;
    if !segments.contains(&Segment::Wildcard) {
        return Ok(AttrKey::Literal(raw.to_string()));
    }

    let mut parts = Vec::new();
    let mut buf = String::new();
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            buf.push('.');
        }
        match segment {
            Segment::Wildcard => {
                if !buf.is_empty() {
                    parts.push(KeyPart::Text(std::mem::take(&mut buf)));
                }
                parts.push(KeyPart::Wildcard);
            }
            Segment::Key(key) => buf.push_str(key),
        }
    }
    if !buf.is_empty() {
        parts.push(KeyPart::Text(buf));
    }
    Ok(AttrKey::Indexed(parts))
}

impl PathExpr {
    pub fn parse(raw: &str, root: PathRoot) -> Result<Self, PathError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PathError::Empty);
        }

        match root {
            PathRoot::Value => {
                if raw.contains('#') {
                    return Err(PathError::NestedNotAllowed);
                }
                Ok(Self {
                    raw: raw.to_string(),
                    key: None,
                    nested: parse_segments(raw)?,
                })
            }
            PathRoot::Attributes => {
                let (key_part, nested_part) = match raw.split_once('#') {
                    Some((_, nested)) if nested.contains('#') => {
                        return Err(PathError::NestedNotAllowed);
                    }
                    Some((key, nested)) => (key, Some(nested)),
                    None => (raw, None),
                };
                if key_part.is_empty() {
                    return Err(PathError::Empty);
                }
                let key = parse_key(key_part)?;
                let nested = match nested_part {
                    Some(nested) => parse_segments(nested)?,
                    None => Vec::new(),
                };
                if matches!(key, AttrKey::Prefix(_)) && !nested.is_empty() {
                    return Err(PathError::InvalidPrefix);
                }
                Ok(Self {
                    raw: raw.to_string(),
                    key: Some(key),
                    nested,
                })
            }
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_prefix(&self) -> bool {
        matches!(self.key, Some(AttrKey::Prefix(_)))
    }

    pub fn has_wildcard(&self) -> bool {
        matches!(self.key, Some(AttrKey::Indexed(_))) || self.nested.contains(&Segment::Wildcard)
    }

    /// Resolve against a flat attribute map. Nulls are skipped.
    ///
    /// Prefix paths resolve to the gathered object (see [`Self::gather_prefix`]).
    pub fn resolve<'a>(&self, attrs: &'a Attributes) -> Vec<Cow<'a, JsonValue>> {
        let mut roots: Vec<&'a JsonValue> = Vec::new();
        match &self.key {
            Some(AttrKey::Literal(key)) => roots.extend(attrs.get(key.as_str())),
            Some(AttrKey::Indexed(parts)) => {
                let mut buf = String::with_capacity(self.raw.len() + 4);
                expand_key(parts, &mut buf, attrs, &mut roots);
            }
            Some(AttrKey::Prefix(_)) => {
                return self.gather_prefix(attrs).map(Cow::Owned).into_iter().collect();
            }
            None => return Vec::new(),
        }

        if self.nested.is_empty() {
            return roots
                .into_iter()
                .filter(|v| !v.is_null())
                .map(Cow::Borrowed)
                .collect();
        }

        let mut out = Vec::new();
        for root in roots {
            match as_container(root) {
                Some(Cow::Borrowed(container)) => {
                    let mut found = Vec::new();
                    walk(container, &self.nested, &mut found);
                    out.extend(found.into_iter().map(Cow::Borrowed));
                }
                Some(Cow::Owned(parsed)) => {
                    let mut found = Vec::new();
                    walk(&parsed, &self.nested, &mut found);
                    out.extend(found.into_iter().map(|v| Cow::Owned(v.clone())));
                }
                None => {}
            }
        }
        out
    }

    /// Resolve a value-rooted path against a nested value. Nulls are skipped.
    pub fn resolve_value<'v>(&self, value: &'v JsonValue) -> Vec<&'v JsonValue> {
        let mut out = Vec::new();
        if self.key.is_none() {
            walk(value, &self.nested, &mut out);
        }
        out
    }

    /// Gather every attribute under a prefix into a nested object.
    ///
    /// Keys are applied in sorted order so the result is deterministic.
    /// Numeric segments become object keys (`{"0": {...}}`).
    pub fn gather_prefix(&self, attrs: &Attributes) -> Option<JsonValue> {
        let Some(AttrKey::Prefix(prefix)) = &self.key else {
            return None;
        };

        let mut entries: Vec<(&str, &JsonValue)> = attrs
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix.as_str())
                    .filter(|rest| !rest.is_empty() && !value.is_null())
                    .map(|rest| (rest, value))
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let mut root = Map::new();
        for (rest, value) in entries {
            set_nested_value(&mut root, rest, value.clone());
        }
        Some(JsonValue::Object(root))
    }
}

/// Expand index wildcards in an attribute key, stopping each wildcard at the
/// first index that yields nothing. Returns whether anything was found.
fn expand_key<'a>(
    parts: &[KeyPart],
    buf: &mut String,
    attrs: &'a Attributes,
    out: &mut Vec<&'a JsonValue>,
) -> bool {
    match parts.split_first() {
        None => match attrs.get(buf.as_str()) {
            Some(value) => {
                out.push(value);
                true
            }
            None => false,
        },
        Some((KeyPart::Text(text), rest)) => {
            let len = buf.len();
            buf.push_str(text);
            let found = expand_key(rest, buf, attrs, out);
            buf.truncate(len);
            found
        }
        Some((KeyPart::Wildcard, rest)) => {
            let mut any = false;
            for index in 0..MAX_WILDCARD_EXPANSION {
                let len = buf.len();
                let _ = write!(buf, "{index}");
                let found = expand_key(rest, buf, attrs, out);
                buf.truncate(len);
                if !found {
                    break;
                }
                any = true;
            }
            any
        }
    }
}

fn walk<'v>(value: &'v JsonValue, segments: &[Segment], out: &mut Vec<&'v JsonValue>) {
    let Some((first, rest)) = segments.split_first() else {
        if !value.is_null() {
            out.push(value);
        }
        return;
    };

    match first {
        Segment::Key(key) => {
            let next = match value {
                JsonValue::Object(map) => map.get(key.as_str()),
                JsonValue::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            if let Some(next) = next {
                walk(next, rest, out);
            }
        }
        Segment::Wildcard => match value {
            JsonValue::Array(items) => {
                for item in items.iter().take(MAX_WILDCARD_EXPANSION) {
                    walk(item, rest, out);
                }
            }
            JsonValue::Object(map) => {
                for item in map.values().take(MAX_WILDCARD_EXPANSION) {
                    walk(item, rest, out);
                }
            }
            _ => {}
        },
    }
}

/// One or more path terms joined with `+`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSpec {
    terms: Vec<PathExpr>,
}

impl PathSpec {
    pub fn parse(raw: &str, root: PathRoot) -> Result<Self, PathError> {
        let terms = raw
            .split('+')
            .map(|term| PathExpr::parse(term, root))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { terms })
    }

    pub fn terms(&self) -> &[PathExpr] {
        &self.terms
    }

    pub fn is_compound(&self) -> bool {
        self.terms.len() > 1
    }

    pub fn has_wildcard(&self) -> bool {
        self.terms.iter().any(PathExpr::has_wildcard)
    }

    pub fn has_prefix(&self) -> bool {
        self.terms.iter().any(PathExpr::is_prefix)
    }
}
