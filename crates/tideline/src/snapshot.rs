//! Immutable mirrored state. A snapshot is replaced wholesale on every
//! committed batch; individual entries sit behind `Arc` so a commit that
//! touches one entry leaves every other entry's allocation untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::PatchError;

pub type Entry = Arc<Value>;

/// The `entries` collection of a snapshot. Shape is fixed by the seed: an
/// ordered list (conversation entries), a mapping keyed by id (tasks,
/// projects), or a single scratch object.
#[derive(Debug, Clone)]
pub enum Entries {
    List(Vec<Entry>),
    Map(BTreeMap<String, Entry>),
    Single(Option<Entry>),
}

impl Entries {
    pub fn empty_list() -> Self {
        Entries::List(Vec::new())
    }

    pub fn empty_map() -> Self {
        Entries::Map(BTreeMap::new())
    }

    pub fn empty_single() -> Self {
        Entries::Single(None)
    }

    pub fn list(values: impl IntoIterator<Item = Value>) -> Self {
        Entries::List(values.into_iter().map(Arc::new).collect())
    }

    pub fn map(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Entries::Map(
            pairs
                .into_iter()
                .map(|(key, value)| (key, Arc::new(value)))
                .collect(),
        )
    }

    pub fn single(value: Value) -> Self {
        Entries::Single(Some(Arc::new(value)))
    }

    pub fn len(&self) -> usize {
        match self {
            Entries::List(items) => items.len(),
            Entries::Map(items) => items.len(),
            Entries::Single(item) => usize::from(item.is_some()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_list(&self) -> Option<&[Entry]> {
        match self {
            Entries::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Entry>> {
        match self {
            Entries::Map(items) => Some(items),
            _ => None,
        }
    }

    pub fn single_value(&self) -> Option<&Entry> {
        match self {
            Entries::Single(item) => item.as_ref(),
            _ => None,
        }
    }

    /// Deep view as a JSON value, used by `test` ops against the whole
    /// collection and by consumers that want plain JSON out.
    pub fn to_value(&self) -> Value {
        match self {
            Entries::List(items) => {
                Value::Array(items.iter().map(|item| (**item).clone()).collect())
            }
            Entries::Map(items) => {
                let mut object = Map::new();
                for (key, value) in items {
                    object.insert(key.clone(), (**value).clone());
                }
                Value::Object(object)
            }
            Entries::Single(Some(item)) => (**item).clone(),
            Entries::Single(None) => Value::Null,
        }
    }

    /// Rebuild a collection of the same shape from a raw JSON value, used
    /// when a patch replaces the whole `/entries` pointer.
    pub fn coerce_like(&self, value: Value, path: &str) -> Result<Entries, PatchError> {
        match (self, value) {
            (Entries::List(_), Value::Array(items)) => Ok(Entries::list(items)),
            (Entries::Map(_), Value::Object(items)) => Ok(Entries::Map(
                items
                    .into_iter()
                    .map(|(key, value)| (key, Arc::new(value)))
                    .collect(),
            )),
            (Entries::Single(_), Value::Null) => Ok(Entries::Single(None)),
            (Entries::Single(_), value) => Ok(Entries::single(value)),
            (_, value) => Err(PatchError::ShapeMismatch {
                path: path.to_string(),
                detail: format!("cannot hold {}", json_kind(&value)),
            }),
        }
    }

    /// Empty collection of the same shape.
    pub fn cleared(&self) -> Entries {
        match self {
            Entries::List(_) => Entries::empty_list(),
            Entries::Map(_) => Entries::empty_map(),
            Entries::Single(_) => Entries::empty_single(),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Last known authoritative state for one session.
#[derive(Debug, Clone)]
pub struct Snapshot {
    entries: Entries,
}

impl Snapshot {
    pub fn new(entries: Entries) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Entries {
        &mut self.entries
    }
}

/// A parsed slash-delimited pointer. Patch paths for this protocol always
/// start at the `entries` collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    tokens: Vec<String>,
}

impl Pointer {
    pub fn parse(path: &str) -> Result<Self, PatchError> {
        if path.is_empty() {
            return Ok(Self { tokens: Vec::new() });
        }
        let Some(rest) = path.strip_prefix('/') else {
            return Err(PatchError::BadPointer {
                path: path.to_string(),
            });
        };
        let tokens = rest.split('/').map(unescape).collect();
        Ok(Self { tokens })
    }

    /// Tokens below the leading `entries` segment.
    pub fn entries_tokens(&self, path: &str) -> Result<&[String], PatchError> {
        match self.tokens.split_first() {
            Some((head, rest)) if head == "entries" => Ok(rest),
            _ => Err(PatchError::BadPointer {
                path: path.to_string(),
            }),
        }
    }
}

// RFC6901 escaping: ~1 is '/', ~0 is '~'.
fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

pub fn parse_index(token: &str, path: &str) -> Result<usize, PatchError> {
    token.parse::<usize>().map_err(|_| PatchError::BadPointer {
        path: path.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pointer_strips_entries_prefix() {
        let pointer = Pointer::parse("/entries/4/status").expect("parse");
        let tokens = pointer.entries_tokens("/entries/4/status").expect("prefix");
        assert_eq!(tokens, ["4".to_string(), "status".to_string()]);
    }

    #[test]
    fn pointer_rejects_foreign_roots() {
        let pointer = Pointer::parse("/other/4").expect("parse");
        assert!(pointer.entries_tokens("/other/4").is_err());
        assert!(Pointer::parse("entries/4").is_err());
    }

    #[test]
    fn pointer_unescapes_tokens() {
        let pointer = Pointer::parse("/entries/a~1b/c~0d").expect("parse");
        let tokens = pointer.entries_tokens("/entries/a~1b/c~0d").expect("prefix");
        assert_eq!(tokens, ["a/b".to_string(), "c~d".to_string()]);
    }

    #[test]
    fn coerce_respects_shape() {
        let list = Entries::empty_list();
        assert!(list.coerce_like(json!([1, 2]), "/entries").is_ok());
        assert!(list.coerce_like(json!({"a": 1}), "/entries").is_err());

        let single = Entries::empty_single();
        let coerced = single.coerce_like(json!({"draft": true}), "/entries").expect("coerce");
        assert_eq!(coerced.to_value(), json!({"draft": true}));
    }

    #[test]
    fn to_value_round_trips_map() {
        let entries = Entries::map([("a".to_string(), json!({"id": "a"}))]);
        assert_eq!(entries.to_value(), json!({"a": {"id": "a"}}));
    }
}
