//! Batch deduplication and RFC6902 application against a snapshot.
//!
//! Application is all-or-nothing: ops run against a working copy of the
//! current entries (cheap, entries are `Arc`-shared) and the copy only
//! becomes the snapshot if every surviving op applies. One deviation from
//! strict RFC6902 is deliberate: out-of-range list indices grow the list
//! (null-padded) for `add` and `replace`, so that applying only the last
//! surviving write per path is equivalent to applying the whole batch in
//! sequence.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tideline_proto::{OpKind, PatchOp};

use crate::error::PatchError;
use crate::snapshot::{parse_index, Entries, Entry, Pointer, Snapshot};

/// Keep only the operation with the greatest original index per path, in
/// original-index order. Pure per-batch; never reaches across messages.
pub fn dedupe(ops: Vec<PatchOp>) -> Vec<PatchOp> {
    let mut last_index: HashMap<String, usize> = HashMap::with_capacity(ops.len());
    for (idx, op) in ops.iter().enumerate() {
        last_index.insert(op.path.clone(), idx);
    }
    ops.into_iter()
        .enumerate()
        .filter(|(idx, op)| last_index.get(&op.path).is_some_and(|keep| keep == idx))
        .map(|(_, op)| op)
        .collect()
}

pub fn apply_op(entries: &mut Entries, op: &PatchOp) -> Result<(), PatchError> {
    let pointer = Pointer::parse(&op.path)?;
    let tokens = pointer.entries_tokens(&op.path)?;
    match op.op {
        OpKind::Add => add_at(entries, tokens, required_value(op)?, &op.path),
        OpKind::Replace => replace_at(entries, tokens, required_value(op)?, &op.path),
        OpKind::Remove => remove_at(entries, tokens, &op.path).map(drop),
        OpKind::Move => {
            let from = required_from(op)?;
            let from_pointer = Pointer::parse(from)?;
            let from_tokens = from_pointer.entries_tokens(from)?;
            let value = remove_at(entries, from_tokens, from)?;
            add_at(entries, tokens, value, &op.path)
        }
        OpKind::Copy => {
            let from = required_from(op)?;
            let from_pointer = Pointer::parse(from)?;
            let from_tokens = from_pointer.entries_tokens(from)?;
            let value = get_at(entries, from_tokens, from)?;
            add_at(entries, tokens, value, &op.path)
        }
        OpKind::Test => {
            let expected = required_value(op)?;
            let actual = get_at(entries, tokens, &op.path)?;
            if actual == expected {
                Ok(())
            } else {
                Err(PatchError::TestFailed {
                    path: op.path.clone(),
                })
            }
        }
    }
}

fn required_value(op: &PatchOp) -> Result<Value, PatchError> {
    op.value.clone().ok_or(PatchError::MissingValue {
        op: op_name(op.op),
        path: op.path.clone(),
    })
}

fn required_from(op: &PatchOp) -> Result<&str, PatchError> {
    op.from.as_deref().ok_or(PatchError::MissingFrom {
        op: op_name(op.op),
        path: op.path.clone(),
    })
}

fn op_name(op: OpKind) -> &'static str {
    match op {
        OpKind::Add => "add",
        OpKind::Remove => "remove",
        OpKind::Replace => "replace",
        OpKind::Move => "move",
        OpKind::Copy => "copy",
        OpKind::Test => "test",
    }
}

fn bad(path: &str) -> PatchError {
    PatchError::BadPointer {
        path: path.to_string(),
    }
}

fn unwrap_entry(entry: Entry) -> Value {
    Arc::try_unwrap(entry).unwrap_or_else(|shared| (*shared).clone())
}

fn add_at(
    entries: &mut Entries,
    tokens: &[String],
    value: Value,
    path: &str,
) -> Result<(), PatchError> {
    let Some((head, rest)) = tokens.split_first() else {
        *entries = entries.coerce_like(value, path)?;
        return Ok(());
    };
    match entries {
        Entries::Single(slot) => {
            let entry = slot.as_mut().ok_or_else(|| bad(path))?;
            value_add(Arc::make_mut(entry), tokens, value, path)
        }
        Entries::List(items) => {
            if rest.is_empty() {
                if head == "-" {
                    items.push(Arc::new(value));
                    return Ok(());
                }
                let idx = parse_index(head, path)?;
                if idx > items.len() {
                    items.resize(idx, Arc::new(Value::Null));
                }
                items.insert(idx, Arc::new(value));
                Ok(())
            } else {
                let idx = parse_index(head, path)?;
                let entry = items.get_mut(idx).ok_or_else(|| bad(path))?;
                value_add(Arc::make_mut(entry), rest, value, path)
            }
        }
        Entries::Map(items) => {
            if rest.is_empty() {
                items.insert(head.clone(), Arc::new(value));
                Ok(())
            } else {
                let entry = items.get_mut(head).ok_or_else(|| bad(path))?;
                value_add(Arc::make_mut(entry), rest, value, path)
            }
        }
    }
}

fn replace_at(
    entries: &mut Entries,
    tokens: &[String],
    value: Value,
    path: &str,
) -> Result<(), PatchError> {
    let Some((head, rest)) = tokens.split_first() else {
        *entries = entries.coerce_like(value, path)?;
        return Ok(());
    };
    match entries {
        Entries::Single(slot) => {
            let entry = slot.as_mut().ok_or_else(|| bad(path))?;
            value_replace(Arc::make_mut(entry), tokens, value, path)
        }
        Entries::List(items) => {
            if rest.is_empty() {
                let idx = parse_index(head, path)?;
                if idx >= items.len() {
                    items.resize(idx + 1, Arc::new(Value::Null));
                }
                items[idx] = Arc::new(value);
                Ok(())
            } else {
                let idx = parse_index(head, path)?;
                let entry = items.get_mut(idx).ok_or_else(|| bad(path))?;
                value_replace(Arc::make_mut(entry), rest, value, path)
            }
        }
        Entries::Map(items) => {
            if rest.is_empty() {
                items.insert(head.clone(), Arc::new(value));
                Ok(())
            } else {
                let entry = items.get_mut(head).ok_or_else(|| bad(path))?;
                value_replace(Arc::make_mut(entry), rest, value, path)
            }
        }
    }
}

fn remove_at(entries: &mut Entries, tokens: &[String], path: &str) -> Result<Value, PatchError> {
    let Some((head, rest)) = tokens.split_first() else {
        let removed = entries.to_value();
        *entries = entries.cleared();
        return Ok(removed);
    };
    match entries {
        Entries::Single(slot) => {
            let entry = slot.as_mut().ok_or_else(|| bad(path))?;
            value_remove(Arc::make_mut(entry), tokens, path)
        }
        Entries::List(items) => {
            let idx = parse_index(head, path)?;
            if rest.is_empty() {
                if idx >= items.len() {
                    return Err(bad(path));
                }
                Ok(unwrap_entry(items.remove(idx)))
            } else {
                let entry = items.get_mut(idx).ok_or_else(|| bad(path))?;
                value_remove(Arc::make_mut(entry), rest, path)
            }
        }
        Entries::Map(items) => {
            if rest.is_empty() {
                items.remove(head).map(unwrap_entry).ok_or_else(|| bad(path))
            } else {
                let entry = items.get_mut(head).ok_or_else(|| bad(path))?;
                value_remove(Arc::make_mut(entry), rest, path)
            }
        }
    }
}

fn get_at(entries: &Entries, tokens: &[String], path: &str) -> Result<Value, PatchError> {
    let Some((head, rest)) = tokens.split_first() else {
        return Ok(entries.to_value());
    };
    match entries {
        Entries::Single(slot) => {
            let entry = slot.as_ref().ok_or_else(|| bad(path))?;
            value_get(entry, tokens, path).cloned()
        }
        Entries::List(items) => {
            let idx = parse_index(head, path)?;
            let entry = items.get(idx).ok_or_else(|| bad(path))?;
            value_get(entry, rest, path).cloned()
        }
        Entries::Map(items) => {
            let entry = items.get(head).ok_or_else(|| bad(path))?;
            value_get(entry, rest, path).cloned()
        }
    }
}

fn child_mut<'a>(
    target: &'a mut Value,
    token: &str,
    path: &str,
) -> Result<&'a mut Value, PatchError> {
    match target {
        Value::Object(map) => map.get_mut(token).ok_or_else(|| bad(path)),
        Value::Array(items) => {
            let idx = parse_index(token, path)?;
            items.get_mut(idx).ok_or_else(|| bad(path))
        }
        _ => Err(bad(path)),
    }
}

fn value_add(
    target: &mut Value,
    tokens: &[String],
    value: Value,
    path: &str,
) -> Result<(), PatchError> {
    let Some((head, rest)) = tokens.split_first() else {
        *target = value;
        return Ok(());
    };
    if rest.is_empty() {
        match target {
            Value::Object(map) => {
                map.insert(head.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                if head == "-" {
                    items.push(value);
                    return Ok(());
                }
                let idx = parse_index(head, path)?;
                if idx > items.len() {
                    items.resize(idx, Value::Null);
                }
                items.insert(idx, value);
                Ok(())
            }
            _ => Err(bad(path)),
        }
    } else {
        value_add(child_mut(target, head, path)?, rest, value, path)
    }
}

fn value_replace(
    target: &mut Value,
    tokens: &[String],
    value: Value,
    path: &str,
) -> Result<(), PatchError> {
    let Some((head, rest)) = tokens.split_first() else {
        *target = value;
        return Ok(());
    };
    if rest.is_empty() {
        match target {
            Value::Object(map) => {
                map.insert(head.clone(), value);
                Ok(())
            }
            Value::Array(items) => {
                let idx = parse_index(head, path)?;
                if idx >= items.len() {
                    items.resize(idx + 1, Value::Null);
                }
                items[idx] = value;
                Ok(())
            }
            _ => Err(bad(path)),
        }
    } else {
        value_replace(child_mut(target, head, path)?, rest, value, path)
    }
}

fn value_remove(target: &mut Value, tokens: &[String], path: &str) -> Result<Value, PatchError> {
    let Some((head, rest)) = tokens.split_first() else {
        return Err(bad(path));
    };
    if rest.is_empty() {
        match target {
            Value::Object(map) => map.remove(head.as_str()).ok_or_else(|| bad(path)),
            Value::Array(items) => {
                let idx = parse_index(head, path)?;
                if idx >= items.len() {
                    return Err(bad(path));
                }
                Ok(items.remove(idx))
            }
            _ => Err(bad(path)),
        }
    } else {
        value_remove(child_mut(target, head, path)?, rest, path)
    }
}

fn value_get<'a>(
    target: &'a Value,
    tokens: &[String],
    path: &str,
) -> Result<&'a Value, PatchError> {
    let Some((head, rest)) = tokens.split_first() else {
        return Ok(target);
    };
    let child = match target {
        Value::Object(map) => map.get(head.as_str()).ok_or_else(|| bad(path))?,
        Value::Array(items) => {
            let idx = parse_index(head, path)?;
            items.get(idx).ok_or_else(|| bad(path))?
        }
        _ => return Err(bad(path)),
    };
    value_get(child, rest, path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    /// The stream already finished; the batch was dropped without effect.
    IgnoredFinished,
}

/// Maintains the authoritative snapshot for one session.
#[derive(Debug)]
pub struct PatchEngine {
    snapshot: Snapshot,
    version: u64,
    initialized: bool,
    finished: bool,
}

impl PatchEngine {
    pub fn new(seed: Entries) -> Self {
        Self {
            snapshot: Snapshot::new(seed),
            version: 0,
            initialized: false,
            finished: false,
        }
    }

    pub fn entries(&self) -> &Entries {
        self.snapshot.entries()
    }

    /// Counts committed batches. Subscriber replay and notification use it
    /// to decide whether a commit has already been seen.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Pre-frame mutation hook, e.g. injecting an optimistic placeholder
    /// entry before the server has said anything.
    pub(crate) fn entries_mut(&mut self) -> &mut Entries {
        self.snapshot.entries_mut()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn apply_batch(&mut self, ops: Vec<PatchOp>) -> Result<BatchOutcome, PatchError> {
        if self.finished {
            return Ok(BatchOutcome::IgnoredFinished);
        }
        let survivors = dedupe(ops);
        let mut working = self.snapshot.entries().clone();
        for op in &survivors {
            apply_op(&mut working, op)?;
        }
        self.snapshot = Snapshot::new(working);
        self.version += 1;
        Ok(BatchOutcome::Applied)
    }

    /// First full snapshot delivered, even if empty.
    pub fn mark_ready(&mut self) {
        self.initialized = true;
    }

    /// Freeze the snapshot; every later batch is ignored. Returns the final
    /// entries for the finish callback.
    pub fn mark_finished(&mut self) -> Entries {
        self.finished = true;
        self.snapshot.entries().clone()
    }
}
