//! Per-content append-only operation log.
//!
//! ```text
//!  evicted            retained ring (≤ history_cap)          next
//! ┌───────┐ ┌─────┬─────┬─────┬─────┬─────┬─────┐        ┌─────┐
//! │ 1..k  │ │ k+1 │ k+2 │ ... │     │     │ n   │  ◄──── │ n+1 │
//! └───────┘ └─────┴─────┴─────┴─────┴─────┴─────┘        └─────┘
//! ```
//!
//! Sequence numbers are scoped to one content item, start at 1 and never
//! repeat. Entries are never mutated after append; once the ring exceeds
//! its cap the oldest entries are dropped.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::session::SelectionRange;

/// Kinds of content edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Delete,
    Replace,
    Format,
    Move,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Format => "format",
            Self::Move => "move",
        }
    }
}

impl FromStr for OperationKind {
    type Err = CollabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "delete" => Ok(Self::Delete),
            "replace" => Ok(Self::Replace),
            "format" => Ok(Self::Format),
            "move" => Ok(Self::Move),
            other => Err(CollabError::InvalidOperation(format!(
                "unsupported operation kind '{other}'"
            ))),
        }
    }
}

/// Character-offset payload shared by all edit kinds.
///
/// Which fields are meaningful depends on the kind:
/// - insert: `position`, `text`
/// - delete: `position`, `length`
/// - replace: `position`, `length`, `text`
/// - format: `position`, `length`, `attributes`
/// - move: `position`, `length`, `target`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditPayload {
    pub position: usize,
    #[serde(default)]
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<usize>,
}

impl EditPayload {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            position,
            length,
            ..Self::default()
        }
    }

    pub fn replace(position: usize, length: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            length,
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn format(position: usize, length: usize, attributes: serde_json::Value) -> Self {
        Self {
            position,
            length,
            attributes: Some(attributes),
            ..Self::default()
        }
    }

    pub fn moved(position: usize, length: usize, target: usize) -> Self {
        Self {
            position,
            length,
            target: Some(target),
            ..Self::default()
        }
    }

    /// Exclusive end of the affected range.
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.length)
    }

    /// Number of characters this edit inserts.
    pub fn inserted_len(&self) -> usize {
        self.text.as_deref().map_or(0, |t| t.chars().count())
    }

    /// Check that the fields required by `kind` are present.
    pub fn validate(&self, kind: OperationKind) -> CollabResult<()> {
        let missing = |field: &str| {
            Err(CollabError::Validation(format!(
                "{} operation requires '{field}'",
                kind.as_str()
            )))
        };
        let overflows = self.position.checked_add(self.length).is_none()
            || self.position.checked_add(self.inserted_len()).is_none()
            || self
                .target
                .is_some_and(|t| t.checked_add(self.length).is_none());
        if overflows {
            return Err(CollabError::Validation(format!(
                "{} operation range exceeds the addressable offset",
                kind.as_str()
            )));
        }
        match kind {
            OperationKind::Insert => {
                if self.inserted_len() == 0 {
                    return missing("text");
                }
            }
            OperationKind::Delete => {
                if self.length == 0 {
                    return missing("length");
                }
            }
            OperationKind::Replace => {
                if self.length == 0 {
                    return missing("length");
                }
                if self.text.is_none() {
                    return missing("text");
                }
            }
            OperationKind::Format => {
                if self.length == 0 {
                    return missing("length");
                }
                if self.attributes.is_none() {
                    return missing("attributes");
                }
            }
            OperationKind::Move => {
                if self.length == 0 {
                    return missing("length");
                }
                let Some(target) = self.target else {
                    return missing("target");
                };
                if target > self.position && target < self.end() {
                    return Err(CollabError::Validation(
                        "move target lies inside the moved range".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// An edit as submitted by a client, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRequest {
    /// Operation kind name; unknown names are rejected.
    pub kind: String,
    #[serde(default)]
    pub payload: Option<EditPayload>,
    /// Last sequence the client had applied when it produced this edit.
    #[serde(default)]
    pub base_sequence: Option<u64>,
    #[serde(default)]
    pub cursor: Option<usize>,
    #[serde(default)]
    pub selection: Option<SelectionRange>,
}

impl EditRequest {
    pub fn new(kind: OperationKind, payload: EditPayload) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload: Some(payload),
            base_sequence: None,
            cursor: None,
            selection: None,
        }
    }

    pub fn with_base(mut self, base_sequence: u64) -> Self {
        self.base_sequence = Some(base_sequence);
        self
    }

    pub fn with_cursor(mut self, cursor: usize) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// An ambiguity the transform step could not resolve on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Uuid,
    /// Sequence of the concurrent operation this edit collided with
    pub against_sequence: u64,
    pub description: String,
}

impl Conflict {
    pub fn new(against_sequence: u64, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            against_sequence,
            description: description.into(),
        }
    }
}

/// A committed edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub sequence: u64,
    pub content_id: String,
    pub session_id: Uuid,
    pub user_id: String,
    pub kind: OperationKind,
    pub payload: EditPayload,
    /// Payload after the transform step, when it differs from `payload`
    pub transformed: Option<EditPayload>,
    /// Unix milliseconds
    pub timestamp: u64,
    pub conflicts: Vec<Conflict>,
}

impl Operation {
    /// The payload that was actually applied.
    pub fn effective_payload(&self) -> &EditPayload {
        self.transformed.as_ref().unwrap_or(&self.payload)
    }
}

/// Bounded ring of operations for one content item.
#[derive(Debug)]
pub struct OperationLog {
    entries: VecDeque<Operation>,
    next_sequence: u64,
    cap: usize,
}

impl OperationLog {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(1024)),
            next_sequence: 1,
            cap: cap.max(1),
        }
    }

    /// Last assigned sequence (0 when nothing was ever appended).
    pub fn head(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Sequence of the oldest retained entry.
    pub fn oldest_sequence(&self) -> Option<u64> {
        self.entries.front().map(|op| op.sequence)
    }

    /// Assign the next sequence and append the operation built for it.
    pub fn append(&mut self, build: impl FnOnce(u64) -> Operation) -> &Operation {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let op = build(sequence);
        debug_assert_eq!(op.sequence, sequence);
        self.entries.push_back(op);

        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }

        // Just pushed, ring is never empty here.
        &self.entries[self.entries.len() - 1]
    }

    /// Retained operations with a sequence greater than `sequence`.
    pub fn since(&self, sequence: u64) -> impl Iterator<Item = &Operation> {
        // Sequences are contiguous within the ring, so skip by offset.
        let skip = match self.oldest_sequence() {
            Some(oldest) if sequence >= oldest => (sequence - oldest + 1) as usize,
            _ => 0,
        };
        self.entries.iter().skip(skip)
    }

    /// The `n` most recent operations, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Operation> {
        let start = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(start).cloned().collect()
    }

    pub fn get(&self, sequence: u64) -> Option<&Operation> {
        let oldest = self.oldest_sequence()?;
        if sequence < oldest {
            return None;
        }
        self.entries.get((sequence - oldest) as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(sequence: u64, session_id: Uuid) -> Operation {
        Operation {
            sequence,
            content_id: "c1".into(),
            session_id,
            user_id: "u1".into(),
            kind: OperationKind::Insert,
            payload: EditPayload::insert(0, "x"),
            transformed: None,
            timestamp: 0,
            conflicts: Vec::new(),
        }
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let mut log = OperationLog::new(16);
        assert_eq!(log.head(), 0);
        let session = Uuid::new_v4();
        let seq = log.append(|s| op(s, session)).sequence;
        assert_eq!(seq, 1);
        assert_eq!(log.head(), 1);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut log = OperationLog::new(3);
        let session = Uuid::new_v4();
        for _ in 0..5 {
            log.append(|s| op(s, session));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.oldest_sequence(), Some(3));
        assert_eq!(log.head(), 5);
        assert!(log.get(2).is_none());
        assert_eq!(log.get(4).map(|o| o.sequence), Some(4));
    }

    #[test]
    fn test_since_skips_acknowledged() {
        let mut log = OperationLog::new(10);
        let session = Uuid::new_v4();
        for _ in 0..6 {
            log.append(|s| op(s, session));
        }
        let seqs: Vec<u64> = log.since(4).map(|o| o.sequence).collect();
        assert_eq!(seqs, vec![5, 6]);
        assert_eq!(log.since(0).count(), 6);
        assert_eq!(log.since(6).count(), 0);
    }

    #[test]
    fn test_since_after_eviction_returns_all_retained() {
        let mut log = OperationLog::new(2);
        let session = Uuid::new_v4();
        for _ in 0..5 {
            log.append(|s| op(s, session));
        }
        let seqs: Vec<u64> = log.since(1).map(|o| o.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_recent_window() {
        let mut log = OperationLog::new(10);
        let session = Uuid::new_v4();
        for _ in 0..5 {
            log.append(|s| op(s, session));
        }
        let recent: Vec<u64> = log.recent(2).iter().map(|o| o.sequence).collect();
        assert_eq!(recent, vec![4, 5]);
        assert_eq!(log.recent(100).len(), 5);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("delete".parse::<OperationKind>().unwrap(), OperationKind::Delete);
        let err = "rotate".parse::<OperationKind>().unwrap_err();
        assert_eq!(err.kind(), "invalid_operation");
    }

    #[test]
    fn test_payload_validation() {
        assert!(EditPayload::insert(0, "hi").validate(OperationKind::Insert).is_ok());
        assert!(EditPayload::insert(0, "").validate(OperationKind::Insert).is_err());
        assert!(EditPayload::delete(3, 0).validate(OperationKind::Delete).is_err());
        assert!(EditPayload::delete(3, 2).validate(OperationKind::Replace).is_err());
        assert!(EditPayload::format(0, 4, serde_json::json!({"bold": true}))
            .validate(OperationKind::Format)
            .is_ok());
        assert!(EditPayload::moved(0, 4, 2).validate(OperationKind::Move).is_err());
        assert!(EditPayload::moved(0, 4, 10).validate(OperationKind::Move).is_ok());
    }

    #[test]
    fn test_payload_range_overflow_rejected() {
        let err = EditPayload::moved(usize::MAX, 2, 0)
            .validate(OperationKind::Move)
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert!(EditPayload::delete(usize::MAX, 1).validate(OperationKind::Delete).is_err());
        assert!(EditPayload::insert(usize::MAX, "x").validate(OperationKind::Insert).is_err());
        assert!(EditPayload::moved(0, 2, usize::MAX).validate(OperationKind::Move).is_err());
        assert!(EditPayload::delete(usize::MAX - 1, 1).validate(OperationKind::Delete).is_ok());
        assert_eq!(EditPayload::delete(usize::MAX, 3).end(), usize::MAX);
    }

    #[test]
    fn test_inserted_len_counts_chars() {
        assert_eq!(EditPayload::insert(0, "héllo").inserted_len(), 5);
    }
}
