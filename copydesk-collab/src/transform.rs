//! Transform step run by the operation broker before an edit is appended.
//!
//! Given an incoming edit O and the operations P that other sessions
//! committed since the submitter's last acknowledged sequence, a transform
//! produces O′ such that applying P then O′ matches what the submitter
//! meant. Anything it cannot settle is reported as a [`Conflict`].
//!
//! Two implementations ship:
//! - [`PositionalTransform`] shifts character offsets through each
//!   concurrent insert/delete/replace/move, in sequence order.
//! - [`PassThrough`] returns the edit unchanged and never reports conflicts.

use std::sync::Arc;

use crate::config::TransformMode;
use crate::oplog::{Conflict, EditPayload, Operation, OperationKind};

/// Result of transforming one edit.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    pub payload: EditPayload,
    pub conflicts: Vec<Conflict>,
}

pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rewrite `payload` against `concurrent`, which is sorted by sequence.
    fn transform(
        &self,
        kind: OperationKind,
        payload: &EditPayload,
        concurrent: &[&Operation],
    ) -> TransformOutcome;
}

pub fn for_mode(mode: TransformMode) -> Arc<dyn Transform> {
    match mode {
        TransformMode::Positional => Arc::new(PositionalTransform),
        TransformMode::PassThrough => Arc::new(PassThrough),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl Transform for PassThrough {
    fn name(&self) -> &'static str {
        "pass_through"
    }

    fn transform(
        &self,
        _kind: OperationKind,
        payload: &EditPayload,
        _concurrent: &[&Operation],
    ) -> TransformOutcome {
        TransformOutcome {
            payload: payload.clone(),
            conflicts: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PositionalTransform;

impl Transform for PositionalTransform {
    fn name(&self) -> &'static str {
        "positional"
    }

    fn transform(
        &self,
        kind: OperationKind,
        payload: &EditPayload,
        concurrent: &[&Operation],
    ) -> TransformOutcome {
        let mut edit = Shape::from_payload(kind, payload);
        let mut conflicts = Vec::new();

        for prior in concurrent {
            let p = prior.effective_payload();
            let collision = match prior.kind {
                OperationKind::Insert => edit.through_insert(p.position, p.inserted_len()),
                OperationKind::Delete => edit.through_delete(p.position, p.length),
                OperationKind::Replace => {
                    let deleted = edit.through_delete(p.position, p.length);
                    let inserted = edit.through_insert(p.position, p.inserted_len());
                    deleted.or(inserted)
                }
                OperationKind::Move => {
                    let target = p.target.unwrap_or(p.position);
                    let landing = if target <= p.position {
                        target
                    } else {
                        target.saturating_sub(p.length)
                    };
                    let moved = edit.through_delete(p.position, p.length);
                    let placed = edit.through_insert(landing, p.length);
                    moved.or(placed)
                }
                OperationKind::Format => edit.through_format(p.position, p.length),
            };

            if let Some(description) = collision {
                conflicts.push(Conflict::new(prior.sequence, description));
            }
        }

        TransformOutcome {
            payload: edit.into_payload(payload),
            conflicts,
        }
    }
}

/// Working copy of the edit's geometry.
struct Shape {
    kind: OperationKind,
    start: usize,
    end: usize,
    target: Option<usize>,
}

impl Shape {
    fn from_payload(kind: OperationKind, payload: &EditPayload) -> Self {
        let end = if kind == OperationKind::Insert {
            payload.position
        } else {
            payload.end()
        };
        Self {
            kind,
            start: payload.position,
            end,
            target: payload.target,
        }
    }

    fn into_payload(self, original: &EditPayload) -> EditPayload {
        let mut out = original.clone();
        out.position = self.start;
        if self.kind != OperationKind::Insert {
            out.length = self.end.saturating_sub(self.start);
        }
        out.target = self.target;
        out
    }

    fn is_ranged(&self) -> bool {
        self.kind != OperationKind::Insert
    }

    /// Shift through `len` characters inserted at `at`.
    fn through_insert(&mut self, at: usize, len: usize) -> Option<String> {
        if len == 0 {
            return None;
        }
        if let Some(t) = self.target.as_mut() {
            if at <= *t {
                *t = t.saturating_add(len);
            }
        }

        if !self.is_ranged() {
            // The earlier-sequenced insert wins position ties.
            if at <= self.start {
                self.start = self.start.saturating_add(len);
                self.end = self.start;
            }
            return None;
        }

        if at <= self.start {
            self.start = self.start.saturating_add(len);
            self.end = self.end.saturating_add(len);
            None
        } else if at < self.end {
            self.end = self.end.saturating_add(len);
            match self.kind {
                OperationKind::Format => None,
                _ => Some(format!(
                    "concurrent insert of {len} chars at {at} landed inside the {} range",
                    self.kind.as_str()
                )),
            }
        } else {
            None
        }
    }

    /// Shift through `len` characters deleted at `at`.
    fn through_delete(&mut self, at: usize, len: usize) -> Option<String> {
        if len == 0 {
            return None;
        }
        let map = |x: usize| {
            if x <= at {
                x
            } else if x >= at.saturating_add(len) {
                x - len
            } else {
                at
            }
        };

        if let Some(t) = self.target.as_mut() {
            *t = map(*t);
        }

        let before = self.end.saturating_sub(self.start);
        self.start = map(self.start);
        self.end = if self.is_ranged() { map(self.end) } else { self.start };
        let lost = before.saturating_sub(self.end.saturating_sub(self.start));

        match self.kind {
            OperationKind::Insert | OperationKind::Delete => None,
            _ if lost > 0 => Some(format!(
                "{lost} chars of the {} range were deleted concurrently",
                self.kind.as_str()
            )),
            _ => None,
        }
    }

    fn through_format(&mut self, at: usize, len: usize) -> Option<String> {
        if self.kind != OperationKind::Format {
            return None;
        }
        let overlaps = at < self.end && self.start < at.saturating_add(len);
        overlaps.then(|| "overlapping concurrent formatting".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn prior(sequence: u64, kind: OperationKind, payload: EditPayload) -> Operation {
        Operation {
            sequence,
            content_id: "c1".into(),
            session_id: Uuid::new_v4(),
            user_id: "other".into(),
            kind,
            payload,
            transformed: None,
            timestamp: 0,
            conflicts: Vec::new(),
        }
    }

    fn run(kind: OperationKind, payload: EditPayload, concurrent: &[Operation]) -> TransformOutcome {
        let refs: Vec<&Operation> = concurrent.iter().collect();
        PositionalTransform.transform(kind, &payload, &refs)
    }

    #[test]
    fn test_pass_through_is_identity() {
        let p = prior(1, OperationKind::Insert, EditPayload::insert(0, "abc"));
        let payload = EditPayload::insert(2, "x");
        let out = PassThrough.transform(OperationKind::Insert, &payload, &[&p]);
        assert_eq!(out.payload, payload);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_insert_after_concurrent_insert_shifts() {
        let p = prior(1, OperationKind::Insert, EditPayload::insert(2, "abc"));
        let out = run(OperationKind::Insert, EditPayload::insert(5, "x"), &[p]);
        assert_eq!(out.payload.position, 8);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_insert_before_concurrent_insert_stays() {
        let p = prior(1, OperationKind::Insert, EditPayload::insert(10, "abc"));
        let out = run(OperationKind::Insert, EditPayload::insert(5, "x"), &[p]);
        assert_eq!(out.payload.position, 5);
    }

    #[test]
    fn test_insert_tie_goes_after_earlier_sequence() {
        let p = prior(1, OperationKind::Insert, EditPayload::insert(4, "ab"));
        let out = run(OperationKind::Insert, EditPayload::insert(4, "x"), &[p]);
        assert_eq!(out.payload.position, 6);
    }

    #[test]
    fn test_insert_inside_deleted_range_collapses() {
        let p = prior(1, OperationKind::Delete, EditPayload::delete(2, 5));
        let out = run(OperationKind::Insert, EditPayload::insert(4, "x"), &[p]);
        assert_eq!(out.payload.position, 2);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_overlapping_deletes_shrink_without_conflict() {
        let p = prior(1, OperationKind::Delete, EditPayload::delete(0, 4));
        let out = run(OperationKind::Delete, EditPayload::delete(2, 4), &[p]);
        assert_eq!(out.payload.position, 0);
        assert_eq!(out.payload.length, 2);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_replace_over_deleted_text_conflicts() {
        let p = prior(7, OperationKind::Delete, EditPayload::delete(3, 4));
        let out = run(OperationKind::Replace, EditPayload::replace(5, 4, "new"), &[p]);
        assert_eq!(out.payload.position, 3);
        assert_eq!(out.payload.length, 2);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].against_sequence, 7);
    }

    #[test]
    fn test_shifts_saturate_near_the_end_of_the_offset_space() {
        let p = prior(1, OperationKind::Insert, EditPayload::insert(0, "abc"));
        let out = run(OperationKind::Delete, EditPayload::delete(usize::MAX - 4, 4), &[p]);
        assert_eq!(out.payload.position, usize::MAX - 1);
        assert_eq!(out.payload.length, 1);

        let p = prior(2, OperationKind::Format, EditPayload::format(usize::MAX - 1, 5, serde_json::json!({})));
        let out = run(OperationKind::Format, EditPayload::format(0, 2, serde_json::json!({})), &[p]);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_insert_inside_delete_range_grows_and_conflicts() {
        let p = prior(2, OperationKind::Insert, EditPayload::insert(5, "zz"));
        let out = run(OperationKind::Delete, EditPayload::delete(3, 4), &[p]);
        assert_eq!(out.payload.position, 3);
        assert_eq!(out.payload.length, 6);
        assert_eq!(out.conflicts.len(), 1);
    }

    #[test]
    fn test_format_overlap_conflicts() {
        let attrs = serde_json::json!({"italic": true});
        let p = prior(3, OperationKind::Format, EditPayload::format(0, 5, attrs.clone()));
        let out = run(OperationKind::Format, EditPayload::format(4, 2, attrs), &[p]);
        assert_eq!(out.payload.position, 4);
        assert_eq!(out.conflicts.len(), 1);
    }

    #[test]
    fn test_chained_concurrent_operations() {
        let ops = vec![
            prior(1, OperationKind::Insert, EditPayload::insert(0, "hello ")),
            prior(2, OperationKind::Delete, EditPayload::delete(0, 2)),
        ];
        let out = run(OperationKind::Insert, EditPayload::insert(3, "!"), &ops);
        // 3 -> 9 after the insert, -> 7 after the delete.
        assert_eq!(out.payload.position, 7);
    }

    #[test]
    fn test_move_target_tracks_inserts() {
        let p = prior(1, OperationKind::Insert, EditPayload::insert(0, "ab"));
        let out = run(OperationKind::Move, EditPayload::moved(4, 2, 10), &[p]);
        assert_eq!(out.payload.position, 6);
        assert_eq!(out.payload.target, Some(12));
    }

    #[test]
    fn test_for_mode() {
        assert_eq!(for_mode(TransformMode::Positional).name(), "positional");
        assert_eq!(for_mode(TransformMode::PassThrough).name(), "pass_through");
    }
}
