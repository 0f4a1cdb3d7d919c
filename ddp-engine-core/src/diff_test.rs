//! Unit tests for the diff contract.

use std::collections::HashMap;

use serde_json::json;

use super::diff::OrderedDiffObserver;
use super::diff::UnorderedDiffObserver;
use super::diff::diff_fields;
use super::diff::diff_ordered;
use super::diff::diff_unordered;
use ddp_engine_proto::Document;
use ddp_engine_proto::FieldPatch;
use ddp_engine_proto::apply_patch;

fn doc(
    id: &str,
    fields: serde_json::Value,
) -> Document {
    let mut object = fields;
    object["_id"] = json!(id);
    Document::from_object(object).unwrap()
}

/// Replays ordered diff output onto a copy of the old sequence; the test
/// asserts the replay reproduces the new sequence exactly.
#[derive(Default)]
struct Replayer {
    docs: Vec<Document>,
    ops: Vec<String>,
}

impl Replayer {
    fn position_of(
        &self,
        before: Option<&str>,
    ) -> usize {
        match before {
            Some(anchor) => self
                .docs
                .iter()
                .position(|d| d.id == anchor)
                .unwrap_or_else(|| panic!("anchor {anchor} not present at replay time")),
            None => self.docs.len(),
        }
    }
}

impl OrderedDiffObserver for Replayer {
    fn added_before(
        &mut self,
        doc: &Document,
        before: Option<&str>,
    ) {
        self.ops.push(format!("added_before:{}", doc.id));
        let pos = self.position_of(before);
        self.docs.insert(pos, doc.clone());
    }

    fn moved_before(
        &mut self,
        id: &str,
        before: Option<&str>,
    ) {
        self.ops.push(format!("moved_before:{id}"));
        let from = self.docs.iter().position(|d| d.id == id).expect("moved doc present");
        let doc = self.docs.remove(from);
        let pos = self.position_of(before);
        self.docs.insert(pos, doc);
    }

    fn removed(
        &mut self,
        id: &str,
    ) {
        self.ops.push(format!("removed:{id}"));
        let pos = self.docs.iter().position(|d| d.id == id).expect("removed doc present");
        self.docs.remove(pos);
    }

    fn changed(
        &mut self,
        id: &str,
        patch: &FieldPatch,
    ) {
        self.ops.push(format!("changed:{id}"));
        let doc = self.docs.iter_mut().find(|d| d.id == id).expect("changed doc present");
        apply_patch(&mut doc.fields, patch);
    }
}

fn check_ordered_replay(
    old: Vec<Document>,
    new: Vec<Document>,
) -> Vec<String> {
    let mut replay = Replayer {
        docs: old.clone(),
        ops: Vec::new(),
    };
    diff_ordered(&old, &new, &mut replay);
    assert_eq!(replay.docs, new, "replaying the diff must reproduce the new sequence");
    replay.ops
}

/// Test: field diff emits the minimal patch
#[test]
fn test_diff_fields_minimal() {
    let old = doc("x", json!({"keep": 1, "change": 2, "drop": 3})).fields;
    let new = doc("x", json!({"keep": 1, "change": 20, "fresh": 4})).fields;

    let patch = diff_fields(&old, &new);
    assert_eq!(patch.len(), 3);
    assert_eq!(patch.get("change"), Some(&Some(json!(20))));
    assert_eq!(patch.get("fresh"), Some(&Some(json!(4))));
    assert_eq!(patch.get("drop"), Some(&None));
    assert!(!patch.contains_key("keep"), "unchanged fields are omitted");
}

/// Test: unordered diff classifies ids into added/removed/changed
#[test]
fn test_unordered_diff() {
    #[derive(Default)]
    struct Collect {
        added: Vec<String>,
        removed: Vec<String>,
        changed: Vec<String>,
    }
    impl UnorderedDiffObserver for Collect {
        fn added(
            &mut self,
            doc: &Document,
        ) {
            self.added.push(doc.id.clone());
        }
        fn removed(
            &mut self,
            id: &str,
        ) {
            self.removed.push(id.to_string());
        }
        fn changed(
            &mut self,
            id: &str,
            _patch: &FieldPatch,
        ) {
            self.changed.push(id.to_string());
        }
    }

    let old: HashMap<String, Document> = [
        ("a".to_string(), doc("a", json!({"v": 1}))),
        ("b".to_string(), doc("b", json!({"v": 2}))),
        ("c".to_string(), doc("c", json!({"v": 3}))),
    ]
    .into();
    let new: HashMap<String, Document> = [
        ("b".to_string(), doc("b", json!({"v": 2}))),
        ("c".to_string(), doc("c", json!({"v": 30}))),
        ("d".to_string(), doc("d", json!({"v": 4}))),
    ]
    .into();

    let mut collect = Collect::default();
    diff_unordered(&old, &new, &mut collect);
    assert_eq!(collect.added, vec!["d"]);
    assert_eq!(collect.removed, vec!["a"]);
    assert_eq!(collect.changed, vec!["c"], "identical b emits nothing");
}

/// Test: ordered diff replay across adds, removes, moves and changes
#[test]
fn test_ordered_replay_mixed() {
    let old = vec![
        doc("a", json!({"v": 1})),
        doc("b", json!({"v": 2})),
        doc("c", json!({"v": 3})),
        doc("d", json!({"v": 4})),
    ];
    let new = vec![
        doc("d", json!({"v": 40})),
        doc("a", json!({"v": 1})),
        doc("e", json!({"v": 5})),
        doc("c", json!({"v": 3})),
    ];
    check_ordered_replay(old, new);
}

/// Test: a pure reorder emits only moves
#[test]
fn test_ordered_replay_reorder() {
    let old = vec![doc("a", json!({})), doc("b", json!({})), doc("c", json!({}))];
    let new = vec![doc("c", json!({})), doc("a", json!({})), doc("b", json!({}))];

    let ops = check_ordered_replay(old, new);
    assert_eq!(ops, vec!["moved_before:c"], "one move suffices for a rotation");
}

/// Test: first poll (empty old) emits adds in order
#[test]
fn test_ordered_replay_initial() {
    let new = vec![doc("a", json!({"v": 1})), doc("b", json!({"v": 2}))];
    let ops = check_ordered_replay(Vec::new(), new);
    assert_eq!(ops, vec!["added_before:a", "added_before:b"]);
}

/// Test: emptying the sequence emits removes only
#[test]
fn test_ordered_replay_clear() {
    let old = vec![doc("a", json!({})), doc("b", json!({}))];
    let ops = check_ordered_replay(old, Vec::new());
    assert_eq!(ops, vec!["removed:a", "removed:b"]);
}
