//! Two-sequence diff with stable id-based identity, plus the field-level
//! minimal patch. Used by the polling driver (old poll vs new poll) and
//! by the session rebind path (old view vs new view).

use std::collections::HashMap;

use ddp_engine_proto::Document;
use ddp_engine_proto::FieldPatch;
use ddp_engine_proto::Fields;

/// Receiver of ordered diff output. Operations replay the old sequence
/// into the new one when applied in emission order.
pub trait OrderedDiffObserver {
    fn added_before(
        &mut self,
        doc: &Document,
        before: Option<&str>,
    );
    fn moved_before(
        &mut self,
        id: &str,
        before: Option<&str>,
    );
    fn removed(
        &mut self,
        id: &str,
    );
    fn changed(
        &mut self,
        id: &str,
        patch: &FieldPatch,
    );
}

/// Receiver of unordered diff output.
pub trait UnorderedDiffObserver {
    fn added(
        &mut self,
        doc: &Document,
    );
    fn removed(
        &mut self,
        id: &str,
    );
    fn changed(
        &mut self,
        id: &str,
        patch: &FieldPatch,
    );
}

/// Minimal field-level patch from `old` to `new`: removed fields map to
/// `None`, added or unequal fields to the new value, equal fields are
/// omitted.
pub fn diff_fields(
    old: &Fields,
    new: &Fields,
) -> FieldPatch {
    let mut patch = FieldPatch::new();
    for key in old.keys() {
        if !new.contains_key(key) {
            patch.insert(key.clone(), None);
        }
    }
    for (key, value) in new {
        if old.get(key) != Some(value) {
            patch.insert(key.clone(), Some(value.clone()));
        }
    }
    patch
}

/// Diff two id-keyed maps, emitting `added`/`removed` for id differences
/// and per-field `changed` for value differences.
pub fn diff_unordered(
    old: &HashMap<String, Document>,
    new: &HashMap<String, Document>,
    observer: &mut impl UnorderedDiffObserver,
) {
    for (id, old_doc) in old {
        match new.get(id) {
            None => observer.removed(id),
            Some(new_doc) => {
                let patch = diff_fields(&old_doc.fields, &new_doc.fields);
                if !patch.is_empty() {
                    observer.changed(id, &patch);
                }
            }
        }
    }
    for (id, doc) in new {
        if !old.contains_key(id) {
            observer.added(doc);
        }
    }
}

/// Diff two ordered sequences.
///
/// Documents present in both sequences that form a longest increasing
/// subsequence of old positions (in new order) are treated as unmoved
/// anchors; everything else is emitted as `moved_before`/`added_before`
/// relative to the next anchor. Removals are emitted first so anchors
/// always exist in the replayed sequence when referenced.
pub fn diff_ordered(
    old: &[Document],
    new: &[Document],
    observer: &mut impl OrderedDiffObserver,
) {
    let old_position: HashMap<&str, usize> =
        old.iter().enumerate().map(|(i, d)| (d.id.as_str(), i)).collect();
    let new_ids: HashMap<&str, ()> = new.iter().map(|d| (d.id.as_str(), ())).collect();

    for doc in old {
        if !new_ids.contains_key(doc.id.as_str()) {
            observer.removed(&doc.id);
        }
    }

    // Positions-in-old of the shared documents, in new order.
    let shared: Vec<(usize, usize)> = new
        .iter()
        .enumerate()
        .filter_map(|(new_idx, doc)| {
            old_position.get(doc.id.as_str()).map(|&old_idx| (new_idx, old_idx))
        })
        .collect();
    let unmoved_new_indices = longest_increasing_run(&shared);

    // For each position in new, the id of the next unmoved document at
    // or after it (the insertion anchor).
    let mut next_anchor: Vec<Option<&str>> = vec![None; new.len() + 1];
    for i in (0..new.len()).rev() {
        next_anchor[i] = if unmoved_new_indices.contains(&i) {
            Some(new[i].id.as_str())
        } else {
            next_anchor[i + 1]
        };
    }

    for (i, doc) in new.iter().enumerate() {
        let id = doc.id.as_str();
        match old_position.get(id) {
            Some(&old_idx) => {
                if !unmoved_new_indices.contains(&i) {
                    observer.moved_before(id, next_anchor[i + 1]);
                }
                let patch = diff_fields(&old[old_idx].fields, &doc.fields);
                if !patch.is_empty() {
                    observer.changed(id, &patch);
                }
            }
            None => {
                observer.added_before(doc, next_anchor[i + 1]);
            }
        }
    }
}

/// Indices (first components) of a longest strictly increasing
/// subsequence of the second components. Classic patience algorithm.
fn longest_increasing_run(pairs: &[(usize, usize)]) -> std::collections::HashSet<usize> {
    let mut tails: Vec<usize> = Vec::new(); // indices into pairs
    let mut predecessor: Vec<Option<usize>> = vec![None; pairs.len()];

    for (i, &(_, value)) in pairs.iter().enumerate() {
        let pos = tails.partition_point(|&t| pairs[t].1 < value);
        if pos > 0 {
            predecessor[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }

    let mut result = std::collections::HashSet::new();
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        result.insert(pairs[i].0);
        cursor = predecessor[i];
    }
    result
}
