//! Authoritative per-query snapshot, maintained by applying observe
//! events. Ordered mode keeps documents in a linked node arena indexed
//! by id so `moved_before` is cheap; unordered mode is a plain map.

use std::collections::HashMap;

use ddp_engine_proto::Document;
use ddp_engine_proto::apply_patch;

use crate::ObserveError;
use crate::observe::ObserveEvent;

/// Ordered document container with O(1) id lookup and relocation.
///
/// Nodes live in a slab; order is a doubly-linked list through the slab,
/// and an id index maps straight to the node.
#[derive(Debug, Default, Clone)]
pub struct OrderedDocMap {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct Node {
    doc: Document,
    prev: Option<usize>,
    next: Option<usize>,
}

impl OrderedDocMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_docs(docs: Vec<Document>) -> Self {
        let mut map = Self::new();
        for doc in docs {
            map.insert_before(doc, None);
        }
        map
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(
        &self,
        id: &str,
    ) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(
        &self,
        id: &str,
    ) -> Option<&Document> {
        self.index.get(id).map(|&slot| self.node(slot)).map(|n| &n.doc)
    }

    pub fn get_mut(
        &mut self,
        id: &str,
    ) -> Option<&mut Document> {
        let slot = *self.index.get(id)?;
        self.nodes[slot].as_mut().map(|n| &mut n.doc)
    }

    /// Insert before `before_id`; `None` appends at the end.
    pub fn insert_before(
        &mut self,
        doc: Document,
        before_id: Option<&str>,
    ) {
        let slot = self.alloc(Node {
            doc,
            prev: None,
            next: None,
        });
        self.link_before(slot, before_id);
        let id = self.node(slot).doc.id.clone();
        self.index.insert(id, slot);
    }

    /// Relocate `id` before `before_id`; `None` moves it to the end.
    pub fn move_before(
        &mut self,
        id: &str,
        before_id: Option<&str>,
    ) -> bool {
        let Some(&slot) = self.index.get(id) else {
            return false;
        };
        if before_id == Some(id) {
            return true;
        }
        self.unlink(slot);
        self.link_before(slot, before_id);
        true
    }

    pub fn remove(
        &mut self,
        id: &str,
    ) -> Option<Document> {
        let slot = self.index.remove(id)?;
        self.unlink(slot);
        let node = self.nodes[slot].take().expect("slab slot occupied");
        self.free.push(slot);
        Some(node.doc)
    }

    /// Documents in list order.
    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        OrderedIter {
            map: self,
            cursor: self.head,
        }
    }

    fn node(
        &self,
        slot: usize,
    ) -> &Node {
        self.nodes[slot].as_ref().expect("slab slot occupied")
    }

    fn alloc(
        &mut self,
        node: Node,
    ) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn link_before(
        &mut self,
        slot: usize,
        before_id: Option<&str>,
    ) {
        let before_slot = before_id.and_then(|id| self.index.get(id).copied());
        match before_slot {
            Some(next) => {
                let prev = self.node(next).prev;
                self.nodes[slot].as_mut().expect("slab slot occupied").prev = prev;
                self.nodes[slot].as_mut().expect("slab slot occupied").next = Some(next);
                self.nodes[next].as_mut().expect("slab slot occupied").prev = Some(slot);
                match prev {
                    Some(prev) => {
                        self.nodes[prev].as_mut().expect("slab slot occupied").next = Some(slot);
                    }
                    None => self.head = Some(slot),
                }
            }
            None => {
                // Append at the tail (covers an unknown before_id too,
                // which the diff contract never produces).
                let prev = self.tail;
                {
                    let node = self.nodes[slot].as_mut().expect("slab slot occupied");
                    node.prev = prev;
                    node.next = None;
                }
                match prev {
                    Some(prev) => {
                        self.nodes[prev].as_mut().expect("slab slot occupied").next = Some(slot);
                    }
                    None => self.head = Some(slot),
                }
                self.tail = Some(slot);
            }
        }
    }

    fn unlink(
        &mut self,
        slot: usize,
    ) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => {
                self.nodes[prev].as_mut().expect("slab slot occupied").next = next;
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                self.nodes[next].as_mut().expect("slab slot occupied").prev = prev;
            }
            None => self.tail = prev,
        }
        let node = self.nodes[slot].as_mut().expect("slab slot occupied");
        node.prev = None;
        node.next = None;
    }
}

struct OrderedIter<'a> {
    map: &'a OrderedDocMap,
    cursor: Option<usize>,
}

impl<'a> Iterator for OrderedIter<'a> {
    type Item = &'a Document;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let node = self.map.node(slot);
        self.cursor = node.next;
        Some(&node.doc)
    }
}

/// The multiplexer's cache: a current snapshot kept consistent by
/// applying every event exactly once, before fan-out.
#[derive(Debug)]
pub enum CachingChangeObserver {
    Ordered(OrderedDocMap),
    Unordered(HashMap<String, Document>),
}

impl CachingChangeObserver {
    pub fn new(ordered: bool) -> Self {
        if ordered {
            Self::Ordered(OrderedDocMap::new())
        } else {
            Self::Unordered(HashMap::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Ordered(docs) => docs.len(),
            Self::Unordered(docs) => docs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache contents, in order for ordered mode.
    pub fn docs(&self) -> Vec<Document> {
        match self {
            Self::Ordered(docs) => docs.iter().cloned().collect(),
            Self::Unordered(docs) => docs.values().cloned().collect(),
        }
    }

    /// Apply one event. The cache is never observable mid-application:
    /// each arm completes fully or returns an error having changed
    /// nothing.
    pub fn apply(
        &mut self,
        event: &ObserveEvent,
    ) -> Result<(), ObserveError> {
        match (self, event) {
            (cache, ObserveEvent::InitialAdds { docs }) => {
                match cache {
                    Self::Ordered(current) => *current = OrderedDocMap::from_docs(docs.clone()),
                    Self::Unordered(current) => {
                        *current = docs.iter().map(|d| (d.id.clone(), d.clone())).collect();
                    }
                }
                Ok(())
            }
            (Self::Unordered(docs), ObserveEvent::Added { id, fields }) => {
                docs.insert(id.clone(), Document::new(id.clone(), fields.clone()));
                Ok(())
            }
            (Self::Ordered(_), ObserveEvent::Added { .. }) => Err(ObserveError::WrongMode {
                kind: "added",
            }),
            (Self::Ordered(docs), ObserveEvent::AddedBefore { id, fields, before }) => {
                docs.insert_before(Document::new(id.clone(), fields.clone()), before.as_deref());
                Ok(())
            }
            (Self::Unordered(_), ObserveEvent::AddedBefore { .. }) => Err(ObserveError::WrongMode {
                kind: "added_before",
            }),
            (cache, ObserveEvent::Changed { id, patch }) => {
                let fields = match cache {
                    Self::Ordered(docs) => docs.get_mut(id).map(|d| &mut d.fields),
                    Self::Unordered(docs) => docs.get_mut(id).map(|d| &mut d.fields),
                };
                match fields {
                    Some(fields) => {
                        apply_patch(fields, patch);
                        Ok(())
                    }
                    None => Err(ObserveError::MissingDocument {
                        id: id.clone(),
                    }),
                }
            }
            (Self::Ordered(docs), ObserveEvent::MovedBefore { id, before }) => {
                if docs.move_before(id, before.as_deref()) {
                    Ok(())
                } else {
                    Err(ObserveError::MissingDocument {
                        id: id.clone(),
                    })
                }
            }
            (Self::Unordered(_), ObserveEvent::MovedBefore { .. }) => Err(ObserveError::WrongMode {
                kind: "moved_before",
            }),
            (cache, ObserveEvent::Removed { id }) => {
                let removed = match cache {
                    Self::Ordered(docs) => docs.remove(id).is_some(),
                    Self::Unordered(docs) => docs.remove(id).is_some(),
                };
                if removed {
                    Ok(())
                } else {
                    Err(ObserveError::MissingDocument {
                        id: id.clone(),
                    })
                }
            }
        }
    }
}
