//! Arena of context nodes.
//!
//! Slots (provided values) and memos (derived values) live in one `Vec`, addressed by
//! `NodeId`. Each node keeps the ids of the nodes that read it (`dependents`), so a
//! replaced slot can invalidate everything derived from it without closures capturing
//! ambient state.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(usize);

/// A read recorded while computing a memo: which node, at which version.
pub(crate) type Dependency = (NodeId, u64);

enum NodeKind {
    Slot {
        value: Option<AnyValue>,
    },
    Memo {
        cached: Option<AnyValue>,
        deps: Vec<Dependency>,
    },
}

struct Node {
    name: String,
    version: u64,
    kind: NodeKind,
    dependents: Vec<NodeId>,
}

#[derive(Default)]
pub(crate) struct Graph {
    nodes: Vec<Node>,
    slots: HashMap<&'static str, NodeId>,
}

impl Graph {
    pub(crate) fn slot(&mut self, name: &'static str) -> NodeId {
        if let Some(id) = self.slots.get(name) {
            return *id;
        }
        let id = self.push(name.to_string(), NodeKind::Slot { value: None });
        self.slots.insert(name, id);
        id
    }

    pub(crate) fn memo(&mut self, name: String) -> NodeId {
        self.push(
            name,
            NodeKind::Memo {
                cached: None,
                deps: Vec::new(),
            },
        )
    }

    fn push(&mut self, name: String, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            name,
            version: 0,
            kind,
            dependents: Vec::new(),
        });
        id
    }

    pub(crate) fn version(&self, id: NodeId) -> u64 {
        self.nodes[id.0].version
    }

    pub(crate) fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    /// Current value of a slot, together with its version.
    pub(crate) fn read_slot(&self, id: NodeId) -> (Option<AnyValue>, u64) {
        let node = &self.nodes[id.0];
        match &node.kind {
            NodeKind::Slot { value } => (value.clone(), node.version),
            NodeKind::Memo { .. } => (None, node.version),
        }
    }

    /// Replace a slot value and invalidate its dependents. Returns the previous value.
    pub(crate) fn write_slot(&mut self, id: NodeId, next: Option<AnyValue>) -> Option<AnyValue> {
        let node = &mut self.nodes[id.0];
        node.version += 1;
        let previous = match &mut node.kind {
            NodeKind::Slot { value } => std::mem::replace(value, next),
            NodeKind::Memo { .. } => None,
        };
        self.invalidate_dependents(id);
        previous
    }

    /// Cached memo value, if it is still valid.
    pub(crate) fn fresh(&self, id: NodeId) -> Option<AnyValue> {
        let NodeKind::Memo { cached, deps } = &self.nodes[id.0].kind else {
            return None;
        };
        let cached = cached.as_ref()?;
        let current = deps
            .iter()
            .all(|(dep, seen)| self.nodes[dep.0].version == *seen);
        current.then(|| cached.clone())
    }

    /// Store a computed memo value.
    ///
    /// If any dependency changed while the value was being computed, the value is not
    /// cached (the caller still gets it) and the next read recomputes.
    pub(crate) fn store(&mut self, id: NodeId, value: AnyValue, deps: Vec<Dependency>) {
        let stale = deps
            .iter()
            .any(|(dep, seen)| self.nodes[dep.0].version != *seen);
        if stale {
            return;
        }
        for (dep, _) in &deps {
            let dependents = &mut self.nodes[dep.0].dependents;
            if !dependents.contains(&id) {
                dependents.push(id);
            }
        }
        let node = &mut self.nodes[id.0];
        node.version += 1;
        node.kind = NodeKind::Memo {
            cached: Some(value),
            deps,
        };
    }

    /// Drop a memo's cached value and everything derived from it.
    pub(crate) fn invalidate(&mut self, id: NodeId) {
        let node = &mut self.nodes[id.0];
        if let NodeKind::Memo { cached, .. } = &mut node.kind
            && cached.take().is_some()
        {
            node.version += 1;
        }
        self.invalidate_dependents(id);
    }

    fn invalidate_dependents(&mut self, root: NodeId) {
        let mut pending = std::mem::take(&mut self.nodes[root.0].dependents);
        while let Some(id) = pending.pop() {
            let node = &mut self.nodes[id.0];
            if let NodeKind::Memo { cached, .. } = &mut node.kind
                && cached.take().is_some()
            {
                node.version += 1;
                pending.append(&mut node.dependents);
            }
        }
    }

    pub(crate) fn is_cached(&self, id: NodeId) -> bool {
        matches!(&self.nodes[id.0].kind, NodeKind::Memo { cached: Some(_), .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(n: u32) -> AnyValue {
        Arc::new(n)
    }

    #[test]
    fn slot_write_invalidates_transitively() {
        let mut graph = Graph::default();
        let slot = graph.slot("project");
        graph.write_slot(slot, Some(value(1)));

        let inner = graph.memo("inner".into());
        let outer = graph.memo("outer".into());
        graph.store(inner, value(10), vec![(slot, graph.version(slot))]);
        graph.store(outer, value(100), vec![(inner, graph.version(inner))]);
        assert!(graph.fresh(outer).is_some());

        graph.write_slot(slot, Some(value(2)));
        assert!(!graph.is_cached(inner));
        assert!(!graph.is_cached(outer));
    }

    #[test]
    fn store_skips_values_computed_from_stale_reads() {
        let mut graph = Graph::default();
        let slot = graph.slot("project");
        let seen = graph.version(slot);
        let memo = graph.memo("derived".into());

        graph.write_slot(slot, Some(value(1)));
        graph.store(memo, value(10), vec![(slot, seen)]);
        assert!(graph.fresh(memo).is_none());
    }

    #[test]
    fn slots_are_registered_once_per_name() {
        let mut graph = Graph::default();
        let a = graph.slot("a");
        let b = graph.slot("a");
        assert_eq!(a, b);
        assert_eq!(graph.name(a), "a");
    }
}
