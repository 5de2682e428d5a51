//! The graph itself, without locking or persistence.
//!
//! Nodes live in a `Vec` and refer to each other by index. A name that shows
//! up as a dependency before it is registered gets a placeholder node (no
//! [`NodeInfo`]), so edges can always be stored as indices.

use crate::model::DependencyRecord;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub dep_type: String,
    pub version: String,
    pub is_required: bool,
}
impl NodeInfo {
    pub fn new(dep_type: impl Into<String>, version: impl Into<String>) -> Self {
        Self { dep_type: dep_type.into(), version: version.into(), is_required: true }
    }

    pub fn optional(self) -> Self {
        Self { is_required: false, ..self }
    }
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    info: Option<NodeInfo>,
    depends_on: Vec<usize>,
    depended_on_by: Vec<usize>,
    is_circular: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Arena {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl Arena {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DependencyRecord>) -> Self {
        let mut arena = Self::default();
        for record in records {
            let info = NodeInfo {
                dep_type: record.dep_type.clone(),
                version: record.version.clone(),
                is_required: record.is_required,
            };
            arena.set_node(&record.name, info, &record.depends_on);
        }
        arena.recompute_cycles();
        arena
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            info: None,
            depends_on: Vec::new(),
            depended_on_by: Vec::new(),
            is_circular: false,
        });
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Id of a registered (non-placeholder) node.
    pub fn registered_id(&self, name: &str) -> Option<usize> {
        self.id(name).filter(|&id| self.nodes[id].info.is_some())
    }

    /// Register `name`, replacing its outgoing edges.
    pub fn set_node<S: AsRef<str>>(&mut self, name: &str, info: NodeInfo, depends_on: &[S]) {
        let id = self.intern(name);
        self.clear_edges(id);
        self.nodes[id].info = Some(info);
        for dep in depends_on {
            let target = self.intern(dep.as_ref());
            self.link(id, target);
        }
    }

    /// Turn a registered node back into a placeholder without edges.
    pub fn unset_node(&mut self, id: usize) {
        self.clear_edges(id);
        self.nodes[id].info = None;
    }

    fn clear_edges(&mut self, id: usize) {
        for target in std::mem::take(&mut self.nodes[id].depends_on) {
            self.nodes[target].depended_on_by.retain(|&d| d != id);
        }
    }

    fn link(&mut self, from: usize, to: usize) -> bool {
        if self.nodes[from].depends_on.contains(&to) {
            return false;
        }
        self.nodes[from].depends_on.push(to);
        self.nodes[to].depended_on_by.push(from);
        true
    }

    pub fn add_edge(&mut self, from: usize, to: &str) -> bool {
        let to = self.intern(to);
        self.link(from, to)
    }

    pub fn remove_edge(&mut self, from: usize, to: &str) -> bool {
        let Some(to) = self.id(to) else {
            return false;
        };
        let before = self.nodes[from].depends_on.len();
        self.nodes[from].depends_on.retain(|&d| d != to);
        self.nodes[to].depended_on_by.retain(|&d| d != from);
        self.nodes[from].depends_on.len() != before
    }

    /// Whether a path of zero or more edges leads from `from` to `to`.
    pub fn reaches(&self, from: usize, to: usize) -> bool {
        from == to || self.walk(from, true).contains(&to)
    }

    /// Every node reachable from `start` along dependency edges (`forward`)
    /// or against them, in breadth-first order, without `start` itself.
    pub fn walk(&self, start: usize, forward: bool) -> Vec<usize> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            let node = &self.nodes[id];
            let next = if forward { &node.depends_on } else { &node.depended_on_by };
            for &n in next {
                if seen.insert(n) {
                    out.push(n);
                    queue.push_back(n);
                }
            }
        }
        out
    }

    pub fn direct(&self, id: usize, forward: bool) -> &[usize] {
        match forward {
            true => &self.nodes[id].depends_on,
            false => &self.nodes[id].depended_on_by,
        }
    }

    pub fn name(&self, id: usize) -> &str {
        &self.nodes[id].name
    }

    pub fn is_placeholder(&self, id: usize) -> bool {
        self.nodes[id].info.is_none()
    }

    pub fn is_circular(&self, id: usize) -> bool {
        self.nodes[id].is_circular
    }

    /// Flag every node that sits on a cycle (a strongly connected component
    /// with more than one node, or a self-edge). Iterative Tarjan.
    pub fn recompute_cycles(&mut self) {
        const UNVISITED: usize = usize::MAX;
        let count = self.nodes.len();
        let mut order = vec![UNVISITED; count];
        let mut low = vec![0; count];
        let mut on_stack = vec![false; count];
        let mut stack = Vec::new();
        let mut circular = vec![false; count];
        let mut next = 0;

        for root in 0..count {
            if order[root] != UNVISITED {
                continue;
            }
            order[root] = next;
            low[root] = next;
            next += 1;
            stack.push(root);
            on_stack[root] = true;
            let mut calls = vec![(root, 0usize)];
            while let Some(frame) = calls.last_mut() {
                let v = frame.0;
                if let Some(&w) = self.nodes[v].depends_on.get(frame.1) {
                    frame.1 += 1;
                    if order[w] == UNVISITED {
                        order[w] = next;
                        low[w] = next;
                        next += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        calls.push((w, 0));
                    } else if on_stack[w] {
                        low[v] = low[v].min(order[w]);
                    }
                    continue;
                }
                calls.pop();
                if let Some(&(parent, _)) = calls.last() {
                    low[parent] = low[parent].min(low[v]);
                }
                if low[v] == order[v] {
                    let mut component = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    let cyclic = component.len() > 1 || self.nodes[v].depends_on.contains(&v);
                    for w in component {
                        circular[w] = cyclic;
                    }
                }
            }
        }
        for (node, flag) in self.nodes.iter_mut().zip(circular) {
            node.is_circular = flag;
        }
    }

    pub fn record(&self, id: usize) -> Option<DependencyRecord> {
        let node = &self.nodes[id];
        let info = node.info.as_ref()?;
        let names = |ids: &[usize]| ids.iter().map(|&i| self.nodes[i].name.clone()).collect();
        Some(DependencyRecord {
            name: node.name.clone(),
            dep_type: info.dep_type.clone(),
            version: info.version.clone(),
            depends_on: names(&node.depends_on),
            depended_on_by: names(&node.depended_on_by),
            is_required: info.is_required,
            is_circular: node.is_circular,
        })
    }

    /// Every registered node as a record, keyed by name.
    pub fn records(&self) -> BTreeMap<String, DependencyRecord> {
        (0..self.nodes.len()).filter_map(|id| self.record(id)).map(|r| (r.name.clone(), r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(edges: &[(&str, &[&str])]) -> Arena {
        let mut arena = Arena::default();
        for (name, deps) in edges {
            arena.set_node(name, NodeInfo::new("asset", "1.0"), deps);
        }
        arena.recompute_cycles();
        arena
    }

    fn circular(arena: &Arena) -> Vec<&str> {
        let mut names: Vec<&str> =
            (0..arena.nodes.len()).filter(|&i| arena.is_circular(i)).map(|i| arena.name(i)).collect();
        names.sort();
        names
    }

    #[test]
    fn test_chain_is_acyclic() {
        let arena = arena(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        assert!(circular(&arena).is_empty());
        let a = arena.id("a").unwrap();
        let c = arena.id("c").unwrap();
        assert!(arena.reaches(a, c));
        assert!(!arena.reaches(c, a));
    }

    #[test]
    fn test_cycle_members_only() {
        // d hangs off the cycle but isn't on it.
        let arena = arena(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &["a"])]);
        assert_eq!(circular(&arena), ["a", "b", "c"]);
    }

    #[test]
    fn test_self_edge() {
        let arena = arena(&[("a", &["a"]), ("b", &[])]);
        assert_eq!(circular(&arena), ["a"]);
    }

    #[test]
    fn test_placeholders() {
        let arena = arena(&[("scene", &["tree", "rock"])]);
        let tree = arena.id("tree").unwrap();
        assert!(arena.is_placeholder(tree));
        assert!(arena.registered_id("tree").is_none());
        assert_eq!(arena.records().len(), 1);
        assert_eq!(arena.direct(tree, false), [arena.id("scene").unwrap()]);
    }

    #[test]
    fn test_reregister_replaces_edges() {
        let mut arena = arena(&[("a", &["b", "c"])]);
        arena.set_node("a", NodeInfo::new("asset", "2.0"), &["c"]);
        let b = arena.id("b").unwrap();
        assert!(arena.direct(b, false).is_empty());
        assert_eq!(arena.record(arena.id("a").unwrap()).unwrap().depends_on, ["c"]);
    }

    #[test]
    fn test_walk_both_ways() {
        let arena = arena(&[("a", &["b", "c"]), ("b", &["d"]), ("c", &["d"])]);
        let names = |ids: Vec<usize>| ids.into_iter().map(|i| arena.name(i).to_string()).collect::<Vec<_>>();
        assert_eq!(names(arena.walk(arena.id("a").unwrap(), true)), ["b", "c", "d"]);
        assert_eq!(names(arena.walk(arena.id("d").unwrap(), false)), ["b", "c", "a"]);
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        let names: Vec<String> = (0..20_000).map(|i| format!("n{i}")).collect();
        let mut arena = Arena::default();
        for pair in names.windows(2) {
            arena.set_node(&pair[0], NodeInfo::new("asset", "1.0"), &pair[1..]);
        }
        arena.recompute_cycles();
        assert!(circular(&arena).is_empty());
    }
}
