//! The authoritative path tree.
//!
//! A segment-keyed tree where every node may carry a value and always carries
//! the maximum timestamp of its subtree. Children live in a `BTreeMap`, which
//! is what makes `search` deterministic and sorted.
//!
//! Two structural invariants hold after every mutation:
//! - a node exists only if it has a value or a child (no empty interiors);
//! - a node's timestamp is >= every descendant's timestamp.

use std::collections::BTreeMap;

use apteryx_common::path;
use apteryx_common::wire::TreeMsg;
use bytes::Bytes;

#[derive(Default)]
struct Node {
    value: Option<Bytes>,
    ts: u64,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    fn find(&self, segments: &[&str]) -> Option<&Node> {
        let mut node = self;
        for segment in segments {
            node = node.children.get(*segment)?;
        }
        Some(node)
    }
}

#[derive(Default)]
pub struct Db {
    root: Node,
}

impl Db {
    pub fn new() -> Self {
        Db::default()
    }

    /// Create or overwrite the value at `path`, stamping the leaf and every
    /// ancestor with `ts`. Intermediate nodes are created valueless.
    pub fn add(&mut self, path: &str, value: Bytes, ts: u64) {
        let segments = path::split(path);
        let mut node = &mut self.root;
        node.ts = node.ts.max(ts);
        for segment in segments {
            node = node.children.entry(segment.to_string()).or_default();
            node.ts = node.ts.max(ts);
        }
        node.value = Some(value);
    }

    /// Clear the value at `path` and remove the node (and any ancestors left
    /// with neither value nor children). Surviving ancestors are stamped.
    pub fn delete(&mut self, path: &str, ts: u64) -> Option<Bytes> {
        let segments = path::split(path);
        let removed = delete_in(&mut self.root, &segments, ts)?;
        self.root.ts = self.root.ts.max(ts);
        Some(removed)
    }

    /// Remove the whole subtree at `path`. Returns the (sorted) paths of
    /// every leaf that held a value, for watcher fan-out.
    pub fn prune(&mut self, path: &str, ts: u64) -> Vec<String> {
        let mut removed = Vec::new();
        if path == "/" {
            collect_values(&self.root, "/", &mut removed);
            self.root.children.clear();
            self.root.value = None;
            self.root.ts = self.root.ts.max(ts);
            removed.sort();
            return removed;
        }

        let segments = path::split(path);
        let (parent_segs, last) = (&segments[..segments.len() - 1], segments[segments.len() - 1]);

        // Locate the parent; nothing to do if the subtree is absent.
        if let Some(node) = find_mut(&mut self.root, parent_segs) {
            if let Some(subtree) = node.children.remove(last) {
                collect_values(&subtree, path, &mut removed);
                self.stamp_and_cleanup(parent_segs, ts);
            }
        }
        removed.sort();
        removed
    }

    pub fn get(&self, path: &str) -> Option<&Bytes> {
        let segments = path::split(path);
        self.root.find(&segments)?.value.as_ref()
    }

    pub fn exists(&self, path: &str) -> bool {
        let segments = path::split(path);
        self.root.find(&segments).is_some()
    }

    /// Immediate children of `base`, as full paths, in sorted order.
    pub fn search(&self, base: &str) -> Vec<String> {
        let segments = path::split(base);
        match self.root.find(&segments) {
            Some(node) => node
                .children
                .keys()
                .map(|name| path::join(base, name))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Child segment names only.
    pub fn child_names(&self, base: &str) -> Vec<String> {
        let segments = path::split(base);
        match self.root.find(&segments) {
            Some(node) => node.children.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot the subtree at `path`. `None` if nothing is stored there.
    pub fn traverse(&self, path: &str) -> Option<TreeMsg> {
        let segments = path::split(path);
        let node = self.root.find(&segments)?;
        Some(snapshot(node, path.to_string()))
    }

    /// Maximum timestamp in the subtree at `path`, 0 if absent.
    pub fn timestamp(&self, path: &str) -> u64 {
        let segments = path::split(path);
        self.root.find(&segments).map(|n| n.ts).unwrap_or(0)
    }

    /// Approximate byte cost of the subtree at `path`.
    pub fn memuse(&self, path: &str) -> u64 {
        let segments = path::split(path);
        match self.root.find(&segments) {
            Some(node) => memuse_in(node) + path.len() as u64,
            None => 0,
        }
    }

    /// Re-stamp the ancestors named by `parent_segs` and drop any that ended
    /// up with neither value nor children.
    fn stamp_and_cleanup(&mut self, parent_segs: &[&str], ts: u64) {
        fn walk(node: &mut Node, segs: &[&str], ts: u64) {
            node.ts = node.ts.max(ts);
            if let [first, rest @ ..] = segs
                && let Some(child) = node.children.get_mut(*first)
            {
                walk(child, rest, ts);
                if child.is_empty() {
                    node.children.remove(*first);
                }
            }
        }
        walk(&mut self.root, parent_segs, ts);
    }
}

fn find_mut<'a>(node: &'a mut Node, segs: &[&str]) -> Option<&'a mut Node> {
    let [first, rest @ ..] = segs else {
        return Some(node);
    };
    find_mut(node.children.get_mut(*first)?, rest)
}

fn delete_in(node: &mut Node, segs: &[&str], ts: u64) -> Option<Bytes> {
    let [first, rest @ ..] = segs else {
        return node.value.take();
    };
    let child = node.children.get_mut(*first)?;
    let removed = delete_in(child, rest, ts)?;
    if child.is_empty() {
        node.children.remove(*first);
    } else {
        child.ts = child.ts.max(ts);
    }
    node.ts = node.ts.max(ts);
    Some(removed)
}

fn collect_values(node: &Node, at: &str, out: &mut Vec<String>) {
    if node.value.is_some() {
        out.push(at.to_string());
    }
    for (name, child) in &node.children {
        collect_values(child, &path::join(at, name), out);
    }
}

fn snapshot(node: &Node, name: String) -> TreeMsg {
    TreeMsg {
        name,
        value: node.value.clone(),
        children: node
            .children
            .iter()
            .map(|(seg, child)| snapshot(child, seg.clone()))
            .collect(),
    }
}

fn memuse_in(node: &Node) -> u64 {
    let mut total = std::mem::size_of::<Node>() as u64
        + node.value.as_ref().map(|v| v.len() as u64).unwrap_or(0);
    for (name, child) in &node.children {
        total += name.len() as u64 + memuse_in(child);
    }
    total
}
