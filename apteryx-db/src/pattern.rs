//! Pattern matching for callback dispatch.
//!
//! Patterns are paths where any segment may be the wildcard `*` (matches
//! exactly one segment). A trailing `/` means "immediate children of" and is
//! canonicalised to a trailing `*` on insert, which has identical matching
//! semantics. Patterns live in a trie keyed by segment with a distinguished
//! wildcard child; matching walks literal and wildcard branches at every
//! level.
//!
//! Dispatch order is most-specific-first: at the first segment where two
//! matching patterns differ, the literal one sorts before the wildcard one.

use std::collections::BTreeMap;

use apteryx_common::path;

struct PatternNode<T> {
    literal: BTreeMap<String, PatternNode<T>>,
    wildcard: Option<Box<PatternNode<T>>>,
    items: Vec<T>,
}

impl<T> Default for PatternNode<T> {
    fn default() -> Self {
        PatternNode::new()
    }
}

impl<T> PatternNode<T> {
    fn new() -> Self {
        PatternNode {
            literal: BTreeMap::new(),
            wildcard: None,
            items: Vec::new(),
        }
    }

    fn has_items(&self) -> bool {
        !self.items.is_empty()
            || self.literal.values().any(|n| n.has_items())
            || self.wildcard.as_ref().is_some_and(|n| n.has_items())
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty() && self.literal.is_empty() && self.wildcard.is_none()
    }
}

/// Split a pattern into canonical segments (`/a/b/` becomes `a, b, *`).
fn canonical(pattern: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = path::split(pattern).into_vec();
    if pattern.len() > 1 && pattern.ends_with('/') {
        segments.push("*");
    }
    segments
}

/// What `level()` found for one search base.
pub struct LevelHits<T> {
    /// Patterns that enumerate the whole level (`base/` or `base/*`).
    pub enumerators: Vec<T>,
    /// Concrete next segments contributed by literal pattern continuations.
    pub children: Vec<String>,
}

/// One matched item together with the shape of the pattern that matched,
/// used for specificity ordering.
struct Match<T> {
    wildcards: Vec<bool>,
    item: T,
}

pub struct PatternSet<T> {
    root: PatternNode<T>,
}

impl<T> Default for PatternSet<T> {
    fn default() -> Self {
        PatternSet {
            root: PatternNode::new(),
        }
    }
}

impl<T: Clone> PatternSet<T> {
    pub fn new() -> Self {
        PatternSet::default()
    }

    pub fn insert(&mut self, pattern: &str, item: T) {
        let mut node = &mut self.root;
        for segment in canonical(pattern) {
            node = if path::is_wildcard(segment) {
                &mut **node
                    .wildcard
                    .get_or_insert_with(|| Box::new(PatternNode::new()))
            } else {
                node.literal.entry(segment.to_string()).or_default()
            };
        }
        node.items.push(item);
    }

    /// Remove every item at `pattern` for which `pred` returns true, pruning
    /// trie branches left empty.
    pub fn remove<F: Fn(&T) -> bool>(&mut self, pattern: &str, pred: F) {
        fn walk<T, F: Fn(&T) -> bool>(node: &mut PatternNode<T>, segs: &[&str], pred: &F) {
            let [first, rest @ ..] = segs else {
                node.items.retain(|item| !pred(item));
                return;
            };
            if path::is_wildcard(first) {
                if let Some(child) = node.wildcard.as_mut() {
                    walk(child, rest, pred);
                    if child.is_empty() {
                        node.wildcard = None;
                    }
                }
            } else if let Some(child) = node.literal.get_mut(*first) {
                walk(child, rest, pred);
                if child.is_empty() {
                    node.literal.remove(*first);
                }
            }
        }
        walk(&mut self.root, &canonical(pattern), &pred);
    }

    /// Items whose pattern covers exactly `path`, most specific first.
    pub fn matching(&self, target: &str) -> Vec<T> {
        let segments = path::split(target);
        let mut matches = Vec::new();
        collect_matches(&self.root, &segments, &mut Vec::new(), &mut matches);
        order(matches)
    }

    /// Items whose pattern covers `path` or any prefix of it, which is how
    /// tree watchers registered on an ancestor observe deeper writes.
    /// Deepest (most specific) first.
    pub fn covering(&self, target: &str) -> Vec<T> {
        let segments = path::split(target);
        let mut matches = Vec::new();
        collect_covering(&self.root, &segments, &mut Vec::new(), &mut matches);
        matches.sort_by(|a, b| {
            b.wildcards
                .len()
                .cmp(&a.wildcards.len())
                .then_with(|| a.wildcards.cmp(&b.wildcards))
        });
        matches.into_iter().map(|m| m.item).collect()
    }

    /// For a search of the children of `base`: the patterns that enumerate
    /// that level and the concrete child names contributed by literal
    /// continuations.
    pub fn level(&self, base: &str) -> LevelHits<T> {
        let segments = path::split(base);
        let mut hits = LevelHits {
            enumerators: Vec::new(),
            children: Vec::new(),
        };
        let mut terminals = Vec::new();
        collect_terminals(&self.root, &segments, &mut terminals);
        for node in terminals {
            if let Some(wild) = &node.wildcard {
                hits.enumerators.extend(wild.items.iter().cloned());
            }
            for (name, child) in &node.literal {
                if child.has_items() {
                    hits.children.push(name.clone());
                }
            }
        }
        hits.children.sort();
        hits.children.dedup();
        hits
    }

    /// Could any pattern match `path` or something beneath it?
    pub fn intersects(&self, path_str: &str) -> bool {
        let segments = path::split(path_str);
        let mut terminals = Vec::new();
        collect_terminals(&self.root, &segments, &mut terminals);
        terminals.iter().any(|n| n.has_items())
    }
}

fn collect_matches<'a, T: Clone>(
    node: &'a PatternNode<T>,
    segs: &[&str],
    shape: &mut Vec<bool>,
    out: &mut Vec<Match<T>>,
) {
    let [first, rest @ ..] = segs else {
        out.extend(node.items.iter().cloned().map(|item| Match {
            wildcards: shape.clone(),
            item,
        }));
        return;
    };
    if let Some(child) = node.literal.get(*first) {
        shape.push(false);
        collect_matches(child, rest, shape, out);
        shape.pop();
    }
    if let Some(child) = &node.wildcard {
        shape.push(true);
        collect_matches(child, rest, shape, out);
        shape.pop();
    }
}

fn collect_covering<'a, T: Clone>(
    node: &'a PatternNode<T>,
    segs: &[&str],
    shape: &mut Vec<bool>,
    out: &mut Vec<Match<T>>,
) {
    out.extend(node.items.iter().cloned().map(|item| Match {
        wildcards: shape.clone(),
        item,
    }));
    let [first, rest @ ..] = segs else {
        return;
    };
    if let Some(child) = node.literal.get(*first) {
        shape.push(false);
        collect_covering(child, rest, shape, out);
        shape.pop();
    }
    if let Some(child) = &node.wildcard {
        shape.push(true);
        collect_covering(child, rest, shape, out);
        shape.pop();
    }
}

fn collect_terminals<'a, T>(
    node: &'a PatternNode<T>,
    segs: &[&str],
    out: &mut Vec<&'a PatternNode<T>>,
) {
    let [first, rest @ ..] = segs else {
        out.push(node);
        return;
    };
    if let Some(child) = node.literal.get(*first) {
        collect_terminals(child, rest, out);
    }
    if let Some(child) = &node.wildcard {
        collect_terminals(child, rest, out);
    }
}

/// Specificity order: compare pattern shapes segment by segment, literal
/// before wildcard. All shapes have the target's length here.
fn order<T>(mut matches: Vec<Match<T>>) -> Vec<T> {
    matches.sort_by(|a, b| a.wildcards.cmp(&b.wildcards));
    matches.into_iter().map(|m| m.item).collect()
}
