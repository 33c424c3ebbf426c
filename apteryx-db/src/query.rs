//! Template-projected reads and value-matched enumeration.
//!
//! These are built on the same resolution primitives as `get`/`search`, so
//! providers fill leaf values and (for `find`) indexers extend the namespace
//! that wildcard segments expand over.

use apteryx_common::error::AptError;
use apteryx_common::path;
use apteryx_common::wire::TreeMsg;
use bytes::Bytes;

use crate::counters::Counters;
use crate::engine::Engine;

impl Engine {
    /// Project the store through a template: interior template nodes select,
    /// `*` expands to every stored child at that level, leaves ask for
    /// values. Valueless results are omitted entirely.
    pub fn query(&self, template: &TreeMsg) -> Result<Option<TreeMsg>, AptError> {
        Counters::bump(&self.counters.query);
        let base = if template.name.is_empty() || template.name == "/" {
            "/"
        } else {
            path::validate_subtree(&template.name)?;
            template.name.as_str()
        };
        let children = self.project(base, &template.children);
        if children.is_empty() {
            return Ok(None);
        }
        Ok(Some(TreeMsg {
            name: base.to_string(),
            value: None,
            children,
        }))
    }

    fn project(&self, base: &str, templates: &[TreeMsg]) -> Vec<TreeMsg> {
        let mut out = Vec::new();
        for template in templates {
            let names: Vec<String> = if path::is_wildcard(&template.name) {
                self.db.read().unwrap().child_names(base)
            } else {
                vec![template.name.clone()]
            };
            for name in names {
                let full = path::join(base, &name);
                if template.children.is_empty() {
                    self.refresh_path(&full);
                    if let Some(value) = self.resolve(&full) {
                        out.push(TreeMsg::leaf(name.clone(), value));
                    }
                } else {
                    let children = self.project(&full, &template.children);
                    if !children.is_empty() {
                        out.push(TreeMsg::node(name.clone(), children));
                    }
                }
            }
        }
        out
    }

    /// All paths matching `pattern` whose value equals `value`. The empty
    /// value matches only explicitly empty leaves.
    pub fn find(&self, pattern: &str, value: &[u8]) -> Result<Vec<String>, AptError> {
        Counters::bump(&self.counters.find);
        path::validate_pattern(pattern)?;
        if pattern.ends_with('/') {
            return Err(AptError::Invalid);
        }

        let mut candidates = Vec::new();
        let segments: Vec<&str> = path::split(pattern).into_vec();
        self.expand("/", &segments, &mut candidates);

        let mut out = Vec::new();
        for candidate in candidates {
            self.refresh_path(&candidate);
            if self.resolve(&candidate).as_deref() == Some(value) {
                out.push(candidate);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Expand wildcard segments against the search pipeline (stored children
    /// plus indexed children plus provider continuations).
    fn expand(&self, base: &str, segments: &[&str], out: &mut Vec<String>) {
        let [first, rest @ ..] = segments else {
            if base != "/" {
                out.push(base.to_string());
            }
            return;
        };
        if path::is_wildcard(first) {
            for child in self.children_of(base) {
                self.expand(&child, rest, out);
            }
        } else {
            self.expand(&path::join(base, first), rest, out);
        }
    }

    /// Roots matching the template's (possibly wildcarded) name whose
    /// subtree satisfies every leaf constraint: a leaf with a value must
    /// match it exactly, a valueless leaf must merely exist.
    pub fn find_tree(&self, template: &TreeMsg) -> Result<Vec<String>, AptError> {
        Counters::bump(&self.counters.find);
        path::validate_pattern(&template.name)?;

        let mut constraints = Vec::new();
        collect_constraints(&template.children, "", &mut constraints);
        if constraints.is_empty() {
            return Err(AptError::Invalid);
        }

        let mut candidates = Vec::new();
        let segments: Vec<&str> = path::split(&template.name).into_vec();
        self.expand("/", &segments, &mut candidates);

        let mut out = Vec::new();
        for candidate in candidates {
            let matched = constraints.iter().all(|(rel, expected)| {
                let full = format!("{candidate}{rel}");
                self.refresh_path(&full);
                match (self.resolve(&full), expected) {
                    (Some(found), Some(want)) => &found == want,
                    (Some(_), None) => true,
                    (None, _) => false,
                }
            });
            if matched {
                out.push(candidate);
            }
        }
        out.sort();
        Ok(out)
    }
}

fn collect_constraints(
    templates: &[TreeMsg],
    prefix: &str,
    out: &mut Vec<(String, Option<Bytes>)>,
) {
    for template in templates {
        let rel = format!("{prefix}/{}", template.name);
        if template.children.is_empty() {
            out.push((rel, template.value.clone()));
        } else {
            collect_constraints(&template.children, &rel, out);
        }
    }
}
