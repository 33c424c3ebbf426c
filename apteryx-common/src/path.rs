//! Path and pattern syntax.
//!
//! Paths are `/`-separated non-empty UTF-8 segments. Patterns additionally
//! allow `*` as a whole segment (matches exactly one segment) and a trailing
//! `/` (matches the immediate children of the prefix).

use smallvec::SmallVec;

use crate::error::AptError;

pub type Segments<'a> = SmallVec<[&'a str; 8]>;

/// Split a path into segments. `/` and the empty string split to nothing.
pub fn split(path: &str) -> Segments<'_> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

pub fn is_wildcard(segment: &str) -> bool {
    segment == "*"
}

/// A concrete storage key: absolute, at least one segment, no wildcard, no
/// trailing slash.
pub fn validate_key(path: &str) -> Result<(), AptError> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
        return Err(AptError::Invalid);
    }
    validate_segments(path, false)
}

/// A subtree root: like a key, but `/` itself is allowed (prune, traverse,
/// timestamp and memuse all accept the whole tree).
pub fn validate_subtree(path: &str) -> Result<(), AptError> {
    if path == "/" {
        return Ok(());
    }
    validate_key(path)
}

/// A search path: `/`, or a key with a trailing `/`.
pub fn validate_search(path: &str) -> Result<(), AptError> {
    if path == "/" {
        return Ok(());
    }
    match path.strip_suffix('/') {
        Some(prefix) => validate_key(prefix),
        None => Err(AptError::Invalid),
    }
}

/// A registration or find pattern: wildcard segments and a trailing slash
/// are allowed.
pub fn validate_pattern(path: &str) -> Result<(), AptError> {
    if !path.starts_with('/') || path.len() < 2 {
        return Err(AptError::Invalid);
    }
    let body = path.strip_suffix('/').unwrap_or(path);
    if body.is_empty() {
        return Err(AptError::Invalid);
    }
    validate_segments(body, true)
}

fn validate_segments(path: &str, wildcards: bool) -> Result<(), AptError> {
    for segment in path[1..].split('/') {
        if segment.is_empty() {
            return Err(AptError::Invalid);
        }
        if !wildcards && segment.contains('*') {
            return Err(AptError::Invalid);
        }
    }
    Ok(())
}

/// Parent path; the parent of a first-level path (and of `/`) is `/`.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Join a parent path and a child segment.
pub fn join(base: &str, segment: &str) -> String {
    if base == "/" {
        format!("/{segment}")
    } else {
        format!("{base}/{segment}")
    }
}

/// The search base of a slash-terminated path (`/a/b/` -> `/a/b`).
pub fn search_base(path: &str) -> &str {
    if path == "/" {
        return "/";
    }
    path.strip_suffix('/').unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_ignores_empty_segments() {
        assert_eq!(split("/a/b/c").as_slice(), ["a", "b", "c"]);
        assert_eq!(split("/").len(), 0);
        assert_eq!(split("/a/b/").as_slice(), ["a", "b"]);
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("/a").is_ok());
        assert!(validate_key("/a/b/c").is_ok());
        assert!(validate_key("/").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("/a//b").is_err());
        assert!(validate_key("/a/b/").is_err());
        assert!(validate_key("/a/*/c").is_err());
    }

    #[test]
    fn search_validation() {
        assert!(validate_search("/").is_ok());
        assert!(validate_search("/a/b/").is_ok());
        assert!(validate_search("/a/b").is_err());
        assert!(validate_search("*").is_err());
        assert!(validate_search("").is_err());
    }

    #[test]
    fn pattern_validation() {
        assert!(validate_pattern("/a/*/c").is_ok());
        assert!(validate_pattern("/a/b/").is_ok());
        assert!(validate_pattern("/a/*").is_ok());
        assert!(validate_pattern("/").is_err());
    }

    #[test]
    fn parent_and_join() {
        assert_eq!(parent("/a/b/c"), "/a/b");
        assert_eq!(parent("/a"), "/");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }
}
