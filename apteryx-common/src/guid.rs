//! Callback guids.
//!
//! A guid names one callback registration globally:
//! `<pid:x>-<ref:x>-<hash:x>`. The pid lets the daemon derive the owning
//! client's callback socket, the ref identifies the handler inside that
//! client, and the hash of the registration target keeps re-registrations of
//! the same handler on different patterns distinct.

use std::hash::{DefaultHasher, Hash, Hasher};

pub fn make(pid: u32, cb_ref: u64, target: &str) -> String {
    let mut hasher = DefaultHasher::new();
    target.hash(&mut hasher);
    format!("{:x}-{:x}-{:x}", pid, cb_ref, hasher.finish())
}

/// Extract `(pid, ref)` from a guid. The hash part is not interpreted.
pub fn parse(guid: &str) -> Option<(u32, u64)> {
    let mut parts = guid.splitn(3, '-');
    let pid = u32::from_str_radix(parts.next()?, 16).ok()?;
    let cb_ref = u64::from_str_radix(parts.next()?, 16).ok()?;
    parts.next()?;
    Some((pid, cb_ref))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let guid = make(1234, 7, "/interfaces/*/state");
        assert_eq!(parse(&guid), Some((1234, 7)));
    }

    #[test]
    fn distinct_targets_distinct_guids() {
        assert_ne!(make(1, 1, "/a"), make(1, 1, "/b"));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse("not-a-guid-at-all"), None);
        assert_eq!(parse(""), None);
        assert_eq!(parse("12ab"), None);
    }
}
