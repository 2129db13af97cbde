//! Path helpers for the coordination tree.
//!
//! Paths are absolute, `/`-separated and never end with a separator (except
//! the root itself). Names that come from callers (tenant IDs, entity-group
//! keys) must go through [`escape`] before they are used as a path component.

use crate::error::{CoordError, CoordResult};

/// Path separator.
pub const SEPARATOR: char = '/';

/// The root path.
pub const ROOT: &str = "/";

/// Joins a parent path and a single child name.
pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Returns the parent of `path`, or `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind(SEPARATOR) {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Returns the last component of `path`.
pub fn basename(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or(path)
}

/// Checks that `path` is absolute, has no empty components and no trailing separator.
pub fn validate(path: &str) -> CoordResult<()> {
    let invalid = |reason| CoordError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if !path.starts_with(SEPARATOR) {
        return Err(invalid("path must be absolute"));
    }
    if path == ROOT {
        return Ok(());
    }
    if path.ends_with(SEPARATOR) {
        return Err(invalid("path must not end with a separator"));
    }
    if path[1..].split(SEPARATOR).any(str::is_empty) {
        return Err(invalid("path contains an empty component"));
    }
    Ok(())
}

/// Percent-escapes a caller-supplied name so it is a single safe path component.
///
/// ASCII letters, digits and `-_.~` pass through; every other byte becomes `%XX`.
pub fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Reverses [`escape`]. Returns `None` if the input is not a valid escape.
pub fn unescape(component: &str) -> Option<String> {
    let bytes = component.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = component.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn join_and_parent() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(basename("/a/b"), "b");
    }

    #[test]
    fn validate_paths() {
        assert!(validate("/").is_ok());
        assert!(validate("/a/b").is_ok());
        assert!(validate("a/b").is_err());
        assert!(validate("/a/").is_err());
        assert!(validate("/a//b").is_err());
    }

    #[test]
    fn escape_special_characters() {
        let name = "!@#$%^&*()-=_+[]{}\\|~`;:\"',.<>/?";
        let escaped = escape(name);
        assert!(!escaped.contains('/'));
        assert!(validate(&join("/apps", &escaped)).is_ok());
        assert_eq!(unescape(&escaped).as_deref(), Some(name));
    }

    #[test]
    fn unescape_rejects_truncated_sequence() {
        assert_eq!(unescape("abc%2"), None);
    }

    proptest! {
        #[test]
        fn escape_is_reversible(name in ".{0,40}") {
            let escaped = escape(&name);
            prop_assert!(!escaped.contains('/'));
            prop_assert_eq!(unescape(&escaped), Some(name));
        }
    }
}
