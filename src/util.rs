// src/util.rs

use once_cell::sync::Lazy;
use std::time::Instant;

use crate::limits::MAX_NAME_LEN;

static CLOCK_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic engine clock in nanoseconds.
///
/// All deadlines (reply timeouts) are absolute values of this clock.
pub fn monotonic_ns() -> u64 {
    CLOCK_ANCHOR.elapsed().as_nanos() as u64
}

/// Validate a well-known name.
///
/// Names are dot-separated labels of `[A-Za-z0-9_-]`, at least two labels,
/// no empty labels, bounded length. When `allow_wildcard` is set, a single
/// trailing `.*` is accepted (policy entries and policy-holder
/// registrations only).
pub fn name_is_valid(name: &str, allow_wildcard: bool) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    let stem = if allow_wildcard {
        name.strip_suffix(".*").unwrap_or(name)
    } else {
        name
    };

    if stem.is_empty() {
        return false;
    }

    let mut labels = 0;
    for label in stem.split('.') {
        if label.is_empty() {
            return false;
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return false;
        }
        labels += 1;
    }

    // a bare wildcard registration like "com.*" is fine, but a plain name
    // needs at least two labels
    labels >= 2 || (allow_wildcard && name.ends_with(".*"))
}

/// Check that a bus name starts with the `"<uid>-"` prefix of its creator.
pub fn bus_name_has_uid_prefix(name: &str, uid: u32) -> bool {
    let prefix = format!("{uid}-");
    name.len() > prefix.len() && name.starts_with(&prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn valid_names() {
        assert!(name_is_valid("com.example.Service", false));
        assert!(name_is_valid("org.x-y.z_1", false));
    }

    #[test]
    fn invalid_names() {
        assert!(!name_is_valid("", false));
        assert!(!name_is_valid("single", false));
        assert!(!name_is_valid("com..example", false));
        assert!(!name_is_valid("com.exa mple", false));
        assert!(!name_is_valid(&"a.".repeat(200), false));
    }

    #[test]
    fn wildcard_names() {
        assert!(name_is_valid("com.example.*", true));
        assert!(!name_is_valid("com.example.*", false));
        assert!(name_is_valid("com.*", true));
    }

    #[test]
    fn bus_prefix() {
        assert!(bus_name_has_uid_prefix("1000-mybus", 1000));
        assert!(!bus_name_has_uid_prefix("1001-mybus", 1000));
        assert!(!bus_name_has_uid_prefix("1000", 1000));
        assert!(!bus_name_has_uid_prefix("1000-", 1000));
    }
}
