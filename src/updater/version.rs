//! Lenient semantic version parsing and ordering.
//!
//! Malformed strings must never abort an update check, so parsing degrades
//! component-by-component to `0` instead of failing. Pre-release and build
//! metadata (`-beta`, `+001`) are dropped entirely: `"1.0"` and
//! `"1.0.0-beta"` parse to the same tuple and compare equal.

use std::cmp::Ordering;

/// Parses a version string into exactly `(major, minor, patch)`.
pub fn parse(raw: &str) -> (u64, u64, u64) {
    let cleaned = raw
        .trim()
        .trim_start_matches(['v', 'V'])
        .split(['-', '+'])
        .next()
        .unwrap_or("");

    let mut parts = cleaned
        .split('.')
        .map(|p| p.trim().parse::<u64>().unwrap_or(0));

    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

pub fn compare(a: &str, b: &str) -> Ordering {
    parse(a).cmp(&parse(b))
}

/// True when the server version is strictly newer than the local one.
pub fn is_newer(server: &str, current: &str) -> bool {
    compare(server, current) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_triples() {
        assert_eq!(parse("1.2.3"), (1, 2, 3));
        assert_eq!(parse("10.0.100"), (10, 0, 100));
    }

    #[test]
    fn strips_prefix_and_metadata() {
        assert_eq!(parse("v1.2.3-beta+001"), parse("1.2.3"));
        assert_eq!(parse("V2.0.0"), (2, 0, 0));
    }

    #[test]
    fn missing_components_are_zero() {
        assert_eq!(parse("1.0"), (1, 0, 0));
        assert_eq!(parse("3"), (3, 0, 0));
        assert_eq!(parse(""), (0, 0, 0));
    }

    #[test]
    fn garbage_degrades_to_zero() {
        assert_eq!(parse("not.a.version"), (0, 0, 0));
        assert_eq!(parse("1.x.3"), (1, 0, 3));
    }

    #[test]
    fn ordering_matches_numeric_tuples() {
        assert_eq!(compare("2.1.0", "2.0.5"), Ordering::Greater);
        assert_eq!(compare("2.0.5", "2.1.0"), Ordering::Less);
        assert_eq!(compare("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare("1.0", "1.0.0-beta"), Ordering::Equal);
        assert!(is_newer("2.1.0", "2.0.5"));
        assert!(!is_newer("2.0.5", "2.0.5"));
    }
}
