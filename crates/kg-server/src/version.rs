//! Graph version identifiers.
//!
//! A version is a UTC millisecond timestamp serialized as a decimal string.
//! Consumers treat versions as opaque; ordering is length-then-lexical, which
//! matches numeric order for decimal strings without leading zeros.

use std::cmp::Ordering;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Compare two version strings by length, then lexically.
///
/// Equivalent to numeric comparison of the underlying millisecond values.
pub fn cmp_versions(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Process-wide monotonic version generator.
///
/// Returns `max(now_ms, last + 1)` so that two triggers landing in the same
/// millisecond still produce strictly increasing versions.
pub struct VersionGen {
    last: Mutex<u64>,
}

impl VersionGen {
    pub fn new() -> Self {
        Self { last: Mutex::new(0) }
    }

    pub fn next(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let v = now.max(*last + 1);
        *last = v;
        v.to_string()
    }
}

impl Default for VersionGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_numeric_for_decimal_strings() {
        assert_eq!(cmp_versions("999", "1000"), Ordering::Less);
        assert_eq!(cmp_versions("1700000000001", "1700000000002"), Ordering::Less);
        assert_eq!(cmp_versions("1700000000002", "1700000000002"), Ordering::Equal);
        assert_eq!(cmp_versions("1700000000010", "1700000000002"), Ordering::Greater);
    }

    #[test]
    fn generator_is_strictly_monotonic() {
        let g = VersionGen::new();
        let mut prev = g.next();
        for _ in 0..100 {
            let next = g.next();
            assert_eq!(cmp_versions(&prev, &next), Ordering::Less);
            prev = next;
        }
    }

    #[test]
    fn generator_tracks_wall_clock() {
        let g = VersionGen::new();
        let v: u64 = g.next().parse().expect("decimal version");
        // Sometime after 2023-11-14 in ms — sanity check the epoch basis.
        assert!(v > 1_700_000_000_000);
    }
}
