//! Host-side volume layout for a managed server.

use std::path::{Path, PathBuf};

/// Map any character outside `[A-Za-z0-9._-]` to `_`.
pub fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Directory bind-mounted into containers at `/home/container` (runtime)
/// and `/mnt/server` (installer).
pub fn path(volumes_dir: &Path, id: &str) -> PathBuf {
    volumes_dir.join(sanitize(id))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn keeps_safe_characters() {
        assert_eq!(sanitize("srv-1.alpha_B"), "srv-1.alpha_B");
    }

    #[test]
    fn maps_unsafe_characters_to_underscores() {
        assert_eq!(sanitize("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize("a b/c"), "a_b_c");
    }

    proptest! {
        #[test]
        fn sanitize_is_idempotent_and_stays_in_the_safe_set(id in ".{0,40}") {
            let once = sanitize(&id);
            prop_assert_eq!(&sanitize(&once), &once);
            prop_assert!(once
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        }
    }
}
