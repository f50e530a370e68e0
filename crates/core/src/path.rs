//! Relative path normalisation shared by request validation and artifact lookup.

/// Normalise a caller-supplied relative path.
///
/// Returns `None` for anything that could leave the directory it is joined
/// onto: absolute paths, Windows roots or drive prefixes, backslashes, and any
/// `..` segment. `.` and empty segments are dropped. A path that normalises to
/// nothing is also rejected.
pub fn normalize_relative(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('/') || raw.contains('\\') || raw.contains('\0') {
        return None;
    }
    if has_drive_prefix(raw) {
        return None;
    }

    let mut parts = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => parts.push(s),
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn has_drive_prefix(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_plain_paths() {
        assert_eq!(normalize_relative("artifacts.zip").as_deref(), Some("artifacts.zip"));
        assert_eq!(normalize_relative("reports/a.xlsx").as_deref(), Some("reports/a.xlsx"));
    }

    #[test]
    fn collapses_dots_and_slashes() {
        assert_eq!(normalize_relative("./a//b/./c").as_deref(), Some("a/b/c"));
        assert_eq!(normalize_relative("a/b/").as_deref(), Some("a/b"));
    }

    #[test]
    fn rejects_escapes() {
        for bad in [
            "", " ", ".", "./", "/etc/passwd", "../x", "a/../b", "a/..", "..", "C:/x", "c:x",
            "a\\b", "\\\\server\\share",
        ] {
            assert!(normalize_relative(bad).is_none(), "accepted {bad:?}");
        }
    }

    #[test]
    fn dotted_names_are_not_parent_segments() {
        assert_eq!(normalize_relative("a/..b/c").as_deref(), Some("a/..b/c"));
        assert_eq!(normalize_relative("...").as_deref(), Some("..."));
    }
}
