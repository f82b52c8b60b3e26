//! Logical path validation.
//!
//! Every client-supplied path crosses this boundary before it may touch the
//! data root, on the replicated apply path as well as the local read path.

use crate::error::FsError;

/// Longest accepted logical path, in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Validates a logical path and returns its normalized form.
///
/// Rejects absolute paths, `..` segments, embedded NUL bytes and paths
/// longer than [`MAX_PATH_LEN`]. Repeated separators collapse and trailing
/// separators are stripped; the empty path names the data root itself.
pub fn validate(path: &str) -> Result<String, FsError> {
    if path.len() > MAX_PATH_LEN {
        return Err(FsError::InvalidPath(format!(
            "path exceeds {MAX_PATH_LEN} bytes"
        )));
    }
    if path.contains('\0') {
        return Err(FsError::InvalidPath("path contains NUL byte".to_string()));
    }
    if path.starts_with('/') {
        return Err(FsError::InvalidPath(format!("absolute path: {path}")));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == ".." {
            return Err(FsError::InvalidPath(format!("path escapes root: {path}")));
        }
        segments.push(segment);
    }
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(path: &str) -> bool {
        matches!(validate(path), Err(FsError::InvalidPath(_)))
    }

    #[test]
    fn accepts_plain_relative_paths() {
        assert_eq!(validate("a/b/c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(validate("file").unwrap(), "file");
        assert_eq!(validate("").unwrap(), "");
    }

    #[test]
    fn normalizes_separators() {
        assert_eq!(validate("a//b").unwrap(), "a/b");
        assert_eq!(validate("a/b/").unwrap(), "a/b");
        assert_eq!(validate("a///b///").unwrap(), "a/b");
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(rejected("/etc/passwd"));
        assert!(rejected("/"));
    }

    #[test]
    fn rejects_parent_segments() {
        assert!(rejected("../x"));
        assert!(rejected("a/../b"));
        assert!(rejected("a/.."));
    }

    #[test]
    fn rejects_nul_bytes() {
        assert!(rejected("a\0b"));
    }

    #[test]
    fn rejects_over_long_paths() {
        let long = "x".repeat(MAX_PATH_LEN + 1);
        assert!(rejected(&long));
        let max = "x".repeat(MAX_PATH_LEN);
        assert!(validate(&max).is_ok());
    }

    #[test]
    fn keeps_non_ascii_segments() {
        assert_eq!(validate("ディレクトリ/файл.txt").unwrap(), "ディレクトリ/файл.txt");
    }
}
