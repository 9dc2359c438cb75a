//! Path handling helpers.
//!
//! Paths are `/`-separated byte strings starting with `/`. A trailing `/`
//! means the caller requires a directory. The VFS does not normalise `.` or
//! `..`; backends may or may not understand them.

use memchr::memchr;

/// Maximum total path length in bytes accepted by the VFS.
pub const MAX_PATH_LEN: usize = 1024;

/// Maximum length of a single path component.
pub const MAX_COMPONENT_LEN: usize = 255;

/// Validate the shape of a user-supplied path.
///
/// Returns `Err` for empty paths, paths not starting with `/`, paths longer
/// than `max_len` bytes and components longer than [`MAX_COMPONENT_LEN`].
pub fn validate(path: &str, max_len: usize) -> Result<(), PathError> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(PathError::NotAbsolute);
    }
    if path.len() > max_len {
        return Err(PathError::TooLong);
    }
    if memchr(0, path.as_bytes()).is_some() {
        return Err(PathError::NotAbsolute);
    }
    for component in components(path) {
        if component.len() > MAX_COMPONENT_LEN {
            return Err(PathError::TooLong);
        }
    }
    Ok(())
}

/// Why [`validate`] rejected a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    /// Path is empty or does not start with `/`.
    NotAbsolute,
    /// Path or one of its components exceeds the configured maximum.
    TooLong,
}

/// Iterate over the non-empty components of `path`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Whether the caller requires a directory (trailing `/`).
pub fn wants_directory(path: &str) -> bool {
    path.ends_with('/')
}

/// Split `path` into its parent directory and final component.
///
/// A trailing slash on the final component is ignored:
/// `split_last("/a/b/")` is `("/a", "b")`. Returns `None` for the root.
pub fn split_last(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let cut = trimmed.rfind('/')?;
    let parent = if cut == 0 { "/" } else { &trimmed[..cut] };
    let name = &trimmed[cut + 1..];
    if name.is_empty() { None } else { Some((parent, name)) }
}

/// Whether `mount_point` is a whole-component prefix of `path`, and if so,
/// how many bytes of `path` it covers.
///
/// `"/mnt"` matches `"/mnt"` and `"/mnt/a"` but not `"/mntx"`. The root
/// `"/"` matches everything and covers zero bytes, so the backend sees the
/// full path.
pub fn mount_prefix_len(mount_point: &str, path: &str) -> Option<usize> {
    let mp = mount_point.trim_end_matches('/');
    if mp.is_empty() {
        // Root mount.
        return Some(0);
    }
    if !path.starts_with(mp) {
        return None;
    }
    match path.as_bytes().get(mp.len()) {
        None => Some(mp.len()),
        Some(b'/') => Some(mp.len()),
        Some(_) => None,
    }
}

/// The remainder of `path` after stripping `prefix_len` bytes, normalised so
/// backends always see an absolute path (`/` for the mount root itself).
pub fn remainder(path: &str, prefix_len: usize) -> &str {
    let rest = &path[prefix_len.min(path.len())..];
    if rest.is_empty() { "/" } else { rest }
}

/// Number of `/`-separated components, used to rank mount matches.
pub fn depth(path: &str) -> usize {
    components(path).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_last_handles_trailing_slash() {
        assert_eq!(split_last("/a/b/"), Some(("/a", "b")));
        assert_eq!(split_last("/a"), Some(("/", "a")));
        assert_eq!(split_last("/"), None);
    }

    #[test]
    fn mount_prefix_matches_whole_components() {
        assert_eq!(mount_prefix_len("/", "/anything"), Some(0));
        assert_eq!(mount_prefix_len("/mnt", "/mnt"), Some(4));
        assert_eq!(mount_prefix_len("/mnt", "/mnt/a/b"), Some(4));
        assert_eq!(mount_prefix_len("/mnt", "/mntx"), None);
        assert_eq!(mount_prefix_len("/mnt", "/m"), None);
    }

    #[test]
    fn remainder_is_absolute() {
        assert_eq!(remainder("/mnt/a", 4), "/a");
        assert_eq!(remainder("/mnt", 4), "/");
        assert_eq!(remainder("/x", 0), "/x");
    }

    #[test]
    fn validate_enforces_limits() {
        assert!(validate("/ok/path", MAX_PATH_LEN).is_ok());
        assert_eq!(validate("relative", MAX_PATH_LEN), Err(PathError::NotAbsolute));
        assert_eq!(validate("", MAX_PATH_LEN), Err(PathError::NotAbsolute));
        let long: String = "/part".repeat(MAX_PATH_LEN / 5 + 1);
        assert_eq!(validate(&long, MAX_PATH_LEN), Err(PathError::TooLong));
        assert!(validate(&long[..MAX_PATH_LEN], MAX_PATH_LEN).is_ok());
        let long_component = format!("/{}", "y".repeat(MAX_COMPONENT_LEN + 1));
        assert_eq!(
            validate(&long_component, MAX_PATH_LEN * 2),
            Err(PathError::TooLong)
        );
    }
}
