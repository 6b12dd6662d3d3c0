use std::path::Path;

/// Ordered library patterns assumed to be provided by the target runtime.
///
/// A pattern matches a path when
/// - it equals the basename,
/// - the basename starts with it followed by `.` (`libc.so` matches `libc.so.6`),
/// - it ends in `*` and the basename starts with the rest, or
/// - it contains `/` and the path ends with it, component-wise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionPolicy {
    patterns: Vec<String>,
}

impl ExclusionPolicy {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.matching_pattern(path).is_some()
    }

    /// The first pattern matching `path`.
    pub fn matching_pattern(&self, path: &Path) -> Option<&str> {
        let basename = path.file_name()?.to_str()?;
        self.patterns
            .iter()
            .map(String::as_str)
            .find(|p| pattern_matches(p, path, basename))
    }
}

fn pattern_matches(pattern: &str, path: &Path, basename: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if pattern.contains('/') {
        return if pattern.starts_with('/') {
            path == Path::new(pattern)
        } else {
            path.ends_with(pattern)
        };
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return basename.starts_with(prefix);
    }
    basename == pattern
        || basename
            .strip_prefix(pattern)
            .is_some_and(|rest| rest.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(patterns: &[&str]) -> ExclusionPolicy {
        ExclusionPolicy::new(patterns.iter().map(|s| (*s).to_owned()).collect())
    }

    #[test]
    fn exact_soname_does_not_match_other_libraries() {
        let p = policy(&["libc.so.6"]);
        assert!(p.matches(Path::new("/usr/lib/x86_64/libc.so.6")));
        assert!(!p.matches(Path::new("/usr/lib/x86_64/libfoo.so.6")));
    }

    #[test]
    fn version_suffix_matches() {
        let p = policy(&["libstdc++.so"]);
        assert!(p.matches(Path::new("/usr/lib/libstdc++.so.6")));
        assert!(p.matches(Path::new("/usr/lib/libstdc++.so.6.0.30")));
        assert!(!p.matches(Path::new("/usr/lib/libstdc++fs.so")));
    }

    #[test]
    fn prefix_wildcard() {
        let p = policy(&["ld-linux*"]);
        assert!(p.matches(Path::new("/lib64/ld-linux-x86-64.so.2")));
        assert!(!p.matches(Path::new("/lib64/libld.so")));
    }

    #[test]
    fn path_suffix_patterns() {
        let p = policy(&["x86_64-linux-gnu/libGL.so.1", "/opt/vendor/libx.so"]);
        assert!(p.matches(Path::new("/usr/lib/x86_64-linux-gnu/libGL.so.1")));
        assert!(!p.matches(Path::new("/usr/lib/i386-linux-gnu/libGL.so.1")));
        assert!(p.matches(Path::new("/opt/vendor/libx.so")));
        assert!(!p.matches(Path::new("/usr/opt/vendor/libx.so")));
    }

    #[test]
    fn first_matching_pattern_wins() {
        let p = policy(&["libc*", "libc.so"]);
        assert_eq!(p.matching_pattern(Path::new("/lib/libc.so.6")), Some("libc*"));
    }

    #[test]
    fn empty_pattern_matches_nothing() {
        assert!(!policy(&[""]).matches(Path::new("/lib/libc.so.6")));
    }
}
