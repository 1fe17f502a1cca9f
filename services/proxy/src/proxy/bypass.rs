/// Paths that are forwarded without authorization.
#[derive(Debug, Clone, Default)]
pub struct BypassMatcher {
    paths: Vec<String>,
    prefix_match: bool,
}

impl BypassMatcher {
    pub fn new(paths: &[String], prefix_match: bool) -> Self {
        Self {
            paths: paths
                .iter()
                .map(|p| p.trim_end_matches('/').to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            prefix_match,
        }
    }

    /// Case-insensitive exact match, or a match of everything below a
    /// configured path when prefix matching is on.
    pub fn matches(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        self.paths.iter().any(|pattern| {
            path == *pattern
                || (self.prefix_match
                    && path
                        .strip_prefix(pattern.as_str())
                        .is_some_and(|rest| rest.starts_with('/')))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
