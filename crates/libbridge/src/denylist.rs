/// Literal substrings that reject a command before anything is spawned.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "mkfs",
    "dd if=/dev/zero",
    ":(){ :|:& };:",
    "format C:",
    "fdisk",
];

/// Substring denylist. Containment only, no parsing: a blunt safety net, not
/// an isolation boundary.
#[derive(Debug, Clone)]
pub struct Denylist {
    patterns: Vec<String>,
}

impl Denylist {
    /// The default patterns plus any non-empty `extra` ones.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::default();
        for pattern in extra {
            let pattern = pattern.into();
            if !pattern.is_empty() && !list.patterns.contains(&pattern) {
                list.patterns.push(pattern);
            }
        }
        list
    }

    /// First pattern contained in `command`, if any.
    pub fn matches(&self, command: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|pattern| command.contains(pattern.as_str()))
            .map(String::as_str)
    }

    pub fn is_blocked(&self, command: &str) -> bool {
        self.matches(command).is_some()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for Denylist {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}
