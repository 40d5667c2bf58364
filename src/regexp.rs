use std::fmt;
use std::hash::{Hash, Hasher};

/// A compiled regular expression literal. Equality and hashing follow the
/// source pattern, so interning two `/a+/` literals yields one constant.
#[derive(Clone, Debug)]
pub struct RegExp {
    pattern: String,
    compiled: regex::Regex,
}

impl RegExp {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            compiled: regex::Regex::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.compiled.is_match(text)
    }

    /// Capture groups of the first match, group 0 being the whole match.
    /// Unmatched optional groups come back as empty strings.
    pub fn capture_groups(&self, text: &str) -> Option<Vec<String>> {
        let captures = self.compiled.captures(text)?;
        Some(
            (0..captures.len())
                .map(|i| {
                    captures
                        .get(i)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                })
                .collect(),
        )
    }
}

impl PartialEq for RegExp {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for RegExp {}

impl Hash for RegExp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pattern.hash(state);
    }
}

impl fmt::Display for RegExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_pattern() {
        let a = RegExp::new("a+").unwrap();
        let b = RegExp::new("a+").unwrap();
        let c = RegExp::new("b+").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn capture_groups_include_whole_match() {
        let re = RegExp::new(r"(\w+)@(\w+)").unwrap();
        let groups = re.capture_groups("mail to user@example now").unwrap();
        assert_eq!(groups, vec!["user@example", "user", "example"]);
    }

    #[test]
    fn no_match_yields_none() {
        let re = RegExp::new("x{3}").unwrap();
        assert!(re.capture_groups("xx").is_none());
    }
}
