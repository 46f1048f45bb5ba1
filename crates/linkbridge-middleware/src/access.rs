//! Topic / service allow-lists.

use glob::Pattern;
use linkbridge_types::BridgeError;

/// A set of glob patterns; an empty set allows every name.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    patterns: Vec<Pattern>,
}

impl NameFilter {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(globs: I) -> Result<Self, BridgeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = globs
            .into_iter()
            .map(|g| g.as_ref().trim().to_string())
            .filter(|g| !g.is_empty())
            .map(|g| {
                Pattern::new(&g).map_err(|e| BridgeError::InvalidField {
                    field: "glob".into(),
                    reason: format!("{g}: {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn allows(&self, name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(name))
    }

    pub fn check(&self, name: &str) -> Result<(), BridgeError> {
        if self.allows(name) {
            Ok(())
        } else {
            Err(BridgeError::NotAllowed(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_allows_everything() {
        assert!(NameFilter::allow_all().allows("/anything"));
        assert!(NameFilter::new(["", "  "]).unwrap().allows("/x"));
    }

    #[test]
    fn globs_restrict_names() -> Result<(), BridgeError> {
        let filter = NameFilter::new(["/robot/*", "/cmd_vel"])?;
        assert!(filter.allows("/robot/odom"));
        assert!(filter.allows("/cmd_vel"));
        assert!(!filter.allows("/secret"));
        assert!(matches!(filter.check("/secret"), Err(BridgeError::NotAllowed(_))));
        Ok(())
    }

    #[test]
    fn bad_pattern_is_reported() {
        assert!(NameFilter::new(["/a/[b"]).is_err());
    }
}
