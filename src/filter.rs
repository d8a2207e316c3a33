//! Grab filter rules.
//!
//! A [`GrabFilters`] set decides, for one device descriptor, whether the
//! device is grabbed or left to the OS. Rules are evaluated in order and the
//! first matching rule wins; a device matching no rule gets the explicitly
//! configured default policy.

use serde::{Deserialize, Serialize};

/// What to do with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrabPolicy {
    /// Grab the device exclusively.
    Grab,
    /// Leave the device to the OS.
    Ignore,
}

/// Descriptor field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterField {
    /// Display name.
    Name,
    /// Stable hardware id.
    Id,
}

/// String pattern of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterPattern {
    /// Whole-string match.
    Exact(String),
    /// Case-insensitive substring match.
    Contains(String),
}

impl FilterPattern {
    /// Whether `value` matches this pattern.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            FilterPattern::Exact(s) => value == s,
            FilterPattern::Contains(s) => value.to_lowercase().contains(&s.to_lowercase()),
        }
    }
}

/// One ordered filter rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrabFilter {
    /// Decision when the rule matches.
    pub action: GrabPolicy,
    /// Field the pattern is applied to.
    pub field: FilterField,
    /// The pattern.
    pub pattern: FilterPattern,
}

impl GrabFilter {
    /// Grab devices whose `field` matches `pattern`.
    pub fn grab(field: FilterField, pattern: FilterPattern) -> Self {
        Self {
            action: GrabPolicy::Grab,
            field,
            pattern,
        }
    }

    /// Ignore devices whose `field` matches `pattern`.
    pub fn ignore(field: FilterField, pattern: FilterPattern) -> Self {
        Self {
            action: GrabPolicy::Ignore,
            field,
            pattern,
        }
    }

    fn matches(&self, name: &str, id: &str) -> bool {
        match self.field {
            FilterField::Name => self.pattern.matches(name),
            FilterField::Id => self.pattern.matches(id),
        }
    }
}

/// An ordered rule set plus the policy for devices matching no rule.
///
/// The default policy has no serde default: a client configuration must
/// state it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrabFilters {
    /// Rules, first match wins.
    #[serde(default)]
    pub rules: Vec<GrabFilter>,
    /// Decision when no rule matches.
    pub default_policy: GrabPolicy,
}

impl GrabFilters {
    /// A rule set without rules.
    pub fn with_default(default_policy: GrabPolicy) -> Self {
        Self {
            rules: Vec::new(),
            default_policy,
        }
    }

    /// Append a rule.
    pub fn rule(mut self, rule: GrabFilter) -> Self {
        self.rules.push(rule);
        self
    }

    /// Decide whether the device with this name and id is grabbed.
    pub fn evaluate(&self, name: &str, id: &str) -> GrabPolicy {
        self.rules
            .iter()
            .find(|rule| rule.matches(name, id))
            .map(|rule| rule.action)
            .unwrap_or(self.default_policy)
    }

    /// Shorthand for `evaluate(..) == GrabPolicy::Grab`.
    pub fn should_grab(&self, name: &str, id: &str) -> bool {
        self.evaluate(name, id) == GrabPolicy::Grab
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_applies_without_rules() {
        assert!(GrabFilters::with_default(GrabPolicy::Grab).should_grab("Keyboard", "1"));
        assert!(!GrabFilters::with_default(GrabPolicy::Ignore).should_grab("Keyboard", "1"));
    }

    #[test]
    fn test_first_match_wins() {
        let filters = GrabFilters::with_default(GrabPolicy::Ignore)
            .rule(GrabFilter::ignore(
                FilterField::Id,
                FilterPattern::Exact("046d:c52b".into()),
            ))
            .rule(GrabFilter::grab(
                FilterField::Name,
                FilterPattern::Contains("keyboard".into()),
            ));

        assert!(filters.should_grab("USB Keyboard", "04d9:1603"));
        assert!(!filters.should_grab("Logitech Keyboard", "046d:c52b"));
        assert!(!filters.should_grab("Mouse", "1234:5678"));
    }

    #[test]
    fn test_contains_is_case_insensitive_exact_is_not() {
        assert!(FilterPattern::Contains("KEYB".into()).matches("usb keyboard"));
        assert!(!FilterPattern::Exact("usb keyboard".into()).matches("USB Keyboard"));
    }

    #[test]
    fn test_default_policy_is_required() {
        let missing = serde_json::from_str::<GrabFilters>(r#"{"rules":[]}"#);
        assert!(missing.is_err());

        let filters: GrabFilters = serde_json::from_str(
            r#"{"rules":[{"action":"ignore","field":"name","pattern":{"contains":"mouse"}}],
                "default_policy":"grab"}"#,
        )
        .unwrap();
        assert!(!filters.should_grab("Gaming Mouse", ""));
        assert!(filters.should_grab("Keyboard", ""));
    }
}
