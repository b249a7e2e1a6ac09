//! Action identities and trigger predicates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved name of the terminal action.
pub const FINAL_ANSWER: &str = "final_answer";

/// Stable identity of an action: a tool name or the `final_answer` sentinel.
///
/// Equality is by name, so a handoff target and a plain tool are
/// indistinguishable for rule purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionRef(String);

impl ActionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn final_answer() -> Self {
        Self(FINAL_ANSWER.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_final_answer(&self) -> bool {
        self.0 == FINAL_ANSWER
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionRef {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ActionRef {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Predicate over actions used by trigger lists such as `force_after`.
///
/// Serialized as a plain string: `"*"` or `"any_tool"` select [`ActionMatcher::AnyTool`],
/// anything else names a single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionMatcher {
    Exact(ActionRef),
    /// Every action except `final_answer`.
    AnyTool,
}

impl ActionMatcher {
    pub fn exact(action: impl Into<ActionRef>) -> Self {
        Self::Exact(action.into())
    }

    pub fn matches(&self, action: &ActionRef) -> bool {
        match self {
            Self::Exact(expected) => expected == action,
            Self::AnyTool => !action.is_final_answer(),
        }
    }

    /// The named action, if this matcher names exactly one.
    pub fn as_exact(&self) -> Option<&ActionRef> {
        match self {
            Self::Exact(action) => Some(action),
            Self::AnyTool => None,
        }
    }
}

impl From<String> for ActionMatcher {
    fn from(raw: String) -> Self {
        match raw.trim() {
            "*" | "any_tool" => Self::AnyTool,
            name => Self::Exact(ActionRef::new(name)),
        }
    }
}

impl From<&str> for ActionMatcher {
    fn from(raw: &str) -> Self {
        Self::from(raw.to_string())
    }
}

impl From<ActionMatcher> for String {
    fn from(matcher: ActionMatcher) -> Self {
        match matcher {
            ActionMatcher::Exact(action) => action.0,
            ActionMatcher::AnyTool => "any_tool".to_string(),
        }
    }
}

impl From<ActionRef> for ActionMatcher {
    fn from(action: ActionRef) -> Self {
        Self::Exact(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_tool_excludes_final_answer() {
        let matcher = ActionMatcher::AnyTool;
        assert!(matcher.matches(&ActionRef::new("think")));
        assert!(!matcher.matches(&ActionRef::final_answer()));
    }

    #[test]
    fn exact_matches_by_name() {
        let matcher = ActionMatcher::exact("search");
        assert!(matcher.matches(&ActionRef::new("search")));
        assert!(!matcher.matches(&ActionRef::new("book")));
    }

    #[test]
    fn matchers_parse_from_strings() {
        let parsed: Vec<ActionMatcher> =
            serde_json::from_str(r#"["*", "any_tool", "search"]"#).expect("parse");
        assert_eq!(
            parsed,
            vec![
                ActionMatcher::AnyTool,
                ActionMatcher::AnyTool,
                ActionMatcher::exact("search"),
            ]
        );
    }
}
