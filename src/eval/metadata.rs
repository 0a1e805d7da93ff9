use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::eval::model::Metadata;

/// Caller-supplied predicate comparing expected and actual metadata.
pub trait MetadataChecker: Send + Sync {
    fn check(&self, expected: &Metadata, actual: &Metadata) -> bool;
}

impl<F> MetadataChecker for F
where
    F: Fn(&Metadata, &Metadata) -> bool + Send + Sync,
{
    fn check(&self, expected: &Metadata, actual: &Metadata) -> bool {
        self(expected, actual)
    }
}

/// What the gate does when the agent reported no metadata for a case that
/// expects some.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataPolicy {
    /// Missing actual metadata passes vacuously.
    #[default]
    Lenient,
    /// Missing actual metadata fails the gate.
    Strict,
}

impl FromStr for MetadataPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(MetadataPolicy::Lenient),
            "strict" => Ok(MetadataPolicy::Strict),
            other => Err(format!("unknown metadata policy '{other}'")),
        }
    }
}

impl fmt::Display for MetadataPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataPolicy::Lenient => f.write_str("lenient"),
            MetadataPolicy::Strict => f.write_str("strict"),
        }
    }
}

/// Computes `metadata_passed`: `None` when no check applies.
pub fn gate(
    checker: Option<&dyn MetadataChecker>,
    policy: MetadataPolicy,
    expected: Option<&Metadata>,
    actual: Option<&Metadata>,
) -> Option<bool> {
    let checker = checker?;
    let expected = expected.filter(|m| !m.is_empty())?;

    match actual.filter(|m| !m.is_empty()) {
        Some(actual) => Some(checker.check(expected, actual)),
        None => Some(policy == MetadataPolicy::Lenient),
    }
}

/// Compares the listed keys as unordered sets; with no keys, every key of the
/// expected metadata is compared.
#[derive(Debug, Clone, Default)]
pub struct SetEquality {
    keys: Vec<String>,
}

impl SetEquality {
    pub fn on<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn all_keys() -> Self {
        Self::default()
    }
}

fn as_set(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        None | Some(Value::Null) => BTreeSet::new(),
        Some(Value::Array(items)) => items.iter().map(Value::to_string).collect(),
        Some(other) => std::iter::once(other.to_string()).collect(),
    }
}

impl MetadataChecker for SetEquality {
    fn check(&self, expected: &Metadata, actual: &Metadata) -> bool {
        let keys: Vec<&String> = if self.keys.is_empty() {
            expected.keys().collect()
        } else {
            self.keys.iter().collect()
        };

        keys.into_iter()
            .all(|key| as_set(expected.get(key)) == as_set(actual.get(key)))
    }
}

/// Passes when every expected item appears in the actual metadata; extra
/// actual items are allowed.
#[derive(Debug, Clone, Default)]
pub struct ContainsExpected;

impl MetadataChecker for ContainsExpected {
    fn check(&self, expected: &Metadata, actual: &Metadata) -> bool {
        expected
            .iter()
            .all(|(key, value)| as_set(Some(value)).is_subset(&as_set(actual.get(key))))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn metadata(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn set_equality_ignores_order() {
        let checker = SetEquality::on(["tool_calls"]);
        let expected = metadata(json!({"tool_calls": ["get_orders", "refund"]}));
        let actual = metadata(json!({"tool_calls": ["refund", "get_orders"], "latency": 3}));
        assert!(checker.check(&expected, &actual));

        let mismatched = metadata(json!({"tool_calls": ["get_orders"]}));
        assert!(!checker.check(&expected, &mismatched));
    }

    #[test]
    fn contains_expected_allows_extra_items() {
        let expected = metadata(json!({"citations": ["doc.pdf"]}));
        let actual = metadata(json!({"citations": ["doc.pdf", "faq.md"]}));
        assert!(ContainsExpected.check(&expected, &actual));
        assert!(!ContainsExpected.check(&actual, &expected));
    }

    #[test]
    fn gate_is_not_applicable_without_checker_or_expectation() {
        let expected = metadata(json!({"tool_calls": ["a"]}));
        assert_eq!(gate(None, MetadataPolicy::Lenient, Some(&expected), Some(&expected)), None);

        let checker = SetEquality::all_keys();
        assert_eq!(gate(Some(&checker), MetadataPolicy::Lenient, None, Some(&expected)), None);
        assert_eq!(
            gate(Some(&checker), MetadataPolicy::Lenient, Some(&Metadata::new()), Some(&expected)),
            None
        );
    }

    #[test]
    fn missing_actual_metadata_follows_policy() {
        let checker = SetEquality::all_keys();
        let expected = metadata(json!({"tool_calls": ["a"]}));

        assert_eq!(gate(Some(&checker), MetadataPolicy::Lenient, Some(&expected), None), Some(true));
        assert_eq!(gate(Some(&checker), MetadataPolicy::Strict, Some(&expected), None), Some(false));
        assert_eq!(
            gate(Some(&checker), MetadataPolicy::Strict, Some(&expected), Some(&Metadata::new())),
            Some(false)
        );
    }

    #[test]
    fn closures_are_checkers() {
        let checker = |expected: &Metadata, actual: &Metadata| expected.len() == actual.len();
        let one = metadata(json!({"k": 1}));
        assert_eq!(gate(Some(&checker), MetadataPolicy::Lenient, Some(&one), Some(&one)), Some(true));
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!("STRICT".parse::<MetadataPolicy>().unwrap(), MetadataPolicy::Strict);
        assert!("sometimes".parse::<MetadataPolicy>().is_err());
    }
}
