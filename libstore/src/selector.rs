use regex::Regex;

use crate::store::StoreError;

enum Predicate {
    Eq(serde_json::Value),
    Regex(Regex),
}

/// Equality and `$regex` predicates over top-level document fields, all of
/// which must match.
#[derive(Default)]
pub struct Selector {
    fields: Vec<(String, Predicate)>,
}

impl Selector {
    pub fn new() -> Self {
        Selector::default()
    }

    pub fn field_eq(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields
            .push((field.to_string(), Predicate::Eq(value.into())));
        self
    }

    pub fn field_regex(mut self, field: &str, pattern: &str) -> Result<Self, StoreError> {
        let regex = Regex::new(pattern)
            .map_err(|e| StoreError::Backend(format!("bad selector regex {pattern:?}: {e}")))?;
        self.fields.push((field.to_string(), Predicate::Regex(regex)));
        Ok(self)
    }

    pub fn matches(&self, doc: &serde_json::Value) -> bool {
        self.fields.iter().all(|(field, predicate)| {
            let Some(actual) = doc.get(field) else {
                return false;
            };
            match predicate {
                Predicate::Eq(expected) => actual == expected,
                Predicate::Regex(regex) => actual.as_str().is_some_and(|s| regex.is_match(s)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_and_regex_predicates_combine() {
        let selector = Selector::new()
            .field_eq("target", "worker-a")
            .field_regex("id", "^response")
            .unwrap();

        assert!(selector.matches(&json!({"target": "worker-a", "id": "response:17"})));
        assert!(!selector.matches(&json!({"target": "worker-b", "id": "response:17"})));
        assert!(!selector.matches(&json!({"target": "worker-a", "id": "request:17"})));
    }

    #[test]
    fn missing_fields_never_match() {
        let selector = Selector::new().field_eq("targetPod", 3);
        assert!(!selector.matches(&json!({"target": "worker-a"})));
        assert!(selector.matches(&json!({"targetPod": 3})));
    }

    #[test]
    fn regex_on_non_string_is_false() {
        let selector = Selector::new().field_regex("id", ".*").unwrap();
        assert!(!selector.matches(&json!({"id": 42})));
    }
}
