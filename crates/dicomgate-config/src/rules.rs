use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Tag values extracted from one DICOM instance, keyed by tag keyword
/// (e.g. `PatientID`) or `GGGG,EEEE` hex.
pub type TagValues = HashMap<String, String>;

/// Comparison operator of a rule condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    Contains,
    /// Regular expression match over the whole value
    Matches,
    In,
    NotIn,
    /// Tag present with a non-empty value
    Exists,
    /// Lexicographic `low..=high`; DICOM DA/TM values order correctly
    Range,
}

/// What a matching rule does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Filter outcome: admit the instance
    Accept,
    /// Filter outcome: drop the instance (recorded, not written)
    Reject,
    /// Routing outcome: add the named route destination for this study
    AddDestination { destination: String },
    /// Routing outcome: remove the named route destination for this study
    RemoveDestination { destination: String },
}

/// A single filter/validation/routing rule over instance tag values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Tag keyword or `GGGG,EEEE` the condition reads
    pub field: String,
    pub operator: RuleOperator,
    /// Comparison operand; unused for `exists`
    #[serde(default)]
    pub value: Option<String>,
    /// Operand set for `in` / `not_in`, bounds for `range` (two entries)
    #[serde(default)]
    pub values: Vec<String>,
    pub action: RuleAction,
}

impl Rule {
    /// Evaluate the condition against extracted tag values. A missing tag
    /// matches nothing except `not_equals` and `not_in`.
    pub fn condition_matches(&self, tags: &TagValues) -> bool {
        let actual = tags.get(&self.field).map(String::as_str);
        match self.operator {
            RuleOperator::Exists => actual.map(|v| !v.is_empty()).unwrap_or(false),
            RuleOperator::Equals => actual == self.value.as_deref(),
            RuleOperator::NotEquals => actual != self.value.as_deref(),
            RuleOperator::Contains => match (actual, self.value.as_deref()) {
                (Some(a), Some(v)) => a.contains(v),
                _ => false,
            },
            RuleOperator::Matches => match (actual, self.value.as_deref()) {
                (Some(a), Some(pattern)) => match Regex::new(pattern) {
                    Ok(re) => re.is_match(a),
                    Err(e) => {
                        warn!(field = %self.field, pattern, error = %e, "invalid rule regex");
                        false
                    }
                },
                _ => false,
            },
            RuleOperator::In => actual
                .map(|a| self.values.iter().any(|v| v == a))
                .unwrap_or(false),
            RuleOperator::NotIn => actual
                .map(|a| !self.values.iter().any(|v| v == a))
                .unwrap_or(true),
            RuleOperator::Range => match (actual, self.values.first(), self.values.get(1)) {
                (Some(a), Some(low), Some(high)) => a >= low.as_str() && a <= high.as_str(),
                _ => false,
            },
        }
    }
}

/// Apply filter rules in order; the first matching rule decides. No match
/// admits the instance.
pub fn filter_admits(filters: &[Rule], tags: &TagValues) -> bool {
    for rule in filters {
        if rule.condition_matches(tags) {
            return match rule.action {
                RuleAction::Accept => true,
                RuleAction::Reject => false,
                // Routing actions are not filter outcomes
                _ => continue,
            };
        }
    }
    true
}

/// Every validation rule's condition must hold.
pub fn validation_passes(rules: &[Rule], tags: &TagValues) -> bool {
    rules.iter().all(|r| r.condition_matches(tags))
}

/// Apply routing rules, returning (adds, removes) of destination names.
pub fn routing_adjustments(rules: &[Rule], tags: &TagValues) -> (Vec<String>, Vec<String>) {
    let mut adds = Vec::new();
    let mut removes = Vec::new();
    for rule in rules {
        if !rule.condition_matches(tags) {
            continue;
        }
        match &rule.action {
            RuleAction::AddDestination { destination } => {
                if !adds.contains(destination) {
                    adds.push(destination.clone());
                }
            }
            RuleAction::RemoveDestination { destination } => {
                if !removes.contains(destination) {
                    removes.push(destination.clone());
                }
            }
            _ => {}
        }
    }
    (adds, removes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn rule(field: &str, op: RuleOperator, value: Option<&str>, action: RuleAction) -> Rule {
        Rule {
            field: field.into(),
            operator: op,
            value: value.map(String::from),
            values: Vec::new(),
            action,
        }
    }

    #[test]
    fn test_equals_and_not_equals() {
        let t = tags(&[("Modality", "CT")]);
        assert!(rule("Modality", RuleOperator::Equals, Some("CT"), RuleAction::Accept)
            .condition_matches(&t));
        assert!(
            rule("Modality", RuleOperator::NotEquals, Some("MR"), RuleAction::Accept)
                .condition_matches(&t)
        );
        // missing tag: not_equals still matches
        assert!(
            rule("BodyPart", RuleOperator::NotEquals, Some("HEAD"), RuleAction::Accept)
                .condition_matches(&t)
        );
    }

    #[test]
    fn test_matches_regex() {
        let t = tags(&[("PatientID", "P12345")]);
        assert!(
            rule("PatientID", RuleOperator::Matches, Some(r"^P\d{5}$"), RuleAction::Accept)
                .condition_matches(&t)
        );
        assert!(
            !rule("PatientID", RuleOperator::Matches, Some(r"^Q"), RuleAction::Accept)
                .condition_matches(&t)
        );
    }

    #[test]
    fn test_in_and_range() {
        let t = tags(&[("Modality", "CT"), ("StudyDate", "20260115")]);
        let mut r = rule("Modality", RuleOperator::In, None, RuleAction::Accept);
        r.values = vec!["CT".into(), "MR".into()];
        assert!(r.condition_matches(&t));

        let mut r = rule("StudyDate", RuleOperator::Range, None, RuleAction::Accept);
        r.values = vec!["20260101".into(), "20261231".into()];
        assert!(r.condition_matches(&t));
        r.values = vec!["20250101".into(), "20251231".into()];
        assert!(!r.condition_matches(&t));
    }

    #[test]
    fn test_filter_first_match_wins() {
        let filters = vec![
            rule("Modality", RuleOperator::Equals, Some("OT"), RuleAction::Reject),
            rule("Modality", RuleOperator::Exists, None, RuleAction::Accept),
        ];
        assert!(!filter_admits(&filters, &tags(&[("Modality", "OT")])));
        assert!(filter_admits(&filters, &tags(&[("Modality", "CT")])));
        // no match at all admits
        assert!(filter_admits(&filters, &tags(&[])));
    }

    #[test]
    fn test_routing_adjustments() {
        let rules = vec![
            Rule {
                field: "Modality".into(),
                operator: RuleOperator::Equals,
                value: Some("CT".into()),
                values: Vec::new(),
                action: RuleAction::AddDestination {
                    destination: "ct-archive".into(),
                },
            },
            Rule {
                field: "StationName".into(),
                operator: RuleOperator::Equals,
                value: Some("TRIAGE".into()),
                values: Vec::new(),
                action: RuleAction::RemoveDestination {
                    destination: "research".into(),
                },
            },
        ];
        let (adds, removes) =
            routing_adjustments(&rules, &tags(&[("Modality", "CT"), ("StationName", "TRIAGE")]));
        assert_eq!(adds, vec!["ct-archive".to_string()]);
        assert_eq!(removes, vec!["research".to_string()]);
    }
}
