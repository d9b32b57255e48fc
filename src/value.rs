use serde::{Deserialize, Serialize};

use crate::{RuleOperator, TargetingRule};

/// A dynamically-typed flag value.
///
/// Serializes as a tagged object `{"kind": "bool|string|int|float|json",
/// "value": ...}` so the wire form is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum FlagValue {
    Bool(bool),
    String(String),
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl FlagValue {
    /// Static tag name, used to enforce that a flag's value and default
    /// value carry the same type.
    pub fn type_tag(&self) -> &'static str {
        match self {
            FlagValue::Bool(_) => "bool",
            FlagValue::String(_) => "string",
            FlagValue::Int(_) => "int",
            FlagValue::Float(_) => "float",
            FlagValue::Json(_) => "json",
        }
    }

    pub fn same_tag(&self, other: &FlagValue) -> bool {
        self.type_tag() == other.type_tag()
    }

    /// Coerces to bool. Only `Bool` carries a boolean; every other variant
    /// yields the caller-supplied default.
    pub fn as_bool(&self, default: bool) -> bool {
        match self {
            FlagValue::Bool(b) => *b,
            _ => default,
        }
    }

    /// Coerces to a string: booleans render as the literals "true"/"false",
    /// numbers by decimal formatting, json by canonical serialization.
    pub fn as_string(&self) -> String {
        match self {
            FlagValue::Bool(b) => {
                if *b {
                    "true".to_string()
                } else {
                    "false".to_string()
                }
            }
            FlagValue::String(s) => s.clone(),
            FlagValue::Int(i) => i.to_string(),
            FlagValue::Float(f) => f.to_string(),
            FlagValue::Json(v) => serde_json::to_string(v).unwrap_or_default(),
        }
    }

    pub fn as_int(&self, default: i64) -> i64 {
        match self {
            FlagValue::Int(i) => *i,
            _ => default,
        }
    }

    pub fn as_float(&self, default: f64) -> f64 {
        match self {
            FlagValue::Float(f) => *f,
            FlagValue::Int(i) => *i as f64,
            _ => default,
        }
    }
}

/// Evaluates a single targeting rule against an attribute value that is
/// present on the context. Attribute *absence* is handled by the caller and
/// never reaches this function.
///
/// Failure modes degrade to non-match: unparsable numbers and invalid regex
/// patterns make the rule evaluate false, they never abort evaluation.
/// `negate` is applied last.
pub(crate) fn rule_matches(rule: &TargetingRule, attribute: &str) -> bool {
    let outcome = match rule.operator {
        RuleOperator::Eq => attribute == rule.value,
        RuleOperator::Neq => attribute != rule.value,
        RuleOperator::Contains => attribute.contains(rule.value.as_str()),
        RuleOperator::StartsWith => attribute.starts_with(rule.value.as_str()),
        RuleOperator::EndsWith => attribute.ends_with(rule.value.as_str()),
        RuleOperator::In => rule.value.split(',').map(str::trim).any(|v| v == attribute),
        RuleOperator::NotIn => rule.value.split(',').map(str::trim).all(|v| v != attribute),
        RuleOperator::Gt => numeric(attribute, &rule.value, |a, b| a > b),
        RuleOperator::Gte => numeric(attribute, &rule.value, |a, b| a >= b),
        RuleOperator::Lt => numeric(attribute, &rule.value, |a, b| a < b),
        RuleOperator::Lte => numeric(attribute, &rule.value, |a, b| a <= b),
        RuleOperator::Regex => regex::Regex::new(&rule.value)
            .map(|re| re.is_match(attribute))
            .unwrap_or(false),
    };
    if rule.negate {
        !outcome
    } else {
        outcome
    }
}

fn numeric(attribute: &str, rule_value: &str, cmp: fn(f64, f64) -> bool) -> bool {
    match (attribute.parse::<f64>(), rule_value.parse::<f64>()) {
        (Ok(a), Ok(b)) => cmp(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(operator: RuleOperator, value: &str) -> TargetingRule {
        TargetingRule {
            attribute: "attr".to_string(),
            operator,
            value: value.to_string(),
            negate: false,
        }
    }

    fn negated(operator: RuleOperator, value: &str) -> TargetingRule {
        TargetingRule {
            negate: true,
            ..rule(operator, value)
        }
    }

    #[test]
    fn coerce_bool_to_string() {
        assert_eq!(FlagValue::Bool(true).as_string(), "true");
        assert_eq!(FlagValue::Bool(false).as_string(), "false");
    }

    #[test]
    fn coerce_numeric_to_string() {
        assert_eq!(FlagValue::Int(42).as_string(), "42");
        assert_eq!(FlagValue::Float(1.5).as_string(), "1.5");
    }

    #[test]
    fn coerce_json_to_string() {
        let v = FlagValue::Json(serde_json::json!({"a": 1}));
        assert_eq!(v.as_string(), r#"{"a":1}"#);
    }

    #[test]
    fn string_to_bool_yields_default() {
        assert!(FlagValue::String("true".to_string()).as_bool(true));
        assert!(!FlagValue::String("true".to_string()).as_bool(false));
    }

    #[test]
    fn tag_names() {
        assert_eq!(FlagValue::Bool(true).type_tag(), "bool");
        assert_eq!(FlagValue::Int(0).type_tag(), "int");
        assert!(FlagValue::Int(1).same_tag(&FlagValue::Int(9)));
        assert!(!FlagValue::Int(1).same_tag(&FlagValue::Float(1.0)));
    }

    #[test]
    fn tagged_wire_form() {
        let json = serde_json::to_string(&FlagValue::Bool(true)).unwrap();
        assert_eq!(json, r#"{"kind":"bool","value":true}"#);
        let back: FlagValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FlagValue::Bool(true));

        let json = serde_json::to_string(&FlagValue::String("beta".to_string())).unwrap();
        assert_eq!(json, r#"{"kind":"string","value":"beta"}"#);
    }

    #[test]
    fn string_operators() {
        assert!(rule_matches(&rule(RuleOperator::Eq, "NL"), "NL"));
        assert!(!rule_matches(&rule(RuleOperator::Eq, "NL"), "US"));
        assert!(rule_matches(&rule(RuleOperator::Neq, "NL"), "US"));
        assert!(rule_matches(&rule(RuleOperator::Contains, "beta"), "the-beta-cohort"));
        assert!(rule_matches(&rule(RuleOperator::StartsWith, "us-"), "us-east-1"));
        assert!(rule_matches(&rule(RuleOperator::EndsWith, "@corp.example"), "jan@corp.example"));
    }

    #[test]
    fn set_operators_split_on_commas_and_trim() {
        assert!(rule_matches(&rule(RuleOperator::In, "NL, BE ,DE"), "BE"));
        assert!(!rule_matches(&rule(RuleOperator::In, "NL, BE ,DE"), "FR"));
        assert!(rule_matches(&rule(RuleOperator::NotIn, "NL,BE"), "FR"));
        assert!(!rule_matches(&rule(RuleOperator::NotIn, "NL, FR"), "FR"));
    }

    #[test]
    fn numeric_operators() {
        assert!(rule_matches(&rule(RuleOperator::Gt, "17"), "18"));
        assert!(!rule_matches(&rule(RuleOperator::Gt, "18"), "18"));
        assert!(rule_matches(&rule(RuleOperator::Gte, "18"), "18"));
        assert!(rule_matches(&rule(RuleOperator::Lt, "2.5"), "2.25"));
        assert!(rule_matches(&rule(RuleOperator::Lte, "2.5"), "2.5"));
    }

    #[test]
    fn numeric_parse_failure_is_no_match() {
        assert!(!rule_matches(&rule(RuleOperator::Gt, "17"), "abc"));
        assert!(!rule_matches(&rule(RuleOperator::Lt, "abc"), "17"));
    }

    #[test]
    fn regex_operator() {
        assert!(rule_matches(&rule(RuleOperator::Regex, r"^v\d+\."), "v12.3"));
        assert!(!rule_matches(&rule(RuleOperator::Regex, r"^v\d+\."), "12.3"));
    }

    #[test]
    fn invalid_regex_is_no_match() {
        assert!(!rule_matches(&rule(RuleOperator::Regex, "(unclosed"), "anything"));
    }

    #[test]
    fn negate_applies_last() {
        assert!(!rule_matches(&negated(RuleOperator::Eq, "NL"), "NL"));
        assert!(rule_matches(&negated(RuleOperator::Eq, "NL"), "US"));
        // an invalid pattern evaluates false, so its negation matches
        assert!(rule_matches(&negated(RuleOperator::Regex, "(unclosed"), "anything"));
    }
}
