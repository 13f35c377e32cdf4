//! Edge condition expressions.
//!
//! Grammar:
//! ```text
//! expr   := clause ("&&" clause)*
//! clause := key ("!=" | "=") value
//!         | key
//! ```
//!
//! An empty expression is true. A bare key is true iff its resolved value is
//! non-empty and neither `"false"` nor `"0"`. Keys and values are compared
//! as trimmed strings.

use orrery_types::{OrreryError, Outcome};

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionExpr {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// `key = value` or `key != value`
    Compare {
        key: String,
        negated: bool,
        value: String,
    },
    /// Bare `key` — truthiness test.
    Truthy { key: String },
}

/// Parse a condition string. Empty input yields an expression with zero
/// clauses, which evaluates to true.
pub fn parse_condition(input: &str) -> orrery_types::Result<ConditionExpr> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ConditionExpr { clauses: Vec::new() });
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        clauses.push(parse_clause(part.trim(), input)?);
    }
    Ok(ConditionExpr { clauses })
}

fn parse_clause(clause: &str, full: &str) -> orrery_types::Result<Clause> {
    if clause.is_empty() {
        return Err(error(full, "empty clause"));
    }

    if let Some(idx) = clause.find("!=") {
        let key = clause[..idx].trim();
        let value = clause[idx + 2..].trim();
        if key.is_empty() {
            return Err(error(full, "missing key before '!='"));
        }
        if value.is_empty() {
            return Err(error(full, "missing value after '!='"));
        }
        return Ok(Clause::Compare {
            key: key.to_string(),
            negated: true,
            value: value.to_string(),
        });
    }

    if let Some(idx) = clause.find('=') {
        let key = clause[..idx].trim();
        let value = clause[idx + 1..].trim();
        if key.is_empty() {
            return Err(error(full, "missing key before '='"));
        }
        if value.is_empty() {
            return Err(error(full, "missing value after '='"));
        }
        return Ok(Clause::Compare {
            key: key.to_string(),
            negated: false,
            value: value.to_string(),
        });
    }

    Ok(Clause::Truthy {
        key: clause.to_string(),
    })
}

fn error(condition: &str, message: &str) -> OrreryError {
    OrreryError::Validation(format!("condition '{condition}': {message}"))
}

/// Evaluate an expression against a key resolver. Missing keys resolve to
/// the empty string. The evaluator is pure.
pub fn evaluate_condition(expr: &ConditionExpr, resolve: &dyn Fn(&str) -> String) -> bool {
    expr.clauses.iter().all(|clause| match clause {
        Clause::Compare {
            key,
            negated,
            value,
        } => {
            let actual = resolve(key);
            if *negated {
                actual != *value
            } else {
                actual == *value
            }
        }
        Clause::Truthy { key } => {
            let actual = resolve(key);
            !actual.is_empty() && actual != "false" && actual != "0"
        }
    })
}

/// Build the standard resolver over the current outcome and a context
/// snapshot. `outcome` and `preferred_label` come from the outcome; any
/// other key is looked up in the context, trying the key as written first
/// and then with a `context.` prefix stripped.
pub fn standard_resolver<'a>(
    outcome: Option<&'a Outcome>,
    snapshot: &'a std::collections::HashMap<String, serde_json::Value>,
) -> impl Fn(&str) -> String + 'a {
    move |key: &str| -> String {
        match key {
            "outcome" => {
                return outcome.map(|o| o.status.as_str().to_string()).unwrap_or_default()
            }
            "preferred_label" => {
                return outcome
                    .and_then(|o| o.preferred_label.clone())
                    .unwrap_or_default()
            }
            _ => {}
        }
        let lookup = |k: &str| -> Option<String> {
            snapshot.get(k).map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        };
        lookup(key)
            .or_else(|| key.strip_prefix("context.").and_then(lookup))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> String + 'a {
        move |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
                .unwrap_or_default()
        }
    }

    #[test]
    fn simple_equality() {
        let expr = parse_condition("outcome=success").unwrap();
        assert!(evaluate_condition(&expr, &resolver(&[("outcome", "success")])));
        assert!(!evaluate_condition(&expr, &resolver(&[("outcome", "fail")])));
    }

    #[test]
    fn negated_equality() {
        let expr = parse_condition("outcome!=fail").unwrap();
        assert!(evaluate_condition(&expr, &resolver(&[("outcome", "success")])));
        assert!(!evaluate_condition(&expr, &resolver(&[("outcome", "fail")])));
    }

    #[test]
    fn conjunction_requires_all_clauses() {
        let expr = parse_condition("outcome=success && env=prod").unwrap();
        assert!(evaluate_condition(
            &expr,
            &resolver(&[("outcome", "success"), ("env", "prod")])
        ));
        assert!(!evaluate_condition(
            &expr,
            &resolver(&[("outcome", "success"), ("env", "dev")])
        ));
    }

    #[test]
    fn empty_expression_is_true() {
        let expr = parse_condition("").unwrap();
        assert!(expr.clauses.is_empty());
        assert!(evaluate_condition(&expr, &resolver(&[])));
        let expr = parse_condition("   ").unwrap();
        assert!(evaluate_condition(&expr, &resolver(&[])));
    }

    #[test]
    fn bare_key_truthiness() {
        let expr = parse_condition("tests_passed").unwrap();
        assert!(evaluate_condition(&expr, &resolver(&[("tests_passed", "true")])));
        assert!(evaluate_condition(&expr, &resolver(&[("tests_passed", "yes")])));
        assert!(!evaluate_condition(&expr, &resolver(&[("tests_passed", "false")])));
        assert!(!evaluate_condition(&expr, &resolver(&[("tests_passed", "0")])));
        assert!(!evaluate_condition(&expr, &resolver(&[])));
    }

    #[test]
    fn values_and_keys_are_trimmed() {
        let expr = parse_condition("  outcome =  success ").unwrap();
        match &expr.clauses[0] {
            Clause::Compare { key, value, .. } => {
                assert_eq!(key, "outcome");
                assert_eq!(value, "success");
            }
            other => panic!("unexpected clause {other:?}"),
        }
    }

    #[test]
    fn empty_key_or_value_beside_operator_is_an_error() {
        assert!(parse_condition("=value").is_err());
        assert!(parse_condition("key=").is_err());
        assert!(parse_condition("!=x").is_err());
        assert!(parse_condition("a=1 && ").is_err());
    }

    #[test]
    fn standard_resolver_reads_outcome_fields() {
        let mut outcome = Outcome::success("ok");
        outcome.preferred_label = Some("approve".into());
        let snapshot = HashMap::new();
        let resolve = standard_resolver(Some(&outcome), &snapshot);
        assert_eq!(resolve("outcome"), "success");
        assert_eq!(resolve("preferred_label"), "approve");
    }

    #[test]
    fn standard_resolver_tries_qualified_then_stripped() {
        let outcome = Outcome::success("ok");
        let mut snapshot = HashMap::new();
        snapshot.insert("env".to_string(), serde_json::json!("prod"));
        snapshot.insert(
            "context.region".to_string(),
            serde_json::json!("us-east"),
        );
        let resolve = standard_resolver(Some(&outcome), &snapshot);
        // Qualified key present verbatim.
        assert_eq!(resolve("context.region"), "us-east");
        // Qualified key falls back to the stripped form.
        assert_eq!(resolve("context.env"), "prod");
        // Bare key.
        assert_eq!(resolve("env"), "prod");
        // Missing key.
        assert_eq!(resolve("absent"), "");
    }

    #[test]
    fn standard_resolver_stringifies_non_string_values() {
        let snapshot: HashMap<String, serde_json::Value> =
            [("count".to_string(), serde_json::json!(42))].into();
        let resolve = standard_resolver(None, &snapshot);
        assert_eq!(resolve("count"), "42");
    }

    #[test]
    fn validation_is_deterministic() {
        // Parsing twice yields identical results, and a valid expression
        // never becomes invalid on re-parse.
        let first = parse_condition("a=1 && b!=2 && flag").unwrap();
        let second = parse_condition("a=1 && b!=2 && flag").unwrap();
        assert_eq!(first, second);
    }
}
