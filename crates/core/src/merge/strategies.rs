//! Built-in merge functions for commonly contended fields.
//!
//! Each strategy is built for a known set of rules and refuses to merge
//! values coming from a rule it was not told about.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::MergeFn;
use crate::errors::ConfigurationError;

fn known_rules<I, S>(rules: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    rules.into_iter().map(Into::into).collect()
}

fn ensure_known(known: &[String], values: &BTreeMap<String, Value>) -> Result<(), ConfigurationError> {
    let unknown: Vec<String> =
        values.keys().filter(|rule| !known.contains(rule)).cloned().collect();
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(ConfigurationError::UnexpectedRules { rules: unknown })
    }
}

/// Keeps the value of the first rule in `order` that contributed one.
pub fn prefer_rules<I, S>(order: I) -> MergeFn
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let order = known_rules(order);
    Box::new(move |values| {
        ensure_known(&order, values)?;
        order
            .iter()
            .find_map(|rule| values.get(rule).cloned())
            .ok_or_else(|| ConfigurationError::UnexpectedRules {
                rules: values.keys().cloned().collect(),
            })
    })
}

/// Concatenates comment bodies in rule order, separated by a blank line.
///
/// Accepts either bare strings or `{"body": ...}` objects. Any other keys of the
/// first contributing object are kept, so privacy or markdown flags survive.
pub fn join_comments<I, S>(order: I) -> MergeFn
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let order = known_rules(order);
    Box::new(move |values| {
        ensure_known(&order, values)?;

        let mut base = Map::new();
        let mut bodies = Vec::new();
        for value in order.iter().filter_map(|rule| values.get(rule)) {
            match value {
                Value::String(body) => bodies.push(body.clone()),
                Value::Object(object) => {
                    if base.is_empty() {
                        base = object.clone();
                    }
                    if let Some(body) = object.get("body").and_then(Value::as_str) {
                        bodies.push(body.to_string());
                    }
                }
                other => bodies.push(other.to_string()),
            }
        }

        base.insert("body".to_string(), Value::String(bodies.join("\n\n")));
        Ok(Value::Object(base))
    })
}

/// Unions list-shaped values.
///
/// Plain arrays are concatenated without duplicates. Objects of the form
/// `{"add": [...], "remove": [...]}` have each list unioned; an element removed
/// by any rule is dropped from the merged `add` list.
pub fn union_ops<I, S>(known: I) -> MergeFn
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let known = known_rules(known);
    Box::new(move |values| {
        ensure_known(&known, values)?;

        if values.values().all(Value::is_array) {
            let mut merged = Vec::new();
            for value in values.values().filter_map(Value::as_array).flatten() {
                push_unique(&mut merged, value);
            }
            return Ok(Value::Array(merged));
        }

        let mut add = Vec::new();
        let mut remove = Vec::new();
        for value in values.values() {
            match value {
                Value::Object(ops) => {
                    for added in ops.get("add").and_then(Value::as_array).into_iter().flatten() {
                        push_unique(&mut add, added);
                    }
                    for removed in ops.get("remove").and_then(Value::as_array).into_iter().flatten() {
                        push_unique(&mut remove, removed);
                    }
                }
                Value::Array(items) => {
                    for added in items {
                        push_unique(&mut add, added);
                    }
                }
                other => push_unique(&mut add, other),
            }
        }
        add.retain(|value| !remove.contains(value));

        let mut merged = Map::new();
        if !add.is_empty() {
            merged.insert("add".to_string(), Value::Array(add));
        }
        if !remove.is_empty() {
            merged.insert("remove".to_string(), Value::Array(remove));
        }
        Ok(Value::Object(merged))
    })
}

fn push_unique(target: &mut Vec<Value>, value: &Value) {
    if !target.contains(value) {
        target.push(value.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Value};

    use super::{join_comments, prefer_rules, union_ops};
    use crate::errors::ConfigurationError;

    fn values(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(rule, value)| (rule.to_string(), value.clone())).collect()
    }

    #[test]
    fn prefer_rules_follows_the_given_order() {
        let merge = prefer_rules(["regression", "stalled", "untriaged"]);
        let merged = merge(&values(&[("untriaged", json!("P3")), ("stalled", json!("P2"))]))
            .expect("known rules");
        assert_eq!(merged, json!("P2"));
    }

    #[test]
    fn join_comments_keeps_rule_order_and_flags() {
        let merge = join_comments(["stalled", "regression"]);
        let merged = merge(&values(&[
            ("regression", json!("Regression detected.")),
            ("stalled", json!({"body": "No activity for a year.", "is_private": false})),
        ]))
        .expect("known rules");

        assert_eq!(
            merged,
            json!({"body": "No activity for a year.\n\nRegression detected.", "is_private": false})
        );
    }

    #[test]
    fn union_ops_combines_keyword_edits() {
        let merge = union_ops(["a", "b"]);
        let merged = merge(&values(&[
            ("a", json!({"add": ["regression", "perf"]})),
            ("b", json!({"add": ["perf", "stale"], "remove": ["stale", "triage"]})),
        ]))
        .expect("known rules");

        assert_eq!(merged, json!({"add": ["regression", "perf"], "remove": ["stale", "triage"]}));
    }

    #[test]
    fn union_ops_concatenates_flag_lists() {
        let merge = union_ops(["a", "b"]);
        let flag = json!({"name": "needinfo", "requestee": "dev@example.org", "status": "?", "new": true});
        let merged = merge(&values(&[("a", json!([flag.clone()])), ("b", json!([flag.clone()]))]))
            .expect("known rules");
        assert_eq!(merged, json!([flag]));
    }

    #[test]
    fn strategies_reject_unknown_rules() {
        for merge in [prefer_rules(["a"]), join_comments(["a"]), union_ops(["a"])] {
            let error = merge(&values(&[("a", json!("x")), ("z", json!("y"))])).expect_err("z is unknown");
            assert_eq!(error, ConfigurationError::UnexpectedRules { rules: vec!["z".to_string()] });
        }
    }
}
