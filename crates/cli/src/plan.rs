//! Plan files: the JSON hand-off from rule scripts to the engine.
//!
//! ```json
//! {
//!   "rules": [{
//!     "name": "stalled",
//!     "nag": true,
//!     "query": [["product", "Core"], ["resolution", "---"]],
//!     "items": [{"id": "1001"}],
//!     "candidates": [{"bucket": "team-a", "importance": 3,
//!                     "action": {"item_id": "1001", "needinfo": {"recipient_email": "dev@example.com"}}}],
//!     "autofix": {"1001": {"priority": "P2"}},
//!     "nags": [{"item_id": "1001", "owner_email": "lead@example.com"}]
//!   }],
//!   "compose": {"name": "daily", "merge": {"comment": {"strategy": "join_comments", "rules": ["stalled"]}}}
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use autotriage_core::merge::strategies;
use autotriage_core::{
    AutofixChanges, Candidate, CrossRuleMerger, EngineError, Item, ItemId, MergeRegistry,
    NagRequest, Rule, RuleCapabilities, RuleOutput, RunContext, SearchQuery,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    rules: Vec<RuleFile>,
    #[serde(default)]
    compose: Option<ComposeFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    name: String,
    #[serde(default)]
    nag: bool,
    #[serde(default)]
    query: Option<SearchQuery>,
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    candidates: Vec<Candidate>,
    /// Untyped change map, shape guessed from its keys.
    #[serde(default)]
    autofix: BTreeMap<String, Value>,
    /// Typed alternative to `autofix`.
    #[serde(default)]
    autofix_changes: Option<AutofixChanges>,
    #[serde(default)]
    nags: Vec<NagRequest>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ComposeFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    change_ceiling: Option<usize>,
    #[serde(default)]
    merge: BTreeMap<String, MergeStrategy>,
}

/// Registered merge function for one contended field.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MergeStrategy {
    PreferRules { rules: Vec<String> },
    JoinComments { rules: Vec<String> },
    UnionOps { rules: Vec<String> },
}

/// A rule whose output was computed ahead of time and stored in a plan file.
#[derive(Clone, Debug)]
pub struct PlannedRule {
    name: String,
    capabilities: RuleCapabilities,
    query: Option<SearchQuery>,
    output: RuleOutput,
}

impl PlannedRule {
    fn from_file(rule: RuleFile) -> Result<Self> {
        if rule.name.trim().is_empty() {
            bail!("rule names must not be empty");
        }

        let autofix = match rule.autofix_changes {
            Some(_) if !rule.autofix.is_empty() => {
                bail!("rule `{}` sets both `autofix` and `autofix_changes`", rule.name)
            }
            Some(explicit) => explicit,
            None => AutofixChanges::detect(rule.autofix)
                .with_context(|| format!("rule `{}` has a malformed autofix map", rule.name))?,
        };

        if !rule.nag && !rule.nags.is_empty() {
            bail!("rule `{}` lists nags but does not declare `nag: true`", rule.name);
        }

        Ok(Self {
            name: rule.name,
            capabilities: RuleCapabilities { nag: rule.nag },
            query: rule.query,
            output: RuleOutput {
                items: rule.items,
                candidates: rule.candidates,
                autofix,
                nags: rule.nags,
            },
        })
    }
}

#[async_trait]
impl Rule for PlannedRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> RuleCapabilities {
        self.capabilities
    }

    async fn collect(&self, context: &RunContext) -> Result<RuleOutput, EngineError> {
        let mut output = self.output.clone();
        if let Some(query) = &self.query {
            let known: BTreeSet<ItemId> = output.items.iter().map(|item| item.id.clone()).collect();
            let found = context.tracker.search(query).await?;
            output.items.extend(found.into_iter().filter(|item| !known.contains(&item.id)));
        }
        Ok(output)
    }
}

#[derive(Debug)]
pub struct Plan {
    rules: Vec<PlannedRule>,
    compose: ComposeFile,
}

impl Plan {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("could not read plan file `{}`", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid plan file `{}`", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: PlanFile = serde_json::from_str(raw)?;
        if file.rules.is_empty() {
            bail!("a plan needs at least one rule");
        }

        let mut seen = BTreeSet::new();
        let mut rules = Vec::with_capacity(file.rules.len());
        for rule in file.rules {
            if !seen.insert(rule.name.clone()) {
                bail!("rule `{}` appears more than once", rule.name);
            }
            rules.push(PlannedRule::from_file(rule)?);
        }

        Ok(Self { rules, compose: file.compose.unwrap_or_default() })
    }

    pub fn rules(&self) -> &[PlannedRule] {
        &self.rules
    }

    pub fn compose_name(&self) -> &str {
        self.compose.name.as_deref().unwrap_or("composed")
    }

    pub fn compose_change_ceiling(&self) -> Option<usize> {
        self.compose.change_ceiling
    }

    pub fn merge_strategies(&self) -> &BTreeMap<String, MergeStrategy> {
        &self.compose.merge
    }

    pub fn merger(&self) -> CrossRuleMerger {
        let mut registry = MergeRegistry::new();
        for (field, strategy) in &self.compose.merge {
            let merge = match strategy {
                MergeStrategy::PreferRules { rules } => strategies::prefer_rules(rules.clone()),
                MergeStrategy::JoinComments { rules } => strategies::join_comments(rules.clone()),
                MergeStrategy::UnionOps { rules } => strategies::union_ops(rules.clone()),
            };
            registry.insert(field.clone(), merge);
        }
        CrossRuleMerger::new(registry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use serde_json::json;

    use super::{MergeStrategy, Plan};
    use autotriage_core::{
        AutofixChanges, InMemoryTracker, Item, ItemId, Rule, RunContext,
    };

    fn context(tracker: InMemoryTracker) -> RunContext {
        RunContext {
            date: NaiveDate::from_ymd_opt(2024, 5, 6).expect("valid date"),
            tracker: Arc::new(tracker),
        }
    }

    #[test]
    fn numeric_autofix_keys_become_per_item_changes() {
        let plan = Plan::from_json(
            &json!({
                "rules": [{
                    "name": "stalled",
                    "autofix": {"11": {"status": "RESOLVED"}, "12": {"priority": "P3"}}
                }]
            })
            .to_string(),
        )
        .expect("valid plan");

        let rule = &plan.rules()[0];
        assert!(matches!(rule.output.autofix, AutofixChanges::PerItem(ref changes) if changes.len() == 2));
    }

    #[test]
    fn both_autofix_forms_are_rejected() {
        let error = Plan::from_json(
            &json!({
                "rules": [{
                    "name": "stalled",
                    "autofix": {"status": "RESOLVED"},
                    "autofix_changes": {"global": {"priority": "P3"}}
                }]
            })
            .to_string(),
        )
        .expect_err("ambiguous autofix");
        assert!(error.to_string().contains("both"));
    }

    #[test]
    fn duplicate_rule_names_are_rejected() {
        let raw = json!({"rules": [{"name": "a"}, {"name": "a"}]}).to_string();
        assert!(Plan::from_json(&raw).is_err());
    }

    #[test]
    fn nags_require_the_capability() {
        let raw = json!({
            "rules": [{"name": "a", "nags": [{"item_id": "1", "owner_email": "x@example.com"}]}]
        })
        .to_string();
        assert!(Plan::from_json(&raw).is_err());
    }

    #[test]
    fn compose_section_registers_strategies() {
        let plan = Plan::from_json(
            &json!({
                "rules": [{"name": "a"}, {"name": "b"}],
                "compose": {
                    "name": "daily",
                    "merge": {
                        "comment": {"strategy": "join_comments", "rules": ["a", "b"]},
                        "priority": {"strategy": "prefer_rules", "rules": ["b", "a"]}
                    }
                }
            })
            .to_string(),
        )
        .expect("valid plan");

        assert_eq!(plan.compose_name(), "daily");
        assert_eq!(
            plan.merge_strategies().get("priority"),
            Some(&MergeStrategy::PreferRules { rules: vec!["b".to_string(), "a".to_string()] })
        );
    }

    #[tokio::test]
    async fn query_results_are_added_to_inline_items() {
        let plan = Plan::from_json(
            &json!({
                "rules": [{
                    "name": "untriaged",
                    "query": [["product", "Core"]],
                    "items": [{"id": "1", "fields": {"product": "Core"}}]
                }]
            })
            .to_string(),
        )
        .expect("valid plan");
        let tracker = InMemoryTracker::with_items([
            Item::new("1").with_field("product", json!("Core")),
            Item::new("2").with_field("product", json!("Core")),
            Item::new("3").with_field("product", json!("Toolkit")),
        ]);

        let output = plan.rules()[0].collect(&context(tracker)).await.expect("collect");
        let ids: Vec<&ItemId> = output.items.iter().map(|item| &item.id).collect();
        assert_eq!(ids, vec![&ItemId::from("1"), &ItemId::from("2")]);
    }
}
