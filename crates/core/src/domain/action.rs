use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::change::FieldChange;
use crate::domain::item::ItemId;
use crate::errors::InvariantViolation;

/// Ask `recipient_email` for information about an item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NeedinfoRequest {
    pub recipient_email: String,
    #[serde(default)]
    pub recipient_display_name: String,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl NeedinfoRequest {
    pub fn new(recipient_email: impl Into<String>, recipient_display_name: impl Into<String>) -> Self {
        Self {
            recipient_email: recipient_email.into(),
            recipient_display_name: recipient_display_name.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A proposed action on one item. Always carries a needinfo, an autofix, or both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction")]
pub struct Action {
    item_id: ItemId,
    needinfo: Option<NeedinfoRequest>,
    autofix: Option<FieldChange>,
}

impl Action {
    pub fn new(
        item_id: impl Into<ItemId>,
        needinfo: Option<NeedinfoRequest>,
        autofix: Option<FieldChange>,
    ) -> Result<Self, InvariantViolation> {
        let item_id = item_id.into();
        let autofix = autofix.filter(|change| !change.is_empty());
        if needinfo.is_none() && autofix.is_none() {
            return Err(InvariantViolation::EmptyAction(item_id));
        }
        Ok(Self { item_id, needinfo, autofix })
    }

    pub fn needinfo(item_id: impl Into<ItemId>, request: NeedinfoRequest) -> Self {
        Self { item_id: item_id.into(), needinfo: Some(request), autofix: None }
    }

    pub fn item_id(&self) -> &ItemId {
        &self.item_id
    }

    pub fn needinfo_request(&self) -> Option<&NeedinfoRequest> {
        self.needinfo.as_ref()
    }

    pub fn autofix(&self) -> Option<&FieldChange> {
        self.autofix.as_ref()
    }

    pub fn has_needinfo(&self) -> bool {
        self.needinfo.is_some()
    }
}

#[derive(Deserialize)]
struct RawAction {
    item_id: ItemId,
    #[serde(default)]
    needinfo: Option<NeedinfoRequest>,
    #[serde(default)]
    autofix: Option<FieldChange>,
}

impl TryFrom<RawAction> for Action {
    type Error = InvariantViolation;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        Action::new(raw.item_id, raw.needinfo, raw.autofix)
    }
}

/// An action filed under a quota bucket with its rule-specific importance.
///
/// Higher importance is kept first when a bucket has to be truncated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate<K = i64> {
    pub bucket: String,
    pub importance: K,
    pub action: Action,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Action, NeedinfoRequest};
    use crate::domain::change::FieldChange;
    use crate::errors::InvariantViolation;

    #[test]
    fn action_without_needinfo_or_autofix_is_rejected() {
        let error = Action::new("9", None, Some(FieldChange::new())).expect_err("empty action");
        assert!(matches!(error, InvariantViolation::EmptyAction(ref id) if id.as_str() == "9"));
    }

    #[test]
    fn action_deserialization_enforces_the_same_rule() {
        let parsed: Result<Action, _> = serde_json::from_value(json!({"item_id": "3"}));
        assert!(parsed.is_err());

        let parsed: Action = serde_json::from_value(json!({
            "item_id": "3",
            "needinfo": {"recipient_email": "dev@example.com"}
        }))
        .expect("valid action");
        assert!(parsed.has_needinfo());
        assert_eq!(
            parsed.needinfo_request().map(|request| request.recipient_email.as_str()),
            Some("dev@example.com")
        );
    }

    #[test]
    fn needinfo_request_carries_extra_template_data() {
        let request = NeedinfoRequest::new("a@example.com", "A").with_extra("reason", json!("stale"));
        assert_eq!(request.extra.get("reason"), Some(&json!("stale")));
    }
}
