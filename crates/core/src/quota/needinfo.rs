use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::action::NeedinfoRequest;
use crate::domain::change::FieldChange;
use crate::domain::item::ItemId;
use crate::quota::Limit;

/// Local part treated as "no owner" regardless of the domain.
const NO_OWNER_LOCAL_PART: &str = "nobody";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedinfoPolicy {
    /// Recipients that must never be asked.
    pub skiplist: Vec<String>,
    /// Extra addresses meaning "nobody owns this".
    pub no_owner_sentinels: Vec<String>,
    pub max_per_recipient: Limit,
}

impl Default for NeedinfoPolicy {
    fn default() -> Self {
        Self {
            skiplist: Vec::new(),
            no_owner_sentinels: Vec::new(),
            max_per_recipient: Limit::Unlimited,
        }
    }
}

/// One outgoing message per recipient per run, covering all accepted items.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NeedinfoMessage {
    pub recipient_email: String,
    pub recipient_display_name: String,
    pub items: Vec<ItemId>,
    pub extra: BTreeMap<ItemId, BTreeMap<String, Value>>,
}

/// Produces the comment posted alongside a needinfo flag. Rendering lives outside the engine.
pub trait NeedinfoFormatter {
    fn comment(
        &self,
        rule_name: &str,
        item_id: &ItemId,
        requests: &[&NeedinfoRequest],
    ) -> Option<String>;
}

/// Uses the `comment` extra when a request provides one.
#[derive(Clone, Debug, Default)]
pub struct PlainNeedinfoFormatter;

impl NeedinfoFormatter for PlainNeedinfoFormatter {
    fn comment(
        &self,
        _rule_name: &str,
        _item_id: &ItemId,
        requests: &[&NeedinfoRequest],
    ) -> Option<String> {
        let provided: Vec<&str> = requests
            .iter()
            .filter_map(|request| request.extra.get("comment").and_then(Value::as_str))
            .collect();
        if !provided.is_empty() {
            return Some(provided.join("\n\n"));
        }

        let names: Vec<&str> = requests
            .iter()
            .map(|request| {
                if request.recipient_display_name.trim().is_empty() {
                    request.recipient_email.as_str()
                } else {
                    request.recipient_display_name.as_str()
                }
            })
            .collect();
        (!names.is_empty()).then(|| format!("{}, could you have a look at this?", names.join(", ")))
    }
}

#[derive(Clone, Debug)]
struct RecipientQueue {
    email: String,
    display_name: String,
    items: Vec<(ItemId, NeedinfoRequest)>,
}

#[derive(Clone, Debug)]
pub struct NeedinfoAllocator {
    policy: NeedinfoPolicy,
    skipped: HashSet<String>,
    sentinels: HashSet<String>,
    recipients: BTreeMap<String, RecipientQueue>,
    by_item: BTreeMap<ItemId, BTreeSet<String>>,
}

impl NeedinfoAllocator {
    pub fn new(policy: NeedinfoPolicy) -> Self {
        let skipped = policy.skiplist.iter().map(|email| normalize_email(email)).collect();
        let sentinels =
            policy.no_owner_sentinels.iter().map(|email| normalize_email(email)).collect();
        Self {
            policy,
            skipped,
            sentinels,
            recipients: BTreeMap::new(),
            by_item: BTreeMap::new(),
        }
    }

    /// Whether the request was accepted. Asking the same recipient twice about
    /// the same item is accepted once.
    pub fn add(&mut self, item_id: &ItemId, request: NeedinfoRequest) -> bool {
        let key = normalize_email(&request.recipient_email);

        if self.is_no_owner(&key) {
            debug!(item_id = %item_id, "needinfo rejected: item has no owner");
            return false;
        }
        if self.skipped.contains(&key) {
            debug!(item_id = %item_id, recipient = %key, "needinfo rejected: recipient is skip-listed");
            return false;
        }
        if self.holds(item_id, &key) {
            return true;
        }

        let queued = self.recipients.get(&key).map(|queue| queue.items.len()).unwrap_or(0);
        if !self.policy.max_per_recipient.allows(queued) {
            debug!(
                item_id = %item_id,
                recipient = %key,
                queued,
                "needinfo rejected: recipient already has the maximum outstanding requests"
            );
            return false;
        }

        let queue = self.recipients.entry(key.clone()).or_insert_with(|| RecipientQueue {
            email: request.recipient_email.trim().to_string(),
            display_name: request.recipient_display_name.clone(),
            items: Vec::new(),
        });
        if queue.display_name.trim().is_empty() {
            queue.display_name = request.recipient_display_name.clone();
        }
        queue.items.push((item_id.clone(), request));
        self.by_item.entry(item_id.clone()).or_default().insert(key);
        true
    }

    pub fn holds(&self, item_id: &ItemId, recipient_email: &str) -> bool {
        let key = normalize_email(recipient_email);
        self.by_item.get(item_id).is_some_and(|recipients| recipients.contains(&key))
    }

    pub fn accepted_items(&self) -> BTreeSet<ItemId> {
        self.by_item.keys().cloned().collect()
    }

    pub fn is_accepted(&self, item_id: &ItemId) -> bool {
        self.by_item.contains_key(item_id)
    }

    pub fn recipient_count(&self) -> usize {
        self.recipients.len()
    }

    pub fn messages(&self) -> Vec<NeedinfoMessage> {
        self.recipients
            .values()
            .map(|queue| NeedinfoMessage {
                recipient_email: queue.email.clone(),
                recipient_display_name: queue.display_name.clone(),
                items: queue.items.iter().map(|(item_id, _)| item_id.clone()).collect(),
                extra: queue
                    .items
                    .iter()
                    .filter(|(_, request)| !request.extra.is_empty())
                    .map(|(item_id, request)| (item_id.clone(), request.extra.clone()))
                    .collect(),
            })
            .collect()
    }

    /// The flag and comment change for every item with an accepted request.
    pub fn changes(
        &self,
        rule_name: &str,
        formatter: &dyn NeedinfoFormatter,
    ) -> BTreeMap<ItemId, FieldChange> {
        self.by_item
            .iter()
            .map(|(item_id, recipients)| {
                let requests: Vec<&NeedinfoRequest> = recipients
                    .iter()
                    .filter_map(|key| self.recipients.get(key))
                    .flat_map(|queue| queue.items.iter())
                    .filter(|(queued_id, _)| queued_id == item_id)
                    .map(|(_, request)| request)
                    .collect();

                let flags: Vec<Value> = requests
                    .iter()
                    .map(|request| {
                        json!({
                            "name": "needinfo",
                            "requestee": request.recipient_email.trim(),
                            "status": "?",
                            "new": true,
                        })
                    })
                    .collect();

                let mut change = FieldChange::new().with("flags", Value::Array(flags));
                if let Some(body) = formatter.comment(rule_name, item_id, &requests) {
                    change.insert("comment", json!({ "body": body }));
                }
                (item_id.clone(), change)
            })
            .collect()
    }

    fn is_no_owner(&self, key: &str) -> bool {
        if key.is_empty() || self.sentinels.contains(key) {
            return true;
        }
        key.split('@').next().is_some_and(|local| local == NO_OWNER_LOCAL_PART)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::{NeedinfoAllocator, NeedinfoPolicy, PlainNeedinfoFormatter};
    use crate::domain::action::NeedinfoRequest;
    use crate::domain::item::ItemId;
    use crate::quota::Limit;

    fn request(email: &str) -> NeedinfoRequest {
        NeedinfoRequest::new(email, "Dev")
    }

    #[test]
    fn skiplisted_and_ownerless_recipients_are_rejected() {
        let mut allocator = NeedinfoAllocator::new(NeedinfoPolicy {
            skiplist: vec!["Manager@Example.com".to_string()],
            no_owner_sentinels: vec!["triage-queue@example.com".to_string()],
            ..NeedinfoPolicy::default()
        });

        assert!(!allocator.add(&ItemId::from("1"), request("manager@example.com")));
        assert!(!allocator.add(&ItemId::from("2"), request("nobody@example.com")));
        assert!(!allocator.add(&ItemId::from("3"), request("triage-queue@example.com")));
        assert!(!allocator.add(&ItemId::from("4"), request("  ")));
        assert!(allocator.add(&ItemId::from("5"), request("dev@example.com")));
        assert_eq!(allocator.accepted_items(), BTreeSet::from([ItemId::from("5")]));
    }

    #[test]
    fn per_recipient_cap_is_enforced() {
        let mut allocator = NeedinfoAllocator::new(NeedinfoPolicy {
            max_per_recipient: Limit::AtMost(2),
            ..NeedinfoPolicy::default()
        });

        assert!(allocator.add(&ItemId::from("1"), request("dev@example.com")));
        assert!(allocator.add(&ItemId::from("2"), request("DEV@example.com")));
        assert!(!allocator.add(&ItemId::from("3"), request("dev@example.com")));
        assert!(allocator.add(&ItemId::from("3"), request("other@example.com")));
    }

    #[test]
    fn repeated_request_for_same_item_is_not_double_counted() {
        let mut allocator = NeedinfoAllocator::new(NeedinfoPolicy {
            max_per_recipient: Limit::AtMost(1),
            ..NeedinfoPolicy::default()
        });

        assert!(allocator.add(&ItemId::from("1"), request("dev@example.com")));
        assert!(allocator.add(&ItemId::from("1"), request("dev@example.com")));
        assert_eq!(allocator.messages()[0].items, vec![ItemId::from("1")]);
    }

    #[test]
    fn each_recipient_gets_exactly_one_message_covering_all_items() {
        let mut allocator = NeedinfoAllocator::new(NeedinfoPolicy::default());
        for (id, email) in [("1", "a@example.com"), ("2", "b@example.com"), ("3", "a@example.com")]
        {
            assert!(allocator.add(&ItemId::from(id), request(email)));
        }

        let messages = allocator.messages();
        assert_eq!(messages.len(), 2);
        let recipients: BTreeSet<&str> =
            messages.iter().map(|message| message.recipient_email.as_str()).collect();
        assert_eq!(recipients.len(), messages.len(), "recipient listed in two messages");

        let for_a = messages
            .iter()
            .find(|message| message.recipient_email == "a@example.com")
            .expect("message for a");
        assert_eq!(for_a.items, vec![ItemId::from("1"), ItemId::from("3")]);
    }

    #[test]
    fn changes_carry_a_flag_per_requestee_and_a_comment() {
        let mut allocator = NeedinfoAllocator::new(NeedinfoPolicy::default());
        allocator.add(
            &ItemId::from("9"),
            request("a@example.com").with_extra("comment", json!("Is this still reproducible?")),
        );

        let changes = allocator.changes("stale-reporter", &PlainNeedinfoFormatter);
        let change = changes.get(&ItemId::from("9")).expect("change for item 9");
        assert_eq!(
            change.get("flags"),
            Some(&json!([{"name": "needinfo", "requestee": "a@example.com", "status": "?", "new": true}]))
        );
        assert_eq!(change.get("comment"), Some(&json!({"body": "Is this still reproducible?"})));

        let extra = &allocator.messages()[0].extra;
        assert!(extra.contains_key(&ItemId::from("9")));
    }
}
