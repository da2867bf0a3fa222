use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use autotriage_core::config::TrackerConfig;
use autotriage_core::{Account, FieldChange, Item, ItemId, SearchQuery, Tracker, TrackerError};

const API_KEY_HEADER: &str = "X-Bugzilla-API-KEY";

#[derive(Debug, Error)]
pub enum RestTrackerError {
    #[error("tracker base url must not be empty")]
    MissingBaseUrl,
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    bugs: Vec<Map<String, Value>>,
}

/// Talks to a Bugzilla-compatible `/rest` API.
pub struct RestTracker {
    client: Client,
    base_url: String,
    api_key: SecretString,
    silent_api_key: Option<SecretString>,
}

impl RestTracker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        silent_api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, RestTrackerError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RestTrackerError::MissingBaseUrl);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url, api_key, silent_api_key })
    }

    pub fn from_config(config: &TrackerConfig) -> Result<Self, RestTrackerError> {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.silent_api_key.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn key_for(&self, account: Account) -> &SecretString {
        match (account, &self.silent_api_key) {
            (Account::Silent, Some(key)) => key,
            _ => &self.api_key,
        }
    }
}

fn transport(error: reqwest::Error) -> TrackerError {
    TrackerError::Transport(error.to_string())
}

async fn reject_unless_success(response: Response) -> Result<Response, TrackerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(TrackerError::Rejected { status: status.as_u16(), message: truncate(&message, 200) })
}

fn truncate(message: &str, max_chars: usize) -> String {
    message.chars().take(max_chars).collect()
}

fn to_item(mut fields: Map<String, Value>) -> Result<Item, TrackerError> {
    let id = match fields.remove("id") {
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(text)) if !text.trim().is_empty() => text,
        other => {
            return Err(TrackerError::Decode(format!("search result without usable id: {other:?}")))
        }
    };
    Ok(Item { id: ItemId(id), fields })
}

#[async_trait]
impl Tracker for RestTracker {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Item>, TrackerError> {
        let url = format!("{}/rest/bug", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .query(query.params())
            .send()
            .await
            .map_err(transport)?;
        let response = reject_unless_success(response).await?;

        let body: SearchResponse =
            response.json().await.map_err(|e| TrackerError::Decode(e.to_string()))?;
        let items = body.bugs.into_iter().map(to_item).collect::<Result<Vec<_>, _>>()?;

        debug!(
            event_name = "tracker.search.completed",
            params = query.params().len(),
            items = items.len(),
            "tracker search completed"
        );
        Ok(items)
    }

    async fn mutate(
        &self,
        item_id: &ItemId,
        change: &FieldChange,
        account: Account,
    ) -> Result<(), TrackerError> {
        let url = format!("{}/rest/bug/{}", self.base_url, item_id.as_str());
        let response = self
            .client
            .put(&url)
            .header(API_KEY_HEADER, self.key_for(account).expose_secret())
            .json(change)
            .send()
            .await
            .map_err(transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(TrackerError::UnknownItem(item_id.clone()));
        }
        if let Err(error) = reject_unless_success(response).await {
            warn!(
                event_name = "tracker.mutate.rejected",
                item_id = %item_id.as_str(),
                transient = error.is_transient(),
                error = %error,
                "tracker rejected change"
            );
            return Err(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockito::Matcher;
    use secrecy::SecretString;
    use serde_json::json;

    use super::RestTracker;
    use autotriage_core::{Account, FieldChange, ItemId, SearchQuery, Tracker, TrackerError};

    fn tracker(url: &str) -> RestTracker {
        RestTracker::new(
            url,
            SecretString::from("standard-key".to_string()),
            Some(SecretString::from("silent-key".to_string())),
            Duration::from_secs(5),
        )
        .expect("tracker")
    }

    #[tokio::test]
    async fn search_maps_bugs_to_items() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/bug")
            .match_header("X-Bugzilla-API-KEY", "standard-key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("product".into(), "Core".into()),
                Matcher::UrlEncoded("resolution".into(), "---".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({"bugs": [
                    {"id": 1001, "summary": "crash", "assigned_to": "dev@example.com"},
                    {"id": 1002, "summary": "hang"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let query = SearchQuery::new().param("product", "Core").param("resolution", "---");
        let items = tracker(&server.url()).search(&query).await.expect("search");

        mock.assert_async().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, ItemId::from("1001"));
        assert_eq!(items[0].str_field("assigned_to"), Some("dev@example.com"));
        assert!(items[0].field("id").is_none());
    }

    #[tokio::test]
    async fn silent_account_uses_its_own_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/rest/bug/77")
            .match_header("X-Bugzilla-API-KEY", "silent-key")
            .match_body(Matcher::Json(json!({"priority": "P2"})))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let change = FieldChange::new().with("priority", json!("P2"));
        tracker(&server.url())
            .mutate(&ItemId::from("77"), &change, Account::Silent)
            .await
            .expect("mutate");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_client_errors_are_not() {
        let mut server = mockito::Server::new_async().await;
        let _busy = server.mock("PUT", "/rest/bug/1").with_status(503).create_async().await;
        let _bad = server
            .mock("PUT", "/rest/bug/2")
            .with_status(400)
            .with_body("invalid field")
            .create_async()
            .await;
        let _missing = server.mock("PUT", "/rest/bug/3").with_status(404).create_async().await;

        let tracker = tracker(&server.url());
        let change = FieldChange::new().with("status", json!("RESOLVED"));

        let busy = tracker.mutate(&ItemId::from("1"), &change, Account::Standard).await;
        assert!(matches!(busy, Err(ref error) if error.is_transient()));

        let bad = tracker.mutate(&ItemId::from("2"), &change, Account::Standard).await;
        match bad {
            Err(TrackerError::Rejected { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "invalid field");
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        let missing = tracker.mutate(&ItemId::from("3"), &change, Account::Standard).await;
        assert_eq!(missing, Err(TrackerError::UnknownItem(ItemId::from("3"))));
    }

    #[tokio::test]
    async fn malformed_search_body_is_a_decode_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rest/bug")
            .with_status(200)
            .with_body(json!({"bugs": [{"summary": "no id"}]}).to_string())
            .create_async()
            .await;

        let error = tracker(&server.url()).search(&SearchQuery::new()).await.expect_err("no id");
        assert!(matches!(error, TrackerError::Decode(_)));
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let result = RestTracker::new(
            "  ",
            SecretString::from("key".to_string()),
            None,
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }
}
