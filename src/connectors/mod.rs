use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

pub mod gmail_api;
pub mod google_oauth;
pub mod query;

pub use gmail_api::GmailApi;
pub use google_oauth::GoogleOAuthClient;

const REDACTED_BODY_MAX_LEN: usize = 200;

/// A provider message normalized for extraction. Never persisted as is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Email {
    pub external_id: String,
    pub subject: String,
    /// Raw `From` header value.
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn authorization_url(&self, state: Option<&str>) -> Result<String>;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

#[async_trait]
pub trait MailboxApi: Send + Sync {
    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<String>>;

    async fn get_message(&self, access_token: &str, message_id: &str) -> Result<Email>;

    async fn profile_email(&self, access_token: &str) -> Result<String>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    pub emails: Vec<Email>,
    /// Messages listed but not retrievable; skipped for this pass.
    pub failed_fetches: usize,
}

/// List matching messages then fetch each one, skipping messages whose detail call fails.
///
/// Only a failing list call is an error.
pub async fn search_emails(
    api: &dyn MailboxApi,
    access_token: &str,
    query: &str,
    max_results: usize,
) -> Result<SearchResult> {
    let ids = api
        .list_message_ids(access_token, query, max_results)
        .await?;

    let mut result = SearchResult::default();
    for id in ids {
        match api.get_message(access_token, &id).await {
            Ok(email) => result.emails.push(email),
            Err(err) => {
                result.failed_fetches += 1;
                warn!(message_id = %id, error = %err, "skipping message that could not be fetched");
            }
        }
    }

    Ok(result)
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::Utc;

    use super::{redact_response_body, search_emails, Email, MailboxApi};

    struct ScriptedMailbox {
        messages: HashMap<String, Option<Email>>,
        order: Vec<String>,
    }

    impl ScriptedMailbox {
        fn new(entries: &[(&str, bool)]) -> Self {
            let mut messages = HashMap::new();
            let mut order = Vec::new();
            for (id, ok) in entries {
                let email = ok.then(|| Email {
                    external_id: id.to_string(),
                    subject: format!("subject {id}"),
                    sender: "bank@example.com".to_string(),
                    received_at: Utc::now(),
                    body: String::new(),
                });
                messages.insert(id.to_string(), email);
                order.push(id.to_string());
            }
            Self { messages, order }
        }
    }

    #[async_trait]
    impl MailboxApi for ScriptedMailbox {
        async fn list_message_ids(&self, _: &str, _: &str, max_results: usize) -> Result<Vec<String>> {
            Ok(self.order.iter().take(max_results).cloned().collect())
        }

        async fn get_message(&self, _: &str, message_id: &str) -> Result<Email> {
            self.messages
                .get(message_id)
                .cloned()
                .flatten()
                .ok_or_else(|| anyhow!("detail unavailable for {message_id}"))
        }

        async fn profile_email(&self, _: &str) -> Result<String> {
            Ok("me@gmail.com".to_string())
        }
    }

    #[tokio::test]
    async fn failed_detail_fetch_is_skipped() {
        let mailbox = ScriptedMailbox::new(&[("m1", true), ("m2", false), ("m3", true)]);
        let result = search_emails(&mailbox, "token", "q", 10)
            .await
            .expect("search");

        let ids: Vec<_> = result.emails.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);
        assert_eq!(result.failed_fetches, 1);
    }

    #[tokio::test]
    async fn max_results_bounds_the_list() {
        let mailbox = ScriptedMailbox::new(&[("m1", true), ("m2", true), ("m3", true)]);
        let result = search_emails(&mailbox, "token", "q", 2)
            .await
            .expect("search");
        assert_eq!(result.emails.len(), 2);
    }

    #[test]
    fn long_bodies_are_truncated_on_a_char_boundary() {
        let body = "é".repeat(150);
        let redacted = redact_response_body(&body);
        assert!(redacted.contains("truncated 300 bytes"));
        assert!(redact_response_body("short").eq("short"));
    }
}
