use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tokio::time::sleep;

use crate::config::Settings;
use crate::connectors::{redact_response_body, Email, MailboxApi};

const MAX_PAGE_SIZE: usize = 500;
const MAX_RATE_LIMIT_RETRIES: usize = 5;

/// Gmail REST client for the read-only calls the ingestion pipeline needs.
#[derive(Debug, Clone)]
pub struct GmailApi {
    client: Client,
    api_base: String,
}

impl GmailApi {
    pub fn new(api_base: impl Into<String>, timeout: StdDuration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build gmail http client")?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.google.gmail_api_base.clone(),
            StdDuration::from_secs(settings.http_timeout_secs),
        )
    }

    async fn fetch_with_retry(&self, token: &str, url: &str) -> Result<String> {
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self
                .client
                .get(url)
                .bearer_auth(token)
                .header("accept", "application/json")
                .send()
                .await
                .with_context(|| format!("gmail api request: {url}"))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response
                        .text()
                        .await
                        .context("read gmail 429 response body")?;
                    return Err(anyhow!(
                        "gmail api request exhausted retries: {}",
                        redact_response_body(&body)
                    ));
                }

                let retry_after_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);

                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let body = response
                .text()
                .await
                .context("read gmail api response body")?;
            if !status.is_success() {
                return Err(anyhow!(
                    "gmail api request failed: status={} body={}",
                    status,
                    redact_response_body(&body)
                ));
            }

            return Ok(body);
        }

        Err(anyhow!("gmail api request failed without response"))
    }

    fn list_url(&self, query: &str, page_size: usize, page_token: Option<&str>) -> Result<Url> {
        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", page_size.to_string()),
        ];
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }
        Url::parse_with_params(&format!("{}/users/me/messages", self.api_base), &params)
            .context("build gmail message list url")
    }
}

#[async_trait]
impl MailboxApi for GmailApi {
    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while ids.len() < max_results {
            let page_size = (max_results - ids.len()).min(MAX_PAGE_SIZE);
            let url = self.list_url(query, page_size, page_token.as_deref())?;
            let body = self.fetch_with_retry(access_token, url.as_str()).await?;
            let page: GmailMessageList =
                serde_json::from_str(&body).context("decode gmail message list")?;

            ids.extend(
                page.messages
                    .unwrap_or_default()
                    .into_iter()
                    .map(|stub| stub.id),
            );

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        ids.truncate(max_results);
        Ok(ids)
    }

    async fn get_message(&self, access_token: &str, message_id: &str) -> Result<Email> {
        let url = format!(
            "{}/users/me/messages/{message_id}?format=full",
            self.api_base
        );
        let body = self.fetch_with_retry(access_token, &url).await?;
        let message: GmailMessage = serde_json::from_str(&body)
            .with_context(|| format!("decode gmail message {message_id}"))?;
        Ok(map_gmail_message_to_email(&message))
    }

    async fn profile_email(&self, access_token: &str) -> Result<String> {
        let url = format!("{}/users/me/profile", self.api_base);
        let body = self.fetch_with_retry(access_token, &url).await?;
        let profile: GmailProfile = serde_json::from_str(&body).context("decode gmail profile")?;
        Ok(profile.email_address)
    }
}

fn map_gmail_message_to_email(message: &GmailMessage) -> Email {
    let subject = extract_header(&message.payload, "Subject").unwrap_or_default();
    let sender = extract_header(&message.payload, "From").unwrap_or_default();
    let received_at = extract_header(&message.payload, "Date")
        .as_deref()
        .and_then(parse_date_header)
        .or_else(|| {
            message
                .internal_date
                .as_deref()
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        })
        .unwrap_or_else(Utc::now);

    Email {
        external_id: message.id.clone(),
        subject,
        sender,
        received_at,
        body: extract_body(&message.payload),
    }
}

fn extract_header(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// RFC 2822 date, tolerating a trailing `(Zone)` comment.
fn parse_date_header(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    let without_comment = match trimmed.rfind('(') {
        Some(idx) if trimmed.ends_with(')') => trimmed[..idx].trim_end(),
        _ => trimmed,
    };
    DateTime::parse_from_rfc2822(without_comment)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// All `text/plain` parts joined in order; HTML parts rendered to text only when no plain part exists.
fn extract_body(payload: &GmailPayload) -> String {
    let mut text_parts = Vec::new();
    let mut html_parts = Vec::new();
    collect_body_parts(payload, &mut text_parts, &mut html_parts);

    if !text_parts.is_empty() {
        return text_parts.join("\n");
    }

    html_parts
        .iter()
        .filter_map(|html| html_to_text(html))
        .collect::<Vec<_>>()
        .join("\n")
}

fn html_to_text(html: &str) -> Option<String> {
    std::panic::catch_unwind(|| {
        html2text::from_read(html.as_bytes(), 120)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .ok()
    .filter(|text| !text.is_empty())
}

fn collect_body_parts(
    payload: &GmailPayload,
    text_parts: &mut Vec<String>,
    html_parts: &mut Vec<String>,
) {
    let mime_type = payload
        .mime_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();

    if let Some(data) = payload.body.as_ref().and_then(|body| body.data.as_deref()) {
        if !data.is_empty() {
            match decode_body_data(data) {
                Ok(decoded) if mime_type == "text/plain" => text_parts.push(decoded),
                Ok(decoded) if mime_type == "text/html" => html_parts.push(decoded),
                Ok(_) => {}
                Err(err) => tracing::debug!(error = %err, "skipping undecodable body part"),
            }
        }
    }

    for part in payload.parts.as_deref().unwrap_or_default() {
        collect_body_parts(part, text_parts, html_parts);
    }
}

fn decode_body_data(data: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .context("base64url decode gmail body data")?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Debug, Clone, Deserialize)]
struct GmailProfile {
    #[serde(rename = "emailAddress")]
    email_address: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageStub {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessage {
    id: String,
    payload: GmailPayload,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailPayload {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailBody {
    data: Option<String>,
}
