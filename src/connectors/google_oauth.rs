use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::config::{GoogleSettings, Settings};
use crate::connectors::{redact_response_body, OAuthProvider, TokenGrant};

pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";
const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
pub struct GoogleOAuthClient {
    client: Client,
    google: GoogleSettings,
}

impl GoogleOAuthClient {
    pub fn new(google: GoogleSettings, timeout: StdDuration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build oauth http client")?;
        Ok(Self { client, google })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.require_google_client()?;
        Self::new(
            settings.google.clone(),
            StdDuration::from_secs(settings.http_timeout_secs),
        )
    }

    async fn post_token_form(&self, form: &[(&str, &str)], what: &str) -> Result<TokenGrant> {
        let token_url = &self.google.token_url;
        let response = self
            .client
            .post(token_url)
            .form(form)
            .send()
            .await
            .with_context(|| format!("{what}: request token from {token_url}"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("{what}: read token response"))?;
        if !status.is_success() {
            return Err(anyhow!(
                "{what} failed: status={} body={}",
                status,
                redact_response_body(&body)
            ));
        }

        grant_from_response(&body, Utc::now())
    }
}

#[async_trait]
impl OAuthProvider for GoogleOAuthClient {
    fn authorization_url(&self, state: Option<&str>) -> Result<String> {
        let mut params = vec![
            ("client_id", self.google.client_id.as_str()),
            ("redirect_uri", self.google.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", GMAIL_READONLY_SCOPE),
            ("access_type", "offline"),
            ("include_granted_scopes", "true"),
            ("prompt", "consent"),
        ];
        if let Some(state) = state {
            params.push(("state", state));
        }

        let url = Url::parse_with_params(&self.google.auth_url, &params)
            .with_context(|| format!("invalid google auth url: {}", self.google.auth_url))?;
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.post_token_form(
            &[
                ("code", code),
                ("client_id", self.google.client_id.as_str()),
                ("client_secret", self.google.client_secret.as_str()),
                ("redirect_uri", self.google.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ],
            "google code exchange",
        )
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.post_token_form(
            &[
                ("client_id", self.google.client_id.as_str()),
                ("client_secret", self.google.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ],
            "google token refresh",
        )
        .await
    }
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

fn grant_from_response(body: &str, now: DateTime<Utc>) -> Result<TokenGrant> {
    let payload: OAuthTokenResponse =
        serde_json::from_str(body).context("decode google token JSON response")?;
    if payload.access_token.trim().is_empty() {
        return Err(anyhow!("google token response carried an empty access token"));
    }

    let expires_at = payload
        .expires_in
        .map(|secs| {
            Duration::try_seconds(secs.saturating_sub(EXPIRY_SKEW_SECONDS))
                .and_then(|lifetime| now.checked_add_signed(lifetime))
                .ok_or_else(|| anyhow!("google token response carried an out-of-range expires_in: {secs}"))
        })
        .transpose()?;

    Ok(TokenGrant {
        access_token: payload.access_token,
        refresh_token: payload.refresh_token.filter(|token| !token.trim().is_empty()),
        expires_at,
    })
}
