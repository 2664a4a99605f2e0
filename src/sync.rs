use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{SchedulerSettings, Settings};
use crate::connectors::query::{build_query, month_bounds, InvalidWindow, QueryWindow, DEFAULT_SENDER_FILTERS};
use crate::connectors::{search_emails, MailboxApi, OAuthProvider};
use crate::crypto::{CryptoError, TokenCipher};
use crate::db::models::GmailConnection;
use crate::db::{DbError, SyncStore};
use crate::ingest::ingest;
use crate::tokens::TokenManager;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("connection {0} not found")]
    ConnectionNotFound(String),

    #[error("connection {0} is inactive")]
    ConnectionInactive(String),

    #[error("connection {connection_id} needs re-authorization: {reason}")]
    ReauthRequired {
        connection_id: String,
        reason: String,
    },

    #[error("token refresh failed for connection {connection_id}: {message}")]
    RefreshFailed {
        connection_id: String,
        message: String,
    },

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("mailbox search failed: {0}")]
    Mailbox(String),

    #[error(transparent)]
    InvalidWindow(#[from] InvalidWindow),

    #[error("token encryption: {0}")]
    Crypto(#[from] CryptoError),

    #[error("store: {0}")]
    Store(#[from] DbError),

    #[error("sync for connection {connection_id} aborted: {message}")]
    Aborted {
        connection_id: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub fetched: usize,
    pub new: usize,
    pub skipped: usize,
    /// Messages that could not be fetched or persisted this run.
    pub failed: usize,
}

impl SyncOutcome {
    pub fn message(&self) -> String {
        format!("Successfully synced {} emails", self.new)
    }
}

/// How each connection's window is chosen in a multi-connection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Time since the connection's last sync, capped.
    Incremental,
    Fixed(QueryWindow),
}

/// Per-connection results, keyed by connection id.
pub type SyncReport = BTreeMap<String, Result<SyncOutcome, SyncError>>;

pub fn total_new(report: &SyncReport) -> usize {
    report
        .values()
        .filter_map(|result| result.as_ref().ok())
        .map(|outcome| outcome.new)
        .sum()
}

#[derive(Clone)]
pub struct SyncService {
    store: Arc<dyn SyncStore>,
    oauth: Arc<dyn OAuthProvider>,
    mailbox: Arc<dyn MailboxApi>,
    cipher: TokenCipher,
    scheduler: SchedulerSettings,
    max_results: usize,
    backfill_days: i64,
    backfill_max_results: usize,
    senders: Vec<String>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        oauth: Arc<dyn OAuthProvider>,
        mailbox: Arc<dyn MailboxApi>,
        cipher: TokenCipher,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            oauth,
            mailbox,
            cipher,
            scheduler: settings.scheduler.clone(),
            max_results: settings.max_results,
            backfill_days: settings.backfill_days,
            backfill_max_results: settings.backfill_max_results,
            senders: DEFAULT_SENDER_FILTERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_senders(mut self, senders: Vec<String>) -> Self {
        self.senders = senders;
        self
    }

    pub fn scheduler_settings(&self) -> &SchedulerSettings {
        &self.scheduler
    }

    pub fn authorization_url(&self, state: Option<&str>) -> Result<String, SyncError> {
        self.oauth
            .authorization_url(state)
            .map_err(|err| SyncError::Authorization(format!("{err:#}")))
    }

    /// Complete the consent flow for `user_id`, creating or re-activating the
    /// connection for the authorized mailbox.
    pub async fn connect(&self, user_id: &str, code: &str) -> Result<GmailConnection, SyncError> {
        let grant = self
            .oauth
            .exchange_code(code)
            .await
            .map_err(|err| SyncError::Authorization(format!("{err:#}")))?;
        let refresh_token = grant.refresh_token.as_deref().ok_or_else(|| {
            SyncError::Authorization(
                "no refresh token returned; reconnect and grant offline access".to_string(),
            )
        })?;

        let gmail_email = self
            .mailbox
            .profile_email(&grant.access_token)
            .await
            .map_err(|err| SyncError::Mailbox(format!("{err:#}")))?;

        let now = Utc::now();
        let mut connection = match self.store.find_connection_by_email(user_id, &gmail_email)? {
            Some(existing) => existing,
            None => GmailConnection::new(user_id, &gmail_email),
        };
        connection.access_token = Some(self.cipher.encrypt(&grant.access_token)?);
        connection.refresh_token = Some(self.cipher.encrypt(refresh_token)?);
        connection.expires_at = grant.expires_at;
        connection.is_active = true;
        connection.reauth_required = false;
        connection.last_sync_at = Some(now);
        connection.updated_at = now;
        self.store.save_connection(&connection)?;

        info!(connection_id = %connection.id, gmail_email = %connection.gmail_email, "gmail connection authorized");
        Ok(connection)
    }

    /// Backfill the configured lookback with the configured message cap.
    pub async fn sync_now(&self, connection_id: &str) -> Result<SyncOutcome, SyncError> {
        self.backfill(connection_id, None, None).await
    }

    /// Backfill `days` (default: configured) fetching at most `max_results`
    /// messages (default: configured).
    pub async fn backfill(
        &self,
        connection_id: &str,
        days: Option<i64>,
        max_results: Option<usize>,
    ) -> Result<SyncOutcome, SyncError> {
        let window = QueryWindow::days(days.unwrap_or(self.backfill_days))?;
        let max_results = max_results.unwrap_or(self.backfill_max_results);
        if max_results == 0 {
            return Err(SyncError::InvalidWindow(InvalidWindow(
                "max results must be positive".to_string(),
            )));
        }
        self.sync_connection_capped(connection_id, window, max_results)
            .await
    }

    pub async fn sync_month(
        &self,
        connection_id: &str,
        year: i32,
        month: u32,
    ) -> Result<SyncOutcome, SyncError> {
        month_bounds(year, month)?;
        self.sync_connection(connection_id, QueryWindow::Month { year, month })
            .await
    }

    /// Last 24 hours.
    pub async fn auto_sync(&self, connection_id: &str) -> Result<SyncOutcome, SyncError> {
        self.sync_connection(connection_id, QueryWindow::hours(24)?).await
    }

    pub async fn sync_connection(
        &self,
        connection_id: &str,
        window: QueryWindow,
    ) -> Result<SyncOutcome, SyncError> {
        self.sync_connection_capped(connection_id, window, self.max_results)
            .await
    }

    async fn sync_connection_capped(
        &self,
        connection_id: &str,
        window: QueryWindow,
        max_results: usize,
    ) -> Result<SyncOutcome, SyncError> {
        let connection = self
            .store
            .get_connection(connection_id)?
            .ok_or_else(|| SyncError::ConnectionNotFound(connection_id.to_string()))?;
        if !connection.is_active {
            return Err(SyncError::ConnectionInactive(connection_id.to_string()));
        }
        self.run_isolated(connection, window, max_results).await
    }

    /// Sync every active connection in isolation. Only a failure to list
    /// connections is returned as an error.
    pub async fn sync_all_active(&self, policy: WindowPolicy) -> Result<SyncReport, SyncError> {
        let connections = self.store.list_active_connections()?;
        let mut report = SyncReport::new();

        for connection in connections {
            let connection_id = connection.id.clone();
            let result = match self.window_for(policy, &connection) {
                Ok(window) => self.run_isolated(connection, window, self.max_results).await,
                Err(err) => Err(err),
            };
            if let Err(err) = &result {
                error!(connection_id = %connection_id, error = %err, "connection sync failed");
            }
            report.insert(connection_id, result);
        }

        Ok(report)
    }

    fn window_for(
        &self,
        policy: WindowPolicy,
        connection: &GmailConnection,
    ) -> Result<QueryWindow, SyncError> {
        match policy {
            WindowPolicy::Fixed(window) => Ok(window),
            WindowPolicy::Incremental => {
                let hours = self.scheduler.incremental_max_lookback_hours;
                let days = self.scheduler.first_sync_days;
                let max_lookback = Duration::try_hours(hours)
                    .ok_or_else(|| InvalidWindow(format!("lookback of {hours} hours is out of range")))?;
                let first_sync = Duration::try_days(days)
                    .ok_or_else(|| InvalidWindow(format!("lookback of {days} days is out of range")))?;
                Ok(QueryWindow::incremental(
                    connection.last_sync_at,
                    Utc::now(),
                    max_lookback,
                    first_sync,
                ))
            }
        }
    }

    /// Run one connection on its own task so a panic surfaces as that
    /// connection's error.
    async fn run_isolated(
        &self,
        connection: GmailConnection,
        window: QueryWindow,
        max_results: usize,
    ) -> Result<SyncOutcome, SyncError> {
        let connection_id = connection.id.clone();
        let service = self.clone();
        let task = tokio::spawn(async move {
            service.run_connection(connection, window, max_results).await
        });
        match task.await {
            Ok(result) => result,
            Err(err) => Err(SyncError::Aborted {
                connection_id,
                message: panic_message(err),
            }),
        }
    }

    async fn run_connection(
        &self,
        mut connection: GmailConnection,
        window: QueryWindow,
        max_results: usize,
    ) -> Result<SyncOutcome, SyncError> {
        let result = self
            .run_connection_steps(&mut connection, window, max_results)
            .await;
        if let Err(SyncError::ReauthRequired { .. }) = &result {
            if let Err(err) = self.store.flag_reauth_required(&connection.id) {
                warn!(connection_id = %connection.id, error = %err, "could not flag connection for re-authorization");
            }
        }
        result
    }

    async fn run_connection_steps(
        &self,
        connection: &mut GmailConnection,
        window: QueryWindow,
        max_results: usize,
    ) -> Result<SyncOutcome, SyncError> {
        if !connection.has_refresh_token() {
            return Err(SyncError::ReauthRequired {
                connection_id: connection.id.clone(),
                reason: "no refresh token stored".to_string(),
            });
        }

        let tokens = TokenManager::new(self.store.as_ref(), self.oauth.as_ref(), &self.cipher);
        let access_token = tokens
            .ensure_valid_access_token(connection, Utc::now())
            .await?;

        let senders: Vec<&str> = self.senders.iter().map(String::as_str).collect();
        let query = build_query(&senders, &window, Utc::now())?;

        let search = search_emails(self.mailbox.as_ref(), &access_token, &query, max_results)
            .await
            .map_err(|err| SyncError::Mailbox(format!("{err:#}")))?;

        let report = ingest(self.store.as_ref(), connection, &search.emails, Utc::now())?;
        let outcome = SyncOutcome {
            fetched: search.emails.len(),
            new: report.new,
            skipped: report.skipped,
            failed: report.failed + search.failed_fetches,
        };

        info!(
            connection_id = %connection.id,
            fetched = outcome.fetched,
            new = outcome.new,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "connection sync finished"
        );
        Ok(outcome)
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|msg| msg.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panicked".to_string()),
        Err(err) => err.to_string(),
    }
}
