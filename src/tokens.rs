use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::connectors::OAuthProvider;
use crate::crypto::TokenCipher;
use crate::db::models::GmailConnection;
use crate::db::SyncStore;
use crate::sync::SyncError;

/// Lifetime assumed when the provider omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECONDS: i64 = 3_540;

pub struct TokenManager<'a> {
    store: &'a dyn SyncStore,
    oauth: &'a dyn OAuthProvider,
    cipher: &'a TokenCipher,
}

impl<'a> TokenManager<'a> {
    pub fn new(store: &'a dyn SyncStore, oauth: &'a dyn OAuthProvider, cipher: &'a TokenCipher) -> Self {
        Self {
            store,
            oauth,
            cipher,
        }
    }

    /// Return a usable access token, refreshing it when expired.
    ///
    /// A still-valid token costs no writes; a refresh costs exactly one. The
    /// refresh token itself is never replaced here.
    pub async fn ensure_valid_access_token(
        &self,
        connection: &mut GmailConnection,
        now: DateTime<Utc>,
    ) -> Result<String, SyncError> {
        if let Some(token) = self.cached_token(connection, now) {
            debug!(connection_id = %connection.id, "access token still valid");
            return Ok(token);
        }

        let refresh_token = self
            .cipher
            .decrypt_opt(connection.refresh_token.as_deref())
            .ok_or_else(|| SyncError::ReauthRequired {
                connection_id: connection.id.clone(),
                reason: "refresh token missing or unreadable".to_string(),
            })?;

        let grant = self
            .oauth
            .refresh(&refresh_token)
            .await
            .map_err(|err| SyncError::RefreshFailed {
                connection_id: connection.id.clone(),
                message: format!("{err:#}"),
            })?;

        let sealed = self.cipher.encrypt(&grant.access_token)?;
        let expires_at = grant
            .expires_at
            .unwrap_or_else(|| now + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECONDS));
        if !self
            .store
            .update_access_token(&connection.id, &sealed, expires_at, now)?
        {
            return Err(SyncError::ConnectionNotFound(connection.id.clone()));
        }
        connection.access_token = Some(sealed);
        connection.expires_at = Some(expires_at);
        connection.last_sync_at = Some(now);
        connection.updated_at = now;

        info!(connection_id = %connection.id, "refreshed access token");
        Ok(grant.access_token)
    }

    fn cached_token(&self, connection: &GmailConnection, now: DateTime<Utc>) -> Option<String> {
        let expires_at = connection.expires_at?;
        if expires_at <= now {
            return None;
        }
        self.cipher.decrypt_opt(connection.access_token.as_deref())
    }
}
