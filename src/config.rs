use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

use crate::connectors::query::MAX_WINDOW_DAYS;

pub const ENV_PREFIX: &str = "TXMAIL_";

const DEFAULT_GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:8000/api/v1/gmail/callback";

/// Longest accepted job period, in hours.
const MAX_INTERVAL_HOURS: u64 = 24 * 366;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub auth_url: String,
    pub token_url: String,
    pub gmail_api_base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub incremental_interval_minutes: u64,
    pub full_interval_hours: u64,
    /// Upper bound on the incremental window, whatever the time since last sync.
    pub incremental_max_lookback_hours: i64,
    pub first_sync_days: i64,
    pub full_lookback_days: i64,
    /// A tick later than this is skipped rather than run.
    pub incremental_misfire_grace_secs: u64,
    pub full_misfire_grace_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            incremental_interval_minutes: 30,
            full_interval_hours: 24,
            incremental_max_lookback_hours: 24,
            first_sync_days: 1,
            full_lookback_days: 7,
            incremental_misfire_grace_secs: 300,
            full_misfire_grace_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub google: GoogleSettings,
    /// Hex-encoded AES-256-GCM key for tokens at rest.
    pub token_key_hex: Option<String>,
    pub db_path: Option<PathBuf>,
    pub scheduler: SchedulerSettings,
    /// Per-run message cap for scheduled and month syncs.
    pub max_results: usize,
    /// Lookback and message cap of an on-demand backfill.
    pub backfill_days: i64,
    pub backfill_max_results: usize,
    pub http_timeout_secs: u64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through `lookup`, which receives fully prefixed keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let defaults = SchedulerSettings::default();
        let scheduler = SchedulerSettings {
            incremental_interval_minutes: parse_or(
                &get,
                "INCREMENTAL_INTERVAL_MINUTES",
                defaults.incremental_interval_minutes,
            )?,
            full_interval_hours: parse_or(&get, "FULL_INTERVAL_HOURS", defaults.full_interval_hours)?,
            incremental_max_lookback_hours: parse_or(
                &get,
                "INCREMENTAL_MAX_LOOKBACK_HOURS",
                defaults.incremental_max_lookback_hours,
            )?,
            first_sync_days: parse_or(&get, "FIRST_SYNC_DAYS", defaults.first_sync_days)?,
            full_lookback_days: parse_or(&get, "FULL_LOOKBACK_DAYS", defaults.full_lookback_days)?,
            incremental_misfire_grace_secs: parse_or(
                &get,
                "INCREMENTAL_MISFIRE_GRACE_SECS",
                defaults.incremental_misfire_grace_secs,
            )?,
            full_misfire_grace_secs: parse_or(
                &get,
                "FULL_MISFIRE_GRACE_SECS",
                defaults.full_misfire_grace_secs,
            )?,
        };

        let max_interval_minutes = MAX_INTERVAL_HOURS * 60;
        if !(1..=max_interval_minutes).contains(&scheduler.incremental_interval_minutes)
            || !(1..=MAX_INTERVAL_HOURS).contains(&scheduler.full_interval_hours)
        {
            return Err(anyhow!(
                "scheduler intervals must be between 1 minute and {MAX_INTERVAL_HOURS} hours"
            ));
        }
        let max_grace_secs = MAX_INTERVAL_HOURS * 3_600;
        if scheduler.incremental_misfire_grace_secs > max_grace_secs
            || scheduler.full_misfire_grace_secs > max_grace_secs
        {
            return Err(anyhow!(
                "misfire grace must not exceed {max_grace_secs} seconds"
            ));
        }

        let backfill_days = parse_or(&get, "BACKFILL_DAYS", 180i64)?;
        let max_lookback_hours = MAX_WINDOW_DAYS * 24;
        if !(1..=max_lookback_hours).contains(&scheduler.incremental_max_lookback_hours)
            || !(1..=MAX_WINDOW_DAYS).contains(&scheduler.first_sync_days)
            || !(1..=MAX_WINDOW_DAYS).contains(&scheduler.full_lookback_days)
            || !(1..=MAX_WINDOW_DAYS).contains(&backfill_days)
        {
            return Err(anyhow!(
                "lookback windows must be between 1 and {MAX_WINDOW_DAYS} days"
            ));
        }

        Ok(Self {
            google: GoogleSettings {
                client_id: get("GOOGLE_CLIENT_ID").unwrap_or_default(),
                client_secret: get("GOOGLE_CLIENT_SECRET").unwrap_or_default(),
                redirect_uri: get("GOOGLE_REDIRECT_URI")
                    .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
                auth_url: get("GOOGLE_AUTH_URL")
                    .unwrap_or_else(|| DEFAULT_GOOGLE_AUTH_URL.to_string()),
                token_url: get("GOOGLE_TOKEN_URL")
                    .unwrap_or_else(|| DEFAULT_GOOGLE_TOKEN_URL.to_string()),
                gmail_api_base: get("GMAIL_API_BASE")
                    .unwrap_or_else(|| DEFAULT_GMAIL_API_BASE.to_string()),
            },
            token_key_hex: get("TOKEN_KEY"),
            db_path: get("DB_PATH").map(PathBuf::from),
            scheduler,
            max_results: parse_or(&get, "MAX_RESULTS", 500usize)?,
            backfill_days,
            backfill_max_results: parse_or(&get, "BACKFILL_MAX_RESULTS", 1_000usize)?,
            http_timeout_secs: parse_or(&get, "HTTP_TIMEOUT_SECS", 30u64)?,
        })
    }

    pub fn require_google_client(&self) -> Result<()> {
        if self.google.client_id.is_empty() {
            return Err(anyhow!("missing google client id ({ENV_PREFIX}GOOGLE_CLIENT_ID)"));
        }
        if self.google.client_secret.is_empty() {
            return Err(anyhow!(
                "missing google client secret ({ENV_PREFIX}GOOGLE_CLIENT_SECRET)"
            ));
        }
        Ok(())
    }

    pub fn require_token_key(&self) -> Result<&str> {
        self.token_key_hex
            .as_deref()
            .ok_or_else(|| anyhow!("missing token encryption key ({ENV_PREFIX}TOKEN_KEY)"))
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {ENV_PREFIX}{name}: '{raw}'")),
    }
}
