use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

use crate::timeutil::parse_stored_timestamp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmailTxnStatus {
    #[default]
    Pending,
    Processed,
    Ignored,
}

impl Display for EmailTxnStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processed => write!(f, "processed"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

impl FromStr for EmailTxnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "ignored" => Ok(Self::Ignored),
            other => Err(format!("invalid email transaction status: {other}")),
        }
    }
}

/// One authorized mailbox. Tokens are stored encrypted and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GmailConnection {
    pub id: String,
    pub user_id: String,
    pub gmail_email: String,
    pub is_active: bool,
    pub reauth_required: bool,
    #[serde(skip_serializing, default)]
    pub access_token: Option<String>,
    #[serde(skip_serializing, default)]
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GmailConnection {
    pub fn new(user_id: &str, gmail_email: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            gmail_email: gmail_email.to_string(),
            is_active: true,
            reauth_required: false,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            last_sync_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailTransaction {
    pub id: String,
    pub connection_id: String,
    pub external_id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub merchant: Option<String>,
    pub account_number: Option<String>,
    pub transaction_type: Option<String>,
    pub confidence: f64,
    pub status: EmailTxnStatus,
    pub seen: bool,
    pub linked_transaction_id: Option<String>,
    pub category_id: Option<String>,
    pub raw_content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field-wise update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailTransactionUpdate {
    pub status: Option<EmailTxnStatus>,
    pub seen: Option<bool>,
    pub category_id: Option<String>,
    pub linked_transaction_id: Option<String>,
    pub amount: Option<f64>,
    pub merchant: Option<String>,
    pub transaction_type: Option<String>,
}

impl EmailTransactionUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub user_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryAmount {
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub total_amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonthlyAmount {
    pub year: i32,
    pub month: u32,
    pub total_amount: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmailTxnDashboard {
    pub by_category: Vec<CategoryAmount>,
    pub monthly: Vec<MonthlyAmount>,
}

fn conversion_error(column: &str, raw: &str, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{column}: {message}"),
        )),
    )
}

fn required_timestamp(row: &Row<'_>, column: &str) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    parse_stored_timestamp(&raw)
        .ok_or_else(|| conversion_error(column, &raw, format!("invalid timestamp '{raw}'")))
}

fn optional_timestamp(row: &Row<'_>, column: &str) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    match raw.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => parse_stored_timestamp(value)
            .map(Some)
            .ok_or_else(|| conversion_error(column, value, format!("invalid timestamp '{value}'"))),
    }
}

impl GmailConnection {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            gmail_email: row.get("gmail_email")?,
            is_active: row.get("is_active")?,
            reauth_required: row.get("reauth_required")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            expires_at: optional_timestamp(row, "expires_at")?,
            last_sync_at: optional_timestamp(row, "last_sync_at")?,
            created_at: required_timestamp(row, "created_at")?,
            updated_at: required_timestamp(row, "updated_at")?,
        })
    }
}

impl EmailTransaction {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let status_raw: String = row.get("status")?;
        let status = EmailTxnStatus::from_str(&status_raw)
            .map_err(|e| conversion_error("status", &status_raw, e))?;

        Ok(Self {
            id: row.get("id")?,
            connection_id: row.get("connection_id")?,
            external_id: row.get("external_id")?,
            subject: row.get("subject")?,
            sender: row.get("sender")?,
            received_at: required_timestamp(row, "received_at")?,
            amount: row.get("amount")?,
            currency: row.get("currency")?,
            merchant: row.get("merchant")?,
            account_number: row.get("account_number")?,
            transaction_type: row.get("transaction_type")?,
            confidence: row.get("confidence")?,
            status,
            seen: row.get("seen")?,
            linked_transaction_id: row.get("linked_transaction_id")?,
            category_id: row.get("category_id")?,
            raw_content: row.get("raw_content")?,
            created_at: required_timestamp(row, "created_at")?,
            updated_at: required_timestamp(row, "updated_at")?,
        })
    }
}

impl Category {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
        })
    }
}
