use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::db::models::{EmailTransaction, EmailTransactionUpdate, EmailTxnStatus};

pub const LEDGER_CURRENCY: &str = "VND";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("email transaction {0} has no amount")]
    MissingAmount(String),

    #[error("email transaction {0} has a zero or negative amount")]
    NonPositiveAmount(String),

    #[error("email transaction {0} has no transaction type")]
    MissingType(String),

    #[error("cannot map transaction type '{0}' to income or expense")]
    UnknownType(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Expense,
    Income,
}

impl LedgerKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "debit" | "withdrawal" | "expense" => Some(Self::Expense),
            "credit" | "deposit" | "income" => Some(Self::Income),
            _ => None,
        }
    }
}

/// A ledger entry ready to be created by the finance side from a reviewed email.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LedgerDraft {
    pub email_transaction_id: String,
    pub kind: LedgerKind,
    /// Calendar date of receipt, UTC.
    pub date: NaiveDate,
    pub amount: f64,
    pub currency: String,
    pub merchant: Option<String>,
    pub note: String,
    pub category_id: Option<String>,
}

pub fn draft_from_email(
    txn: &EmailTransaction,
    note: Option<&str>,
    category_id: Option<&str>,
) -> Result<LedgerDraft, LedgerError> {
    let amount = txn
        .amount
        .ok_or_else(|| LedgerError::MissingAmount(txn.id.clone()))?;
    if !(amount.is_finite() && amount > 0.0) {
        return Err(LedgerError::NonPositiveAmount(txn.id.clone()));
    }
    let tag = txn
        .transaction_type
        .as_deref()
        .ok_or_else(|| LedgerError::MissingType(txn.id.clone()))?;
    let kind = LedgerKind::from_tag(tag).ok_or_else(|| LedgerError::UnknownType(tag.to_string()))?;

    let note = note
        .map(str::trim)
        .filter(|note| !note.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Created from email: {}", txn.subject));

    Ok(LedgerDraft {
        email_transaction_id: txn.id.clone(),
        kind,
        date: txn.received_at.date_naive(),
        amount,
        currency: LEDGER_CURRENCY.to_string(),
        merchant: txn.merchant.clone(),
        note,
        category_id: category_id
            .map(str::to_string)
            .or_else(|| txn.category_id.clone()),
    })
}

/// Update recording that a ledger entry was created for an email transaction.
pub fn link_update(ledger_transaction_id: &str, category_id: Option<&str>) -> EmailTransactionUpdate {
    EmailTransactionUpdate {
        status: Some(EmailTxnStatus::Processed),
        linked_transaction_id: Some(ledger_transaction_id.to_string()),
        category_id: category_id.map(str::to_string),
        ..EmailTransactionUpdate::default()
    }
}
