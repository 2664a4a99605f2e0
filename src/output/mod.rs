pub mod json;
pub mod table;

use anyhow::Result;

use crate::db::models::{Category, EmailTransaction, EmailTxnDashboard, GmailConnection};
use crate::ledger::LedgerDraft;
use crate::scheduler::SchedulerStatus;
use crate::sync::SyncReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_connections(format: OutputFormat, connections: &[GmailConnection]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_connections(connections)),
        OutputFormat::Json => json::to_pretty(connections),
    }
}

pub fn format_connection(format: OutputFormat, connection: &GmailConnection) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_connection(connection)),
        OutputFormat::Json => json::to_pretty(connection),
    }
}

pub fn format_transactions(format: OutputFormat, transactions: &[EmailTransaction]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_transactions(transactions)),
        OutputFormat::Json => json::to_pretty(transactions),
    }
}

pub fn format_transaction(format: OutputFormat, transaction: &EmailTransaction) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_transaction(transaction)),
        OutputFormat::Json => json::to_pretty(transaction),
    }
}

pub fn format_categories(format: OutputFormat, categories: &[Category]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_categories(categories)),
        OutputFormat::Json => json::to_pretty(categories),
    }
}

pub fn format_dashboard(format: OutputFormat, dashboard: &EmailTxnDashboard) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_dashboard(dashboard)),
        OutputFormat::Json => json::to_pretty(dashboard),
    }
}

pub fn format_sync_report(format: OutputFormat, report: &SyncReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_sync_report(report)),
        OutputFormat::Json => json::format_sync_report(report),
    }
}

pub fn format_scheduler_status(format: OutputFormat, status: &SchedulerStatus) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_scheduler_status(status)),
        OutputFormat::Json => json::to_pretty(status),
    }
}

pub fn format_ledger_draft(format: OutputFormat, draft: &LedgerDraft) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_ledger_draft(draft)),
        OutputFormat::Json => json::to_pretty(draft),
    }
}
