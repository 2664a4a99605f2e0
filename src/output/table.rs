use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::models::{Category, EmailTransaction, EmailTxnDashboard, GmailConnection};
use crate::ledger::{LedgerDraft, LedgerKind};
use crate::scheduler::{SchedulerState, SchedulerStatus};
use crate::sync::SyncReport;

const ID_WIDTH: usize = 36;
const MERCHANT_WIDTH: usize = 20;
const SUBJECT_WIDTH: usize = 44;
const AMOUNT_WIDTH: usize = 16;
const TYPE_WIDTH: usize = 6;
const STATUS_WIDTH: usize = 9;
const DATE_WIDTH: usize = 12;

pub fn format_connections(connections: &[GmailConnection]) -> String {
    if connections.is_empty() {
        return "No Gmail connections.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<28}  {:<8}  {:<12}\n",
        "ID",
        "Mailbox",
        "State",
        "Last Sync",
        id = ID_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(28),
        "-".repeat(8),
        "-".repeat(12)
    ));

    for connection in connections {
        let last_sync = connection
            .last_sync_at
            .as_ref()
            .map(relative_date)
            .unwrap_or_else(|| "never".to_string());
        out.push_str(&format!(
            "{:<id$}  {:<28}  {:<8}  {:<12}\n",
            connection.id,
            truncate_for_width(&connection.gmail_email, 28),
            connection_state(connection),
            truncate_for_width(&last_sync, 12),
            id = ID_WIDTH
        ));
    }

    out
}

pub fn format_connection(connection: &GmailConnection) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", connection.id));
    out.push_str(&format!("User: {}\n", connection.user_id));
    out.push_str(&format!("Mailbox: {}\n", connection.gmail_email));
    out.push_str(&format!("State: {}\n", connection_state(connection)));
    out.push_str(&format!(
        "Token Expires: {}\n",
        connection
            .expires_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    ));
    out.push_str(&format!(
        "Last Sync: {}\n",
        connection
            .last_sync_at
            .map(|at| format!("{} ({})", at.to_rfc3339(), relative_date(&at)))
            .unwrap_or_else(|| "never".to_string())
    ));
    out.push_str(&format!("Created: {}\n", connection.created_at.to_rfc3339()));
    out
}

pub fn format_transactions(transactions: &[EmailTransaction]) -> String {
    if transactions.is_empty() {
        return "No email transactions found.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<date$}  {:<merchant$}  {:>amount$}  {:<kind$}  {:<status$}  {:<subject$}\n",
        "ID",
        "Received",
        "Merchant",
        "Amount",
        "Type",
        "Status",
        "Subject",
        id = ID_WIDTH,
        date = DATE_WIDTH,
        merchant = MERCHANT_WIDTH,
        amount = AMOUNT_WIDTH,
        kind = TYPE_WIDTH,
        status = STATUS_WIDTH,
        subject = SUBJECT_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(DATE_WIDTH),
        "-".repeat(MERCHANT_WIDTH),
        "-".repeat(AMOUNT_WIDTH),
        "-".repeat(TYPE_WIDTH),
        "-".repeat(STATUS_WIDTH),
        "-".repeat(SUBJECT_WIDTH)
    ));

    for txn in transactions {
        let marker = if txn.seen { "" } else { "*" };
        out.push_str(&format!(
            "{:<id$}  {:<date$}  {:<merchant$}  {:>amount$}  {:<kind$}  {:<status$}  {:<subject$}\n",
            txn.id,
            truncate_for_width(&relative_date(&txn.received_at), DATE_WIDTH),
            truncate_for_width(txn.merchant.as_deref().unwrap_or("-"), MERCHANT_WIDTH),
            truncate_for_width(&format_amount(txn), AMOUNT_WIDTH),
            truncate_for_width(txn.transaction_type.as_deref().unwrap_or("-"), TYPE_WIDTH),
            format!("{}{marker}", txn.status),
            truncate_for_width(&txn.subject, SUBJECT_WIDTH),
            id = ID_WIDTH,
            date = DATE_WIDTH,
            merchant = MERCHANT_WIDTH,
            amount = AMOUNT_WIDTH,
            kind = TYPE_WIDTH,
            status = STATUS_WIDTH,
            subject = SUBJECT_WIDTH
        ));
    }

    out
}

pub fn format_transaction(txn: &EmailTransaction) -> String {
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", txn.id));
    out.push_str(&format!("Connection: {}\n", txn.connection_id));
    out.push_str(&format!("Message: {}\n", txn.external_id));
    out.push_str(&format!("Subject: {}\n", txn.subject));
    out.push_str(&format!("From: {}\n", txn.sender));
    out.push_str(&format!(
        "Received: {} ({})\n",
        txn.received_at.to_rfc3339(),
        relative_date(&txn.received_at)
    ));
    out.push_str(&format!("Amount: {}\n", format_amount(txn)));
    out.push_str(&format!(
        "Merchant: {}\n",
        txn.merchant.as_deref().unwrap_or("(unknown)")
    ));
    out.push_str(&format!(
        "Type: {}\n",
        txn.transaction_type.as_deref().unwrap_or("(unknown)")
    ));
    if let Some(account) = &txn.account_number {
        out.push_str(&format!("Account: {account}\n"));
    }
    out.push_str(&format!("Confidence: {:.2}\n", txn.confidence));
    out.push_str(&format!("Status: {}\n", txn.status));
    out.push_str(&format!("Seen: {}\n", if txn.seen { "yes" } else { "no" }));
    if let Some(category_id) = &txn.category_id {
        out.push_str(&format!("Category: {category_id}\n"));
    }
    if let Some(linked) = &txn.linked_transaction_id {
        out.push_str(&format!("Linked Transaction: {linked}\n"));
    }

    out.push('\n');
    out.push_str("Body\n");
    out.push_str("----\n");
    out.push_str(if txn.raw_content.is_empty() {
        "(empty)"
    } else {
        &txn.raw_content
    });
    out.push('\n');
    out
}

pub fn format_categories(categories: &[Category]) -> String {
    if categories.is_empty() {
        return "No categories.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!("{:<id$}  Name\n", "ID", id = ID_WIDTH));
    out.push_str(&format!("{}  {}\n", "-".repeat(ID_WIDTH), "-".repeat(24)));
    for category in categories {
        out.push_str(&format!(
            "{:<id$}  {}\n",
            category.id,
            truncate_for_width(&category.name, 24),
            id = ID_WIDTH
        ));
    }
    out
}

pub fn format_dashboard(dashboard: &EmailTxnDashboard) -> String {
    let mut out = String::new();
    out.push_str("Email Transactions\n");
    out.push_str("==================\n");

    if dashboard.by_category.is_empty() && dashboard.monthly.is_empty() {
        out.push_str("No amounts recorded.\n");
        return out;
    }

    out.push('\n');
    out.push_str("By category\n");
    out.push_str("-----------\n");
    for row in &dashboard.by_category {
        let label = row
            .category_name
            .as_deref()
            .or(row.category_id.as_deref())
            .unwrap_or("(uncategorized)");
        out.push_str(&format!(
            "{:<24} {:>16.0}\n",
            truncate_for_width(label, 24),
            row.total_amount
        ));
    }

    out.push('\n');
    out.push_str("By month\n");
    out.push_str("--------\n");
    for row in &dashboard.monthly {
        out.push_str(&format!(
            "{:04}-{:02}{:>35.0}\n",
            row.year, row.month, row.total_amount
        ));
    }

    out
}

pub fn format_sync_report(report: &SyncReport) -> String {
    if report.is_empty() {
        return "No active connections to sync.".to_string();
    }

    let mut out = String::new();
    for (connection_id, result) in report {
        match result {
            Ok(outcome) => out.push_str(&format!(
                "sync {connection_id}: {} (fetched={} skipped={} failed={})\n",
                outcome.message(),
                outcome.fetched,
                outcome.skipped,
                outcome.failed
            )),
            Err(err) => out.push_str(&format!("sync {connection_id}: error: {err}\n")),
        }
    }
    out
}

pub fn format_scheduler_status(status: &SchedulerStatus) -> String {
    let state = match status.status {
        SchedulerState::Running => "running",
        SchedulerState::Stopped => "stopped",
    };

    let mut out = format!("Scheduler: {state}\n");
    for job in &status.jobs {
        out.push_str(&format!(
            "- {} ({}): {}, next run {}\n",
            job.name,
            job.id,
            job.trigger,
            job.next_run
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        ));
    }
    out
}

pub fn format_ledger_draft(draft: &LedgerDraft) -> String {
    let kind = match draft.kind {
        LedgerKind::Expense => "expense",
        LedgerKind::Income => "income",
    };

    let mut out = String::new();
    out.push_str(&format!("Email Transaction: {}\n", draft.email_transaction_id));
    out.push_str(&format!("Kind: {kind}\n"));
    out.push_str(&format!("Date: {}\n", draft.date));
    out.push_str(&format!("Amount: {:.0} {}\n", draft.amount, draft.currency));
    out.push_str(&format!(
        "Merchant: {}\n",
        draft.merchant.as_deref().unwrap_or("(unknown)")
    ));
    if let Some(category_id) = &draft.category_id {
        out.push_str(&format!("Category: {category_id}\n"));
    }
    out.push_str(&format!("Note: {}\n", draft.note));
    out
}

fn connection_state(connection: &GmailConnection) -> &'static str {
    if connection.reauth_required {
        "reauth"
    } else if connection.is_active {
        "active"
    } else {
        "disabled"
    }
}

fn format_amount(txn: &EmailTransaction) -> String {
    match (txn.amount, txn.currency.as_deref()) {
        (Some(amount), Some("USD")) => format!("{amount:.2} USD"),
        (Some(amount), Some(currency)) => format!("{amount:.0} {currency}"),
        (Some(amount), None) => format!("{amount:.0}"),
        (None, _) => "-".to_string(),
    }
}

fn relative_date(parsed: &DateTime<Utc>) -> String {
    let now = Utc::now();
    let delta = now.signed_duration_since(*parsed);
    if delta.num_seconds() < 0 {
        return "in future".to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    parsed.format("%Y-%m-%d").to_string()
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}
