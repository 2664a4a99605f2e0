use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::connectors::Email;
use crate::db::models::{EmailTransaction, EmailTxnStatus, GmailConnection};
use crate::db::{DbError, SyncStore};
use crate::extract::{self, ExtractionResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub new: usize,
    /// Already ingested, by lookup or by the storage uniqueness constraint.
    pub skipped: usize,
    /// Lookup or write failures; those emails are picked up by a later run.
    pub failed: usize,
}

pub fn new_transaction(
    connection_id: &str,
    email: &Email,
    extraction: ExtractionResult,
    now: DateTime<Utc>,
) -> EmailTransaction {
    EmailTransaction {
        id: uuid::Uuid::new_v4().to_string(),
        connection_id: connection_id.to_string(),
        external_id: email.external_id.clone(),
        subject: email.subject.clone(),
        sender: email.sender.clone(),
        received_at: email.received_at,
        amount: extraction.amount,
        currency: extraction.currency,
        merchant: extraction.merchant,
        account_number: extraction.account_number,
        transaction_type: extraction.transaction_type,
        confidence: extraction.confidence,
        status: EmailTxnStatus::Pending,
        seen: false,
        linked_transaction_id: None,
        category_id: None,
        raw_content: email.body.clone(),
        created_at: now,
        updated_at: now,
    }
}

/// Persist one pending transaction per email not yet seen for this connection,
/// then stamp the connection's `last_sync_at` once.
pub fn ingest(
    store: &dyn SyncStore,
    connection: &mut GmailConnection,
    emails: &[Email],
    now: DateTime<Utc>,
) -> Result<IngestReport, DbError> {
    let mut report = IngestReport::default();

    for email in emails {
        match store.find_transaction(&connection.id, &email.external_id) {
            Ok(Some(_)) => {
                report.skipped += 1;
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                report.failed += 1;
                warn!(connection_id = %connection.id, external_id = %email.external_id, error = %err, "transaction lookup failed");
                continue;
            }
        }

        let txn = new_transaction(&connection.id, email, extract::extract(email), now);
        match store.save_transaction(&txn) {
            Ok(true) => {
                debug!(connection_id = %connection.id, external_id = %email.external_id, amount = ?txn.amount, "ingested transaction email");
                report.new += 1;
            }
            Ok(false) => report.skipped += 1,
            Err(err) => {
                report.failed += 1;
                warn!(connection_id = %connection.id, external_id = %email.external_id, error = %err, "failed to persist transaction email");
            }
        }
    }

    connection.last_sync_at = Some(now);
    connection.updated_at = now;
    if !store.touch_last_sync(&connection.id, now)? {
        warn!(connection_id = %connection.id, "connection removed during sync; last sync not recorded");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::ingest;
    use crate::connectors::Email;
    use crate::db::models::{EmailTxnStatus, GmailConnection};
    use crate::db::{Database, SyncStore, TransactionFilter};

    fn email(id: &str, subject: &str) -> Email {
        Email {
            external_id: id.to_string(),
            subject: subject.to_string(),
            sender: "VCBDigibank@info.vietcombank.com.vn".to_string(),
            received_at: Utc.with_ymd_and_hms(2026, 3, 2, 1, 0, 0).unwrap(),
            body: format!("raw body for {id}"),
        }
    }

    #[test]
    fn ingest_persists_pending_unseen_records_with_raw_body() {
        let db = Database::open_in_memory().expect("open db");
        let mut connection = GmailConnection::new("user-1", "me@gmail.com");
        db.save_connection(&connection).expect("save connection");
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).unwrap();

        let report = ingest(&db, &mut connection, &[email("a", "150,000 VND")], now).expect("ingest");
        assert_eq!(report.new, 1);

        let stored = db.find_transaction(&connection.id, "a").expect("find").expect("exists");
        assert_eq!(stored.status, EmailTxnStatus::Pending);
        assert!(!stored.seen);
        assert_eq!(stored.raw_content, "raw body for a");
        assert_eq!(stored.amount, Some(150_000.0));
    }

    #[test]
    fn ingesting_twice_is_idempotent() {
        let db = Database::open_in_memory().expect("open db");
        let mut connection = GmailConnection::new("user-1", "me@gmail.com");
        db.save_connection(&connection).expect("save connection");
        let emails = [email("a", "150,000 VND"), email("b", "200,000 VND")];
        let now = Utc::now();

        let first = ingest(&db, &mut connection, &emails, now).expect("first pass");
        let second = ingest(&db, &mut connection, &emails, now).expect("second pass");

        assert_eq!(first.new, 2);
        assert_eq!(second.new, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(
            db.count_transactions(&TransactionFilter::default()).expect("count"),
            2
        );
    }

    #[test]
    fn last_sync_is_stamped_even_for_empty_batches() {
        let db = Database::open_in_memory().expect("open db");
        let mut connection = GmailConnection::new("user-1", "me@gmail.com");
        db.save_connection(&connection).expect("save connection");
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).unwrap();

        let report = ingest(&db, &mut connection, &[], now).expect("ingest");
        assert_eq!(report.new, 0);

        let stored = db.get_connection(&connection.id).expect("get").expect("exists");
        assert_eq!(stored.last_sync_at, Some(now));
    }

    #[test]
    fn stale_copy_does_not_undo_disable_or_delete() {
        let db = Database::open_in_memory().expect("open db");
        let mut disabled = GmailConnection::new("user-1", "one@gmail.com");
        let mut removed = GmailConnection::new("user-1", "two@gmail.com");
        db.save_connection(&disabled).expect("save connection");
        db.save_connection(&removed).expect("save connection");
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).unwrap();

        db.set_connection_active(&disabled.id, false).expect("disable");
        db.flag_reauth_required(&disabled.id).expect("flag");
        db.delete_connection(&removed.id).expect("delete");

        ingest(&db, &mut disabled, &[], now).expect("ingest disabled");
        ingest(&db, &mut removed, &[], now).expect("ingest removed");

        let stored = db.get_connection(&disabled.id).expect("get").expect("exists");
        assert!(!stored.is_active);
        assert!(stored.reauth_required);
        assert_eq!(stored.last_sync_at, Some(now));
        assert!(db.get_connection(&removed.id).expect("get").is_none());
    }
}
