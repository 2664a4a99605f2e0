use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use txmail::config::Settings;
use txmail::connectors::{Email, MailboxApi, OAuthProvider, TokenGrant};
use txmail::crypto::TokenCipher;
use txmail::db::models::{EmailTxnStatus, GmailConnection};
use txmail::db::{Database, SyncStore, TransactionFilter};
use txmail::sync::{SyncError, SyncService, WindowPolicy};
use uuid::Uuid;

const KEY_HEX: &str = "4f3c2a1b0e9d8c7b6a5f4e3d2c1b0a99887766554433221100ffeeddccbbaa99";
const MAILBOX: &str = "owner@gmail.com";

fn temp_db() -> Arc<Database> {
    let root: PathBuf = std::env::temp_dir().join(format!("txmail-sync-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp test root");
    Arc::new(Database::open(&root.join("txmail.db")).expect("open db"))
}

struct FakeOAuth {
    refreshes: AtomicUsize,
}

impl FakeOAuth {
    fn new() -> Self {
        Self {
            refreshes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OAuthProvider for FakeOAuth {
    fn authorization_url(&self, state: Option<&str>) -> Result<String> {
        Ok(format!(
            "https://accounts.example.test/auth?state={}",
            state.unwrap_or_default()
        ))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        match code {
            "no-refresh" => Ok(TokenGrant {
                access_token: "access-0".to_string(),
                refresh_token: None,
                expires_at: Some(Utc::now() + Duration::hours(1)),
            }),
            "denied" => Err(anyhow!("invalid_grant")),
            _ => Ok(TokenGrant {
                access_token: format!("access-{code}"),
                refresh_token: Some(format!("refresh-{code}")),
                expires_at: Some(Utc::now() + Duration::hours(1)),
            }),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenGrant {
            access_token: format!("refreshed-{n}-{refresh_token}"),
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::hours(1)),
        })
    }
}

type ListHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct FakeMailbox {
    messages: Vec<Email>,
    broken: Vec<String>,
    queries: Mutex<Vec<String>>,
    panic_token: Option<String>,
    during_list: Mutex<Option<ListHook>>,
}

impl FakeMailbox {
    fn with_messages(messages: Vec<Email>, broken: &[&str]) -> Self {
        Self {
            messages,
            broken: broken.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    fn run_during_list(&self, hook: impl FnOnce() + Send + 'static) {
        *self.during_list.lock().expect("lock") = Some(Box::new(hook));
    }

    fn queries(&self) -> Vec<String> {
        self.queries.lock().expect("lock").clone()
    }
}

#[async_trait]
impl MailboxApi for FakeMailbox {
    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<String>> {
        if self.panic_token.as_deref() == Some(access_token) {
            panic!("mailbox client bug");
        }
        self.queries.lock().expect("lock").push(query.to_string());
        let hook = self.during_list.lock().expect("lock").take();
        if let Some(hook) = hook {
            hook();
        }
        let mut ids: Vec<String> = self
            .messages
            .iter()
            .map(|m| m.external_id.clone())
            .chain(self.broken.iter().cloned())
            .collect();
        ids.sort();
        ids.truncate(max_results);
        Ok(ids)
    }

    async fn get_message(&self, _access_token: &str, message_id: &str) -> Result<Email> {
        self.messages
            .iter()
            .find(|m| m.external_id == message_id)
            .cloned()
            .ok_or_else(|| anyhow!("502 from provider for {message_id}"))
    }

    async fn profile_email(&self, _access_token: &str) -> Result<String> {
        Ok(MAILBOX.to_string())
    }
}

fn email(id: &str, sender: &str, subject: &str, body: &str) -> Email {
    Email {
        external_id: id.to_string(),
        subject: subject.to_string(),
        sender: sender.to_string(),
        received_at: Utc.with_ymd_and_hms(2026, 3, 2, 3, 15, 0).unwrap(),
        body: body.to_string(),
    }
}

fn bank_messages() -> Vec<Email> {
    vec![
        email(
            "msg-1",
            "VCBDigibank <VCBDigibank@info.vietcombank.com.vn>",
            "Biến động số dư",
            "Tài khoản 0011001234567 vừa giảm 150,000 VND. Thanh toán tại cửa hàng.",
        ),
        email(
            "msg-3",
            "VCBDigibank <VCBDigibank@info.vietcombank.com.vn>",
            "Biến động số dư",
            "Tài khoản 0011001234567 vừa nhận 2,000,000 VND. Chuyển khoản đến.",
        ),
    ]
}

struct Harness {
    db: Arc<Database>,
    oauth: Arc<FakeOAuth>,
    mailbox: Arc<FakeMailbox>,
    service: SyncService,
}

fn harness(mailbox: FakeMailbox) -> Harness {
    let db = temp_db();
    let oauth = Arc::new(FakeOAuth::new());
    let mailbox = Arc::new(mailbox);
    let settings = Settings::from_lookup(|_| None).expect("settings");
    let store: Arc<dyn SyncStore> = db.clone();
    let service = SyncService::new(
        store,
        oauth.clone(),
        mailbox.clone(),
        TokenCipher::from_hex(KEY_HEX).expect("cipher"),
        &settings,
    );
    Harness {
        db,
        oauth,
        mailbox,
        service,
    }
}

#[tokio::test]
async fn repeated_syncs_ingest_each_message_once() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &["msg-2"]));
    let connection = h.service.connect("user-1", "first").await?;

    let first = h.service.sync_now(&connection.id).await?;
    assert_eq!(first.fetched, 2);
    assert_eq!(first.new, 2);
    assert_eq!(first.failed, 1);
    assert_eq!(first.message(), "Successfully synced 2 emails");

    let second = h.service.sync_now(&connection.id).await?;
    assert_eq!(second.new, 0);
    assert_eq!(second.skipped, 2);

    let filter = TransactionFilter {
        connection_id: Some(connection.id.clone()),
        ..TransactionFilter::default()
    };
    assert_eq!(h.db.count_transactions(&filter)?, 2);
    assert!(h.db.find_transaction(&connection.id, "msg-2")?.is_none());

    let stored = h.db.list_transactions(filter)?;
    assert!(stored
        .iter()
        .all(|txn| txn.status == EmailTxnStatus::Pending && !txn.seen));

    let queries = h.mailbox.queries();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].contains("newer_than:180d"));
    assert!(queries[0].contains("label:inbox"));
    assert!(queries[0].ends_with("-in:chats"));
    Ok(())
}

#[tokio::test]
async fn remitano_swap_is_extracted_end_to_end() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(
        vec![email(
            "swap-1",
            "Remitano <notifications@remitano.com>",
            "You have swapped from 200.00 USDT to 5,226,659 VND",
            "Your swap has completed.",
        )],
        &[],
    ));
    let connection = h.service.connect("user-1", "first").await?;
    let outcome = h.service.auto_sync(&connection.id).await?;
    assert_eq!(outcome.new, 1);

    let txn = h
        .db
        .find_transaction(&connection.id, "swap-1")?
        .expect("ingested swap");
    assert_eq!(txn.amount, Some(5_226_659.0));
    assert_eq!(txn.merchant.as_deref(), Some("Remitano"));
    assert_eq!(txn.transaction_type.as_deref(), Some("credit"));
    assert_eq!(txn.currency.as_deref(), Some("VND"));
    assert_eq!(txn.raw_content, "Your swap has completed.");
    assert_eq!(txn.sender, "Remitano <notifications@remitano.com>");
    Ok(())
}

#[tokio::test]
async fn expired_access_token_is_refreshed_once() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &[]));
    let mut connection = h.service.connect("user-1", "first").await?;
    let stored_refresh = connection.refresh_token.clone();

    connection.expires_at = Some(Utc::now() - Duration::minutes(5));
    h.db.save_connection(&connection)?;

    h.service.sync_now(&connection.id).await?;
    assert_eq!(h.oauth.refreshes.load(Ordering::SeqCst), 1);

    h.service.sync_now(&connection.id).await?;
    assert_eq!(h.oauth.refreshes.load(Ordering::SeqCst), 1);

    let reloaded = h.db.get_connection(&connection.id)?.expect("connection");
    assert_eq!(reloaded.refresh_token, stored_refresh);
    assert!(reloaded.expires_at.is_some_and(|at| at > Utc::now()));
    Ok(())
}

#[tokio::test]
async fn unreadable_refresh_token_flags_reauth() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &[]));
    let mut broken = GmailConnection::new("user-2", "other@gmail.com");
    broken.refresh_token = Some("not-an-envelope".to_string());
    h.db.save_connection(&broken)?;

    let err = h
        .service
        .sync_now(&broken.id)
        .await
        .expect_err("reauth required");
    assert!(matches!(err, SyncError::ReauthRequired { .. }));
    assert_eq!(h.oauth.refreshes.load(Ordering::SeqCst), 0);

    let reloaded = h.db.get_connection(&broken.id)?.expect("connection");
    assert!(reloaded.reauth_required);
    Ok(())
}

#[tokio::test]
async fn one_failing_connection_does_not_stop_the_others() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &[]));
    let good = h.service.connect("user-1", "first").await?;
    let mut broken = GmailConnection::new("user-2", "other@gmail.com");
    broken.refresh_token = Some("not-an-envelope".to_string());
    h.db.save_connection(&broken)?;

    let report = h.service.sync_all_active(WindowPolicy::Incremental).await?;
    assert_eq!(report.len(), 2);
    assert_eq!(report[&good.id].as_ref().map(|o| o.new).ok(), Some(2));
    assert!(matches!(
        report[&broken.id],
        Err(SyncError::ReauthRequired { .. })
    ));

    // connect sets last_sync_at, so the incremental window is the one-hour floor.
    let queries = h.mailbox.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].contains("after:"));
    Ok(())
}

#[tokio::test]
async fn reconnecting_the_same_mailbox_updates_the_existing_connection() -> Result<()> {
    let h = harness(FakeMailbox::default());
    let first = h.service.connect("user-1", "first").await?;
    assert!(h.db.set_connection_active(&first.id, false)?);
    h.db.flag_reauth_required(&first.id)?;

    let second = h.service.connect("user-1", "second").await?;
    assert_eq!(second.id, first.id);
    assert!(second.is_active);
    assert!(!second.reauth_required);
    assert_ne!(second.refresh_token, first.refresh_token);
    assert_eq!(h.db.list_connections(Some("user-1"))?.len(), 1);

    let other_user = h.service.connect("user-2", "third").await?;
    assert_ne!(other_user.id, first.id);
    Ok(())
}

#[tokio::test]
async fn grants_without_refresh_token_are_rejected() {
    let h = harness(FakeMailbox::default());
    let err = h
        .service
        .connect("user-1", "no-refresh")
        .await
        .expect_err("missing refresh token");
    assert!(matches!(err, SyncError::Authorization(_)));

    let err = h
        .service
        .connect("user-1", "denied")
        .await
        .expect_err("rejected code");
    assert!(err.to_string().contains("invalid_grant"));
    assert!(h.db.list_connections(None).expect("list").is_empty());
}

#[tokio::test]
async fn month_sync_validates_and_renders_absolute_bounds() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &[]));
    let connection = h.service.connect("user-1", "first").await?;

    let err = h
        .service
        .sync_month(&connection.id, 2026, 13)
        .await
        .expect_err("invalid month");
    assert!(matches!(err, SyncError::InvalidWindow(_)));
    assert!(h.mailbox.queries().is_empty());

    h.service.sync_month(&connection.id, 2025, 12).await?;
    assert!(h.mailbox.queries()[0].contains("after:2025/12/01 before:2026/01/01"));
    Ok(())
}

#[tokio::test]
async fn inactive_and_missing_connections_are_refused() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &[]));
    let connection = h.service.connect("user-1", "first").await?;
    h.db.set_connection_active(&connection.id, false)?;

    assert!(matches!(
        h.service.sync_now(&connection.id).await,
        Err(SyncError::ConnectionInactive(_))
    ));
    assert!(matches!(
        h.service.sync_now("missing").await,
        Err(SyncError::ConnectionNotFound(_))
    ));

    let report = h.service.sync_all_active(WindowPolicy::Incremental).await?;
    assert!(report.is_empty());
    Ok(())
}

#[tokio::test]
async fn deleting_a_connection_removes_its_transactions() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &[]));
    let connection = h.service.connect("user-1", "first").await?;
    h.service.sync_now(&connection.id).await?;

    assert_eq!(h.db.delete_connection(&connection.id)?, 1);
    assert_eq!(h.db.count_transactions(&TransactionFilter::default())?, 0);
    Ok(())
}

#[tokio::test]
async fn backfill_honours_lookback_and_message_cap() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &[]));
    let connection = h.service.connect("user-1", "first").await?;

    let outcome = h.service.backfill(&connection.id, Some(30), Some(1)).await?;
    assert_eq!(outcome.fetched, 1);
    assert_eq!(outcome.new, 1);
    assert!(h.mailbox.queries()[0].contains("newer_than:30d"));

    for (days, max_results) in [(Some(0), None), (Some(i64::MAX), None), (None, Some(0))] {
        let err = h
            .service
            .backfill(&connection.id, days, max_results)
            .await
            .expect_err("rejected backfill");
        assert!(matches!(err, SyncError::InvalidWindow(_)));
    }
    assert_eq!(h.mailbox.queries().len(), 1);
    Ok(())
}

#[tokio::test]
async fn a_panicking_connection_is_reported_not_propagated() -> Result<()> {
    let h = harness(FakeMailbox {
        messages: bank_messages(),
        panic_token: Some("access-boom".to_string()),
        ..FakeMailbox::default()
    });
    let good = h.service.connect("user-1", "first").await?;
    let bad = h.service.connect("user-2", "boom").await?;

    let report = h.service.sync_all_active(WindowPolicy::Incremental).await?;
    assert_eq!(report.len(), 2);
    assert_eq!(report[&good.id].as_ref().map(|o| o.new).ok(), Some(2));
    match &report[&bad.id] {
        Err(SyncError::Aborted {
            connection_id,
            message,
        }) => {
            assert_eq!(connection_id, &bad.id);
            assert!(message.contains("mailbox client bug"));
        }
        other => panic!("expected aborted sync, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn disabling_during_a_sync_is_not_undone() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &[]));
    let connection = h.service.connect("user-1", "first").await?;
    let db = h.db.clone();
    let id = connection.id.clone();
    h.mailbox.run_during_list(move || {
        db.set_connection_active(&id, false).expect("disable");
        db.flag_reauth_required(&id).expect("flag");
    });

    h.service.sync_now(&connection.id).await?;

    let reloaded = h.db.get_connection(&connection.id)?.expect("connection");
    assert!(!reloaded.is_active);
    assert!(reloaded.reauth_required);
    assert!(reloaded.last_sync_at >= connection.last_sync_at);
    Ok(())
}

#[tokio::test]
async fn deleting_during_a_sync_is_not_undone() -> Result<()> {
    let h = harness(FakeMailbox::with_messages(bank_messages(), &[]));
    let mut connection = h.service.connect("user-1", "first").await?;
    connection.expires_at = Some(Utc::now() - Duration::minutes(5));
    h.db.save_connection(&connection)?;
    let db = h.db.clone();
    let id = connection.id.clone();
    h.mailbox.run_during_list(move || {
        db.delete_connection(&id).expect("delete");
    });

    let outcome = h.service.sync_now(&connection.id).await?;
    assert_eq!(outcome.new, 0);
    assert_eq!(outcome.failed, 2);
    assert!(h.db.get_connection(&connection.id)?.is_none());
    assert_eq!(h.db.count_transactions(&TransactionFilter::default())?, 0);
    Ok(())
}
