use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Datelike, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use thiserror::Error;

use crate::timeutil::{format_timestamp, parse_stored_timestamp};

use self::models::{
    Category, CategoryAmount, EmailTransaction, EmailTransactionUpdate, EmailTxnDashboard,
    EmailTxnStatus, GmailConnection, MonthlyAmount,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;

/// Persistence consumed by token refresh, ingestion and the scheduler.
///
/// Every call is transactional at the single-row level only.
pub trait SyncStore: Send + Sync {
    fn get_connection(&self, id: &str) -> Result<Option<GmailConnection>, DbError>;

    fn find_connection_by_email(
        &self,
        user_id: &str,
        gmail_email: &str,
    ) -> Result<Option<GmailConnection>, DbError>;

    fn list_active_connections(&self) -> Result<Vec<GmailConnection>, DbError>;

    /// Insert or fully overwrite a connection row. Only the consent flow uses this.
    fn save_connection(&self, connection: &GmailConnection) -> Result<(), DbError>;

    /// Stamp `last_sync_at` on an existing row. Returns `false` when the row is gone.
    fn touch_last_sync(&self, connection_id: &str, at: DateTime<Utc>) -> Result<bool, DbError>;

    /// Store a refreshed access token on an existing row without touching its
    /// activation or re-auth flags. Returns `false` when the row is gone.
    fn update_access_token(
        &self,
        connection_id: &str,
        sealed_token: &str,
        expires_at: DateTime<Utc>,
        refreshed_at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    fn flag_reauth_required(&self, connection_id: &str) -> Result<(), DbError>;

    fn find_transaction(
        &self,
        connection_id: &str,
        external_id: &str,
    ) -> Result<Option<EmailTransaction>, DbError>;

    /// Insert a new transaction. Returns `false` when `(connection_id, external_id)`
    /// already exists, leaving the stored row untouched.
    fn save_transaction(&self, txn: &EmailTransaction) -> Result<bool, DbError>;
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub connection_id: Option<String>,
    pub status: Option<EmailTxnStatus>,
    pub unseen_only: bool,
    pub limit: usize,
    pub offset: usize,
}

const CONNECTION_COLUMNS: &str = "id, user_id, gmail_email, is_active, reauth_required, access_token, refresh_token, expires_at, last_sync_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, connection_id, external_id, subject, sender, received_at, amount, currency, merchant, account_number, transaction_type, confidence, status, seen, linked_transaction_id, category_id, raw_content, created_at, updated_at";

pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn, path.to_path_buf())
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self, DbError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        migrations::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".txmail").join("txmail.db"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn
            .lock()
            .map_err(|_| DbError::Config("database lock poisoned".to_string()))
    }

    pub fn list_connections(&self, user_id: Option<&str>) -> Result<Vec<GmailConnection>, DbError> {
        let conn = self.conn()?;
        let mut sql = format!("SELECT {CONNECTION_COLUMNS} FROM gmail_connections");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(user_id) = user_id {
            sql.push_str(" WHERE user_id = ?");
            params_vec.push(Box::new(user_id.to_string()));
        }
        sql.push_str(" ORDER BY created_at ASC");

        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let connections = stmt
            .query_map(params_refs.as_slice(), GmailConnection::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(connections)
    }

    pub fn set_connection_active(&self, id: &str, active: bool) -> Result<bool, DbError> {
        let updated = self.conn()?.execute(
            "UPDATE gmail_connections SET is_active = ?, updated_at = ? WHERE id = ?",
            params![active, format_timestamp(&Utc::now()), id],
        )?;
        Ok(updated > 0)
    }

    pub fn delete_connection(&self, id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM gmail_connections WHERE id = ?", [id])?;
        Ok(deleted)
    }

    pub fn get_transaction(&self, id: &str) -> Result<Option<EmailTransaction>, DbError> {
        let conn = self.conn()?;
        let txn = conn
            .query_row(
                &format!("SELECT {TRANSACTION_COLUMNS} FROM email_transactions WHERE id = ?"),
                [id],
                EmailTransaction::from_row,
            )
            .optional()?;
        Ok(txn)
    }

    fn push_filter(
        filter: &TransactionFilter,
        sql: &mut String,
        params_vec: &mut Vec<Box<dyn ToSql>>,
    ) {
        sql.push_str(" WHERE 1 = 1");
        if let Some(connection_id) = &filter.connection_id {
            sql.push_str(" AND connection_id = ?");
            params_vec.push(Box::new(connection_id.clone()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            params_vec.push(Box::new(status.to_string()));
        }
        if filter.unseen_only {
            sql.push_str(" AND seen = 0");
        }
    }

    pub fn list_transactions(
        &self,
        mut filter: TransactionFilter,
    ) -> Result<Vec<EmailTransaction>, DbError> {
        if filter.limit == 0 {
            filter.limit = 50;
        }

        let mut sql = format!("SELECT {TRANSACTION_COLUMNS} FROM email_transactions");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
        Self::push_filter(&filter, &mut sql, &mut params_vec);
        sql.push_str(" ORDER BY received_at DESC LIMIT ? OFFSET ?");
        params_vec.push(Box::new(filter.limit as i64));
        params_vec.push(Box::new(filter.offset as i64));

        let conn = self.conn()?;
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let results = stmt
            .query_map(params_refs.as_slice(), EmailTransaction::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    pub fn count_transactions(&self, filter: &TransactionFilter) -> Result<i64, DbError> {
        let mut sql = String::from("SELECT COUNT(*) FROM email_transactions");
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
        Self::push_filter(filter, &mut sql, &mut params_vec);

        let conn = self.conn()?;
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let count = conn.query_row(&sql, params_refs.as_slice(), |row| row.get(0))?;
        Ok(count)
    }

    /// Apply `update` to every listed transaction. Returns the number of rows changed.
    pub fn bulk_update_transactions(
        &self,
        ids: &[String],
        update: &EmailTransactionUpdate,
    ) -> Result<usize, DbError> {
        if ids.is_empty() || update.is_empty() {
            return Ok(0);
        }

        let mut sql = String::from("UPDATE email_transactions SET updated_at = ?");
        let mut params_vec: Vec<Box<dyn ToSql>> = vec![Box::new(format_timestamp(&Utc::now()))];

        if let Some(status) = update.status {
            sql.push_str(", status = ?");
            params_vec.push(Box::new(status.to_string()));
        }
        if let Some(seen) = update.seen {
            sql.push_str(", seen = ?");
            params_vec.push(Box::new(seen));
        }
        if let Some(category_id) = &update.category_id {
            sql.push_str(", category_id = ?");
            params_vec.push(Box::new(category_id.clone()));
        }
        if let Some(linked) = &update.linked_transaction_id {
            sql.push_str(", linked_transaction_id = ?");
            params_vec.push(Box::new(linked.clone()));
        }
        if let Some(amount) = update.amount {
            sql.push_str(", amount = ?");
            params_vec.push(Box::new(amount));
        }
        if let Some(merchant) = &update.merchant {
            sql.push_str(", merchant = ?");
            params_vec.push(Box::new(merchant.clone()));
        }
        if let Some(kind) = &update.transaction_type {
            sql.push_str(", transaction_type = ?");
            params_vec.push(Box::new(kind.clone()));
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        sql.push_str(&format!(" WHERE id IN ({placeholders})"));
        for id in ids {
            params_vec.push(Box::new(id.clone()));
        }

        let conn = self.conn()?;
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();
        let updated = conn.execute(&sql, params_refs.as_slice())?;
        Ok(updated)
    }

    pub fn update_transaction(
        &self,
        id: &str,
        update: &EmailTransactionUpdate,
    ) -> Result<Option<EmailTransaction>, DbError> {
        self.bulk_update_transactions(&[id.to_string()], update)?;
        self.get_transaction(id)
    }

    pub fn mark_seen(&self, ids: &[String]) -> Result<usize, DbError> {
        self.bulk_update_transactions(
            ids,
            &EmailTransactionUpdate {
                seen: Some(true),
                ..EmailTransactionUpdate::default()
            },
        )
    }

    pub fn delete_transaction(&self, id: &str) -> Result<usize, DbError> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM email_transactions WHERE id = ?", [id])?;
        Ok(deleted)
    }

    pub fn insert_category(&self, user_id: &str, name: &str) -> Result<Category, DbError> {
        let category = Category {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.trim().to_string(),
        };
        self.conn()?.execute(
            "INSERT INTO categories (id, user_id, name) VALUES (?, ?, ?)",
            params![category.id, category.user_id, category.name],
        )?;
        Ok(category)
    }

    pub fn list_categories(&self, user_id: &str) -> Result<Vec<Category>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, user_id, name FROM categories WHERE user_id = ? ORDER BY name ASC")?;
        let categories = stmt
            .query_map([user_id], Category::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(categories)
    }

    /// Sum extracted amounts for one connection by category and by calendar month (UTC).
    pub fn dashboard(
        &self,
        connection_id: &str,
        month: Option<(i32, u32)>,
    ) -> Result<EmailTxnDashboard, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT t.amount, t.received_at, t.category_id, c.name
            FROM email_transactions t
            LEFT JOIN categories c ON c.id = t.category_id
            WHERE t.connection_id = ? AND t.amount IS NOT NULL
            "#,
        )?;
        let rows = stmt
            .query_map([connection_id], |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut by_category: BTreeMap<Option<String>, (Option<String>, f64)> = BTreeMap::new();
        let mut monthly: BTreeMap<(i32, u32), f64> = BTreeMap::new();

        for (amount, received_raw, category_id, category_name) in rows {
            let Some(received_at) = parse_stored_timestamp(&received_raw) else {
                tracing::warn!(connection_id, received_at = %received_raw, "skipping row with unreadable timestamp");
                continue;
            };
            let key = (received_at.year(), received_at.month());
            if month.is_some_and(|wanted| wanted != key) {
                continue;
            }

            let entry = by_category
                .entry(category_id)
                .or_insert((category_name, 0.0));
            entry.1 += amount;
            *monthly.entry(key).or_insert(0.0) += amount;
        }

        Ok(EmailTxnDashboard {
            by_category: by_category
                .into_iter()
                .map(|(category_id, (category_name, total_amount))| CategoryAmount {
                    category_id,
                    category_name,
                    total_amount,
                })
                .collect(),
            monthly: monthly
                .into_iter()
                .map(|((year, month), total_amount)| MonthlyAmount {
                    year,
                    month,
                    total_amount,
                })
                .collect(),
        })
    }
}

impl SyncStore for Database {
    fn get_connection(&self, id: &str) -> Result<Option<GmailConnection>, DbError> {
        let conn = self.conn()?;
        let connection = conn
            .query_row(
                &format!("SELECT {CONNECTION_COLUMNS} FROM gmail_connections WHERE id = ?"),
                [id],
                GmailConnection::from_row,
            )
            .optional()?;
        Ok(connection)
    }

    fn find_connection_by_email(
        &self,
        user_id: &str,
        gmail_email: &str,
    ) -> Result<Option<GmailConnection>, DbError> {
        let conn = self.conn()?;
        let connection = conn
            .query_row(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM gmail_connections WHERE user_id = ? AND gmail_email = ? LIMIT 1"
                ),
                params![user_id, gmail_email],
                GmailConnection::from_row,
            )
            .optional()?;
        Ok(connection)
    }

    fn list_active_connections(&self) -> Result<Vec<GmailConnection>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM gmail_connections WHERE is_active = 1 ORDER BY created_at ASC"
        ))?;
        let connections = stmt
            .query_map([], GmailConnection::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(connections)
    }

    fn save_connection(&self, connection: &GmailConnection) -> Result<(), DbError> {
        self.conn()?.execute(
            r#"
            INSERT INTO gmail_connections (
                id, user_id, gmail_email, is_active, reauth_required, access_token, refresh_token,
                expires_at, last_sync_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                gmail_email = excluded.gmail_email,
                is_active = excluded.is_active,
                reauth_required = excluded.reauth_required,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                last_sync_at = excluded.last_sync_at,
                updated_at = excluded.updated_at
            "#,
            params![
                connection.id,
                connection.user_id,
                connection.gmail_email,
                connection.is_active,
                connection.reauth_required,
                connection.access_token,
                connection.refresh_token,
                connection.expires_at.as_ref().map(format_timestamp),
                connection.last_sync_at.as_ref().map(format_timestamp),
                format_timestamp(&connection.created_at),
                format_timestamp(&connection.updated_at),
            ],
        )?;
        Ok(())
    }

    fn touch_last_sync(&self, connection_id: &str, at: DateTime<Utc>) -> Result<bool, DbError> {
        let stamp = format_timestamp(&at);
        let updated = self.conn()?.execute(
            "UPDATE gmail_connections SET last_sync_at = ?, updated_at = ? WHERE id = ?",
            params![stamp, stamp, connection_id],
        )?;
        Ok(updated > 0)
    }

    fn update_access_token(
        &self,
        connection_id: &str,
        sealed_token: &str,
        expires_at: DateTime<Utc>,
        refreshed_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let stamp = format_timestamp(&refreshed_at);
        let updated = self.conn()?.execute(
            r#"
            UPDATE gmail_connections
            SET access_token = ?, expires_at = ?, last_sync_at = ?, updated_at = ?
            WHERE id = ?
            "#,
            params![
                sealed_token,
                format_timestamp(&expires_at),
                stamp,
                stamp,
                connection_id
            ],
        )?;
        Ok(updated > 0)
    }

    fn flag_reauth_required(&self, connection_id: &str) -> Result<(), DbError> {
        self.conn()?.execute(
            "UPDATE gmail_connections SET reauth_required = 1, updated_at = ? WHERE id = ?",
            params![format_timestamp(&Utc::now()), connection_id],
        )?;
        Ok(())
    }

    fn find_transaction(
        &self,
        connection_id: &str,
        external_id: &str,
    ) -> Result<Option<EmailTransaction>, DbError> {
        let conn = self.conn()?;
        let txn = conn
            .query_row(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM email_transactions WHERE connection_id = ? AND external_id = ?"
                ),
                params![connection_id, external_id],
                EmailTransaction::from_row,
            )
            .optional()?;
        Ok(txn)
    }

    fn save_transaction(&self, txn: &EmailTransaction) -> Result<bool, DbError> {
        let inserted = self.conn()?.execute(
            r#"
            INSERT INTO email_transactions (
                id, connection_id, external_id, subject, sender, received_at, amount, currency,
                merchant, account_number, transaction_type, confidence, status, seen,
                linked_transaction_id, category_id, raw_content, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(connection_id, external_id) DO NOTHING
            "#,
            params![
                txn.id,
                txn.connection_id,
                txn.external_id,
                txn.subject,
                txn.sender,
                format_timestamp(&txn.received_at),
                txn.amount,
                txn.currency,
                txn.merchant,
                txn.account_number,
                txn.transaction_type,
                txn.confidence,
                txn.status.to_string(),
                txn.seen,
                txn.linked_transaction_id,
                txn.category_id,
                txn.raw_content,
                format_timestamp(&txn.created_at),
                format_timestamp(&txn.updated_at),
            ],
        )?;
        Ok(inserted > 0)
    }
}
