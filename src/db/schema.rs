use rusqlite::Connection;

/// Version 1: connections, categories and email transactions.
pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS gmail_connections (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            gmail_email TEXT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT true,
            reauth_required BOOLEAN NOT NULL DEFAULT false,
            access_token TEXT,
            refresh_token TEXT,
            expires_at TEXT,
            last_sync_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(user_id, name)
        );

        CREATE TABLE IF NOT EXISTS email_transactions (
            id TEXT PRIMARY KEY,
            connection_id TEXT NOT NULL REFERENCES gmail_connections(id) ON DELETE CASCADE,
            external_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            sender TEXT NOT NULL,
            received_at TEXT NOT NULL,
            amount REAL,
            currency TEXT,
            merchant TEXT,
            account_number TEXT,
            transaction_type TEXT,
            confidence REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending', 'processed', 'ignored')),
            seen BOOLEAN NOT NULL DEFAULT false,
            linked_transaction_id TEXT,
            category_id TEXT REFERENCES categories(id) ON DELETE SET NULL,
            raw_content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(connection_id, external_id)
        );

        CREATE INDEX IF NOT EXISTS idx_connections_user_id ON gmail_connections(user_id);
        CREATE INDEX IF NOT EXISTS idx_connections_user_email ON gmail_connections(user_id, gmail_email);
        CREATE INDEX IF NOT EXISTS idx_email_txn_connection_received
            ON email_transactions(connection_id, received_at);
        CREATE INDEX IF NOT EXISTS idx_email_txn_status ON email_transactions(status);
        "#,
    )?;

    Ok(())
}
