use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Processed,
    Ignored,
}

#[derive(Debug, Parser)]
#[command(name = "txmail", version, about = "Gmail transaction ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// SQLite database path (defaults to ~/.txmail/txmail.db)
    #[arg(long, global = true, env = "TXMAIL_DB_PATH")]
    db: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the Google consent URL for connecting a mailbox
    ConnectUrl {
        #[arg(long)]
        state: Option<String>,
    },
    /// Complete the consent flow with an authorization code
    Connect {
        #[arg(long)]
        user: String,
        #[arg(long)]
        code: String,
    },
    /// Manage Gmail connections
    Connections {
        #[command(subcommand)]
        command: ConnectionCommands,
    },
    /// Sync one connection now
    Sync(SyncArgs),
    /// Sync every active connection over the last N days
    SyncAll {
        #[arg(long, default_value_t = 3)]
        days: i64,
    },
    /// Review ingested email transactions
    Transactions {
        #[command(subcommand)]
        command: TransactionCommands,
    },
    /// Manage categories
    Categories {
        #[command(subcommand)]
        command: CategoryCommands,
    },
    /// Totals by category and month for one connection
    Dashboard {
        #[arg(long)]
        connection: String,
        /// Restrict to one month, YYYY-MM
        #[arg(long)]
        month: Option<String>,
    },
    /// Run the sync scheduler until Ctrl-C
    Serve,
}

#[derive(Debug, Subcommand)]
enum ConnectionCommands {
    /// List connections
    List {
        #[arg(long)]
        user: Option<String>,
    },
    /// Show one connection
    Show { id: String },
    /// Stop syncing a connection
    Disable { id: String },
    /// Resume syncing a connection
    Enable { id: String },
    /// Delete a connection and its email transactions
    Remove { id: String },
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long)]
    connection: String,
    /// Sync one calendar month, YYYY-MM
    #[arg(long, conflicts_with = "auto")]
    month: Option<String>,
    /// Sync the last 24 hours
    #[arg(long, default_value_t = false)]
    auto: bool,
    /// Backfill lookback in days (default: TXMAIL_BACKFILL_DAYS)
    #[arg(long, conflicts_with_all = ["month", "auto"])]
    days: Option<i64>,
    /// Backfill message cap (default: TXMAIL_BACKFILL_MAX_RESULTS)
    #[arg(long, conflicts_with_all = ["month", "auto"])]
    max_results: Option<usize>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    connection: Option<String>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long, default_value_t = 50)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Debug, Args)]
struct UpdateArgs {
    /// One or more transaction ids
    #[arg(required = true)]
    ids: Vec<String>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long)]
    seen: Option<bool>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    merchant: Option<String>,
    #[arg(long)]
    amount: Option<f64>,
    #[arg(long = "type")]
    transaction_type: Option<String>,
    #[arg(long)]
    linked: Option<String>,
}

#[derive(Debug, Subcommand)]
enum TransactionCommands {
    /// List email transactions, newest first
    List(ListArgs),
    /// List transactions not yet seen
    Unseen {
        #[arg(long)]
        connection: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one transaction with its raw body
    Show { id: String },
    /// Mark transactions as seen
    MarkSeen {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Update review fields on one or more transactions
    Update(UpdateArgs),
    /// Delete one transaction
    Delete { id: String },
    /// Build a ledger draft from a transaction
    ToLedger {
        id: String,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// Record the id of the ledger entry created from the draft
        #[arg(long)]
        link: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum CategoryCommands {
    /// Add a category
    Add {
        #[arg(long)]
        user: String,
        name: String,
    },
    /// List a user's categories
    List {
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::path::PathBuf;
    use std::sync::Arc;

    use anyhow::{anyhow, Context, Result};

    use txmail::config::Settings;
    use txmail::connectors::query::QueryWindow;
    use txmail::connectors::{GmailApi, GoogleOAuthClient, OAuthProvider};
    use txmail::crypto::TokenCipher;
    use txmail::db::models::{EmailTransactionUpdate, EmailTxnStatus};
    use txmail::db::{Database, SyncStore, TransactionFilter};
    use txmail::ledger;
    use txmail::output::{self, OutputFormat};
    use txmail::scheduler::SyncScheduler;
    use txmail::sync::{SyncReport, SyncService};

    use super::{
        CategoryCommands, Cli, Commands, ConnectionCommands, StatusArg, SyncArgs,
        TransactionCommands, UpdateArgs,
    };

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let settings = Settings::from_env().context("resolve TXMAIL_* settings")?;
        let format = OutputFormat::from_json_flag(cli.json);
        let db_path = cli.db.or_else(|| settings.db_path.clone());

        match cli.command {
            Commands::ConnectUrl { state } => handle_connect_url(&settings, state.as_deref()),
            Commands::Connect { user, code } => {
                let db = open_db(db_path)?;
                handle_connect(&settings, db, &user, &code, format).await
            }
            Commands::Connections { command } => {
                let db = open_db(db_path)?;
                handle_connections(&db, command, format)
            }
            Commands::Sync(args) => handle_sync(&settings, open_db(db_path)?, args, format).await,
            Commands::SyncAll { days } => {
                handle_sync_all(&settings, open_db(db_path)?, days, format).await
            }
            Commands::Transactions { command } => {
                let db = open_db(db_path)?;
                handle_transactions(&db, command, format)
            }
            Commands::Categories { command } => {
                let db = open_db(db_path)?;
                handle_categories(&db, command, format)
            }
            Commands::Dashboard { connection, month } => {
                let db = open_db(db_path)?;
                let month = month.as_deref().map(parse_month_arg).transpose()?;
                let dashboard = db.dashboard(&connection, month)?;
                println!("{}", output::format_dashboard(format, &dashboard)?);
                Ok(())
            }
            Commands::Serve => handle_serve(&settings, open_db(db_path)?, format).await,
        }
    }

    fn open_db(path: Option<PathBuf>) -> Result<Arc<Database>> {
        let path = match path {
            Some(path) => path,
            None => Database::default_db_path().context("resolve default txmail database path")?,
        };
        let db = Database::open(&path)
            .with_context(|| format!("open txmail database at {}", path.display()))?;
        Ok(Arc::new(db))
    }

    fn build_service(settings: &Settings, db: Arc<Database>) -> Result<SyncService> {
        let cipher = TokenCipher::from_hex(settings.require_token_key()?)
            .context("load token encryption key")?;
        let oauth = GoogleOAuthClient::from_settings(settings)?;
        let mailbox = GmailApi::from_settings(settings)?;
        let store: Arc<dyn SyncStore> = db;
        Ok(SyncService::new(
            store,
            Arc::new(oauth),
            Arc::new(mailbox),
            cipher,
            settings,
        ))
    }

    fn handle_connect_url(settings: &Settings, state: Option<&str>) -> Result<()> {
        let oauth = GoogleOAuthClient::from_settings(settings)?;
        println!("{}", oauth.authorization_url(state)?);
        Ok(())
    }

    async fn handle_connect(
        settings: &Settings,
        db: Arc<Database>,
        user: &str,
        code: &str,
        format: OutputFormat,
    ) -> Result<()> {
        let service = build_service(settings, db)?;
        let connection = service
            .connect(user, code)
            .await
            .context("connect gmail mailbox")?;
        println!("{}", output::format_connection(format, &connection)?);
        Ok(())
    }

    fn handle_connections(
        db: &Database,
        command: ConnectionCommands,
        format: OutputFormat,
    ) -> Result<()> {
        match command {
            ConnectionCommands::List { user } => {
                let connections = db.list_connections(user.as_deref())?;
                println!("{}", output::format_connections(format, &connections)?);
            }
            ConnectionCommands::Show { id } => {
                let connection = db
                    .get_connection(&id)?
                    .ok_or_else(|| anyhow!("connection not found: {id}"))?;
                println!("{}", output::format_connection(format, &connection)?);
            }
            ConnectionCommands::Disable { id } => {
                if !db.set_connection_active(&id, false)? {
                    return Err(anyhow!("connection not found: {id}"));
                }
                println!("Disabled connection: {id}");
            }
            ConnectionCommands::Enable { id } => {
                if !db.set_connection_active(&id, true)? {
                    return Err(anyhow!("connection not found: {id}"));
                }
                println!("Enabled connection: {id}");
            }
            ConnectionCommands::Remove { id } => {
                if db.delete_connection(&id)? == 0 {
                    println!("No connection found: {id}");
                } else {
                    println!("Removed connection: {id}");
                }
            }
        }
        Ok(())
    }

    async fn handle_sync(
        settings: &Settings,
        db: Arc<Database>,
        args: SyncArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let service = build_service(settings, db)?;
        let result = match (args.month.as_deref(), args.auto) {
            (Some(month), _) => {
                let (year, month) = parse_month_arg(month)?;
                service.sync_month(&args.connection, year, month).await
            }
            (None, true) => service.auto_sync(&args.connection).await,
            (None, false) => {
                service
                    .backfill(&args.connection, args.days, args.max_results)
                    .await
            }
        };

        let mut report = SyncReport::new();
        report.insert(args.connection.clone(), result);
        println!("{}", output::format_sync_report(format, &report)?);

        match report.remove(&args.connection) {
            Some(Err(err)) => Err(anyhow!(err)),
            _ => Ok(()),
        }
    }

    async fn handle_sync_all(
        settings: &Settings,
        db: Arc<Database>,
        days: i64,
        format: OutputFormat,
    ) -> Result<()> {
        let window = QueryWindow::days(days).context("--days")?;
        let scheduler = SyncScheduler::new(Arc::new(build_service(settings, db)?));
        let report = scheduler.trigger_now(window).await?;
        println!("{}", output::format_sync_report(format, &report)?);
        Ok(())
    }

    fn handle_transactions(
        db: &Database,
        command: TransactionCommands,
        format: OutputFormat,
    ) -> Result<()> {
        match command {
            TransactionCommands::List(args) => {
                let transactions = db.list_transactions(TransactionFilter {
                    connection_id: args.connection,
                    status: args.status.map(map_status),
                    unseen_only: false,
                    limit: args.limit,
                    offset: args.offset,
                })?;
                println!("{}", output::format_transactions(format, &transactions)?);
            }
            TransactionCommands::Unseen { connection, limit } => {
                let transactions = db.list_transactions(TransactionFilter {
                    connection_id: connection,
                    unseen_only: true,
                    limit,
                    ..TransactionFilter::default()
                })?;
                println!("{}", output::format_transactions(format, &transactions)?);
            }
            TransactionCommands::Show { id } => {
                let txn = db
                    .get_transaction(&id)?
                    .ok_or_else(|| anyhow!("email transaction not found: {id}"))?;
                println!("{}", output::format_transaction(format, &txn)?);
            }
            TransactionCommands::MarkSeen { ids } => {
                let updated = db.mark_seen(&ids)?;
                println!("Marked {updated} transaction(s) as seen.");
            }
            TransactionCommands::Update(args) => handle_update(db, args, format)?,
            TransactionCommands::Delete { id } => {
                if db.delete_transaction(&id)? == 0 {
                    println!("No email transaction found: {id}");
                } else {
                    println!("Deleted email transaction: {id}");
                }
            }
            TransactionCommands::ToLedger {
                id,
                note,
                category,
                link,
            } => {
                let txn = db
                    .get_transaction(&id)?
                    .ok_or_else(|| anyhow!("email transaction not found: {id}"))?;
                let draft = ledger::draft_from_email(&txn, note.as_deref(), category.as_deref())?;
                println!("{}", output::format_ledger_draft(format, &draft)?);

                if let Some(ledger_id) = link {
                    let update = ledger::link_update(&ledger_id, draft.category_id.as_deref());
                    db.update_transaction(&id, &update)?;
                    eprintln!("Linked {id} to ledger transaction {ledger_id}");
                }
            }
        }
        Ok(())
    }

    fn handle_update(db: &Database, args: UpdateArgs, format: OutputFormat) -> Result<()> {
        let update = EmailTransactionUpdate {
            status: args.status.map(map_status),
            seen: args.seen,
            category_id: args.category,
            linked_transaction_id: args.linked,
            amount: args.amount,
            merchant: args.merchant,
            transaction_type: args.transaction_type,
        };
        if update.is_empty() {
            return Err(anyhow!("nothing to update; pass at least one field flag"));
        }

        if let [id] = args.ids.as_slice() {
            let txn = db
                .update_transaction(id, &update)?
                .ok_or_else(|| anyhow!("email transaction not found: {id}"))?;
            println!("{}", output::format_transaction(format, &txn)?);
        } else {
            let updated = db.bulk_update_transactions(&args.ids, &update)?;
            println!("Updated {updated} transaction(s).");
        }
        Ok(())
    }

    fn handle_categories(
        db: &Database,
        command: CategoryCommands,
        format: OutputFormat,
    ) -> Result<()> {
        match command {
            CategoryCommands::Add { user, name } => {
                let category = db
                    .insert_category(&user, &name)
                    .with_context(|| format!("add category '{name}'"))?;
                println!("Added category: {} ({})", category.name, category.id);
            }
            CategoryCommands::List { user } => {
                let categories = db.list_categories(&user)?;
                println!("{}", output::format_categories(format, &categories)?);
            }
        }
        Ok(())
    }

    async fn handle_serve(settings: &Settings, db: Arc<Database>, format: OutputFormat) -> Result<()> {
        let scheduler = SyncScheduler::new(Arc::new(build_service(settings, db)?));
        scheduler.start()?;
        println!("{}", output::format_scheduler_status(format, &scheduler.status())?);

        tokio::signal::ctrl_c()
            .await
            .context("wait for shutdown signal")?;
        eprintln!("shutting down scheduler");
        scheduler.stop().await;
        Ok(())
    }

    fn map_status(value: StatusArg) -> EmailTxnStatus {
        match value {
            StatusArg::Pending => EmailTxnStatus::Pending,
            StatusArg::Processed => EmailTxnStatus::Processed,
            StatusArg::Ignored => EmailTxnStatus::Ignored,
        }
    }

    fn parse_month_arg(raw: &str) -> Result<(i32, u32)> {
        let (year, month) = raw
            .trim()
            .split_once('-')
            .ok_or_else(|| anyhow!("invalid month '{raw}', expected YYYY-MM"))?;
        let year = year
            .parse::<i32>()
            .with_context(|| format!("invalid year in '{raw}'"))?;
        let month = month
            .parse::<u32>()
            .with_context(|| format!("invalid month in '{raw}'"))?;
        Ok((year, month))
    }
}
