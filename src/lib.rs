pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod extract;
pub mod ingest;
pub mod ledger;
pub mod output;
pub mod scheduler;
pub mod sync;
pub mod timeutil;
pub mod tokens;
