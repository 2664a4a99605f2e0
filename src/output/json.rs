use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::sync::SyncReport;

pub fn to_pretty<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Per-connection results keyed by connection id; failures carry an `error` string.
pub fn format_sync_report(report: &SyncReport) -> Result<String> {
    let mut map = Map::new();
    for (connection_id, result) in report {
        let value = match result {
            Ok(outcome) => json!({
                "success": true,
                "message": outcome.message(),
                "fetched": outcome.fetched,
                "new": outcome.new,
                "skipped": outcome.skipped,
                "failed": outcome.failed,
            }),
            Err(err) => json!({
                "success": false,
                "error": err.to_string(),
            }),
        };
        map.insert(connection_id.clone(), value);
    }
    to_pretty(&Value::Object(map))
}
