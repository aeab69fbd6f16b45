pub mod completions;
pub mod create;
pub mod delete;
pub mod failed;
pub mod jobs;
pub mod list;
pub mod serve;

use serde_json::Value;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_REJECTED: u8 = 2;
pub const EXIT_DAEMON_UNREACHABLE: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "live" => Style::new().green().apply_to(state).to_string(),
        "pending" => Style::new().yellow().apply_to(state).to_string(),
        "unmanaged" => Style::new().cyan().apply_to(state).to_string(),
        "failed" => Style::new().red().bold().apply_to(state).to_string(),
        "unknown" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

/// Lifecycle state of one row of `GET /codes`.
pub fn slot_state(row: &Value) -> &'static str {
    let managed = row["managed"].as_bool().unwrap_or(false);
    match row["live"].as_bool() {
        None => "unknown",
        Some(true) if managed => "live",
        Some(true) => "unmanaged",
        Some(false) => "pending",
    }
}

/// A JSON string field, or `-` when absent.
pub fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("-")
}
