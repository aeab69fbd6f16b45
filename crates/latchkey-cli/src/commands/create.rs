use super::{field, json_pretty, EXIT_SUCCESS};
use crate::client::DaemonClient;
use latchkey_store::{format_timestamp, parse_timestamp};
use serde_json::json;

pub fn run(
    client: &DaemonClient,
    user: &str,
    enable_at: &str,
    expire_at: &str,
    json: bool,
) -> Result<u8, String> {
    // Catch typos before they reach the daemon.
    let enable = parse_timestamp(enable_at).map_err(|e| format!("rejected: {e}"))?;
    let expire = parse_timestamp(expire_at).map_err(|e| format!("rejected: {e}"))?;

    let created = client.post(
        "/codes",
        &json!({
            "user": user,
            "enable_at": format_timestamp(&enable),
            "expire_at": format_timestamp(&expire),
        }),
    )?;

    if json {
        println!("{}", json_pretty(&created)?);
    } else {
        println!(
            "code {} for {user} in slot {}",
            console::style(field(&created, "code")).bold(),
            created["slot"]
        );
        println!(
            "active {} until {}",
            format_timestamp(&enable),
            format_timestamp(&expire)
        );
    }
    Ok(EXIT_SUCCESS)
}
