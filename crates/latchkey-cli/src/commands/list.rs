use super::{colorize_state, field, json_pretty, slot_state, EXIT_SUCCESS};
use crate::client::DaemonClient;

pub fn run(client: &DaemonClient, json: bool) -> Result<u8, String> {
    let listing = client.get("/codes")?;
    if json {
        println!("{}", json_pretty(&listing)?);
        return Ok(EXIT_SUCCESS);
    }

    if listing["device_reachable"].as_bool() == Some(false) {
        eprintln!("warning: lock unreachable, showing stored codes only");
    }
    let rows = listing["codes"].as_array().map(Vec::as_slice).unwrap_or_default();
    if rows.is_empty() {
        println!("no codes");
        return Ok(EXIT_SUCCESS);
    }

    println!(
        "{:<5} {:<20} {:<6} {:<10} {:<20} EXPIRES",
        "SLOT", "HOLDER", "CODE", "STATE", "ENABLES"
    );
    for row in rows {
        let state = slot_state(row);
        println!(
            "{:<5} {:<20} {:<6} {:<10} {:<20} {}",
            row["slot"].as_u64().unwrap_or_default(),
            field(row, "holder"),
            field(row, "code"),
            colorize_state(state),
            field(row, "enable_at"),
            field(row, "expire_at"),
        );
    }
    Ok(EXIT_SUCCESS)
}
