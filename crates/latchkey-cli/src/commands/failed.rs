use super::{field, json_pretty, EXIT_SUCCESS};
use crate::client::DaemonClient;

pub fn run(client: &DaemonClient, json: bool) -> Result<u8, String> {
    let failures = client.get("/failed")?;
    if json {
        println!("{}", json_pretty(&failures)?);
        return Ok(EXIT_SUCCESS);
    }

    let rows = failures.as_array().map(Vec::as_slice).unwrap_or_default();
    if rows.is_empty() {
        println!("no failed activations");
        return Ok(EXIT_SUCCESS);
    }
    println!("{:<5} {:<20} {:<20} ERROR", "SLOT", "HOLDER", "WHEN");
    for row in rows {
        println!(
            "{:<5} {:<20} {:<20} {}",
            row["slot"].as_u64().unwrap_or_default(),
            field(row, "holder"),
            field(row, "occurred_at"),
            console::style(field(row, "error")).red(),
        );
    }
    Ok(EXIT_SUCCESS)
}
