use super::{json_pretty, EXIT_SUCCESS};
use crate::client::DaemonClient;

pub fn run(client: &DaemonClient, json: bool) -> Result<u8, String> {
    let jobs = client.get("/jobs")?;
    if json {
        println!("{}", json_pretty(&jobs)?);
        return Ok(EXIT_SUCCESS);
    }

    let rows = jobs.as_array().map(Vec::as_slice).unwrap_or_default();
    if rows.is_empty() {
        println!("no pending jobs");
        return Ok(EXIT_SUCCESS);
    }
    println!("{:<14} DUE", "ID");
    for row in rows {
        println!(
            "{:<14} {}",
            row["id"].as_str().unwrap_or("-"),
            row["due_at"].as_str().unwrap_or("-")
        );
    }
    Ok(EXIT_SUCCESS)
}
