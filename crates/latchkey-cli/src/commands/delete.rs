use super::{json_pretty, EXIT_SUCCESS};
use crate::client::DaemonClient;

pub fn run(client: &DaemonClient, slot: u16, json: bool) -> Result<u8, String> {
    if slot == 0 {
        return Err("rejected: slot numbers start at 1".to_owned());
    }
    let deleted = client.delete(&format!("/codes/{slot}"))?;
    if json {
        println!("{}", json_pretty(&deleted)?);
    } else {
        println!("deleted slot {slot}");
    }
    Ok(EXIT_SUCCESS)
}
