use serde_json::Value;
use std::io::Read;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:5002";

/// Covers a device round trip on the daemon side plus slack.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin JSON client for the daemon's HTTP API.
///
/// Errors come back as messages whose prefix decides the exit code:
/// `rejected:` for requests the daemon refused, `daemon unreachable:` when
/// nothing answered.
pub struct DaemonClient {
    base: String,
    agent: ureq::Agent,
}

impl DaemonClient {
    pub fn new(base: &str) -> Result<Self, String> {
        let base = base.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(format!("--server must be an http(s) URL, got '{base}'"));
        }
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        Ok(Self {
            base: base.to_owned(),
            agent: ureq::Agent::new_with_config(config),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub fn get(&self, path: &str) -> Result<Value, String> {
        let url = self.url(path);
        debug!("GET {url}");
        let resp = self.agent.get(&url).call().map_err(|e| transport_error(&url, &e))?;
        read_response(resp)
    }

    pub fn post(&self, path: &str, body: &Value) -> Result<Value, String> {
        let url = self.url(path);
        debug!("POST {url}");
        let resp = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json")
            .send(body.to_string())
            .map_err(|e| transport_error(&url, &e))?;
        read_response(resp)
    }

    pub fn delete(&self, path: &str) -> Result<Value, String> {
        let url = self.url(path);
        debug!("DELETE {url}");
        let resp = self
            .agent
            .delete(&url)
            .call()
            .map_err(|e| transport_error(&url, &e))?;
        read_response(resp)
    }
}

fn transport_error(url: &str, err: &ureq::Error) -> String {
    format!("daemon unreachable: {url}: {err}")
}

fn read_response(resp: ureq::http::Response<ureq::Body>) -> Result<Value, String> {
    let status = resp.status().as_u16();
    let mut body = String::new();
    resp.into_body()
        .into_reader()
        .read_to_string(&mut body)
        .map_err(|e| format!("failed to read daemon response: {e}"))?;
    debug!("HTTP {status}, {} bytes", body.len());
    interpret(status, &body)
}

/// Turn a status and body into the payload or a prefixed error message.
pub fn interpret(status: u16, body: &str) -> Result<Value, String> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| format!("invalid daemon response (HTTP {status}): {e}"))?;
    if (200..300).contains(&status) {
        return Ok(value);
    }
    let message = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("no error message")
        .to_owned();
    Err(match status {
        400 | 409 => format!("rejected: {message}"),
        502 => format!("lock not confirmed: {message}"),
        _ => format!("daemon error (HTTP {status}): {message}"),
    })
}
