use crate::{DeviceError, DeviceGateway, GatewayConfig, LiveCodes, UNKNOWN_HOLDER};
use latchkey_store::Slot;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use tracing::{debug, warn};
use url::Url;

/// Gateway to a lock paired with a Hubitat hub, through the Maker API app.
///
/// Every call is a plain `GET`:
/// - `GET {url}/devices/{id}`                              device details
/// - `GET {url}/devices/{id}/setCode/{slot},{code},{name}` program a slot
/// - `GET {url}/devices/{id}/deleteCode/{slot}`            clear a slot
///
/// with `access_token` passed as a query parameter.
pub struct HttpGateway {
    config: GatewayConfig,
    base: Url,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct DeviceDetails {
    #[serde(default)]
    attributes: Vec<DeviceAttribute>,
}

#[derive(Deserialize)]
struct DeviceAttribute {
    name: String,
    #[serde(rename = "currentValue", default)]
    current_value: serde_json::Value,
}

#[derive(Deserialize)]
struct LockCodeEntry {
    #[serde(default)]
    name: Option<String>,
}

/// Extract the `lockCodes` attribute from a device details document.
///
/// The attribute value is itself a JSON string mapping slot numbers to
/// `{ "name": ..., "code": ... }`. A device without the attribute has no codes.
pub fn parse_lock_codes(body: &[u8]) -> Result<LiveCodes, DeviceError> {
    let details: DeviceDetails = serde_json::from_slice(body)
        .map_err(|e| DeviceError::Protocol(format!("invalid device details: {e}")))?;

    let Some(attr) = details.attributes.into_iter().find(|a| a.name == "lockCodes") else {
        return Ok(LiveCodes::new());
    };

    let entries: BTreeMap<String, LockCodeEntry> = match attr.current_value {
        serde_json::Value::Null => return Ok(LiveCodes::new()),
        serde_json::Value::String(raw) if raw.trim().is_empty() => return Ok(LiveCodes::new()),
        serde_json::Value::String(raw) => serde_json::from_str(&raw)
            .map_err(|e| DeviceError::Protocol(format!("lockCodes is not a code map: {e}")))?,
        other @ serde_json::Value::Object(_) => serde_json::from_value(other)
            .map_err(|e| DeviceError::Protocol(format!("lockCodes is not a code map: {e}")))?,
        other => {
            return Err(DeviceError::Protocol(format!(
                "lockCodes has unexpected type: {other}"
            )))
        }
    };

    let mut live = LiveCodes::new();
    for (key, entry) in entries {
        match key.parse::<Slot>() {
            Ok(slot) => {
                let holder = entry
                    .name
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| UNKNOWN_HOLDER.to_owned());
                live.insert(slot, holder);
            }
            Err(e) => warn!("ignoring lock code with non-numeric slot '{key}': {e}"),
        }
    }
    Ok(live)
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, DeviceError> {
        config.validate()?;
        let base = Url::parse(&config.url)
            .map_err(|e| DeviceError::Config(format!("invalid device url: {e}")))?;
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout()))
            .build();
        let agent = ureq::Agent::new_with_config(agent_config);
        Ok(Self {
            config,
            base,
            agent,
        })
    }

    fn device_url(&self, command: Option<(&str, &str)>) -> Result<Url, DeviceError> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                DeviceError::Config(format!("'{}' cannot be used as a base URL", self.base))
            })?;
            segments
                .pop_if_empty()
                .push("devices")
                .push(&self.config.device_id);
            if let Some((name, args)) = command {
                segments.push(name).push(args);
            }
        }
        if let Some(ref token) = self.config.access_token {
            url.query_pairs_mut().append_pair("access_token", token);
        }
        Ok(url)
    }

    fn do_get(&self, url: &Url) -> Result<Vec<u8>, DeviceError> {
        // Only the path is logged; the query carries the access token.
        debug!("GET {}", url.path());
        let resp = match self.agent.get(url.as_str()).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(code)) => {
                return Err(DeviceError::Unreachable(format!(
                    "HTTP {code} for {}",
                    url.path()
                )));
            }
            Err(e) => {
                return Err(DeviceError::Unreachable(e.to_string()));
            }
        };

        let code = resp.status().as_u16();
        if !(200..300).contains(&code) {
            return Err(DeviceError::Unreachable(format!(
                "HTTP {code} for {}",
                url.path()
            )));
        }

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| DeviceError::Unreachable(e.to_string()))?;
        Ok(body)
    }
}

impl DeviceGateway for HttpGateway {
    fn query_live_codes(&self) -> Result<LiveCodes, DeviceError> {
        let url = self.device_url(None)?;
        let body = self.do_get(&url)?;
        parse_lock_codes(&body)
    }

    fn set_code(&self, slot: Slot, code: &str, holder: &str) -> Result<(), DeviceError> {
        let args = format!("{slot},{code},{holder}");
        let url = self.device_url(Some(("setCode", &args)))?;
        self.do_get(&url)?;
        Ok(())
    }

    fn delete_code(&self, slot: Slot) -> Result<(), DeviceError> {
        let args = slot.to_string();
        let url = self.device_url(Some(("deleteCode", &args)))?;
        self.do_get(&url)?;
        Ok(())
    }
}
