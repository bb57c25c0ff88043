//! Field extraction for the service's inconsistent response envelopes.
//! Everything here is pure: same JSON in, same answer out.

use serde_json::Value;
use url::Url;

/// Keys that may carry the debug port, in priority order.
pub(crate) const PORT_KEYS: [&str; 4] = ["debug_port", "selenium_port", "port", "webdriver_port"];

/// Keys that may carry the websocket address, in priority order.
pub(crate) const WS_KEYS: [&str; 2] = ["ws_endpoint", "webdriver"];

const LIST_KEYS: [&str; 3] = ["data", "profiles", "list"];

/// A debug endpoint pulled out of one API record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFields {
    pub debug_port: u16,
    pub ws_endpoint: Option<String>,
}

/// Accepts the three observed port encodings: an integer, a bare numeric
/// string, and a `host:port` string. Zero and out-of-range values are
/// absent, never a default.
pub fn parse_port(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(to_port),
        Value::String(s) => {
            let s = s.trim();
            let tail = s.rsplit(':').next().unwrap_or(s);
            tail.parse::<u64>().ok().and_then(to_port)
        }
        _ => None,
    }
}

fn to_port(n: u64) -> Option<u16> {
    if n == 0 || n > u64::from(u16::MAX) {
        return None;
    }
    Some(n as u16)
}

/// Profile identifier, top level first, then under `data`.
pub fn extract_uuid(value: &Value) -> Option<&str> {
    if let Some(id) = value.get("uuid").and_then(Value::as_str)
        && !id.trim().is_empty()
    {
        return Some(id);
    }
    value
        .get("data")
        .and_then(|data| data.get("uuid"))
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
}

/// Walk the top-level object first, then its `data` object. The first source
/// with a parseable port wins, and the websocket address is taken from the
/// same source so the two never mix across envelope layers.
pub fn extract_endpoint(value: &Value) -> Option<EndpointFields> {
    for source in sources(value) {
        if let Some(port) = port_from_source(source) {
            return Some(EndpointFields {
                debug_port: port,
                ws_endpoint: ws_from_source(source),
            });
        }
    }
    None
}

/// Like `extract_endpoint`, but a record carrying only a websocket URL still
/// resolves by parsing the port out of that URL.
pub fn endpoint_from_record(value: &Value) -> Option<EndpointFields> {
    if let Some(found) = extract_endpoint(value) {
        return Some(found);
    }
    for source in sources(value) {
        if let Some(ws) = ws_from_source(source)
            && let Some(port) = port_from_ws_url(&ws)
        {
            return Some(EndpointFields {
                debug_port: port,
                ws_endpoint: Some(ws),
            });
        }
    }
    None
}

fn sources(value: &Value) -> impl Iterator<Item = &Value> {
    [Some(value), value.get("data")]
        .into_iter()
        .flatten()
        .filter(|source| source.is_object())
}

fn port_from_source(source: &Value) -> Option<u16> {
    for key in PORT_KEYS {
        if let Some(port) = source.get(key).and_then(parse_port) {
            return Some(port);
        }
    }
    // historical nesting: {"ws": {"selenium": <port>}}
    source
        .get("ws")
        .and_then(|ws| ws.get("selenium"))
        .and_then(parse_port)
}

fn ws_from_source(source: &Value) -> Option<String> {
    for key in WS_KEYS {
        if let Some(ws) = source.get(key).and_then(Value::as_str) {
            let ws = ws.trim();
            if !ws.is_empty() {
                return Some(ws.to_string());
            }
        }
    }
    None
}

pub fn port_from_ws_url(ws: &str) -> Option<u16> {
    Url::parse(ws).ok()?.port().filter(|port| *port > 0)
}

/// `{"success": true}` with a missing or null `data` is the service's way of
/// acknowledging a start without telling us anything useful.
pub fn is_accepted_without_data(value: &Value) -> bool {
    value.get("success").and_then(Value::as_bool) == Some(true)
        && value.get("data").is_none_or(Value::is_null)
}

/// Listings arrive bare or wrapped; the first wrapper key holding a
/// non-empty array wins.
pub fn profile_entries(listing: &Value) -> &[Value] {
    if let Some(entries) = listing.as_array() {
        return entries;
    }
    for key in LIST_KEYS {
        if let Some(entries) = listing.get(key).and_then(Value::as_array)
            && !entries.is_empty()
        {
            return entries;
        }
    }
    &[]
}

pub fn find_profile<'a>(listing: &'a Value, uuid: &str) -> Option<&'a Value> {
    profile_entries(listing)
        .iter()
        .find(|entry| extract_uuid(entry) == Some(uuid))
}

/// Recursively merge `overlay` into `base`: objects merge key-wise, anything
/// else in the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, other) => *slot = other.clone(),
    }
}

/// Copy of a payload safe for debug logging: any value whose key mentions
/// "password" is masked.
pub fn redact_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    if key.to_ascii_lowercase().contains("password") {
                        (key.clone(), Value::String("***".to_string()))
                    } else {
                        (key.clone(), redact_secrets(inner))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_secrets).collect()),
        other => other.clone(),
    }
}
