//! Parsed inbound/outbound protocol events.

use crate::wire::headers::HeaderMap;

/// A fully-parsed inbound protocol event, produced by [`super::parser::Parser`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Vec<u8>,
    },
    Hmsg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        headers: HeaderMap,
        payload: Vec<u8>,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// The `INFO` JSON payload, deserialized.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ServerInfo {
    pub server_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proto: i64,
    #[serde(default = "default_max_payload")]
    pub max_payload: i64,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub ldm: bool,
}

fn default_max_payload() -> i64 {
    1024 * 1024
}

/// The `CONNECT` JSON payload, serialized.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConnectPayload {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    pub name: String,
    pub lang: &'static str,
    pub version: &'static str,
    pub protocol: i64,
    pub echo: bool,
    pub headers: bool,
    pub no_responders: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
}
