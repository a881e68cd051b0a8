//! Minimal JetStream-style management API client for the "delete and
//! recreate" ordered-consumer recovery path.
//!
//! Only the two calls the stream layer itself needs are modeled here —
//! consumer create and delete — issued as JSON requests over the same
//! request/reply path ordinary requests use. A full management API
//! (streams, accounts, purge, ...) is out of scope.

use crate::connection::Connection;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct DeliverPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
}

/// Subset of the JetStream `ConsumerConfig` JSON shape the client side
/// needs to create a push or pull consumer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsumerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    pub ack_policy: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_wait: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_heartbeat: Option<i64>,
    #[serde(skip_serializing_if = "is_false")]
    pub flow_control: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            deliver_subject: None,
            ack_policy: "explicit",
            ack_wait: None,
            max_deliver: None,
            idle_heartbeat: None,
            flow_control: false,
            opt_start_seq: None,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct CreateConsumerRequest<'a> {
    stream_name: &'a str,
    config: ConsumerConfig,
}

#[derive(Debug, serde::Deserialize)]
struct ApiError {
    description: String,
}

#[derive(Debug, serde::Deserialize)]
struct CreateConsumerResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, serde::Deserialize)]
struct GenericApiResponse {
    #[serde(default)]
    error: Option<ApiError>,
}

fn is_false(b: &bool) -> bool {
    !b
}

const JS_API_PREFIX: &str = "$JS.API";
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(5);

/// Thin wrapper over [`Connection::request`] for the JetStream
/// management subjects.
pub struct JsApi {
    conn: Arc<Connection>,
    api_prefix: String,
}

impl JsApi {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            api_prefix: JS_API_PREFIX.to_string(),
        }
    }

    /// Create (or bind to, if durable and already present) a consumer on
    /// `stream`, returning the server-assigned consumer name.
    pub fn create_consumer(&self, stream: &str, config: ConsumerConfig) -> Result<String> {
        let subject = match &config.durable_name {
            Some(name) => format!("{}.CONSUMER.DURABLE.CREATE.{stream}.{name}", self.api_prefix),
            None => format!("{}.CONSUMER.CREATE.{stream}", self.api_prefix),
        };
        let body = CreateConsumerRequest {
            stream_name: stream,
            config,
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| Error::protocol_error(format!("encoding consumer create request: {e}")))?;
        let reply = self.conn.request(&subject, &payload, DEFAULT_API_TIMEOUT)?;
        let parsed: CreateConsumerResponse = serde_json::from_slice(reply.payload())
            .map_err(|e| Error::protocol_error(format!("decoding consumer create response: {e}")))?;
        if let Some(err) = parsed.error {
            return Err(Error::not_supported_by_server(err.description));
        }
        Ok(parsed.name)
    }

    pub fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<()> {
        let subject = format!("{}.CONSUMER.DELETE.{stream}.{consumer}", self.api_prefix);
        let reply = self.conn.request(&subject, b"", DEFAULT_API_TIMEOUT)?;
        let parsed: GenericApiResponse = serde_json::from_slice(reply.payload())
            .map_err(|e| Error::protocol_error(format!("decoding consumer delete response: {e}")))?;
        if let Some(err) = parsed.error {
            return Err(Error::not_supported_by_server(err.description));
        }
        Ok(())
    }
}
