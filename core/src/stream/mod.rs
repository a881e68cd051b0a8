//! Stream (JetStream-like) consumer layer.

pub mod api;
pub mod consumer;
pub mod metadata;
pub mod puback;
pub mod pull;

pub use consumer::{PushConsumer, PushConsumerOptions};
pub use metadata::JsMsgMetadata;
pub use puback::{PubAck, PublishAckCorrelator};
pub use pull::{PullConsumer, PullOptions};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::Message;

pub(crate) const ACK_WORD: &[u8] = b"+ACK";
pub(crate) const NAK_WORD: &[u8] = b"-NAK";
pub(crate) const IN_PROGRESS_WORD: &[u8] = b"+WPI";
pub(crate) const TERM_WORD: &[u8] = b"+TERM";

/// Publish `word` to `msg`'s reply subject — the shared mechanics
/// behind `ack`/`nak`/`in_progress`/`term` for both push and pull
/// consumers.
pub(crate) fn respond_with_word(conn: &Connection, msg: &Message, word: &[u8]) -> Result<()> {
    let reply = msg
        .reply()
        .ok_or_else(|| Error::illegal_state("message has no reply subject to ack"))?;
    conn.publish(reply, None, word, None)
}
