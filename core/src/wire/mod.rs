//! The wire codec: tokenizing inbound frames and producing outbound ones
//! for the text framing protocol.

pub mod event;
pub mod headers;
pub mod parser;
pub mod writer;

pub use event::{ConnectPayload, ServerInfo, ServerOp};
pub use headers::HeaderMap;
pub use parser::Parser;
