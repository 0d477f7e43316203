//! Shard Wire Protocol
//!
//! The binary request/response protocol spoken on every client ↔ shard link.
//!
//! ## Frame Layout (all integers big-endian `u32`)
//! - **Request**: `command`, `argc`, `argc × (len, bytes)`, `END`.
//! - **Response**: `ack`, `argc`, `argc × (len, bytes)`, `END`.
//! - **Streaming response**: `STREAM`, `record_count`, each record as
//!   `field_count, field_count × (len, bytes)`, then `END`.
//!
//! Requests and responses strictly alternate on a connection; the client must
//! consume the end marker before sending the next request. Anything that does not
//! match the expected ack, count or end marker is a `ProtocolError`.

pub mod codec;
pub mod message;

pub use codec::{
    encode_request, encode_response, read_request, read_response, read_stream_header, read_stream_record, read_end_marker,
    write_request, write_response, write_stream_end, write_stream_header, write_stream_record,
    ProtocolError, END_OF_MESSAGE, MAX_ARG_LEN,
};
pub use message::{AckCode, Command, Request, Response};
