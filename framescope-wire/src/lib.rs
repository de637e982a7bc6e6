//! Binary stream encoding and message framing for the framescope profiler
//! protocol.
//!
//! This crate is deliberately free of profiler logic: it knows how to turn
//! primitives, strings and sequences into the little-endian stream format,
//! how to wrap payloads into `0xB50FB50F`-marked frames, and how to pull
//! framed client requests back out of a byte stream, resynchronizing past
//! garbage. Both the instrumentation library (`framescope`) and a GUI
//! decoder can build on it.

mod error;
mod frame;
mod request;
mod stream;
mod value;

pub use error::WireError;
pub use frame::{
    next_message, write_response, RawMessage, ResponseType, APPLICATION_ID, DEFAULT_PORT,
    MAX_FRAME_LENGTH, PORT_RANGE, PROTOCOL_MARK, PROTOCOL_VERSION,
};
pub use request::{Request, StartRequest, TurnSamplingRequest};
pub use stream::{InputStream, OutputStream};
pub use value::{Decode, Encode};
