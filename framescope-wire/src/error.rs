use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The stream ended in the middle of a value.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A frame header carried a length that cannot describe a valid frame.
    #[error("invalid frame length {0:#x}")]
    BadLength(u32),

    /// The message type code is not part of the protocol.
    #[error("unknown message type {0:#x}")]
    UnknownMessageType(u16),

    /// A message body needed more bytes than its frame contained. The
    /// stream can no longer be trusted; the connection should be dropped.
    #[error("message body exceeds its frame")]
    StreamCorrupt,

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    BadUtf8,
}
