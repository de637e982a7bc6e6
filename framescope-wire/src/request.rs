use crate::{InputStream, RawMessage, WireError};

/// Requests a capture start with the client's settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartRequest {
    pub mode: u32,
    pub category_mask: u32,
    pub sampling_frequency: u32,
    pub time_limit_us: u32,
    pub frame_limit: u32,
    pub memory_limit_mb: u32,
    /// Base64-encoded credential for tracers that need elevation.
    pub password: String,
}

/// Legacy sampling toggle, kept for protocol compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSamplingRequest {
    pub index: i32,
    pub enabled: bool,
}

/// A decoded client → server request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Start(StartRequest),
    Stop,
    TurnSampling(TurnSamplingRequest),
}

impl Request {
    pub const TYPE_START: u16 = 0;
    pub const TYPE_STOP: u16 = 1;
    pub const TYPE_TURN_SAMPLING: u16 = 2;

    /// Interpret a framed message as a request.
    ///
    /// A request that reads past the end of its frame means the stream can
    /// no longer be trusted ([`WireError::StreamCorrupt`]). A parser that
    /// consumes less than the frame is fine; trailing bytes are ignored, so
    /// newer clients may grow messages compatibly.
    pub fn parse(message: &RawMessage) -> Result<Request, WireError> {
        let mut body = InputStream::from_bytes(&message.payload);
        let request = match message.message_type {
            Self::TYPE_START => {
                let mut start = StartRequest {
                    mode: Self::field(&mut body)?,
                    category_mask: Self::field(&mut body)?,
                    sampling_frequency: Self::field(&mut body)?,
                    time_limit_us: Self::field(&mut body)?,
                    frame_limit: Self::field(&mut body)?,
                    memory_limit_mb: Self::field(&mut body)?,
                    password: String::new(),
                };
                start.password = body.read_string().map_err(|_| WireError::StreamCorrupt)?;
                Request::Start(start)
            }
            Self::TYPE_STOP => Request::Stop,
            Self::TYPE_TURN_SAMPLING => {
                let index = body.read_i32().map_err(|_| WireError::StreamCorrupt)?;
                let enabled = body.read_u8().map_err(|_| WireError::StreamCorrupt)? != 0;
                Request::TurnSampling(TurnSamplingRequest { index, enabled })
            }
            other => return Err(WireError::UnknownMessageType(other)),
        };
        Ok(request)
    }

    fn field(body: &mut InputStream) -> Result<u32, WireError> {
        body.read_u32().map_err(|_| WireError::StreamCorrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OutputStream, APPLICATION_ID};

    fn message(message_type: u16, payload: Vec<u8>) -> RawMessage {
        RawMessage {
            application_id: APPLICATION_ID,
            message_type,
            payload,
        }
    }

    #[test]
    fn parses_start() {
        let mut payload = OutputStream::new();
        for value in [0x2Eu32, 0xFFFF_FFFF, 1000, 0, 0, 0] {
            payload.write_u32(value);
        }
        payload.write_str("c2VjcmV0");

        let request = Request::parse(&message(Request::TYPE_START, payload.into_bytes())).unwrap();
        match request {
            Request::Start(start) => {
                assert_eq!(start.mode, 0x2E);
                assert_eq!(start.category_mask, 0xFFFF_FFFF);
                assert_eq!(start.sampling_frequency, 1000);
                assert_eq!(start.password, "c2VjcmV0");
            }
            other => panic!("expected Start, got {other:?}"),
        }
    }

    #[test]
    fn stop_ignores_extra_payload() {
        let request = Request::parse(&message(Request::TYPE_STOP, vec![0; 8])).unwrap();
        assert_eq!(request, Request::Stop);
    }

    #[test]
    fn unknown_type_is_rejected_without_corruption() {
        let err = Request::parse(&message(42, Vec::new())).unwrap_err();
        assert_eq!(err, WireError::UnknownMessageType(42));
    }

    #[test]
    fn truncated_start_is_corrupt() {
        let err = Request::parse(&message(Request::TYPE_START, vec![0; 10])).unwrap_err();
        assert_eq!(err, WireError::StreamCorrupt);
    }
}
