use crate::{InputStream, WireError};

/// Marks the start of every framed message, in both directions.
pub const PROTOCOL_MARK: u32 = 0xB50F_B50F;

/// Identifies the profiler protocol family inside a frame.
pub const APPLICATION_ID: u16 = 0xB50F;

/// Envelope version understood by the GUI decoder.
pub const PROTOCOL_VERSION: u32 = 22;

/// First TCP port the server tries to bind.
pub const DEFAULT_PORT: u16 = 31313;

/// Number of consecutive ports probed, starting at [`DEFAULT_PORT`].
pub const PORT_RANGE: u16 = 4;

/// Upper bound on a single frame. Anything larger is treated as a framing
/// error so a corrupted length field cannot stall the stream forever.
pub const MAX_FRAME_LENGTH: u32 = 64 * 1024 * 1024;

/// The frame body length field covers everything after the mark: the length
/// field itself, the application id, the message type and the payload.
const FRAME_OVERHEAD: u32 = 8;

/// Server → client message kinds, with their stable wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    FrameDescriptionBoard,
    EventFrame,
    SamplingFrame,
    NullFrame,
    ReportProgress,
    Handshake,
    SynchronizationData,
    TagsPack,
    CallstackDescriptionBoard,
    CallstackPack,
    SummaryPack,
    FiberSynchronizationData,
    SyscallPack,
}

impl ResponseType {
    pub fn code(self) -> u16 {
        match self {
            ResponseType::FrameDescriptionBoard => 0,
            ResponseType::EventFrame => 1,
            ResponseType::SamplingFrame => 2,
            ResponseType::NullFrame => 3,
            ResponseType::ReportProgress => 4,
            ResponseType::Handshake => 5,
            ResponseType::SynchronizationData => 7,
            ResponseType::TagsPack => 8,
            ResponseType::CallstackDescriptionBoard => 9,
            ResponseType::CallstackPack => 10,
            ResponseType::SummaryPack => 12,
            ResponseType::FiberSynchronizationData => 256,
            ResponseType::SyscallPack => 257,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        let ty = match code {
            0 => ResponseType::FrameDescriptionBoard,
            1 => ResponseType::EventFrame,
            2 => ResponseType::SamplingFrame,
            3 => ResponseType::NullFrame,
            4 => ResponseType::ReportProgress,
            5 => ResponseType::Handshake,
            7 => ResponseType::SynchronizationData,
            8 => ResponseType::TagsPack,
            9 => ResponseType::CallstackDescriptionBoard,
            10 => ResponseType::CallstackPack,
            12 => ResponseType::SummaryPack,
            256 => ResponseType::FiberSynchronizationData,
            257 => ResponseType::SyscallPack,
            _ => return None,
        };
        Some(ty)
    }
}

/// One framed message pulled off the byte stream. The payload is the raw
/// body; interpreting it is up to the message layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub application_id: u16,
    pub message_type: u16,
    pub payload: Vec<u8>,
}

/// Try to extract the next framed message from `input`.
///
/// Bytes that do not look like a frame are discarded one at a time until a
/// valid mark is found (resynchronization). Returns `None` when the buffer
/// holds no complete frame yet; more socket data must be appended before
/// trying again.
pub fn next_message(input: &mut InputStream) -> Option<RawMessage> {
    loop {
        if input.len() < 8 {
            return None;
        }

        let mark = input.peek_u32(0).expect("checked length above");
        if mark != PROTOCOL_MARK {
            input.skip(1);
            continue;
        }

        let length = input.peek_u32(4).expect("checked length above");
        if length < FRAME_OVERHEAD || length > MAX_FRAME_LENGTH {
            log::warn!("dropping frame candidate with bad length {length:#x}");
            input.skip(1);
            continue;
        }

        // The mark is not counted by the length field.
        if input.len() < 4 + length as usize {
            return None;
        }

        input.skip(4); // mark
        input.skip(4); // length
        let application_id = input.read_u16().expect("frame body is buffered");
        let message_type = input.read_u16().expect("frame body is buffered");
        let payload = input
            .read_bytes((length - FRAME_OVERHEAD) as usize)
            .expect("frame body is buffered");

        return Some(RawMessage {
            application_id,
            message_type,
            payload,
        });
    }
}

/// Build the complete wire bytes for one server → client message: the frame
/// header followed by the response envelope and the payload.
pub fn write_response(ty: ResponseType, payload: &[u8]) -> Vec<u8> {
    let envelope_len = 12u32; // version + payload_size + type + app_id
    let body_len = FRAME_OVERHEAD + envelope_len + payload.len() as u32;

    let mut out = Vec::with_capacity(4 + body_len as usize);
    out.extend_from_slice(&PROTOCOL_MARK.to_le_bytes());
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&APPLICATION_ID.to_le_bytes());
    out.extend_from_slice(&ty.code().to_le_bytes());

    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&ty.code().to_le_bytes());
    out.extend_from_slice(&APPLICATION_ID.to_le_bytes());
    out.extend_from_slice(payload);
    out
}
