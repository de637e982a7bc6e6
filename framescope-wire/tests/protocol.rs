//! Protocol-level tests: framing recovery against literal byte streams and
//! encode/decode identity swept over generated values.

use framescope_wire::{
    next_message, write_response, Decode, Encode, InputStream, OutputStream, Request,
    ResponseType, APPLICATION_ID, PROTOCOL_MARK,
};

#[test]
fn corrupted_prefix_then_stop_message_yields_exactly_one_request() {
    // 0xAB 0xCD [mark] [len=16] [app] [type=Stop] [8-byte payload]
    let mut bytes = vec![0xAB, 0xCD];
    bytes.extend_from_slice(&PROTOCOL_MARK.to_le_bytes());
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&APPLICATION_ID.to_le_bytes());
    bytes.extend_from_slice(&Request::TYPE_STOP.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 8]);

    let mut input = InputStream::new();
    input.append(&bytes);

    let message = next_message(&mut input).expect("one frame");
    assert_eq!(message.application_id, APPLICATION_ID);
    assert_eq!(Request::parse(&message).unwrap(), Request::Stop);

    // The garbage prefix is gone and nothing else is pending.
    assert_eq!(next_message(&mut input), None);
    assert!(input.is_empty());
}

#[test]
fn byte_dribble_delivers_every_message() {
    // Feed two back-to-back frames one byte at a time; the scanner must
    // produce both, in order, regardless of append granularity.
    let mut stream = Vec::new();
    for message_type in [Request::TYPE_STOP, Request::TYPE_TURN_SAMPLING] {
        let payload: &[u8] = if message_type == Request::TYPE_TURN_SAMPLING {
            &[1, 0, 0, 0, 1]
        } else {
            &[]
        };
        stream.extend_from_slice(&PROTOCOL_MARK.to_le_bytes());
        stream.extend_from_slice(&(8 + payload.len() as u32).to_le_bytes());
        stream.extend_from_slice(&APPLICATION_ID.to_le_bytes());
        stream.extend_from_slice(&message_type.to_le_bytes());
        stream.extend_from_slice(payload);
    }

    let mut input = InputStream::new();
    let mut decoded = Vec::new();
    for byte in stream {
        input.append(&[byte]);
        while let Some(message) = next_message(&mut input) {
            decoded.push(Request::parse(&message).unwrap());
        }
    }
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0], Request::Stop);
    match decoded[1] {
        Request::TurnSampling(ts) => {
            assert_eq!(ts.index, 1);
            assert!(ts.enabled);
        }
        ref other => panic!("expected TurnSampling, got {other:?}"),
    }
}

#[test]
fn every_response_type_round_trips_through_framing() {
    let all = [
        ResponseType::FrameDescriptionBoard,
        ResponseType::EventFrame,
        ResponseType::SamplingFrame,
        ResponseType::NullFrame,
        ResponseType::ReportProgress,
        ResponseType::Handshake,
        ResponseType::SynchronizationData,
        ResponseType::TagsPack,
        ResponseType::CallstackDescriptionBoard,
        ResponseType::CallstackPack,
        ResponseType::SummaryPack,
        ResponseType::FiberSynchronizationData,
        ResponseType::SyscallPack,
    ];
    for ty in all {
        assert_eq!(ResponseType::from_code(ty.code()), Some(ty));

        let payload = [ty.code() as u8, 1, 2, 3];
        let bytes = write_response(ty, &payload);
        let mut input = InputStream::new();
        input.append(&bytes);
        let message = next_message(&mut input).expect("framed response");
        assert_eq!(message.message_type, ty.code());

        let mut body = InputStream::from_bytes(&message.payload);
        let _version = body.read_u32().unwrap();
        assert_eq!(body.read_u32().unwrap() as usize, payload.len());
        assert_eq!(body.read_u16().unwrap(), ty.code());
        assert_eq!(body.read_u16().unwrap(), APPLICATION_ID);
        assert_eq!(body.read_bytes(payload.len()).unwrap(), payload);
        assert!(body.is_empty());
    }
}

/// A cheap deterministic value sweep; xorshift so the test needs no crates.
struct Sweep(u64);

impl Sweep {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
    let mut out = OutputStream::new();
    value.encode(&mut out);
    let mut input = InputStream::from_bytes(out.as_bytes());
    assert_eq!(T::decode(&mut input).unwrap(), value);
    assert!(input.is_empty());
}

#[test]
fn primitive_encodings_are_invertible_over_a_value_sweep() {
    let mut sweep = Sweep(0x9E37_79B9_7F4A_7C15);
    for _ in 0..500 {
        let word = sweep.next();
        round_trip(word as u8);
        round_trip(word as u16);
        round_trip(word as u32);
        round_trip(word as i32);
        round_trip(word);
        round_trip(word as i64);
        round_trip(f32::from_bits((word as u32) & 0x7F7F_FFFF)); // finite floats
    }
}

#[test]
fn string_and_vector_encodings_are_invertible() {
    let mut sweep = Sweep(42);
    for _ in 0..100 {
        let len = (sweep.next() % 64) as usize;
        let text: String = (0..len)
            .map(|_| char::from_u32((sweep.next() % 0x24FF).max(1) as u32).unwrap_or('x'))
            .collect();
        round_trip(text);

        let numbers: Vec<u64> = (0..(sweep.next() % 32)).map(|_| sweep.next()).collect();
        round_trip(numbers);
    }
}
