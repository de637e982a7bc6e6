use crate::{InputStream, OutputStream, WireError};

/// A value with a defined encoding in the stream format.
pub trait Encode {
    fn encode(&self, out: &mut OutputStream);
}

/// A value that can be read back out of the stream format.
///
/// The instrumentation side only ever encodes most telemetry types; decode
/// impls exist for everything a client sends and for round-trip testing.
pub trait Decode: Sized {
    fn decode(input: &mut InputStream) -> Result<Self, WireError>;
}

macro_rules! primitive_impls {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, out: &mut OutputStream) {
                    out.$write(*self);
                }
            }

            impl Decode for $ty {
                fn decode(input: &mut InputStream) -> Result<Self, WireError> {
                    input.$read()
                }
            }
        )*
    };
}

primitive_impls! {
    u8 => write_u8, read_u8;
    i8 => write_i8, read_i8;
    u16 => write_u16, read_u16;
    i16 => write_i16, read_i16;
    u32 => write_u32, read_u32;
    i32 => write_i32, read_i32;
    u64 => write_u64, read_u64;
    i64 => write_i64, read_i64;
    f32 => write_f32, read_f32;
}

impl Encode for str {
    fn encode(&self, out: &mut OutputStream) {
        out.write_str(self);
    }
}

impl Encode for String {
    fn encode(&self, out: &mut OutputStream) {
        out.write_str(self);
    }
}

impl Decode for String {
    fn decode(input: &mut InputStream) -> Result<Self, WireError> {
        input.read_string()
    }
}

/// Sequences encode as `u32 count` followed by the elements in order.
/// Memory pools share this encoding: size, then elements in insertion order.
impl<T: Encode> Encode for [T] {
    fn encode(&self, out: &mut OutputStream) {
        out.write_u32(self.len() as u32);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, out: &mut OutputStream) {
        self.as_slice().encode(out);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &mut InputStream) -> Result<Self, WireError> {
        let count = input.read_u32()? as usize;
        let mut items = Vec::with_capacity(count.min(input.len()));
        for _ in 0..count {
            items.push(T::decode(input)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
        let mut out = OutputStream::new();
        value.encode(&mut out);
        let mut input = InputStream::from_bytes(out.as_bytes());
        assert_eq!(T::decode(&mut input).unwrap(), value);
        assert!(input.is_empty());
    }

    #[test]
    fn encode_decode_identity() {
        round_trip(0u8);
        round_trip(u16::MAX);
        round_trip(-123i32);
        round_trip(u32::MAX);
        round_trip(i64::MIN);
        round_trip(0.25f32);
        round_trip("scene/render".to_string());
        round_trip(vec![1u32, 2, 3, 4]);
        round_trip(Vec::<u64>::new());
        round_trip(vec!["a".to_string(), String::new(), "ccc".to_string()]);
    }

    #[test]
    fn vector_prefixes_count() {
        let mut out = OutputStream::new();
        vec![7u16, 9].encode(&mut out);
        assert_eq!(out.as_bytes(), &[2, 0, 0, 0, 7, 0, 9, 0]);
    }

    #[test]
    fn truncated_vector_reports_eof() {
        let mut out = OutputStream::new();
        vec![1u64, 2, 3].encode(&mut out);
        let bytes = out.as_bytes();
        let mut input = InputStream::from_bytes(&bytes[..bytes.len() - 1]);
        assert_eq!(Vec::<u64>::decode(&mut input), Err(WireError::UnexpectedEof));
    }
}
