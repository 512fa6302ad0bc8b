//! Wire codec: deterministic big-endian binary layout for any serde type.
//!
//! Layout: fields in declaration order, no tags or field names. Integers and
//! floats are fixed width big-endian, `bool` is one byte, text, sequences,
//! byte buffers and maps carry a 4-byte big-endian length prefix, fixed
//! arrays and tuples carry none. `Option` is a one-byte tag, enum variants a
//! 4-byte index. The format is not self describing; both ends must share the
//! schema.

mod de;
mod ser;

pub use de::Decoder;
pub use ser::Encoder;

use serde::{Deserialize, Serialize};

/// Size of every length prefix (sequence, text, map).
pub const LEN_SIZE: usize = 4;

/// Encode a value into its wire bytes.
pub fn encode<T: ?Sized + Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder::new();
    value.serialize(&mut encoder)?;
    Ok(encoder.into_inner())
}

/// Decode a value from the front of `bytes`. Trailing bytes (e.g. packet padding) are ignored.
pub fn decode<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, CodecError> {
    let mut decoder = Decoder::new(bytes);
    T::deserialize(&mut decoder)
}

/// Decode a value that must span `bytes` exactly.
pub fn decode_exact<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, CodecError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::deserialize(&mut decoder)?;
    match decoder.remaining() {
        0 => Ok(value),
        n => Err(CodecError::TrailingBytes(n)),
    }
}

/// Error encoding or decoding wire bytes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("length {0} does not fit a 4-byte prefix")]
    LengthOverflow(usize),
    #[error("sequence length must be known up front")]
    UnknownLength,
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),
    #[error("invalid option tag {0}")]
    InvalidOptionTag(u8),
    #[error("invalid char {0:#x}")]
    InvalidChar(u32),
    #[error("invalid utf-8 text: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("wire format is not self describing")]
    NotSelfDescribing,
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("{0}")]
    Custom(String),
}

impl serde::ser::Error for CodecError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        CodecError::Custom(msg.to_string())
    }
}

impl serde::de::Error for CodecError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        CodecError::Custom(msg.to_string())
    }
}

/// Serde adapter for byte arrays of any length, written verbatim (no length prefix).
/// Use with `#[serde(with = "codec::fixed_bytes")]`.
pub mod fixed_bytes {
    use std::fmt;

    use serde::de::{self, SeqAccess, Visitor};
    use serde::ser::SerializeTuple;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        v: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(N)?;
        for b in v {
            tuple.serialize_element(b)?;
        }
        tuple.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        d.deserialize_tuple(N, FixedVisitor::<N>)
    }

    struct FixedVisitor<const N: usize>;

    impl<'de, const N: usize> Visitor<'de> for FixedVisitor<N> {
        type Value = [u8; N];

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "{N} bytes")
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<[u8; N], A::Error> {
            let mut out = [0u8; N];
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(i, &self))?;
            }
            Ok(out)
        }
    }
}
