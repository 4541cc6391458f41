//! Typed payload serialization.
//!
//! Typed sends serialize a value and append the configured delimiter so the
//! remote reader can split its stream. The serialized form must not contain
//! the delimiter itself; that is up to the serializer and is not checked.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::Result;

/// Turns typed values into payload bytes.
pub trait PayloadSerializer {
    /// Serialize `value`.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;
}

/// Compact single-line JSON via `serde_json`.
///
/// Compact JSON never contains a raw `\r` or `\n`, so it is safe with the
/// default `"\r\n"` delimiter.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }
}

/// Append `delimiter` to `payload`.
pub fn frame(payload: &[u8], delimiter: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(payload.len() + delimiter.len());
    framed.put_slice(payload);
    framed.put_slice(delimiter);
    framed.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Quote {
        symbol: &'static str,
        price: f64,
        note: &'static str,
    }

    #[test]
    fn test_json_is_single_line() {
        let quote = Quote {
            symbol: "ABC",
            price: 1.5,
            note: "line one\nline two",
        };
        let bytes = JsonSerializer.serialize(&quote).unwrap();
        assert!(!bytes.contains(&b'\n'));
        assert!(!bytes.contains(&b'\r'));
    }

    #[test]
    fn test_frame_appends_delimiter() {
        let framed = frame(br#"{"a":1}"#, b"\r\n");
        assert_eq!(&framed[..], b"{\"a\":1}\r\n");
        assert_eq!(&frame(b"", b"|")[..], b"|");
    }
}
