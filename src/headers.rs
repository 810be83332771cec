//! Header list handling and the header-compression boundary
//!
//! The engine treats HPACK as an external collaborator: encode takes an
//! ordered header field list and yields a block of bytes, decode does the
//! reverse. Compression state is connection-wide, so the encoder must only
//! be driven in wire-emission order and any decode failure poisons the
//! whole connection (COMPRESSION_ERROR), never just one stream.

use crate::error::{Error, Result};
use bytes::Bytes;
use hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};

/// A single header field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    /// Field name; pseudo-headers start with ':'
    pub name: String,
    /// Field value
    pub value: String,
}

impl HeaderField {
    /// Create a new header field
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderField {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Whether this is a pseudo-header (":method", ":path", ...)
    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }
}

/// Validate pseudo-header ordering: every pseudo-header must precede every
/// regular header (RFC 7540 Section 8.1.2.1).
pub fn validate_header_order(fields: &[HeaderField]) -> Result<()> {
    let mut seen_regular = false;
    for field in fields {
        if field.is_pseudo() {
            if seen_regular {
                return Err(Error::InvalidHeader(format!(
                    "pseudo-header {} after regular header",
                    field.name
                )));
            }
        } else {
            seen_regular = true;
        }
    }
    Ok(())
}

/// Validate a trailer list: trailers must carry no pseudo-headers.
pub fn validate_trailers(fields: &[HeaderField]) -> Result<()> {
    for field in fields {
        if field.is_pseudo() {
            return Err(Error::InvalidHeader(format!(
                "pseudo-header {} not allowed in trailers",
                field.name
            )));
        }
    }
    Ok(())
}

/// Stateful header block encoder
///
/// Lives inside the connection's writer critical section so that encode
/// order always matches emission order.
pub struct HeaderEncoder {
    encoder: HpackEncoder<'static>,
}

impl HeaderEncoder {
    /// Create a new encoder with a fresh dynamic table
    pub fn new() -> Self {
        HeaderEncoder {
            encoder: HpackEncoder::new(),
        }
    }

    /// Encode an ordered header field list into a header block.
    ///
    /// The list must already satisfy pseudo-header ordering; callers go
    /// through [`validate_header_order`] first.
    pub fn encode(&mut self, fields: &[HeaderField]) -> Result<Bytes> {
        let tuples: Vec<(&[u8], &[u8])> = fields
            .iter()
            .map(|f| (f.name.as_bytes(), f.value.as_bytes()))
            .collect();

        let mut block = Vec::new();
        self.encoder
            .encode_into(tuples, &mut block)
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;
        Ok(Bytes::from(block))
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateful header block decoder, owned by the connection's reader loop
pub struct HeaderDecoder {
    decoder: HpackDecoder<'static>,
}

impl HeaderDecoder {
    /// Create a new decoder with a fresh dynamic table
    pub fn new() -> Self {
        HeaderDecoder {
            decoder: HpackDecoder::new(),
        }
    }

    /// Decode a complete header block into an ordered field list.
    ///
    /// Failure here is unrecoverable for the connection.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>> {
        let decoded = self
            .decoder
            .decode(block)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?;

        Ok(decoded
            .into_iter()
            .map(|(name, value)| HeaderField {
                name: String::from_utf8_lossy(&name).into_owned(),
                value: String::from_utf8_lossy(&value).into_owned(),
            })
            .collect())
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_fields() -> Vec<HeaderField> {
        vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":path", "/index.html"),
            HeaderField::new(":scheme", "https"),
            HeaderField::new(":authority", "example.com"),
            HeaderField::new("accept", "text/html"),
        ]
    }

    #[test]
    fn test_pseudo_detection() {
        assert!(HeaderField::new(":method", "GET").is_pseudo());
        assert!(!HeaderField::new("accept", "*/*").is_pseudo());
    }

    #[test]
    fn test_header_order_valid() {
        assert!(validate_header_order(&request_fields()).is_ok());
    }

    #[test]
    fn test_header_order_violation() {
        let fields = vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new("accept", "*/*"),
            HeaderField::new(":path", "/"),
        ];
        assert!(matches!(
            validate_header_order(&fields),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_trailer_validation() {
        let trailers = vec![HeaderField::new("grpc-status", "0")];
        assert!(validate_trailers(&trailers).is_ok());

        let bad = vec![HeaderField::new(":status", "200")];
        assert!(matches!(
            validate_trailers(&bad),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = HeaderEncoder::new();
        let mut decoder = HeaderDecoder::new();

        let fields = request_fields();
        let block = encoder.encode(&fields).unwrap();
        assert!(!block.is_empty());

        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn test_decoder_state_carries_across_blocks() {
        let mut encoder = HeaderEncoder::new();
        let mut decoder = HeaderDecoder::new();

        let first = encoder.encode(&request_fields()).unwrap();
        let second = encoder.encode(&request_fields()).unwrap();

        // Repeating the same fields never grows the block; with dynamic
        // table hits it shrinks
        assert!(second.len() <= first.len());

        decoder.decode(&first).unwrap();
        let decoded = decoder.decode(&second).unwrap();
        assert_eq!(decoded, request_fields());
    }

    #[test]
    fn test_decode_garbage_is_compression_error() {
        let mut decoder = HeaderDecoder::new();
        // An indexed-field reference far past any table entry
        let result = decoder.decode(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(Error::Compression(_))));
    }
}
