//! Kafka wire protocol codec, client side.
//!
//! Handles framing and request/response header handling. Request and
//! response *bodies* are opaque here: encoding them is the codec
//! collaborator's job (see [`crate::request`]), and the connection never
//! looks inside them.
//!
//! # Wire Format
//!
//! ```text
//! Request:
//! ┌─────────────────┬────────────────────────────────────────────────┐
//! │  Length (4B)    │                  Payload                       │
//! │   big-endian    │  RequestHeader + RequestBody                   │
//! └─────────────────┴────────────────────────────────────────────────┘
//!
//! Response:
//! ┌─────────────────┬────────────────────────────────────────────────┐
//! │  Length (4B)    │                  Payload                       │
//! │   big-endian    │  ResponseHeader + ResponseBody                 │
//! └─────────────────┴────────────────────────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::{
    messages::{RequestHeader, ResponseHeader},
    protocol::{Decodable, Encodable, StrBytes},
};

use crate::error::{Error, Result};

/// Size of the length prefix on every frame.
pub const FRAME_HEADER_SIZE: usize = 4;

/// The ApiVersions request key.
///
/// Singled out because its responses always use header version 0, whatever
/// the request version: a client must be able to read the error code from a
/// broker that does not speak flexible versions yet.
pub const API_VERSIONS_KEY: i16 = 18;

/// Request header version for a request.
///
/// - v1: includes `client_id`
/// - v2: adds tagged fields (flexible versions)
#[must_use]
pub const fn request_header_version(flexible: bool) -> i16 {
    if flexible {
        2
    } else {
        1
    }
}

/// Response header version for a response to the given request.
///
/// v0 has just the correlation ID; v1 adds tagged fields. ApiVersions
/// responses stay on v0 forever (see [`API_VERSIONS_KEY`]).
#[must_use]
pub const fn response_header_version(api_key: i16, flexible: bool) -> i16 {
    if flexible && api_key != API_VERSIONS_KEY {
        1
    } else {
        0
    }
}

/// Write a length-prefixed frame to the buffer.
pub fn write_frame(buf: &mut BytesMut, payload: &[u8]) {
    // Frame sizes are bounded well below u32::MAX by Limits.
    #[allow(clippy::cast_possible_truncation)]
    let length = payload.len() as u32;
    buf.put_u32(length);
    buf.put_slice(payload);
}

/// Assemble a complete request frame: length prefix, header, body.
///
/// # Errors
///
/// Returns an error if header encoding fails.
pub fn encode_request_frame(
    buf: &mut BytesMut,
    api_key: i16,
    api_version: i16,
    flexible: bool,
    correlation_id: i32,
    client_id: Option<&str>,
    body: &[u8],
) -> Result<()> {
    let mut header = RequestHeader::default();
    header.request_api_key = api_key;
    header.request_api_version = api_version;
    header.correlation_id = correlation_id;
    header.client_id = client_id.map(|id| StrBytes::from_string(id.to_string()));

    let mut payload = BytesMut::new();
    header
        .encode(&mut payload, request_header_version(flexible))
        .map_err(Error::encode)?;
    payload.extend_from_slice(body);

    write_frame(buf, &payload);
    Ok(())
}

/// Read the correlation ID off the front of a response payload without
/// consuming anything.
///
/// # Errors
///
/// Returns an error if the payload is too short to carry one.
pub fn peek_correlation_id(payload: &[u8]) -> Result<i32> {
    if payload.len() < 4 {
        return Err(Error::Decode {
            message: format!("response too short for correlation ID: {} bytes", payload.len()),
        });
    }
    Ok(i32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

/// Decode a response header, returning the correlation ID and the body
/// bytes that follow it.
///
/// # Errors
///
/// Returns an error if header decoding fails.
pub fn decode_response_header(
    mut payload: Bytes,
    api_key: i16,
    flexible: bool,
) -> Result<(i32, Bytes)> {
    let version = response_header_version(api_key, flexible);
    let header = ResponseHeader::decode(&mut payload, version).map_err(Error::decode)?;
    Ok((header.correlation_id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_versions() {
        assert_eq!(request_header_version(false), 1);
        assert_eq!(request_header_version(true), 2);

        assert_eq!(response_header_version(0, false), 0);
        assert_eq!(response_header_version(0, true), 1);
        // ApiVersions responses are always header v0.
        assert_eq!(response_header_version(API_VERSIONS_KEY, true), 0);
        assert_eq!(response_header_version(API_VERSIONS_KEY, false), 0);
    }

    #[test]
    fn test_write_frame() {
        let mut buf = BytesMut::new();
        write_frame(&mut buf, b"hello");

        assert_eq!(buf.len(), 9); // 4 (length) + 5 (payload).
        assert_eq!(&buf[0..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..9], b"hello");
    }

    #[test]
    fn test_encode_request_frame_round_trips_header() {
        let mut buf = BytesMut::new();
        encode_request_frame(&mut buf, 3, 4, false, 77, Some("kite-test"), b"body").unwrap();

        // Strip the length prefix and decode the header back.
        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let mut payload = Bytes::copy_from_slice(&buf[4..]);
        assert_eq!(payload.len(), declared);

        let header = RequestHeader::decode(&mut payload, 1).unwrap();
        assert_eq!(header.request_api_key, 3);
        assert_eq!(header.request_api_version, 4);
        assert_eq!(header.correlation_id, 77);
        assert_eq!(header.client_id.as_ref().map(|id| id.as_str()), Some("kite-test"));
        assert_eq!(&payload[..], b"body");
    }

    #[test]
    fn test_peek_correlation_id() {
        let payload = [0x00, 0x00, 0x30, 0x39, 0xaa]; // 12345 + trailing byte
        assert_eq!(peek_correlation_id(&payload).unwrap(), 12345);

        assert!(peek_correlation_id(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_decode_response_header_returns_body() {
        let mut payload = BytesMut::new();
        let mut header = ResponseHeader::default();
        header.correlation_id = 42;
        header.encode(&mut payload, 0).unwrap();
        payload.put_slice(b"rest");

        let (correlation_id, body) =
            decode_response_header(payload.freeze(), 0, false).unwrap();
        assert_eq!(correlation_id, 42);
        assert_eq!(&body[..], b"rest");
    }
}
