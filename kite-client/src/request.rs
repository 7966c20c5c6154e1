//! The codec collaborator contract.
//!
//! The connection multiplexer never interprets body bytes; everything it
//! needs to know about a message is here: the request key, the version
//! range the codec can encode, and where flexible (tagged-field) encoding
//! begins. Bodies come from the `kafka-protocol` crate.
//!
//! Only the messages the connection core itself speaks are bridged here
//! (ApiVersions and the SASL pair), plus Metadata because every diagnostic
//! and test wants it. Higher layers bridge their own messages the same way.

use bytes::{Bytes, BytesMut};
use kafka_protocol::{
    messages::{
        ApiVersionsRequest, ApiVersionsResponse, MetadataRequest, MetadataResponse,
        SaslAuthenticateRequest, SaslAuthenticateResponse, SaslHandshakeRequest,
        SaslHandshakeResponse,
    },
    protocol::{Decodable, Encodable},
};

use crate::error::{Error, Result};

/// The highest request key this client's codec bridge knows about.
///
/// Requests with keys above this cannot be encoded by anyone we know, which
/// is a different failure from a broker that merely predates the key.
pub const MAX_REQUEST_KEY: i16 = 51;

/// A request the codec library can encode, paired with its reply type.
pub trait ClientRequest: Encodable {
    /// The decoded reply.
    type Response: Decodable;

    /// Protocol request key.
    const KEY: i16;
    /// Lowest version the codec can encode.
    const MIN_VERSION: i16;
    /// Highest version the codec can encode.
    const MAX_VERSION: i16;
    /// First version using flexible encoding, or `i16::MAX` if none.
    const FLEXIBLE_FROM: i16;

    /// True if `version` of this message uses flexible encoding.
    #[must_use]
    fn is_flexible(version: i16) -> bool {
        version >= Self::FLEXIBLE_FROM
    }
}

impl ClientRequest for ApiVersionsRequest {
    type Response = ApiVersionsResponse;
    const KEY: i16 = 18;
    const MIN_VERSION: i16 = 0;
    const MAX_VERSION: i16 = 3;
    const FLEXIBLE_FROM: i16 = 3;
}

impl ClientRequest for SaslHandshakeRequest {
    type Response = SaslHandshakeResponse;
    const KEY: i16 = 17;
    const MIN_VERSION: i16 = 0;
    const MAX_VERSION: i16 = 1;
    const FLEXIBLE_FROM: i16 = i16::MAX;
}

impl ClientRequest for SaslAuthenticateRequest {
    type Response = SaslAuthenticateResponse;
    const KEY: i16 = 36;
    const MIN_VERSION: i16 = 0;
    const MAX_VERSION: i16 = 2;
    const FLEXIBLE_FROM: i16 = 2;
}

impl ClientRequest for MetadataRequest {
    type Response = MetadataResponse;
    const KEY: i16 = 3;
    const MIN_VERSION: i16 = 0;
    const MAX_VERSION: i16 = 12;
    const FLEXIBLE_FROM: i16 = 9;
}

/// Encode a request body at the chosen version.
pub(crate) fn encode_body<R: ClientRequest>(req: &R, version: i16) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    req.encode(&mut buf, version).map_err(Error::encode)?;
    Ok(buf.freeze())
}

/// Decode a response body at the version the request went out with.
pub(crate) fn decode_body<R: ClientRequest>(mut body: Bytes, version: i16) -> Result<R::Response> {
    R::Response::decode(&mut body, version).map_err(Error::decode)
}
