//! Integration tests for the connection core.
//!
//! Each test drives the real client against a scripted broker speaking the
//! Kafka wire protocol over real TCP: negotiation, pipelining, correlation
//! faults, timeouts, dead-broker transitions, and SASL.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{
    api_versions_response::ApiVersion, ApiVersionsResponse, BrokerId, MetadataRequest,
    MetadataResponse, RequestHeader, ResponseHeader, SaslAuthenticateRequest,
    SaslAuthenticateResponse, SaslHandshakeResponse, TopicName,
};
use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::metadata_response::MetadataResponseTopic;
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};

use kite_client::{classify, codec, sasl::Plain, Broker, ClientConfig, Connection, Error};
use kite_core::BrokerIdentity;

/// What the scripted broker does with metadata (key 3) requests; the
/// handshake keys are always served straight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Serve everything immediately.
    Normal,
    /// Answer the first metadata request with a bogus correlation ID.
    WrongCorrelation,
    /// Sleep before answering metadata requests.
    SlowData,
    /// Drop the first connection when its first metadata request arrives.
    CloseOnFirstData,
    /// Require a PLAIN exchange for user/pass before anything else.
    Sasl,
    /// Answer ApiVersions v3 the way a pre-v3 broker does: a v0 body
    /// carrying UNSUPPORTED_VERSION.
    OldApiVersions,
    /// Buffer two metadata requests, then answer them in reverse order.
    ReverseOrder,
}

/// Advertised (api key, min, max) entries. Metadata is capped at v8 to keep
/// the scripted responses off flexible encoding.
const ADVERTISED: &[(i16, i16, i16)] = &[(3, 0, 8), (17, 0, 1), (18, 0, 3), (36, 0, 2)];

async fn spawn_broker(mode: Mode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU32::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let index = connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _ = serve_connection(stream, mode, index).await;
            });
        }
    });

    addr
}

fn identity(addr: SocketAddr) -> BrokerIdentity {
    BrokerIdentity::seed("127.0.0.1", addr.port())
}

fn deadline_in(d: Duration) -> Instant {
    Instant::now() + d
}

/// Reads one length-prefixed frame, or `None` on a clean EOF.
async fn read_frame(stream: &mut TcpStream) -> Option<Bytes> {
    let mut length_buf = [0u8; 4];
    stream.read_exact(&mut length_buf).await.ok()?;
    let length = u32::from_be_bytes(length_buf) as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await.ok()?;
    Some(Bytes::from(payload))
}

/// Writes a response frame: header at the version the request implies,
/// then the body at the request's version.
async fn write_response<R: Encodable>(
    stream: &mut TcpStream,
    api_key: i16,
    api_version: i16,
    correlation_id: i32,
    response: &R,
) {
    let flexible = api_key == 3 && api_version >= 9;
    let mut header = ResponseHeader::default();
    header.correlation_id = correlation_id;

    let mut payload = BytesMut::new();
    header
        .encode(&mut payload, codec::response_header_version(api_key, flexible))
        .unwrap();
    response.encode(&mut payload, api_version).unwrap();

    let mut frame = BytesMut::new();
    #[allow(clippy::cast_possible_truncation)]
    frame.put_u32(payload.len() as u32);
    frame.extend_from_slice(&payload);
    // The client may legitimately be gone by the time a late reply lands.
    let _ = stream.write_all(&frame).await;
}

fn api_versions_body() -> ApiVersionsResponse {
    let mut response = ApiVersionsResponse::default();
    response.error_code = 0;
    for &(api_key, min_version, max_version) in ADVERTISED {
        let mut entry = ApiVersion::default();
        entry.api_key = api_key;
        entry.min_version = min_version;
        entry.max_version = max_version;
        response.api_keys.push(entry);
    }
    response
}

/// Echo the requested topic names back, stamping the correlation ID into
/// `controller_id` so tests can see which request a reply belonged to.
fn metadata_body(request: &MetadataRequest, correlation_id: i32) -> MetadataResponse {
    let mut response = MetadataResponse::default();
    response.controller_id = BrokerId(correlation_id);
    if let Some(topics) = &request.topics {
        for topic in topics {
            let mut entry = MetadataResponseTopic::default();
            entry.name = topic.name.clone();
            entry.error_code = 0;
            response.topics.push(entry);
        }
    }
    response
}

async fn serve_connection(mut stream: TcpStream, mode: Mode, index: u32) -> Option<()> {
    let mut metadata_served = 0u32;
    let mut reversed: Vec<(i32, i16, MetadataRequest)> = Vec::new();

    loop {
        let mut payload = read_frame(&mut stream).await?;

        let api_key = i16::from_be_bytes([payload[0], payload[1]]);
        let api_version = i16::from_be_bytes([payload[2], payload[3]]);
        let flexible = api_key == 18 && api_version >= 3;
        let header_version = if flexible { 2 } else { 1 };
        let header = RequestHeader::decode(&mut payload, header_version).unwrap();
        let correlation_id = header.correlation_id;

        match api_key {
            18 => {
                if mode == Mode::OldApiVersions && api_version >= 3 {
                    // A pre-v3 broker answers with a v0 body carrying
                    // UNSUPPORTED_VERSION.
                    let mut response = ApiVersionsResponse::default();
                    response.error_code = 35;
                    write_response(&mut stream, 18, 0, correlation_id, &response).await;
                } else {
                    write_response(&mut stream, 18, api_version, correlation_id, &api_versions_body())
                        .await;
                }
            }
            17 => {
                let mut response = SaslHandshakeResponse::default();
                response.error_code = 0;
                response.mechanisms = vec![StrBytes::from_static_str("PLAIN")];
                write_response(&mut stream, 17, api_version, correlation_id, &response).await;
            }
            36 => {
                let request =
                    SaslAuthenticateRequest::decode(&mut payload, api_version).unwrap();
                let mut response = SaslAuthenticateResponse::default();
                if &request.auth_bytes[..] == b"\0user\0pass" {
                    response.error_code = 0;
                    response.session_lifetime_ms = 0;
                } else {
                    response.error_code = 58; // SASL_AUTHENTICATION_FAILED
                    response.error_message =
                        Some(StrBytes::from_static_str("invalid credentials"));
                }
                write_response(&mut stream, 36, api_version, correlation_id, &response).await;
            }
            3 => {
                metadata_served += 1;
                let request = MetadataRequest::decode(&mut payload, api_version).unwrap();
                match mode {
                    Mode::WrongCorrelation if metadata_served == 1 => {
                        let response = metadata_body(&request, 9999);
                        write_response(&mut stream, 3, api_version, 9999, &response).await;
                    }
                    Mode::SlowData => {
                        tokio::time::sleep(Duration::from_millis(400)).await;
                        let response = metadata_body(&request, correlation_id);
                        write_response(&mut stream, 3, api_version, correlation_id, &response)
                            .await;
                    }
                    Mode::CloseOnFirstData if index == 0 => {
                        // Drop the connection with the request unanswered.
                        return Some(());
                    }
                    Mode::ReverseOrder => {
                        reversed.push((correlation_id, api_version, request));
                        if reversed.len() == 2 {
                            for (cid, version, req) in reversed.drain(..).rev() {
                                let response = metadata_body(&req, cid);
                                write_response(&mut stream, 3, version, cid, &response).await;
                            }
                        }
                    }
                    _ => {
                        let response = metadata_body(&request, correlation_id);
                        write_response(&mut stream, 3, api_version, correlation_id, &response)
                            .await;
                    }
                }
            }
            other => panic!("scripted broker got unexpected api key {other}"),
        }
    }
}

fn metadata_request(topic: &str) -> MetadataRequest {
    let mut entry = MetadataRequestTopic::default();
    entry.name = Some(TopicName(StrBytes::from_string(topic.to_string())));
    let mut request = MetadataRequest::default();
    request.topics = Some(vec![entry]);
    request
}

#[tokio::test]
async fn test_open_negotiates_versions() {
    let addr = spawn_broker(Mode::Normal).await;

    let connection = timeout(
        Duration::from_secs(5),
        Connection::open(identity(addr), &ClientConfig::new()),
    )
    .await
    .expect("open timed out")
    .expect("open failed");

    assert!(!connection.is_closed());
    assert_eq!(connection.versions().max_version(3), Some(8));
    assert_eq!(connection.versions().max_version(18), Some(3));
    assert_eq!(connection.versions().max_version(0), None);
    assert!(!connection.release_guess().is_empty());
}

#[tokio::test]
async fn test_api_versions_downgrade_to_v0() {
    let addr = spawn_broker(Mode::OldApiVersions).await;

    let connection = Connection::open(identity(addr), &ClientConfig::new())
        .await
        .expect("open should survive the v3 -> v0 downgrade");

    assert_eq!(connection.versions().max_version(3), Some(8));
}

#[tokio::test]
async fn test_metadata_round_trip() {
    let addr = spawn_broker(Mode::Normal).await;
    let connection = Connection::open(identity(addr), &ClientConfig::new())
        .await
        .unwrap();

    let response = connection
        .request(&metadata_request("events"), deadline_in(Duration::from_secs(5)))
        .await
        .expect("metadata request failed");

    assert_eq!(response.topics.len(), 1);
    assert_eq!(
        response.topics[0].name.as_ref().map(|n| n.as_str()),
        Some("events")
    );
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    let addr = spawn_broker(Mode::ReverseOrder).await;
    let connection = Arc::new(
        Connection::open(identity(addr), &ClientConfig::new())
            .await
            .unwrap(),
    );

    let deadline = deadline_in(Duration::from_secs(5));
    let alpha_request = metadata_request("alpha");
    let beta_request = metadata_request("beta");
    let first = connection.request(&alpha_request, deadline);
    let second = connection.request(&beta_request, deadline);

    let (first, second) = tokio::join!(first, second);
    let first = first.expect("first request failed");
    let second = second.expect("second request failed");

    // The broker answered in reverse order; correlation IDs still route
    // each reply to the caller that asked.
    assert_eq!(
        first.topics[0].name.as_ref().map(|n| n.as_str()),
        Some("alpha")
    );
    assert_eq!(
        second.topics[0].name.as_ref().map(|n| n.as_str()),
        Some("beta")
    );
    assert_ne!(first.controller_id, second.controller_id);
}

#[tokio::test]
async fn test_correlation_mismatch_is_terminal() {
    let addr = spawn_broker(Mode::WrongCorrelation).await;
    let connection = Connection::open(identity(addr), &ClientConfig::new())
        .await
        .unwrap();

    let err = connection
        .request(&metadata_request("events"), deadline_in(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::CorrelationMismatch { observed: 9999 }),
        "got {err}"
    );
    assert!(connection.is_closed());

    // The mismatch is terminal: later requests fail with it too, and the
    // classifier says a fresh connection may retry.
    let err = connection
        .request(&metadata_request("events"), deadline_in(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CorrelationMismatch { .. }));
    assert!(classify::retriable_on_same_broker(Some(&err)));
}

#[tokio::test]
async fn test_timeout_leaves_connection_live_and_drains_late_reply() {
    let addr = spawn_broker(Mode::SlowData).await;
    let connection = Connection::open(identity(addr), &ClientConfig::new())
        .await
        .unwrap();

    // The broker answers after 400ms; this caller gives up at 100ms.
    let err = connection
        .request(
            &metadata_request("slow"),
            deadline_in(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RequestTimeout { .. }), "got {err}");
    assert!(!connection.is_closed(), "timeout must not kill the connection");

    // The late reply arrives mid-wait for this one and is drained, not
    // treated as a mismatch; the second request then completes.
    let response = connection
        .request(
            &metadata_request("patient"),
            deadline_in(Duration::from_secs(5)),
        )
        .await
        .expect("request after a drained late reply failed");
    assert_eq!(
        response.topics[0].name.as_ref().map(|n| n.as_str()),
        Some("patient")
    );
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_request_after_close_fails_with_client_closed() {
    let addr = spawn_broker(Mode::Normal).await;
    let connection = Connection::open(identity(addr), &ClientConfig::new())
        .await
        .unwrap();

    connection.close();
    connection.close(); // Idempotent.
    assert!(connection.is_closed());

    let err = connection
        .request(&metadata_request("events"), deadline_in(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClientClosed), "got {err}");
}

#[tokio::test]
async fn test_version_gating_on_raw_requests() {
    let addr = spawn_broker(Mode::Normal).await;
    let connection = Connection::open(identity(addr), &ClientConfig::new())
        .await
        .unwrap();
    let deadline = deadline_in(Duration::from_secs(5));

    // The broker advertises metadata up to v8 only.
    let err = connection
        .request_raw(3, 12, true, Bytes::new(), deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BrokerTooOld { key: 3, version: 12 }));

    // Keys beyond the codec's ken are a different failure.
    let err = connection
        .request_raw(99, 0, false, Bytes::new(), deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownRequestKey { key: 99 }));

    // Keys the broker never advertised at all.
    let err = connection
        .request_raw(0, 0, false, Bytes::new(), deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BrokerTooOld { key: 0, .. }));
}

#[tokio::test]
async fn test_dial_error_is_skippable_not_retriable() {
    // Bind a port, then free it so nothing is listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = Connection::open(identity(addr), &ClientConfig::new())
        .await
        .unwrap_err();

    assert!(classify::is_dial_error(&err), "got {err}");
    assert!(!classify::retriable_on_same_broker(Some(&err)));
    assert!(classify::skippable_to_next_broker(Some(&err)));
}

#[tokio::test]
async fn test_broker_handle_retries_after_peer_close() {
    let addr = spawn_broker(Mode::CloseOnFirstData).await;
    let broker = Broker::new(identity(addr), ClientConfig::new(), 0);

    // The first connection dies with the request unanswered; the handle
    // classifies the failure as retriable, reopens, and succeeds.
    let response = timeout(
        Duration::from_secs(5),
        broker.request(&metadata_request("events"), deadline_in(Duration::from_secs(5))),
    )
    .await
    .expect("retry loop hung")
    .expect("request should succeed on the second connection");

    assert_eq!(
        response.topics[0].name.as_ref().map(|n| n.as_str()),
        Some("events")
    );
}

#[tokio::test]
async fn test_mark_dead_completes_in_flight_requests() {
    let addr = spawn_broker(Mode::SlowData).await;
    let broker = Arc::new(Broker::new(identity(addr), ClientConfig::new(), 0));

    let requester = Arc::clone(&broker);
    let in_flight = tokio::spawn(async move {
        requester
            .request(&metadata_request("doomed"), deadline_in(Duration::from_secs(5)))
            .await
    });

    // Let the request get written before the metadata refresh kills the
    // broker.
    tokio::time::sleep(Duration::from_millis(150)).await;
    broker.mark_dead().await;

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ChosenBrokerDead), "got {err}");
    // Retriable for the caller: refresh metadata, pick another broker.
    assert!(classify::retriable_on_same_broker(Some(&err)));
}

#[tokio::test]
async fn test_sasl_plain_authenticates() {
    let addr = spawn_broker(Mode::Sasl).await;
    let config = ClientConfig::new().with_sasl(Arc::new(Plain::new("user", "pass")));

    let connection = timeout(Duration::from_secs(5), Connection::open(identity(addr), &config))
        .await
        .expect("open timed out")
        .expect("authenticated open failed");

    let response = connection
        .request(&metadata_request("events"), deadline_in(Duration::from_secs(5)))
        .await
        .expect("request on authenticated connection failed");
    assert_eq!(
        response.topics[0].name.as_ref().map(|n| n.as_str()),
        Some("events")
    );
}

#[tokio::test]
async fn test_sasl_plain_rejects_bad_credentials() {
    let addr = spawn_broker(Mode::Sasl).await;
    let config = ClientConfig::new().with_sasl(Arc::new(Plain::new("user", "wrong")));

    let err = Connection::open(identity(addr), &config).await.unwrap_err();
    match err {
        Error::Authentication { mechanism, message } => {
            assert_eq!(mechanism, "PLAIN");
            assert!(message.contains("invalid credentials"), "{message}");
        }
        other => panic!("expected an authentication error, got {other}"),
    }
}
