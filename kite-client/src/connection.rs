//! One TCP connection to one broker: the request multiplexer.
//!
//! A connection serializes protocol frames onto a single socket, correlates
//! replies back to their callers, enforces per-request deadlines, and tears
//! itself down on unrecoverable framing faults.
//!
//! # Tasks
//!
//! Two tasks per connection, spawned once the handshake completes:
//! - **Writer**: drains a bounded FIFO queue, frames each request, writes
//!   it to the socket. Write order equals enqueue order.
//! - **Reader**: reads length-prefixed frames, peels off the correlation
//!   ID, and delivers the remainder to the owning in-flight slot. Reply
//!   order is whatever the broker chooses; correlation IDs are the
//!   authoritative match.
//!
//! The in-flight slot map is the only state the tasks share, guarded by one
//! mutex that is never held across an await.
//!
//! # Lifecycle
//!
//! ```text
//!     Dialling ──success──► [SASL?] ──success──► ApiVersions ──success──► Serving
//!         │                   │                       │                       │
//!         └── dial err ───────┴── auth err ───────────┴── protocol err ──► Closed(err)
//!                                                                             ▲
//!                                                   any terminal I/O error ───┘
//! ```
//!
//! All transitions to Closed are terminal; reuse means opening a new
//! connection.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{
    ApiVersionsRequest, SaslAuthenticateRequest, SaslHandshakeRequest,
};
use kafka_protocol::protocol::StrBytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use kite_core::{BrokerIdentity, CorrelationId, Limits};
use kite_versions::VersionTable;

use crate::codec;
use crate::config::ClientConfig;
use crate::error::{Error, NetOp, Result};
use crate::request::{self, ClientRequest};
use crate::sasl::{Mechanism, SaslState};

/// Kafka error code for a request version the broker does not speak.
const UNSUPPORTED_VERSION: i16 = 35;

/// Why a connection reached its terminal state.
///
/// Cheap to clone so that every in-flight slot can be completed with it;
/// [`crate::error::Error`] itself carries live I/O sources and is not
/// clonable.
#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    /// Closed by the owner.
    ClientClosed,
    /// The broker replied with an unknown correlation ID.
    CorrelationMismatch {
        /// The ID observed on the wire.
        observed: i32,
    },
    /// The broker kept granting useless SASL session lifetimes.
    SaslReauthLoop,
    /// The broker was removed from cluster metadata mid-flight.
    ChosenBrokerDead,
    /// The broker closed the connection.
    PeerClosed,
    /// A socket operation failed.
    Io {
        /// Which operation.
        op: NetOp,
        /// The I/O error kind.
        kind: io::ErrorKind,
        /// The I/O error message.
        message: String,
    },
    /// A frame could not be decoded; the stream cannot be trusted anymore.
    Decode {
        /// What went wrong.
        message: String,
    },
}

impl CloseReason {
    fn to_error(&self) -> Error {
        match self {
            Self::ClientClosed => Error::ClientClosed,
            Self::CorrelationMismatch { observed } => Error::CorrelationMismatch {
                observed: *observed,
            },
            Self::SaslReauthLoop => Error::SaslReauthLoop,
            Self::ChosenBrokerDead => Error::ChosenBrokerDead,
            Self::PeerClosed => Error::ConnectionClosed,
            Self::Io { op, kind, message } => Error::Network {
                op: *op,
                source: io::Error::new(*kind, message.clone()),
            },
            Self::Decode { message } => Error::Decode {
                message: message.clone(),
            },
        }
    }

    fn from_error(err: &Error) -> Self {
        match err {
            Error::ConnectionClosed => Self::PeerClosed,
            Error::Network { op, source } => Self::Io {
                op: *op,
                kind: source.kind(),
                message: source.to_string(),
            },
            other => Self::Decode {
                message: other.to_string(),
            },
        }
    }
}

/// One in-flight request awaiting its reply.
#[derive(Debug)]
struct Slot {
    api_key: i16,
    /// Whether the response header carries tagged fields.
    flexible: bool,
    /// Completion sink. `None` once the caller stopped waiting (deadline
    /// fired); the slot then only exists so the reply gets drained instead
    /// of reading as a desynchronization.
    sink: Option<oneshot::Sender<Result<Bytes>>>,
}

#[derive(Debug)]
struct Inflight {
    next_id: CorrelationId,
    slots: HashMap<i32, Slot>,
    /// Set exactly once; the first close reason wins.
    terminal: Option<CloseReason>,
}

#[derive(Debug)]
struct Shared {
    identity: BrokerIdentity,
    limits: Limits,
    inflight: Mutex<Inflight>,
    shutdown: Notify,
}

impl Shared {
    /// Moves the connection to Closed, completing every live slot with the
    /// reason. Idempotent and terminal.
    fn close(&self, reason: CloseReason) {
        let slots = {
            let mut inflight = self.inflight.lock().unwrap();
            if inflight.terminal.is_some() {
                return;
            }
            inflight.terminal = Some(reason.clone());
            std::mem::take(&mut inflight.slots)
        };

        for (correlation_id, slot) in slots {
            match slot.sink {
                Some(sink) => {
                    let _ = sink.send(Err(reason.to_error()));
                }
                None => {
                    debug!(correlation_id, "dropping draining slot on close");
                }
            }
        }

        self.shutdown.notify_waiters();
    }

    fn terminal_error(&self) -> Option<Error> {
        self.inflight
            .lock()
            .unwrap()
            .terminal
            .as_ref()
            .map(CloseReason::to_error)
    }

    fn is_closed(&self) -> bool {
        self.inflight.lock().unwrap().terminal.is_some()
    }

    /// Removes a slot and completes it with the outcome. A missing slot
    /// means close already completed it; the outcome is dropped.
    fn complete(&self, correlation_id: i32, outcome: Result<Bytes>) {
        let slot = self.inflight.lock().unwrap().slots.remove(&correlation_id);
        if let Some(Slot {
            sink: Some(sink), ..
        }) = slot
        {
            let _ = sink.send(outcome);
        }
    }
}

/// A request handed to the writer task. Its slot is already installed.
struct Outbound {
    correlation_id: i32,
    api_key: i16,
    api_version: i16,
    flexible: bool,
    body: Bytes,
}

/// A live connection to one broker.
///
/// All methods take `&self`; share it behind an [`Arc`] to issue requests
/// concurrently. Dropping the connection closes it and completes anything
/// still in flight with [`Error::ClientClosed`].
#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    versions: VersionTable,
    outbound_tx: mpsc::Sender<Outbound>,
    sasl: Option<tokio::sync::Mutex<SaslState>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Dials the broker, authenticates if configured, negotiates
    /// ApiVersions, and starts serving.
    ///
    /// # Errors
    ///
    /// Returns a dial error if the broker is unreachable, an authentication
    /// error if SASL fails, or a protocol error if negotiation does.
    pub async fn open(identity: BrokerIdentity, config: &ClientConfig) -> Result<Self> {
        config.limits.validate()?;
        let limits = config.limits;

        let mut stream = dial(&identity, &limits).await?;
        debug!(broker = %identity, "connected");

        // The handshake runs sequentially on the raw stream; the writer and
        // reader tasks only exist once the connection is ready to serve.
        let mut handshake = Handshake {
            stream: &mut stream,
            next_id: 0,
            config,
        };

        let sasl = match &config.sasl {
            Some(mechanism) => {
                let state = handshake.authenticate(mechanism).await?;
                Some(tokio::sync::Mutex::new(state))
            }
            None => None,
        };

        let versions = handshake.negotiate_versions().await?;
        let handshake_ids = handshake.next_id;
        debug!(
            broker = %identity,
            guess = %versions.guess(),
            "negotiated api versions"
        );

        let shared = Arc::new(Shared {
            identity,
            limits,
            inflight: Mutex::new(Inflight {
                next_id: CorrelationId::new(handshake_ids),
                slots: HashMap::new(),
                terminal: None,
            }),
            shutdown: Notify::new(),
        });

        let (outbound_tx, outbound_rx) =
            mpsc::channel(limits.max_in_flight_requests as usize);
        let (read_half, write_half) = stream.into_split();

        let writer = tokio::spawn(writer_loop(
            Arc::clone(&shared),
            outbound_rx,
            write_half,
            config.client_id.clone(),
        ));
        let reader = tokio::spawn(reader_loop(Arc::clone(&shared), read_half));

        Ok(Self {
            shared,
            versions,
            outbound_tx,
            sasl,
            writer,
            reader,
        })
    }

    /// The broker this connection serves.
    #[must_use]
    pub fn identity(&self) -> &BrokerIdentity {
        &self.shared.identity
    }

    /// The version table negotiated with this broker.
    #[must_use]
    pub const fn versions(&self) -> &VersionTable {
        &self.versions
    }

    /// Human-readable guess of the broker's Kafka release.
    #[must_use]
    pub fn release_guess(&self) -> String {
        self.versions.guess()
    }

    /// True once the connection has reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes the connection, completing everything in flight with
    /// [`Error::ClientClosed`]. Idempotent.
    pub fn close(&self) {
        self.shared.close(CloseReason::ClientClosed);
    }

    pub(crate) fn close_with(&self, reason: CloseReason) {
        self.shared.close(reason);
    }

    /// Issues a typed request and suspends until its reply, the deadline,
    /// or connection death, whichever comes first.
    ///
    /// The version is the highest both the codec and the broker support.
    ///
    /// # Errors
    ///
    /// [`Error::BrokerTooOld`] if the broker cannot handle the request at
    /// all; otherwise whatever the exchange produced.
    pub async fn request<R: ClientRequest>(
        &self,
        req: &R,
        deadline: Instant,
    ) -> Result<R::Response> {
        self.maybe_reauth().await?;
        self.request_inner(req, deadline).await
    }

    /// Issues an already-encoded request body.
    ///
    /// This is the raw path for callers bringing their own codec: the
    /// connection frames the bytes, assigns the correlation ID, and hands
    /// back the reply body without interpreting either side.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownRequestKey`] for keys outside the codec's ken,
    /// [`Error::BrokerTooOld`] for versions the broker cannot handle.
    pub async fn request_raw(
        &self,
        api_key: i16,
        api_version: i16,
        flexible: bool,
        body: Bytes,
        deadline: Instant,
    ) -> Result<Bytes> {
        self.maybe_reauth().await?;
        if !(0..=request::MAX_REQUEST_KEY).contains(&api_key) {
            return Err(Error::UnknownRequestKey { key: api_key });
        }
        if !self.versions.supports(api_key, api_version) {
            return Err(Error::BrokerTooOld {
                key: api_key,
                version: api_version,
            });
        }
        self.enqueue(api_key, api_version, flexible, body, deadline)
            .await
    }

    /// Typed request without the reauthentication check; reauthentication
    /// itself comes through here.
    async fn request_inner<R: ClientRequest>(
        &self,
        req: &R,
        deadline: Instant,
    ) -> Result<R::Response> {
        let version = pick_version::<R>(&self.versions)?;
        let flexible = R::is_flexible(version);
        let body = request::encode_body(req, version)?;
        let reply = self.enqueue(R::KEY, version, flexible, body, deadline).await?;
        request::decode_body::<R>(reply, version)
    }

    /// Installs a slot, enqueues the frame for the writer, and waits.
    async fn enqueue(
        &self,
        api_key: i16,
        api_version: i16,
        flexible: bool,
        body: Bytes,
        deadline: Instant,
    ) -> Result<Bytes> {
        let start = Instant::now();
        let (sink, reply_rx) = oneshot::channel();

        let correlation_id = {
            let mut inflight = self.shared.inflight.lock().unwrap();
            if let Some(reason) = &inflight.terminal {
                return Err(reason.to_error());
            }
            if inflight.slots.len() >= self.shared.limits.max_in_flight_requests as usize {
                return Err(Error::MaxBuffered);
            }

            let id = inflight.next_id;
            // Wraparound may never reuse a live slot.
            if inflight.slots.contains_key(&id.get()) {
                return Err(Error::CorrelationIdExhausted);
            }
            inflight.next_id = id.wrapping_next();
            inflight.slots.insert(
                id.get(),
                Slot {
                    api_key,
                    flexible,
                    sink: Some(sink),
                },
            );

            // Enqueued under the lock so write order equals issue order.
            let outbound = Outbound {
                correlation_id: id.get(),
                api_key,
                api_version,
                flexible,
                body,
            };
            if self.outbound_tx.try_send(outbound).is_err() {
                inflight.slots.remove(&id.get());
                return Err(Error::MaxBuffered);
            }
            id.get()
        };

        tokio::select! {
            reply = reply_rx => match reply {
                Ok(outcome) => outcome,
                // The sink was dropped without completing: the connection
                // died and its terminal error explains why.
                Err(_) => Err(self
                    .shared
                    .terminal_error()
                    .unwrap_or(Error::ClientClosed)),
            },
            () = tokio::time::sleep_until(deadline) => {
                // Leave the slot in the map, sink-less: the broker still
                // owes a reply, and it must be drained rather than read as
                // a desynchronization. Timeout does not imply the
                // connection is corrupt.
                let mut inflight = self.shared.inflight.lock().unwrap();
                if let Some(slot) = inflight.slots.get_mut(&correlation_id) {
                    slot.sink = None;
                }
                drop(inflight);
                Err(Error::RequestTimeout {
                    waited_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Reauthenticates when the SASL session is near expiry.
    async fn maybe_reauth(&self) -> Result<()> {
        let Some(sasl) = &self.sasl else {
            return Ok(());
        };
        let mut state = sasl.lock().await;
        if !state.needs_reauth() {
            return Ok(());
        }

        debug!(broker = %self.shared.identity, "SASL session expiring, reauthenticating");
        match self.reauthenticate(&mut state).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, Error::SaslReauthLoop) {
                    warn!(
                        broker = %self.shared.identity,
                        "broker keeps granting short SASL lifetimes, closing"
                    );
                    self.shared.close(CloseReason::SaslReauthLoop);
                }
                Err(err)
            }
        }
    }

    /// One full KIP-152 reauthentication exchange over the serving
    /// connection, interleaved with normal traffic.
    async fn reauthenticate(&self, state: &mut SaslState) -> Result<()> {
        let deadline =
            Instant::now() + Duration::from_millis(self.shared.limits.request_timeout_ms);
        let mechanism = state.mechanism();

        let mut handshake = SaslHandshakeRequest::default();
        handshake.mechanism = StrBytes::from_string(mechanism.name().to_string());
        let reply = self.request_inner(&handshake, deadline).await?;
        if reply.error_code != 0 {
            return Err(Error::ErrorCode {
                code: reply.error_code,
                context: "SaslHandshake",
            });
        }

        let (mut session, mut client_bytes) = mechanism.start()?;
        loop {
            let mut authenticate = SaslAuthenticateRequest::default();
            authenticate.auth_bytes = client_bytes;
            let reply = self.request_inner(&authenticate, deadline).await?;
            if reply.error_code != 0 {
                return Err(Error::Authentication {
                    mechanism: mechanism.name().to_string(),
                    message: reply
                        .error_message
                        .as_ref()
                        .map_or_else(
                            || format!("error code {}", reply.error_code),
                            |m| m.as_str().to_string(),
                        ),
                });
            }
            let step = session.step(&reply.auth_bytes)?;
            if step.done {
                state.observe_lifetime(reply.session_lifetime_ms, &self.shared.limits)?;
                return Ok(());
            }
            client_bytes = step.bytes;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Every still-in-flight slot is completed exactly once before the
        // connection goes away.
        self.shared.close(CloseReason::ClientClosed);
        self.writer.abort();
        self.reader.abort();
    }
}

/// Picks the request version: the highest both sides support.
fn pick_version<R: ClientRequest>(versions: &VersionTable) -> Result<i16> {
    let too_old = Error::BrokerTooOld {
        key: R::KEY,
        version: R::MIN_VERSION,
    };
    let Some(broker_max) = versions.max_version(R::KEY) else {
        return Err(too_old);
    };
    if broker_max < R::MIN_VERSION {
        return Err(too_old);
    }
    Ok(broker_max.min(R::MAX_VERSION))
}

/// Resolves and dials the broker with the connect timeout.
///
/// The address is resolved at connect time to support hostnames.
async fn dial(identity: &BrokerIdentity, limits: &Limits) -> Result<TcpStream> {
    let timeout = Duration::from_millis(limits.connect_timeout_ms);
    let addr = identity.addr();

    let connect = async {
        let mut addrs = tokio::net::lookup_host(&addr).await?;
        let resolved = addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {addr}"),
            )
        })?;
        TcpStream::connect(resolved).await
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => {
            // Disable Nagle's algorithm for lower latency.
            stream.set_nodelay(true).map_err(|e| Error::Network {
                op: NetOp::Dial,
                source: e,
            })?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::Network {
            op: NetOp::Dial,
            source: e,
        }),
        Err(_) => Err(Error::Network {
            op: NetOp::Dial,
            source: io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
        }),
    }
}

/// Reads one length-prefixed frame.
async fn read_one_frame<R>(stream: &mut R, limits: &Limits) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let map_read_err = |e: io::Error| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::ConnectionClosed
        } else {
            Error::Network {
                op: NetOp::Read,
                source: e,
            }
        }
    };

    let mut length_buf = [0u8; 4];
    stream
        .read_exact(&mut length_buf)
        .await
        .map_err(map_read_err)?;
    let length = u32::from_be_bytes(length_buf) as usize;

    if length > limits.max_frame_bytes as usize {
        return Err(Error::Decode {
            message: format!(
                "frame too large: {length} bytes (max {})",
                limits.max_frame_bytes
            ),
        });
    }

    let mut payload = vec![0u8; length];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(map_read_err)?;
    Ok(Bytes::from(payload))
}

/// The sequential pre-serving phase: SASL and ApiVersions ride the raw
/// stream one exchange at a time, before the tasks exist.
struct Handshake<'a> {
    stream: &'a mut TcpStream,
    next_id: i32,
    config: &'a ClientConfig,
}

impl Handshake<'_> {
    /// One request/response exchange, returning the reply body.
    async fn roundtrip_raw(
        &mut self,
        api_key: i16,
        api_version: i16,
        flexible: bool,
        body: &[u8],
    ) -> Result<Bytes> {
        let correlation_id = self.next_id;
        self.next_id += 1;

        let mut frame = BytesMut::new();
        codec::encode_request_frame(
            &mut frame,
            api_key,
            api_version,
            flexible,
            correlation_id,
            self.config.client_id.as_deref(),
            body,
        )?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| Error::Network {
                op: NetOp::Write,
                source: e,
            })?;

        let payload = read_one_frame(self.stream, &self.config.limits).await?;
        let (observed, reply) = codec::decode_response_header(payload, api_key, flexible)?;
        if observed != correlation_id {
            return Err(Error::CorrelationMismatch { observed });
        }
        Ok(reply)
    }

    async fn roundtrip<R: ClientRequest>(
        &mut self,
        req: &R,
        version: i16,
    ) -> Result<R::Response> {
        let flexible = R::is_flexible(version);
        let body = request::encode_body(req, version)?;
        let reply = self
            .roundtrip_raw(R::KEY, version, flexible, &body)
            .await?;
        request::decode_body::<R>(reply, version)
    }

    /// The SaslHandshake/SaslAuthenticate exchange, fixed at v1: this runs
    /// before ApiVersions, so nothing has been negotiated yet.
    async fn authenticate(&mut self, mechanism: &Arc<dyn Mechanism>) -> Result<SaslState> {
        let mut handshake = SaslHandshakeRequest::default();
        handshake.mechanism = StrBytes::from_string(mechanism.name().to_string());
        let reply = self.roundtrip(&handshake, 1).await?;
        if reply.error_code != 0 {
            let offered: Vec<String> = reply
                .mechanisms
                .iter()
                .map(|m| m.as_str().to_string())
                .collect();
            return Err(Error::Authentication {
                mechanism: mechanism.name().to_string(),
                message: format!(
                    "handshake rejected with error code {} (broker offers: {})",
                    reply.error_code,
                    offered.join(", ")
                ),
            });
        }

        let mut state = SaslState::new(Arc::clone(mechanism));
        let (mut session, mut client_bytes) = mechanism.start()?;
        loop {
            let mut authenticate = SaslAuthenticateRequest::default();
            authenticate.auth_bytes = client_bytes;
            let reply = self.roundtrip(&authenticate, 1).await?;
            if reply.error_code != 0 {
                return Err(Error::Authentication {
                    mechanism: mechanism.name().to_string(),
                    message: reply.error_message.as_ref().map_or_else(
                        || format!("error code {}", reply.error_code),
                        |m| m.as_str().to_string(),
                    ),
                });
            }
            let step = session.step(&reply.auth_bytes)?;
            if step.done {
                state.observe_lifetime(reply.session_lifetime_ms, &self.config.limits)?;
                return Ok(state);
            }
            client_bytes = step.bytes;
        }
    }

    /// ApiVersions negotiation, v3 first with the client software fields,
    /// downgrading to v0 when the broker answers UNSUPPORTED_VERSION.
    async fn negotiate_versions(&mut self) -> Result<VersionTable> {
        let mut req = ApiVersionsRequest::default();
        req.client_software_name = StrBytes::from_string(self.config.software_name.clone());
        req.client_software_version =
            StrBytes::from_string(self.config.software_version.clone());

        let body = request::encode_body(&req, 3)?;
        let reply = self.roundtrip_raw(18, 3, true, &body).await?;

        // Brokers that predate v3 answer it with a v0-encoded body carrying
        // UNSUPPORTED_VERSION; peek the error code before committing to a
        // decode version.
        let code = if reply.len() >= 2 {
            i16::from_be_bytes([reply[0], reply[1]])
        } else {
            0
        };

        let response = if code == UNSUPPORTED_VERSION {
            debug!("broker does not speak ApiVersions v3, downgrading to v0");
            let body = request::encode_body(&ApiVersionsRequest::default(), 0)?;
            let reply = self.roundtrip_raw(18, 0, false, &body).await?;
            request::decode_body::<ApiVersionsRequest>(reply, 0)?
        } else {
            request::decode_body::<ApiVersionsRequest>(reply, 3)?
        };

        if response.error_code != 0 {
            return Err(Error::ErrorCode {
                code: response.error_code,
                context: "ApiVersions",
            });
        }

        let mut versions = VersionTable::empty();
        for api in &response.api_keys {
            versions.set_max(api.api_key, api.max_version);
        }
        Ok(versions)
    }
}

/// Writer task: drains the outbound queue onto the socket in FIFO order.
async fn writer_loop(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut write_half: OwnedWriteHalf,
    client_id: Option<String>,
) {
    let shutdown = shared.shutdown.notified();
    tokio::pin!(shutdown);
    let mut frame = BytesMut::new();

    loop {
        if shared.is_closed() {
            break;
        }

        let outbound = tokio::select! {
            () = &mut shutdown => break,
            msg = outbound_rx.recv() => match msg {
                Some(msg) => msg,
                None => break, // Connection dropped.
            },
        };

        frame.clear();
        if let Err(e) = codec::encode_request_frame(
            &mut frame,
            outbound.api_key,
            outbound.api_version,
            outbound.flexible,
            outbound.correlation_id,
            client_id.as_deref(),
            &outbound.body,
        ) {
            // An unencodable header is this caller's problem, not the
            // socket's: fail the slot and keep serving.
            shared.complete(outbound.correlation_id, Err(e));
            continue;
        }

        let written = match write_half.write_all(&frame).await {
            Ok(()) => write_half.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                debug!(
                    broker = %shared.identity,
                    correlation_id = outbound.correlation_id,
                    api_key = outbound.api_key,
                    api_version = outbound.api_version,
                    "request written"
                );
            }
            Err(e) => {
                warn!(
                    broker = %shared.identity,
                    error = %e,
                    "write failed, closing connection"
                );
                let reason = CloseReason::Io {
                    op: NetOp::Write,
                    kind: e.kind(),
                    message: e.to_string(),
                };
                // The failed request gets the precise write error; everyone
                // else gets the close reason.
                shared.complete(
                    outbound.correlation_id,
                    Err(Error::Network {
                        op: NetOp::Write,
                        source: e,
                    }),
                );
                shared.close(reason);
                break;
            }
        }
    }
}

/// Reader task: demultiplexes length-prefixed frames by correlation ID.
async fn reader_loop(shared: Arc<Shared>, mut read_half: OwnedReadHalf) {
    let shutdown = shared.shutdown.notified();
    tokio::pin!(shutdown);

    loop {
        if shared.is_closed() {
            break;
        }

        let payload = tokio::select! {
            () = &mut shutdown => break,
            frame = read_one_frame(&mut read_half, &shared.limits) => frame,
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                match &e {
                    Error::ConnectionClosed => {
                        debug!(broker = %shared.identity, "connection closed by broker");
                    }
                    other => {
                        warn!(broker = %shared.identity, error = %other, "read failed, closing connection");
                    }
                }
                shared.close(CloseReason::from_error(&e));
                break;
            }
        };

        let correlation_id = match codec::peek_correlation_id(&payload) {
            Ok(id) => id,
            Err(e) => {
                let message = e.to_string();
                warn!(broker = %shared.identity, error = %e, "unreadable response frame");
                shared.close(CloseReason::Decode { message });
                break;
            }
        };

        let slot = {
            let mut inflight = shared.inflight.lock().unwrap();
            inflight.slots.remove(&correlation_id)
        };

        let Some(slot) = slot else {
            // Stream desynchronization. This must never be ignored: every
            // later reply would pair with the wrong request.
            error!(
                broker = %shared.identity,
                correlation_id,
                "correlation ID mismatch, closing connection"
            );
            shared.close(CloseReason::CorrelationMismatch {
                observed: correlation_id,
            });
            break;
        };

        match codec::decode_response_header(payload, slot.api_key, slot.flexible) {
            Ok((_, body)) => match slot.sink {
                Some(sink) => {
                    if sink.send(Ok(body)).is_err() {
                        debug!(correlation_id, "caller gave up waiting, reply discarded");
                    }
                }
                None => {
                    debug!(correlation_id, "drained reply for timed-out request");
                }
            },
            Err(e) => {
                // The stream position can no longer be trusted.
                let message = e.to_string();
                warn!(
                    broker = %shared.identity,
                    correlation_id,
                    error = %e,
                    "response header decode failed, closing connection"
                );
                if let Some(sink) = slot.sink {
                    let _ = sink.send(Err(e));
                }
                shared.close(CloseReason::Decode { message });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_versions::baselines;

    #[test]
    fn test_close_reason_round_trips_to_errors() {
        let cases = [
            (CloseReason::ClientClosed, Error::ClientClosed),
            (
                CloseReason::CorrelationMismatch { observed: 7 },
                Error::CorrelationMismatch { observed: 7 },
            ),
            (CloseReason::SaslReauthLoop, Error::SaslReauthLoop),
            (CloseReason::ChosenBrokerDead, Error::ChosenBrokerDead),
            (CloseReason::PeerClosed, Error::ConnectionClosed),
        ];
        for (reason, expected) in cases {
            assert!(reason.to_error().same_kind(&expected));
        }

        let io_reason = CloseReason::Io {
            op: NetOp::Write,
            kind: io::ErrorKind::BrokenPipe,
            message: "broken pipe".to_string(),
        };
        match io_reason.to_error() {
            Error::Network { op, source } => {
                assert_eq!(op, NetOp::Write);
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("expected a network error, got {other}"),
        }
    }

    #[test]
    fn test_pick_version_takes_lowest_common_max() {
        use kafka_protocol::messages::MetadataRequest;

        // A modern broker advertises Metadata v11; the codec can go to 12,
        // so the broker's max wins.
        let modern = baselines::stable();
        assert_eq!(pick_version::<MetadataRequest>(&modern).unwrap(), 11);

        // An old broker caps at its own max.
        let old = baselines::v0_10_0();
        assert_eq!(pick_version::<MetadataRequest>(&old).unwrap(), 1);

        // A broker without the key at all is too old.
        let ancient = baselines::v0_8_0();
        let err = pick_version::<kafka_protocol::messages::ApiVersionsRequest>(&ancient)
            .unwrap_err();
        assert!(matches!(err, Error::BrokerTooOld { key: 18, .. }));
    }

    #[tokio::test]
    async fn test_read_one_frame() {
        let limits = Limits::new();
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut frame = BytesMut::new();
        codec::write_frame(&mut frame, b"payload");
        client.write_all(&frame).await.unwrap();

        let payload = read_one_frame(&mut server, &limits).await.unwrap();
        assert_eq!(&payload[..], b"payload");
    }

    #[tokio::test]
    async fn test_read_one_frame_rejects_oversized() {
        let mut limits = Limits::new();
        limits.max_frame_bytes = 16;
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut frame = BytesMut::new();
        codec::write_frame(&mut frame, &[0u8; 32]);
        client.write_all(&frame).await.unwrap();

        let err = read_one_frame(&mut server, &limits).await.unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[tokio::test]
    async fn test_read_one_frame_eof_is_connection_closed() {
        let limits = Limits::new();
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        let err = read_one_frame(&mut server, &limits).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
