//! Broker handle: owns the current connection to one broker and decides
//! what happens when a request against it fails.
//!
//! Retriable-on-same-broker errors are retried here, up to the configured
//! bound, reopening the connection if it died. Skippable errors propagate
//! unwrapped; the caller's broker selector applies
//! [`crate::classify::skippable_to_next_broker`] and picks another broker.
//! When cluster metadata removes this broker's ID, the handle goes dead and
//! everything in flight completes with [`Error::ChosenBrokerDead`].

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use kite_core::BrokerIdentity;

use crate::classify;
use crate::config::ClientConfig;
use crate::connection::{CloseReason, Connection};
use crate::error::{Error, Result};
use crate::request::ClientRequest;

struct Inner {
    connection: Option<Arc<Connection>>,
    dead: bool,
}

/// Handle to one broker in the cluster.
pub struct Broker {
    identity: BrokerIdentity,
    config: ClientConfig,
    /// The metadata generation this handle was created under.
    generation: u64,
    inner: tokio::sync::Mutex<Inner>,
}

impl Broker {
    /// Creates a handle. No connection is opened until the first request.
    #[must_use]
    pub fn new(identity: BrokerIdentity, config: ClientConfig, generation: u64) -> Self {
        Self {
            identity,
            config,
            generation,
            inner: tokio::sync::Mutex::new(Inner {
                connection: None,
                dead: false,
            }),
        }
    }

    /// The broker this handle serves.
    #[must_use]
    pub const fn identity(&self) -> &BrokerIdentity {
        &self.identity
    }

    /// The metadata generation this handle was created under.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the broker has been removed from cluster metadata.
    pub async fn is_dead(&self) -> bool {
        self.inner.lock().await.dead
    }

    /// Returns the live connection, opening one if needed.
    ///
    /// Opens are serialized by the handle's mutex: concurrent callers wait
    /// for one dial rather than racing their own.
    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut inner = self.inner.lock().await;
        if inner.dead {
            return Err(Error::ChosenBrokerDead);
        }
        if let Some(connection) = &inner.connection {
            if !connection.is_closed() {
                return Ok(Arc::clone(connection));
            }
        }

        debug!(broker = %self.identity, "opening connection");
        let connection =
            Arc::new(Connection::open(self.identity.clone(), &self.config).await?);
        inner.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Issues a typed request, retrying on the same broker while the error
    /// classifier says a retry can succeed.
    ///
    /// # Errors
    ///
    /// The final error once retries are exhausted, the deadline has passed,
    /// or the error is not retriable here. `ChosenBrokerDead` always
    /// propagates immediately: this handle cannot serve it and the caller
    /// must re-select after a metadata refresh.
    pub async fn request<R: ClientRequest>(
        &self,
        req: &R,
        deadline: Instant,
    ) -> Result<R::Response> {
        let mut attempts: u32 = 0;
        loop {
            let result = match self.connection().await {
                Ok(connection) => connection.request(req, deadline).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    attempts += 1;
                    if !self.should_retry(&e, attempts, deadline) {
                        return Err(e);
                    }
                    debug!(
                        broker = %self.identity,
                        attempt = attempts,
                        error = %e,
                        "retrying on same broker"
                    );
                }
            }
        }
    }

    /// Raw-body variant of [`Broker::request`], same retry discipline.
    ///
    /// # Errors
    ///
    /// See [`Broker::request`].
    pub async fn request_raw(
        &self,
        api_key: i16,
        api_version: i16,
        flexible: bool,
        body: bytes::Bytes,
        deadline: Instant,
    ) -> Result<bytes::Bytes> {
        let mut attempts: u32 = 0;
        loop {
            let result = match self.connection().await {
                Ok(connection) => {
                    connection
                        .request_raw(api_key, api_version, flexible, body.clone(), deadline)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    attempts += 1;
                    if !self.should_retry(&e, attempts, deadline) {
                        return Err(e);
                    }
                    debug!(
                        broker = %self.identity,
                        attempt = attempts,
                        error = %e,
                        "retrying on same broker"
                    );
                }
            }
        }
    }

    /// Whether a failed attempt goes around again.
    fn should_retry(&self, err: &Error, attempts: u32, deadline: Instant) -> bool {
        // A dead handle cannot serve retries; the caller re-selects.
        if matches!(err, Error::ChosenBrokerDead) {
            return false;
        }
        classify::retriable_on_same_broker(Some(err))
            && attempts <= self.config.limits.max_request_retries
            && Instant::now() < deadline
    }

    /// Called by the metadata layer when this broker's ID disappears from
    /// the cluster. Everything in flight completes with
    /// [`Error::ChosenBrokerDead`]; the error is retriable, so callers
    /// refresh metadata and pick a different broker.
    pub async fn mark_dead(&self) {
        let mut inner = self.inner.lock().await;
        if inner.dead {
            return;
        }
        inner.dead = true;
        if let Some(connection) = inner.connection.take() {
            info!(
                broker = %self.identity,
                "broker removed from metadata, failing in-flight requests"
            );
            connection.close_with(CloseReason::ChosenBrokerDead);
        }
    }
}
