//! SASL authentication lifecycle.
//!
//! The connection drives authentication through two small traits:
//! [`Mechanism`] starts a per-connection [`Session`], and the session steps
//! through challenges until done. The broker's granted session lifetime is
//! not the mechanism's business; the connection reads it off the wire and
//! feeds it to [`SaslState`], which schedules reauthentication and detects
//! the pathological case of a broker granting lifetimes too short to do
//! anything with.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use kite_core::Limits;

use crate::error::{Error, Result};

/// A SASL mechanism: a factory for per-connection authentication sessions.
pub trait Mechanism: Send + Sync + fmt::Debug {
    /// Mechanism name as advertised in the SaslHandshake exchange.
    fn name(&self) -> &'static str;

    /// Begins a new session, returning it and the initial client bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the mechanism cannot produce initial bytes,
    /// e.g. because its credentials are malformed.
    fn start(&self) -> Result<(Box<dyn Session>, Bytes)>;
}

/// One in-progress authentication exchange.
pub trait Session: Send {
    /// Consumes the server's bytes and produces the next client bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the server's challenge is invalid for this
    /// mechanism.
    fn step(&mut self, server_bytes: &[u8]) -> Result<Step>;
}

/// Outcome of one authentication step.
#[derive(Debug)]
pub struct Step {
    /// Bytes to send to the server, possibly empty.
    pub bytes: Bytes,
    /// True once the exchange is complete on the client side.
    pub done: bool,
}

/// The PLAIN mechanism (RFC 4616): a single message carrying authzid,
/// username, and password separated by NUL bytes.
pub struct Plain {
    username: String,
    password: String,
}

impl Plain {
    /// Creates a PLAIN mechanism with the given credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Plain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the password.
        f.debug_struct("Plain")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn start(&self) -> Result<(Box<dyn Session>, Bytes)> {
        let mut initial =
            Vec::with_capacity(self.username.len() + self.password.len() + 2);
        initial.push(0);
        initial.extend_from_slice(self.username.as_bytes());
        initial.push(0);
        initial.extend_from_slice(self.password.as_bytes());
        Ok((Box::new(PlainSession), initial.into()))
    }
}

/// PLAIN is single-shot: after the initial message there is nothing to say.
struct PlainSession;

impl Session for PlainSession {
    fn step(&mut self, server_bytes: &[u8]) -> Result<Step> {
        if !server_bytes.is_empty() {
            return Err(Error::Authentication {
                mechanism: "PLAIN".to_string(),
                message: format!(
                    "unexpected {}-byte server challenge for a single-shot mechanism",
                    server_bytes.len()
                ),
            });
        }
        Ok(Step {
            bytes: Bytes::new(),
            done: true,
        })
    }
}

/// Reauthentication bookkeeping for one connection.
#[derive(Debug)]
pub(crate) struct SaslState {
    mechanism: Arc<dyn Mechanism>,
    /// When to reauthenticate, or `None` if the broker granted no expiry.
    reauth_at: Option<Instant>,
    /// Consecutive sub-threshold lifetime grants.
    short_lifetimes: u32,
}

impl SaslState {
    pub(crate) fn new(mechanism: Arc<dyn Mechanism>) -> Self {
        Self {
            mechanism,
            reauth_at: None,
            short_lifetimes: 0,
        }
    }

    pub(crate) fn mechanism(&self) -> Arc<dyn Mechanism> {
        Arc::clone(&self.mechanism)
    }

    /// Records the session lifetime the broker granted on the final
    /// SaslAuthenticate response.
    ///
    /// # Errors
    ///
    /// Returns `SaslReauthLoop` once the broker has granted
    /// `Limits::max_sasl_short_lifetimes` consecutive lifetimes below
    /// `Limits::min_sasl_session_lifetime_ms`; the connection is expected
    /// to treat that as terminal.
    pub(crate) fn observe_lifetime(&mut self, lifetime_ms: i64, limits: &Limits) -> Result<()> {
        if lifetime_ms <= 0 {
            // No expiry: the session lasts as long as the connection.
            self.reauth_at = None;
            self.short_lifetimes = 0;
            return Ok(());
        }

        let lifetime_ms = lifetime_ms.unsigned_abs();
        if lifetime_ms < limits.min_sasl_session_lifetime_ms {
            self.short_lifetimes += 1;
            if self.short_lifetimes >= limits.max_sasl_short_lifetimes {
                return Err(Error::SaslReauthLoop);
            }
        } else {
            self.short_lifetimes = 0;
        }

        // Reauthenticate at 90% of the grant, leaving room to finish a
        // handshake before the broker cuts us off.
        self.reauth_at = Some(Instant::now() + Duration::from_millis(lifetime_ms * 9 / 10));
        Ok(())
    }

    /// True once the granted lifetime is close enough to expiry that the
    /// next request should reauthenticate first.
    pub(crate) fn needs_reauth(&self) -> bool {
        self.reauth_at.is_some_and(|at| Instant::now() >= at)
    }
}
