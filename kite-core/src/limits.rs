//! Client limits and configuration bounds.
//!
//! Every queue, buffer, and counter in the connection core has an explicit
//! maximum. This keeps a misbehaving broker from growing client memory
//! without bound and makes timeout behavior predictable.

/// Resource limits for a Kite client.
///
/// All limits are explicit and configurable. Default values are chosen
/// to be safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Wire limits.
    /// Maximum size of a single protocol frame in bytes (length prefix
    /// excluded). Frames advertised larger than this kill the connection.
    pub max_frame_bytes: u32,

    // Connection limits.
    /// Maximum number of in-flight requests per connection. Enqueues past
    /// this bound fail rather than buffering without limit.
    pub max_in_flight_requests: u32,
    /// Maximum number of same-broker retries per logical request.
    pub max_request_retries: u32,

    // Timeout limits (in milliseconds).
    /// TCP dial timeout.
    pub connect_timeout_ms: u64,
    /// Default per-request deadline, used when the caller does not supply
    /// one.
    pub request_timeout_ms: u64,

    // SASL limits.
    /// Minimum useful SASL session lifetime. Brokers granting less than
    /// this are counted toward the reauth-loop strike count.
    pub min_sasl_session_lifetime_ms: u64,
    /// Consecutive sub-threshold session lifetimes tolerated before the
    /// connection self-closes with a reauth-loop error.
    pub max_sasl_short_lifetimes: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Wire: 100MB frames, same ceiling as Kafka's default.
            max_frame_bytes: 100 * 1024 * 1024,

            // Connection: 256 in-flight, 20 same-broker retries.
            max_in_flight_requests: 256,
            max_request_retries: 20,

            // Timeouts: 5s dial, 30s request.
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,

            // SASL: lifetimes under 5s are useless; three strikes.
            min_sasl_session_lifetime_ms: 5_000,
            max_sasl_short_lifetimes: 3,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_frame_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_frame_bytes",
                reason: "must be positive",
            });
        }

        if self.max_in_flight_requests == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_in_flight_requests",
                reason: "must be positive",
            });
        }

        if self.connect_timeout_ms == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "connect_timeout_ms",
                reason: "must be positive",
            });
        }

        if self.request_timeout_ms == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "request_timeout_ms",
                reason: "must be positive",
            });
        }

        // A zero strike count would close every SASL connection on the
        // first reauth.
        if self.max_sasl_short_lifetimes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_sasl_short_lifetimes",
                reason: "must be positive",
            });
        }

        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}
