//! Strongly-typed identifiers for protocol entities.
//!
//! Kafka identifiers are 32-bit on the wire; wrapping them prevents a node
//! ID from ever being handed somewhere a correlation ID belongs.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers over the protocol's `i32`.
///
/// Each ID type provides:
/// - Type safety (can't mix `NodeId` with `CorrelationId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw i32)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(i32);

        impl $name {
            /// Creates a new ID from a raw i32 value.
            #[inline]
            #[must_use]
            pub const fn new(value: i32) -> Self {
                Self(value)
            }

            /// Returns the raw i32 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> i32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<i32> for $name {
            fn from(value: i32) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for i32 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(NodeId, "node", "Broker node ID as reported by cluster metadata.");
define_id!(
    CorrelationId,
    "corr",
    "Tag pairing a request with its reply on a single connection."
);

impl CorrelationId {
    /// Returns the ID that follows this one, wrapping at `i32::MAX`.
    ///
    /// Correlation IDs are issued strictly monotonically; on very long-lived
    /// connections the counter wraps rather than overflowing. Whether the
    /// wrapped ID is actually usable (not still in flight) is the
    /// connection's concern, not this type's.
    #[inline]
    #[must_use]
    pub const fn wrapping_next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// The address of one broker, plus its node ID once metadata has told us.
///
/// Seed brokers start out with no node ID; brokers learned from metadata
/// responses carry the ID the cluster assigned them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerIdentity {
    /// Hostname or IP address. DNS resolution is deferred to connect time.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Node ID, if known.
    pub node: Option<NodeId>,
}

impl BrokerIdentity {
    /// Creates an identity for a seed broker with no known node ID.
    #[must_use]
    pub fn seed(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            node: None,
        }
    }

    /// Creates an identity for a broker learned from metadata.
    #[must_use]
    pub fn known(host: impl Into<String>, port: u16, node: NodeId) -> Self {
        Self {
            host: host.into(),
            port,
            node: Some(node),
        }
    }

    /// Returns the `host:port` string to dial.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BrokerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(node) => write!(f, "{}:{} ({node})", self.host, self.port),
            None => write!(f, "{}:{} (seed)", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct_types() {
        let node = NodeId::new(3);
        let corr = CorrelationId::new(3);
        assert_eq!(node.get(), corr.get());
        assert_eq!(format!("{node}"), "node-3");
        assert_eq!(format!("{corr}"), "corr-3");
    }

    #[test]
    fn test_correlation_wraps() {
        let last = CorrelationId::new(i32::MAX);
        assert_eq!(last.wrapping_next().get(), i32::MIN);
    }

    #[test]
    fn test_identity_addr() {
        let seed = BrokerIdentity::seed("broker.example.com", 9092);
        assert_eq!(seed.addr(), "broker.example.com:9092");
        assert_eq!(format!("{seed}"), "broker.example.com:9092 (seed)");

        let known = BrokerIdentity::known("10.0.0.1", 9092, NodeId::new(1));
        assert_eq!(format!("{known}"), "10.0.0.1:9092 (node-1)");
    }
}
