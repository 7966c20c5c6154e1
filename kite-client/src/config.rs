//! Client configuration.

use std::sync::Arc;

use kite_core::Limits;

use crate::sasl::Mechanism;

/// Configuration shared by every connection the client opens.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client ID sent in every request header, if any.
    pub client_id: Option<String>,
    /// Software name reported during ApiVersions negotiation.
    pub software_name: String,
    /// Software version reported during ApiVersions negotiation.
    pub software_version: String,
    /// Resource limits.
    pub limits: Limits,
    /// SASL mechanism, when the cluster requires authentication.
    pub sasl: Option<Arc<dyn Mechanism>>,
}

impl ClientConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client_id: Some("kite".to_string()),
            software_name: "kite".to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            limits: Limits::new(),
            sasl: None,
        }
    }

    /// Sets the client ID, or clears it with `None`.
    #[must_use]
    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    /// Sets the software name and version reported to brokers.
    #[must_use]
    pub fn with_software(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.software_name = name.into();
        self.software_version = version.into();
        self
    }

    /// Overrides the resource limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Enables SASL authentication with the given mechanism.
    #[must_use]
    pub fn with_sasl(mut self, mechanism: Arc<dyn Mechanism>) -> Self {
        self.sasl = Some(mechanism);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasl::Plain;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new();
        assert_eq!(config.client_id.as_deref(), Some("kite"));
        assert!(config.sasl.is_none());
        assert!(config.limits.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = ClientConfig::new()
            .with_client_id(None)
            .with_software("my-app", "1.2.3")
            .with_sasl(Arc::new(Plain::new("user", "pass")));

        assert!(config.client_id.is_none());
        assert_eq!(config.software_name, "my-app");
        assert_eq!(config.software_version, "1.2.3");
        assert!(config.sasl.is_some());
    }
}
