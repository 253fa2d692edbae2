//! Transport handle bound to a deployment domain.

use crate::error::{Result, SnapshotError};
use crate::transport::EventTransport;
use std::sync::Arc;
use tracing::{info, Span};

pub struct Connector {
    domain: String,
    transport: Arc<dyn EventTransport>,
    span: Span,
}

impl Connector {
    pub fn new(domain: impl Into<String>, transport: Arc<dyn EventTransport>, span: Span) -> Self {
        Self {
            domain: domain.into(),
            transport,
            span,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn transport(&self) -> &Arc<dyn EventTransport> {
        &self.transport
    }

    /// Fail unless the transport can be used.
    pub fn ensure_connected(&self) -> Result<()> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(SnapshotError::Disconnected)
        }
    }

    /// Close the transport. Every subscription made through it stops.
    pub fn disconnect(&self) {
        if self.transport.is_connected() {
            self.transport.disconnect();
            info!(parent: &self.span, domain = %self.domain, "Disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    #[test]
    fn test_disconnect() {
        let broker = MemoryBroker::new();
        let connector = Connector::new("gravity", Arc::new(broker.clone()), Span::none());

        assert_eq!(connector.domain(), "gravity");
        assert!(connector.ensure_connected().is_ok());

        connector.disconnect();
        connector.disconnect();
        assert!(!broker.is_connected());
        assert!(matches!(connector.ensure_connected(), Err(SnapshotError::Disconnected)));
    }
}
