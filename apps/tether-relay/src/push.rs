use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    /// The target socket is gone; its registry record is stale.
    #[error("connection {0} is gone")]
    Gone(String),
    #[error("push to {connection_id} failed: {reason}")]
    Failed {
        connection_id: String,
        reason: String,
    },
}

/// Delivers a serialized frame to a connection by id.
#[async_trait]
pub trait Push: Send + Sync {
    async fn push(&self, connection_id: &str, frame: String) -> Result<(), PushError>;
}

/// In-process delivery to sockets accepted by this relay.
#[derive(Debug, Default)]
pub struct PushHub {
    connections: DashMap<String, mpsc::UnboundedSender<String>>,
}

impl PushHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket; frames pushed to `connection_id` arrive on the receiver.
    pub fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(connection_id.to_string(), tx);
        rx
    }

    pub fn unregister(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl Push for PushHub {
    async fn push(&self, connection_id: &str, frame: String) -> Result<(), PushError> {
        let sender = self
            .connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PushError::Gone(connection_id.to_string()))?;
        if sender.send(frame).is_err() {
            debug!(connection = %connection_id, "socket writer closed; dropping sender");
            self.connections
                .remove_if(connection_id, |_, tx| tx.same_channel(&sender));
            return Err(PushError::Gone(connection_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn delivers_to_registered_connection() {
        let hub = PushHub::new();
        let mut rx = hub.register("c1");
        hub.push("c1", "hello".into()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_and_closed_connections_are_gone() {
        let hub = PushHub::new();
        assert_eq!(
            hub.push("nobody", "x".into()).await,
            Err(PushError::Gone("nobody".into()))
        );

        let rx = hub.register("c1");
        drop(rx);
        assert!(matches!(
            hub.push("c1", "x".into()).await,
            Err(PushError::Gone(_))
        ));
        assert!(!hub.is_connected("c1"));
    }
}
