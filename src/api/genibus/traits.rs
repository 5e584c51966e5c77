/// Update handler traits
///
/// The bridge hands every decoded value to the registered handlers. The traits do not depend on a
/// particular delivery mechanism; the flume based handler is what the threaded master and the CLI
/// use.
use anyhow::{anyhow, Result};

use super::demux::TaskUpdate;

/// Trait for handling decoded task values
pub trait UpdateHandler: Send + Sync {
    /// Handle one freshly decoded value
    fn handle_update(&self, update: &TaskUpdate) -> Result<()>;

    /// Check if the handler wants the bridge to keep running
    ///
    /// Return false to stop the cycle loop gracefully.
    fn should_continue(&self) -> bool {
        true
    }
}

/// No-op handler that drops every update (useful for testing)
pub struct NoOpHandler;

impl UpdateHandler for NoOpHandler {
    fn handle_update(&self, _update: &TaskUpdate) -> Result<()> {
        Ok(())
    }
}

/// Logging handler that logs every update
pub struct LoggingHandler;

impl UpdateHandler for LoggingHandler {
    fn handle_update(&self, update: &TaskUpdate) -> Result<()> {
        log::info!(
            "device={}, task={}/{} ({}), value={:?}, unit={}",
            update.device_id,
            update.head_class,
            update.address,
            update.name,
            update.value,
            update.unit.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}

/// Handler that forwards updates over a flume channel
pub struct FlumeUpdateHandler {
    sender: flume::Sender<TaskUpdate>,
}

impl FlumeUpdateHandler {
    pub fn new(sender: flume::Sender<TaskUpdate>) -> Self {
        Self { sender }
    }

    /// Create a handler together with the receiving end of its channel.
    pub fn channel() -> (Self, flume::Receiver<TaskUpdate>) {
        let (sender, receiver) = flume::unbounded();
        (Self::new(sender), receiver)
    }
}

impl UpdateHandler for FlumeUpdateHandler {
    fn handle_update(&self, update: &TaskUpdate) -> Result<()> {
        self.sender
            .send(update.clone())
            .map_err(|err| anyhow!("Failed to forward update: {err}"))
    }

    fn should_continue(&self) -> bool {
        !self.sender.is_disconnected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::genibus::task::TaskValue;
    use chrono::Utc;

    fn update() -> TaskUpdate {
        TaskUpdate {
            device_id: "pump".to_string(),
            head_class: 2,
            address: 37,
            name: "h".to_string(),
            value: TaskValue::Number(1.5),
            unit: Some("bar".to_string()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_flume_handler_forwards() -> Result<()> {
        let (handler, receiver) = FlumeUpdateHandler::channel();
        handler.handle_update(&update())?;
        assert_eq!(receiver.try_recv()?.address, 37);
        assert!(handler.should_continue());

        drop(receiver);
        assert!(!handler.should_continue());
        assert!(handler.handle_update(&update()).is_err());
        Ok(())
    }

    #[test]
    fn test_update_serializes_flat() -> Result<()> {
        let json = serde_json::to_value(update())?;
        assert_eq!(json["value"], 1.5);
        assert_eq!(json["unit"], "bar");
        Ok(())
    }
}
