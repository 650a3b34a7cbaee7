// Typed event subscription, replacing the source's per-component emitters
// (see design note on `EnhancedConnectionMonitor`-style inheritance/emitter sprawl).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::health::HealthStatus;
use crate::recovery::RecoveryPoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DurabilityEvent {
    OperationRegistered {
        operation_id: String,
        session_id: String,
    },
    OperationCompleted {
        operation_id: String,
        outcome: String,
    },
    ConflictResolved {
        operation_id: String,
        cancelled: Vec<String>,
        resolution: String,
    },
    HealthChanged {
        status: HealthStatus,
    },
    AnomalyDetected {
        backup_id: String,
        kind: String,
    },
    RecoveryStarted {
        session_id: Option<String>,
    },
    RecoveryCompleted {
        success: bool,
        recovery_point: Option<RecoveryPoint>,
    },
}

/// Narrow subscription interface each component emits into.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DurabilityEvent);
}

/// Sink that drops every event; used where no subscriber is configured.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: DurabilityEvent) {}
}

/// Sink that forwards events onto an unbounded channel for an external consumer.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DurabilityEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DurabilityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: DurabilityEvent) {
        // A dropped receiver means nobody is listening; emitting is best-effort.
        let _ = self.tx.send(event);
    }
}

pub fn null_sink() -> Arc<dyn EventSink> {
    Arc::new(NullSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(DurabilityEvent::OperationRegistered {
            operation_id: "op-1".into(),
            session_id: "s-1".into(),
        });
        let event = rx.recv().await.unwrap();
        matches!(event, DurabilityEvent::OperationRegistered { .. });
    }
}
