//! Lifecycle event delivery and message-consumer cleanup.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::engine::types::{BasicStatus, WorkflowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Terminated,
    Interrupted,
    /// A dead message consumer was unregistered while terminating.
    ConsumerExpired,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Terminated => write!(f, "terminated"),
            EventKind::Interrupted => write!(f, "interrupted"),
            EventKind::ConsumerExpired => write!(f, "consumer_expired"),
        }
    }
}

/// Context captured when a branch changes lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSnapshot {
    pub workflow_id: WorkflowId,
    pub branch_id: String,
    pub record_id: Uuid,
    pub step: i64,
    pub service_name: String,
    pub basic_status: BasicStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub snapshot: EventSnapshot,
}

/// Fire-and-forget event sink. Callers log failures and carry on.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, kind: EventKind, snapshot: &EventSnapshot) -> Result<()>;
}

/// Writes events to the log.
pub struct LogEventBus;

#[async_trait]
impl EventBus for LogEventBus {
    async fn publish(&self, kind: EventKind, snapshot: &EventSnapshot) -> Result<()> {
        info!(
            event = %kind,
            workflow_id = %snapshot.workflow_id,
            branch_id = %snapshot.branch_id,
            step = snapshot.step,
            "Lifecycle event"
        );
        Ok(())
    }
}

/// Broadcasts events to in-process subscribers.
pub struct ChannelEventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl ChannelEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn publish(&self, kind: EventKind, snapshot: &EventSnapshot) -> Result<()> {
        self.tx
            .send(LifecycleEvent {
                kind,
                snapshot: snapshot.clone(),
            })
            .map(|_| ())
            .map_err(|_| anyhow!("no subscribers for {} event", kind))
    }
}

/// Registry of message consumers waiting on workflow steps.
#[async_trait]
pub trait ConsumerRegistry: Send + Sync {
    /// Drop the registration keyed by a step record id.
    async fn unregister(&self, context_id: Uuid) -> Result<()>;

    /// Definition name behind a service instance, when known.
    async fn service_definition(&self, _service_name: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

pub struct NoopConsumerRegistry;

#[async_trait]
impl ConsumerRegistry for NoopConsumerRegistry {
    async fn unregister(&self, _context_id: Uuid) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryConsumerRegistry {
    registered: Mutex<HashSet<Uuid>>,
    definitions: Mutex<HashMap<String, String>>,
}

impl MemoryConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, context_id: Uuid) {
        if let Ok(mut registered) = self.registered.lock() {
            registered.insert(context_id);
        }
    }

    pub fn define_service(&self, service_name: &str, definition: &str) {
        if let Ok(mut definitions) = self.definitions.lock() {
            definitions.insert(service_name.to_string(), definition.to_string());
        }
    }

    pub fn is_registered(&self, context_id: Uuid) -> bool {
        self.registered
            .lock()
            .map(|registered| registered.contains(&context_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ConsumerRegistry for MemoryConsumerRegistry {
    async fn unregister(&self, context_id: Uuid) -> Result<()> {
        let mut registered = self
            .registered
            .lock()
            .map_err(|_| anyhow!("consumer registry poisoned"))?;
        registered.remove(&context_id);
        Ok(())
    }

    async fn service_definition(&self, service_name: &str) -> Result<Option<String>> {
        let definitions = self
            .definitions
            .lock()
            .map_err(|_| anyhow!("consumer registry poisoned"))?;
        Ok(definitions.get(service_name).cloned())
    }
}
