//! Publish/subscribe with subscriber isolation
//!
//! Each subscription owns an unbounded channel drained by its own tokio
//! task. Publishing is therefore fire-and-continue: a slow or failing
//! subscriber can never block a publisher or roll back the state
//! transition that produced the event. Within one subscription, events
//! arrive in the order the publishing operation emitted them.

use crate::envelope::{EventEnvelope, EventKind};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Handler invoked for every event of a subscribed kind
///
/// Errors returned from [`handle`](EventHandler::handle) are logged and
/// dropped at the bus boundary; they never reach the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// React to one event
    async fn handle(&self, event: EventEnvelope) -> Result<()>;
}

struct Subscription {
    name: String,
    sender: mpsc::UnboundedSender<EventEnvelope>,
}

/// In-process event bus with per-kind subscriptions
///
/// Delivery is at-least-once. Ordering is guaranteed per subscription
/// for events published by the same logical operation; there is no
/// ordering guarantee across kinds or across subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<RwLock<HashMap<EventKind, Vec<Subscription>>>>,
}

impl EventBus {
    /// Create a bus with no subscriptions
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to one event kind
    ///
    /// Spawns the drain task for the subscription; the task ends when
    /// the bus (and with it the sender) is dropped.
    pub async fn subscribe(
        &self,
        kind: EventKind,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<EventEnvelope>();

        {
            let task_name = name.clone();
            tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    let event_id = event.event_id;
                    let correlation_id = event.correlation_id;
                    if let Err(err) = handler.handle(event).await {
                        warn!(
                            subscriber = %task_name,
                            %event_id,
                            %correlation_id,
                            "subscriber failed, event dropped for this subscriber: {err:#}"
                        );
                    }
                }
                debug!(subscriber = %task_name, "subscription drained and closed");
            });
        }

        debug!(subscriber = %name, %kind, "subscribed");
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions
            .entry(kind)
            .or_default()
            .push(Subscription { name, sender });
    }

    /// Publish one event to every subscriber of its kind
    ///
    /// Never fails and never waits for handlers. A subscriber whose
    /// drain task is gone is pruned on the next publish of that kind.
    pub async fn publish(&self, event: &EventEnvelope) {
        debug!(
            kind = %event.kind,
            event_id = %event.event_id,
            correlation_id = %event.correlation_id,
            "publishing event"
        );

        let mut dead = false;
        {
            let subscriptions = self.subscriptions.read().await;
            if let Some(subs) = subscriptions.get(&event.kind) {
                for sub in subs {
                    if sub.sender.send(event.clone()).is_err() {
                        warn!(subscriber = %sub.name, kind = %event.kind, "subscriber gone, dropping");
                        dead = true;
                    }
                }
            }
        }

        if dead {
            let mut subscriptions = self.subscriptions.write().await;
            if let Some(subs) = subscriptions.get_mut(&event.kind) {
                subs.retain(|sub| !sub.sender.is_closed());
            }
        }
    }

    /// Number of live subscriptions for a kind
    pub async fn subscriber_count(&self, kind: EventKind) -> usize {
        let subscriptions = self.subscriptions.read().await;
        subscriptions.get(&kind).map_or(0, Vec::len)
    }
}
