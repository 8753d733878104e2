//! Event bus: fan-out dispatch of domain events to registered handlers
//!
//! Dispatch is best-effort and isolated per handler: one handler failing,
//! or panicking, never cancels its siblings and never propagates to the
//! caller. Within one `trigger_event` call all handlers run concurrently and
//! are jointly awaited; across calls there is no ordering guarantee.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{EventContext, HandlerFactory, HandlerTrigger};

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<HandlerTrigger, Vec<Arc<dyn HandlerFactory>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler factory for every trigger it declares.
    ///
    /// Registration is additive: registering the same factory twice makes it
    /// run twice per event. Callers register each handler once, at startup.
    pub async fn register_handler(&self, factory: Arc<dyn HandlerFactory>) {
        let mut handlers = self.handlers.write().await;
        for trigger in factory.triggers() {
            handlers
                .entry(trigger)
                .or_default()
                .push(Arc::clone(&factory));
            debug!(
                "Registered {} for trigger {}",
                factory.name(),
                trigger.as_str()
            );
        }
    }

    /// Number of factories registered for a trigger.
    pub async fn handler_count(&self, trigger: HandlerTrigger) -> usize {
        self.handlers
            .read()
            .await
            .get(&trigger)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Dispatch an event to every handler registered for `trigger` and wait
    /// for all of them. Never fails: missing handlers and handler errors are
    /// logged, not raised.
    pub async fn trigger_event(&self, trigger: HandlerTrigger, context: EventContext) {
        let factories = {
            let handlers = self.handlers.read().await;
            handlers.get(&trigger).cloned().unwrap_or_default()
        };

        if factories.is_empty() {
            warn!("No handlers registered for trigger {}", trigger.as_str());
            return;
        }

        info!(
            "Triggering {} handlers for {}",
            factories.len(),
            trigger.as_str()
        );

        let mut tasks = Vec::with_capacity(factories.len());
        for factory in factories {
            let name = factory.name();
            let mut handler = match factory.instantiate(context.clone(), trigger) {
                Ok(handler) => handler,
                Err(e) => {
                    error!(
                        "Handler {} failed to instantiate for {}: {}",
                        name,
                        trigger.as_str(),
                        e
                    );
                    continue;
                }
            };

            tasks.push(tokio::spawn(async move {
                match handler.handle().await {
                    Ok(message) => {
                        debug!("Handler {} completed: {}", name, message);
                    }
                    Err(e) => {
                        error!(
                            "Handler {} failed for {}: {}",
                            name,
                            trigger.as_str(),
                            e
                        );
                    }
                }
            }));
        }

        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                // A panicking handler is contained by its own task.
                error!(
                    "Handler task panicked during {}: {}",
                    trigger.as_str(),
                    e
                );
            }
        }
    }
}
