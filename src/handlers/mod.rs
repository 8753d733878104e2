//! Domain events and the handler contract
//!
//! Jobs emit events through the [`EventBus`](event_bus::EventBus); handlers
//! registered for a trigger react to them. Handlers are instantiated fresh
//! per dispatch and never share state across events. Registration is an
//! explicit static list (see [`builtin::builtin_handlers`]), not runtime
//! discovery.

use anyhow::Result;
use async_trait::async_trait;

pub mod builtin;
pub mod event_bus;

pub use builtin::builtin_handlers;
pub use event_bus::EventBus;

/// Closed enumeration of domain event kinds. New kinds are additive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerTrigger {
    ProjectCreated,
    ProjectUpdated,
    ProjectRemoved,
    NewAsset,
    AssetUpdated,
    AssetRemoved,
    GithubPush,
    GithubPr,
    ContractUpgraded,
}

impl HandlerTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerTrigger::ProjectCreated => "project_created",
            HandlerTrigger::ProjectUpdated => "project_updated",
            HandlerTrigger::ProjectRemoved => "project_removed",
            HandlerTrigger::NewAsset => "new_asset",
            HandlerTrigger::AssetUpdated => "asset_updated",
            HandlerTrigger::AssetRemoved => "asset_removed",
            HandlerTrigger::GithubPush => "github_push",
            HandlerTrigger::GithubPr => "github_pr",
            HandlerTrigger::ContractUpgraded => "contract_upgraded",
        }
    }
}

/// Event payload handed to handlers: serialized snapshots of the entities
/// involved, keyed by role (e.g. "proxy", "new_implementation").
pub type EventContext = serde_json::Map<String, serde_json::Value>;

/// One unit of reactive logic, alive for a single dispatch.
#[async_trait]
pub trait Handler: Send {
    /// Process the event; the returned message is logged by the bus.
    async fn handle(&mut self) -> Result<String>;
}

/// Static registration unit: declares the triggers a handler reacts to and
/// produces a fresh handler instance per dispatch.
pub trait HandlerFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn triggers(&self) -> Vec<HandlerTrigger>;

    /// Build a handler bound to this event's context. Failures here are
    /// logged by the bus and do not affect sibling handlers.
    fn instantiate(
        &self,
        context: EventContext,
        trigger: HandlerTrigger,
    ) -> Result<Box<dyn Handler>>;
}
