//! External collaborator interfaces
//!
//! Jobs never talk to explorers, embedding backends or bounty platforms
//! directly; they go through the narrow traits defined here so tests can
//! substitute mocks.

pub mod agent;
pub mod embeddings;
pub mod explorer;
pub mod immunefi;
pub mod sources;

pub use agent::{Agent, AgentOutcome};
pub use embeddings::{EmbeddingClient, HttpEmbeddingClient};
pub use explorer::{EvmExplorer, Explorer, ExplorerKind, ProxyUpgradeEvent};
pub use immunefi::{ImmunefiClient, PlatformAsset, PlatformIndexer, PlatformProject};
pub use sources::{HttpSourceFetcher, SourceFetcher};
