//! Collaborator clients.
//!
//! - [`client`]: the uniform [`AgentClient`] interface and the capability registry
//! - [`adapters`]: per-collaborator protocols and their `AgentClient` adapters
//! - [`fakes`]: scripted in-memory collaborators for tests and the CLI

pub mod adapters;
pub mod client;
pub mod error;
pub mod fakes;

pub use adapters::{
    AnalysisClient, AnalyticsClient, AnalyticsCollector, CodeAnalyzer, Collaborators,
    ContextClient, ContextRetriever, MetadataClient, RepositoryIntegration,
};
pub use client::{AgentClient, AgentRegistry, Capability, InvocationContext, StageInput};
pub use error::{AgentError, AgentResult};
