pub mod aggregate;
pub mod classifier;
pub mod config;
pub mod entity;
pub mod orchestrator;
pub mod policy;
pub mod rate_gate;
pub mod source;
pub mod store;

pub use aggregate::{aggregate, Aggregate, AggregateError};
pub use classifier::{ClassifierClient, ClassifierError, Scorer};
pub use config::Config;
pub use entity::{Entity, SourceKind};
pub use orchestrator::{Orchestrator, Outcome, PipelineSettings, RunSummary};
pub use policy::{decide, Verdict};
pub use rate_gate::RateGate;
pub use source::{SourceAdapter, SourceError};
pub use store::{DedupCache, MemoryStore, PersistenceError, ResultStore, SqliteStore};
