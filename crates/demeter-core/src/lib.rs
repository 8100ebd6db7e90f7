//! demeter-core: the harvesting engine.
//!
//! A concurrent fetch scheduler, a resilience middleware chain (circuit
//! breaker, rate limiter, dedup filter) guarding every outbound fetch, and
//! driver-based two-phase extraction turning raw portal pages into
//! fingerprinted structured records.

pub mod circuit_breaker;
pub mod dedup;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod normalize;
pub mod rate_limit;
pub mod records;
pub mod store;
pub mod target;
pub mod testutil;
pub mod traits;

pub use engine::{EngineConfig, HarvestEngine, RunSummary, SiteMapEntry, SiteMapOutcome};
pub use error::AppError;
pub use fingerprint::{compute_hash, fingerprint_fields};
pub use records::{EntityType, ExtractedRecord, RecordFields, RelationshipRecord};
pub use store::{KeyedStore, MemoryStore};
pub use target::{CrawlTarget, HarvestMode};
pub use traits::{Fetcher, PersistenceSink, RenderClient};
