//! # tally
//!
//! Namespace-scoped windowed event classification and aggregation engine.
//!
//! tally consumes a stream of events, routes each one to a namespace via
//! ordered group rules, filters and reduces it into fixed-granularity time
//! buckets, persists every bucket to a pluggable window store, and answers
//! monitor queries that fold the most recent buckets into one record.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Per-namespace configuration: granularity, cardinality, store type and
//!   filter, combine and monitor programs are plain data
//! - Bounded memory: each namespace retains at most `cardinality` live buckets
//! - Write-through persistence on a bounded queue per namespace, with retry
//!   and degradation instead of dropped windows
//! - Pluggable stores: in-memory, memory-mapped slab, and a write-through
//!   cache over the slab
//! - Monitor queries never return partial records
//! - Monitor records and counters render in the Prometheus text format,
//!   with optional latency histograms
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tally::program::{CodeClass, CodeMatch, FilterProgram, Predicate};
//! use tally::{Event, NamespaceConfig, Pipeline, PipelineConfig, Registry};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // Count events of domain G1, tracking ERR1 as a technical error.
//! let filter = FilterProgram::new(
//!     Predicate::eq("domain", "G1"),
//!     vec![CodeClass::new("tech_error", CodeMatch::Equals("ERR1".to_string()), true)],
//! );
//! let ns1 = NamespaceConfig::new("NS1", "G1", Duration::from_secs(60), 10, filter)?;
//!
//! let registry = Registry::from_parts(None, vec![ns1])?;
//! let pipeline = Pipeline::start(registry, PipelineConfig::default()).await?;
//!
//! pipeline.ingest(&Event::new("G1", "OK", 0)).await?;
//! pipeline.ingest(&Event::new("G1", "ERR1", 10_000_000_000)).await?;
//!
//! let record = pipeline.monitor("NS1", 60_000_000_000).await?;
//! assert_eq!(record.metric("total"), 2.0);
//! assert_eq!(record.metric("tech_error"), 1.0);
//!
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Pipeline`]: Owns every stage; ingest, monitor, tick, shutdown
//! - [`Registry`]: Loads namespaces and group rules from a config directory
//! - [`NamespaceConfig`]: Granularity, cardinality, store type and programs
//! - [`WindowStore`]: Async persistence trait implemented by every adapter
//! - [`MonitorRecord`]: Folded metrics for one namespace at a point in time
//!
//! ## Modules
//!
//! For lower-level access, the individual modules are also public:
//!
//! - [`event`]: Input event model
//! - [`program`]: Filter, combine and monitor programs
//! - [`namespace`]: Namespace and group rule configuration
//! - [`registry`]: Configuration directory loading
//! - [`classify`]: Group rule evaluation
//! - [`filter`]: Filter program evaluation
//! - [`window`]: Bucket arithmetic, window state and live cells
//! - [`reduce`]: Per-namespace window reduction and eviction
//! - [`store`]: Store trait, memory store and store routing
//! - [`slab`]: Raw memory-mapped slab format
//! - [`ring`]: Bucket ring over a slab
//! - [`durable`]: Directory-backed durable store
//! - [`cache`]: Write-through cache over a store
//! - [`persist`]: Persistence queues and writer tasks
//! - [`monitor`]: Monitor query engine
//! - [`checkpoint`]: Snapshot files
//! - [`config`]: Pipeline configuration
//! - [`stats`]: Pipeline counters
//! - [`export`]: Prometheus text exposition
//! - [`pipeline`]: Stage wiring and lifecycle
//! - [`error`]: Error types

pub mod cache;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod durable;
pub mod error;
pub mod event;
pub mod export;
pub mod filter;
pub mod monitor;
pub mod namespace;
pub mod persist;
pub mod pipeline;
pub mod program;
pub mod reduce;
pub mod registry;
pub mod ring;
pub mod slab;
pub mod stats;
pub mod store;
pub mod window;

// Re-export primary API types at crate root for convenience.
pub use config::PipelineConfig;
pub use error::{Result, TallyError};
pub use event::Event;
pub use monitor::MonitorRecord;
pub use namespace::{NamespaceConfig, StoreType};
pub use pipeline::{Ingested, Pipeline};
pub use registry::Registry;
pub use store::WindowStore;
pub use window::WindowState;
