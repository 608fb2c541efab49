//! Error types for the tally aggregation engine.

use thiserror::Error;

/// The main error type for all tally operations.
///
/// Per-event errors ([`ClassificationError`], [`FilterError`]) are
/// recoverable: the pipeline counts them and keeps consuming. Store errors
/// are retried on the persistence path before a window is marked degraded.
/// Configuration errors are fatal only for the namespace they name.
#[derive(Error, Debug)]
pub enum TallyError {
    /// The event matched no group rule or no registered namespace.
    #[error("classification error: {0}")]
    Classification(#[from] ClassificationError),

    /// The event failed a namespace's filter program.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// A monitor query could not produce a record.
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// A store backend failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A namespace, group or pipeline configuration is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error during slab I/O operations.
    #[error("slab I/O error: {0}")]
    SlabIo(#[from] SlabIoError),

    /// Error while reading or writing a namespace snapshot.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The pipeline no longer accepts events.
    #[error("pipeline is shut down")]
    ShutDown,
}

/// Errors raised by the event classifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    /// No group rule matched the event and the rule set falls back to an error.
    #[error("no group rule matches domain '{domain}'")]
    NoMatchingGroup {
        /// The event's domain.
        domain: String,
    },

    /// A rule selected a group, but no namespace is registered for it.
    #[error("group '{group}' (domain '{domain}') has no registered namespace")]
    UnroutedGroup {
        /// The group that was selected.
        group: String,
        /// The event's domain.
        domain: String,
    },
}

impl ClassificationError {
    /// Returns the domain of the event that failed classification.
    pub fn domain(&self) -> &str {
        match self {
            Self::NoMatchingGroup { domain } | Self::UnroutedGroup { domain, .. } => domain,
        }
    }
}

/// Errors raised by a namespace's filter program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// The event did not satisfy the namespace predicate.
    #[error("event (domain '{domain}', code '{code}') rejected by namespace '{namespace}'")]
    Rejected {
        /// The namespace whose predicate failed.
        namespace: String,
        /// The event's domain.
        domain: String,
        /// The event's code.
        code: String,
    },

    /// The latency source named a field that is not numeric.
    #[error("namespace '{namespace}': latency field '{field}' is missing or not numeric")]
    InvalidLatency {
        /// The namespace whose program failed.
        namespace: String,
        /// The configured latency field.
        field: String,
    },
}

impl FilterError {
    /// Returns the namespace that rejected the event.
    pub fn namespace(&self) -> &str {
        match self {
            Self::Rejected { namespace, .. } | Self::InvalidLatency { namespace, .. } => namespace,
        }
    }
}

/// Errors raised by monitor queries. No partial record is ever returned.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// The namespace is not registered.
    #[error("unknown namespace '{namespace}'")]
    UnknownNamespace {
        /// The requested namespace.
        namespace: String,
    },

    /// The store could not serve the window range.
    #[error("namespace '{namespace}': range read failed: {source}")]
    Range {
        /// The requested namespace.
        namespace: String,
        /// The underlying store error.
        #[source]
        source: StoreError,
    },
}

impl MonitorError {
    /// Returns the namespace the query was issued against.
    pub fn namespace(&self) -> &str {
        match self {
            Self::UnknownNamespace { namespace } | Self::Range { namespace, .. } => namespace,
        }
    }
}

/// Errors raised by window store backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend is temporarily unable to serve the request.
    #[error("store unavailable for namespace '{namespace}': {reason}")]
    Unavailable {
        /// The namespace being accessed.
        namespace: String,
        /// Description of the failure.
        reason: String,
    },

    /// The namespace was never registered with this backend.
    #[error("namespace '{namespace}' is not registered with the store")]
    UnregisteredNamespace {
        /// The namespace being accessed.
        namespace: String,
    },

    /// A window carried a metric field the namespace layout does not declare.
    #[error("namespace '{namespace}' has no column for metric field '{field}'")]
    UnknownField {
        /// The namespace being written.
        namespace: String,
        /// The undeclared field.
        field: String,
    },

    /// The store directory could not be created or accessed.
    #[error("failed to access store directory '{path}': {source}")]
    DirectoryAccess {
        /// The path that could not be accessed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The metadata file (meta.json) is corrupted or invalid.
    #[error("corrupted metadata file: {reason}")]
    CorruptedMetadata {
        /// Description of what was invalid about the metadata.
        reason: String,
    },

    /// An existing namespace slab was created with a different layout.
    #[error(
        "namespace '{namespace}': existing layout hash {existing:x} does not match expected {expected:x}"
    )]
    LayoutMismatch {
        /// The namespace whose layout changed.
        namespace: String,
        /// Hash recorded in the existing store.
        existing: u64,
        /// Hash of the configuration being registered.
        expected: u64,
    },

    /// Failed to serialize or parse metadata JSON.
    #[error("failed to serialize metadata: {0}")]
    MetadataSerialize(#[from] serde_json::Error),

    /// A slab operation failed.
    #[error(transparent)]
    Slab(#[from] SlabIoError),
}

/// Errors detected while loading or validating configuration.
///
/// A `ConfigError` for one namespace never prevents other namespaces from
/// loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// The file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration file is not valid JSON or misses required fields.
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// The file path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A required field is empty.
    #[error("namespace '{namespace}': field '{field}' must not be empty")]
    MissingField {
        /// The namespace being validated (may be empty itself).
        namespace: String,
        /// The empty field.
        field: &'static str,
    },

    /// Granularity is zero or below one millisecond.
    #[error("namespace '{namespace}': granularity must be at least 1ms")]
    InvalidGranularity {
        /// The namespace being validated.
        namespace: String,
    },

    /// Cardinality is zero or too large.
    #[error("namespace '{namespace}': invalid cardinality {cardinality} (must be 1..={max})")]
    InvalidCardinality {
        /// The namespace being validated.
        namespace: String,
        /// The configured cardinality.
        cardinality: u32,
        /// The largest accepted cardinality.
        max: u32,
    },

    /// A filter, combine or monitor program is inconsistent.
    #[error("namespace '{namespace}': invalid program: {reason}")]
    InvalidProgram {
        /// The namespace being validated.
        namespace: String,
        /// Description of the inconsistency.
        reason: String,
    },

    /// Two configuration files declare the same namespace.
    #[error("namespace '{namespace}' is declared more than once")]
    DuplicateNamespace {
        /// The duplicated name.
        namespace: String,
    },

    /// The namespace's store type cannot be served by this pipeline.
    #[error("namespace '{namespace}': store type '{store_type}' unavailable: {reason}")]
    UnsupportedStore {
        /// The namespace being registered.
        namespace: String,
        /// The requested store type.
        store_type: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// The group rule set is invalid.
    #[error("invalid group rules: {reason}")]
    InvalidGroupRules {
        /// Description of what is invalid.
        reason: String,
    },
}

/// Errors that can occur during slab I/O operations.
#[derive(Error, Debug)]
pub enum SlabIoError {
    /// Failed to read from a slab file.
    #[error("failed to read slab '{path}': {source}")]
    ReadFailed {
        /// The slab file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create or write a slab file.
    #[error("failed to write slab '{path}': {source}")]
    WriteFailed {
        /// The slab file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to sync slab file to disk.
    #[error("failed to sync slab '{path}' to disk: {source}")]
    SyncFailed {
        /// The slab file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Slab file is corrupted or has invalid format.
    #[error("slab '{path}' is corrupted: {reason}")]
    CorruptedSlab {
        /// The slab file path.
        path: String,
        /// Description of the corruption.
        reason: String,
    },

    /// Attempted to access beyond slab boundaries.
    #[error("access beyond slab bounds: slot {slot} column {column} (slots {slot_count}, columns {field_count})")]
    BoundsViolation {
        /// The requested slot.
        slot: u32,
        /// The requested column.
        column: u32,
        /// Slots in the slab.
        slot_count: u32,
        /// Value columns in the slab.
        field_count: u32,
    },
}

/// Errors that can occur while saving or restoring namespace snapshots.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Failed to read a snapshot file.
    #[error("failed to load snapshot from '{path}': {source}")]
    Load {
        /// The snapshot file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse a snapshot file.
    #[error("failed to parse snapshot from '{path}': {source}")]
    Parse {
        /// The snapshot file path.
        path: String,
        /// The underlying JSON parsing error.
        #[source]
        source: serde_json::Error,
    },

    /// Failed to write a snapshot file.
    #[error("failed to save snapshot to '{path}': {source}")]
    Save {
        /// The snapshot file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize a snapshot.
    #[error("failed to serialize snapshot: {source}")]
    Serialize {
        /// The underlying JSON serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// The snapshot was taken with a different granularity.
    #[error("snapshot for '{namespace}' has granularity {found_ns}ns, expected {expected_ns}ns")]
    GranularityMismatch {
        /// The namespace being restored.
        namespace: String,
        /// Granularity recorded in the snapshot.
        found_ns: u64,
        /// Granularity of the current configuration.
        expected_ns: u64,
    },
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;

/// Type alias for results returned by store backends.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
