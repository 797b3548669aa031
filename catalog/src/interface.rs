//! Types and traits for interacting with the metadata store that holds the reference graph.
//!
//! The catalog owns two tables: `chunks` and `refs` (see the crate-level docs for the schema).
//! All mutation is expressed as one of the two [`Catalog`] operations, each a single
//! serializable transaction; no intermediate state is ever observable to another caller.

use std::fmt::Debug;

use async_trait::async_trait;
use iox_time::Time;
use snafu::Snafu;

/// The content hash that identifies a chunk, opaque to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkHash(String);

impl ChunkHash {
    /// Wrap an opaque hash string.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Borrow the underlying hash text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChunkHash {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ChunkHash {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// The kind of entity a reference originates from.
///
/// Stored as a `CHECK`-constrained text column rather than a native SQL enum so the reference
/// manager can bind it as a plain text array in the composite `UNNEST` queries described in the
/// design notes; the constraint still keeps an application bug from writing an unknown kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    /// A parent chunk pointing at a child chunk, enabling nested chunk graphs.
    Chunk,
    /// A transient pin held by an in-flight producer job.
    Job,
    /// A durable, application-level reference (a commit, a fileset).
    Semantic,
}

impl SourceType {
    /// The column value used to persist this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Job => "job",
            Self::Semantic => "semantic",
        }
    }

    /// Parse a persisted column value.
    ///
    /// # Panics
    ///
    /// Panics if `s` is not one of the three known kinds. The `CHECK` constraint on the `refs`
    /// table guarantees the column never holds anything else, so a mismatch here means the
    /// schema and this code have drifted out of sync.
    pub fn from_str(s: &str) -> Self {
        match s {
            "chunk" => Self::Chunk,
            "job" => Self::Job,
            "semantic" => Self::Semantic,
            other => panic!("unknown source_type {other:?} read back from storage"),
        }
    }
}

/// An edge in the reference graph: `source` (of kind `source_type`) depends on `chunk`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// The kind of entity holding the reference.
    pub source_type: SourceType,
    /// Opaque identifier within `source_type` (job id, parent chunk hash, or user string).
    pub source: String,
    /// The chunk being referenced.
    pub chunk: ChunkHash,
}

impl Reference {
    /// Construct a new reference edge.
    pub fn new(source_type: SourceType, source: impl Into<String>, chunk: impl Into<ChunkHash>) -> Self {
        Self {
            source_type,
            source: source.into(),
            chunk: chunk.into(),
        }
    }
}

/// A row of the `chunks` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// The chunk's content hash.
    pub hash: ChunkHash,
    /// Set when the chunk has been scheduled for deletion; `None` while referenced.
    pub deleting_at: Option<Time>,
}

/// Error kinds, independent of the concrete error payload.
///
/// Used by the serializable-transaction retry loop to decide whether to retry, and attached to
/// [`Error::ExhaustedRetries`] so the caller can see what kept failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transaction conflicted with a concurrent serializable transaction; retry it.
    SerializationConflict,
    /// The connection to the metadata store was lost or could not be obtained from the pool.
    ConnectionLost,
    /// A caller tried to add a reference to a chunk that has no chunk row and no prior reservation.
    MissingChunk,
    /// A caller tried to add a reference to a chunk that is marked `deleting_at` without reserving it first.
    ReferenceToDeletingChunk,
    /// A chunk being resurrected was physically deleted before the resurrection transaction ran.
    ResurrectionLost,
    /// The metadata store's schema does not match what this version of the catalog expects.
    SchemaMismatch,
    /// Could not establish a connection to the metadata store.
    ConnectFailed,
    /// A serializable-transaction retry loop exhausted its retry budget.
    ExhaustedRetries,
    /// Any other, unclassified metadata store error. Treated as fatal: it likely indicates a bug.
    Other,
}

/// Errors produced by the metadata store and reference manager.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A concurrent serializable transaction committed first; the caller should retry.
    #[snafu(display("serialization conflict against the reference graph: {source}"))]
    SerializationConflict {
        /// The underlying storage error.
        source: sqlx::Error,
    },

    /// The connection to the metadata store was lost mid-operation.
    #[snafu(display("lost connection to the metadata store: {source}"))]
    ConnectionLost {
        /// The underlying storage error.
        source: sqlx::Error,
    },

    /// `update` tried to add a reference whose target chunk has no row and no prior reservation.
    #[snafu(display(
        "cannot add a reference to chunk {chunk}: no such chunk exists; call reserve() first"
    ))]
    MissingChunk {
        /// The chunk that does not exist.
        chunk: ChunkHash,
    },

    /// `update` tried to add a reference to a chunk that is scheduled for deletion.
    #[snafu(display(
        "cannot add a reference to chunk {chunk}: it is scheduled for deletion; reserve it first to resurrect it"
    ))]
    ReferenceToDeletingChunk {
        /// The chunk that is marked deleting.
        chunk: ChunkHash,
    },

    /// A chunk's row vanished (was physically deleted) between the flush confirmation and the
    /// resurrection transaction that was meant to clear its `deleting_at` mark.
    #[snafu(display(
        "chunk {chunk} was deleted before its resurrection transaction committed; retry reservation"
    ))]
    ResurrectionLost {
        /// The chunk whose row vanished.
        chunk: ChunkHash,
    },

    /// The metadata store's schema does not match what this catalog expects.
    #[snafu(display("metadata store schema mismatch: {source}"))]
    SchemaMismatch {
        /// The underlying storage error.
        source: sqlx::Error,
    },

    /// Could not establish a connection to the metadata store.
    #[snafu(display("failed to connect to the metadata store: {source}"))]
    ConnectFailed {
        /// The underlying connection error.
        source: sqlx::Error,
    },

    /// The serializable-transaction retry loop exhausted its retry budget.
    #[snafu(display(
        "gave up after {retries} retries against the metadata store; last error was {last_kind:?}"
    ))]
    ExhaustedRetries {
        /// Number of attempts made.
        retries: usize,
        /// The kind of the last retriable error encountered.
        last_kind: ErrorKind,
    },

    /// An unclassified storage error. Treated as fatal; usually indicates a bug such as a
    /// constraint violation that should have been caught earlier.
    #[snafu(display("metadata store error: {source}"))]
    Other {
        /// The underlying storage error.
        source: sqlx::Error,
    },
}

impl Error {
    /// Classify this error for the retry loop and for [`Error::ExhaustedRetries`] reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SerializationConflict { .. } => ErrorKind::SerializationConflict,
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::MissingChunk { .. } => ErrorKind::MissingChunk,
            Self::ReferenceToDeletingChunk { .. } => ErrorKind::ReferenceToDeletingChunk,
            Self::ResurrectionLost { .. } => ErrorKind::ResurrectionLost,
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            Self::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Whether the serializable-transaction retry loop should retry this error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SerializationConflict | ErrorKind::ConnectionLost
        )
    }
}

/// A specialized `Result` for catalog operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The metadata store's reference manager: the transactional engine that mutates the reference
/// graph. Every mutating method is a single serializable transaction; callers never observe
/// intermediate state.
#[async_trait]
pub trait Catalog: Debug + Send + Sync {
    /// Idempotently create the `chunks` and `refs` tables (and supporting indexes) if they do
    /// not already exist. Safe to call on every process startup.
    async fn setup(&self) -> Result<()>;

    /// For a producer job and a set of chunk hashes: ensure each chunk has a persistent row,
    /// pin each one under a `(job, job_id, chunk)` reference, and report back the subset that
    /// were in the *deleting* state so the caller can flush and resurrect them.
    ///
    /// Chunks whose `deleting_at IS NOT NULL` are returned as resurrection candidates and do
    /// *not* receive a reference in this call; see [`Catalog::resurrect`].
    ///
    /// Empty `chunks` is a no-op that does not open a transaction.
    async fn reserve(&self, job_id: &str, chunks: &[ChunkHash]) -> Result<Vec<ChunkHash>>;

    /// The second phase of the resurrection handshake, run only after the caller has confirmed
    /// via the flusher that every chunk in `chunks` is physically present in object storage.
    ///
    /// Atomically clears `deleting_at` for each chunk and installs its pending
    /// `(job, job_id, chunk)` reference. If any chunk's row has vanished in the interim (the
    /// flusher's out-of-band reaper beat this call to it), no rows are mutated and
    /// [`Error::ResurrectionLost`] is returned naming the first such chunk.
    async fn resurrect(&self, job_id: &str, chunks: &[ChunkHash]) -> Result<()>;

    /// Atomically add `add` edges, remove `remove` edges, and remove every edge whose
    /// `(source_type, source)` matches any entry in `release_jobs` (implicitly `job`-typed).
    /// Then stamp `deleting_at = now()` on every chunk whose reference count just reached zero,
    /// and return that set of chunks (the collection candidates).
    ///
    /// `add` edges are logically inserted before `remove` edges are deleted, so a call that both
    /// releases a job and installs the job's former chunks under a semantic reference never
    /// exposes a transient zero-reference state.
    ///
    /// Adding an edge to a chunk that does not exist fails the whole transaction with
    /// [`Error::MissingChunk`]; adding an edge to a chunk with `deleting_at IS NOT NULL` fails
    /// with [`Error::ReferenceToDeletingChunk`]. Both are caller protocol violations: the caller
    /// was obligated to reserve the chunk first.
    ///
    /// Empty `add`, `remove`, and `release_jobs` together are a no-op that does not open a
    /// transaction.
    async fn update(
        &self,
        add: &[Reference],
        remove: &[Reference],
        release_jobs: &[String],
    ) -> Result<Vec<ChunkHash>>;

    /// Look up a single chunk's lifecycle row. Used by administrative tooling and tests; not
    /// part of the core reservation/update protocol.
    async fn get_chunk(&self, chunk: &ChunkHash) -> Result<Option<ChunkRecord>>;

    /// List the references currently targeting a chunk. Used by administrative tooling and
    /// tests; not part of the core reservation/update protocol.
    async fn references_for_chunk(&self, chunk: &ChunkHash) -> Result<Vec<Reference>>;
}
