//! Errors surfaced by the collector client.

use cas_gc_catalog::ChunkHash;
use snafu::Snafu;

use crate::flusher::FlusherError;

/// Errors from [`crate::CollectorClient::reserve_chunks`] and
/// [`crate::CollectorClient::update_references`].
///
/// `update_references` never returns a flusher error: a flusher failure while deleting already-
/// collected chunks is logged and left for an out-of-band reaper, per the metadata store's
/// contract that a chunk row being gone is the only fact `update` guarantees.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The metadata store transaction itself failed. Includes protocol violations such as
    /// [`cas_gc_catalog::ErrorKind::MissingChunk`] and
    /// [`cas_gc_catalog::ErrorKind::ReferenceToDeletingChunk`], which are caller bugs and
    /// propagate unchanged.
    #[snafu(display("metadata store: {source}"))]
    Catalog {
        /// The underlying catalog error.
        source: cas_gc_catalog::Error,
    },

    /// The flusher could not confirm that a resurrected chunk is still physically present, after
    /// exhausting the retry budget for transient flusher errors.
    #[snafu(display(
        "flusher could not confirm chunk {chunk} is present for resurrection: {source}"
    ))]
    FlushDeletesFailed {
        /// The chunk whose presence could not be confirmed.
        chunk: ChunkHash,
        /// The underlying flusher error.
        source: FlusherError,
    },
}

impl Error {
    /// Whether the call is worth retrying from the top (a fresh `reserve`/`update` call).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Catalog { source } => source.is_retriable(),
            Self::FlushDeletesFailed { source, .. } => source.is_retriable(),
        }
    }
}

/// A specialized `Result` for collector client operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
