//! The flusher: an external sink that owns the physical chunk bytes.
//!
//! The collector client treats the flusher as opaque. It asks for exactly two things: confirm
//! that a set of chunks is physically present (used to complete a resurrection), and delete a
//! set of chunks for good. How the flusher satisfies those requests — what it stores the bytes
//! in, how it batches, whether it talks to a queue in between — is none of this crate's business.

use std::fmt::Debug;

use async_trait::async_trait;
use cas_gc_catalog::ChunkHash;
use snafu::Snafu;

/// Errors a [`Flusher`] can report back to the collector client.
#[derive(Debug, Snafu)]
pub enum FlusherError {
    /// The flusher couldn't complete the request right now, but the same request is expected to
    /// succeed on retry (a timeout, a saturated queue, a dropped connection).
    #[snafu(display("flusher is temporarily unavailable: {source}"))]
    Transient {
        /// The underlying error from the flusher's transport.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The flusher rejected the request in a way retrying will not fix (a chunk the flusher has
    /// never heard of, a permissions error, a malformed request).
    #[snafu(display("flusher rejected the request: {source}"))]
    Fatal {
        /// The underlying error from the flusher's transport.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl FlusherError {
    /// Whether this error is worth retrying.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// The two operations the collector client needs from the physical chunk store.
#[async_trait]
pub trait Flusher: Debug + Send + Sync {
    /// Confirm that every chunk in `chunks` is physically present. Called during the
    /// resurrection handshake, after [`cas_gc_catalog::Catalog::reserve`] reports a chunk as a
    /// resurrection candidate and before [`cas_gc_catalog::Catalog::resurrect`] clears its
    /// `deleting_at` mark — so the metadata store is never told a chunk is safe before the
    /// flusher has actually looked.
    async fn flush_deletes(&self, chunks: &[ChunkHash]) -> Result<(), FlusherError>;

    /// Physically delete every chunk in `chunks`. Called after
    /// [`cas_gc_catalog::Catalog::update`] reports them as collection candidates. The metadata
    /// store row is already gone by this point; a failure here just means the bytes are
    /// reclaimed later by an out-of-band reaper rather than by this call.
    async fn delete_chunks(&self, chunks: &[ChunkHash]) -> Result<(), FlusherError>;
}

/// A [`Flusher`] backed by an [`object_store`] instance, one blob per chunk hash.
#[derive(Debug)]
pub struct ObjectStoreFlusher {
    store: std::sync::Arc<object_store::DynObjectStore>,
}

impl ObjectStoreFlusher {
    /// Wrap an object store. Chunk hashes are mapped to paths as `chunks/<hash>`.
    pub fn new(store: std::sync::Arc<object_store::DynObjectStore>) -> Self {
        Self { store }
    }

    fn path_for(chunk: &ChunkHash) -> object_store::path::Path {
        object_store::path::Path::from(format!("chunks/{chunk}"))
    }

    fn classify(err: object_store::Error) -> FlusherError {
        match &err {
            object_store::Error::NotFound { .. } => FlusherError::Fatal {
                source: Box::new(err),
            },
            _ => FlusherError::Transient {
                source: Box::new(err),
            },
        }
    }
}

#[async_trait]
impl Flusher for ObjectStoreFlusher {
    async fn flush_deletes(&self, chunks: &[ChunkHash]) -> Result<(), FlusherError> {
        for chunk in chunks {
            self.store
                .get(&Self::path_for(chunk))
                .await
                .map_err(Self::classify)?;
        }
        Ok(())
    }

    async fn delete_chunks(&self, chunks: &[ChunkHash]) -> Result<(), FlusherError> {
        for chunk in chunks {
            match self.store.delete(&Self::path_for(chunk)).await {
                // already gone is fine, the goal state is achieved either way
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(Self::classify(e)),
            }
        }
        Ok(())
    }
}

/// A [`Flusher`] that always succeeds immediately, for tests that don't care about the physical
/// store.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFlusher;

#[async_trait]
impl Flusher for NullFlusher {
    async fn flush_deletes(&self, _chunks: &[ChunkHash]) -> Result<(), FlusherError> {
        Ok(())
    }

    async fn delete_chunks(&self, _chunks: &[ChunkHash]) -> Result<(), FlusherError> {
        Ok(())
    }
}
