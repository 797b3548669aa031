//! The collector client: the façade that sequences metadata store transactions with flusher
//! calls so the two stay consistent without a distributed transaction between them.

use std::{ops::ControlFlow, sync::Arc};

use backoff::BackoffConfig;
use cas_gc_catalog::{Catalog, ChunkHash, Reference};
use observability_deps::tracing::warn;
use snafu::ResultExt;

use crate::{
    error::{CatalogSnafu, FlushDeletesFailedSnafu, Result},
    flusher::{Flusher, FlusherError},
};

/// Retry `op` with backoff as long as it keeps reporting [`FlusherError::Transient`]; a
/// [`FlusherError::Fatal`] breaks out immediately rather than spending the retry budget on an
/// error retrying cannot fix. Returns the last error seen, whether the budget was exhausted or
/// the break was immediate.
async fn retry_flusher_call<F, Fut>(
    retry_config: &BackoffConfig,
    task_name: &str,
    mut op: F,
) -> std::result::Result<(), FlusherError>
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = std::result::Result<(), FlusherError>> + Send,
{
    let mut backoff = backoff::Backoff::new(retry_config);
    let last_err = Arc::new(std::sync::Mutex::new(None));
    let last_err2 = Arc::clone(&last_err);

    let outcome = backoff
        .retry_with_backoff(task_name, move || {
            let fut = op();
            let last_err = Arc::clone(&last_err2);
            async move {
                match fut.await {
                    Ok(()) => ControlFlow::Break(Ok(())),
                    Err(e) if e.is_retriable() => {
                        *last_err.lock().unwrap() = Some(clone_flusher_error(&e));
                        ControlFlow::Continue(e)
                    }
                    Err(e) => ControlFlow::Break(Err(e)),
                }
            }
        })
        .await;

    match outcome {
        Ok(result) => result,
        Err(_exhausted) => Err(last_err
            .lock()
            .unwrap()
            .take()
            .expect("retry loop only exhausts after observing at least one retriable error")),
    }
}

/// [`FlusherError`] wraps a `Box<dyn Error>`, which isn't `Clone`; rebuild an equivalent error
/// from its rendered message for reporting once the retry budget is spent.
fn clone_flusher_error(err: &FlusherError) -> FlusherError {
    let message = err.to_string();
    match err {
        FlusherError::Transient { .. } => FlusherError::Transient {
            source: message.into(),
        },
        FlusherError::Fatal { .. } => FlusherError::Fatal {
            source: message.into(),
        },
    }
}

/// Sequences [`Catalog`] transactions with [`Flusher`] calls on behalf of a single logical
/// garbage collector, implementing the resurrection handshake and the deferred-delete behavior
/// described on [`Catalog::reserve`] and [`Catalog::update`].
#[derive(Debug)]
pub struct CollectorClient {
    catalog: Arc<dyn Catalog>,
    flusher: Arc<dyn Flusher>,
    flusher_retry_config: BackoffConfig,
}

impl CollectorClient {
    /// Build a collector client over a metadata store and a flusher, retrying transient flusher
    /// errors with the given backoff policy.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        flusher: Arc<dyn Flusher>,
        flusher_retry_config: BackoffConfig,
    ) -> Self {
        Self {
            catalog,
            flusher,
            flusher_retry_config,
        }
    }

    /// Reserve `chunks` on behalf of `job_id`, resurrecting any that were marked for deletion.
    ///
    /// Runs the full resurrection handshake: [`Catalog::reserve`] reports which chunks need
    /// resurrecting, the flusher is asked to confirm each one is still physically present, and
    /// only once that is confirmed does [`Catalog::resurrect`] clear the chunk's `deleting_at`
    /// mark and install the job's reference. If the flusher cannot confirm presence after
    /// retrying transient errors, the call fails without touching the metadata store again; the
    /// chunk is left marked for deletion and the caller should not assume it reserved anything.
    pub async fn reserve_chunks(&self, job_id: &str, chunks: &[ChunkHash]) -> Result<()> {
        let resurrecting = self
            .catalog
            .reserve(job_id, chunks)
            .await
            .context(CatalogSnafu)?;

        if resurrecting.is_empty() {
            return Ok(());
        }

        if let Err(e) = retry_flusher_call(&self.flusher_retry_config, "flush_deletes", || {
            self.flusher.flush_deletes(&resurrecting)
        })
        .await
        {
            return FlushDeletesFailedSnafu {
                chunk: resurrecting[0].clone(),
                source: e,
            }
            .fail();
        }

        self.catalog
            .resurrect(job_id, &resurrecting)
            .await
            .context(CatalogSnafu)
    }

    /// Apply a set of reference graph edits and delete any chunk the metadata store reports as
    /// newly unreferenced.
    ///
    /// The metadata store transaction is the source of truth: once [`Catalog::update`] commits,
    /// the returned chunks are gone as far as any caller of this crate is concerned, whether or
    /// not the flusher manages to delete their bytes on the first try. A flusher failure here is
    /// logged and left for the flusher's own out-of-band reaper; it does not fail the call.
    pub async fn update_references(
        &self,
        add: &[Reference],
        remove: &[Reference],
        release_jobs: &[String],
    ) -> Result<()> {
        let to_delete = self
            .catalog
            .update(add, remove, release_jobs)
            .await
            .context(CatalogSnafu)?;

        if to_delete.is_empty() {
            return Ok(());
        }

        let outcome = retry_flusher_call(&self.flusher_retry_config, "delete_chunks", || {
            self.flusher.delete_chunks(&to_delete)
        })
        .await;

        if let Err(e) = outcome {
            warn!(
                chunks = to_delete.len(),
                error = %e,
                "flusher failed to delete collected chunks; leaving them for the out-of-band reaper",
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use cas_gc_catalog::{mem::MemCatalog, SourceType};
    use iox_time::{MockProvider, Time};

    use super::*;
    use crate::{
        error::Error,
        flusher::{FlusherError, NullFlusher},
    };

    fn retry_config() -> BackoffConfig {
        BackoffConfig {
            init_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(2),
            base: 2.,
            max_retries: Some(3),
        }
    }

    fn client(flusher: Arc<dyn Flusher>) -> CollectorClient {
        let catalog = Arc::new(MemCatalog::new(Arc::new(MockProvider::new(
            Time::from_timestamp(0, 0),
        ))));
        CollectorClient::new(catalog, flusher, retry_config())
    }

    /// A flusher that fails every call with a fatal error; used to exercise the surfaced-error
    /// paths without waiting out a real retry budget.
    #[derive(Debug, Default)]
    struct AlwaysFatalFlusher;

    #[async_trait]
    impl Flusher for AlwaysFatalFlusher {
        async fn flush_deletes(&self, _chunks: &[ChunkHash]) -> Result<(), FlusherError> {
            Err(FlusherError::Fatal {
                source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "nope")),
            })
        }

        async fn delete_chunks(&self, _chunks: &[ChunkHash]) -> Result<(), FlusherError> {
            Err(FlusherError::Fatal {
                source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "nope")),
            })
        }
    }

    /// A flusher whose deletes always fail; used to confirm `update_references` absorbs the
    /// error instead of propagating it.
    #[derive(Debug, Default)]
    struct DeleteFailsFlusher {
        delete_calls: AtomicUsize,
    }

    #[async_trait]
    impl Flusher for DeleteFailsFlusher {
        async fn flush_deletes(&self, _chunks: &[ChunkHash]) -> Result<(), FlusherError> {
            Ok(())
        }

        async fn delete_chunks(&self, _chunks: &[ChunkHash]) -> Result<(), FlusherError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            Err(FlusherError::Transient {
                source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "busy")),
            })
        }
    }

    #[tokio::test]
    async fn reserve_then_update_round_trip_with_null_flusher() {
        let c = client(Arc::new(NullFlusher));
        c.reserve_chunks("job1", &["h1".into()]).await.unwrap();
        let to_delete = c
            .update_references(&[], &[], &["job1".to_string()])
            .await;
        assert!(to_delete.is_ok());
    }

    #[tokio::test]
    async fn resurrection_handshake_calls_flusher_before_clearing_deleting_at() {
        let catalog = Arc::new(MemCatalog::new(Arc::new(MockProvider::new(
            Time::from_timestamp(0, 0),
        ))));
        let c = CollectorClient::new(
            Arc::clone(&catalog) as Arc<dyn Catalog>,
            Arc::new(NullFlusher),
            retry_config(),
        );

        c.reserve_chunks("job1", &["h1".into()]).await.unwrap();
        c.update_references(&[], &[], &["job1".to_string()])
            .await
            .unwrap();
        assert!(catalog
            .get_chunk(&"h1".into())
            .await
            .unwrap()
            .unwrap()
            .deleting_at
            .is_some());

        // job2 reserving h1 triggers the resurrection handshake
        c.reserve_chunks("job2", &["h1".into()]).await.unwrap();
        assert!(catalog
            .get_chunk(&"h1".into())
            .await
            .unwrap()
            .unwrap()
            .deleting_at
            .is_none());
        let refs = catalog.references_for_chunk(&"h1".into()).await.unwrap();
        assert_eq!(refs, vec![Reference::new(SourceType::Job, "job2", "h1")]);
    }

    #[tokio::test]
    async fn reserve_surfaces_error_when_flusher_cannot_confirm_presence() {
        let catalog = Arc::new(MemCatalog::new(Arc::new(MockProvider::new(
            Time::from_timestamp(0, 0),
        ))));
        let c = CollectorClient::new(
            Arc::clone(&catalog) as Arc<dyn Catalog>,
            Arc::new(AlwaysFatalFlusher),
            retry_config(),
        );

        c.reserve_chunks("job1", &["h1".into()]).await.unwrap();
        catalog
            .update(&[], &[], &["job1".to_string()])
            .await
            .unwrap();

        let err = c.reserve_chunks("job2", &["h1".into()]).await.unwrap_err();
        assert!(matches!(err, Error::FlushDeletesFailed { .. }));
        // the metadata store was never told to resurrect the chunk
        assert!(catalog
            .get_chunk(&"h1".into())
            .await
            .unwrap()
            .unwrap()
            .deleting_at
            .is_some());
    }

    #[tokio::test]
    async fn update_absorbs_flusher_delete_failures() {
        let flusher = Arc::new(DeleteFailsFlusher::default());
        let c = client(flusher.clone());

        c.reserve_chunks("job1", &["h1".into()]).await.unwrap();
        let result = c
            .update_references(&[], &[], &["job1".to_string()])
            .await;

        assert!(result.is_ok());
        assert!(flusher.delete_calls.load(Ordering::SeqCst) > 0);
    }
}
