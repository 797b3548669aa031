//! An in-memory [`Catalog`] implementation, for fast tests that don't need a real database.
//!
//! Correctness under concurrent access is provided the blunt way: every operation holds a
//! single mutex across the whole graph for its duration. That's fine for an in-process test
//! double; the serializability story this crate actually cares about is exercised against
//! [`crate::postgres::PostgresCatalog`].

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use iox_time::TimeProvider;
use parking_lot::Mutex;

use crate::interface::{
    Catalog, ChunkHash, ChunkRecord, Error, Reference, Result, SourceType,
};

#[derive(Debug, Default)]
struct Collections {
    chunks: BTreeMap<ChunkHash, Option<iox_time::Time>>,
    refs: BTreeSet<(SourceType, String, ChunkHash)>,
}

impl Collections {
    fn ref_count(&self, chunk: &ChunkHash) -> usize {
        self.refs.iter().filter(|(_, _, c)| c == chunk).count()
    }
}

// `SourceType` needs to be orderable to live in a `BTreeSet` tuple key.
impl PartialOrd for SourceType {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SourceType {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

/// An in-memory, single-process [`Catalog`].
#[derive(Debug)]
pub struct MemCatalog {
    time_provider: Arc<dyn TimeProvider>,
    collections: Mutex<Collections>,
}

impl MemCatalog {
    /// Create a new, empty in-memory catalog.
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            time_provider,
            collections: Mutex::new(Collections::default()),
        }
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn setup(&self) -> Result<()> {
        // Nothing to initialize: the collections are created with the struct.
        Ok(())
    }

    async fn reserve(&self, job_id: &str, chunks: &[ChunkHash]) -> Result<Vec<ChunkHash>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut col = self.collections.lock();
        let mut resurrecting = Vec::new();

        for chunk in chunks {
            let deleting_at = col.chunks.entry(chunk.clone()).or_insert(None);
            if deleting_at.is_some() {
                resurrecting.push(chunk.clone());
            } else {
                col.refs
                    .insert((SourceType::Job, job_id.to_string(), chunk.clone()));
            }
        }

        Ok(resurrecting)
    }

    async fn resurrect(&self, job_id: &str, chunks: &[ChunkHash]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let mut col = self.collections.lock();
        for chunk in chunks {
            if !col.chunks.contains_key(chunk) {
                return Err(Error::ResurrectionLost {
                    chunk: chunk.clone(),
                });
            }
        }

        for chunk in chunks {
            col.chunks.insert(chunk.clone(), None);
            col.refs
                .insert((SourceType::Job, job_id.to_string(), chunk.clone()));
        }

        Ok(())
    }

    async fn update(
        &self,
        add: &[Reference],
        remove: &[Reference],
        release_jobs: &[String],
    ) -> Result<Vec<ChunkHash>> {
        if add.is_empty() && remove.is_empty() && release_jobs.is_empty() {
            return Ok(Vec::new());
        }

        let mut col = self.collections.lock();

        for reference in add {
            match col.chunks.get(&reference.chunk) {
                None => {
                    return Err(Error::MissingChunk {
                        chunk: reference.chunk.clone(),
                    })
                }
                Some(Some(_)) => {
                    return Err(Error::ReferenceToDeletingChunk {
                        chunk: reference.chunk.clone(),
                    })
                }
                Some(None) => {}
            }
        }

        // add edges are logically inserted before remove edges are deleted.
        let mut touched = BTreeSet::new();
        for reference in add {
            touched.insert(reference.chunk.clone());
            col.refs.insert((
                reference.source_type,
                reference.source.clone(),
                reference.chunk.clone(),
            ));
        }

        for reference in remove {
            touched.insert(reference.chunk.clone());
            col.refs.remove(&(
                reference.source_type,
                reference.source.clone(),
                reference.chunk.clone(),
            ));
        }

        if !release_jobs.is_empty() {
            let released: BTreeSet<String> = release_jobs.iter().cloned().collect();
            let to_drop: Vec<_> = col
                .refs
                .iter()
                .filter(|(source_type, source, _)| {
                    *source_type == SourceType::Job && released.contains(source)
                })
                .cloned()
                .collect();
            for key in to_drop {
                touched.insert(key.2.clone());
                col.refs.remove(&key);
            }
        }

        let now = self.time_provider.now();
        let mut collection_candidates = Vec::new();
        for chunk in touched {
            if col.ref_count(&chunk) == 0 {
                let deleting_at = col.chunks.get_mut(&chunk).expect("touched chunk must exist");
                if deleting_at.is_none() {
                    *deleting_at = Some(now);
                    collection_candidates.push(chunk);
                }
            }
        }

        Ok(collection_candidates)
    }

    async fn get_chunk(&self, chunk: &ChunkHash) -> Result<Option<ChunkRecord>> {
        let col = self.collections.lock();
        Ok(col.chunks.get(chunk).map(|deleting_at| ChunkRecord {
            hash: chunk.clone(),
            deleting_at: *deleting_at,
        }))
    }

    async fn references_for_chunk(&self, chunk: &ChunkHash) -> Result<Vec<Reference>> {
        let col = self.collections.lock();
        Ok(col
            .refs
            .iter()
            .filter(|(_, _, c)| c == chunk)
            .map(|(source_type, source, chunk)| {
                Reference::new(*source_type, source.clone(), chunk.clone())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use iox_time::{MockProvider, Time};

    fn catalog() -> MemCatalog {
        MemCatalog::new(Arc::new(MockProvider::new(Time::from_timestamp(0, 0))))
    }

    #[tokio::test]
    async fn fresh_reserve_creates_chunks_and_job_refs() {
        let cat = catalog();
        let resurrected = cat
            .reserve("jobA", &["h1".into(), "h2".into()])
            .await
            .unwrap();
        assert!(resurrected.is_empty());

        for hash in ["h1", "h2"] {
            let record = cat.get_chunk(&hash.into()).await.unwrap().unwrap();
            assert_eq!(record.deleting_at, None);
        }
        let refs = cat.references_for_chunk(&"h1".into()).await.unwrap();
        assert_eq!(refs, vec![Reference::new(SourceType::Job, "jobA", "h1")]);
    }

    #[tokio::test]
    async fn update_promotes_and_collects() {
        let cat = catalog();
        cat.reserve("jobA", &["h1".into(), "h2".into()])
            .await
            .unwrap();

        let to_delete = cat
            .update(
                &[Reference::new(SourceType::Semantic, "commit1", "h1")],
                &[],
                &["jobA".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(to_delete, vec!["h2".into()]);
        let h2 = cat.get_chunk(&"h2".into()).await.unwrap().unwrap();
        assert!(h2.deleting_at.is_some());
        let h1_refs = cat.references_for_chunk(&"h1".into()).await.unwrap();
        assert_eq!(
            h1_refs,
            vec![Reference::new(SourceType::Semantic, "commit1", "h1")]
        );
    }

    #[tokio::test]
    async fn resurrection_round_trip() {
        let cat = catalog();
        cat.reserve("jobA", &["h1".into()]).await.unwrap();
        cat.update(&[], &[], &["jobA".to_string()]).await.unwrap();
        assert!(cat.get_chunk(&"h1".into()).await.unwrap().unwrap().deleting_at.is_some());

        let resurrected = cat.reserve("jobB", &["h1".into()]).await.unwrap();
        assert_eq!(resurrected, vec!["h1".into()]);
        // no job reference yet: phase two hasn't run
        assert!(cat.references_for_chunk(&"h1".into()).await.unwrap().is_empty());

        cat.resurrect("jobB", &["h1".into()]).await.unwrap();
        assert!(cat.get_chunk(&"h1".into()).await.unwrap().unwrap().deleting_at.is_none());
        assert_eq!(
            cat.references_for_chunk(&"h1".into()).await.unwrap(),
            vec![Reference::new(SourceType::Job, "jobB", "h1")]
        );
    }

    #[tokio::test]
    async fn update_rejects_missing_chunk() {
        let cat = catalog();
        let err = cat
            .update(
                &[Reference::new(SourceType::Semantic, "c1", "h9")],
                &[],
                &[],
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::MissingChunk { chunk } if chunk == "h9".into());
        assert!(cat.get_chunk(&"h9".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_rejects_reference_to_deleting_chunk() {
        let cat = catalog();
        cat.reserve("jobA", &["h1".into()]).await.unwrap();
        cat.update(&[], &[], &["jobA".to_string()]).await.unwrap();

        let err = cat
            .update(
                &[Reference::new(SourceType::Semantic, "c1", "h1")],
                &[],
                &[],
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::ReferenceToDeletingChunk { chunk } if chunk == "h1".into());
    }

    #[tokio::test]
    async fn empty_calls_are_no_ops() {
        let cat = catalog();
        assert!(cat.reserve("jobA", &[]).await.unwrap().is_empty());
        assert!(cat.update(&[], &[], &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_reservations_each_get_their_own_job_ref() {
        let cat = Arc::new(catalog());
        let cat2 = Arc::clone(&cat);

        let (r1, r2) = tokio::join!(
            cat.reserve("job1", &["h3".into()]),
            cat2.reserve("job2", &["h3".into()])
        );
        assert!(r1.unwrap().is_empty());
        assert!(r2.unwrap().is_empty());

        let mut refs = cat.references_for_chunk(&"h3".into()).await.unwrap();
        refs.sort_by(|a, b| a.source.cmp(&b.source));
        assert_eq!(
            refs,
            vec![
                Reference::new(SourceType::Job, "job1", "h3"),
                Reference::new(SourceType::Job, "job2", "h3"),
            ]
        );
    }
}
