//! `cas_gcd`: process wiring for the content-addressed chunk garbage collector core.
//!
//! This binary owns no transport of its own — client RPC is explicitly out of scope for the
//! core, per the component design this crate implements. What it does own is startup: parsing
//! configuration, connecting the metadata store, standing up a flusher over an object store, and
//! exposing the core's two operations as one-shot administrative subcommands.

mod config;

use std::sync::Arc;

use backoff::BackoffConfig;
use cas_gc_catalog::{Catalog, PostgresCatalog};
use cas_gc_collector::{CollectorClient, ObjectStoreFlusher};
use clap::Parser;
use config::{parse_reference, Command, Config};
use iox_time::SystemProvider;
use observability_deps::tracing::{error, info};

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("metadata store: {0}")]
    Catalog(#[from] cas_gc_catalog::Error),

    #[error("collector client: {0}")]
    Collector(#[from] cas_gc_collector::Error),

    #[error("object store: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("{0}")]
    BadReference(#[from] config::ParseReferenceError),
}

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = run(config).await {
        error!(error = %e, "cas_gcd exited with an error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Error> {
    let time_provider = Arc::new(SystemProvider::new());
    let catalog = PostgresCatalog::connect(
        &config.catalog_dsn,
        config.catalog_pool_size,
        time_provider,
    )
    .await?;
    catalog.setup().await?;

    match &config.command {
        Command::Setup => {
            info!("metadata store schema is up to date");
        }

        Command::Reserve { job_id, chunks } => {
            let flusher = Arc::new(ObjectStoreFlusher::new(config::build_object_store(
                &config,
            )?));
            let client = CollectorClient::new(
                Arc::new(catalog),
                flusher,
                BackoffConfig {
                    init_backoff: std::time::Duration::from_millis(5),
                    max_backoff: std::time::Duration::from_millis(200),
                    base: 2.0,
                    max_retries: Some(8),
                },
            );
            let chunks: Vec<_> = chunks.iter().map(|c| c.as_str().into()).collect();
            client.reserve_chunks(job_id, &chunks).await?;
            info!(job_id = %job_id, chunks = chunks.len(), "reserved chunks");
        }

        Command::Update {
            add,
            remove,
            release_jobs,
        } => {
            let flusher = Arc::new(ObjectStoreFlusher::new(config::build_object_store(
                &config,
            )?));
            let client = CollectorClient::new(
                Arc::new(catalog),
                flusher,
                BackoffConfig {
                    init_backoff: std::time::Duration::from_millis(5),
                    max_backoff: std::time::Duration::from_millis(200),
                    base: 2.0,
                    max_retries: Some(8),
                },
            );
            let add = add
                .iter()
                .map(|s| parse_reference(s))
                .collect::<Result<Vec<_>, _>>()?;
            let remove = remove
                .iter()
                .map(|s| parse_reference(s))
                .collect::<Result<Vec<_>, _>>()?;
            client
                .update_references(&add, &remove, release_jobs)
                .await?;
            info!("updated references");
        }

        Command::Inspect { chunk } => {
            let chunk = chunk.as_str().into();
            match catalog.get_chunk(&chunk).await? {
                Some(record) => {
                    println!("chunk {}: deleting_at = {:?}", record.hash, record.deleting_at);
                }
                None => println!("chunk {chunk} is not known to the metadata store"),
            }
            for reference in catalog.references_for_chunk(&chunk).await? {
                println!(
                    "  referenced by {:?} {:?}",
                    reference.source_type, reference.source
                );
            }
        }
    }

    Ok(())
}
