//! Command line configuration for the `cas_gcd` process.

use std::sync::Arc;

use cas_gc_catalog::{Reference, SourceType};
use clap::{Parser, Subcommand};

/// Runs the content-addressed chunk garbage collector core.
///
/// The configuration options below can be set either with command line flags or with the
/// specified environment variable.
#[derive(Debug, Parser)]
#[clap(name = "cas_gcd", about = "Content-addressed chunk garbage collector")]
pub struct Config {
    /// Postgres connection string for the metadata store.
    #[clap(long = "--catalog-dsn", env = "CAS_GC_CATALOG_DSN")]
    pub catalog_dsn: String,

    /// Maximum number of connections held open to the metadata store.
    #[clap(
        long = "--catalog-pool-size",
        env = "CAS_GC_CATALOG_POOL_SIZE",
        default_value = "10"
    )]
    pub catalog_pool_size: u32,

    /// Backend for the flusher's object store.
    #[clap(
        long = "--object-store",
        env = "CAS_GC_OBJECT_STORE",
        arg_enum,
        default_value = "memory"
    )]
    pub object_store: ObjectStoreType,

    /// Directory to use when `--object-store=file`.
    #[clap(long = "--object-store-path", env = "CAS_GC_OBJECT_STORE_PATH")]
    pub object_store_path: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

/// Which [`object_store`] backend the flusher is layered on.
#[derive(Debug, Clone, Copy, clap::ArgEnum)]
pub enum ObjectStoreType {
    /// An in-memory store; chunks do not survive process restart. Useful for development.
    Memory,
    /// A local filesystem directory, rooted at `--object-store-path`.
    File,
}

/// The one-shot administrative operations this process can drive against the core. There is no
/// standing RPC server here: transport to producers is out of scope for this crate.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Idempotently create the metadata store schema and exit.
    Setup,

    /// Reserve chunks on behalf of a job, resurrecting any marked for deletion.
    Reserve {
        /// The reserving job's id.
        job_id: String,
        /// Chunk hashes to reserve.
        chunks: Vec<String>,
    },

    /// Apply reference graph edits and delete any chunk that becomes unreferenced.
    Update {
        /// References to add, each `source_type:source:chunk` (source_type one of chunk, job, semantic).
        #[clap(long = "--add", value_delimiter = ',')]
        add: Vec<String>,
        /// References to remove, same format as `--add`.
        #[clap(long = "--remove", value_delimiter = ',')]
        remove: Vec<String>,
        /// Job ids whose reservations should be released entirely.
        #[clap(long = "--release-job", value_delimiter = ',')]
        release_jobs: Vec<String>,
    },

    /// Print a chunk's lifecycle state and current references.
    Inspect {
        /// The chunk hash to look up.
        chunk: String,
    },
}

/// A malformed `source_type:source:chunk` argument.
#[derive(Debug, thiserror::Error)]
#[error("invalid reference {0:?}: expected source_type:source:chunk")]
pub struct ParseReferenceError(String);

/// Parse a `source_type:source:chunk` triple as used by the `update` subcommand's `--add` and
/// `--remove` flags.
pub fn parse_reference(raw: &str) -> Result<Reference, ParseReferenceError> {
    let mut parts = raw.splitn(3, ':');
    let (kind, source, chunk) = match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(source), Some(chunk)) => (kind, source, chunk),
        _ => return Err(ParseReferenceError(raw.to_string())),
    };

    let source_type = match kind {
        "chunk" => SourceType::Chunk,
        "job" => SourceType::Job,
        "semantic" => SourceType::Semantic,
        _ => return Err(ParseReferenceError(raw.to_string())),
    };

    Ok(Reference::new(source_type, source, chunk))
}

pub(crate) fn build_object_store(
    config: &Config,
) -> Result<Arc<object_store::DynObjectStore>, object_store::Error> {
    match config.object_store {
        ObjectStoreType::Memory => Ok(Arc::new(object_store::memory::InMemory::new())),
        ObjectStoreType::File => {
            let path = config
                .object_store_path
                .as_deref()
                .unwrap_or("./cas-gc-data");
            Ok(Arc::new(object_store::local::LocalFileSystem::new_with_prefix(path)?))
        }
    }
}
