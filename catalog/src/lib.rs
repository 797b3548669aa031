//! The metadata store and reference manager for the content-addressed chunk garbage collector.
//!
//! This crate owns the reference graph: two tables, `chunks` and `refs` (see [`interface`] for
//! the row types), mutated exclusively through the two serializable transactions exposed by
//! [`interface::Catalog`] — `reserve` and `update`. Nothing outside a committed transaction is
//! ever a legal observation of the graph's state; concurrency correctness is anchored entirely
//! here; no arbiter above the store is required.
//!
//! Two implementations are provided: [`mem::MemCatalog`] for fast in-process tests, and
//! [`postgres::PostgresCatalog`] for production use against a real PostgreSQL database.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod interface;
pub mod mem;
pub mod postgres;

pub use interface::{
    Catalog, ChunkHash, ChunkRecord, Error, ErrorKind, Reference, Result, SourceType,
};
pub use mem::MemCatalog;
pub use postgres::PostgresCatalog;
