//! The collector client: the component that drives garbage collection by sequencing metadata
//! store transactions (via [`cas_gc_catalog`]) with calls to an external, opaque flusher.
//!
//! This crate implements no policy about *when* to collect or resurrect chunks; it only
//! guarantees that the two halves of each handshake — metadata transaction and flusher call —
//! happen in an order that never exposes a chunk as deleted in the metadata store before the
//! flusher has actually deleted it, and never resurrects a chunk before the flusher has confirmed
//! it is still there.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod client;
mod error;
pub mod flusher;

pub use client::CollectorClient;
pub use error::{Error, Result};
pub use flusher::{Flusher, FlusherError, NullFlusher, ObjectStoreFlusher};
