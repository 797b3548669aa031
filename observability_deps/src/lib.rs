//! Observability ecosystem dependencies for this workspace, to ensure consistent versions
//! and unified updates.
//!
//! # Usage
//!
//! Instead of:
//!
//! ```rust,ignore
//! use tracing::info;
//! ```
//!
//! Do
//!
//! ```rust,ignore
//! use observability_deps::tracing::info;
//! ```
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub use tracing;
