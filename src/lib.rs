//! `tapebridge`: a hierarchical storage management bridge between a disk
//! staging pool and a tape-archival client.
//!
//! Three daemons - [`archiver`], [`retriever`], [`deleter`] - cooperate
//! through the shared filesystem tree described in [`staging`]. None of them
//! talk to each other directly; the staging tree is the only shared state.

pub mod archiver;
pub mod config;
pub mod deleter;
pub mod identifier;
pub mod retriever;
pub mod signals;
pub mod staging;
pub mod stats;
pub mod tape;
pub mod worker;

pub use identifier::Identifier;
