//! Shared wire contract for the pxidx indexer.
//!
//! Upstream producers hand the core [`objects::RawBlock`]s; downstream
//! fan-out collaborators receive [`objects::NotificationBatch`]es, optionally
//! authenticated through [`signature`].

pub mod objects;
pub mod signature;
