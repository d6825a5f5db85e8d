//! Adapters around the engine: data sources, version control, and the
//! read-only consumers of the merged series.

pub mod docs;
pub mod export;
pub mod fetcher;
pub mod gaps;
pub mod git;
