//! Competitive-intelligence pipeline tracker: extracts development pipelines
//! from company disclosures, canonicalizes assets, links them to registry
//! trials, and keeps an auditable change feed backed by SQLite.

pub mod config;
pub mod diff;
pub mod error;
pub mod evidence;
pub mod extract;
pub mod http;
pub mod ingest;
pub mod link;
pub mod normalize;
pub mod oracle;
pub mod registry;
pub mod sanitize;
pub mod store;
