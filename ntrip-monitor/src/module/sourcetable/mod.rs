//! NTRIP source-table access
//!
//! Fetches the caster's directory listing from one logical port and
//! extracts the stream records it advertises.

pub mod client;
pub mod parser;
pub mod types;

pub use client::{SourceTableClient, SourceTableFetcher};
pub use parser::parse_stream_records;
pub use types::{CasterEndpoint, ResponseStatus, StreamRecord};
