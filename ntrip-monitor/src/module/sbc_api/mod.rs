//! SmartFix base-station controller (SBC) REST API
//!
//! Alternative status source: the controller knows whether each receiver is
//! connected and delivering data, independent of what the caster lists.

pub mod client;
pub mod types;

pub use client::SbcApiClient;
pub use types::{LoginResponse, Site, SitesResponse};
