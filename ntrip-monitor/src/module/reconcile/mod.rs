//! Metadata reconciliation
//!
//! Merges a scan (or site-status) result with the persisted per-station
//! metadata. Stations are never deleted: unseen ones go Offline and keep
//! their last known ports and last-seen time.

pub mod catalog;
pub mod reconciler;
pub mod store;

pub use catalog::load_known_stations;
pub use reconciler::{
    MetadataReconciler, ReconcilePolicy, Reconciliation, StatusTransition, TransitionKind,
    apply_site_status,
};
pub use store::{JsonFileStore, MemoryStore, MetadataStore};
