pub mod health;
pub mod reconcile;
pub mod report;
pub mod sbc_api;
pub mod scan;
pub mod scheduled;
pub mod sourcetable;
