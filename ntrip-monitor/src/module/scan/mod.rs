//! Multi-port caster scan
//!
//! Drives the source-table client across the configured port range,
//! filters noise mountpoints, and enforces the zero-discovery fail-safe.

pub mod pacer;
pub mod scanner;

pub use pacer::{PacerSlot, RequestPacer};
pub use scanner::{PortOutcome, PortScanResult, PortScanner, ScanPolicy, ScanReport};
