//! Typed failures for the discovery pipeline
//!
//! Transport and protocol failures are absorbed per port / per station by
//! their callers. `PipelineError` is systemic and always blocks persistence.

use std::time::Duration;

/// A single caster request that produced no usable data
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("response exceeded {0} bytes")]
    TooLarge(usize),

    #[error("caster rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(
        "no streams found on any of {ports_attempted} caster ports \
         (network down, authentication failure or caster maintenance); \
         existing station data left untouched"
    )]
    NoStreamsDiscovered { ports_attempted: usize },

    #[error("site status API returned no sites; existing station data left untouched")]
    NoSitesReturned,
}
