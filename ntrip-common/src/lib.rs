pub mod types;

pub use types::{
    LastSeen, PortAssignments, StationCode, StationCodeError, StationMetadata,
    StationMetadataMap, StationStatus,
};
