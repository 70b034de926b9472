//! Stream health verification
//!
//! Connects to a station's own mountpoint and checks that it is really
//! emitting decodable RTCM 3 frames, not just listed in the source table.

pub mod chunked;
pub mod rtcm;
pub mod verifier;

pub use rtcm::{FrameError, RtcmFrame, RtcmFramer, crc24q};
pub use verifier::{FrameCount, HealthCheck, HealthPolicy, StreamHealthVerifier, count_frames};
