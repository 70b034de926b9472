//! RTCM 3 transport-layer framing
//!
//! Frame layout: preamble `0xD3`, 6 reserved zero bits, 10-bit payload
//! length, payload, CRC-24Q over everything before it. A bad frame costs one
//! byte: the framer drops the preamble and searches for the next one.

use tracing::trace;

pub const PREAMBLE: u8 = 0xD3;
pub const MAX_PAYLOAD: usize = 1023;
const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 3;
const CRC24Q_POLY: u32 = 0x0186_4CFB;

const CRC24Q_TABLE: [u32; 256] = build_crc24q_table();

const fn build_crc24q_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 16;
        let mut bit = 0;
        while bit < 8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24Q_POLY;
            }
            bit += 1;
        }
        table[i] = crc & 0x00FF_FFFF;
        i += 1;
    }
    table
}

pub fn crc24q(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &byte| {
        let index = ((crc >> 16) as u8 ^ byte) as usize;
        ((crc << 8) ^ CRC24Q_TABLE[index]) & 0x00FF_FFFF
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcmFrame {
    /// DF002, the first 12 bits of the payload (e.g. 1005, 1077)
    pub message_type: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("CRC mismatch: frame carries {carried:06x}, computed {computed:06x}")]
    BadCrc { carried: u32, computed: u32 },

    #[error("payload of {0} bytes is too short to hold a message number")]
    TooShort(usize),
}

/// Incremental frame extractor over an arbitrary byte stream
#[derive(Debug, Default)]
pub struct RtcmFramer {
    buf: Vec<u8>,
    skipped: usize,
}

impl RtcmFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while searching for a preamble
    pub fn skipped_bytes(&self) -> usize {
        self.skipped
    }

    /// Next complete frame, a skippable frame error, or `None` when more
    /// input is needed.
    pub fn next_frame(&mut self) -> Option<Result<RtcmFrame, FrameError>> {
        loop {
            let Some(start) = self.buf.iter().position(|&b| b == PREAMBLE) else {
                self.discard(self.buf.len());
                return None;
            };
            self.discard(start);

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            // reserved bits must be zero, otherwise this 0xD3 is just data
            if self.buf[1] & 0xFC != 0 {
                self.discard(1);
                continue;
            }

            let length = (((self.buf[1] & 0x03) as usize) << 8) | self.buf[2] as usize;
            let total = HEADER_LEN + length + CRC_LEN;
            if self.buf.len() < total {
                return None;
            }

            let body_end = HEADER_LEN + length;
            let computed = crc24q(&self.buf[..body_end]);
            let carried = u32::from(self.buf[body_end]) << 16
                | u32::from(self.buf[body_end + 1]) << 8
                | u32::from(self.buf[body_end + 2]);

            if computed != carried {
                trace!("RTCM CRC mismatch, resynchronising");
                self.discard(1);
                return Some(Err(FrameError::BadCrc { carried, computed }));
            }

            let payload = self.buf[HEADER_LEN..body_end].to_vec();
            self.buf.drain(..total);

            if payload.len() < 2 {
                return Some(Err(FrameError::TooShort(payload.len())));
            }
            let message_type = (u16::from(payload[0]) << 4) | (u16::from(payload[1]) >> 4);
            return Some(Ok(RtcmFrame {
                message_type,
                payload,
            }));
        }
    }

    fn discard(&mut self, n: usize) {
        self.skipped += n;
        self.buf.drain(..n);
    }
}

/// Wrap `payload` into a complete frame. Used to feed fake casters.
#[cfg(test)]
pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= MAX_PAYLOAD);
    let mut frame = vec![PREAMBLE, (payload.len() >> 8) as u8, payload.len() as u8];
    frame.extend_from_slice(payload);
    let crc = crc24q(&frame);
    frame.extend_from_slice(&[(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]);
    frame
}
