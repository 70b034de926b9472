//! Incremental decoder for HTTP/1.1 chunked transfer coding
//!
//! NTRIP 2 casters usually wrap the RTCM stream in chunks; the chunk-size
//! lines must be stripped before framing or they corrupt frame boundaries.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("invalid chunk size line: {0:?}")]
    InvalidSize(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading the hex size line up to LF
    Size,
    Data(usize),
    /// CRLF after a chunk's data
    DataEnd(usize),
    /// Zero-size chunk seen; anything after is trailer
    Done,
}

#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    line: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: State::Size,
            line: Vec::new(),
        }
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decode `input`, appending chunk data to `out`.
    pub fn decode(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> Result<(), ChunkError> {
        while !input.is_empty() {
            match self.state {
                State::Size => {
                    let Some(newline) = input.iter().position(|&b| b == b'\n') else {
                        self.line.extend_from_slice(input);
                        return Ok(());
                    };
                    self.line.extend_from_slice(&input[..newline]);
                    input = &input[newline + 1..];

                    let size = self.take_size()?;
                    self.state = if size == 0 { State::Done } else { State::Data(size) };
                }
                State::Data(remaining) => {
                    let n = remaining.min(input.len());
                    out.extend_from_slice(&input[..n]);
                    input = &input[n..];
                    self.state = if n == remaining {
                        State::DataEnd(2)
                    } else {
                        State::Data(remaining - n)
                    };
                }
                State::DataEnd(remaining) => {
                    // tolerate a bare LF terminator
                    if input[0] == b'\n' {
                        input = &input[1..];
                        self.state = State::Size;
                    } else if input[0] == b'\r' && remaining == 2 {
                        input = &input[1..];
                        self.state = State::DataEnd(1);
                    } else {
                        return Err(ChunkError::InvalidSize(
                            String::from_utf8_lossy(&input[..input.len().min(16)]).into_owned(),
                        ));
                    }
                }
                State::Done => return Ok(()),
            }
        }
        Ok(())
    }

    fn take_size(&mut self) -> Result<usize, ChunkError> {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();

        let digits = line.trim().split(';').next().unwrap_or_default().trim();
        usize::from_str_radix(digits, 16).map_err(|_| ChunkError::InvalidSize(line))
    }
}
