//! Source-table text parser
//!
//! Line oriented: stream entries start with `STR;` and carry the
//! mountpoint in field 2. Every other record type (CAS, NET, ENDSOURCETABLE)
//! and any malformed line is skipped rather than treated as an error.

use tracing::debug;

use super::types::StreamRecord;

const STREAM_MARKER: &str = "STR;";

/// Extract every stream record from raw source-table text, in listing order.
pub fn parse_stream_records(text: &str) -> Vec<StreamRecord> {
    let mut records = Vec::new();

    for line in text.lines() {
        let Some(rest) = line.trim_start().strip_prefix(STREAM_MARKER) else {
            continue;
        };

        let mut fields = rest.split(';');
        let mountpoint = fields.next().unwrap_or_default().trim();
        if mountpoint.is_empty() {
            debug!("Skipping stream record without mountpoint: {:?}", line);
            continue;
        }

        // fields after the mountpoint: identifier, format, ...
        let format = fields
            .nth(1)
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);

        records.push(StreamRecord {
            mountpoint: mountpoint.to_string(),
            format,
        });
    }

    records
}
