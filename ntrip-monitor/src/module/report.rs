//! Run artifacts for downstream consumers
//!
//! The port-assignment JSON feeds the GIS tooling; the QA text report is
//! read by operators. Both are derived from the reconciled metadata only.

use anyhow::Result;
use chrono::NaiveDateTime;
use ntrip_common::{LastSeen, StationMetadataMap};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

use crate::module::reconcile::reconciler::port_assignments;
use crate::module::reconcile::store::{write_atomic, write_json_atomic};

const STATIONS_PER_LINE: usize = 5;
const OFFLINE_PER_LINE: usize = 3;

/// Where the reconciled status came from; changes the report heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    CasterScan,
    SiteApi,
}

pub struct ReportEmitter {
    mapping_path: PathBuf,
    report_path: PathBuf,
    port_names: BTreeMap<u16, String>,
}

impl ReportEmitter {
    pub fn new(mapping_path: PathBuf, report_path: PathBuf, port_names: BTreeMap<u16, String>) -> Self {
        Self {
            mapping_path,
            report_path,
            port_names,
        }
    }

    /// Write the port mapping and the QA report.
    pub async fn write_artifacts(
        &self,
        stations: &StationMetadataMap,
        source: ReportSource,
        now: NaiveDateTime,
    ) -> Result<()> {
        let mapping = port_assignments(stations);
        write_json_atomic(&self.mapping_path, &mapping).await?;
        info!("Port mapping for {} stations saved to {:?}", mapping.len(), self.mapping_path);

        let report = render_report(stations, source, now, &self.port_names);
        write_atomic(&self.report_path, report.as_bytes()).await?;
        info!("QA report saved to {:?}", self.report_path);
        Ok(())
    }
}

pub fn render_report(
    stations: &StationMetadataMap,
    source: ReportSource,
    now: NaiveDateTime,
    port_names: &BTreeMap<u16, String>,
) -> String {
    let generated = now.format(LastSeen::FORMAT);
    let mut lines = Vec::new();
    match source {
        ReportSource::CasterScan => {
            lines.push(format!("QA PORT ASSIGNMENT & STATUS REPORT ({})", generated));
        }
        ReportSource::SiteApi => {
            lines.push(format!("QA STATION STATUS REPORT ({})", generated));
            lines.push("Source: SmartFix API".to_string());
        }
    }
    lines.push("=".repeat(40));

    let mut by_port: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    let mut offline = Vec::new();
    for (code, meta) in stations {
        if !meta.is_online() {
            offline.push(format!("{} (Last: {})", code, meta.last_seen));
        }
        if let Some(port) = meta.port {
            by_port
                .entry(port)
                .or_default()
                .push(format!("{} ({})", code, meta.status));
        }
    }

    for (port, mut entries) in by_port {
        entries.sort();
        let heading = match port_names.get(&port) {
            Some(name) => format!("PORT {} - {} ({} stations):", port, name, entries.len()),
            None => format!("PORT {} ({} stations):", port, entries.len()),
        };
        lines.push(String::new());
        lines.push(heading);
        lines.extend(entries.chunks(STATIONS_PER_LINE).map(|row| row.join(", ")));
    }

    if !offline.is_empty() {
        offline.sort();
        lines.push(String::new());
        lines.push(format!("OFFLINE STATIONS ({}):", offline.len()));
        lines.extend(offline.chunks(OFFLINE_PER_LINE).map(|row| row.join(", ")));
    }

    lines.join("\n")
}
