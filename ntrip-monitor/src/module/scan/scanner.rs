use futures::StreamExt;
use ntrip_common::StationCode;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::pacer::RequestPacer;
use crate::error::PipelineError;
use crate::module::sourcetable::{SourceTableFetcher, parse_stream_records};

/// Scan settings derived from the configuration
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub ports: Vec<u16>,
    pub request_delay: Duration,
    pub max_concurrency: usize,
    pub excluded: BTreeSet<StationCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOutcome {
    /// Source table received with this many stream records (before filtering)
    Streams(usize),
    TransportFailure(String),
}

/// Result of probing one caster port
#[derive(Debug, Clone)]
pub struct PortScanResult {
    pub port: u16,
    pub outcome: PortOutcome,
    /// Station codes in listing order, after exclusion filtering
    pub stations: Vec<StationCode>,
    /// Records dropped by the exclusion list
    pub excluded: usize,
}

impl PortScanResult {
    pub fn record_count(&self) -> usize {
        match self.outcome {
            PortOutcome::Streams(n) => n,
            PortOutcome::TransportFailure(_) => 0,
        }
    }
}

/// Aggregated discovery across all ports
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// One entry per attempted port, ascending
    pub ports: Vec<PortScanResult>,
    pub total_records: usize,
    pub active: BTreeSet<StationCode>,
    /// Every port each active station was seen on
    pub observed_ports: BTreeMap<StationCode, BTreeSet<u16>>,
    pub excluded_hits: usize,
}

impl ScanReport {
    /// Fold per-port results into the report. Accumulation is a set union
    /// keyed by port, so worker completion order has no influence.
    fn from_results(mut results: Vec<PortScanResult>) -> Self {
        results.sort_by_key(|r| r.port);

        let mut report = ScanReport::default();
        for result in &results {
            report.total_records += result.record_count();
            report.excluded_hits += result.excluded;
            for code in &result.stations {
                report.active.insert(code.clone());
                report
                    .observed_ports
                    .entry(code.clone())
                    .or_default()
                    .insert(result.port);
            }
        }
        report.ports = results;
        report
    }

    pub fn failed_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports
            .iter()
            .filter(|r| matches!(r.outcome, PortOutcome::TransportFailure(_)))
            .map(|r| r.port)
    }
}

pub struct PortScanner<F> {
    fetcher: F,
    policy: ScanPolicy,
    pacer: RequestPacer,
}

impl<F: SourceTableFetcher> PortScanner<F> {
    pub fn new(fetcher: F, mut policy: ScanPolicy) -> Self {
        policy.ports.sort_unstable();
        policy.ports.dedup();
        policy.max_concurrency = policy.max_concurrency.max(1);
        let pacer = RequestPacer::new(policy.request_delay);
        Self {
            fetcher,
            policy,
            pacer,
        }
    }

    /// Scan every port. Requests go through the shared pacer, so
    /// `max_concurrency` overlaps parsing and bookkeeping but never puts
    /// more than one request on the caster at a time.
    ///
    /// Fails only when the whole caster yielded zero
    /// stream records, which is evaluated after all ports have reported.
    pub async fn scan(&self) -> Result<ScanReport, PipelineError> {
        info!(
            "Scanning {} caster ports (concurrency {}, spacing {:?})",
            self.policy.ports.len(),
            self.policy.max_concurrency,
            self.policy.request_delay
        );

        let results: Vec<PortScanResult> = futures::stream::iter(self.policy.ports.iter().copied())
            .map(|port| self.scan_port(port))
            .buffer_unordered(self.policy.max_concurrency)
            .collect()
            .await;

        let report = ScanReport::from_results(results);

        if report.total_records == 0 {
            error!(
                "No streams found on any port; aborting update to preserve existing data"
            );
            return Err(PipelineError::NoStreamsDiscovered {
                ports_attempted: report.ports.len(),
            });
        }

        info!(
            "Scan complete: {} stream records, {} active stations, {} excluded, {} failed ports",
            report.total_records,
            report.active.len(),
            report.excluded_hits,
            report.failed_ports().count()
        );
        Ok(report)
    }

    async fn scan_port(&self, port: u16) -> PortScanResult {
        let fetched = {
            let _slot = self.pacer.acquire().await;
            self.fetcher.fetch(port).await
        };

        let text = match fetched {
            Ok(text) => text,
            Err(e) => {
                warn!("Port {}: no data ({})", port, e);
                return PortScanResult {
                    port,
                    outcome: PortOutcome::TransportFailure(e.to_string()),
                    stations: Vec::new(),
                    excluded: 0,
                };
            }
        };

        let records = parse_stream_records(&text);
        let mut stations = Vec::new();
        let mut excluded = 0;
        for record in &records {
            let Some(code) = record.station_code() else {
                debug!("Port {}: skipping short mountpoint '{}'", port, record.mountpoint);
                continue;
            };
            debug!(
                "Port {}: stream '{}' ({})",
                port,
                record.mountpoint,
                record.format.as_deref().unwrap_or("unknown format")
            );
            if self.policy.excluded.contains(&code) {
                debug!("Port {}: excluded mountpoint '{}'", port, record.mountpoint);
                excluded += 1;
                continue;
            }
            stations.push(code);
        }

        info!("Port {}: found {} streams", port, records.len());
        PortScanResult {
            port,
            outcome: PortOutcome::Streams(records.len()),
            stations,
            excluded,
        }
    }
}
