//! One monitoring run, end to end
//!
//! scan -> fail-safe -> load prior -> reconcile -> (verify) -> save -> report.
//! Nothing is written unless every step before `save` succeeded.

use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use ntrip_common::{StationCode, StationMetadataMap};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::error::PipelineError;
use crate::module::health::StreamHealthVerifier;
use crate::module::reconcile::{
    MetadataReconciler, MetadataStore, StatusTransition, apply_site_status, load_known_stations,
};
use crate::module::report::{ReportEmitter, ReportSource};
use crate::module::scan::PortScanner;
use crate::module::sourcetable::SourceTableFetcher;

/// Local wall-clock time, as recorded in `last_seen`
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub ports_attempted: usize,
    pub failed_ports: Vec<u16>,
    pub stream_records: usize,
    pub stations: usize,
    pub online: usize,
    pub transitions: Vec<StatusTransition>,
    /// (verified, checked) when a verification pass ran
    pub verification: Option<(usize, usize)>,
}

impl RunSummary {
    pub fn log(&self) {
        info!(
            "Run complete: {} stations ({} online, {} offline), {} transitions",
            self.stations,
            self.online,
            self.stations - self.online,
            self.transitions.len()
        );
        if let Some((verified, checked)) = self.verification {
            info!("Data flow verified for {}/{} online stations", verified, checked);
        }
    }
}

pub struct Pipeline<F, S> {
    config: MonitorConfig,
    fetcher: F,
    store: S,
    emitter: ReportEmitter,
    /// Single writer per store
    run_lock: Mutex<()>,
}

impl<F: SourceTableFetcher, S: MetadataStore> Pipeline<F, S> {
    pub fn new(config: MonitorConfig, fetcher: F, store: S) -> Self {
        let emitter = ReportEmitter::new(config.mapping_path(), config.report_path(), config.port_names());
        Self {
            config,
            fetcher,
            store,
            emitter,
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Full caster scan. Returns `PipelineError::NoStreamsDiscovered` (and
    /// writes nothing) when no port listed a single stream.
    pub async fn run_scan(&self, verify: bool, now: NaiveDateTime) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;

        let scanner = PortScanner::new(&self.fetcher, self.config.scan_policy());
        let scan = scanner.scan().await?;

        let prior = self.store.load().await?;
        let known = load_known_stations(&self.config.catalog_path()).await?;

        let reconciler = MetadataReconciler::new(self.config.reconcile_policy());
        let mut reconciliation =
            reconciler.reconcile(&scan.active, &scan.observed_ports, &known, &prior, now);

        let verification = if verify {
            Some(self.verify_stations(&mut reconciliation.stations).await)
        } else {
            None
        };

        self.store.save(&reconciliation.stations).await?;
        self.emitter
            .write_artifacts(&reconciliation.stations, ReportSource::CasterScan, now)
            .await?;

        let summary = RunSummary {
            ports_attempted: scan.ports.len(),
            failed_ports: scan.failed_ports().collect(),
            stream_records: scan.total_records,
            stations: reconciliation.stations.len(),
            online: reconciliation.online_count(),
            transitions: reconciliation.transitions,
            verification,
        };
        summary.log();
        Ok(summary)
    }

    /// Verification pass over the stored metadata only.
    pub async fn run_verify(&self, now: NaiveDateTime) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;

        let mut stations = self.store.load().await?;
        if stations.is_empty() {
            warn!("No stored station metadata; run a scan first");
        }
        let verification = self.verify_stations(&mut stations).await;

        self.store.save(&stations).await?;
        self.emitter
            .write_artifacts(&stations, ReportSource::CasterScan, now)
            .await?;

        let summary = RunSummary {
            verification: Some(verification),
            ..Self::stored_summary(&stations)
        };
        summary.log();
        Ok(summary)
    }

    /// Regenerate mapping and report from stored metadata; no network.
    pub async fn run_report(&self, now: NaiveDateTime) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;

        let stations = self.store.load().await?;
        self.emitter
            .write_artifacts(&stations, ReportSource::CasterScan, now)
            .await?;
        Ok(Self::stored_summary(&stations))
    }

    /// Apply an SBC site-status snapshot to the stored metadata.
    pub async fn run_site_status(
        &self,
        site_online: &BTreeMap<StationCode, bool>,
        now: NaiveDateTime,
    ) -> Result<RunSummary> {
        if site_online.is_empty() {
            return Err(PipelineError::NoSitesReturned.into());
        }
        let _guard = self.run_lock.lock().await;

        let prior = self.store.load().await?;
        let reconciliation = apply_site_status(&prior, site_online, now);

        self.store.save(&reconciliation.stations).await?;
        self.emitter
            .write_artifacts(&reconciliation.stations, ReportSource::SiteApi, now)
            .await?;

        let summary = RunSummary {
            stations: reconciliation.stations.len(),
            online: reconciliation.online_count(),
            transitions: reconciliation.transitions,
            ..RunSummary::default()
        };
        summary.log();
        Ok(summary)
    }

    async fn verify_stations(&self, stations: &mut StationMetadataMap) -> (usize, usize) {
        let verifier =
            StreamHealthVerifier::new(self.config.caster_endpoint(), self.config.health_policy());
        let checks = verifier.verify_all(stations).await;
        let verified = checks.iter().filter(|c| c.verified).count();
        (verified, checks.len())
    }

    fn stored_summary(stations: &StationMetadataMap) -> RunSummary {
        RunSummary {
            stations: stations.len(),
            online: stations.values().filter(|m| m.is_online()).count(),
            ..RunSummary::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::module::reconcile::{JsonFileStore, MemoryStore, TransitionKind};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use ntrip_common::{LastSeen, StationMetadata, StationStatus};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FakeCaster {
        tables: HashMap<u16, String>,
    }

    impl FakeCaster {
        fn new(tables: &[(u16, &str)]) -> Self {
            Self {
                tables: tables.iter().map(|(p, t)| (*p, t.to_string())).collect(),
            }
        }
    }

    #[async_trait]
    impl SourceTableFetcher for FakeCaster {
        async fn fetch(&self, port: u16) -> Result<String, FetchError> {
            self.tables
                .get(&port)
                .cloned()
                .ok_or_else(|| FetchError::Rejected(format!("port {} closed", port)))
        }
    }

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 7, 25)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn config(data_dir: &std::path::Path) -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.paths.data_dir = data_dir.to_path_buf();
        config.scan.request_delay_ms = 0;
        config
    }

    fn code(raw: &str) -> StationCode {
        StationCode::parse(raw).unwrap()
    }

    fn prior() -> StationMetadataMap {
        let mut stations = StationMetadataMap::new();
        stations.insert(
            code("CHTI"),
            StationMetadata {
                status: StationStatus::Online,
                port: Some(4801),
                network_port: Some(4811),
                last_seen: LastSeen::parse("2025-07-24 08:00"),
                data_verified: Some(true),
            },
        );
        stations
    }

    #[tokio::test]
    async fn test_scan_run_persists_all_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let caster = FakeCaster::new(&[
            (4802, "STR;aucksingleADV4;;\nSTR;HAMTsingleADV4;;\n"),
            (4807, "STR;AUCKsingle;;\n"),
            (4812, "STR;AUCKnet;;\nSTR;TRECnet;;\n"),
        ]);
        let store = Arc::new(MemoryStore::new(prior()));
        let pipeline = Pipeline::new(config(temp_dir.path()), caster, store.clone());

        let summary = pipeline.run_scan(false, at(14, 3)).await.unwrap();
        assert_eq!(summary.ports_attempted, 16);
        assert_eq!(summary.failed_ports.len(), 13);
        assert_eq!(summary.stations, 3);
        assert_eq!(summary.online, 2);
        assert_eq!(summary.transitions.len(), 1);
        assert_eq!(summary.transitions[0].kind, TransitionKind::WentOffline);

        let stations = store.snapshot().await;
        let auck = &stations[&code("AUCK")];
        assert_eq!(auck.port, Some(4802));
        assert_eq!(auck.network_port, Some(4812));
        assert_eq!(auck.last_seen.to_string(), "2025-07-25 14:03");

        let chti = &stations[&code("CHTI")];
        assert_eq!(chti.status, StationStatus::Offline);
        assert_eq!(chti.port, Some(4801));
        assert_eq!(chti.last_seen.to_string(), "2025-07-24 08:00");
        assert!(!stations.contains_key(&code("TREC")));

        assert!(temp_dir.path().join("station_port_mapping.json").exists());
        assert!(temp_dir.path().join("QA_Port_Assignments.txt").exists());
    }

    #[tokio::test]
    async fn test_fail_safe_leaves_store_byte_identical() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(temp_dir.path());
        let meta_path = config.meta_path();

        let seed = JsonFileStore::new(&meta_path);
        seed.save(&prior()).await.unwrap();
        let before = tokio::fs::read(&meta_path).await.unwrap();

        let caster = FakeCaster::new(&[(4801, "SOURCETABLE 200 OK\r\nENDSOURCETABLE\r\n")]);
        let pipeline = Pipeline::new(config, caster, JsonFileStore::new(&meta_path));

        let err = pipeline.run_scan(false, at(14, 3)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NoStreamsDiscovered { ports_attempted: 16 })
        ));

        let after = tokio::fs::read(&meta_path).await.unwrap();
        assert_eq!(before, after);
        assert!(!temp_dir.path().join("station_port_mapping.json").exists());
        assert!(!temp_dir.path().join("QA_Port_Assignments.txt").exists());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_apart_from_last_seen() {
        let temp_dir = TempDir::new().unwrap();
        let tables = [(4803, "STR;AUCKs;;\nSTR;BLUFs;;\n"), (4810, "STR;AUCKn;;\n")];
        let store = Arc::new(MemoryStore::new(prior()));
        let pipeline = Pipeline::new(config(temp_dir.path()), FakeCaster::new(&tables), store.clone());

        pipeline.run_scan(false, at(14, 0)).await.unwrap();
        let first = store.snapshot().await;
        let second_summary = pipeline.run_scan(false, at(14, 15)).await.unwrap();
        let second = store.snapshot().await;

        assert!(second_summary.transitions.is_empty());
        assert_eq!(first.len(), second.len());
        for (code, meta) in &first {
            let again = &second[code];
            assert_eq!(meta.status, again.status);
            assert_eq!(meta.port, again.port);
            assert_eq!(meta.network_port, again.network_port);
            if !meta.is_online() {
                assert_eq!(meta.last_seen, again.last_seen);
            }
        }
    }

    #[tokio::test]
    async fn test_site_status_run() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(prior()));
        let pipeline = Pipeline::new(config(temp_dir.path()), FakeCaster::new(&[]), store.clone());

        let empty = BTreeMap::new();
        let err = pipeline.run_site_status(&empty, at(9, 0)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NoSitesReturned)
        ));
        assert_eq!(store.save_count().await, 0);

        let mut sites = BTreeMap::new();
        sites.insert(code("CHTI"), false);
        let summary = pipeline.run_site_status(&sites, at(9, 0)).await.unwrap();
        assert_eq!(summary.online, 0);
        assert_eq!(store.snapshot().await[&code("CHTI")].port, Some(4801));

        let report = tokio::fs::read_to_string(temp_dir.path().join("QA_Port_Assignments.txt"))
            .await
            .unwrap();
        assert!(report.starts_with("QA STATION STATUS REPORT (2025-07-25 09:00)"));
    }

    #[tokio::test]
    async fn test_report_run_uses_stored_metadata_only() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(prior()));
        let pipeline = Pipeline::new(config(temp_dir.path()), FakeCaster::new(&[]), store.clone());

        let summary = pipeline.run_report(at(10, 0)).await.unwrap();
        assert_eq!(summary.stations, 1);
        assert_eq!(store.save_count().await, 0);

        let mapping = tokio::fs::read_to_string(temp_dir.path().join("station_port_mapping.json"))
            .await
            .unwrap();
        assert_eq!(mapping, "{\n    \"CHTI\": 4801\n}");
    }
}
