use anyhow::Context;
use ntrip_common::StationCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::module::health::HealthPolicy;
use crate::module::reconcile::ReconcilePolicy;
use crate::module::scan::ScanPolicy;
use crate::module::sourcetable::CasterEndpoint;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasterConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// First caster port scanned (inclusive)
    #[serde(default = "default_port_start")]
    pub port_start: u16,

    /// Last caster port scanned (inclusive)
    #[serde(default = "default_port_end")]
    pub port_end: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Upper bound for one complete source-table download
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Minimum spacing between two request starts against the caster
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Noise mountpoints and decommissioned stations, matched case-insensitively
    #[serde(default = "default_excluded_codes")]
    pub excluded_codes: BTreeSet<StationCode>,

    /// Operator-asserted primary ports; an override also forces the station Online
    #[serde(default)]
    pub overrides: BTreeMap<StationCode, u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRoleConfig {
    /// Ports below this value are single-site ports
    #[serde(default = "default_network_threshold")]
    pub network_threshold: u16,

    #[serde(default = "default_network_start")]
    pub network_start: u16,

    #[serde(default = "default_network_end")]
    pub network_end: u16,

    /// Optional region labels shown in the QA report, keyed by port number
    #[serde(default)]
    pub names: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_mount_suffix")]
    pub mount_suffix: String,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// A station is verified once strictly more frames than this were decoded
    #[serde(default = "default_min_frames")]
    pub min_frames: u32,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_catalog")]
    pub catalog: String,

    #[serde(default = "default_meta_file")]
    pub meta_file: String,

    #[serde(default = "default_mapping_file")]
    pub mapping_file: String,

    #[serde(default = "default_report_file")]
    pub report_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    #[serde(default = "default_true")]
    pub run_on_start: bool,

    #[serde(default)]
    pub verify_after_scan: bool,

    /// Upper bound for one complete run
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub caster: CasterConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub ports: PortRoleConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub api: Option<ApiConfig>,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_host() -> String {
    "www.smartfix.co.nz".to_string()
}

fn default_port_start() -> u16 {
    4800
}

fn default_port_end() -> u16 {
    4815
}

fn default_user_agent() -> String {
    "NTRIP ntrip-monitor/0.1".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_response_timeout_secs() -> u64 {
    30
}

fn default_request_delay_ms() -> u64 {
    1000
}

fn default_max_concurrency() -> usize {
    1
}

fn default_excluded_codes() -> BTreeSet<StationCode> {
    [
        "TREC", "2GRO", "2GR0", "1778", "7651", "XGRX", "GSMG", "NEAR", "VRS_", "MAC_", "RTCM",
    ]
    .iter()
    .filter_map(|code| StationCode::parse(code).ok())
    .collect()
}

fn default_network_threshold() -> u16 {
    4810
}

fn default_network_start() -> u16 {
    4810
}

fn default_network_end() -> u16 {
    4815
}

fn default_mount_suffix() -> String {
    "singleADV4".to_string()
}

fn default_window_secs() -> u64 {
    5
}

fn default_min_frames() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    2000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("app/data")
}

fn default_catalog() -> String {
    "Sites_20250725_Global.geojson".to_string()
}

fn default_meta_file() -> String {
    "station_meta.json".to_string()
}

fn default_mapping_file() -> String {
    "station_port_mapping.json".to_string()
}

fn default_report_file() -> String {
    "QA_Port_Assignments.txt".to_string()
}

fn default_api_timeout_secs() -> u64 {
    10
}

fn default_interval_minutes() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_run_timeout_secs() -> u64 {
    15 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for CasterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port_start: default_port_start(),
            port_end: default_port_end(),
            user: String::new(),
            password: String::new(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            response_timeout_secs: default_response_timeout_secs(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            request_delay_ms: default_request_delay_ms(),
            max_concurrency: default_max_concurrency(),
            excluded_codes: default_excluded_codes(),
            overrides: BTreeMap::new(),
        }
    }
}

impl Default for PortRoleConfig {
    fn default() -> Self {
        Self {
            network_threshold: default_network_threshold(),
            network_start: default_network_start(),
            network_end: default_network_end(),
            names: BTreeMap::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mount_suffix: default_mount_suffix(),
            window_secs: default_window_secs(),
            min_frames: default_min_frames(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            catalog: default_catalog(),
            meta_file: default_meta_file(),
            mapping_file: default_mapping_file(),
            report_file: default_report_file(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            run_on_start: default_true(),
            verify_after_scan: false,
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            caster: CasterConfig::default(),
            scan: ScanConfig::default(),
            ports: PortRoleConfig::default(),
            health: HealthConfig::default(),
            paths: PathsConfig::default(),
            api: None,
            schedule: ScheduleConfig::default(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

impl MonitorConfig {
    /// Load, apply credential environment overrides, and validate.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        apply_credentials(
            &mut self.caster.user,
            &mut self.caster.password,
            std::env::var("NTRIP_USER").ok(),
            std::env::var("NTRIP_PASSWORD").ok(),
        );
        if let Some(api) = self.api.as_mut() {
            apply_credentials(
                &mut api.username,
                &mut api.password,
                std::env::var("SMARTFIX_USER").ok(),
                std::env::var("SMARTFIX_PASSWORD").ok(),
            );
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.caster.host.trim().is_empty() {
            anyhow::bail!("caster.host must not be empty");
        }
        if self.caster.port_start > self.caster.port_end {
            anyhow::bail!(
                "caster port range is empty ({}..={})",
                self.caster.port_start,
                self.caster.port_end
            );
        }
        if self.ports.network_start > self.ports.network_end {
            anyhow::bail!(
                "network port range is empty ({}..={})",
                self.ports.network_start,
                self.ports.network_end
            );
        }
        if self.caster.connect_timeout_secs == 0 {
            anyhow::bail!("caster.connect_timeout_secs must be positive");
        }
        if self.caster.response_timeout_secs == 0 {
            anyhow::bail!("caster.response_timeout_secs must be positive");
        }
        if self.health.window_secs == 0 {
            anyhow::bail!("health.window_secs must be positive");
        }
        if self.scan.max_concurrency == 0 {
            anyhow::bail!("scan.max_concurrency must be at least 1");
        }
        if self.schedule.interval_minutes == 0 {
            anyhow::bail!("schedule.interval_minutes must be positive");
        }
        Ok(())
    }

    pub fn caster_endpoint(&self) -> CasterEndpoint {
        CasterEndpoint {
            host: self.caster.host.clone(),
            user: self.caster.user.clone(),
            password: self.caster.password.clone(),
            user_agent: self.caster.user_agent.clone(),
            timeout: Duration::from_secs(self.caster.connect_timeout_secs),
            response_timeout: Duration::from_secs(self.caster.response_timeout_secs),
        }
    }

    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            ports: (self.caster.port_start..=self.caster.port_end).collect(),
            request_delay: Duration::from_millis(self.scan.request_delay_ms),
            max_concurrency: self.scan.max_concurrency,
            excluded: self.scan.excluded_codes.clone(),
        }
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            network_threshold: self.ports.network_threshold,
            network_range: self.ports.network_start..=self.ports.network_end,
            overrides: self.scan.overrides.clone(),
            excluded: self.scan.excluded_codes.clone(),
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            mount_suffix: self.health.mount_suffix.clone(),
            window: Duration::from_secs(self.health.window_secs),
            min_frames: self.health.min_frames,
            cooldown: Duration::from_millis(self.health.cooldown_ms),
        }
    }

    /// Whether a scan should be followed by a verification pass. A request
    /// from the command line or schedule always wins; `[health] enabled`
    /// turns it on for every scan.
    pub fn verify_on_scan(&self, requested: bool) -> bool {
        requested || self.health.enabled
    }

    pub fn port_names(&self) -> BTreeMap<u16, String> {
        self.ports
            .names
            .iter()
            .filter_map(|(port, name)| match port.trim().parse::<u16>() {
                Ok(port) => Some((port, name.clone())),
                Err(_) => {
                    tracing::warn!("Ignoring region label for invalid port '{}'", port);
                    None
                }
            })
            .collect()
    }

    pub fn meta_path(&self) -> PathBuf {
        self.paths.data_dir.join(&self.paths.meta_file)
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.paths.data_dir.join(&self.paths.mapping_file)
    }

    pub fn report_path(&self) -> PathBuf {
        self.paths.data_dir.join(&self.paths.report_file)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.paths.data_dir.join(&self.paths.catalog)
    }
}

/// Environment credentials win over the file when present and non-empty.
fn apply_credentials(
    user: &mut String,
    password: &mut String,
    env_user: Option<String>,
    env_password: Option<String>,
) {
    if let Some(value) = env_user.filter(|v| !v.is_empty()) {
        *user = value;
    }
    if let Some(value) = env_password.filter(|v| !v.is_empty()) {
        *password = value;
    }
}
