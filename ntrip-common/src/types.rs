use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Persisted station metadata keyed by canonical station code
pub type StationMetadataMap = BTreeMap<StationCode, StationMetadata>;

/// Reduced station -> primary port projection consumed by the map tooling
pub type PortAssignments = BTreeMap<StationCode, u16>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StationCodeError {
    #[error("station code '{0}' is shorter than {len} characters", len = StationCode::LEN)]
    TooShort(String),
    #[error("station code '{0}' is longer than {len} characters", len = StationCode::LEN)]
    TooLong(String),
    #[error("station code '{0}' contains non-printable or delimiter characters")]
    InvalidCharacter(String),
}

/// Canonical 4-character uppercase station identifier.
///
/// Every comparison and storage key goes through this type, so `gswf`,
/// `GSWF` and `GsWf` all end up as the same `GSWF` entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StationCode(String);

impl StationCode {
    pub const LEN: usize = 4;

    /// Parse a complete station code (catalog entries, config tables, API sites).
    pub fn parse(raw: &str) -> Result<Self, StationCodeError> {
        let trimmed = raw.trim();
        match trimmed.chars().count() {
            n if n < Self::LEN => Err(StationCodeError::TooShort(trimmed.to_string())),
            n if n > Self::LEN => Err(StationCodeError::TooLong(trimmed.to_string())),
            _ => Self::canonical(trimmed),
        }
    }

    /// Derive the station code from a mountpoint name: its first four characters.
    pub fn from_mountpoint(mountpoint: &str) -> Result<Self, StationCodeError> {
        let trimmed = mountpoint.trim();
        if trimmed.chars().count() < Self::LEN {
            return Err(StationCodeError::TooShort(trimmed.to_string()));
        }
        let prefix: String = trimmed.chars().take(Self::LEN).collect();
        Self::canonical(&prefix)
    }

    fn canonical(code: &str) -> Result<Self, StationCodeError> {
        if code
            .chars()
            .any(|c| !c.is_ascii_graphic() || c == ';')
        {
            return Err(StationCodeError::InvalidCharacter(code.to_string()));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for StationCode {
    type Err = StationCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for StationCode {
    type Error = StationCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StationCode> for String {
    fn from(code: StationCode) -> Self {
        code.0
    }
}

/// Station liveness as seen by the last reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StationStatus {
    Online,
    #[default]
    Offline,
}

impl StationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationStatus::Online => "Online",
            StationStatus::Offline => "Offline",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, StationStatus::Online)
    }
}

impl std::fmt::Display for StationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a station was last seen streaming.
///
/// Persisted as `"YYYY-MM-DD HH:MM"` or the sentinel `"Never"`. Strings in
/// any other shape are kept verbatim so an older file is never rewritten
/// with lost history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LastSeen {
    #[default]
    Never,
    At(NaiveDateTime),
    Raw(String),
}

impl LastSeen {
    pub const FORMAT: &'static str = "%Y-%m-%d %H:%M";
    pub const NEVER: &'static str = "Never";

    /// Build a timestamp truncated to the persisted minute resolution.
    pub fn at(time: NaiveDateTime) -> Self {
        let truncated = time
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(time);
        LastSeen::At(truncated)
    }

    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == Self::NEVER {
            return LastSeen::Never;
        }
        match NaiveDateTime::parse_from_str(raw, Self::FORMAT) {
            Ok(time) => LastSeen::At(time),
            Err(_) => LastSeen::Raw(raw.to_string()),
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, LastSeen::Never)
    }
}

impl std::fmt::Display for LastSeen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LastSeen::Never => f.write_str(Self::NEVER),
            LastSeen::At(time) => write!(f, "{}", time.format(Self::FORMAT)),
            LastSeen::Raw(raw) => f.write_str(raw),
        }
    }
}

impl Serialize for LastSeen {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LastSeen {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(LastSeen::parse).unwrap_or_default())
    }
}

/// Persisted per-station record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StationMetadata {
    pub status: StationStatus,

    /// Primary single-site port (below the network-port threshold)
    #[serde(default)]
    pub port: Option<u16>,

    /// Network-RTK port (inside the configured network range)
    #[serde(default)]
    pub network_port: Option<u16>,

    #[serde(default)]
    pub last_seen: LastSeen,

    /// Set by the stream health pass; absent until a station has been checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_verified: Option<bool>,
}

impl StationMetadata {
    pub fn is_online(&self) -> bool {
        self.status.is_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_station_code_case_folding() {
        let a = StationCode::parse("gswf").unwrap();
        let b = StationCode::parse("GSWF").unwrap();
        let c = StationCode::parse("GsWf").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.as_str(), "GSWF");
    }

    #[test]
    fn test_station_code_from_mountpoint() {
        let code = StationCode::from_mountpoint("auckSingleADV4").unwrap();
        assert_eq!(code.as_str(), "AUCK");
        assert!(matches!(
            StationCode::from_mountpoint("AB"),
            Err(StationCodeError::TooShort(_))
        ));
        assert!(StationCode::from_mountpoint("VRS_RTCM3").is_ok());
    }

    #[test]
    fn test_station_code_parse_rejects_bad_lengths() {
        assert!(matches!(StationCode::parse("ABC"), Err(StationCodeError::TooShort(_))));
        assert!(matches!(StationCode::parse("ABCDE"), Err(StationCodeError::TooLong(_))));
        assert!(matches!(
            StationCode::parse("A B;"),
            Err(StationCodeError::InvalidCharacter(_))
        ));
    }

    #[test]
    fn test_last_seen_parse_and_display() {
        assert_eq!(LastSeen::parse("Never"), LastSeen::Never);
        let at = LastSeen::parse("2025-07-25 14:03");
        assert_eq!(at.to_string(), "2025-07-25 14:03");
        let raw = LastSeen::parse("yesterday-ish");
        assert_eq!(raw, LastSeen::Raw("yesterday-ish".to_string()));
        assert_eq!(raw.to_string(), "yesterday-ish");
    }

    #[test]
    fn test_last_seen_truncates_to_minute() {
        let time = NaiveDate::from_ymd_opt(2025, 7, 25)
            .unwrap()
            .and_hms_opt(14, 3, 59)
            .unwrap();
        assert_eq!(LastSeen::at(time).to_string(), "2025-07-25 14:03");
    }

    #[test]
    fn test_metadata_json_field_names() {
        let json = r#"{
            "gswf": {"status": "Online", "port": 4809, "network_port": null, "last_seen": "2025-07-25 14:03"},
            "TREC": {"status": "Offline", "port": null, "network_port": 4812, "last_seen": "Never", "data_verified": false}
        }"#;
        let map: StationMetadataMap = serde_json::from_str(json).unwrap();
        let gswf = &map[&StationCode::parse("GSWF").unwrap()];
        assert!(gswf.is_online());
        assert_eq!(gswf.port, Some(4809));
        assert_eq!(gswf.data_verified, None);

        let trec = &map[&StationCode::parse("TREC").unwrap()];
        assert_eq!(trec.network_port, Some(4812));
        assert!(trec.last_seen.is_never());

        let out = serde_json::to_value(&map).unwrap();
        assert_eq!(out["GSWF"]["status"], "Online");
        assert!(out["GSWF"].get("data_verified").is_none());
        assert_eq!(out["GSWF"]["network_port"], serde_json::Value::Null);
        assert_eq!(out["TREC"]["data_verified"], false);
        assert_eq!(out["TREC"]["last_seen"], "Never");
    }
}
