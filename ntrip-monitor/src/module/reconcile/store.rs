//! Persisted station metadata
//!
//! The reconciler only talks to `MetadataStore`; `JsonFileStore` is the
//! production backing and `MemoryStore` serves tests and dry runs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ntrip_common::{StationCode, StationMetadata, StationMetadataMap};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn load(&self) -> Result<StationMetadataMap>;
    async fn save(&self, stations: &StationMetadataMap) -> Result<()>;
}

#[async_trait]
impl<T: MetadataStore + ?Sized> MetadataStore for Arc<T> {
    async fn load(&self) -> Result<StationMetadataMap> {
        (**self).load().await
    }

    async fn save(&self, stations: &StationMetadataMap) -> Result<()> {
        (**self).save(stations).await
    }
}

/// `station_meta.json` on disk
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    /// A missing file is a first run. A file that exists but does not parse
    /// is an error: continuing would overwrite the history it holds.
    async fn load(&self) -> Result<StationMetadataMap> {
        if !self.path.exists() {
            debug!("Metadata file does not exist: {:?}", self.path);
            return Ok(StationMetadataMap::new());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read metadata file {:?}", self.path))?;

        let stations = decode_metadata(&content)
            .with_context(|| format!("Failed to parse metadata file {:?}", self.path))?;

        info!("Loaded metadata for {} stations", stations.len());
        Ok(stations)
    }

    async fn save(&self, stations: &StationMetadataMap) -> Result<()> {
        write_json_atomic(&self.path, stations).await?;
        info!("Saved metadata for {} stations to {:?}", stations.len(), self.path);
        Ok(())
    }
}

/// Parse the metadata document. Entries whose key is not a station code are
/// dropped with a warning so one bad key cannot discard the whole history.
pub fn decode_metadata(content: &str) -> Result<StationMetadataMap> {
    let raw: BTreeMap<String, StationMetadata> = serde_json::from_str(content)?;
    let mut stations = StationMetadataMap::new();
    for (key, meta) in raw {
        match StationCode::parse(&key) {
            Ok(code) => {
                if stations.insert(code.clone(), meta).is_some() {
                    warn!("Duplicate metadata entry for {} (key {:?}), keeping the last", code, key);
                }
            }
            Err(e) => warn!("Skipping metadata entry {:?}: {}", key, e),
        }
    }
    Ok(stations)
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    stations: RwLock<StationMetadataMap>,
    saves: RwLock<usize>,
}

impl MemoryStore {
    pub fn new(stations: StationMetadataMap) -> Self {
        Self {
            stations: RwLock::new(stations),
            saves: RwLock::new(0),
        }
    }

    pub async fn snapshot(&self) -> StationMetadataMap {
        self.stations.read().await.clone()
    }

    pub async fn save_count(&self) -> usize {
        *self.saves.read().await
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn load(&self) -> Result<StationMetadataMap> {
        Ok(self.stations.read().await.clone())
    }

    async fn save(&self, stations: &StationMetadataMap) -> Result<()> {
        *self.stations.write().await = stations.clone();
        *self.saves.write().await += 1;
        Ok(())
    }
}

/// Pretty JSON with 4-space indentation and every object's keys sorted.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    // going through Value sorts struct fields as well as map keys
    let value = serde_json::to_value(value).context("Failed to serialize JSON")?;
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .context("Failed to serialize JSON")?;
    Ok(out)
}

/// Write via a sibling temp file and rename, so readers never see half a file.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &to_pretty_json(value)?).await
}

pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {:?} into place", path))?;
    Ok(())
}
