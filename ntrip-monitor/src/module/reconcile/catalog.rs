//! Reference site catalog (GeoJSON) used for offline detection

use anyhow::{Context, Result};
use ntrip_common::StationCode;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

const SITE_CODE_PROPERTY: &str = "Site Code";

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Extract the set of known station codes from a GeoJSON FeatureCollection.
pub fn parse_known_stations(geojson: &str) -> Result<BTreeSet<StationCode>> {
    let collection: FeatureCollection =
        serde_json::from_str(geojson).context("Failed to parse site catalog GeoJSON")?;

    let mut codes = BTreeSet::new();
    for properties in collection.features.iter().filter_map(|f| f.properties.as_ref()) {
        let raw = match properties.get(SITE_CODE_PROPERTY) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        match StationCode::parse(&raw) {
            Ok(code) => {
                codes.insert(code);
            }
            Err(e) => warn!("Ignoring catalog site: {}", e),
        }
    }
    Ok(codes)
}

/// Load known station codes; a missing catalog yields an empty set.
pub async fn load_known_stations(path: &Path) -> Result<BTreeSet<StationCode>> {
    if !path.exists() {
        warn!("Site catalog not found at {:?}; offline detection limited to stored stations", path);
        return Ok(BTreeSet::new());
    }

    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read site catalog {:?}", path))?;
    let codes = parse_known_stations(&content)?;

    info!("Loaded {} known stations from {:?}", codes.len(), path);
    Ok(codes)
}
