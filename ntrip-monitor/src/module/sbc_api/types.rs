//! Response shapes of the SBC API
//!
//! Different controller versions answer login and site queries with
//! different JSON layouts. Each body is resolved once into one of these
//! enums and nothing downstream looks at raw JSON.

use ntrip_common::StationCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LoginResponse {
    TokenObject(TokenObject),
    BareToken(String),
}

/// Login object; whichever key the controller version uses carries the token
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TokenObject {
    #[serde(default, alias = "Token")]
    pub token: Option<String>,

    #[serde(default, rename = "sessionToken", alias = "SessionToken")]
    pub session_token: Option<String>,

    #[serde(default, rename = "accessToken", alias = "AccessToken")]
    pub access_token: Option<String>,

    #[serde(default, alias = "Id", alias = "ID")]
    pub id: Option<serde_json::Value>,
}

impl LoginResponse {
    /// JSON when it parses, otherwise the raw text is the token itself.
    pub fn parse(body: &str) -> Option<Self> {
        if body.trim().is_empty() {
            return None;
        }
        Some(
            serde_json::from_str(body)
                .unwrap_or_else(|_| LoginResponse::BareToken(body.trim().to_string())),
        )
    }

    pub fn token(&self) -> Option<String> {
        let raw = match self {
            LoginResponse::BareToken(token) => Some(token.clone()),
            LoginResponse::TokenObject(object) => object
                .token
                .clone()
                .or_else(|| object.session_token.clone())
                .or_else(|| object.id.as_ref().and_then(value_to_token))
                .or_else(|| object.access_token.clone()),
        }?;
        let token = raw.trim().trim_matches('"').to_string();
        (!token.is_empty()).then_some(token)
    }
}

fn value_to_token(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SitesResponse {
    Wrapped { sites: Vec<Site> },
    Bare(Vec<Site>),
}

impl SitesResponse {
    pub fn into_sites(self) -> Vec<Site> {
        match self {
            SitesResponse::Wrapped { sites } | SitesResponse::Bare(sites) => sites,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Site {
    #[serde(default, rename = "siteCode")]
    pub site_code: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub connected: bool,

    #[serde(default, rename = "receivingData")]
    pub receiving_data: bool,
}

impl Site {
    /// `siteCode` when present, else a name that already looks like a code
    /// (four characters, upper case).
    pub fn station_code(&self) -> Option<StationCode> {
        if let Some(code) = self.site_code.as_deref().filter(|c| !c.trim().is_empty()) {
            return StationCode::parse(code).ok();
        }

        let name = self.name.as_deref()?;
        let looks_like_code = name.chars().count() == StationCode::LEN
            && name.chars().any(char::is_uppercase)
            && !name.chars().any(char::is_lowercase);
        if looks_like_code {
            StationCode::parse(name).ok()
        } else {
            None
        }
    }

    pub fn is_online(&self) -> bool {
        self.connected && self.receiving_data
    }
}

/// Station code -> online flag; sites without a usable code are dropped.
pub fn site_status(sites: &[Site]) -> BTreeMap<StationCode, bool> {
    let mut status = BTreeMap::new();
    for site in sites {
        match site.station_code() {
            Some(code) => {
                status.insert(code, site.is_online());
            }
            None => debug!("Ignoring site without a station code: {:?}", site.name),
        }
    }
    status
}
