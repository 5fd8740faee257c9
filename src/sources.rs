//! The source catalog: which authorities to watch and where.
//!
//! ```toml
//! [[authority]]
//! id = "yongsan"
//! name = "용산구"                     # area name used for disambiguation
//! center = [37.5326, 126.9907]        # optional; district table otherwise
//! urls = [
//!     "https://www.yongsan.go.kr/portal/bbs/B0000041/view.do?nttId=1",
//!     { url = "https://www.yongsan.go.kr/files/shuttle.pdf", kind = "pdf" },
//! ]
//!
//! [[manual]]
//! authority = "yongsan"
//! stop = "용산구청 앞"
//! lat = 37.5324
//! lon = 126.9905
//! ```

use crate::error::PipelineError;
use crate::model::{in_bounds, DocumentKind, Source};
use crate::pipeline::landmarks::{district_center, district_name};
use crate::pipeline::resolve::Area;
use crate::pipeline::structure::DistrictMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A catalog URL, with or without an explicit kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlEntry {
    Plain(String),
    Detailed {
        url: String,
        #[serde(default)]
        kind: Option<DocumentKind>,
    },
}

impl UrlEntry {
    pub fn url(&self) -> &str {
        match self {
            UrlEntry::Plain(url) | UrlEntry::Detailed { url, .. } => url,
        }
    }

    fn kind(&self) -> Option<DocumentKind> {
        match self {
            UrlEntry::Plain(_) => None,
            UrlEntry::Detailed { kind, .. } => *kind,
        }
    }
}

/// One municipal body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authority {
    pub id: String,
    /// Administrative area name, e.g. `용산구`.
    pub name: String,
    #[serde(default)]
    pub center: Option<(f64, f64)>,
    #[serde(default)]
    pub urls: Vec<UrlEntry>,
}

impl Authority {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            center: None,
            urls: Vec::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(UrlEntry::Plain(url.into()));
        self
    }

    pub fn with_center(mut self, lat: f64, lon: f64) -> Self {
        self.center = Some((lat, lon));
        self
    }

    /// Configured centre, else the district table's.
    pub fn effective_center(&self) -> Option<(f64, f64)> {
        self.center.or_else(|| district_center(&self.name))
    }

    pub fn area(&self) -> Area {
        Area {
            id: self.id.clone(),
            name: self.name.clone(),
            center: self.effective_center(),
        }
    }
}

/// Coordinates supplied by an operator for a stop no provider finds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub authority: String,
    pub stop: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    #[serde(default, rename = "authority")]
    pub authorities: Vec<Authority>,
    #[serde(default)]
    pub manual: Vec<ManualOverride>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authority(mut self, authority: Authority) -> Self {
        self.authorities.push(authority);
        self
    }

    pub fn with_manual(mut self, authority: &str, stop: &str, lat: f64, lon: f64) -> Self {
        self.manual.push(ManualOverride {
            authority: authority.to_string(),
            stop: stop.to_string(),
            lat,
            lon,
        });
        self
    }

    /// Read and validate a TOML catalog.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::SourceCatalog {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        let catalog = Self::from_toml(&text, path)?;
        debug!(
            "Loaded {} authorities, {} manual overrides from {}",
            catalog.authorities.len(),
            catalog.manual.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Parse and validate TOML text; `path` only labels errors.
    pub fn from_toml(text: &str, path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        let catalog: SourceCatalog = toml::from_str(text).map_err(|e| PipelineError::SourceCatalog {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        catalog
            .validate()
            .map_err(|detail| PipelineError::SourceCatalog { path, detail })?;
        Ok(catalog)
    }

    /// Structural checks: unique non-empty ids, known authorities for
    /// overrides, coordinates inside the service area.
    pub fn validate(&self) -> Result<(), String> {
        let mut ids = HashSet::new();
        for a in &self.authorities {
            if a.id.trim().is_empty() {
                return Err("authority with an empty id".into());
            }
            if !ids.insert(a.id.as_str()) {
                return Err(format!("duplicate authority id '{}'", a.id));
            }
            if let Some((lat, lon)) = a.center {
                if !in_bounds(lat, lon) {
                    return Err(format!("center of '{}' ({lat}, {lon}) is outside the service area", a.id));
                }
            }
        }
        for m in &self.manual {
            if !ids.contains(m.authority.as_str()) {
                return Err(format!("manual override for unknown authority '{}'", m.authority));
            }
            if !in_bounds(m.lat, m.lon) {
                return Err(format!(
                    "manual override '{}' ({}, {}) is outside the service area",
                    m.stop, m.lat, m.lon
                ));
            }
        }
        Ok(())
    }

    pub fn authority(&self, id: &str) -> Option<&Authority> {
        self.authorities.iter().find(|a| a.id == id)
    }

    /// District sections map to the first authority named after the
    /// district, or to the district name when the catalog has none.
    pub fn districts(&self) -> DistrictMap {
        let mut map = DistrictMap::seoul();
        for a in self.authorities.iter().rev() {
            if let Some(district) = district_name(&a.name) {
                map = map.with_authority(district, a.id.as_str());
            }
        }
        map
    }

    /// Search area for an authority id: the catalog entry, else a Seoul
    /// district used as an id by a district section.
    pub fn area_for(&self, id: &str) -> Option<Area> {
        if let Some(a) = self.authority(id) {
            return Some(a.area());
        }
        let district = district_name(id).filter(|d| *d == id)?;
        Some(Area {
            id: id.to_string(),
            name: district.to_string(),
            center: district_center(district),
        })
    }

    /// Every configured source in catalog order; repeated URLs keep their
    /// first occurrence.
    pub fn sources(&self) -> Vec<Source> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for authority in &self.authorities {
            for entry in &authority.urls {
                let url = entry.url().trim();
                if url.is_empty() {
                    continue;
                }
                if !seen.insert(url.to_string()) {
                    warn!("{}: duplicate URL {} ignored", authority.id, url);
                    continue;
                }
                let mut source = Source::new(&authority.id, url);
                if let Some(kind) = entry.kind() {
                    source = source.with_kind(kind);
                }
                out.push(source);
            }
        }
        out
    }

    /// Manual overrides as `(authority, stop, lat, lon)`.
    pub fn overrides(&self) -> impl Iterator<Item = (&str, &str, f64, f64)> {
        self.manual
            .iter()
            .map(|m| (m.authority.as_str(), m.stop.as_str(), m.lat, m.lon))
    }
}
