// Content catalog: path -> descriptive metadata, used for "now playing" titles.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::station::StationLineup;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CatalogEntry {
    pub path: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub hints: Vec<serde_json::Value>,
}

// clip_index values are usually entry lists, but converted catalogs carry
// the odd scalar too; those are kept out of the lookup.
#[derive(Deserialize)]
#[serde(untagged)]
enum ClipIndexValue {
    Entries(Vec<CatalogEntry>),
    Other(serde_json::Value),
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    clip_index: HashMap<String, ClipIndexValue>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentCatalog {
    by_path: HashMap<String, CatalogEntry>,
}

impl ContentCatalog {
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let by_path = entries.into_iter().map(|e| (e.path.clone(), e)).collect();
        Self { by_path }
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_json::from_str(raw)?;
        let entries = file
            .clip_index
            .into_values()
            .filter_map(|v| match v {
                ClipIndexValue::Entries(list) => Some(list),
                ClipIndexValue::Other(_) => None,
            })
            .flatten();
        Ok(Self::from_entries(entries))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn get(&self, path: &str) -> Option<&CatalogEntry> {
        self.by_path.get(path)
    }

    /// Display title: the catalog title when known, else the file stem.
    pub fn title_for(&self, path: &str) -> String {
        self.get(path)
            .map(|e| e.title.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| title_from_path(path))
    }
}

pub fn title_from_path(p: &str) -> String {
    Path::new(p)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Catalogs for every station, keyed by network name.
#[derive(Debug, Default)]
pub struct CatalogSet {
    catalogs: HashMap<String, ContentCatalog>,
    empty: ContentCatalog,
}

impl CatalogSet {
    pub fn load(lineup: &StationLineup, dir: &Path) -> Self {
        let mut set = Self::default();
        for station in lineup.iter().filter(|s| !s.is_guide()) {
            let path = station.catalog_file(dir);
            match ContentCatalog::load(&path) {
                Ok(c) => {
                    tracing::info!("catalog for {}: {} clips", station.network_name, c.len());
                    set.insert(&station.network_name, c);
                }
                Err(e) => tracing::debug!("no catalog for {}: {e:#}", station.network_name),
            }
        }
        set
    }

    pub fn insert(&mut self, network_name: &str, catalog: ContentCatalog) {
        self.catalogs.insert(network_name.to_string(), catalog);
    }

    pub fn for_station(&self, network_name: &str) -> &ContentCatalog {
        self.catalogs.get(network_name).unwrap_or(&self.empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_come_from_catalog_then_file_name() {
        let raw = r#"{
            "version": 0.1,
            "clip_index": {
                "sitcom": [
                    {"path": "/media/sitcom/s01e01.mp4", "title": "Pilot", "duration": 1320.5,
                     "tag": "sitcom", "count": 0, "hints": []}
                ],
                "bump": [
                    {"path": "/media/bump/untitled.mp4", "title": "", "duration": 10}
                ],
                "legacy": "not a list"
            },
            "sequences": {"sitcom": {"episodes": [], "current_index": 0}}
        }"#;
        let catalog = ContentCatalog::from_json(raw).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.title_for("/media/sitcom/s01e01.mp4"), "Pilot");
        assert_eq!(catalog.title_for("/media/bump/untitled.mp4"), "untitled");
        assert_eq!(catalog.title_for("/media/other/Late Show.mkv"), "Late Show");
    }

    #[test]
    fn unknown_station_gets_empty_catalog() {
        let set = CatalogSet::default();
        assert_eq!(set.for_station("nope").title_for("/a/b.mp4"), "b");
    }
}
