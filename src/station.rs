// Station lineup: the configured channels, ordered by channel number.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Standard,
    Guide,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    pub network_name: String,
    pub channel_number: u32,
    #[serde(default)]
    pub network_type: NetworkType,
    #[serde(default)]
    pub content_dir: Option<PathBuf>,
    #[serde(default)]
    pub standby_image: Option<PathBuf>,
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    #[serde(default)]
    pub schedule_path: Option<PathBuf>,
}

impl StationConfig {
    pub fn is_guide(&self) -> bool {
        self.network_type == NetworkType::Guide
    }

    /// Schedule file for this station, defaulting to
    /// `<dir>/<network_name>_schedule.json`.
    pub fn schedule_file(&self, dir: &Path) -> PathBuf {
        self.schedule_path
            .clone()
            .unwrap_or_else(|| dir.join(format!("{}_schedule.json", self.network_name)))
    }

    pub fn catalog_file(&self, dir: &Path) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| dir.join(format!("{}_catalog.json", self.network_name)))
    }
}

#[derive(Debug, Clone)]
pub struct StationLineup {
    stations: Vec<StationConfig>,
}

impl StationLineup {
    pub fn new(mut stations: Vec<StationConfig>) -> anyhow::Result<Self> {
        if stations.is_empty() {
            anyhow::bail!("no stations configured");
        }
        stations.sort_by_key(|s| s.channel_number);
        Ok(Self { stations })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read stations from {}", path.display()))?;
        let stations: Vec<StationConfig> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse stations in {}", path.display()))?;
        Self::new(stations)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    /// Station at `index`, clamped into the lineup (which is never empty).
    pub fn at(&self, index: usize) -> &StationConfig {
        &self.stations[index.min(self.stations.len() - 1)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StationConfig> {
        self.stations.iter()
    }

    pub fn index_from_channel(&self, channel_number: u32) -> Option<usize> {
        self.stations
            .iter()
            .position(|s| s.channel_number == channel_number)
    }

    /// Index one step up or down from `index`, wrapping around the lineup.
    pub fn step(&self, index: usize, up: bool) -> usize {
        let n = self.stations.len();
        if up {
            (index + 1) % n
        } else {
            (index + n - 1) % n
        }
    }
}
