use std::collections::HashMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{anyhow, Context, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub map: MapConfig,
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    pub server: ServerConfig,
    pub datasets: HashMap<String, DatasetConfig>,
    pub forecast: Option<ForecastConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MapConfig {
    pub center_lat: f64,
    pub center_lng: f64,
    pub zoom: u8,
    #[serde(default = "default_selection_zoom")]
    pub selection_zoom: u8,
    /// Dropdown value that selects every marker.
    #[serde(default = "default_all_label")]
    pub all_label: String,
    /// Dataset loaded when the server starts.
    pub default_dataset: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub fetch_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    pub grid_size_px: f64,
    pub min_cluster_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            grid_size_px: 60.0,
            min_cluster_size: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    /// Local path or http(s) URL of the CSV file.
    pub source: String,
    /// Other files the page may switch this dataset to.
    #[serde(default)]
    pub sources: Vec<String>,
    pub layout: ColumnLayout,
    pub age_filter: Option<AgeFilter>,
    /// Fixed category for aggregate files; derived from the file name otherwise.
    pub category: Option<String>,
    /// Country appended to aggregate place names.
    pub country: Option<String>,
    #[serde(default)]
    pub title: TitleFormat,
    #[serde(default)]
    pub show_count_label: bool,
    pub overlay: Option<OverlayConfig>,
    #[serde(default)]
    pub request_delay_ms: u64,
    #[serde(default)]
    pub match_on: MatchOn,
    /// Overrides the map center for this dataset, as `[lat, lng]`.
    pub center: Option<[f64; 2]>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnLayout {
    /// `year, age, address..., category`
    FixedColumns,
    /// `year, age, "address, with commas", category`
    QuotedAddress,
    /// `place..., count, year`
    Aggregate,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgeFilter {
    Below(i32),
    Above(i32),
}

impl DatasetConfig {
    /// Whether `source` is this dataset's own file or one of its listed
    /// alternates.
    pub fn allows_source(&self, source: &str) -> bool {
        self.source == source || self.sources.iter().any(|s| s == source)
    }
}

impl AgeFilter {
    pub fn admits(&self, age: i32) -> bool {
        match *self {
            AgeFilter::Below(limit) => age < limit,
            AgeFilter::Above(limit) => age > limit,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TitleFormat {
    #[default]
    Category,
    CategoryYear,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchOn {
    /// Byte-for-byte comparison against the marker title.
    #[default]
    Title,
    Category,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlayConfig {
    Fixed { radius_m: f64 },
    Scaled { base_m: f64, per_incident_m: f64 },
}

#[derive(Debug, Deserialize, Clone)]
pub struct ForecastConfig {
    pub incidents_csv: PathBuf,
    #[serde(default = "default_target_year")]
    pub target_year: i32,
}

fn default_selection_zoom() -> u8 {
    13
}

fn default_all_label() -> String {
    "All".to_string()
}

fn default_target_year() -> i32 {
    2024
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        if !config.datasets.contains_key(&config.map.default_dataset) {
            return Err(anyhow!(
                "default_dataset '{}' is not defined under [datasets]",
                config.map.default_dataset
            ));
        }
        Ok(config)
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetConfig> {
        self.datasets
            .get(name)
            .ok_or_else(|| anyhow!("Unknown dataset '{}'", name))
    }

    /// Resolves the key from the environment first, then from the file.
    pub fn geocoder_api_key(&self) -> Option<String> {
        self.geocoder
            .api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| self.geocoder.api_key.clone())
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
[map]
center_lat = 15.3173
center_lng = 75.7139
zoom = 7
default_dataset = "children"

[geocoder]
endpoint = "https://maps.googleapis.com/maps/api/geocode/json"
api_key = "test-key"

[server]
port = 8080
static_dir = "public"

[datasets.children]
source = "assets/csv/children.csv"
layout = "fixed_columns"
age_filter = { below = 18 }

[datasets.elderly]
source = "assets/csv/elderly2.csv"
layout = "fixed_columns"
age_filter = { above = 50 }
overlay = { kind = "fixed", radius_m = 800.0 }

[datasets.women]
source = "assets/csv/women.csv"
layout = "quoted_address"
request_delay_ms = 200
center = [23.5937, 80.9629]

[datasets.riots]
source = "assets/csv/RIOTS_data_loc_m_y.csv"
sources = ["assets/csv/MURDER_data_loc_m_y.csv"]
layout = "aggregate"
country = "India"
title = "category_year"
show_count_label = true
overlay = { kind = "scaled", base_m = 1000.0, per_incident_m = 100.0 }
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_dataset_variants() {
        let config = AppConfig::from_toml(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.datasets.len(), 4);
        assert_eq!(config.map.selection_zoom, 13);
        assert_eq!(config.map.all_label, "All");
        assert_eq!(config.cluster.min_cluster_size, 2);

        let children = config.dataset("children").unwrap();
        assert_eq!(children.layout, ColumnLayout::FixedColumns);
        assert_eq!(children.age_filter, Some(AgeFilter::Below(18)));
        assert_eq!(children.title, TitleFormat::Category);
        assert!(children.overlay.is_none());

        let riots = config.dataset("riots").unwrap();
        assert_eq!(riots.layout, ColumnLayout::Aggregate);
        assert_eq!(riots.title, TitleFormat::CategoryYear);
        assert_eq!(
            riots.overlay,
            Some(OverlayConfig::Scaled { base_m: 1000.0, per_incident_m: 100.0 })
        );

        let women = config.dataset("women").unwrap();
        assert_eq!(women.request_delay_ms, 200);
        assert_eq!(women.center, Some([23.5937, 80.9629]));
    }

    #[test]
    fn rejects_unknown_default_dataset() {
        let broken = SAMPLE_CONFIG.replace(
            "default_dataset = \"children\"",
            "default_dataset = \"missing\"",
        );
        assert!(AppConfig::from_toml(&broken).is_err());
    }

    #[test]
    fn age_filter_bounds_are_strict() {
        assert!(AgeFilter::Below(18).admits(17));
        assert!(!AgeFilter::Below(18).admits(18));
        assert!(AgeFilter::Above(50).admits(51));
        assert!(!AgeFilter::Above(50).admits(50));
        assert!(AgeFilter::Below(18).admits(-1));
    }

    #[test]
    fn only_listed_sources_are_allowed() {
        let config = AppConfig::from_toml(SAMPLE_CONFIG).unwrap();
        let riots = config.dataset("riots").unwrap();
        assert!(riots.allows_source("assets/csv/RIOTS_data_loc_m_y.csv"));
        assert!(riots.allows_source("assets/csv/MURDER_data_loc_m_y.csv"));
        assert!(!riots.allows_source("/etc/passwd"));
        assert!(!config.dataset("children").unwrap().allows_source("assets/csv/MURDER_data_loc_m_y.csv"));
    }
}
