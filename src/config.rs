use crate::types::IndicatorKey;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub indicators: IndicatorColumns,
    #[serde(default)]
    pub proximity: ProximityConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub boundaries: PathBuf,
    pub indicators_csv: PathBuf,
    pub join_column_csv: String,
    pub poi_catalog: PathBuf,
    pub classifier_model: PathBuf,
}

/// CSV column holding each canonical indicator. A key without a column is
/// never reported.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndicatorColumns {
    pub population_total: Option<String>,
    pub density: Option<String>,
    pub housing_with_water_pct: Option<String>,
    pub housing_with_electricity_pct: Option<String>,
}

impl IndicatorColumns {
    pub fn column_for(&self, key: IndicatorKey) -> Option<&str> {
        match key {
            IndicatorKey::PopulationTotal => self.population_total.as_deref(),
            IndicatorKey::Density => self.density.as_deref(),
            IndicatorKey::HousingWithWaterPct => self.housing_with_water_pct.as_deref(),
            IndicatorKey::HousingWithElectricityPct => self.housing_with_electricity_pct.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProximityConfig {
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    pub search_timeout_ms: Option<u64>,
    pub indicator_timeout_ms: Option<u64>,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            categories: default_categories(),
            search_timeout_ms: None,
            indicator_timeout_ms: None,
        }
    }
}

impl ProximityConfig {
    pub fn search_timeout(&self) -> Option<Duration> {
        self.search_timeout_ms.map(Duration::from_millis)
    }

    pub fn indicator_timeout(&self) -> Option<Duration> {
        self.indicator_timeout_ms.map(Duration::from_millis)
    }
}

fn default_categories() -> Vec<String> {
    vec!["hospital".into(), "police".into(), "fire".into()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [input]
            boundaries = "data/municipios.geojson"
            indicators_csv = "data/indicadores.csv"
            join_column_csv = "CVEGEO"
            poi_catalog = "data/poi.geojson"
            classifier_model = "data/model.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.proximity.categories, vec!["hospital", "police", "fire"]);
        assert_eq!(config.proximity.search_timeout(), None);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.indicators.column_for(IndicatorKey::Density), None);
    }

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(
            r#"
            [input]
            boundaries = "b.geojson"
            indicators_csv = "i.csv"
            join_column_csv = "code"
            poi_catalog = "p.geojson"
            classifier_model = "m.json"

            [indicators]
            population_total = "POBTOT"
            housing_with_water_pct = "VPH_AGUADV"

            [proximity]
            categories = ["hospital", "shelter"]
            search_timeout_ms = 2500

            [server]
            port = 3000
            "#,
        )
        .unwrap();

        assert_eq!(config.proximity.categories, vec!["hospital", "shelter"]);
        assert_eq!(config.proximity.search_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.indicators.column_for(IndicatorKey::PopulationTotal), Some("POBTOT"));
        assert_eq!(config.indicators.column_for(IndicatorKey::Density), None);
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_missing_input_section_is_an_error() {
        assert!(AppConfig::from_toml("[server]\nport = 1\n").is_err());
    }
}
