use crate::geometry::Polygon;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
pub struct Municipality {
    pub code: String,
    pub name: String,
    pub region: Option<String>,
    #[serde(skip)]
    pub polygon: Option<Polygon>,
    pub hazard: HazardAttributes,
}

/// Static flood attributes shipped with the boundary dataset. Every field is
/// optional: a missing or malformed property decodes to `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HazardAttributes {
    pub city_area_km2: Option<f64>,
    pub inundated_area_km2: Option<f64>,
    pub vulnerable_population: Option<u64>,
    pub vulnerability_index: Option<String>,
    pub flood_hazard: Option<String>,
    pub threshold_12h_mm: Option<f64>,
    pub inundated_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProximityMetric {
    pub count: usize,
    /// 0.0 when `count` is 0.
    pub mean_distance_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKey {
    PopulationTotal,
    Density,
    HousingWithWaterPct,
    HousingWithElectricityPct,
}

impl IndicatorKey {
    pub const ALL: [IndicatorKey; 4] = [
        IndicatorKey::PopulationTotal,
        IndicatorKey::Density,
        IndicatorKey::HousingWithWaterPct,
        IndicatorKey::HousingWithElectricityPct,
    ];
}

/// Partial by nature: an absent key means "not reported", never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct IndicatorSet(BTreeMap<IndicatorKey, f64>);

impl IndicatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: IndicatorKey, value: f64) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: IndicatorKey) -> Option<f64> {
        self.0.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(IndicatorKey, f64)> for IndicatorSet {
    fn from_iter<I: IntoIterator<Item = (IndicatorKey, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Point-in-time fusion of one municipality's static attributes, indicators
/// and proximity metrics. `None` blocks mark a dependency that did not
/// deliver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub generation: u64,
    pub code: String,
    pub name: Option<String>,
    pub region: Option<String>,
    pub hazard: Option<HazardAttributes>,
    pub indicators: Option<IndicatorSet>,
    pub proximity: Option<BTreeMap<String, ProximityMetric>>,
    /// Categories whose search failed and were reported as empty.
    pub failed_categories: Vec<String>,
}

impl MetricsSnapshot {
    /// A snapshot with every block unavailable.
    pub fn unavailable(generation: u64, code: impl Into<String>) -> Self {
        Self {
            generation,
            code: code.into(),
            name: None,
            region: None,
            hazard: None,
            indicators: None,
            proximity: None,
            failed_categories: Vec::new(),
        }
    }
}

/// Ordinal flood-danger scale, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum HazardLabel {
    #[serde(rename = "Muy bajo")]
    MuyBajo,
    #[serde(rename = "Bajo")]
    Bajo,
    #[serde(rename = "Medio")]
    Medio,
    #[serde(rename = "Alto")]
    Alto,
    #[serde(rename = "Muy alto")]
    MuyAlto,
}

impl HazardLabel {
    pub const ALL: [HazardLabel; 5] = [
        HazardLabel::MuyBajo,
        HazardLabel::Bajo,
        HazardLabel::Medio,
        HazardLabel::Alto,
        HazardLabel::MuyAlto,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HazardLabel::MuyBajo => "Muy bajo",
            HazardLabel::Bajo => "Bajo",
            HazardLabel::Medio => "Medio",
            HazardLabel::Alto => "Alto",
            HazardLabel::MuyAlto => "Muy alto",
        }
    }

    /// Exact match against the canonical spelling.
    pub fn from_exact(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == label)
    }

    /// Case-insensitive, whitespace-trimmed match, for labels typed into
    /// source data by hand.
    pub fn from_loose(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(label))
    }

    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for HazardLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
