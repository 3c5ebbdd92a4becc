use crate::config::IndicatorColumns;
use crate::types::{IndicatorKey, IndicatorSet};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// An unrecoverable failure. "No data for this municipality" is not an
/// error: it is an empty or partial `IndicatorSet`.
#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("indicator service unavailable: {0}")]
    Unavailable(String),
    #[error("indicator request timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait IndicatorService: Send + Sync {
    async fn fetch(&self, code: &str, keys: &[IndicatorKey]) -> Result<IndicatorSet, IndicatorError>;
}

/// Indicator table read once from a CSV export, keyed by municipality code.
pub struct CsvIndicatorService {
    rows: HashMap<String, IndicatorSet>,
}

impl CsvIndicatorService {
    pub fn from_path(path: &Path, join_column: &str, columns: &IndicatorColumns) -> Result<Self> {
        info!("Loading indicators from {:?}...", path);
        let file = File::open(path)
            .with_context(|| format!("Failed to open CSV file: {:?}", path))?;
        Self::from_reader(file, join_column, columns)
    }

    pub fn from_reader<R: Read>(reader: R, join_column: &str, columns: &IndicatorColumns) -> Result<Self> {
        // Ragged rows are read as far as they go; the column indices decide what is used.
        let mut rdr = ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = rdr.headers()?.clone();

        let join_col_idx = headers
            .iter()
            .position(|h| h == join_column)
            .ok_or_else(|| anyhow!("Join column '{}' not found in CSV", join_column))?;

        // Keys whose configured column is missing from the header are never reported.
        let key_indices: Vec<(IndicatorKey, usize)> = IndicatorKey::ALL
            .into_iter()
            .filter_map(|key| {
                let column = columns.column_for(key)?;
                let idx = headers.iter().position(|h| h == column);
                if idx.is_none() {
                    debug!(?key, column, "Indicator column not present in CSV");
                }
                Some((key, idx?))
            })
            .collect();

        let mut rows = HashMap::new();
        let mut skipped = 0usize;
        for result in rdr.records() {
            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    let line = err.position().map(|p| p.line());
                    warn!(?line, error = %err, "Skipping malformed indicator record");
                    skipped += 1;
                    continue;
                }
            };
            let code = record.get(join_col_idx).unwrap_or("").trim();
            if code.is_empty() {
                continue;
            }

            let set: IndicatorSet = key_indices
                .iter()
                .filter_map(|&(key, idx)| {
                    let value: f64 = record.get(idx)?.trim().parse().ok()?;
                    value.is_finite().then_some((key, value))
                })
                .collect();

            rows.insert(code.to_string(), set);
        }

        info!("Loaded indicators for {} municipalities ({} records skipped)", rows.len(), skipped);
        Ok(Self { rows })
    }
}

#[async_trait]
impl IndicatorService for CsvIndicatorService {
    async fn fetch(&self, code: &str, keys: &[IndicatorKey]) -> Result<IndicatorSet, IndicatorError> {
        let Some(row) = self.rows.get(code) else {
            debug!(code, "No indicator row");
            return Ok(IndicatorSet::new());
        };

        Ok(keys
            .iter()
            .filter_map(|&key| row.get(key).map(|value| (key, value)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
CVEGEO,NOM_MUN,POBTOT,DENS,VPH_AGUADV
01001,Aguascalientes,948990,812.4,97.5
01002,Asientos,51536,,n/d
,Orphan,1,1,1
";

    fn columns() -> IndicatorColumns {
        IndicatorColumns {
            population_total: Some("POBTOT".into()),
            density: Some("DENS".into()),
            housing_with_water_pct: Some("VPH_AGUADV".into()),
            housing_with_electricity_pct: Some("VPH_ELEC".into()),
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_requested_keys() {
        let service = CsvIndicatorService::from_reader(CSV.as_bytes(), "CVEGEO", &columns()).unwrap();
        let set = service
            .fetch("01001", &[IndicatorKey::PopulationTotal, IndicatorKey::HousingWithWaterPct])
            .await
            .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.get(IndicatorKey::PopulationTotal), Some(948990.0));
        assert_eq!(set.get(IndicatorKey::HousingWithWaterPct), Some(97.5));
        assert_eq!(set.get(IndicatorKey::Density), None);
    }

    #[tokio::test]
    async fn test_blank_and_unparseable_cells_are_absent_not_zero() {
        let service = CsvIndicatorService::from_reader(CSV.as_bytes(), "CVEGEO", &columns()).unwrap();
        let set = service.fetch("01002", &IndicatorKey::ALL).await.unwrap();

        assert_eq!(set.get(IndicatorKey::PopulationTotal), Some(51536.0));
        assert_eq!(set.get(IndicatorKey::Density), None);
        assert_eq!(set.get(IndicatorKey::HousingWithWaterPct), None);
        assert_eq!(set.get(IndicatorKey::HousingWithElectricityPct), None);
    }

    #[tokio::test]
    async fn test_unknown_code_is_empty_not_error() {
        let service = CsvIndicatorService::from_reader(CSV.as_bytes(), "CVEGEO", &columns()).unwrap();
        let set = service.fetch("99999", &IndicatorKey::ALL).await.unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_ragged_row_does_not_abort_load() {
        let csv = "CVEGEO,POBTOT\n01001,100\n01002,200,EXTRA\n01003,300\n";
        let service = CsvIndicatorService::from_reader(csv.as_bytes(), "CVEGEO", &columns()).unwrap();

        let first = service.fetch("01001", &IndicatorKey::ALL).await.unwrap();
        let last = service.fetch("01003", &IndicatorKey::ALL).await.unwrap();
        assert_eq!(first.get(IndicatorKey::PopulationTotal), Some(100.0));
        assert_eq!(last.get(IndicatorKey::PopulationTotal), Some(300.0));

        let ragged = service.fetch("01002", &IndicatorKey::ALL).await.unwrap();
        assert_eq!(ragged.get(IndicatorKey::PopulationTotal), Some(200.0));
    }

    #[tokio::test]
    async fn test_undecodable_record_is_skipped() {
        let csv: &[u8] = b"CVEGEO,POBTOT\n01001,100\n01002,\xff\xfe\n01003,300\n";
        let service = CsvIndicatorService::from_reader(csv, "CVEGEO", &columns()).unwrap();

        assert!(service.fetch("01002", &IndicatorKey::ALL).await.unwrap().is_empty());
        let last = service.fetch("01003", &IndicatorKey::ALL).await.unwrap();
        assert_eq!(last.get(IndicatorKey::PopulationTotal), Some(300.0));
    }

    #[test]
    fn test_missing_join_column_fails() {
        let result = CsvIndicatorService::from_reader(CSV.as_bytes(), "CODE", &columns());
        assert!(result.is_err());
    }
}
