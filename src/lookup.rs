// src/lookup.rs
//
// Cleans the raw departmental PIB export and aggregates it to one value per
// (year, department) key. The result is small enough to hold fully in
// memory, which is what makes the streaming join possible.

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

use crate::config::PipelineConfig;
use crate::error::EtlError;

/// Raw API field names mapped to the canonical pipeline schema.
const RENAME_MAP: &[(&str, &str)] = &[
    ("a_o", "anio"),
    ("c_digo_departamento_divipola", "depto_divipola"),
    ("valor_miles_de_millones_de", "valor_api_mm"),
];

/// Fields that must exist after renaming for the table to be usable.
const REQUIRED: &[&str] = &["anio", "depto_divipola", "valor_api_mm"];

#[derive(Debug, Serialize)]
pub struct LookupSummary {
    pub path: PathBuf,
    /// Aggregated (year, department) keys written.
    pub rows: u64,
    /// Raw rows discarded because a required field failed coercion.
    pub dropped: u64,
}

/// One aggregated PIB entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupEntry {
    pub region_name: String,
    pub value: f64,
}

/// The aggregated PIB table keyed by (year, department code).
#[derive(Debug, Default)]
pub struct LookupTable {
    entries: BTreeMap<(i32, i32), LookupEntry>,
}

impl LookupTable {
    pub fn get(&self, year: i32, depto: i32) -> Option<&LookupEntry> {
        self.entries.get(&(year, depto))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold one cleaned raw row into the table: values sum, the display
    /// name keeps the first non-blank variant seen.
    pub fn absorb(&mut self, year: i32, depto: i32, name: &str, value: f64) {
        let entry = self.entries.entry((year, depto)).or_insert(LookupEntry {
            region_name: String::new(),
            value: 0.0,
        });
        entry.value += value;
        if entry.region_name.is_empty() && !name.trim().is_empty() {
            entry.region_name = name.trim().to_string();
        }
    }

    /// Load a previously normalized lookup CSV back into memory. Used when
    /// the join stage runs in a separate invocation from the normalizer.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut rdr = ReaderBuilder::new()
            .from_path(path)
            .with_context(|| format!("opening lookup table {}", path.display()))?;
        let headers: Vec<String> = rdr
            .headers()
            .context("reading lookup header")?
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect();
        let idx_of = |name: &str| headers.iter().position(|h| h == name);
        let (year_idx, depto_idx, value_idx) = match (
            idx_of("anio"),
            idx_of("depto_divipola"),
            idx_of("valor_api_mm"),
        ) {
            (Some(y), Some(d), Some(v)) => (y, d, v),
            _ => {
                return Err(EtlError::SchemaViolation {
                    stage: "lookup",
                    detail: format!(
                        "normalized lookup {} is missing key columns (have: {})",
                        path.display(),
                        headers.join(", ")
                    ),
                }
                .into())
            }
        };
        let name_idx = idx_of("departamento");

        let mut table = LookupTable::default();
        for record in rdr.records() {
            let record = record.context("reading lookup row")?;
            let year = match parse_int(record.get(year_idx).unwrap_or("")) {
                Some(v) => v,
                None => continue,
            };
            let depto = match parse_int(record.get(depto_idx).unwrap_or("")) {
                Some(v) => v,
                None => continue,
            };
            let value = match parse_float(record.get(value_idx).unwrap_or("")) {
                Some(v) => v,
                None => continue,
            };
            let name = name_idx.and_then(|i| record.get(i)).unwrap_or("");
            table.absorb(year, depto, name, value);
        }
        Ok(table)
    }
}

/// Best-effort numeric coercion: strips everything but digits, sign and
/// separators, then treats a comma as a decimal separator.
pub fn parse_float(raw: &str) -> Option<f64> {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '-' | ',' | '.'))
        .collect();
    if filtered.is_empty() {
        return None;
    }
    filtered.replace(',', ".").parse::<f64>().ok()
}

/// Integer coercion through the same cleanup; fractional values do not
/// round silently into keys.
pub fn parse_int(raw: &str) -> Option<i32> {
    let value = parse_float(raw)?;
    if value.fract() != 0.0 {
        return None;
    }
    Some(value as i32)
}

/// Normalize and aggregate the raw PIB CSV.
///
/// Returns the written summary together with the in-memory table so the
/// join stage can consume it without a re-read.
#[instrument(level = "info", skip(cfg, out_csv))]
pub fn run(
    cfg: &PipelineConfig,
    raw_csv: &Path,
    out_csv: Option<PathBuf>,
) -> Result<(LookupSummary, LookupTable)> {
    if !raw_csv.exists() {
        return Err(EtlError::InputNotFound(format!(
            "raw PIB export not found: {}",
            raw_csv.display()
        ))
        .into());
    }

    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .from_path(raw_csv)
        .with_context(|| format!("opening {}", raw_csv.display()))?;

    // Rename raw API field names to the canonical schema.
    let headers: Vec<String> = rdr
        .headers()
        .context("reading header")?
        .iter()
        .map(|h| {
            let lowered = h.trim().to_lowercase();
            RENAME_MAP
                .iter()
                .find(|(from, _)| *from == lowered)
                .map(|(_, to)| to.to_string())
                .unwrap_or(lowered)
        })
        .collect();

    let missing: Vec<&str> = REQUIRED
        .iter()
        .filter(|req| !headers.iter().any(|h| h == *req))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(EtlError::SchemaViolation {
            stage: "lookup",
            detail: format!(
                "missing key columns {:?} after renaming (available: {})",
                missing,
                headers.join(", ")
            ),
        }
        .into());
    }

    let idx_of = |name: &str| headers.iter().position(|h| h == name).unwrap();
    let year_idx = idx_of("anio");
    let depto_idx = idx_of("depto_divipola");
    let value_idx = idx_of("valor_api_mm");
    let name_idx = headers.iter().position(|h| h == "departamento");

    let mut table = LookupTable::default();
    let mut raw_rows: u64 = 0;
    let mut dropped: u64 = 0;
    for record in rdr.records() {
        let record = record.context("reading PIB row")?;
        raw_rows += 1;

        let year = parse_int(record.get(year_idx).unwrap_or(""));
        let depto = parse_int(record.get(depto_idx).unwrap_or(""));
        let value = parse_float(record.get(value_idx).unwrap_or(""));
        let (year, depto, value) = match (year, depto, value) {
            (Some(y), Some(d), Some(v)) => (y, d, v),
            _ => {
                dropped += 1;
                continue;
            }
        };

        let name = name_idx.and_then(|i| record.get(i)).unwrap_or("");
        table.absorb(year, depto, name, value);
    }

    if table.is_empty() {
        return Err(EtlError::DataQualityExhausted {
            stage: "lookup",
            detail: format!("all {raw_rows} rows failed coercion"),
        }
        .into());
    }

    let out_path = out_csv.unwrap_or_else(|| cfg.lookup_path());
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer = WriterBuilder::new()
        .from_path(&out_path)
        .with_context(|| format!("creating {}", out_path.display()))?;
    writer
        .write_record(["anio", "depto_divipola", "departamento", "valor_api_mm"])
        .context("writing lookup header")?;
    for ((year, depto), entry) in &table.entries {
        writer
            .write_record([
                year.to_string(),
                depto.to_string(),
                entry.region_name.clone(),
                entry.value.to_string(),
            ])
            .context("writing lookup row")?;
    }
    writer.flush().context("flushing lookup output")?;

    let summary = LookupSummary {
        path: out_path,
        rows: table.len() as u64,
        dropped,
    };
    info!(
        keys = summary.rows,
        dropped = summary.dropped,
        "lookup table normalized"
    );
    Ok((summary, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> PipelineConfig {
        let mut cfg = PipelineConfig::from_env();
        cfg.data_dir = dir.to_path_buf();
        cfg.staging_dir = dir.join("staging");
        cfg.debug_dir = dir.join("debug");
        cfg
    }

    #[test]
    fn numeric_coercion_tolerates_locale_noise() {
        assert_eq!(parse_float("1234,5"), Some(1234.5));
        assert_eq!(parse_float(" $ 120 "), Some(120.0));
        assert_eq!(parse_float("-3.25"), Some(-3.25));
        assert_eq!(parse_float("n/a"), None);
        assert_eq!(parse_float(""), None);

        assert_eq!(parse_int("2019"), Some(2019));
        assert_eq!(parse_int("2019.0"), Some(2019));
        assert_eq!(parse_int("5"), Some(5));
        assert_eq!(parse_int("5,5"), None);
        assert_eq!(parse_int("x"), None);
    }

    #[test]
    fn renames_aggregates_and_reports_drops() -> Result<()> {
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());
        let raw = tmp.path().join("pib_api_raw.csv");
        // Two raw rows share (2019, 5) and must sum; the blank name
        // resolves to the first non-empty variant; one row is garbage.
        fs::write(
            &raw,
            "a_o,c_digo_departamento_divipola,departamento,valor_miles_de_millones_de\n\
             2019,5,,70000\n\
             2019,5,Antioquia,50000\n\
             2019,11,Bogota,110000\n\
             bad,5,Antioquia,1\n",
        )?;

        let (summary, table) = run(&cfg, &raw, None)?;
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.dropped, 1);

        let antioquia = table.get(2019, 5).unwrap();
        assert_eq!(antioquia.value, 120000.0);
        assert_eq!(antioquia.region_name, "Antioquia");
        assert_eq!(table.get(2019, 11).unwrap().value, 110000.0);
        assert!(table.get(2020, 5).is_none());
        Ok(())
    }

    #[test]
    fn normalized_csv_round_trips_into_memory() -> Result<()> {
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());
        let raw = tmp.path().join("pib_api_raw.csv");
        fs::write(
            &raw,
            "a_o,c_digo_departamento_divipola,departamento,valor_miles_de_millones_de\n\
             2020,8,Atlantico,\"80000,5\"\n",
        )?;

        let (summary, _) = run(&cfg, &raw, None)?;
        let reloaded = LookupTable::from_csv(&summary.path)?;
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get(2020, 8).unwrap().value, 80000.5);
        assert_eq!(reloaded.get(2020, 8).unwrap().region_name, "Atlantico");
        Ok(())
    }

    #[test]
    fn missing_key_columns_fail_fast() -> Result<()> {
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());
        let raw = tmp.path().join("pib_api_raw.csv");
        fs::write(&raw, "a_o,departamento\n2019,Antioquia\n")?;

        let err = run(&cfg, &raw, None).unwrap_err();
        match err.downcast_ref::<EtlError>() {
            Some(EtlError::SchemaViolation { stage, detail }) => {
                assert_eq!(*stage, "lookup");
                assert!(detail.contains("depto_divipola"));
                assert!(detail.contains("valor_api_mm"));
            }
            other => panic!("expected SchemaViolation, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn all_rows_invalid_is_data_quality_exhausted() -> Result<()> {
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());
        let raw = tmp.path().join("pib_api_raw.csv");
        fs::write(
            &raw,
            "a_o,c_digo_departamento_divipola,departamento,valor_miles_de_millones_de\n\
             bad,x,Antioquia,?\n\
             ,,,\n",
        )?;

        let err = run(&cfg, &raw, None).unwrap_err();
        match err.downcast_ref::<EtlError>() {
            Some(EtlError::DataQualityExhausted { stage, .. }) => assert_eq!(*stage, "lookup"),
            other => panic!("expected DataQualityExhausted, got {other:?}"),
        }
        Ok(())
    }
}
