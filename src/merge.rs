// src/merge.rs
//
// Streams the consolidated exam dataset through a left join against the
// in-memory PIB table, in bounded batches. Rows that miss the lookup are
// given a batch-local group-mean fallback. Peak memory is O(batch size)
// regardless of dataset size.

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::config::PipelineConfig;
use crate::consolidate::normalize_depto;
use crate::error::EtlError;
use crate::lookup::LookupTable;

/// Name the matched (or imputed) value takes in the enriched output.
pub const VALUE_FIELD: &str = "pib_departamental_mm";

/// Year-column fallbacks, tried in order against each batch.
const YEAR_CANDIDATES: &[&str] = &["anio", "periodo", "estu_anoterminobachiller", "anio_origen"];

/// Department-column fallbacks, tried in order against each batch.
const DEPTO_CANDIDATES: &[&str] = &[
    "depto_normalizado",
    "cole_cod_depto_ubicacion",
    "estu_cod_depto_presentacion",
    "cole_depto_ubicacion",
];

#[derive(Debug, Serialize)]
pub struct MergeSummary {
    pub path: PathBuf,
    pub total_rows: u64,
    /// Rows holding a non-null value after join and imputation.
    pub rows_with_value: u64,
    pub rows_without_value: u64,
    /// `rows_with_value / total_rows`, in [0, 1].
    pub coverage_ratio: f64,
}

/// Join-key column positions for one batch.
struct BatchKeys {
    year_idx: usize,
    depto_idx: usize,
}

/// Resolve the join-key columns for a batch. Upstream schemas have been
/// heterogeneous enough that this runs for every batch rather than once
/// globally; the cost is trivial and the check is deliberate.
fn resolve_batch_keys(headers: &[String]) -> Result<BatchKeys, EtlError> {
    let find = |candidates: &[&str]| {
        candidates
            .iter()
            .find_map(|cand| headers.iter().position(|h| h == cand))
    };
    let year_idx = find(YEAR_CANDIDATES).ok_or_else(|| EtlError::SchemaViolation {
        stage: "merge",
        detail: format!(
            "no year column after fallbacks {:?} (have: {})",
            YEAR_CANDIDATES,
            headers.join(", ")
        ),
    })?;
    let depto_idx = find(DEPTO_CANDIDATES).ok_or_else(|| EtlError::SchemaViolation {
        stage: "merge",
        detail: format!(
            "no department column after fallbacks {:?} (have: {})",
            DEPTO_CANDIDATES,
            headers.join(", ")
        ),
    })?;
    Ok(BatchKeys {
        year_idx,
        depto_idx,
    })
}

/// Re-derive the numeric join key from one row. The department code goes
/// through the same normalization the consolidator applies, so a raw "5"
/// and a normalized "05" resolve to the same key.
fn row_key(record: &StringRecord, keys: &BatchKeys) -> Option<(i32, i32)> {
    let year: String = record
        .get(keys.year_idx)
        .unwrap_or("")
        .trim()
        .chars()
        .take(4)
        .collect();
    let year = year.parse::<i32>().ok()?;
    let depto = normalize_depto(record.get(keys.depto_idx).unwrap_or(""))?
        .parse::<i32>()
        .ok()?;
    Some((year, depto))
}

/// Fill gaps with the mean of populated rows in this batch sharing the same
/// (year, department) key. Nothing outside the batch is consulted, so gaps
/// can remain when a key has no populated sibling here; that scope is
/// intentional. Returns how many rows were filled.
fn impute_batch_local(row_keys: &[Option<(i32, i32)>], values: &mut [Option<f64>]) -> u64 {
    let mut sums: HashMap<(i32, i32), (f64, u64)> = HashMap::new();
    for (key, value) in row_keys.iter().zip(values.iter()) {
        if let (Some(key), Some(value)) = (key, value) {
            let slot = sums.entry(*key).or_insert((0.0, 0));
            slot.0 += value;
            slot.1 += 1;
        }
    }
    let mut imputed = 0u64;
    for (key, value) in row_keys.iter().zip(values.iter_mut()) {
        if value.is_none() {
            if let Some(key) = key {
                if let Some((sum, count)) = sums.get(key) {
                    *value = Some(sum / *count as f64);
                    imputed += 1;
                }
            }
        }
    }
    imputed
}

/// Join one batch, impute, and append it to the writer. Returns the number
/// of rows holding a value after imputation.
fn process_batch(
    batch: &[StringRecord],
    headers: &[String],
    lookup: &LookupTable,
    writer: &mut csv::Writer<std::fs::File>,
) -> Result<u64> {
    // Step 1: key columns are re-verified for every batch.
    let keys = resolve_batch_keys(headers)?;

    // Step 2: left join. Every row survives; misses carry None.
    let mut values: Vec<Option<f64>> = Vec::with_capacity(batch.len());
    let mut row_keys: Vec<Option<(i32, i32)>> = Vec::with_capacity(batch.len());
    for record in batch {
        let key = row_key(record, &keys);
        let value = key.and_then(|(year, depto)| lookup.get(year, depto)).map(|e| e.value);
        row_keys.push(key);
        values.push(value);
    }
    let matched = values.iter().filter(|v| v.is_some()).count();

    // Step 5: batch-local imputation.
    let imputed = impute_batch_local(&row_keys, &mut values);

    // Step 6: append and release. The auxiliary keys never became columns,
    // so nothing leaks into the output schema.
    let mut with_value = 0u64;
    let mut out_record: Vec<String> = Vec::with_capacity(headers.len() + 1);
    for (record, value) in batch.iter().zip(&values) {
        out_record.clear();
        // Ragged rows pad or truncate to the header width so the value
        // column stays aligned.
        for field in record.iter().take(headers.len()) {
            out_record.push(field.to_string());
        }
        while out_record.len() < headers.len() {
            out_record.push(String::new());
        }
        match value {
            Some(v) => {
                out_record.push(v.to_string());
                with_value += 1;
            }
            None => out_record.push(String::new()),
        }
        writer.write_record(&out_record).context("writing enriched row")?;
    }

    debug!(
        rows = batch.len(),
        matched,
        imputed,
        with_value,
        "batch joined"
    );
    Ok(with_value)
}

/// Left-join the consolidated dataset against the PIB table and write the
/// enriched dataset, accumulating coverage statistics.
#[instrument(level = "info", skip(cfg, lookup, out_csv))]
pub fn run(
    cfg: &PipelineConfig,
    consolidated: &Path,
    lookup: &LookupTable,
    out_csv: Option<PathBuf>,
) -> Result<MergeSummary> {
    if !consolidated.exists() {
        return Err(EtlError::InputNotFound(format!(
            "consolidated dataset not found: {}",
            consolidated.display()
        ))
        .into());
    }

    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .from_path(consolidated)
        .with_context(|| format!("opening {}", consolidated.display()))?;
    let headers: Vec<String> = rdr
        .headers()
        .context("reading header")?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let out_path = out_csv.unwrap_or_else(|| cfg.enriched_path());
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer = WriterBuilder::new()
        .from_path(&out_path)
        .with_context(|| format!("creating {}", out_path.display()))?;

    let mut out_headers = headers.clone();
    out_headers.push(VALUE_FIELD.to_string());
    writer
        .write_record(&out_headers)
        .context("writing enriched header")?;

    let mut total_rows: u64 = 0;
    let mut rows_with_value: u64 = 0;
    let mut batches: u64 = 0;
    let mut batch: Vec<StringRecord> = Vec::with_capacity(cfg.batch_size);

    for record in rdr.records() {
        let record = record.context("reading consolidated row")?;
        batch.push(record);
        if batch.len() >= cfg.batch_size {
            rows_with_value += process_batch(&batch, &headers, lookup, &mut writer)?;
            total_rows += batch.len() as u64;
            batches += 1;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        rows_with_value += process_batch(&batch, &headers, lookup, &mut writer)?;
        total_rows += batch.len() as u64;
        batches += 1;
        batch.clear();
    }
    writer.flush().context("flushing enriched output")?;

    if batches == 0 {
        return Err(EtlError::DataQualityExhausted {
            stage: "merge",
            detail: format!("{} holds zero data rows", consolidated.display()),
        }
        .into());
    }

    let coverage_ratio = if total_rows > 0 {
        rows_with_value as f64 / total_rows as f64
    } else {
        0.0
    };
    let summary = MergeSummary {
        path: out_path,
        total_rows,
        rows_with_value,
        rows_without_value: total_rows - rows_with_value,
        coverage_ratio,
    };
    info!(
        total = summary.total_rows,
        with_value = summary.rows_with_value,
        coverage = summary.coverage_ratio,
        "merge complete"
    );
    Ok(summary)
}
