// src/consolidate.rs
//
// Merges the yearly exam CSVs into one normalized dataset. Files are read
// one at a time and streamed row-by-row into the output, so peak memory is
// independent of how many source files there are.

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use glob::glob;
use regex::Regex;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::EtlError;

/// Canonical name of the year column in the consolidated output.
pub const YEAR_FIELD: &str = "anio";
/// Canonical name of the normalized department-code column.
pub const DEPTO_FIELD: &str = "depto_normalizado";

/// A column survives projection when its lower-cased name contains one of
/// these substrings. Everything else is dropped; narrowing the schema here
/// is deliberate.
const KEEP_PATTERNS: &[&str] = &[
    "punt",
    "depto",
    "departamento",
    "estu_areareside",
    "cole_caracter",
    "cole_area_ubicacion",
];

/// Source columns that may carry the year, in preference order.
const YEAR_CANDIDATES: &[&str] = &["periodo", "estu_anoterminobachiller"];

/// Source columns that may carry the department code, in preference order.
const DEPTO_CANDIDATES: &[&str] = &[
    "cole_cod_depto_ubicacion",
    "estu_cod_depto_presentacion",
    "estu_cod_reside_depto",
];

/// Delimiters considered by the sniffer.
const DELIMITER_CANDIDATES: &[u8] = &[b',', b';', b'\t', b'|'];

/// Manifest describing one consolidation run.
#[derive(Debug, Serialize)]
pub struct ConsolidateSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub columns: usize,
    pub files_processed: usize,
    /// Inferred year of each accepted file, ascending.
    pub years: Vec<i32>,
}

/// Normalize a raw department code to a 2-digit zero-padded string.
/// Best-effort numeric parsing: `"5"` → `"05"`, `"05"` → `"05"`,
/// `"5.0"` → `"05"`, empty or non-numeric → `None`. Idempotent on already
/// normalized codes.
pub fn normalize_depto(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = trimmed.parse::<f64>().ok()?;
    if !parsed.is_finite() || parsed < 0.0 {
        return None;
    }
    Some(format!("{:02}", parsed as i64))
}

/// Pick the delimiter by sampling the first bytes of the file and counting
/// candidate occurrences on the first line. Falls back to a comma.
fn sniff_delimiter(path: &Path) -> Result<u8> {
    let mut file =
        File::open(path).with_context(|| format!("opening {} for sniffing", path.display()))?;
    let mut buf = vec![0u8; 65_536];
    let n = file.read(&mut buf).context("sampling file head")?;
    let sample = String::from_utf8_lossy(&buf[..n]);
    let first_line = sample.lines().next().unwrap_or("");

    let best = DELIMITER_CANDIDATES
        .iter()
        .map(|&d| (d, first_line.matches(d as char).count()))
        .max_by_key(|&(_, count)| count);

    match best {
        Some((delim, count)) if count > 0 => Ok(delim),
        _ => Ok(b','),
    }
}

/// Extract a plausible 4-digit year from a file name. Prefers a `20xx`
/// match, then any 4-digit run inside the accepted window.
fn year_from_file_name(name: &str, accepted: &std::ops::RangeInclusive<i32>) -> Option<i32> {
    let modern = Regex::new(r"20\d{2}").ok()?;
    if let Some(m) = modern.find(name) {
        return m.as_str().parse().ok();
    }
    let any = Regex::new(r"\d{4}").ok()?;
    for m in any.find_iter(name) {
        if let Ok(year) = m.as_str().parse::<i32>() {
            if accepted.contains(&year) {
                return Some(year);
            }
        }
    }
    None
}

/// Infer the file's year: from an explicit period column (first data row)
/// when one exists, otherwise from the file name.
fn infer_file_year(
    path: &Path,
    delimiter: u8,
    accepted: &std::ops::RangeInclusive<i32>,
) -> Result<Option<i32>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;

    let year_idx = rdr
        .headers()
        .context("reading headers")?
        .iter()
        .position(|h| {
            let lowered = h.trim().to_lowercase();
            YEAR_CANDIDATES.contains(&lowered.as_str())
        });

    if let Some(idx) = year_idx {
        let mut record = csv::StringRecord::new();
        if rdr.read_record(&mut record).context("reading first row")? {
            let head: String = record.get(idx).unwrap_or("").trim().chars().take(4).collect();
            if let Ok(year) = head.parse::<i32>() {
                return Ok(Some(year));
            }
        }
    }

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    Ok(year_from_file_name(name, accepted))
}

/// Per-file projection plan, resolved against that file's own header row.
struct FilePlan {
    delimiter: u8,
    /// Source column carrying the year, if the file has one.
    year_src: Option<usize>,
    /// Source column carrying the department code, if the file has one.
    depto_src: Option<usize>,
    /// Lower-cased, de-duplicated headers that survived projection, with
    /// their source indices.
    kept: Vec<(usize, String)>,
}

fn build_file_plan(path: &Path, delimiter: u8) -> Result<FilePlan> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = rdr.headers().context("reading headers")?;

    // Lower-case everything, then drop duplicates after case-folding
    // (first occurrence wins).
    let mut seen = std::collections::HashSet::new();
    let mut columns: Vec<(usize, String)> = Vec::with_capacity(headers.len());
    for (idx, raw) in headers.iter().enumerate() {
        let name = raw.trim().to_lowercase();
        if !seen.insert(name.clone()) {
            warn!(file = %path.display(), column = %name, "dropping duplicate column");
            continue;
        }
        columns.push((idx, name));
    }

    let year_src = YEAR_CANDIDATES.iter().find_map(|cand| {
        columns
            .iter()
            .find(|(_, name)| name == cand)
            .map(|(idx, _)| *idx)
    });
    let depto_src = DEPTO_CANDIDATES.iter().find_map(|cand| {
        columns
            .iter()
            .find(|(_, name)| name == cand)
            .map(|(idx, _)| *idx)
    });

    let kept = columns
        .into_iter()
        .filter(|(idx, name)| {
            if Some(*idx) == year_src {
                return false;
            }
            KEEP_PATTERNS.iter().any(|pat| name.contains(pat))
        })
        .collect();

    Ok(FilePlan {
        delimiter,
        year_src,
        depto_src,
        kept,
    })
}

/// Consolidate the yearly exam files into `out_csv`.
///
/// `files` overrides discovery; when `None`, the configured glob is matched
/// against the data directory. Files whose inferred year falls outside the
/// accepted window are excluded entirely. Output rows are ordered by
/// ascending file year, ties broken by discovery order.
#[instrument(level = "info", skip(cfg, files, out_csv))]
pub fn run(
    cfg: &PipelineConfig,
    files: Option<Vec<PathBuf>>,
    out_csv: Option<PathBuf>,
) -> Result<ConsolidateSummary> {
    let explicit = files.is_some();
    let candidates = match files {
        Some(list) => list,
        None => {
            let pattern = cfg.data_dir.join(&cfg.exam_glob);
            let pattern = pattern.to_string_lossy().to_string();
            let mut found: Vec<PathBuf> = glob(&pattern)
                .with_context(|| format!("bad glob pattern {pattern}"))?
                .filter_map(|entry| entry.ok())
                .filter(|p| p.is_file())
                .collect();
            found.sort();
            found
        }
    };

    if candidates.is_empty() {
        return Err(EtlError::InputNotFound(format!(
            "no exam files matching {} under {}",
            cfg.exam_glob,
            cfg.data_dir.display()
        ))
        .into());
    }

    // Resolve each file's year up front; the window filter applies to whole
    // files, never to individual rows.
    let mut accepted: Vec<(PathBuf, u8, i32)> = Vec::new();
    for path in candidates {
        let delimiter = sniff_delimiter(&path)?;
        match infer_file_year(&path, delimiter, &cfg.accepted_years)? {
            Some(year) if cfg.accepted_years.contains(&year) => {
                accepted.push((path, delimiter, year));
            }
            Some(year) => {
                info!(file = %path.display(), year, "excluded: outside accepted window");
            }
            None if explicit => {
                return Err(EtlError::SchemaViolation {
                    stage: "consolidate",
                    detail: format!(
                        "no usable year source in {} (no period column, no year in file name)",
                        path.display()
                    ),
                }
                .into());
            }
            None => {
                info!(file = %path.display(), "excluded: no inferable year");
            }
        }
    }

    if accepted.is_empty() {
        return Err(EtlError::InputNotFound(format!(
            "no exam files within accepted years {}..={}",
            cfg.accepted_years.start(),
            cfg.accepted_years.end()
        ))
        .into());
    }

    // Ascending by year; sort is stable so discovery order breaks ties.
    accepted.sort_by_key(|(_, _, year)| *year);

    let out_path = out_csv.unwrap_or_else(|| cfg.consolidated_path());
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer = WriterBuilder::new()
        .from_path(&out_path)
        .with_context(|| format!("creating {}", out_path.display()))?;

    // The first accepted file fixes the canonical output schema; later
    // files are mapped into it by column name.
    let first_plan = build_file_plan(&accepted[0].0, accepted[0].1)?;
    let mut out_columns: Vec<String> = vec![YEAR_FIELD.to_string(), DEPTO_FIELD.to_string()];
    out_columns.extend(first_plan.kept.iter().map(|(_, name)| name.clone()));
    writer.write_record(&out_columns).context("writing header")?;

    let mut total_rows: u64 = 0;
    let mut years = Vec::with_capacity(accepted.len());

    for (i, (path, delimiter, year)) in accepted.iter().enumerate() {
        info!(
            file = %path.display(),
            year,
            "processing {}/{}",
            i + 1,
            accepted.len()
        );
        let plan = build_file_plan(path, *delimiter)?;

        // Map this file's kept columns onto the canonical schema.
        let mapping: Vec<Option<usize>> = out_columns[2..]
            .iter()
            .map(|want| {
                plan.kept
                    .iter()
                    .find(|(_, name)| name == want)
                    .map(|(idx, _)| *idx)
            })
            .collect();
        for (_, name) in &plan.kept {
            if !out_columns[2..].iter().any(|c| c == name) {
                warn!(file = %path.display(), column = %name, "column absent from canonical schema, dropped");
            }
        }

        let mut rdr = ReaderBuilder::new()
            .delimiter(plan.delimiter)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("opening {}", path.display()))?;

        let mut file_rows: u64 = 0;
        let mut dropped: u64 = 0;
        let mut record = csv::StringRecord::new();
        let mut out_record: Vec<String> = Vec::with_capacity(out_columns.len());

        while rdr
            .read_record(&mut record)
            .with_context(|| format!("reading {}", path.display()))?
        {
            // Year: from the period column when the file has one, truncated
            // to its first 4 characters, else the file-level year.
            let year_value: String = match plan.year_src {
                Some(idx) => record.get(idx).unwrap_or("").trim().chars().take(4).collect(),
                None => year.to_string(),
            };
            if year_value.is_empty() {
                dropped += 1;
                continue;
            }

            // Department: normalized when the file carries a code column;
            // rows the join cannot use are dropped here.
            let depto_value = match plan.depto_src {
                Some(idx) => match normalize_depto(record.get(idx).unwrap_or("")) {
                    Some(code) => code,
                    None => {
                        dropped += 1;
                        continue;
                    }
                },
                None => String::new(),
            };

            out_record.clear();
            out_record.push(year_value);
            out_record.push(depto_value);
            for src in &mapping {
                out_record.push(match src {
                    Some(idx) => record.get(*idx).unwrap_or("").to_string(),
                    None => String::new(),
                });
            }
            writer.write_record(&out_record).context("writing row")?;
            file_rows += 1;
        }

        writer.flush().context("flushing output")?;
        total_rows += file_rows;
        years.push(*year);
        debug!(
            file = %path.display(),
            rows = file_rows,
            dropped,
            "file consolidated"
        );
    }

    let summary = ConsolidateSummary {
        path: out_path.clone(),
        rows: total_rows,
        columns: out_columns.len(),
        files_processed: accepted.len(),
        years,
    };
    info!(
        rows = summary.rows,
        files = summary.files_processed,
        columns = summary.columns,
        "consolidation complete"
    );

    validate_sample(&out_path, 1000);
    Ok(summary)
}

/// Bounded re-read of the output for a quick sanity log: share of populated
/// year values and how many score/department columns made it through.
fn validate_sample(path: &Path, max_rows: usize) {
    let mut rdr = match ReaderBuilder::new().from_path(path) {
        Ok(r) => r,
        Err(err) => {
            warn!(%err, "could not re-open output for validation");
            return;
        }
    };
    let headers: Vec<String> = match rdr.headers() {
        Ok(h) => h.iter().map(str::to_string).collect(),
        Err(err) => {
            warn!(%err, "could not read output header for validation");
            return;
        }
    };
    let year_idx = headers.iter().position(|h| h == YEAR_FIELD);

    let mut rows = 0usize;
    let mut populated = 0usize;
    for record in rdr.records().take(max_rows).flatten() {
        rows += 1;
        if let Some(idx) = year_idx {
            if !record.get(idx).unwrap_or("").trim().is_empty() {
                populated += 1;
            }
        }
    }

    let punt = headers.iter().filter(|h| h.contains("punt")).count();
    let depto = headers.iter().filter(|h| h.contains("depto")).count();
    let pct = if rows > 0 {
        populated as f64 / rows as f64 * 100.0
    } else {
        0.0
    };
    info!(
        sampled = rows,
        year_populated_pct = pct,
        punt_columns = punt,
        depto_columns = depto,
        "output sample validated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    fn init_test_logging() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,saberetl::consolidate=debug")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    fn test_config(dir: &Path) -> PipelineConfig {
        let mut cfg = PipelineConfig::from_env();
        cfg.data_dir = dir.to_path_buf();
        cfg.staging_dir = dir.join("staging");
        cfg.debug_dir = dir.join("debug");
        cfg
    }

    #[test]
    fn depto_normalization_is_idempotent() {
        assert_eq!(normalize_depto("5"), Some("05".to_string()));
        assert_eq!(normalize_depto("05"), Some("05".to_string()));
        assert_eq!(normalize_depto("11"), Some("11".to_string()));
        assert_eq!(normalize_depto("5.0"), Some("05".to_string()));
        assert_eq!(normalize_depto(""), None);
        assert_eq!(normalize_depto("   "), None);
        assert_eq!(normalize_depto("bogota"), None);
    }

    #[test]
    fn sniffer_detects_semicolons_and_falls_back_to_comma() -> Result<()> {
        let tmp = TempDir::new()?;
        let semi = tmp.path().join("semi.csv");
        fs::write(&semi, "a;b;c\n1;2;3\n")?;
        assert_eq!(sniff_delimiter(&semi)?, b';');

        let bare = tmp.path().join("bare.csv");
        fs::write(&bare, "justonecolumn\nvalue\n")?;
        assert_eq!(sniff_delimiter(&bare)?, b',');
        Ok(())
    }

    #[test]
    fn year_extraction_from_file_name() {
        let window = 2015..=2023;
        assert_eq!(
            year_from_file_name("Examen_Saber_11_2019", &window),
            Some(2019)
        );
        assert_eq!(year_from_file_name("results-2021-v2", &window), Some(2021));
        // 4-digit runs outside the window are not plausible years
        assert_eq!(year_from_file_name("dump_1234", &window), None);
        assert_eq!(year_from_file_name("no_year_here", &window), None);
    }

    #[test]
    fn consolidates_two_files_in_year_order() -> Result<()> {
        init_test_logging();
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());

        // Written "out of order" on purpose; 2018 must come first in output.
        fs::write(
            tmp.path().join("Examen_Saber_11_2019.csv"),
            "PERIODO,COLE_COD_DEPTO_UBICACION,PUNT_GLOBAL,ESTU_NOMBRE\n\
             20194,5,300,ANA\n\
             20194,11,280,LUIS\n",
        )?;
        fs::write(
            tmp.path().join("Examen_Saber_11_2018.csv"),
            "PERIODO,COLE_COD_DEPTO_UBICACION,PUNT_GLOBAL,ESTU_NOMBRE\n\
             20181,8,250,SARA\n",
        )?;

        let summary = run(&cfg, None, None)?;
        assert_eq!(summary.rows, 3);
        assert_eq!(summary.files_processed, 2);
        assert_eq!(summary.years, vec![2018, 2019]);

        let mut rdr = ReaderBuilder::new().from_path(&summary.path)?;
        let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
        // Canonical key columns first, projected columns after; the name
        // column does not match any keep pattern.
        assert_eq!(headers[0], YEAR_FIELD);
        assert_eq!(headers[1], DEPTO_FIELD);
        assert!(headers.contains(&"punt_global".to_string()));
        assert!(headers.contains(&"cole_cod_depto_ubicacion".to_string()));
        assert!(!headers.contains(&"estu_nombre".to_string()));

        let rows: Vec<Vec<String>> = rdr
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], "2018");
        assert_eq!(rows[0][1], "08");
        assert_eq!(rows[1][0], "2019");
        assert_eq!(rows[1][1], "05");
        assert_eq!(rows[2][1], "11");
        Ok(())
    }

    #[test]
    fn out_of_window_files_are_excluded_entirely() -> Result<()> {
        init_test_logging();
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());

        fs::write(
            tmp.path().join("Examen_Saber_11_2010.csv"),
            "PERIODO,PUNT_GLOBAL\n20101,100\n",
        )?;

        let err = run(&cfg, None, None).unwrap_err();
        match err.downcast_ref::<EtlError>() {
            Some(EtlError::InputNotFound(_)) => {}
            other => panic!("expected InputNotFound, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn explicit_file_without_year_source_is_a_schema_violation() -> Result<()> {
        init_test_logging();
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());

        let path = tmp.path().join("mystery.csv");
        fs::write(&path, "PUNT_GLOBAL,COLE_COD_DEPTO_UBICACION\n300,5\n")?;

        let err = run(&cfg, Some(vec![path]), None).unwrap_err();
        match err.downcast_ref::<EtlError>() {
            Some(EtlError::SchemaViolation { stage, .. }) => assert_eq!(*stage, "consolidate"),
            other => panic!("expected SchemaViolation, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn rows_missing_keys_are_dropped_but_file_still_counts() -> Result<()> {
        init_test_logging();
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());

        // Every row has an unusable department code, so the file
        // contributes zero rows but still counts as processed.
        fs::write(
            tmp.path().join("Examen_Saber_11_2019.csv"),
            "PERIODO,COLE_COD_DEPTO_UBICACION,PUNT_GLOBAL\n\
             20194,,300\n\
             20194,n/a,280\n",
        )?;
        fs::write(
            tmp.path().join("Examen_Saber_11_2020.csv"),
            "PERIODO,COLE_COD_DEPTO_UBICACION,PUNT_GLOBAL\n20201,13,290\n",
        )?;

        let summary = run(&cfg, None, None)?;
        assert_eq!(summary.rows, 1);
        assert_eq!(summary.files_processed, 2);
        assert_eq!(summary.years, vec![2019, 2020]);
        Ok(())
    }

    #[test]
    fn duplicate_headers_after_case_folding_are_dropped() -> Result<()> {
        init_test_logging();
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());

        fs::write(
            tmp.path().join("Examen_Saber_11_2019.csv"),
            "PERIODO,PUNT_GLOBAL,punt_global,COLE_COD_DEPTO_UBICACION\n\
             20194,300,999,5\n",
        )?;

        let summary = run(&cfg, None, None)?;
        let mut rdr = ReaderBuilder::new().from_path(&summary.path)?;
        let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
        let punt_count = headers.iter().filter(|h| *h == "punt_global").count();
        assert_eq!(punt_count, 1);

        let first = rdr.records().next().unwrap()?;
        let idx = headers.iter().position(|h| h == "punt_global").unwrap();
        // First occurrence wins.
        assert_eq!(first.get(idx), Some("300"));
        Ok(())
    }

    #[test]
    fn delimiter_is_sniffed_per_file() -> Result<()> {
        init_test_logging();
        let tmp = TempDir::new()?;
        let cfg = test_config(tmp.path());

        fs::write(
            tmp.path().join("Examen_Saber_11_2019.csv"),
            "PERIODO;COLE_COD_DEPTO_UBICACION;PUNT_GLOBAL\n20194;5;300\n",
        )?;

        let summary = run(&cfg, None, None)?;
        assert_eq!(summary.rows, 1);
        let mut rdr = ReaderBuilder::new().from_path(&summary.path)?;
        let first = rdr.records().next().unwrap()?;
        assert_eq!(first.get(0), Some("2019"));
        assert_eq!(first.get(1), Some("05"));
        Ok(())
    }
}
