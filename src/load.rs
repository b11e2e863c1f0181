// src/load.rs
//
// Loads the enriched dataset into the warehouse. The schema is inferred
// from the CSV header at load time (every column nullable TEXT plus an
// identity key and a creation timestamp); the data itself is streamed to
// the server over the COPY protocol, never parsed into memory.

use anyhow::{Context, Result};
use chrono::Utc;
use csv::ReaderBuilder;
use postgres::{Client, NoTls};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::diag;
use crate::error::EtlError;

/// Columns the loader adds on top of the inferred schema; excluded from
/// schema comparison.
const SYNTHETIC_COLUMNS: &[&str] = &["id", "created_at", "updated_at"];

/// Candidate column names for the post-load statistics, in order.
const YEAR_STAT_CANDIDATES: &[&str] = &["anio", "año", "periodo"];
const DEPTO_STAT_CANDIDATES: &[&str] = &[
    "depto_normalizado",
    "cole_cod_depto_ubicacion",
    "estu_cod_depto_presentacion",
    "departamento",
];
const PIB_STAT_CANDIDATES: &[&str] = &["pib_departamental_mm", "valor_api_mm", "pib"];

/// Rows sampled when validating the CSV structure.
const SAMPLE_ROWS: usize = 1000;

#[derive(Debug, Serialize)]
pub struct LoadSummary {
    pub table: String,
    pub path: PathBuf,
    pub rows_loaded: i64,
    /// Share of loaded rows with a populated value column, 0 when no
    /// candidate column exists.
    pub pib_coverage: f64,
    pub unique_years: i64,
    pub unique_deptos: i64,
    pub total_columns: usize,
    /// Per-index outcome of the optional index pass.
    pub indexes: Vec<IndexOutcome>,
}

/// Outcome of one optional index attempt. Failures are recorded here and
/// never escalate to the load itself.
#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub index: String,
    pub columns: Vec<String>,
    pub created: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct TableStats {
    unique_years: i64,
    unique_deptos: i64,
    rows_with_pib: i64,
    pib_coverage: f64,
}

/// Double-quote an identifier for interpolation into DDL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// DDL for the destination table: every CSV column as nullable TEXT,
/// bracketed by the identity key and the creation timestamp.
pub fn build_create_table_ddl(table: &str, columns: &[String]) -> String {
    let cols = columns
        .iter()
        .map(|c| format!("  {} TEXT", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  id BIGSERIAL PRIMARY KEY,\n{},\n  created_at TIMESTAMP DEFAULT now()\n);",
        quote_ident(table),
        cols
    )
}

/// Compare an existing table's columns against the CSV header, ignoring
/// the synthetic columns. Any difference means the table gets dropped and
/// recreated; this run is authoritative for schema.
pub fn schema_matches(existing: &[String], csv_columns: &[String]) -> bool {
    let existing: HashSet<&str> = existing
        .iter()
        .map(String::as_str)
        .filter(|c| !SYNTHETIC_COLUMNS.contains(c))
        .collect();
    let wanted: HashSet<&str> = csv_columns.iter().map(String::as_str).collect();
    existing == wanted
}

/// Try the primary path, then each fallback in order. Returns the paths
/// tried (in order) when none exists.
pub fn resolve_source_path(
    primary: &Path,
    fallbacks: &[PathBuf],
) -> std::result::Result<PathBuf, Vec<String>> {
    let mut tried = vec![primary.display().to_string()];
    if primary.exists() {
        return Ok(primary.to_path_buf());
    }
    for alt in fallbacks {
        let shown = alt.display().to_string();
        if !tried.contains(&shown) {
            tried.push(shown);
        }
        if alt.exists() {
            return Ok(alt.clone());
        }
    }
    Err(tried)
}

/// Read the header row plus a bounded sample; the full file is only ever
/// read again by the COPY stream itself.
fn read_header_and_sample(path: &Path) -> Result<(Vec<String>, Vec<String>, usize)> {
    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let columns: Vec<String> = rdr
        .headers()
        .context("reading header")?
        .iter()
        .map(str::to_string)
        .collect();
    if columns.is_empty() || (columns.len() == 1 && columns[0].is_empty()) {
        return Err(EtlError::DataQualityExhausted {
            stage: "load",
            detail: format!("{} has no header row", path.display()),
        }
        .into());
    }

    let mut first_row: Vec<String> = Vec::new();
    let mut sampled = 0usize;
    for record in rdr.records().take(SAMPLE_ROWS) {
        let record = record.context("sampling rows")?;
        if sampled == 0 {
            first_row = record.iter().map(str::to_string).collect();
        }
        sampled += 1;
    }
    Ok((columns, first_row, sampled))
}

fn pick_candidate<'a>(columns: &'a [String], candidates: &[&str]) -> Option<&'a String> {
    candidates
        .iter()
        .find_map(|cand| columns.iter().find(|c| c.as_str() == *cand))
}

/// Indexes worth attempting: the year column, the department column, and
/// their composite when both exist.
fn index_candidates(table: &str, columns: &[String]) -> Vec<(String, Vec<String>)> {
    let mut out = Vec::new();
    let year = pick_candidate(columns, YEAR_STAT_CANDIDATES);
    let depto = pick_candidate(columns, DEPTO_STAT_CANDIDATES);
    if let Some(col) = year {
        out.push((format!("idx_{table}_{col}"), vec![col.clone()]));
    }
    if let Some(col) = depto {
        out.push((format!("idx_{table}_{col}"), vec![col.clone()]));
    }
    if let (Some(y), Some(d)) = (year, depto) {
        out.push((format!("idx_{table}_{y}_{d}"), vec![y.clone(), d.clone()]));
    }
    out
}

/// Wrap a destination failure: write the diagnostic artifact, then
/// surface the taxonomy error. Never retried here; retry is an
/// orchestrator concern.
fn destination_failure(
    cfg: &PipelineConfig,
    table: &str,
    path: &Path,
    err: postgres::Error,
) -> anyhow::Error {
    let code = err.code().map(|c| c.code().to_string());
    let payload = json!({
        "error_type": "destination error",
        "error_code": code.clone(),
        "error_message": err.to_string(),
        "csv_path": path.display().to_string(),
        "table": table,
        "at": Utc::now().to_rfc3339(),
    });
    if let Err(artifact_err) = diag::write_artifact(&cfg.debug_dir, "load_error.json", &payload) {
        warn!(%artifact_err, "could not write load_error.json");
    }
    EtlError::DestinationError {
        code,
        message: err.to_string(),
    }
    .into()
}

/// A failure inside the destination phases: either the database itself or
/// the local file stream feeding COPY.
enum PhaseError {
    Db(postgres::Error),
    Io(std::io::Error),
}

impl From<postgres::Error> for PhaseError {
    fn from(err: postgres::Error) -> Self {
        PhaseError::Db(err)
    }
}

impl From<std::io::Error> for PhaseError {
    fn from(err: std::io::Error) -> Self {
        PhaseError::Io(err)
    }
}

/// Reconcile schema, create the table, optionally truncate, and stream the
/// file through COPY. One transaction per phase so partial failures roll
/// back cleanly. Returns the post-load row count.
fn exec_load(
    client: &mut Client,
    table: &str,
    columns: &[String],
    path: &Path,
    replace: bool,
) -> std::result::Result<i64, PhaseError> {
    // Phase: reconcile. Compare the live column set against the header.
    let existing: Vec<String> = client
        .query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
            &[&table],
        )?
        .iter()
        .map(|row| row.get(0))
        .collect();
    if !existing.is_empty() && !schema_matches(&existing, columns) {
        warn!(table, "existing table has a different schema, dropping");
        let mut tx = client.transaction()?;
        tx.execute(&format!("DROP TABLE IF EXISTS {} CASCADE", quote_ident(table)), &[])?;
        tx.commit()?;
    }

    // Phase: create.
    let mut tx = client.transaction()?;
    tx.batch_execute(&build_create_table_ddl(table, columns))?;
    tx.commit()?;

    // Phase: truncate. Distinct from recreation — rows only, schema kept.
    if replace {
        let mut tx = client.transaction()?;
        tx.execute(
            &format!("TRUNCATE TABLE {} RESTART IDENTITY", quote_ident(table)),
            &[],
        )?;
        tx.commit()?;
    }

    // Phase: load. The only full-file read on this path, streamed straight
    // from storage into the server.
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(",");
    let copy_sql = format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT CSV, HEADER TRUE, DELIMITER ',', QUOTE '\"', ESCAPE '\"')",
        quote_ident(table),
        cols
    );
    let mut reader = BufReader::new(File::open(path)?);
    let mut tx = client.transaction()?;
    {
        let mut writer = tx.copy_in(&copy_sql)?;
        std::io::copy(&mut reader, &mut writer)?;
        let copied = writer.finish()?;
        debug!(rows = copied, "COPY stream finished");
    }
    tx.commit()?;

    let count: i64 = client
        .query_one(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), &[])?
        .get(0);
    Ok(count)
}

/// Attempt each candidate index inside its own savepoint. An individual
/// failure rolls back to the savepoint and is captured in the outcome;
/// the pass as a whole never fails the load.
fn create_indexes(
    client: &mut Client,
    table: &str,
    columns: &[String],
) -> std::result::Result<Vec<IndexOutcome>, postgres::Error> {
    let mut outcomes = Vec::new();
    let mut tx = client.transaction()?;
    for (index, cols) in index_candidates(table, columns) {
        let ddl = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&index),
            quote_ident(table),
            cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        );
        let mut sp = tx.savepoint(format!("sp_{}", outcomes.len()))?;
        match sp.batch_execute(&ddl) {
            Ok(()) => {
                sp.commit()?;
                debug!(%index, "index created");
                outcomes.push(IndexOutcome {
                    index,
                    columns: cols,
                    created: true,
                    error: None,
                });
            }
            Err(err) => {
                // Dropping the savepoint rolls back to it.
                drop(sp);
                warn!(%index, %err, "index skipped");
                outcomes.push(IndexOutcome {
                    index,
                    columns: cols,
                    created: false,
                    error: Some(err.to_string()),
                });
            }
        }
    }
    tx.commit()?;
    Ok(outcomes)
}

/// Post-load statistics, each skipped silently when no candidate column
/// exists in the loaded schema.
fn compute_stats(
    client: &mut Client,
    table: &str,
    columns: &[String],
    rows_loaded: i64,
) -> std::result::Result<TableStats, postgres::Error> {
    let mut stats = TableStats::default();

    if let Some(col) = pick_candidate(columns, YEAR_STAT_CANDIDATES) {
        stats.unique_years = client
            .query_one(
                &format!(
                    "SELECT COUNT(DISTINCT {col}) FROM {table} WHERE {col} IS NOT NULL AND {col} != ''",
                    col = quote_ident(col),
                    table = quote_ident(table)
                ),
                &[],
            )?
            .get(0);
    }
    if let Some(col) = pick_candidate(columns, DEPTO_STAT_CANDIDATES) {
        stats.unique_deptos = client
            .query_one(
                &format!(
                    "SELECT COUNT(DISTINCT {col}) FROM {table} WHERE {col} IS NOT NULL AND {col} != ''",
                    col = quote_ident(col),
                    table = quote_ident(table)
                ),
                &[],
            )?
            .get(0);
    }
    if let Some(col) = pick_candidate(columns, PIB_STAT_CANDIDATES) {
        stats.rows_with_pib = client
            .query_one(
                &format!(
                    "SELECT COUNT(*) FROM {table} WHERE {col} IS NOT NULL AND {col} != ''",
                    col = quote_ident(col),
                    table = quote_ident(table)
                ),
                &[],
            )?
            .get(0);
        if rows_loaded > 0 {
            stats.pib_coverage = stats.rows_with_pib as f64 / rows_loaded as f64;
        }
    }
    Ok(stats)
}

/// Load the enriched dataset into the destination table.
#[instrument(level = "info", skip(cfg, path))]
pub fn run(
    cfg: &PipelineConfig,
    path: Option<&Path>,
    table: &str,
    replace: bool,
) -> Result<LoadSummary> {
    // Locate the dataset, walking the configured fallbacks.
    let primary = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cfg.enriched_path());
    let file_name = primary
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "ddm_icfes_pib.csv".to_string());
    let csv_path = match resolve_source_path(&primary, &cfg.load_fallback_paths(&file_name)) {
        Ok(found) => found,
        Err(tried) => {
            diag::write_artifact(
                &cfg.debug_dir,
                "load_not_found.json",
                &json!({ "tried_paths": &tried }),
            )?;
            return Err(EtlError::InputNotFound(format!(
                "enriched dataset not found; tried: {}",
                tried.join(", ")
            ))
            .into());
        }
    };
    info!(path = %csv_path.display(), "dataset located");

    // Structure validation from the header plus a bounded sample.
    let (columns, first_row, sampled) = read_header_and_sample(&csv_path)?;
    diag::write_artifact(
        &cfg.debug_dir,
        "load_csv_validation.json",
        &json!({
            "csv_path": csv_path.display().to_string(),
            "total_columns": columns.len(),
            "columns": &columns,
            "first_row_sample": first_row.iter().take(10).collect::<Vec<_>>(),
            "rows_sampled": sampled,
        }),
    )?;

    let conn_uri = cfg.conn_uri.as_deref().ok_or_else(|| {
        EtlError::DestinationUnavailable(
            "set WAREHOUSE_DB_URL (or POSTGRES_CONN_URI)".to_string(),
        )
    })?;
    let mut client = Client::connect(conn_uri, NoTls)
        .map_err(|err| destination_failure(cfg, table, &csv_path, err))?;

    let rows_loaded = exec_load(&mut client, table, &columns, &csv_path, replace).map_err(
        |err| match err {
            PhaseError::Db(db) => destination_failure(cfg, table, &csv_path, db),
            PhaseError::Io(io) => anyhow::Error::new(io)
                .context(format!("streaming {} into COPY", csv_path.display())),
        },
    )?;
    info!(rows = rows_loaded, table, "load committed");

    let indexes = create_indexes(&mut client, table, &columns)
        .map_err(|err| destination_failure(cfg, table, &csv_path, err))?;

    let stats = compute_stats(&mut client, table, &columns, rows_loaded)
        .map_err(|err| destination_failure(cfg, table, &csv_path, err))?;
    diag::write_artifact(
        &cfg.debug_dir,
        "load_stats.json",
        &json!({
            "table": table,
            "total_rows": rows_loaded,
            "total_columns": columns.len(),
            "unique_years": stats.unique_years,
            "unique_deptos": stats.unique_deptos,
            "rows_with_pib": stats.rows_with_pib,
            "pib_coverage": stats.pib_coverage,
            "computed_at": Utc::now().to_rfc3339(),
        }),
    )?;

    let summary = LoadSummary {
        table: table.to_string(),
        path: csv_path,
        rows_loaded,
        pib_coverage: stats.pib_coverage,
        unique_years: stats.unique_years,
        unique_deptos: stats.unique_deptos,
        total_columns: columns.len(),
        indexes,
    };
    info!(
        rows = summary.rows_loaded,
        coverage = summary.pib_coverage,
        years = summary.unique_years,
        deptos = summary.unique_deptos,
        "load complete"
    );
    Ok(summary)
}
