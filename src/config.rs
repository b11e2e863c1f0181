use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;

/// Everything the pipeline is allowed to assume about its environment,
/// resolved once at startup and passed by reference into each stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Working directory holding raw inputs and intermediate CSVs.
    pub data_dir: PathBuf,
    /// Staging area the loader reads from.
    pub staging_dir: PathBuf,
    /// Where diagnostic JSON artifacts are written.
    pub debug_dir: PathBuf,
    /// Glob for the yearly exam files, relative to `data_dir`.
    pub exam_glob: String,
    /// Years of data considered valid; files outside this window are
    /// excluded entirely, not filtered row-wise.
    pub accepted_years: RangeInclusive<i32>,
    /// Rows per in-memory batch on the join path.
    pub batch_size: usize,
    /// Destination table name.
    pub table: String,
    /// Destination connection URI.
    pub conn_uri: Option<String>,
    /// TRUNCATE the destination table before loading.
    pub replace: bool,
}

impl PipelineConfig {
    /// Build the configuration from the environment. `SABERETL_DATA_DIR`
    /// overrides the working directory, `WAREHOUSE_DB_URL` (falling back to
    /// `POSTGRES_CONN_URI`) supplies the destination connection.
    pub fn from_env() -> Self {
        let data_dir = env::var("SABERETL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        let staging_dir = data_dir.join("staging");
        let debug_dir = data_dir.join("debug");
        let conn_uri = env::var("WAREHOUSE_DB_URL")
            .or_else(|_| env::var("POSTGRES_CONN_URI"))
            .ok();

        Self {
            data_dir,
            staging_dir,
            debug_dir,
            exam_glob: "Examen_Saber_11_*.csv".to_string(),
            accepted_years: 2015..=2023,
            batch_size: 50_000,
            table: "ddm_icfes_pib".to_string(),
            conn_uri,
            replace: false,
        }
    }

    /// Consolidated exam dataset written by the consolidator.
    pub fn consolidated_path(&self) -> PathBuf {
        self.data_dir.join("icfes_merged.csv")
    }

    /// Raw PIB dataset as delivered by the extraction step.
    pub fn lookup_raw_path(&self) -> PathBuf {
        self.data_dir.join("pib_api_raw.csv")
    }

    /// Normalized, aggregated PIB dataset.
    pub fn lookup_path(&self) -> PathBuf {
        self.data_dir.join("pib_by_depto_year.csv")
    }

    /// Enriched dataset consumed by the loader.
    pub fn enriched_path(&self) -> PathBuf {
        self.staging_dir.join("ddm_icfes_pib.csv")
    }

    /// Ordered alternatives the loader tries when the primary enriched
    /// path does not exist. Enumerated here, once, rather than as ambient
    /// constants inside the loader.
    pub fn load_fallback_paths(&self, file_name: &str) -> Vec<PathBuf> {
        vec![
            self.data_dir.join(file_name),
            self.staging_dir.join(file_name),
            self.data_dir.join("ddm_icfes_pib.csv"),
            self.staging_dir.join("ddm_icfes_pib.csv"),
            self.data_dir.join("icfes_con_pib.csv"),
        ]
    }
}
