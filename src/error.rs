use thiserror::Error;

/// Failure taxonomy shared by every pipeline stage.
///
/// Row-level defects (unparseable numerics, missing keys) are recovered
/// locally by dropping the row and counting it; they never surface here.
/// These variants cover the structural failures that abort a stage outright.
#[derive(Error, Debug)]
pub enum EtlError {
    /// No source file matched the accepted criteria.
    #[error("input not found: {0}")]
    InputNotFound(String),

    /// A required key column is absent after all fallback-name attempts.
    #[error("schema violation in {stage}: {detail}")]
    SchemaViolation { stage: &'static str, detail: String },

    /// Every row was discarded during cleaning.
    #[error("no usable rows in {stage}: {detail}")]
    DataQualityExhausted { stage: &'static str, detail: String },

    /// No destination connection configuration could be resolved.
    #[error("no destination connection configured: {0}")]
    DestinationUnavailable(String),

    /// A database-level failure during create/truncate/load.
    #[error("destination error [{}]: {message}", .code.as_deref().unwrap_or("unknown"))]
    DestinationError {
        /// SQLSTATE code, when the server reported one.
        code: Option<String>,
        message: String,
    },
}
