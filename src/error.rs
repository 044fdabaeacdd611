use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("{} is locked or open elsewhere; close it and restart", .path.display())]
    LockedResource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Schema mismatch: missing columns {}", .missing.join(", "))]
    SchemaMismatch { missing: Vec<String> },

    #[error("Prospect not found: {0}")]
    NotFound(String),

    #[error("Invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Column '{0}' not found in the dataset")]
    MissingColumn(String),

    #[error("Sheet '{0}' not found in the workbook")]
    MissingSheet(String),

    #[error("Invalid column pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Refusing to overwrite survey source {}", .0.display())]
    SourceOverwrite(PathBuf),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TrackerError>;
