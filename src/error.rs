use thiserror::Error;

pub type Result<T> = std::result::Result<T, DossierError>;

#[derive(Debug, Error)]
pub enum DossierError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pdf error: {0}")]
    Pdf(String),
    #[error("source discovery failed: {0}")]
    Discovery(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("interrupted by shutdown signal")]
    Interrupted,
}

impl From<lopdf::Error> for DossierError {
    fn from(value: lopdf::Error) -> Self {
        Self::Pdf(value.to_string())
    }
}

impl DossierError {
    /// Stable machine-readable code for the CLI error payload.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Http(_) | Self::Status { .. } => "http_error",
            Self::Sqlite(_) => "sqlite_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Io(_) => "io_error",
            Self::Pdf(_) => "pdf_error",
            Self::Discovery(_) => "discovery_error",
            Self::Config(_) => "config_error",
            Self::Invariant(_) => "invariant_error",
            Self::Interrupted => "interrupted",
        }
    }
}
