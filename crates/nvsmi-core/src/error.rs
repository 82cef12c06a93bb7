use thiserror::Error;

/// Document-level defects in `nvidia-smi -q -x` output.
///
/// Field-level defects never surface here; they degrade to
/// [`crate::SENTINEL`] instead.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Document has no nvidia_smi_log root element")]
    MissingRoot,

    #[error("Unexpected root element: {0}")]
    UnexpectedRoot(String),

    #[error("Document ended inside <{0}>")]
    Truncated(String),

    #[error("Document has neither driver_version nor attached_gpus")]
    EmptyDocument,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid listen address: {0}")]
    InvalidListenAddress(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;
