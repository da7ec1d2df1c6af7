use crate::notify::{Notice, NoticeKind};
use crate::store::Collection;
use crate::thresholds::ThresholdError;
use thiserror::Error;

/// Failures raised by a persistence service.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid field name: {0}")]
    InvalidField(String),

    #[error("row is missing key field `{0}`")]
    MissingKey(String),

    #[error("row must be a JSON object")]
    NotAnObject,

    #[error("{collection} already has a row with id {key}")]
    DuplicateKey { collection: Collection, key: String },

    #[error("no {collection} row matched {key_field}={key}")]
    NoMatch {
        collection: Collection,
        key_field: String,
        key: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// User-facing failure taxonomy. Every variant degrades to a notice.
#[derive(Debug, Error)]
pub enum GradebookError {
    #[error("{0}")]
    ValidationRejected(#[from] ThresholdError),

    #[error("could not save {collection}: {source}")]
    PersistenceWriteFailed {
        collection: Collection,
        #[source]
        source: StoreError,
    },

    #[error("could not load {collection}: {source}")]
    FetchFailed {
        collection: Collection,
        #[source]
        source: StoreError,
    },
}

impl GradebookError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationRejected(ThresholdError::CannotRemoveLastThreshold) => {
                "cannot_remove_last_threshold"
            }
            Self::ValidationRejected(_) => "validation_rejected",
            Self::PersistenceWriteFailed { .. } => "persistence_write_failed",
            Self::FetchFailed { .. } => "fetch_failed",
        }
    }

    pub fn notice(&self) -> Notice {
        match self {
            Self::ValidationRejected(ThresholdError::CannotRemoveLastThreshold) => Notice {
                title: "Cannot remove threshold".to_string(),
                description: "At least one grade threshold is required.".to_string(),
                kind: NoticeKind::Destructive,
            },
            Self::ValidationRejected(e) => Notice {
                title: "Invalid value".to_string(),
                description: e.to_string(),
                kind: NoticeKind::Destructive,
            },
            Self::PersistenceWriteFailed { collection, source } => Notice {
                title: "Auto-save failed".to_string(),
                description: format!(
                    "Changes to {} could not be saved ({}). Please save manually.",
                    collection, source
                ),
                kind: NoticeKind::Destructive,
            },
            Self::FetchFailed { collection, source } => Notice {
                title: "Failed to load data".to_string(),
                description: format!("Could not load {} ({}).", collection, source),
                kind: NoticeKind::Destructive,
            },
        }
    }
}
