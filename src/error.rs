//! Error types for the fetch, persistence and connection layers.
//!
//! Recoverable conditions (a skipped page, a failed indicator) are reported through these types
//! and aggregated into run reports. Only [`ConnectError`] is treated as fatal by the runner.

use thiserror::Error;

use crate::pipeline::PipelineReport;
use crate::util::db::ConnectionState;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure below the HTTP status level: DNS, connect, timeout, body read.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FetchError {
    pub fn network(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        FetchError::Network {
            url: url.into(),
            source: source.into(),
        }
    }
}

/// Outcome of paging through one resource when nothing usable came back.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Non-success status or undecodable envelope on the first page. The resource is skipped.
    #[error("skipped {url} (status {status:?}): {reason}")]
    Skipped {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error(transparent)]
    Network(#[from] FetchError),
}

impl CollectError {
    pub fn is_skip(&self) -> bool {
        matches!(self, CollectError::Skipped { .. })
    }
}

/// A batch write that was rolled back.
#[derive(Debug, Error)]
#[error("persisting into `{table}` failed: {source}")]
pub struct PersistenceError {
    pub table: &'static str,
    #[source]
    pub source: sqlx::Error,
}

impl PersistenceError {
    pub fn new(table: &'static str, source: sqlx::Error) -> Self {
        Self { table, source }
    }
}

/// Connection establishment errors. `Exhausted` terminates the run.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid connection options: {0}")]
    InvalidOptions(#[source] sqlx::Error),

    #[error("database unreachable after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("invalid connection state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("not connected (state {0:?})")]
    NotConnected(ConnectionState),
}

/// Failure to obtain or read a non-API score source (CPI page, happiness export).
#[derive(Debug, Error)]
pub enum ScoreSourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("no table with a `{marker}` header (wanted table #{ordinal})")]
    TableNotFound { marker: String, ordinal: usize },

    #[error("bad selector or pattern: {0}")]
    Pattern(String),

    #[error("required column `{0}` not found")]
    MissingColumn(&'static str),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<regex::Error> for ScoreSourceError {
    fn from(e: regex::Error) -> Self {
        ScoreSourceError::Pattern(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Raised after the queue drained: at least one work item failed.
    #[error("{} of {} work items failed: {:?}", .report.failed_items().len(), .report.items.len(), .report.failed_items())]
    ItemsFailed { report: Box<PipelineReport> },
}

impl PipelineError {
    pub fn report(&self) -> &PipelineReport {
        match self {
            PipelineError::ItemsFailed { report } => report,
        }
    }

    pub fn into_report(self) -> PipelineReport {
        match self {
            PipelineError::ItemsFailed { report } => *report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_error_names_table() {
        let err = PersistenceError::new("indicator_values", sqlx::Error::RowNotFound);
        let msg = err.to_string();
        assert!(msg.contains("`indicator_values`"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn skipped_is_distinguished_from_network() {
        let skip = CollectError::Skipped {
            url: "http://x".into(),
            status: Some(404),
            reason: "not found".into(),
        };
        assert!(skip.is_skip());
        let net = CollectError::from(FetchError::network("http://x", "connection reset"));
        assert!(!net.is_skip());
    }
}
