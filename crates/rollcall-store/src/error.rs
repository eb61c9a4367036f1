use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::CoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Invalid(#[from] CoreError),
    #[error("corrupt store {}: line {line}: {reason}", path.display())]
    CorruptStore {
        path: PathBuf,
        line: u64,
        reason: String,
    },
    #[error("timestamp {timestamp} does not belong to the ledger for {day}")]
    WrongDay {
        day: NaiveDate,
        timestamp: NaiveDateTime,
    },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv encoding failed: {0}")]
    Csv(#[from] csv::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, line: u64, reason: impl Into<String>) -> Self {
        StoreError::CorruptStore {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }
}
