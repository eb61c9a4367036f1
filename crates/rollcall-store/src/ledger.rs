//! Day-scoped attendance ledger.
//!
//! Each calendar day has its own CSV file (`attendance-YYYY-MM-DD.csv`)
//! holding at most one row per identity. A person recognized several
//! times in one day produces exactly one row.

use crate::error::StoreError;
use crate::persist::{self, FileLock};
use crate::schema;
use chrono::{NaiveDate, NaiveDateTime, SubsecRound};
use rollcall_core::validation;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// One attendance event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub identity: String,
    pub timestamp: NaiveDateTime,
    pub present: bool,
}

/// Outcome of [`Ledger::record`]. Neither variant is an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// A new row was appended and persisted.
    Recorded { timestamp: NaiveDateTime },
    /// The identity already had a row for this day; nothing changed.
    AlreadyRecorded { first_seen: NaiveDateTime },
}

/// Directory holding one ledger file per day.
#[derive(Debug, Clone)]
pub struct LedgerBook {
    dir: PathBuf,
}

impl LedgerBook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Backing file for `day`.
    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(schema::ledger_file_name(day))
    }

    /// Load the ledger for `day`; empty if that day was never touched.
    pub fn load(&self, day: NaiveDate) -> Result<Ledger, StoreError> {
        let path = self.path_for(day);
        let records = read_ledger(&path, day)?.unwrap_or_default();
        tracing::debug!(%day, records = records.len(), "ledger loaded");
        Ok(Ledger { day, path, records })
    }

    /// Days that have a ledger file, oldest first.
    pub fn days(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut days: Vec<NaiveDate> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| schema::parse_ledger_file_name(&entry.file_name().to_string_lossy()))
            .collect();
        days.sort();
        Ok(days)
    }

    /// Discard the whole ledger for `day`. Returns whether a file existed.
    pub fn delete(&self, day: NaiveDate) -> Result<bool, StoreError> {
        let path = self.path_for(day);
        let _lock = FileLock::acquire(&path)?;
        let existed = persist::remove_if_exists(&path)?;
        tracing::warn!(%day, existed, "attendance ledger deleted");
        Ok(existed)
    }
}

/// In-memory ledger for a single day.
#[derive(Debug, Clone)]
pub struct Ledger {
    day: NaiveDate,
    path: PathBuf,
    records: Vec<AttendanceRecord>,
}

impl Ledger {
    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `identity` already has a row for this day.
    pub fn is_present(&self, identity: &str) -> bool {
        self.find(identity.trim()).is_some()
    }

    /// Record attendance for `identity` at `timestamp`, at most once per day.
    ///
    /// The timestamp is stored with whole-second precision and must fall on
    /// this ledger's day.
    pub fn record(&mut self, identity: &str, timestamp: NaiveDateTime) -> Result<RecordOutcome, StoreError> {
        let identity = validation::normalize_identity(identity)?;
        if timestamp.date() != self.day {
            return Err(StoreError::WrongDay {
                day: self.day,
                timestamp,
            });
        }

        let _lock = FileLock::acquire(&self.path)?;
        self.sync_from_disk()?;
        if let Some(existing) = self.find(identity) {
            return Ok(self.already_recorded(identity, existing.timestamp));
        }

        let timestamp = timestamp.trunc_subsecs(0);
        let mut next = self.records.clone();
        next.push(AttendanceRecord {
            identity: identity.to_string(),
            timestamp,
            present: true,
        });
        persist::write_atomic(&self.path, &encode_ledger(&next)?)?;
        self.records = next;

        tracing::info!(identity, %timestamp, day = %self.day, "attendance recorded");
        Ok(RecordOutcome::Recorded { timestamp })
    }

    /// Serialize the full ledger as CSV with a header row.
    pub fn export(&self) -> Result<Vec<u8>, StoreError> {
        encode_ledger(&self.records)
    }

    fn find(&self, identity: &str) -> Option<&AttendanceRecord> {
        self.records.iter().find(|r| r.identity == identity)
    }

    fn already_recorded(&self, identity: &str, first_seen: NaiveDateTime) -> RecordOutcome {
        tracing::info!(identity, %first_seen, day = %self.day, "attendance already recorded");
        RecordOutcome::AlreadyRecorded { first_seen }
    }

    /// Adopt the file state, including a deletion by another process.
    fn sync_from_disk(&mut self) -> Result<(), StoreError> {
        let on_disk = read_ledger(&self.path, self.day)?.unwrap_or_default();
        if on_disk != self.records {
            tracing::debug!(
                cached = self.records.len(),
                on_disk = on_disk.len(),
                "ledger changed on disk; adopting file state"
            );
            self.records = on_disk;
        }
        Ok(())
    }
}

fn read_ledger(path: &Path, day: NaiveDate) -> Result<Option<Vec<AttendanceRecord>>, StoreError> {
    match persist::read_optional(path)? {
        Some(bytes) => decode_ledger(path, day, &bytes)
            .inspect_err(|e| tracing::warn!(%day, error = %e, "attendance ledger is corrupt"))
            .map(Some),
        None => Ok(None),
    }
}

fn decode_ledger(path: &Path, day: NaiveDate, bytes: &[u8]) -> Result<Vec<AttendanceRecord>, StoreError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let header = reader
        .headers()
        .map_err(|e| StoreError::corrupt(path, 1, e.to_string()))?;
    schema::check_ledger_header(header).map_err(|reason| StoreError::corrupt(path, 1, reason))?;

    let mut records: Vec<AttendanceRecord> = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            StoreError::corrupt(path, line, e.to_string())
        })?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);

        let [raw_identity, raw_timestamp, raw_present] = match (row.get(0), row.get(1), row.get(2), row.len()) {
            (Some(a), Some(b), Some(c), 3) => [a, b, c],
            _ => {
                return Err(StoreError::corrupt(
                    path,
                    line,
                    format!("expected 3 fields, found {}", row.len()),
                ))
            }
        };

        let identity = validation::normalize_identity(raw_identity)
            .map_err(|e| StoreError::corrupt(path, line, e.to_string()))?;
        let timestamp = NaiveDateTime::parse_from_str(raw_timestamp.trim(), schema::TIMESTAMP_FORMAT)
            .map_err(|e| StoreError::corrupt(path, line, format!("timestamp '{raw_timestamp}': {e}")))?;
        if timestamp.date() != day {
            return Err(StoreError::corrupt(
                path,
                line,
                format!("timestamp {timestamp} is not on {day}"),
            ));
        }
        let present = schema::parse_present(raw_present)
            .ok_or_else(|| StoreError::corrupt(path, line, format!("present flag '{raw_present}'")))?;
        if records.iter().any(|r| r.identity == identity) {
            return Err(StoreError::corrupt(
                path,
                line,
                format!("duplicate row for '{identity}'"),
            ));
        }

        records.push(AttendanceRecord {
            identity: identity.to_string(),
            timestamp,
            present,
        });
    }
    Ok(records)
}

fn encode_ledger(records: &[AttendanceRecord]) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(schema::LEDGER_COLUMNS)?;
    for record in records {
        let timestamp = record.timestamp.format(schema::TIMESTAMP_FORMAT).to_string();
        let present = if record.present { "true" } else { "false" };
        writer.write_record([record.identity.as_str(), timestamp.as_str(), present])?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::Csv(csv::Error::from(e.into_error())))
}
