//! On-disk table layouts for the gallery and ledger CSV files.

use chrono::NaiveDate;
use csv::StringRecord;

/// First gallery column.
pub const IDENTITY_COLUMN: &str = "identity";
/// First-column name written by older gallery and ledger files; accepted on load.
pub const LEGACY_IDENTITY_COLUMN: &str = "name";

pub const LEDGER_COLUMNS: [&str; 3] = ["identity", "timestamp", "present"];
const LEGACY_LEDGER_COLUMNS: [&str; 3] = ["name", "datetime", "present"];

/// Local wall-clock timestamp format used in ledger rows.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const LEDGER_FILE_PREFIX: &str = "attendance-";
const LEDGER_FILE_SUFFIX: &str = ".csv";
const DAY_FORMAT: &str = "%Y-%m-%d";

/// Name of the `i`-th embedding component column.
pub fn component_column(i: usize) -> String {
    format!("e{i}")
}

/// Gallery header for a given dimensionality (`identity` alone when unset).
pub fn gallery_header(dimension: Option<usize>) -> Vec<String> {
    let mut header = vec![IDENTITY_COLUMN.to_string()];
    header.extend((0..dimension.unwrap_or(0)).map(component_column));
    header
}

/// Validate a gallery header and return how many component columns it declares.
pub fn parse_gallery_header(header: &StringRecord) -> Result<usize, String> {
    match header.get(0) {
        Some(IDENTITY_COLUMN) | Some(LEGACY_IDENTITY_COLUMN) => {}
        Some(other) => {
            return Err(format!(
                "first column must be '{IDENTITY_COLUMN}', found '{other}'"
            ))
        }
        None => return Err("missing header row".to_string()),
    }
    for (i, column) in header.iter().skip(1).enumerate() {
        let expected = component_column(i);
        if column != expected {
            return Err(format!("column {} must be '{expected}', found '{column}'", i + 2));
        }
    }
    Ok(header.len() - 1)
}

/// Validate a ledger header.
pub fn check_ledger_header(header: &StringRecord) -> Result<(), String> {
    let columns: Vec<&str> = header.iter().collect();
    if columns == LEDGER_COLUMNS || columns == LEGACY_LEDGER_COLUMNS {
        Ok(())
    } else {
        Err(format!(
            "expected columns {}, found {}",
            LEDGER_COLUMNS.join(","),
            columns.join(",")
        ))
    }
}

/// Parse a presence flag as written by this crate or by spreadsheet edits.
pub fn parse_present(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "oui" => Some(true),
        "false" | "0" | "no" | "non" => Some(false),
        _ => None,
    }
}

/// File name of the ledger for `day`, e.g. `attendance-2024-03-18.csv`.
pub fn ledger_file_name(day: NaiveDate) -> String {
    format!("{LEDGER_FILE_PREFIX}{}{LEDGER_FILE_SUFFIX}", day.format(DAY_FORMAT))
}

/// Inverse of [`ledger_file_name`]; `None` for anything else.
pub fn parse_ledger_file_name(name: &str) -> Option<NaiveDate> {
    let day = name
        .strip_prefix(LEDGER_FILE_PREFIX)?
        .strip_suffix(LEDGER_FILE_SUFFIX)?;
    NaiveDate::parse_from_str(day, DAY_FORMAT).ok()
}
