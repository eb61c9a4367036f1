//! rollcall-store — Durable gallery and attendance ledger.
//!
//! Both stores keep their whole table in memory and rewrite the backing CSV
//! file in full on every mutation (temp file + rename), under an advisory
//! lock so that concurrent processes cannot lose each other's rows.

pub mod coordinator;
pub mod error;
pub mod gallery;
pub mod ledger;
pub mod persist;
pub mod schema;

pub use coordinator::{CoordinatorError, OperatorGate, Recognition};
pub use error::StoreError;
pub use gallery::GalleryStore;
pub use ledger::{AttendanceRecord, Ledger, LedgerBook, RecordOutcome};
