//! Optimistic concurrency failures.
//!
//! Updates and deletes capture the version of the rows they were computed
//! against. At commit time the physical statement is narrowed to rows that
//! still carry that version, and the number of affected rows is compared with
//! the number the change expected. A mismatch means another writer got there
//! first.

use thiserror::Error;

/// Error indicating that an update or delete did not affect the expected
/// number of rows at commit time.
///
/// This is fatal to the current transaction. Whether to reload and retry the
/// whole logical operation is a decision for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(self))]
pub struct ConcurrencyConflict {
    /// Rust type name of the entity the change targeted.
    pub entity: &'static str,
    /// Version the change was computed against.
    pub version: i64,
    /// Rows the change expected to affect.
    pub expected_rows: u64,
    /// Rows the physical statement actually affected.
    pub actual_rows: u64,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(conflict: &ConcurrencyConflict) -> String {
    let ConcurrencyConflict {
        entity,
        version,
        expected_rows,
        actual_rows,
    } = conflict;
    if actual_rows < expected_rows {
        format!(
            "concurrency conflict on `{entity}`: expected {expected_rows} row(s) at version \
             {version}, affected {actual_rows} (hint: rows were modified or removed by another \
             writer; reload and retry)"
        )
    } else {
        format!(
            "concurrency conflict on `{entity}`: expected {expected_rows} row(s) at version \
             {version}, affected {actual_rows} (hint: rows were added by another writer; reload \
             and retry)"
        )
    }
}
