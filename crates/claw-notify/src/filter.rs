//! Severity filtering.

use crate::types::Severity;

/// Returns true if a record at `level` is worth a notification under `threshold`.
#[must_use]
pub fn should_notify(level: Severity, threshold: Severity) -> bool {
    level >= threshold
}
