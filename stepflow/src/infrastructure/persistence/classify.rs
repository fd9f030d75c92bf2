// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Persistence Fault Classification
//!
//! Maps backend faults into the framework's retry taxonomy. Duplicate keys
//! are recognized by SQL state `23505` or message matching; transient
//! conditions by the `08` SQL state family (connection exceptions) and
//! connection/timeout message patterns. Everything else is wrapped as a
//! non-retryable persistence failure so a broken row can never loop through
//! the retry budget.

use stepflow_domain::{PersistenceFault, PipelineError};

/// SQL state reported for unique-constraint violations.
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";
/// SQL state class for connection exceptions.
const SQLSTATE_CONNECTION_CLASS: &str = "08";

const DUPLICATE_MESSAGE_PATTERNS: &[&str] = &["duplicate key", "unique constraint"];

const TRANSIENT_MESSAGE_PATTERNS: &[&str] = &[
    "connection refused",
    "connection closed",
    "connection reset",
    "timed out",
    "timeout",
];

/// Whether the fault reports a duplicate-key condition.
pub fn is_duplicate_key(fault: &PersistenceFault) -> bool {
    if fault.sql_state.as_deref() == Some(SQLSTATE_UNIQUE_VIOLATION) {
        return true;
    }
    let message = fault.message.to_lowercase();
    DUPLICATE_MESSAGE_PATTERNS.iter().any(|p| message.contains(p))
}

/// Whether the fault is a transient condition worth retrying.
pub fn is_transient(fault: &PersistenceFault) -> bool {
    if let Some(state) = &fault.sql_state {
        if state.starts_with(SQLSTATE_CONNECTION_CLASS) {
            return true;
        }
    }
    let message = fault.message.to_lowercase();
    TRANSIENT_MESSAGE_PATTERNS.iter().any(|p| message.contains(p))
}

/// Wraps a non-duplicate fault for propagation: transient faults stay
/// retryable, everything else becomes a non-retryable persistence error.
pub fn classify(fault: &PersistenceFault) -> PipelineError {
    if is_transient(fault) {
        PipelineError::transient(fault.to_string())
    } else {
        PipelineError::PersistenceError(fault.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_by_sql_state() {
        let fault = PersistenceFault::new("insert failed").with_sql_state("23505");
        assert!(is_duplicate_key(&fault));
    }

    #[test]
    fn test_duplicate_by_message() {
        assert!(is_duplicate_key(&PersistenceFault::new(
            "ERROR: duplicate key value violates unique constraint \"orders_pkey\""
        )));
        assert!(is_duplicate_key(&PersistenceFault::new("UNIQUE constraint failed: orders.id")));
        assert!(!is_duplicate_key(&PersistenceFault::new("row too large")));
    }

    #[test]
    fn test_transient_by_sql_state_class() {
        assert!(is_transient(&PersistenceFault::new("gone").with_sql_state("08006")));
        assert!(is_transient(&PersistenceFault::new("gone").with_sql_state("08001")));
        assert!(!is_transient(&PersistenceFault::new("bad").with_sql_state("42601")));
    }

    #[test]
    fn test_transient_by_message() {
        assert!(is_transient(&PersistenceFault::new("connection refused")));
        assert!(is_transient(&PersistenceFault::new("read timed out")));
        assert!(!is_transient(&PersistenceFault::new("syntax error")));
    }

    #[test]
    fn test_classification_retryability() {
        assert!(classify(&PersistenceFault::new("connection reset by peer")).is_retryable());
        assert!(!classify(&PersistenceFault::new("value too long for column")).is_retryable());
    }
}
