// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Logging Setup
//!
//! Structured logging via `tracing`. The framework itself only emits events
//! and spans; this helper installs a formatting subscriber for binaries and
//! tests that do not bring their own.

use tracing::Level;

/// Installs a global fmt subscriber at the given level. Returns quietly if a
/// subscriber is already installed (tests, embedding applications).
pub fn init_logging(verbose: bool) {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging(false);
        init_logging(true);
    }
}
