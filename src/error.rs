// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Startup error taxonomy and process exit codes.
//!
//! Startup failures are unrecoverable: the process logs the error and exits
//! with a code identifying the stage that failed, so an external supervisor
//! can distinguish a bad manager configuration from, say, a webhook
//! registration conflict without parsing logs.
//!
//! | Code | Stage |
//! |------|-------|
//! | 1 | Manager construction |
//! | 2 | Controller registration |
//! | 3 | Webhook registration |
//! | 4 | Health check registration |
//! | 5 | Runtime failure |

/// Exit code used when the manager fails after startup completed.
pub const EXIT_RUNTIME: i32 = 5;

/// Unrecoverable failure during manager startup, tagged with the stage it
/// occurred in.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The manager itself could not be constructed.
    #[error("unable to construct manager: {0}")]
    Manager(String),

    /// A controller could not be registered, e.g. a duplicate kind.
    #[error("unable to register controller for {kind}: {reason}")]
    Controller {
        /// Kind the controller was being registered for
        kind: String,
        /// Why registration failed
        reason: String,
    },

    /// A webhook could not be registered.
    #[error("unable to register webhook for {kind}: {reason}")]
    Webhook {
        /// Kind the webhook was being registered for
        kind: String,
        /// Why registration failed
        reason: String,
    },

    /// A health or readiness check could not be registered.
    #[error("unable to register health check {name}: {reason}")]
    HealthCheck {
        /// Name of the check
        name: String,
        /// Why registration failed
        reason: String,
    },
}

impl StartupError {
    /// Exit code for this failure stage.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Manager(_) => 1,
            StartupError::Controller { .. } => 2,
            StartupError::Webhook { .. } => 3,
            StartupError::HealthCheck { .. } => 4,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
