// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Global constants for the atrk controller manager.
//!
//! This module contains all numeric and string constants used throughout the codebase.
//! Constants are organized by category for easy maintenance.

// ============================================================================
// API Constants
// ============================================================================

/// API group for all atrk CRDs
pub const API_GROUP: &str = "atro.xyz";

/// API version for all atrk CRDs
pub const API_VERSION: &str = "v1alpha1";

/// Fully qualified API version (group/version)
pub const API_GROUP_VERSION: &str = "atro.xyz/v1alpha1";

/// Kind name for the `App` resource
pub const KIND_APP: &str = "App";

/// Kind name for the `AppBase` resource
pub const KIND_APP_BASE: &str = "AppBase";

// ============================================================================
// Leader Election Constants
// ============================================================================

/// Default name of the lease record contended for by manager replicas
pub const DEFAULT_LEASE_NAME: &str = "370a315d.atro.xyz";

/// How long a lease is valid after its last renewal (seconds)
pub const LEASE_DURATION_SECS: u64 = 15;

/// How long the current holder keeps acting as leader without a successful
/// renewal before demoting itself (seconds); strictly less than the lease
/// duration so the holder steps down before the record expires for others
pub const RENEW_DEADLINE_SECS: u64 = 10;

/// Interval between acquire/renew attempts (seconds)
pub const RETRY_PERIOD_SECS: u64 = 2;

// ============================================================================
// Work Queue Constants
// ============================================================================

/// Number of reconcile workers started by default
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Initial per-key retry delay after a failed reconcile (milliseconds)
pub const QUEUE_BASE_DELAY_MILLIS: u64 = 5;

/// Upper bound on the per-key retry delay (seconds)
pub const QUEUE_MAX_DELAY_SECS: u64 = 1000;

/// Backoff multiplier (exponential growth factor)
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Randomization factor applied to retry delays to prevent thundering herd (±10%)
pub const RANDOMIZATION_FACTOR: f64 = 0.1;

/// How long in-flight workers are given to finish on shutdown (seconds)
pub const DRAIN_TIMEOUT_SECS: u64 = 10;

/// The scheduler is considered stalled when its watchdog heartbeat is older
/// than this (seconds); feeds the liveness probe
pub const SCHEDULER_STALL_THRESHOLD_SECS: u64 = 30;

// ============================================================================
// Watch Constants
// ============================================================================

/// Delay before relisting a kind after its watch stream disconnects (seconds)
pub const WATCH_RELIST_BACKOFF_SECS: u64 = 1;

// ============================================================================
// Reconcile Cadence Constants
// ============================================================================

/// Requeue interval for resources that report Ready (seconds)
pub const REQUEUE_READY_SECS: u64 = 300;

/// Requeue interval for resources that are not yet Ready (seconds)
pub const REQUEUE_PENDING_SECS: u64 = 30;

// ============================================================================
// Environment Variables
// ============================================================================

/// Set to `false` to skip webhook registration entirely, for environments
/// without admission infrastructure
pub const ENV_ENABLE_WEBHOOKS: &str = "ENABLE_WEBHOOKS";
