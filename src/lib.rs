// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! # atrk - App Controller Manager
//!
//! atrk is a controller manager written in Rust that watches `App` and
//! `AppBase` custom resources and drives each toward its declared desired
//! state, gating writes through a mutating/validating admission pipeline.
//!
//! ## Overview
//!
//! This library provides the orchestration core of the manager:
//!
//! - Leader election with single-active-writer semantics across replicas
//! - A deduplicating, retry-aware work queue with capped exponential backoff
//! - Per-kind watchers that recover from disconnects via relist
//! - Level-triggered dispatch to registered reconcilers
//! - A fail-closed admission pipeline served over HTTP
//! - Liveness/readiness probes reflecting cache sync and leadership state
//!
//! ## Modules
//!
//! - [`crd`] - Custom resource types and the generic object envelope
//! - [`registry`] - Immutable per-kind capability table
//! - [`leader`] - Lease-based leader election
//! - [`watch`] - Watch multiplexer and object stores
//! - [`queue`] - Work queue scheduler and worker pool
//! - [`dispatch`] - Level-triggered reconcile dispatch
//! - [`admission`] - Admission pipeline and webhook endpoints
//! - [`health`] - Probe and metrics endpoints
//! - [`manager`] - Staged registration and the running task set
//! - [`mem`] - In-memory cluster/lease backends for dev and tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use atrk::crd::{App, AppBase};
//! use atrk::manager::{Manager, ManagerOptions};
//! use atrk::mem::{MemoryCluster, MemoryLeaseStore};
//! use atrk::reconcilers::{app::AppReconciler, app_base::AppBaseReconciler};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), atrk::error::StartupError> {
//! let cluster = Arc::new(MemoryCluster::new());
//! let leases = Arc::new(MemoryLeaseStore::new());
//! let mut builder = Manager::builder(ManagerOptions::default(), cluster, leases)?;
//! builder.register_controller(
//!     AppBase::kind_id(),
//!     AppBase::decode,
//!     Arc::new(AppBaseReconciler),
//! )?;
//! builder.register_controller(App::kind_id(), App::decode, Arc::new(AppReconciler))?;
//! let manager = builder.build()?;
//! # let _ = manager;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod cluster;
pub mod constants;
pub mod context;
pub mod crd;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod leader;
pub mod manager;
pub mod mem;
pub mod metrics;
pub mod queue;
pub mod reconcilers;
pub mod registry;
pub mod watch;
pub mod webhooks;
