// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Immutable registry of watched kinds and their capabilities.
//!
//! Built once by the manager during startup registration and never modified
//! afterwards. Each entry is a capability table for one kind: its decode
//! check, its reconciler and its ordered admission hooks. Lookup is a plain
//! map access keyed by [`KindId`]; there is no runtime registration and no
//! reflection-style dispatch.

use crate::admission::{MutatingHook, ValidatingHook};
use crate::crd::{DecodeError, DynamicObject, KindId};
use crate::reconcilers::Reconciler;
use std::collections::HashMap;
use std::sync::Arc;

/// Decode/validation capability for a kind's wire payload.
pub type DecodeFn = fn(&DynamicObject) -> Result<(), DecodeError>;

/// Capabilities registered for one kind.
pub struct KindEntry {
    /// The kind this entry describes
    pub kind: KindId,
    /// Payload decode check, run before admission hooks
    pub decode: DecodeFn,
    /// The kind's reconciler (at most one per kind)
    pub reconciler: Arc<dyn Reconciler>,
    /// Mutating admission hooks, in registration order
    pub mutators: Vec<Arc<dyn MutatingHook>>,
    /// Validating admission hooks, in registration order
    pub validators: Vec<Arc<dyn ValidatingHook>>,
}

/// Registration failure; surfaces as a startup error with a distinct exit code.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A controller is already registered for the kind.
    #[error("kind {0} is already registered")]
    DuplicateKind(KindId),

    /// Webhooks were registered for a kind without a controller.
    #[error("kind {0} is not registered")]
    UnknownKind(KindId),
}

/// Immutable kind capability table.
pub struct KindRegistry {
    entries: HashMap<KindId, KindEntry>,
    order: Vec<KindId>,
}

impl KindRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Entry for a kind, if registered.
    #[must_use]
    pub fn get(&self, kind: &KindId) -> Option<&KindEntry> {
        self.entries.get(kind)
    }

    /// All registered kinds, in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = &KindId> {
        self.order.iter()
    }

    /// Kinds that have at least one admission hook registered.
    pub fn webhook_kinds(&self) -> impl Iterator<Item = &KindId> {
        self.order.iter().filter(|kind| {
            self.entries
                .get(kind)
                .is_some_and(|e| !e.mutators.is_empty() || !e.validators.is_empty())
        })
    }
}

/// Mutable builder; consumed by [`RegistryBuilder::build`] so the resulting
/// registry cannot change after startup.
pub struct RegistryBuilder {
    entries: HashMap<KindId, KindEntry>,
    order: Vec<KindId>,
}

impl RegistryBuilder {
    /// Register a controller for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateKind`] when the kind already has a
    /// controller.
    pub fn register(
        &mut self,
        kind: KindId,
        decode: DecodeFn,
        reconciler: Arc<dyn Reconciler>,
    ) -> Result<(), RegistryError> {
        if self.entries.contains_key(&kind) {
            return Err(RegistryError::DuplicateKind(kind));
        }
        self.order.push(kind.clone());
        self.entries.insert(
            kind.clone(),
            KindEntry {
                kind,
                decode,
                reconciler,
                mutators: Vec::new(),
                validators: Vec::new(),
            },
        );
        Ok(())
    }

    /// Attach admission hooks to an already-registered kind. Hooks run in
    /// the order given here.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownKind`] when no controller was
    /// registered for the kind.
    pub fn add_webhook(
        &mut self,
        kind: &KindId,
        mutators: Vec<Arc<dyn MutatingHook>>,
        validators: Vec<Arc<dyn ValidatingHook>>,
    ) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(kind)
            .ok_or_else(|| RegistryError::UnknownKind(kind.clone()))?;
        entry.mutators.extend(mutators);
        entry.validators.extend(validators);
        Ok(())
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> KindRegistry {
        KindRegistry {
            entries: self.entries,
            order: self.order,
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod registry_tests;
