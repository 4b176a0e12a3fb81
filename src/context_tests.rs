// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

//! Unit tests for `context.rs`

#[cfg(test)]
mod tests {
    use super::super::Stores;
    use crate::crd::{App, AppBase};

    #[test]
    fn test_stores_built_per_kind() {
        let kinds = [App::kind_id(), AppBase::kind_id()];
        let stores = Stores::new(kinds.iter());

        assert!(stores.get(&App::kind_id()).is_some());
        assert!(stores.get(&AppBase::kind_id()).is_some());
        assert!(stores
            .get(&crate::crd::KindId::new("other.io", "v1", "Widget"))
            .is_none());
    }

    #[test]
    fn test_all_synced_requires_every_store() {
        let kinds = [App::kind_id(), AppBase::kind_id()];
        let stores = Stores::new(kinds.iter());
        assert!(!stores.all_synced());

        stores.get(&App::kind_id()).unwrap().mark_synced();
        assert!(!stores.all_synced(), "one unsynced store blocks readiness");

        stores.get(&AppBase::kind_id()).unwrap().mark_synced();
        assert!(stores.all_synced());
    }

    #[test]
    fn test_no_kinds_is_trivially_synced() {
        let stores = Stores::new(std::iter::empty());
        assert!(stores.all_synced());
    }
}
