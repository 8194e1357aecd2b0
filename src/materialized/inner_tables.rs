//! Where a view's data lives.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::catalog::StorageId;

/// Name of the target (or scratch) table a view creates for itself.
///
/// Views with a stable identity name their inner tables after it, so the
/// names survive renames within a database.
pub fn generate_inner_table_name(view_id: &StorageId, scratch: bool) -> String {
    let mut name = String::from(".inner");
    if scratch {
        name.push_str("_scratch");
    }
    match view_id.uuid {
        Some(uuid) => name.push_str(&format!("_id.{}", uuid)),
        None => {
            name.push('.');
            name.push_str(&view_id.table);
        }
    }
    name
}

/// Identities of the target and scratch tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerTableIds {
    pub target: StorageId,
    pub scratch: Option<StorageId>,
}

/// Registry of the tables backing a view.
///
/// The two identities change only on rename and are always read and written
/// under one lock, so an accessor never observes half of a rename.
#[derive(Debug)]
pub struct InnerTables {
    ids: Mutex<InnerTableIds>,
    has_inner_target_table: bool,
    has_scratch_table: bool,
    scratch_known_empty: AtomicBool,
}

impl InnerTables {
    pub fn new(
        ids: InnerTableIds,
        has_inner_target_table: bool,
        scratch_known_empty: bool,
    ) -> Self {
        let has_scratch_table = ids.scratch.is_some();
        Self {
            ids: Mutex::new(ids),
            has_inner_target_table,
            has_scratch_table,
            scratch_known_empty: AtomicBool::new(has_scratch_table && scratch_known_empty),
        }
    }

    /// The view created (and owns) its target table.
    pub fn has_inner_target_table(&self) -> bool {
        self.has_inner_target_table
    }

    pub fn has_scratch_table(&self) -> bool {
        self.has_scratch_table
    }

    pub fn target_table_id(&self) -> StorageId {
        self.ids.lock().target.clone()
    }

    pub fn scratch_table_id(&self) -> Option<StorageId> {
        self.ids.lock().scratch.clone()
    }

    /// Consistent copy of both identities.
    pub fn snapshot(&self) -> InnerTableIds {
        self.ids.lock().clone()
    }

    /// Apply a multi-field identity change while holding the registry lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut InnerTableIds) -> R) -> R {
        f(&mut self.ids.lock())
    }

    pub fn is_scratch_known_empty(&self) -> bool {
        self.scratch_known_empty.load(Ordering::Acquire)
    }

    pub fn set_scratch_known_empty(&self, empty: bool) {
        self.scratch_known_empty.store(empty, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_inner_table_names() {
        let view = StorageId::new("db", "mv");
        assert_eq!(generate_inner_table_name(&view, false), ".inner.mv");
        assert_eq!(generate_inner_table_name(&view, true), ".inner_scratch.mv");

        let uuid = Uuid::new_v4();
        let view = view.with_uuid(uuid);
        assert_eq!(
            generate_inner_table_name(&view, false),
            format!(".inner_id.{}", uuid)
        );
        assert_eq!(
            generate_inner_table_name(&view, true),
            format!(".inner_scratch_id.{}", uuid)
        );
    }

    #[test]
    fn test_update_is_atomic() {
        let inner = InnerTables::new(
            InnerTableIds {
                target: StorageId::new("db", ".inner.mv"),
                scratch: Some(StorageId::new("db", ".inner_scratch.mv")),
            },
            true,
            true,
        );
        assert!(inner.has_scratch_table());
        assert!(inner.is_scratch_known_empty());

        inner.update(|ids| {
            ids.target.database = "db2".to_string();
            if let Some(scratch) = ids.scratch.as_mut() {
                scratch.database = "db2".to_string();
            }
        });
        let ids = inner.snapshot();
        assert_eq!(ids.target.database, "db2");
        assert_eq!(ids.scratch.map(|s| s.database), Some("db2".to_string()));
    }

    #[test]
    fn test_known_empty_requires_scratch() {
        let inner = InnerTables::new(
            InnerTableIds {
                target: StorageId::new("db", "target"),
                scratch: None,
            },
            false,
            true,
        );
        assert!(!inner.is_scratch_known_empty());
    }
}
