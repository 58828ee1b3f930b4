// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! Per-object record of local reference counts and sealed-ness. Each live
//! entry pins exactly one [`crate::mmap_table::MmapTable`] entry by
//! `store_fd_id`; the cycle between the two tables is only logical, by key,
//! never a real pointer cycle.

use crate::mmap_table::MmapTable;
use crate::object_id::ObjectId;
use crate::protocol::PlasmaObject;
use std::collections::HashMap;

pub struct ObjectInUseEntry {
    pub object: PlasmaObject,
    pub local_refs: u32,
    pub is_sealed: bool,
}

/// Outcome of ending a use: whether the entry's count reached zero and it
/// should be handed to the release history, or whether other references
/// remain.
pub enum EndUseOutcome {
    StillReferenced,
    NowIdle,
}

#[derive(Debug)]
pub struct NotInUse;

pub struct InUseTable {
    entries: HashMap<ObjectId, ObjectInUseEntry>,
}

impl InUseTable {
    pub fn new() -> Self {
        InUseTable {
            entries: HashMap::new(),
        }
    }

    /// Registers a local observation of `object_id` (via `Create` or `Get`).
    /// Inserts a fresh entry with `local_refs = 1` and pins the backing
    /// mmap entry on first observation; increments `local_refs` on repeat
    /// observation.
    pub fn begin_use(
        &mut self,
        object_id: ObjectId,
        object: PlasmaObject,
        is_sealed: bool,
        mmap_table: &mut MmapTable,
    ) {
        match self.entries.get_mut(&object_id) {
            Some(entry) => {
                entry.local_refs += 1;
            }
            None => {
                mmap_table.increment(object.store_fd_id);
                self.entries.insert(
                    object_id,
                    ObjectInUseEntry {
                        object,
                        local_refs: 1,
                        is_sealed,
                    },
                );
            }
        }
    }

    /// Reclaims an entry sitting in the release history: resets
    /// `local_refs` to 1 without touching the mmap table (it is already
    /// pinned).
    pub fn reclaim(&mut self, object_id: &ObjectId) {
        let entry = self
            .entries
            .get_mut(object_id)
            .expect("reclaim requires an existing in-use entry");
        debug_assert_eq!(entry.local_refs, 0);
        entry.local_refs = 1;
    }

    /// Decrements `local_refs`. Returns [`EndUseOutcome::NowIdle`] if the
    /// count reached zero (the caller must then append to the release
    /// history rather than remove the entry here) or an error if the
    /// object was not in use.
    pub fn end_use(&mut self, object_id: &ObjectId) -> Result<EndUseOutcome, NotInUse> {
        let entry = self.entries.get_mut(object_id).ok_or(NotInUse)?;
        if entry.local_refs == 0 {
            return Err(NotInUse);
        }
        entry.local_refs -= 1;
        if entry.local_refs == 0 {
            Ok(EndUseOutcome::NowIdle)
        } else {
            Ok(EndUseOutcome::StillReferenced)
        }
    }

    pub fn lookup(&self, object_id: &ObjectId) -> Option<&ObjectInUseEntry> {
        self.entries.get(object_id)
    }

    pub fn lookup_mut(&mut self, object_id: &ObjectId) -> Option<&mut ObjectInUseEntry> {
        self.entries.get_mut(object_id)
    }

    pub fn mark_sealed(&mut self, object_id: &ObjectId) {
        if let Some(entry) = self.entries.get_mut(object_id) {
            entry.is_sealed = true;
        }
    }

    /// Removes the entry unconditionally (used by `PerformRelease`/`Abort`
    /// once the store side has acknowledged). Returns the removed entry so
    /// the caller can decrement its mmap entry.
    pub fn remove(&mut self, object_id: &ObjectId) -> Option<ObjectInUseEntry> {
        self.entries.remove(object_id)
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.entries.contains_key(object_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Seeds an entry directly, bypassing the mmap-pinning side effect of
    /// `begin_use`. Only for tests that exercise state derivation without a
    /// real mapping.
    #[cfg(test)]
    pub fn test_insert(&mut self, object_id: ObjectId, object: PlasmaObject, is_sealed: bool) {
        self.entries.insert(
            object_id,
            ObjectInUseEntry {
                object,
                local_refs: 1,
                is_sealed,
            },
        );
    }
}

impl Default for InUseTable {
    fn default() -> Self {
        Self::new()
    }
}
