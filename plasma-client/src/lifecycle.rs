// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! The object lifecycle state machine (Absent -> Creating -> Sealed-InUse ->
//! Released/Queued). State is derived from the in-use table and release
//! history rather than stored redundantly, so there is exactly one place
//! that can disagree with itself.

use crate::inuse_table::InUseTable;
use crate::object_id::ObjectId;
use crate::release_history::ReleaseHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Not observed locally at all.
    Absent,
    /// Created by this client, unsealed, exactly one local reference (the
    /// creator).
    Creating,
    /// Sealed and referenced at least once locally.
    SealedInUse,
    /// Local references dropped to zero; sitting in the release history
    /// pending a store-side decrement.
    Queued,
}

pub fn current_state(
    object_id: &ObjectId,
    in_use: &InUseTable,
    history: &ReleaseHistory,
) -> ObjectState {
    match in_use.lookup(object_id) {
        None => ObjectState::Absent,
        Some(entry) => {
            if !entry.is_sealed {
                ObjectState::Creating
            } else if history.contains(object_id) {
                ObjectState::Queued
            } else {
                ObjectState::SealedInUse
            }
        }
    }
}
