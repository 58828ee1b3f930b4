// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

use crate::errors::TransportError;
use crate::object_id::ObjectId;
use crate::protocol::{read_i64_le, read_object_id};
use std::io::Read;

/// One seal/delete event delivered on the subscription fd:
/// `{object_id, data_size, metadata_size}`, with both sizes reported as -1
/// on deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub object_id: ObjectId,
    pub data_size: i64,
    pub metadata_size: i64,
}

impl Notification {
    pub const DELETION_SENTINEL: i64 = -1;

    pub fn is_deletion(&self) -> bool {
        self.data_size == Self::DELETION_SENTINEL && self.metadata_size == Self::DELETION_SENTINEL
    }
}

pub fn read_notification(r: &mut impl Read) -> Result<Notification, TransportError> {
    let object_id = read_object_id(r).map_err(TransportError::Io)?;
    let data_size = read_i64_le(r).map_err(TransportError::Io)?;
    let metadata_size = read_i64_le(r).map_err(TransportError::Io)?;
    Ok(Notification {
        object_id,
        data_size,
        metadata_size,
    })
}

pub fn write_notification(w: &mut impl std::io::Write, n: &Notification) -> std::io::Result<()> {
    crate::protocol::write_object_id(w, &n.object_id)?;
    crate::protocol::write_i64_le(w, n.data_size)?;
    crate::protocol::write_i64_le(w, n.metadata_size)
}
