// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! Buffer handles returned by `Create` and `Get`. Their lifetime is tied to
//! the client that produced them so the aliasing obligation (end it with
//! exactly one matching `Seal`/`Abort`/`Release`) is at least diagnosable:
//! forgetting the explicit call falls back to a safe default on `Drop`
//! rather than leaking the reservation or the mapping forever.

use crate::client::PlasmaClient;
use crate::errors::Result;
use crate::object_id::ObjectId;
use std::fmt::{self, Debug, Formatter};
use std::slice;

/// An opaque handle to a device-resident (GPU) buffer. The data pointer is
/// a device-space address; host code must not dereference it directly, so
/// no safe accessor to the underlying bytes is offered here — the actual
/// device-memory mapping is left to whatever device-specific code the
/// caller layers on top.
pub struct DeviceBuffer {
    ptr: *const u8,
    len: usize,
    device_num: i32,
}

impl DeviceBuffer {
    pub(crate) fn new(ptr: *const u8, len: usize, device_num: i32) -> Self {
        DeviceBuffer {
            ptr,
            len,
            device_num,
        }
    }

    pub fn device_num(&self) -> i32 {
        self.device_num
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw device-space address. Not safe to dereference as host
    /// memory.
    pub fn as_device_ptr(&self) -> *const u8 {
        self.ptr
    }
}

/// A writable buffer over a freshly created, unsealed object. Must be ended
/// by exactly one of `seal` or `abort`; dropping without either aborts the
/// reservation so an unsealed object never lingers indefinitely.
pub struct CreateBuffer<'a> {
    client: &'a PlasmaClient,
    id: ObjectId,
    data_ptr: *mut u8,
    data_len: usize,
    metadata_ptr: *mut u8,
    metadata_len: usize,
    device_num: i32,
    finished: bool,
}

impl<'a> CreateBuffer<'a> {
    pub(crate) fn new(
        client: &'a PlasmaClient,
        id: ObjectId,
        data_ptr: *mut u8,
        data_len: usize,
        metadata_ptr: *mut u8,
        metadata_len: usize,
        device_num: i32,
    ) -> Self {
        CreateBuffer {
            client,
            id,
            data_ptr,
            data_len,
            metadata_ptr,
            metadata_len,
            device_num,
            finished: false,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn device_num(&self) -> i32 {
        self.device_num
    }

    pub fn device_buffer(&self) -> Option<DeviceBuffer> {
        if self.device_num == 0 {
            None
        } else {
            Some(DeviceBuffer::new(
                self.data_ptr as *const u8,
                self.data_len,
                self.device_num,
            ))
        }
    }

    /// Read-only view of the data region. Panics for device-resident
    /// buffers (`device_num != 0`) — use `device_buffer` instead.
    pub fn data(&self) -> &[u8] {
        assert_eq!(self.device_num, 0, "data is device-resident; use device_buffer()");
        unsafe { slice::from_raw_parts(self.data_ptr, self.data_len) }
    }

    /// Mutable view of the data region; only legal before `Seal`, which is
    /// exactly the Creating-state window this type represents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert_eq!(self.device_num, 0, "data is device-resident; use device_buffer()");
        unsafe { slice::from_raw_parts_mut(self.data_ptr, self.data_len) }
    }

    pub fn metadata(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.metadata_ptr, self.metadata_len) }
    }

    pub fn metadata_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.metadata_ptr, self.metadata_len) }
    }

    /// Seals the object: computes its content hash, sends `SealRequest`,
    /// and on success makes it visible to other clients.
    pub fn seal(mut self) -> Result<()> {
        let result = self.client.seal_internal(&self.id);
        self.finished = true;
        result
    }

    /// Aborts the reservation: returns the memory to the store as if the
    /// object was never created.
    pub fn abort(mut self) -> Result<()> {
        let result = self.client.abort_internal(&self.id);
        self.finished = true;
        result
    }
}

impl<'a> Debug for CreateBuffer<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "CreateBuffer(id: {}, size: {})", self.id, self.data_len)
    }
}

impl<'a> Drop for CreateBuffer<'a> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.client.abort_internal(&self.id) {
                panic!("failed to abort unfinished create buffer: {}", err);
            }
        }
    }
}

/// A read-only buffer over a sealed object, returned by `Get`. Must be
/// ended by a matching `Release`; dropping without one releases it
/// automatically (panicking if the store-side release fails, since that
/// indicates the client's bookkeeping has diverged from the store).
pub struct ObjectBuffer<'a> {
    client: &'a PlasmaClient,
    id: ObjectId,
    data_ptr: *const u8,
    data_len: usize,
    metadata_ptr: *const u8,
    metadata_len: usize,
    device_num: i32,
    released: bool,
}

impl<'a> ObjectBuffer<'a> {
    pub(crate) fn new(
        client: &'a PlasmaClient,
        id: ObjectId,
        data_ptr: *const u8,
        data_len: usize,
        metadata_ptr: *const u8,
        metadata_len: usize,
        device_num: i32,
    ) -> Self {
        ObjectBuffer {
            client,
            id,
            data_ptr,
            data_len,
            metadata_ptr,
            metadata_len,
            device_num,
            released: false,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn device_num(&self) -> i32 {
        self.device_num
    }

    pub fn device_buffer(&self) -> Option<DeviceBuffer> {
        if self.device_num == 0 {
            None
        } else {
            Some(DeviceBuffer::new(self.data_ptr, self.data_len, self.device_num))
        }
    }

    pub fn data(&self) -> &[u8] {
        assert_eq!(self.device_num, 0, "data is device-resident; use device_buffer()");
        unsafe { slice::from_raw_parts(self.data_ptr, self.data_len) }
    }

    pub fn metadata(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.metadata_ptr, self.metadata_len) }
    }

    pub fn size(&self) -> usize {
        self.data_len + self.metadata_len
    }

    /// Ends this reference explicitly; equivalent to dropping the buffer,
    /// but lets the caller observe the store's acknowledgement.
    pub fn release(mut self) -> Result<()> {
        let result = self.client.release_internal(&self.id);
        self.released = true;
        result
    }
}

impl<'a> Debug for ObjectBuffer<'a> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectBuffer(id: {}, size: {})", self.id, self.size())
    }
}

impl<'a> Drop for ObjectBuffer<'a> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.client.release_internal(&self.id) {
                panic!("failed to release object buffer: {}", err);
            }
        }
    }
}
