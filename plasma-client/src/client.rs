// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

//! The public API façade: connection setup/teardown plus the full set of
//! typed store operations. A single owned aggregate holds the
//! transport(s), the three bookkeeping tables, and configuration — all
//! instance state, never a global, so multiple clients in one process
//! stay independent.

use crate::buffer::{CreateBuffer, ObjectBuffer};
use crate::config::{ClientConfig, ConnectOptions};
use crate::errors::{PlasmaError, Result, TransportError};
use crate::inuse_table::{EndUseOutcome, InUseTable};
use crate::lifecycle::{self, ObjectState};
use crate::mmap_table::MmapTable;
use crate::object_id::{ObjectId, OBJECT_ID_BYTES};
use crate::protocol::{
    self, read_i64_le, read_object_id, read_plasma_object, read_u64_le, read_u8, status,
    write_i32_le, write_i64_le, write_object_id, write_object_id_list, write_u64_le, MessageType,
};
use crate::release_history::ReleaseHistory;
use crate::transport::{NotificationChannel, StoreTransport, UnixSocketTransport};
use crate::wait::{self, WaitRequest, WaitResult};
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::io;
use std::io::Cursor;
use std::os::unix::io::{IntoRawFd, OwnedFd};
use tracing::{debug, info, warn};

struct ClientState {
    transport: Box<dyn StoreTransport>,
    manager_transport: Option<Box<dyn StoreTransport>>,
    mmap_table: MmapTable,
    in_use: InUseTable,
    release_history: ReleaseHistory,
    config: ClientConfig,
    store_capacity: u64,
    usable: bool,
}

/// An in-process handle to a Plasma store connection. Single-threaded with
/// respect to this instance: the client takes no internal locks, so
/// callers must serialize their own calls to it (e.g. behind a mutex) if
/// shared across threads.
pub struct PlasmaClient {
    state: RefCell<ClientState>,
}

impl PlasmaClient {
    /// Opens the store socket (retrying with bounded backoff up to
    /// `num_retries`), and the manager socket if configured; exchanges a
    /// handshake retrieving `store_capacity`; initialises empty tables.
    pub fn connect(options: ConnectOptions) -> Result<Self> {
        crate::transport::warn_if_fd_unsupported()?;

        info!(socket = %options.store_socket_name, "connecting to plasma store");
        let mut transport = UnixSocketTransport::connect(&options.store_socket_name, options.num_retries)
            .map_err(|e| PlasmaError::ConnectionError(e.to_string()))?;

        let reply = transport
            .call(MessageType::Connect, &[])
            .map_err(|e| PlasmaError::ConnectionError(e.to_string()))?;
        if reply.msg_type != MessageType::Connect {
            return Err(PlasmaError::ProtocolError(format!(
                "expected Connect reply, got {:?}",
                reply.msg_type
            )));
        }
        let mut cursor = Cursor::new(&reply.payload);
        let store_capacity = read_u64_le(&mut cursor)
            .map_err(|_| PlasmaError::ProtocolError("truncated Connect reply".into()))?;

        let mut manager_transport = match &options.manager_socket_name {
            Some(path) => {
                info!(socket = %path, "connecting to plasma manager");
                let manager = UnixSocketTransport::connect(path, options.num_retries)
                    .map_err(|e| PlasmaError::ConnectionError(e.to_string()))?;
                Some(manager)
            }
            None => None,
        };

        let config = ClientConfig::from_options(&options, store_capacity);
        debug!(?config, store_capacity, "plasma client connected");
        transport.set_max_frame_len(config.max_frame_len);
        if let Some(manager) = manager_transport.as_mut() {
            manager.set_max_frame_len(config.max_frame_len);
        }
        let manager_transport =
            manager_transport.map(|m| Box::new(m) as Box<dyn StoreTransport>);

        Ok(PlasmaClient {
            state: RefCell::new(ClientState {
                transport: Box::new(transport),
                manager_transport,
                mmap_table: MmapTable::new(),
                in_use: InUseTable::new(),
                release_history: ReleaseHistory::new(config.release_delay, config.release_byte_threshold),
                config,
                store_capacity,
                usable: true,
            }),
        })
    }

    /// Memory capacity of the store in bytes, as reported at Connect.
    pub fn store_capacity(&self) -> u64 {
        self.state.borrow().store_capacity
    }

    /// The effective configuration this client connected with, including
    /// the release-byte threshold derived from `store_capacity`.
    pub fn config(&self) -> ClientConfig {
        self.state.borrow().config.clone()
    }

    fn check_usable(&self) -> Result<()> {
        if self.state.borrow().usable {
            Ok(())
        } else {
            Err(PlasmaError::TransportError(TransportError::MalformedHeader))
        }
    }

    // CREATE / SEAL / ABORT / RELEASE
    // --------------------------------------------------------------------

    /// Sends a `CreateRequest`; on success receives a `PlasmaObject`
    /// (possibly with a new mapping fd), inserts an unsealed in-use entry,
    /// writes `metadata` into the metadata region, and returns a writable
    /// buffer over the data region.
    pub fn create<'a>(
        &'a self,
        object_id: ObjectId,
        data_size: usize,
        metadata: &[u8],
        device_num: i32,
    ) -> Result<CreateBuffer<'a>> {
        self.check_usable()?;
        {
            let state = self.state.borrow();
            let current = lifecycle::current_state(&object_id, &state.in_use, &state.release_history);
            if current != ObjectState::Absent {
                return Err(PlasmaError::StateError {
                    object_id,
                    reason: "Create requires the object to be Absent locally",
                });
            }
        }

        let mut payload = Vec::with_capacity(OBJECT_ID_BYTES + 20);
        write_object_id(&mut payload, &object_id).map_err(TransportError::Io)?;
        write_u64_le(&mut payload, data_size as u64).map_err(TransportError::Io)?;
        write_u64_le(&mut payload, metadata.len() as u64).map_err(TransportError::Io)?;
        write_i32_le(&mut payload, device_num).map_err(TransportError::Io)?;

        let mut state = self.state.borrow_mut();
        let reply = call_store(&mut state, MessageType::Create, &payload)?;
        let mut cursor = Cursor::new(&reply.payload);
        let code = read_u8(&mut cursor).map_err(TransportError::Io)?;
        match code {
            status::OK => {}
            status::ALREADY_EXISTS => return Err(PlasmaError::AlreadyExists(object_id)),
            status::OUT_OF_MEMORY => return Err(PlasmaError::OutOfMemory(object_id, data_size)),
            status::TRANSIENT_STORE_FULL => return Err(PlasmaError::TransientStoreFull),
            other => {
                return Err(PlasmaError::ProtocolError(format!(
                    "unexpected Create status code {}",
                    other
                )))
            }
        }
        let object = read_plasma_object(&mut cursor).map_err(TransportError::Io)?;
        let raw_fd: std::os::unix::io::RawFd = reply
            .fd
            .map(OwnedFd::into_raw_fd)
            .ok_or(TransportError::MissingDescriptor)?;

        let base = state
            .mmap_table
            .lookup_or_mmap(object.store_fd_id, raw_fd, object.map_size as usize, true)
            .map_err(TransportError::Io)?;

        let ClientState {
            in_use, mmap_table, ..
        } = &mut *state;
        in_use.begin_use(object_id, object, false, mmap_table);

        let data_ptr = unsafe { base.add(object.data_offset as usize) };
        let metadata_ptr = unsafe { base.add(object.metadata_offset as usize) };
        if !metadata.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(metadata.as_ptr(), metadata_ptr, metadata.len());
            }
        }

        Ok(CreateBuffer::new(
            self,
            object_id,
            data_ptr,
            object.data_size.max(0) as usize,
            metadata_ptr,
            object.metadata_size.max(0) as usize,
            device_num,
        ))
    }

    pub(crate) fn seal_internal(&self, object_id: &ObjectId) -> Result<()> {
        self.check_usable()?;
        let digest = self.hash_local(object_id)?;

        let mut state = self.state.borrow_mut();
        let current = lifecycle::current_state(object_id, &state.in_use, &state.release_history);
        if current != ObjectState::Creating {
            return Err(PlasmaError::StateError {
                object_id: *object_id,
                reason: "Seal requires the object to be in the Creating state",
            });
        }

        let mut payload = Vec::with_capacity(OBJECT_ID_BYTES + 20);
        write_object_id(&mut payload, object_id).map_err(TransportError::Io)?;
        payload.extend_from_slice(&digest);
        let reply = call_store(&mut state, MessageType::Seal, &payload)?;
        let code = *reply.payload.first().ok_or(TransportError::ShortRead {
            expected: 1,
            actual: 0,
        })?;
        if code != status::OK {
            return Err(PlasmaError::ProtocolError(format!(
                "unexpected Seal status code {}",
                code
            )));
        }
        state.in_use.mark_sealed(object_id);
        Ok(())
    }

    pub(crate) fn abort_internal(&self, object_id: &ObjectId) -> Result<()> {
        self.check_usable()?;
        let mut state = self.state.borrow_mut();
        let current = lifecycle::current_state(object_id, &state.in_use, &state.release_history);
        if current != ObjectState::Creating {
            return Err(PlasmaError::StateError {
                object_id: *object_id,
                reason: "Abort requires the object to be in the Creating state",
            });
        }
        if state.in_use.lookup(object_id).map(|e| e.local_refs) != Some(1) {
            return Err(PlasmaError::StateError {
                object_id: *object_id,
                reason: "Abort requires exactly one local reference",
            });
        }

        let mut payload = Vec::with_capacity(OBJECT_ID_BYTES);
        write_object_id(&mut payload, object_id).map_err(TransportError::Io)?;
        let reply = call_store(&mut state, MessageType::Abort, &payload)?;
        let code = *reply.payload.first().ok_or(TransportError::ShortRead {
            expected: 1,
            actual: 0,
        })?;
        if code != status::OK {
            return Err(PlasmaError::ProtocolError(format!(
                "unexpected Abort status code {}",
                code
            )));
        }

        let entry = state.in_use.remove(object_id).expect("entry observed above");
        state.mmap_table.decrement(entry.object.store_fd_id);
        Ok(())
    }

    /// Ends one local reference. If the count drops to zero the entry is
    /// appended to the release history rather than removed immediately,
    /// then flushed per `§4.4`'s thresholds.
    pub(crate) fn release_internal(&self, object_id: &ObjectId) -> Result<()> {
        self.check_usable()?;
        let mut state = self.state.borrow_mut();
        match state.in_use.end_use(object_id) {
            Ok(EndUseOutcome::StillReferenced) => Ok(()),
            Ok(EndUseOutcome::NowIdle) => {
                let size = state
                    .in_use
                    .lookup(object_id)
                    .map(|e| e.object.total_len() as u64)
                    .unwrap_or(0);
                state.release_history.enqueue(*object_id, size);
                flush_release_history(&mut state)
            }
            Err(_) => Err(PlasmaError::StateError {
                object_id: *object_id,
                reason: "Release requires a matching prior Get or Create",
            }),
        }
    }

    pub fn release(&self, object_id: &ObjectId) -> Result<()> {
        self.release_internal(object_id)
    }

    // CONTAINS / DELETE / EVICT / HASH
    // --------------------------------------------------------------------

    pub fn contains(&self, object_id: &ObjectId) -> Result<bool> {
        self.check_usable()?;
        let mut payload = Vec::with_capacity(OBJECT_ID_BYTES);
        write_object_id(&mut payload, object_id).map_err(TransportError::Io)?;
        let mut state = self.state.borrow_mut();
        let reply = call_store(&mut state, MessageType::Contains, &payload)?;
        Ok(reply.payload.first().copied().unwrap_or(0) != 0)
    }

    /// Best-effort: the store silently ignores the request if the object
    /// is absent, still in use, or unsealed — the client has no
    /// independent basis to tell "did nothing" apart from "nothing to
    /// do", so it reports success either way rather than guessing at a
    /// `StateError`.
    pub fn delete(&self, object_id: &ObjectId) -> Result<()> {
        self.check_usable()?;
        let mut payload = Vec::with_capacity(OBJECT_ID_BYTES);
        write_object_id(&mut payload, object_id).map_err(TransportError::Io)?;
        let mut state = self.state.borrow_mut();
        call_store(&mut state, MessageType::Delete, &payload)?;
        Ok(())
    }

    pub fn evict(&self, num_bytes: u64) -> Result<u64> {
        self.check_usable()?;
        let mut payload = Vec::with_capacity(8);
        write_u64_le(&mut payload, num_bytes).map_err(TransportError::Io)?;
        let mut state = self.state.borrow_mut();
        let reply = call_store(&mut state, MessageType::Evict, &payload)?;
        let mut cursor = Cursor::new(&reply.payload);
        read_u64_le(&mut cursor).map_err(|_| {
            PlasmaError::ProtocolError("truncated Evict reply".into())
        })
    }

    /// If sealed, may return the store's cached digest; otherwise computes
    /// it locally over the mapping.
    pub fn hash(&self, object_id: &ObjectId) -> Result<[u8; 20]> {
        self.check_usable()?;
        let sealed = {
            let state = self.state.borrow();
            matches!(
                lifecycle::current_state(object_id, &state.in_use, &state.release_history),
                ObjectState::SealedInUse | ObjectState::Queued
            )
        };
        if sealed {
            self.hash_local(object_id)
        } else {
            let mut payload = Vec::with_capacity(OBJECT_ID_BYTES);
            write_object_id(&mut payload, object_id).map_err(TransportError::Io)?;
            let mut state = self.state.borrow_mut();
            let reply = call_store(&mut state, MessageType::Hash, &payload)?;
            let mut cursor = Cursor::new(&reply.payload);
            let code = read_u8(&mut cursor).map_err(TransportError::Io)?;
            if code == status::NOT_FOUND {
                return Err(PlasmaError::NotFound(*object_id));
            }
            if code != status::OK {
                return Err(PlasmaError::ProtocolError(format!(
                    "unexpected Hash status code {}",
                    code
                )));
            }
            let mut digest = [0u8; 20];
            std::io::Read::read_exact(&mut cursor, &mut digest).map_err(TransportError::Io)?;
            Ok(digest)
        }
    }

    /// Computes SHA-256 over `data || metadata` and keeps the low 20
    /// bytes, matching the digest width the store hands back over the
    /// wire for the same object.
    fn hash_local(&self, object_id: &ObjectId) -> Result<[u8; 20]> {
        let state = self.state.borrow();
        let entry = state.in_use.lookup(object_id).ok_or(PlasmaError::StateError {
            object_id: *object_id,
            reason: "Hash over a local mapping requires an in-use entry",
        })?;
        let base = state
            .mmap_table
            .base_ptr(entry.object.store_fd_id)
            .expect("in-use entry must pin a live mmap entry");
        let data = unsafe {
            std::slice::from_raw_parts(
                base.add(entry.object.data_offset as usize),
                entry.object.data_size.max(0) as usize,
            )
        };
        let metadata = unsafe {
            std::slice::from_raw_parts(
                base.add(entry.object.metadata_offset as usize),
                entry.object.metadata_size.max(0) as usize,
            )
        };
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.update(metadata);
        let digest = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[..20]);
        Ok(out)
    }

    // GET
    // --------------------------------------------------------------------

    /// Blocks until every requested object is present locally or
    /// `timeout_ms` elapses (-1 waits indefinitely). Objects not ready by
    /// the deadline come back as `None`.
    pub fn get<'a>(
        &'a self,
        object_ids: &[ObjectId],
        timeout_ms: i64,
    ) -> Result<Vec<Option<ObjectBuffer<'a>>>> {
        self.check_usable()?;
        if object_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut payload = Vec::new();
        write_i64_le(&mut payload, timeout_ms).map_err(TransportError::Io)?;
        write_object_id_list(&mut payload, object_ids).map_err(TransportError::Io)?;

        let mut state = self.state.borrow_mut();
        send_store(&mut state, MessageType::Get, &payload)?;
        let timeout_result = state.transport.set_timeout(timeout_ms).map_err(PlasmaError::TransportError);
        note_fatal(&mut state, timeout_result)?;

        let mut out = Vec::with_capacity(object_ids.len());
        let mut timed_out = 0usize;
        for (received, expected_id) in object_ids.iter().enumerate() {
            let reply = match recv_store_with_deadline(&mut state)? {
                RecvOutcome::Reply(reply) => reply,
                RecvOutcome::DeadlineElapsed => {
                    let _ = state.transport.set_timeout(-1);
                    return Err(PlasmaError::Timeout(object_ids.len() - received));
                }
            };
            if reply.msg_type != MessageType::Get {
                return note_fatal(
                    &mut state,
                    Err(PlasmaError::ProtocolError(format!(
                        "expected Get reply, got {:?}",
                        reply.msg_type
                    ))),
                );
            }
            let mut cursor = Cursor::new(&reply.payload);
            let returned_id = read_object_id(&mut cursor).map_err(TransportError::Io)?;
            if &returned_id != expected_id {
                return note_fatal(
                    &mut state,
                    Err(PlasmaError::ProtocolError(
                        "Get reply object id did not match request order".into(),
                    )),
                );
            }
            let object = read_plasma_object(&mut cursor).map_err(TransportError::Io)?;

            if object.is_absent() {
                timed_out += 1;
                out.push(None);
                continue;
            }

            let was_queued = state.release_history.contains(&returned_id);
            if was_queued {
                state.release_history.remove(&returned_id, object.total_len() as u64);
                state.in_use.reclaim(&returned_id);
            } else {
                if let Some(fd) = reply.fd {
                    state
                        .mmap_table
                        .lookup_or_mmap(object.store_fd_id, fd.into_raw_fd(), object.map_size as usize, false)
                        .map_err(TransportError::Io)?;
                } else if state.mmap_table.base_ptr(object.store_fd_id).is_none() {
                    return Err(PlasmaError::TransportError(TransportError::MissingDescriptor));
                }
                let ClientState { in_use, mmap_table, .. } = &mut *state;
                in_use.begin_use(returned_id, object, true, mmap_table);
            }

            let base = state
                .mmap_table
                .base_ptr(object.store_fd_id)
                .expect("begin_use/reclaim must have pinned a live mapping");
            let data_ptr = unsafe { base.add(object.data_offset as usize) as *const u8 };
            let metadata_ptr = unsafe { base.add(object.metadata_offset as usize) as *const u8 };
            out.push(Some(ObjectBuffer::new(
                self,
                returned_id,
                data_ptr,
                object.data_size.max(0) as usize,
                metadata_ptr,
                object.metadata_size.max(0) as usize,
                object.device_num,
            )));
        }

        let _ = state.transport.set_timeout(-1);
        if timed_out > 0 {
            debug!(timed_out, total = object_ids.len(), "Get returned with absent slots");
        }
        Ok(out)
    }

    // WAIT / SUBSCRIBE
    // --------------------------------------------------------------------

    pub fn wait(
        &self,
        requests: &[WaitRequest],
        n_required: u32,
        timeout_ms: i64,
    ) -> Result<Vec<WaitResult>> {
        self.check_usable()?;
        if requests.iter().any(|r| r.query == crate::wait::WaitQuery::Anywhere) {
            let has_manager = self.state.borrow().manager_transport.is_some();
            if !has_manager {
                return Err(PlasmaError::NoManagerError);
            }
        }

        let mut payload = Vec::new();
        write_i64_le(&mut payload, timeout_ms).map_err(TransportError::Io)?;
        protocol::write_u32_le(&mut payload, n_required).map_err(TransportError::Io)?;
        wait::write_wait_requests(&mut payload, requests).map_err(TransportError::Io)?;

        let mut state = self.state.borrow_mut();
        send_store(&mut state, MessageType::Wait, &payload)?;
        let timeout_result = state.transport.set_timeout(timeout_ms).map_err(PlasmaError::TransportError);
        note_fatal(&mut state, timeout_result)?;
        let reply = match recv_store_with_deadline(&mut state)? {
            RecvOutcome::Reply(reply) => reply,
            RecvOutcome::DeadlineElapsed => {
                let _ = state.transport.set_timeout(-1);
                return Err(PlasmaError::Timeout(requests.len()));
            }
        };
        let _ = state.transport.set_timeout(-1);
        let mut cursor = Cursor::new(&reply.payload);
        let results = wait::read_wait_results(&mut cursor)?;
        Ok(results)
    }

    /// Sends `SubscribeRequest` and returns the independent notification
    /// channel the store writes seal/delete frames to.
    pub fn subscribe(&self) -> Result<NotificationChannel> {
        self.check_usable()?;
        let mut state = self.state.borrow_mut();
        let reply = call_store(&mut state, MessageType::Subscribe, &[])?;
        let fd = reply.fd.ok_or(TransportError::MissingDescriptor)?;
        Ok(NotificationChannel::from_owned_fd(fd))
    }

    // MANAGER OPERATIONS (Fetch / Transfer / Info)
    // --------------------------------------------------------------------

    /// Idempotent, non-blocking request to pull `object_ids` from a remote
    /// peer via the manager. Fails with `NoManagerError` if no manager
    /// connection was configured.
    pub fn fetch(&self, object_ids: &[ObjectId]) -> Result<()> {
        self.check_usable()?;
        let mut payload = Vec::new();
        write_object_id_list(&mut payload, object_ids).map_err(TransportError::Io)?;
        let mut state = self.state.borrow_mut();
        call_manager(&mut state, MessageType::Fetch, &payload)?;
        Ok(())
    }

    /// Single-round-trip request asking the manager to transfer
    /// `object_id` to `destination_addr`.
    pub fn transfer(&self, object_id: &ObjectId, destination_addr: &str) -> Result<()> {
        self.check_usable()?;
        let mut payload = Vec::with_capacity(OBJECT_ID_BYTES + destination_addr.len() + 2);
        write_object_id(&mut payload, object_id).map_err(TransportError::Io)?;
        protocol::write_u16_le(&mut payload, destination_addr.len() as u16)
            .map_err(TransportError::Io)?;
        payload.extend_from_slice(destination_addr.as_bytes());
        let mut state = self.state.borrow_mut();
        call_manager(&mut state, MessageType::Transfer, &payload)?;
        Ok(())
    }

    /// Single-round-trip status query for `object_id` via the manager.
    pub fn info(&self, object_id: &ObjectId) -> Result<ObjectInfo> {
        self.check_usable()?;
        let mut payload = Vec::with_capacity(OBJECT_ID_BYTES);
        write_object_id(&mut payload, object_id).map_err(TransportError::Io)?;
        let mut state = self.state.borrow_mut();
        let reply = call_manager(&mut state, MessageType::Info, &payload)?;
        let mut cursor = Cursor::new(&reply.payload);
        let exists = read_u8(&mut cursor).map_err(TransportError::Io)? != 0;
        let sealed = read_u8(&mut cursor).map_err(TransportError::Io)? != 0;
        let data_size = read_i64_le(&mut cursor).map_err(TransportError::Io)?;
        let metadata_size = read_i64_le(&mut cursor).map_err(TransportError::Io)?;
        Ok(ObjectInfo {
            exists,
            sealed,
            data_size,
            metadata_size,
        })
    }

    /// Flushes the release history fully, closes sockets, and unmaps all
    /// regions, which must have `active_count == 0` at this point or the
    /// invariant has already been violated elsewhere.
    pub fn disconnect(self) -> Result<()> {
        let mut state = self.state.into_inner();
        while !state.release_history.is_empty() {
            flush_release_history(&mut state)?;
        }
        info!("plasma client disconnected");
        Ok(())
    }

    /// Builds a client around an already-handshaken transport pair,
    /// bypassing `Connect`. Only used by tests to substitute an in-process
    /// double for the store socket.
    #[cfg(test)]
    fn from_parts(
        transport: Box<dyn StoreTransport>,
        manager_transport: Option<Box<dyn StoreTransport>>,
        config: ClientConfig,
        store_capacity: u64,
    ) -> Self {
        PlasmaClient {
            state: RefCell::new(ClientState {
                transport,
                manager_transport,
                mmap_table: MmapTable::new(),
                in_use: InUseTable::new(),
                release_history: ReleaseHistory::new(config.release_delay, config.release_byte_threshold),
                config,
                store_capacity,
                usable: true,
            }),
        }
    }
}

/// Status/metadata snapshot for an object, as reported by the manager's
/// `Info` call — does not establish a local reference.
#[derive(Debug, Clone, Copy)]
pub struct ObjectInfo {
    pub exists: bool,
    pub sealed: bool,
    pub data_size: i64,
    pub metadata_size: i64,
}

/// Marks the client permanently unusable if `result` carries a fatal
/// error, then passes it through unchanged.
fn note_fatal<T>(state: &mut ClientState, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        if err.is_fatal() {
            state.usable = false;
        }
    }
    result
}

fn send_store(state: &mut ClientState, msg_type: MessageType, payload: &[u8]) -> Result<()> {
    let result = state.transport.send_request(msg_type, payload).map_err(PlasmaError::TransportError);
    note_fatal(state, result)
}

fn recv_store(state: &mut ClientState) -> Result<crate::transport::Reply> {
    let result = state.transport.recv_reply().map_err(PlasmaError::TransportError);
    note_fatal(state, result)
}

fn call_store(
    state: &mut ClientState,
    msg_type: MessageType,
    payload: &[u8],
) -> Result<crate::transport::Reply> {
    send_store(state, msg_type, payload)?;
    recv_store(state)
}

fn call_manager(
    state: &mut ClientState,
    msg_type: MessageType,
    payload: &[u8],
) -> Result<crate::transport::Reply> {
    match state.manager_transport.as_deref_mut() {
        None => Err(PlasmaError::NoManagerError),
        Some(manager) => {
            let result = manager.call(msg_type, payload).map_err(PlasmaError::TransportError);
            note_fatal(state, result)
        }
    }
}

/// Outcome of a receive made under a bounded socket deadline: either a
/// reply arrived, or the deadline passed without the store answering at
/// all. The latter is distinct from the in-band "object still absent"
/// slot `Get`/`Wait` return on ordinary success — it means the store
/// itself never came back, which is not fatal to the connection the way
/// a malformed reply is.
enum RecvOutcome {
    Reply(crate::transport::Reply),
    DeadlineElapsed,
}

fn recv_store_with_deadline(state: &mut ClientState) -> Result<RecvOutcome> {
    match state.transport.recv_reply() {
        Ok(reply) => Ok(RecvOutcome::Reply(reply)),
        Err(TransportError::Io(io_err))
            if matches!(io_err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            Ok(RecvOutcome::DeadlineElapsed)
        }
        Err(e) => note_fatal(state, Err(PlasmaError::TransportError(e))),
    }
}

/// Flushes the oldest release-history entries until the queue is back
/// within both the count and byte thresholds.
fn flush_release_history(state: &mut ClientState) -> Result<()> {
    while state.release_history.should_flush() {
        perform_release(state)?;
    }
    Ok(())
}

fn perform_release(state: &mut ClientState) -> Result<()> {
    let head_id = match state.release_history.peek_oldest() {
        Some(id) => id,
        None => return Ok(()),
    };
    let size = state
        .in_use
        .lookup(&head_id)
        .map(|e| e.object.total_len() as u64)
        .unwrap_or(0);

    let mut payload = Vec::with_capacity(OBJECT_ID_BYTES);
    write_object_id(&mut payload, &head_id).map_err(TransportError::Io)?;
    let reply = call_store(state, MessageType::Release, &payload);

    state.release_history.pop_oldest(size);
    match reply {
        Ok(r) => {
            let code = r.payload.first().copied().unwrap_or(status::OK);
            if code != status::OK {
                warn!(object_id = %head_id, code, "store rejected delayed ReleaseRequest");
            }
        }
        Err(err) => {
            // The ack failed; the client propagates the error but leaves
            // the entry removed locally — the store is now the source of
            // truth for this object.
            if let Some(entry) = state.in_use.remove(&head_id) {
                state.mmap_table.decrement(entry.object.store_fd_id);
            }
            return Err(err);
        }
    }

    if let Some(entry) = state.in_use.remove(&head_id) {
        state.mmap_table.decrement(entry.object.store_fd_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_object_id_list, write_plasma_object, PlasmaObject};
    use crate::transport::Reply;
    use crate::wait::WaitQuery;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::io::{Seek, SeekFrom, Write};
    use std::os::unix::io::{FromRawFd, IntoRawFd};
    use std::os::unix::net::UnixStream;

    struct MockObject {
        file: std::fs::File,
        store_fd_id: u64,
        data_size: usize,
        metadata_size: usize,
        sealed: bool,
    }

    /// An in-process stand-in for the store socket, backed by real
    /// `tempfile`s and real file descriptors so the client's mmap/in-use
    /// bookkeeping runs unmodified. Processes a request synchronously in
    /// `send_request` and queues the reply frame(s) for `recv_reply`.
    struct MockStore {
        objects: HashMap<ObjectId, MockObject>,
        next_store_fd_id: u64,
        store_capacity: u64,
        pending: VecDeque<Reply>,
        /// Objects a manager would report as held by some remote peer, for
        /// `Wait`'s `Anywhere` query. Set directly by tests; this store never
        /// populates it itself since there is no real remote peer.
        remote_objects: HashSet<ObjectId>,
        /// The store's half of the subscription socket, once a client has
        /// subscribed. Seal/Delete write a notification frame to it, mirroring
        /// the real store pushing events to every subscriber.
        notifier: Option<UnixStream>,
    }

    impl MockStore {
        fn new(store_capacity: u64) -> Self {
            MockStore {
                objects: HashMap::new(),
                next_store_fd_id: 1,
                store_capacity,
                pending: VecDeque::new(),
                remote_objects: HashSet::new(),
                notifier: None,
            }
        }

        fn dup_fd_for(file: &std::fs::File) -> std::os::unix::io::RawFd {
            file.try_clone().expect("dup mock object fd").into_raw_fd()
        }

        fn queue(&mut self, msg_type: MessageType, payload: Vec<u8>, fd: Option<OwnedFd>) {
            self.pending.push_back(Reply { msg_type, payload, fd });
        }
    }

    impl StoreTransport for MockStore {
        fn send_request(
            &mut self,
            msg_type: MessageType,
            payload: &[u8],
        ) -> std::result::Result<(), TransportError> {
            let mut cursor = Cursor::new(payload);
            match msg_type {
                MessageType::Connect => {
                    let mut reply = Vec::new();
                    write_u64_le(&mut reply, self.store_capacity).unwrap();
                    self.queue(MessageType::Connect, reply, None);
                }
                MessageType::Create => {
                    let id = read_object_id(&mut cursor).unwrap();
                    let data_size = read_u64_le(&mut cursor).unwrap() as usize;
                    let metadata_size = read_u64_le(&mut cursor).unwrap() as usize;
                    let device_num = crate::protocol::read_i32_le(&mut cursor).unwrap();
                    if self.objects.contains_key(&id) {
                        self.queue(MessageType::Create, vec![status::ALREADY_EXISTS], None);
                        return Ok(());
                    }
                    let mut file = tempfile::tempfile().unwrap();
                    file.write_all(&vec![0u8; data_size + metadata_size]).unwrap();
                    file.seek(SeekFrom::Start(0)).unwrap();
                    let store_fd_id = self.next_store_fd_id;
                    self.next_store_fd_id += 1;
                    let fd = Self::dup_fd_for(&file);
                    self.objects.insert(
                        id,
                        MockObject {
                            file,
                            store_fd_id,
                            data_size,
                            metadata_size,
                            sealed: false,
                        },
                    );
                    let object = PlasmaObject {
                        store_fd_id,
                        map_size: (data_size + metadata_size) as u64,
                        data_offset: 0,
                        data_size: data_size as i64,
                        metadata_offset: data_size as u64,
                        metadata_size: metadata_size as i64,
                        device_num,
                    };
                    let mut reply = vec![status::OK];
                    write_plasma_object(&mut reply, &object).unwrap();
                    self.queue(MessageType::Create, reply, Some(unsafe { OwnedFd::from_raw_fd(fd) }));
                }
                MessageType::Seal => {
                    let id = read_object_id(&mut cursor).unwrap();
                    if let Some(obj) = self.objects.get_mut(&id) {
                        obj.sealed = true;
                        if let Some(notifier) = self.notifier.as_mut() {
                            let n = crate::notification::Notification {
                                object_id: id,
                                data_size: obj.data_size as i64,
                                metadata_size: obj.metadata_size as i64,
                            };
                            crate::notification::write_notification(notifier, &n).unwrap();
                        }
                    }
                    self.queue(MessageType::Seal, vec![status::OK], None);
                }
                MessageType::Abort => {
                    let id = read_object_id(&mut cursor).unwrap();
                    self.objects.remove(&id);
                    self.queue(MessageType::Abort, vec![status::OK], None);
                }
                MessageType::Release => {
                    self.queue(MessageType::Release, vec![status::OK], None);
                }
                MessageType::Contains => {
                    let id = read_object_id(&mut cursor).unwrap();
                    let present = self.objects.get(&id).map(|o| o.sealed).unwrap_or(false);
                    self.queue(MessageType::Contains, vec![present as u8], None);
                }
                MessageType::Delete => {
                    let id = read_object_id(&mut cursor).unwrap();
                    if self.objects.get(&id).map(|o| o.sealed).unwrap_or(false) {
                        self.objects.remove(&id);
                        if let Some(notifier) = self.notifier.as_mut() {
                            let n = crate::notification::Notification {
                                object_id: id,
                                data_size: crate::notification::Notification::DELETION_SENTINEL,
                                metadata_size: crate::notification::Notification::DELETION_SENTINEL,
                            };
                            crate::notification::write_notification(notifier, &n).unwrap();
                        }
                    }
                    self.queue(MessageType::Delete, vec![status::OK], None);
                }
                MessageType::Wait => {
                    let _timeout_ms = read_i64_le(&mut cursor).unwrap();
                    let _n_required = protocol::read_u32_le(&mut cursor).unwrap();
                    let requests = crate::wait::read_wait_requests(&mut cursor).unwrap();
                    let results: Vec<WaitResult> = requests
                        .iter()
                        .map(|req| {
                            let locally_sealed =
                                self.objects.get(&req.object_id).map(|o| o.sealed).unwrap_or(false);
                            if locally_sealed {
                                WaitResult::Local
                            } else if req.query == WaitQuery::Anywhere
                                && self.remote_objects.contains(&req.object_id)
                            {
                                WaitResult::Remote
                            } else {
                                WaitResult::Nonexistent
                            }
                        })
                        .collect();
                    let mut reply = Vec::new();
                    crate::wait::write_wait_results(&mut reply, &results).unwrap();
                    self.queue(MessageType::Wait, reply, None);
                }
                MessageType::Subscribe => {
                    let (store_half, client_half) = UnixStream::pair().unwrap();
                    self.notifier = Some(store_half);
                    let fd = client_half.into_raw_fd();
                    self.queue(
                        MessageType::Subscribe,
                        vec![status::OK],
                        Some(unsafe { OwnedFd::from_raw_fd(fd) }),
                    );
                }
                MessageType::Evict => {
                    let mut reply = Vec::new();
                    write_u64_le(&mut reply, 0).unwrap();
                    self.queue(MessageType::Evict, reply, None);
                }
                MessageType::Hash => {
                    let id = read_object_id(&mut cursor).unwrap();
                    match self.objects.get_mut(&id) {
                        Some(obj) if obj.sealed => {
                            let mut buf = vec![0u8; obj.data_size + obj.metadata_size];
                            obj.file.seek(SeekFrom::Start(0)).unwrap();
                            std::io::Read::read_exact(&mut obj.file, &mut buf).unwrap();
                            let mut hasher = Sha256::new();
                            hasher.update(&buf);
                            let digest = hasher.finalize();
                            let mut reply = vec![status::OK];
                            reply.extend_from_slice(&digest[..20]);
                            self.queue(MessageType::Hash, reply, None);
                        }
                        Some(_) => self.queue(MessageType::Hash, vec![status::NOT_FOUND], None),
                        None => self.queue(MessageType::Hash, vec![status::NOT_FOUND], None),
                    }
                }
                MessageType::Get => {
                    let _timeout_ms = read_i64_le(&mut cursor).unwrap();
                    let ids = read_object_id_list(&mut cursor).unwrap();
                    for id in ids {
                        let mut reply = Vec::new();
                        write_object_id(&mut reply, &id).unwrap();
                        match self.objects.get(&id).filter(|o| o.sealed) {
                            Some(obj) => {
                                let object = PlasmaObject {
                                    store_fd_id: obj.store_fd_id,
                                    map_size: (obj.data_size + obj.metadata_size) as u64,
                                    data_offset: 0,
                                    data_size: obj.data_size as i64,
                                    metadata_offset: obj.data_size as u64,
                                    metadata_size: obj.metadata_size as i64,
                                    device_num: 0,
                                };
                                write_plasma_object(&mut reply, &object).unwrap();
                                let fd = Self::dup_fd_for(&obj.file);
                                self.queue(MessageType::Get, reply, Some(unsafe { OwnedFd::from_raw_fd(fd) }));
                            }
                            None => {
                                let absent = PlasmaObject {
                                    store_fd_id: 0,
                                    map_size: 0,
                                    data_offset: 0,
                                    data_size: PlasmaObject::ABSENT_SENTINEL,
                                    metadata_offset: 0,
                                    metadata_size: PlasmaObject::ABSENT_SENTINEL,
                                    device_num: 0,
                                };
                                write_plasma_object(&mut reply, &absent).unwrap();
                                self.queue(MessageType::Get, reply, None);
                            }
                        }
                    }
                }
                other => panic!("MockStore does not implement {:?}", other),
            }
            Ok(())
        }

        fn recv_reply(&mut self) -> std::result::Result<Reply, TransportError> {
            self.pending.pop_front().ok_or(TransportError::ShortRead {
                expected: 1,
                actual: 0,
            })
        }
    }

    fn test_client(store_capacity: u64) -> PlasmaClient {
        let config = ClientConfig {
            release_delay: 64,
            release_byte_threshold: u64::MAX,
            max_frame_len: protocol::DEFAULT_MAX_FRAME_LEN,
        };
        PlasmaClient::from_parts(Box::new(MockStore::new(store_capacity)), None, config, store_capacity)
    }

    #[test]
    fn create_seal_get_release_round_trip() {
        let client = test_client(1 << 20);
        let id = ObjectId::rand();
        let data = b"hello plasma";
        let meta = b"meta";

        let mut buffer = client.create(id, data.len(), meta, 0).unwrap();
        buffer.data_mut().copy_from_slice(data);
        buffer.seal().unwrap();

        assert!(client.contains(&id).unwrap());

        let mut results = client.get(&[id], -1).unwrap();
        let got = results.pop().flatten().expect("object should be present");
        assert_eq!(got.data(), data);
        assert_eq!(got.metadata(), meta);
        got.release().unwrap();
    }

    #[test]
    fn create_then_abort_leaves_object_absent() {
        let client = test_client(1 << 20);
        let id = ObjectId::rand();
        let buffer = client.create(id, 8, &[], 0).unwrap();
        buffer.abort().unwrap();
        assert!(!client.contains(&id).unwrap());
    }

    #[test]
    fn duplicate_create_is_rejected_locally_while_still_referenced() {
        let client = test_client(1 << 20);
        let id = ObjectId::rand();
        let first = client.create(id, 8, &[], 0).unwrap();
        first.seal().unwrap();
        assert!(matches!(
            client.create(id, 8, &[], 0),
            Err(PlasmaError::StateError { .. })
        ));
    }

    #[test]
    fn duplicate_create_is_rejected_by_store_once_unreferenced() {
        let client = test_client(1 << 20);
        let id = ObjectId::rand();
        let first = client.create(id, 8, &[], 0).unwrap();
        first.seal().unwrap();
        client.release(&id).unwrap();
        while client.state.borrow().release_history.peek_oldest().is_some() {
            perform_release(&mut client.state.borrow_mut()).unwrap();
        }
        assert!(matches!(
            client.create(id, 8, &[], 0),
            Err(PlasmaError::AlreadyExists(_))
        ));
    }

    #[test]
    fn get_on_absent_object_returns_none() {
        let client = test_client(1 << 20);
        let id = ObjectId::rand();
        let mut results = client.get(&[id], 0).unwrap();
        assert!(results.pop().unwrap().is_none());
    }

    #[test]
    fn dropping_create_buffer_without_seal_aborts() {
        let client = test_client(1 << 20);
        let id = ObjectId::rand();
        {
            let _buffer = client.create(id, 8, &[], 0).unwrap();
        }
        assert!(!client.contains(&id).unwrap());
    }

    #[test]
    fn hash_matches_for_sealed_object_from_both_paths() {
        let client = test_client(1 << 20);
        let id = ObjectId::rand();
        let data = b"0123456789abcdef";
        let mut buffer = client.create(id, data.len(), &[], 0).unwrap();
        buffer.data_mut().copy_from_slice(data);
        buffer.seal().unwrap();

        let local_digest = client.hash(&id).unwrap();

        let mut results = client.get(&[id], -1).unwrap();
        let got = results.pop().flatten().unwrap();
        drop(got);
        let remote_digest = client.hash(&id).unwrap();
        assert_eq!(local_digest, remote_digest);
    }

    #[test]
    fn released_object_is_reobtainable_before_delay_flushes_it() {
        let config = ClientConfig {
            release_delay: 4,
            release_byte_threshold: u64::MAX,
            max_frame_len: protocol::DEFAULT_MAX_FRAME_LEN,
        };
        let client =
            PlasmaClient::from_parts(Box::new(MockStore::new(1 << 20)), None, config, 1 << 20);

        let x = ObjectId::rand();
        let buffer = client.create(x, 8, &[], 0).unwrap();
        buffer.seal().unwrap();
        client.release(&x).unwrap();
        assert_eq!(
            lifecycle::current_state(&x, &client.state.borrow().in_use, &client.state.borrow().release_history),
            ObjectState::Queued
        );

        // Three unrelated releases keep x queued (release_delay=4, strict >).
        for _ in 0..3 {
            let y = ObjectId::rand();
            let buffer = client.create(y, 8, &[], 0).unwrap();
            buffer.seal().unwrap();
            client.release(&y).unwrap();
        }
        assert!(client.contains(&x).unwrap());
        {
            let mut results = client.get(&[x], 0).unwrap();
            let got = results.pop().flatten().expect("x reclaimed from the release history without a fresh mmap");
            got.release().unwrap();
        }

        // A fourth unrelated release pushes the queue past release_delay and flushes x.
        let y4 = ObjectId::rand();
        let buffer = client.create(y4, 8, &[], 0).unwrap();
        buffer.seal().unwrap();
        client.release(&y4).unwrap();

        assert!(client.contains(&x).unwrap(), "store side still has x after the client-local flush");
        let mut results = client.get(&[x], 0).unwrap();
        assert!(results.pop().flatten().is_some(), "x is still obtainable via a fresh mmap after being flushed");
    }

    #[test]
    fn release_without_prior_get_is_a_state_error_and_client_stays_usable() {
        let client = test_client(1 << 20);
        let id = ObjectId::rand();
        assert!(matches!(
            client.release(&id),
            Err(PlasmaError::StateError { .. })
        ));

        let other = ObjectId::rand();
        let buffer = client.create(other, 8, &[], 0).unwrap();
        buffer.seal().unwrap();
        assert!(client.contains(&other).unwrap());
    }

    #[test]
    fn wait_reports_local_remote_and_nonexistent_per_request() {
        let config = ClientConfig {
            release_delay: 64,
            release_byte_threshold: u64::MAX,
            max_frame_len: protocol::DEFAULT_MAX_FRAME_LEN,
        };
        let mut store = MockStore::new(1 << 20);

        let x = ObjectId::rand();
        let y = ObjectId::rand();
        let z = ObjectId::rand();
        store.remote_objects.insert(z);

        let client = PlasmaClient::from_parts(
            Box::new(store),
            Some(Box::new(MockStore::new(1 << 20))),
            config,
            1 << 20,
        );
        let buffer = client.create(x, 8, &[], 0).unwrap();
        buffer.seal().unwrap();

        let results = client
            .wait(
                &[
                    WaitRequest { object_id: x, query: crate::wait::WaitQuery::Local },
                    WaitRequest { object_id: y, query: crate::wait::WaitQuery::Local },
                    WaitRequest { object_id: z, query: crate::wait::WaitQuery::Anywhere },
                ],
                1,
                200,
            )
            .unwrap();
        assert_eq!(results, vec![WaitResult::Local, WaitResult::Nonexistent, WaitResult::Remote]);
    }

    #[test]
    fn wait_with_anywhere_query_and_no_manager_errors() {
        let client = test_client(1 << 20);
        let id = ObjectId::rand();
        assert!(matches!(
            client.wait(
                &[WaitRequest { object_id: id, query: crate::wait::WaitQuery::Anywhere }],
                1,
                0,
            ),
            Err(PlasmaError::NoManagerError)
        ));
    }

    #[test]
    fn subscribe_delivers_seal_and_delete_notifications() {
        let client = test_client(1 << 20);
        let mut channel = client.subscribe().unwrap();

        let id = ObjectId::rand();
        let buffer = client.create(id, 8, &[], 0).unwrap();
        buffer.seal().unwrap();

        let sealed = channel.recv_notification().unwrap();
        assert_eq!(sealed.object_id, id);
        assert_eq!(sealed.data_size, 8);
        assert!(!sealed.is_deletion());

        client.delete(&id).unwrap();
        let deleted = channel.recv_notification().unwrap();
        assert_eq!(deleted.object_id, id);
        assert!(deleted.is_deletion());
    }

    use proptest::prelude::*;

    proptest! {
        /// Random Create/Seal/Release/Abort sequences never leave the
        /// in-use table and mmap table out of sync (I1/I2), and every
        /// object ends up either present or cleanly absent.
        #[test]
        fn random_lifecycle_sequences_keep_tables_consistent(
            ops in proptest::collection::vec(0u8..4, 1..40),
        ) {
            let client = test_client(1 << 20);
            let mut live: Vec<ObjectId> = Vec::new();

            for op in ops {
                match op {
                    0 => {
                        let id = ObjectId::rand();
                        if client.create(id, 8, &[], 0).is_ok() {
                            live.push(id);
                        }
                    }
                    1 if !live.is_empty() => {
                        let id = live[0];
                        let _ = client.contains(&id);
                    }
                    2 if !live.is_empty() => {
                        let id = live.remove(0);
                        let mut results = client.get(&[id], 0).unwrap();
                        if let Some(buf) = results.pop().flatten() {
                            buf.release().unwrap();
                        }
                    }
                    _ => {
                        let _ = client.evict(1);
                    }
                }

                let state = client.state.borrow();
                for id in &live {
                    if let Some(entry) = state.in_use.lookup(id) {
                        prop_assert!(state.mmap_table.base_ptr(entry.object.store_fd_id).is_some());
                    }
                }
            }
        }
    }
}
