// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

use crate::object_id::ObjectId;
use crate::protocol::MessageType;
use std::io;
use thiserror::Error;

/// Transport-level failures: framing, short reads, descriptor passing. Fatal
/// to the connection that produced them.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("short read on store socket: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("malformed message header")]
    MalformedHeader,

    #[error("message length {0} exceeds configured cap of {1} bytes")]
    LengthExceedsCap(u64, u64),

    #[error("expected reply of type {expected:?}, got {actual:?}")]
    TypeMismatch {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("ancillary file-descriptor passing is unavailable on this platform")]
    FdPassingUnavailable,

    #[error("store did not pass a file descriptor with a mapping-carrying reply")]
    MissingDescriptor,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Top-level error type returned by every `PlasmaClient` operation.
#[derive(Error, Debug)]
pub enum PlasmaError {
    /// Socket open/connect/handshake failure. Retryable up to `num_retries`.
    #[error("failed to connect to the Plasma store: {0}")]
    ConnectionError(String),

    /// Framing, short-read, or descriptor-passing failure. Fatal: the client
    /// is unusable after this error is observed.
    #[error("transport error: {0}")]
    TransportError(#[from] TransportError),

    /// Reply type mismatch or an impossible field value. Fatal.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Operation illegal for the object's current lifecycle state.
    #[error("illegal operation on object {object_id}: {reason}")]
    StateError {
        object_id: ObjectId,
        reason: &'static str,
    },

    /// The store reports out-of-memory, or the object would not fit.
    #[error("store out of memory for object {0} ({1} bytes requested)")]
    OutOfMemory(ObjectId, usize),

    /// The store is transiently full; caller may `Evict` and retry.
    #[error("store transiently full, evict and retry")]
    TransientStoreFull,

    /// The object already exists in the store.
    #[error("object {0} already exists")]
    AlreadyExists(ObjectId),

    /// The object is not present in the store (surfaced only where the API
    /// promises it, e.g. `Contains`).
    #[error("object {0} not found")]
    NotFound(ObjectId),

    /// `Get`/`Wait` deadline reached without satisfaction. Any partial
    /// results already produced remain valid.
    #[error("timed out waiting on {0} object(s)")]
    Timeout(usize),

    /// `Fetch`/`Transfer`/`Info`/`Wait(ANYWHERE)` issued without a manager
    /// connection.
    #[error("no manager connection is configured")]
    NoManagerError,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PlasmaError {
    /// Transport and protocol errors render the owning client permanently
    /// unusable; every other kind is scoped to the single failed call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlasmaError::TransportError(_) | PlasmaError::ProtocolError(_) | PlasmaError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PlasmaError>;
